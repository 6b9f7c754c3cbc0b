use anyhow::Context;

use cronq_infra::QueueConfig;
use cronq_worker::{parse_invocation, queue_summary};

/// Handlers are registered by applications embedding `cronq-worker`; on its
/// own the binary reports the queue without claiming anything.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cronq_observability::init();

    let config = QueueConfig::from_env().context("failed to load queue configuration")?;
    let invocation = parse_invocation(|key| std::env::var(key).ok())
        .context("invalid worker invocation")?;

    tracing::info!(
        mode = ?invocation.mode,
        database_url = %config.database_url,
        "no task handlers are built into cronq-worker; reporting the queue instead"
    );

    let summary = queue_summary(&config, invocation.options.classname.as_deref()).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
