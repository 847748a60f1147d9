use std::time::Duration;

use taskqueue::store::{Collection, LibSqlConnector};
use taskqueue::worker::{BackgroundTask, Queue, ScheduledTask, Task};
use taskqueue::QueueConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = QueueConfig::from_env()?;
    let db_path = config.db_path.clone();

    eprintln!("Task Queue v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Pool size: {}", config.pool_size);
    eprintln!("   Fault policy: {}", config.fault_policy);
    eprintln!("   Database: {}\n", db_path.display());

    let queue = Queue::open(config).await?;
    queue.start()?;

    for n in 1..=6 {
        let id = queue
            .enqueue(BackgroundTask::new(
                format!("report-{n}"),
                Task::new(move || std::thread::sleep(Duration::from_millis(50 * n))),
            ))
            .await?;
        tracing::info!(task_id = %id, "Enqueued report-{n}");
    }

    let handle = queue
        .schedule(
            ScheduledTask::new(
                "cache-sweep",
                Task::from_future(async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }),
            ),
            "500ms",
        )
        .await?;
    tracing::info!(task_id = %handle.task_id(), fire_at = %handle.fire_at(), "Scheduled cache-sweep");
    handle.fired().await?;

    queue.stop().await?;

    let store = LibSqlConnector::new_local(&db_path).await?.connect_store().await?;
    let succeeded = store.succeeded().await?;
    println!("{}", serde_json::to_string_pretty(&succeeded)?);
    eprintln!(
        "\n   pending: {} enqueued, {} scheduled",
        store.count(Collection::Enqueued).await?,
        store.count(Collection::Scheduled).await?
    );

    Ok(())
}
