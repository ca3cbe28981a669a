//! Basic end-to-end demo: register a worker, dispatch a handful of
//! jobs, watch them complete, stop gracefully.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::info;

use conveyor_queue::worker::handler;
use conveyor_queue::{Config, DriverRegistry, Manager};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::default();
    let registry = DriverRegistry::with_defaults();
    let driver = registry.make(&config).await?;
    let manager = Arc::new(Manager::with_driver(config, driver));

    manager.worker(
        "send-email",
        5,
        handler(|job| async move {
            let to = job.payload["to"].as_str().unwrap_or("unknown");
            let subject = job.payload["subject"].as_str().unwrap_or("");
            info!(to, subject, "sending email");
            tokio::time::sleep(Duration::from_millis(100)).await;
            info!(to, "email sent");
            Ok(())
        }),
    );

    manager.start()?;
    info!("queue started, dispatching jobs");

    for n in 1..=5 {
        let job = manager
            .dispatch(
                "send-email",
                json!({
                    "to": format!("user{n}@example.com"),
                    "subject": format!("Welcome #{n}"),
                    "body": "Welcome to our service!",
                }),
            )
            .await?;
        info!(job_id = %job.id, "job dispatched");
    }

    tokio::time::sleep(Duration::from_secs(2)).await;

    println!("{}", manager.metrics_snapshot().to_prometheus());

    manager.stop().await?;
    info!("queue stopped gracefully");
    Ok(())
}
