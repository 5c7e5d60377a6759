//! # rascald — rascal daemon
//!
//! Composition root that wires all adapters together and runs the scheduler.
//!
//! ## Responsibilities
//! - Parse configuration (env vars, config file)
//! - Initialise logging
//! - Initialise the `SQLite` connection pool and run migrations
//! - Declare the virtual devices
//! - Start the scheduler runtime, injecting adapters via port traits
//! - Trigger the routines of the routines file
//! - Handle graceful shutdown (SIGINT), saving the latency histories
//!
//! ## Dependency rule
//! This is the **only** crate that depends on all other crates.
//! It is the wiring layer — no scheduling logic belongs here.

mod config;

use std::sync::Arc;

use rascal_adapter_storage_sqlite_sqlx::{Config as DatabaseConfig, SqliteHistoryStore};
use rascal_adapter_virtual::VirtualDevices;
use rascal_app::event_bus::InProcessEventBus;
use rascal_app::notification::LogNotificationSink;
use rascal_app::runtime::{RuntimePorts, SchedulerRuntime};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, RoutineFile};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.logging.filter))
        .init();

    let routines = match &config.routines {
        Some(path) => RoutineFile::load(path)?,
        None => RoutineFile::default(),
    };

    // Storage
    let db = DatabaseConfig {
        database_url: config.database_url().to_string(),
    }
    .build()
    .await?;
    let history = SqliteHistoryStore::new(db.pool().clone());

    // Devices
    let devices = Arc::new(VirtualDevices::from_specs(&config.devices)?);
    tracing::info!(devices = devices.len(), "virtual devices declared");

    // Event bus
    let bus = Arc::new(InProcessEventBus::new(256));
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::info!(
                    kind = %event.kind,
                    entity_id = %event.entity_id,
                    action_id = %event.action_id,
                    "device progress"
                ),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Runtime
    let (stop_tx, stop_rx) = watch::channel(false);
    let ports = RuntimePorts {
        runner: Arc::clone(&devices),
        resolver: devices,
        publisher: bus,
        notifier: LogNotificationSink,
        history,
    };
    let (handle, mut task) = SchedulerRuntime::start(config.runtime_config(routines.scripts), ports, stop_rx).await?;

    for definition in routines.routines {
        let name = definition.name.clone();
        match handle.trigger(definition).await {
            Ok(admission) => tracing::info!(routine = %name, ?admission, "routine triggered"),
            Err(err) => tracing::error!(routine = %name, error = %err, "routine rejected"),
        }
    }

    let interrupted = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            true
        }
        joined = &mut task => {
            joined?;
            false
        }
    };

    if interrupted {
        tracing::info!("shutting down");
        if let Ok(report) = handle.metrics().await {
            tracing::info!(?report, "schedule metrics");
        }
        let _ = stop_tx.send(true);
        task.await?;
    } else {
        tracing::warn!("scheduler runtime exited");
    }

    Ok(())
}
