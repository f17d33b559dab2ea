//! Long-lived background tasks.
//!
//! The maintenance task runs a periodic (default hourly) check while the
//! daemon is up; the background identifier is a per-session task started
//! on login and stopped on logout.

use courier_types::Uid;
use std::sync::Weak;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::config::MaintenanceConfig;
use crate::service::Service;

/// Spawn the periodic maintenance task.
///
/// Returns a handle that can be used to abort the task. Holds only a weak
/// service reference so it never keeps a dying daemon alive.
pub fn spawn_maintenance_task(
    service: Weak<Service>,
    config: MaintenanceConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("maintenance task disabled");
            return;
        }

        tracing::info!(interval_secs = config.interval_secs, "maintenance task started");
        let mut timer = interval(Duration::from_secs(config.interval_secs));
        // The first tick fires immediately; skip it so startup stays quiet.
        timer.tick().await;

        loop {
            timer.tick().await;
            let Some(service) = service.upgrade() else {
                return;
            };
            service.run_maintenance().await;
        }
    })
}

/// Per-session background identification task.
///
/// Periodically revalidates the session's tracked identities; the
/// identify engine itself belongs to another subsystem, so each pass here
/// only drives the schedule and reports.
#[derive(Debug)]
pub struct BackgroundIdentifier {
    stop: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl BackgroundIdentifier {
    /// Start the identifier for `uid`.
    pub fn start(uid: Uid, period: Duration) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let task = tokio::spawn(async move {
            tracing::debug!(%uid, "background identifier started");
            let mut timer = interval(period);
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!(%uid, "background identifier stopped");
                        return;
                    }
                    _ = timer.tick() => {
                        tracing::debug!(%uid, "background identify pass");
                    }
                }
            }
        });
        Self { stop, task }
    }

    /// Stop the identifier and wait for its task to finish.
    pub async fn stop(self) {
        self.stop.cancel();
        if self.task.await.is_err() {
            tracing::warn!("background identifier task panicked");
        }
    }
}
