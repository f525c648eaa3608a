//! Watch mode: re-sync the target entities every cycle until cancelled.
//!
//! Each cycle is a normal `sync_entities` run sharing the same ledger, so only
//! messages that appeared since the previous cycle are processed.

use crate::domain::DomainError;
use crate::usecases::sync_service::{RunReport, SyncService};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct WatcherService {
    sync_service: Arc<SyncService>,
    targets: Vec<i64>,
    /// Sleep duration between cycles.
    cycle_sleep: Duration,
}

impl WatcherService {
    pub fn new(sync_service: Arc<SyncService>, targets: Vec<i64>, cycle_sleep: Duration) -> Self {
        Self {
            sync_service,
            targets,
            cycle_sleep,
        }
    }

    /// Run cycles until `cancel` fires. A cycle in progress is stopped through
    /// `SyncService::stop` and awaited. Returns the number of completed cycles.
    /// Fatal errors end the loop; anything else is logged and retried next cycle.
    pub async fn run_loop(&self, cancel: CancellationToken) -> Result<u64, DomainError> {
        info!(
            targets = self.targets.len(),
            cycle_secs = self.cycle_sleep.as_secs(),
            "watcher started"
        );
        let mut cycles = 0u64;
        loop {
            if self.targets.is_empty() {
                info!("no target entities; sleeping until next cycle");
            } else {
                let sync = self.sync_service.sync_entities(&self.targets);
                tokio::pin!(sync);
                let run = tokio::select! {
                    run = &mut sync => run,
                    _ = cancel.cancelled() => {
                        self.sync_service.stop();
                        sync.await
                    }
                };
                match run {
                    Ok(report) if report.interrupted => {
                        report.log();
                        break;
                    }
                    Ok(report) => log_cycle(cycles + 1, &report),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => warn!(error = %e, "watcher cycle failed"),
                }
            }
            cycles += 1;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.cycle_sleep) => {}
            }
        }
        info!(cycles, "watcher stopped");
        Ok(cycles)
    }
}

fn log_cycle(cycle: u64, report: &RunReport) {
    let processed = report.processed();
    if processed == 0 && report.failed_entities.is_empty() {
        info!(cycle, "cycle complete; nothing new");
    } else {
        report.log();
        info!(cycle, processed, "cycle complete");
    }
}
