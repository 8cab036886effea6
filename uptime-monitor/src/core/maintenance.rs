/*!
Periodic housekeeping: reaping expired tokens, finishing interrupted account
cascades and repairing check lists
*/

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::{Stream, StreamExt, wrappers::IntervalStream};
use tracing::{error, info, warn};
use uptime_store::RecordStore;

use crate::core::{
    checks::CheckManager,
    error::ServiceResult,
    models::USERS,
    sessions::SessionManager,
};

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_tokens: usize,
    pub orphaned_checks: usize,
    pub repaired_accounts: usize,
}

/// Events emitted by the maintenance loop
#[derive(Debug, Clone)]
pub enum MaintenanceEvent {
    Completed(MaintenanceReport),
    Failed(String),
}

pub struct Maintenance {
    store: Arc<dyn RecordStore>,
    sessions: Arc<SessionManager>,
    checks: Arc<CheckManager>,
    interval: Duration,
}

impl Maintenance {
    pub fn new(
        store: Arc<dyn RecordStore>,
        sessions: Arc<SessionManager>,
        checks: Arc<CheckManager>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            sessions,
            checks,
            interval,
        }
    }

    /// Run a single pass. Failures on one account are logged and skipped.
    pub async fn run_once(&self) -> ServiceResult<MaintenanceReport> {
        let mut report = MaintenanceReport {
            expired_tokens: self.sessions.reap_expired().await?,
            ..Default::default()
        };

        let accounts: BTreeSet<String> = self.store.list(USERS).await?.into_iter().collect();

        let orphan_owners: BTreeSet<String> = self
            .checks
            .scan_all()
            .await?
            .into_iter()
            .map(|check| check.user_phone)
            .filter(|phone| !accounts.contains(phone))
            .collect();
        for phone in &orphan_owners {
            match self.checks.purge_orphaned(phone).await {
                Ok(purged) => report.orphaned_checks += purged,
                Err(e) => warn!("Could not purge orphaned checks of {}: {}", phone, e),
            }
        }

        for phone in &accounts {
            match self.checks.repair_check_list(phone).await {
                Ok(true) => report.repaired_accounts += 1,
                Ok(false) => {}
                Err(e) => warn!("Could not repair check list of {}: {}", phone, e),
            }
        }

        if report != MaintenanceReport::default() {
            info!("Maintenance pass: {:?}", report);
        }
        Ok(report)
    }

    /// Run a pass on every tick of the configured interval, forever
    pub fn run(self) -> impl Stream<Item = MaintenanceEvent> {
        let mut ticks = IntervalStream::new(tokio::time::interval(self.interval));

        async_stream::stream! {
            while ticks.next().await.is_some() {
                match self.run_once().await {
                    Ok(report) => {
                        yield MaintenanceEvent::Completed(report);
                    }
                    Err(e) => {
                        error!("Maintenance pass failed: {}", e);
                        yield MaintenanceEvent::Failed(e.to_string());
                    }
                }
            }
        }
    }
}
