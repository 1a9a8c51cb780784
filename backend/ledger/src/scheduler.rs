//! Long-running background task that closes the previous cycle once it has
//! ended. Closing is idempotent, so running this alongside an operator or a
//! second instance is harmless.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::cycle::CycleKey;
use crate::distribution::{self, CloseStatus};
use crate::errors::{LedgerError, Result};

pub struct SchedulerState {
    pub pool: SqlitePool,
    pub config: Config,
}

/// Run until `shutdown` is cancelled.
pub async fn run(state: Arc<SchedulerState>, shutdown: CancellationToken) {
    info!(
        "Cycle scheduler starting — interval {}s",
        state.config.scheduler_interval_secs
    );

    loop {
        match tick(&state.pool, Utc::now().timestamp()).await {
            Ok(Some(status)) => info!("Scheduler close result: {status:?}"),
            Ok(None) => {}
            Err(LedgerError::Distribution(e)) => {
                warn!("Cycle not closed, will retry next tick: {e}");
            }
            Err(e) => error!("Scheduler tick error: {e}"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Cycle scheduler stopping");
                return;
            }
            _ = tokio::time::sleep(Duration::from_secs(state.config.scheduler_interval_secs)) => {}
        }
    }
}

/// Close the cycle before the one containing `now`, unless already closed.
/// Returns `None` when there was nothing to do.
pub async fn tick(pool: &SqlitePool, now: i64) -> Result<Option<CloseStatus>> {
    let previous = CycleKey::containing(now).previous();
    if distribution::is_closed(pool, &previous).await? {
        return Ok(None);
    }
    let outcome = distribution::close_cycle(pool, &previous, None, now).await?;
    Ok(Some(outcome.status))
}
