//! Tokio driver for an [`Agency`].
//!
//! The agency itself is synchronous. The driver runs it until idle, then
//! parks on the messaging notifier or the earliest timeout, whichever
//! comes first.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info};

use crate::agency::Agency;

/// Longest single sleep while waiting for the next timeout.
const MAX_PARK: Duration = Duration::from_secs(3600);

fn park_duration(now: f64, due: f64) -> Duration {
    let seconds = (due - now).max(0.0) + 1e-6;
    Duration::try_from_secs_f64(seconds)
        .unwrap_or(MAX_PARK)
        .min(MAX_PARK)
}

/// Drives `agency` until `shutdown` resolves, then terminates every agent
/// and hands the agency back.
pub async fn run<F>(mut agency: Agency, shutdown: F) -> Agency
where
    F: Future<Output = ()>,
{
    let notify = agency.messaging().notifier();
    tokio::pin!(shutdown);
    info!("Agency driver started");

    loop {
        let dispatched = agency.run_pending();
        if dispatched > 0 {
            debug!(dispatched, "Agency went idle");
        }

        let park = agency
            .next_timer()
            .map(|due| park_duration(agency.now(), due));

        tokio::select! {
            _ = &mut shutdown => break,
            _ = notify.notified() => {}
            _ = async {
                match park {
                    Some(duration) => tokio::time::sleep(duration).await,
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }
    }

    agency.shutdown();
    agency.run_pending();
    info!("Agency driver stopped");
    agency
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_park_duration_clamps() {
        assert_eq!(park_duration(10.0, 5.0), Duration::from_secs_f64(1e-6));
        assert_eq!(park_duration(0.0, 1e12), MAX_PARK);
        assert!(park_duration(0.0, 2.0) > Duration::from_secs(2));
    }
}
