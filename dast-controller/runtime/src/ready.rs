//! Bounded readiness polling for dependent objects.

use std::future::Future;
use tokio::time::{self, Duration, Instant};

/// How often a dependent object is re-fetched while waiting for it.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long a single readiness wait may take.
pub const POLL_DEADLINE: Duration = Duration::from_secs(60);

/// Re-fetches an object until `ready` accepts it or `deadline` elapses.
///
/// The deadline is supplied by the caller, so a poll can always be cut
/// short deterministically. Fetch errors are tolerated: the object may not
/// exist yet. A timeout is reported as `false`, never raised; readiness
/// here is advisory and callers must not treat it as enforced.
pub async fn poll_until_ready<T, E, F, Fut, P>(
    mut fetch: F,
    ready: P,
    interval: Duration,
    deadline: Instant,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&T) -> bool,
{
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    let wait = async {
        loop {
            ticker.tick().await;
            if let Ok(obj) = fetch().await {
                if ready(&obj) {
                    return;
                }
            }
        }
    };

    time::timeout_at(deadline, wait).await.is_ok()
}
