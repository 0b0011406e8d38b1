use std::future::Future;
use std::time::{Duration, Instant};

/// Call `probe` every `interval` until it reports ready or `timeout` has elapsed.
///
/// The probe is expected to bound its own duration (see [`crate::backend::PROBE_TIMEOUT`]).
/// Sleeps never run past the deadline, and the probe is always tried at least once.
pub(crate) async fn wait_until_ready<F, Fut>(mut probe: F, timeout: Duration, interval: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if probe().await {
            return true;
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return false;
        }
        tokio::time::sleep(interval.min(timeout - elapsed)).await;
    }
}
