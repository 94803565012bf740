//! User-visible wait notifications.
//!
//! The dashboard surfaces an on-screen notice while a rate-limit wait is
//! active. The client only knows when a wait starts and ends; how it is
//! rendered belongs to the embedding application, so the hook is a trait.

use std::time::Duration;
use tracing::{debug, warn};

/// Observer for rate-limit waits. Implementations must be cheap: both hooks
/// are called on the request path.
pub trait WaitNotifier: Send + Sync {
    /// A wait of `duration` is starting before/between attempts on `endpoint`.
    fn wait_started(&self, endpoint: &str, duration: Duration);

    /// The wait for `endpoint` has elapsed and the request is resuming.
    fn wait_finished(&self, endpoint: &str);
}

/// Default notifier: structured log events, nothing else.
#[derive(Default)]
pub struct LogNotifier;

impl WaitNotifier for LogNotifier {
    fn wait_started(&self, endpoint: &str, duration: Duration) {
        let seconds = duration.as_secs_f64().ceil() as u64;
        warn!(endpoint, seconds, "rate limit reached, waiting");
    }

    fn wait_finished(&self, endpoint: &str) {
        debug!(endpoint, "rate limit wait finished");
    }
}
