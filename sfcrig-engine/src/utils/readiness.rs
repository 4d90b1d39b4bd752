//! Bounded polling against an observable readiness signal.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use sfcrig_shared::errors::{ProvisionError, ProvisionResult};
use sfcrig_shared::resource::ResourceKind;

/// Outcome of one readiness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Ready(T),
    /// Not there yet; carries the observed state for diagnostics
    Pending(String),
}

/// Backoff and deadline of a readiness poll
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f32,
    pub deadline: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
            deadline: Duration::from_secs(300),
        }
    }
}

impl PollPolicy {
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline,
            ..Self::default()
        }
    }

    /// Tight intervals, for simulated control planes
    pub fn immediate(deadline: Duration) -> Self {
        Self {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(10),
            multiplier: 2.0,
            deadline,
        }
    }
}

/// Probe until ready, backing off between probes.
///
/// Probe errors propagate immediately. Fails with `NotReady` carrying the last
/// observed state once the deadline has passed.
pub async fn poll_until<T, F, Fut>(
    policy: &PollPolicy,
    kind: ResourceKind,
    handle: &str,
    mut probe: F,
) -> ProvisionResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProvisionResult<Probe<T>>>,
{
    let started = Instant::now();
    let mut interval = policy.initial_interval;
    let mut probes = 0u32;

    loop {
        probes += 1;
        let last_state = match probe().await? {
            Probe::Ready(value) => {
                debug!("{} {} ready after {} probe(s)", kind, handle, probes);
                return Ok(value);
            }
            Probe::Pending(state) => state,
        };

        let waited = started.elapsed();
        if waited >= policy.deadline {
            return Err(ProvisionError::NotReady {
                kind,
                handle: handle.to_string(),
                waited,
                last_state,
            });
        }
        trace!("{} {} is {}, next probe in {:?}", kind, handle, last_state, interval);

        let remaining = policy.deadline.saturating_sub(waited);
        tokio::time::sleep(interval.min(remaining)).await;
        interval = interval.mul_f32(policy.multiplier.max(1.0)).min(policy.max_interval);
    }
}

/// Fixed wait for state that exposes no readiness signal
pub async fn settle(delay: Duration, reason: &str) {
    if delay.is_zero() {
        return;
    }
    debug!("Settling {:?} for {}", delay, reason);
    tokio::time::sleep(delay).await;
}
