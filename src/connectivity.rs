//! Reachability tracking.
//!
//! The monitor is the only place that decides whether the engine is online. Individual request
//! failures are not observations: they are reported by the probe loop or by the host, never
//! inferred from one failed call.

use crate::facade::DataAccess;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityEvent {
    BecameOnline,
    BecameOffline,
}

/// Debounced online/offline state.
///
/// A change is declared only after the new state has been observed continuously for the stable
/// window. Observing the current state again cancels a pending change, so a brief drop never
/// produces an offline/online pair.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    online: bool,
    stable_window: Duration,
    candidate: Option<(bool, Instant)>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool, stable_window: Duration) -> Self {
        Self {
            online,
            stable_window,
            candidate: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn stable_window(&self) -> Duration {
        self.stable_window
    }

    /// Whether a state change is being observed but not yet declared.
    pub fn is_settling(&self) -> bool {
        self.candidate.is_some()
    }

    /// Feeds one reachability observation taken at `at`. Returns an event only when the state
    /// actually changes.
    pub fn observe(&mut self, reachable: bool, at: Instant) -> Option<ConnectivityEvent> {
        if reachable == self.online {
            if self.candidate.take().is_some() {
                debug!("Connectivity flap ignored, still {}", self.describe());
            }
            return None;
        }
        let since = match self.candidate {
            Some((state, since)) if state == reachable => since,
            _ => {
                self.candidate = Some((reachable, at));
                at
            }
        };
        if at.saturating_duration_since(since) < self.stable_window {
            return None;
        }
        self.candidate = None;
        self.online = reachable;
        info!("Connectivity changed, now {}", self.describe());
        Some(if reachable {
            ConnectivityEvent::BecameOnline
        } else {
            ConnectivityEvent::BecameOffline
        })
    }

    fn describe(&self) -> &'static str {
        if self.online {
            "online"
        } else {
            "offline"
        }
    }
}

/// Pings the remote API every `interval` and feeds the result to `access` until `shutdown`
/// completes. Reconnects trigger a drain inside `DataAccess::probe`.
pub async fn watch<F>(access: DataAccess, interval: Duration, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("Connectivity watch stopped");
                return Ok(());
            }
            _ = ticker.tick() => {
                let (event, report) = access.probe().await?;
                if let Some(event) = event {
                    info!("{event:?}");
                }
                if let Some(report) = report {
                    if report.failed > 0 {
                        warn!("{} operation(s) could not be synced", report.failed);
                    }
                    info!("{report}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(2);

    fn secs(t0: Instant, s: u64) -> Instant {
        t0 + Duration::from_secs(s)
    }

    #[test]
    fn test_transition_needs_a_stable_window() {
        let t0 = Instant::now();
        let mut m = ConnectivityMonitor::new(true, WINDOW);
        assert_eq!(m.observe(false, t0), None);
        assert!(m.is_online());
        assert!(m.is_settling());
        assert_eq!(m.observe(false, secs(t0, 1)), None);
        assert_eq!(
            m.observe(false, secs(t0, 2)),
            Some(ConnectivityEvent::BecameOffline)
        );
        assert!(!m.is_online());
    }

    #[test]
    fn test_repeated_state_emits_nothing() {
        let t0 = Instant::now();
        let mut m = ConnectivityMonitor::new(true, WINDOW);
        for s in 0..5 {
            assert_eq!(m.observe(true, secs(t0, s)), None);
        }
        assert!(!m.is_settling());
    }

    #[test]
    fn test_flap_cancels_candidate() {
        let t0 = Instant::now();
        let mut m = ConnectivityMonitor::new(true, WINDOW);
        assert_eq!(m.observe(false, t0), None);
        assert_eq!(m.observe(true, secs(t0, 1)), None);
        // The window restarts from the next offline observation.
        assert_eq!(m.observe(false, secs(t0, 2)), None);
        assert_eq!(m.observe(false, secs(t0, 3)), None);
        assert_eq!(
            m.observe(false, secs(t0, 4)),
            Some(ConnectivityEvent::BecameOffline)
        );
        assert_eq!(m.observe(false, secs(t0, 10)), None);
    }

    #[test]
    fn test_zero_window_switches_immediately() {
        let t0 = Instant::now();
        let mut m = ConnectivityMonitor::new(false, Duration::ZERO);
        assert_eq!(m.observe(true, t0), Some(ConnectivityEvent::BecameOnline));
        assert_eq!(m.observe(true, t0), None);
    }
}
