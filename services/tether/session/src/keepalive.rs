//! Application-level PING/PONG liveness tracking.
//!
//! The monitor is a plain value owned by the session actor. Dropping it or
//! calling [`HeartbeatMonitor::stop`] cancels the timer, so no interval can
//! outlive the connection that armed it.

use crate::error::Result;
use std::time::Duration;
use tether_wire::{encode, Ping};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::trace;

/// What the actor should do after a heartbeat firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatTick {
    /// Send one probe; `missed` firings have passed without an echo
    SendProbe {
        /// Current missed counter
        missed: u32,
    },
    /// Threshold reached; the monitor has stopped itself
    ThresholdReached {
        /// Missed counter at termination
        missed: u32,
    },
}

/// Periodic probe timer with a missed-echo counter
#[derive(Debug)]
pub struct HeartbeatMonitor {
    period: Duration,
    threshold: u32,
    missed: u32,
    interval: Option<Interval>,
}

impl HeartbeatMonitor {
    /// Create a stopped monitor
    pub fn new(period: Duration, threshold: u32) -> Self {
        Self {
            period,
            threshold: threshold.max(1),
            missed: 0,
            interval: None,
        }
    }

    /// Arm the timer; the first firing is one full period from now
    pub fn start(&mut self) {
        let mut interval = interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
        self.missed = 0;
    }

    /// Wait for the next firing.
    ///
    /// Never resolves while the monitor is stopped. Cancel safe.
    pub async fn tick(&mut self) -> HeartbeatTick {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }

        self.missed += 1;
        trace!(missed = self.missed, "Heartbeat fired");

        if self.missed >= self.threshold {
            self.stop();
            HeartbeatTick::ThresholdReached {
                missed: self.missed,
            }
        } else {
            HeartbeatTick::SendProbe {
                missed: self.missed,
            }
        }
    }

    /// Any liveness echo resets the counter
    pub fn on_echo(&mut self) {
        self.missed = 0;
    }

    /// Cancel the timer; safe to call any number of times
    pub fn stop(&mut self) {
        self.interval = None;
    }

    /// Whether the timer is armed
    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Firings since the last echo
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// A probe went a full period without an echo
    pub fn is_degraded(&self) -> bool {
        self.missed > 1
    }
}

/// Encode a fresh PING probe
pub fn build_probe() -> Result<String> {
    Ok(encode(&Ping::new())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_secs(26);

    #[tokio::test(start_paused = true)]
    async fn test_threshold_after_three_silent_firings() {
        let mut monitor = HeartbeatMonitor::new(PERIOD, 3);
        monitor.start();

        let started = Instant::now();
        assert_eq!(monitor.tick().await, HeartbeatTick::SendProbe { missed: 1 });
        assert_eq!(started.elapsed(), PERIOD);
        assert!(!monitor.is_degraded());

        assert_eq!(monitor.tick().await, HeartbeatTick::SendProbe { missed: 2 });
        assert!(monitor.is_degraded());

        assert_eq!(
            monitor.tick().await,
            HeartbeatTick::ThresholdReached { missed: 3 }
        );
        assert!(!monitor.is_running());
        assert_eq!(started.elapsed(), PERIOD * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_resets_counter() {
        let mut monitor = HeartbeatMonitor::new(PERIOD, 3);
        monitor.start();

        monitor.tick().await;
        monitor.tick().await;
        assert_eq!(monitor.missed(), 2);

        monitor.on_echo();
        assert_eq!(monitor.missed(), 0);
        assert!(!monitor.is_degraded());

        // Two more silent firings stay below the threshold
        assert_eq!(monitor.tick().await, HeartbeatTick::SendProbe { missed: 1 });
        assert_eq!(monitor.tick().await, HeartbeatTick::SendProbe { missed: 2 });
        assert!(monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let mut monitor = HeartbeatMonitor::new(PERIOD, 3);
        monitor.start();
        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());

        // A stopped monitor never fires
        let fired = tokio::time::timeout(PERIOD * 10, monitor.tick()).await;
        assert!(fired.is_err());
    }

    #[test]
    fn test_build_probe() {
        let probe = build_probe().unwrap();
        let value: serde_json::Value = serde_json::from_str(&probe).unwrap();
        assert_eq!(value["action"], "PING");
    }
}
