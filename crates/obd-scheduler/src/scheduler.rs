//! PID Poller Implementation

use obd_protocol::{DecodedReading, ObdClient, ObdError, Pid};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Slowest rate a target can be polled at
const MIN_RATE_HZ: f64 = 0.01;

/// Configuration for the PID poller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Sampling rate for the default PIDs in Hz (default: 10.0)
    pub refresh_rate_hz: f64,
    /// Mode 01 PIDs polled when no targets are given
    pub default_pids: Vec<u8>,
    /// Consecutive failures before a target is backed off
    pub max_failures: u8,
    /// How long a failing target is left alone (milliseconds)
    pub backoff_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            refresh_rate_hz: 10.0,
            default_pids: vec![0x0C, 0x0D, 0x05, 0x11],
            max_failures: 3,
            backoff_ms: 1000,
        }
    }
}

/// A polled PID with priority and timing info
#[derive(Debug, Clone)]
pub struct PollTarget {
    pub mode: u8,
    pub pid: u8,
    /// Current sampling rate in Hz
    pub rate_hz: f64,
    /// Priority (higher = first when due at the same time)
    pub priority: u8,
    /// Next scheduled query time
    pub next_due: Instant,
    /// Consecutive failure count
    pub failures: u8,
}

impl PollTarget {
    pub fn new(mode: u8, pid: u8, rate_hz: f64, priority: u8) -> Self {
        Self {
            mode,
            pid,
            rate_hz: rate_hz.max(MIN_RATE_HZ),
            priority,
            next_due: Instant::now(),
            failures: 0,
        }
    }

    /// Mode 01 target; well known PIDs get their usual priority
    pub fn current_data(pid: u8, rate_hz: f64) -> Self {
        let priority = Pid::COMMON
            .iter()
            .find(|p| p.as_hex() == pid)
            .map(Pid::sampling_priority)
            .unwrap_or(1);
        Self::new(obd_protocol::mode::CURRENT_DATA, pid, rate_hz, priority)
    }

    /// Calculate interval between queries
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }

    /// Schedule next query
    pub fn schedule_next(&mut self) {
        self.next_due = Instant::now() + self.interval();
    }
}

impl Eq for PollTarget {}

impl PartialEq for PollTarget {
    fn eq(&self, other: &Self) -> bool {
        self.next_due == other.next_due && self.priority == other.priority
    }
}

impl Ord for PollTarget {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behavior (earliest time first)
        // Then by priority (higher priority first)
        other
            .next_due
            .cmp(&self.next_due)
            .then_with(|| self.priority.cmp(&other.priority))
    }
}

impl PartialOrd for PollTarget {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Counters for one `run`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub readings: u64,
    /// Readings dropped because the receiver was behind
    pub dropped: u64,
    pub failures: u64,
}

/// Polls PIDs off the caller's path and streams the readings
pub struct PidPoller {
    queue: BinaryHeap<PollTarget>,
    config: PollerConfig,
}

impl PidPoller {
    /// Poller for `config.default_pids` at `config.refresh_rate_hz`
    pub fn new(config: PollerConfig) -> Self {
        let queue: BinaryHeap<PollTarget> = config
            .default_pids
            .iter()
            .map(|&pid| PollTarget::current_data(pid, config.refresh_rate_hz))
            .collect();

        info!("PID poller created with {} targets", queue.len());
        Self { queue, config }
    }

    /// Poller for exactly `targets`
    pub fn with_targets(config: PollerConfig, targets: impl IntoIterator<Item = PollTarget>) -> Self {
        Self {
            queue: targets.into_iter().collect(),
            config,
        }
    }

    pub fn add_target(&mut self, target: PollTarget) {
        self.queue.push(target);
    }

    /// Change how often a PID is polled
    pub fn set_rate(&mut self, mode: u8, pid: u8, rate_hz: f64) {
        let items: Vec<_> = self.queue.drain().collect();
        for mut item in items {
            if item.mode == mode && item.pid == pid {
                debug!("Setting {:02X}{:02X} rate to {} Hz", mode, pid, rate_hz);
                item.rate_hz = rate_hz.max(MIN_RATE_HZ);
            }
            self.queue.push(item);
        }
    }

    /// Get the number of polled PIDs
    pub fn target_count(&self) -> usize {
        self.queue.len()
    }

    /// Poll until `stop` turns true (or its sender goes away)
    ///
    /// Recoverable query errors are counted and the target is backed off
    /// after `max_failures` in a row; anything else ends the run.
    pub async fn run(
        &mut self,
        client: &ObdClient,
        readings: mpsc::Sender<DecodedReading>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<PollStats, ObdError> {
        info!("Starting PID poller");
        let mut stats = PollStats::default();

        loop {
            if *stop.borrow() {
                break;
            }
            let Some(mut target) = self.queue.pop() else {
                // nothing to poll; just wait for the stop signal
                let _ = stop.changed().await;
                break;
            };

            tokio::select! {
                _ = tokio::time::sleep_until(target.next_due) => {}
                changed = stop.changed() => {
                    self.queue.push(target);
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            match client.query_pid(target.mode, target.pid).await {
                Ok(reading) => {
                    target.failures = 0;
                    stats.readings += 1;
                    target.schedule_next();
                    match readings.try_send(reading) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            stats.dropped += 1;
                            debug!("Reading {:02X}{:02X} dropped, receiver behind", target.mode, target.pid);
                        }
                        Err(TrySendError::Closed(_)) => {
                            info!("Reading receiver closed");
                            self.queue.push(target);
                            break;
                        }
                    }
                }
                Err(e) if e.is_recoverable() => {
                    target.failures += 1;
                    stats.failures += 1;
                    warn!(
                        "PID {:02X}{:02X} query failed (attempt {}): {}",
                        target.mode, target.pid, target.failures, e
                    );
                    if target.failures >= self.config.max_failures {
                        warn!(
                            "Backing off {:02X}{:02X} for {}ms",
                            target.mode, target.pid, self.config.backoff_ms
                        );
                        target.failures = 0;
                        target.next_due = Instant::now() + Duration::from_millis(self.config.backoff_ms);
                    } else {
                        target.schedule_next();
                    }
                }
                Err(e) => {
                    error!("PID poller stopping: {}", e);
                    self.queue.push(target);
                    return Err(e);
                }
            }

            self.queue.push(target);
        }

        info!(
            "PID poller stopped: {} readings, {} dropped, {} failures",
            stats.readings, stats.dropped, stats.failures
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::{MockAdapter, ObdConfig, PidValue};

    async fn mock_client(adapter: MockAdapter) -> ObdClient {
        ObdClient::from_link("mock", adapter.spawn(), &ObdConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_poller_creation() {
        let poller = PidPoller::new(PollerConfig::default());
        assert_eq!(poller.target_count(), 4);
    }

    #[tokio::test]
    async fn test_poll_target_ordering() {
        let now = Instant::now();
        let mut rpm = PollTarget::current_data(0x0C, 5.0);
        let mut fuel = PollTarget::current_data(0x2F, 1.0);
        rpm.next_due = now;
        fuel.next_due = now;
        // same due time: higher priority wins
        assert!(rpm > fuel);

        fuel.next_due = now - Duration::from_millis(10);
        assert!(fuel > rpm);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_readings_until_stopped() {
        let client = mock_client(MockAdapter::new()).await;
        let mut poller = PidPoller::new(PollerConfig::default());
        let (tx, mut rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);

        let collect = async {
            let mut seen = Vec::new();
            while seen.len() < 8 {
                seen.push(rx.recv().await.unwrap());
            }
            stop_tx.send(true).unwrap();
            seen
        };
        let (result, seen) = tokio::join!(poller.run(&client, tx, stop_rx), collect);

        let stats = result.unwrap();
        assert!(stats.readings >= 8);
        let rpm = seen.iter().find(|r| r.pid == 0x0C).unwrap();
        assert_eq!(rpm.value, PidValue::Float(1726.0));
        assert!(seen.iter().any(|r| r.pid == 0x11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_pid_is_backed_off() {
        let client = mock_client(MockAdapter::new()).await;
        let config = PollerConfig {
            default_pids: vec![0x42],
            max_failures: 2,
            backoff_ms: 1000,
            ..PollerConfig::default()
        };
        let mut poller = PidPoller::new(config);
        let (tx, _rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);

        let stopper = async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            stop_tx.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(poller.run(&client, tx, stop_rx), stopper);

        let stats = result.unwrap();
        assert_eq!(stats.readings, 0);
        // without the backoff a 10 Hz target fails ~15 times in 3 s
        assert!(stats.failures >= 2 && stats.failures <= 8, "{stats:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_ends_run() {
        let client = mock_client(MockAdapter::new().hang_up_on("010D")).await;
        let mut poller = PidPoller::new(PollerConfig::default());
        let (tx, _rx) = mpsc::channel(64);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let err = poller.run(&client, tx, stop_rx).await.unwrap_err();
        assert!(matches!(err, ObdError::TransportFailure { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_channel_drops_readings() {
        let client = mock_client(MockAdapter::new()).await;
        let mut poller = PidPoller::with_targets(
            PollerConfig::default(),
            [PollTarget::current_data(0x0D, 10.0)],
        );
        let (tx, _rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        let stopper = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stop_tx.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(poller.run(&client, tx, stop_rx), stopper);

        let stats = result.unwrap();
        assert!(stats.readings > 1);
        assert_eq!(stats.dropped, stats.readings - 1);
    }
}
