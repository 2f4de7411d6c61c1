//! Heartbeat Monitor
//!
//! A task scoped to one session: asks the event loop to send a heartbeat at
//! a fixed interval and reports a timeout when no acknowledgment arrives in
//! time. The event loop records acknowledgments on the shared state.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Heartbeat timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats.
    pub interval: Duration,
    /// How long to wait for an acknowledgment.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Requests from the monitor to the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Write a heartbeat.
    SendPing,
    /// No acknowledgment within the timeout.
    Timeout,
}

#[derive(Debug)]
struct Inner {
    last_ack: Instant,
    ping_sent_at: Option<Instant>,
}

/// Acknowledgment bookkeeping shared between the monitor and the event loop.
#[derive(Debug)]
pub struct HeartbeatState {
    inner: Mutex<Inner>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Fresh state: nothing outstanding.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                last_ack: Instant::now(),
                ping_sent_at: None,
            }),
        }
    }

    /// An acknowledgment arrived.
    pub fn record_ack(&self) {
        let mut inner = self.inner.lock();
        inner.last_ack = Instant::now();
        inner.ping_sent_at = None;
    }

    /// A heartbeat is about to be written.
    pub fn mark_ping_sent(&self) {
        self.inner.lock().ping_sent_at = Some(Instant::now());
    }

    /// Whether a heartbeat is awaiting acknowledgment.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.inner.lock().ping_sent_at.is_some()
    }

    /// When the outstanding heartbeat times out.
    #[must_use]
    pub fn ack_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.inner.lock().ping_sent_at.map(|sent| sent + timeout)
    }

    /// Time since the last acknowledgment.
    #[must_use]
    pub fn since_last_ack(&self) -> Duration {
        self.inner.lock().last_ack.elapsed()
    }
}

/// Per-session heartbeat task.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    /// Create a monitor.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled or a timeout is reported.
    ///
    /// The first heartbeat goes out one interval after start; a missing
    /// acknowledgment is reported exactly `timeout` after its heartbeat.
    pub async fn run(self) {
        let mut next_ping = Instant::now() + self.config.interval;

        loop {
            let deadline = self.state.ack_deadline(self.config.timeout);

            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat monitor cancelled");
                    break;
                }

                () = tokio::time::sleep_until(next_ping) => {
                    next_ping += self.config.interval;
                    if self.state.is_waiting() {
                        continue;
                    }
                    self.state.mark_ping_sent();
                    if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
                        tracing::debug!("Event loop gone, stopping heartbeat");
                        break;
                    }
                }

                () = sleep_until_opt(deadline), if deadline.is_some() => {
                    let expired = self
                        .state
                        .ack_deadline(self.config.timeout)
                        .is_some_and(|at| at <= Instant::now());
                    if expired {
                        tracing::warn!(
                            since_ack_ms = self.state.since_last_ack().as_millis(),
                            timeout_ms = self.config.timeout.as_millis(),
                            "Heartbeat timeout detected"
                        );
                        metrics::counter!("gateway_heartbeat_timeouts_total").increment(1);
                        let _ = self.event_tx.send(HeartbeatEvent::Timeout).await;
                        break;
                    }
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn(
        config: HeartbeatConfig,
    ) -> (
        Arc<HeartbeatState>,
        mpsc::Receiver<HeartbeatEvent>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let state = Arc::new(HeartbeatState::new());
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            HeartbeatMonitor::new(config, Arc::clone(&state), tx, cancel.clone()).run(),
        );
        (state, rx, cancel, handle)
    }

    const CONFIG: HeartbeatConfig = HeartbeatConfig {
        interval: Duration::from_secs(10),
        timeout: Duration::from_secs(3),
    };

    #[tokio::test(start_paused = true)]
    async fn pings_every_interval_while_acknowledged() {
        let (state, mut rx, cancel, handle) = spawn(CONFIG);
        let started = Instant::now();

        for round in 1..=3u32 {
            assert_eq!(rx.recv().await, Some(HeartbeatEvent::SendPing));
            assert_eq!(started.elapsed(), CONFIG.interval * round);
            state.record_ack();
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_times_out_after_timeout() {
        let (_state, mut rx, _cancel, handle) = spawn(CONFIG);
        let started = Instant::now();

        assert_eq!(rx.recv().await, Some(HeartbeatEvent::SendPing));
        assert_eq!(rx.recv().await, Some(HeartbeatEvent::Timeout));
        assert_eq!(started.elapsed(), CONFIG.interval + CONFIG.timeout);
        handle.await.unwrap();
    }

    #[test]
    fn ack_clears_outstanding_ping() {
        let state = HeartbeatState::new();
        assert!(!state.is_waiting());
        state.mark_ping_sent();
        assert!(state.is_waiting());
        state.record_ack();
        assert!(!state.is_waiting());
        assert_eq!(state.ack_deadline(Duration::from_secs(1)), None);
    }
}
