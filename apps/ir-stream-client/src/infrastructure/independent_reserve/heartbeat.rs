//! Keep-alive Monitor
//!
//! Pings the exchange on a fixed interval and watches for silence. Any
//! inbound frame counts as activity; when nothing has arrived for longer
//! than the silence timeout the connection is treated as dead.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Keep-alive timing.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Inbound silence tolerated before reconnecting.
    pub silence_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            silence_timeout: Duration::from_secs(60),
        }
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping frame.
    SendPing,
    /// Silence exceeded the timeout; reconnect.
    Timeout,
}

/// Last-activity clock shared between the reader and the manager.
#[derive(Debug)]
pub struct HeartbeatState {
    last_activity: RwLock<Instant>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create state with activity recorded now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
        }
    }

    /// Record inbound activity.
    pub fn record_activity(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last_activity.read().elapsed()
    }
}

/// Per-session keep-alive task.
#[derive(Debug)]
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
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

    /// Run until cancelled, the event receiver is dropped, or silence times out.
    pub async fn run(self) {
        let mut interval = tokio::time::interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("heartbeat manager cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let silence = self.state.silence();
                    let event = if silence > self.config.silence_timeout {
                        tracing::warn!(
                            silence_secs = silence.as_secs(),
                            timeout_secs = self.config.silence_timeout.as_secs(),
                            "feed silent past timeout"
                        );
                        HeartbeatEvent::Timeout
                    } else {
                        HeartbeatEvent::SendPing
                    };

                    if self.event_tx.send(event).await.is_err() || event == HeartbeatEvent::Timeout {
                        break;
                    }
                }
            }
        }
    }
}
