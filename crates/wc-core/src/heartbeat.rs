//! Periodic pulse driving expiration checks

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartBeatEvent {
    Pulse,
}

pub struct HeartBeat {
    interval: Duration,
    events: broadcast::Sender<HeartBeatEvent>,
    cancel: CancellationToken,
}

impl HeartBeat {
    pub fn new(interval: Duration) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            interval,
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HeartBeatEvent> {
        self.events.subscribe()
    }

    /// Spawn the ticking task. The first pulse fires one interval after start.
    pub fn start(&self) -> JoinHandle<()> {
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let period = self.interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = events.send(HeartBeatEvent::Pulse);
                    }
                    _ = cancel.cancelled() => {
                        debug!("heartbeat stopped");
                        break;
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Default for HeartBeat {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL)
    }
}
