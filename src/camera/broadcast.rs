use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;

use super::Frame;

struct Subscriber {
    name: &'static str,
    tx: SyncSender<Arc<Frame>>,
    dropped: u64,
}

/// Fans decoded frames out to every subscribed analysis.
///
/// Each subscriber has its own bounded queue. A subscriber that falls behind
/// loses frames instead of stalling acquisition or its siblings. Dropping the
/// broadcast ends every subscriber's stream.
pub struct FrameBroadcast {
    subscribers: Vec<Subscriber>,
    capacity: usize,
}

impl FrameBroadcast {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&mut self, name: &'static str) -> Receiver<Arc<Frame>> {
        let (tx, rx) = mpsc::sync_channel(self.capacity);
        self.subscribers.push(Subscriber {
            name,
            tx,
            dropped: 0,
        });
        rx
    }

    /// Publishes a frame. Returns `false` once no subscriber is listening.
    pub fn publish(&mut self, frame: Frame) -> bool {
        let frame = Arc::new(frame);
        self.subscribers
            .retain_mut(|sub| match sub.tx.try_send(Arc::clone(&frame)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    sub.dropped += 1;
                    tracing::trace!(analysis = %sub.name, dropped = sub.dropped, "analysis behind, frame dropped");
                    true
                }
                Err(TrySendError::Disconnected(_)) => {
                    tracing::debug!(analysis = %sub.name, "analysis unsubscribed");
                    false
                }
            });
        !self.subscribers.is_empty()
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
