//! Per-job broadcast with bounded replay.
//!
//! [`EventChannel`] keeps the most recent events in a ring buffer and fans
//! every publication out to the live subscribers. Each subscriber owns a
//! bounded queue; when it is full the event is dropped for that subscriber
//! only, so publishing never waits on a reader.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use futures::Stream;
use tokio::sync::mpsc;

use super::ProgressEvent;

/// Replay capacity used when none is configured.
pub const DEFAULT_REPLAY: usize = 256;

#[derive(Debug)]
pub struct EventChannel {
    capacity: usize,
    state: Mutex<ChannelState>,
}

#[derive(Debug, Default)]
struct ChannelState {
    backlog: VecDeque<ProgressEvent>,
    subscribers: Vec<mpsc::Sender<ProgressEvent>>,
}

impl EventChannel {
    /// `capacity` bounds both the replay buffer and each subscriber's live queue.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(ChannelState {
                backlog: VecDeque::with_capacity(capacity),
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn publish(&self, event: ProgressEvent) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if state.backlog.len() == self.capacity {
            state.backlog.pop_front();
        }
        state.backlog.push_back(event.clone());

        state.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(kind = %event.kind, "subscriber queue full, dropping live event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Attach a subscriber. It first sees the buffered backlog, oldest
    /// first, then every later publication.
    pub fn subscribe(&self) -> EventSubscription {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (tx, rx) = mpsc::channel(self.capacity);
        state.subscribers.push(tx);
        EventSubscription {
            backlog: state.backlog.clone(),
            live: rx,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY)
    }
}

/// A live, replayed view of one job's events.
///
/// The stream never ends on its own while the job exists; callers stop
/// after a terminal event or drop the subscription.
#[derive(Debug)]
pub struct EventSubscription {
    backlog: VecDeque<ProgressEvent>,
    live: mpsc::Receiver<ProgressEvent>,
}

impl EventSubscription {
    /// Next event, waiting for a live one once the backlog is drained.
    /// Returns `None` only when the channel itself is gone.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        self.live.recv().await
    }

    /// Next event if one is already available.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.backlog
            .pop_front()
            .or_else(|| self.live.try_recv().ok())
    }

    /// Everything available right now, without waiting.
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}
