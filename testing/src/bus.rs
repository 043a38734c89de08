//! Fake event bus publisher.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use voteflow_core::model::VoteEvent;
use voteflow_core::{BusError, VotePublisher};

/// Captures published vote events; flip [`RecordingPublisher::fail_publishes`]
/// to model a bus outage and drive the synchronous-settlement fallback.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<VoteEvent>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingPublisher {
    /// A working publisher with no captured events.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch publish failures on or off.
    pub fn fail_publishes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Everything published so far, in publication order.
    #[must_use]
    pub fn events(&self) -> Vec<VoteEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Drain the captured events, as a test's stand-in for the consumer
    /// reading the log.
    #[must_use]
    pub fn drain(&self) -> Vec<VoteEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

#[async_trait]
impl VotePublisher for RecordingPublisher {
    async fn publish(&self, event: &VoteEvent) -> Result<(), BusError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BusError::Publish {
                topic: "vote-events".to_string(),
                reason: "injected outage".to_string(),
            });
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
