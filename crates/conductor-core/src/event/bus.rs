//! Lifecycle event bus.
//!
//! The executor and the domain coordinator publish `OrchestratorEvent`s here.
//! Observers either take a raw broadcast receiver, which sees every event, or
//! a `WorkflowEvents` stream narrowed to one workflow id.

use conductor_types::config::OrchestratorConfig;
use conductor_types::event::OrchestratorEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// Default channel capacity, matching `OrchestratorConfig::event_bus_capacity`.
pub const DEFAULT_EVENT_BUS_CAPACITY: usize = 1024;

/// Broadcast channel shared by every producer of one orchestrator.
///
/// Clones share the channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.event_bus_capacity)
    }

    /// Receiver for every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    /// Stream of the events of one workflow run, published from now on.
    pub fn subscribe_workflow(&self, workflow_id: impl Into<String>) -> WorkflowEvents {
        WorkflowEvents {
            workflow_id: workflow_id.into(),
            receiver: self.sender.subscribe(),
            missed: 0,
        }
    }

    /// Publish to current subscribers. Returns how many received it; with
    /// none, the event is dropped.
    pub fn publish(&self, event: OrchestratorEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                tracing::trace!(workflow_id = event.workflow_id(), "event dropped, no subscribers");
                0
            }
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUS_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// WorkflowEvents
// ---------------------------------------------------------------------------

/// Events of a single workflow id.
///
/// Coordination events carry no workflow id and are skipped. A subscriber
/// that falls behind the channel capacity loses the oldest events; the loss
/// is logged and counted in `missed`, and receiving continues.
#[derive(Debug)]
pub struct WorkflowEvents {
    workflow_id: String,
    receiver: broadcast::Receiver<OrchestratorEvent>,
    missed: u64,
}

impl WorkflowEvents {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Events lost to lag so far, across all workflows on the bus.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Next event of this workflow. `None` once every bus handle is dropped.
    pub async fn recv(&mut self) -> Option<OrchestratorEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event of this workflow, without waiting.
    pub fn try_recv(&mut self) -> Option<OrchestratorEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(TryRecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Receive until the run completes, fails or is cancelled (inclusive),
    /// or the bus closes.
    pub async fn until_finished(&mut self) -> Vec<OrchestratorEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            let done = event.ends_workflow();
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    fn matches(&self, event: &OrchestratorEvent) -> bool {
        event.workflow_id() == Some(self.workflow_id.as_str())
    }

    fn lagged(&mut self, skipped: u64) {
        self.missed += skipped;
        tracing::warn!(
            workflow_id = self.workflow_id.as_str(),
            skipped,
            "workflow event subscriber lagged"
        );
    }
}
