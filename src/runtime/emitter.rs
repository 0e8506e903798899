//! In-process event bus for timeline events.
//!
//! Publishing validates parent linkage inside the trace, writes the event to
//! the owning run's history, copies it into every ancestor run's history,
//! then broadcasts it to subscribers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::{EventPhase, TimelineEvent};
use crate::error::EventError;
use crate::history::HistoryRecorder;

const BROADCAST_CAPACITY: usize = 1024;

/// Link from a delegated run to the run that spawned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    pub parent_agent_id: String,
    pub parent_agent_name: String,
    pub parent_run_id: String,
    /// History entry of the parent. Run records share their run's id.
    pub parent_history_entry_id: String,
    /// The parent's own link, if it was delegated too.
    pub ancestor: Option<Arc<ParentLink>>,
}

impl ParentLink {
    pub fn new(
        parent_agent_id: impl Into<String>,
        parent_agent_name: impl Into<String>,
        parent_run_id: impl Into<String>,
        ancestor: Option<Arc<ParentLink>>,
    ) -> Self {
        let parent_run_id = parent_run_id.into();
        Self {
            parent_agent_id: parent_agent_id.into(),
            parent_agent_name: parent_agent_name.into(),
            parent_history_entry_id: parent_run_id.clone(),
            parent_run_id,
            ancestor,
        }
    }

    /// This link followed by every ancestor, nearest first.
    pub fn chain(&self) -> impl Iterator<Item = &ParentLink> {
        std::iter::successors(Some(self), |link| link.ancestor.as_deref())
    }
}

/// Who published an event.
#[derive(Debug, Clone, Copy)]
pub struct Publisher<'a> {
    pub agent_id: &'a str,
    pub agent_name: &'a str,
    pub parent: Option<&'a ParentLink>,
}

/// What subscribers receive.
#[derive(Debug, Clone, Serialize)]
pub struct PublishedEvent {
    pub agent_id: String,
    pub agent_name: String,
    pub event: TimelineEvent,
}

#[derive(Debug)]
pub struct EventBus {
    history: Arc<HistoryRecorder>,
    tx: broadcast::Sender<PublishedEvent>,
    // trace id -> ids of start events published in that trace
    traces: Mutex<HashMap<String, HashSet<String>>>,
}

impl EventBus {
    pub fn new(history: Arc<HistoryRecorder>) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            history,
            tx,
            traces: Mutex::new(HashMap::new()),
        }
    }

    pub fn history(&self) -> &Arc<HistoryRecorder> {
        &self.history
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.tx.subscribe()
    }

    pub async fn publish(
        &self,
        publisher: Publisher<'_>,
        event: TimelineEvent,
    ) -> Result<(), EventError> {
        self.validate(&event)?;

        self.history
            .add_event(&event.trace_id, publisher.agent_id, &event)
            .await?;
        // Only a start that reached the store may be referenced as a parent.
        if event.phase == EventPhase::Start {
            self.traces
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(event.trace_id.clone())
                .or_default()
                .insert(event.id.clone());
        }

        if let Some(parent) = publisher.parent {
            let tagged = event
                .clone()
                .with_metadata_entry("sub_agent_id", serde_json::json!(publisher.agent_id))
                .with_metadata_entry("sub_agent_name", serde_json::json!(publisher.agent_name));
            for link in parent.chain() {
                if let Err(e) = self
                    .history
                    .add_event(&link.parent_run_id, &link.parent_agent_id, &tagged)
                    .await
                {
                    warn!(
                        parent_run_id = %link.parent_run_id,
                        event = %event.name,
                        error = %e,
                        "Failed to copy event into parent history"
                    );
                }
            }
        }

        debug!(trace_id = %event.trace_id, event = %event.name, "Event published");
        // No subscribers is fine.
        let _ = self.tx.send(PublishedEvent {
            agent_id: publisher.agent_id.to_string(),
            agent_name: publisher.agent_name.to_string(),
            event,
        });
        Ok(())
    }

    /// Forget the validation set of a finished trace.
    pub fn end_trace(&self, trace_id: &str) {
        self.traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(trace_id);
    }

    fn validate(&self, event: &TimelineEvent) -> Result<(), EventError> {
        let Some(parent_id) = &event.parent_event_id else {
            return Ok(());
        };
        let traces = self.traces.lock().unwrap_or_else(PoisonError::into_inner);
        let known = traces
            .get(&event.trace_id)
            .is_some_and(|starts| starts.contains(parent_id));
        if known {
            Ok(())
        } else {
            Err(EventError::UnknownParent {
                event_id: event.id.clone(),
                parent_event_id: parent_id.clone(),
                trace_id: event.trace_id.clone(),
            })
        }
    }
}
