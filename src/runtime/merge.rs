//! Real-time merging of a run's own stream with sub-agent activity.
//!
//! The engine owns a bounded channel and a sink slot holding its sender.
//! A pump task drives the primary stream into the channel; sub-agents write
//! into the same channel through an [`EventForwarder`] while the sink is
//! open. The [`MergedStream`] returned to the caller is the only reader.
//!
//! When the primary stream ends the pump waits for the grace window, marks
//! any sub-agent still running as completed, then closes the sink. Anything
//! forwarded before the sink opens or after it closes is dropped.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::stream::{MergedEvent, StreamPart, SubAgentEvent, SubAgentState};
use crate::config::StreamConfig;

#[derive(Debug, Clone)]
struct SubAgentEntry {
    name: String,
    state: SubAgentState,
}

// (delegated run id, sub-agent id)
type SubAgentKey = (String, String);

#[derive(Debug, Default)]
struct Sink {
    slot: Mutex<Option<mpsc::Sender<MergedEvent>>>,
    sub_agents: Mutex<HashMap<SubAgentKey, SubAgentEntry>>,
}

impl Sink {
    fn open(&self, tx: mpsc::Sender<MergedEvent>) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    fn close(&self) {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn sender(&self) -> Option<mpsc::Sender<MergedEvent>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn mark_running(&self, event: &SubAgentEvent) {
        self.sub_agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((event.run_id.clone(), event.sub_agent_id.clone()))
            .or_insert_with(|| SubAgentEntry {
                name: event.sub_agent_name.clone(),
                state: SubAgentState::Running,
            });
    }

    /// Completed is final.
    fn complete_run(&self, run_id: &str) {
        let mut agents = self
            .sub_agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for ((entry_run, _), entry) in agents.iter_mut() {
            if entry_run == run_id {
                entry.state = SubAgentState::Completed;
            }
        }
    }

    /// Flip every running sub-agent to completed; returns the flipped ones.
    fn complete_running(&self) -> Vec<(String, String)> {
        let mut agents = self
            .sub_agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut flipped = Vec::new();
        for ((_, id), entry) in agents.iter_mut() {
            if entry.state == SubAgentState::Running {
                entry.state = SubAgentState::Completed;
                flipped.push((id.clone(), entry.name.clone()));
            }
        }
        flipped.sort();
        flipped
    }

    // A name stays running while any of its runs is.
    fn states(&self) -> HashMap<String, SubAgentState> {
        let agents = self
            .sub_agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut states = HashMap::new();
        for entry in agents.values() {
            let state = states.entry(entry.name.clone()).or_insert(entry.state);
            if entry.state == SubAgentState::Running {
                *state = SubAgentState::Running;
            }
        }
        states
    }
}

/// Handle sub-agents use to inject events into a parent's merged stream.
#[derive(Debug, Clone)]
pub struct EventForwarder {
    sink: Arc<Sink>,
}

impl EventForwarder {
    /// Write `event` into the merged stream if the sink is open.
    ///
    /// Returns `false` when the event was dropped.
    pub async fn forward(&self, event: SubAgentEvent) -> bool {
        let Some(tx) = self.sink.sender() else {
            debug!(
                sub_agent = %event.sub_agent_name,
                "Merged stream not open, dropping sub-agent event"
            );
            return false;
        };

        self.sink.mark_running(&event);
        let name = event.sub_agent_name.clone();
        if tx.send(MergedEvent::from_sub_agent(event)).await.is_err() {
            debug!(sub_agent = %name, "Merged stream closed, dropping sub-agent event");
            return false;
        }
        true
    }

    /// Record that the delegated run `run_id` finished on its own, along
    /// with anything it surfaced from deeper delegates.
    pub fn mark_completed(&self, run_id: &str) {
        self.sink.complete_run(run_id);
    }

    pub fn is_open(&self) -> bool {
        self.sink.sender().is_some()
    }

    /// State of every sub-agent seen so far, keyed by name.
    pub fn sub_agent_states(&self) -> HashMap<String, SubAgentState> {
        self.sink.states()
    }
}

/// Merges one primary stream with forwarded sub-agent events.
#[derive(Debug)]
pub struct StreamMergeEngine {
    config: StreamConfig,
    sink: Arc<Sink>,
}

impl StreamMergeEngine {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            sink: Arc::new(Sink::default()),
        }
    }

    /// A forwarder bound to this engine. Drops events until `merge` runs.
    pub fn forwarder(&self) -> EventForwarder {
        EventForwarder {
            sink: Arc::clone(&self.sink),
        }
    }

    /// Open the sink and start pumping `primary`. Must be called inside a
    /// tokio runtime.
    pub fn merge<S>(self, primary: S) -> MergedStream
    where
        S: Stream<Item = StreamPart> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.config.buffer_size.max(1));
        self.sink.open(tx.clone());

        let pump = tokio::spawn(Self::pump(
            primary,
            tx,
            Arc::clone(&self.sink),
            self.config.grace_window(),
        ));

        MergedStream {
            inner: ReceiverStream::new(rx),
            sink: self.sink,
            pump: pump.abort_handle(),
        }
    }

    async fn pump<S>(
        primary: S,
        tx: mpsc::Sender<MergedEvent>,
        sink: Arc<Sink>,
        grace: Duration,
    ) where
        S: Stream<Item = StreamPart> + Send + 'static,
    {
        futures::pin_mut!(primary);
        while let Some(part) = primary.next().await {
            if tx.send(MergedEvent::primary(part)).await.is_err() {
                debug!("Merged stream consumer went away, stopping pump");
                sink.close();
                return;
            }
        }

        tokio::time::sleep(grace).await;

        for (id, name) in sink.complete_running() {
            debug!(sub_agent = %name, "Marking sub-agent completed after grace window");
            let status = MergedEvent::sub_agent_status(id, name, SubAgentState::Completed);
            if tx.send(status).await.is_err() {
                break;
            }
        }
        sink.close();
    }
}

/// The caller-facing merged stream.
///
/// Dropping it closes the sink and stops the pump, which drops the primary
/// stream.
#[derive(Debug)]
pub struct MergedStream {
    inner: ReceiverStream<MergedEvent>,
    sink: Arc<Sink>,
    pump: AbortHandle,
}

impl MergedStream {
    /// State of every sub-agent seen so far, keyed by name.
    pub fn sub_agent_states(&self) -> HashMap<String, SubAgentState> {
        self.sink.states()
    }
}

impl Stream for MergedStream {
    type Item = MergedEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for MergedStream {
    fn drop(&mut self) {
        self.sink.close();
        self.pump.abort();
    }
}
