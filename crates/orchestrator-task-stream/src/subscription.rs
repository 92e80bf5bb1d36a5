//! Reconnecting task-wide feed.
//!
//! `SubscriptionManager` owns at most one feed task. The task walks the
//! `ConnectionState` machine, forwards wire events in transport arrival order
//! and reopens the feed after every non-cancelled end. Events that the server
//! sends while the feed is down are not replayed; the store's periodic
//! refetch covers that window.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt as _;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument as _, debug, info, warn};

use crate::config::ReconnectPolicy;
use crate::model::TaskId;
use crate::scope::{AbortHandle, ScopeToken, scope};
use crate::source::MessageSource;
use crate::wire::WireEvent;

/// Connection lifecycle of the task feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    /// Opening the feed failed; waiting for the retry delay.
    ErrorBackoff,
    /// Terminal. No further reconnects.
    Cancelled,
}

/// Inputs driving `ConnectionState::next`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionInput {
    Start,
    Opened,
    OpenFailed,
    /// Transport closed cleanly.
    Closed,
    /// Transport failed mid-stream.
    TransportFailed,
    /// Reconnect delay elapsed.
    RetryElapsed,
    Cancel,
}

impl ConnectionState {
    /// Pure transition function. Inputs that do not apply to the current
    /// state leave it unchanged.
    pub fn next(self, input: ConnectionInput) -> ConnectionState {
        use ConnectionInput as I;
        use ConnectionState as S;
        match (self, input) {
            (S::Cancelled, _) | (_, I::Cancel) => S::Cancelled,
            (S::Disconnected, I::Start) => S::Connecting,
            (S::Connecting, I::Opened) => S::Streaming,
            (S::Connecting, I::OpenFailed) => S::ErrorBackoff,
            (S::Streaming, I::Closed | I::TransportFailed) => S::Disconnected,
            (S::Disconnected | S::ErrorBackoff, I::RetryElapsed) => S::Connecting,
            (state, _) => state,
        }
    }
}

/// Item delivered to the feed consumer.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedEvent {
    /// Wire event in transport arrival order. Every (re)open is announced
    /// with `WireEvent::Connected`.
    Wire(WireEvent),
    /// A reconnect was scheduled.
    Reconnecting { attempt: u64, delay: Duration },
}

/// Owns the reconnect loop for one task feed at a time.
pub struct SubscriptionManager {
    source: Arc<dyn MessageSource>,
    policy: ReconnectPolicy,
    capacity: usize,
    attempts: Arc<AtomicU64>,
    state_tx: watch::Sender<ConnectionState>,
    active: Option<ActiveFeed>,
}

struct ActiveFeed {
    task_id: TaskId,
    abort: AbortHandle,
    join: JoinHandle<()>,
}

impl SubscriptionManager {
    pub fn new(source: Arc<dyn MessageSource>, policy: ReconnectPolicy, capacity: usize) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            source,
            policy,
            capacity: capacity.max(1),
            attempts: Arc::new(AtomicU64::new(0)),
            state_tx,
            active: None,
        }
    }

    /// Opens the feed for `task_id`, fully stopping any previous feed first.
    pub async fn start(&mut self, task_id: TaskId) -> mpsc::Receiver<FeedEvent> {
        self.stop().await;

        let (tx, rx) = mpsc::channel(self.capacity);
        let (abort, token) = scope();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        let join = tokio::spawn(feed_task(FeedTask {
            source: self.source.clone(),
            task_id: task_id.clone(),
            policy: self.policy.clone(),
            tx,
            state_tx: self.state_tx.clone(),
            attempts: self.attempts.clone(),
            token,
        })
        .in_current_span());
        self.active = Some(ActiveFeed {
            task_id,
            abort,
            join,
        });
        rx
    }

    /// Cancels the active feed and waits until its transport is dropped.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.abort.abort();
        active.join.abort();
        let _ = active.join.await;
        self.state_tx.send_replace(ConnectionState::Cancelled);
        debug!(task_id = %active.task_id, "task feed stopped");
    }

    /// Task of the active feed, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        self.active.as_ref().map(|active| &active.task_id)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Reconnect attempts scheduled over the lifetime of this manager.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.abort.abort();
            active.join.abort();
        }
    }
}

struct FeedTask {
    source: Arc<dyn MessageSource>,
    task_id: TaskId,
    policy: ReconnectPolicy,
    tx: mpsc::Sender<FeedEvent>,
    state_tx: watch::Sender<ConnectionState>,
    attempts: Arc<AtomicU64>,
    token: ScopeToken,
}

impl FeedTask {
    fn transition(&self, state: &mut ConnectionState, input: ConnectionInput) {
        let next = state.next(input);
        if next != *state {
            debug!(task_id = %self.task_id, from = ?state, to = ?next, ?input, "feed state");
            *state = next;
            self.state_tx.send_replace(next);
        }
    }

    async fn emit(&self, event: FeedEvent) -> bool {
        !self.token.is_cancelled() && self.tx.send(event).await.is_ok()
    }
}

enum StreamEnd {
    Closed,
    Failed,
    Stopped,
}

async fn feed_task(task: FeedTask) {
    let mut state = ConnectionState::Disconnected;
    let mut consecutive_ends: u32 = 0;
    task.transition(&mut state, ConnectionInput::Start);

    loop {
        let opened = tokio::select! {
            biased;
            _ = task.token.cancelled() => break,
            opened = task.source.subscribe(&task.task_id) => opened,
        };

        match opened {
            Ok(mut stream) => {
                task.transition(&mut state, ConnectionInput::Opened);
                consecutive_ends = 0;
                info!(task_id = %task.task_id, source = task.source.name(), "task feed connected");
                if !task.emit(FeedEvent::Wire(WireEvent::Connected)).await {
                    break;
                }

                let end = loop {
                    let next = tokio::select! {
                        biased;
                        _ = task.token.cancelled() => break StreamEnd::Stopped,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(WireEvent::Connected)) => {
                            debug!(task_id = %task.task_id, "upstream connected event folded into local signal");
                        }
                        Some(Ok(event)) => {
                            if !task.emit(FeedEvent::Wire(event)).await {
                                break StreamEnd::Stopped;
                            }
                        }
                        Some(Err(err)) if err.is_malformed() => {
                            warn!(task_id = %task.task_id, error = %err, "dropping malformed feed event");
                        }
                        Some(Err(err)) => {
                            warn!(task_id = %task.task_id, error = %err, "task feed transport failed");
                            break StreamEnd::Failed;
                        }
                        None => break StreamEnd::Closed,
                    }
                };
                drop(stream);

                match end {
                    StreamEnd::Stopped => break,
                    StreamEnd::Closed => {
                        task.transition(&mut state, ConnectionInput::Closed);
                    }
                    StreamEnd::Failed => {
                        task.transition(&mut state, ConnectionInput::TransportFailed);
                    }
                }
            }
            Err(err) => {
                warn!(task_id = %task.task_id, error = %err, "opening task feed failed");
                task.transition(&mut state, ConnectionInput::OpenFailed);
            }
        }

        let attempt = task.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = task.policy.delay_for(consecutive_ends);
        consecutive_ends = consecutive_ends.saturating_add(1);
        warn!(task_id = %task.task_id, attempt, delay_ms = delay.as_millis() as u64, "scheduling task feed reconnect");
        if !task.emit(FeedEvent::Reconnecting { attempt, delay }).await {
            break;
        }

        tokio::select! {
            biased;
            _ = task.token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        task.transition(&mut state, ConnectionInput::RetryElapsed);
    }

    task.transition(&mut state, ConnectionInput::Cancel);
    debug!(task_id = %task.task_id, "task feed loop exited");
}
