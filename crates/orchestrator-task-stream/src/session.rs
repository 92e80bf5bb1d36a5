use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt as _;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{Instrument as _, debug, info, warn};

use crate::config::StreamConfig;
use crate::errors::{SourceError, StreamError};
use crate::model::{Message, MessageContent, TaskId};
use crate::observability::{call_span, task_span};
use crate::reducer::Signal;
use crate::scope::{AbortHandle, ScopeToken, scope};
use crate::source::MessageSource;
use crate::store::{Applied, MessageStore};
use crate::subscription::{ConnectionState, FeedEvent, SubscriptionManager};
use crate::wire::WireEvent;

/// Out-of-band notification for the session consumer.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskNotice {
    /// The task feed (re)connected.
    Connected,
    /// Upstream reported a protocol-level error; the stream continues.
    Protocol { message: String },
    /// An optimistic message was not confirmed and is now marked failed.
    SendFailed { local_id: uuid::Uuid, reason: String },
    /// The feed dropped and a reconnect is scheduled.
    Reconnecting { attempt: u64, delay: Duration },
}

impl TaskNotice {
    /// Error equivalent of failure notices.
    pub fn as_error(&self) -> Option<StreamError> {
        match self {
            Self::Protocol { message } => {
                Some(StreamError::Source(SourceError::upstream(message.clone(), None)))
            }
            Self::SendFailed { local_id, reason } => Some(StreamError::SendFailed {
                local_id: *local_id,
                reason: reason.clone(),
            }),
            Self::Connected | Self::Reconnecting { .. } => None,
        }
    }
}

enum Command {
    Send {
        content: MessageContent,
        reply: oneshot::Sender<uuid::Uuid>,
    },
    Refetch,
}

enum Internal {
    Snapshot {
        seq: u64,
        result: Result<Vec<Message>, SourceError>,
    },
    CallEvent {
        call_id: uuid::Uuid,
        event: WireEvent,
    },
    CallEnded {
        call_id: uuid::Uuid,
        failure: Option<String>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Channel {
    Feed,
    Call,
}

/// Optimistic entry waiting for an authoritative snapshot.
struct AwaitingConfirmation {
    /// First snapshot sequence that postdates the end of the call.
    after_seq: u64,
    reason: String,
}

/// Live view of one task's conversation.
///
/// The session owns a single actor task that holds the message store. All
/// producers (task feed, per-call streams, history fetches) send into the
/// actor; consumers observe the read model through `messages()`. Closing or
/// dropping the session cancels every outstanding operation and no late
/// result is applied afterwards.
pub struct TaskSession {
    task_id: TaskId,
    commands: mpsc::Sender<Command>,
    messages: watch::Receiver<Vec<Message>>,
    connection: watch::Receiver<ConnectionState>,
    notices: mpsc::Receiver<TaskNotice>,
    abort: AbortHandle,
    join: Option<JoinHandle<()>>,
}

impl TaskSession {
    /// Spawns the session actor: opens the task feed and fetches the
    /// baseline history. Must be called from within a tokio runtime.
    pub fn open(
        source: Arc<dyn MessageSource>,
        task_id: impl Into<TaskId>,
        config: StreamConfig,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        let task_id = task_id.into();
        if task_id.as_str().trim().is_empty() {
            return Err(StreamError::Validation("task id must not be empty".into()));
        }

        let capacity = config.channel_capacity;
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (internal_tx, internal_rx) = mpsc::channel(capacity);
        let (notice_tx, notice_rx) = mpsc::channel(capacity);
        let (messages_tx, messages_rx) = watch::channel(Vec::new());
        let (abort, token) = scope();

        let feed = SubscriptionManager::new(source.clone(), config.reconnect.clone(), capacity);
        let connection = feed.watch_state();

        let actor = SessionActor {
            source,
            task_id: task_id.clone(),
            config,
            store: MessageStore::new(task_id.clone()),
            feed,
            messages_tx,
            notices: notice_tx,
            internal_tx,
            token,
            issued_seq: 0,
            applied_seq: 0,
            refetch_due: None,
            connected_once: false,
            awaiting: HashMap::new(),
        };
        let span = task_span(&task_id);
        let join = tokio::spawn(actor.run(command_rx, internal_rx).instrument(span));
        info!(task_id = %task_id, "task session opened");

        Ok(Self {
            task_id,
            commands: command_tx,
            messages: messages_rx,
            connection,
            notices: notice_rx,
            abort,
            join: Some(join),
        })
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Watch handle on the chronological read model.
    pub fn messages(&self) -> watch::Receiver<Vec<Message>> {
        self.messages.clone()
    }

    /// Current read model.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.borrow().clone()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Next notice, or `None` once the session has shut down.
    pub async fn next_notice(&mut self) -> Option<TaskNotice> {
        self.notices.recv().await
    }

    /// Sends user content. The optimistic entry is visible in `messages()`
    /// before this returns; its local id is returned.
    pub async fn send(&self, content: MessageContent) -> Result<uuid::Uuid, StreamError> {
        validate_outgoing(&content)?;
        if self.abort.is_aborted() {
            return Err(StreamError::Cancelled);
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send { content, reply })
            .await
            .map_err(|_| StreamError::Closed)?;
        rx.await.map_err(|_| StreamError::Closed)
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<uuid::Uuid, StreamError> {
        self.send(MessageContent::text(text)).await
    }

    /// Requests a debounced authoritative refetch.
    pub async fn refetch(&self) -> Result<(), StreamError> {
        self.commands
            .send(Command::Refetch)
            .await
            .map_err(|_| StreamError::Closed)
    }

    /// Cancels the session and waits for the actor to release its feed.
    pub async fn close(mut self) {
        self.abort.abort();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
        info!(task_id = %self.task_id, "task session closed");
    }
}

impl Drop for TaskSession {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

fn validate_outgoing(content: &MessageContent) -> Result<(), StreamError> {
    match content {
        MessageContent::Text { text } if text.trim().is_empty() => Err(StreamError::Validation(
            "message text must not be empty".into(),
        )),
        MessageContent::ToolRequest { tool_call_id, .. }
        | MessageContent::ToolResponse { tool_call_id, .. }
            if tool_call_id.is_empty() =>
        {
            Err(StreamError::Validation(
                "tool messages require a tool_call_id".into(),
            ))
        }
        _ => Ok(()),
    }
}

/// Keeps at most one open session and fully closes it before opening the
/// next one.
pub struct TaskSessions {
    source: Arc<dyn MessageSource>,
    config: StreamConfig,
    current: Option<TaskSession>,
}

impl TaskSessions {
    pub fn new(source: Arc<dyn MessageSource>, config: StreamConfig) -> Self {
        Self {
            source,
            config,
            current: None,
        }
    }

    /// Makes `task_id` the active task. Reopening the active task is a no-op.
    pub async fn switch_to(
        &mut self,
        task_id: impl Into<TaskId>,
    ) -> Result<&mut TaskSession, StreamError> {
        let task_id = task_id.into();
        let same = self
            .current
            .as_ref()
            .is_some_and(|session| session.task_id() == &task_id);
        if !same {
            self.close().await;
            let session = TaskSession::open(self.source.clone(), task_id, self.config.clone())?;
            self.current = Some(session);
        }
        self.current.as_mut().ok_or(StreamError::Closed)
    }

    pub fn current(&self) -> Option<&TaskSession> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut TaskSession> {
        self.current.as_mut()
    }

    pub async fn close(&mut self) {
        if let Some(session) = self.current.take() {
            session.close().await;
        }
    }
}

struct SessionActor {
    source: Arc<dyn MessageSource>,
    task_id: TaskId,
    config: StreamConfig,
    store: MessageStore,
    feed: SubscriptionManager,
    messages_tx: watch::Sender<Vec<Message>>,
    notices: mpsc::Sender<TaskNotice>,
    internal_tx: mpsc::Sender<Internal>,
    token: ScopeToken,
    issued_seq: u64,
    applied_seq: u64,
    refetch_due: Option<Instant>,
    connected_once: bool,
    awaiting: HashMap<uuid::Uuid, AwaitingConfirmation>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::Receiver<Internal>,
    ) {
        let token = self.token.clone();
        let mut feed = self.feed.start(self.task_id.clone()).await;
        self.spawn_fetch();
        let mut periodic = self.config.refetch_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let due = self.refetch_due;
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(message) = internal.recv() => self.on_internal(message),
                Some(event) = feed.recv() => self.on_feed(event),
                _ = sleep_until_opt(due) => {
                    self.refetch_due = None;
                    self.spawn_fetch();
                }
                _ = tick_opt(&mut periodic) => {
                    debug!(task_id = %self.task_id, "periodic refetch");
                    self.spawn_fetch();
                }
            }
        }

        self.feed.stop().await;
        debug!(task_id = %self.task_id, "task session actor exited");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send { content, reply } => {
                let local_id = self.store.insert_optimistic(content.clone(), Utc::now());
                let call_id = self.store.begin_call(local_id);
                self.publish();
                debug!(task_id = %self.task_id, %local_id, %call_id, "optimistic message inserted");
                tokio::spawn(call_task(CallTask {
                    source: self.source.clone(),
                    task_id: self.task_id.clone(),
                    content,
                    call_id,
                    timeout: self.config.send_timeout,
                    tx: self.internal_tx.clone(),
                    token: self.token.clone(),
                })
                .instrument(call_span(&self.task_id, call_id)));
                let _ = reply.send(local_id);
            }
            Command::Refetch => self.schedule_refetch(),
        }
    }

    fn on_feed(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Wire(event) => {
                let applied = self.store.apply_feed(vec![event], Utc::now());
                if !applied.buffered {
                    self.absorb(applied, Channel::Feed);
                    self.publish();
                }
            }
            FeedEvent::Reconnecting { attempt, delay } => {
                self.notify(TaskNotice::Reconnecting { attempt, delay });
            }
        }
    }

    fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::Snapshot { seq, result } => self.on_snapshot(seq, result),
            Internal::CallEvent { call_id, event } => {
                let applied = self.store.apply_call(call_id, vec![event], Utc::now());
                self.absorb(applied, Channel::Call);
                self.publish();
            }
            Internal::CallEnded { call_id, failure } => {
                let Some(local_id) = self.store.finish_call(call_id) else {
                    return;
                };
                let seq = self.spawn_fetch();
                if self.store.is_pending(local_id) {
                    let reason = failure
                        .unwrap_or_else(|| "message was not confirmed by history".to_owned());
                    self.awaiting.insert(
                        local_id,
                        AwaitingConfirmation {
                            after_seq: seq,
                            reason,
                        },
                    );
                }
                self.publish();
            }
        }
    }

    fn on_snapshot(&mut self, seq: u64, result: Result<Vec<Message>, SourceError>) {
        if seq <= self.applied_seq {
            debug!(task_id = %self.task_id, seq, applied = self.applied_seq, "dropping stale history snapshot");
            return;
        }
        let history = match result {
            Ok(history) => history,
            Err(err) => {
                warn!(task_id = %self.task_id, seq, error = %err, "history fetch failed");
                if !self.store.has_baseline() {
                    self.refetch_due = Some(Instant::now() + self.config.reconnect.delay_for(0));
                }
                return;
            }
        };

        self.applied_seq = seq;
        let applied = self.store.apply_history(history, Utc::now());
        self.absorb(applied, Channel::Feed);

        let settled: Vec<uuid::Uuid> = self
            .awaiting
            .iter()
            .filter(|(local_id, waiting)| {
                !self.store.is_pending(**local_id) || seq >= waiting.after_seq
            })
            .map(|(local_id, _)| *local_id)
            .collect();
        for local_id in settled {
            let Some(waiting) = self.awaiting.remove(&local_id) else {
                continue;
            };
            if self.store.is_pending(local_id) {
                warn!(task_id = %self.task_id, %local_id, reason = %waiting.reason, "optimistic message not confirmed");
                self.store.mark_send_failed(local_id, waiting.reason.clone());
                self.notify(TaskNotice::SendFailed {
                    local_id,
                    reason: waiting.reason,
                });
            }
        }
        self.publish();
    }

    fn absorb(&mut self, applied: Applied, channel: Channel) {
        for signal in applied.signals {
            match signal {
                Signal::Connected if channel == Channel::Feed => {
                    if self.connected_once {
                        self.schedule_refetch();
                    }
                    self.connected_once = true;
                    self.notify(TaskNotice::Connected);
                }
                Signal::Connected => {}
                Signal::Error { message } => {
                    warn!(task_id = %self.task_id, %message, "upstream protocol error");
                    self.notify(TaskNotice::Protocol { message });
                }
            }
        }
        for local_id in applied.confirmed {
            self.awaiting.remove(&local_id);
        }
        if channel == Channel::Feed && applied.finalized > 0 {
            self.schedule_refetch();
        }
    }

    fn schedule_refetch(&mut self) {
        self.refetch_due = Some(Instant::now() + self.config.refetch_debounce);
    }

    /// Starts a history fetch and returns its sequence number.
    fn spawn_fetch(&mut self) -> u64 {
        self.issued_seq += 1;
        let seq = self.issued_seq;
        let source = self.source.clone();
        let task_id = self.task_id.clone();
        let tx = self.internal_tx.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                result = source.fetch_history(&task_id) => result,
            };
            if token.is_cancelled() {
                return;
            }
            let _ = tx.send(Internal::Snapshot { seq, result }).await;
        }
        .in_current_span());
        seq
    }

    fn publish(&self) {
        self.messages_tx.send_replace(self.store.messages().to_vec());
    }

    /// Queues a notice without blocking the actor. The last quarter of the
    /// queue only takes failure notices.
    fn notify(&self, notice: TaskNotice) {
        if notice.as_error().is_none() && self.notices.capacity() <= self.failure_reserve() {
            debug!(task_id = %self.task_id, ?notice, "status notice dropped, queue nearly full");
            return;
        }
        if let Err(err) = self.notices.try_send(notice) {
            warn!(task_id = %self.task_id, error = %err, "notice dropped");
        }
    }

    fn failure_reserve(&self) -> usize {
        self.config.channel_capacity / 4
    }
}

struct CallTask {
    source: Arc<dyn MessageSource>,
    task_id: TaskId,
    content: MessageContent,
    call_id: uuid::Uuid,
    timeout: Duration,
    tx: mpsc::Sender<Internal>,
    token: ScopeToken,
}

async fn call_task(call: CallTask) {
    let stream_reply = async {
        let mut stream = call.source.send_and_stream(&call.task_id, &call.content).await?;
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    let forwarded = Internal::CallEvent {
                        call_id: call.call_id,
                        event,
                    };
                    if call.tx.send(forwarded).await.is_err() {
                        break;
                    }
                }
                Err(err) if err.is_malformed() => {
                    warn!(task_id = %call.task_id, call_id = %call.call_id, error = %err, "dropping malformed reply event");
                }
                Err(err) => return Err(err),
            }
        }
        Ok::<(), SourceError>(())
    };

    let failure = tokio::select! {
        biased;
        _ = call.token.cancelled() => return,
        result = tokio::time::timeout(call.timeout, stream_reply) => match result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => {
                warn!(task_id = %call.task_id, call_id = %call.call_id, error = %err, "reply stream failed");
                Some(err.to_string())
            }
            Err(_) => {
                warn!(task_id = %call.task_id, call_id = %call.call_id, "reply stream timed out");
                Some(format!("reply stream timed out after {}ms", call.timeout.as_millis()))
            }
        },
    };
    if call.token.is_cancelled() {
        return;
    }
    let _ = call
        .tx
        .send(Internal::CallEnded {
            call_id: call.call_id,
            failure,
        })
        .await;
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
