//! Units of work hosted by a worker and the state machine driving them.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{LifecycleError, Result};
use crate::identifier::Identifier;
use crate::message::Message;
use crate::sync::locked;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl Metadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunnableStatus {
    #[default]
    Stopped,
    Running,
}

/// Optional hooks a runnable supports. Read once when the runnable is added
/// to a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub initializable: bool,
    pub closable: bool,
}

/// Where a runnable's outbound messages go. Implemented by the hosting worker.
pub trait MessageSink: Send + Sync + 'static {
    /// Routes a message without waiting; failures are logged by the sink.
    fn dispatch(&self, message: Message);

    /// Routes a message and reports the first routing or transport failure.
    fn send(&self, message: Message) -> BoxFuture<'static, Result<()>>;
}

/// Outbound handle given to a runnable. Every message leaving through it is
/// stamped with the runnable's identifier.
#[derive(Clone)]
pub struct Dispatch {
    from: Identifier,
    sink: Arc<dyn MessageSink>,
}

impl Dispatch {
    pub fn new(from: Identifier, sink: Arc<dyn MessageSink>) -> Self {
        Self { from, sink }
    }

    pub fn from(&self) -> &Identifier {
        &self.from
    }

    pub fn message(&self, to: Option<Identifier>, name: impl Into<String>) -> Message {
        Message::new(self.from.clone(), to, name)
    }

    pub fn dispatch(&self, mut message: Message) {
        message.from = self.from.clone();
        self.sink.dispatch(message);
    }

    pub async fn send(&self, mut message: Message) -> Result<()> {
        message.from = self.from.clone();
        self.sink.send(message).await
    }
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch").field("from", &self.from).finish()
    }
}

/// Everything a running activation gets: its cancellation token and its
/// outbound handle.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub token: CancellationToken,
    pub dispatch: Dispatch,
}

impl RunContext {
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub trait Runnable: Send + Sync + 'static {
    fn metadata(&self) -> Metadata;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Runs until told to stop through `ctx.token`. Returning on its own,
    /// with or without an error, counts as a crash.
    fn start(&self, ctx: RunContext) -> BoxFuture<'_, Result<()>>;

    /// Receives messages addressed to this runnable.
    fn on_message(&self, _message: Message, _dispatch: Dispatch) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

type RunFn = dyn Fn(RunContext) -> BoxFuture<'static, Result<()>> + Send + Sync;
type OnMessageFn = dyn Fn(Message, Dispatch) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// Runnable backed by closures.
pub struct FnRunnable {
    metadata: Metadata,
    run: Box<RunFn>,
    on_message: Option<Box<OnMessageFn>>,
}

impl FnRunnable {
    pub fn new<F, Fut>(metadata: Metadata, run: F) -> Self
    where
        F: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            metadata,
            run: Box::new(move |ctx| Box::pin(run(ctx))),
            on_message: None,
        }
    }

    /// A runnable that idles until it is stopped.
    pub fn idle(metadata: Metadata) -> Self {
        Self::new(metadata, |ctx: RunContext| async move {
            ctx.cancelled().await;
            Ok(())
        })
    }

    pub fn with_on_message<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Message, Dispatch) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_message = Some(Box::new(move |message, dispatch| {
            Box::pin(handler(message, dispatch))
        }));
        self
    }
}

impl Runnable for FnRunnable {
    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn start(&self, ctx: RunContext) -> BoxFuture<'_, Result<()>> {
        (self.run)(ctx)
    }

    fn on_message(&self, message: Message, dispatch: Dispatch) -> BoxFuture<'_, Result<()>> {
        match &self.on_message {
            Some(handler) => handler(message, dispatch),
            None => Box::pin(async { Ok(()) }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The activation ended because it was cancelled.
    Stopped,
    /// The activation returned while nobody asked it to stop.
    Crashed,
}

/// Start/stop state machine for one runnable.
///
/// At most one activation runs at a time. `arm` claims the slot; `stop` only
/// cancels, and the `run` call holding the slot resets the status and emits
/// the closing event.
#[derive(Debug)]
pub struct Lifecycle {
    id: Identifier,
    active: Mutex<Option<CancellationToken>>,
    status: watch::Sender<RunnableStatus>,
}

impl Lifecycle {
    pub fn new(id: Identifier) -> Self {
        let (status, _) = watch::channel(RunnableStatus::Stopped);
        Self {
            id,
            active: Mutex::new(None),
            status,
        }
    }

    pub fn id(&self) -> &Identifier {
        &self.id
    }

    pub fn status(&self) -> RunnableStatus {
        *self.status.borrow()
    }

    fn display_name(&self) -> String {
        self.id.name.clone().unwrap_or_else(|| self.id.to_string())
    }

    /// Runs one activation of `runnable` to completion. The activation's token
    /// is a child of `parent`, so cancelling `parent` stops it too.
    pub async fn start(
        &self,
        runnable: &dyn Runnable,
        parent: &CancellationToken,
        dispatch: &Dispatch,
    ) -> Result<Outcome, LifecycleError> {
        let token = self.arm(parent)?;
        Ok(self.run(token, runnable, dispatch).await)
    }

    /// Reserves the single activation slot and marks the runnable running.
    /// From here on `stop` reaches the activation, even before `run` begins.
    pub fn arm(&self, parent: &CancellationToken) -> Result<CancellationToken, LifecycleError> {
        let mut active = locked(&self.active);
        if active.is_some() {
            return Err(LifecycleError::AlreadyRunning(self.display_name()));
        }
        let token = parent.child_token();
        *active = Some(token.clone());
        self.status.send_replace(RunnableStatus::Running);
        Ok(token)
    }

    /// Drives an activation reserved by [`Lifecycle::arm`] until it stops or
    /// crashes, then releases the slot.
    pub async fn run(
        &self,
        token: CancellationToken,
        runnable: &dyn Runnable,
        dispatch: &Dispatch,
    ) -> Outcome {
        info!(event = "runnable_started", runnable = %self.id);
        dispatch.dispatch(Message::runnable_started(self.id.clone()));

        let ctx = RunContext {
            token: token.clone(),
            dispatch: dispatch.clone(),
        };
        let result = tokio::select! {
            result = runnable.start(ctx) => Some(result),
            _ = token.cancelled() => None,
        };

        let outcome = if token.is_cancelled() {
            Outcome::Stopped
        } else {
            Outcome::Crashed
        };

        *locked(&self.active) = None;
        self.status.send_replace(RunnableStatus::Stopped);

        match outcome {
            Outcome::Stopped => {
                info!(event = "runnable_stopped", runnable = %self.id);
                dispatch.dispatch(Message::runnable_stopped(self.id.clone()));
            }
            Outcome::Crashed => {
                match result {
                    Some(Err(err)) => {
                        warn!(event = "runnable_crashed", runnable = %self.id, error = %err)
                    }
                    _ => warn!(
                        event = "runnable_crashed",
                        runnable = %self.id,
                        reason = "returned before stop"
                    ),
                }
                dispatch.dispatch(Message::runnable_crashed(self.id.clone()));
            }
        }
        outcome
    }

    /// Signals the running activation to stop. Returns false when nothing was
    /// running.
    pub fn stop(&self) -> bool {
        match locked(&self.active).as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Resolves once no activation is running.
    pub async fn wait_stopped(&self) {
        let mut status = self.status.subscribe();
        let _ = status
            .wait_for(|status| *status == RunnableStatus::Stopped)
            .await;
    }
}
