//! Process-local publish/subscribe switchboard.
//!
//! Handlers register a [`DispatchCondition`]; [`Dispatcher::dispatch`] hands a
//! copy of the message to every handler whose condition matches. Each handler
//! runs on its own task so the caller never waits on a slow or failing
//! handler. The number of handlers executing at once is capped by a semaphore;
//! the rest wait for a permit. Waiting handlers are bounded too: once
//! `max_in_flight + max_queued` handler tasks exist, further deliveries are
//! dropped and logged.

use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::Result;
use crate::identifier::Identifier;
use crate::message::Message;
use crate::sync::locked;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 256;
pub const DEFAULT_MAX_QUEUED: usize = 4096;

pub type HandlerFuture = BoxFuture<'static, Result<()>>;

pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: Message) -> HandlerFuture;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, message: Message) -> HandlerFuture {
        Box::pin((self)(message))
    }
}

/// Conjunction of optional constraints over a message's name, sender and
/// destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchCondition {
    pub name: Option<String>,
    pub from: Option<Identifier>,
    pub to: Option<Identifier>,
}

impl DispatchCondition {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn to(pattern: Identifier) -> Self {
        Self {
            to: Some(pattern),
            ..Self::default()
        }
    }

    pub fn from(pattern: Identifier) -> Self {
        Self {
            from: Some(pattern),
            ..Self::default()
        }
    }

    pub fn and_to(mut self, pattern: Identifier) -> Self {
        self.to = Some(pattern);
        self
    }

    pub fn and_from(mut self, pattern: Identifier) -> Self {
        self.from = Some(pattern);
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        if let Some(name) = &self.name {
            if &message.name != name {
                return false;
            }
        }
        if let Some(from) = &self.from {
            if !from.matches(&message.from) {
                return false;
            }
        }
        if let Some(to) = &self.to {
            match &message.to {
                Some(destination) if to.matches(destination) => {}
                _ => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub label: String,
    pub max_in_flight: usize,
    /// Handler tasks allowed to wait for a permit before deliveries drop.
    pub max_queued: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            label: "dispatcher".to_string(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_queued: DEFAULT_MAX_QUEUED,
        }
    }
}

struct Registration {
    id: HandlerId,
    condition: DispatchCondition,
    handler: Arc<dyn MessageHandler>,
}

pub struct Dispatcher {
    label: String,
    next_id: AtomicU64,
    handlers: Mutex<Vec<Registration>>,
    permits: Arc<Semaphore>,
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let max_in_flight = config.max_in_flight.max(1);
        Self {
            label: config.label,
            next_id: AtomicU64::new(0),
            handlers: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max_in_flight)),
            slots: Arc::new(Semaphore::new(max_in_flight.saturating_add(config.max_queued))),
            tracker: TaskTracker::new(),
        }
    }

    pub fn on<H: MessageHandler>(&self, condition: DispatchCondition, handler: H) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        locked(&self.handlers).push(Registration {
            id,
            condition,
            handler: Arc::new(handler),
        });
        id
    }

    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = locked(&self.handlers);
        let before = handlers.len();
        handlers.retain(|registration| registration.id != id);
        handlers.len() != before
    }

    /// Fans `message` out to every matching handler and returns how many
    /// handlers were scheduled. Deliveries beyond the backlog bound are
    /// dropped. Must be called from within a tokio runtime.
    pub fn dispatch(&self, message: Message) -> usize {
        if self.tracker.is_closed() {
            debug!(event = "dispatch_closed", dispatcher = %self.label, name = %message.name);
            return 0;
        }

        let matching = locked(&self.handlers)
            .iter()
            .filter(|registration| registration.condition.matches(&message))
            .map(|registration| (registration.id, registration.handler.clone()))
            .collect::<Vec<_>>();

        let mut scheduled = 0;
        for (id, handler) in matching {
            let Ok(slot) = self.slots.clone().try_acquire_owned() else {
                warn!(
                    event = "dispatch_dropped",
                    dispatcher = %self.label,
                    handler = id.0,
                    name = %message.name
                );
                continue;
            };
            scheduled += 1;
            let message = message.clone();
            let permits = self.permits.clone();
            let label = self.label.clone();
            self.tracker.spawn(async move {
                let _slot = slot;
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                let name = message.name.clone();
                if let Err(err) = handler.handle(message).await {
                    warn!(
                        event = "handler_error",
                        dispatcher = %label,
                        handler = id.0,
                        name = %name,
                        error = %err
                    );
                }
            });
        }
        scheduled
    }

    /// Handler tasks currently running or waiting for a permit.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Stops accepting new dispatches and waits for running handlers.
    pub async fn close(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::identifier::IdentifierType;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn recorder(
        label: &'static str,
        tx: mpsc::UnboundedSender<(&'static str, Message)>,
    ) -> impl MessageHandler {
        move |message: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((label, message));
                Ok(())
            }
        }
    }

    async fn drain(
        rx: &mut mpsc::UnboundedReceiver<(&'static str, Message)>,
    ) -> Vec<&'static str> {
        let mut seen = Vec::new();
        while let Ok(Some((label, _))) =
            tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
        {
            seen.push(label);
        }
        seen.sort();
        seen
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fans_out_to_every_matching_handler_once() {
        let dispatcher = Dispatcher::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.on(DispatchCondition::name("x"), recorder("h1", tx.clone()));
        dispatcher.on(
            DispatchCondition::to(Identifier::of_type(IdentifierType::Ui)),
            recorder("h2", tx.clone()),
        );

        let hit = Message::new(
            Identifier::runnable("speak", "w1"),
            Some(Identifier::of_type(IdentifierType::Ui)),
            "x",
        );
        assert_eq!(dispatcher.dispatch(hit), 2);
        assert_eq!(drain(&mut rx).await, vec!["h1", "h2"]);

        let miss = Message::new(Identifier::runnable("speak", "w1"), None, "y");
        assert_eq!(dispatcher.dispatch(miss), 0);
        assert!(drain(&mut rx).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_handler_does_not_block_siblings() {
        let dispatcher = Dispatcher::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.on(DispatchCondition::any(), |_message: Message| async {
            Err(RelayError::handler("boom"))
        });
        dispatcher.on(DispatchCondition::any(), |_message: Message| async {
            panic!("handler panicked");
        });
        dispatcher.on(DispatchCondition::any(), recorder("ok", tx));

        dispatcher.dispatch(Message::new(Identifier::index(), None, "anything"));
        assert_eq!(drain(&mut rx).await, vec!["ok"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_handler_does_not_block_caller() {
        let dispatcher = Dispatcher::default();
        dispatcher.on(DispatchCondition::any(), |_message: Message| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        let started = std::time::Instant::now();
        for _ in 0..10 {
            dispatcher.dispatch(Message::new(Identifier::index(), None, "slow"));
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn in_flight_handlers_are_capped() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            label: "capped".to_string(),
            max_in_flight: 2,
            ..DispatcherConfig::default()
        });
        let active = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let active = active.clone();
            let peak = peak.clone();
            dispatcher.on(DispatchCondition::any(), move |_message: Message| {
                let active = active.clone();
                let peak = peak.clone();
                let tx = tx.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    let _ = tx.send(());
                    Ok(())
                }
            });
        }
        for _ in 0..8 {
            dispatcher.dispatch(Message::new(Identifier::index(), None, "work"));
        }
        for _ in 0..8 {
            tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .expect("handler finished")
                .expect("channel open");
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn backlog_is_bounded_and_overflow_is_dropped() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            label: "bounded".to_string(),
            max_in_flight: 2,
            max_queued: 3,
        });
        let gate = Arc::new(Semaphore::new(0));
        {
            let gate = gate.clone();
            dispatcher.on(DispatchCondition::any(), move |_message: Message| {
                let gate = gate.clone();
                async move {
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                    Ok(())
                }
            });
        }

        let scheduled: usize = (0..50)
            .map(|_| dispatcher.dispatch(Message::new(Identifier::index(), None, "flood")))
            .sum();
        assert_eq!(scheduled, 5);
        assert_eq!(dispatcher.pending(), 5);

        gate.add_permits(5);
        tokio::time::timeout(Duration::from_secs(2), async {
            while dispatcher.pending() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("backlog drained");

        gate.add_permits(1);
        assert_eq!(
            dispatcher.dispatch(Message::new(Identifier::index(), None, "after")),
            1
        );
        dispatcher.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn off_and_close_stop_delivery() {
        let dispatcher = Dispatcher::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = dispatcher.on(DispatchCondition::name("x"), recorder("h1", tx.clone()));
        dispatcher.on(DispatchCondition::name("z"), recorder("h2", tx));
        assert!(dispatcher.off(id));
        assert!(!dispatcher.off(id));
        assert_eq!(
            dispatcher.dispatch(Message::new(Identifier::index(), None, "x")),
            0
        );

        dispatcher.close().await;
        assert!(dispatcher.is_closed());
        assert_eq!(
            dispatcher.dispatch(Message::new(Identifier::index(), None, "z")),
            0
        );
        assert!(drain(&mut rx).await.is_empty());
    }

    #[test]
    fn condition_fields_are_anded() {
        let condition = DispatchCondition::name("say.done")
            .and_from(Identifier::runnable("speak", "w1"))
            .and_to(Identifier::worker("w2"));
        let message = Message::new(
            Identifier::runnable("speak", "w1"),
            Some(Identifier::worker("w2")),
            "say.done",
        );
        assert!(condition.matches(&message));

        let mut other_sender = message.clone();
        other_sender.from = Identifier::runnable("speak", "w3");
        assert!(!condition.matches(&other_sender));

        let mut no_destination = message.clone();
        no_destination.to = None;
        assert!(!condition.matches(&no_destination));
        assert!(DispatchCondition::any().matches(&no_destination));
    }
}
