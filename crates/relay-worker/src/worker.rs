use futures_util::future::BoxFuture;
use relay_core::dispatcher::{DispatchCondition, Dispatcher, DispatcherConfig, MessageHandler};
use relay_core::listenable::{Audience, Subscriptions};
use relay_core::message::{RunnableInfo, WorkerInfo};
use relay_core::runnable::{Capabilities, Dispatch, Lifecycle, MessageSink, Runnable};
use relay_core::sync::locked;
use relay_core::{
    names, Identifier, IdentifierType, LifecycleError, Listenable, Message, RelayError, Result,
    RunnableStatus,
};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{index_url, WorkerConfig};
use crate::peer::PeerClient;
use crate::{server, upstream};

/// Message names a runnable never sees through `on_message`; the worker
/// handles them itself.
const RESERVED_RUNNABLE_NAMES: &[&str] = &[
    names::RUNNABLE_START,
    names::RUNNABLE_STOP,
    names::LISTENABLES_REGISTER,
];

struct Hosted {
    runnable: Arc<dyn Runnable>,
    lifecycle: Lifecycle,
    capabilities: Capabilities,
    dispatch: Dispatch,
}

/// A worker node: hosts runnables, keeps the link to the index and routes
/// messages to the index, to peers or locally.
pub struct Worker {
    config: WorkerConfig,
    me: Weak<Worker>,
    dispatcher: Dispatcher,
    runnables: Mutex<BTreeMap<String, Arc<Hosted>>>,
    /// peer name -> last roster entry, used to reach peers directly
    peers: Mutex<BTreeMap<String, WorkerInfo>>,
    /// what this worker asked other workers' runnables for
    subscriptions: Mutex<Subscriptions>,
    /// what other workers asked of this worker's runnables
    audience: Mutex<Audience>,
    ui_message_names: Mutex<BTreeSet<String>>,
    addr: Mutex<String>,
    outbox: mpsc::UnboundedSender<Message>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    registered: watch::Sender<bool>,
    peer_client: PeerClient,
    token: CancellationToken,
    tasks: TaskTracker,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Result<Arc<Self>> {
        let peer_client = PeerClient::new(config.peer_timeout, config.max_frame_bytes)?;
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (registered, _) = watch::channel(false);

        Ok(Arc::new_cyclic(|weak: &Weak<Worker>| {
            let dispatcher = Dispatcher::new(DispatcherConfig {
                label: format!("worker:{}", config.name),
                max_in_flight: config.max_in_flight,
                ..DispatcherConfig::default()
            });
            let own_runnables =
                Identifier::of_type(IdentifierType::Runnable).with_worker(&config.name);

            on(&dispatcher, weak, DispatchCondition::name(names::WORKER_WELCOME), |worker, message| async move {
                worker.finish_registration(&message).await
            });
            on(&dispatcher, weak, DispatchCondition::name(names::WORKER_REGISTERED), |worker, message| async move {
                worker.add_peer(&message).await
            });
            on(&dispatcher, weak, DispatchCondition::name(names::WORKER_DISCONNECTED), |worker, message| async move {
                worker.remove_peer(&message)
            });
            on(
                &dispatcher,
                weak,
                DispatchCondition::name(names::RUNNABLE_START).and_to(own_runnables.clone()),
                |worker, message| async move {
                    let name = message.parse_runnable_start()?;
                    worker.start_runnable(&name)
                },
            );
            on(
                &dispatcher,
                weak,
                DispatchCondition::name(names::RUNNABLE_STOP).and_to(own_runnables.clone()),
                |worker, message| async move {
                    let name = message.parse_runnable_stop()?;
                    worker.stop_runnable(&name)
                },
            );
            on(
                &dispatcher,
                weak,
                DispatchCondition::name(names::LISTENABLES_REGISTER).and_to(own_runnables),
                |worker, message| async move { worker.record_listenables(&message) },
            );
            on(&dispatcher, weak, DispatchCondition::name(names::UI_MESSAGE_NAMES_ADD), |worker, message| async move {
                let added = message.parse_ui_message_names_add()?;
                locked(&worker.ui_message_names).extend(added);
                Ok(())
            });
            on(&dispatcher, weak, DispatchCondition::name(names::UI_MESSAGE_NAMES_DELETE), |worker, message| async move {
                let deleted = message.parse_ui_message_names_delete()?;
                locked(&worker.ui_message_names).retain(|name| !deleted.contains(name));
                Ok(())
            });

            Worker {
                addr: Mutex::new(config.advertised_addr.clone()),
                config,
                me: weak.clone(),
                dispatcher,
                runnables: Mutex::new(BTreeMap::new()),
                peers: Mutex::new(BTreeMap::new()),
                subscriptions: Mutex::new(Subscriptions::default()),
                audience: Mutex::new(Audience::default()),
                ui_message_names: Mutex::new(BTreeSet::new()),
                outbox,
                outbox_rx: Mutex::new(Some(outbox_rx)),
                registered,
                peer_client,
                token: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn id(&self) -> Identifier {
        Identifier::worker(&self.config.name)
    }

    /// Address peers use to reach this worker.
    pub fn addr(&self) -> String {
        locked(&self.addr).clone()
    }

    /// Hosts `runnable` on this worker. Runnables added after the worker
    /// registered show up in the roster on the next registration.
    pub fn add_runnable<R: Runnable>(&self, runnable: R) -> Result<()> {
        let metadata = runnable.metadata();
        let capabilities = runnable.capabilities();
        let id = Identifier::runnable(&metadata.name, &self.config.name);
        if locked(&self.runnables).contains_key(&metadata.name) {
            return Err(RelayError::handler(format!("{id} is already hosted")));
        }
        if capabilities.initializable {
            runnable.init()?;
        }

        let sink: Arc<dyn MessageSink> = Arc::new(WorkerSink {
            worker: self.me.clone(),
        });
        let hosted = Arc::new(Hosted {
            runnable: Arc::new(runnable),
            lifecycle: Lifecycle::new(id.clone()),
            capabilities,
            dispatch: Dispatch::new(id.clone(), sink),
        });

        let target = hosted.clone();
        self.dispatcher.on(DispatchCondition::to(id.clone()), move |message: Message| {
            let hosted = target.clone();
            async move {
                if RESERVED_RUNNABLE_NAMES.contains(&message.name.as_str()) {
                    return Ok(());
                }
                let dispatch = hosted.dispatch.clone();
                hosted.runnable.on_message(message, dispatch).await
            }
        });
        locked(&self.runnables).insert(metadata.name.clone(), hosted);
        info!(event = "runnable_added", runnable = %id, description = %metadata.description);
        Ok(())
    }

    fn hosted(&self, name: &str) -> Result<Arc<Hosted>> {
        locked(&self.runnables)
            .get(name)
            .cloned()
            .ok_or_else(|| RelayError::UnknownRunnable(name.to_string()))
    }

    /// Launches one activation of the named runnable in the background.
    pub fn start_runnable(&self, name: &str) -> Result<()> {
        let hosted = self.hosted(name)?;
        let token = hosted.lifecycle.arm(&self.token)?;
        self.tasks.spawn(async move {
            let runnable = hosted.runnable.as_ref();
            let outcome = hosted.lifecycle.run(token, runnable, &hosted.dispatch).await;
            debug!(event = "activation_end", runnable = %hosted.lifecycle.id(), outcome = ?outcome);
        });
        Ok(())
    }

    /// Signals the named runnable to stop.
    pub fn stop_runnable(&self, name: &str) -> Result<()> {
        let hosted = self.hosted(name)?;
        if !hosted.lifecycle.stop() {
            return Err(LifecycleError::AlreadyStopped(name.to_string()).into());
        }
        Ok(())
    }

    pub fn runnable_status(&self, name: &str) -> Option<RunnableStatus> {
        locked(&self.runnables)
            .get(name)
            .map(|hosted| hosted.lifecycle.status())
    }

    pub async fn wait_runnable_stopped(&self, name: &str) -> Result<()> {
        let hosted = self.hosted(name)?;
        hosted.lifecycle.wait_stopped().await;
        Ok(())
    }

    /// Registers an extra handler on the worker dispatcher.
    pub fn on<H: MessageHandler>(&self, condition: DispatchCondition, handler: H) {
        self.dispatcher.on(condition, handler);
    }

    /// Subscribes `handler` to messages produced by a runnable on another
    /// worker. The interest is announced to that worker on every registration
    /// and whenever it joins.
    pub fn listen<H: MessageHandler>(&self, listenable: Listenable, handler: H) {
        let condition = DispatchCondition::from(listenable.runnable_id()).and_to(self.id());
        self.dispatcher.on(condition, handler);
        locked(&self.subscriptions).add(&listenable);
        info!(
            event = "listenable_added",
            worker = %listenable.worker,
            runnable = %listenable.runnable,
            names = ?listenable.names
        );
    }

    /// Delivers a message that arrived from the index or a peer.
    pub fn receive(&self, message: Message) {
        self.dispatcher.dispatch(message);
    }

    /// Delivers `message` locally and routes it outward without waiting.
    /// Routing failures are logged.
    pub fn dispatch(&self, message: Message) {
        let clones = self.fan_out(&message);
        self.dispatcher.dispatch(message.clone());
        for message in std::iter::once(message).chain(clones) {
            if let Err(err) = self.route_upstream(&message) {
                warn!(event = "route_error", name = %message.name, error = %err);
            }
            let Some(target) = self.peer_target(&message) else {
                continue;
            };
            let Some(worker) = self.me.upgrade() else {
                return;
            };
            self.tasks.spawn(async move {
                if let Err(err) = worker.send_to_peer(&target, &message).await {
                    warn!(event = "route_error", name = %message.name, peer = %target, error = %err);
                }
            });
        }
    }

    /// Same as [`Worker::dispatch`] but waits for routing and returns the
    /// first failure.
    pub async fn send(&self, message: Message) -> Result<()> {
        let clones = self.fan_out(&message);
        self.dispatcher.dispatch(message.clone());
        let mut first_error = None;
        for message in std::iter::once(message).chain(clones) {
            if let Err(err) = self.route(&message).await {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Copies of `message` addressed to every other worker that asked the
    /// sending runnable for this message name.
    pub(crate) fn fan_out(&self, message: &Message) -> Vec<Message> {
        let from = &message.from;
        if !from.is_type(IdentifierType::Runnable) || from.worker_name() != Some(self.name()) {
            return Vec::new();
        }
        let Some(runnable) = from.name.as_deref() else {
            return Vec::new();
        };
        let direct = message.to.as_ref().and_then(|to| to.worker_name());
        locked(&self.audience)
            .interested(runnable, &message.name)
            .into_iter()
            .filter(|worker| worker != self.name() && Some(worker.as_str()) != direct)
            .map(|worker| {
                let mut clone = message.clone();
                clone.to = Some(Identifier::worker(worker));
                clone
            })
            .collect()
    }

    /// Only messages originated on this worker are routed outward; traffic
    /// that arrived from the index or a peer is delivered locally only.
    fn originated_here(&self, message: &Message) -> bool {
        message.from.worker_name() == Some(self.name())
    }

    async fn route(&self, message: &Message) -> Result<()> {
        self.route_upstream(message)?;
        if let Some(target) = self.peer_target(message) {
            self.send_to_peer(&target, message).await?;
        }
        Ok(())
    }

    /// Queues `message` for the index when it targets the index, or UIs
    /// that want it.
    fn route_upstream(&self, message: &Message) -> Result<()> {
        let Some(to) = message.to.as_ref() else {
            return Ok(());
        };
        if !self.originated_here(message) {
            return Ok(());
        }
        let wanted = {
            let ui_message_names = locked(&self.ui_message_names);
            upstream_wanted(to, &message.name, &ui_message_names)
        };
        if wanted {
            self.send_upstream(message.clone())?;
        }
        Ok(())
    }

    /// The other worker `message` must be posted to, if any.
    fn peer_target(&self, message: &Message) -> Option<String> {
        let to = message.to.as_ref()?;
        if !self.originated_here(message) {
            return None;
        }
        if !to.covers(IdentifierType::Worker) && !to.covers(IdentifierType::Runnable) {
            return None;
        }
        to.worker_name()
            .filter(|target| *target != self.name())
            .map(str::to_string)
    }

    fn send_upstream(&self, message: Message) -> Result<()> {
        self.outbox
            .send(message)
            .map_err(|_| RelayError::transport("index", "link closed"))
    }

    async fn send_to_peer(&self, target: &str, message: &Message) -> Result<()> {
        let peer = locked(&self.peers)
            .get(target)
            .cloned()
            .ok_or_else(|| RelayError::UnknownWorker(target.to_string()))?;
        self.peer_client.post(&peer, message).await?;
        debug!(event = "peer_sent", peer = %target, name = %message.name);
        Ok(())
    }

    pub(crate) fn register_message(&self) -> Result<Message> {
        let runnables = locked(&self.runnables)
            .values()
            .map(|hosted| RunnableInfo {
                metadata: hosted.runnable.metadata(),
                status: hosted.lifecycle.status(),
            })
            .collect();
        let info = WorkerInfo {
            name: self.config.name.clone(),
            addr: self.addr(),
            runnables,
        };
        Message::worker_register(&info)
    }

    async fn finish_registration(&self, message: &Message) -> Result<()> {
        let welcome = message.parse_worker_welcome()?;
        let roster = welcome
            .workers
            .into_iter()
            .filter(|info| info.name != self.config.name)
            .collect::<Vec<_>>();
        let names = roster
            .iter()
            .map(|info| info.name.clone())
            .collect::<BTreeSet<_>>();

        *locked(&self.ui_message_names) = welcome.ui_message_names.into_iter().collect();
        locked(&self.audience).retain_workers(|worker| names.contains(worker));
        {
            let mut peers = locked(&self.peers);
            peers.clear();
            for info in &roster {
                peers.insert(info.name.clone(), info.clone());
            }
        }
        info!(event = "worker_welcomed", peers = roster.len());

        for info in &roster {
            self.announce_listenables(&info.name).await;
        }
        Ok(())
    }

    async fn add_peer(&self, message: &Message) -> Result<()> {
        let info = message.parse_worker_registered()?;
        if info.name == self.config.name {
            return Ok(());
        }
        let name = info.name.clone();
        locked(&self.peers).insert(name.clone(), info);
        info!(event = "peer_added", peer = %name);
        self.announce_listenables(&name).await;
        Ok(())
    }

    fn remove_peer(&self, message: &Message) -> Result<()> {
        let name = message.parse_worker_disconnected()?;
        if name == self.config.name {
            return Ok(());
        }
        locked(&self.peers).remove(&name);
        locked(&self.audience).remove_worker(&name);
        info!(event = "peer_removed", peer = %name);
        Ok(())
    }

    /// Sends `peer` the interest this worker holds in its runnables.
    async fn announce_listenables(&self, peer: &str) {
        let wanted = locked(&self.subscriptions).for_worker(peer);
        for listenables in wanted {
            let runnable = Identifier::runnable(&listenables.runnable, peer);
            let result = match Message::listenables_register(self.name(), runnable, &listenables) {
                Ok(message) => self.route(&message).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => debug!(event = "listenables_announced", peer = %peer, runnable = %listenables.runnable),
                Err(err) => warn!(
                    event = "listenables_announce_failed",
                    peer = %peer,
                    runnable = %listenables.runnable,
                    error = %err
                ),
            }
        }
    }

    fn record_listenables(&self, message: &Message) -> Result<()> {
        let worker = message
            .from
            .worker_name()
            .ok_or_else(|| RelayError::MissingSender(message.name.clone()))?
            .to_string();
        let listenables = message.parse_listenables_register()?;
        if !locked(&self.runnables).contains_key(&listenables.runnable) {
            return Err(RelayError::UnknownRunnable(listenables.runnable));
        }
        locked(&self.audience).add(&worker, &listenables);
        info!(
            event = "listenables_recorded",
            worker = %worker,
            runnable = %listenables.runnable,
            names = ?listenables.names
        );
        Ok(())
    }

    /// Workers that asked `runnable` for messages named `name`.
    pub fn interested_workers(&self, runnable: &str, name: &str) -> Vec<String> {
        locked(&self.audience).interested(runnable, name)
    }

    pub fn peers(&self) -> Vec<WorkerInfo> {
        locked(&self.peers).values().cloned().collect()
    }

    pub fn ui_message_names(&self) -> Vec<String> {
        locked(&self.ui_message_names).iter().cloned().collect()
    }

    pub fn is_registered(&self) -> bool {
        *self.registered.borrow()
    }

    /// Resolves once the index has welcomed this worker on the current link.
    pub async fn wait_registered(&self) {
        let mut registered = self.registered.subscribe();
        let _ = registered.wait_for(|registered| *registered).await;
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        self.registered.send_replace(registered);
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Serves the peer HTTP surface on `listener` until shutdown. When no
    /// address was configured, the listener's address is advertised.
    pub fn serve(&self, listener: TcpListener) -> io::Result<SocketAddr> {
        let local = listener.local_addr()?;
        {
            let mut addr = locked(&self.addr);
            if addr.trim().is_empty() {
                *addr = format!("http://{local}");
            }
        }
        let worker = self
            .me
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "worker dropped"))?;
        let token = self.token.clone();
        self.tasks.spawn(async move {
            let result = axum::serve(listener, server::router(worker))
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(err) = result {
                error!(event = "server_error", error = %err);
            }
        });
        info!(event = "worker_serving", worker = %self.config.name, addr = %local);
        Ok(local)
    }

    /// Starts the index link. It keeps reconnecting until shutdown.
    pub fn connect(&self) -> Result<()> {
        let url = index_url(&self.config.index_addr)
            .map_err(|err| RelayError::transport(&self.config.index_addr, err))?;
        let Some(outbox) = locked(&self.outbox_rx).take() else {
            warn!(event = "already_connected", worker = %self.config.name);
            return Ok(());
        };
        let worker = self
            .me
            .upgrade()
            .ok_or_else(|| RelayError::handler("worker dropped"))?;
        self.tasks.spawn(upstream::run(worker, url, outbox));
        Ok(())
    }

    /// Stops every runnable, closes the closable ones, then tears down the
    /// index link, the HTTP server and the dispatcher.
    pub async fn shutdown(&self) {
        info!(event = "worker_shutdown", worker = %self.config.name);
        let hosted = locked(&self.runnables).values().cloned().collect::<Vec<_>>();
        for hosted in &hosted {
            hosted.lifecycle.stop();
        }
        for hosted in &hosted {
            hosted.lifecycle.wait_stopped().await;
        }
        for hosted in &hosted {
            if !hosted.capabilities.closable {
                continue;
            }
            if let Err(err) = hosted.runnable.close() {
                warn!(event = "runnable_close_failed", runnable = %hosted.lifecycle.id(), error = %err);
            }
        }
        self.token.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.dispatcher.close().await;
    }
}

pub(crate) fn upstream_wanted(
    to: &Identifier,
    name: &str,
    ui_message_names: &BTreeSet<String>,
) -> bool {
    if to.covers(IdentifierType::Index) {
        return true;
    }
    if !to.covers(IdentifierType::Ui) {
        return false;
    }
    to.name.is_some() || names::is_ui_broadcast(name) || ui_message_names.contains(name)
}

/// Outbound path handed to hosted runnables.
struct WorkerSink {
    worker: Weak<Worker>,
}

impl MessageSink for WorkerSink {
    fn dispatch(&self, message: Message) {
        if let Some(worker) = self.worker.upgrade() {
            worker.dispatch(message);
        }
    }

    fn send(&self, message: Message) -> BoxFuture<'static, Result<()>> {
        let worker = self.worker.upgrade();
        Box::pin(async move {
            match worker {
                Some(worker) => worker.send(message).await,
                None => Err(RelayError::handler("worker dropped")),
            }
        })
    }
}

fn on<F, Fut>(dispatcher: &Dispatcher, weak: &Weak<Worker>, condition: DispatchCondition, handler: F)
where
    F: Fn(Arc<Worker>, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let weak = weak.clone();
    dispatcher.on(condition, move |message: Message| {
        let pending = weak.upgrade().map(|worker| handler(worker, message));
        async move {
            match pending {
                Some(pending) => pending.await,
                None => Ok(()),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::message::Listenables;
    use relay_core::runnable::{FnRunnable, Metadata, RunContext};
    use std::time::Duration;

    fn worker(name: &str) -> Arc<Worker> {
        Worker::new(WorkerConfig::new(name, "127.0.0.1:1")).unwrap()
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn register_interest(from: &str, owner: &str, runnable: &str, names: &[&str]) -> Message {
        let listenables = Listenables {
            runnable: runnable.to_string(),
            names: names.iter().map(|name| name.to_string()).collect(),
        };
        Message::listenables_register(from, Identifier::runnable(runnable, owner), &listenables)
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commands_drive_the_runnable_lifecycle() {
        let worker = worker("w1");
        worker
            .add_runnable(FnRunnable::idle(Metadata::new("speak", "")))
            .unwrap();
        let id = Identifier::runnable("speak", "w1");

        worker.receive(Message::runnable_start(Identifier::index(), &id).unwrap());
        eventually(|| worker.runnable_status("speak") == Some(RunnableStatus::Running)).await;

        assert!(matches!(
            worker.start_runnable("speak"),
            Err(RelayError::Lifecycle(LifecycleError::AlreadyRunning(_)))
        ));

        worker.receive(Message::runnable_stop(Identifier::index(), &id).unwrap());
        tokio::time::timeout(Duration::from_secs(2), worker.wait_runnable_stopped("speak"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(worker.runnable_status("speak"), Some(RunnableStatus::Stopped));

        assert!(matches!(
            worker.stop_runnable("speak"),
            Err(RelayError::Lifecycle(LifecycleError::AlreadyStopped(_)))
        ));
        assert!(matches!(
            worker.start_runnable("missing"),
            Err(RelayError::UnknownRunnable(_))
        ));
        worker.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_right_after_start_is_not_lost() {
        let worker = worker("w1");
        worker
            .add_runnable(FnRunnable::idle(Metadata::new("speak", "")))
            .unwrap();

        for _ in 0..20 {
            worker.start_runnable("speak").unwrap();
            assert_eq!(worker.runnable_status("speak"), Some(RunnableStatus::Running));
            worker.stop_runnable("speak").unwrap();
            tokio::time::timeout(Duration::from_secs(2), worker.wait_runnable_stopped("speak"))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(worker.runnable_status("speak"), Some(RunnableStatus::Stopped));
        }
        worker.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_starts_report_already_running() {
        let worker = worker("w1");
        worker
            .add_runnable(FnRunnable::idle(Metadata::new("speak", "")))
            .unwrap();

        let first = tokio::spawn({
            let worker = worker.clone();
            async move { worker.start_runnable("speak") }
        });
        let second = tokio::spawn({
            let worker = worker.clone();
            async move { worker.start_runnable("speak") }
        });
        let results = [first.await.unwrap(), second.await.unwrap()];
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert!(results.iter().any(|result| matches!(
            result,
            Err(RelayError::Lifecycle(LifecycleError::AlreadyRunning(_)))
        )));

        worker.stop_runnable("speak").unwrap();
        tokio::time::timeout(Duration::from_secs(2), worker.wait_runnable_stopped("speak"))
            .await
            .unwrap()
            .unwrap();
        worker.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commands_for_other_workers_are_ignored() {
        let worker = worker("w1");
        worker
            .add_runnable(FnRunnable::idle(Metadata::new("speak", "")))
            .unwrap();
        let elsewhere = Identifier::runnable("speak", "w2");
        worker.receive(Message::runnable_start(Identifier::index(), &elsewhere).unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(worker.runnable_status("speak"), Some(RunnableStatus::Stopped));
        worker.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runnable_receives_addressed_messages_but_not_commands() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = worker("w1");
        let runnable = FnRunnable::idle(Metadata::new("hear", "")).with_on_message(
            move |message: Message, _dispatch: Dispatch| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message.name);
                    Ok(())
                }
            },
        );
        worker.add_runnable(runnable).unwrap();
        let id = Identifier::runnable("hear", "w1");

        worker.receive(Message::runnable_stop(Identifier::index(), &id).unwrap());
        worker.receive(Message::new(Identifier::worker("w2"), Some(id), "say.done"));

        let name = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, "say.done");
        assert!(rx.try_recv().is_err());
        worker.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interest_from_other_workers_adds_direct_copies() {
        let worker = worker("w1");
        worker
            .add_runnable(FnRunnable::idle(Metadata::new("speak", "")))
            .unwrap();
        worker.receive(register_interest("w2", "w1", "speak", &["say.done"]));
        eventually(|| worker.interested_workers("speak", "say.done") == vec!["w2".to_string()])
            .await;

        let said = Message::new(Identifier::runnable("speak", "w1"), None, "say.done");
        let clones = worker.fan_out(&said);
        assert_eq!(clones.len(), 1);
        assert_eq!(clones[0].to, Some(Identifier::worker("w2")));
        assert_eq!(clones[0].from, said.from);

        let other = Message::new(Identifier::runnable("speak", "w1"), None, "say.begin");
        assert!(worker.fan_out(&other).is_empty());

        let direct = Message::new(
            Identifier::runnable("speak", "w1"),
            Some(Identifier::worker("w2")),
            "say.done",
        );
        assert!(worker.fan_out(&direct).is_empty());
        worker.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interest_in_unknown_runnables_is_rejected() {
        let worker = worker("w1");
        worker.receive(register_interest("w2", "w1", "ghost", &["say.done"]));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(worker.interested_workers("ghost", "say.done").is_empty());
        worker.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn departed_workers_lose_their_interest() {
        let worker = worker("w1");
        worker
            .add_runnable(FnRunnable::idle(Metadata::new("speak", "")))
            .unwrap();
        worker.receive(register_interest("w2", "w1", "speak", &["say.done"]));
        eventually(|| !worker.interested_workers("speak", "say.done").is_empty()).await;

        worker.receive(Message::worker_disconnected("w2").unwrap());
        eventually(|| worker.interested_workers("speak", "say.done").is_empty()).await;
        worker.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sending_to_an_unknown_peer_fails() {
        let worker = worker("w1");
        let message = Message::new(worker.id(), Some(Identifier::worker("ghost")), "hello");
        assert!(matches!(
            worker.send(message).await,
            Err(RelayError::UnknownWorker(name)) if name == "ghost"
        ));
        worker.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ui_name_announcements_update_the_interest_set() {
        let worker = worker("w1");
        let names = vec!["say.done".to_string(), "say.begin".to_string()];
        worker.receive(Message::ui_message_names_add(&names).unwrap());
        eventually(|| worker.ui_message_names().len() == 2).await;

        worker.receive(Message::ui_message_names_delete(&names[..1]).unwrap());
        eventually(|| worker.ui_message_names() == vec!["say.begin".to_string()]).await;
        worker.shutdown().await;
    }

    #[test]
    fn ui_traffic_goes_upstream_only_when_wanted() {
        let wanted = BTreeSet::from(["say.done".to_string()]);
        let ui = Identifier::of_type(IdentifierType::Ui);

        assert!(upstream_wanted(&Identifier::index(), "anything", &wanted));
        assert!(upstream_wanted(&ui, "say.done", &wanted));
        assert!(upstream_wanted(&ui, names::RUNNABLE_STARTED, &wanted));
        assert!(!upstream_wanted(&ui, "say.begin", &wanted));
        assert!(upstream_wanted(&Identifier::ui("ui-1"), "say.begin", &wanted));
        assert!(!upstream_wanted(&Identifier::worker("w2"), "say.done", &wanted));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_stops_and_closes_runnables() {
        struct Closable {
            closed: Arc<std::sync::atomic::AtomicBool>,
        }

        impl Runnable for Closable {
            fn metadata(&self) -> Metadata {
                Metadata::new("closable", "")
            }

            fn capabilities(&self) -> Capabilities {
                Capabilities {
                    initializable: false,
                    closable: true,
                }
            }

            fn start(&self, ctx: RunContext) -> BoxFuture<'_, Result<()>> {
                Box::pin(async move {
                    ctx.cancelled().await;
                    Ok(())
                })
            }

            fn close(&self) -> Result<()> {
                self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        }

        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let worker = worker("w1");
        worker
            .add_runnable(Closable {
                closed: closed.clone(),
            })
            .unwrap();
        worker.start_runnable("closable").unwrap();
        eventually(|| worker.runnable_status("closable") == Some(RunnableStatus::Running)).await;

        tokio::time::timeout(Duration::from_secs(2), worker.shutdown())
            .await
            .unwrap();
        assert_eq!(worker.runnable_status("closable"), Some(RunnableStatus::Stopped));
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }
}
