use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::StreamExt;
use relay_core::codec::decode_message;
use relay_core::config::Credentials;
use relay_core::dispatcher::{DispatchCondition, Dispatcher, DispatcherConfig, MessageHandler};
use relay_core::message::{UiWelcome, WorkerInfo, WorkerWelcome};
use relay_core::sync::locked;
use relay_core::{names, Identifier, IdentifierType, Message, RelayError, Result, RunnableStatus};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{frame_bytes, Connection, ConnectionSettings};

#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// When set, every HTTP and websocket endpoint requires Basic auth.
    pub credentials: Option<Credentials>,
    /// UIs silent for longer than this are disconnected. Zero disables reaping.
    pub ui_timeout: Duration,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
    pub max_in_flight: usize,
    pub debug: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            credentials: None,
            ui_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            queue_capacity: 256,
            max_frame_bytes: relay_core::codec::DEFAULT_MAX_FRAME_BYTES,
            max_in_flight: relay_core::dispatcher::DEFAULT_MAX_IN_FLIGHT,
            debug: false,
        }
    }
}

struct WorkerEntry {
    info: WorkerInfo,
    conn: Arc<Connection>,
}

/// Central registry and router.
pub struct Index {
    config: IndexConfig,
    dispatcher: Dispatcher,
    conn_counter: AtomicU64,
    workers: Mutex<BTreeMap<String, WorkerEntry>>,
    uis: Mutex<BTreeMap<String, Arc<Connection>>>,
    /// message name -> UIs that asked for it
    ui_interest: Mutex<BTreeMap<String, BTreeSet<String>>>,
    token: CancellationToken,
}

impl Index {
    pub fn new(config: IndexConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Index>| {
            let dispatcher = Dispatcher::new(DispatcherConfig {
                label: "index".to_string(),
                max_in_flight: config.max_in_flight,
                ..DispatcherConfig::default()
            });

            on(&dispatcher, weak, DispatchCondition::name(names::UI_PING), |index, message| async move {
                index.extend_ui(&message)
            });
            on(&dispatcher, weak, DispatchCondition::name(names::UI_REGISTER), |index, message| async move {
                index.register_ui_interest(&message)
            });
            on(&dispatcher, weak, DispatchCondition::name(names::UI_DISCONNECTED), |index, message| async move {
                index.unregister_ui_interest(&message)
            });
            for name in [
                names::RUNNABLE_STARTED,
                names::RUNNABLE_STOPPED,
                names::RUNNABLE_CRASHED,
            ] {
                on(&dispatcher, weak, DispatchCondition::name(name), |index, message| async move {
                    index.update_runnable_status(&message)
                });
            }
            on(
                &dispatcher,
                weak,
                DispatchCondition::to(Identifier::of_types([
                    IdentifierType::Worker,
                    IdentifierType::Runnable,
                ])),
                |index, message| async move { index.send_to_workers(&message).await },
            );
            on(
                &dispatcher,
                weak,
                DispatchCondition::to(Identifier::of_type(IdentifierType::Ui)),
                |index, message| async move { index.send_to_uis(&message).await },
            );

            Index {
                config,
                dispatcher,
                conn_counter: AtomicU64::new(0),
                workers: Mutex::new(BTreeMap::new()),
                uis: Mutex::new(BTreeMap::new()),
                ui_interest: Mutex::new(BTreeMap::new()),
                token: CancellationToken::new(),
            }
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Registers an extra handler on the index dispatcher.
    pub fn on<H: MessageHandler>(&self, condition: DispatchCondition, handler: H) {
        self.dispatcher.on(condition, handler);
    }

    pub fn dispatch(&self, message: Message) {
        self.dispatcher.dispatch(message);
    }

    /// Worker roster sorted by name.
    pub fn workers(&self) -> Vec<WorkerInfo> {
        locked(&self.workers)
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    pub fn ui_names(&self) -> Vec<String> {
        locked(&self.uis).keys().cloned().collect()
    }

    pub fn ui_message_names(&self) -> Vec<String> {
        locked(&self.ui_interest).keys().cloned().collect()
    }

    /// Closes every connection and stops the reaper.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn close(&self) {
        self.shutdown();
        self.dispatcher.close().await;
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            queue_capacity: self.config.queue_capacity,
            write_timeout: self.config.write_timeout,
            ping_interval: self.config.ping_interval,
            max_frame_bytes: self.config.max_frame_bytes,
        }
    }

    fn extend_ui(&self, message: &Message) -> Result<()> {
        let name = message
            .from
            .name
            .clone()
            .ok_or_else(|| RelayError::MissingSender(message.name.clone()))?;
        match locked(&self.uis).get(&name) {
            Some(conn) => {
                conn.touch();
                Ok(())
            }
            None => Err(RelayError::UnknownUi(name)),
        }
    }

    fn register_ui_interest(&self, message: &Message) -> Result<()> {
        let ui = message
            .from
            .name
            .clone()
            .ok_or_else(|| RelayError::MissingSender(message.name.clone()))?;
        let register = message.parse_ui_register()?;

        let added = {
            let mut interest = locked(&self.ui_interest);
            let mut added = Vec::new();
            for name in register.message_names {
                let uis = interest.entry(name.clone()).or_default();
                if uis.is_empty() {
                    added.push(name);
                }
                uis.insert(ui.clone());
            }
            added
        };
        info!(event = "ui_registered", ui = %ui, added = added.len());

        if !added.is_empty() {
            self.dispatcher
                .dispatch(Message::ui_message_names_add(&added)?);
        }
        Ok(())
    }

    fn unregister_ui_interest(&self, message: &Message) -> Result<()> {
        let ui = message.parse_ui_disconnected()?;
        let removed = {
            let mut interest = locked(&self.ui_interest);
            let mut removed = Vec::new();
            interest.retain(|name, uis| {
                uis.remove(&ui);
                if uis.is_empty() {
                    removed.push(name.clone());
                    return false;
                }
                true
            });
            removed
        };
        if !removed.is_empty() {
            self.dispatcher
                .dispatch(Message::ui_message_names_delete(&removed)?);
        }
        Ok(())
    }

    fn update_runnable_status(&self, message: &Message) -> Result<()> {
        let worker = message
            .from
            .worker
            .clone()
            .ok_or_else(|| RelayError::MissingSender(message.name.clone()))?;
        let runnable = message
            .from
            .name
            .clone()
            .ok_or_else(|| RelayError::MissingSender(message.name.clone()))?;
        let status = if message.name == names::RUNNABLE_STARTED {
            RunnableStatus::Running
        } else {
            RunnableStatus::Stopped
        };

        let mut workers = locked(&self.workers);
        let entry = workers
            .get_mut(&worker)
            .ok_or_else(|| RelayError::UnknownWorker(worker.clone()))?;
        let info = entry
            .info
            .runnables
            .iter_mut()
            .find(|info| info.metadata.name == runnable)
            .ok_or_else(|| RelayError::UnknownRunnable(runnable.clone()))?;
        info.status = status;
        debug!(event = "runnable_status", worker = %worker, runnable = %runnable, status = ?status);
        Ok(())
    }

    /// Relays to the addressed worker, or to all of them when unnamed. Only
    /// messages from the index itself or from UIs are relayed: workers talk to
    /// each other directly.
    async fn send_to_workers(&self, message: &Message) -> Result<()> {
        if message.from.is_type(IdentifierType::Worker)
            || message.from.is_type(IdentifierType::Runnable)
        {
            return Ok(());
        }
        let to = message
            .to
            .as_ref()
            .ok_or_else(|| RelayError::MissingDestination(message.name.clone()))?;

        let targets = {
            let workers = locked(&self.workers);
            match to.worker_name() {
                Some(name) => match workers.get(name) {
                    Some(entry) => vec![(name.to_string(), entry.conn.clone())],
                    None => return Err(RelayError::UnknownWorker(name.to_string())),
                },
                None => workers
                    .iter()
                    .map(|(name, entry)| (name.clone(), entry.conn.clone()))
                    .collect(),
            }
        };
        for (name, conn) in targets {
            debug!(event = "relay_to_worker", worker = %name, name = %message.name);
            if let Err(err) = conn.send(message).await {
                warn!(event = "send_error", worker = %name, error = %err);
            }
        }
        Ok(())
    }

    /// Relays to the addressed UI; unnamed messages go to every UI that asked
    /// for the name, or to all UIs for lifecycle broadcasts.
    async fn send_to_uis(&self, message: &Message) -> Result<()> {
        let to = message
            .to
            .as_ref()
            .ok_or_else(|| RelayError::MissingDestination(message.name.clone()))?;

        let wanted = if to.name.is_none() && !names::is_ui_broadcast(&message.name) {
            let wanted = locked(&self.ui_interest)
                .get(&message.name)
                .cloned()
                .unwrap_or_default();
            if wanted.is_empty() {
                return Ok(());
            }
            Some(wanted)
        } else {
            None
        };

        let targets = {
            let uis = locked(&self.uis);
            match (&to.name, wanted) {
                (Some(name), _) => match uis.get(name) {
                    Some(conn) => vec![(name.clone(), conn.clone())],
                    None => return Err(RelayError::UnknownUi(name.clone())),
                },
                (None, Some(wanted)) => wanted
                    .iter()
                    .filter_map(|name| uis.get(name).map(|conn| (name.clone(), conn.clone())))
                    .collect(),
                (None, None) => uis
                    .iter()
                    .map(|(name, conn)| (name.clone(), conn.clone()))
                    .collect(),
            }
        };
        for (name, conn) in targets {
            debug!(event = "relay_to_ui", ui = %name, name = %message.name);
            if let Err(err) = conn.send(message).await {
                warn!(event = "send_error", ui = %name, error = %err);
            }
        }
        Ok(())
    }

    async fn register_worker(&self, conn: &Arc<Connection>, message: &Message) -> Result<String> {
        let info = message.parse_worker_register()?;
        if info.name.trim().is_empty() {
            return Err(RelayError::MissingSender(message.name.clone()));
        }

        let replaced = locked(&self.workers).insert(
            info.name.clone(),
            WorkerEntry {
                info: info.clone(),
                conn: conn.clone(),
            },
        );
        if let Some(previous) = replaced {
            if previous.conn.conn_id != conn.conn_id {
                warn!(event = "worker_replaced", worker = %info.name, conn_id = %previous.conn.conn_id);
                previous.conn.close();
            }
        }
        info!(
            event = "worker_registered",
            worker = %info.name,
            addr = %info.addr,
            conn_id = %conn.conn_id,
            runnables = info.runnables.len()
        );

        let welcome = WorkerWelcome {
            workers: self.workers(),
            ui_message_names: self.ui_message_names(),
        };
        conn.send(&Message::worker_welcome(&info.name, &welcome)?)
            .await?;
        self.dispatcher.dispatch(Message::worker_registered(&info)?);
        Ok(info.name)
    }

    fn remove_worker(&self, name: &str, conn_id: &str) {
        let removed = {
            let mut workers = locked(&self.workers);
            match workers.get(name) {
                Some(entry) if entry.conn.conn_id == conn_id => workers.remove(name).is_some(),
                _ => false,
            }
        };
        if !removed {
            return;
        }
        info!(event = "worker_disconnected", worker = %name, conn_id = %conn_id);
        match Message::worker_disconnected(name) {
            Ok(message) => {
                self.dispatcher.dispatch(message);
            }
            Err(err) => warn!(event = "message_build_error", error = %err),
        }
    }

    fn remove_ui(&self, name: &str, conn_id: &str) {
        let removed = {
            let mut uis = locked(&self.uis);
            match uis.get(name) {
                Some(conn) if conn.conn_id == conn_id => uis.remove(name).is_some(),
                _ => false,
            }
        };
        if !removed {
            return;
        }
        info!(event = "ui_disconnected", ui = %name, conn_id = %conn_id);
        match Message::ui_disconnected(name) {
            Ok(message) => {
                self.dispatcher.dispatch(message);
            }
            Err(err) => warn!(event = "message_build_error", error = %err),
        }
    }

    /// Reads the next data frame, or None once the peer is gone or the
    /// connection was closed locally.
    async fn next_frame(
        &self,
        conn: &Connection,
        receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    ) -> Option<Vec<u8>> {
        loop {
            let next = tokio::select! {
                _ = conn.closed() => return None,
                next = receiver.next() => next,
            };
            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    warn!(event = "read_error", conn_id = %conn.conn_id, error = %err);
                    return None;
                }
                None => return None,
            };
            if let WsMessage::Close(_) = frame {
                info!(event = "client_close", conn_id = %conn.conn_id);
                return None;
            }
            // Control frames are answered by the transport and do not count as
            // UI activity.
            if let Some(data) = frame_bytes(frame) {
                conn.touch();
                if self.config.debug {
                    debug!(event = "message_received", conn_id = %conn.conn_id, raw = %String::from_utf8_lossy(&data));
                }
                return Some(data);
            }
        }
    }

    pub(crate) async fn handle_worker_socket(self: Arc<Self>, socket: WebSocket) {
        let (ws_sender, mut ws_receiver) = socket.split();
        let (conn, write_task) = Connection::spawn(
            self.next_conn_id(),
            ws_sender,
            &self.connection_settings(),
            self.token.child_token(),
        );
        let conn = Arc::new(conn);
        let mut registered: Option<String> = None;

        while let Some(data) = self.next_frame(&conn, &mut ws_receiver).await {
            let message = match decode_message(&data, self.config.max_frame_bytes) {
                Ok(message) => message,
                Err(err) => {
                    warn!(event = "message_invalid", conn_id = %conn.conn_id, error = %err);
                    continue;
                }
            };
            if message.name == names::WORKER_REGISTER {
                match self.register_worker(&conn, &message).await {
                    Ok(name) => registered = Some(name),
                    Err(err) => {
                        // A rejected register ends the session.
                        warn!(event = "register_failed", conn_id = %conn.conn_id, error = %err);
                        break;
                    }
                }
                continue;
            }
            if registered.is_none() {
                warn!(event = "unregistered_message", conn_id = %conn.conn_id, name = %message.name);
                continue;
            }
            self.dispatcher.dispatch(message);
        }

        if let Some(name) = registered {
            self.remove_worker(&name, &conn.conn_id);
        }
        conn.close();
        drop(conn);
        let _ = write_task.await;
    }

    pub(crate) async fn handle_ui_socket(self: Arc<Self>, socket: WebSocket) {
        let (ws_sender, mut ws_receiver) = socket.split();
        let (conn, write_task) = Connection::spawn(
            self.next_conn_id(),
            ws_sender,
            &self.connection_settings(),
            self.token.child_token(),
        );
        let conn = Arc::new(conn);
        let name = format!("ui-{}", Uuid::new_v4());
        locked(&self.uis).insert(name.clone(), conn.clone());
        info!(event = "ui_connected", ui = %name, conn_id = %conn.conn_id);

        let welcome = UiWelcome {
            name: name.clone(),
            workers: self.workers(),
        };
        let welcomed = match Message::ui_welcome(&welcome) {
            Ok(message) => conn.send(&message).await,
            Err(err) => Err(err),
        };
        if let Err(err) = welcomed {
            warn!(event = "welcome_failed", ui = %name, error = %err);
            conn.close();
        }

        while let Some(data) = self.next_frame(&conn, &mut ws_receiver).await {
            let mut message = match decode_message(&data, self.config.max_frame_bytes) {
                Ok(message) => message,
                Err(err) => {
                    warn!(event = "message_invalid", ui = %name, error = %err);
                    continue;
                }
            };
            message.from = Identifier::ui(&name);
            self.dispatcher.dispatch(message);
        }

        self.remove_ui(&name, &conn.conn_id);
        conn.close();
        drop(conn);
        let _ = write_task.await;
    }

    pub(crate) fn start_ui_reaper(self: Arc<Self>) {
        if self.config.ui_timeout.is_zero() {
            return;
        }
        let stale_after = self.config.ui_timeout;
        let interval = (stale_after / 2).max(Duration::from_millis(10));
        let token = self.token.clone();
        let weak = Arc::downgrade(&self);
        drop(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(index) = weak.upgrade() else {
                    return;
                };
                let uis = locked(&index.uis)
                    .iter()
                    .map(|(name, conn)| (name.clone(), conn.clone()))
                    .collect::<Vec<_>>();
                for (name, conn) in uis {
                    if Instant::now().duration_since(conn.last_seen()) > stale_after {
                        warn!(event = "stale_close", ui = %name, conn_id = %conn.conn_id);
                        conn.close();
                    }
                }
            }
        });
    }
}

/// Registers a handler that holds the index weakly, so handlers never keep a
/// dropped index alive.
fn on<F, Fut>(dispatcher: &Dispatcher, weak: &Weak<Index>, condition: DispatchCondition, handler: F)
where
    F: Fn(Arc<Index>, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let weak = weak.clone();
    dispatcher.on(condition, move |message: Message| {
        let pending = weak.upgrade().map(|index| handler(index, message));
        async move {
            match pending {
                Some(pending) => pending.await,
                None => Ok(()),
            }
        }
    });
}
