use serde::de::{DeserializeOwned, Deserializer};
use serde::ser::{Error as _, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;

use crate::error::{RelayError, Result};
use crate::identifier::{Identifier, IdentifierType};
use crate::runnable::{Metadata, RunnableStatus};

pub mod names {
    pub const LISTENABLES_REGISTER: &str = "listenables.register";
    pub const RUNNABLE_CRASHED: &str = "runnable.crashed";
    pub const RUNNABLE_START: &str = "runnable.start";
    pub const RUNNABLE_STARTED: &str = "runnable.started";
    pub const RUNNABLE_STOP: &str = "runnable.stop";
    pub const RUNNABLE_STOPPED: &str = "runnable.stopped";
    pub const UI_DISCONNECTED: &str = "ui.disconnected";
    pub const UI_MESSAGE_NAMES_ADD: &str = "ui.message_names.add";
    pub const UI_MESSAGE_NAMES_DELETE: &str = "ui.message_names.delete";
    pub const UI_PING: &str = "ui.ping";
    pub const UI_REGISTER: &str = "ui.register";
    pub const UI_WELCOME: &str = "ui.welcome";
    pub const WORKER_DISCONNECTED: &str = "worker.disconnected";
    pub const WORKER_REGISTER: &str = "worker.register";
    pub const WORKER_REGISTERED: &str = "worker.registered";
    pub const WORKER_WELCOME: &str = "worker.welcome";

    /// Events every UI receives regardless of the names it registered for.
    pub const UI_BROADCAST: &[&str] = &[
        RUNNABLE_CRASHED,
        RUNNABLE_STARTED,
        RUNNABLE_STOPPED,
        UI_DISCONNECTED,
        WORKER_DISCONNECTED,
        WORKER_REGISTERED,
    ];

    pub fn is_ui_broadcast(name: &str) -> bool {
        UI_BROADCAST.contains(&name)
    }
}

/// Opaque message body: the raw JSON document exactly as produced by the sender.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn encode<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Self> {
        serde_json::to_vec(value).map(Self)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({})", String::from_utf8_lossy(&self.0))
    }
}

impl Serialize for Payload {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let raw: &RawValue = serde_json::from_slice(&self.0).map_err(S::Error::custom)?;
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Box::<RawValue>::deserialize(deserializer)?;
        Ok(Payload(raw.get().as_bytes().to_vec()))
    }
}

/// Wire envelope exchanged between workers, the index and UIs.
///
/// `Clone` is a deep copy, so handlers running concurrently on copies of the
/// same message never observe each other's changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub from: Identifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Identifier>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunnableInfo {
    #[serde(flatten)]
    pub metadata: Metadata,
    pub status: RunnableStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerInfo {
    pub name: String,
    #[serde(default)]
    pub addr: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runnables: Vec<RunnableInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerWelcome {
    #[serde(default)]
    pub workers: Vec<WorkerInfo>,
    #[serde(default)]
    pub ui_message_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UiWelcome {
    pub name: String,
    #[serde(default)]
    pub workers: Vec<WorkerInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UiRegister {
    #[serde(default)]
    pub message_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Listenables {
    pub runnable: String,
    #[serde(default)]
    pub names: Vec<String>,
}

fn ui_and_workers() -> Identifier {
    Identifier::of_types([IdentifierType::Ui, IdentifierType::Worker])
}

impl Message {
    pub fn new(from: Identifier, to: Option<Identifier>, name: impl Into<String>) -> Self {
        Self {
            from,
            to,
            name: name.into(),
            payload: None,
        }
    }

    pub fn with_payload<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        let payload = Payload::encode(value).map_err(|source| RelayError::Payload {
            name: self.name.clone(),
            source,
        })?;
        self.payload = Some(payload);
        Ok(self)
    }

    /// Decodes the payload; a missing payload decodes as JSON `null`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        let decoded = match &self.payload {
            Some(payload) => payload.decode(),
            None => serde_json::from_slice(b"null"),
        };
        decoded.map_err(|source| RelayError::Payload {
            name: self.name.clone(),
            source,
        })
    }

    fn expect_name(&self, expected: &str) -> Result<()> {
        if self.name != expected {
            return Err(RelayError::UnexpectedMessage {
                expected: expected.to_string(),
                actual: self.name.clone(),
            });
        }
        Ok(())
    }

    fn parse<T: DeserializeOwned>(&self, expected: &str) -> Result<T> {
        self.expect_name(expected)?;
        self.decode_payload()
    }

    pub fn worker_register(info: &WorkerInfo) -> Result<Self> {
        Self::new(
            Identifier::worker(&info.name),
            Some(Identifier::index()),
            names::WORKER_REGISTER,
        )
        .with_payload(info)
    }

    pub fn parse_worker_register(&self) -> Result<WorkerInfo> {
        self.parse(names::WORKER_REGISTER)
    }

    pub fn worker_welcome(worker: &str, welcome: &WorkerWelcome) -> Result<Self> {
        Self::new(
            Identifier::index(),
            Some(Identifier::worker(worker)),
            names::WORKER_WELCOME,
        )
        .with_payload(welcome)
    }

    pub fn parse_worker_welcome(&self) -> Result<WorkerWelcome> {
        self.parse(names::WORKER_WELCOME)
    }

    pub fn worker_registered(info: &WorkerInfo) -> Result<Self> {
        Self::new(
            Identifier::index(),
            Some(ui_and_workers()),
            names::WORKER_REGISTERED,
        )
        .with_payload(info)
    }

    pub fn parse_worker_registered(&self) -> Result<WorkerInfo> {
        self.parse(names::WORKER_REGISTERED)
    }

    pub fn worker_disconnected(worker: &str) -> Result<Self> {
        Self::new(
            Identifier::index(),
            Some(ui_and_workers()),
            names::WORKER_DISCONNECTED,
        )
        .with_payload(worker)
    }

    pub fn parse_worker_disconnected(&self) -> Result<String> {
        self.parse(names::WORKER_DISCONNECTED)
    }

    pub fn ui_ping(ui: &str) -> Self {
        Self::new(Identifier::ui(ui), Some(Identifier::index()), names::UI_PING)
    }

    pub fn ui_register(ui: &str, register: &UiRegister) -> Result<Self> {
        Self::new(Identifier::ui(ui), Some(Identifier::index()), names::UI_REGISTER)
            .with_payload(register)
    }

    pub fn parse_ui_register(&self) -> Result<UiRegister> {
        self.parse(names::UI_REGISTER)
    }

    pub fn ui_welcome(welcome: &UiWelcome) -> Result<Self> {
        Self::new(
            Identifier::index(),
            Some(Identifier::ui(&welcome.name)),
            names::UI_WELCOME,
        )
        .with_payload(welcome)
    }

    pub fn parse_ui_welcome(&self) -> Result<UiWelcome> {
        self.parse(names::UI_WELCOME)
    }

    pub fn ui_disconnected(ui: &str) -> Result<Self> {
        Self::new(
            Identifier::index(),
            Some(ui_and_workers()),
            names::UI_DISCONNECTED,
        )
        .with_payload(ui)
    }

    pub fn parse_ui_disconnected(&self) -> Result<String> {
        self.parse(names::UI_DISCONNECTED)
    }

    pub fn ui_message_names_add(message_names: &[String]) -> Result<Self> {
        Self::new(
            Identifier::index(),
            Some(Identifier::of_type(IdentifierType::Worker)),
            names::UI_MESSAGE_NAMES_ADD,
        )
        .with_payload(message_names)
    }

    pub fn parse_ui_message_names_add(&self) -> Result<Vec<String>> {
        self.parse(names::UI_MESSAGE_NAMES_ADD)
    }

    pub fn ui_message_names_delete(message_names: &[String]) -> Result<Self> {
        Self::new(
            Identifier::index(),
            Some(Identifier::of_type(IdentifierType::Worker)),
            names::UI_MESSAGE_NAMES_DELETE,
        )
        .with_payload(message_names)
    }

    pub fn parse_ui_message_names_delete(&self) -> Result<Vec<String>> {
        self.parse(names::UI_MESSAGE_NAMES_DELETE)
    }

    /// Command asking the owning worker to start `runnable`.
    pub fn runnable_start(from: Identifier, runnable: &Identifier) -> Result<Self> {
        let name = runnable.name.clone().unwrap_or_default();
        Self::new(from, Some(runnable.clone()), names::RUNNABLE_START).with_payload(&name)
    }

    pub fn parse_runnable_start(&self) -> Result<String> {
        self.parse(names::RUNNABLE_START)
    }

    pub fn runnable_stop(from: Identifier, runnable: &Identifier) -> Result<Self> {
        let name = runnable.name.clone().unwrap_or_default();
        Self::new(from, Some(runnable.clone()), names::RUNNABLE_STOP).with_payload(&name)
    }

    pub fn parse_runnable_stop(&self) -> Result<String> {
        self.parse(names::RUNNABLE_STOP)
    }

    pub fn runnable_started(runnable: Identifier) -> Self {
        Self::new(
            runnable,
            Some(Identifier::of_type(IdentifierType::Ui)),
            names::RUNNABLE_STARTED,
        )
    }

    pub fn runnable_stopped(runnable: Identifier) -> Self {
        Self::new(
            runnable,
            Some(Identifier::of_type(IdentifierType::Ui)),
            names::RUNNABLE_STOPPED,
        )
    }

    pub fn runnable_crashed(runnable: Identifier) -> Self {
        Self::new(
            runnable,
            Some(Identifier::of_type(IdentifierType::Ui)),
            names::RUNNABLE_CRASHED,
        )
    }

    pub fn listenables_register(
        worker: &str,
        runnable: Identifier,
        listenables: &Listenables,
    ) -> Result<Self> {
        Self::new(
            Identifier::worker(worker),
            Some(runnable),
            names::LISTENABLES_REGISTER,
        )
        .with_payload(listenables)
    }

    pub fn parse_listenables_register(&self) -> Result<Listenables> {
        self.parse(names::LISTENABLES_REGISTER)
    }
}
