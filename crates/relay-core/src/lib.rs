pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod identifier;
pub mod listenable;
pub mod logging;
pub mod message;
pub mod runnable;
pub mod sync;

pub use dispatcher::{DispatchCondition, Dispatcher, DispatcherConfig};
pub use error::{LifecycleError, RelayError, Result};
pub use identifier::{Identifier, IdentifierType};
pub use listenable::Listenable;
pub use message::{names, Message, Payload};
pub use runnable::{
    Capabilities, Dispatch, FnRunnable, Lifecycle, Metadata, Runnable, RunnableStatus,
};
