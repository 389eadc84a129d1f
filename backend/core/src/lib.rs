pub mod action;
pub mod error;
pub mod types;

pub use action::{Action, ActionMeta};
pub use error::{CapabilityError, ExtensionError, StartupError};
pub use types::{ExtensionId, ProcessRole, StatePath};
