mod channel;
mod types;

pub use channel::{DEFAULT_REPLAY, EventChannel, EventSubscription};
pub use types::{ProgressEvent, ProgressKind, Severity};
