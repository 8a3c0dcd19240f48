mod record;
mod registry;
mod state;

pub use record::{Job, JobId};
pub use registry::JobRegistry;
pub use state::JobStatus;
