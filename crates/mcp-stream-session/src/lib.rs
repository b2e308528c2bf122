//! Session registration and supervision for streamable HTTP servers.
//!
//! Provides:
//! - `SessionRegistry` - Exclusive-creation map of live sessions
//! - `TaskSupervisor` - Cancellable scope owning one task per session

pub mod registry;
pub mod supervisor;

pub use registry::{RegistryError, Session, SessionRegistry};
pub use supervisor::{DEFAULT_SHUTDOWN_TIMEOUT, SupervisorError, TaskSupervisor};
