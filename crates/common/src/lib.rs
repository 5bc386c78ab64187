//! vmctl Common Library
//!
//! Claims, the operation allow-list and the virsh executor shared by the
//! vmctl service.

pub mod error;
pub mod types;
pub mod virsh;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use virsh::{CommandRunner, ExecutorSettings, ProcessRunner, VirshExecutor};

/// vmctl version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
