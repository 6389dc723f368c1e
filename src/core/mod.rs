// Public modules
pub mod command;
pub mod compute;
pub mod deploy;
pub mod device;
pub mod error;
pub mod executor;
pub mod interface;
pub mod output;
pub mod progress;
pub mod ratelimit;
pub mod registry;
pub mod scripts;
pub mod search;
pub mod targeting;

// Re-export common types for convenience
pub use error::{Error, Result};
pub use interface::{ExecutionResult, Interface, InterfaceFactory};
