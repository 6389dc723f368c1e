use std::sync::Arc;

use serde::Serialize;

use crate::core::command::CommandGroup;
use crate::core::error::Result;
use crate::core::progress::Progress;

pub mod rpc;
pub mod tunnel;

/// Outcome of one batch run for one device. `return_code` is None when
/// the device never produced one, e.g. the transport died mid-flight.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub device_id: String,
    pub return_code: Option<i32>,
    pub success: bool,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl ExecutionResult {
    pub fn unreachable(device_id: &str, stderr: String) -> Self {
        ExecutionResult {
            device_id: device_id.to_string(),
            return_code: None,
            success: false,
            stdout: None,
            stderr: Some(stderr),
        }
    }
}

/// A transport to a set of devices. Implementations own their batch of
/// device ids for the lifetime of a session: open once, execute any
/// number of times, close once.
pub trait Interface: Send {
    fn open(&mut self) -> Result<()>;

    /// Runs the command groups on every device in the batch, in order.
    /// A retryable transport failure surfaces as `Error::Interface`.
    fn execute(&mut self, groups: &[CommandGroup]) -> Result<Vec<ExecutionResult>>;

    fn close(&mut self);

    fn device_ids(&self) -> &[String];

    /// Subset of this batch currently reachable. Only transports that
    /// can observe liveness implement it.
    fn get_online(&mut self) -> Result<Vec<String>> {
        Err(crate::core::error::Error::Config(
            "this interface cannot report online devices".into(),
        ))
    }
}

/// Builds interfaces for worker batches. Factories carry the shared
/// pieces (credentials, rate limiter, progress) so parallel workers stay
/// coordinated.
pub trait InterfaceFactory: Send + Sync {
    fn create(&self, device_ids: Vec<String>, progress: Arc<Progress>) -> Box<dyn Interface>;
}
