use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::core::error::{Error, Result};
use crate::core::interface::rpc::{self, RpcFactory};
use crate::core::interface::tunnel::{IndexSpec, TunnelFactory};
use crate::core::interface::InterfaceFactory;
use crate::core::ratelimit::RateLimit;
use crate::core::search::TimeWindow;
use crate::core::targeting::ResolveOptions;

pub mod deploy;
pub mod script;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    /// Batched execution through the jump hosts.
    Tunnel,
    /// Per-device calls through the RPC service.
    Rpc,
}

/// Transport selection shared by every command.
#[derive(Args, Debug)]
pub struct InterfaceArgs {
    /// Transport used to reach devices.
    #[arg(long, value_enum)]
    pub interface: Option<Transport>,

    /// Always use the jump host with this index.
    #[arg(long)]
    pub tunnel_index: Option<u32>,

    /// Pick jump hosts from this index range.
    #[arg(long, num_args = 2, value_names = ["FIRST", "LAST"])]
    pub tunnel_range: Option<Vec<u32>>,

    /// Hostname prefix of the jump hosts.
    #[arg(long, default_value = "fleet-tunnel")]
    pub tunnel_host_prefix: String,

    /// Minimum milliseconds between jump-host round trips.
    #[arg(long, default_value_t = 250)]
    pub tunnel_rate_ms: u64,

    /// Minimum milliseconds between RPC calls.
    #[arg(long, default_value_t = 100)]
    pub rpc_rate_ms: u64,

    /// Path to the RPC credentials file.
    #[arg(long)]
    pub rpc_creds: Option<PathBuf>,

    /// Credentials environment to use.
    #[arg(long, default_value = "prod")]
    pub rpc_env: String,
}

impl InterfaceArgs {
    pub fn transport_or(&self, default: Transport) -> Transport {
        self.interface.unwrap_or(default)
    }

    pub fn tunnel_factory(&self) -> Result<Arc<TunnelFactory>> {
        let spec = match (self.tunnel_index, &self.tunnel_range) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "--tunnel-index and --tunnel-range are mutually exclusive".into(),
                ));
            }
            (Some(index), None) => IndexSpec::Fixed(index),
            (None, Some(range)) => IndexSpec::Range(range[0], range[1]),
            (None, None) => IndexSpec::Auto,
        };
        let rate = Arc::new(RateLimit::new(Duration::from_millis(self.tunnel_rate_ms)));
        Ok(Arc::new(TunnelFactory::new(
            &self.tunnel_host_prefix,
            spec,
            rate,
        )?))
    }

    /// The execution transport, falling back to the command's default
    /// when `--interface` is not given.
    pub fn factory(&self, default: Transport) -> Result<Arc<dyn InterfaceFactory>> {
        match self.transport_or(default) {
            Transport::Tunnel => {
                let factory: Arc<dyn InterfaceFactory> = self.tunnel_factory()?;
                Ok(factory)
            }
            Transport::Rpc => {
                let creds = rpc::load_credentials(self.rpc_creds.as_deref(), &self.rpc_env)?;
                let rate = Arc::new(RateLimit::new(Duration::from_millis(self.rpc_rate_ms)));
                Ok(Arc::new(RpcFactory::new(creds, rate)))
            }
        }
    }
}

/// Targeting guard rails and query inputs shared by every command.
#[derive(Args, Debug)]
pub struct TargetingArgs {
    /// Refuse to touch more devices than this.
    #[arg(long, default_value_t = 32)]
    pub devices_limit: usize,

    /// Keep only the first devices-limit targets instead of refusing.
    #[arg(long)]
    pub truncate: bool,

    /// Proceed past the devices limit.
    #[arg(long)]
    pub force: bool,

    /// Query window trailing this many seconds from now.
    #[arg(long)]
    pub query_offset: Option<u64>,

    /// Absolute query window as unix seconds.
    #[arg(long, num_args = 2, value_names = ["START", "END"])]
    pub query_window: Option<Vec<f64>>,

    /// Path to the search credentials file.
    #[arg(long)]
    pub search_creds: Option<PathBuf>,

    /// Registry snapshot bucket, enables registry intersection.
    #[arg(long)]
    pub registry_bucket: Option<String>,
}

impl TargetingArgs {
    pub fn window(&self) -> Result<Option<TimeWindow>> {
        match (&self.query_window, self.query_offset) {
            (Some(_), Some(_)) => Err(Error::Config(
                "--query-window and --query-offset are mutually exclusive".into(),
            )),
            (Some(window), None) => Ok(Some(TimeWindow::absolute(window[0], window[1])?)),
            (None, Some(offset)) => Ok(Some(TimeWindow::Trailing(offset))),
            (None, None) => Ok(None),
        }
    }

    pub fn options(&self) -> ResolveOptions {
        ResolveOptions {
            devices_limit: self.devices_limit,
            truncate: self.truncate,
            force: self.force,
        }
    }
}
