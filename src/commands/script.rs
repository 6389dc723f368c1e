use std::path::PathBuf;

use clap::Args;

use crate::commands::{InterfaceArgs, TargetingArgs, Transport};
use crate::core::error::{Error, Result};
use crate::core::executor::{self, ParallelExecutor, ScriptExecutor};
use crate::core::interface::InterfaceFactory;
use crate::core::output;
use crate::core::targeting::{Resolver, UNREACHABLE_KEYWORD};
use crate::log_status;
use std::sync::Arc;

/// Run scripts on a set of devices.
#[derive(Args, Debug)]
pub struct ScriptArgs {
    /// Targets: a CSV record file, a query name or path, or
    /// targeting:unreachable.
    pub targeting: String,

    /// Scripts to run, in order. Embedded names or paths.
    #[arg(long, short, num_args = 1.., required = true)]
    pub script: Vec<String>,

    /// Worker threads. Without it everything runs in one session.
    #[arg(long, short)]
    pub workers: Option<usize>,

    /// Append results to this CSV file.
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub interface: InterfaceArgs,

    #[command(flatten)]
    pub targeting_args: TargetingArgs,
}

pub fn run(args: &ScriptArgs) -> Result<u8> {
    let transport = args.interface.transport_or(Transport::Tunnel);
    if args.targeting == UNREACHABLE_KEYWORD && transport == Transport::Tunnel {
        return Err(Error::Config(
            "unreachable devices have no tunnel to execute over, pass --interface rpc".into(),
        ));
    }

    let executor = ScriptExecutor::from_scripts(&args.script)?;
    let scan_factory: Arc<dyn InterfaceFactory> = args.interface.tunnel_factory()?;
    let resolver = Resolver {
        search_config_path: args.targeting_args.search_creds.clone(),
        registry_bucket: args.targeting_args.registry_bucket.clone(),
        env: args.interface.rpc_env.clone(),
        tunnel_factory: Some(scan_factory),
        options: args.targeting_args.options(),
    };
    let device_ids = resolver.resolve(&args.targeting, args.targeting_args.window()?)?;
    log_status!("script", "targeting {} device(s)", device_ids.len());

    let factory = args.interface.factory(Transport::Tunnel)?;
    let results = match args.workers {
        Some(workers) if workers > 0 => {
            ParallelExecutor::new(device_ids, factory, executor, workers).run()?
        }
        _ => executor::run_single(factory.as_ref(), device_ids, &executor)?,
    };

    if let Some(out) = &args.output {
        output::append_results(out, &results)?;
    }
    let failed = results.iter().filter(|r| !r.success).count();
    log_status!(
        "script",
        "{} device(s) succeeded, {} failed",
        results.len() - failed,
        failed
    );
    Ok(0)
}
