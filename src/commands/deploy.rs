use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;

use crate::commands::{InterfaceArgs, Transport};
use crate::core::deploy::generator::SystemClock;
use crate::core::deploy::state::{CampaignState, DeployType};
use crate::core::deploy::Campaign;
use crate::core::error::{Error, Result};
use crate::core::registry;
use crate::core::search::{self, SearchClient};
use crate::core::targeting;
use crate::log_status;

/// Orchestrate a deploy campaign over the fleet.
#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Deploy flavor.
    #[arg(value_enum)]
    pub deploy_type: DeployType,

    /// Registry snapshot (full) or CSV record file (targeted) naming
    /// the campaign devices.
    pub device_registry: PathBuf,

    /// Deploy start as unix seconds.
    #[arg(long)]
    pub start_time: f64,

    /// Deploy span in seconds, full deploys only.
    #[arg(long)]
    pub span_time: Option<f64>,

    /// Resume from (or create) this state file.
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// Seconds an activity needs before a device deploys.
    #[arg(long)]
    pub safety_time_buffer: Option<f64>,

    /// Seconds the install takes after the deploy window.
    #[arg(long)]
    pub install_time: Option<f64>,

    /// Seconds to wait for log ingestion before the health query.
    #[arg(long)]
    pub search_delay: Option<f64>,

    /// Devices per executor batch.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Run the campaign without touching any device.
    #[arg(long)]
    pub dry_run: bool,

    /// Worker threads per activity batch.
    #[arg(long, short)]
    pub workers: Option<usize>,

    /// Append results to this CSV file, one per activity action.
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Path to the search credentials file.
    #[arg(long)]
    pub search_creds: Option<PathBuf>,

    #[command(flatten)]
    pub interface: InterfaceArgs,
}

pub fn run(args: &DeployArgs) -> Result<u8> {
    let mut state = CampaignState::load_or_create(args.state_file.as_deref(), args.deploy_type)?;
    populate(&mut state, args)?;
    validate(&state)?;
    state.save()?;

    let tunnel_factory = args.interface.tunnel_factory()?;
    let factory = args.interface.factory(Transport::Rpc)?;
    let search = SearchClient::new(search::load_config(args.search_creds.as_deref())?);

    Campaign {
        state,
        factory,
        tunnel_factory,
        search,
        workers: args.workers.unwrap_or(0),
        output: args.output.clone(),
        clock: Arc::new(SystemClock),
    }
    .run()?;
    Ok(0)
}

/// Arguments only fill state fields a resumed campaign has not already
/// committed to, so a resume cannot silently reshape the plan.
fn populate(state: &mut CampaignState, args: &DeployArgs) -> Result<()> {
    if state.deploy_type.is_none() {
        state.deploy_type = Some(args.deploy_type);
    }
    if state.device_registry.is_empty() {
        state.device_registry = match args.deploy_type {
            DeployType::Full => {
                registry::parse_snapshot(&fs::read_to_string(&args.device_registry)?)?
            }
            DeployType::Targeted => targeting::load_record_file(&args.device_registry)?,
        };
    }
    if state.start_time.is_none() {
        state.start_time = Some(args.start_time);
    }
    if state.span_time.is_none() {
        state.span_time = args.span_time;
    }
    if state.safety_time_buffer.is_none() {
        state.safety_time_buffer = args.safety_time_buffer;
    }
    if state.install_time.is_none() {
        state.install_time = args.install_time;
    }
    if state.search_delay.is_none() {
        state.search_delay = args.search_delay;
    }
    if state.batch_size.is_none() {
        state.batch_size = args.batch_size;
    }
    state.dry_run |= args.dry_run;
    Ok(())
}

fn validate(state: &CampaignState) -> Result<()> {
    if state.device_registry.is_empty() {
        return Err(Error::Targeting("the campaign registry is empty".into()));
    }
    match state.deploy_type {
        Some(DeployType::Full) if state.span_time.is_none() => Err(Error::Config(
            "a full deploy needs --span-time".into(),
        )),
        Some(DeployType::Targeted) => {
            if state.span_time.is_some() {
                log_status!("deploy", "span time is ignored for targeted deploys");
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
