use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};
use crate::log_status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeployType {
    /// Whole-fleet rollout spread over a span.
    Full,
    /// A handpicked set of devices, deployed immediately.
    Targeted,
}

impl fmt::Display for DeployType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployType::Full => write!(f, "full"),
            DeployType::Targeted => write!(f, "targeted"),
        }
    }
}

/// Per-activity bookkeeping inside the state file. `offset` counts
/// devices already handed to the executor, so a resumed campaign skips
/// what it already processed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityState {
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub targets: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub failed_targets: HashMap<String, Vec<String>>,
}

/// The whole campaign, persisted as JSON after every mutation. A crash
/// or interrupt at any point leaves a file the next run can resume from.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignState {
    #[serde(skip)]
    path: PathBuf,

    pub deploy_type: Option<DeployType>,
    pub device_registry: Vec<String>,
    pub batch_size: Option<usize>,
    pub start_time: Option<f64>,
    pub span_time: Option<f64>,
    pub safety_time_buffer: Option<f64>,
    pub install_time: Option<f64>,
    pub search_delay: Option<f64>,
    pub dry_run: bool,
    pub finished: bool,
    pub phase_start_times: HashMap<String, f64>,
    pub activities: HashMap<String, ActivityState>,
}

impl CampaignState {
    /// Load an existing state file, or start a fresh one. Without an
    /// explicit path a timestamped name is generated, stepping a numeric
    /// suffix past leftovers from earlier runs in the same minute.
    pub fn load_or_create(path: Option<&Path>, deploy_type: DeployType) -> Result<Self> {
        if let Some(path) = path {
            if path.is_file() {
                let body = fs::read_to_string(path)?;
                let mut state: CampaignState = serde_json::from_str(&body)?;
                state.path = path.to_path_buf();
                log_status!("deploy", "resuming campaign from {}", path.display());
                return Ok(state);
            }
            return Ok(Self::fresh(path.to_path_buf(), deploy_type));
        }
        Ok(Self::fresh(Self::generate_path(deploy_type)?, deploy_type))
    }

    fn fresh(path: PathBuf, deploy_type: DeployType) -> Self {
        CampaignState {
            path,
            deploy_type: Some(deploy_type),
            ..Default::default()
        }
    }

    fn generate_path(deploy_type: DeployType) -> Result<PathBuf> {
        let stamp = Local::now().format("%y%m%d%H%M");
        let base = format!("state-file-{deploy_type}-deploy-{stamp}");
        let candidate = PathBuf::from(format!("{base}.json"));
        if !candidate.exists() {
            return Ok(candidate);
        }
        for n in 1..=10 {
            let candidate = PathBuf::from(format!("{base}.{n}.json"));
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(Error::Config(format!(
            "no free state-file name after {base}.10.json"
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> Result<()> {
        let existed = self.path.is_file();
        fs::write(&self.path, serde_json::to_string_pretty(self)?)?;
        if !existed {
            log_status!("deploy", "created state file {}", self.path.display());
        }
        Ok(())
    }

    /// The persisted start time of a phase, recording `now` on first
    /// use. Resumed runs keep waiting relative to the original start.
    pub fn phase_start_time(&mut self, key: &str, now: f64) -> f64 {
        *self.phase_start_times.entry(key.to_string()).or_insert(now)
    }

    pub fn activity(&mut self, name: &str) -> &mut ActivityState {
        self.activities.entry(name.to_string()).or_default()
    }
}
