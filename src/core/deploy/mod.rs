//! Deploy-campaign orchestration: predeploy fleet preparation, waiting
//! out the deploy and install windows, then post-deploy remediation.
//! Every step persists to the campaign state file first, so an
//! interrupted run resumes where it stopped.

use std::path::PathBuf;
use std::sync::Arc;

use crate::core::compute;
use crate::core::deploy::generator::{
    ChunkGenerator, Clock, ImmediateGenerator, OvertimeGenerator, ResizedChunks,
};
use crate::core::deploy::state::{CampaignState, DeployType};
use crate::core::device;
use crate::core::error::{Error, Result};
use crate::core::executor::{self, ParallelExecutor, ScriptExecutor};
use crate::core::interface::{ExecutionResult, InterfaceFactory};
use crate::core::output;
use crate::core::scripts;
use crate::core::search::{SearchClient, TimeWindow};
use crate::core::targeting;
use crate::log_status;

pub mod generator;
pub mod state;

const PREDEPLOY: &str = "predeploy";
const POSTDEPLOY: &str = "postdeploy";

/// Lookback of the predeploy connectivity query, in seconds.
const CONNECTIVITY_LOOKBACK: u64 = 86_400;

const DEFAULT_SAFETY_TIME_BUFFER: f64 = 15.0 * 60.0;
const DEFAULT_INSTALL_TIME: f64 = 16.0 * 60.0;
const DEFAULT_SEARCH_DELAY: f64 = 5.0 * 60.0;
const DEFAULT_BATCH_SIZE: usize = 7_500;

/// One remediation of a phase: a target set and the script to run on
/// its members.
struct ActionPlan {
    name: &'static str,
    targets: Vec<String>,
    executor: ScriptExecutor,
}

pub struct Campaign {
    pub state: CampaignState,
    /// Transport the remediation scripts run over.
    pub factory: Arc<dyn InterfaceFactory>,
    /// Tunnel transport for the reachability scan.
    pub tunnel_factory: Arc<dyn InterfaceFactory>,
    pub search: SearchClient,
    /// 0 runs everything in one interface session.
    pub workers: usize,
    pub output: Option<PathBuf>,
    pub clock: Arc<dyn Clock>,
}

impl Campaign {
    pub fn run(self) -> Result<()> {
        let Campaign {
            mut state,
            factory,
            tunnel_factory,
            search,
            workers,
            output,
            clock,
        } = self;

        if state.finished {
            log_status!("deploy", "campaign {} already finished", state.path().display());
            return Ok(());
        }

        let deploy_type = state
            .deploy_type
            .ok_or_else(|| Error::Config("campaign has no deploy type".into()))?;
        let registry = state.device_registry.clone();
        let start_time = state
            .start_time
            .ok_or_else(|| Error::Config("campaign has no start time".into()))?;
        let span = state.span_time;
        let safety = state.safety_time_buffer.unwrap_or(DEFAULT_SAFETY_TIME_BUFFER);
        let install = state.install_time.unwrap_or(DEFAULT_INSTALL_TIME);
        let search_delay = state.search_delay.unwrap_or(DEFAULT_SEARCH_DELAY);
        let batch_size = state.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        let dry_run = state.dry_run;

        let script_for = |script: &'static str| if dry_run { "nop.sh" } else { script };

        let mut exec = |action: &str,
                        devices: Vec<String>,
                        script: &ScriptExecutor|
         -> Result<Vec<ExecutionResult>> {
            log_status!("deploy", "{}: dispatching {} device(s)", action, devices.len());
            let results = if workers > 0 {
                ParallelExecutor::new(devices, Arc::clone(&factory), script.clone(), workers)
                    .run()?
            } else {
                executor::run_single(factory.as_ref(), devices, script)?
            };
            if let Some(out) = &output {
                output::append_results(&output::with_suffix(out, action), &results)?;
            }
            Ok(results)
        };

        // Predeploy: reboot devices with recent connectivity trouble and
        // kick the tunnel service on unreachable ones, ahead of each
        // device's deploy moment.
        let connectivity = resolve_targets(&mut state, PREDEPLOY, "connectivity-issues", || {
            targeting::fetch_query_ids(
                &search,
                Some(&registry),
                &scripts::query_body("connectivity-issues.query")?,
                TimeWindow::Trailing(CONNECTIVITY_LOOKBACK),
            )
        })?;
        let unreachable = resolve_targets(&mut state, PREDEPLOY, "unreachable", || {
            targeting::fetch_unreachable(&registry, tunnel_factory.as_ref())
        })?;
        let predeploy_actions = vec![
            ActionPlan {
                name: "connectivity-issues",
                targets: connectivity,
                executor: ScriptExecutor::from_scripts(&[script_for("reboot.sh")])?,
            },
            ActionPlan {
                name: "unreachable",
                targets: unreachable,
                executor: ScriptExecutor::from_scripts(&[script_for("tunnel_start.sh")])?,
            },
        ];

        match deploy_type {
            DeployType::Full => {
                let span = span
                    .ok_or_else(|| Error::Config("full deploy needs a span time".into()))?;
                let now = clock.now_unix();
                let phase_start =
                    state.phase_start_time("ot_deploy_generator_start_time_predeploy", now);
                state.save()?;
                let generator = OvertimeGenerator::new(
                    &registry,
                    start_time,
                    phase_start,
                    span,
                    safety,
                    true,
                    Arc::clone(&clock),
                )?;
                run_activity(
                    &mut state,
                    PREDEPLOY,
                    &predeploy_actions,
                    generator,
                    batch_size,
                    registry.len(),
                    &mut exec,
                )?;
            }
            DeployType::Targeted => {
                let generator = ImmediateGenerator::new(
                    registry.clone(),
                    start_time,
                    safety,
                    true,
                    Arc::clone(&clock),
                );
                run_activity(
                    &mut state,
                    PREDEPLOY,
                    &predeploy_actions,
                    generator,
                    batch_size,
                    registry.len(),
                    &mut exec,
                )?;
            }
        }

        // Waits are anchored to the absolute start time, not to "now",
        // so a resumed campaign never waits for time already spent.
        let mut elapsed = 0.0;
        wait_until(&mut state, clock.as_ref(), "deploy start", start_time + elapsed)?;
        if deploy_type == DeployType::Full {
            elapsed += span.unwrap_or(0.0);
            wait_until(&mut state, clock.as_ref(), "deploy span", start_time + elapsed)?;
        }
        elapsed += install;
        wait_until(&mut state, clock.as_ref(), "install window", start_time + elapsed)?;
        elapsed += search_delay;
        wait_until(&mut state, clock.as_ref(), "log ingestion", start_time + elapsed)?;

        // Postdeploy: reboot devices whose agent did not come back
        // healthy after the install window.
        let health = resolve_targets(&mut state, POSTDEPLOY, "post-deploy-health", || {
            let window = TimeWindow::absolute(start_time, clock.now_unix())?;
            targeting::fetch_query_ids(
                &search,
                Some(&registry),
                &scripts::query_body("post-deploy-health.query")?,
                window,
            )
        })?;
        let postdeploy_actions = vec![ActionPlan {
            name: "post-deploy-health",
            targets: health,
            executor: ScriptExecutor::from_scripts(&[script_for("reboot.sh")])?,
        }];
        let generator =
            ImmediateGenerator::new(registry.clone(), start_time, safety, false, Arc::clone(&clock));
        run_activity(
            &mut state,
            POSTDEPLOY,
            &postdeploy_actions,
            generator,
            batch_size,
            registry.len(),
            &mut exec,
        )?;

        state.finished = true;
        state.save()?;
        log_status!("deploy", "campaign {} finished", state.path().display());
        Ok(())
    }
}

/// Per-activity targets are fetched once and persisted, so a resumed
/// campaign works the exact set the original run committed to.
fn resolve_targets<F>(
    state: &mut CampaignState,
    phase: &str,
    name: &str,
    fetch: F,
) -> Result<Vec<String>>
where
    F: FnOnce() -> Result<Vec<String>>,
{
    if let Some(targets) = state
        .activities
        .get(phase)
        .and_then(|a| a.targets.get(name))
    {
        return Ok(targets.clone());
    }
    let targets = fetch()?;
    log_status!("deploy", "{}/{}: {} target(s)", phase, name, targets.len());
    state
        .activity(phase)
        .targets
        .insert(name.to_string(), targets.clone());
    state.save()?;
    Ok(targets)
}

fn run_activity<G, F>(
    state: &mut CampaignState,
    phase: &str,
    actions: &[ActionPlan],
    generator: G,
    batch_size: usize,
    total: usize,
    exec: &mut F,
) -> Result<()>
where
    G: ChunkGenerator,
    F: FnMut(&str, Vec<String>, &ScriptExecutor) -> Result<Vec<ExecutionResult>>,
{
    let offset = state.activity(phase).offset;
    if offset > 0 {
        log_status!("deploy", "{}: resuming past {} device(s)", phase, offset);
    }
    let mut chunks = ResizedChunks::new(generator, batch_size, offset);
    while let Some(batch) = chunks.next_batch() {
        for action in actions {
            let targets = device::registry_select(&action.targets, &batch);
            if targets.is_empty() {
                continue;
            }
            let results = exec(action.name, targets, &action.executor)?;
            let failed: Vec<String> = results
                .iter()
                .filter(|r| !r.success)
                .map(|r| r.device_id.clone())
                .collect();
            if !failed.is_empty() {
                state
                    .activity(phase)
                    .failed_targets
                    .entry(action.name.to_string())
                    .or_default()
                    .extend(failed);
            }
        }
        let activity = state.activity(phase);
        activity.offset += batch.len();
        let processed = activity.offset;
        let failed: usize = activity.failed_targets.values().map(Vec::len).sum();
        log_status!(
            "deploy",
            "{}: {} / {} device(s) ({:.1}%), {} failed",
            phase,
            processed,
            total,
            compute::perc(processed, total.max(1)),
            failed
        );
        state.save()?;
    }
    Ok(())
}

fn wait_until(
    state: &mut CampaignState,
    clock: &dyn Clock,
    label: &str,
    target: f64,
) -> Result<()> {
    let delay = target - clock.now_unix();
    if delay > 0.0 {
        log_status!("deploy", "waiting {:.0}s for the {}", delay, label);
        clock.sleep(delay);
    } else {
        log_status!("deploy", "{} passed {:.0}s ago", label, -delay);
    }
    state.save()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct ListGenerator {
        chunks: Vec<Vec<String>>,
    }

    impl ChunkGenerator for ListGenerator {
        fn next_chunk(&mut self) -> Option<Vec<String>> {
            if self.chunks.is_empty() {
                None
            } else {
                Some(self.chunks.remove(0))
            }
        }

        fn wait(&mut self) {}
    }

    fn ids(range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|i| format!("00000000{i:04x}")).collect()
    }

    fn state_in(dir: &std::path::Path) -> CampaignState {
        CampaignState::load_or_create(Some(&dir.join("state.json")), DeployType::Full).unwrap()
    }

    fn ok_results(devices: &[String]) -> Vec<ExecutionResult> {
        devices
            .iter()
            .map(|id| ExecutionResult {
                device_id: id.clone(),
                return_code: Some(0),
                success: true,
                stdout: None,
                stderr: None,
            })
            .collect()
    }

    #[test]
    fn activity_intersects_batches_with_action_targets() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        let all = ids(0..10);
        let actions = vec![ActionPlan {
            name: "connectivity-issues",
            targets: ids(0..4),
            executor: ScriptExecutor::new(vec!["exit 0".into()]),
        }];
        let generator = ListGenerator {
            chunks: all.chunks(5).map(|c| c.to_vec()).collect(),
        };

        let dispatched = Mutex::new(Vec::new());
        let mut exec = |_: &str, devices: Vec<String>, _: &ScriptExecutor| {
            let results = ok_results(&devices);
            dispatched.lock().unwrap().push(devices);
            Ok(results)
        };
        run_activity(&mut state, PREDEPLOY, &actions, generator, 5, 10, &mut exec).unwrap();

        let dispatched = dispatched.into_inner().unwrap();
        // Second batch has no overlap with the action targets.
        assert_eq!(dispatched, vec![ids(0..4)]);
        assert_eq!(state.activity(PREDEPLOY).offset, 10);
    }

    #[test]
    fn activity_accumulates_failed_targets_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        let all = ids(0..6);
        let actions = vec![ActionPlan {
            name: "unreachable",
            targets: all.clone(),
            executor: ScriptExecutor::new(vec!["exit 0".into()]),
        }];
        let generator = ListGenerator {
            chunks: all.chunks(3).map(|c| c.to_vec()).collect(),
        };

        let mut exec = |_: &str, devices: Vec<String>, _: &ScriptExecutor| {
            let mut results = ok_results(&devices);
            results[0].success = false;
            Ok(results)
        };
        run_activity(&mut state, PREDEPLOY, &actions, generator, 3, 6, &mut exec).unwrap();

        let failed = &state.activity(PREDEPLOY).failed_targets["unreachable"];
        assert_eq!(failed.len(), 2);

        // The state on disk matches what is in memory.
        let reloaded =
            CampaignState::load_or_create(Some(state.path()), DeployType::Full).unwrap();
        assert_eq!(reloaded.activities[PREDEPLOY].offset, 6);
        assert_eq!(
            reloaded.activities[PREDEPLOY].failed_targets["unreachable"].len(),
            2
        );
    }

    #[test]
    fn resumed_activity_skips_processed_devices() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        let all = ids(0..8);
        state.activity(PREDEPLOY).offset = 5;
        let actions = vec![ActionPlan {
            name: "connectivity-issues",
            targets: all.clone(),
            executor: ScriptExecutor::new(vec!["exit 0".into()]),
        }];
        let generator = ListGenerator {
            chunks: all.chunks(2).map(|c| c.to_vec()).collect(),
        };

        let dispatched = Mutex::new(Vec::new());
        let mut exec = |_: &str, devices: Vec<String>, _: &ScriptExecutor| {
            let results = ok_results(&devices);
            dispatched.lock().unwrap().extend(devices);
            Ok(results)
        };
        run_activity(&mut state, PREDEPLOY, &actions, generator, 2, 8, &mut exec).unwrap();

        assert_eq!(dispatched.into_inner().unwrap(), all[5..].to_vec());
        assert_eq!(state.activity(PREDEPLOY).offset, 8);
    }

    #[test]
    fn resolved_targets_are_persisted_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        let mut calls = 0;

        let first = resolve_targets(&mut state, PREDEPLOY, "connectivity-issues", || {
            calls += 1;
            Ok(ids(0..3))
        })
        .unwrap();
        let second = resolve_targets(&mut state, PREDEPLOY, "connectivity-issues", || {
            calls += 1;
            Ok(ids(0..9))
        })
        .unwrap();

        assert_eq!(first, second);
        assert_eq!(calls, 1);
    }

    #[test]
    fn wait_targets_are_absolute() {
        struct FrozenClock {
            now: f64,
            slept: Mutex<Vec<f64>>,
        }
        impl Clock for FrozenClock {
            fn now_unix(&self) -> f64 {
                self.now
            }
            fn sleep(&self, seconds: f64) {
                self.slept.lock().unwrap().push(seconds);
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        let clock = FrozenClock {
            now: 1_000.0,
            slept: Mutex::new(Vec::new()),
        };

        wait_until(&mut state, &clock, "deploy start", 1_250.0).unwrap();
        wait_until(&mut state, &clock, "install window", 900.0).unwrap();
        assert_eq!(*clock.slept.lock().unwrap(), vec![250.0]);
    }

    #[test]
    fn failed_targets_survive_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        state.activity(POSTDEPLOY).failed_targets = HashMap::from([(
            "post-deploy-health".to_string(),
            ids(0..2),
        )]);
        state.save().unwrap();

        let reloaded =
            CampaignState::load_or_create(Some(state.path()), DeployType::Full).unwrap();
        assert_eq!(
            reloaded.activities[POSTDEPLOY].failed_targets["post-deploy-health"],
            ids(0..2)
        );
    }
}
