use std::sync::Arc;
use std::thread;

use crate::core::command::CommandBuffer;
use crate::core::error::{Error, Result};
use crate::core::interface::{ExecutionResult, Interface, InterfaceFactory};
use crate::core::progress::Progress;
use crate::core::scripts;
use crate::log_status;

/// Runs an ordered list of script bodies against one interface session.
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    script_bodies: Vec<String>,
}

impl ScriptExecutor {
    pub fn new(script_bodies: Vec<String>) -> Self {
        ScriptExecutor { script_bodies }
    }

    /// Resolve script names or paths up front so a bad argument fails
    /// before any device is touched.
    pub fn from_scripts<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let bodies = names
            .iter()
            .map(|name| scripts::script_body(name.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(ScriptExecutor::new(bodies))
    }

    pub fn run(&self, interface: &mut dyn Interface) -> Result<Vec<ExecutionResult>> {
        let mut buffer = CommandBuffer::new();
        for body in &self.script_bodies {
            buffer.add_exec(body)?;
        }
        let groups = buffer.flush()?;
        interface.execute(&groups)
    }
}

/// Devices per worker batch: an even split, but never batches of one.
/// Single-device round trips waste the per-batch overhead, so tiny
/// splits are widened with a warning.
pub fn partition_size(total: usize, workers: usize) -> usize {
    let size = total.div_ceil(workers.max(1));
    if size < 2 {
        log_status!(
            "executor",
            "raising batch size from {} to 2 ({} devices over {} workers)",
            size,
            total,
            workers
        );
        return 2;
    }
    size
}

/// One interface session over the whole target set, no worker threads.
pub fn run_single(
    factory: &dyn InterfaceFactory,
    device_ids: Vec<String>,
    executor: &ScriptExecutor,
) -> Result<Vec<ExecutionResult>> {
    let progress = Arc::new(Progress::new(device_ids.len()));
    let mut interface = factory.create(device_ids, progress);
    interface.open()?;
    let results = executor.run(interface.as_mut());
    interface.close();
    results
}

/// Splits the target set into batches and runs them on worker threads,
/// one interface session per batch.
pub struct ParallelExecutor {
    device_ids: Vec<String>,
    factory: Arc<dyn InterfaceFactory>,
    executor: ScriptExecutor,
    workers: usize,
}

impl ParallelExecutor {
    pub fn new(
        device_ids: Vec<String>,
        factory: Arc<dyn InterfaceFactory>,
        executor: ScriptExecutor,
        workers: usize,
    ) -> Self {
        ParallelExecutor {
            device_ids,
            factory,
            executor,
            workers,
        }
    }

    pub fn run(&self) -> Result<Vec<ExecutionResult>> {
        if self.device_ids.is_empty() {
            return Ok(Vec::new());
        }
        let size = partition_size(self.device_ids.len(), self.workers);
        let progress = Arc::new(Progress::new(self.device_ids.len()));
        log_status!(
            "executor",
            "dispatching {} device(s) in batches of {}",
            self.device_ids.len(),
            size
        );

        let mut handles = Vec::new();
        for chunk in self.device_ids.chunks(size) {
            let factory = Arc::clone(&self.factory);
            let executor = self.executor.clone();
            let progress = Arc::clone(&progress);
            let batch = chunk.to_vec();
            handles.push(thread::spawn(move || -> Result<Vec<ExecutionResult>> {
                let mut interface = factory.create(batch, progress);
                interface.open()?;
                let results = executor.run(interface.as_mut());
                interface.close();
                results
            }));
        }

        let mut results = Vec::with_capacity(self.device_ids.len());
        let mut first_error = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(batch)) => results.extend(batch),
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some(Error::Other("worker thread panicked".into()));
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::CommandGroup;
    use std::sync::Mutex;

    struct FakeInterface {
        device_ids: Vec<String>,
        seen: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl Interface for FakeInterface {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }

        fn execute(&mut self, groups: &[CommandGroup]) -> Result<Vec<ExecutionResult>> {
            assert!(!groups.is_empty());
            self.seen.lock().unwrap().push(self.device_ids.clone());
            Ok(self
                .device_ids
                .iter()
                .map(|id| ExecutionResult {
                    device_id: id.clone(),
                    return_code: Some(0),
                    success: true,
                    stdout: None,
                    stderr: None,
                })
                .collect())
        }

        fn close(&mut self) {}

        fn device_ids(&self) -> &[String] {
            &self.device_ids
        }
    }

    struct FakeFactory {
        seen: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl InterfaceFactory for FakeFactory {
        fn create(&self, device_ids: Vec<String>, _progress: Arc<Progress>) -> Box<dyn Interface> {
            Box::new(FakeInterface {
                device_ids,
                seen: Arc::clone(&self.seen),
            })
        }
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("aaaaaaaaa{i:03}")).collect()
    }

    #[test]
    fn partition_splits_evenly_with_remainder_up_front() {
        assert_eq!(partition_size(7, 2), 4);
        assert_eq!(partition_size(100, 3), 34);
        assert_eq!(partition_size(10, 10), 2);
    }

    #[test]
    fn partition_never_goes_below_two() {
        assert_eq!(partition_size(3, 8), 2);
        assert_eq!(partition_size(1, 1), 2);
    }

    #[test]
    fn parallel_run_covers_every_device_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let factory = Arc::new(FakeFactory {
            seen: Arc::clone(&seen),
        });
        let executor = ScriptExecutor::new(vec!["exit 0".into()]);
        let parallel = ParallelExecutor::new(ids(7), factory, executor, 2);

        let mut results: Vec<String> = parallel
            .run()
            .unwrap()
            .into_iter()
            .map(|r| r.device_id)
            .collect();
        results.sort();
        let mut expected = ids(7);
        expected.sort();
        assert_eq!(results, expected);

        let batches = seen.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 7);
    }

    #[test]
    fn single_run_uses_one_session() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let factory = FakeFactory {
            seen: Arc::clone(&seen),
        };
        let executor = ScriptExecutor::new(vec!["exit 0".into()]);
        let results = run_single(&factory, ids(5), &executor).unwrap();
        assert_eq!(results.len(), 5);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn unknown_embedded_script_fails_up_front() {
        let err = ScriptExecutor::from_scripts(&["definitely-missing.sh"]).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
