use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::core::command::CommandGroup;
use crate::core::device;
use crate::core::error::{Error, Result};
use crate::core::interface::{ExecutionResult, Interface, InterfaceFactory};
use crate::core::progress::Progress;
use crate::core::ratelimit::RateLimit;
use crate::core::scripts;
use crate::log_status;
use crate::utils::shell;

pub const FIRST_INDEX: u32 = 1;
pub const LAST_INDEX: u32 = 99;

/// How a batch picks its jump host.
#[derive(Debug, Clone, Copy)]
pub enum IndexSpec {
    Fixed(u32),
    Range(u32, u32),
    Auto,
}

/// Hands out host indices round-robin from a seeded counter, so repeated
/// runs spread load across jump hosts instead of always hitting the
/// first one.
#[derive(Debug)]
pub struct HostIndexGenerator {
    next: Mutex<u64>,
}

impl HostIndexGenerator {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0);
        Self::with_seed(seed)
    }

    pub fn with_seed(seed: u64) -> Self {
        HostIndexGenerator {
            next: Mutex::new(seed),
        }
    }

    pub fn next_in(&self, first: u32, last: u32) -> u32 {
        let mut next = self.next.lock().unwrap();
        let span = u64::from(last - first + 1);
        let index = first + (*next % span) as u32;
        // Seeds start anywhere in u64, so the counter has to wrap.
        *next = next.wrapping_add(1);
        index
    }
}

impl Default for HostIndexGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct TunnelFactory {
    host_prefix: String,
    index: IndexSpec,
    rate: Arc<RateLimit>,
    generator: HostIndexGenerator,
}

impl TunnelFactory {
    pub fn new(host_prefix: &str, index: IndexSpec, rate: Arc<RateLimit>) -> Result<Self> {
        match index {
            IndexSpec::Fixed(i) if !(FIRST_INDEX..=LAST_INDEX).contains(&i) => {
                return Err(Error::Config(format!(
                    "tunnel index {i} out of range {FIRST_INDEX}..={LAST_INDEX}"
                )));
            }
            IndexSpec::Range(a, b)
                if a > b || a < FIRST_INDEX || b > LAST_INDEX =>
            {
                return Err(Error::Config(format!(
                    "tunnel range {a}..{b} out of range {FIRST_INDEX}..={LAST_INDEX}"
                )));
            }
            _ => {}
        }
        Ok(TunnelFactory {
            host_prefix: host_prefix.to_string(),
            index,
            rate,
            generator: HostIndexGenerator::new(),
        })
    }

    fn pick_host(&self) -> String {
        let index = match self.index {
            IndexSpec::Fixed(i) => i,
            IndexSpec::Range(a, b) => self.generator.next_in(a, b),
            IndexSpec::Auto => self.generator.next_in(FIRST_INDEX, LAST_INDEX),
        };
        format!("{}-{:02}", self.host_prefix, index)
    }
}

impl InterfaceFactory for TunnelFactory {
    fn create(&self, device_ids: Vec<String>, progress: Arc<Progress>) -> Box<dyn Interface> {
        Box::new(TunnelInterface {
            host: self.pick_host(),
            device_ids,
            rate: Arc::clone(&self.rate),
            progress,
        })
    }
}

/// Runs command groups on a batch of devices through a shared jump
/// host. The whole batch ships as one archive, a driver script fans out
/// over the devices on the remote side, and the results come back as a
/// second archive. Each round trip goes through the rate limiter.
pub struct TunnelInterface {
    host: String,
    device_ids: Vec<String>,
    rate: Arc<RateLimit>,
    progress: Arc<Progress>,
}

impl TunnelInterface {
    fn ssh(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg(&self.host)
            .arg(remote_command);
        cmd
    }

    fn stage_batch(&self, groups: &[CommandGroup], work: &Path) -> Result<()> {
        let scripts_dir = work.join("scripts");
        fs::create_dir_all(&scripts_dir)?;

        let mut iter_body = String::new();
        for (i, group) in groups.iter().enumerate() {
            match group {
                CommandGroup::Exec(body) => {
                    iter_body.push_str(&format!(
                        "script_body_{i}=$(cat << 'FRPC_EOF_{i}'\n{body}\nFRPC_EOF_{i}\n)\n"
                    ));
                    iter_body.push_str(&format!("tunnel_ssh {i} \"$id\" \"$script_body_{i}\"\n"));
                }
                CommandGroup::Upload {
                    remote_path,
                    local_path,
                } => {
                    let uploads = work.join("uploads").join(i.to_string());
                    fs::create_dir_all(&uploads)?;
                    let name = local_path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .ok_or_else(|| {
                            Error::Config(format!(
                                "upload source has no name: {}",
                                local_path.display()
                            ))
                        })?;
                    fs::copy(local_path, uploads.join(name))?;
                    iter_body.push_str(&format!(
                        "tunnel_scp {i} \"$id\" 'uploads/{i}/{}' \"device-$id:'{}'\"\n",
                        shell::escape_single_quote_content(name),
                        shell::escape_single_quote_content(remote_path)
                    ));
                }
            }
        }

        let ids_line = format!("device_ids='{}'", self.device_ids.join(" "));
        let driver = scripts::render(
            scripts::TUNNEL_BASE,
            &[("device_ids", &ids_line), ("iter_body", &iter_body)],
        );
        fs::write(scripts_dir.join("tunnel_base.sh"), driver)?;
        Ok(())
    }

    fn ship_and_collect(&self, batch: &str, local_root: &Path) -> Result<()> {
        let archive = local_root.join("payload.tar.gz");
        let status = Command::new("tar")
            .arg("-czf")
            .arg(&archive)
            .arg("-C")
            .arg(env::temp_dir())
            .arg(format!("{batch}/work"))
            .status()?;
        if !status.success() {
            return Err(Error::Other(format!("tar exited with {status}")));
        }

        let remote = format!(
            "tar -xz --warning=no-timestamp && cd {batch}/work && \
             bash scripts/tunnel_base.sh; rc=$?; cd ..; \
             [[ $rc -eq 0 ]] && tar -czf work.tar.gz work; \
             rm -rf work; exit $rc"
        );
        self.rate.acquire();
        let payload = fs::read(&archive)?;
        let mut child = self
            .ssh(&remote)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()?;
        child
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Other("ssh stdin unavailable".into()))?
            .write_all(&payload)?;
        let status = child.wait()?;
        if !status.success() {
            return Err(Error::Interface(format!(
                "batch driver failed on {} with {status}",
                self.host
            )));
        }

        self.rate.acquire();
        let status = Command::new("scp")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(format!("{}:{batch}/work.tar.gz", self.host))
            .arg(local_root)
            .status()?;
        if !status.success() {
            return Err(Error::Interface(format!(
                "failed to collect results from {}",
                self.host
            )));
        }

        self.rate.acquire();
        let status = self.ssh(&format!("rm -rf {batch}")).status()?;
        if !status.success() {
            log_status!(
                "tunnel",
                "cleanup of {} on {} exited with {}, leftovers remain",
                batch,
                self.host,
                status
            );
        }

        let status = Command::new("tar")
            .arg("-xzf")
            .arg(local_root.join("work.tar.gz"))
            .arg("-C")
            .arg(local_root)
            .status()?;
        if !status.success() {
            return Err(Error::Other(format!("tar exited with {status}")));
        }
        Ok(())
    }

    /// One result per device per command group, read back from the
    /// `rc.N`/`stdout.N`/`stderr.N` triples the driver recorded.
    fn parse_results(&self, results_dir: &Path, steps: usize) -> Vec<ExecutionResult> {
        let mut results = Vec::with_capacity(self.device_ids.len() * steps);
        for id in &self.device_ids {
            let device_dir = results_dir.join(id);
            for step in 0..steps {
                let rc = fs::read_to_string(device_dir.join(format!("rc.{step}")))
                    .ok()
                    .and_then(|s| s.trim().parse::<i32>().ok());
                match rc {
                    Some(rc) => results.push(ExecutionResult {
                        device_id: id.clone(),
                        return_code: Some(rc),
                        success: rc == 0,
                        stdout: fs::read_to_string(device_dir.join(format!("stdout.{step}")))
                            .ok(),
                        stderr: fs::read_to_string(device_dir.join(format!("stderr.{step}")))
                            .ok(),
                    }),
                    None => results.push(ExecutionResult::unreachable(
                        id,
                        format!("no result recorded for step {step}"),
                    )),
                }
            }
            self.progress.tick(1);
        }
        results
    }
}

impl Interface for TunnelInterface {
    fn open(&mut self) -> Result<()> {
        let salt = Uuid::new_v4().simple().to_string();
        self.rate.acquire();
        let output = Command::new("timeout")
            .arg("15")
            .arg("ssh")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(&self.host)
            .arg(format!("echo -n {salt}"))
            .output()?;
        let echoed = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() || echoed != salt {
            return Err(Error::FatalInterface(format!(
                "jump host {} did not answer the probe",
                self.host
            )));
        }
        log_status!("tunnel", "opened session to {}", self.host);
        Ok(())
    }

    fn execute(&mut self, groups: &[CommandGroup]) -> Result<Vec<ExecutionResult>> {
        if groups.is_empty() || self.device_ids.is_empty() {
            return Ok(Vec::new());
        }
        let batch = format!("frpc-batch-{}", Uuid::new_v4());
        let local_root = env::temp_dir().join(&batch);
        let work = local_root.join("work");
        let run = (|| {
            self.stage_batch(groups, &work)?;
            self.ship_and_collect(&batch, &local_root)?;
            Ok(self.parse_results(&local_root.join("work").join("results"), groups.len()))
        })();
        fs::remove_dir_all(&local_root).ok();
        run
    }

    fn close(&mut self) {}

    fn device_ids(&self) -> &[String] {
        &self.device_ids
    }

    fn get_online(&mut self) -> Result<Vec<String>> {
        let suffixes: BTreeSet<String> = self
            .device_ids
            .iter()
            .map(|id| id[id.len() - 2..].to_string())
            .collect();
        let suffix_line = format!(
            "suffixes='{}'",
            suffixes.into_iter().collect::<Vec<_>>().join(" ")
        );
        let script = scripts::render(scripts::TUNNEL_GET_ONLINE, &[("suffixes", &suffix_line)]);

        self.rate.acquire();
        let mut child = self
            .ssh("bash -s")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;
        child
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Other("ssh stdin unavailable".into()))?
            .write_all(script.as_bytes())?;
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(Error::Interface(format!(
                "online scan failed on {}",
                self.host
            )));
        }

        let seen: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| device::normalize_id(line).ok())
            .collect();
        Ok(self
            .device_ids
            .iter()
            .filter(|id| seen.contains(id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn no_rate() -> Arc<RateLimit> {
        Arc::new(RateLimit::new(Duration::from_millis(0)))
    }

    #[test]
    fn seeded_generator_is_deterministic() {
        let a = HostIndexGenerator::with_seed(7);
        let b = HostIndexGenerator::with_seed(7);
        let picks_a: Vec<u32> = (0..5).map(|_| a.next_in(1, 9)).collect();
        let picks_b: Vec<u32> = (0..5).map(|_| b.next_in(1, 9)).collect();
        assert_eq!(picks_a, picks_b);
    }

    #[test]
    fn generator_stays_in_range() {
        let gen = HostIndexGenerator::with_seed(u64::MAX - 3);
        for _ in 0..200 {
            let i = gen.next_in(5, 8);
            assert!((5..=8).contains(&i));
        }
    }

    #[test]
    fn fixed_index_out_of_range_is_rejected() {
        let err = TunnelFactory::new("fleet-tunnel", IndexSpec::Fixed(0), no_rate()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn inverted_range_is_rejected() {
        let err =
            TunnelFactory::new("fleet-tunnel", IndexSpec::Range(9, 3), no_rate()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn fixed_index_names_the_host() {
        let factory = TunnelFactory::new("fleet-tunnel", IndexSpec::Fixed(7), no_rate()).unwrap();
        assert_eq!(factory.pick_host(), "fleet-tunnel-07");
    }

    #[test]
    fn results_are_per_device_per_step() {
        let dir = tempfile::tempdir().unwrap();
        let results_dir = dir.path().join("results");
        let device = results_dir.join("aaaaaaaaaaa1");
        fs::create_dir_all(&device).unwrap();
        fs::write(device.join("rc.0"), "0").unwrap();
        fs::write(device.join("stdout.0"), "first\n").unwrap();
        fs::write(device.join("rc.1"), "3").unwrap();
        fs::write(device.join("stderr.1"), "boom\n").unwrap();

        let interface = TunnelInterface {
            host: "fleet-tunnel-01".into(),
            device_ids: vec!["aaaaaaaaaaa1".into(), "aaaaaaaaaaa2".into()],
            rate: no_rate(),
            progress: Arc::new(Progress::new(2)),
        };
        let results = interface.parse_results(&results_dir, 2);

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].return_code, Some(0));
        assert!(results[0].success);
        assert_eq!(results[0].stdout.as_deref(), Some("first\n"));
        assert_eq!(results[1].return_code, Some(3));
        assert!(!results[1].success);
        assert_eq!(results[1].stderr.as_deref(), Some("boom\n"));
        // Second device recorded nothing at all.
        assert!(results[2..]
            .iter()
            .all(|r| r.device_id == "aaaaaaaaaaa2" && !r.success && r.return_code.is_none()));
    }
}
