use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use uuid::Uuid;

use crate::core::error::{Error, Result};
use crate::log_status;
use crate::utils::shell;

/// One unit of work an interface knows how to ship to a device.
#[derive(Debug, Clone)]
pub enum CommandGroup {
    /// A shell script body executed on the device.
    Exec(String),
    /// A single file pushed to the device.
    Upload {
        remote_path: String,
        local_path: PathBuf,
    },
}

enum Pending {
    None,
    Exec(String),
    Upload(Vec<(String, PathBuf)>),
}

/// Accumulates exec and upload requests and coalesces them into command
/// groups. Consecutive execs merge into one script; consecutive uploads
/// are packed into a single archive followed by an unpack step, so a run
/// of N uploads costs two round trips instead of 2N.
pub struct CommandBuffer {
    pending: Pending,
    groups: Vec<CommandGroup>,
    staged: Vec<PathBuf>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        CommandBuffer {
            pending: Pending::None,
            groups: Vec::new(),
            staged: Vec::new(),
        }
    }

    pub fn add_exec(&mut self, body: &str) -> Result<()> {
        match &mut self.pending {
            Pending::Exec(script) => {
                script.push('\n');
                script.push_str(body);
            }
            Pending::None => self.pending = Pending::Exec(body.to_string()),
            Pending::Upload(_) => {
                // Finalizing leaves the unpack script pending as an
                // exec, so the new body coalesces with it.
                self.finalize_step()?;
                self.add_exec(body)?;
            }
        }
        Ok(())
    }

    pub fn add_upload(&mut self, remote_path: &str, local_path: &Path) -> Result<()> {
        if !local_path.is_file() {
            return Err(Error::Config(format!(
                "upload source not found: {}",
                local_path.display()
            )));
        }
        let entry = (remote_path.to_string(), local_path.to_path_buf());
        match &mut self.pending {
            Pending::Upload(entries) => entries.push(entry),
            Pending::None => self.pending = Pending::Upload(vec![entry]),
            Pending::Exec(_) => {
                self.finalize_step()?;
                self.pending = Pending::Upload(vec![entry]);
            }
        }
        Ok(())
    }

    /// Closes the buffer and returns the ordered command groups.
    pub fn flush(&mut self) -> Result<Vec<CommandGroup>> {
        while !matches!(self.pending, Pending::None) {
            self.finalize_step()?;
        }
        Ok(std::mem::take(&mut self.groups))
    }

    fn finalize_step(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.pending, Pending::None) {
            Pending::None => {}
            Pending::Exec(script) => self.groups.push(CommandGroup::Exec(script)),
            Pending::Upload(entries) => {
                // Replacing the upload with an archive push plus an exec
                // unpack step. The exec lands in `pending` so a following
                // add_exec still coalesces with it.
                let (archive, unpack) = self.package_uploads(&entries)?;
                let archive_name = archive
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .ok_or_else(|| Error::Other("archive name is not valid UTF-8".into()))?;
                self.groups.push(CommandGroup::Upload {
                    remote_path: format!("/tmp/{archive_name}"),
                    local_path: archive.clone(),
                });
                self.staged.push(archive);
                self.pending = Pending::Exec(unpack);
            }
        }
        Ok(())
    }

    fn package_uploads(&self, entries: &[(String, PathBuf)]) -> Result<(PathBuf, String)> {
        let stage = env::temp_dir().join(format!("frpc-stage-{}", Uuid::new_v4()));
        fs::create_dir_all(&stage)?;

        let mut arcnames = Vec::with_capacity(entries.len());
        for (i, (remote, local)) in entries.iter().enumerate() {
            let filename = local
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    Error::Config(format!("upload source has no name: {}", local.display()))
                })?;
            let arcname = format!("{i}.{filename}");
            fs::copy(local, stage.join(&arcname))?;
            arcnames.push((arcname, remote.clone()));
        }

        let archive_name = format!("frpc-upload-{}.tar.gz", Uuid::new_v4());
        let archive = env::temp_dir().join(&archive_name);
        let mut cmd = Command::new("tar");
        cmd.arg("-czf").arg(&archive).arg("-C").arg(&stage);
        for (arcname, _) in &arcnames {
            cmd.arg(arcname);
        }
        let status = cmd.status()?;
        fs::remove_dir_all(&stage).ok();
        if !status.success() {
            return Err(Error::Other(format!(
                "tar exited with {} while packaging uploads",
                status
            )));
        }

        let mut unpack = String::from("#!/bin/bash\ncd /tmp\n");
        unpack.push_str(&format!(
            "tar -xf {}\nrm -f {}\n",
            shell::quote_path(&archive_name),
            shell::quote_path(&archive_name)
        ));
        for (arcname, remote) in &arcnames {
            unpack.push_str(&format!(
                "mv -f {} {}\n",
                shell::quote_path(arcname),
                shell::quote_path(remote)
            ));
        }
        log_status!(
            "upload",
            "packaged {} file(s) into {}",
            entries.len(),
            archive_name
        );
        Ok((archive, unpack))
    }
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        for archive in &self.staged {
            fs::remove_file(archive).ok();
        }
    }
}
