/*!
Fake tenant workers

Each `FakeWorker` is a shell script in its own temp directory. Every launch
appends the script pid to `spawns.log` and the received argv to `args.log`,
then behaves according to its `WorkerBehaviour`.
*/

use anyhow::Result;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Readiness line printed by the "ready" behaviours
pub const READY_LINE: &str = "Listening on 127.0.0.1";

#[derive(Debug, Clone, Copy)]
pub enum WorkerBehaviour {
    /// Prints the readiness line and stays up
    Ready,
    /// Prints the alternate readiness line after a delay and stays up
    SlowReady(Duration),
    /// Never prints a readiness line
    Silent,
    /// Writes to stderr and exits with status 3 before readiness
    CrashBeforeReady,
    /// Becomes ready, then exits after the delay
    ReadyThenExit(Duration),
    /// Prints the readiness marker with no trailing newline and stays up
    ReadyWithoutNewline,
    /// Mixes non-UTF-8 lines with the readiness line and keeps writing after it
    BinaryNoise,
}

pub struct FakeWorker {
    dir: TempDir,
    path: PathBuf,
}

impl FakeWorker {
    pub fn new(behaviour: WorkerBehaviour) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("fake-worker");
        let spawn_log = dir.path().join("spawns.log");
        let args_log = dir.path().join("args.log");

        let body = match behaviour {
            WorkerBehaviour::Ready => format!("echo \"{READY_LINE}\"\nexec sleep 600"),
            WorkerBehaviour::SlowReady(delay) => format!(
                "sleep {}\necho \"Server running at http://127.0.0.1\"\nexec sleep 600",
                seconds(delay)
            ),
            WorkerBehaviour::Silent => "echo \"booting\"\nexec sleep 600".to_string(),
            WorkerBehaviour::CrashBeforeReady => {
                "echo \"fatal: cannot open root\" >&2\nexit 3".to_string()
            }
            WorkerBehaviour::ReadyThenExit(delay) => {
                format!("echo \"{READY_LINE}\"\nsleep {}\nexit 0", seconds(delay))
            }
            WorkerBehaviour::ReadyWithoutNewline => format!("printf '%s' \"{READY_LINE}\"\nexec sleep 600"),
            WorkerBehaviour::BinaryNoise => format!(
                "printf 'file \\377\\n'\necho \"{READY_LINE}\"\nsleep 0.3\nprintf 'file \\376\\n'\nsleep 0.3\necho \"still serving\"\nexec sleep 600"
            ),
        };

        let script = format!(
            "#!/bin/sh\necho $$ >> \"{}\"\nprintf '%s\\n' \"$@\" > \"{}\"\n{}\n",
            spawn_log.display(),
            args_log.display(),
            body
        );
        std::fs::write(&path, script)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;

        Ok(Self { dir, path })
    }

    /// Executable path to configure as the worker binary
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scratch directory owned by this worker; usable as a tenant root parent
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Pids of every launch so far, in spawn order
    pub fn pids(&self) -> Vec<i32> {
        std::fs::read_to_string(self.dir.path().join("spawns.log"))
            .unwrap_or_default()
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect()
    }

    pub fn spawn_count(&self) -> usize {
        self.pids().len()
    }

    /// Arguments received by the most recent launch
    pub fn last_args(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("args.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

fn seconds(d: Duration) -> String {
    format!("{:.3}", d.as_secs_f64())
}
