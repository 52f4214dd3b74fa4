//! Runner Backends
//!
//! A runner dispatches built jobs to one execution environment. The
//! backend set is closed: local child processes, SSH hosts, SGE queues and
//! Slurm queues, selected per process by [`RunnerKind`]. All backends share
//! one wrapper-script generator that installs a trap capturing the real
//! command's exit status into `job.rc` on every relevant signal and on
//! normal exit.
//!
//! Failure semantics: a backend that cannot determine a job id from its
//! submission output reports [`Submission::Failed`] rather than silently
//! continuing, and a liveness check for a job with no recorded handle
//! returns `false`, never an error.

mod local;
mod sge;
mod slurm;
mod ssh;

pub use local::LocalRunner;
pub use sge::SgeRunner;
pub use slurm::SlurmRunner;
pub use ssh::SshRunner;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde_json::Value;
use sysinfo::{Pid, System};

use crate::error::PipelineError;
use crate::job::model::Job;
use crate::pipeline::process::{ProcessConfig, RunnerKind};

/// Signals trapped by the wrapper script, plus normal EXIT.
const TRAP_SIGNALS: &str = "1 2 3 6 7 8 9 10 11 12 15 16 17";

/// Handle attached to a job once a backend accepted it.
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    /// Backend pid or queue job id.
    pub id: String,
    pub submitted_at: SystemTime,
}

impl RunnerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            submitted_at: SystemTime::now(),
        }
    }
}

/// Outcome of one submission attempt.
#[derive(Debug)]
pub enum Submission {
    Accepted(RunnerHandle),
    /// The backend rejected or lost the job; carries its diagnostic.
    Failed { diagnostic: String },
}

/// The backend contract every runner implements.
pub trait Runner: Send + Sync {
    fn kind(&self) -> RunnerKind;

    /// How often the job manager polls `is_running`.
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Writes the wrapper script for a job and returns its path.
    fn wrap(&self, job: &Job) -> Result<PathBuf, PipelineError>;

    /// Submits a wrapped job. Must not be called before `wrap`.
    fn submit(&self, job: &Job) -> Submission;

    /// Whether the job is still alive. `false` for jobs with no handle.
    fn is_running(&self, job: &Job) -> bool;

    /// Best-effort termination of the job's whole process subtree.
    fn kill(&self, job: &Job);
}

/// Builds the runner configured for a process.
pub fn create(cfg: &Arc<ProcessConfig>) -> Result<Box<dyn Runner>, PipelineError> {
    match cfg.runner {
        RunnerKind::Local => Ok(Box::new(LocalRunner::new(cfg))),
        RunnerKind::Ssh => Ok(Box::new(SshRunner::new(cfg)?)),
        RunnerKind::Sge => Ok(Box::new(SgeRunner::new(cfg))),
        RunnerKind::Slurm => Ok(Box::new(SlurmRunner::new(cfg))),
    }
}

// ----------------------------------------------------------------------
// Wrapper generation
// ----------------------------------------------------------------------

/// Pieces of a wrapper script; the real command defaults to executing the
/// rendered job script with stdout/stderr captured.
#[derive(Debug, Default)]
pub struct WrapSpec {
    /// Backend header lines (queue directives, remote annotations).
    pub head: Vec<String>,
    pub pre_script: Option<String>,
    /// Replacement for the real command; empty means run `job.script`.
    pub real: Vec<String>,
    pub post_script: Option<String>,
    /// Redirect stdout/stderr inside the wrapper; off for backends that
    /// redirect natively.
    pub save_oe: bool,
    /// Wrapper file extension, by backend (`local`, `ssh`, `sge`, `slurm`).
    pub suffix: &'static str,
}

/// Path of the wrapper generated for a job by a given backend.
pub fn wrapper_path(job: &Job, suffix: &str) -> PathBuf {
    let mut name = job.script.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Writes the wrapper script shared by all backends.
///
/// Layout: shebang, backend head, the rc-collecting trap, pre-script, the
/// real command (redirected when `save_oe`), post-script.
pub fn write_wrapper(job: &Job, spec: &WrapSpec) -> Result<PathBuf, PipelineError> {
    let path = wrapper_path(job, spec.suffix);

    let mut real = if spec.real.is_empty() {
        vec![shquote(&job.script.to_string_lossy())]
    } else {
        spec.real.clone()
    };
    if spec.save_oe {
        if let Some(last) = real.last_mut() {
            last.push_str(&format!(
                " 1> {} 2> {}",
                shquote(&job.outfile.to_string_lossy()),
                shquote(&job.errfile.to_string_lossy())
            ));
        }
    }

    let mut src = vec!["#!/usr/bin/env bash".to_string()];
    src.extend(spec.head.iter().cloned());
    src.push("#".to_string());
    src.push("# Collect return code on exit".to_string());
    src.push(format!(
        "trap \"status=\\$?; echo \\$status > {}; exit \\$status\" {} EXIT",
        shquote(&job.rcfile.to_string_lossy()),
        TRAP_SIGNALS
    ));
    if let Some(pre) = &spec.pre_script {
        src.push("#".to_string());
        src.push("# Run pre-script".to_string());
        src.push(pre.clone());
    }
    src.push("#".to_string());
    src.push("# Run the real script".to_string());
    src.extend(real);
    if let Some(post) = &spec.post_script {
        src.push("#".to_string());
        src.push("# Run post-script".to_string());
        src.push(post.clone());
    }
    src.push(String::new());

    fs::write(&path, src.join("\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(path)
}

// ----------------------------------------------------------------------
// Shared process helpers
// ----------------------------------------------------------------------

/// Single-quotes a string for safe interpolation into generated shell.
pub(crate) fn shquote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Whether an OS process with this pid currently exists.
pub(crate) fn pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    sys.process(Pid::from_u32(pid)).is_some()
}

/// Best-effort kill of a process and all of its descendants, children
/// first, to catch grandchildren spawned by wrapper scripts.
pub(crate) fn kill_tree(pid: u32) {
    let mut sys = System::new_all();
    sys.refresh_processes();

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (child_pid, proc_) in sys.processes() {
        if let Some(parent) = proc_.parent() {
            children
                .entry(parent.as_u32())
                .or_default()
                .push(child_pid.as_u32());
        }
    }

    let mut order = Vec::new();
    collect_descendants(pid, &children, &mut order);
    order.push(pid);
    for victim in order {
        if let Some(proc_) = sys.process(Pid::from_u32(victim)) {
            proc_.kill();
        }
    }
}

fn collect_descendants(pid: u32, children: &HashMap<u32, Vec<u32>>, out: &mut Vec<u32>) {
    if let Some(kids) = children.get(&pid) {
        for kid in kids {
            collect_descendants(*kid, children, out);
            out.push(*kid);
        }
    }
}

/// Runs a command to completion with a deadline; `Ok(None)` on timeout
/// (the child is killed).
pub(crate) fn run_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
) -> io::Result<Option<ExitStatus>> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// String-valued backend option, with `"sge.q"`-style keys.
pub(crate) fn opt_str(opts: &HashMap<String, Value>, key: &str) -> Option<String> {
    match opts.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    }
}

pub(crate) fn opt_list(opts: &HashMap<String, Value>, key: &str) -> Vec<String> {
    match opts.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}
