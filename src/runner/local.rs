//! Local Runner
//!
//! Executes the wrapper as a background child process on this machine.
//! Liveness is judged from the retained child handle (reaping it on exit),
//! falling back to an OS pid probe; kill signals the whole subtree.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::error::PipelineError;
use crate::job::model::Job;
use crate::pipeline::process::{ProcessConfig, RunnerKind};

use super::{
    kill_tree, opt_str, pid_alive, write_wrapper, wrapper_path, Runner, RunnerHandle, Submission,
    WrapSpec,
};

pub struct LocalRunner {
    pre_script: Option<String>,
    post_script: Option<String>,
    /// Retained children by job index, so terminated jobs are reaped
    /// instead of lingering as zombies.
    children: Mutex<HashMap<usize, Child>>,
}

impl LocalRunner {
    pub fn new(cfg: &Arc<ProcessConfig>) -> Self {
        Self {
            pre_script: opt_str(&cfg.runner_opts, "preScript"),
            post_script: opt_str(&cfg.runner_opts, "postScript"),
            children: Mutex::new(HashMap::new()),
        }
    }
}

impl Runner for LocalRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Local
    }

    fn wrap(&self, job: &Job) -> Result<PathBuf, PipelineError> {
        let spec = WrapSpec {
            pre_script: self.pre_script.clone(),
            post_script: self.post_script.clone(),
            save_oe: true,
            suffix: "local",
            ..Default::default()
        };
        write_wrapper(job, &spec)
    }

    fn submit(&self, job: &Job) -> Submission {
        let wrapper = wrapper_path(job, "local");
        let spawned = Command::new("bash")
            .arg(&wrapper)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match spawned {
            Ok(child) => {
                let pid = child.id();
                if let Err(e) = job.write_pid(&pid.to_string()) {
                    return Submission::Failed {
                        diagnostic: format!("cannot record pid: {}", e),
                    };
                }
                self.children
                    .lock()
                    .expect("local runner child registry poisoned")
                    .insert(job.index, child);
                debug!("{} Submitted locally, pid {}", job.log_tag(), pid);
                Submission::Accepted(RunnerHandle::new(pid.to_string()))
            }
            Err(e) => Submission::Failed {
                diagnostic: format!("cannot spawn {}: {}", wrapper.display(), e),
            },
        }
    }

    fn is_running(&self, job: &Job) -> bool {
        let mut children = self
            .children
            .lock()
            .expect("local runner child registry poisoned");
        if let Some(child) = children.get_mut(&job.index) {
            match child.try_wait() {
                Ok(None) => return true,
                Ok(Some(_)) | Err(_) => {
                    children.remove(&job.index);
                    return false;
                }
            }
        }
        drop(children);

        match job.read_pid().and_then(|p| p.parse::<u32>().ok()) {
            Some(pid) => pid_alive(pid),
            None => false,
        }
    }

    fn kill(&self, job: &Job) {
        if let Some(pid) = job.read_pid().and_then(|p| p.parse::<u32>().ok()) {
            kill_tree(pid);
        }
        let mut children = self
            .children
            .lock()
            .expect("local runner child registry poisoned");
        if let Some(mut child) = children.remove(&job.index) {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
