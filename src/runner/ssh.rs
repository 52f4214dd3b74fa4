//! SSH Runner
//!
//! Dispatches jobs to a pool of SSH hosts sharing the local filesystem.
//! A process-wide registry holds the validated live subset of each server
//! pool (probed once with a bounded batch-mode check); jobs are assigned
//! round-robin over it by index. Submission prechecks that the wrapper is
//! visible remotely and reports a filesystem-mismatch hint otherwise.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info};
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::error::PipelineError;
use crate::job::model::Job;
use crate::pipeline::process::{ProcessConfig, RunnerKind};

use super::{
    opt_list, opt_str, run_with_timeout, shquote, write_wrapper, wrapper_path, Runner,
    RunnerHandle, Submission, WrapSpec,
};

/// Default liveness probe timeout, seconds.
const PROBE_TIMEOUT_SECS: u64 = 3;

/// Live-server lists keyed by server pool, shared across all SSH runners
/// of this process so the probe runs once per pool.
static LIVE_SERVERS: Lazy<Mutex<HashMap<String, Vec<String>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug)]
pub struct SshRunner {
    ssh_exe: String,
    /// Live servers, in pool order.
    servers: Vec<String>,
    /// Identity files, parallel to the configured pool (may be empty).
    keys: HashMap<String, String>,
    pre_script: Option<String>,
    post_script: Option<String>,
    children: Mutex<HashMap<usize, Child>>,
}

impl SshRunner {
    pub fn new(cfg: &Arc<ProcessConfig>) -> Result<Self, PipelineError> {
        let opts = &cfg.runner_opts;
        let ssh_exe = opt_str(opts, "ssh").unwrap_or_else(|| "ssh".to_string());
        let servers = opt_list(opts, "servers");
        let key_list = opt_list(opts, "keys");
        if servers.is_empty() {
            return Err(PipelineError::Runner(
                "no server found for ssh runner".to_string(),
            ));
        }

        let mut keys = HashMap::new();
        for (i, server) in servers.iter().enumerate() {
            if let Some(key) = key_list.get(i) {
                keys.insert(server.clone(), key.clone());
            }
        }

        // checkAlive: false = trust all, true = probe with the default
        // timeout, a number = probe with that timeout.
        let probe = match opts.get("checkAlive") {
            None | Some(Value::Bool(false)) => None,
            Some(Value::Bool(true)) => Some(Duration::from_secs(PROBE_TIMEOUT_SECS)),
            Some(Value::Number(n)) => {
                Some(Duration::from_secs_f64(n.as_f64().unwrap_or(PROBE_TIMEOUT_SECS as f64)))
            }
            _ => Some(Duration::from_secs(PROBE_TIMEOUT_SECS)),
        };

        let pool_key = servers.join(",");
        let live = {
            let mut registry = LIVE_SERVERS
                .lock()
                .expect("ssh live-server registry poisoned");
            registry
                .entry(pool_key)
                .or_insert_with(|| match probe {
                    None => servers.clone(),
                    Some(timeout) => {
                        let live: Vec<String> = servers
                            .iter()
                            .filter(|server| {
                                let alive = Self::is_server_alive(
                                    &ssh_exe,
                                    server,
                                    keys.get(*server).map(String::as_str),
                                    timeout,
                                );
                                if !alive {
                                    info!("Ssh server {} is not alive", server);
                                }
                                alive
                            })
                            .cloned()
                            .collect();
                        live
                    }
                })
                .clone()
        };

        if live.is_empty() {
            return Err(PipelineError::Runner("no ssh server is alive".to_string()));
        }

        Ok(Self {
            ssh_exe,
            servers: live,
            keys,
            pre_script: opt_str(opts, "preScript"),
            post_script: opt_str(opts, "postScript"),
            children: Mutex::new(HashMap::new()),
        })
    }

    /// Probes one server with a bounded, batch-mode `true` invocation.
    pub fn is_server_alive(
        ssh_exe: &str,
        server: &str,
        key: Option<&str>,
        timeout: Duration,
    ) -> bool {
        let mut cmd = Command::new(ssh_exe);
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ConnectionAttempts=1");
        if let Some(key) = key {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(server).arg("true");

        matches!(run_with_timeout(&mut cmd, timeout), Ok(Some(status)) if status.success())
    }

    /// Round-robin server assignment keyed by job index.
    fn server_for(&self, index: usize) -> &str {
        &self.servers[index % self.servers.len()]
    }

    /// A command running on the job's assigned server.
    fn ssh_cmd(&self, server: &str) -> Command {
        let mut cmd = Command::new(&self.ssh_exe);
        if let Some(key) = self.keys.get(server) {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(server);
        cmd
    }

    /// Runs a short remote command, capturing its output.
    fn remote(&self, server: &str, remote_cmd: &str) -> std::io::Result<std::process::Output> {
        self.ssh_cmd(server)
            .arg(remote_cmd)
            .stdin(Stdio::null())
            .output()
    }
}

impl Runner for SshRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Ssh
    }

    fn wrap(&self, job: &Job) -> Result<PathBuf, PipelineError> {
        let server = self.server_for(job.index);
        let cwd = std::env::current_dir()?;
        let spec = WrapSpec {
            head: vec![
                format!("# run on server: {}", server),
                // The remote shell records its own pid; liveness and kill
                // go through it.
                format!("echo $$ > {}", shquote(&job.pidfile.to_string_lossy())),
            ],
            pre_script: self.pre_script.clone(),
            real: vec![
                format!("cd {}", shquote(&cwd.to_string_lossy())),
                shquote(&job.script.to_string_lossy()),
            ],
            post_script: self.post_script.clone(),
            save_oe: true,
            suffix: "ssh",
        };
        write_wrapper(job, &spec)
    }

    fn submit(&self, job: &Job) -> Submission {
        let server = self.server_for(job.index);
        let wrapper = wrapper_path(job, "ssh");

        // The wrapper must be visible remotely: the ssh runner requires a
        // shared filesystem.
        let precheck = self.remote(server, &format!("ls {}", shquote(&wrapper.to_string_lossy())));
        match precheck {
            Ok(out) if out.status.success() => {}
            Ok(out) => {
                return Submission::Failed {
                    diagnostic: format!(
                        "{}\nProbably the server ({}) is not using the same file system as the local machine.\n",
                        String::from_utf8_lossy(&out.stderr),
                        server
                    ),
                }
            }
            Err(e) => {
                return Submission::Failed {
                    diagnostic: format!("cannot reach server {}: {}", server, e),
                }
            }
        }

        let spawned = self
            .ssh_cmd(server)
            .arg(format!("bash {}", shquote(&wrapper.to_string_lossy())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match spawned {
            Ok(child) => {
                let id = child.id().to_string();
                self.children
                    .lock()
                    .expect("ssh runner child registry poisoned")
                    .insert(job.index, child);
                debug!("{} Submitted to {} via ssh", job.log_tag(), server);
                Submission::Accepted(RunnerHandle::new(id))
            }
            Err(e) => Submission::Failed {
                diagnostic: format!("cannot spawn ssh to {}: {}", server, e),
            },
        }
    }

    fn is_running(&self, job: &Job) -> bool {
        let server = self.server_for(job.index);

        // The remote pid is recorded by the wrapper head; probe it over
        // the same channel.
        if let Some(pid) = job.read_pid() {
            return self
                .remote(server, &format!("kill -0 {}", pid))
                .map(|out| out.status.success())
                .unwrap_or(false);
        }

        // No remote pid yet: fall back to the local ssh client.
        let mut children = self
            .children
            .lock()
            .expect("ssh runner child registry poisoned");
        if let Some(child) = children.get_mut(&job.index) {
            match child.try_wait() {
                Ok(None) => return true,
                Ok(Some(_)) | Err(_) => {
                    children.remove(&job.index);
                }
            }
        }
        false
    }

    fn kill(&self, job: &Job) {
        let server = self.server_for(job.index);
        if let Some(pid) = job.read_pid() {
            let _ = self.remote(
                server,
                &format!("pkill -KILL -P {pid}; kill -KILL {pid}", pid = pid),
            );
        }
        let mut children = self
            .children
            .lock()
            .expect("ssh runner child registry poisoned");
        if let Some(mut child) = children.remove(&job.index) {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
