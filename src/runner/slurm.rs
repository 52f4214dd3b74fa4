//! Slurm Runner
//!
//! Submits wrappers via `sbatch` with `#SBATCH` header directives mapped
//! from `slurm.<key>` options; the real command is piped through `srun`.
//! The job id is the trailing integer of `sbatch` stdout; liveness and
//! kill go through `squeue`/`scancel`.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::PipelineError;
use crate::job::model::Job;
use crate::pipeline::process::{ProcessConfig, RunnerKind};

use super::{
    opt_str, shquote, write_wrapper, wrapper_path, Runner, RunnerHandle, Submission, WrapSpec,
};

/// Matches the job id in `Submitted batch job 1823334668`.
static JOB_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s*$").unwrap());

pub struct SlurmRunner {
    cfg: Arc<ProcessConfig>,
    sbatch: String,
    srun: String,
    squeue: String,
    scancel: String,
}

impl SlurmRunner {
    pub fn new(cfg: &Arc<ProcessConfig>) -> Self {
        let opts = &cfg.runner_opts;
        Self {
            cfg: Arc::clone(cfg),
            sbatch: opt_str(opts, "sbatch").unwrap_or_else(|| "sbatch".to_string()),
            srun: opt_str(opts, "srun").unwrap_or_else(|| "srun".to_string()),
            squeue: opt_str(opts, "squeue").unwrap_or_else(|| "squeue".to_string()),
            scancel: opt_str(opts, "scancel").unwrap_or_else(|| "scancel".to_string()),
        }
    }

    /// `#SBATCH` directives: job name, output files, then remaining
    /// `slurm.*` options sorted by key. Single-letter keys map to `-k`,
    /// longer ones to `--key`; a boolean true emits the bare flag.
    fn header(&self, job: &Job) -> Vec<String> {
        let opts = &self.cfg.runner_opts;
        let mut head = Vec::new();

        let name = opt_str(opts, "slurm.J").unwrap_or_else(|| {
            format!(
                "{}.{}.{}.{}",
                self.cfg.id,
                self.cfg.tag,
                self.cfg.suffix(),
                job.index + 1
            )
        });
        head.push(format!("#SBATCH -J {}", name));
        head.push(format!("#SBATCH -o {}", job.outfile.display()));
        head.push(format!("#SBATCH -e {}", job.errfile.display()));

        let mut rest: Vec<&String> = opts
            .keys()
            .filter(|k| k.starts_with("slurm.") && k.as_str() != "slurm.J")
            .collect();
        rest.sort();
        for key in rest {
            let flag = key.trim_start_matches("slurm.").trim();
            let dashed = if flag.len() == 1 {
                format!("-{}", flag)
            } else {
                format!("--{}", flag)
            };
            match opts.get(key) {
                Some(Value::Bool(true)) => head.push(format!("#SBATCH {}", dashed)),
                Some(Value::Bool(false)) | None => {}
                Some(value) => {
                    let text = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    head.push(format!("#SBATCH {} {}", dashed, text));
                }
            }
        }
        head
    }
}

impl Runner for SlurmRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Slurm
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    fn wrap(&self, job: &Job) -> Result<PathBuf, PipelineError> {
        let spec = WrapSpec {
            head: self.header(job),
            pre_script: opt_str(&self.cfg.runner_opts, "preScript"),
            real: vec![format!(
                "{} {}",
                self.srun,
                shquote(&job.script.to_string_lossy())
            )],
            post_script: opt_str(&self.cfg.runner_opts, "postScript"),
            // sbatch redirects natively via -o/-e.
            save_oe: false,
            suffix: "slurm",
        };
        write_wrapper(job, &spec)
    }

    fn submit(&self, job: &Job) -> Submission {
        let wrapper = wrapper_path(job, "slurm");
        let out = match Command::new(&self.sbatch).arg(&wrapper).output() {
            Ok(out) => out,
            Err(e) => {
                return Submission::Failed {
                    diagnostic: format!("cannot run {}: {}", self.sbatch, e),
                }
            }
        };
        if !out.status.success() {
            return Submission::Failed {
                diagnostic: String::from_utf8_lossy(&out.stderr).to_string(),
            };
        }

        let stdout = String::from_utf8_lossy(&out.stdout);
        match JOB_ID.captures(stdout.trim()).map(|c| c[1].to_string()) {
            Some(id) => {
                if let Err(e) = job.write_pid(&id) {
                    return Submission::Failed {
                        diagnostic: format!("cannot record job id: {}", e),
                    };
                }
                debug!("{} Submitted to slurm, job id {}", job.log_tag(), id);
                Submission::Accepted(RunnerHandle::new(id))
            }
            None => Submission::Failed {
                diagnostic: format!(
                    "could not determine job id from sbatch output: {}",
                    stdout.trim()
                ),
            },
        }
    }

    fn is_running(&self, job: &Job) -> bool {
        let Some(id) = job.read_pid() else {
            return false;
        };
        Command::new(&self.squeue)
            .arg("-j")
            .arg(&id)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn kill(&self, job: &Job) {
        if let Some(id) = job.read_pid() {
            let _ = Command::new(&self.scancel)
                .arg(&id)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::channel::ChannelValue;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn slurm_cfg() -> ProcessConfig {
        let mut cfg = ProcessConfig::new("pAlign").with_script("align input");
        cfg.runner = RunnerKind::Slurm;
        cfg
    }

    fn built_job(cfg: &Arc<ProcessConfig>, dir: &std::path::Path) -> Job {
        let mut job = Job::new(0, Arc::clone(cfg), dir, Vec::<ChannelValue>::new(), 1);
        job.build().unwrap();
        job
    }

    #[test]
    fn test_header_defaults() {
        let dir = tempdir().unwrap();
        let cfg = Arc::new(slurm_cfg());
        let runner = SlurmRunner::new(&cfg);
        let job = built_job(&cfg, dir.path());

        let head = runner.header(&job);
        assert!(head[0].starts_with("#SBATCH -J pAlign.notag."));
        assert!(head[1].starts_with("#SBATCH -o "));
        assert!(head[2].starts_with("#SBATCH -e "));
    }

    #[test]
    fn test_header_short_and_long_options() {
        let dir = tempdir().unwrap();
        let mut cfg = slurm_cfg();
        cfg.runner_opts.insert("slurm.p".to_string(), json!("gpu"));
        cfg.runner_opts
            .insert("slurm.mem".to_string(), json!("8G"));
        cfg.runner_opts
            .insert("slurm.exclusive".to_string(), json!(true));
        let cfg = Arc::new(cfg);
        let runner = SlurmRunner::new(&cfg);
        let job = built_job(&cfg, dir.path());

        let head = runner.header(&job);
        assert!(head.contains(&"#SBATCH -p gpu".to_string()));
        assert!(head.contains(&"#SBATCH --mem 8G".to_string()));
        assert!(head.contains(&"#SBATCH --exclusive".to_string()));
    }

    #[test]
    fn test_wrapper_pipes_through_srun() {
        let dir = tempdir().unwrap();
        let cfg = Arc::new(slurm_cfg());
        let runner = SlurmRunner::new(&cfg);
        let job = built_job(&cfg, dir.path());

        let path = runner.wrap(&job).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("srun '"));
        assert!(content.contains("job.script"));
        assert!(!content.contains("1> "));
    }

    #[test]
    fn test_job_id_pattern() {
        let caps = JOB_ID.captures("Submitted batch job 1823334668").unwrap();
        assert_eq!(&caps[1], "1823334668");
        assert!(JOB_ID.captures("submission rejected").is_none());
    }

    #[test]
    fn test_not_running_without_handle() {
        let dir = tempdir().unwrap();
        let cfg = Arc::new(slurm_cfg());
        let runner = SlurmRunner::new(&cfg);
        let job = built_job(&cfg, dir.path());
        assert!(!runner.is_running(&job));
    }

    #[test]
    fn test_submit_without_id_fails() {
        let dir = tempdir().unwrap();
        let mut cfg = slurm_cfg();
        cfg.runner_opts.insert("sbatch".to_string(), json!("true"));
        let cfg = Arc::new(cfg);
        let runner = SlurmRunner::new(&cfg);
        let job = built_job(&cfg, dir.path());
        runner.wrap(&job).unwrap();

        match runner.submit(&job) {
            Submission::Failed { diagnostic } => {
                assert!(diagnostic.contains("could not determine job id"));
            }
            Submission::Accepted(_) => panic!("expected submission failure"),
        }
    }
}
