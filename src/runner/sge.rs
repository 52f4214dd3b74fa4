//! SGE Runner
//!
//! Submits wrappers to a Sun Grid Engine queue. User options under
//! `sge.<key>` map to `#$ -<key> <value>` header directives (a boolean
//! true emits the bare flag); the numeric job id is parsed from `qsub`
//! stdout, and liveness/kill shell out to `qstat`/`qdel` keyed by it.

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

use super::{opt_str, write_wrapper, wrapper_path, Runner, RunnerHandle, Submission, WrapSpec};

/// Matches the job id in `Your job 6556149 ("name") has been submitted`.
static JOB_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d+)\b").unwrap());

pub struct SgeRunner {
    cfg: Arc<ProcessConfig>,
    qsub: String,
    qstat: String,
    qdel: String,
}

impl SgeRunner {
    pub fn new(cfg: &Arc<ProcessConfig>) -> Self {
        let opts = &cfg.runner_opts;
        Self {
            cfg: Arc::clone(cfg),
            qsub: opt_str(opts, "qsub").unwrap_or_else(|| "qsub".to_string()),
            qstat: opt_str(opts, "qstat").unwrap_or_else(|| "qstat".to_string()),
            qdel: opt_str(opts, "qdel").unwrap_or_else(|| "qdel".to_string()),
        }
    }

    /// Queue directives for one job, in the fixed order: name, queue,
    /// join, cwd, mail options, output files, then remaining `sge.*`
    /// options sorted by key.
    fn header(&self, job: &Job) -> Vec<String> {
        let opts = &self.cfg.runner_opts;
        let mut head = Vec::new();

        let name = opt_str(opts, "sge.N").unwrap_or_else(|| {
            format!(
                "{}.{}.{}.{}",
                self.cfg.id,
                self.cfg.tag,
                self.cfg.suffix(),
                job.index + 1
            )
        });
        head.push(format!("#$ -N {}", name));

        for key in ["q", "j"] {
            if let Some(value) = opt_str(opts, &format!("sge.{}", key)) {
                head.push(format!("#$ -{} {}", key, value));
            }
        }
        head.push("#$ -cwd".to_string());
        for key in ["M", "m"] {
            if let Some(value) = opt_str(opts, &format!("sge.{}", key)) {
                head.push(format!("#$ -{} {}", key, value));
            }
        }
        head.push(format!("#$ -o {}", job.outfile.display()));
        head.push(format!("#$ -e {}", job.errfile.display()));

        let mut rest: Vec<&String> = opts
            .keys()
            .filter(|k| {
                k.starts_with("sge.")
                    && !matches!(k.as_str(), "sge.N" | "sge.q" | "sge.j" | "sge.M" | "sge.m")
            })
            .collect();
        rest.sort();
        for key in rest {
            let flag = key.trim_start_matches("sge.").trim();
            match opts.get(key) {
                Some(Value::Bool(true)) => head.push(format!("#$ -{}", flag)),
                Some(Value::Bool(false)) | None => {}
                Some(value) => {
                    let text = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    head.push(format!("#$ -{} {}", flag, text));
                }
            }
        }
        head
    }
}

impl Runner for SgeRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Sge
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    fn wrap(&self, job: &Job) -> Result<PathBuf, PipelineError> {
        let spec = WrapSpec {
            head: self.header(job),
            pre_script: opt_str(&self.cfg.runner_opts, "preScript"),
            post_script: opt_str(&self.cfg.runner_opts, "postScript"),
            // The queue redirects natively via -o/-e.
            save_oe: false,
            suffix: "sge",
            ..Default::default()
        };
        write_wrapper(job, &spec)
    }

    fn submit(&self, job: &Job) -> Submission {
        let wrapper = wrapper_path(job, "sge");
        let out = match Command::new(&self.qsub).arg(&wrapper).output() {
            Ok(out) => out,
            Err(e) => {
                return Submission::Failed {
                    diagnostic: format!("cannot run {}: {}", self.qsub, e),
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
                debug!("{} Submitted to sge, job id {}", job.log_tag(), id);
                Submission::Accepted(RunnerHandle::new(id))
            }
            None => Submission::Failed {
                diagnostic: format!(
                    "could not determine job id from qsub output: {}",
                    stdout.trim()
                ),
            },
        }
    }

    fn is_running(&self, job: &Job) -> bool {
        let Some(id) = job.read_pid() else {
            return false;
        };
        Command::new(&self.qstat)
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
            let _ = Command::new(&self.qdel)
                .arg("-f")
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

    fn sge_cfg() -> ProcessConfig {
        let mut cfg = ProcessConfig::new("pSort").with_script("sort input");
        cfg.runner = RunnerKind::Sge;
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
        let cfg = Arc::new(sge_cfg());
        let runner = SgeRunner::new(&cfg);
        let job = built_job(&cfg, dir.path());

        let head = runner.header(&job);
        assert!(head[0].starts_with("#$ -N pSort.notag."));
        assert!(head[0].ends_with(".1"));
        assert!(head.contains(&"#$ -cwd".to_string()));
        assert!(head.iter().any(|l| l.starts_with("#$ -o ")));
        assert!(head.iter().any(|l| l.starts_with("#$ -e ")));
    }

    #[test]
    fn test_header_option_mapping() {
        let dir = tempdir().unwrap();
        let mut cfg = sge_cfg();
        cfg.runner_opts
            .insert("sge.q".to_string(), json!("1-day"));
        cfg.runner_opts.insert("sge.notify".to_string(), json!(true));
        cfg.runner_opts
            .insert("sge.l".to_string(), json!("h_vmem=4G"));
        cfg.runner_opts
            .insert("sge.N".to_string(), json!("myjob"));
        let cfg = Arc::new(cfg);
        let runner = SgeRunner::new(&cfg);
        let job = built_job(&cfg, dir.path());

        let head = runner.header(&job);
        assert_eq!(head[0], "#$ -N myjob");
        assert!(head.contains(&"#$ -q 1-day".to_string()));
        // Boolean true emits the bare flag.
        assert!(head.contains(&"#$ -notify".to_string()));
        assert!(head.contains(&"#$ -l h_vmem=4G".to_string()));
    }

    #[test]
    fn test_wrapper_has_no_inline_redirect() {
        let dir = tempdir().unwrap();
        let cfg = Arc::new(sge_cfg());
        let runner = SgeRunner::new(&cfg);
        let job = built_job(&cfg, dir.path());

        let path = runner.wrap(&job).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("#$ -N "));
        assert!(content.contains("trap"));
        assert!(!content.contains("1> "));
    }

    #[test]
    fn test_job_id_pattern() {
        let caps = JOB_ID
            .captures("Your job 6556149 (\"pSort.notag.3omQ6NdZ.0\") has been submitted")
            .unwrap();
        assert_eq!(&caps[1], "6556149");
        assert!(JOB_ID.captures("no id here").is_none());
    }

    #[test]
    fn test_not_running_without_handle() {
        let dir = tempdir().unwrap();
        let cfg = Arc::new(sge_cfg());
        let runner = SgeRunner::new(&cfg);
        let job = built_job(&cfg, dir.path());
        assert!(!runner.is_running(&job));
    }

    #[test]
    fn test_submit_failure_reports_diagnostic() {
        let dir = tempdir().unwrap();
        let mut cfg = sge_cfg();
        // A qsub that produces no job id in its output.
        cfg.runner_opts.insert("qsub".to_string(), json!("true"));
        let cfg = Arc::new(cfg);
        let runner = SgeRunner::new(&cfg);
        let job = built_job(&cfg, dir.path());
        runner.wrap(&job).unwrap();

        match runner.submit(&job) {
            Submission::Failed { diagnostic } => {
                assert!(diagnostic.contains("could not determine job id"));
            }
            Submission::Accepted(_) => panic!("expected submission failure"),
        }
    }

    #[test]
    fn test_poll_interval_is_queue_paced() {
        let cfg = Arc::new(sge_cfg());
        let runner = SgeRunner::new(&cfg);
        assert_eq!(runner.poll_interval(), Duration::from_secs(5));
    }
}
