//! Process Model
//!
//! A process is a user-declared unit of computation that fans out into one
//! job per input row. This module holds the typed process configuration
//! (replacing the free-form option bags of dynamic pipeline tools with
//! named fields plus a per-backend escape hatch) and the per-process run
//! entry point that drives the job manager.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use serde_json::Value;

use crate::error::PipelineError;
use crate::job::manager::Jobmgr;
use crate::template::Template;

use super::channel::Channel;

/// Kind of a declared input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InKind {
    Var,
    File,
    Files,
}

impl InKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "var" => Some(InKind::Var),
            "file" | "path" => Some(InKind::File),
            "files" | "paths" => Some(InKind::Files),
            _ => None,
        }
    }
}

/// Kind of a declared output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutKind {
    Var,
    File,
    Dir,
    /// Synonym bound to the job's own stdout file.
    Stdout,
    /// Synonym bound to the job's own stderr file.
    Stderr,
}

impl OutKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "var" => Some(OutKind::Var),
            "file" | "path" => Some(OutKind::File),
            "dir" => Some(OutKind::Dir),
            "stdout" => Some(OutKind::Stdout),
            "stderr" => Some(OutKind::Stderr),
            _ => None,
        }
    }

    /// True for outputs that must exist on disk for the job to succeed.
    pub fn is_path(&self) -> bool {
        !matches!(self, OutKind::Var)
    }
}

/// Whether and how previous job results may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    On,
    Off,
    /// Reuse based on files already present in the export directory.
    Export,
}

/// How a failed job is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrHow {
    /// Mark the job failed; siblings still complete.
    #[default]
    Terminate,
    /// Mark the job done anyway, with a warning.
    Ignore,
    /// Reset and resubmit up to the configured retry count.
    Retry,
    /// Stop submitting new jobs, wait for running ones, fail the pipeline.
    Halt,
}

impl ErrHow {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "terminate" => Some(ErrHow::Terminate),
            "ignore" => Some(ErrHow::Ignore),
            "retry" => Some(ErrHow::Retry),
            "halt" => Some(ErrHow::Halt),
            _ => None,
        }
    }
}

/// How outputs are placed into the export directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportMode {
    #[default]
    Move,
    Copy,
    Link,
    /// File -> `.gz`, directory -> `.tgz`.
    Gz,
}

impl ExportMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "move" => Some(ExportMode::Move),
            "copy" => Some(ExportMode::Copy),
            "link" | "symlink" => Some(ExportMode::Link),
            "gz" | "gzip" => Some(ExportMode::Gz),
            _ => None,
        }
    }
}

/// Execution backend selector. The backend set is closed: new kinds require
/// a new enum variant, not runtime registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunnerKind {
    #[default]
    Local,
    Ssh,
    Sge,
    Slurm,
}

impl RunnerKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(RunnerKind::Local),
            "ssh" => Some(RunnerKind::Ssh),
            "sge" => Some(RunnerKind::Sge),
            "slurm" => Some(RunnerKind::Slurm),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunnerKind::Local => "local",
            RunnerKind::Ssh => "ssh",
            RunnerKind::Sge => "sge",
            RunnerKind::Slurm => "slurm",
        }
    }
}

/// Echo selection for one output stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EchoStream {
    /// Do not echo this stream.
    #[default]
    Off,
    /// Echo every line.
    All,
    /// Echo lines matching the regex.
    Filtered(String),
}

impl EchoStream {
    pub fn enabled(&self) -> bool {
        !matches!(self, EchoStream::Off)
    }
}

/// Which jobs echo which streams to the log while running.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EchoSpec {
    /// Indexes of jobs whose output is echoed.
    pub jobs: Vec<usize>,
    pub stdout: EchoStream,
    pub stderr: EchoStream,
}

impl EchoSpec {
    /// Echo both streams of the first job.
    pub fn first_job() -> Self {
        Self {
            jobs: vec![0],
            stdout: EchoStream::All,
            stderr: EchoStream::All,
        }
    }

    pub fn echoes(&self, index: usize) -> bool {
        self.jobs.contains(&index) && (self.stdout.enabled() || self.stderr.enabled())
    }
}

/// Typed configuration of one process.
///
/// Backend-specific options (`sge.*`, `servers`, ...) live in the
/// `runner_opts` map and are validated lazily by the owning backend.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub id: String,
    pub tag: String,
    pub desc: String,

    /// Parent directory for generated workdirs.
    pub ppldir: PathBuf,
    /// Explicit workdir; generated under `ppldir` when unset.
    pub workdir: Option<PathBuf>,

    /// Concurrency cap on simultaneously running jobs.
    pub forks: usize,
    /// Worker threads for the job build phase.
    pub nthread: usize,

    pub cache: CacheMode,
    /// Expand directories recursively when computing signatures.
    pub dirsig: bool,

    pub errhow: ErrHow,
    /// Retry attempts when `errhow` is retry.
    pub errntry: usize,

    /// Return codes counted as success.
    pub rcs: Vec<i32>,

    pub echo: EchoSpec,

    /// Export directory; export is skipped when unset.
    pub exdir: Option<PathBuf>,
    pub exhow: ExportMode,
    /// Overwrite existing export destinations.
    pub exow: bool,
    /// Partial-export selectors: output keys or glob patterns.
    pub expart: Vec<Template>,

    /// Expectation command template; non-zero exit fails the job.
    pub expect: Option<Template>,

    pub script: Template,
    pub lang: String,

    pub runner: RunnerKind,
    pub runner_opts: HashMap<String, Value>,

    /// Ordered input schema: name -> kind.
    pub input_schema: Vec<(String, InKind)>,
    /// Ordered output schema: name -> kind + path/value expression.
    pub output_schema: Vec<(String, OutKind, Template)>,
}

impl ProcessConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            tag: "notag".to_string(),
            desc: "No description".to_string(),
            ppldir: PathBuf::from("./workdir"),
            workdir: None,
            forks: 1,
            nthread: (num_cpus::get() / 2).clamp(1, 16),
            cache: CacheMode::On,
            dirsig: true,
            errhow: ErrHow::Terminate,
            errntry: 3,
            rcs: vec![0],
            echo: EchoSpec::default(),
            exdir: None,
            exhow: ExportMode::Move,
            exow: true,
            expart: Vec::new(),
            expect: None,
            script: Template::new(""),
            lang: "bash".to_string(),
            runner: RunnerKind::Local,
            runner_opts: HashMap::new(),
            input_schema: Vec::new(),
            output_schema: Vec::new(),
        }
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Template::new(script);
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, kind: InKind) -> Self {
        self.input_schema.push((name.into(), kind));
        self
    }

    pub fn with_output(
        mut self,
        name: impl Into<String>,
        kind: OutKind,
        expr: impl Into<String>,
    ) -> Self {
        self.output_schema
            .push((name.into(), kind, Template::new(expr)));
        self
    }

    pub fn with_forks(mut self, forks: usize) -> Self {
        self.forks = forks.max(1);
        self
    }

    pub fn with_runner(mut self, runner: RunnerKind) -> Self {
        self.runner = runner;
        self
    }

    /// Display name: `id` or `id.tag` for non-default tags.
    pub fn name(&self) -> String {
        if self.tag == "notag" {
            self.id.clone()
        } else {
            format!("{}.{}", self.id, self.tag)
        }
    }

    /// Short stable fingerprint of the process definition, used in the
    /// generated workdir name and default queue job names.
    pub fn suffix(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.id.hash(&mut hasher);
        self.tag.hash(&mut hasher);
        self.script.source().hash(&mut hasher);
        for (name, _) in &self.input_schema {
            name.hash(&mut hasher);
        }
        for (name, _, tpl) in &self.output_schema {
            name.hash(&mut hasher);
            tpl.source().hash(&mut hasher);
        }
        format!("{:08x}", hasher.finish() as u32)
    }

    /// The effective working directory for this process.
    pub fn resolve_workdir(&self) -> PathBuf {
        match &self.workdir {
            Some(dir) => dir.clone(),
            None => self
                .ppldir
                .join(format!("{}.{}.{}", self.id, self.tag, self.suffix())),
        }
    }
}

/// A process plus its run-time state.
#[derive(Debug, Clone)]
pub struct Process {
    pub cfg: Arc<ProcessConfig>,
    /// Output channel collected after a successful run.
    out_channel: Channel,
}

impl Process {
    pub fn new(cfg: ProcessConfig) -> Self {
        Self {
            cfg: Arc::new(cfg),
            out_channel: Channel::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.cfg.id
    }

    pub fn name(&self) -> String {
        self.cfg.name()
    }

    pub fn out_channel(&self) -> &Channel {
        &self.out_channel
    }

    /// Runs every job of this process against the given input channel.
    ///
    /// The input channel's width must match the declared input schema; its
    /// row count defines the job count. On success the collected output
    /// channel is stored for dependent processes.
    pub fn run(&mut self, input: Channel, dry_run: bool) -> Result<(), PipelineError> {
        if !self.cfg.input_schema.is_empty()
            && !input.is_empty()
            && input.width() != self.cfg.input_schema.len()
        {
            return Err(PipelineError::ChannelMismatch {
                proc: self.name(),
                reason: format!(
                    "input channel has {} columns but {} inputs are declared",
                    input.width(),
                    self.cfg.input_schema.len()
                ),
            });
        }

        let workdir = self.cfg.resolve_workdir();
        fs::create_dir_all(&workdir)?;
        info!("Workdir: {}", workdir.display());

        let size = if self.cfg.input_schema.is_empty() {
            // A process without inputs still runs a single job.
            1
        } else {
            input.len()
        };

        let mut mgr = Jobmgr::new(Arc::clone(&self.cfg), &workdir, &input, size)?;
        mgr.run(dry_run)?;
        self.out_channel = mgr.output_channel();
        Ok(())
    }
}
