//! Job Lifecycle
//!
//! One job is one concrete execution of a process script against one input
//! row. The job owns its directory layout, materializes inputs, renders
//! outputs and the script, decides cache reuse, interprets return codes,
//! exports results and archives artifacts between retries.
//!
//! # Directory layout
//!
//! ```text
//! <workdir>/<index+1>/
//!     input/        materialized input files
//!     output/       declared outputs
//!     job.script    rendered script
//!     job.rc        return code (plain integer text)
//!     job.stdout    captured stdout
//!     job.stderr    captured stderr
//!     job.cache     JSON cache signature
//!     job.pid       backend pid or queue job id
//!     retry.<n>/    archived artifacts of a prior attempt
//! ```

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::{json, Value};

use crate::error::PipelineError;
use crate::pipeline::channel::ChannelValue;
use crate::pipeline::process::{CacheMode, ErrHow, ExportMode, InKind, OutKind, ProcessConfig};

use super::signature::{path_sig, CacheSignature, FileSig};

/// Maximum stderr lines echoed for a failing job.
const MAX_STDERR_LINES: usize = 20;

/// Lifecycle states of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Init,
    InputReady,
    OutputReady,
    ScriptReady,
    /// Previous results are reused; the job will not be submitted.
    Cached,
    /// Built and waiting for submission.
    Pending,
    Submitted,
    Running,
    Succeeded,
    Failed,
    /// Succeeded and outputs placed into the export directory.
    Exported,
}

/// Why a job's recorded return code counts as a failure, beyond the bare
/// exit code itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcReason {
    /// Nothing special: judge by the bare exit code alone.
    Normal,
    /// The rc file was never written (trap never fired).
    NotGenerated,
    /// A declared output file or directory is missing.
    OutfileNotGenerated,
    /// The configured expectation command failed.
    ExpectationNotMet,
    /// The backend rejected the submission.
    SubmitFailed,
}

/// A classified return code: the bare exit code plus the failure reason.
/// Replaces sentinel-bit overlays with an explicit tagged value; only the
/// bare code is persisted (in `job.rc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnCode {
    pub exit: Option<i32>,
    pub reason: RcReason,
}

impl ReturnCode {
    pub fn submit_failed() -> Self {
        Self {
            exit: None,
            reason: RcReason::SubmitFailed,
        }
    }

    /// True iff the bare code is in the valid set and no reason flags a
    /// failure.
    pub fn succeeded(&self, valid: &[i32]) -> bool {
        self.reason == RcReason::Normal
            && self.exit.map_or(false, |code| valid.contains(&code))
    }
}

impl std::fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.exit {
            Some(code) => write!(f, "{}", code)?,
            None => write!(f, "-")?,
        }
        match self.reason {
            RcReason::Normal => Ok(()),
            RcReason::NotGenerated => write!(f, " (rcfile not generated)"),
            RcReason::OutfileNotGenerated => write!(f, " (outfile not generated)"),
            RcReason::ExpectationNotMet => write!(f, " (expectation not met)"),
            RcReason::SubmitFailed => write!(f, " (submission failed)"),
        }
    }
}

/// One resolved input entry.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInput {
    pub kind: InKind,
    /// Materialized value: the path inside `input/` for file kinds.
    pub data: ChannelValue,
    /// The original path(s) before materialization.
    pub orig: Option<ChannelValue>,
}

/// One resolved output entry.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutput {
    pub kind: OutKind,
    /// Rendered value: an absolute path for path kinds.
    pub data: String,
}

/// One unit of work of a process.
pub struct Job {
    pub index: usize,
    cfg: Arc<ProcessConfig>,
    /// Total number of jobs of the owning process.
    size: usize,
    row: Vec<ChannelValue>,

    pub dir: PathBuf,
    pub indir: PathBuf,
    pub outdir: PathBuf,
    pub script: PathBuf,
    pub rcfile: PathBuf,
    pub outfile: PathBuf,
    pub errfile: PathBuf,
    pub cachefile: PathBuf,
    pub pidfile: PathBuf,

    pub input: Vec<(String, JobInput)>,
    pub output: Vec<(String, JobOutput)>,
    /// Namespace exposed to the template collaborator: `job.*`, `i.*`, `o.*`.
    pub data: Value,

    pub state: JobState,
    /// Retry attempts consumed so far.
    pub ntry: usize,
}

impl Job {
    pub fn new(
        index: usize,
        cfg: Arc<ProcessConfig>,
        workdir: &Path,
        row: Vec<ChannelValue>,
        size: usize,
    ) -> Self {
        let dir = workdir.join((index + 1).to_string());
        let indir = dir.join("input");
        let outdir = dir.join("output");
        let script = dir.join("job.script");
        let rcfile = dir.join("job.rc");
        let outfile = dir.join("job.stdout");
        let errfile = dir.join("job.stderr");
        let cachefile = dir.join("job.cache");
        let pidfile = dir.join("job.pid");

        let data = json!({
            "job": {
                "index": index,
                "dir": dir.to_string_lossy(),
                "indir": indir.to_string_lossy(),
                "outdir": outdir.to_string_lossy(),
                "outfile": outfile.to_string_lossy(),
                "errfile": errfile.to_string_lossy(),
                "pidfile": pidfile.to_string_lossy(),
            },
            "i": {},
            "o": {},
        });

        Self {
            index,
            cfg,
            size,
            row,
            dir,
            indir,
            outdir,
            script,
            rcfile,
            outfile,
            errfile,
            cachefile,
            pidfile,
            input: Vec::new(),
            output: Vec::new(),
            data,
            state: JobState::Init,
            ntry: 0,
        }
    }

    pub fn cfg(&self) -> &ProcessConfig {
        &self.cfg
    }

    /// `[index/total]` log prefix, 1-based and zero-padded.
    pub fn log_tag(&self) -> String {
        let width = self.size.to_string().len();
        format!("[{:0width$}/{}]", self.index + 1, self.size)
    }

    // ------------------------------------------------------------------
    // Build phase
    // ------------------------------------------------------------------

    /// Prepares the job completely and decides cache reuse.
    ///
    /// Returns `true` when previous results are reused. Preparation errors
    /// are fatal to the whole run; the caller must abort, not skip.
    pub fn build(&mut self) -> Result<bool, PipelineError> {
        fs::create_dir_all(&self.indir)?;
        fs::create_dir_all(&self.outdir)?;
        touch(&self.outfile)?;
        touch(&self.errfile)?;

        self.prep_input()?;
        self.prep_output()?;
        self.prep_script()?;
        self.report();

        let cached = match self.cfg.cache {
            CacheMode::Off => false,
            CacheMode::On => self.is_cached(),
            CacheMode::Export => self.is_export_cached()?,
        };

        self.state = if cached {
            debug!("{} Job is cached, reusing previous results", self.log_tag());
            JobState::Cached
        } else {
            JobState::Pending
        };
        Ok(cached)
    }

    /// Materializes file inputs into `input/` and fills `data["i"]`.
    ///
    /// Basename collisions between distinct sources are resolved by
    /// inserting a `[n]` suffix before the extension; the same source is
    /// always materialized under the same name.
    fn prep_input(&mut self) -> Result<(), PipelineError> {
        let cfg = Arc::clone(&self.cfg);
        let row = self.row.clone();
        self.input.clear();

        let mut by_source: HashMap<String, String> = HashMap::new();
        let mut taken: HashSet<String> = HashSet::new();

        for (col, (name, kind)) in cfg.input_schema.iter().enumerate() {
            let value = row.get(col).cloned().unwrap_or_else(|| "".into());
            match kind {
                InKind::Var => {
                    let text = match &value {
                        ChannelValue::Str(s) => s.clone(),
                        ChannelValue::List(_) => {
                            return Err(PipelineError::input(
                                name,
                                "not a string for input type var",
                            ))
                        }
                    };
                    self.set_in(name, Value::String(text.clone()));
                    self.input.push((
                        name.clone(),
                        JobInput {
                            kind: *kind,
                            data: ChannelValue::Str(text),
                            orig: None,
                        },
                    ));
                }
                InKind::File => {
                    let source = match &value {
                        ChannelValue::Str(s) => s.clone(),
                        ChannelValue::List(_) => {
                            return Err(PipelineError::input(
                                name,
                                "not a string for input type file",
                            ))
                        }
                    };
                    let (indata, real) =
                        self.bring_in(name, &source, &mut by_source, &mut taken)?;
                    self.set_in(name, Value::String(indata.clone()));
                    self.set_in(&format!("IN_{}", name), Value::String(indata.clone()));
                    self.set_in(&format!("OR_{}", name), Value::String(source.clone()));
                    self.set_in(&format!("RL_{}", name), Value::String(real));
                    self.input.push((
                        name.clone(),
                        JobInput {
                            kind: *kind,
                            data: ChannelValue::Str(indata),
                            orig: Some(ChannelValue::Str(source)),
                        },
                    ));
                }
                InKind::Files => {
                    let sources = match &value {
                        ChannelValue::List(items) => items.clone(),
                        ChannelValue::Str(_) => {
                            return Err(PipelineError::input(
                                name,
                                "not a list for input type files",
                            ))
                        }
                    };
                    let mut materialized = Vec::new();
                    let mut reals = Vec::new();
                    for source in &sources {
                        let (indata, real) =
                            self.bring_in(name, source, &mut by_source, &mut taken)?;
                        materialized.push(indata);
                        reals.push(real);
                    }
                    self.set_in(&format!("IN_{}", name), json!(materialized));
                    self.set_in(&format!("OR_{}", name), json!(sources));
                    self.set_in(&format!("RL_{}", name), json!(reals));
                    self.set_in(name, json!(materialized));
                    self.input.push((
                        name.clone(),
                        JobInput {
                            kind: *kind,
                            data: ChannelValue::List(materialized),
                            orig: Some(ChannelValue::List(sources)),
                        },
                    ));
                }
            }
        }
        self.state = JobState::InputReady;
        Ok(())
    }

    /// Materializes one source path into `input/`; returns the materialized
    /// path and the resolved real path. Empty sources pass through empty.
    fn bring_in(
        &self,
        name: &str,
        source: &str,
        by_source: &mut HashMap<String, String>,
        taken: &mut HashSet<String>,
    ) -> Result<(String, String), PipelineError> {
        if source.is_empty() {
            return Ok((String::new(), String::new()));
        }
        let src_path = Path::new(source);
        if !src_path.exists() {
            return Err(PipelineError::input(
                name,
                format!("file does not exist: {}", source),
            ));
        }

        if let Some(basename) = by_source.get(source) {
            let dest = self.indir.join(basename);
            let real = real_path(src_path);
            return Ok((dest.to_string_lossy().to_string(), real));
        }

        let basename = src_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| source.to_string());

        let mut candidate = basename.clone();
        let mut n = 0;
        while taken.contains(&candidate) {
            n += 1;
            candidate = suffixed_name(&basename, n);
        }
        if candidate != basename {
            info!(
                "{} Input file renamed: {} -> {}",
                self.log_tag(),
                basename,
                candidate
            );
        }

        let dest = self.indir.join(&candidate);
        if dest.symlink_metadata().is_ok() {
            remove_any(&dest)?;
        }
        let abs = real_path(src_path);
        #[cfg(unix)]
        let linked = std::os::unix::fs::symlink(&abs, &dest).is_ok();
        #[cfg(not(unix))]
        let linked = false;
        if !linked {
            fs::copy(&abs, &dest)?;
        }

        by_source.insert(source.to_string(), candidate.clone());
        taken.insert(candidate);
        Ok((dest.to_string_lossy().to_string(), abs))
    }

    /// Renders output expressions and fills `data["o"]`.
    ///
    /// Path outputs must render to relative paths; they are resolved under
    /// `output/`. `stdout`/`stderr` outputs become symlinks to the job's
    /// own stdout/stderr files.
    fn prep_output(&mut self) -> Result<(), PipelineError> {
        let cfg = Arc::clone(&self.cfg);
        self.output.clear();

        for (name, kind, tpl) in &cfg.output_schema {
            let rendered = tpl.render(&self.data)?;
            let resolved = match kind {
                OutKind::Var => rendered,
                OutKind::File | OutKind::Dir => {
                    if Path::new(&rendered).is_absolute() {
                        return Err(PipelineError::output(
                            name,
                            format!("absolute path not allowed for output file/dir: {}", rendered),
                        ));
                    }
                    self.outdir.join(&rendered).to_string_lossy().to_string()
                }
                OutKind::Stdout | OutKind::Stderr => {
                    if Path::new(&rendered).is_absolute() {
                        return Err(PipelineError::output(
                            name,
                            format!("absolute path not allowed for output file/dir: {}", rendered),
                        ));
                    }
                    let link = self.outdir.join(&rendered);
                    let target = if *kind == OutKind::Stdout {
                        &self.outfile
                    } else {
                        &self.errfile
                    };
                    if link.symlink_metadata().is_ok() {
                        remove_any(&link)?;
                    }
                    #[cfg(unix)]
                    std::os::unix::fs::symlink(target, &link)?;
                    link.to_string_lossy().to_string()
                }
            };

            self.set_out(name, Value::String(resolved.clone()));
            self.output.push((
                name.clone(),
                JobOutput {
                    kind: *kind,
                    data: resolved,
                },
            ));
        }
        self.state = JobState::OutputReady;
        Ok(())
    }

    /// Renders the script; an unchanged rendering leaves the file (and its
    /// mtime) untouched so caching stays valid.
    fn prep_script(&mut self) -> Result<(), PipelineError> {
        let rendered = self.cfg.script.render(&self.data)?;
        let body = if rendered.starts_with("#!") {
            rendered
        } else {
            format!("#!/usr/bin/env {}\n{}", self.cfg.lang, rendered)
        };

        let existing = fs::read_to_string(&self.script).ok();
        match existing {
            Some(old) if old == body => {
                debug!("{} Script file unchanged", self.log_tag());
            }
            Some(_) => {
                info!(
                    "{} Script file updated: {}",
                    self.log_tag(),
                    self.script.display()
                );
                fs::write(&self.script, &body)?;
            }
            None => {
                fs::write(&self.script, &body)?;
            }
        }
        make_executable(&self.script)?;
        self.state = JobState::ScriptReady;
        Ok(())
    }

    /// Logs the resolved inputs and outputs of this job.
    fn report(&self) {
        for (name, entry) in &self.input {
            debug!(
                "{} input  {} => {}",
                self.log_tag(),
                name,
                display_value(&entry.data)
            );
        }
        for (name, entry) in &self.output {
            debug!("{} output {} => {}", self.log_tag(), name, entry.data);
        }
    }

    fn set_in(&mut self, key: &str, value: Value) {
        if let Some(map) = self.data["i"].as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    fn set_out(&mut self, key: &str, value: Value) {
        if let Some(map) = self.data["o"].as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    // ------------------------------------------------------------------
    // Cache
    // ------------------------------------------------------------------

    /// Computes the current signature; `None` when any component is
    /// unresolvable, which forces a rebuild.
    pub fn signature(&self) -> Option<CacheSignature> {
        let mut sig = CacheSignature::default();

        match path_sig(&self.script, false) {
            Some(s) => sig.script = s,
            None => {
                debug!("{} Empty signature because of script file", self.log_tag());
                return None;
            }
        }

        for (name, entry) in &self.input {
            match (&entry.kind, &entry.data) {
                (InKind::Var, ChannelValue::Str(v)) => {
                    sig.input.var.insert(name.clone(), v.clone());
                }
                (InKind::File, ChannelValue::Str(path)) => match file_sig(path, false) {
                    Some(s) => {
                        sig.input.file.insert(name.clone(), s);
                    }
                    None => {
                        debug!(
                            "{} Empty signature because of input file: {}",
                            self.log_tag(),
                            path
                        );
                        return None;
                    }
                },
                (InKind::Files, ChannelValue::List(paths)) => {
                    let mut sigs = Vec::with_capacity(paths.len());
                    for path in paths {
                        match file_sig(path, false) {
                            Some(s) => sigs.push(s),
                            None => {
                                debug!(
                                    "{} Empty signature because of one of input files: {}",
                                    self.log_tag(),
                                    path
                                );
                                return None;
                            }
                        }
                    }
                    sig.input.files.insert(name.clone(), sigs);
                }
                _ => {}
            }
        }

        for (name, entry) in &self.output {
            match entry.kind {
                OutKind::Var => {
                    sig.output.var.insert(name.clone(), entry.data.clone());
                }
                OutKind::File | OutKind::Stdout | OutKind::Stderr => {
                    match file_sig(&entry.data, false) {
                        Some(s) => {
                            sig.output.file.insert(name.clone(), s);
                        }
                        None => {
                            debug!(
                                "{} Empty signature because of output file: {}",
                                self.log_tag(),
                                entry.data
                            );
                            return None;
                        }
                    }
                }
                OutKind::Dir => match file_sig(&entry.data, self.cfg.dirsig) {
                    Some(s) => {
                        sig.output.dir.insert(name.clone(), s);
                    }
                    None => {
                        debug!(
                            "{} Empty signature because of output dir: {}",
                            self.log_tag(),
                            entry.data
                        );
                        return None;
                    }
                },
            }
        }

        Some(sig)
    }

    /// True when the cached signature exists, is whole and matches the
    /// current one. Every negative outcome is logged with its exact reason.
    fn is_cached(&self) -> bool {
        if !self.cachefile.exists() {
            debug!(
                "{} Not cached as cache file does not exist",
                self.log_tag()
            );
            return false;
        }
        let prev: CacheSignature = match fs::read_to_string(&self.cachefile)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
        {
            Some(sig) => sig,
            None => {
                debug!(
                    "{} Not cached because previous signature is empty",
                    self.log_tag()
                );
                return false;
            }
        };
        let Some(curr) = self.signature() else {
            return false;
        };
        match CacheSignature::compare(&prev, &curr) {
            Ok(()) => true,
            Err(reason) => {
                debug!("{} Not cached because {}", self.log_tag(), reason);
                false
            }
        }
    }

    /// Writes the current signature to `job.cache` (no-op when caching is
    /// disabled or the signature is not whole).
    pub fn cache(&self) -> Result<(), PipelineError> {
        if self.cfg.cache == CacheMode::Off {
            return Ok(());
        }
        if let Some(sig) = self.signature() {
            fs::write(&self.cachefile, serde_json::to_string(&sig)?.as_bytes())?;
        }
        Ok(())
    }

    /// Export-cache reuse: every expected output is already present in the
    /// export directory under the configured export method. Symlink export
    /// and partial export are never trusted.
    fn is_export_cached(&mut self) -> Result<bool, PipelineError> {
        if self.cfg.exhow == ExportMode::Link {
            warn!(
                "{} Job is not export-cached using symlink export",
                self.log_tag()
            );
            return Ok(false);
        }
        if !self.cfg.expart.is_empty() {
            warn!(
                "{} Job is not export-cached using partial export",
                self.log_tag()
            );
            return Ok(false);
        }
        let Some(exdir) = self.cfg.exdir.clone() else {
            debug!(
                "{} Job is not export-cached since export directory is not set",
                self.log_tag()
            );
            return Ok(false);
        };

        // All expected artifacts must be there before anything is restored.
        let mut restores = Vec::new();
        for (_, entry) in &self.output {
            if !entry.kind.is_path() {
                continue;
            }
            let local = PathBuf::from(&entry.data);
            let Some(name) = local.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            let expected = match self.cfg.exhow {
                ExportMode::Gz if entry.kind == OutKind::Dir => exdir.join(format!("{}.tgz", name)),
                ExportMode::Gz => exdir.join(format!("{}.gz", name)),
                _ => exdir.join(&name),
            };
            if !expected.exists() {
                debug!(
                    "{} Job is not export-cached since exported file does not exist: {}",
                    self.log_tag(),
                    expected.display()
                );
                return Ok(false);
            }
            restores.push((entry.kind, local, expected));
        }

        for (kind, local, exported) in restores {
            if local.exists() {
                continue;
            }
            match self.cfg.exhow {
                ExportMode::Gz if kind == OutKind::Dir => {
                    fs::create_dir_all(&local)?;
                    run_quiet(
                        "tar",
                        &[
                            "-xzf".as_ref(),
                            exported.as_os_str(),
                            "-C".as_ref(),
                            local.as_os_str(),
                        ],
                    )?;
                }
                ExportMode::Gz => {
                    let cmd = format!(
                        "gunzip -c {} > {}",
                        shquote(&exported.to_string_lossy()),
                        shquote(&local.to_string_lossy())
                    );
                    run_quiet("sh", &["-c".as_ref(), cmd.as_ref()])?;
                }
                _ => {
                    #[cfg(unix)]
                    std::os::unix::fs::symlink(&exported, &local)?;
                }
            }
        }

        self.write_rc(0)?;
        self.cache()?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Return code and verdict
    // ------------------------------------------------------------------

    /// Reads the bare return code; `None` when the file is absent or empty.
    pub fn read_rc(&self) -> Option<i32> {
        let text = fs::read_to_string(&self.rcfile).ok()?;
        text.trim().parse().ok()
    }

    pub fn write_rc(&self, code: i32) -> Result<(), PipelineError> {
        fs::write(&self.rcfile, format!("{}\n", code))?;
        Ok(())
    }

    pub fn read_pid(&self) -> Option<String> {
        let text = fs::read_to_string(&self.pidfile).ok()?;
        let text = text.trim().to_string();
        (!text.is_empty()).then_some(text)
    }

    pub fn write_pid(&self, pid: &str) -> Result<(), PipelineError> {
        fs::write(&self.pidfile, format!("{}\n", pid))?;
        Ok(())
    }

    /// Classifies the job's outcome after termination.
    ///
    /// The first violated condition wins: rc file missing, then declared
    /// output existence, then the expectation command. A bare code outside
    /// the valid set keeps reason `Normal`; `succeeded()` judges it.
    pub fn verdict(&self) -> ReturnCode {
        let Some(code) = self.read_rc() else {
            return ReturnCode {
                exit: None,
                reason: RcReason::NotGenerated,
            };
        };

        if !self.cfg.rcs.contains(&code) {
            return ReturnCode {
                exit: Some(code),
                reason: RcReason::Normal,
            };
        }

        for (_, entry) in &self.output {
            if entry.kind.is_path() && !Path::new(&entry.data).exists() {
                return ReturnCode {
                    exit: Some(code),
                    reason: RcReason::OutfileNotGenerated,
                };
            }
        }

        if let Some(expect) = &self.cfg.expect {
            if !expect.is_empty() {
                match expect.render(&self.data) {
                    Ok(cmd) => {
                        debug!("{} Checking expectation: {}", self.log_tag(), cmd);
                        let passed = Command::new("bash")
                            .arg("-c")
                            .arg(&cmd)
                            .output()
                            .map(|out| out.status.success())
                            .unwrap_or(false);
                        if !passed {
                            return ReturnCode {
                                exit: Some(code),
                                reason: RcReason::ExpectationNotMet,
                            };
                        }
                    }
                    Err(_) => {
                        return ReturnCode {
                            exit: Some(code),
                            reason: RcReason::ExpectationNotMet,
                        };
                    }
                }
            }
        }

        ReturnCode {
            exit: Some(code),
            reason: RcReason::Normal,
        }
    }

    /// True iff the job terminated successfully per the process config.
    pub fn succeed(&self) -> bool {
        self.verdict().succeeded(&self.cfg.rcs)
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Finalizes a successful job: refresh the cache signature and export
    /// outputs. Cached jobs skip the export (they already exported).
    pub fn done(&mut self, was_cached: bool) -> Result<(), PipelineError> {
        if !was_cached {
            self.cache()?;
            self.export()?;
            self.state = if self.cfg.exdir.is_some() {
                JobState::Exported
            } else {
                JobState::Succeeded
            };
        } else {
            self.state = JobState::Succeeded;
        }
        Ok(())
    }

    /// Places declared outputs into the export directory.
    ///
    /// Partial export selectors name either an output key or a glob over
    /// `output/`; zero matches is a no-op. A moved output leaves a symlink
    /// behind so dependent processes still resolve it.
    pub fn export(&self) -> Result<(), PipelineError> {
        let Some(exdir) = self.cfg.exdir.clone() else {
            return Ok(());
        };
        fs::create_dir_all(&exdir)?;

        let sources: Vec<PathBuf> = if self.cfg.expart.is_empty() {
            self.output
                .iter()
                .filter(|(_, entry)| entry.kind.is_path())
                .map(|(_, entry)| PathBuf::from(&entry.data))
                .collect()
        } else {
            let mut picked = Vec::new();
            for part in &self.cfg.expart {
                let rendered = part.render(&self.data)?;
                if let Some((_, entry)) = self
                    .output
                    .iter()
                    .find(|(name, entry)| *name == rendered && entry.kind.is_path())
                {
                    picked.push(PathBuf::from(&entry.data));
                } else {
                    picked.extend(glob_dir(&self.outdir, &rendered)?);
                }
            }
            picked
        };

        for source in sources {
            if !source.exists() {
                continue;
            }
            self.export_one(&source, &exdir)?;
        }
        Ok(())
    }

    fn export_one(&self, source: &Path, exdir: &Path) -> Result<(), PipelineError> {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let dest = match self.cfg.exhow {
            ExportMode::Gz if source.is_dir() => exdir.join(format!("{}.tgz", name)),
            ExportMode::Gz => exdir.join(format!("{}.gz", name)),
            _ => exdir.join(&name),
        };

        let real = real_path(source);
        if dest.exists() {
            if same_file(&dest, Path::new(&real)) {
                debug!(
                    "{} Export destination already is this file: {}",
                    self.log_tag(),
                    dest.display()
                );
                return Ok(());
            }
            if !self.cfg.exow {
                warn!(
                    "{} Export destination exists, skipped: {}",
                    self.log_tag(),
                    dest.display()
                );
                return Ok(());
            }
            warn!(
                "{} Overwriting export destination: {}",
                self.log_tag(),
                dest.display()
            );
            remove_any(&dest)?;
        }

        match self.cfg.exhow {
            ExportMode::Move => {
                move_path(Path::new(&real), &dest)?;
                if source.symlink_metadata().is_ok() {
                    remove_any(source)?;
                }
                #[cfg(unix)]
                std::os::unix::fs::symlink(&dest, source)?;
            }
            ExportMode::Copy => {
                copy_path(Path::new(&real), &dest)?;
            }
            ExportMode::Link => {
                #[cfg(unix)]
                std::os::unix::fs::symlink(&real, &dest)?;
            }
            ExportMode::Gz => {
                if Path::new(&real).is_dir() {
                    run_quiet(
                        "tar",
                        &[
                            "-czf".as_ref(),
                            dest.as_os_str(),
                            "-C".as_ref(),
                            real.as_ref(),
                            ".".as_ref(),
                        ],
                    )?;
                } else {
                    let cmd = format!(
                        "gzip -c {} > {}",
                        shquote(&real),
                        shquote(&dest.to_string_lossy())
                    );
                    run_quiet("sh", &["-c".as_ref(), cmd.as_ref()])?;
                }
            }
        }
        info!("{} Exported: {}", self.log_tag(), dest.display());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Retry
    // ------------------------------------------------------------------

    /// Archives the previous attempt and restores a clean slate.
    ///
    /// With `ntry >= 1` the rc/stdout/stderr/pid files and `output/` move
    /// into `retry.<ntry>/`; with `ntry == 0` stale artifacts are removed
    /// instead. Declared output dirs and stdout/stderr links are recreated.
    pub fn reset(&mut self, ntry: usize) -> Result<(), PipelineError> {
        self.ntry = ntry;

        if ntry > 0 {
            let retry_dir = self.dir.join(format!("retry.{}", ntry));
            if retry_dir.exists() {
                fs::remove_dir_all(&retry_dir)?;
            }
            fs::create_dir_all(&retry_dir)?;
            for file in [&self.rcfile, &self.outfile, &self.errfile, &self.pidfile] {
                let Some(name) = file.file_name() else { continue };
                if file.symlink_metadata().is_ok() {
                    move_path(file, &retry_dir.join(name))?;
                }
            }
            if self.outdir.exists() {
                let target = retry_dir.join("output");
                move_path(&self.outdir, &target)?;
            }
        } else {
            for entry in fs::read_dir(&self.dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with("retry.") {
                    fs::remove_dir_all(entry.path())?;
                }
            }
            for file in [&self.rcfile, &self.pidfile] {
                if file.symlink_metadata().is_ok() {
                    remove_any(file)?;
                }
            }
            if self.outdir.exists() {
                fs::remove_dir_all(&self.outdir)?;
            }
        }

        if self.rcfile.symlink_metadata().is_ok() {
            remove_any(&self.rcfile)?;
        }
        if self.pidfile.symlink_metadata().is_ok() {
            remove_any(&self.pidfile)?;
        }
        touch(&self.outfile)?;
        touch(&self.errfile)?;
        fs::create_dir_all(&self.outdir)?;

        for (_, entry) in &self.output {
            match entry.kind {
                OutKind::Dir => {
                    fs::create_dir_all(&entry.data)?;
                }
                OutKind::Stdout | OutKind::Stderr => {
                    let link = PathBuf::from(&entry.data);
                    let target = if entry.kind == OutKind::Stdout {
                        &self.outfile
                    } else {
                        &self.errfile
                    };
                    if link.symlink_metadata().is_ok() {
                        remove_any(&link)?;
                    }
                    #[cfg(unix)]
                    std::os::unix::fs::symlink(target, &link)?;
                }
                _ => {}
            }
        }

        self.state = JobState::Pending;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Error reporting
    // ------------------------------------------------------------------

    /// Logs the classified failure with a bounded stderr excerpt.
    pub fn show_error(&self, total_failed: usize, verdict: &ReturnCode) {
        let tag = self.log_tag();
        if self.cfg.errhow == ErrHow::Ignore {
            warn!(
                "{} Failed but ignored (totally {}). Return code: {}.",
                tag, total_failed, verdict
            );
            return;
        }

        error!(
            "{} Failed (totally {}). Return code: {}.",
            tag, total_failed, verdict
        );

        // Stderr already echoed live is not repeated here.
        if self.cfg.echo.jobs.contains(&self.index) && self.cfg.echo.stderr.enabled() {
            return;
        }

        let stderr = fs::read_to_string(&self.errfile).unwrap_or_default();
        if stderr.trim().is_empty() {
            error!("{} <EMPTY STDERR>", tag);
            return;
        }
        let lines: Vec<&str> = stderr.lines().collect();
        if lines.len() > MAX_STDERR_LINES {
            error!(
                "{} ... ({} earlier lines omitted)",
                tag,
                lines.len() - MAX_STDERR_LINES
            );
        }
        for line in lines.iter().rev().take(MAX_STDERR_LINES).rev() {
            error!("{} {}", tag, line);
        }
    }

    /// Output values in schema order, for the process output channel.
    pub fn output_values(&self) -> Vec<ChannelValue> {
        self.output
            .iter()
            .map(|(_, entry)| ChannelValue::Str(entry.data.clone()))
            .collect()
    }
}

// ----------------------------------------------------------------------
// Path helpers
// ----------------------------------------------------------------------

/// Signature of one file path; empty paths sign as `("", 0)` so optional
/// inputs do not invalidate the whole signature.
fn file_sig(path: &str, dirsig: bool) -> Option<FileSig> {
    if path.is_empty() {
        return Some((String::new(), 0));
    }
    path_sig(Path::new(path), dirsig)
}

fn touch(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        fs::write(path, b"")?;
    }
    Ok(())
}

fn make_executable(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Resolved real path; falls back to the given path when resolution fails.
fn real_path(path: &Path) -> String {
    fs::canonicalize(path)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| path.to_string_lossy().to_string())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(ra), Ok(rb)) => ra == rb,
        _ => false,
    }
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    let meta = path.symlink_metadata()?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Renames across filesystems by falling back to copy+remove.
fn move_path(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    copy_path(from, to)?;
    remove_any(from)
}

fn copy_path(from: &Path, to: &Path) -> std::io::Result<()> {
    if from.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_path(&entry.path(), &to.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        fs::copy(from, to).map(|_| ())
    }
}

/// Inserts `[n]` before the extension: `a.txt` -> `a[1].txt`, `dir` ->
/// `dir[1]`.
fn suffixed_name(basename: &str, n: usize) -> String {
    match basename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}[{}].{}", stem, n, ext),
        _ => format!("{}[{}]", basename, n),
    }
}

/// Minimal glob over the entries of one directory (`*` and `?` only).
fn glob_dir(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, PipelineError> {
    let mut regex_src = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => regex_src.push_str(".*"),
            '?' => regex_src.push('.'),
            c => regex_src.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex_src.push('$');
    let re = regex::Regex::new(&regex_src)
        .map_err(|e| PipelineError::output(pattern, format!("bad export pattern: {}", e)))?;

    let mut matches = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            if re.is_match(&entry.file_name().to_string_lossy()) {
                matches.push(entry.path());
            }
        }
    }
    matches.sort();
    Ok(matches)
}

fn shquote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

fn run_quiet(program: &str, args: &[&std::ffi::OsStr]) -> Result<(), PipelineError> {
    let out = Command::new(program).args(args).output()?;
    if !out.status.success() {
        return Err(PipelineError::Io(std::io::Error::other(format!(
            "{} failed: {}",
            program,
            String::from_utf8_lossy(&out.stderr)
        ))));
    }
    Ok(())
}

fn display_value(value: &ChannelValue) -> String {
    match value {
        ChannelValue::Str(s) => s.clone(),
        ChannelValue::List(items) if items.len() <= 3 => format!("[ {} ]", items.join(", ")),
        ChannelValue::List(items) => format!(
            "[ {}, ... ({}), {} ]",
            items[0],
            items.len() - 2,
            items[items.len() - 1]
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::process::ProcessConfig;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn job_with(cfg: ProcessConfig, workdir: &Path, row: Vec<ChannelValue>) -> Job {
        Job::new(0, Arc::new(cfg), workdir, row, 1)
    }

    #[test]
    fn test_job_paths() {
        let dir = tempdir().unwrap();
        let cfg = ProcessConfig::new("pInit");
        let job = Job::new(1, Arc::new(cfg), dir.path(), vec![], 2);

        assert_eq!(job.dir, dir.path().join("2"));
        assert_eq!(job.indir, dir.path().join("2").join("input"));
        assert_eq!(job.outdir, dir.path().join("2").join("output"));
        assert_eq!(job.script, dir.path().join("2").join("job.script"));
        assert_eq!(job.rcfile, dir.path().join("2").join("job.rc"));
        assert_eq!(job.outfile, dir.path().join("2").join("job.stdout"));
        assert_eq!(job.errfile, dir.path().join("2").join("job.stderr"));
        assert_eq!(job.cachefile, dir.path().join("2").join("job.cache"));
        assert_eq!(job.pidfile, dir.path().join("2").join("job.pid"));
        assert_eq!(job.state, JobState::Init);
    }

    #[test]
    fn test_log_tag_padding() {
        let dir = tempdir().unwrap();
        let cfg = ProcessConfig::new("p");
        let job = Job::new(1, Arc::new(cfg), dir.path(), vec![], 128);
        assert_eq!(job.log_tag(), "[002/128]");
    }

    #[test]
    fn test_build_materializes_file_input() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("data.txt");
        fs::write(&src, "payload").unwrap();

        let cfg = ProcessConfig::new("pIn")
            .with_input("infile", InKind::File)
            .with_script("cat {{i.infile}}");
        let workdir = dir.path().join("workdir");
        let mut job = job_with(cfg, &workdir, vec![src.to_string_lossy().to_string().into()]);

        let cached = job.build().unwrap();
        assert!(!cached);

        let materialized = workdir.join("1").join("input").join("data.txt");
        assert!(materialized.exists());
        assert_eq!(
            job.data["i"]["infile"].as_str().unwrap(),
            materialized.to_string_lossy()
        );
        assert_eq!(
            job.data["i"]["OR_infile"].as_str().unwrap(),
            src.to_string_lossy()
        );
        assert_eq!(
            job.data["i"]["IN_infile"].as_str().unwrap(),
            materialized.to_string_lossy()
        );
    }

    #[test]
    fn test_rename_collision() {
        let dir = tempdir().unwrap();
        let sub1 = dir.path().join("a");
        let sub2 = dir.path().join("b");
        fs::create_dir_all(&sub1).unwrap();
        fs::create_dir_all(&sub2).unwrap();
        let f1 = sub1.join("same.txt");
        let f2 = sub2.join("same.txt");
        fs::write(&f1, "1").unwrap();
        fs::write(&f2, "2").unwrap();

        let cfg = ProcessConfig::new("pCollide")
            .with_input("one", InKind::File)
            .with_input("two", InKind::File)
            .with_script("true");
        let workdir = dir.path().join("workdir");
        let mut job = job_with(
            cfg,
            &workdir,
            vec![
                f1.to_string_lossy().to_string().into(),
                f2.to_string_lossy().to_string().into(),
            ],
        );
        job.build().unwrap();

        let indir = workdir.join("1").join("input");
        assert!(indir.join("same.txt").exists());
        assert!(indir.join("same[1].txt").exists());
        assert_eq!(
            job.data["i"]["IN_two"].as_str().unwrap(),
            indir.join("same[1].txt").to_string_lossy()
        );
        assert_eq!(
            job.data["i"]["OR_two"].as_str().unwrap(),
            f2.to_string_lossy()
        );
    }

    #[test]
    fn test_same_source_reuses_name() {
        let dir = tempdir().unwrap();
        let f = dir.path().join("same.txt");
        fs::write(&f, "x").unwrap();
        let path = f.to_string_lossy().to_string();

        let cfg = ProcessConfig::new("pDup")
            .with_input("list", InKind::Files)
            .with_script("true");
        let workdir = dir.path().join("workdir");
        let mut job = job_with(
            cfg,
            &workdir,
            vec![ChannelValue::List(vec![path.clone(), path])],
        );
        job.build().unwrap();

        let materialized = job.data["i"]["IN_list"].as_array().unwrap();
        assert_eq!(materialized[0], materialized[1]);
    }

    #[test]
    fn test_missing_input_file_fails() {
        let dir = tempdir().unwrap();
        let cfg = ProcessConfig::new("pMissing")
            .with_input("infile", InKind::File)
            .with_script("true");
        let mut job = job_with(cfg, dir.path(), vec!["/no/such/file.txt".into()]);
        let err = job.build().unwrap_err();
        assert!(matches!(err, PipelineError::InputParse { .. }));
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_wrong_shape_inputs_fail() {
        let dir = tempdir().unwrap();
        let cfg = ProcessConfig::new("pShape")
            .with_input("v", InKind::Var)
            .with_script("true");
        let mut job = job_with(
            cfg,
            dir.path(),
            vec![ChannelValue::List(vec!["x".to_string()])],
        );
        assert!(matches!(
            job.build().unwrap_err(),
            PipelineError::InputParse { .. }
        ));

        let cfg = ProcessConfig::new("pShape2")
            .with_input("fs", InKind::Files)
            .with_script("true");
        let mut job = job_with(cfg, dir.path(), vec!["not-a-list".into()]);
        assert!(matches!(
            job.build().unwrap_err(),
            PipelineError::InputParse { .. }
        ));
    }

    #[test]
    fn test_absolute_output_rejected() {
        let dir = tempdir().unwrap();
        let cfg = ProcessConfig::new("pAbs")
            .with_input("a", InKind::Var)
            .with_output("out", OutKind::File, "/abs/{{i.a}}.txt")
            .with_script("true");
        let mut job = job_with(cfg, dir.path(), vec!["0".into()]);
        let err = job.build().unwrap_err();
        assert!(matches!(err, PipelineError::OutputParse { .. }));
        assert!(err.to_string().contains("absolute path"));
    }

    #[test]
    fn test_output_rendering_into_outdir() {
        let dir = tempdir().unwrap();
        let cfg = ProcessConfig::new("pOut")
            .with_input("a", InKind::Var)
            .with_output("res", OutKind::File, "{{i.a}}.out")
            .with_script("true");
        let workdir = dir.path().join("w");
        let mut job = job_with(cfg, &workdir, vec!["0".into()]);
        job.build().unwrap();

        let expected = workdir.join("1").join("output").join("0.out");
        assert_eq!(job.data["o"]["res"].as_str().unwrap(), expected.to_string_lossy());
    }

    #[test]
    fn test_stdout_output_links_to_job_stdout() {
        let dir = tempdir().unwrap();
        let cfg = ProcessConfig::new("pStd")
            .with_output("log", OutKind::Stdout, "run.log")
            .with_script("true");
        let workdir = dir.path().join("w");
        let mut job = job_with(cfg, &workdir, vec![]);
        job.build().unwrap();

        let link = workdir.join("1").join("output").join("run.log");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::canonicalize(&link).unwrap(), fs::canonicalize(&job.outfile).unwrap());
    }

    #[test]
    fn test_script_unchanged_preserves_file() {
        let dir = tempdir().unwrap();
        let cfg = ProcessConfig::new("pScript")
            .with_input("x", InKind::Var)
            .with_script("echo {{i.x}}");
        let workdir = dir.path().join("w");
        let mut job = job_with(cfg.clone(), &workdir, vec!["1".into()]);
        job.build().unwrap();
        let first = fs::read_to_string(&job.script).unwrap();

        // Rebuild with identical config: content must be identical and the
        // file untouched (same content implies no rewrite happened).
        let mut job2 = job_with(cfg, &workdir, vec!["1".into()]);
        job2.build().unwrap();
        assert_eq!(fs::read_to_string(&job2.script).unwrap(), first);
        assert!(first.starts_with("#!/usr/bin/env bash"));
    }

    #[test]
    fn test_rc_roundtrip() {
        let dir = tempdir().unwrap();
        let cfg = ProcessConfig::new("pRc");
        let job = job_with(cfg, dir.path(), vec![]);
        fs::create_dir_all(&job.dir).unwrap();

        assert_eq!(job.read_rc(), None);
        job.write_rc(-8).unwrap();
        assert_eq!(job.read_rc(), Some(-8));

        fs::write(&job.rcfile, "").unwrap();
        assert_eq!(job.read_rc(), None);
    }

    #[test]
    fn test_verdict_not_generated() {
        let dir = tempdir().unwrap();
        let cfg = ProcessConfig::new("pV");
        let job = job_with(cfg, dir.path(), vec![]);
        fs::create_dir_all(&job.dir).unwrap();

        let verdict = job.verdict();
        assert_eq!(verdict.reason, RcReason::NotGenerated);
        assert!(!verdict.succeeded(&[0]));
        assert_eq!(verdict.to_string(), "- (rcfile not generated)");
    }

    #[test]
    fn test_verdict_outfile_missing() {
        let dir = tempdir().unwrap();
        let cfg = ProcessConfig::new("pV2")
            .with_output("a", OutKind::File, "missing.out")
            .with_script("true");
        let workdir = dir.path().join("w");
        let mut job = job_with(cfg, &workdir, vec![]);
        job.build().unwrap();
        job.write_rc(0).unwrap();

        let verdict = job.verdict();
        assert_eq!(verdict.reason, RcReason::OutfileNotGenerated);
        assert!(!verdict.succeeded(&[0]));
        assert_eq!(verdict.to_string(), "0 (outfile not generated)");
    }

    #[test]
    fn test_verdict_expectation() {
        let dir = tempdir().unwrap();
        let mut cfg = ProcessConfig::new("pExpect")
            .with_output("a", OutKind::File, "whatever.out")
            .with_script("true");
        cfg.expect = Some(crate::template::Template::new("grep 1 \"{{o.a}}\""));
        let workdir = dir.path().join("w");
        let mut job = job_with(cfg, &workdir, vec![]);
        job.build().unwrap();

        let out = workdir.join("1").join("output").join("whatever.out");
        fs::write(&out, "123").unwrap();
        job.write_rc(0).unwrap();
        assert!(job.succeed());

        fs::write(&out, "456").unwrap();
        let verdict = job.verdict();
        assert_eq!(verdict.reason, RcReason::ExpectationNotMet);
        assert!(!job.succeed());
    }

    #[test]
    fn test_verdict_bad_code() {
        let dir = tempdir().unwrap();
        let cfg = ProcessConfig::new("pBad").with_script("true");
        let workdir = dir.path().join("w");
        let mut job = job_with(cfg, &workdir, vec![]);
        job.build().unwrap();
        job.write_rc(1).unwrap();

        let verdict = job.verdict();
        assert_eq!(verdict.reason, RcReason::Normal);
        assert!(!verdict.succeeded(&[0]));
        assert!(verdict.succeeded(&[0, 1]));
        assert_eq!(verdict.to_string(), "1");
    }

    #[test]
    fn test_cache_hit_and_script_invalidation() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("in.txt");
        fs::write(&src, "x").unwrap();
        let cfg = ProcessConfig::new("pCache")
            .with_input("a", InKind::File)
            .with_output("o", OutKind::File, "res.txt")
            .with_script("cp {{i.a}} {{o.o}}");
        let workdir = dir.path().join("w");
        let row = vec![ChannelValue::Str(src.to_string_lossy().to_string())];

        let mut job = job_with(cfg.clone(), &workdir, row.clone());
        assert!(!job.build().unwrap());

        // Simulate a successful run, then cache.
        fs::write(workdir.join("1").join("output").join("res.txt"), "x").unwrap();
        job.write_rc(0).unwrap();
        job.cache().unwrap();

        let mut again = job_with(cfg, &workdir, row.clone());
        assert!(again.build().unwrap());
        assert_eq!(again.state, JobState::Cached);

        // A changed script forces a rebuild. The cached signature is aged
        // backwards so the rewrite registers as newer despite whole-second
        // mtime resolution.
        let cachefile = workdir.join("1").join("job.cache");
        let mut sig: CacheSignature =
            serde_json::from_str(&fs::read_to_string(&cachefile).unwrap()).unwrap();
        sig.script.1 -= 10;
        fs::write(&cachefile, serde_json::to_string(&sig).unwrap()).unwrap();

        let mut bumped = job_with(
            ProcessConfig::new("pCache")
                .with_input("a", InKind::File)
                .with_output("o", OutKind::File, "res.txt")
                .with_script("cp {{i.a}} {{o.o}} # changed"),
            &workdir,
            row,
        );
        assert!(!bumped.build().unwrap());
    }

    #[test]
    fn test_export_copy_roundtrip() {
        let dir = tempdir().unwrap();
        let exdir = dir.path().join("exdir");
        let mut cfg = ProcessConfig::new("pExport")
            .with_output("a", OutKind::File, "whatever.txt")
            .with_script("true");
        cfg.exdir = Some(exdir.clone());
        cfg.exhow = ExportMode::Copy;
        cfg.exow = true;
        let workdir = dir.path().join("w");
        let mut job = job_with(cfg, &workdir, vec![]);
        job.build().unwrap();

        let local = workdir.join("1").join("output").join("whatever.txt");
        fs::write(&local, "content").unwrap();
        job.export().unwrap();

        let exported = exdir.join("whatever.txt");
        assert!(exported.is_file());
        assert!(local.is_file());
        assert!(!exported.symlink_metadata().unwrap().file_type().is_symlink());
        assert!(!local.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(&exported).unwrap(), "content");
    }

    #[test]
    fn test_export_move_leaves_symlink() {
        let dir = tempdir().unwrap();
        let exdir = dir.path().join("exdir");
        let mut cfg = ProcessConfig::new("pMove")
            .with_output("a", OutKind::File, "whatever.txt")
            .with_script("true");
        cfg.exdir = Some(exdir.clone());
        cfg.exhow = ExportMode::Move;
        let workdir = dir.path().join("w");
        let mut job = job_with(cfg, &workdir, vec![]);
        job.build().unwrap();

        let local = workdir.join("1").join("output").join("whatever.txt");
        fs::write(&local, "content").unwrap();
        job.export().unwrap();

        let exported = exdir.join("whatever.txt");
        assert!(exported.is_file());
        assert!(local.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(&local).unwrap(), "content");
    }

    #[test]
    fn test_export_partial_glob_no_match_is_noop() {
        let dir = tempdir().unwrap();
        let exdir = dir.path().join("exdir");
        let mut cfg = ProcessConfig::new("pPartial")
            .with_output("a", OutKind::File, "whatever.txt")
            .with_script("true");
        cfg.exdir = Some(exdir.clone());
        cfg.exhow = ExportMode::Copy;
        cfg.expart = vec![crate::template::Template::new("*.bam")];
        let workdir = dir.path().join("w");
        let mut job = job_with(cfg, &workdir, vec![]);
        job.build().unwrap();

        let local = workdir.join("1").join("output").join("whatever.txt");
        fs::write(&local, "content").unwrap();
        job.export().unwrap();
        assert!(!exdir.join("whatever.txt").exists());
    }

    #[test]
    fn test_export_partial_by_output_key() {
        let dir = tempdir().unwrap();
        let exdir = dir.path().join("exdir");
        let mut cfg = ProcessConfig::new("pPartKey")
            .with_output("a", OutKind::File, "keep.txt")
            .with_output("b", OutKind::File, "skip.txt")
            .with_script("true");
        cfg.exdir = Some(exdir.clone());
        cfg.exhow = ExportMode::Copy;
        cfg.expart = vec![crate::template::Template::new("a")];
        let workdir = dir.path().join("w");
        let mut job = job_with(cfg, &workdir, vec![]);
        job.build().unwrap();

        let outdir = workdir.join("1").join("output");
        fs::write(outdir.join("keep.txt"), "k").unwrap();
        fs::write(outdir.join("skip.txt"), "s").unwrap();
        job.export().unwrap();

        assert!(exdir.join("keep.txt").exists());
        assert!(!exdir.join("skip.txt").exists());
    }

    #[test]
    fn test_reset_archives_retry() {
        let dir = tempdir().unwrap();
        let cfg = ProcessConfig::new("pReset")
            .with_output("a", OutKind::File, "preset.txt")
            .with_output("b", OutKind::Dir, "preset.dir")
            .with_script("true");
        let workdir = dir.path().join("w");
        let mut job = job_with(cfg, &workdir, vec![]);
        job.build().unwrap();

        let outdir = workdir.join("1").join("output");
        fs::write(outdir.join("preset.txt"), "x").unwrap();
        fs::create_dir_all(outdir.join("preset.dir")).unwrap();
        job.write_rc(1).unwrap();
        job.write_pid("1234").unwrap();
        fs::write(&job.outfile, "out").unwrap();
        fs::write(&job.errfile, "err").unwrap();

        job.reset(1).unwrap();

        let retry = workdir.join("1").join("retry.1");
        assert!(retry.is_dir());
        assert!(retry.join("job.rc").exists());
        assert!(retry.join("job.stdout").exists());
        assert!(retry.join("job.stderr").exists());
        assert!(retry.join("job.pid").exists());
        assert!(retry.join("output").join("preset.txt").exists());

        assert!(!job.rcfile.exists());
        assert!(!job.pidfile.exists());
        assert!(job.outfile.exists());
        assert!(job.errfile.exists());
        assert!(outdir.exists());
        assert!(!outdir.join("preset.txt").exists());
        assert!(outdir.join("preset.dir").is_dir());
    }

    #[test]
    fn test_reset_zero_clears_stale_retries() {
        let dir = tempdir().unwrap();
        let cfg = ProcessConfig::new("pReset0").with_script("true");
        let workdir = dir.path().join("w");
        let mut job = job_with(cfg, &workdir, vec![]);
        job.build().unwrap();
        fs::create_dir_all(workdir.join("1").join("retry.8")).unwrap();
        job.write_rc(0).unwrap();

        job.reset(0).unwrap();
        assert!(!workdir.join("1").join("retry.8").exists());
        assert!(!job.rcfile.exists());
    }

    #[test]
    fn test_signature_missing_script_is_empty() {
        let dir = tempdir().unwrap();
        let cfg = ProcessConfig::new("pSig").with_script("true");
        let workdir = dir.path().join("w");
        let mut job = job_with(cfg, &workdir, vec![]);
        job.build().unwrap();
        fs::remove_file(&job.script).unwrap();
        assert!(job.signature().is_none());
    }

    #[test]
    fn test_signature_missing_output_is_empty() {
        let dir = tempdir().unwrap();
        let cfg = ProcessConfig::new("pSig2")
            .with_output("a", OutKind::File, "never-made.txt")
            .with_script("true");
        let workdir = dir.path().join("w");
        let mut job = job_with(cfg, &workdir, vec![]);
        job.build().unwrap();
        assert!(job.signature().is_none());
    }

    #[test]
    fn test_suffixed_name() {
        assert_eq!(suffixed_name("a.txt", 1), "a[1].txt");
        assert_eq!(suffixed_name("a.tar.gz", 2), "a.tar[2].gz");
        assert_eq!(suffixed_name("dir", 1), "dir[1]");
        assert_eq!(suffixed_name(".hidden", 3), ".hidden[3]");
    }

    #[test]
    fn test_glob_dir() {
        let dir = tempdir().unwrap();
        File::create(dir.path().join("a.txt")).unwrap();
        File::create(dir.path().join("b.txt")).unwrap();
        File::create(dir.path().join("c.bam")).unwrap();

        let txt = glob_dir(dir.path(), "*.txt").unwrap();
        assert_eq!(txt.len(), 2);
        let q = glob_dir(dir.path(), "?.bam").unwrap();
        assert_eq!(q.len(), 1);
        let none = glob_dir(dir.path(), "*.sam").unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_show_error_does_not_panic() {
        let dir = tempdir().unwrap();
        let cfg = ProcessConfig::new("pShow").with_script("true");
        let workdir = dir.path().join("w");
        let mut job = job_with(cfg, &workdir, vec![]);
        job.build().unwrap();
        let mut f = File::create(&job.errfile).unwrap();
        for i in 0..25 {
            writeln!(f, "Error{}", i).unwrap();
        }
        job.show_error(
            1,
            &ReturnCode {
                exit: Some(1),
                reason: RcReason::Normal,
            },
        );
    }
}
