//! Job Manager
//!
//! Per-process orchestrator that drives every job of one process to
//! completion: a bounded worker pool builds and cache-checks jobs
//! concurrently, then a single polling loop submits runnable jobs against
//! the configured backend under the `forks` concurrency cap, classifies
//! terminations, applies the error policy and aggregates process success.
//!
//! Build errors travel back to the coordinator over a channel and abort
//! the whole run: they indicate a structurally broken process definition,
//! not a transient job failure.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use regex::Regex;

use crate::error::PipelineError;
use crate::pipeline::channel::{Channel, ChannelValue};
use crate::pipeline::process::{EchoStream, ErrHow, OutKind, ProcessConfig};
use crate::runner::{self, Runner, Submission};

use super::model::{Job, JobState, ReturnCode};

/// Manager-side status of one job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    /// Built, waiting in the submission queue.
    Pending,
    /// Reusing previous results; never submitted.
    Cached,
    Running,
    /// Terminated successfully (or failure was ignored).
    Done,
    /// Failed but the error policy is `ignore`.
    DoneIgnored,
    /// Terminally failed.
    Failed(ReturnCode),
}

/// Per-stream echo cursor: byte offset plus the trailing partial line, so
/// lines split across polls are neither duplicated nor truncated.
#[derive(Default)]
struct EchoState {
    out_pos: u64,
    out_partial: String,
    err_pos: u64,
    err_partial: String,
}

pub struct Jobmgr {
    cfg: Arc<ProcessConfig>,
    jobs: Vec<Arc<Mutex<Job>>>,
    runner: Box<dyn Runner>,
    statuses: Vec<JobStatus>,
    /// Test override of the backend poll interval.
    poll_interval: Option<Duration>,
}

impl Jobmgr {
    /// Creates the manager and its jobs (one per input row).
    pub fn new(
        cfg: Arc<ProcessConfig>,
        workdir: &Path,
        input: &Channel,
        size: usize,
    ) -> Result<Self, PipelineError> {
        let runner = runner::create(&cfg)?;
        let jobs = (0..size)
            .map(|index| {
                let row: Vec<ChannelValue> =
                    input.row(index).map(|r| r.to_vec()).unwrap_or_default();
                Arc::new(Mutex::new(Job::new(
                    index,
                    Arc::clone(&cfg),
                    workdir,
                    row,
                    size,
                )))
            })
            .collect();

        Ok(Self {
            cfg,
            jobs,
            runner,
            statuses: vec![JobStatus::Pending; size],
            poll_interval: None,
        })
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = Some(interval);
    }

    pub fn statuses(&self) -> &[JobStatus] {
        &self.statuses
    }

    pub fn size(&self) -> usize {
        self.jobs.len()
    }

    /// Builds all jobs, then submits and polls the non-cached ones.
    pub fn run(&mut self, dry_run: bool) -> Result<(), PipelineError> {
        self.build_all()?;

        let cached = self
            .statuses
            .iter()
            .filter(|s| **s == JobStatus::Cached)
            .count();
        if cached == self.jobs.len() {
            info!("All {} jobs cached, nothing to run", cached);
            return Ok(());
        }
        if cached > 0 {
            info!("{} of {} jobs cached", cached, self.jobs.len());
        }

        if dry_run {
            self.dry_run_all()?;
            return Ok(());
        }

        self.execute()?;
        self.aggregate()
    }

    /// Output channel in job order, for dependent processes.
    pub fn output_channel(&self) -> Channel {
        let mut chan = Channel::new();
        for job in &self.jobs {
            let job = job.lock().expect("job mutex poisoned");
            chan.push_row(job.output_values());
        }
        chan
    }

    // ------------------------------------------------------------------
    // Build phase
    // ------------------------------------------------------------------

    /// Drains a shared queue of build tasks with `nthread` workers. The
    /// first build error aborts the run; remaining workers stop early.
    fn build_all(&mut self) -> Result<(), PipelineError> {
        let size = self.jobs.len();
        let nworkers = self.cfg.nthread.min(size).max(1);
        info!(
            "Building {} jobs with {} threads",
            size, nworkers
        );

        let queue: Arc<Mutex<VecDeque<usize>>> =
            Arc::new(Mutex::new((0..size).collect()));
        let abort = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel::<(usize, Result<bool, PipelineError>)>();

        let mut workers = Vec::with_capacity(nworkers);
        for _ in 0..nworkers {
            let queue = Arc::clone(&queue);
            let abort = Arc::clone(&abort);
            let tx = tx.clone();
            let jobs: Vec<Arc<Mutex<Job>>> = self.jobs.iter().map(Arc::clone).collect();

            workers.push(thread::spawn(move || {
                loop {
                    if abort.load(Ordering::Relaxed) {
                        break;
                    }
                    let index = {
                        let mut q = queue.lock().expect("build queue poisoned");
                        q.pop_front()
                    };
                    let Some(index) = index else { break };

                    let result = jobs[index].lock().expect("job mutex poisoned").build();
                    let failed = result.is_err();
                    if tx.send((index, result)).is_err() {
                        break;
                    }
                    if failed {
                        break;
                    }
                }
            }));
        }
        drop(tx);

        let mut first_err = None;
        while let Ok((index, result)) = rx.recv() {
            match result {
                Ok(true) => self.statuses[index] = JobStatus::Cached,
                Ok(false) => self.statuses[index] = JobStatus::Pending,
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                    abort.store(true, Ordering::Relaxed);
                }
            }
        }
        for worker in workers {
            worker
                .join()
                .map_err(|_| PipelineError::Runner("build worker panicked".to_string()))?;
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Dry run
    // ------------------------------------------------------------------

    /// Touches declared outputs instead of running the real command.
    fn dry_run_all(&mut self) -> Result<(), PipelineError> {
        for (index, slot) in self.jobs.iter().enumerate() {
            if self.statuses[index] == JobStatus::Cached {
                continue;
            }
            let mut job = slot.lock().expect("job mutex poisoned");
            println!();
            println!("[DRY RUN] {} job {}", self.cfg.name(), index);
            for (name, entry) in &job.output {
                match entry.kind {
                    OutKind::File => {
                        if !Path::new(&entry.data).exists() {
                            fs::write(&entry.data, b"")?;
                        }
                        println!("  would create file: {} ({})", entry.data, name);
                    }
                    OutKind::Dir => {
                        fs::create_dir_all(&entry.data)?;
                        println!("  would create dir:  {} ({})", entry.data, name);
                    }
                    _ => {}
                }
            }
            job.write_rc(0)?;
            job.state = JobState::Succeeded;
            self.statuses[index] = JobStatus::Done;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Submission and polling
    // ------------------------------------------------------------------

    fn execute(&mut self) -> Result<(), PipelineError> {
        let interval = self
            .poll_interval
            .unwrap_or_else(|| self.runner.poll_interval());
        let forks = self.cfg.forks.max(1);

        // Priority queue keyed (batch, index): retries enter later batches
        // so already-running batches drain before new ones start.
        let mut queue: BinaryHeap<Reverse<(usize, usize)>> = self
            .statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == JobStatus::Pending)
            .map(|(index, _)| Reverse((0, index)))
            .collect();
        let mut next_batch = 1;

        let mut running: Vec<usize> = Vec::new();
        let mut halted = false;
        let mut echo_states: HashMap<usize, EchoState> = HashMap::new();
        let out_filter = compile_filter(&self.cfg.echo.stdout);
        let err_filter = compile_filter(&self.cfg.echo.stderr);

        loop {
            while !halted && running.len() < forks {
                let Some(Reverse((_, index))) = queue.pop() else {
                    break;
                };
                match self.submit_one(index) {
                    Ok(()) => {
                        self.statuses[index] = JobStatus::Running;
                        echo_states.insert(index, EchoState::default());
                        running.push(index);
                    }
                    Err(diagnostic) => {
                        warn!(
                            "{} Submission failed: {}",
                            self.job_tag(index),
                            diagnostic.trim()
                        );
                        self.append_stderr(index, &diagnostic);
                        self.handle_failure(
                            index,
                            ReturnCode::submit_failed(),
                            &mut queue,
                            &mut next_batch,
                            &mut halted,
                            &mut echo_states,
                        )?;
                    }
                }
            }

            if running.is_empty() && (halted || queue.is_empty()) {
                break;
            }

            thread::sleep(interval);

            let polled = std::mem::take(&mut running);
            for index in polled {
                self.flush_echo(index, &mut echo_states, &out_filter, &err_filter, false);

                let alive = {
                    let job = self.jobs[index].lock().expect("job mutex poisoned");
                    self.runner.is_running(&job)
                };
                if alive {
                    running.push(index);
                    continue;
                }

                self.flush_echo(index, &mut echo_states, &out_filter, &err_filter, true);
                let (verdict, ok) = {
                    let job = self.jobs[index].lock().expect("job mutex poisoned");
                    let verdict = job.verdict();
                    (verdict, verdict.succeeded(&self.cfg.rcs))
                };
                if ok {
                    let mut job = self.jobs[index].lock().expect("job mutex poisoned");
                    job.done(false)?;
                    debug!("{} Done. Return code: {}.", job.log_tag(), verdict);
                    drop(job);
                    self.statuses[index] = JobStatus::Done;
                } else {
                    self.handle_failure(
                        index,
                        verdict,
                        &mut queue,
                        &mut next_batch,
                        &mut halted,
                        &mut echo_states,
                    )?;
                }
            }
        }

        if halted {
            let unrun = queue.len();
            if unrun > 0 {
                warn!(
                    "Halted: {} queued jobs were never submitted",
                    unrun
                );
            }
        }
        Ok(())
    }

    /// Wraps and submits one job.
    fn submit_one(&self, index: usize) -> Result<(), String> {
        let job = self.jobs[index].lock().expect("job mutex poisoned");
        self.runner
            .wrap(&job)
            .map_err(|e| format!("cannot write wrapper: {}", e))?;
        match self.runner.submit(&job) {
            Submission::Accepted(handle) => {
                debug!("{} Submitted, handle {}", job.log_tag(), handle.id);
                Ok(())
            }
            Submission::Failed { diagnostic } => Err(diagnostic),
        }
    }

    /// Applies the error policy to one failed job.
    fn handle_failure(
        &mut self,
        index: usize,
        verdict: ReturnCode,
        queue: &mut BinaryHeap<Reverse<(usize, usize)>>,
        next_batch: &mut usize,
        halted: &mut bool,
        echo_states: &mut HashMap<usize, EchoState>,
    ) -> Result<(), PipelineError> {
        let total_failed = self.failed_count() + 1;

        match self.cfg.errhow {
            ErrHow::Ignore => {
                let job = self.jobs[index].lock().expect("job mutex poisoned");
                job.show_error(total_failed, &verdict);
                self.statuses[index] = JobStatus::DoneIgnored;
            }
            ErrHow::Retry => {
                let mut job = self.jobs[index].lock().expect("job mutex poisoned");
                let ntry = job.ntry + 1;
                if ntry <= self.cfg.errntry {
                    warn!(
                        "{} Failed (rc {}), retrying [{}/{}]",
                        job.log_tag(),
                        verdict,
                        ntry,
                        self.cfg.errntry
                    );
                    job.reset(ntry)?;
                    drop(job);
                    echo_states.remove(&index);
                    self.statuses[index] = JobStatus::Pending;
                    queue.push(Reverse((*next_batch, index)));
                    *next_batch += 1;
                } else {
                    job.show_error(total_failed, &verdict);
                    drop(job);
                    self.statuses[index] = JobStatus::Failed(verdict);
                }
            }
            ErrHow::Halt => {
                let job = self.jobs[index].lock().expect("job mutex poisoned");
                job.show_error(total_failed, &verdict);
                drop(job);
                self.statuses[index] = JobStatus::Failed(verdict);
                if !*halted {
                    warn!("Pipeline will halt: no new jobs will be submitted");
                    *halted = true;
                }
            }
            ErrHow::Terminate => {
                let job = self.jobs[index].lock().expect("job mutex poisoned");
                job.show_error(total_failed, &verdict);
                drop(job);
                self.statuses[index] = JobStatus::Failed(verdict);
            }
        }
        Ok(())
    }

    /// A process succeeds iff every job resolved to done (possibly via
    /// ignore or retry).
    fn aggregate(&self) -> Result<(), PipelineError> {
        let failed = self
            .statuses
            .iter()
            .filter(|s| !matches!(s, JobStatus::Done | JobStatus::DoneIgnored | JobStatus::Cached))
            .count();
        if failed > 0 {
            return Err(PipelineError::ProcessFailed {
                proc: self.cfg.name(),
                failed,
                total: self.jobs.len(),
            });
        }
        Ok(())
    }

    fn failed_count(&self) -> usize {
        self.statuses
            .iter()
            .filter(|s| matches!(s, JobStatus::Failed(_)))
            .count()
    }

    fn job_tag(&self, index: usize) -> String {
        self.jobs[index]
            .lock()
            .expect("job mutex poisoned")
            .log_tag()
    }

    fn append_stderr(&self, index: usize, diagnostic: &str) {
        let job = self.jobs[index].lock().expect("job mutex poisoned");
        let previous = fs::read_to_string(&job.errfile).unwrap_or_default();
        let _ = fs::write(&job.errfile, format!("{}{}", previous, diagnostic));
    }

    /// Flushes newly-appended stdout/stderr of an echoing job to the log.
    fn flush_echo(
        &self,
        index: usize,
        states: &mut HashMap<usize, EchoState>,
        out_filter: &Option<Regex>,
        err_filter: &Option<Regex>,
        finished: bool,
    ) {
        if !self.cfg.echo.jobs.contains(&index) {
            return;
        }
        let Some(state) = states.get_mut(&index) else {
            return;
        };
        let (outfile, errfile, tag) = {
            let job = self.jobs[index].lock().expect("job mutex poisoned");
            (job.outfile.clone(), job.errfile.clone(), job.log_tag())
        };

        if self.cfg.echo.stdout.enabled() {
            for line in drain_stream(
                &outfile,
                &mut state.out_pos,
                &mut state.out_partial,
                finished,
            ) {
                if out_filter.as_ref().map_or(true, |re| re.is_match(&line)) {
                    info!("{} {}", tag, line);
                }
            }
        }
        if self.cfg.echo.stderr.enabled() {
            for line in drain_stream(
                &errfile,
                &mut state.err_pos,
                &mut state.err_partial,
                finished,
            ) {
                if err_filter.as_ref().map_or(true, |re| re.is_match(&line)) {
                    error!("{} {}", tag, line);
                }
            }
        }
    }
}

/// Reads newly-appended content of one stream and returns the complete
/// lines. A trailing partial line stays buffered until the next poll; at
/// `finished` it is flushed as the last line.
fn drain_stream(path: &Path, pos: &mut u64, partial: &mut String, finished: bool) -> Vec<String> {
    let mut lines = Vec::new();

    if let Ok(mut file) = File::open(path) {
        if file.seek(SeekFrom::Start(*pos)).is_ok() {
            let mut fresh = String::new();
            if file.read_to_string(&mut fresh).is_ok() {
                *pos += fresh.len() as u64;
                partial.push_str(&fresh);
            }
        }
    }

    while let Some(nl) = partial.find('\n') {
        lines.push(partial[..nl].to_string());
        *partial = partial[nl + 1..].to_string();
    }
    if finished && !partial.is_empty() {
        lines.push(std::mem::take(partial));
    }
    lines
}

fn compile_filter(stream: &EchoStream) -> Option<Regex> {
    match stream {
        EchoStream::Filtered(pattern) => Regex::new(pattern).ok(),
        _ => None,
    }
}
