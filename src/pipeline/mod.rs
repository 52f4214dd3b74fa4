//! Pipeline Orchestration
//!
//! Ties the pieces together: process configuration and data channels
//! ([`process`], [`channel`]), the dependency scheduler ([`tree`]) and the
//! YAML definition loader ([`parser`]). The [`Pipeline`] driver releases
//! processes strictly one at a time in scheduler order, wiring each
//! process's input channel from its dependencies' outputs.

pub mod channel;
pub mod parser;
pub mod process;
pub mod tree;

pub use channel::{Channel, ChannelValue};
pub use process::{Process, ProcessConfig};
pub use tree::{ProcTree, ResumeMark};

use std::time::Instant;

use log::{info, warn};

use crate::error::PipelineError;

/// A pipeline: processes plus their dependency graph.
#[derive(Debug, Default)]
pub struct Pipeline {
    procs: Vec<Process>,
    tree: ProcTree,
    /// Explicit input channels; empty channels are derived from
    /// dependencies at run time.
    inputs: Vec<Channel>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a process, optionally with an explicit input channel.
    pub fn add(&mut self, cfg: ProcessConfig, input: Option<Channel>) -> usize {
        let name = cfg.name();
        self.procs.push(Process::new(cfg));
        self.inputs.push(input.unwrap_or_default());
        self.tree.register(name)
    }

    /// Declares that `proc` requires `dep`.
    pub fn depends(&mut self, proc: usize, dep: usize) {
        self.tree.add_dependency(proc, dep);
    }

    pub fn process(&self, idx: usize) -> &Process {
        &self.procs[idx]
    }

    pub fn tree(&self) -> &ProcTree {
        &self.tree
    }

    /// Finds a process handle by id or `id.tag` name.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.procs
            .iter()
            .position(|p| p.id() == name || p.name() == name)
    }

    /// Sets the start processes; dependent candidates are dropped with a
    /// warning.
    pub fn start(&mut self, names: &[&str]) -> Result<(), PipelineError> {
        let mut handles = Vec::new();
        for name in names {
            let idx = self.find(name).ok_or_else(|| PipelineError::ProcRelation {
                route: name.to_string(),
                message: "no such process".to_string(),
            })?;
            handles.push(idx);
        }
        self.tree.set_starts(&handles);
        Ok(())
    }

    /// Marks processes to resume from; their ancestors are skipped.
    pub fn resume(&mut self, names: &[&str], plus: bool) -> Result<(), PipelineError> {
        let mut handles = Vec::new();
        for name in names {
            let idx = self.find(name).ok_or_else(|| PipelineError::ProcRelation {
                route: name.to_string(),
                message: "no such process".to_string(),
            })?;
            handles.push(idx);
        }
        self.tree.resume(&handles, plus)
    }

    /// Runs the pipeline to completion in dependency order.
    ///
    /// Preparation errors abort immediately; a failed process stops the
    /// run. Processes that can never run are reported at the end.
    pub fn run(&mut self, dry_run: bool) -> Result<(), PipelineError> {
        let started = Instant::now();
        self.tree.validate()?;

        if self.tree.starts().is_empty() {
            // Default to every independent root.
            let roots: Vec<usize> = (0..self.tree.len())
                .filter(|i| self.tree.node(*i).depends.is_empty())
                .collect();
            info!("No start processes declared, using all roots");
            self.tree.set_starts(&roots);
        }

        while let Some(idx) = self.tree.next_to_run() {
            let cfg = self.procs[idx].cfg.clone();
            let banner = format!("{}: {}", cfg.name(), cfg.desc);
            let rule = "-".repeat(banner.len().max(80));
            info!("{}", rule);
            info!("{}", banner);
            info!("{}", rule);
            info!("{}", self.tree.relation_str(idx));

            let input = self.assemble_input(idx)?;
            self.procs[idx].run(input, dry_run)?;
            self.tree.mark_ran(idx);
        }

        for (name, chain) in self.tree.unran() {
            if chain.is_empty() {
                warn!("{} won't run as it is not reachable from a start process", name);
            } else {
                warn!(
                    "{} won't run as path can't be reached: {} <- {}",
                    name,
                    name,
                    chain.join(" <- ")
                );
            }
        }

        info!("Total time: {}", format_secs(started.elapsed().as_secs_f64()));
        Ok(())
    }

    /// The input channel of a process: explicit if declared, otherwise the
    /// column-wise join of its dependencies' output channels.
    fn assemble_input(&self, idx: usize) -> Result<Channel, PipelineError> {
        if !self.inputs[idx].is_empty() {
            return Ok(self.inputs[idx].clone());
        }
        let deps = &self.tree.node(idx).depends;
        if deps.is_empty() {
            return Ok(Channel::new());
        }
        let sources: Vec<&Channel> = deps.iter().map(|d| self.procs[*d].out_channel()).collect();
        Channel::cbind(&sources).map_err(|reason| PipelineError::ChannelMismatch {
            proc: self.procs[idx].name(),
            reason,
        })
    }
}

/// `HH:MM:SS.mmm` rendering of a duration in seconds.
pub fn format_secs(seconds: f64) -> String {
    let hours = (seconds / 3600.0) as u64;
    let minutes = ((seconds % 3600.0) / 60.0) as u64;
    let secs = seconds % 60.0;
    format!("{:02}:{:02}:{:06.3}", hours, minutes, secs)
}
