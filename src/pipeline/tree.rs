//! Process Dependency Scheduler
//!
//! Maintains the directed "requires" graph over processes, computes
//! reachability to the declared start and end sets, validates resume
//! selections and releases processes in a dependency-respecting order,
//! one at a time.

use std::collections::HashSet;

use log::warn;

use crate::error::PipelineError;

/// Scheduler annotation controlling whether a process is recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumeMark {
    #[default]
    None,
    /// Run, expecting cached results to be picked up.
    Resume,
    /// Like resume, propagating through already-exported artifacts.
    ResumePlus,
    /// Assume satisfied; do not run at all.
    Skip,
    SkipPlus,
}

impl ResumeMark {
    /// Marks that satisfy a dependency without the node running.
    pub fn is_skip(&self) -> bool {
        matches!(self, ResumeMark::Skip | ResumeMark::SkipPlus)
    }

    pub fn is_resume(&self) -> bool {
        matches!(self, ResumeMark::Resume | ResumeMark::ResumePlus)
    }
}

/// One node of the process graph.
#[derive(Debug, Clone)]
pub struct ProcNode {
    pub name: String,
    /// Identity before any aliasing.
    pub origin: String,
    /// Required predecessors, in declaration order.
    pub depends: Vec<usize>,
    /// Successors; computed from `depends`, never declared.
    pub nexts: Vec<usize>,
    pub resume: ResumeMark,
    pub start: bool,
    pub ran: bool,
}

/// The process dependency graph and run-order scheduler.
#[derive(Debug, Default)]
pub struct ProcTree {
    nodes: Vec<ProcNode>,
}

impl ProcTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node and returns its handle.
    pub fn register(&mut self, name: impl Into<String>) -> usize {
        let name = name.into();
        self.nodes.push(ProcNode {
            origin: name.clone(),
            name,
            depends: Vec::new(),
            nexts: Vec::new(),
            resume: ResumeMark::None,
            start: false,
            ran: false,
        });
        self.nodes.len() - 1
    }

    /// Declares that `node` requires `dep` to have run first.
    pub fn add_dependency(&mut self, node: usize, dep: usize) {
        if !self.nodes[node].depends.contains(&dep) {
            self.nodes[node].depends.push(dep);
        }
        if !self.nodes[dep].nexts.contains(&node) {
            self.nodes[dep].nexts.push(node);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &ProcNode {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: usize) -> &mut ProcNode {
        &mut self.nodes[idx]
    }

    /// Rejects cyclic graphs; the route names one node on the cycle.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut done = vec![false; self.nodes.len()];
        let mut onpath = vec![false; self.nodes.len()];
        for idx in 0..self.nodes.len() {
            self.check_cycle(idx, &mut done, &mut onpath)?;
        }
        Ok(())
    }

    fn check_cycle(
        &self,
        idx: usize,
        done: &mut Vec<bool>,
        onpath: &mut Vec<bool>,
    ) -> Result<(), PipelineError> {
        if done[idx] {
            return Ok(());
        }
        if onpath[idx] {
            return Err(PipelineError::ProcRelation {
                route: self.nodes[idx].name.clone(),
                message: "process dependencies form a cycle".to_string(),
            });
        }
        onpath[idx] = true;
        for dep in self.nodes[idx].depends.clone() {
            self.check_cycle(dep, done, onpath)?;
        }
        onpath[idx] = false;
        done[idx] = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Starts and ends
    // ------------------------------------------------------------------

    /// Declares the start set. A candidate reachable from another
    /// candidate is dropped with a warning rather than an error.
    pub fn set_starts(&mut self, candidates: &[usize]) {
        let chosen: HashSet<usize> = candidates.iter().copied().collect();
        for node in &mut self.nodes {
            node.start = false;
        }

        for &cand in candidates {
            let ancestors = self.ancestors(cand);
            let priors: Vec<usize> = ancestors
                .into_iter()
                .filter(|a| chosen.contains(a) && *a != cand)
                .collect();
            if priors.is_empty() {
                self.nodes[cand].start = true;
            } else {
                let names: Vec<&str> =
                    priors.iter().map(|p| self.nodes[*p].name.as_str()).collect();
                warn!(
                    "Start process {} ignored, depending on [{}]",
                    self.nodes[cand].name,
                    names.join(", ")
                );
            }
        }
    }

    pub fn starts(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|i| self.nodes[*i].start)
            .collect()
    }

    /// End nodes: reachable from a start and with no successors.
    pub fn ends(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|i| self.nodes[*i].nexts.is_empty() && self.reachable_from_start(*i))
            .collect()
    }

    /// All transitive predecessors of a node.
    fn ancestors(&self, idx: usize) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut stack = self.nodes[idx].depends.clone();
        while let Some(cur) = stack.pop() {
            if seen.insert(cur) {
                stack.extend(self.nodes[cur].depends.iter().copied());
            }
        }
        seen
    }

    fn reachable_from_start(&self, idx: usize) -> bool {
        if self.nodes[idx].start {
            return true;
        }
        self.ancestors(idx).iter().any(|a| self.nodes[*a].start)
    }

    /// Every ancestor route from `idx` back to a start (or a root), as
    /// lists of node handles from the immediate parent outward.
    pub fn paths_to_starts(&self, idx: usize) -> Vec<Vec<usize>> {
        let mut paths = Vec::new();
        for &dep in &self.nodes[idx].depends {
            if self.nodes[dep].start || self.nodes[dep].depends.is_empty() {
                paths.push(vec![dep]);
            } else {
                for sub in self.paths_to_starts(dep) {
                    let mut path = vec![dep];
                    path.extend(sub);
                    paths.push(path);
                }
            }
        }
        paths
    }

    // ------------------------------------------------------------------
    // Resume
    // ------------------------------------------------------------------

    /// Marks processes as resumed and their ancestors as skipped.
    ///
    /// Every route from any end back to a start must pass through at
    /// least one resumed node; otherwise the route is unreachable from
    /// the resumed set and scheduling refuses to start.
    pub fn resume(&mut self, resumes: &[usize], plus: bool) -> Result<(), PipelineError> {
        let resumed: HashSet<usize> = resumes.iter().copied().collect();

        for end in self.ends() {
            if resumed.contains(&end) {
                continue;
            }
            let paths = self.paths_to_starts(end);
            let failed = paths
                .iter()
                .find(|path| !path.iter().any(|n| resumed.contains(n)));
            if let Some(path) = failed {
                let chain: Vec<&str> =
                    path.iter().map(|n| self.nodes[*n].name.as_str()).collect();
                return Err(PipelineError::ProcRelation {
                    route: format!("{} <- [{}]", self.nodes[end].name, chain.join(", ")),
                    message: "one of the routes cannot be reached from resumed processes"
                        .to_string(),
                });
            }
        }

        let (rmark, smark) = if plus {
            (ResumeMark::ResumePlus, ResumeMark::SkipPlus)
        } else {
            (ResumeMark::Resume, ResumeMark::Skip)
        };

        for &idx in resumes {
            self.nodes[idx].resume = rmark;
            for path in self.paths_to_starts(idx) {
                for node in path {
                    if self.nodes[node].resume == ResumeMark::None {
                        self.nodes[node].resume = smark;
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Run order
    // ------------------------------------------------------------------

    /// A dependency is satisfied once its node ran or carries a skip mark.
    fn satisfied(&self, idx: usize) -> bool {
        self.nodes[idx].ran || self.nodes[idx].resume.is_skip()
    }

    /// Returns some not-yet-run node whose requirements are all satisfied,
    /// or `None` when nothing more can run.
    pub fn next_to_run(&self) -> Option<usize> {
        for idx in 0..self.nodes.len() {
            let node = &self.nodes[idx];
            if node.ran || node.resume.is_skip() {
                continue;
            }
            let runnable = if node.depends.is_empty() {
                // A root only runs when selected as a start.
                node.start
            } else {
                node.depends.iter().all(|d| self.satisfied(*d))
            };
            if runnable {
                return Some(idx);
            }
        }
        None
    }

    pub fn mark_ran(&mut self, idx: usize) {
        self.nodes[idx].ran = true;
    }

    /// Processes that can never run, with the blocking ancestor chain.
    pub fn unran(&self) -> Vec<(String, Vec<String>)> {
        let mut result = Vec::new();
        for idx in 0..self.nodes.len() {
            let node = &self.nodes[idx];
            if node.ran || node.resume.is_skip() {
                continue;
            }
            let chain: Vec<String> = self
                .paths_to_starts(idx)
                .first()
                .map(|path| {
                    path.iter()
                        .filter(|n| !self.satisfied(**n))
                        .map(|n| self.nodes[*n].name.clone())
                        .collect()
                })
                .unwrap_or_default();
            result.push((node.name.clone(), chain));
        }
        result
    }

    /// `prev => name => next` description of one node.
    pub fn relation_str(&self, idx: usize) -> String {
        let names = |list: &[usize]| -> String {
            if list.is_empty() {
                "START".to_string()
            } else {
                let v: Vec<&str> = list.iter().map(|n| self.nodes[*n].name.as_str()).collect();
                format!("[{}]", v.join(", "))
            }
        };
        let node = &self.nodes[idx];
        let nexts = if node.nexts.is_empty() {
            "END".to_string()
        } else {
            let v: Vec<&str> = node
                .nexts
                .iter()
                .map(|n| self.nodes[*n].name.as_str())
                .collect();
            format!("[{}]", v.join(", "))
        };
        format!("{} => {} => {}", names(&node.depends), node.name, nexts)
    }
}
