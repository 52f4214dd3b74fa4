//! Pipewright - Pipeline Execution Engine
//!
//! A pipeline execution engine for scientific and data workflows: declare
//! a graph of processes, each fanning out into many independent jobs, and
//! the engine orders processes by data dependencies, reuses cached job
//! results, dispatches runnable jobs to heterogeneous backends and tracks
//! completion, retries and partial failure.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`pipeline`]: process model, data channels, dependency scheduler
//! - [`job`]: job lifecycle, cache signatures, the concurrent job manager
//! - [`runner`]: execution backends (local, SSH, SGE, Slurm)
//! - [`template`]: the expression renderer for scripts and output paths
//!
//! # Example
//!
//! ```rust,no_run
//! use pipewright::pipeline::process::{InKind, OutKind};
//! use pipewright::{Channel, Pipeline, ProcessConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sort = ProcessConfig::new("sort")
//!         .with_input("infile", InKind::File)
//!         .with_output("sorted", OutKind::File, "sorted.txt")
//!         .with_script("sort {{i.infile}} > {{o.sorted}}")
//!         .with_forks(4);
//!
//!     let mut pipe = Pipeline::new();
//!     pipe.add(sort, Some(Channel::from_values(["data/a.txt"])));
//!     pipe.start(&["sort"])?;
//!     pipe.run(false)?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod job;
pub mod pipeline;
pub mod runner;
pub mod template;

// Re-export commonly used types
pub use error::PipelineError;
pub use job::{Job, Jobmgr};
pub use pipeline::parser::load_pipeline;
pub use pipeline::{Channel, Pipeline, ProcessConfig};
pub use template::Template;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Pipewright";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "Pipewright");
    }

    #[test]
    fn test_module_exports_process_config() {
        let cfg = ProcessConfig::new("test").with_script("echo test");
        assert_eq!(cfg.id, "test");
        assert_eq!(cfg.script.source(), "echo test");
    }

    #[test]
    fn test_module_exports_channel() {
        let chan = Channel::from_values(["a"]);
        assert_eq!(chan.len(), 1);
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
