//! Cache Signatures
//!
//! A job's signature fingerprints its script, inputs and outputs by path
//! and modification time. Signatures are compared component by component in
//! a fixed order, and the first mismatch is reported with a distinct reason
//! so the caller can log precisely why a job was not reused.
//!
//! A signature is either whole or the job is treated as never cached: any
//! missing path empties the current signature and forces a rebuild.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `(absolute path, mtime)` of one file or directory.
pub type FileSig = (String, i64);

/// Signature of the input side: variables by value, files by path+mtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSig {
    pub var: BTreeMap<String, String>,
    pub file: BTreeMap<String, FileSig>,
    pub files: BTreeMap<String, Vec<FileSig>>,
}

/// Signature of the output side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSig {
    pub var: BTreeMap<String, String>,
    pub file: BTreeMap<String, FileSig>,
    pub dir: BTreeMap<String, FileSig>,
}

/// The full content signature of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSignature {
    pub script: FileSig,
    #[serde(rename = "i")]
    pub input: InputSig,
    #[serde(rename = "o")]
    pub output: OutputSig,
}

/// Why a current signature did not match the cached one. Variants are
/// ordered by comparison priority; comparison stops at the first failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MismatchReason {
    #[error("script file is newer: previous mtime {prev}, current mtime {curr}")]
    ScriptNewer { prev: i64, curr: i64 },

    #[error("input variable({key}) is different: previous '{prev}', current '{curr}'")]
    InVarDiff {
        key: String,
        prev: String,
        curr: String,
    },

    #[error("input file({key}) is different: previous {prev}, current {curr}")]
    InFileDiff {
        key: String,
        prev: String,
        curr: String,
    },

    #[error("input file({key}) is newer: previous mtime {prev}, current mtime {curr}")]
    InFileNewer { key: String, prev: i64, curr: i64 },

    #[error("file {nth} is different for input files({key})")]
    InFilesDiff { key: String, nth: usize },

    #[error("file {nth} is newer for input files({key})")]
    InFilesNewer { key: String, nth: usize },

    #[error("output variable({key}) is different: previous '{prev}', current '{curr}'")]
    OutVarDiff {
        key: String,
        prev: String,
        curr: String,
    },

    #[error("output file({key}) is different: previous {prev}, current {curr}")]
    OutFileDiff {
        key: String,
        prev: String,
        curr: String,
    },

    #[error("output dir({key}) is different: previous {prev}, current {curr}")]
    OutDirDiff {
        key: String,
        prev: String,
        curr: String,
    },
}

impl CacheSignature {
    /// Compares a previously cached signature against the current one.
    ///
    /// Comparison order: script newer, input var, input file path, input
    /// file mtime, input files list (count or path), input files mtime,
    /// output var, output file path, output dir path. The first mismatch
    /// wins; later components are never consulted.
    pub fn compare(prev: &CacheSignature, curr: &CacheSignature) -> Result<(), MismatchReason> {
        if curr.script.1 > prev.script.1 {
            return Err(MismatchReason::ScriptNewer {
                prev: prev.script.1,
                curr: curr.script.1,
            });
        }

        for (key, curr_val) in &curr.input.var {
            let prev_val = prev.input.var.get(key).cloned().unwrap_or_default();
            if *curr_val != prev_val {
                return Err(MismatchReason::InVarDiff {
                    key: key.clone(),
                    prev: prev_val,
                    curr: curr_val.clone(),
                });
            }
        }

        for (key, (curr_path, curr_mtime)) in &curr.input.file {
            let (prev_path, prev_mtime) = prev.input.file.get(key).cloned().unwrap_or_default();
            if *curr_path != prev_path {
                return Err(MismatchReason::InFileDiff {
                    key: key.clone(),
                    prev: prev_path,
                    curr: curr_path.clone(),
                });
            }
            if *curr_mtime > prev_mtime {
                return Err(MismatchReason::InFileNewer {
                    key: key.clone(),
                    prev: prev_mtime,
                    curr: *curr_mtime,
                });
            }
        }

        for (key, curr_list) in &curr.input.files {
            let prev_list = prev.input.files.get(key).cloned().unwrap_or_default();
            if curr_list.len() != prev_list.len() {
                return Err(MismatchReason::InFilesDiff {
                    key: key.clone(),
                    nth: curr_list.len().min(prev_list.len()) + 1,
                });
            }
            for (i, ((curr_path, _), (prev_path, _))) in
                curr_list.iter().zip(prev_list.iter()).enumerate()
            {
                if curr_path != prev_path {
                    return Err(MismatchReason::InFilesDiff {
                        key: key.clone(),
                        nth: i + 1,
                    });
                }
            }
            for (i, ((_, curr_mtime), (_, prev_mtime))) in
                curr_list.iter().zip(prev_list.iter()).enumerate()
            {
                if curr_mtime > prev_mtime {
                    return Err(MismatchReason::InFilesNewer {
                        key: key.clone(),
                        nth: i + 1,
                    });
                }
            }
        }

        for (key, curr_val) in &curr.output.var {
            let prev_val = prev.output.var.get(key).cloned().unwrap_or_default();
            if *curr_val != prev_val {
                return Err(MismatchReason::OutVarDiff {
                    key: key.clone(),
                    prev: prev_val,
                    curr: curr_val.clone(),
                });
            }
        }

        for (key, (curr_path, _)) in &curr.output.file {
            let (prev_path, _) = prev.output.file.get(key).cloned().unwrap_or_default();
            if *curr_path != prev_path {
                return Err(MismatchReason::OutFileDiff {
                    key: key.clone(),
                    prev: prev_path,
                    curr: curr_path.clone(),
                });
            }
        }

        for (key, (curr_path, _)) in &curr.output.dir {
            let (prev_path, _) = prev.output.dir.get(key).cloned().unwrap_or_default();
            if *curr_path != prev_path {
                return Err(MismatchReason::OutDirDiff {
                    key: key.clone(),
                    prev: prev_path,
                    curr: curr_path.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Modification time of a path in whole seconds since the epoch.
pub fn mtime(path: &Path) -> Option<i64> {
    let meta = fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    Some(
        modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0),
    )
}

/// Signature of one path: mtime, with optional recursive directory
/// expansion. With `dirsig`, a directory's time is the max over itself and
/// every nested entry, so any nested change invalidates the cache without
/// hashing content. Returns `None` when the path does not exist.
pub fn path_sig(path: &Path, dirsig: bool) -> Option<FileSig> {
    let base = mtime(path)?;
    let stamp = if dirsig && path.is_dir() {
        base.max(max_mtime_under(path))
    } else {
        base
    };
    Some((path.to_string_lossy().to_string(), stamp))
}

/// Max mtime of every entry under a directory, recursively. Unreadable
/// entries are skipped.
fn max_mtime_under(dir: &Path) -> i64 {
    let mut newest = 0;
    let Ok(entries) = fs::read_dir(dir) else {
        return newest;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if let Some(t) = mtime(&path) {
            newest = newest.max(t);
        }
        if path.is_dir() {
            newest = newest.max(max_mtime_under(&path));
        }
    }
    newest
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    fn sig_with_script(mtime: i64) -> CacheSignature {
        CacheSignature {
            script: ("/w/1/job.script".to_string(), mtime),
            ..Default::default()
        }
    }

    #[test]
    fn test_equal_signatures_match() {
        let sig = sig_with_script(100);
        assert!(CacheSignature::compare(&sig, &sig.clone()).is_ok());
    }

    #[test]
    fn test_script_newer() {
        let prev = sig_with_script(100);
        let curr = sig_with_script(200);
        assert_eq!(
            CacheSignature::compare(&prev, &curr),
            Err(MismatchReason::ScriptNewer {
                prev: 100,
                curr: 200
            })
        );
    }

    #[test]
    fn test_script_older_is_fine() {
        let prev = sig_with_script(200);
        let curr = sig_with_script(100);
        assert!(CacheSignature::compare(&prev, &curr).is_ok());
    }

    #[test]
    fn test_input_var_diff() {
        let mut prev = sig_with_script(100);
        prev.input.var.insert("c".to_string(), "var_c".to_string());
        let mut curr = prev.clone();
        curr.input.var.insert("c".to_string(), "d".to_string());

        let err = CacheSignature::compare(&prev, &curr).unwrap_err();
        assert_eq!(
            err,
            MismatchReason::InVarDiff {
                key: "c".to_string(),
                prev: "var_c".to_string(),
                curr: "d".to_string()
            }
        );
        assert!(err.to_string().contains("input variable(c)"));
    }

    #[test]
    fn test_input_file_newer_reported_not_later_reasons() {
        // An input mtime bump must surface as InFileNewer even when output
        // components also differ; comparison stops at the first mismatch.
        let mut prev = sig_with_script(100);
        prev.input
            .file
            .insert("a".to_string(), ("/in/a.txt".to_string(), 50));
        prev.output
            .file
            .insert("o".to_string(), ("/out/x.txt".to_string(), 60));

        let mut curr = prev.clone();
        curr.input
            .file
            .insert("a".to_string(), ("/in/a.txt".to_string(), 70));
        curr.output
            .file
            .insert("o".to_string(), ("/out/other.txt".to_string(), 60));

        let err = CacheSignature::compare(&prev, &curr).unwrap_err();
        assert_eq!(
            err,
            MismatchReason::InFileNewer {
                key: "a".to_string(),
                prev: 50,
                curr: 70
            }
        );
    }

    #[test]
    fn test_input_file_path_diff_beats_mtime() {
        let mut prev = sig_with_script(100);
        prev.input
            .file
            .insert("a".to_string(), ("/in/a.txt".to_string(), 50));
        let mut curr = prev.clone();
        curr.input
            .file
            .insert("a".to_string(), ("/in/b.txt".to_string(), 70));

        assert!(matches!(
            CacheSignature::compare(&prev, &curr).unwrap_err(),
            MismatchReason::InFileDiff { .. }
        ));
    }

    #[test]
    fn test_input_files_count_diff() {
        let mut prev = sig_with_script(100);
        prev.input.files.insert(
            "b".to_string(),
            vec![("/f1".to_string(), 10), ("/f2".to_string(), 10)],
        );
        let mut curr = prev.clone();
        curr.input.files.get_mut("b").unwrap().push(("/f3".to_string(), 10));

        let err = CacheSignature::compare(&prev, &curr).unwrap_err();
        assert_eq!(
            err,
            MismatchReason::InFilesDiff {
                key: "b".to_string(),
                nth: 3
            }
        );
    }

    #[test]
    fn test_input_files_element_newer() {
        let mut prev = sig_with_script(100);
        prev.input.files.insert(
            "b".to_string(),
            vec![("/f1".to_string(), 10), ("/f2".to_string(), 10)],
        );
        let mut curr = prev.clone();
        curr.input.files.get_mut("b").unwrap()[0].1 = 20;

        let err = CacheSignature::compare(&prev, &curr).unwrap_err();
        assert_eq!(
            err,
            MismatchReason::InFilesNewer {
                key: "b".to_string(),
                nth: 1
            }
        );
    }

    #[test]
    fn test_output_dir_diff() {
        let mut prev = sig_with_script(100);
        prev.output
            .dir
            .insert("d".to_string(), ("/out/d1".to_string(), 10));
        let mut curr = prev.clone();
        curr.output
            .dir
            .insert("d".to_string(), ("/out/d2".to_string(), 10));

        assert!(matches!(
            CacheSignature::compare(&prev, &curr).unwrap_err(),
            MismatchReason::OutDirDiff { .. }
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let mut sig = sig_with_script(123);
        sig.input.var.insert("a".to_string(), "1".to_string());
        sig.input
            .file
            .insert("f".to_string(), ("/in/f.txt".to_string(), 55));
        sig.output
            .dir
            .insert("d".to_string(), ("/out/d".to_string(), 66));

        let json = serde_json::to_string(&sig).unwrap();
        let loaded: CacheSignature = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, sig);
        assert!(json.contains("\"i\""));
        assert!(json.contains("\"o\""));
    }

    #[test]
    fn test_path_sig_missing() {
        assert!(path_sig(Path::new("/nonexistent/nope"), true).is_none());
    }

    #[test]
    fn test_path_sig_dir_expansion() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        File::create(sub.join("inner.txt")).unwrap();

        // Bump the nested file far into the future of the dir itself.
        let inner = sub.join("inner.txt");
        let sig_flat = path_sig(dir.path(), false).unwrap();
        let sig_deep = path_sig(dir.path(), true).unwrap();
        assert!(sig_deep.1 >= sig_flat.1);
        assert!(mtime(&inner).is_some());
    }
}
