//! Pipeline Definition Parser
//!
//! Loads pipeline definitions from YAML files into a [`Pipeline`].
//!
//! # Example YAML Format
//!
//! ```yaml
//! ppldir: ./workdir
//! starts: [sort]
//!
//! processes:
//!   - id: sort
//!     desc: Sort each input file
//!     input: [infile:file]
//!     output: [outfile:file:sorted.txt]
//!     script: sort {{i.infile}} > {{o.outfile}}
//!     data:
//!       - data/a.txt
//!       - data/b.txt
//!     forks: 2
//!
//!   - id: merge
//!     desc: Merge the sorted files
//!     depends: [sort]
//!     input: [infile:file]
//!     output: [merged:file:merged.txt]
//!     script: cat {{i.infile}} >> {{o.merged}}
//! ```

use std::collections::HashMap;
use std::error::Error;
use std::fs;
use std::path::PathBuf;

use log::{debug, info};
use serde::Deserialize;

use crate::pipeline::channel::{Channel, ChannelValue};
use crate::pipeline::process::{
    CacheMode, EchoSpec, ErrHow, ExportMode, InKind, OutKind, ProcessConfig, RunnerKind,
};
use crate::template::Template;

use super::Pipeline;

/// Raw pipeline file shape.
#[derive(Debug, Deserialize)]
struct PipelineDef {
    #[serde(default)]
    ppldir: Option<String>,
    #[serde(default)]
    starts: Vec<String>,
    processes: Vec<ProcDef>,
}

/// Raw process shape; optional fields fall back to process defaults.
#[derive(Debug, Deserialize)]
struct ProcDef {
    id: String,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    desc: Option<String>,
    script: String,
    #[serde(default)]
    lang: Option<String>,
    /// `name:kind` declarations, in order.
    #[serde(default)]
    input: Vec<String>,
    /// `name:kind:expression` declarations, in order.
    #[serde(default)]
    output: Vec<String>,
    /// Input rows; single-column processes take plain values.
    #[serde(default)]
    data: Vec<serde_yaml::Value>,
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default)]
    forks: Option<usize>,
    #[serde(default)]
    nthread: Option<usize>,
    #[serde(default)]
    cache: Option<String>,
    #[serde(default)]
    dirsig: Option<bool>,
    #[serde(default)]
    errhow: Option<String>,
    #[serde(default)]
    errntry: Option<usize>,
    #[serde(default)]
    rcs: Option<Vec<i32>>,
    #[serde(default)]
    echo: Option<bool>,
    #[serde(default)]
    exdir: Option<String>,
    #[serde(default)]
    exhow: Option<String>,
    #[serde(default)]
    exow: Option<bool>,
    #[serde(default)]
    expart: Vec<String>,
    #[serde(default)]
    expect: Option<String>,
    #[serde(default)]
    runner: Option<String>,
    #[serde(default)]
    runner_opts: HashMap<String, serde_yaml::Value>,
}

/// Loads and wires a pipeline from a YAML file.
pub fn load_pipeline(path: &str) -> Result<Pipeline, Box<dyn Error>> {
    info!("Loading pipeline from: {}", path);
    let content = fs::read_to_string(path).map_err(|e| {
        format!(
            "Failed to read pipeline file '{}': {}. Check that the file exists and is readable.",
            path, e
        )
    })?;
    let def: PipelineDef = serde_yaml::from_str(&content)
        .map_err(|e| format!("Failed to parse pipeline YAML: {}. Check the file format.", e))?;

    build_pipeline(def)
}

fn build_pipeline(def: PipelineDef) -> Result<Pipeline, Box<dyn Error>> {
    if def.processes.is_empty() {
        return Err("Pipeline has no processes".into());
    }

    let mut pipe = Pipeline::new();
    let mut handles: HashMap<String, usize> = HashMap::new();

    for proc_def in &def.processes {
        if handles.contains_key(&proc_def.id) {
            return Err(format!("Duplicate process id: '{}'", proc_def.id).into());
        }
        let (cfg, input) = build_config(proc_def, def.ppldir.as_deref())?;
        let handle = pipe.add(cfg, input);
        handles.insert(proc_def.id.clone(), handle);
    }

    for proc_def in &def.processes {
        let this = handles[&proc_def.id];
        for dep in &proc_def.depends {
            let dep_handle = *handles.get(dep).ok_or_else(|| {
                format!("Process '{}' depends on unknown process '{}'", proc_def.id, dep)
            })?;
            pipe.depends(this, dep_handle);
        }
    }

    if !def.starts.is_empty() {
        let names: Vec<&str> = def.starts.iter().map(String::as_str).collect();
        pipe.start(&names)?;
    }

    debug!("Parsed {} processes", def.processes.len());
    Ok(pipe)
}

fn build_config(
    def: &ProcDef,
    ppldir: Option<&str>,
) -> Result<(ProcessConfig, Option<Channel>), Box<dyn Error>> {
    let mut cfg = ProcessConfig::new(&def.id).with_script(&def.script);

    if let Some(tag) = &def.tag {
        cfg.tag = tag.clone();
    }
    if let Some(desc) = &def.desc {
        cfg.desc = desc.clone();
    }
    if let Some(lang) = &def.lang {
        cfg.lang = lang.clone();
    }
    if let Some(dir) = ppldir {
        cfg.ppldir = PathBuf::from(dir);
    }
    if let Some(forks) = def.forks {
        cfg.forks = forks.max(1);
    }
    if let Some(nthread) = def.nthread {
        cfg.nthread = nthread.max(1);
    }
    if let Some(errntry) = def.errntry {
        cfg.errntry = errntry;
    }
    if let Some(rcs) = &def.rcs {
        cfg.rcs = rcs.clone();
    }
    if let Some(dirsig) = def.dirsig {
        cfg.dirsig = dirsig;
    }
    if let Some(exow) = def.exow {
        cfg.exow = exow;
    }
    if let Some(exdir) = &def.exdir {
        cfg.exdir = Some(PathBuf::from(exdir));
    }
    if let Some(expect) = &def.expect {
        cfg.expect = Some(Template::new(expect));
    }
    cfg.expart = def.expart.iter().map(Template::new).collect();
    if def.echo.unwrap_or(false) {
        cfg.echo = EchoSpec::first_job();
    }

    if let Some(cache) = &def.cache {
        cfg.cache = match cache.as_str() {
            "true" | "on" => CacheMode::On,
            "false" | "off" => CacheMode::Off,
            "export" => CacheMode::Export,
            other => return Err(format!("Unknown cache mode: '{}'", other).into()),
        };
    }
    if let Some(errhow) = &def.errhow {
        cfg.errhow = ErrHow::parse(errhow)
            .ok_or_else(|| format!("Unknown error policy: '{}'", errhow))?;
    }
    if let Some(exhow) = &def.exhow {
        cfg.exhow = ExportMode::parse(exhow)
            .ok_or_else(|| format!("Unknown export mode: '{}'", exhow))?;
    }
    if let Some(runner) = &def.runner {
        cfg.runner = RunnerKind::parse(runner)
            .ok_or_else(|| format!("Unknown runner kind: '{}'", runner))?;
    }
    for (key, value) in &def.runner_opts {
        cfg.runner_opts
            .insert(key.clone(), serde_json::to_value(value)?);
    }

    for decl in &def.input {
        let (name, kind) = decl
            .split_once(':')
            .ok_or_else(|| format!("Bad input declaration '{}', expected name:kind", decl))?;
        let kind = InKind::parse(kind.trim())
            .ok_or_else(|| format!("Unknown input kind in '{}'", decl))?;
        cfg.input_schema.push((name.trim().to_string(), kind));
    }

    for decl in &def.output {
        let mut parts = decl.splitn(3, ':');
        let name = parts.next().unwrap_or_default().trim();
        let kind_str = parts.next().ok_or_else(|| {
            format!("Bad output declaration '{}', expected name:kind:expression", decl)
        })?;
        let expr = parts.next().ok_or_else(|| {
            format!("Bad output declaration '{}', expected name:kind:expression", decl)
        })?;
        let kind = OutKind::parse(kind_str.trim())
            .ok_or_else(|| format!("Unknown output kind in '{}'", decl))?;
        cfg.output_schema
            .push((name.to_string(), kind, Template::new(expr)));
    }

    let channel = if def.data.is_empty() {
        None
    } else {
        Some(parse_rows(&def.data, cfg.input_schema.len(), &def.id)?)
    };

    Ok((cfg, channel))
}

/// Converts raw YAML rows to a channel, validating against the schema
/// width.
fn parse_rows(
    data: &[serde_yaml::Value],
    width: usize,
    id: &str,
) -> Result<Channel, Box<dyn Error>> {
    let mut chan = Channel::new();
    for (nrow, item) in data.iter().enumerate() {
        let row: Vec<ChannelValue> = if width <= 1 {
            vec![parse_value(item, nrow, id)?]
        } else {
            match item {
                serde_yaml::Value::Sequence(cells) => {
                    if cells.len() != width {
                        return Err(format!(
                            "Process '{}': row {} has {} values but {} inputs are declared",
                            id,
                            nrow,
                            cells.len(),
                            width
                        )
                        .into());
                    }
                    cells
                        .iter()
                        .map(|cell| parse_value(cell, nrow, id))
                        .collect::<Result<_, _>>()?
                }
                _ => {
                    return Err(format!(
                        "Process '{}': row {} must be a list of {} values",
                        id, nrow, width
                    )
                    .into())
                }
            }
        };
        chan.push_row(row);
    }
    Ok(chan)
}

fn parse_value(
    value: &serde_yaml::Value,
    nrow: usize,
    id: &str,
) -> Result<ChannelValue, Box<dyn Error>> {
    match value {
        serde_yaml::Value::String(s) => Ok(ChannelValue::Str(s.clone())),
        serde_yaml::Value::Number(n) => Ok(ChannelValue::Str(n.to_string())),
        serde_yaml::Value::Bool(b) => Ok(ChannelValue::Str(b.to_string())),
        serde_yaml::Value::Sequence(items) => {
            let strings: Result<Vec<String>, _> = items
                .iter()
                .map(|item| match item {
                    serde_yaml::Value::String(s) => Ok(s.clone()),
                    serde_yaml::Value::Number(n) => Ok(n.to_string()),
                    other => Err(format!(
                        "Process '{}': row {} has a non-string list element: {:?}",
                        id, nrow, other
                    )),
                })
                .collect();
            Ok(ChannelValue::List(strings?))
        }
        other => Err(format!("Process '{}': row {} has unsupported value: {:?}", id, nrow, other).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn load(yaml: &str) -> Result<Pipeline, Box<dyn Error>> {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        load_pipeline(file.path().to_str().unwrap())
    }

    #[test]
    fn test_load_minimal_pipeline() {
        let pipe = load(
            r#"
processes:
  - id: hello
    script: echo hello
"#,
        )
        .unwrap();
        assert_eq!(pipe.tree().len(), 1);
        assert_eq!(pipe.process(0).id(), "hello");
    }

    #[test]
    fn test_load_full_process() {
        let pipe = load(
            r#"
ppldir: /tmp/ppl
starts: [sort]
processes:
  - id: sort
    desc: Sort the inputs
    input: [infile:file]
    output: [outfile:file:sorted.txt]
    script: sort {{i.infile}} > {{o.outfile}}
    data: [a.txt, b.txt]
    forks: 4
    errhow: retry
    errntry: 2
    rcs: [0, 2]
    runner: sge
    runner_opts:
      sge.q: 1-day
"#,
        )
        .unwrap();

        let cfg = &pipe.process(0).cfg;
        assert_eq!(cfg.forks, 4);
        assert_eq!(cfg.errhow, ErrHow::Retry);
        assert_eq!(cfg.errntry, 2);
        assert_eq!(cfg.rcs, vec![0, 2]);
        assert_eq!(cfg.runner, RunnerKind::Sge);
        assert_eq!(cfg.ppldir, PathBuf::from("/tmp/ppl"));
        assert_eq!(cfg.input_schema.len(), 1);
        assert_eq!(cfg.input_schema[0].1, InKind::File);
        assert_eq!(cfg.output_schema[0].1, OutKind::File);
        assert_eq!(
            cfg.runner_opts.get("sge.q").unwrap().as_str().unwrap(),
            "1-day"
        );
        assert_eq!(pipe.tree().starts(), vec![0]);
    }

    #[test]
    fn test_load_dependencies() {
        let pipe = load(
            r#"
processes:
  - id: first
    script: echo 1
  - id: second
    depends: [first]
    script: echo 2
"#,
        )
        .unwrap();
        assert_eq!(pipe.tree().node(1).depends, vec![0]);
        assert_eq!(pipe.tree().node(0).nexts, vec![1]);
    }

    #[test]
    fn test_unknown_dependency_fails() {
        let err = load(
            r#"
processes:
  - id: lonely
    depends: [ghost]
    script: echo 1
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown process 'ghost'"));
    }

    #[test]
    fn test_duplicate_id_fails() {
        let err = load(
            r#"
processes:
  - id: twin
    script: echo 1
  - id: twin
    script: echo 2
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Duplicate process id"));
    }

    #[test]
    fn test_bad_kind_fails() {
        let err = load(
            r#"
processes:
  - id: p
    input: [x:bogus]
    script: echo 1
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown input kind"));
    }

    #[test]
    fn test_multi_column_rows() {
        let pipe = load(
            r#"
processes:
  - id: p
    input: [a:var, b:var]
    script: echo {{i.a}} {{i.b}}
    data:
      - [x, y]
      - [u, v]
"#,
        )
        .unwrap();
        let _ = pipe;
    }

    #[test]
    fn test_row_width_mismatch_fails() {
        let err = load(
            r#"
processes:
  - id: p
    input: [a:var, b:var]
    script: echo
    data:
      - [only-one]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("1 values but 2 inputs"));
    }

    #[test]
    fn test_files_input_rows() {
        let pipe = load(
            r#"
processes:
  - id: p
    input: [group:files]
    script: cat {{i.group}}
    data:
      - [f1.txt, f2.txt]
      - [f3.txt]
"#,
        )
        .unwrap();
        let _ = pipe;
    }

    #[test]
    fn test_empty_pipeline_fails() {
        let err = load("processes: []").unwrap_err();
        assert!(err.to_string().contains("no processes"));
    }
}
