//! Task definition files and the command-template task built from them.
//!
//! A task file is a small YAML document naming an item source and a shell
//! command template to run once per item in a worker child:
//!
//! ```yaml
//! run: "printf '%s\n' {0} >> results.txt"
//! items:
//!   range:
//!     start: 0
//!     end: 10
//! ```
//!
//! `{0}`, `{1}`, ... substitute the item's tuple fields; `{pid}` the worker
//! process id. Substitution is textual, so templates trust their own item
//! source the same way a shell script trusts its arguments.

use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::warn;

use crate::error::{DivvyError, Result};
use crate::task::{Dispatch, Task, WorkItem, default_socket_path};

/// Where the work items come from. Exactly one source per task file.
#[derive(Debug, Clone)]
pub enum ItemSource {
    /// Inline list of tuples.
    List(Vec<Vec<Value>>),
    /// Integers `start..end` (end exclusive), one per item.
    Range { start: i64, end: i64 },
    /// One item per line of a file, or stdin when the path is `-`.
    Lines(PathBuf),
}

// serde_yaml 0.9 only derives enum support via YAML tags (`!list ...`), not
// the single-key-map form our task files use (`list: ...`), so `ItemSource`
// is deserialized by hand from that map shape instead.
impl<'de> Deserialize<'de> for ItemSource {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RangeFields {
            start: i64,
            end: i64,
        }

        #[derive(Deserialize)]
        #[serde(deny_unknown_fields, rename_all = "snake_case")]
        struct Raw {
            #[serde(default)]
            list: Option<Vec<Vec<Value>>>,
            #[serde(default)]
            range: Option<RangeFields>,
            #[serde(default)]
            lines: Option<PathBuf>,
        }

        let raw = Raw::deserialize(deserializer)?;
        match (raw.list, raw.range, raw.lines) {
            (Some(list), None, None) => Ok(ItemSource::List(list)),
            (None, Some(RangeFields { start, end }), None) => Ok(ItemSource::Range { start, end }),
            (None, None, Some(path)) => Ok(ItemSource::Lines(path)),
            (None, None, None) => Err(serde::de::Error::custom(
                "items: expected one of `list`, `range`, or `lines`",
            )),
            _ => Err(serde::de::Error::custom(
                "items: expected exactly one of `list`, `range`, or `lines`",
            )),
        }
    }
}

/// Deserialized task definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskFile {
    /// Shell command template, run via `sh -c` once per item.
    pub run: String,

    /// Item source.
    pub items: ItemSource,

    /// Treat a non-zero command exit as a worker-fatal error.
    #[serde(default)]
    pub halt_on_error: bool,

    /// Override the rendezvous socket path.
    #[serde(default)]
    pub socket: Option<PathBuf>,
}

/// A [`Task`] that runs a shell command template over the configured items.
pub struct ScriptTask {
    def: TaskFile,
}

impl ScriptTask {
    /// Load and validate a task definition file.
    pub fn load(path: &Path) -> Result<Self> {
        let taskfile_err = |message: String| DivvyError::TaskFile {
            path: path.to_path_buf(),
            message,
        };
        let content = fs::read_to_string(path)
            .map_err(|e| taskfile_err(format!("cannot read: {}", e)))?;
        let def: TaskFile =
            serde_yaml::from_str(&content).map_err(|e| taskfile_err(e.to_string()))?;
        if def.run.trim().is_empty() {
            return Err(taskfile_err("`run` must not be empty".into()));
        }
        if let ItemSource::Range { start, end } = def.items {
            if end < start {
                return Err(taskfile_err(format!(
                    "empty range: end {} is before start {}",
                    end, start
                )));
            }
        }
        Ok(Self { def })
    }

    /// Build directly from a definition (used by tests).
    #[cfg(test)]
    fn from_def(def: TaskFile) -> Self {
        Self { def }
    }

    /// Substitute `{0}`, `{1}`, ... and `{pid}` into the command template.
    fn render(&self, item: &WorkItem) -> String {
        let mut command = self.def.run.clone();
        for (i, field) in item.0.iter().enumerate() {
            command = command.replace(&format!("{{{}}}", i), &field_to_arg(field));
        }
        command.replace("{pid}", &std::process::id().to_string())
    }
}

/// Render one tuple field as command text: strings verbatim, everything
/// else as compact JSON.
fn field_to_arg(field: &Value) -> String {
    match field {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Task for ScriptTask {
    fn dispatch(&self) -> Result<Dispatch<'_>> {
        match &self.def.items {
            ItemSource::List(rows) => Ok(Box::new(
                rows.iter().map(|row| Ok(WorkItem::new(row.clone()))),
            )),
            ItemSource::Range { start, end } => {
                let (start, end) = (*start, *end);
                Ok(Box::new(
                    (start..end).map(|n| Ok(WorkItem::new(vec![Value::from(n)]))),
                ))
            }
            ItemSource::Lines(path) => {
                let lines: Box<dyn Iterator<Item = io::Result<String>>> =
                    if path == Path::new("-") {
                        Box::new(io::stdin().lines())
                    } else {
                        let file = fs::File::open(path)?;
                        Box::new(BufReader::new(file).lines())
                    };
                Ok(Box::new(lines.map(|line| {
                    line.map(|l| WorkItem::new(vec![Value::from(l)]))
                        .map_err(DivvyError::from)
                })))
            }
        }
    }

    fn perform(&self, item: &WorkItem) -> Result<()> {
        let command = self.render(item);
        let status = Command::new("sh").arg("-c").arg(&command).status()?;
        if !status.success() {
            if self.def.halt_on_error {
                return Err(DivvyError::Command { command, status });
            }
            warn!(command = %command, status = %status, "command failed");
        }
        Ok(())
    }

    fn socket_path(&self) -> PathBuf {
        self.def.socket.clone().unwrap_or_else(default_socket_path)
    }
}
