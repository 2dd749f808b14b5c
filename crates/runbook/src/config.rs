use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::task::TaskSpec;

fn default_true() -> bool {
    true
}

fn default_max_parallel() -> usize {
    4
}

fn default_replica_marker() -> String {
    "$TAG".into()
}

/// Run-wide options. Values come from the runbook's `config:` section and may
/// be overridden by CLI flags before the run starts; after that the record is
/// read-only.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Options {
    /// Max children of a group running at once. 0 means "use CPU count".
    pub max_parallel_cmds: usize,
    /// Default for tasks that do not set `stop-on-failure` themselves.
    pub stop_on_failure: bool,
    /// Default for tasks that do not set `show-output` themselves.
    pub show_task_output: bool,
    pub show_task_eta: bool,
    pub show_summary_footer: bool,
    pub collapse_on_completion: bool,
    /// Plain appended lines, no cursor movement.
    pub vintage: bool,
    /// When a stop-on-failure task fails, signal the running children's
    /// process groups instead of leaving them to finish.
    pub kill_on_stop: bool,
    pub replica_replace_string: String,
    /// Main log file. Empty disables the main log and per-task logs.
    pub log_path: String,
    /// Directory for per-task log files. Empty means the system temp dir.
    pub log_cache_path: String,
    /// Extra environment exported to every spawned command.
    pub environment: BTreeMap<String, String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_parallel_cmds: default_max_parallel(),
            stop_on_failure: default_true(),
            show_task_output: default_true(),
            show_task_eta: false,
            show_summary_footer: default_true(),
            collapse_on_completion: false,
            vintage: false,
            kill_on_stop: false,
            replica_replace_string: default_replica_marker(),
            log_path: String::new(),
            log_cache_path: String::new(),
            environment: BTreeMap::new(),
        }
    }
}

impl Options {
    /// Concurrency cap with the 0 = "CPU count" convention resolved.
    pub fn effective_parallelism(&self) -> usize {
        if self.max_parallel_cmds == 0 {
            num_cpus::get().max(1)
        } else {
            self.max_parallel_cmds
        }
    }

    pub fn log_enabled(&self) -> bool {
        !self.log_path.trim().is_empty()
    }

    /// Resolved directory for per-task log files.
    pub fn log_cache_dir(&self) -> PathBuf {
        let raw = self.log_cache_path.trim();
        if raw.is_empty() {
            std::env::temp_dir().join("runbook")
        } else {
            PathBuf::from(raw)
        }
    }
}

/// A parsed runbook file: run options plus the top-level task list.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Runbook {
    pub config: Options,
    pub tasks: Vec<TaskSpec>,
}

pub fn load(path: &Path) -> Result<Runbook> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read runbook {}: {e}", path.display())))?;
    let book: Runbook = serde_yaml::from_str(&data)
        .map_err(|e| Error::msg(format!("YAML parse error in {}: {e}", path.display())))?;
    if book.tasks.is_empty() {
        return Err(Error::msg(format!(
            "runbook {} declares no tasks",
            path.display()
        )));
    }
    Ok(book)
}
