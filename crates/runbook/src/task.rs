use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::config::Options;
use crate::error::{Error, Result};
use crate::logger::LogWriter;
use crate::scheduler::RunContext;
use crate::template::TemplateKind;
use crate::term;

/// Status of a command, as carried by runner events and reflected in the
/// display. Its only behavior is color lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Running,
    Pending,
    Success,
    Error,
}

impl CommandStatus {
    pub fn color(self) -> &'static str {
        match self {
            CommandStatus::Running => "\x1b[38;5;28m",
            CommandStatus::Pending => "\x1b[38;5;22m",
            CommandStatus::Success => "\x1b[92m",
            CommandStatus::Error => "\x1b[91m",
        }
    }
}

/// Rendering snapshot for one task row. Replaced atomically by the scheduler,
/// never mutated while a render pass reads it.
#[derive(Debug, Clone)]
pub struct LineInfo {
    pub status: &'static str,
    pub title: String,
    pub msg: String,
    pub spinner: String,
    pub eta: String,
    pub split: String,
}

impl Default for LineInfo {
    fn default() -> Self {
        Self {
            status: CommandStatus::Pending.color(),
            title: String::new(),
            msg: String::new(),
            spinner: String::new(),
            eta: String::new(),
            split: String::new(),
        }
    }
}

/// A task as written in the runbook, before inflation. Per-task booleans are
/// optional so unset values fall back to the run-wide defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TaskSpec {
    pub name: Option<String>,
    pub cmd: Option<String>,
    pub stop_on_failure: Option<bool>,
    pub show_output: Option<bool>,
    pub ignore_failure: Option<bool>,
    pub parallel_tasks: Vec<TaskSpec>,
    pub for_each: Vec<String>,
}

/// An inflated unit of work: either a leaf (non-empty argv, no children) or a
/// group (empty argv, children run in parallel under one header).
#[derive(Debug, Default)]
pub struct Task {
    pub name: String,
    pub cmd_string: String,
    pub cmd_argv: Vec<String>,
    pub stop_on_failure: bool,
    pub show_output: bool,
    pub ignore_failure: bool,
    pub children: Vec<Task>,

    pub estimated_runtime: Option<Duration>,
    pub start_time: Option<Instant>,
    pub stop_time: Option<Instant>,
    pub return_code: Option<i32>,
    pub started: bool,
    pub complete: bool,

    pub display_index: usize,
    pub template: TemplateKind,
    pub display: LineInfo,
    pub error_buffer: String,
    pub log_sink: Option<LogWriter>,
}

impl Task {
    pub fn is_leaf(&self) -> bool {
        !self.cmd_argv.is_empty()
    }
}

/// Inflates the runbook's top-level task list: replica expansion, argv
/// splitting, default resolution, display indices and template variants.
/// Fails before any execution when a task is malformed.
pub fn inflate_tasks(specs: Vec<TaskSpec>, opts: &Options, ctx: &RunContext) -> Result<Vec<Task>> {
    specs
        .into_iter()
        .map(|spec| inflate_top(spec, opts, ctx))
        .collect()
}

fn inflate_top(spec: TaskSpec, opts: &Options, ctx: &RunContext) -> Result<Task> {
    if !spec.for_each.is_empty() {
        return Err(Error::msg(format!(
            "malformed task '{}': for-each is only supported on children of a group",
            display_name(&spec)
        )));
    }

    match (&spec.cmd, spec.parallel_tasks.is_empty()) {
        (Some(_), false) => Err(Error::msg(format!(
            "malformed task '{}': cmd and parallel-tasks are mutually exclusive",
            display_name(&spec)
        ))),
        (None, true) => Err(Error::msg(format!(
            "malformed task '{}': needs either cmd or parallel-tasks",
            display_name(&spec)
        ))),
        (Some(_), true) => inflate_leaf(&spec, None, opts, ctx),
        (None, false) => inflate_group(spec, opts, ctx),
    }
}

fn inflate_group(spec: TaskSpec, opts: &Options, ctx: &RunContext) -> Result<Task> {
    let group_name = spec.name.clone().unwrap_or_default();

    let mut children = Vec::new();
    for child in &spec.parallel_tasks {
        if !child.parallel_tasks.is_empty() {
            return Err(Error::msg(format!(
                "malformed task '{}': groups nest at most one level deep",
                display_name(child)
            )));
        }
        if child.cmd.is_none() {
            return Err(Error::msg(format!(
                "malformed task '{}': children of a group need a cmd",
                display_name(child)
            )));
        }
        if child.for_each.is_empty() {
            children.push(inflate_leaf(child, None, opts, ctx)?);
        } else {
            for value in &child.for_each {
                children.push(inflate_leaf(child, Some(value.as_str()), opts, ctx)?);
            }
        }
    }

    if children.is_empty() {
        return Err(Error::msg(format!(
            "malformed task '{group_name}': group expanded to no children"
        )));
    }

    let last = children.len() - 1;
    for (idx, child) in children.iter_mut().enumerate() {
        child.display_index = idx;
        child.template = if idx == last {
            TemplateKind::LastParallel
        } else {
            TemplateKind::Parallel
        };
    }

    Ok(Task {
        name: group_name,
        children,
        ..Task::default()
    })
}

fn inflate_leaf(
    spec: &TaskSpec,
    replica: Option<&str>,
    opts: &Options,
    ctx: &RunContext,
) -> Result<Task> {
    let mut cmd_string = spec.cmd.clone().unwrap_or_default();
    let mut name = spec.name.clone().unwrap_or_default();

    if let Some(value) = replica {
        cmd_string = cmd_string.replace(&opts.replica_replace_string, value);
        if !name.is_empty() {
            name = name.replace(&opts.replica_replace_string, value);
        }
    }

    let cmd_argv: Vec<String> = cmd_string.split_whitespace().map(str::to_string).collect();
    if cmd_argv.is_empty() {
        return Err(Error::msg(format!(
            "malformed task '{}': command is empty after substitution",
            display_name(spec)
        )));
    }

    if name.is_empty() {
        name = if term::visual_length(&cmd_string) > 25 {
            format!("{}...", term::trim_to_visual_length(&cmd_string, 22))
        } else {
            cmd_string.clone()
        };
    }

    ctx.register_task();

    Ok(Task {
        name,
        estimated_runtime: ctx.cached_runtime(&cmd_string),
        cmd_string,
        cmd_argv,
        stop_on_failure: spec.stop_on_failure.unwrap_or(opts.stop_on_failure),
        show_output: spec.show_output.unwrap_or(opts.show_task_output),
        ignore_failure: spec.ignore_failure.unwrap_or(false),
        ..Task::default()
    })
}

fn display_name(spec: &TaskSpec) -> String {
    spec.name
        .clone()
        .or_else(|| spec.cmd.clone())
        .unwrap_or_else(|| "<unnamed>".into())
}
