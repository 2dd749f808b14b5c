use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use crossterm::style::Stylize;

use runbook::config;
use runbook::error::{Error, Result};
use runbook::scheduler::{FailedTask, RunContext, Scheduler};
use runbook::task;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct CliArgs {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a runbook
    Run {
        /// Path to a runbook YAML
        runbook: PathBuf,
        /// Max number of commands to run concurrently (0 = use CPU count)
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Plain appended output, no live rendering
        #[arg(long)]
        vintage: bool,
        /// Show per-task and group ETAs
        #[arg(long)]
        show_eta: bool,
        /// Disable the summary footer line
        #[arg(long)]
        no_footer: bool,
        /// Erase a completed group's child lines, keeping only the header
        #[arg(long)]
        collapse: bool,
        /// Main log file (also enables per-task logs)
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Load and inflate a runbook, print the flattened task list
    Check {
        /// Path to a runbook YAML
        runbook: PathBuf,
    },
    /// Write a minimal runbook scaffold
    Init {
        /// Target directory (default: current directory)
        dir: Option<PathBuf>,
        /// Overwrite an existing scaffold file
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    let args = CliArgs::parse();
    match args.cmd {
        Command::Run {
            runbook,
            max_parallel,
            vintage,
            show_eta,
            no_footer,
            collapse,
            log,
        } => cmd_run(
            &runbook,
            max_parallel,
            vintage,
            show_eta,
            no_footer,
            collapse,
            log,
        ),
        Command::Check { runbook } => cmd_check(&runbook),
        Command::Init { dir, force } => cmd_init(dir, force),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    path: &Path,
    max_parallel: Option<usize>,
    vintage: bool,
    show_eta: bool,
    no_footer: bool,
    collapse: bool,
    log: Option<PathBuf>,
) -> Result<()> {
    let book = config::load(path)?;

    let mut opts = book.config;
    if let Some(n) = max_parallel {
        opts.max_parallel_cmds = n;
    }
    if vintage {
        opts.vintage = true;
    }
    if show_eta {
        opts.show_task_eta = true;
    }
    if no_footer {
        opts.show_summary_footer = false;
    }
    if collapse {
        opts.collapse_on_completion = true;
    }
    if let Some(log) = log {
        opts.log_path = log.display().to_string();
    }

    let ctx = Arc::new(RunContext::new(opts));
    let groups = task::inflate_tasks(book.tasks, &ctx.options, &ctx)?;

    let mut scheduler = Scheduler::new(Arc::clone(&ctx));
    let mut all_failed: Vec<FailedTask> = Vec::new();
    for mut group in groups {
        all_failed.extend(scheduler.process(&mut group));
        if ctx.exit_signaled() {
            break;
        }
    }

    if !all_failed.is_empty() || ctx.exit_signaled() {
        print_failure_report(&all_failed);
        std::process::exit(1);
    }
    Ok(())
}

fn print_failure_report(failed: &[FailedTask]) {
    if failed.is_empty() {
        return;
    }
    println!();
    println!(
        "{}",
        format!("{} failed task(s):", failed.len()).red().bold()
    );
    for task in failed {
        println!(
            "{}",
            format!("✗ {} (rc: {})", task.name, task.return_code).red()
        );
        for line in task.stderr.lines() {
            println!("    {line}");
        }
    }
}

fn cmd_check(path: &Path) -> Result<()> {
    let book = config::load(path)?;
    let ctx = RunContext::new(book.config.clone());
    let groups = task::inflate_tasks(book.tasks, &ctx.options, &ctx)?;

    let mut row = 0usize;
    for group in &groups {
        if group.is_leaf() {
            row += 1;
            print_task_row(row, group, "");
        } else {
            println!("{} ({} tasks)", group.name, group.children.len());
            for child in &group.children {
                row += 1;
                print_task_row(row, child, "  ");
            }
        }
    }
    println!("{} command(s) total", ctx.total_tasks());
    Ok(())
}

fn print_task_row(row: usize, task: &task::Task, indent: &str) {
    let mut flags = Vec::new();
    if task.stop_on_failure {
        flags.push("stop-on-failure");
    }
    if task.ignore_failure {
        flags.push("ignore-failure");
    }
    let flags = if flags.is_empty() {
        String::new()
    } else {
        format!("  [{}]", flags.join(", "))
    };
    println!(
        "{indent}{row:>3}. {:<25}  {}{flags}",
        task.name, task.cmd_string
    );
}

fn cmd_init(dir: Option<PathBuf>, force: bool) -> Result<()> {
    let target = dir.unwrap_or_else(|| PathBuf::from("."));
    if target.exists() && !target.is_dir() {
        return Err(Error::msg(format!(
            "init target exists but is not a directory: {}",
            target.display()
        )));
    }
    fs::create_dir_all(&target)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", target.display())))?;

    let path = target.join("runbook.yml");
    if path.exists() && !force {
        return Err(Error::msg(format!(
            "refusing to overwrite {}. rerun with --force to overwrite",
            path.display()
        )));
    }
    fs::write(&path, SCAFFOLD)
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))?;

    println!("initialized runbook at {}", path.display());
    println!("next:");
    println!("  runbook check {}", path.display());
    println!("  runbook run {}", path.display());
    Ok(())
}

const SCAFFOLD: &str = r#"config:
  max-parallel-cmds: 4

tasks:
  - name: prepare
    cmd: echo preparing

  - name: fan out
    parallel-tasks:
      - name: "fetch $TAG"
        cmd: "echo fetching $TAG"
        for-each: [alpha, beta, gamma]
      - name: critical step
        cmd: "true"
        stop-on-failure: true

  - name: finish
    cmd: echo done
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_a_loadable_scaffold() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let target = tmp.path().join("demo");

        cmd_init(Some(target.clone()), false).expect("init");
        let path = target.join("runbook.yml");
        assert!(path.is_file());

        let book = config::load(&path).expect("scaffold must load");
        assert_eq!(book.tasks.len(), 3);
    }

    #[test]
    fn init_refuses_overwrite_without_force() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let target = tmp.path().to_path_buf();

        fs::write(target.join("runbook.yml"), "custom").expect("seed");
        let err = cmd_init(Some(target.clone()), false).expect_err("expected conflict");
        assert!(
            err.to_string().contains("refusing to overwrite"),
            "unexpected error: {err}"
        );

        cmd_init(Some(target.clone()), true).expect("force overwrite");
        let rebuilt = fs::read_to_string(target.join("runbook.yml")).expect("read");
        assert!(rebuilt.contains("parallel-tasks"), "unexpected: {rebuilt}");
    }
}
