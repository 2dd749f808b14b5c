use std::collections::{BTreeMap, HashMap};
use std::io;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossterm::style::Stylize;

use crate::config::Options;
use crate::eta;
use crate::logger::LogWriter;
use crate::runner::{self, CommandEvent, CommandSpec};
use crate::task::{CommandStatus, LineInfo, Task};
use crate::template::{TemplateKind, Templates, compose_line};
use crate::term::Screen;

const SPINNER_FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const SPINNER_TICK: Duration = Duration::from_millis(150);

/// Run-wide mutable state shared between the scheduler and its runners.
/// Task-tree mutation is serialized through the scheduler loop; these fields
/// are the only cross-thread state.
pub struct RunContext {
    pub options: Options,
    total_tasks: AtomicUsize,
    completed_tasks: AtomicUsize,
    exit_signaled: AtomicBool,
    command_time_cache: Mutex<HashMap<String, Duration>>,
    child_pgroups: Mutex<BTreeMap<u32, String>>,
}

impl RunContext {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            total_tasks: AtomicUsize::new(0),
            completed_tasks: AtomicUsize::new(0),
            exit_signaled: AtomicBool::new(false),
            command_time_cache: Mutex::new(HashMap::new()),
            child_pgroups: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn register_task(&self) {
        self.total_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_tasks(&self) -> usize {
        self.total_tasks.load(Ordering::Relaxed)
    }

    pub fn task_completed(&self) {
        self.completed_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn completed_tasks(&self) -> usize {
        self.completed_tasks.load(Ordering::Relaxed)
    }

    pub fn signal_exit(&self) {
        self.exit_signaled.store(true, Ordering::Relaxed);
    }

    pub fn exit_signaled(&self) -> bool {
        self.exit_signaled.load(Ordering::Relaxed)
    }

    pub fn cached_runtime(&self, cmd: &str) -> Option<Duration> {
        self.command_time_cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(cmd).copied())
    }

    pub fn record_runtime(&self, cmd: &str, elapsed: Duration) {
        if let Ok(mut cache) = self.command_time_cache.lock() {
            cache.insert(cmd.to_string(), elapsed);
        }
    }

    pub fn register_child_pgroup(&self, pgid: u32, owner: &str) {
        if let Ok(mut groups) = self.child_pgroups.lock() {
            groups.insert(pgid, owner.to_string());
        }
    }

    pub fn unregister_child_pgroup(&self, pgid: u32) {
        if let Ok(mut groups) = self.child_pgroups.lock() {
            groups.remove(&pgid);
        }
    }

    /// Signals every registered child's process group (kill-on-stop policy).
    pub fn kill_running_children(&self) {
        let pgids: Vec<u32> = self
            .child_pgroups
            .lock()
            .ok()
            .map(|g| g.keys().copied().collect())
            .unwrap_or_default();
        for pgid in pgids {
            kill_pgroup(pgid, false);
        }
    }
}

fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

/// Summary of a child whose final status was Error, kept for the post-run
/// report after the task tree is gone.
#[derive(Debug)]
pub struct FailedTask {
    pub name: String,
    pub return_code: i32,
    pub stderr: String,
}

pub struct Scheduler<W: Write> {
    ctx: Arc<RunContext>,
    screen: Screen<W>,
    templates: Templates,
    main_log: Option<LogWriter>,
}

impl Scheduler<io::Stdout> {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self::with_screen(ctx, Screen::stdout())
    }
}

impl<W: Write> Scheduler<W> {
    pub fn with_screen(ctx: Arc<RunContext>, screen: Screen<W>) -> Self {
        let main_log = if ctx.options.log_enabled() {
            match LogWriter::to_file(std::path::Path::new(&ctx.options.log_path)) {
                Ok(log) => Some(log),
                Err(e) => {
                    eprintln!("WARN: {e}");
                    None
                }
            }
        } else {
            None
        };
        Self {
            ctx,
            screen,
            templates: Templates::standard(),
            main_log,
        }
    }

    /// Drives one task group to completion (a leaf counts as a group of one)
    /// and returns the children whose final status was Error.
    ///
    /// At most `max_parallel_cmds` children run at once, started in declared
    /// order. The loop multiplexes runner events with the spinner tick and
    /// observes the run-wide exit flag after each event.
    pub fn process(&mut self, group: &mut Task) -> Vec<FailedTask> {
        let opts = self.ctx.options.clone();
        let vintage = opts.vintage;
        let max_parallel = opts.effective_parallelism();

        let group_estimate = eta::estimated_runtime(group, max_parallel);
        let group_title = group.name.clone();
        let show_header = group.children.len() > 1;

        let tasks: &mut [Task] = if group.children.is_empty() {
            std::slice::from_mut(group)
        } else {
            &mut group.children
        };
        let count = tasks.len();
        let footer_row = count as i32;

        let mut cur_line: i32 = 0;
        let started_at = Instant::now();

        if !vintage {
            if show_header {
                let info = LineInfo {
                    status: CommandStatus::Running.color(),
                    title: group_title.clone(),
                    ..LineInfo::default()
                };
                let line = compose_line(
                    &info,
                    self.templates.get(TemplateKind::Default),
                    self.screen.width(),
                );
                self.screen.write_line(&line);
            }
            for task in tasks.iter_mut() {
                task.started = false;
                task.display = LineInfo {
                    status: CommandStatus::Pending.color(),
                    title: task.name.clone(),
                    ..LineInfo::default()
                };
                self.repaint(task, &mut cur_line);
            }
        }

        let (tx, rx) = mpsc::sync_channel::<CommandEvent>(runner::EVENT_QUEUE_DEPTH);
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let mut running = 0usize;
        let mut last_started = 0usize;
        let mut group_status = CommandStatus::Success;
        let mut failed: Vec<FailedTask> = Vec::new();
        let mut spin_idx = 0usize;

        while last_started < max_parallel && last_started < count {
            self.launch(
                &mut tasks[last_started],
                last_started,
                &group_title,
                &tx,
                &mut handles,
            );
            running += 1;
            last_started += 1;
        }

        let mut next_tick = Instant::now() + SPINNER_TICK;

        while running > 0 {
            let ev = if vintage {
                match rx.recv() {
                    Ok(ev) => ev,
                    Err(_) => break,
                }
            } else {
                match rx.recv_timeout(next_tick.saturating_duration_since(Instant::now())) {
                    Ok(ev) => ev,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        self.spinner_tick(tasks, &mut cur_line, &mut spin_idx);
                        self.repaint_footer(&mut cur_line, footer_row, started_at, group_estimate);
                        next_tick = Instant::now() + SPINNER_TICK;
                        continue;
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            };

            {
                let task = &mut tasks[ev.task_index];

                if let Some(line) = &ev.stdout_line {
                    if let Some(sink) = &task.log_sink {
                        sink.append(line);
                    }
                    if vintage {
                        println!("{line}");
                    } else if task.show_output {
                        task.display.msg = format!("{}", line.as_str().yellow());
                    }
                }
                if let Some(line) = &ev.stderr_line {
                    task.error_buffer.push_str(line);
                    task.error_buffer.push('\n');
                    if let Some(sink) = &task.log_sink {
                        sink.append(&format!("{}", line.as_str().red()));
                    }
                    if vintage {
                        println!("{}", line.as_str().red());
                    } else if task.show_output {
                        task.display.msg = format!("{}", line.as_str().red());
                    }
                }

                if ev.complete {
                    task.complete = true;
                    task.return_code = Some(ev.return_code);
                    task.stop_time = Some(Instant::now());
                    self.ctx.task_completed();
                    if let (Some(start), Some(stop)) = (task.start_time, task.stop_time) {
                        self.ctx
                            .record_runtime(&task.cmd_string, stop.duration_since(start));
                    }
                    if let Some(mut sink) = task.log_sink.take() {
                        sink.close();
                    }
                    if let Some(main) = &self.main_log {
                        main.append(&format!(
                            "Completed Task: {} (rc: {})",
                            task.name, ev.return_code
                        ));
                    }
                    running -= 1;
                    if ev.status == CommandStatus::Error {
                        group_status = CommandStatus::Error;
                        failed.push(FailedTask {
                            name: task.name.clone(),
                            return_code: ev.return_code,
                            stderr: task.error_buffer.clone(),
                        });
                    }
                }

                if !vintage {
                    task.display.status = ev.status.color();
                    task.display.title = task.name.clone();
                    if !task.complete {
                        task.display.spinner = SPINNER_FRAMES[spin_idx].to_string();
                        task.display.eta = self.eta_display(task);
                    }
                    self.repaint(task, &mut cur_line);
                }
            }

            if ev.complete && last_started < count && !self.ctx.exit_signaled() {
                self.launch(
                    &mut tasks[last_started],
                    last_started,
                    &group_title,
                    &tx,
                    &mut handles,
                );
                running += 1;
                last_started += 1;
            }

            self.repaint_footer(&mut cur_line, footer_row, started_at, group_estimate);

            if self.ctx.exit_signaled() {
                if opts.kill_on_stop {
                    self.ctx.kill_running_children();
                }
                break;
            }
        }

        // Leave in-flight runners to the process wind-down on an early exit;
        // otherwise wait for them so every sink and pipe is released.
        if !self.ctx.exit_signaled() {
            for handle in handles {
                let _ = handle.join();
            }
        }

        if !vintage {
            if show_header {
                let info = LineInfo {
                    status: group_status.color(),
                    title: format!(
                        "{group_title}{}",
                        format!(" ({count} tasks)").magenta()
                    ),
                    ..LineInfo::default()
                };
                let line = compose_line(
                    &info,
                    self.templates.get(TemplateKind::Default),
                    self.screen.width(),
                );
                self.screen.display(&line, &mut cur_line, -1);
            }

            if opts.collapse_on_completion && show_header {
                // Erase the child rows (and footer), keep the header.
                for row in 0..count {
                    self.screen.move_to(&mut cur_line, row as i32);
                    self.screen.erase_line();
                }
                if opts.show_summary_footer {
                    self.screen.move_to(&mut cur_line, footer_row);
                    self.screen.erase_line();
                }
                self.screen.move_to(&mut cur_line, 0);
            } else {
                self.screen.move_to(&mut cur_line, count as i32);
            }
            self.screen.flush();
        }

        failed
    }

    fn launch(
        &mut self,
        task: &mut Task,
        index: usize,
        group_title: &str,
        tx: &mpsc::SyncSender<CommandEvent>,
        handles: &mut Vec<JoinHandle<()>>,
    ) {
        task.started = true;
        task.start_time = Some(Instant::now());

        let opts = &self.ctx.options;
        if opts.log_enabled() {
            match LogWriter::task_sink(&opts.log_cache_dir(), &task.name) {
                Ok(sink) => task.log_sink = Some(sink),
                Err(e) => {
                    if let Some(main) = &self.main_log {
                        main.append(&format!("WARN: {e}"));
                    }
                }
            }
        }
        if let Some(main) = &self.main_log {
            main.append(&format!("Started Task: {}", task.name));
        }
        if opts.vintage {
            println!("{}", format!("{group_title} : {}", task.name).bold());
            println!("{}", format!("Command: {}", task.cmd_string).bold());
        }

        let spec = CommandSpec {
            task_index: index,
            name: task.name.clone(),
            argv: task.cmd_argv.clone(),
            env: opts
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ignore_failure: task.ignore_failure,
            stop_on_failure: task.stop_on_failure,
        };
        handles.push(runner::spawn(spec, tx.clone(), Arc::clone(&self.ctx)));
    }

    fn spinner_tick(&mut self, tasks: &mut [Task], cur_line: &mut i32, spin_idx: &mut usize) {
        *spin_idx = (*spin_idx + 1) % SPINNER_FRAMES.len();
        for task in tasks.iter_mut() {
            if task.started && !task.complete {
                task.display.spinner = SPINNER_FRAMES[*spin_idx].to_string();
                task.display.eta = self.eta_display(task);
                self.repaint(task, cur_line);
            }
        }
    }

    /// Repaints one task row from its display state. Completed tasks lose
    /// spinner and ETA; a failed one gets the exit message.
    fn repaint(&mut self, task: &mut Task, cur_line: &mut i32) {
        if task.complete {
            task.display.spinner.clear();
            task.display.eta.clear();
            if task.return_code.is_some_and(|rc| rc != 0) && !task.ignore_failure {
                let rc = task.return_code.unwrap_or(-1);
                task.display.msg =
                    format!("{}", format!("Exited with error ({rc})").red());
            } else {
                task.display.msg.clear();
            }
        }
        let line = compose_line(
            &task.display,
            self.templates.get(task.template),
            self.screen.width(),
        );
        self.screen
            .display(&line, cur_line, task.display_index as i32);
    }

    fn repaint_footer(
        &mut self,
        cur_line: &mut i32,
        row: i32,
        started_at: Instant,
        group_estimate: Option<Duration>,
    ) {
        let opts = &self.ctx.options;
        if opts.vintage || !opts.show_summary_footer {
            return;
        }
        let elapsed = eta::format_elapsed_hms(started_at.elapsed().as_secs());
        let eta_text = match group_estimate {
            Some(est) if opts.show_task_eta => {
                let remaining = est.as_secs_f64() - started_at.elapsed().as_secs_f64();
                format!(
                    "{}",
                    format!(
                        "[{elapsed} eta {}]",
                        eta::format_signed_duration(remaining as i64)
                    )
                    .bold()
                )
            }
            _ => format!("{}", format!("[{elapsed}]").bold()),
        };
        let info = LineInfo {
            status: CommandStatus::Pending.color(),
            title: format!(
                "Completed {}/{} tasks",
                self.ctx.completed_tasks(),
                self.ctx.total_tasks()
            ),
            eta: eta_text,
            ..LineInfo::default()
        };
        let line = compose_line(
            &info,
            self.templates.get(TemplateKind::Default),
            self.screen.width(),
        );
        self.screen.display(&line, cur_line, row);
    }

    fn eta_display(&self, task: &Task) -> String {
        if !self.ctx.options.show_task_eta {
            return String::new();
        }
        let value = match (task.estimated_runtime, task.start_time) {
            (Some(est), Some(start)) => {
                let remaining = est.as_secs_f64() - start.elapsed().as_secs_f64();
                eta::format_signed_duration(remaining as i64)
            }
            _ => "?".into(),
        };
        format!("{}", format!("[{value}]").bold())
    }
}
