use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::mpsc::SyncSender;
use std::thread::JoinHandle;

use crate::scheduler::RunContext;
use crate::task::CommandStatus;
use crate::term;

/// Depth of the event bus shared by all runners of a group. Producers block
/// when the scheduler stalls, which is acceptable: nothing can proceed until
/// the scheduler drains again.
pub const EVENT_QUEUE_DEPTH: usize = 10_000;

/// One record on the event bus. A runner emits Running before any output,
/// one record per output token, and exactly one terminal record
/// (`complete = true`, defined return code) as its last message.
#[derive(Debug, Clone)]
pub struct CommandEvent {
    pub task_index: usize,
    pub status: CommandStatus,
    pub stdout_line: Option<String>,
    pub stderr_line: Option<String>,
    pub complete: bool,
    pub return_code: i32,
}

impl CommandEvent {
    fn running(task_index: usize) -> Self {
        Self {
            task_index,
            status: CommandStatus::Running,
            stdout_line: None,
            stderr_line: None,
            complete: false,
            return_code: -1,
        }
    }
}

/// Everything a runner needs, copied out of the task so the scheduler keeps
/// exclusive ownership of all task state.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub task_index: usize,
    pub name: String,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub ignore_failure: bool,
    pub stop_on_failure: bool,
}

/// Spawns the command on its own thread. Stdout and stderr are read by two
/// reader threads that feed tokens into the shared event bus in arrival
/// order; the runner then waits for process exit and emits the terminal
/// record.
pub fn spawn(
    spec: CommandSpec,
    events: SyncSender<CommandEvent>,
    ctx: Arc<RunContext>,
) -> JoinHandle<()> {
    std::thread::spawn(move || run(spec, events, ctx))
}

fn run(spec: CommandSpec, events: SyncSender<CommandEvent>, ctx: Arc<RunContext>) {
    let _ = events.send(CommandEvent::running(spec.task_index));

    let mut cmd = Command::new(&spec.argv[0]);
    cmd.args(&spec.argv[1..]);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    // Children get their own process group so the kill-on-stop policy can
    // signal the whole subtree. Stdin stays detached: a read from the
    // controlling TTY would suspend the task with SIGTTIN.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            // Flag first: the scheduler must see the signal no later than
            // this terminal record, or it may start another child.
            if spec.stop_on_failure {
                ctx.signal_exit();
            }
            let _ = events.send(CommandEvent {
                task_index: spec.task_index,
                status: CommandStatus::Error,
                stdout_line: None,
                stderr_line: Some(format!("failed to spawn '{}': {e}", spec.argv[0])),
                complete: true,
                return_code: -1,
            });
            return;
        }
    };

    let pgid = child.id();
    ctx.register_child_pgroup(pgid, &spec.name);

    let mut readers = Vec::new();
    if let Some(out) = child.stdout.take() {
        let events = events.clone();
        let task_index = spec.task_index;
        readers.push(std::thread::spawn(move || {
            split_stream(out, term::terminal_width, |token| {
                let _ = events.send(CommandEvent {
                    task_index,
                    status: CommandStatus::Running,
                    stdout_line: Some(token),
                    stderr_line: None,
                    complete: false,
                    return_code: -1,
                });
            });
        }));
    }
    if let Some(err) = child.stderr.take() {
        let events = events.clone();
        let task_index = spec.task_index;
        readers.push(std::thread::spawn(move || {
            split_stream(err, term::terminal_width, |token| {
                let _ = events.send(CommandEvent {
                    task_index,
                    status: CommandStatus::Running,
                    stdout_line: None,
                    stderr_line: Some(token),
                    complete: false,
                    return_code: -1,
                });
            });
        }));
    }

    // Both streams must be fully consumed before the wait: the join also
    // guarantees the terminal record is the last event for this child.
    for reader in readers {
        let _ = reader.join();
    }

    let return_code = match child.wait() {
        Ok(status) => status.code().unwrap_or(-1),
        Err(_) => -1,
    };
    ctx.unregister_child_pgroup(pgid);

    let status = if return_code == 0 || spec.ignore_failure {
        CommandStatus::Success
    } else {
        CommandStatus::Error
    };
    if status == CommandStatus::Error && spec.stop_on_failure {
        ctx.signal_exit();
    }

    let _ = events.send(CommandEvent {
        task_index: spec.task_index,
        status,
        stdout_line: None,
        stderr_line: None,
        complete: true,
        return_code,
    });
}

/// Splits a byte stream into display tokens:
/// - `\n` or `\r` ends a token (the terminator is consumed);
/// - with no terminator in sight, a buffer longer than twice the terminal
///   width is cut at exactly that many bytes, which keeps carriage-return
///   progress bars usable;
/// - residual bytes at end of stream become a final token.
///
/// Tokens are stripped of ANSI escape sequences before emission. Read errors
/// are treated as end of stream.
pub fn split_stream<R: Read>(
    mut reader: R,
    width: impl Fn() -> usize,
    mut emit: impl FnMut(String),
) {
    let mut buf = [0u8; 8192];
    let mut pending: Vec<u8> = Vec::with_capacity(1024);

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        pending.extend_from_slice(&buf[..n]);
        drain_tokens(&mut pending, width(), &mut emit);
    }

    if !pending.is_empty() {
        emit(term::sanitize_line(&String::from_utf8_lossy(&pending)));
    }
}

fn drain_tokens(pending: &mut Vec<u8>, width: usize, emit: &mut impl FnMut(String)) {
    loop {
        if let Some(pos) = pending.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let token = term::sanitize_line(&String::from_utf8_lossy(&pending[..pos]));
            pending.drain(..=pos);
            emit(token);
            continue;
        }
        let cap = width * 2;
        if cap > 0 && pending.len() > cap {
            let token = term::sanitize_line(&String::from_utf8_lossy(&pending[..cap]));
            pending.drain(..cap);
            emit(token);
            continue;
        }
        break;
    }
}
