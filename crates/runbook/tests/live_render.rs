#![cfg(unix)]

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use runbook::config::Options;
use runbook::scheduler::{RunContext, Scheduler};
use runbook::task::{self, TaskSpec};
use runbook::term::Screen;

/// Test writer that keeps the rendered transcript observable after the
/// scheduler (which owns the screen) is gone.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run_group(yaml: &str, opts: Options) -> (String, usize) {
    let ctx = Arc::new(RunContext::new(opts.clone()));
    let specs: Vec<TaskSpec> = serde_yaml::from_str(yaml).expect("yaml");
    let mut groups = task::inflate_tasks(specs, &opts, &ctx).expect("inflate");

    let buf = SharedBuf::default();
    let screen = Screen::with_writer(buf.clone(), Some(60));
    let mut scheduler = Scheduler::with_screen(Arc::clone(&ctx), screen);
    let failed = scheduler.process(&mut groups[0]).len();
    drop(scheduler);

    (buf.contents(), failed)
}

#[test]
fn live_run_paints_placeholder_header_and_final_lines() {
    let (transcript, failed) = run_group(
        r#"
- name: painted group
  parallel-tasks:
    - name: first task
      cmd: echo one
    - name: second task
      cmd: echo two
"#,
        Options {
            show_summary_footer: true,
            ..Options::default()
        },
    );

    assert_eq!(failed, 0);
    assert!(
        transcript.contains("painted group"),
        "missing group header: {transcript:?}"
    );
    assert!(transcript.contains("first task"));
    assert!(transcript.contains("second task"));
    // Completion rewrites the header with the task count.
    assert!(
        transcript.contains("(2 tasks)"),
        "missing completion header: {transcript:?}"
    );
    // Child rows carry the tree glyphs of the parallel templates.
    assert!(transcript.contains("├─"));
    assert!(transcript.contains("└─"));
    // The live view is escape-sequence driven.
    assert!(transcript.contains("\u{1b}["));
    // The footer reflects the run-wide counters.
    assert!(
        transcript.contains("Completed 2/2 tasks"),
        "missing footer: {transcript:?}"
    );
}

#[test]
fn failed_child_renders_the_exit_message() {
    let (transcript, failed) = run_group(
        r#"
- name: has a failure
  parallel-tasks:
    - cmd: "true"
    - name: doomed
      cmd: "false"
"#,
        Options {
            stop_on_failure: false,
            show_summary_footer: false,
            ..Options::default()
        },
    );

    assert_eq!(failed, 1);
    assert!(
        transcript.contains("Exited with error (1)"),
        "missing failure message: {transcript:?}"
    );
}

#[test]
fn collapse_erases_child_rows_after_completion() {
    let (transcript, failed) = run_group(
        r#"
- name: collapsing
  parallel-tasks:
    - cmd: echo a
    - cmd: echo b
    - cmd: echo c
"#,
        Options {
            collapse_on_completion: true,
            show_summary_footer: false,
            ..Options::default()
        },
    );

    assert_eq!(failed, 0);
    // The run still painted all child rows before collapsing them.
    assert!(transcript.contains("echo a"));
    assert!(transcript.contains("(3 tasks)"));
}
