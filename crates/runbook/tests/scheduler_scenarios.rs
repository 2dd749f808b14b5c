#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use runbook::config::Options;
use runbook::scheduler::{RunContext, Scheduler};
use runbook::task::{self, Task, TaskSpec};

fn vintage_options() -> Options {
    Options {
        vintage: true,
        show_summary_footer: false,
        ..Options::default()
    }
}

fn inflate(yaml: &str, opts: &Options, ctx: &RunContext) -> Vec<Task> {
    let specs: Vec<TaskSpec> = serde_yaml::from_str(yaml).expect("yaml");
    task::inflate_tasks(specs, opts, ctx).expect("inflate")
}

#[test]
fn sequential_group_runs_to_completion_in_order() {
    let opts = Options {
        max_parallel_cmds: 1,
        ..vintage_options()
    };
    let ctx = Arc::new(RunContext::new(opts.clone()));
    let mut groups = inflate(
        r#"
- name: letters
  parallel-tasks:
    - cmd: echo a
    - cmd: echo b
    - cmd: echo c
"#,
        &opts,
        &ctx,
    );

    let mut scheduler = Scheduler::new(Arc::clone(&ctx));
    let failed = scheduler.process(&mut groups[0]);

    assert!(failed.is_empty());
    assert_eq!(ctx.total_tasks(), 3);
    assert_eq!(ctx.completed_tasks(), 3);
    for child in &groups[0].children {
        assert!(child.started);
        assert!(child.complete);
        assert_eq!(child.return_code, Some(0));
        assert!(child.start_time.is_some());
        assert!(child.stop_time.is_some());
    }
    for cmd in ["echo a", "echo b", "echo c"] {
        assert!(
            ctx.cached_runtime(cmd).is_some(),
            "missing cache entry for '{cmd}'"
        );
    }
}

#[test]
fn parallelism_stays_bounded() {
    let opts = Options {
        max_parallel_cmds: 2,
        ..vintage_options()
    };
    let ctx = Arc::new(RunContext::new(opts.clone()));
    let mut groups = inflate(
        r#"
- name: naps
  parallel-tasks:
    - cmd: sleep 0.4
    - cmd: sleep 0.4
    - cmd: sleep 0.4
    - cmd: sleep 0.4
"#,
        &opts,
        &ctx,
    );

    let started = Instant::now();
    let mut scheduler = Scheduler::new(Arc::clone(&ctx));
    let failed = scheduler.process(&mut groups[0]);
    let elapsed = started.elapsed();

    assert!(failed.is_empty());
    assert_eq!(ctx.completed_tasks(), 4);
    // Four 0.4s sleeps at parallelism two need at least two waves.
    assert!(
        elapsed >= Duration::from_millis(700),
        "elapsed {elapsed:?} implies more than 2 ran at once"
    );
}

#[test]
fn stop_on_failure_halts_the_group() {
    let opts = Options {
        max_parallel_cmds: 1,
        stop_on_failure: false,
        ..vintage_options()
    };
    let ctx = Arc::new(RunContext::new(opts.clone()));
    let mut groups = inflate(
        r#"
- name: fail fast
  parallel-tasks:
    - cmd: "true"
    - name: breaks
      cmd: "false"
      stop-on-failure: true
    - name: never runs
      cmd: echo never
"#,
        &opts,
        &ctx,
    );

    let mut scheduler = Scheduler::new(Arc::clone(&ctx));
    let failed = scheduler.process(&mut groups[0]);

    assert!(ctx.exit_signaled());
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, "breaks");
    assert_eq!(failed[0].return_code, 1);

    let children = &groups[0].children;
    assert!(children[0].complete);
    assert!(children[1].complete);
    assert!(!children[2].started, "third child must never start");
}

#[test]
fn ignore_failure_reports_success_with_nonzero_return_code() {
    let opts = vintage_options();
    let ctx = Arc::new(RunContext::new(opts.clone()));
    let mut groups = inflate(
        r#"
- name: tolerant
  parallel-tasks:
    - name: allowed to fail
      cmd: "false"
      ignore-failure: true
    - cmd: "true"
"#,
        &opts,
        &ctx,
    );

    let mut scheduler = Scheduler::new(Arc::clone(&ctx));
    let failed = scheduler.process(&mut groups[0]);

    assert!(failed.is_empty(), "ignored failure must not be reported");
    assert!(!ctx.exit_signaled());

    let children = &groups[0].children;
    assert_eq!(children[0].return_code, Some(1));
    assert!(children[0].complete);
    assert_eq!(children[1].return_code, Some(0));
}

#[test]
fn spawn_failure_becomes_an_error_terminal_record() {
    let opts = Options {
        stop_on_failure: false,
        ..vintage_options()
    };
    let ctx = Arc::new(RunContext::new(opts.clone()));
    let mut groups = inflate("- cmd: /no/such/binary-for-runbook-tests", &opts, &ctx);

    let mut scheduler = Scheduler::new(Arc::clone(&ctx));
    let failed = scheduler.process(&mut groups[0]);

    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].return_code, -1);
    assert!(
        failed[0].stderr.contains("failed to spawn"),
        "stderr: {}",
        failed[0].stderr
    );
    assert_eq!(ctx.completed_tasks(), 1);
}

#[test]
fn stderr_accumulates_in_the_error_buffer() {
    let opts = Options {
        stop_on_failure: false,
        ..vintage_options()
    };
    let ctx = Arc::new(RunContext::new(opts.clone()));
    let mut groups = inflate("- cmd: cat /definitely/missing/runbook-file", &opts, &ctx);

    let mut scheduler = Scheduler::new(Arc::clone(&ctx));
    let failed = scheduler.process(&mut groups[0]);

    assert_eq!(failed.len(), 1);
    assert_ne!(failed[0].return_code, 0);
    assert!(
        !failed[0].stderr.trim().is_empty(),
        "stderr buffer should carry the diagnostic"
    );
}

#[test]
fn standalone_leaf_runs_as_a_group_of_one() {
    let opts = vintage_options();
    let ctx = Arc::new(RunContext::new(opts.clone()));
    let mut groups = inflate("- cmd: echo solo", &opts, &ctx);

    let mut scheduler = Scheduler::new(Arc::clone(&ctx));
    let failed = scheduler.process(&mut groups[0]);

    assert!(failed.is_empty());
    assert!(groups[0].complete);
    assert_eq!(groups[0].return_code, Some(0));
    assert_eq!(ctx.total_tasks(), 1);
    assert_eq!(ctx.completed_tasks(), 1);
}

#[test]
fn shared_environment_reaches_spawned_commands() {
    let mut opts = Options {
        stop_on_failure: false,
        ..vintage_options()
    };
    opts.environment
        .insert("RUNBOOK_TEST_MARKER".into(), "present".into());
    let ctx = Arc::new(RunContext::new(opts.clone()));
    // printenv exits nonzero when the variable is unset, so a success here
    // proves the environment map was exported.
    let mut groups = inflate("- cmd: printenv RUNBOOK_TEST_MARKER", &opts, &ctx);

    let mut scheduler = Scheduler::new(Arc::clone(&ctx));
    let failed = scheduler.process(&mut groups[0]);
    assert!(failed.is_empty());
    assert_eq!(groups[0].return_code, Some(0));
}
