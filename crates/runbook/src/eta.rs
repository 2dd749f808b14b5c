use std::time::Duration;

use crate::task::Task;

/// Estimated wall time for a task. A leaf's estimate is its cached runtime
/// (if any). A group's estimate simulates bounded-parallel execution of its
/// children in declared order: start while slots remain, otherwise advance
/// to the earliest in-flight completion. Children without an estimate are
/// excluded; with no estimates at all the result is unknown.
pub fn estimated_runtime(task: &Task, max_parallel: usize) -> Option<Duration> {
    if task.is_leaf() {
        return task.estimated_runtime;
    }
    let estimates: Vec<Option<Duration>> = task
        .children
        .iter()
        .map(|c| c.estimated_runtime)
        .collect();
    simulate(&estimates, max_parallel)
}

fn simulate(estimates: &[Option<Duration>], max_parallel: usize) -> Option<Duration> {
    let mut free_slots = max_parallel.max(1);
    let mut in_flight: Vec<Duration> = Vec::new();
    let mut now = Duration::ZERO;
    let mut max_end: Option<Duration> = None;

    for est in estimates.iter().flatten() {
        if free_slots == 0 {
            // Advance to the earliest completion and reclaim its slot.
            let (min_idx, _) = in_flight
                .iter()
                .enumerate()
                .min_by_key(|(_, end)| **end)
                .expect("in-flight set is non-empty when slots are exhausted");
            now = in_flight.swap_remove(min_idx);
            free_slots += 1;
        }
        let end = now + *est;
        in_flight.push(end);
        free_slots -= 1;
        max_end = Some(max_end.map_or(end, |m| m.max(end)));
    }

    max_end
}

/// Remaining-time display for a running task: estimate minus elapsed, as a
/// signed duration. Negative values render (they signal overrun).
pub fn format_signed_duration(secs: i64) -> String {
    let sign = if secs < 0 { "-" } else { "" };
    let abs = secs.unsigned_abs();
    if abs >= 60 {
        format!("{sign}{}m{:02}s", abs / 60, abs % 60)
    } else {
        format!("{sign}{abs}s")
    }
}

pub fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
