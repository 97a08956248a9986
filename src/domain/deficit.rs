use crate::domain::models::{Deficit, Options, Outcome, RunState, Window};
use chrono::{DateTime, Utc};

pub fn evaluate(
    window: &Window,
    options: &Options,
    run_state: &RunState,
    recorded_total: u64,
    now: DateTime<Utc>,
) -> Outcome {
    if let Some(outcome) = window_outcome(window, now) {
        return outcome;
    }

    let Some(needed_steps) = options
        .target
        .checked_sub(recorded_total)
        .filter(|needed| *needed > 0)
    else {
        return Outcome::TargetMet;
    };

    let add_from = pacing_baseline(window, run_state);
    Outcome::Proceed(Deficit {
        add_from,
        needed_steps,
        time_remaining_minutes: minutes_between(add_from, window.end),
        minutes_since_add_from: minutes_between(add_from, now),
    })
}

pub fn window_outcome(window: &Window, now: DateTime<Utc>) -> Option<Outcome> {
    if now < window.start {
        Some(Outcome::TooEarly)
    } else if now >= window.end {
        Some(Outcome::TooLate)
    } else {
        None
    }
}

pub fn pacing_baseline(window: &Window, run_state: &RunState) -> DateTime<Utc> {
    window.start.max(run_state.last_execution)
}

fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 60_000.0
}
