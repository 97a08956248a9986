use crate::domain::error::PacingError;
use crate::domain::models::{Deficit, Partition, PartitionPlan};
use chrono::Duration;
use rand::Rng;

pub const MINUTES_PER_PARTITION: f64 = 5.0;
const RATE_JITTER_MIN: f64 = 1.0;
const RATE_JITTER_MAX: f64 = 1.2;
const COUNT_JITTER_MIN: f64 = 0.9;
const COUNT_JITTER_MAX: f64 = 1.1;

pub fn generate<R>(deficit: &Deficit, rng: &mut R) -> Result<PartitionPlan, PacingError>
where
    R: Rng,
{
    let time_remaining = deficit.time_remaining_minutes;
    let elapsed = deficit.minutes_since_add_from;
    if !time_remaining.is_finite() || time_remaining <= 0.0 {
        return Err(PacingError::InvariantViolation(format!(
            "time remaining must be > 0 minutes, got {time_remaining}"
        )));
    }
    if !elapsed.is_finite() || elapsed < 0.0 {
        return Err(PacingError::InvariantViolation(format!(
            "minutes since pacing baseline must be >= 0, got {elapsed}"
        )));
    }

    let steps_per_minute = deficit.needed_steps as f64 / time_remaining;
    let jitter = rng.random_range(RATE_JITTER_MIN..=RATE_JITTER_MAX);
    let steps_to_add = ((elapsed * steps_per_minute * jitter).round() as u64).min(deficit.needed_steps);

    let partition_count = ((elapsed / MINUTES_PER_PARTITION).round() as i64).max(1);
    let partition_duration = (elapsed / partition_count as f64).floor() as i64;
    if steps_to_add == 0 || partition_duration == 0 {
        return Ok(PartitionPlan::default());
    }
    if partition_count <= 0 || partition_duration < 0 {
        return Err(PacingError::InvariantViolation(format!(
            "invalid partition layout: count={partition_count}, duration={partition_duration}"
        )));
    }

    let mut remaining = steps_to_add;
    let mut partitions = Vec::with_capacity(partition_count as usize);
    for index in 0..partition_count {
        let (from_offset, to_offset) = jittered_bounds(partition_duration, index, rng);
        let count = if index == partition_count - 1 {
            remaining
        } else {
            let share = remaining as f64 / (partition_count - index) as f64;
            let scaled = share * rng.random_range(COUNT_JITTER_MIN..=COUNT_JITTER_MAX);
            (scaled.round() as u64).min(remaining)
        };
        remaining -= count;

        partitions.push(Partition {
            from: deficit.add_from + Duration::minutes(from_offset),
            to: deficit.add_from + Duration::minutes(to_offset),
            count,
        });
    }

    Ok(PartitionPlan {
        steps_to_add,
        partitions,
    })
}

/// Minute offsets of partition `index`, each edge nudged inwards by 0 or 1 minute.
/// A nudge that would empty the interval falls back to the plain slot edges.
fn jittered_bounds<R>(duration: i64, index: i64, rng: &mut R) -> (i64, i64)
where
    R: Rng,
{
    let from_offset = duration * index + rng.random::<f64>().round() as i64;
    let to_offset = duration * (index + 1) - rng.random::<f64>().round() as i64;
    if from_offset < to_offset {
        (from_offset, to_offset)
    } else {
        (duration * index, duration * (index + 1))
    }
}
