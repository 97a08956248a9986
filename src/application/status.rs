use crate::application::pacing::PacingService;
use crate::domain::models::{Options, SourceTotal};
use crate::infrastructure::activity_store::ActivityStore;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::run_state_repository::RunStateRepository;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DayPhase {
    BeforeWindow,
    Active,
    AfterWindow,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub date: NaiveDate,
    pub timezone: String,
    pub phase: DayPhase,
    pub target: u64,
    pub recorded_total: u64,
    pub remaining: u64,
    pub progress: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<DateTime<Utc>>,
    pub last_added_count: u64,
    pub sources: Vec<SourceTotal>,
}

pub async fn status_report<S, A>(
    service: &PacingService<S, A>,
    options: &Options,
) -> Result<StatusReport, InfraError>
where
    S: RunStateRepository,
    A: ActivityStore,
{
    let now = service.now();
    let window = service.window(options)?;
    let run_state = service.run_state_repository().load()?;
    let sources = service
        .activity_store()
        .totals_by_source(window.day_start, now)
        .await?;
    let recorded_total: u64 = sources.iter().map(|source| source.count).sum();

    let phase = if now < window.start {
        DayPhase::BeforeWindow
    } else if now >= window.end {
        DayPhase::AfterWindow
    } else {
        DayPhase::Active
    };
    let progress = if options.target == 0 {
        1.0
    } else {
        (recorded_total as f64 / options.target as f64).min(1.0)
    };

    Ok(StatusReport {
        date: now.with_timezone(&service.timezone()).date_naive(),
        timezone: service.timezone().name().to_string(),
        phase,
        target: options.target,
        recorded_total,
        remaining: options.target.saturating_sub(recorded_total),
        progress,
        window_start: window.start,
        window_end: window.end,
        last_execution: run_state.has_run().then_some(run_state.last_execution),
        last_added_count: run_state.last_added_count,
        sources,
    })
}
