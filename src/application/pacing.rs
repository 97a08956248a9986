use crate::domain::deficit::{evaluate, window_outcome};
use crate::domain::error::PacingError;
use crate::domain::models::{Options, Outcome, Partition, RunState, Window, PACER_SOURCE};
use crate::domain::partition::generate;
use crate::domain::window::resolve;
use crate::infrastructure::activity_store::ActivityStore;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::run_state_repository::RunStateRepository;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunReport {
    TooEarly {
        window_start: DateTime<Utc>,
    },
    TooLate {
        window_end: DateTime<Utc>,
    },
    TargetMet {
        recorded_total: u64,
        target: u64,
    },
    NothingDue {
        needed_steps: u64,
        add_from: DateTime<Utc>,
    },
    Injected {
        needed_steps: u64,
        steps_added: u64,
        partitions: usize,
        add_from: DateTime<Utc>,
        executed_at: DateTime<Utc>,
    },
}

impl RunReport {
    pub fn steps_added(&self) -> u64 {
        match self {
            Self::Injected { steps_added, .. } => *steps_added,
            _ => 0,
        }
    }
}

pub struct PacingService<S, A>
where
    S: RunStateRepository,
    A: ActivityStore,
{
    run_state_repository: Arc<S>,
    activity_store: Arc<A>,
    timezone: Tz,
    write_timeout: Duration,
    now_provider: NowProvider,
    rng: Mutex<StdRng>,
}

impl<S, A> PacingService<S, A>
where
    S: RunStateRepository,
    A: ActivityStore,
{
    pub fn new(run_state_repository: Arc<S>, activity_store: Arc<A>, timezone: Tz) -> Self {
        Self {
            run_state_repository,
            activity_store,
            timezone,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            now_provider: Arc::new(Utc::now),
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.now_provider)()
    }

    pub fn run_state_repository(&self) -> &S {
        &self.run_state_repository
    }

    pub fn activity_store(&self) -> &A {
        &self.activity_store
    }

    pub fn window(&self, options: &Options) -> Result<Window, InfraError> {
        Ok(resolve(options, self.now(), self.timezone)?)
    }

    pub async fn run_once(&self, options: &Options) -> Result<RunReport, InfraError> {
        let mut rng = self.rng.lock().await;
        let now = self.now();
        let window = resolve(options, now, self.timezone)?;

        match window_outcome(&window, now) {
            Some(Outcome::TooEarly) => {
                info!(window_start = %window.start, "it's still too early to add steps");
                return Ok(RunReport::TooEarly {
                    window_start: window.start,
                });
            }
            Some(_) => {
                info!(window_end = %window.end, "it's already too late to add steps");
                return Ok(RunReport::TooLate {
                    window_end: window.end,
                });
            }
            None => {}
        }

        let run_state = self.run_state_repository.load()?;
        let recorded_total = self
            .activity_store
            .read_total(window.day_start, now)
            .await
            .map_err(into_sink_error)?;

        let deficit = match evaluate(&window, options, &run_state, recorded_total, now) {
            Outcome::Proceed(deficit) => deficit,
            Outcome::TargetMet => {
                info!(recorded_total, daily_target = options.target, "all steps have been added for today");
                return Ok(RunReport::TargetMet {
                    recorded_total,
                    target: options.target,
                });
            }
            outcome => {
                return Err(PacingError::InvariantViolation(format!(
                    "window outcome {} after window checks",
                    outcome.as_str()
                ))
                .into());
            }
        };
        info!(
            needed_steps = deficit.needed_steps,
            add_from = %deficit.add_from,
            "still needs steps"
        );

        let plan = generate(&deficit, &mut *rng).inspect_err(|error| {
            error!(%error, "refusing to generate partitions");
        })?;
        if plan.is_empty() {
            info!(
                minutes_since_add_from = deficit.minutes_since_add_from,
                "nothing due for the elapsed time yet"
            );
            return Ok(RunReport::NothingDue {
                needed_steps: deficit.needed_steps,
                add_from: deficit.add_from,
            });
        }
        info!(
            steps = plan.steps_to_add,
            partitions = plan.partitions.len(),
            "adding steps"
        );

        self.write_partitions(&plan.partitions).await?;
        if let Err(error) = self.commit(&run_state, now, plan.steps_to_add) {
            self.discard_partitions(&plan.partitions).await;
            return Err(error);
        }
        info!(steps = plan.steps_to_add, executed_at = %now, "inserted records");

        Ok(RunReport::Injected {
            needed_steps: deficit.needed_steps,
            steps_added: plan.steps_to_add,
            partitions: plan.partitions.len(),
            add_from: deficit.add_from,
            executed_at: now,
        })
    }

    async fn write_partitions(&self, partitions: &[Partition]) -> Result<(), InfraError> {
        match tokio::time::timeout(self.write_timeout, self.activity_store.insert(partitions)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => {
                warn!(%error, "activity store refused the partitions; run state left unchanged");
                Err(into_sink_error(error))
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.write_timeout.as_millis() as u64,
                    "activity store write timed out; run state left unchanged"
                );
                Err(InfraError::SinkTimeout(self.write_timeout.as_millis()))
            }
        }
    }

    // Keeps the store free of records whose run never advanced the run state.
    async fn discard_partitions(&self, partitions: &[Partition]) {
        let removal = self.activity_store.remove_records(PACER_SOURCE, partitions);
        match tokio::time::timeout(self.write_timeout, removal).await {
            Ok(Ok(())) => {
                warn!(partitions = partitions.len(), "removed partitions of the uncommitted run");
            }
            Ok(Err(error)) => {
                error!(%error, "failed to remove partitions of the uncommitted run");
            }
            Err(_) => {
                error!(
                    timeout_ms = self.write_timeout.as_millis() as u64,
                    "timed out removing partitions of the uncommitted run"
                );
            }
        }
    }

    fn commit(&self, previous: &RunState, now: DateTime<Utc>, steps_added: u64) -> Result<(), InfraError> {
        let next = RunState {
            last_execution: now,
            last_added_count: steps_added,
        };
        if !self.run_state_repository.commit(previous.last_execution, &next)? {
            error!(
                expected = %previous.last_execution,
                "run state advanced by another run; not committing"
            );
            return Err(InfraError::StaleRunState(previous.last_execution.to_rfc3339()));
        }
        Ok(())
    }
}

fn into_sink_error(error: InfraError) -> InfraError {
    match error {
        InfraError::SinkUnavailable(_) | InfraError::SinkRejected(_) | InfraError::SinkTimeout(_) => error,
        other => InfraError::SinkUnavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{MinuteOfDay, SourceTotal};
    use crate::infrastructure::activity_store::InMemoryActivityStore;
    use crate::infrastructure::run_state_repository::InMemoryRunStateRepository;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn fixed_now(value: &str) -> NowProvider {
        let now = fixed_time(value);
        Arc::new(move || now)
    }

    fn organic(from: &str, to: &str, count: u64) -> Partition {
        Partition {
            from: fixed_time(from),
            to: fixed_time(to),
            count,
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum FakeWrite {
        Fail,
        Hang,
    }

    #[derive(Debug)]
    struct FakeActivityStore {
        total: u64,
        write: FakeWrite,
        insert_calls: AtomicUsize,
    }

    impl FakeActivityStore {
        fn new(total: u64, write: FakeWrite) -> Self {
            Self {
                total,
                write,
                insert_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ActivityStore for FakeActivityStore {
        async fn read_total(&self, _from: DateTime<Utc>, _to: DateTime<Utc>) -> Result<u64, InfraError> {
            Ok(self.total)
        }

        async fn totals_by_source(
            &self,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> Result<Vec<SourceTotal>, InfraError> {
            Ok(Vec::new())
        }

        async fn insert_records(&self, _source: &str, _records: &[Partition]) -> Result<(), InfraError> {
            self.insert_calls.fetch_add(1, Ordering::SeqCst);
            match self.write {
                FakeWrite::Fail => Err(InfraError::SinkUnavailable("backend offline".to_string())),
                FakeWrite::Hang => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        }

        async fn remove_records(&self, _source: &str, _records: &[Partition]) -> Result<(), InfraError> {
            Ok(())
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum CommitFault {
        Error,
        Stale,
    }

    #[derive(Debug)]
    struct FlakyRunStateRepository {
        inner: InMemoryRunStateRepository,
        fault: CommitFault,
        failures_left: AtomicUsize,
    }

    impl FlakyRunStateRepository {
        fn failing_once(state: RunState, fault: CommitFault) -> Self {
            Self {
                inner: InMemoryRunStateRepository::with_state(state),
                fault,
                failures_left: AtomicUsize::new(1),
            }
        }
    }

    impl RunStateRepository for FlakyRunStateRepository {
        fn load(&self) -> Result<RunState, InfraError> {
            self.inner.load()
        }

        fn commit(&self, expected_last_execution: DateTime<Utc>, next: &RunState) -> Result<bool, InfraError> {
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return match self.fault {
                    CommitFault::Error => Err(InfraError::Sqlite(rusqlite::Error::QueryReturnedNoRows)),
                    CommitFault::Stale => Ok(false),
                };
            }
            self.inner.commit(expected_last_execution, next)
        }
    }

    fn service_at(
        now: &str,
        run_state: RunState,
    ) -> PacingService<InMemoryRunStateRepository, InMemoryActivityStore> {
        PacingService::new(
            Arc::new(InMemoryRunStateRepository::with_state(run_state)),
            Arc::new(InMemoryActivityStore::default()),
            Tz::UTC,
        )
        .with_now_provider(fixed_now(now))
        .with_rng_seed(7)
    }

    fn run_state_at(value: &str) -> RunState {
        RunState {
            last_execution: fixed_time(value),
            last_added_count: 250,
        }
    }

    #[tokio::test]
    async fn run_once_injects_documented_scenario() {
        let previous = run_state_at("2026-02-16T07:00:00Z");
        let service = service_at("2026-02-16T07:30:00Z", previous);
        service
            .activity_store()
            .insert_records(
                "watch",
                &[organic("2026-02-16T06:00:00Z", "2026-02-16T06:55:00Z", 2_000)],
            )
            .await
            .expect("seed organic steps");

        let report = service.run_once(&Options::default()).await.expect("run");
        let RunReport::Injected {
            needed_steps,
            steps_added,
            partitions,
            add_from,
            executed_at,
        } = report
        else {
            panic!("expected injection, got {report:?}");
        };
        assert_eq!(needed_steps, 8_000);
        assert!((267..=320).contains(&steps_added));
        assert_eq!(partitions, 6);
        assert_eq!(add_from, fixed_time("2026-02-16T07:00:00Z"));
        assert_eq!(executed_at, fixed_time("2026-02-16T07:30:00Z"));

        let inserted: u64 = service
            .activity_store()
            .records()
            .expect("records")
            .iter()
            .filter(|stored| stored.source == "pacer")
            .map(|stored| stored.record.count)
            .sum();
        assert_eq!(inserted, steps_added);

        let committed = service.run_state_repository().load().expect("load");
        assert_eq!(committed.last_execution, fixed_time("2026-02-16T07:30:00Z"));
        assert_eq!(committed.last_added_count, steps_added);
    }

    #[tokio::test]
    async fn run_once_short_circuits_when_target_met() {
        let previous = run_state_at("2026-02-16T07:00:00Z");
        let service = service_at("2026-02-16T12:00:00Z", previous);
        service
            .activity_store()
            .insert_records(
                "watch",
                &[organic("2026-02-16T06:00:00Z", "2026-02-16T11:00:00Z", 10_000)],
            )
            .await
            .expect("seed organic steps");

        let report = service.run_once(&Options::default()).await.expect("run");
        assert_eq!(
            report,
            RunReport::TargetMet {
                recorded_total: 10_000,
                target: 10_000
            }
        );
        assert_eq!(service.activity_store().records().expect("records").len(), 1);
        assert_eq!(service.run_state_repository().load().expect("load"), previous);
    }

    #[tokio::test]
    async fn run_once_short_circuits_outside_window() {
        let early = service_at("2026-02-16T05:59:00Z", RunState::default());
        assert_eq!(
            early.run_once(&Options::default()).await.expect("run"),
            RunReport::TooEarly {
                window_start: fixed_time("2026-02-16T06:00:00Z")
            }
        );

        let late = service_at("2026-02-16T22:00:00Z", RunState::default());
        assert_eq!(
            late.run_once(&Options::default()).await.expect("run"),
            RunReport::TooLate {
                window_end: fixed_time("2026-02-16T22:00:00Z")
            }
        );

        assert!(early.activity_store().records().expect("records").is_empty());
        assert_eq!(early.run_state_repository().load().expect("load"), RunState::default());
    }

    #[tokio::test]
    async fn run_once_at_window_start_has_nothing_due() {
        let service = service_at("2026-02-16T06:00:00Z", RunState::default());
        let report = service.run_once(&Options::default()).await.expect("run");
        assert!(matches!(report, RunReport::NothingDue { needed_steps: 10_000, .. }));
        assert_eq!(service.run_state_repository().load().expect("load"), RunState::default());
    }

    #[tokio::test]
    async fn run_once_surfaces_configuration_errors() {
        let service = service_at("2026-02-16T12:00:00Z", RunState::default());
        let options = Options {
            target: 10_000,
            active_from: MinuteOfDay::parse("20:00").expect("valid time"),
            active_to: MinuteOfDay::parse("08:00").expect("valid time"),
        };
        let result = service.run_once(&options).await;
        assert!(matches!(
            result,
            Err(InfraError::Pacing(PacingError::Configuration(_)))
        ));
    }

    #[tokio::test]
    async fn failed_write_leaves_run_state_untouched() {
        let previous = run_state_at("2026-02-16T07:00:00Z");
        let store = Arc::new(FakeActivityStore::new(2_000, FakeWrite::Fail));
        let repository = Arc::new(InMemoryRunStateRepository::with_state(previous));
        let service = PacingService::new(Arc::clone(&repository), Arc::clone(&store), Tz::UTC)
            .with_now_provider(fixed_now("2026-02-16T07:30:00Z"))
            .with_rng_seed(11);

        let result = service.run_once(&Options::default()).await;
        assert!(matches!(result, Err(InfraError::SinkUnavailable(_))));
        assert_eq!(store.insert_calls.load(Ordering::SeqCst), 1);
        assert_eq!(repository.load().expect("load"), previous);
    }

    #[tokio::test]
    async fn timed_out_write_leaves_run_state_untouched() {
        let previous = run_state_at("2026-02-16T07:00:00Z");
        let store = Arc::new(FakeActivityStore::new(2_000, FakeWrite::Hang));
        let repository = Arc::new(InMemoryRunStateRepository::with_state(previous));
        let service = PacingService::new(Arc::clone(&repository), store, Tz::UTC)
            .with_now_provider(fixed_now("2026-02-16T07:30:00Z"))
            .with_write_timeout(Duration::from_millis(20));

        let result = service.run_once(&Options::default()).await;
        assert!(matches!(result, Err(InfraError::SinkTimeout(20))));
        assert_eq!(repository.load().expect("load"), previous);
    }

    #[tokio::test]
    async fn failed_commit_discards_partitions_and_pacing_resumes() {
        let previous = run_state_at("2026-02-16T07:00:00Z");
        let repository = Arc::new(FlakyRunStateRepository::failing_once(previous, CommitFault::Error));
        let store = Arc::new(InMemoryActivityStore::default());
        let service_at = |now: &str| {
            PacingService::new(Arc::clone(&repository), Arc::clone(&store), Tz::UTC)
                .with_now_provider(fixed_now(now))
                .with_rng_seed(3)
        };

        let failed = service_at("2026-02-16T07:30:00Z")
            .run_once(&Options::default())
            .await;
        assert!(matches!(failed, Err(InfraError::Sqlite(_))));
        assert!(store.records().expect("records").is_empty());
        assert_eq!(repository.load().expect("load"), previous);

        for time in ["2026-02-16T07:45:00Z", "2026-02-16T08:00:00Z", "2026-02-16T12:00:00Z"] {
            let report = service_at(time)
                .run_once(&Options::default())
                .await
                .expect("run after failed commit");
            assert!(matches!(report, RunReport::Injected { .. }), "{time}: {report:?}");
            assert_eq!(repository.load().expect("load").last_execution, fixed_time(time));
        }
    }

    #[tokio::test]
    async fn stale_commit_discards_partitions() {
        let previous = run_state_at("2026-02-16T07:00:00Z");
        let repository = Arc::new(FlakyRunStateRepository::failing_once(previous, CommitFault::Stale));
        let store = Arc::new(InMemoryActivityStore::default());
        let service = PacingService::new(Arc::clone(&repository), Arc::clone(&store), Tz::UTC)
            .with_now_provider(fixed_now("2026-02-16T07:30:00Z"))
            .with_rng_seed(5);

        let result = service.run_once(&Options::default()).await;
        assert!(matches!(result, Err(InfraError::StaleRunState(_))));
        assert!(store.records().expect("records").is_empty());

        let retried = service.run_once(&Options::default()).await.expect("retry");
        assert!(matches!(retried, RunReport::Injected { .. }));
        assert_eq!(store.records().expect("records").len(), 6);
    }

    #[tokio::test]
    async fn repeated_runs_never_recover_paced_time() {
        let store = Arc::new(InMemoryActivityStore::default());
        let repository = Arc::new(InMemoryRunStateRepository::default());
        let times = [
            "2026-02-16T06:20:00Z",
            "2026-02-16T06:35:00Z",
            "2026-02-16T06:35:00Z",
            "2026-02-16T07:10:00Z",
        ];

        let mut previous_end = fixed_time("2026-02-16T06:00:00Z");
        for (index, time) in times.iter().enumerate() {
            let service = PacingService::new(Arc::clone(&repository), Arc::clone(&store), Tz::UTC)
                .with_now_provider(fixed_now(time))
                .with_rng_seed(index as u64);
            service.run_once(&Options::default()).await.expect("run");

            let mut records: Vec<Partition> = store
                .records()
                .expect("records")
                .into_iter()
                .map(|stored| stored.record)
                .collect();
            records.sort_by_key(|record| record.from);
            for pair in records.windows(2) {
                assert!(pair[0].to <= pair[1].from, "overlap after run {index}");
            }
            let latest_end = records.last().map(|record| record.to).unwrap_or(previous_end);
            assert!(latest_end <= fixed_time(time));
            previous_end = latest_end;
        }

        let state = repository.load().expect("load");
        assert_eq!(state.last_execution, fixed_time("2026-02-16T07:10:00Z"));
    }

    // Feature: pacer, Property 8: reaching the target leaves the run state untouched
    proptest! {
        #[test]
        fn property8_target_met_is_idempotent(offset_minutes in 0i64..960i64, surplus in 0u64..2_000u64) {
            let runtime = tokio::runtime::Runtime::new().expect("runtime");
            runtime.block_on(async move {
                let now = fixed_time("2026-02-16T06:00:00Z") + chrono::Duration::minutes(offset_minutes);
                let previous = run_state_at("2026-02-16T06:00:00Z");
                let repository = Arc::new(InMemoryRunStateRepository::with_state(previous));
                let store = Arc::new(FakeActivityStore::new(10_000 + surplus, FakeWrite::Fail));
                let service = PacingService::new(Arc::clone(&repository), Arc::clone(&store), Tz::UTC)
                    .with_now_provider(Arc::new(move || now));

                let report = service.run_once(&Options::default()).await.expect("run");
                assert!(matches!(report, RunReport::TargetMet { .. }));
                assert_eq!(store.insert_calls.load(Ordering::SeqCst), 0);
                assert_eq!(repository.load().expect("load"), previous);
            });
        }
    }
}
