pub mod application;
pub mod domain;
pub mod infrastructure;

use application::bootstrap::bootstrap_workspace;
use application::pacing::PacingService;
use application::scheduler::{Acknowledgement, OptionsProvider, PeriodicTrigger, TriggerPolicy};
use application::status::{status_report, StatusReport};
use chrono::{DateTime, Utc};
use domain::models::{Options, Partition, PACER_SOURCE};
use infrastructure::activity_store::{ActivityStore, SqliteActivityStore};
use infrastructure::config::{load_app_settings, load_options, save_options, AppSettings};
use infrastructure::error::InfraError;
use infrastructure::run_journal::RunJournal;
use infrastructure::run_state_repository::SqliteRunStateRepository;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub type SqlitePacingService = PacingService<SqliteRunStateRepository, SqliteActivityStore>;

pub struct AppState {
    config_dir: PathBuf,
    settings: AppSettings,
    service: Arc<SqlitePacingService>,
    journal: Arc<RunJournal>,
}

impl AppState {
    pub fn new(workspace_root: &Path) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(workspace_root)?;
        let settings = load_app_settings(&bootstrap.config_dir)?;
        let service = PacingService::new(
            Arc::new(SqliteRunStateRepository::new(&bootstrap.database_path)),
            Arc::new(SqliteActivityStore::new(&bootstrap.database_path)),
            settings.timezone,
        )
        .with_write_timeout(settings.run_timeout);

        Ok(Self {
            config_dir: bootstrap.config_dir,
            journal: Arc::new(RunJournal::new(&bootstrap.logs_dir)),
            settings,
            service: Arc::new(service),
        })
    }

    pub fn options(&self) -> Result<Options, InfraError> {
        load_options(&self.config_dir)
    }

    pub fn save_options(&self, options: &Options) -> Result<(), InfraError> {
        save_options(&self.config_dir, options)?;
        info!(
            daily_target = options.target,
            active_from = %options.active_from,
            active_to = %options.active_to,
            "saved options"
        );
        Ok(())
    }

    pub fn trigger(&self) -> PeriodicTrigger<SqliteRunStateRepository, SqliteActivityStore> {
        let config_dir = self.config_dir.clone();
        let options_provider: OptionsProvider = Arc::new(move || load_options(&config_dir));
        PeriodicTrigger::new(Arc::clone(&self.service), options_provider)
            .with_policy(TriggerPolicy {
                interval: self.settings.interval,
                flex: self.settings.flex,
                run_timeout: self.settings.run_timeout,
            })
            .with_journal(Arc::clone(&self.journal))
    }

    pub async fn run_once(&self) -> Acknowledgement {
        self.trigger().trigger_once().await
    }

    pub async fn status(&self) -> Result<StatusReport, InfraError> {
        status_report(&*self.service, &self.options()?).await
    }

    pub async fn record(
        &self,
        source: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        count: u64,
    ) -> Result<(), InfraError> {
        if source.trim() == PACER_SOURCE {
            return Err(InfraError::InvalidConfig(format!(
                "source '{PACER_SOURCE}' is reserved for paced records"
            )));
        }
        self.service
            .activity_store()
            .insert_records(source, &[Partition { from, to, count }])
            .await?;
        info!(source, %from, %to, count, "recorded activity");
        Ok(())
    }
}
