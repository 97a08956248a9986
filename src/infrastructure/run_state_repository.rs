use crate::domain::models::RunState;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::{format_timestamp, parse_timestamp};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait RunStateRepository: Send + Sync {
    fn load(&self) -> Result<RunState, InfraError>;

    /// Replaces the stored state with `next` only if its `last_execution` still equals
    /// `expected_last_execution`. Returns `false` when another run got there first.
    fn commit(&self, expected_last_execution: DateTime<Utc>, next: &RunState) -> Result<bool, InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteRunStateRepository {
    db_path: PathBuf,
}

impl SqliteRunStateRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        Connection::open(&self.db_path).map_err(InfraError::from)
    }

    fn read(connection: &Connection) -> Result<RunState, InfraError> {
        let row: Option<(String, i64)> = connection
            .query_row(
                "SELECT last_execution, last_added_count FROM run_state WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((last_execution_raw, last_added_count)) = row else {
            return Ok(RunState::default());
        };

        Ok(RunState {
            last_execution: parse_timestamp(&last_execution_raw, "run_state.last_execution")?,
            last_added_count: u64::try_from(last_added_count).map_err(|_| {
                InfraError::InvalidConfig(format!(
                    "invalid run_state.last_added_count {last_added_count}"
                ))
            })?,
        })
    }
}

impl RunStateRepository for SqliteRunStateRepository {
    fn load(&self) -> Result<RunState, InfraError> {
        let connection = self.connect()?;
        Self::read(&connection)
    }

    fn commit(&self, expected_last_execution: DateTime<Utc>, next: &RunState) -> Result<bool, InfraError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = Self::read(&transaction)?;
        if current.last_execution != expected_last_execution {
            return Ok(false);
        }

        let added = i64::try_from(next.last_added_count).map_err(|_| {
            InfraError::InvalidConfig(format!(
                "last_added_count {} does not fit in SQLite",
                next.last_added_count
            ))
        })?;
        transaction.execute(
            "INSERT INTO run_state (id, last_execution, last_added_count)
             VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
               last_execution = excluded.last_execution,
               last_added_count = excluded.last_added_count",
            params![format_timestamp(next.last_execution), added],
        )?;
        transaction.commit()?;
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRunStateRepository {
    state: Mutex<Option<RunState>>,
}

impl InMemoryRunStateRepository {
    pub fn with_state(state: RunState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
        }
    }
}

impl RunStateRepository for InMemoryRunStateRepository {
    fn load(&self) -> Result<RunState, InfraError> {
        let state = self
            .state
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("run state lock poisoned: {error}")))?;
        Ok(state.unwrap_or_default())
    }

    fn commit(&self, expected_last_execution: DateTime<Utc>, next: &RunState) -> Result<bool, InfraError> {
        let mut state = self
            .state
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("run state lock poisoned: {error}")))?;
        if state.unwrap_or_default().last_execution != expected_last_execution {
            return Ok(false);
        }
        *state = Some(*next);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::initialize_database;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn sqlite_repository(dir: &tempfile::TempDir) -> SqliteRunStateRepository {
        let path = dir.path().join("pacer.sqlite");
        initialize_database(&path).expect("init database");
        SqliteRunStateRepository::new(path)
    }

    fn exercise_commit_semantics(repository: &dyn RunStateRepository) {
        assert_eq!(repository.load().expect("load default"), RunState::default());

        let first = RunState {
            last_execution: fixed_time("2026-02-16T07:00:00Z"),
            last_added_count: 120,
        };
        assert!(repository
            .commit(RunState::default().last_execution, &first)
            .expect("first commit"));
        assert_eq!(repository.load().expect("load first"), first);

        let second = RunState {
            last_execution: fixed_time("2026-02-16T07:15:00Z"),
            last_added_count: 140,
        };
        let stale = repository
            .commit(RunState::default().last_execution, &second)
            .expect("stale commit");
        assert!(!stale);
        assert_eq!(repository.load().expect("load after stale"), first);

        assert!(repository
            .commit(first.last_execution, &second)
            .expect("second commit"));
        assert_eq!(repository.load().expect("load second"), second);
    }

    #[test]
    fn in_memory_repository_compare_and_swap() {
        exercise_commit_semantics(&InMemoryRunStateRepository::default());
    }

    #[test]
    fn sqlite_repository_compare_and_swap() {
        let dir = tempfile::tempdir().expect("temp dir");
        exercise_commit_semantics(&sqlite_repository(&dir));
    }

    #[test]
    fn sqlite_repository_survives_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let state = RunState {
            last_execution: fixed_time("2026-02-16T09:30:00Z"),
            last_added_count: 77,
        };
        sqlite_repository(&dir)
            .commit(RunState::default().last_execution, &state)
            .expect("commit");

        let reopened = SqliteRunStateRepository::new(dir.path().join("pacer.sqlite"));
        assert_eq!(reopened.load().expect("load"), state);
    }
}
