use crate::domain::models::{Partition, SourceTotal, PACER_SOURCE};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::format_timestamp;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Activity records backend. Totals cover records starting in `[from, to)`.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn read_total(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<u64, InfraError>;

    async fn totals_by_source(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SourceTotal>, InfraError>;

    async fn insert_records(&self, source: &str, records: &[Partition]) -> Result<(), InfraError>;

    async fn remove_records(&self, source: &str, records: &[Partition]) -> Result<(), InfraError>;

    async fn insert(&self, partitions: &[Partition]) -> Result<(), InfraError> {
        self.insert_records(PACER_SOURCE, partitions).await
    }
}

fn validate_batch(source: &str, records: &[Partition]) -> Result<(), InfraError> {
    if source.trim().is_empty() {
        return Err(InfraError::SinkRejected("source must not be empty".to_string()));
    }
    for record in records {
        record.validate().map_err(InfraError::SinkRejected)?;
    }

    let mut sorted: Vec<&Partition> = records.iter().collect();
    sorted.sort_by_key(|record| record.from);
    if sorted.windows(2).any(|pair| pair[0].to > pair[1].from) {
        return Err(InfraError::SinkRejected(
            "records in one batch must not overlap".to_string(),
        ));
    }
    Ok(())
}

fn to_sql_count(count: u64) -> Result<i64, InfraError> {
    i64::try_from(count)
        .map_err(|_| InfraError::SinkRejected(format!("count {count} does not fit in SQLite")))
}

#[derive(Debug, Clone)]
pub struct SqliteActivityStore {
    db_path: PathBuf,
}

impl SqliteActivityStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        Connection::open(&self.db_path)
            .map_err(|error| InfraError::SinkUnavailable(format!("cannot open activity store: {error}")))
    }
}

#[async_trait]
impl ActivityStore for SqliteActivityStore {
    async fn read_total(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<u64, InfraError> {
        let connection = self.connect()?;
        let total: i64 = connection.query_row(
            "SELECT COALESCE(SUM(count), 0) FROM activity_records
             WHERE start_at >= ?1 AND start_at < ?2",
            params![format_timestamp(from), format_timestamp(to)],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    async fn totals_by_source(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SourceTotal>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT source, COALESCE(SUM(count), 0) FROM activity_records
             WHERE start_at >= ?1 AND start_at < ?2
             GROUP BY source
             ORDER BY source",
        )?;
        let rows = statement.query_map(params![format_timestamp(from), format_timestamp(to)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut totals = Vec::new();
        for row in rows {
            let (source, count) = row?;
            totals.push(SourceTotal {
                source,
                count: u64::try_from(count).unwrap_or(0),
            });
        }
        Ok(totals)
    }

    async fn insert_records(&self, source: &str, records: &[Partition]) -> Result<(), InfraError> {
        validate_batch(source, records)?;
        if records.is_empty() {
            return Ok(());
        }

        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        let created_at = format_timestamp(Utc::now());
        for record in records {
            let from = format_timestamp(record.from);
            let to = format_timestamp(record.to);
            let overlapping: i64 = transaction.query_row(
                "SELECT COUNT(*) FROM activity_records
                 WHERE source = ?1 AND start_at < ?3 AND end_at > ?2",
                params![source, from, to],
                |row| row.get(0),
            )?;
            if overlapping > 0 {
                return Err(InfraError::SinkRejected(format!(
                    "record {from}..{to} overlaps an existing {source} record"
                )));
            }
            transaction.execute(
                "INSERT INTO activity_records (source, start_at, end_at, count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![source, from, to, to_sql_count(record.count)?, created_at],
            )?;
        }
        transaction.commit()?;
        Ok(())
    }

    async fn remove_records(&self, source: &str, records: &[Partition]) -> Result<(), InfraError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        for record in records {
            transaction.execute(
                "DELETE FROM activity_records
                 WHERE source = ?1 AND start_at = ?2 AND end_at = ?3 AND count = ?4",
                params![
                    source,
                    format_timestamp(record.from),
                    format_timestamp(record.to),
                    to_sql_count(record.count)?
                ],
            )?;
        }
        transaction.commit()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub source: String,
    pub record: Partition,
}

#[derive(Debug, Default)]
pub struct InMemoryActivityStore {
    records: Mutex<Vec<StoredRecord>>,
}

impl InMemoryActivityStore {
    pub fn records(&self) -> Result<Vec<StoredRecord>, InfraError> {
        let records = self
            .records
            .lock()
            .map_err(|error| InfraError::SinkUnavailable(format!("activity store lock poisoned: {error}")))?;
        Ok(records.clone())
    }

    fn in_range(record: &Partition, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        record.from >= from && record.from < to
    }
}

#[async_trait]
impl ActivityStore for InMemoryActivityStore {
    async fn read_total(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<u64, InfraError> {
        Ok(self
            .records()?
            .iter()
            .filter(|stored| Self::in_range(&stored.record, from, to))
            .map(|stored| stored.record.count)
            .sum())
    }

    async fn totals_by_source(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SourceTotal>, InfraError> {
        let mut totals = BTreeMap::<String, u64>::new();
        for stored in self.records()? {
            if Self::in_range(&stored.record, from, to) {
                *totals.entry(stored.source).or_default() += stored.record.count;
            }
        }
        Ok(totals
            .into_iter()
            .map(|(source, count)| SourceTotal { source, count })
            .collect())
    }

    async fn insert_records(&self, source: &str, records: &[Partition]) -> Result<(), InfraError> {
        validate_batch(source, records)?;
        let mut stored = self
            .records
            .lock()
            .map_err(|error| InfraError::SinkUnavailable(format!("activity store lock poisoned: {error}")))?;

        let conflict = records.iter().any(|record| {
            stored
                .iter()
                .any(|existing| existing.source == source && existing.record.overlaps(record.from, record.to))
        });
        if conflict {
            return Err(InfraError::SinkRejected(format!(
                "records overlap existing {source} records"
            )));
        }

        stored.extend(records.iter().map(|record| StoredRecord {
            source: source.to_string(),
            record: record.clone(),
        }));
        Ok(())
    }

    async fn remove_records(&self, source: &str, records: &[Partition]) -> Result<(), InfraError> {
        let mut stored = self
            .records
            .lock()
            .map_err(|error| InfraError::SinkUnavailable(format!("activity store lock poisoned: {error}")))?;
        stored.retain(|existing| !(existing.source == source && records.contains(&existing.record)));
        Ok(())
    }
}
