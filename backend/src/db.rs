use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{BaselineProfile, DeviceRecord, PARKED_OWNER};
use crate::store::{DeviceStore, InsertOutcome};
use async_trait::async_trait;
use prometheus::Counter;
use protocol::HourlyValue;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

const MAX_ATTEMPTS: u32 = 5;
const UNIQUE_VIOLATION: &str = "23505";

const DEVICE_COLUMNS: &str = "device_id, name, owner, association_code, created_at, averages";

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Runs `op`, retrying connection-class failures with exponential backoff.
async fn with_retry<T, F, Fut>(name: &str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_counted(name, &DB_FAILURES_TOTAL, op).await
}

/// Every failed database attempt bumps `failures` exactly once.
async fn retry_counted<T, F, Fut>(name: &str, failures: &Counter, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(Error::Database(db_err))
                if attempts < MAX_ATTEMPTS && is_transient_error(&db_err) =>
            {
                let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {}ms: {}",
                    name, attempts, MAX_ATTEMPTS, wait_ms, db_err
                );
                failures.inc();
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }
            Err(e) => {
                if let Error::Database(_) = e {
                    failures.inc();
                }
                error!("{} failed after {} attempts: {}", name, attempts, e);
                return Err(e);
            }
        }
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            code == "08000" || // connection_exception
            code == "08003" || // connection_does_not_exist
            code == "08006" || // connection_failure
            code == "57P03" || // cannot_connect_now
            code == "53300" || // too_many_connections
            code == "40001" // serialization_failure
        }),
        _ => false,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION))
}

/// Escapes LIKE metacharacters so a code prefix only ever matches literally.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[derive(Debug, Clone)]
pub struct PgDeviceStore {
    pool: PgPool,
}

impl PgDeviceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_parked_once(&self, record: &DeviceRecord) -> Result<InsertOutcome> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO devices (device_id, name, owner, association_code, created_at, averages)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (device_id) DO NOTHING
            "#,
        )
        .bind(&record.device_id)
        .bind(&record.name)
        .bind(&record.owner)
        .bind(&record.association_code)
        .bind(record.created_at)
        .bind(&record.averages)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(result) if result.rows_affected() == 0 => Ok(InsertOutcome::DeviceExists),
            Ok(_) => Ok(InsertOutcome::Inserted),
            // The primary key conflict is absorbed above, so this is the code.
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::CodeTaken),
            Err(e) => Err(e.into()),
        }
    }

    async fn record_samples_once(
        &self,
        device_id: &str,
        samples: &[HourlyValue],
    ) -> Result<Option<BaselineProfile>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(Vec<f64>,)> =
            sqlx::query_as("SELECT averages FROM devices WHERE device_id = $1 FOR UPDATE")
                .bind(device_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((averages,)) = row else {
            return Ok(None);
        };

        let mut profile = BaselineProfile::from_slots(device_id, &averages)?;
        for sample in samples {
            profile.record(sample.hour, sample.wattage);
        }

        sqlx::query("UPDATE devices SET averages = $2 WHERE device_id = $1")
            .bind(device_id)
            .bind(profile.slots().to_vec())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(profile))
    }
}

#[async_trait]
impl DeviceStore for PgDeviceStore {
    async fn get(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let query = format!("SELECT {} FROM devices WHERE device_id = $1", DEVICE_COLUMNS);
        let (pool, query) = (&self.pool, query.as_str());
        with_retry("device lookup", move || async move {
            Ok(sqlx::query_as::<_, DeviceRecord>(query)
                .bind(device_id)
                .fetch_optional(pool)
                .await?)
        })
        .await
    }

    async fn insert_parked(&self, record: &DeviceRecord) -> Result<InsertOutcome> {
        with_retry("device registration", move || self.insert_parked_once(record)).await
    }

    async fn record_samples(
        &self,
        device_id: &str,
        samples: &[HourlyValue],
    ) -> Result<Option<BaselineProfile>> {
        with_retry("baseline update", move || {
            self.record_samples_once(device_id, samples)
        })
        .await
    }

    async fn find_parked_by_code_prefix(
        &self,
        prefix: &str,
        limit: i64,
    ) -> Result<Vec<DeviceRecord>> {
        let query = format!(
            "SELECT {} FROM devices WHERE owner = $1 AND association_code LIKE $2 ORDER BY device_id LIMIT $3",
            DEVICE_COLUMNS
        );
        let pattern = like_prefix(prefix);
        let (pool, query, pattern) = (&self.pool, query.as_str(), pattern.as_str());
        with_retry("code lookup", move || async move {
            Ok(sqlx::query_as::<_, DeviceRecord>(query)
                .bind(PARKED_OWNER)
                .bind(pattern)
                .bind(limit)
                .fetch_all(pool)
                .await?)
        })
        .await
    }

    async fn assign_owner(&self, device_id: &str, from: &str, to: &str) -> Result<bool> {
        let pool = &self.pool;
        with_retry("owner update", move || async move {
            let result =
                sqlx::query("UPDATE devices SET owner = $3 WHERE device_id = $1 AND owner = $2")
                    .bind(device_id)
                    .bind(from)
                    .bind(to)
                    .execute(pool)
                    .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn list_owned_by(&self, owner: &str) -> Result<Vec<DeviceRecord>> {
        let query = format!(
            "SELECT {} FROM devices WHERE owner = $1 ORDER BY created_at",
            DEVICE_COLUMNS
        );
        let (pool, query) = (&self.pool, query.as_str());
        with_retry("owner listing", move || async move {
            Ok(sqlx::query_as::<_, DeviceRecord>(query)
                .bind(owner)
                .fetch_all(pool)
                .await?)
        })
        .await
    }

    async fn list_associated(&self) -> Result<Vec<DeviceRecord>> {
        let query = format!(
            "SELECT {} FROM devices WHERE owner <> $1 ORDER BY device_id",
            DEVICE_COLUMNS
        );
        let (pool, query) = (&self.pool, query.as_str());
        with_retry("associated listing", move || async move {
            Ok(sqlx::query_as::<_, DeviceRecord>(query)
                .bind(PARKED_OWNER)
                .fetch_all(pool)
                .await?)
        })
        .await
    }
}
