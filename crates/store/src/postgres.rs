//! PostgreSQL counter store.
//!
//! - Counter updates are single `SET x = x + 1` statements, so concurrent
//!   increments serialize on the row lock and none are lost.
//! - A display touches the arm and the slot (and the banner's advisory total)
//!   in one transaction.
//! - Assignment changes run SERIALIZABLE and are retried on serialization
//!   failure up to `serialization_retries` extra times.
//! - Arm reads use a REPEATABLE READ, READ ONLY snapshot so the arm list and
//!   the slot total agree.
//!
//! Dropping a future mid-transaction drops the `sqlx::Transaction`, which
//! rolls back.

use crate::{CatalogStore, CounterStore};
use async_trait::async_trait;
use rotator_core::config::StorageConfig;
use rotator_core::types::{
    Arm, ArmSnapshot, Banner, BannerId, Slot, SlotId, SocialGroup, SocialGroupId,
};
use rotator_core::{RotatorError, RotatorResult};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, info, warn};

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

pub struct PostgresStore {
    pool: PgPool,
    serialization_retries: u32,
    acquire_timeout: Duration,
}

impl PostgresStore {
    pub async fn connect(config: &StorageConfig) -> RotatorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect(&config.dsn)
            .await
            .map_err(|e| {
                RotatorError::StorageUnavailable(format!("PostgreSQL connection failed: {e}"))
            })?;

        info!(max_connections = config.max_connections, "Connected to PostgreSQL");
        Ok(Self::from_pool(pool, config))
    }

    pub fn from_pool(pool: PgPool, config: &StorageConfig) -> Self {
        Self {
            pool,
            serialization_retries: config.serialization_retries,
            acquire_timeout: config.connect_timeout(),
        }
    }

    /// Create the rotator tables if they do not exist.
    pub async fn migrate(&self) -> RotatorResult<()> {
        let migration_sql = include_str!("../migrations/001_rotator_schema.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, "migrate", self.acquire_timeout))?;

        info!("Rotator schema migration complete");
        Ok(())
    }

    async fn begin_serializable(&self) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn try_add_assignment(&self, banner: BannerId, slot: SlotId) -> Result<u64, sqlx::Error> {
        let mut tx = self.begin_serializable().await?;

        sqlx::query("INSERT INTO banner_to_slot (banner_id, slot_id) VALUES ($1, $2)")
            .bind(banner.0)
            .bind(slot.0)
            .execute(&mut *tx)
            .await?;

        // Copy the social groups that exist right now; later groups are not back-filled.
        let created = sqlx::query(
            "INSERT INTO statistics (banner_id, slot_id, social_group_id) \
             SELECT $1, $2, social_group_id FROM social_group",
        )
        .bind(banner.0)
        .bind(slot.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(created)
    }

    async fn try_remove_assignment(
        &self,
        banner: BannerId,
        slot: SlotId,
    ) -> Result<Option<u64>, sqlx::Error> {
        let mut tx = self.begin_serializable().await?;

        let removed = sqlx::query("DELETE FROM statistics WHERE banner_id = $1 AND slot_id = $2")
            .bind(banner.0)
            .bind(slot.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let assignments =
            sqlx::query("DELETE FROM banner_to_slot WHERE banner_id = $1 AND slot_id = $2")
                .bind(banner.0)
                .bind(slot.0)
                .execute(&mut *tx)
                .await?
                .rows_affected();

        if assignments == 0 {
            // Nothing to delete; the dropped transaction rolls back.
            return Ok(None);
        }

        tx.commit().await?;
        Ok(Some(removed))
    }

    async fn try_record_display(
        &self,
        banner: BannerId,
        slot: SlotId,
        group: SocialGroupId,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let arms = sqlx::query(
            "UPDATE statistics SET display = display + 1 \
             WHERE banner_id = $1 AND slot_id = $2 AND social_group_id = $3",
        )
        .bind(banner.0)
        .bind(slot.0)
        .bind(group.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if arms == 0 {
            return Ok(false);
        }

        let slots =
            sqlx::query("UPDATE slot SET total_display = total_display + 1 WHERE slot_id = $1")
                .bind(slot.0)
                .execute(&mut *tx)
                .await?
                .rows_affected();

        if slots == 0 {
            return Ok(false);
        }

        sqlx::query("UPDATE banner SET total_display = total_display + 1 WHERE banner_id = $1")
            .bind(banner.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn try_get_arms(
        &self,
        slot: SlotId,
        group: SocialGroupId,
    ) -> Result<Option<ArmSnapshot>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let total: Option<i64> =
            sqlx::query_scalar("SELECT total_display FROM slot WHERE slot_id = $1")
                .bind(slot.0)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(total) = total else {
            return Ok(None);
        };

        let rows = sqlx::query(
            "SELECT banner_id, display, click FROM statistics \
             WHERE slot_id = $1 AND social_group_id = $2 \
             ORDER BY banner_id",
        )
        .bind(slot.0)
        .bind(group.0)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let arms = rows.iter().map(row_to_arm).collect::<Result<Vec<_>, _>>()?;
        Ok(Some(ArmSnapshot {
            arms,
            slot_total_display: counter(total),
        }))
    }
}

#[async_trait]
impl CounterStore for PostgresStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn get_arms(&self, slot: SlotId, group: SocialGroupId) -> RotatorResult<ArmSnapshot> {
        self.try_get_arms(slot, group)
            .await
            .map_err(|e| map_sqlx(e, "get_arms", self.acquire_timeout))?
            .ok_or_else(|| RotatorError::NotFound(format!("slot {slot}")))
    }

    async fn record_click(
        &self,
        banner: BannerId,
        slot: SlotId,
        group: SocialGroupId,
    ) -> RotatorResult<()> {
        let affected = sqlx::query(
            "UPDATE statistics SET click = click + 1 \
             WHERE banner_id = $1 AND slot_id = $2 AND social_group_id = $3",
        )
        .bind(banner.0)
        .bind(slot.0)
        .bind(group.0)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx(e, "record_click", self.acquire_timeout))?
        .rows_affected();

        if affected == 0 {
            return Err(RotatorError::NotFound(format!(
                "no statistics for banner {banner} in slot {slot} for social group {group}"
            )));
        }
        Ok(())
    }

    async fn record_display(
        &self,
        banner: BannerId,
        slot: SlotId,
        group: SocialGroupId,
    ) -> RotatorResult<()> {
        let applied = self
            .try_record_display(banner, slot, group)
            .await
            .map_err(|e| map_sqlx(e, "record_display", self.acquire_timeout))?;

        if !applied {
            return Err(RotatorError::NotFound(format!(
                "no statistics for banner {banner} in slot {slot} for social group {group}"
            )));
        }
        Ok(())
    }

    async fn add_assignment(&self, banner: BannerId, slot: SlotId) -> RotatorResult<u64> {
        let retries = self.serialization_retries;
        let created = with_serialization_retry(retries, "add_assignment", move || {
            self.try_add_assignment(banner, slot)
        })
        .await
        .map_err(|e| match map_sqlx(e, "add_assignment", self.acquire_timeout) {
            RotatorError::Conflict(_) => RotatorError::Conflict(format!(
                "banner {banner} is already assigned to slot {slot}"
            )),
            RotatorError::NotFound(_) => {
                RotatorError::NotFound(format!("banner {banner} or slot {slot}"))
            }
            other => other,
        })?;

        debug!(banner = %banner, slot = %slot, arms = created, "Assignment stored");
        Ok(created)
    }

    async fn remove_assignment(&self, banner: BannerId, slot: SlotId) -> RotatorResult<u64> {
        let retries = self.serialization_retries;
        let removed = with_serialization_retry(retries, "remove_assignment", move || {
            self.try_remove_assignment(banner, slot)
        })
        .await
        .map_err(|e| map_sqlx(e, "remove_assignment", self.acquire_timeout))?
        .ok_or_else(|| {
            RotatorError::NotFound(format!("banner {banner} is not assigned to slot {slot}"))
        })?;

        debug!(banner = %banner, slot = %slot, arms = removed, "Assignment deleted");
        Ok(removed)
    }
}

#[async_trait]
impl CatalogStore for PostgresStore {
    async fn create_banner(&self, description: &str) -> RotatorResult<Banner> {
        let row = sqlx::query(
            "INSERT INTO banner (banner_description) VALUES ($1) \
             RETURNING banner_id, banner_description, total_display",
        )
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx(e, "create_banner", self.acquire_timeout))?;
        row_to_banner(&row).map_err(|e| map_sqlx(e, "create_banner", self.acquire_timeout))
    }

    async fn create_slot(&self, description: &str) -> RotatorResult<Slot> {
        let row = sqlx::query(
            "INSERT INTO slot (slot_description) VALUES ($1) \
             RETURNING slot_id, slot_description, total_display",
        )
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx(e, "create_slot", self.acquire_timeout))?;
        row_to_slot(&row).map_err(|e| map_sqlx(e, "create_slot", self.acquire_timeout))
    }

    async fn create_social_group(&self, description: &str) -> RotatorResult<SocialGroup> {
        let row = sqlx::query(
            "INSERT INTO social_group (social_description) VALUES ($1) \
             RETURNING social_group_id, social_description",
        )
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx(e, "create_social_group", self.acquire_timeout))?;
        row_to_social_group(&row)
            .map_err(|e| map_sqlx(e, "create_social_group", self.acquire_timeout))
    }

    async fn banner(&self, id: BannerId) -> RotatorResult<Option<Banner>> {
        let row = sqlx::query(
            "SELECT banner_id, banner_description, total_display FROM banner WHERE banner_id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx(e, "banner", self.acquire_timeout))?;
        row.as_ref()
            .map(row_to_banner)
            .transpose()
            .map_err(|e| map_sqlx(e, "banner", self.acquire_timeout))
    }

    async fn slot(&self, id: SlotId) -> RotatorResult<Option<Slot>> {
        let row = sqlx::query(
            "SELECT slot_id, slot_description, total_display FROM slot WHERE slot_id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx(e, "slot", self.acquire_timeout))?;
        row.as_ref()
            .map(row_to_slot)
            .transpose()
            .map_err(|e| map_sqlx(e, "slot", self.acquire_timeout))
    }

    async fn social_group(&self, id: SocialGroupId) -> RotatorResult<Option<SocialGroup>> {
        let row = sqlx::query(
            "SELECT social_group_id, social_description FROM social_group \
             WHERE social_group_id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx(e, "social_group", self.acquire_timeout))?;
        row.as_ref()
            .map(row_to_social_group)
            .transpose()
            .map_err(|e| map_sqlx(e, "social_group", self.acquire_timeout))
    }
}

// Counters are CHECK-constrained non-negative.
fn counter(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn row_to_arm(row: &PgRow) -> Result<Arm, sqlx::Error> {
    Ok(Arm::new(
        BannerId(row.try_get("banner_id")?),
        counter(row.try_get("display")?),
        counter(row.try_get("click")?),
    ))
}

fn row_to_banner(row: &PgRow) -> Result<Banner, sqlx::Error> {
    Ok(Banner {
        id: BannerId(row.try_get("banner_id")?),
        description: row.try_get("banner_description")?,
        total_display: counter(row.try_get("total_display")?),
    })
}

fn row_to_slot(row: &PgRow) -> Result<Slot, sqlx::Error> {
    Ok(Slot {
        id: SlotId(row.try_get("slot_id")?),
        description: row.try_get("slot_description")?,
        total_display: counter(row.try_get("total_display")?),
    })
}

fn row_to_social_group(row: &PgRow) -> Result<SocialGroup, sqlx::Error> {
    Ok(SocialGroup {
        id: SocialGroupId(row.try_get("social_group_id")?),
        description: row.try_get("social_description")?,
    })
}

/// Run a SERIALIZABLE unit of work, retrying up to `retries` extra times when
/// the database aborts it for a serialization conflict.
async fn with_serialization_retry<T, F, Fut>(
    retries: u32,
    operation: &'static str,
    mut attempt_fn: F,
) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0u32;
    loop {
        match attempt_fn().await {
            Err(e) if is_serialization_failure(&e) && attempt < retries => {
                attempt += 1;
                metrics::counter!("store.serialization_retries").increment(1);
                warn!(operation, attempt, error = %e, "Serialization failure, retrying");
                tokio::time::sleep(Duration::from_millis(5 * u64::from(attempt))).await;
            }
            other => return other,
        }
    }
}

fn is_serialization_failure(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED)
        ),
        _ => false,
    }
}

/// Translate a driver error into a rotator error kind.
/// `acquire_timeout` is reported as the elapsed time when the pool times out.
pub(crate) fn map_sqlx(
    err: sqlx::Error,
    operation: &str,
    acquire_timeout: Duration,
) -> RotatorError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RotatorError::Conflict(format!("{operation}: {db}"))
        }
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            RotatorError::NotFound(format!("{operation}: {db}"))
        }
        sqlx::Error::RowNotFound => RotatorError::NotFound(format!("{operation}: row not found")),
        sqlx::Error::PoolTimedOut => RotatorError::Timeout {
            operation: "acquire_connection",
            elapsed: acquire_timeout,
        },
        _ => RotatorError::StorageUnavailable(format!("{operation}: {err}")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rotator_core::ErrorKind;
    use std::borrow::Cow;
    use std::sync::atomic::{AtomicU32, Ordering};

    const ACQUIRE: Duration = Duration::from_secs(5);

    /// Database error carrying only a SQLSTATE code.
    #[derive(Debug)]
    struct SqlState {
        code: &'static str,
        unique: bool,
    }

    impl std::fmt::Display for SqlState {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "sqlstate {}", self.code)
        }
    }

    impl std::error::Error for SqlState {}

    impl sqlx::error::DatabaseError for SqlState {
        fn message(&self) -> &str {
            "sqlstate"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.code))
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            if self.unique {
                sqlx::error::ErrorKind::UniqueViolation
            } else {
                sqlx::error::ErrorKind::Other
            }
        }
    }

    fn db_error(code: &'static str) -> sqlx::Error {
        sqlx::Error::Database(Box::new(SqlState {
            code,
            unique: false,
        }))
    }

    fn unique_violation() -> sqlx::Error {
        sqlx::Error::Database(Box::new(SqlState {
            code: "23505",
            unique: true,
        }))
    }

    #[test]
    fn test_driver_errors_map_to_kinds() {
        assert_eq!(
            map_sqlx(sqlx::Error::RowNotFound, "slot", ACQUIRE).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            map_sqlx(sqlx::Error::PoolClosed, "get_arms", ACQUIRE).kind(),
            ErrorKind::StorageUnavailable
        );
        assert_eq!(
            map_sqlx(unique_violation(), "add_assignment", ACQUIRE).kind(),
            ErrorKind::Conflict
        );
    }

    #[test]
    fn test_pool_timeout_reports_acquire_timeout() {
        let err = map_sqlx(sqlx::Error::PoolTimedOut, "get_arms", ACQUIRE);
        assert_eq!(err.kind(), ErrorKind::Timeout);
        match err {
            RotatorError::Timeout { elapsed, .. } => assert_eq!(elapsed, ACQUIRE),
            other => panic!("expected timeout, got {other:?}"),
        }
        let message = map_sqlx(sqlx::Error::PoolTimedOut, "get_arms", ACQUIRE).to_string();
        assert!(message.contains("5s"), "{message}");
    }

    #[test]
    fn test_serialization_failures_are_recognised() {
        assert!(is_serialization_failure(&db_error(SERIALIZATION_FAILURE)));
        assert!(is_serialization_failure(&db_error(DEADLOCK_DETECTED)));
        assert!(!is_serialization_failure(&unique_violation()));
        assert!(!is_serialization_failure(&sqlx::Error::PoolClosed));
        assert!(!is_serialization_failure(&sqlx::Error::RowNotFound));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_serialization_failures() {
        let attempts = AtomicU32::new(0);
        let result = with_serialization_retry(3, "add_assignment", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    0 => Err(db_error(SERIALIZATION_FAILURE)),
                    1 => Err(db_error(DEADLOCK_DETECTED)),
                    _ => Ok(n),
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_configured_attempts() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = with_serialization_retry(2, "remove_assignment", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(db_error(SERIALIZATION_FAILURE)) }
        })
        .await;

        // one attempt plus two retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let err = map_sqlx(result.unwrap_err(), "remove_assignment", ACQUIRE);
        assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = with_serialization_retry(3, "add_assignment", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(unique_violation()) }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        let err = map_sqlx(result.unwrap_err(), "add_assignment", ACQUIRE);
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_negative_counter_clamps_to_zero() {
        assert_eq!(counter(-1), 0);
        assert_eq!(counter(42), 42);
    }
}
