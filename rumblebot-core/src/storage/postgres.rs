//! Postgres-backed store and ledger. Plain runtime queries with upserts;
//! the debit path uses a conditional UPDATE so concurrent writers can never
//! drive a balance below zero.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use rumblebot_common::traits::store_traits::{PointsLedger, StateStore};
use rumblebot_common::Error;

#[derive(Clone)]
pub struct PostgresStateStore {
    pool: Pool<Postgres>,
}

impl PostgresStateStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS activity_state (
                state_key   TEXT PRIMARY KEY,
                state_value BYTEA NOT NULL,
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let row = sqlx::query(
            r#"
            SELECT state_value
            FROM activity_state
            WHERE state_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(r.try_get("state_value")?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO activity_state (state_key, state_value, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (state_key)
            DO UPDATE SET
               state_value = EXCLUDED.state_value,
               updated_at  = now()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        sqlx::query(
            r#"
            DELETE FROM activity_state
            WHERE state_key = $1
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT state_key
            FROM activity_state
            WHERE state_key LIKE $1 || '%'
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get("state_key")?);
        }
        Ok(out)
    }
}

#[derive(Clone)]
pub struct PostgresPointsLedger {
    pool: Pool<Postgres>,
}

impl PostgresPointsLedger {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channel_points (
                channel TEXT NOT NULL,
                user_id UUID NOT NULL,
                points  BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (channel, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS points_audit (
                audit_id  UUID PRIMARY KEY,
                channel   TEXT NOT NULL,
                user_id   UUID NOT NULL,
                delta     BIGINT NOT NULL,
                reason    TEXT NOT NULL,
                logged_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_audit(
        &self,
        channel: &str,
        user_id: Uuid,
        delta: i64,
        reason: &str,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO points_audit (audit_id, channel, user_id, delta, reason)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(channel)
        .bind(user_id)
        .bind(delta)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PointsLedger for PostgresPointsLedger {
    async fn get_points(&self, channel: &str, user_id: Uuid) -> Result<i64, Error> {
        let row = sqlx::query(
            r#"
            SELECT points
            FROM channel_points
            WHERE channel = $1 AND user_id = $2
            "#,
        )
        .bind(channel)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(r.try_get("points")?),
            None => Ok(0),
        }
    }

    async fn add_points(
        &self,
        channel: &str,
        user_id: Uuid,
        amount: i64,
        reason: &str,
    ) -> Result<(), Error> {
        if amount < 0 {
            return Err(Error::Ledger(format!("negative credit: {}", amount)));
        }
        sqlx::query(
            r#"
            INSERT INTO channel_points (channel, user_id, points)
            VALUES ($1, $2, $3)
            ON CONFLICT (channel, user_id)
            DO UPDATE SET points = channel_points.points + EXCLUDED.points
            "#,
        )
        .bind(channel)
        .bind(user_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;

        self.log_audit(channel, user_id, amount, reason).await
    }

    async fn remove_points(
        &self,
        channel: &str,
        user_id: Uuid,
        amount: i64,
        reason: &str,
    ) -> Result<(), Error> {
        if amount < 0 {
            return Err(Error::Ledger(format!("negative debit: {}", amount)));
        }
        // Conditional update: never lets a racing debit push the balance
        // below zero.
        let result = sqlx::query(
            r#"
            UPDATE channel_points
            SET points = points - $3
            WHERE channel = $1 AND user_id = $2 AND points >= $3
            "#,
        )
        .bind(channel)
        .bind(user_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let available = self.get_points(channel, user_id).await?;
            return Err(Error::InsufficientPoints {
                needed: amount,
                available,
            });
        }

        self.log_audit(channel, user_id, -amount, reason).await
    }
}
