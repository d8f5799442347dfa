//! PostgreSQL Identity Store
//!
//! Connection pooling with deadpool-postgres and the `clients` table behind
//! the [`IdentityStore`] traits. Transactions run `BEGIN`/`COMMIT` on a
//! connection checked out for their whole lifetime. A transaction dropped
//! while open takes its connection out of the pool and closes it, which
//! makes the server abort the transaction.

use crate::config::{env_or, env_parse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clientele_core::{
    ClientFilter, ClientInput, ClientRecord, ClienteleError, ClienteleResult, ConfigError,
    StoreError,
};
use clientele_storage::{ClientRepository, IdentityStore, StoreTransaction};
use deadpool_postgres::{
    Config, ManagerConfig, Object, Pool, PoolConfig, PoolError, RecyclingMethod, Runtime,
    SslMode,
};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashSet;
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};

/// Schema applied by [`PostgresIdentityStore::ensure_schema`].
pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS clients (
    id BIGSERIAL PRIMARY KEY,
    name VARCHAR(100) NOT NULL,
    bearer_key VARCHAR(255) NOT NULL UNIQUE CONSTRAINT clients_bearer_key_check CHECK (bearer_key <> ''),
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS clients_name_idx ON clients (name);
";

const SELECT_COLUMNS: &str = "SELECT id, name, bearer_key, created_at, updated_at FROM clients";

const UPSERT_SQL: &str = "
INSERT INTO clients (name, bearer_key, created_at, updated_at)
SELECT * FROM UNNEST($1::varchar[], $2::varchar[], $3::timestamptz[], $4::timestamptz[])
ON CONFLICT (bearer_key) DO UPDATE SET name = EXCLUDED.name, updated_at = EXCLUDED.updated_at
";

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: Option<SecretString>,
    /// Only `disable` is supported.
    pub sslmode: String,
    pub max_size: usize,
    pub connect_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "clientele".to_string(),
            user: "postgres".to_string(),
            password: None,
            sslmode: "disable".to_string(),
            max_size: 16,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl DbConfig {
    /// Environment variables:
    /// - `DATABASE_HOST` (default: localhost)
    /// - `DATABASE_PORT` (default: 5432)
    /// - `DATABASE_NAME` (default: clientele)
    /// - `DATABASE_USERNAME` (default: postgres)
    /// - `DATABASE_PASSWORD` (optional)
    /// - `DATABASE_SSLMODE` (default: disable)
    /// - `DATABASE_POOL_SIZE` (default: 16)
    /// - `DATABASE_CONNECT_TIMEOUT` seconds (default: 5)
    pub fn from_env() -> Self {
        Self {
            host: env_or("DATABASE_HOST", "localhost"),
            port: env_parse("DATABASE_PORT", 5432),
            dbname: env_or("DATABASE_NAME", "clientele"),
            user: env_or("DATABASE_USERNAME", "postgres"),
            password: std::env::var("DATABASE_PASSWORD")
                .ok()
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            sslmode: env_or("DATABASE_SSLMODE", "disable"),
            max_size: env_parse("DATABASE_POOL_SIZE", 16),
            connect_timeout: Duration::from_secs(env_parse("DATABASE_CONNECT_TIMEOUT", 5)),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.sslmode.eq_ignore_ascii_case("disable") {
            return Err(ConfigError::InvalidValue {
                field: "DATABASE_SSLMODE".to_string(),
                value: self.sslmode.clone(),
                reason: "only 'disable' is supported".to_string(),
            });
        }
        if self.max_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "DATABASE_POOL_SIZE".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Create a connection pool. No connection is opened until first use.
    pub fn create_pool(&self) -> ClienteleResult<Pool> {
        self.validate()?;

        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = self
            .password
            .as_ref()
            .map(|p| p.expose_secret().to_string());
        cfg.ssl_mode = Some(SslMode::Disable);
        cfg.connect_timeout = Some(self.connect_timeout);

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool = PoolConfig::new(self.max_size);
        pool.timeouts.wait = Some(self.connect_timeout);
        pool.timeouts.create = Some(self.connect_timeout);
        pool.timeouts.recycle = Some(self.connect_timeout);
        cfg.pool = Some(pool);

        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| {
                StoreError::Pool {
                    reason: format!("Failed to create pool: {}", e),
                }
                .into()
            })
    }
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

fn query_error(err: tokio_postgres::Error) -> ClienteleError {
    if let Some(db) = err.as_db_error() {
        let code = db.code();
        if *code == SqlState::UNIQUE_VIOLATION || *code == SqlState::CHECK_VIOLATION {
            return StoreError::ConstraintViolation {
                constraint: db.constraint().unwrap_or("clients").to_string(),
                reason: db.message().to_string(),
            }
            .into();
        }
        return StoreError::Query {
            reason: db.message().to_string(),
        }
        .into();
    }
    if err.is_closed() {
        return StoreError::Connection {
            reason: err.to_string(),
        }
        .into();
    }
    StoreError::Query {
        reason: err.to_string(),
    }
    .into()
}

fn pool_error(err: PoolError) -> ClienteleError {
    match err {
        PoolError::Backend(e) => StoreError::Connection {
            reason: e.to_string(),
        }
        .into(),
        other => StoreError::Pool {
            reason: other.to_string(),
        }
        .into(),
    }
}

// ============================================================================
// QUERIES
// ============================================================================

/// Keep the last input per bearer key. A single `INSERT ... ON CONFLICT`
/// cannot touch the same row twice.
fn dedupe_last_wins(inputs: &[ClientInput]) -> Vec<&ClientInput> {
    let mut seen = HashSet::new();
    let mut kept: Vec<&ClientInput> = inputs
        .iter()
        .rev()
        .filter(|input| seen.insert(input.bearer_key.as_str()))
        .collect();
    kept.reverse();
    kept
}

/// `WHERE` clause for a non-empty filter, with its parameters.
fn filter_clause(filter: &ClientFilter) -> (String, Vec<&(dyn ToSql + Sync)>) {
    let mut clauses = Vec::new();
    let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
    if !filter.ids.is_empty() {
        params.push(&filter.ids);
        clauses.push(format!("id = ANY(${})", params.len()));
    }
    if !filter.names.is_empty() {
        params.push(&filter.names);
        clauses.push(format!("name = ANY(${})", params.len()));
    }
    if !filter.bearer_keys.is_empty() {
        params.push(&filter.bearer_keys);
        clauses.push(format!("bearer_key = ANY(${})", params.len()));
    }
    (format!(" WHERE {}", clauses.join(" AND ")), params)
}

fn record_from_row(row: &Row) -> ClienteleResult<ClientRecord> {
    Ok(ClientRecord {
        id: row.try_get("id").map_err(query_error)?,
        name: row.try_get("name").map_err(query_error)?,
        bearer_key: row.try_get("bearer_key").map_err(query_error)?,
        created_at: row.try_get("created_at").map_err(query_error)?,
        updated_at: row.try_get("updated_at").map_err(query_error)?,
    })
}

async fn upsert_rows(client: &Client, inputs: &[ClientInput]) -> ClienteleResult<()> {
    if inputs.is_empty() {
        return Ok(());
    }
    let now = Utc::now();
    let rows = dedupe_last_wins(inputs);
    let names: Vec<&str> = rows.iter().map(|i| i.name.as_str()).collect();
    let keys: Vec<&str> = rows.iter().map(|i| i.bearer_key.as_str()).collect();
    let created: Vec<DateTime<Utc>> = rows.iter().map(|i| i.created_at.unwrap_or(now)).collect();
    let updated: Vec<DateTime<Utc>> = rows.iter().map(|i| i.updated_at.unwrap_or(now)).collect();

    client
        .execute(UPSERT_SQL, &[&names, &keys, &created, &updated])
        .await
        .map_err(query_error)?;
    Ok(())
}

async fn select_rows(
    client: &Client,
    filter: &ClientFilter,
    lock: bool,
) -> ClienteleResult<Vec<ClientRecord>> {
    filter.validate()?;
    let (clause, params) = filter_clause(filter);
    let mut sql = format!("{}{} ORDER BY id", SELECT_COLUMNS, clause);
    if lock {
        sql.push_str(" FOR UPDATE");
    }

    let rows = client.query(&sql, &params).await.map_err(query_error)?;
    rows.iter().map(record_from_row).collect()
}

async fn delete_rows(client: &Client, filter: &ClientFilter) -> ClienteleResult<u64> {
    filter.validate()?;
    let (clause, params) = filter_clause(filter);
    let sql = format!("DELETE FROM clients{}", clause);
    client.execute(&sql, &params).await.map_err(query_error)
}

async fn key_exists(client: &Client, bearer_key: &str) -> ClienteleResult<bool> {
    let row = client
        .query_one(
            "SELECT EXISTS(SELECT 1 FROM clients WHERE bearer_key = $1)",
            &[&bearer_key],
        )
        .await
        .map_err(query_error)?;
    row.try_get(0).map_err(query_error)
}

// ============================================================================
// STORE
// ============================================================================

/// [`IdentityStore`] over a deadpool-postgres pool.
#[derive(Clone)]
pub struct PostgresIdentityStore {
    pool: Pool,
}

impl PostgresIdentityStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &DbConfig) -> ClienteleResult<Self> {
        Ok(Self::new(config.create_pool()?))
    }

    /// Current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    /// Create the `clients` table and its indexes when missing.
    pub async fn ensure_schema(&self) -> ClienteleResult<()> {
        let conn = self.get_conn().await?;
        conn.batch_execute(SCHEMA).await.map_err(query_error)?;
        tracing::info!("Client schema ensured");
        Ok(())
    }

    async fn get_conn(&self) -> ClienteleResult<Object> {
        self.pool.get().await.map_err(pool_error)
    }
}

#[async_trait]
impl ClientRepository for PostgresIdentityStore {
    async fn upsert(&self, inputs: &[ClientInput]) -> ClienteleResult<()> {
        let conn = self.get_conn().await?;
        upsert_rows(&conn, inputs).await
    }

    async fn find_by_filter(
        &self,
        filter: &ClientFilter,
        lock: bool,
    ) -> ClienteleResult<Vec<ClientRecord>> {
        filter.validate()?;
        let conn = self.get_conn().await?;
        select_rows(&conn, filter, lock).await
    }

    async fn delete_by_filter(&self, filter: &ClientFilter) -> ClienteleResult<u64> {
        filter.validate()?;
        let conn = self.get_conn().await?;
        delete_rows(&conn, filter).await
    }

    async fn is_exists(&self, bearer_key: &str) -> ClienteleResult<bool> {
        let conn = self.get_conn().await?;
        key_exists(&conn, bearer_key).await
    }
}

#[async_trait]
impl IdentityStore for PostgresIdentityStore {
    async fn begin(&self) -> ClienteleResult<Box<dyn StoreTransaction>> {
        let conn = self.get_conn().await?;
        if let Err(e) = conn.batch_execute("BEGIN").await {
            drop(Object::take(conn));
            return Err(StoreError::TransactionFailed {
                reason: e.to_string(),
            }
            .into());
        }
        Ok(Box::new(PostgresTransaction { conn: Some(conn) }))
    }

    async fn health_check(&self) -> ClienteleResult<()> {
        let conn = self.get_conn().await?;
        conn.batch_execute("SELECT 1").await.map_err(query_error)
    }
}

// ============================================================================
// TRANSACTION
// ============================================================================

/// An open transaction holding one pooled connection.
pub struct PostgresTransaction {
    conn: Option<Object>,
}

impl PostgresTransaction {
    fn client(&self) -> ClienteleResult<&Object> {
        self.conn.as_ref().ok_or_else(|| {
            StoreError::TransactionFailed {
                reason: "transaction already finished".to_string(),
            }
            .into()
        })
    }

    async fn finish(mut self: Box<Self>, statement: &str) -> ClienteleResult<()> {
        let conn = self.conn.take().ok_or_else(|| StoreError::TransactionFailed {
            reason: "transaction already finished".to_string(),
        })?;
        match conn.batch_execute(statement).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Connection state is unknown; never hand it back to the pool.
                drop(Object::take(conn));
                Err(StoreError::TransactionFailed {
                    reason: format!("{} failed: {}", statement, e),
                }
                .into())
            }
        }
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::warn!("Transaction dropped while open, discarding its connection");
            drop(Object::take(conn));
        }
    }
}

#[async_trait]
impl ClientRepository for PostgresTransaction {
    async fn upsert(&self, inputs: &[ClientInput]) -> ClienteleResult<()> {
        upsert_rows(self.client()?, inputs).await
    }

    async fn find_by_filter(
        &self,
        filter: &ClientFilter,
        lock: bool,
    ) -> ClienteleResult<Vec<ClientRecord>> {
        select_rows(self.client()?, filter, lock).await
    }

    async fn delete_by_filter(&self, filter: &ClientFilter) -> ClienteleResult<u64> {
        delete_rows(self.client()?, filter).await
    }

    async fn is_exists(&self, bearer_key: &str) -> ClienteleResult<bool> {
        key_exists(self.client()?, bearer_key).await
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    fn repository(&self) -> &dyn ClientRepository {
        self
    }

    async fn commit(self: Box<Self>) -> ClienteleResult<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> ClienteleResult<()> {
        self.finish("ROLLBACK").await
    }
}
