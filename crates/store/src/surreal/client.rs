//! SurrealDB connection management for the message store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use itertools::Itertools;
use serde::Serialize;
use surrealdb::Surreal;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use wharf_core::{Clock, SystemClock};

use super::rows::INCOMING_TABLE;
use crate::error::{StoreError, StoreResult, from_surrealdb_error};
use crate::lock::DEFAULT_LOCK_LEASE;

/// Configuration for the SurrealDB message store.
#[derive(Debug, Clone)]
pub struct SurrealConfig {
    /// Connection URL (e.g., "mem://", "ws://localhost:8000")
    pub url: String,
    /// Namespace to use
    pub namespace: String,
    /// Database to use
    pub database: String,
    /// Optional root credentials
    pub credentials: Option<Credentials>,
    /// Lease of advisory locks held by this store's sessions
    pub lock_lease: Duration,
}

/// Root credentials for authentication.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl SurrealConfig {
    /// Create an in-memory configuration for testing.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            url: "mem://".to_string(),
            namespace: "wharf".to_string(),
            database: "test".to_string(),
            credentials: None,
            lock_lease: DEFAULT_LOCK_LEASE,
        }
    }

    /// Create a WebSocket configuration.
    #[must_use]
    pub fn websocket(host: &str, port: u16) -> Self {
        Self {
            url: format!("ws://{host}:{port}"),
            namespace: "wharf".to_string(),
            database: "production".to_string(),
            credentials: None,
            lock_lease: DEFAULT_LOCK_LEASE,
        }
    }

    /// Set credentials for authentication.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Set the namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the advisory lock lease.
    #[must_use]
    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }
}

impl Default for SurrealConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Message store backed by SurrealDB.
///
/// Clones share the underlying connection.
#[derive(Clone)]
pub struct SurrealMessageStore {
    pub(crate) db: Arc<Surreal<Any>>,
    pub(crate) config: SurrealConfig,
    pub(crate) clock: Arc<dyn Clock>,
}

impl SurrealMessageStore {
    /// Connect to the database with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or authentication fails.
    pub async fn connect(config: SurrealConfig) -> StoreResult<Self> {
        let db = Surreal::<Any>::init();

        db.connect(&config.url)
            .await
            .map_err(from_surrealdb_error)?;

        if let Some(creds) = &config.credentials {
            db.signin(Root {
                username: &creds.username,
                password: &creds.password,
            })
            .await
            .map_err(from_surrealdb_error)?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(from_surrealdb_error)?;

        tracing::debug!(url = %config.url, namespace = %config.namespace, "Connected message store");

        Ok(Self {
            db: Arc::new(db),
            config,
            clock: Arc::new(SystemClock),
        })
    }

    /// Connect and provision the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema provisioning fails.
    pub async fn connect_and_migrate(config: SurrealConfig) -> StoreResult<Self> {
        let store = Self::connect(config).await?;
        store.initialize_schema().await?;
        Ok(store)
    }

    /// Use `clock` for lock lease expiry.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get a reference to the underlying database client.
    #[must_use]
    pub fn db(&self) -> &Surreal<Any> {
        &self.db
    }

    /// Get the store configuration.
    #[must_use]
    pub fn config(&self) -> &SurrealConfig {
        &self.config
    }

    /// Initialize the database schema.
    ///
    /// # Errors
    ///
    /// Returns an error if schema initialization fails.
    pub async fn initialize_schema(&self) -> StoreResult<()> {
        let schema = include_str!("schema.surql");

        self.db
            .query(schema)
            .await
            .map_err(|e| StoreError::schema_error(e.to_string()))?
            .check()
            .map_err(|e| StoreError::schema_error(e.to_string()))?;

        Ok(())
    }

    /// Check if the database is healthy.
    ///
    /// # Errors
    ///
    /// Returns an error if the health check fails.
    pub async fn health_check(&self) -> StoreResult<()> {
        self.db
            .query("INFO FOR DB")
            .await
            .map_err(from_surrealdb_error)?;

        Ok(())
    }

    /// Run statements inside one `BEGIN`/`COMMIT` block.
    pub(crate) async fn run_transaction(&self, statements: Vec<Statement>) -> StoreResult<()> {
        run_transaction(&self.db, statements).await
    }
}

/// One SurrealQL statement and its parameter bindings.
///
/// Statements staged into the same transaction share one parameter
/// namespace, so binding names must be unique across them. Names starting
/// with `w` followed by a digit are used by the store itself.
#[derive(Debug, Clone)]
pub struct Statement {
    sql: String,
    bindings: Vec<(String, serde_json::Value)>,
}

impl Statement {
    /// Create a statement; a trailing `;` is added if missing.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        let mut sql = sql.into();
        if !sql.trim_end().ends_with(';') {
            sql.push(';');
        }
        Self {
            sql,
            bindings: Vec::new(),
        }
    }

    /// Bind `$name` to `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized.
    pub fn bind(mut self, name: impl Into<String>, value: impl Serialize) -> StoreResult<Self> {
        self.bindings
            .push((name.into(), serde_json::to_value(value)?));
        Ok(self)
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

pub(crate) async fn run_transaction(
    db: &Surreal<Any>,
    statements: Vec<Statement>,
) -> StoreResult<()> {
    if statements.is_empty() {
        return Ok(());
    }

    let sql = std::iter::once("BEGIN TRANSACTION;")
        .chain(statements.iter().map(Statement::sql))
        .chain(std::iter::once("COMMIT TRANSACTION;"))
        .join("\n");

    let mut query = db.query(sql);
    for (name, value) in statements.into_iter().flat_map(|s| s.bindings) {
        query = query.bind((name, value));
    }

    let mut response = query.await.map_err(from_surrealdb_error)?;
    let errors = response.take_errors();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(transaction_error(&errors))
    }
}

/// Pick the statement error that caused a transaction to fail.
///
/// Every other statement of a failed transaction reports that it was not
/// executed; those carry no information.
fn transaction_error(errors: &HashMap<usize, surrealdb::Error>) -> StoreError {
    let messages = errors
        .iter()
        .sorted_by_key(|(index, _)| **index)
        .map(|(_, error)| error.to_string())
        .collect::<Vec<_>>();

    if let Some(duplicate) = messages
        .iter()
        .find(|m| m.contains("already exists") && m.contains(INCOMING_TABLE))
    {
        return StoreError::duplicate_envelope(duplicate);
    }

    messages
        .iter()
        .find(|m| !m.contains("not executed"))
        .or_else(|| messages.first())
        .map_or_else(
            || StoreError::transaction_failed("unknown failure"),
            |cause| match from_surrealdb_error(cause) {
                StoreError::QueryFailed { reason } | StoreError::AlreadyExists { id: reason, .. } => {
                    StoreError::transaction_failed(reason)
                }
                other => other,
            },
        )
}
