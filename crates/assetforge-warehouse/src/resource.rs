//! Snowflake resource: scoped connections and query helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! let resource = SnowflakeResource::from_warehouse_config(&config.warehouse)?;
//!
//! let rows = resource
//!     .execute_query("SELECT * FROM orders WHERE status = %s", Some(&params), true, false)
//!     .await?;
//!
//! resource
//!     .with_connection(|conn| Box::pin(async move {
//!         conn.execute("DELETE FROM staging").await?;
//!         conn.execute("INSERT INTO staging SELECT * FROM raw").await
//!     }))
//!     .await?;
//! ```

use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use assetforge_core::WarehouseConfig;

use crate::args::ConnectionSpec;
use crate::config::{SnowflakeConfig, ValidatedConfig};
use crate::connection::{
    ConnectionFuture, Connector, ResultTable, WarehouseConnection, WarehouseError,
};
use crate::params::{bind_parameters, QueryParams};
use crate::snowflake::SnowflakeApiConnector;

/// Fetched output of one query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// Bare rows
    Rows(Vec<Vec<Value>>),
    /// Rows with column names
    Table(ResultTable),
}

impl QueryResult {
    pub fn rows(&self) -> &[Vec<Value>] {
        match self {
            Self::Rows(rows) => rows,
            Self::Table(table) => &table.rows,
        }
    }
}

/// A configured Snowflake resource
#[derive(Clone)]
pub struct SnowflakeResource {
    config: ValidatedConfig,
    connector: Arc<dyn Connector>,
}

impl std::fmt::Debug for SnowflakeResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnowflakeResource")
            .field("config", &self.config)
            .field("connector", &self.connector.name())
            .finish()
    }
}

impl SnowflakeResource {
    /// Validate `config` and use the Snowflake REST connector
    pub fn new(config: SnowflakeConfig) -> Result<Self, WarehouseError> {
        let config = config.validate()?;
        Ok(Self {
            config,
            connector: Arc::new(SnowflakeApiConnector),
        })
    }

    /// Build from the `[warehouse]` section of `assetforge.toml`
    pub fn from_warehouse_config(warehouse: &WarehouseConfig) -> Result<Self, WarehouseError> {
        if !warehouse.warehouse_type.eq_ignore_ascii_case("snowflake") {
            return Err(WarehouseError::ConfigError(format!(
                "Unsupported warehouse type '{}'. Supported: snowflake",
                warehouse.warehouse_type
            )));
        }
        Self::new(SnowflakeConfig::from_settings(&warehouse.settings)?)
    }

    /// Swap the connector, e.g. for a mock in tests
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.config
    }

    /// Connection arguments, loading the private key if one is configured
    pub fn connection_spec(&self) -> Result<ConnectionSpec, WarehouseError> {
        Ok(ConnectionSpec::from_config(&self.config)?)
    }

    /// Run `body` on a fresh connection.
    ///
    /// On success a native connection commits unless autocommit is on; on
    /// failure the connection is rolled back. The connection is always
    /// closed.
    pub async fn with_connection<T, F>(&self, body: F) -> Result<T, WarehouseError>
    where
        F: for<'c> FnOnce(&'c mut dyn WarehouseConnection) -> ConnectionFuture<'c, T>,
    {
        let spec = self.connection_spec()?;
        tracing::debug!(
            connector = self.connector.name(),
            kind = %spec.kind(),
            args = ?spec.redacted(),
            "Opening Snowflake connection"
        );

        let mut conn = self.connector.connect(&spec).await?;

        let result = match body(conn.as_mut()).await {
            Ok(value) if spec.commits_on_exit() => conn.commit().await.map(|()| value),
            Ok(value) => Ok(value),
            Err(err) => {
                if let Err(rollback_err) = conn.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback failed");
                }
                Err(err)
            }
        };

        if let Err(close_err) = conn.close().await {
            tracing::warn!(error = %close_err, "Failed to close Snowflake connection");
        }

        result
    }

    /// Execute one query.
    ///
    /// Returns `None` unless `fetch_results` is set. `use_table_result`
    /// keeps column names alongside the rows.
    pub async fn execute_query(
        &self,
        sql: &str,
        parameters: Option<&QueryParams>,
        fetch_results: bool,
        use_table_result: bool,
    ) -> Result<Option<QueryResult>, WarehouseError> {
        let results = self
            .execute_queries(&[sql], parameters, fetch_results, use_table_result)
            .await?;
        Ok(results.and_then(|results| results.into_iter().next()))
    }

    /// Execute queries in order on a single connection.
    ///
    /// Every query gets the same parameters. Returns `None` when nothing was
    /// fetched.
    pub async fn execute_queries(
        &self,
        sql_queries: &[&str],
        parameters: Option<&QueryParams>,
        fetch_results: bool,
        use_table_result: bool,
    ) -> Result<Option<Vec<QueryResult>>, WarehouseError> {
        check_result_flags(fetch_results, use_table_result)?;

        let statements = sql_queries
            .iter()
            .map(|sql| bind_parameters(sql, parameters, self.config.paramstyle))
            .collect::<Result<Vec<_>, _>>()?;

        let results = self
            .with_connection(move |conn| {
                Box::pin(async move {
                    let mut results = Vec::new();
                    for sql in &statements {
                        tracing::info!("Executing query: {}", sql);
                        let table = conn.execute(sql).await?;
                        if let Some(result) = shape_result(table, fetch_results, use_table_result)
                        {
                            results.push(result);
                        }
                    }
                    Ok(results)
                })
            })
            .await?;

        Ok(if results.is_empty() { None } else { Some(results) })
    }

    /// Create `table` with a single VARIANT column and load a local Parquet
    /// file into it through the table stage
    pub async fn load_table_from_local_parquet(
        &self,
        src: &Path,
        table: &str,
    ) -> Result<(), WarehouseError> {
        let statements = parquet_load_statements(src, table);
        let refs: Vec<&str> = statements.iter().map(String::as_str).collect();
        self.execute_queries(&refs, None, false, false).await?;
        Ok(())
    }
}

fn check_result_flags(fetch_results: bool, use_table_result: bool) -> Result<(), WarehouseError> {
    if use_table_result && !fetch_results {
        return Err(WarehouseError::Misuse(
            "If use_table_result is true, fetch_results must also be true.".to_string(),
        ));
    }
    Ok(())
}

fn shape_result(table: ResultTable, fetch_results: bool, use_table_result: bool) -> Option<QueryResult> {
    if use_table_result {
        Some(QueryResult::Table(table))
    } else if fetch_results {
        Some(QueryResult::Rows(table.rows))
    } else {
        None
    }
}

/// The four statements that load a Parquet file into a VARIANT table
pub fn parquet_load_statements(src: &Path, table: &str) -> Vec<String> {
    vec![
        format!("CREATE OR REPLACE TABLE {} ( data VARIANT DEFAULT NULL);", table),
        "CREATE OR REPLACE FILE FORMAT parquet_format TYPE = 'parquet';".to_string(),
        format!("PUT {} @%{};", src.display(), table),
        format!(
            "COPY INTO {} FROM @%{} FILE_FORMAT = (FORMAT_NAME = 'parquet_format');",
            table, table
        ),
    ]
}
