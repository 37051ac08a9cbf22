//! Connection traits and the warehouse error type

use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

use crate::args::ConnectionSpec;
use crate::config::ConfigValidationError;
use crate::key::KeyError;
use crate::params::ParamError;

/// Errors raised by warehouse resources and connections
#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error(transparent)]
    Config(#[from] ConfigValidationError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Param(#[from] ParamError),

    /// An invalid combination of call arguments
    #[error("{0}")]
    Misuse(String),

    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("Connection failed: {0}")]
    ConnectionError(String),

    #[error("Query failed: {0}")]
    QueryError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Columns and rows returned by one statement
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of one named column, or `None` if the column is absent
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let index = self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))?;
        Some(self.rows.iter().filter_map(|row| row.get(index)).collect())
    }
}

/// An open session to the warehouse
#[async_trait::async_trait]
pub trait WarehouseConnection: Send {
    /// Run one statement and return whatever it produced
    async fn execute(&mut self, sql: &str) -> Result<ResultTable, WarehouseError>;

    async fn commit(&mut self) -> Result<(), WarehouseError>;

    async fn rollback(&mut self) -> Result<(), WarehouseError>;

    async fn close(&mut self) -> Result<(), WarehouseError>;
}

/// Opens connections from a [`ConnectionSpec`]
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Connector name for logs (e.g. "snowflake-api", "mock")
    fn name(&self) -> &'static str;

    async fn connect(
        &self,
        spec: &ConnectionSpec,
    ) -> Result<Box<dyn WarehouseConnection>, WarehouseError>;
}

/// Future returned by a scoped connection body
pub type ConnectionFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T, WarehouseError>> + Send + 'c>>;
