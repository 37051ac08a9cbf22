//! Mock connector for testing
//!
//! Opens in-memory connections that record every call and return canned
//! results. It's useful for:
//! - Unit testing resource lifecycle (commit, rollback, close)
//! - Asserting the exact SQL a resource issues
//! - Simulating connection and query failures
//!
//! ## Usage
//!
//! ```rust,ignore
//! let connector = MockConnector::new();
//! connector
//!     .add_result("SELECT 1", ResultTable::new(vec!["1".into()], vec![vec![json!(1)]]))
//!     .await;
//!
//! let resource = SnowflakeResource::new(config)?.with_connector(Arc::new(connector.clone()));
//! resource.execute_query("SELECT 1", None, true, false).await?;
//!
//! assert_eq!(connector.executed_queries().await, vec!["SELECT 1"]);
//! ```

use crate::args::{ArgMap, ConnectionSpec};
use crate::config::ConnectorKind;
use crate::connection::{Connector, ResultTable, WarehouseConnection, WarehouseError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One recorded call
#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    /// A connection was opened; args have the password removed
    Connect { kind: ConnectorKind, args: ArgMap },
    Execute(String),
    Commit,
    Rollback,
    Close,
}

/// Mock connector; clones share recorded events and canned results
#[derive(Clone)]
pub struct MockConnector {
    events: Arc<RwLock<Vec<MockEvent>>>,

    /// Canned results by exact SQL text
    results: Arc<RwLock<HashMap<String, ResultTable>>>,

    /// Errors to return for specific SQL text
    errors: Arc<RwLock<HashMap<String, String>>>,

    /// Fail every connection attempt
    fail_connection: bool,

    /// Simulated latency per operation (milliseconds)
    latency_ms: u64,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            results: Arc::new(RwLock::new(HashMap::new())),
            errors: Arc::new(RwLock::new(HashMap::new())),
            fail_connection: false,
            latency_ms: 0,
        }
    }

    /// Return `table` whenever `sql` is executed
    pub async fn add_result(&self, sql: impl Into<String>, table: ResultTable) {
        self.results.write().await.insert(sql.into(), table);
    }

    /// Fail with a query error whenever `sql` is executed
    pub async fn add_error_for_query(&self, sql: impl Into<String>, message: impl Into<String>) {
        self.errors.write().await.insert(sql.into(), message.into());
    }

    /// Fail all connection attempts
    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    /// Delay every operation by `latency_ms`
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Every recorded call, in order
    pub async fn events(&self) -> Vec<MockEvent> {
        self.events.read().await.clone()
    }

    /// SQL text of every executed statement, in order
    pub async fn executed_queries(&self) -> Vec<String> {
        self.events
            .read()
            .await
            .iter()
            .filter_map(|event| match event {
                MockEvent::Execute(sql) => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.events
            .read()
            .await
            .iter()
            .filter(|event| matches!(event, MockEvent::Connect { .. }))
            .count()
    }

    pub async fn clear_events(&self) {
        self.events.write().await.clear();
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

async fn simulate_latency(latency_ms: u64) {
    if latency_ms > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(latency_ms)).await;
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(
        &self,
        spec: &ConnectionSpec,
    ) -> Result<Box<dyn WarehouseConnection>, WarehouseError> {
        simulate_latency(self.latency_ms).await;

        if self.fail_connection {
            return Err(WarehouseError::ConnectionError(
                "Simulated connection failure".to_string(),
            ));
        }

        self.events.write().await.push(MockEvent::Connect {
            kind: spec.kind(),
            args: spec.redacted(),
        });

        Ok(Box::new(MockConnection {
            connector: self.clone(),
        }))
    }
}

struct MockConnection {
    connector: MockConnector,
}

impl MockConnection {
    async fn record(&self, event: MockEvent) {
        simulate_latency(self.connector.latency_ms).await;
        self.connector.events.write().await.push(event);
    }
}

#[async_trait::async_trait]
impl WarehouseConnection for MockConnection {
    async fn execute(&mut self, sql: &str) -> Result<ResultTable, WarehouseError> {
        self.record(MockEvent::Execute(sql.to_string())).await;

        if let Some(message) = self.connector.errors.read().await.get(sql) {
            return Err(WarehouseError::QueryError(message.clone()));
        }

        Ok(self
            .connector
            .results
            .read()
            .await
            .get(sql)
            .cloned()
            .unwrap_or_default())
    }

    async fn commit(&mut self) -> Result<(), WarehouseError> {
        self.record(MockEvent::Commit).await;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), WarehouseError> {
        self.record(MockEvent::Rollback).await;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), WarehouseError> {
        self.record(MockEvent::Close).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SnowflakeConfig;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn spec() -> ConnectionSpec {
        let config = SnowflakeConfig::new("xy12345", "loader").with_password("hunter2");
        ConnectionSpec::from_config(&config.validate().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn records_calls_and_returns_canned_results() {
        let connector = MockConnector::new();
        let table = ResultTable::new(vec!["ONE".to_string()], vec![vec![json!(1)]]);
        connector.add_result("SELECT 1", table.clone()).await;

        let mut conn = connector.connect(&spec()).await.unwrap();
        assert_eq!(conn.execute("SELECT 1").await.unwrap(), table);
        assert!(conn.execute("SELECT 2").await.unwrap().is_empty());
        conn.commit().await.unwrap();
        conn.close().await.unwrap();

        let events = connector.events().await;
        assert_eq!(events.len(), 5);
        assert!(matches!(
            &events[0],
            MockEvent::Connect { kind: ConnectorKind::Native, args } if !args.contains_key("password")
        ));
        assert_eq!(connector.executed_queries().await, vec!["SELECT 1", "SELECT 2"]);
        assert_eq!(events[3..], [MockEvent::Commit, MockEvent::Close]);
    }

    #[tokio::test]
    async fn configured_errors() {
        let connector = MockConnector::new();
        connector.add_error_for_query("DROP TABLE t", "insufficient privileges").await;

        let mut conn = connector.connect(&spec()).await.unwrap();
        assert!(matches!(
            conn.execute("DROP TABLE t").await,
            Err(WarehouseError::QueryError(msg)) if msg == "insufficient privileges"
        ));

        let failing = MockConnector::new().with_connection_failure();
        assert!(matches!(
            failing.connect(&spec()).await,
            Err(WarehouseError::ConnectionError(_))
        ));
        assert_eq!(failing.connection_count().await, 0);
    }

    #[tokio::test]
    async fn latency_is_simulated() {
        let connector = MockConnector::new().with_latency(20);
        let start = std::time::Instant::now();
        let _ = connector.connect(&spec()).await.unwrap();
        assert!(start.elapsed() >= std::time::Duration::from_millis(20));
    }
}
