//! Snowflake connector built on the `snowflake-api` crate
//!
//! Requires the `snowflake` feature. Without it, [`SnowflakeApiConnector`]
//! still exists but every connection attempt fails with a configuration
//! error explaining how to rebuild.
//!
//! ## Authentication Methods
//!
//! 1. Password authentication (user/password)
//! 2. Key-pair authentication (RSA private key, passed on as PKCS#8)
//!
//! Session options the REST API does not take at login (`autocommit`,
//! `timezone`) are applied with `ALTER SESSION` right after connecting.

use crate::args::{ArgMap, ConnectionSpec};
use crate::connection::{Connector, WarehouseConnection, WarehouseError};

#[cfg(feature = "snowflake")]
use crate::connection::ResultTable;

#[cfg(feature = "snowflake")]
use snowflake_api::SnowflakeApi;

#[cfg(feature = "snowflake")]
use arrow_array::{Array, RecordBatch};

use serde_json::Value;

/// Connector that opens sessions through the Snowflake REST API
#[derive(Debug, Clone, Copy, Default)]
pub struct SnowflakeApiConnector;

/// `ALTER SESSION` statements for options applied after login
pub fn session_statements(args: &ArgMap) -> Vec<String> {
    let mut statements = Vec::new();

    if let Some(Value::Bool(autocommit)) = args.get("autocommit") {
        statements.push(format!(
            "ALTER SESSION SET AUTOCOMMIT = {}",
            if *autocommit { "TRUE" } else { "FALSE" }
        ));
    }

    if let Some(Value::String(timezone)) = args.get("timezone") {
        statements.push(format!(
            "ALTER SESSION SET TIMEZONE = '{}'",
            timezone.replace('\'', "''")
        ));
    }

    statements
}

#[cfg(feature = "snowflake")]
fn required<'a>(spec: &'a ConnectionSpec, key: &str) -> Result<&'a str, WarehouseError> {
    spec.arg_str(key).ok_or_else(|| {
        WarehouseError::ConfigError(format!("Snowflake connections require '{}'", key))
    })
}

#[async_trait::async_trait]
impl Connector for SnowflakeApiConnector {
    fn name(&self) -> &'static str {
        "snowflake-api"
    }

    #[cfg(feature = "snowflake")]
    async fn connect(
        &self,
        spec: &ConnectionSpec,
    ) -> Result<Box<dyn WarehouseConnection>, WarehouseError> {
        let account = required(spec, "account")?;
        let user = required(spec, "user")?;
        let warehouse = spec.arg_str("warehouse");
        let database = spec.arg_str("database");
        let schema = spec.arg_str("schema");
        let role = spec.arg_str("role");

        let api = match (spec.private_key(), spec.arg_str("password")) {
            (Some(key), _) => SnowflakeApi::with_certificate_auth(
                account,
                warehouse,
                database,
                schema,
                user,
                role,
                key.pem(),
            )
            .map_err(|e| {
                WarehouseError::AuthenticationError(format!(
                    "Failed to authenticate with key-pair: {}",
                    e
                ))
            })?,
            (None, Some(password)) => SnowflakeApi::with_password_auth(
                account, warehouse, database, schema, user, role, password,
            )
            .map_err(|e| {
                WarehouseError::AuthenticationError(format!(
                    "Failed to authenticate with Snowflake: {}",
                    e
                ))
            })?,
            (None, None) => {
                return Err(WarehouseError::AuthenticationError(
                    "no password or private key configured".to_string(),
                ))
            }
        };

        let mut connection = SnowflakeApiConnection { api };
        for statement in session_statements(spec.args()) {
            connection.execute(&statement).await?;
        }

        tracing::debug!(account, user, "Opened Snowflake session");
        Ok(Box::new(connection))
    }

    #[cfg(not(feature = "snowflake"))]
    async fn connect(
        &self,
        _spec: &ConnectionSpec,
    ) -> Result<Box<dyn WarehouseConnection>, WarehouseError> {
        Err(WarehouseError::ConfigError(
            "Snowflake support not compiled. Rebuild with: cargo build --features snowflake"
                .to_string(),
        ))
    }
}

#[cfg(feature = "snowflake")]
struct SnowflakeApiConnection {
    api: SnowflakeApi,
}

#[cfg(feature = "snowflake")]
#[async_trait::async_trait]
impl WarehouseConnection for SnowflakeApiConnection {
    async fn execute(&mut self, sql: &str) -> Result<ResultTable, WarehouseError> {
        use snowflake_api::QueryResult;

        let result = self
            .api
            .exec(sql)
            .await
            .map_err(|e| WarehouseError::QueryError(e.to_string()))?;

        match result {
            QueryResult::Arrow(batches) => record_batches_to_table(&batches),
            QueryResult::Json(json) => Ok(json_to_table(&json.value)),
            QueryResult::Empty => Ok(ResultTable::default()),
        }
    }

    async fn commit(&mut self) -> Result<(), WarehouseError> {
        self.execute("COMMIT").await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<(), WarehouseError> {
        self.execute("ROLLBACK").await.map(|_| ())
    }

    async fn close(&mut self) -> Result<(), WarehouseError> {
        self.api
            .close_session()
            .await
            .map_err(|e| WarehouseError::ConnectionError(format!("Failed to close session: {}", e)))
    }
}

/// Arrow batches to rows; non-null cells are rendered as display strings
#[cfg(feature = "snowflake")]
fn record_batches_to_table(batches: &[RecordBatch]) -> Result<ResultTable, WarehouseError> {
    use arrow_cast::display::array_value_to_string;

    let mut table = ResultTable::default();

    for batch in batches {
        if table.columns.is_empty() {
            table.columns = batch
                .schema()
                .fields()
                .iter()
                .map(|field| field.name().to_string())
                .collect();
        }

        for row in 0..batch.num_rows() {
            let mut values = Vec::with_capacity(batch.num_columns());
            for column in batch.columns() {
                if column.is_null(row) {
                    values.push(Value::Null);
                } else {
                    let rendered = array_value_to_string(column, row)
                        .map_err(|e| WarehouseError::InvalidResponse(e.to_string()))?;
                    values.push(Value::String(rendered));
                }
            }
            table.rows.push(values);
        }
    }

    Ok(table)
}

/// JSON results carry rows only; column names are not available
#[cfg(feature = "snowflake")]
fn json_to_table(value: &Value) -> ResultTable {
    let rows = match value {
        Value::Array(rows) => rows
            .iter()
            .map(|row| match row {
                Value::Array(cells) => cells.clone(),
                other => vec![other.clone()],
            })
            .collect(),
        Value::Null => Vec::new(),
        other => vec![vec![other.clone()]],
    };

    ResultTable {
        columns: Vec::new(),
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn session_statements_follow_args() {
        let mut args = ArgMap::new();
        assert!(session_statements(&args).is_empty());

        args.insert("autocommit".to_string(), json!(false));
        args.insert("timezone".to_string(), json!("America/Los_Angeles"));
        assert_eq!(
            session_statements(&args),
            vec![
                "ALTER SESSION SET AUTOCOMMIT = FALSE".to_string(),
                "ALTER SESSION SET TIMEZONE = 'America/Los_Angeles'".to_string(),
            ]
        );
    }

    #[cfg(not(feature = "snowflake"))]
    #[tokio::test]
    async fn connect_without_feature_explains_rebuild() {
        use crate::config::SnowflakeConfig;

        let config = SnowflakeConfig::new("xy12345", "loader").with_password("pw");
        let spec = ConnectionSpec::from_config(&config.validate().unwrap()).unwrap();

        match SnowflakeApiConnector.connect(&spec).await {
            Err(WarehouseError::ConfigError(msg)) => {
                assert!(msg.contains("--features snowflake"))
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connect should fail without the snowflake feature"),
        }
    }

    #[cfg(feature = "snowflake")]
    #[test]
    fn json_rows_are_kept() {
        let table = json_to_table(&json!([["1", "a"], ["2", null]]));
        assert_eq!(table.rows, vec![vec![json!("1"), json!("a")], vec![json!("2"), Value::Null]]);
        assert!(table.columns.is_empty());
    }
}
