//! Snowflake warehouse resource
//!
//! Validated configuration, connection arguments for the native and
//! SQLAlchemy connection paths, scoped connections with commit/rollback,
//! and query helpers.
//!
//! ## Features
//!
//! - `snowflake` - compile the Snowflake REST connector (`snowflake-api`)
//!
//! Without the feature, resources still validate and build connection
//! arguments; opening a real connection fails with a configuration error.
//! [`MockConnector`] works either way.
//!
//! ## Example
//!
//! ```rust,ignore
//! use assetforge_warehouse::{SnowflakeConfig, SnowflakeResource};
//!
//! let config = SnowflakeConfig::new("xy12345.us-east-1", "loader").with_password(password);
//! let resource = SnowflakeResource::new(config)?;
//! let rows = resource.execute_query("SELECT CURRENT_VERSION()", None, true, false).await?;
//! ```

pub mod args;
pub mod config;
pub mod connection;
pub mod key;
pub mod mock;
pub mod params;
pub mod resource;
pub mod snowflake;

pub use args::{
    filter_password, native_connection_args, sqlalchemy_connection_args, ArgMap, ConnectionSpec,
    NativeConnection, SqlAlchemyConnection, NATIVE_ARG_KEYS, SQLALCHEMY_ARG_KEYS,
};
pub use config::{
    AuthMethod, ConfigValidationError, ConfigViolation, ConnectorKind, ParamStyle, Secret,
    SnowflakeConfig, ValidatedConfig,
};
pub use connection::{ConnectionFuture, Connector, ResultTable, WarehouseConnection, WarehouseError};
pub use key::{load_private_key, KeyError, PrivateKey};
pub use mock::{MockConnector, MockEvent};
pub use params::{bind_parameters, ParamError, QueryParams, SqlValue};
pub use resource::{parquet_load_statements, QueryResult, SnowflakeResource};
pub use snowflake::{session_statements, SnowflakeApiConnector};
