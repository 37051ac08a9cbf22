//! Connection arguments derived from a validated config
//!
//! The native connector takes the full driver argument set. The SQLAlchemy
//! connector takes a reduced set rendered into an engine URL, with the
//! private key carried separately as an engine argument.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::config::{ConnectorKind, SnowflakeConfig, ValidatedConfig};
use crate::key::{load_private_key, KeyError, PrivateKey};

/// Driver arguments by name
pub type ArgMap = BTreeMap<String, Value>;

/// Arguments passed to the native connector
pub const NATIVE_ARG_KEYS: &[&str] = &[
    "account",
    "user",
    "password",
    "database",
    "schema",
    "role",
    "warehouse",
    "autocommit",
    "client_prefetch_threads",
    "client_session_keep_alive",
    "login_timeout",
    "network_timeout",
    "ocsp_response_cache_filename",
    "validate_default_parameters",
    "paramstyle",
    "timezone",
    "authenticator",
];

/// Arguments rendered into a SQLAlchemy URL
pub const SQLALCHEMY_ARG_KEYS: &[&str] = &[
    "account",
    "user",
    "password",
    "database",
    "schema",
    "role",
    "warehouse",
    "cache_column_metadata",
    "numpy",
];

const MASK: &str = "***";

fn config_value(config: &SnowflakeConfig, key: &str) -> Option<Value> {
    let string = |v: &Option<String>| v.as_ref().map(|s| Value::from(s.as_str()));
    match key {
        "account" => string(&config.account),
        "user" => Some(Value::from(config.user.as_str())),
        "password" => config.password.as_ref().map(|p| Value::from(p.expose())),
        "database" => string(&config.database),
        "schema" => string(&config.schema),
        "role" => string(&config.role),
        "warehouse" => string(&config.warehouse),
        "autocommit" => config.autocommit.map(Value::from),
        "client_prefetch_threads" => config.client_prefetch_threads.map(Value::from),
        "client_session_keep_alive" => config.client_session_keep_alive.map(Value::from),
        "login_timeout" => config.login_timeout.map(Value::from),
        "network_timeout" => config.network_timeout.map(Value::from),
        "ocsp_response_cache_filename" => string(&config.ocsp_response_cache_filename),
        "validate_default_parameters" => config.validate_default_parameters.map(Value::from),
        "paramstyle" => string(&config.paramstyle),
        "timezone" => string(&config.timezone),
        "authenticator" => string(&config.authenticator),
        "cache_column_metadata" => config.cache_column_metadata.map(Value::from),
        "numpy" => config.numpy.map(Value::from),
        _ => None,
    }
}

fn collect_args(config: &SnowflakeConfig, keys: &[&str]) -> ArgMap {
    keys.iter()
        .filter_map(|key| config_value(config, key).map(|value| (key.to_string(), value)))
        .collect()
}

/// Native driver arguments; unset fields are omitted and extra options pass through
pub fn native_connection_args(config: &SnowflakeConfig) -> ArgMap {
    let mut args = collect_args(config, NATIVE_ARG_KEYS);
    for (key, value) in &config.options {
        if let Ok(value) = serde_json::to_value(value) {
            args.entry(key.clone()).or_insert(value);
        }
    }
    args
}

/// Arguments rendered into the SQLAlchemy URL
pub fn sqlalchemy_connection_args(config: &SnowflakeConfig) -> ArgMap {
    collect_args(config, SQLALCHEMY_ARG_KEYS)
}

/// Copy of `args` without the password, for logging
pub fn filter_password(args: &ArgMap) -> ArgMap {
    args.iter()
        .filter(|(key, _)| key.as_str() != "password")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Native connection: driver args plus an optional private key
#[derive(Debug, Clone, PartialEq)]
pub struct NativeConnection {
    pub args: ArgMap,
    pub private_key: Option<PrivateKey>,
}

/// SQLAlchemy connection: URL args plus engine args
#[derive(Debug, Clone, PartialEq)]
pub struct SqlAlchemyConnection {
    pub args: ArgMap,
    pub engine_private_key: Option<PrivateKey>,
}

impl SqlAlchemyConnection {
    /// Engine URL with the password in clear text
    pub fn url(&self) -> String {
        self.render_url(false)
    }

    fn render_url(&self, mask_password: bool) -> String {
        let text = |key: &str| match self.args.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };

        let mut url = format!("snowflake://{}", text("user"));
        if self.args.contains_key("password") {
            url.push(':');
            url.push_str(&if mask_password { MASK.to_string() } else { text("password") });
        }
        url.push('@');
        url.push_str(&text("account"));

        if self.args.contains_key("database") {
            url.push('/');
            url.push_str(&text("database"));
            if self.args.contains_key("schema") {
                url.push('/');
                url.push_str(&text("schema"));
            }
        }

        let query: Vec<String> = ["role", "warehouse", "cache_column_metadata", "numpy"]
            .iter()
            .filter(|key| self.args.contains_key(**key))
            .map(|key| format!("{}={}", key, text(key)))
            .collect();
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query.join("&"));
        }

        url
    }
}

impl fmt::Display for SqlAlchemyConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render_url(true))
    }
}

/// Everything a connector needs to open a session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionSpec {
    Native(NativeConnection),
    SqlAlchemy(SqlAlchemyConnection),
}

impl ConnectionSpec {
    /// Build the connection spec for a validated config, loading its private key
    pub fn from_config(config: &ValidatedConfig) -> Result<Self, KeyError> {
        let private_key = load_private_key(&config.config)?;

        Ok(match config.connector {
            ConnectorKind::Native => Self::Native(NativeConnection {
                args: native_connection_args(&config.config),
                private_key,
            }),
            ConnectorKind::SqlAlchemy => Self::SqlAlchemy(SqlAlchemyConnection {
                args: sqlalchemy_connection_args(&config.config),
                engine_private_key: private_key,
            }),
        })
    }

    pub fn kind(&self) -> ConnectorKind {
        match self {
            Self::Native(_) => ConnectorKind::Native,
            Self::SqlAlchemy(_) => ConnectorKind::SqlAlchemy,
        }
    }

    pub fn args(&self) -> &ArgMap {
        match self {
            Self::Native(native) => &native.args,
            Self::SqlAlchemy(sqlalchemy) => &sqlalchemy.args,
        }
    }

    pub fn private_key(&self) -> Option<&PrivateKey> {
        match self {
            Self::Native(native) => native.private_key.as_ref(),
            Self::SqlAlchemy(sqlalchemy) => sqlalchemy.engine_private_key.as_ref(),
        }
    }

    /// String argument by name
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args().get(key).and_then(Value::as_str)
    }

    /// Native sessions commit on scope exit unless autocommit is on
    pub fn commits_on_exit(&self) -> bool {
        match self {
            Self::Native(native) => native.args.get("autocommit") != Some(&Value::Bool(true)),
            Self::SqlAlchemy(_) => false,
        }
    }

    /// Arguments safe to log
    pub fn redacted(&self) -> ArgMap {
        filter_password(self.args())
    }
}
