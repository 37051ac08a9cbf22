//! Snowflake resource configuration
//!
//! [`SnowflakeConfig`] is the flat key/value set a user writes under
//! `[warehouse]` in `assetforge.toml`. [`SnowflakeConfig::validate`] checks it
//! once and returns either a [`ValidatedConfig`] or every violation found.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use assetforge_core::resolve_env_refs;

use crate::connection::WarehouseError;

/// A secret config value; never printed by `Debug`
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Bind variable format for client side parameter binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParamStyle {
    /// `%s` and `%(name)s`
    #[default]
    Pyformat,
    /// `?`
    Qmark,
    /// `:1`, `:2`, ...
    Numeric,
}

impl ParamStyle {
    pub const VALID: &'static [&'static str] = &["pyformat", "qmark", "numeric"];

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pyformat" => Some(Self::Pyformat),
            "qmark" => Some(Self::Qmark),
            "numeric" => Some(Self::Numeric),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pyformat => "pyformat",
            Self::Qmark => "qmark",
            Self::Numeric => "numeric",
        }
    }
}

/// Which connection path a resource uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectorKind {
    /// The Snowflake driver, with the full native argument set
    #[default]
    Native,
    /// An SQLAlchemy-style engine URL plus separate engine arguments
    SqlAlchemy,
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::SqlAlchemy => write!(f, "sqlalchemy"),
        }
    }
}

/// Authentication method chosen by the config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Password,
    PrivateKey,
    PrivateKeyPath,
}

/// Snowflake resource configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SnowflakeConfig {
    /// Account identifier, e.g. `xy12345.us-east-1`
    #[serde(default)]
    pub account: Option<String>,

    /// User login name
    pub user: String,

    #[serde(default)]
    pub password: Option<Secret>,

    #[serde(default)]
    pub database: Option<String>,

    #[serde(default)]
    pub schema: Option<String>,

    #[serde(default)]
    pub role: Option<String>,

    #[serde(default)]
    pub warehouse: Option<String>,

    /// Base64-encoded PEM private key
    #[serde(default)]
    pub private_key: Option<Secret>,

    #[serde(default)]
    pub private_key_password: Option<Secret>,

    /// Path to a PEM private key file
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    /// Unset honors the account's AUTOCOMMIT parameter
    #[serde(default)]
    pub autocommit: Option<bool>,

    #[serde(default)]
    pub client_prefetch_threads: Option<u32>,

    #[serde(default)]
    pub client_session_keep_alive: Option<bool>,

    /// Seconds
    #[serde(default)]
    pub login_timeout: Option<u64>,

    /// Seconds
    #[serde(default)]
    pub network_timeout: Option<u64>,

    #[serde(default)]
    pub ocsp_response_cache_filename: Option<String>,

    #[serde(default)]
    pub validate_default_parameters: Option<bool>,

    /// One of `pyformat`, `qmark`, `numeric`
    #[serde(default)]
    pub paramstyle: Option<String>,

    #[serde(default)]
    pub timezone: Option<String>,

    /// Unset for the native driver, or `sqlalchemy`
    #[serde(default)]
    pub connector: Option<String>,

    /// SQLAlchemy connector only
    #[serde(default)]
    pub cache_column_metadata: Option<bool>,

    /// SQLAlchemy connector only
    #[serde(default)]
    pub numpy: Option<bool>,

    #[serde(default)]
    pub authenticator: Option<String>,

    /// Driver-specific settings passed through to native connections
    #[serde(flatten)]
    pub options: BTreeMap<String, toml::Value>,
}

impl SnowflakeConfig {
    /// Minimal config; set credentials and defaults on the returned value
    pub fn new(account: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            account: Some(account.into()),
            user: user.into(),
            password: None,
            database: None,
            schema: None,
            role: None,
            warehouse: None,
            private_key: None,
            private_key_password: None,
            private_key_path: None,
            autocommit: None,
            client_prefetch_threads: None,
            client_session_keep_alive: None,
            login_timeout: None,
            network_timeout: None,
            ocsp_response_cache_filename: None,
            validate_default_parameters: None,
            paramstyle: None,
            timezone: None,
            connector: None,
            cache_column_metadata: None,
            numpy: None,
            authenticator: None,
            options: BTreeMap::new(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Secret::new(password));
        self
    }

    pub fn with_private_key(mut self, encoded_pem: impl Into<String>) -> Self {
        self.private_key = Some(Secret::new(encoded_pem));
        self
    }

    pub fn with_private_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_path = Some(path.into());
        self
    }

    /// Password for an encrypted PKCS#8 private key
    pub fn with_private_key_password(mut self, password: impl Into<String>) -> Self {
        self.private_key_password = Some(Secret::new(password));
        self
    }

    /// Build from the `[warehouse]` settings table, resolving `env:` references
    pub fn from_settings(settings: &BTreeMap<String, toml::Value>) -> Result<Self, WarehouseError> {
        let resolved =
            resolve_env_refs(settings).map_err(|e| WarehouseError::ConfigError(e.to_string()))?;

        toml::Value::Table(resolved.into_iter().collect())
            .try_into()
            .map_err(|e: toml::de::Error| {
                WarehouseError::ConfigError(format!("Invalid warehouse settings: {}", e))
            })
    }

    /// Check every field and cross-field rule, collecting all violations
    pub fn validate(&self) -> Result<ValidatedConfig, ConfigValidationError> {
        let mut violations = Vec::new();

        let paramstyle = match self.paramstyle.as_deref() {
            None => ParamStyle::default(),
            Some(value) => ParamStyle::parse(value).unwrap_or_else(|| {
                violations.push(ConfigViolation::InvalidParamstyle(value.to_string()));
                ParamStyle::default()
            }),
        };

        let connector = match self.connector.as_deref() {
            None => ConnectorKind::Native,
            Some("sqlalchemy") => ConnectorKind::SqlAlchemy,
            Some(value) => {
                violations.push(ConfigViolation::InvalidConnector(value.to_string()));
                ConnectorKind::Native
            }
        };

        let methods: Vec<AuthMethod> = [
            (self.password.is_some(), AuthMethod::Password),
            (self.private_key.is_some(), AuthMethod::PrivateKey),
            (self.private_key_path.is_some(), AuthMethod::PrivateKeyPath),
        ]
        .into_iter()
        .filter_map(|(set, method)| set.then_some(method))
        .collect();

        match methods.len() {
            0 => violations.push(ConfigViolation::MissingAuthentication),
            1 => {}
            _ => violations.push(ConfigViolation::MultipleAuthentication),
        }

        if !violations.is_empty() {
            return Err(ConfigValidationError { violations });
        }

        Ok(ValidatedConfig {
            config: self.clone(),
            paramstyle,
            connector,
            auth: methods[0],
        })
    }
}

/// Config that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedConfig {
    pub config: SnowflakeConfig,
    pub paramstyle: ParamStyle,
    pub connector: ConnectorKind,
    pub auth: AuthMethod,
}

/// One failed validation rule
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigViolation {
    #[error("Snowflake Resource: 'paramstyle' configuration value must be one of: pyformat,qmark,numeric.")]
    InvalidParamstyle(String),

    #[error("Snowflake Resource: 'connector' configuration value must be None or sqlalchemy.")]
    InvalidConnector(String),

    #[error("Missing config: Password or private key authentication required for Snowflake resource.")]
    MissingAuthentication,

    #[error("Incorrect config: Cannot provide both password and private key authentication to Snowflake Resource.")]
    MultipleAuthentication,
}

/// All violations found by [`SnowflakeConfig::validate`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", format_violations(.violations))]
pub struct ConfigValidationError {
    pub violations: Vec<ConfigViolation>,
}

fn format_violations(violations: &[ConfigViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config() -> SnowflakeConfig {
        SnowflakeConfig::new("xy12345", "loader")
    }

    #[test]
    fn exactly_one_auth_method_is_required() {
        assert_eq!(
            config().validate().unwrap_err().violations,
            vec![ConfigViolation::MissingAuthentication]
        );

        let both = config().with_password("hunter2").with_private_key("a2V5");
        assert_eq!(
            both.validate().unwrap_err().violations,
            vec![ConfigViolation::MultipleAuthentication]
        );

        let path_and_password = config()
            .with_password("hunter2")
            .with_private_key_path("/keys/rsa_key.p8");
        assert!(path_and_password.validate().is_err());

        assert_eq!(
            config().with_password("hunter2").validate().unwrap().auth,
            AuthMethod::Password
        );
        assert_eq!(
            config().with_private_key_path("/keys/rsa_key.p8").validate().unwrap().auth,
            AuthMethod::PrivateKeyPath
        );
    }

    #[test]
    fn paramstyle_and_connector_are_checked() {
        let mut cfg = config().with_password("hunter2");
        cfg.paramstyle = Some("format".to_string());
        cfg.connector = Some("odbc".to_string());

        let err = cfg.validate().unwrap_err();
        assert_eq!(
            err.violations,
            vec![
                ConfigViolation::InvalidParamstyle("format".to_string()),
                ConfigViolation::InvalidConnector("odbc".to_string()),
            ]
        );
        assert_eq!(
            err.to_string(),
            "Snowflake Resource: 'paramstyle' configuration value must be one of: pyformat,qmark,numeric.\n\
             Snowflake Resource: 'connector' configuration value must be None or sqlalchemy."
        );
    }

    #[test]
    fn valid_choices() {
        let mut cfg = config().with_password("hunter2");
        cfg.paramstyle = Some("qmark".to_string());
        cfg.connector = Some("sqlalchemy".to_string());

        let validated = cfg.validate().unwrap();
        assert_eq!(validated.paramstyle, ParamStyle::Qmark);
        assert_eq!(validated.connector, ConnectorKind::SqlAlchemy);
    }

    #[test]
    fn defaults_are_pyformat_and_native() {
        let validated = config().with_password("hunter2").validate().unwrap();
        assert_eq!(validated.paramstyle, ParamStyle::Pyformat);
        assert_eq!(validated.connector, ConnectorKind::Native);
    }

    #[test]
    fn from_settings_resolves_env_and_keeps_options() {
        std::env::set_var("ASSETFORGE_TEST_SF_PASSWORD", "from-env");
        let settings: BTreeMap<String, toml::Value> = toml::from_str(
            r#"
            account = "xy12345"
            user = "loader"
            password = "env:ASSETFORGE_TEST_SF_PASSWORD"
            login_timeout = 30
            autocommit = true
            query_tag = "assetforge"
            "#,
        )
        .unwrap();

        let cfg = SnowflakeConfig::from_settings(&settings).unwrap();
        assert_eq!(cfg.password.as_ref().map(Secret::expose), Some("from-env"));
        assert_eq!(cfg.login_timeout, Some(30));
        assert_eq!(cfg.autocommit, Some(true));
        assert_eq!(cfg.options["query_tag"].as_str(), Some("assetforge"));
    }

    #[test]
    fn from_settings_requires_user() {
        let settings: BTreeMap<String, toml::Value> =
            toml::from_str(r#"account = "xy12345""#).unwrap();
        assert!(matches!(
            SnowflakeConfig::from_settings(&settings),
            Err(WarehouseError::ConfigError(_))
        ));
    }

    #[test]
    fn secrets_are_hidden_from_debug() {
        let cfg = config().with_password("hunter2");
        assert!(!format!("{cfg:?}").contains("hunter2"));
    }
}
