//! Process configuration.
//!
//! Configuration is a YAML document with a `database` section and an
//! optional `rabbitmq` section for broker-backed sinks. `${VAR}`
//! references anywhere in the document are substituted from the
//! environment before parsing, so secrets stay out of the file:
//!
//! ```yaml
//! database:
//!   name: app
//!   user: postgres
//!   password: ${DB_PASSWORD}
//!   host: localhost
//!   port: 5432
//!   connection_pool_size: 5
//!   replication_plugin: pgoutput
//!   replication_slot: pgtest
//! ```

use crate::core::errors::{ReplicationError, ReplicationResult};
use serde::{Deserialize, Deserializer};
use std::env;
use std::fmt;
use std::path::Path;

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    /// Only read by broker sink/consumer adapters; the core ignores it.
    #[serde(default)]
    pub rabbitmq: Option<BrokerConfig>,
}

/// The `database` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub user: String,
    pub password: String,
    pub host: String,
    #[serde(deserialize_with = "port_from_string_or_int")]
    pub port: String,
    pub connection_pool_size: usize,
    pub replication_plugin: OutputPlugin,
    pub replication_slot: String,
    /// Bound on concurrent decode-and-sink workers. Defaults to
    /// `connection_pool_size`; set to 1 for strictly ordered sink calls.
    #[serde(default)]
    pub worker_pool_size: Option<usize>,
    /// What to do with the flush LSN when an event fails to process.
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

/// The logical-decoding output plugin of the replication slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputPlugin {
    Pgoutput,
    Wal2json,
}

impl fmt::Display for OutputPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputPlugin::Pgoutput => write!(f, "pgoutput"),
            OutputPlugin::Wal2json => write!(f, "wal2json"),
        }
    }
}

/// Feedback policy for events that fail to decode or that a sink rejects.
///
/// `Hold` never advances the flush LSN past an unacknowledged failure, so
/// a restart replays the event. `Advance` reports the error and moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    #[default]
    Hold,
    Advance,
}

/// The optional `rabbitmq` section, consumed by broker adapters.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub url: String,
    pub exchange: String,
    #[serde(default)]
    pub routing_keys: Vec<String>,
    #[serde(default)]
    pub queue: Option<String>,
}

impl Config {
    /// Load and validate a configuration file, substituting `${VAR}`
    /// references from the environment first.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> ReplicationResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReplicationError::config(format!(
                "cannot read configuration file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse a YAML configuration document from a string.
    pub fn from_yaml_str(content: &str) -> ReplicationResult<Self> {
        let substituted = substitute_env_vars(content);
        let config: Config = serde_yaml::from_str(&substituted)
            .map_err(|e| ReplicationError::config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ReplicationResult<()> {
        let db = &self.database;

        if db.connection_pool_size == 0 {
            return Err(ReplicationError::config(
                "database.connection_pool_size must be at least 1",
            ));
        }

        if db.replication_slot.trim().is_empty() {
            return Err(ReplicationError::config(
                "database.replication_slot cannot be empty",
            ));
        }

        if !db
            .replication_slot
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ReplicationError::config(
                "database.replication_slot can only contain alphanumeric characters and underscores",
            ));
        }

        if db.replication_slot.len() > 63 {
            return Err(ReplicationError::config(
                "database.replication_slot cannot be longer than 63 characters",
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    /// Effective worker-pool bound (see [`DatabaseConfig::worker_pool_size`]).
    pub fn effective_worker_pool_size(&self) -> usize {
        self.worker_pool_size
            .unwrap_or(self.connection_pool_size)
            .max(1)
    }

    /// libpq connection string for regular (pool) connections.
    pub fn conninfo(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            quote_conninfo_value(&self.host),
            quote_conninfo_value(&self.port),
            quote_conninfo_value(&self.name),
            quote_conninfo_value(&self.user),
            quote_conninfo_value(&self.password),
        )
    }

    /// libpq connection string for the dedicated replication connection.
    pub fn replication_conninfo(&self) -> String {
        format!("{} replication=database", self.conninfo())
    }
}

/// Replace every `${VAR}` in `content` with the value of the environment
/// variable `VAR`, or the empty string when unset.
pub fn substitute_env_vars(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end)
                if !after[..end].is_empty()
                    && after[..end]
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_') =>
            {
                let var_name = &after[..end];
                out.push_str(&env::var(var_name).unwrap_or_default());
                rest = &after[end + 1..];
            }
            _ => {
                // Not a well-formed reference; emit literally and move on.
                out.push_str("${");
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

fn quote_conninfo_value(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| !c.is_whitespace() && c != '\'' && c != '\\')
    {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

fn port_from_string_or_int<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Int(u32),
        Str(String),
    }

    match PortValue::deserialize(deserializer)? {
        PortValue::Int(p) => Ok(p.to_string()),
        PortValue::Str(s) => Ok(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
database:
  name: dummy
  user: postgres
  password: postgres
  host: localhost
  port: 5432
  connection_pool_size: 5
  replication_plugin: pgoutput
  replication_slot: pgtest
rabbitmq:
  url: amqp://localhost
  exchange: table_exchange
  routing_keys:
    - public.users
  queue: pgtest
"#;

    #[test]
    fn parses_full_document() {
        let config = Config::from_yaml_str(FULL_CONFIG).unwrap();
        assert_eq!(config.database.name, "dummy");
        assert_eq!(config.database.port, "5432");
        assert_eq!(config.database.replication_plugin, OutputPlugin::Pgoutput);
        assert_eq!(config.database.error_policy, ErrorPolicy::Hold);
        assert_eq!(config.database.effective_worker_pool_size(), 5);

        let broker = config.rabbitmq.unwrap();
        assert_eq!(broker.exchange, "table_exchange");
        assert_eq!(broker.routing_keys, vec!["public.users"]);
    }

    #[test]
    fn port_accepts_string_form() {
        let yaml = FULL_CONFIG.replace("port: 5432", "port: \"6432\"");
        let config = Config::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.database.port, "6432");
    }

    #[test]
    fn missing_field_is_named_in_error() {
        let yaml = FULL_CONFIG.replace("  replication_slot: pgtest\n", "");
        let err = Config::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("replication_slot"), "{err}");
    }

    #[test]
    fn unknown_plugin_is_rejected() {
        let yaml = FULL_CONFIG.replace("pgoutput", "decoderbufs");
        assert!(Config::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn invalid_slot_name_is_rejected() {
        let yaml = FULL_CONFIG.replace("replication_slot: pgtest", "replication_slot: bad-slot");
        let err = Config::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("alphanumeric"), "{err}");
    }

    #[test]
    fn substitutes_environment_variables() {
        // Unique variable name to avoid clashes across parallel tests.
        unsafe { env::set_var("PG_STREAMLINE_TEST_PASSWORD", "s3cret") };
        let yaml = FULL_CONFIG.replace(
            "password: postgres",
            "password: ${PG_STREAMLINE_TEST_PASSWORD}",
        );
        let config = Config::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.database.password, "s3cret");
    }

    #[test]
    fn unset_variable_becomes_empty_and_malformed_reference_is_literal() {
        assert_eq!(
            substitute_env_vars("a ${PG_STREAMLINE_TEST_UNSET_VAR} b"),
            "a  b"
        );
        assert_eq!(substitute_env_vars("cost is ${not-a-var}"), "cost is ${not-a-var}");
        assert_eq!(substitute_env_vars("dangling ${"), "dangling ${");
    }

    #[test]
    fn conninfo_quotes_awkward_values() {
        let config = Config::from_yaml_str(FULL_CONFIG).unwrap();
        let mut db = config.database.clone();
        assert_eq!(
            db.conninfo(),
            "host=localhost port=5432 dbname=dummy user=postgres password=postgres"
        );

        db.password = "pa ss'word".to_string();
        assert!(db.conninfo().ends_with("password='pa ss\\'word'"));
        assert!(db.replication_conninfo().ends_with(" replication=database"));
    }
}
