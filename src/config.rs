//! Configuration: command-line flags, environment binding, validation
//!
//! Every option is a clap flag and is also readable from the environment
//! with the `KUBERNETES_DATABASE_SCALER_` prefix (dashes become
//! underscores). Validation failures here are the only fatal errors in the
//! system.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{Error, Result};
use crate::tablewatch::credentials::DbCredentials;

/// Sweep cadence of the cleaner, independent of the scan interval.
pub const CLEANER_TICK: Duration = Duration::from_secs(60);

/// Duplicate a template Deployment per database row
#[derive(Parser, Debug, Clone)]
#[command(name = "kubernetes-database-scaler", version, about, long_about = None)]
pub struct Settings {
    /// Database driver name (only postgres is supported)
    #[arg(
        long,
        env = "KUBERNETES_DATABASE_SCALER_DATABASE_DRIVER",
        default_value = "postgres"
    )]
    pub database_driver: String,

    /// Database hostname
    #[arg(
        long,
        env = "KUBERNETES_DATABASE_SCALER_DATABASE_HOST",
        default_value = "localhost"
    )]
    pub database_host: String,

    /// Database port
    #[arg(
        long,
        env = "KUBERNETES_DATABASE_SCALER_DATABASE_PORT",
        default_value_t = 5432
    )]
    pub database_port: u16,

    /// Database name
    #[arg(
        long,
        env = "KUBERNETES_DATABASE_SCALER_DATABASE_NAME",
        default_value = ""
    )]
    pub database_name: String,

    /// Database username
    #[arg(
        long,
        env = "KUBERNETES_DATABASE_SCALER_DATABASE_USERNAME",
        default_value = ""
    )]
    pub database_username: String,

    /// Database password
    #[arg(
        long,
        env = "KUBERNETES_DATABASE_SCALER_DATABASE_PASSWORD",
        default_value = ""
    )]
    pub database_password: String,

    /// A file containing the database username; used when the inline
    /// username is empty
    #[arg(long, env = "KUBERNETES_DATABASE_SCALER_DATABASE_USERNAME_FILE")]
    pub database_username_file: Option<PathBuf>,

    /// A file containing the database password; used when the inline
    /// password is empty
    #[arg(long, env = "KUBERNETES_DATABASE_SCALER_DATABASE_PASSWORD_FILE")]
    pub database_password_file: Option<PathBuf>,

    /// Database table to monitor for rows
    #[arg(
        long,
        short = 't',
        env = "KUBERNETES_DATABASE_SCALER_TABLE_NAME",
        default_value = ""
    )]
    pub table_name: String,

    /// Filter rows using a WHERE clause (e.g. "status = 'active'")
    #[arg(
        long,
        env = "KUBERNETES_DATABASE_SCALER_SQL_CONDITION",
        default_value = ""
    )]
    pub sql_condition: String,

    /// Execute a custom SQL query instead of table-name and sql-condition
    /// (warning: bypasses WHERE-clause validation)
    #[arg(long, env = "KUBERNETES_DATABASE_SCALER_RAW_SQL", default_value = "")]
    pub raw_sql: String,

    /// Periodic check interval in seconds
    #[arg(
        long,
        env = "KUBERNETES_DATABASE_SCALER_CHECK_INTERVAL",
        default_value_t = 10
    )]
    pub check_interval: u64,

    /// Namespace of the Deployment to duplicate
    #[arg(
        long,
        env = "KUBERNETES_DATABASE_SCALER_ORIGINAL_DEPLOYMENT_NAMESPACE",
        default_value = ""
    )]
    pub original_deployment_namespace: String,

    /// Name of the Deployment to duplicate
    #[arg(
        long,
        env = "KUBERNETES_DATABASE_SCALER_ORIGINAL_DEPLOYMENT_NAME",
        default_value = ""
    )]
    pub original_deployment_name: String,

    /// Column whose value is appended to each duplicate's name
    #[arg(
        long,
        env = "KUBERNETES_DATABASE_SCALER_TARGET_DEPLOYMENT_NAME",
        default_value = ""
    )]
    pub target_deployment_name: String,

    /// Environment variable definition `NAME=column_name`; repeatable, or a
    /// single comma-joined list
    #[arg(
        long = "environment",
        env = "KUBERNETES_DATABASE_SCALER_ENVIRONMENT",
        value_delimiter = ','
    )]
    pub environment: Vec<String>,

    /// Label keys to strip from duplicates; repeatable, or a single
    /// comma-joined list
    #[arg(
        long = "exclude-label",
        env = "KUBERNETES_DATABASE_SCALER_EXCLUDE_LABEL",
        value_delimiter = ','
    )]
    pub exclude_label: Vec<String>,

    /// Name of a VerticalPodAutoscaler to duplicate alongside the
    /// Deployment; empty disables VPA duplication
    #[arg(
        long,
        env = "KUBERNETES_DATABASE_SCALER_ORIGINAL_VPA_NAME",
        default_value = ""
    )]
    pub original_vpa_name: String,
}

/// Ordered mapping from duplicate env-var names to source column names.
///
/// Order is preserved from the command line; duplicate env-var names are
/// rejected at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvBinding {
    entries: Vec<(String, String)>,
}

impl EnvBinding {
    /// Parse repeatable `NAME=column_name` definitions.
    pub fn parse(definitions: &[String]) -> Result<Self> {
        let mut entries = Vec::with_capacity(definitions.len());
        let mut seen = HashSet::new();

        for definition in definitions {
            let parts: Vec<&str> = definition.split('=').collect();
            if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
                return Err(Error::config(format!(
                    "invalid environment format {definition} (e.g. NAME=column_name)"
                )));
            }

            if !seen.insert(parts[0].to_string()) {
                return Err(Error::config(format!(
                    "duplicate environment variable {}",
                    parts[0]
                )));
            }

            entries.push((parts[0].to_string(), parts[1].to_string()));
        }

        Ok(Self { entries })
    }

    /// The ordered `(env_name, column_name)` pairs.
    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Connection target for the scanned database.
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub driver: String,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub credentials: DbCredentials,
}

/// Validated runtime configuration derived from [`Settings`].
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseSettings,
    pub table_name: String,
    pub sql_condition: String,
    pub raw_sql: String,
    pub check_interval: Duration,
    /// Suffixes unseen for longer than this are eligible for cleanup.
    pub clean_interval: Duration,
    pub template_namespace: String,
    pub template_name: String,
    /// Column whose value becomes each duplicate's name suffix.
    pub suffix_column: String,
    pub env_binding: EnvBinding,
    pub exclude_labels: Vec<String>,
    /// VPA duplication is enabled when this is set.
    pub vpa_template_name: Option<String>,
}

impl TryFrom<Settings> for Config {
    type Error = Error;

    fn try_from(settings: Settings) -> Result<Self> {
        if settings.database_driver != "postgres" {
            return Err(Error::config(format!(
                "unsupported database driver {}",
                settings.database_driver
            )));
        }

        if settings.original_deployment_namespace.is_empty() {
            return Err(Error::config("deployment namespace is empty"));
        }

        if settings.original_deployment_name.is_empty() {
            return Err(Error::config("deployment name is empty"));
        }

        if settings.target_deployment_name.is_empty() {
            return Err(Error::config("deployment column name is empty"));
        }

        if settings.check_interval == 0 {
            return Err(Error::config("check interval must be at least 1 second"));
        }

        let env_binding = EnvBinding::parse(&settings.environment)?;

        let check_interval = Duration::from_secs(settings.check_interval);

        Ok(Config {
            database: DatabaseSettings {
                driver: settings.database_driver,
                host: settings.database_host,
                port: settings.database_port,
                name: settings.database_name,
                credentials: DbCredentials::new(
                    settings.database_username,
                    settings.database_password,
                    settings.database_username_file,
                    settings.database_password_file,
                ),
            },
            table_name: settings.table_name,
            sql_condition: settings.sql_condition,
            raw_sql: settings.raw_sql,
            check_interval,
            clean_interval: check_interval * 3,
            template_namespace: settings.original_deployment_namespace,
            template_name: settings.original_deployment_name,
            suffix_column: settings.target_deployment_name,
            env_binding,
            exclude_labels: settings.exclude_label,
            vpa_template_name: if settings.original_vpa_name.is_empty() {
                None
            } else {
                Some(settings.original_vpa_name)
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "kubernetes-database-scaler",
            "--original-deployment-namespace",
            "default",
            "--original-deployment-name",
            "worker",
            "--target-deployment-name",
            "tenant_id",
            "--table-name",
            "tenants",
        ]
    }

    #[test]
    fn env_binding_preserves_order() {
        let binding = EnvBinding::parse(&[
            "FOO=col_f".to_string(),
            "BAR=col_b".to_string(),
            "BAZ=col_z".to_string(),
        ])
        .unwrap();

        let names: Vec<&str> = binding.entries().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["FOO", "BAR", "BAZ"]);
    }

    #[test]
    fn env_binding_rejects_malformed() {
        assert!(EnvBinding::parse(&["FOO".to_string()]).is_err());
        assert!(EnvBinding::parse(&["FOO=a=b".to_string()]).is_err());
        assert!(EnvBinding::parse(&["=col".to_string()]).is_err());
        assert!(EnvBinding::parse(&["FOO=".to_string()]).is_err());
    }

    #[test]
    fn env_binding_rejects_duplicate_names() {
        let err = EnvBinding::parse(&["FOO=a".to_string(), "FOO=b".to_string()]).unwrap_err();
        assert!(err.to_string().contains("duplicate environment variable"));
    }

    #[test]
    fn environment_flag_splits_on_comma() {
        let mut args = base_args();
        args.extend(["--environment", "FOO=col_f,BAR=col_b"]);
        let settings = Settings::parse_from(args);
        assert_eq!(settings.environment, vec!["FOO=col_f", "BAR=col_b"]);

        let config = Config::try_from(settings).unwrap();
        assert_eq!(config.env_binding.entries().len(), 2);
    }

    #[test]
    fn exclude_label_splits_on_comma() {
        let mut args = base_args();
        args.extend(["--exclude-label", "team,env"]);
        let settings = Settings::parse_from(args);
        let config = Config::try_from(settings).unwrap();
        assert_eq!(config.exclude_labels, vec!["team", "env"]);
    }

    #[test]
    fn missing_template_name_is_fatal() {
        let settings = Settings::parse_from([
            "kubernetes-database-scaler",
            "--original-deployment-namespace",
            "default",
            "--target-deployment-name",
            "tenant_id",
        ]);
        let err = Config::try_from(settings).unwrap_err();
        assert!(err.to_string().contains("deployment name is empty"));
    }

    #[test]
    fn unsupported_driver_is_fatal() {
        let mut args = base_args();
        args.extend(["--database-driver", "mysql"]);
        let err = Config::try_from(Settings::parse_from(args)).unwrap_err();
        assert!(err.to_string().contains("unsupported database driver"));
    }

    #[test]
    fn clean_interval_is_three_scan_intervals() {
        let mut args = base_args();
        args.extend(["--check-interval", "10"]);
        let config = Config::try_from(Settings::parse_from(args)).unwrap();
        assert_eq!(config.check_interval, Duration::from_secs(10));
        assert_eq!(config.clean_interval, Duration::from_secs(30));
    }

    #[test]
    fn vpa_enabled_only_when_named() {
        let config = Config::try_from(Settings::parse_from(base_args())).unwrap();
        assert!(config.vpa_template_name.is_none());

        let mut args = base_args();
        args.extend(["--original-vpa-name", "worker-vpa"]);
        let config = Config::try_from(Settings::parse_from(args)).unwrap();
        assert_eq!(config.vpa_template_name.as_deref(), Some("worker-vpa"));
    }
}
