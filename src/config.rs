use crate::credentials::{RegistryCredentials, trim_registry_url};
use crate::error::Error;
use crate::secret_string::SecretString;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::{env, fs, path::Path};
use tracing::info;

static CONFIG_FILE_ENV: &str = "CONFIG_FILE";
static DEFAULT_IGNORE_NAMESPACE: &str = "kube-system";
static DEFAULT_RESYNC_SCHEDULE: &str = "0 */10 * * * *";
static DEFAULT_WEBSERVER_PORT: u16 = 8080;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub backup_registry: BackupTarget,
    #[serde(default = "default_ignore_namespaces")]
    pub ignore_namespaces: Vec<String>,
    #[serde(default = "default_resync_schedule")]
    pub resync_schedule: String,
    #[serde(default)]
    pub webserver: Webserver,
    #[serde(default)]
    pub insecure_registries: Vec<String>,
}

/// The registry every workload image is mirrored into, fixed for the lifetime of the process.
#[derive(Debug, Clone, Deserialize)]
pub struct BackupTarget {
    pub url: String,
    pub username: String,
    pub password: SecretString,
}

#[derive(Debug, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Self {
            port: DEFAULT_WEBSERVER_PORT,
        }
    }
}

impl BackupTarget {
    pub fn new(url: &str, username: impl Into<String>, password: impl Into<SecretString>) -> Self {
        Self {
            url: trim_registry_url(url).to_string(),
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn credentials(&self) -> RegistryCredentials {
        RegistryCredentials::new(
            self.url.clone(),
            self.username.clone(),
            self.password.clone(),
        )
    }
}

fn default_ignore_namespaces() -> Vec<String> {
    vec![DEFAULT_IGNORE_NAMESPACE.to_string()]
}

fn default_resync_schedule() -> String {
    DEFAULT_RESYNC_SCHEDULE.to_string()
}

/// Loads the configuration from the YAML file named by `CONFIG_FILE`, or from the environment.
pub fn load_config() -> Result<Config> {
    match env::var(CONFIG_FILE_ENV) {
        Ok(path) => load_config_file(path),
        Err(_) => {
            info!("Loading config from environment variables");
            from_lookup(|name| env::var(name).ok()).map_err(Into::into)
        }
    }
}

pub fn load_config_file<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str, |name| env::var(name).ok())?;

    let mut config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;
    config.backup_registry = BackupTarget::new(
        &config.backup_registry.url,
        config.backup_registry.username.clone(),
        config.backup_registry.password.clone(),
    );
    validate(&config)?;

    Ok(config)
}

/// Builds the configuration from `BACKUP_REGISTRY_*`, `IGNORE_NAMESPACES`, `RESYNC_SCHEDULE`,
/// `WEBSERVER_PORT` and `INSECURE_REGISTRIES`.
fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, Error> {
    let required = |name: &str| {
        lookup(name).ok_or_else(|| Error::Config(format!("{} environment variable not found", name)))
    };
    let list = |value: String| -> Vec<String> {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    };

    let backup_registry = BackupTarget::new(
        &required("BACKUP_REGISTRY_URL")?,
        required("BACKUP_REGISTRY_USERNAME")?,
        required("BACKUP_REGISTRY_PASSWORD")?,
    );

    let webserver = match lookup("WEBSERVER_PORT") {
        Some(port) => Webserver {
            port: port
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid WEBSERVER_PORT {}", port)))?,
        },
        None => Webserver::default(),
    };

    let config = Config {
        backup_registry,
        ignore_namespaces: lookup("IGNORE_NAMESPACES")
            .map(list)
            .unwrap_or_else(default_ignore_namespaces),
        resync_schedule: lookup("RESYNC_SCHEDULE").unwrap_or_else(default_resync_schedule),
        webserver,
        insecure_registries: lookup("INSECURE_REGISTRIES").map(list).unwrap_or_default(),
    };
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), Error> {
    if config.backup_registry.url.is_empty() {
        return Err(Error::Config("backup registry URL is empty".to_string()));
    }
    if config.backup_registry.username.is_empty() {
        return Err(Error::Config("backup registry username is empty".to_string()));
    }
    Ok(())
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every variable that is not set.
fn expand_env_vars(input: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            lookup(var_name).unwrap_or_else(|| {
                missing.push(var_name.to_string());
                String::new()
            })
        })
        .into_owned();

    if !missing.is_empty() {
        return Err(Error::Config(format!(
            "Missing environment variable: {}",
            missing.join(", ")
        ))
        .into());
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_expand_env_vars_success() {
        let lookup = lookup_from(&[("TEST_VAR", "value123")]);
        let expanded = expand_env_vars("This is a test: ${TEST_VAR}", lookup)
            .expect("Expansion should succeed");
        assert_eq!(expanded, "This is a test: value123");
    }

    #[test]
    fn test_expand_env_vars_missing_var() {
        let err = expand_env_vars("This will fail: ${MISSING_VAR}", lookup_from(&[])).unwrap_err();
        assert!(err.to_string().contains("Missing environment variable: MISSING_VAR"));
    }

    #[test]
    fn test_expand_env_vars_multiple_vars() {
        let lookup = lookup_from(&[("VAR1", "foo"), ("VAR2", "bar")]);
        let expanded = expand_env_vars("${VAR1} and ${VAR2}", lookup).unwrap();
        assert_eq!(expanded, "foo and bar");
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        let input = "No variables here";
        let expanded = expand_env_vars(input, lookup_from(&[])).unwrap();
        assert_eq!(expanded, input);
    }

    #[test]
    fn test_from_lookup_normalizes_registry_url() {
        let config = from_lookup(lookup_from(&[
            ("BACKUP_REGISTRY_URL", "https://registry.example.com/"),
            ("BACKUP_REGISTRY_USERNAME", "user"),
            ("BACKUP_REGISTRY_PASSWORD", "password"),
        ]))
        .unwrap();

        assert_eq!(config.backup_registry.url, "registry.example.com");
        assert_eq!(config.backup_registry.username, "user");
        assert_eq!(config.backup_registry.password.expose_secret(), "password");
        assert_eq!(config.ignore_namespaces, vec!["kube-system"]);
        assert_eq!(config.resync_schedule, DEFAULT_RESYNC_SCHEDULE);
        assert_eq!(config.webserver.port, 8080);
        assert!(config.insecure_registries.is_empty());
    }

    #[test]
    fn test_from_lookup_optional_settings() {
        let config = from_lookup(lookup_from(&[
            ("BACKUP_REGISTRY_URL", "http://localhost:5000"),
            ("BACKUP_REGISTRY_USERNAME", "user"),
            ("BACKUP_REGISTRY_PASSWORD", "password"),
            ("IGNORE_NAMESPACES", "kube-system, monitoring-*,"),
            ("INSECURE_REGISTRIES", "localhost:5000"),
            ("WEBSERVER_PORT", "9090"),
        ]))
        .unwrap();

        assert_eq!(config.backup_registry.url, "localhost:5000");
        assert_eq!(config.ignore_namespaces, vec!["kube-system", "monitoring-*"]);
        assert_eq!(config.insecure_registries, vec!["localhost:5000"]);
        assert_eq!(config.webserver.port, 9090);
    }

    #[test]
    fn test_from_lookup_missing_password_fails_fast() {
        let err = from_lookup(lookup_from(&[
            ("BACKUP_REGISTRY_URL", "registry.example.com"),
            ("BACKUP_REGISTRY_USERNAME", "user"),
        ]))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid configuration: BACKUP_REGISTRY_PASSWORD environment variable not found"
        );
    }

    #[test]
    fn test_load_config_file() {
        let yaml_content = r#"
        backupRegistry:
          url: https://index.docker.io/
          username: user
          password: secret_password
        ignoreNamespaces:
          - kube-system
          - kube-public
        resyncSchedule: "0 0 * * * *"
        webserver:
          port: 8081
        "#;

        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let path = tmp_file.path();
        fs::write(path, yaml_content).expect("Failed to write to temp file");

        let config = load_config_file(path).expect("Should load config");

        assert_eq!(config.backup_registry.url, "index.docker.io");
        assert_eq!(config.backup_registry.password.expose_secret(), "secret_password");
        assert_eq!(config.ignore_namespaces, vec!["kube-system", "kube-public"]);
        assert_eq!(config.resync_schedule, "0 0 * * * *");
        assert_eq!(config.webserver.port, 8081);
    }

    #[test]
    fn test_backup_target_credentials() {
        let target = BackupTarget::new("https://index.docker.io", "user", "password");
        assert_eq!(
            target.credentials(),
            RegistryCredentials::new("index.docker.io", "user", "password")
        );
    }
}
