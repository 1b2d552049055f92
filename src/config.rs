use crate::secret_string::SecretString;
use crate::workqueue::ExponentialBackoff;
use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::info;

pub static KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub destination_repository: String,
    #[serde(default)]
    pub registry: RegistryCredentials,
    #[serde(default)]
    pub webserver: Webserver,
    #[serde(default = "default_resync_schedule")]
    pub resync_schedule: String,
    #[serde(default = "default_cache_sync_timeout_seconds")]
    pub cache_sync_timeout_seconds: u64,
    #[serde(default)]
    pub excluded_namespaces: Vec<String>,
    #[serde(default)]
    pub rate_limiter: RateLimiter,
    #[serde(default)]
    pub tls: Tls,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Deserialize, Default)]
pub struct RegistryCredentials {
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiter {
    pub base_delay_millis: u64,
    pub max_delay_seconds: u64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self {
            base_delay_millis: 5,
            max_delay_seconds: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    #[serde(default)]
    pub ca_certificate_paths: Vec<PathBuf>,
    /// Registry hosts reached over plain HTTP, e.g. an in-cluster `registry:5000`.
    #[serde(default)]
    pub insecure_registries: Vec<String>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Default)]
pub struct Logging {
    #[serde(default)]
    pub format: LogFormat,
}

fn default_resync_schedule() -> String {
    "*/30 * * * * *".to_string()
}

fn default_cache_sync_timeout_seconds() -> u64 {
    120
}

impl Config {
    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_seconds)
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.rate_limiter.base_delay_millis),
            Duration::from_secs(self.rate_limiter.max_delay_seconds),
        )
    }

    /// `kube-system` plus every configured pattern.
    pub fn namespace_filter(&self) -> Result<NamespaceFilter> {
        NamespaceFilter::new(&self.excluded_namespaces)
    }

    fn validate(mut self) -> Result<Self> {
        self.destination_repository = self
            .destination_repository
            .trim()
            .trim_end_matches('/')
            .to_string();
        if self.destination_repository.is_empty() {
            anyhow::bail!("destinationRepository must not be empty");
        }
        if self.rate_limiter.base_delay_millis == 0 {
            anyhow::bail!("rateLimiter.baseDelayMillis must be greater than zero");
        }
        Ok(self)
    }
}

/// Namespaces whose workloads are never mirrored.
#[derive(Debug, Clone)]
pub struct NamespaceFilter {
    excluded: GlobSet,
}

impl NamespaceFilter {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        builder.add(Glob::new(KUBE_SYSTEM_NAMESPACE)?);
        for pattern in patterns {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("Invalid excluded namespace pattern {}", pattern))?,
            );
        }
        Ok(Self {
            excluded: builder
                .build()
                .context("Failed to build excluded namespace patterns")?,
        })
    }

    pub fn is_excluded(&self, namespace: &str) -> bool {
        namespace == KUBE_SYSTEM_NAMESPACE || self.excluded.is_match(namespace)
    }
}

impl Default for NamespaceFilter {
    fn default() -> Self {
        // Only the built-in pattern, which always compiles
        Self::new(&[]).unwrap_or_else(|_| Self {
            excluded: GlobSet::empty(),
        })
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    config.validate()
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let missing: Vec<&str> = re
        .captures_iter(input)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|var_name| env::var(var_name).is_err())
        .collect();
    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable: {}", missing.join(", "));
    }

    let result = re.replace_all(input, |caps: &regex::Captures| {
        env::var(&caps[1]).unwrap_or_default()
    });

    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_expand_env_vars_success() {
        unsafe {
            env::set_var("MIRROR_TEST_VAR", "value123");
        }
        let input = "This is a test: ${MIRROR_TEST_VAR}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "This is a test: value123");
        unsafe {
            env::remove_var("MIRROR_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_missing_var() {
        let input = "This will fail: ${MIRROR_MISSING_VAR}";
        let err = expand_env_vars(input).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing environment variable: MIRROR_MISSING_VAR"
        );
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        let input = "No variables here";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, input);
    }

    #[test]
    fn test_load_config_file() {
        unsafe {
            env::set_var("MIRROR_TEST_PASSWORD", "secret_password");
        }
        let yaml_content = r#"
        destinationRepository: registry.example.com/backup/
        registry:
          username: mirror
          password: ${MIRROR_TEST_PASSWORD}
        webserver:
          port: 9090
        excludedNamespaces:
          - "tenant-*"
        rateLimiter:
          baseDelayMillis: 10
          maxDelaySeconds: 60
        tls:
          insecureRegistries:
            - registry.local:5000
        logging:
          format: json
        "#;

        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let path = tmp_file.path();
        fs::write(path, yaml_content).expect("Failed to write to temp file");

        let config = load_config(path).expect("Should load config");

        assert_eq!(config.destination_repository, "registry.example.com/backup");
        assert_eq!(config.registry.username.as_deref(), Some("mirror"));
        assert_eq!(
            config.registry.password.as_ref().map(|p| p.expose_secret()),
            Some("secret_password")
        );
        assert_eq!(config.webserver.port, 9090);
        assert_eq!(config.resync_schedule, "*/30 * * * * *");
        assert_eq!(config.cache_sync_timeout(), Duration::from_secs(120));
        assert_eq!(config.backoff().delay(1), Duration::from_millis(20));
        assert_eq!(config.tls.insecure_registries, vec!["registry.local:5000"]);
        assert_eq!(config.logging.format, LogFormat::Json);

        let filter = config.namespace_filter().unwrap();
        assert!(filter.is_excluded("kube-system"));
        assert!(filter.is_excluded("tenant-a"));
        assert!(!filter.is_excluded("default"));
        unsafe {
            env::remove_var("MIRROR_TEST_PASSWORD");
        }
    }

    #[test]
    fn test_load_config_defaults_without_credentials() {
        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        fs::write(tmp_file.path(), "destinationRepository: backup\n").unwrap();

        let config = load_config(tmp_file.path()).expect("Should load config");
        assert_eq!(config.destination_repository, "backup");
        assert!(config.registry.username.is_none());
        assert!(config.registry.password.is_none());
        assert_eq!(config.webserver.port, 8080);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_load_config_rejects_empty_destination() {
        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        fs::write(tmp_file.path(), "destinationRepository: \"/\"\n").unwrap();
        assert!(load_config(tmp_file.path()).is_err());
    }

    #[test]
    fn test_default_namespace_filter_excludes_kube_system_only() {
        let filter = NamespaceFilter::default();
        assert!(filter.is_excluded("kube-system"));
        assert!(!filter.is_excluded("kube-public"));
    }
}
