use crate::buckets::Resolutions;
use crate::record_source::DEFAULT_PAGE_SIZE;
use crate::store::UpsertStrategy;
use crate::upsert_pool::DEFAULT_CONCURRENCY;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Remote list API; when absent records are read from the local SQLite mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub url: String,
    pub api_key: String,
}

/// Configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct TallyConfig {
    pub account_id: String,
    pub db_path: PathBuf,
    pub api: Option<ApiConfig>,
    pub concurrency: usize,
    pub page_size: usize,
    pub upsert_strategy: UpsertStrategy,
    pub resolutions: Resolutions,
    pub rust_log: String,
}

impl TallyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source; `from_env` passes the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let account_id = var("TALLYFLOW_ACCOUNT_ID")
            .ok_or_else(|| ConfigError::MissingVariable("TALLYFLOW_ACCOUNT_ID".to_string()))?;

        let db_path = var("TALLYFLOW_DB_PATH")
            .unwrap_or_else(|| "data/tallyflow.db".to_string())
            .into();

        let api = match var("TALLYFLOW_API_URL") {
            None => None,
            Some(url) => {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(ConfigError::InvalidValue(
                        "TALLYFLOW_API_URL must start with http:// or https://".to_string(),
                    ));
                }
                let api_key = var("TALLYFLOW_API_KEY").ok_or_else(|| {
                    ConfigError::MissingVariable("TALLYFLOW_API_KEY".to_string())
                })?;
                Some(ApiConfig { url, api_key })
            }
        };

        let concurrency = parse_or(&var, "TALLYFLOW_CONCURRENCY", DEFAULT_CONCURRENCY)?;
        if concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "TALLYFLOW_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        let page_size = parse_or(&var, "TALLYFLOW_PAGE_SIZE", DEFAULT_PAGE_SIZE)?;
        if page_size == 0 {
            return Err(ConfigError::InvalidValue(
                "TALLYFLOW_PAGE_SIZE must be at least 1".to_string(),
            ));
        }

        let mode = match var("TALLYFLOW_UPSERT_MODE") {
            Some(raw) => raw
                .parse::<UpsertStrategy>()
                .map_err(|e| ConfigError::InvalidValue(format!("TALLYFLOW_UPSERT_MODE: {}", e)))?,
            None => UpsertStrategy::default(),
        };
        let upsert_strategy = match mode {
            UpsertStrategy::Native => UpsertStrategy::Native,
            UpsertStrategy::UpdateElseCreate {
                create_conflict_retries,
            } => UpsertStrategy::UpdateElseCreate {
                create_conflict_retries: parse_or(
                    &var,
                    "TALLYFLOW_CREATE_CONFLICT_RETRIES",
                    create_conflict_retries,
                )?,
            },
        };

        let resolutions = match var("TALLYFLOW_RESOLUTIONS") {
            Some(raw) => Resolutions::parse(&raw)
                .map_err(|e| ConfigError::InvalidValue(format!("TALLYFLOW_RESOLUTIONS: {}", e)))?,
            None => Resolutions::default(),
        };

        let rust_log = var("RUST_LOG").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            account_id,
            db_path,
            api,
            concurrency,
            page_size,
            upsert_strategy,
            resolutions,
            rust_log,
        })
    }
}

fn parse_or<T, V>(var: &V, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    V: Fn(&str) -> Option<String>,
{
    match var(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(format!("{} must be a non-negative integer, got '{}'", name, raw))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<TallyConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TallyConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("TALLYFLOW_ACCOUNT_ID", "acct-1")]).unwrap();

        assert_eq!(config.account_id, "acct-1");
        assert_eq!(config.db_path, PathBuf::from("data/tallyflow.db"));
        assert_eq!(config.api, None);
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.upsert_strategy, UpsertStrategy::default());
        assert_eq!(config.resolutions.sizes(), &[1, 5, 15, 60]);
        assert_eq!(config.rust_log, "info");
    }

    #[test]
    fn test_missing_account() {
        assert_eq!(
            load(&[]).unwrap_err(),
            ConfigError::MissingVariable("TALLYFLOW_ACCOUNT_ID".to_string())
        );
        assert!(load(&[("TALLYFLOW_ACCOUNT_ID", "  ")]).is_err());
    }

    #[test]
    fn test_api_requires_key() {
        let missing = load(&[
            ("TALLYFLOW_ACCOUNT_ID", "acct"),
            ("TALLYFLOW_API_URL", "https://api.example.com/graphql"),
        ]);
        assert_eq!(
            missing.unwrap_err(),
            ConfigError::MissingVariable("TALLYFLOW_API_KEY".to_string())
        );

        let config = load(&[
            ("TALLYFLOW_ACCOUNT_ID", "acct"),
            ("TALLYFLOW_API_URL", "https://api.example.com/graphql"),
            ("TALLYFLOW_API_KEY", "secret"),
        ])
        .unwrap();
        assert_eq!(config.api.unwrap().api_key, "secret");

        let bad_scheme = load(&[
            ("TALLYFLOW_ACCOUNT_ID", "acct"),
            ("TALLYFLOW_API_URL", "ftp://example.com"),
            ("TALLYFLOW_API_KEY", "secret"),
        ]);
        assert!(matches!(bad_scheme, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_upsert_mode_and_retries() {
        let native = load(&[
            ("TALLYFLOW_ACCOUNT_ID", "acct"),
            ("TALLYFLOW_UPSERT_MODE", "native"),
        ])
        .unwrap();
        assert_eq!(native.upsert_strategy, UpsertStrategy::Native);

        let retries = load(&[
            ("TALLYFLOW_ACCOUNT_ID", "acct"),
            ("TALLYFLOW_CREATE_CONFLICT_RETRIES", "5"),
        ])
        .unwrap();
        assert_eq!(
            retries.upsert_strategy,
            UpsertStrategy::UpdateElseCreate {
                create_conflict_retries: 5
            }
        );

        let bad = load(&[
            ("TALLYFLOW_ACCOUNT_ID", "acct"),
            ("TALLYFLOW_UPSERT_MODE", "append"),
        ]);
        assert!(matches!(bad, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_invalid_numbers() {
        for (name, value) in [
            ("TALLYFLOW_CONCURRENCY", "ten"),
            ("TALLYFLOW_CONCURRENCY", "0"),
            ("TALLYFLOW_PAGE_SIZE", "-5"),
            ("TALLYFLOW_RESOLUTIONS", "1,0"),
        ] {
            let result = load(&[("TALLYFLOW_ACCOUNT_ID", "acct"), (name, value)]);
            assert!(
                matches!(result, Err(ConfigError::InvalidValue(_))),
                "{}={} should be rejected",
                name,
                value
            );
        }
    }

    #[test]
    fn test_custom_resolutions() {
        let config = load(&[
            ("TALLYFLOW_ACCOUNT_ID", "acct"),
            ("TALLYFLOW_RESOLUTIONS", "60, 1, 5"),
        ])
        .unwrap();
        assert_eq!(config.resolutions.sizes(), &[1, 5, 60]);
    }
}
