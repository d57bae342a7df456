use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Mongo,
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = config::ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(StorageBackend::Mongo),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(config::ConfigError::Message(format!(
                "unknown storage backend {other:?} (expected mongo or memory)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageBackend,
    pub mongo_uri: String,
    pub mongo_database: String,
    /// Rate limiting and the sweep lease are skipped without Redis.
    pub redis_uri: Option<String>,
    pub jwt_secret: String,
    pub bind_addr: String,
    pub sweeper: SweeperConfig,
    pub timer_tick_interval_ms: u64,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Root .env first, then the local one
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // config/*.toml + APP__SECTION__KEY overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", app_env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let storage = settings
            .get_string("storage.backend")
            .or_else(|_| env::var("STORAGE_BACKEND"))
            .unwrap_or_else(|_| "mongo".to_string())
            .parse()?;

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or_else(|_| "mongodb://localhost:27017/?replicaSet=rs0".to_string());

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or_else(|_| "sentence_trainer".to_string());

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .ok()
            .filter(|uri| !uri.trim().is_empty());

        let jwt_secret = match settings
            .get_string("auth.jwt_secret")
            .or_else(|_| env::var("JWT_SECRET"))
        {
            Ok(secret) => secret,
            Err(_) if app_env == "prod" => {
                return Err(config::ConfigError::Message(
                    "JWT_SECRET must be set in production".to_string(),
                ))
            }
            Err(_) => {
                tracing::warn!("Using default JWT secret (dev mode only)");
                "dev-secret-only-for-local-testing".to_string()
            }
        };

        let bind_addr = settings
            .get_string("server.bind_addr")
            .or_else(|_| env::var("BIND_ADDR"))
            .unwrap_or_else(|_| "0.0.0.0:8081".to_string());

        let sweeper = SweeperConfig {
            enabled: settings.get_bool("sweeper.enabled").unwrap_or(true),
            interval_secs: positive(settings.get_int("sweeper.interval_secs").ok(), 60),
        };

        let timer_tick_interval_ms = positive(settings.get_int("timer.tick_interval_ms").ok(), 1000);

        Ok(Config {
            storage,
            mongo_uri,
            mongo_database,
            redis_uri,
            jwt_secret,
            bind_addr,
            sweeper,
            timer_tick_interval_ms,
        })
    }
}

fn positive(value: Option<i64>, default: u64) -> u64 {
    value
        .and_then(|v| u64::try_from(v).ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn storage_backend_parses_aliases() {
        assert_eq!("mongodb".parse::<StorageBackend>().unwrap(), StorageBackend::Mongo);
        assert_eq!(" Memory ".parse::<StorageBackend>().unwrap(), StorageBackend::Memory);
        assert!("postgres".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn non_positive_values_fall_back() {
        assert_eq!(positive(Some(0), 60), 60);
        assert_eq!(positive(Some(-5), 60), 60);
        assert_eq!(positive(None, 60), 60);
        assert_eq!(positive(Some(15), 60), 15);
    }

    #[test]
    #[serial]
    fn env_overrides_are_applied() {
        env::set_var("SKIP_ROOT_ENV", "1");
        env::set_var("APP__STORAGE__BACKEND", "memory");
        env::set_var("APP__SWEEPER__INTERVAL_SECS", "5");
        env::set_var("APP__AUTH__JWT_SECRET", "from-env");

        let config = Config::load().unwrap();
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.sweeper.interval_secs, 5);
        assert_eq!(config.jwt_secret, "from-env");
        assert_eq!(config.timer_tick_interval_ms, 1000);

        env::remove_var("APP__STORAGE__BACKEND");
        env::remove_var("APP__SWEEPER__INTERVAL_SECS");
        env::remove_var("APP__AUTH__JWT_SECRET");
        env::remove_var("SKIP_ROOT_ENV");
    }
}
