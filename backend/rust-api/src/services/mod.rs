use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use redis::aio::ConnectionManager;

use crate::config::{Config, StorageBackend};
use crate::store::{InMemoryStore, MongoStore, ProgressStore};

pub mod answer_checker;
pub mod assignment_service;
pub mod expiry_sweeper;
pub mod progress_service;

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn ProgressStore>,
    pub redis: Option<ConnectionManager>,
}

impl AppState {
    /// Connects the configured store and, if configured, Redis.
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn ProgressStore> = match config.storage {
            StorageBackend::Mongo => {
                let client = mongodb::Client::with_uri_str(&config.mongo_uri)
                    .await
                    .context("Failed to connect to MongoDB")?;
                let store = MongoStore::new(client.database(&config.mongo_database));
                store.ensure_indexes().await?;
                tracing::info!("MongoDB connected");
                Arc::new(store)
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage; data is lost on restart");
                Arc::new(InMemoryStore::new())
            }
        };

        let redis = match &config.redis_uri {
            Some(uri) => Some(connect_redis(uri).await?),
            None => {
                tracing::warn!("Redis not configured; rate limiting and sweep lease disabled");
                None
            }
        };

        Ok(Self::with_store(config, store, redis))
    }

    pub fn with_store(
        config: Config,
        store: Arc<dyn ProgressStore>,
        redis: Option<ConnectionManager>,
    ) -> Self {
        Self {
            config,
            store,
            redis,
        }
    }

    pub fn progress_service(&self) -> progress_service::ProgressService {
        progress_service::ProgressService::new(self.store.clone())
    }

    pub fn assignment_service(&self) -> assignment_service::AssignmentService {
        assignment_service::AssignmentService::new(self.store.clone())
    }
}

async fn connect_redis(uri: &str) -> anyhow::Result<ConnectionManager> {
    let client = redis::Client::open(uri).context("Failed to create Redis client")?;

    tracing::info!("Attempting to connect to Redis...");
    let redis = tokio::time::timeout(Duration::from_secs(30), ConnectionManager::new(client))
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

    let mut conn = redis.clone();
    tokio::time::timeout(
        Duration::from_secs(5),
        redis::cmd("PING").query_async::<String>(&mut conn),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

    tracing::info!("Redis connection established successfully");
    Ok(redis)
}
