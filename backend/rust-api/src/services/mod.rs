use crate::config::{Config, StorageBackend};
use anyhow::Context;
use mongodb::{Client as MongoClient, Database};
use redis::aio::ConnectionManager;
use std::sync::Arc;

use completion_service::{CompletionService, OpenAiCompletionService};
use playground_session::PlaygroundSessions;
use reconciler::SessionReconciler;
use submission_store::{InMemorySubmissionStore, MongoSubmissionStore, SubmissionStore};
use submit_lock::{LocalSubmitLocks, RedisSubmitLocks, SubmitLocks};

pub struct AppState {
    pub config: Config,
    pub reconciler: SessionReconciler,
    pub sessions: PlaygroundSessions,
    pub mongo: Option<Database>,
    pub redis: Option<ConnectionManager>,
}

impl AppState {
    /// Wires the configured backends. `memory` storage runs without MongoDB
    /// or Redis and is only suitable for a single instance.
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let completions: Arc<dyn CompletionService> = Arc::new(
            OpenAiCompletionService::new(&config.completion)
                .context("Failed to build completion client")?,
        );

        match config.storage {
            StorageBackend::Mongo => {
                let mongo_client = MongoClient::with_uri_str(&config.mongo_uri)
                    .await
                    .context("Failed to create MongoDB client")?;
                let mongo = mongo_client.database(&config.mongo_database);
                tracing::info!("Connected to MongoDB database {}", config.mongo_database);

                let store = MongoSubmissionStore::new(mongo.clone());
                store.ensure_indexes().await?;

                let redis = connect_redis(&config.redis_uri).await?;
                let locks: Arc<dyn SubmitLocks> = Arc::new(RedisSubmitLocks::new(redis.clone()));

                Ok(Self {
                    reconciler: SessionReconciler::new(Arc::new(store), completions, locks),
                    sessions: PlaygroundSessions::new(),
                    mongo: Some(mongo),
                    redis: Some(redis),
                    config,
                })
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory submission store; records are lost on restart");
                Ok(Self::from_parts(
                    config,
                    Arc::new(InMemorySubmissionStore::new()),
                    completions,
                    Arc::new(LocalSubmitLocks::default()),
                ))
            }
        }
    }

    pub fn from_parts(
        config: Config,
        store: Arc<dyn SubmissionStore>,
        completions: Arc<dyn CompletionService>,
        locks: Arc<dyn SubmitLocks>,
    ) -> Self {
        Self {
            config,
            reconciler: SessionReconciler::new(store, completions, locks),
            sessions: PlaygroundSessions::new(),
            mongo: None,
            redis: None,
        }
    }
}

async fn connect_redis(uri: &str) -> anyhow::Result<ConnectionManager> {
    let redis_client = redis::Client::open(uri).context("Invalid Redis URI")?;

    tracing::info!("Attempting to connect to Redis...");

    let redis = tokio::time::timeout(
        std::time::Duration::from_secs(30),
        ConnectionManager::new(redis_client),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

    tracing::info!("Redis ConnectionManager created, testing with PING...");

    let mut conn = redis.clone();
    tokio::time::timeout(
        std::time::Duration::from_secs(5),
        redis::cmd("PING").query_async::<String>(&mut conn),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

    tracing::info!("Redis connection established successfully");
    Ok(redis)
}

pub mod completion_service;
pub mod playground_session;
pub mod reconciler;
pub mod submission_store;
pub mod submit_lock;
