use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Mongo,
    Memory,
}

impl StorageBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mongo" | "mongodb" => Some(Self::Mongo),
            "memory" | "in-memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub mongo_database: String,
    pub redis_uri: String,
    pub jwt_secret: String,
    pub bind_addr: String,
    pub storage: StorageBackend,
    pub completion: CompletionConfig,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Root .env (two levels up) first, local .env as fallback
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // config/{env}.toml, overridden by APP__SECTION__KEY variables
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", app_env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let storage = match settings
            .get_string("storage.backend")
            .or_else(|_| env::var("STORAGE_BACKEND"))
        {
            Ok(raw) => StorageBackend::parse(&raw).ok_or_else(|| {
                config::ConfigError::Message(format!("unknown storage backend '{}'", raw))
            })?,
            Err(_) => StorageBackend::Mongo,
        };

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .or_else(|_| mongo_uri_from_parts())
            .or_else(|err| match storage {
                StorageBackend::Memory => Ok(String::new()),
                StorageBackend::Mongo => Err(err),
            })?;

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or_else(|_| "codeplayground".to_string());

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .unwrap_or_else(|_| {
                let host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
                let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
                match env::var("REDIS_PASSWORD") {
                    Ok(password) => format!("redis://:{}@{}:{}/0", password, host, port),
                    Err(_) => format!("redis://{}:{}/0", host, port),
                }
            });

        let jwt_secret = match settings
            .get_string("auth.jwt_secret")
            .or_else(|_| env::var("JWT_SECRET"))
        {
            Ok(secret) => secret,
            Err(_) if app_env == "prod" => {
                return Err(config::ConfigError::Message(
                    "JWT_SECRET must be set in production".to_string(),
                ));
            }
            Err(_) => {
                eprintln!("WARNING: Using default JWT_SECRET (dev mode only!)");
                "dev-secret-only-for-local-testing".to_string()
            }
        };

        let bind_addr = settings
            .get_string("server.bind_addr")
            .or_else(|_| env::var("BIND_ADDR"))
            .unwrap_or_else(|_| "0.0.0.0:8081".to_string());

        let completion = CompletionConfig {
            api_url: settings
                .get_string("completion.api_url")
                .or_else(|_| env::var("COMPLETION_API_URL"))
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key: settings
                .get_string("completion.api_key")
                .or_else(|_| env::var("OPENAI_API_KEY"))
                .map_err(|_| {
                    config::ConfigError::Message(
                        "OPENAI_API_KEY (or completion.api_key) must be set".to_string(),
                    )
                })?,
            model: settings
                .get_string("completion.model")
                .or_else(|_| env::var("COMPLETION_MODEL"))
                .unwrap_or_else(|_| "gpt-3.5-turbo".to_string()),
            timeout_secs: settings
                .get_int("completion.timeout_secs")
                .ok()
                .and_then(|v| u64::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(60),
        };

        Ok(Config {
            mongo_uri,
            mongo_database,
            redis_uri,
            jwt_secret,
            bind_addr,
            storage,
            completion,
        })
    }
}

fn mongo_uri_from_parts() -> Result<String, config::ConfigError> {
    let user = env::var("MONGO_USER")
        .map_err(|_| config::ConfigError::Message("MONGO_URI or MONGO_USER must be set".into()))?;
    let password = env::var("MONGO_PASSWORD")
        .map_err(|_| config::ConfigError::Message("MONGO_PASSWORD must be set".into()))?;
    let db = env::var("MONGO_DB").unwrap_or_else(|_| "codeplayground".to_string());
    eprintln!("WARNING: Building MongoDB URI from MONGO_USER/MONGO_PASSWORD env vars");
    Ok(format!(
        "mongodb://{}:{}@localhost:27017/{}?authSource=admin",
        user, password, db
    ))
}
