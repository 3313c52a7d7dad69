use crate::core::errors::ConfigError;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
}

/// Stage service endpoints and call limits
#[derive(Debug, Clone)]
pub struct ServicesConfig {
    pub detection_url: String,
    pub recognition_url: String,
    /// Upper bound on each individual stage call
    pub stage_timeout: Duration,
    /// Regions per recognition sub-batch
    pub recognition_chunk_size: usize,
}

/// Concept / classification model configuration
#[derive(Debug, Clone)]
pub struct ClassificationConfig {
    pub llm_api_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub roadmap_dir: PathBuf,
}

/// Which loader validates detector artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelLoaderKind {
    Probe,
    #[cfg(feature = "onnx")]
    Onnx,
}

impl FromStr for ModelLoaderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "probe" => Ok(Self::Probe),
            #[cfg(feature = "onnx")]
            "onnx" => Ok(Self::Onnx),
            other => Err(ConfigError::UnknownVariant {
                name: "MODEL_LOADER",
                value: other.to_string(),
            }),
        }
    }
}

/// Served detector model and swap policy
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub served_model_path: PathBuf,
    pub loader: ModelLoaderKind,
    pub swap_max_attempts: u32,
    pub swap_retry_delay: Duration,
    pub fetch_timeout: Duration,
}

/// Where model artifacts are fetched from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactStoreKind {
    S3,
    Local,
}

impl FromStr for ArtifactStoreKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "s3" => Ok(Self::S3),
            "local" => Ok(Self::Local),
            other => Err(ConfigError::UnknownVariant {
                name: "ARTIFACT_STORE",
                value: other.to_string(),
            }),
        }
    }
}

/// Artifact storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub kind: ArtifactStoreKind,
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub local_dir: PathBuf,
}

/// Label persistence configuration
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl PersistenceConfig {
    /// Connection parameters; values are passed through verbatim, never quoted
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.user)
            .password(&self.password);
        pg
    }
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub services: ServicesConfig,
    pub classification: ClassificationConfig,
    pub model: ModelConfig,
    pub storage: StorageConfig,
    pub persistence: PersistenceConfig,
    /// Credential for the model update routes; `None` disables them
    pub api_key: Option<String>,
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let loader = env::var("MODEL_LOADER")
            .ok()
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(ModelLoaderKind::Probe);

        let store_kind = env::var("ARTIFACT_STORE")
            .ok()
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(ArtifactStoreKind::S3);

        Ok(Self {
            server: ServerConfig {
                port: parse_env("SERVER_PORT", 8000)?,
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                log_level,
            },
            services: ServicesConfig {
                detection_url: env::var("DETECTION_SERVICE_URL")
                    .unwrap_or_else(|_| "http://localhost:8001".to_string()),
                recognition_url: env::var("RECOGNITION_SERVICE_URL")
                    .unwrap_or_else(|_| "http://localhost:8002".to_string()),
                stage_timeout: Duration::from_secs(parse_env("STAGE_TIMEOUT_SECONDS", 60)?),
                recognition_chunk_size: parse_env("RECOGNITION_CHUNK_SIZE", 8)?,
            },
            classification: ClassificationConfig {
                llm_api_url: env::var("LLM_API_URL").unwrap_or_else(|_| {
                    "https://api.openai.com/v1/chat/completions".to_string()
                }),
                llm_api_key: env::var("LLM_API_KEY")
                    .or_else(|_| env::var("OPENAI_API_KEY"))
                    .ok()
                    .filter(|k| !k.trim().is_empty()),
                llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
                roadmap_dir: env::var("ROADMAP_DIR")
                    .unwrap_or_else(|_| "roadmap".to_string())
                    .into(),
            },
            model: ModelConfig {
                served_model_path: env::var("SERVED_MODEL_PATH")
                    .unwrap_or_else(|_| "models/detector.pt".to_string())
                    .into(),
                loader,
                swap_max_attempts: parse_env("SWAP_MAX_ATTEMPTS", 3)?,
                swap_retry_delay: Duration::from_secs(parse_env("SWAP_RETRY_DELAY_SECONDS", 5)?),
                fetch_timeout: Duration::from_secs(parse_env(
                    "ARTIFACT_FETCH_TIMEOUT_SECONDS",
                    300,
                )?),
            },
            storage: StorageConfig {
                kind: store_kind,
                bucket: env::var("S3_BUCKET_NAME").unwrap_or_default(),
                region: env::var("AWS_REGION").unwrap_or_else(|_| "ap-northeast-2".to_string()),
                endpoint: env::var("S3_ENDPOINT").ok().filter(|s| !s.trim().is_empty()),
                access_key_id: env::var("AWS_ACCESS_KEY_ID").unwrap_or_default(),
                secret_access_key: env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
                local_dir: env::var("LOCAL_ARTIFACT_DIR")
                    .unwrap_or_else(|_| "artifacts".to_string())
                    .into(),
            },
            persistence: PersistenceConfig {
                enabled: parse_flag("PERSIST_RESULTS", env::var("PERSIST_RESULTS").ok(), false)?,
                host: env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: parse_env("POSTGRES_PORT", 5432)?,
                database: env::var("POSTGRES_DB").unwrap_or_default(),
                user: env::var("POSTGRES_USER").unwrap_or_default(),
                password: env::var("POSTGRES_PASSWORD").unwrap_or_default(),
            },
            api_key: env::var("API_KEY").ok().filter(|k| !k.trim().is_empty()),
        })
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("DETECTION_SERVICE_URL", &self.services.detection_url),
            ("RECOGNITION_SERVICE_URL", &self.services.recognition_url),
            ("LLM_API_URL", &self.classification.llm_api_url),
        ] {
            if !(value.starts_with("http://") || value.starts_with("https://")) {
                return Err(ConfigError::InvalidServiceUrl {
                    name,
                    value: value.clone(),
                });
            }
        }

        let positive = [
            ("STAGE_TIMEOUT_SECONDS", self.services.stage_timeout.as_secs()),
            ("RECOGNITION_CHUNK_SIZE", self.services.recognition_chunk_size as u64),
            ("SWAP_MAX_ATTEMPTS", self.model.swap_max_attempts as u64),
            ("ARTIFACT_FETCH_TIMEOUT_SECONDS", self.model.fetch_timeout.as_secs()),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::NonPositive { name, value });
            }
        }

        if self.storage.kind == ArtifactStoreKind::S3 && self.storage.bucket.trim().is_empty() {
            return Err(ConfigError::MissingBucket);
        }

        if self.model.served_model_path.file_name().is_none() {
            return Err(ConfigError::InvalidModelPath(
                self.model.served_model_path.display().to_string(),
            ));
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn stage_timeout(&self) -> Duration {
        self.services.stage_timeout
    }
}

/// Read `key`, falling back to `default` only when it is unset or blank
fn parse_env<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    parse_value(key, env::var(key).ok(), default)
}

fn parse_value<T: FromStr>(
    key: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            name: key,
            value: value.to_string(),
        }),
    }
}

fn parse_flag(key: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match raw.as_deref().map(|s| s.trim().to_lowercase()).as_deref() {
        None | Some("") => Ok(default),
        Some("true" | "1" | "yes" | "on") => Ok(true),
        Some("false" | "0" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            name: key,
            value: other.to_string(),
        }),
    }
}

#[cfg(test)]
impl Config {
    /// Configuration with defaults and no environment lookups
    pub fn for_tests() -> Self {
        Self {
            server: ServerConfig {
                port: 8000,
                host: "127.0.0.1".to_string(),
                log_level: Level::INFO,
            },
            services: ServicesConfig {
                detection_url: "http://localhost:8001".to_string(),
                recognition_url: "http://localhost:8002".to_string(),
                stage_timeout: Duration::from_secs(5),
                recognition_chunk_size: 2,
            },
            classification: ClassificationConfig {
                llm_api_url: "http://localhost:8003/v1/chat/completions".to_string(),
                llm_api_key: None,
                llm_model: "test-model".to_string(),
                roadmap_dir: "roadmap".into(),
            },
            model: ModelConfig {
                served_model_path: "models/detector.pt".into(),
                loader: ModelLoaderKind::Probe,
                swap_max_attempts: 3,
                swap_retry_delay: Duration::from_secs(5),
                fetch_timeout: Duration::from_secs(30),
            },
            storage: StorageConfig {
                kind: ArtifactStoreKind::Local,
                bucket: String::new(),
                region: "ap-northeast-2".to_string(),
                endpoint: None,
                access_key_id: String::new(),
                secret_access_key: String::new(),
                local_dir: "artifacts".into(),
            },
            persistence: PersistenceConfig {
                enabled: false,
                host: "localhost".to_string(),
                port: 5432,
                database: String::new(),
                user: String::new(),
                password: String::new(),
            },
            api_key: Some("secret".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(Config::for_tests().validate().is_ok());
    }

    #[test]
    fn test_s3_requires_bucket() {
        let mut config = Config::for_tests();
        config.storage.kind = ArtifactStoreKind::S3;
        assert!(matches!(config.validate(), Err(ConfigError::MissingBucket)));
        config.storage.bucket = "models".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = Config::for_tests();
        config.model.swap_max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonPositive { name: "SWAP_MAX_ATTEMPTS", .. })
        ));
    }

    #[test]
    fn test_bad_service_url_rejected() {
        let mut config = Config::for_tests();
        config.services.detection_url = "localhost:8001".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidServiceUrl { name: "DETECTION_SERVICE_URL", .. })
        ));
    }

    #[test]
    fn test_unparseable_numbers_fail() {
        assert_eq!(parse_value::<u32>("SWAP_MAX_ATTEMPTS", None, 3).unwrap(), 3);
        assert_eq!(parse_value::<u32>("SWAP_MAX_ATTEMPTS", Some(" ".into()), 3).unwrap(), 3);
        assert_eq!(parse_value::<u32>("SWAP_MAX_ATTEMPTS", Some(" 5 ".into()), 3).unwrap(), 5);
        assert!(matches!(
            parse_value::<u32>("SWAP_MAX_ATTEMPTS", Some("abc".into()), 3),
            Err(ConfigError::InvalidValue { name: "SWAP_MAX_ATTEMPTS", .. })
        ));
        assert!(parse_value::<u16>("POSTGRES_PORT", Some("70000".into()), 5432).is_err());
    }

    #[test]
    fn test_persist_flag_spellings() {
        for on in ["true", "1", "yes", "ON"] {
            assert!(parse_flag("PERSIST_RESULTS", Some(on.into()), false).unwrap(), "{}", on);
        }
        for off in ["false", "0", "no", "off"] {
            assert!(!parse_flag("PERSIST_RESULTS", Some(off.into()), true).unwrap(), "{}", off);
        }
        assert!(!parse_flag("PERSIST_RESULTS", None, false).unwrap());
        assert!(matches!(
            parse_flag("PERSIST_RESULTS", Some("enabled".into()), false),
            Err(ConfigError::InvalidValue { name: "PERSIST_RESULTS", .. })
        ));
    }

    #[test]
    fn test_pg_config_keeps_special_characters() {
        let mut persistence = Config::for_tests().persistence;
        persistence.database = "labels db".to_string();
        persistence.user = "o'brien".to_string();
        persistence.password = "p a'ss=word".to_string();

        let pg = persistence.pg_config();
        assert_eq!(pg.get_dbname(), Some("labels db"));
        assert_eq!(pg.get_user(), Some("o'brien"));
        assert_eq!(pg.get_password(), Some(&b"p a'ss=word"[..]));
        assert_eq!(pg.get_ports(), &[5432]);
    }

    #[test]
    fn test_store_kind_parsing() {
        assert_eq!("S3".parse::<ArtifactStoreKind>().unwrap(), ArtifactStoreKind::S3);
        assert_eq!(" local ".parse::<ArtifactStoreKind>().unwrap(), ArtifactStoreKind::Local);
        assert!("gcs".parse::<ArtifactStoreKind>().is_err());
    }
}
