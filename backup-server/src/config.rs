use backup_engine::config::DEFAULT_BLOCK_SIZE;
use backup_engine::EngineConfig;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub log_level: String,
    pub block_size: usize,
    /// Cron expression (with seconds) of the plan due-ness tick
    pub scheduler_cron: String,
    /// Cron expression (with seconds) of the scrub run
    pub scrub_cron: String,
    pub scrub_sample_ratio: f64,
    pub max_concurrent_tasks: usize,
    /// Optional engine TOML file; overrides the env-derived engine settings
    pub engine_config: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup; missing or unparsable values fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "/var/lib/infra-core".into()));

        Self {
            port: get("PORT").and_then(|v| v.parse().ok()).unwrap_or(3000),
            db_path: data_dir.join("infra-core.db"),
            data_dir,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            block_size: get("BLOCK_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BLOCK_SIZE),
            scheduler_cron: get("SCHEDULER_CRON").unwrap_or_else(|| "0 * * * * *".into()),
            scrub_cron: get("SCRUB_CRON").unwrap_or_else(|| "0 30 3 * * *".into()),
            scrub_sample_ratio: get("SCRUB_SAMPLE_RATIO")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.1),
            max_concurrent_tasks: get("MAX_CONCURRENT_TASKS")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(4),
            engine_config: get("ENGINE_CONFIG").map(PathBuf::from),
        }
    }

    /// Engine settings: the TOML file when one is configured, otherwise
    /// store and manifests under `data_dir`.
    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        if let Some(path) = &self.engine_config {
            return Ok(EngineConfig::from_file(path)?);
        }
        let mut config = EngineConfig::with_data_dir(&self.data_dir);
        config.store.block_size = self.block_size;
        config.scrub.sample_ratio = self.scrub_sample_ratio;
        config.log.level = self.log_level.clone();
        Ok(config)
    }
}
