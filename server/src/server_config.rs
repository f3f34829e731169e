use config::Config;
use lazy_static::lazy_static;
use serde::Deserialize;
use std::{env, path::Path};

#[derive(Debug, Clone, Deserialize)]
pub struct PromptLimits {
    pub rate_limit_per_sec: usize,
    pub refill_interval_ms: usize,
    pub refill_amount: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Filled from `ANTHROPIC_API_KEY`; empty means the AI surface reports
    /// itself unconfigured and analysis routes answer 503.
    #[serde(default)]
    pub key: String,
    pub endpoint: String,
    pub version: String,
    pub prompt_limits: PromptLimits,
}

impl ApiConfig {
    pub fn is_configured(&self) -> bool {
        !self.key.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelPrice {
    pub id: String,
    /// USD per million input tokens.
    pub input_per_mtok: f64,
    /// USD per million output tokens.
    pub output_per_mtok: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub quick_id: String,
    pub deep_id: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Quick-pass priority above which an email gets the deep pass.
    pub priority_threshold: i32,
    pub analysis_version: String,
    pub prices: Vec<ModelPrice>,
}

impl ModelConfig {
    pub fn price_for(&self, model_id: &str) -> Option<&ModelPrice> {
        self.prices.iter().find(|p| p.id == model_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    pub batch_concurrency: usize,
    pub max_batch_emails: usize,
    pub claim_batch_size: u64,
    pub prompt_body_max_chars: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub body_ttl_secs: i64,
    pub prefetch_pause_ms: u64,
    pub response_fresh_hours: i64,
    pub response_expiry_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    pub quota_per_second: usize,
    pub mark_read_chunk_size: usize,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    api: ApiConfig,
    model: ModelConfig,
    analysis: AnalysisConfig,
    cache: CacheConfig,
    graph: GraphConfig,
}

#[derive(Debug)]
pub struct ServerConfig {
    pub api: ApiConfig,
    pub model: ModelConfig,
    pub analysis: AnalysisConfig,
    pub cache: CacheConfig,
    pub graph: GraphConfig,
}

impl std::fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Server Config:\nAPI configured: {}\nEndpoint: {}\nModels: quick={} deep={}\nAnalysis: {:?}\nCache: {:?}\nGraph: {:?}",
            self.api.is_configured(),
            self.api.endpoint,
            self.model.quick_id,
            self.model.deep_id,
            self.analysis,
            self.cache,
            self.graph,
        )
    }
}

lazy_static! {
    pub static ref cfg: ServerConfig = {
        let root = env::var("APP_DIR").unwrap_or_else(|_| {
            let dir =
                env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR or APP_DIR is required");
            let dir = Path::new(&dir).parent().unwrap().display().to_string();
            format!("{}/config", dir)
        });
        let path = format!("{root}/config.toml");
        let cfg_file: ConfigFile = Config::builder()
            .add_source(config::File::with_name(&path))
            .build()
            .expect("config.toml is required")
            .try_deserialize()
            .expect("config.toml is invalid");

        let ConfigFile {
            mut api,
            model,
            analysis,
            cache,
            graph,
        } = cfg_file;

        if let Ok(key) = env::var("ANTHROPIC_API_KEY") {
            api.key = key;
        }

        ServerConfig {
            api,
            model,
            analysis,
            cache,
            graph,
        }
    };
}
