// IMPORTANT:
// Keep ALL constants centralized here (no hardcoded model names or numbers scattered around).

use std::path::PathBuf;

use anyhow::Context;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod models {
    pub const DEFAULT_MODEL: &str = "all-mpnet-base-v2";

    /// Every model lives under this hub organization.
    pub const HUB_ORGANIZATION: &str = "sentence-transformers";

    // External-service model ids mapped onto an equivalent local model.
    pub const MODEL_ALIASES: &[(&str, &str)] = &[("text-embedding-ada-002", "msmarco-distilbert-base-v4")];

    // The calling server interpolates a missing model id as a literal string.
    pub const PLACEHOLDER_IDS: &[&str] = &["undefined", "null"];
}

pub mod hub {
    pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
    pub const REVISION: &str = "main";

    // Weights for base-sized models are ~400 MB.
    pub const DOWNLOAD_TIMEOUT_SECS: u64 = 600;
}

pub mod files {
    pub const CONFIG: &str = "config.json";
    pub const TOKENIZER: &str = "tokenizer.json";
    pub const SAFETENSORS: &str = "model.safetensors";
    pub const PYTORCH_WEIGHTS: &str = "pytorch_model.bin";
    pub const MODULES: &str = "modules.json";
    pub const SENTENCE_BERT_CONFIG: &str = "sentence_bert_config.json";
    pub const DEFAULT_POOLING_DIR: &str = "1_Pooling";
    pub const POOLING_CONFIG: &str = "config.json";
    pub const MANIFEST: &str = "manifest.json";
}

pub mod inference {
    // Used when sentence_bert_config.json does not name a max_seq_length.
    pub const DEFAULT_MAX_SEQ_LENGTH: usize = 512;

    pub const MEAN_POOLING_MIN_TOKENS: f64 = 1e-9;
    pub const NORM_EPSILON: f64 = 1e-12;

    // MPNet relative attention bias.
    pub const RELATIVE_ATTENTION_MAX_DISTANCE: usize = 128;
    pub const ATTENTION_MASK_FILL: f64 = -10_000.0;
}

pub mod logging {
    pub const DEFAULT_LOG_SPEC: &str = "warn";
    pub const LOG_FILE_NAME: &str = "herd_embed";

    pub const LOG_ROTATE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
    pub const LOG_ROTATE_KEEP_FILES: usize = 5;
}

pub mod env {
    pub const CACHE_DIR: &str = "HERD_EMBED_CACHE_DIR";
    pub const HUB_URL: &str = "HERD_EMBED_HUB_URL";
    pub const OFFLINE: &str = "HERD_EMBED_OFFLINE";
    pub const LOG: &str = "HERD_EMBED_LOG";
    pub const LOG_DIR: &str = "HERD_EMBED_LOG_DIR";

    /// Default cache location relative to the home directory.
    pub const CACHE_DIR_REL: &str = ".cache/herd/models";
}

/// Runtime settings, read once from the environment in `main`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache_dir: PathBuf,
    pub hub_endpoint: String,
    pub offline: bool,
    pub log_spec: String,
    pub log_dir: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let cache_dir = match get(env::CACHE_DIR) {
            Some(dir) => PathBuf::from(dir),
            None => {
                let home = get("HOME")
                    .or_else(|| get("USERPROFILE"))
                    .map(PathBuf::from)
                    .with_context(|| {
                        format!("cannot determine model cache dir (set {} or HOME)", env::CACHE_DIR)
                    })?;
                home.join(env::CACHE_DIR_REL)
            }
        };

        let hub_endpoint = get(env::HUB_URL)
            .unwrap_or_else(|| hub::DEFAULT_ENDPOINT.to_string())
            .trim_end_matches('/')
            .to_string();

        let offline = get(env::OFFLINE)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            cache_dir,
            hub_endpoint,
            offline,
            log_spec: get(env::LOG).unwrap_or_else(|| logging::DEFAULT_LOG_SPEC.to_string()),
            log_dir: get(env::LOG_DIR).map(PathBuf::from),
        })
    }
}
