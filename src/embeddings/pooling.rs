// pooling.rs — Sentence-transformers pooling and normalization.
//
// Reads the module chain (modules.json) and pooling config (1_Pooling/config.json) that
// sentence-transformers ships next to the transformer weights, and reduces per-token
// hidden states to one sentence vector.

use std::path::Path;

use anyhow::{bail, Context};
use candle_core::{DType, Tensor};
use serde::Deserialize;

use crate::config;

const TRANSFORMER_MODULE: &str = "sentence_transformers.models.Transformer";
const POOLING_MODULE: &str = "sentence_transformers.models.Pooling";
const NORMALIZE_MODULE: &str = "sentence_transformers.models.Normalize";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolingMode {
    Cls,
    Max,
    Mean,
    MeanSqrtLen,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PoolingConfig {
    #[serde(default)]
    pub word_embedding_dimension: Option<usize>,
    #[serde(default)]
    pub pooling_mode_cls_token: bool,
    #[serde(default)]
    pub pooling_mode_mean_tokens: bool,
    #[serde(default)]
    pub pooling_mode_max_tokens: bool,
    #[serde(default)]
    pub pooling_mode_mean_sqrt_len_tokens: bool,
    #[serde(default)]
    pub pooling_mode_weightedmean_tokens: bool,
    #[serde(default)]
    pub pooling_mode_lasttoken: bool,
}

impl Default for PoolingConfig {
    fn default() -> Self {
        Self {
            word_embedding_dimension: None,
            pooling_mode_cls_token: false,
            pooling_mode_mean_tokens: true,
            pooling_mode_max_tokens: false,
            pooling_mode_mean_sqrt_len_tokens: false,
            pooling_mode_weightedmean_tokens: false,
            pooling_mode_lasttoken: false,
        }
    }
}

impl PoolingConfig {
    /// Load from a pooling config file; a model without one gets mean pooling.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            log::info!("No pooling config, using mean pooling");
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parse {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let cfg: Self = serde_json::from_str(raw)?;
        if cfg.pooling_mode_weightedmean_tokens {
            bail!("unsupported pooling mode: weightedmean_tokens");
        }
        if cfg.pooling_mode_lasttoken {
            bail!("unsupported pooling mode: lasttoken");
        }
        if cfg.modes().is_empty() {
            bail!("pooling config enables no pooling mode");
        }
        Ok(cfg)
    }

    /// Enabled modes, in the order their outputs are concatenated.
    pub fn modes(&self) -> Vec<PoolingMode> {
        [
            (self.pooling_mode_cls_token, PoolingMode::Cls),
            (self.pooling_mode_max_tokens, PoolingMode::Max),
            (self.pooling_mode_mean_tokens, PoolingMode::Mean),
            (self.pooling_mode_mean_sqrt_len_tokens, PoolingMode::MeanSqrtLen),
        ]
        .into_iter()
        .filter_map(|(enabled, mode)| enabled.then_some(mode))
        .collect()
    }

    /// Pool hidden states `[batch, seq_len, hidden]` with attention mask `[batch, seq_len]`
    /// into `[batch, hidden * modes]`.
    pub fn pool(&self, hidden: &Tensor, attention_mask: &Tensor) -> anyhow::Result<Tensor> {
        let mask = attention_mask
            .to_dtype(DType::F32)?
            .unsqueeze(2)?
            .broadcast_as(hidden.shape())?
            .contiguous()?;

        let mut parts = Vec::with_capacity(4);
        for mode in self.modes() {
            let pooled = match mode {
                PoolingMode::Cls => hidden.narrow(1, 0, 1)?.squeeze(1)?,
                PoolingMode::Max => {
                    // Masked positions are pushed far below any real activation.
                    let fill = mask.affine(1e9, -1e9)?;
                    (hidden + fill)?.max(1)?
                }
                PoolingMode::Mean => {
                    let (sum, count) = masked_sum(hidden, &mask)?;
                    (sum / count)?
                }
                PoolingMode::MeanSqrtLen => {
                    let (sum, count) = masked_sum(hidden, &mask)?;
                    (sum / count.sqrt()?)?
                }
            };
            parts.push(pooled);
        }

        if parts.len() == 1 {
            return Ok(parts.remove(0));
        }
        Ok(Tensor::cat(&parts, 1)?)
    }
}

/// Sum of unmasked hidden states and the (clamped) number of unmasked tokens.
fn masked_sum(hidden: &Tensor, mask: &Tensor) -> anyhow::Result<(Tensor, Tensor)> {
    let sum = (hidden * mask)?.sum(1)?;
    let count = mask
        .sum(1)?
        .clamp(config::inference::MEAN_POOLING_MIN_TOKENS, f64::MAX)?;
    Ok((sum, count))
}

/// L2 normalize a tensor along the last dimension.
pub fn l2_normalize(tensor: &Tensor) -> anyhow::Result<Tensor> {
    let norm = tensor.sqr()?.sum_keepdim(1)?.sqrt()?;
    let norm = norm.clamp(config::inference::NORM_EPSILON, f64::MAX)?;
    Ok(tensor.broadcast_div(&norm)?)
}

#[derive(Debug, Deserialize)]
struct ModuleEntry {
    #[serde(default)]
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

/// The sentence-transformers module chain after the transformer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    /// Directory (relative to the model dir) holding the pooling config.
    pub pooling_dir: Option<String>,
    pub normalize: bool,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            pooling_dir: Some(config::files::DEFAULT_POOLING_DIR.to_string()),
            normalize: false,
        }
    }
}

impl Pipeline {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parse {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let modules: Vec<ModuleEntry> = serde_json::from_str(raw)?;
        let mut pipeline = Self {
            pooling_dir: None,
            normalize: false,
        };
        for module in modules {
            match module.kind.as_str() {
                TRANSFORMER_MODULE => {}
                POOLING_MODULE => pipeline.pooling_dir = Some(module.path),
                NORMALIZE_MODULE => pipeline.normalize = true,
                other => bail!("unsupported sentence-transformers module: {other}"),
            }
        }
        Ok(pipeline)
    }
}
