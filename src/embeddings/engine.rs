// engine.rs — Candle sentence embedding engine.
//
// Loads a sentence-transformers model (BERT, DistilBERT or MPNet backbone) and reproduces
// its encode path: tokenize with truncation, forward pass, pooling, optional L2 normalize.

use anyhow::{anyhow, bail, Context};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use serde::Deserialize;
use tokenizers::{Tokenizer, TruncationParams};

use crate::config;
use crate::embeddings::distilbert::{Config as DistilBertConfig, DistilBertModel};
use crate::embeddings::download::{ModelFiles, Weights};
use crate::embeddings::mpnet::{Config as MPNetConfig, MPNetModel};
use crate::embeddings::pooling::{l2_normalize, Pipeline, PoolingConfig};

/// The fields of config.json needed before picking a backbone.
#[derive(Debug, Deserialize)]
struct ConfigHeader {
    model_type: Option<String>,
    hidden_size: Option<usize>,
    // DistilBERT names its hidden size `dim`.
    dim: Option<usize>,
    max_position_embeddings: Option<usize>,
    pad_token_id: Option<usize>,
}

impl ConfigHeader {
    /// Longest token sequence the position embeddings can index.
    fn position_limit(&self) -> Option<usize> {
        let positions = self.max_position_embeddings?;
        match self.model_type.as_deref() {
            // Positions start after the padding index.
            Some("mpnet") => Some(positions.saturating_sub(self.pad_token_id.unwrap_or(1) + 1)),
            _ => Some(positions),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SentenceBertConfig {
    max_seq_length: Option<usize>,
}

enum Backbone {
    Bert(BertModel),
    DistilBert(DistilBertModel),
    MPNet(MPNetModel),
}

impl Backbone {
    /// `[1, seq_len]` ids and mask in, `[1, seq_len, hidden]` out.
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> anyhow::Result<Tensor> {
        let hidden = match self {
            Self::Bert(model) => {
                let token_type_ids = input_ids.zeros_like()?;
                model.forward(input_ids, &token_type_ids, Some(attention_mask))?
            }
            Self::DistilBert(model) => model.forward(input_ids, attention_mask)?,
            Self::MPNet(model) => model.forward(input_ids, attention_mask)?,
        };
        Ok(hidden)
    }
}

/// The embedding engine holds the loaded model, tokenizer and pooling setup.
pub struct EmbeddingEngine {
    backbone: Backbone,
    tokenizer: Tokenizer,
    pooling: PoolingConfig,
    normalize: bool,
    dims: usize,
    device: Device,
}

impl EmbeddingEngine {
    /// Load the model described by `files` for CPU inference.
    pub fn load(files: &ModelFiles) -> anyhow::Result<Self> {
        let device = Device::Cpu;

        let config_str = std::fs::read_to_string(&files.config)
            .with_context(|| format!("read {}", files.config.display()))?;
        let header: ConfigHeader = serde_json::from_str(&config_str)
            .with_context(|| format!("parse {}", files.config.display()))?;
        let model_type = header
            .model_type
            .as_deref()
            .with_context(|| format!("{} has no model_type", files.config.display()))?;
        let hidden_size = header
            .hidden_size
            .or(header.dim)
            .with_context(|| format!("{} has no hidden size", files.config.display()))?;

        let vb = match &files.weights {
            Weights::Safetensors(path) => unsafe {
                VarBuilder::from_mmaped_safetensors(&[path.clone()], DType::F32, &device)
                    .with_context(|| format!("load weights from {}", path.display()))?
            },
            Weights::Pytorch(path) => VarBuilder::from_pth(path, DType::F32, &device)
                .with_context(|| format!("load weights from {}", path.display()))?,
        };

        let backbone = match model_type {
            "bert" => {
                let cfg: BertConfig = serde_json::from_str(&config_str).context("parse BERT config")?;
                Backbone::Bert(BertModel::load(vb, &cfg).context("load BERT model")?)
            }
            "distilbert" => {
                let cfg: DistilBertConfig =
                    serde_json::from_str(&config_str).context("parse DistilBERT config")?;
                Backbone::DistilBert(DistilBertModel::load(vb, &cfg).context("load DistilBERT model")?)
            }
            "mpnet" => {
                let cfg: MPNetConfig = serde_json::from_str(&config_str).context("parse MPNet config")?;
                Backbone::MPNet(MPNetModel::load(vb, &cfg).context("load MPNet model")?)
            }
            other => bail!("unsupported model_type {other:?} in {}", files.config.display()),
        };

        let max_seq_length = effective_max_seq_length(
            load_sentence_bert_config(files)?.max_seq_length,
            header.position_limit(),
        );

        let mut tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(|e| anyhow!("load tokenizer: {e}"))?;
        tokenizer.with_padding(None);
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: max_seq_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("configure tokenizer truncation: {e}"))?;

        let pipeline = Pipeline::load(files.modules.as_deref())?;
        let pooling = PoolingConfig::load(files.pooling_config.as_deref())?;
        if let Some(dim) = pooling.word_embedding_dimension {
            if dim != hidden_size {
                bail!("pooling expects {dim}-dim token embeddings, model produces {hidden_size}");
            }
        }
        let dims = hidden_size * pooling.modes().len();

        log::info!(
            "Embedding model loaded from {} (type={}, dims={}, max_seq_length={}, pooling={:?}, normalize={})",
            files.dir.display(),
            model_type,
            dims,
            max_seq_length,
            pooling.modes(),
            pipeline.normalize,
        );

        Ok(Self {
            backbone,
            tokenizer,
            pooling,
            normalize: pipeline.normalize,
            dims,
            device,
        })
    }

    /// Length of every vector this engine produces.
    pub fn dimensions(&self) -> usize {
        self.dims
    }

    /// Generate a sentence embedding for the given text.
    pub fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        // Truncation to max_seq_length is configured on the tokenizer.
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("tokenize: {e}"))?;

        let token_ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
        let attention_mask = Tensor::new(encoding.get_attention_mask(), &self.device)?.unsqueeze(0)?;

        // Forward pass → [1, seq_len, hidden_size]
        let output = self.backbone.forward(&token_ids, &attention_mask)?;

        let embedding = self.pooling.pool(&output, &attention_mask)?;
        let embedding = if self.normalize {
            l2_normalize(&embedding)?
        } else {
            embedding
        };

        let emb_vec: Vec<f32> = embedding.squeeze(0)?.to_vec1()?;
        if emb_vec.len() != self.dims {
            bail!("unexpected embedding dims: got {}, expected {}", emb_vec.len(), self.dims);
        }

        Ok(emb_vec)
    }

    /// Batch embed multiple texts. Returns one embedding per text, in order.
    pub fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        // One text at a time: no padding, so every position is a real token.
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| self.embed(t).with_context(|| format!("embed input #{i}")))
            .collect()
    }
}

/// The configured (or default) sequence length, never beyond what the model can index.
fn effective_max_seq_length(configured: Option<usize>, position_limit: Option<usize>) -> usize {
    let wanted = configured.unwrap_or(config::inference::DEFAULT_MAX_SEQ_LENGTH);
    match position_limit {
        Some(limit) if limit < wanted => {
            log::debug!("Capping max_seq_length {} to model limit {}", wanted, limit);
            limit
        }
        _ => wanted,
    }
}

fn load_sentence_bert_config(files: &ModelFiles) -> anyhow::Result<SentenceBertConfig> {
    let Some(path) = files.sentence_bert_config.as_deref() else {
        return Ok(SentenceBertConfig::default());
    };
    let raw = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}
