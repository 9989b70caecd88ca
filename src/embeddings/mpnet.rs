// mpnet.rs — MPNet encoder (all-mpnet-base-v2 and friends) on candle-nn.
//
// BERT-shaped encoder without token type embeddings. Every layer shares one learned
// relative position bias, bucketed T5-style, that is added to the attention scores.

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{embedding, layer_norm, linear, Activation, Embedding, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;

use crate::config;
use crate::embeddings::attention::{mask_bias, multi_head_attention};

fn default_hidden_act() -> Activation {
    Activation::Gelu
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

fn default_relative_attention_num_buckets() -> usize {
    32
}

fn default_pad_token_id() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: Activation,
    pub max_position_embeddings: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_relative_attention_num_buckets")]
    pub relative_attention_num_buckets: usize,
    #[serde(default = "default_pad_token_id")]
    pub pad_token_id: u32,
}

/// Position ids for one sequence: padding keeps `padding_idx`, real tokens count up from
/// `padding_idx + 1`.
pub fn position_ids(input_ids: &[u32], padding_idx: u32) -> Vec<u32> {
    let mut next = padding_idx;
    input_ids
        .iter()
        .map(|&id| {
            if id == padding_idx {
                padding_idx
            } else {
                next += 1;
                next
            }
        })
        .collect()
}

/// Bidirectional relative position bucket for `memory - context` distance.
///
/// Half the buckets cover keys after the query. Within each half, small distances get
/// exact buckets and larger ones share log-spaced buckets up to `max_distance`.
pub fn relative_position_bucket(relative_position: i64, num_buckets: usize, max_distance: usize) -> u32 {
    let half = (num_buckets / 2) as i64;
    let n = -relative_position;
    let base = if n < 0 { half } else { 0 };
    let n = n.abs();

    let max_exact = half / 2;
    let offset = if n < max_exact {
        n
    } else {
        // Bucket boundaries must match training, which computed this in f32.
        let scaled = ((n as f32) / (max_exact as f32)).ln() / ((max_distance as f32) / (max_exact as f32)).ln()
            * ((half - max_exact) as f32);
        (max_exact + scaled as i64).min(half - 1)
    };

    (base + offset) as u32
}

/// Row-major `[seq_len, seq_len]` bucket ids; row = query position, column = key position.
fn relative_position_buckets(seq_len: usize, num_buckets: usize) -> Vec<u32> {
    let max_distance = config::inference::RELATIVE_ATTENTION_MAX_DISTANCE;
    (0..seq_len)
        .flat_map(|context| {
            (0..seq_len).map(move |memory| {
                relative_position_bucket(memory as i64 - context as i64, num_buckets, max_distance)
            })
        })
        .collect()
}

struct Embeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    layer_norm: LayerNorm,
    padding_idx: u32,
}

impl Embeddings {
    fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        Ok(Self {
            word_embeddings: embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("word_embeddings"))?,
            position_embeddings: embedding(cfg.max_position_embeddings, cfg.hidden_size, vb.pp("position_embeddings"))?,
            layer_norm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
            padding_idx: cfg.pad_token_id,
        })
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq_len) = input_ids.dims2()?;
        let rows: Vec<Vec<u32>> = input_ids.to_dtype(DType::U32)?.to_vec2()?;
        let positions: Vec<u32> = rows.iter().flat_map(|row| position_ids(row, self.padding_idx)).collect();
        let position_ids = Tensor::from_vec(positions, (batch, seq_len), input_ids.device())?;

        let words = self.word_embeddings.forward(input_ids)?;
        let positions = self.position_embeddings.forward(&position_ids)?;
        self.layer_norm.forward(&(words + positions)?)
    }
}

struct SelfAttention {
    q: Linear,
    k: Linear,
    v: Linear,
    o: Linear,
    num_heads: usize,
}

impl SelfAttention {
    fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let h = cfg.hidden_size;
        Ok(Self {
            q: linear(h, h, vb.pp("q"))?,
            k: linear(h, h, vb.pp("k"))?,
            v: linear(h, h, vb.pp("v"))?,
            o: linear(h, h, vb.pp("o"))?,
            num_heads: cfg.num_attention_heads,
        })
    }

    /// `attention_bias` is `[batch, heads, seq_len, seq_len]` (position bias + mask).
    fn forward(&self, xs: &Tensor, attention_bias: &Tensor) -> Result<Tensor> {
        let context = multi_head_attention(
            &self.q.forward(xs)?,
            &self.k.forward(xs)?,
            &self.v.forward(xs)?,
            attention_bias,
            self.num_heads,
        )?;
        self.o.forward(&context)
    }
}

struct Layer {
    attention: SelfAttention,
    attention_norm: LayerNorm,
    intermediate: Linear,
    output: Linear,
    output_norm: LayerNorm,
    activation: Activation,
}

impl Layer {
    fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let h = cfg.hidden_size;
        Ok(Self {
            attention: SelfAttention::load(vb.pp("attention").pp("attn"), cfg)?,
            attention_norm: layer_norm(h, cfg.layer_norm_eps, vb.pp("attention").pp("LayerNorm"))?,
            intermediate: linear(h, cfg.intermediate_size, vb.pp("intermediate").pp("dense"))?,
            output: linear(cfg.intermediate_size, h, vb.pp("output").pp("dense"))?,
            output_norm: layer_norm(h, cfg.layer_norm_eps, vb.pp("output").pp("LayerNorm"))?,
            activation: cfg.hidden_act.clone(),
        })
    }

    fn forward(&self, xs: &Tensor, attention_bias: &Tensor) -> Result<Tensor> {
        let attended = self.attention.forward(xs, attention_bias)?;
        let xs = self.attention_norm.forward(&(attended + xs)?)?;
        let inner = self.activation.forward(&self.intermediate.forward(&xs)?)?;
        self.output_norm.forward(&(self.output.forward(&inner)? + xs)?)
    }
}

pub struct MPNetModel {
    embeddings: Embeddings,
    layers: Vec<Layer>,
    relative_attention_bias: Embedding,
    num_buckets: usize,
    device: Device,
}

impl MPNetModel {
    pub fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        // Checkpoints saved from a task head carry an "mpnet." prefix.
        let vb = if vb.contains_tensor("embeddings.word_embeddings.weight") {
            vb
        } else {
            vb.pp("mpnet")
        };

        let embeddings = Embeddings::load(vb.pp("embeddings"), cfg)?;
        let encoder = vb.pp("encoder");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| Layer::load(encoder.pp("layer").pp(i), cfg))
            .collect::<Result<Vec<_>>>()?;
        let relative_attention_bias = embedding(
            cfg.relative_attention_num_buckets,
            cfg.num_attention_heads,
            encoder.pp("relative_attention_bias"),
        )?;

        Ok(Self {
            embeddings,
            layers,
            relative_attention_bias,
            num_buckets: cfg.relative_attention_num_buckets,
            device: vb.device().clone(),
        })
    }

    /// `input_ids`, `attention_mask`: `[batch, seq_len]`. Returns `[batch, seq_len, hidden]`.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;

        let position_bias = self.position_bias(seq_len)?;
        let attention_bias = position_bias.broadcast_add(&mask_bias(attention_mask)?)?;

        let mut hidden = self.embeddings.forward(input_ids)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &attention_bias)?;
        }
        Ok(hidden)
    }

    /// `[1, heads, seq_len, seq_len]`
    fn position_bias(&self, seq_len: usize) -> Result<Tensor> {
        let buckets = relative_position_buckets(seq_len, self.num_buckets);
        let buckets = Tensor::from_vec(buckets, (seq_len, seq_len), &self.device)?;
        self.relative_attention_bias
            .forward(&buckets)?
            .permute((2, 0, 1))?
            .unsqueeze(0)?
            .contiguous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_position_ids_skip_padding() {
        assert_eq!(position_ids(&[0, 42, 7, 2], 1), vec![2, 3, 4, 5]);
        assert_eq!(position_ids(&[0, 42, 2, 1, 1], 1), vec![2, 3, 4, 1, 1]);
    }

    #[test]
    fn test_relative_position_bucket_known_values() {
        let bucket = |rel| relative_position_bucket(rel, 32, 128);
        assert_eq!(bucket(0), 0);
        assert_eq!(bucket(-1), 1);
        assert_eq!(bucket(1), 17);
        assert_eq!(bucket(-8), 8);
        assert_eq!(bucket(-50), 13);
        assert_eq!(bucket(50), 29);
        assert_eq!(bucket(-200), 15);
        assert_eq!(bucket(200), 31);
    }

    #[test]
    fn test_relative_position_buckets_layout() {
        let buckets = relative_position_buckets(3, 32);
        assert_eq!(buckets, vec![0, 17, 18, 1, 0, 17, 2, 1, 0]);
    }

    fn tiny_config() -> Config {
        serde_json::from_str(
            r#"{"vocab_size": 10, "hidden_size": 4, "num_hidden_layers": 2, "num_attention_heads": 2,
                "intermediate_size": 8, "hidden_act": "gelu", "max_position_embeddings": 16,
                "layer_norm_eps": 1e-5, "relative_attention_num_buckets": 32, "pad_token_id": 1}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{"vocab_size": 30527, "hidden_size": 768, "num_hidden_layers": 12, "num_attention_heads": 12,
                "intermediate_size": 3072, "max_position_embeddings": 514}"#,
        )
        .unwrap();
        assert_eq!(cfg.pad_token_id, 1);
        assert_eq!(cfg.relative_attention_num_buckets, 32);
        assert_eq!(cfg.layer_norm_eps, 1e-5);
    }

    #[test]
    fn test_forward_shape_with_prefixed_weights() {
        let cfg = tiny_config();
        let device = Device::Cpu;
        let h = cfg.hidden_size;

        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        let mut put = |name: String, shape: &[usize], value: f64| {
            let t = (Tensor::ones(shape, DType::F32, &device).unwrap() * value).unwrap();
            tensors.insert(format!("mpnet.{name}"), t);
        };
        put("embeddings.word_embeddings.weight".into(), &[cfg.vocab_size, h], 0.1);
        put("embeddings.position_embeddings.weight".into(), &[cfg.max_position_embeddings, h], 0.01);
        put("embeddings.LayerNorm.weight".into(), &[h], 1.0);
        put("embeddings.LayerNorm.bias".into(), &[h], 0.0);
        put("encoder.relative_attention_bias.weight".into(), &[32, cfg.num_attention_heads], 0.0);
        for i in 0..cfg.num_hidden_layers {
            let p = format!("encoder.layer.{i}");
            for proj in ["q", "k", "v", "o"] {
                put(format!("{p}.attention.attn.{proj}.weight"), &[h, h], 0.05);
                put(format!("{p}.attention.attn.{proj}.bias"), &[h], 0.0);
            }
            put(format!("{p}.attention.LayerNorm.weight"), &[h], 1.0);
            put(format!("{p}.attention.LayerNorm.bias"), &[h], 0.0);
            put(format!("{p}.intermediate.dense.weight"), &[cfg.intermediate_size, h], 0.05);
            put(format!("{p}.intermediate.dense.bias"), &[cfg.intermediate_size], 0.0);
            put(format!("{p}.output.dense.weight"), &[h, cfg.intermediate_size], 0.05);
            put(format!("{p}.output.dense.bias"), &[h], 0.0);
            put(format!("{p}.output.LayerNorm.weight"), &[h], 1.0);
            put(format!("{p}.output.LayerNorm.bias"), &[h], 0.0);
        }

        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let model = MPNetModel::load(vb, &cfg).unwrap();

        let ids = Tensor::new(&[[0u32, 5, 6, 2]], &device).unwrap();
        let mask = Tensor::new(&[[1u32, 1, 1, 1]], &device).unwrap();
        let out = model.forward(&ids, &mask).unwrap();
        assert_eq!(out.dims(), &[1, 4, h]);

        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }
}
