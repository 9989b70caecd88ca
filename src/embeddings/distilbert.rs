// distilbert.rs — DistilBERT encoder (msmarco-distilbert-base-v4 and friends) on candle-nn.
//
// Post-LN transformer with learned absolute positions and no token type embeddings.
// The feed-forward activation comes from config.json; "gelu" is the exact (erf) GELU.

use candle_core::{Module, Result, Tensor};
use candle_nn::{embedding, layer_norm, linear, Activation, Embedding, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;

use crate::embeddings::attention::{mask_bias, multi_head_attention};

// Fixed in the reference implementation; not part of config.json.
const LAYER_NORM_EPS: f64 = 1e-12;

fn default_activation() -> Activation {
    Activation::Gelu
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub vocab_size: usize,
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub hidden_dim: usize,
    #[serde(default = "default_activation")]
    pub activation: Activation,
    pub max_position_embeddings: usize,
}

struct Embeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    layer_norm: LayerNorm,
}

impl Embeddings {
    fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        Ok(Self {
            word_embeddings: embedding(cfg.vocab_size, cfg.dim, vb.pp("word_embeddings"))?,
            position_embeddings: embedding(cfg.max_position_embeddings, cfg.dim, vb.pp("position_embeddings"))?,
            layer_norm: layer_norm(cfg.dim, LAYER_NORM_EPS, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?.unsqueeze(0)?;

        let words = self.word_embeddings.forward(input_ids)?;
        let positions = self.position_embeddings.forward(&position_ids)?;
        self.layer_norm.forward(&words.broadcast_add(&positions)?)
    }
}

struct Layer {
    q_lin: Linear,
    k_lin: Linear,
    v_lin: Linear,
    out_lin: Linear,
    sa_layer_norm: LayerNorm,
    lin1: Linear,
    lin2: Linear,
    output_layer_norm: LayerNorm,
    activation: Activation,
    num_heads: usize,
}

impl Layer {
    fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let d = cfg.dim;
        let attention = vb.pp("attention");
        let ffn = vb.pp("ffn");
        Ok(Self {
            q_lin: linear(d, d, attention.pp("q_lin"))?,
            k_lin: linear(d, d, attention.pp("k_lin"))?,
            v_lin: linear(d, d, attention.pp("v_lin"))?,
            out_lin: linear(d, d, attention.pp("out_lin"))?,
            sa_layer_norm: layer_norm(d, LAYER_NORM_EPS, vb.pp("sa_layer_norm"))?,
            lin1: linear(d, cfg.hidden_dim, ffn.pp("lin1"))?,
            lin2: linear(cfg.hidden_dim, d, ffn.pp("lin2"))?,
            output_layer_norm: layer_norm(d, LAYER_NORM_EPS, vb.pp("output_layer_norm"))?,
            activation: cfg.activation.clone(),
            num_heads: cfg.n_heads,
        })
    }

    fn forward(&self, xs: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let context = multi_head_attention(
            &self.q_lin.forward(xs)?,
            &self.k_lin.forward(xs)?,
            &self.v_lin.forward(xs)?,
            bias,
            self.num_heads,
        )?;
        let xs = self.sa_layer_norm.forward(&(self.out_lin.forward(&context)? + xs)?)?;
        let inner = self.activation.forward(&self.lin1.forward(&xs)?)?;
        self.output_layer_norm.forward(&(self.lin2.forward(&inner)? + xs)?)
    }
}

pub struct DistilBertModel {
    embeddings: Embeddings,
    layers: Vec<Layer>,
}

impl DistilBertModel {
    pub fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        // Checkpoints saved from a task head carry a "distilbert." prefix.
        let vb = if vb.contains_tensor("embeddings.word_embeddings.weight") {
            vb
        } else {
            vb.pp("distilbert")
        };

        let embeddings = Embeddings::load(vb.pp("embeddings"), cfg)?;
        let transformer = vb.pp("transformer");
        let layers = (0..cfg.n_layers)
            .map(|i| Layer::load(transformer.pp("layer").pp(i), cfg))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { embeddings, layers })
    }

    /// `input_ids`, `attention_mask`: `[batch, seq_len]`. Returns `[batch, seq_len, dim]`.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let bias = mask_bias(attention_mask)?;
        let mut hidden = self.embeddings.forward(input_ids)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &bias)?;
        }
        Ok(hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::collections::HashMap;

    fn tiny_config() -> Config {
        serde_json::from_str(
            r#"{"vocab_size": 10, "dim": 4, "n_layers": 2, "n_heads": 2, "hidden_dim": 8,
                "activation": "gelu", "max_position_embeddings": 16, "initializer_range": 0.02,
                "model_type": "distilbert"}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_gelu_is_exact_erf() {
        let cfg = tiny_config();
        let xs = Tensor::new(&[-2f32, -0.5, 0.7, 1.5, 3.0], &Device::Cpu).unwrap();
        let got: Vec<f32> = cfg.activation.forward(&xs).unwrap().to_vec1().unwrap();
        let erf: Vec<f32> = xs.gelu_erf().unwrap().to_vec1().unwrap();
        let tanh: Vec<f32> = xs.gelu().unwrap().to_vec1().unwrap();
        assert_eq!(got, erf);
        assert_ne!(got, tanh);
    }

    #[test]
    fn test_config_without_pad_token_id() {
        let cfg = tiny_config();
        assert_eq!(cfg.dim, 4);
        assert_eq!(cfg.n_layers, 2);
    }

    #[test]
    fn test_forward_shape_with_prefixed_weights() {
        let cfg = tiny_config();
        let device = Device::Cpu;
        let d = cfg.dim;

        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        let mut put = |name: String, shape: &[usize]| {
            let t = Tensor::randn(0f32, 0.1, shape, &device).unwrap();
            tensors.insert(format!("distilbert.{name}"), t);
        };
        put("embeddings.word_embeddings.weight".into(), &[cfg.vocab_size, d]);
        put("embeddings.position_embeddings.weight".into(), &[cfg.max_position_embeddings, d]);
        put("embeddings.LayerNorm.weight".into(), &[d]);
        put("embeddings.LayerNorm.bias".into(), &[d]);
        for i in 0..cfg.n_layers {
            let p = format!("transformer.layer.{i}");
            for proj in ["q_lin", "k_lin", "v_lin", "out_lin"] {
                put(format!("{p}.attention.{proj}.weight"), &[d, d]);
                put(format!("{p}.attention.{proj}.bias"), &[d]);
            }
            for norm in ["sa_layer_norm", "output_layer_norm"] {
                put(format!("{p}.{norm}.weight"), &[d]);
                put(format!("{p}.{norm}.bias"), &[d]);
            }
            put(format!("{p}.ffn.lin1.weight"), &[cfg.hidden_dim, d]);
            put(format!("{p}.ffn.lin1.bias"), &[cfg.hidden_dim]);
            put(format!("{p}.ffn.lin2.weight"), &[d, cfg.hidden_dim]);
            put(format!("{p}.ffn.lin2.bias"), &[d]);
        }

        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let model = DistilBertModel::load(vb, &cfg).unwrap();

        let ids = Tensor::new(&[[0u32, 5, 6, 2]], &device).unwrap();
        let mask = Tensor::new(&[[1u32, 1, 1, 1]], &device).unwrap();
        let out = model.forward(&ids, &mask).unwrap();
        assert_eq!(out.dims(), &[1, 4, d]);

        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }
}
