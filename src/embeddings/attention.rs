// attention.rs — Scaled dot-product attention shared by the local encoders.

use candle_core::{Result, Tensor};

/// Multi-head attention over already projected `q`, `k`, `v` (`[batch, seq_len, hidden]`).
///
/// `bias` is added to the raw scores and must broadcast to `[batch, heads, seq_len, seq_len]`.
/// Returns `[batch, seq_len, hidden]`, before the output projection.
pub fn multi_head_attention(q: &Tensor, k: &Tensor, v: &Tensor, bias: &Tensor, num_heads: usize) -> Result<Tensor> {
    let (b, s, hidden) = q.dims3()?;
    let head_dim = hidden / num_heads;
    let split_heads =
        |t: &Tensor| -> Result<Tensor> { t.reshape((b, s, num_heads, head_dim))?.transpose(1, 2)?.contiguous() };

    let q = split_heads(q)?;
    let k = split_heads(k)?;
    let v = split_heads(v)?;

    let scores = (q.matmul(&k.t()?.contiguous()?)? / (head_dim as f64).sqrt())?;
    let scores = scores.broadcast_add(bias)?;
    let probs = candle_nn::ops::softmax_last_dim(&scores)?;

    probs.matmul(&v)?.transpose(1, 2)?.reshape((b, s, hidden))
}

/// Additive mask bias `[batch, 1, 1, seq_len]` from a `[batch, seq_len]` attention mask.
pub fn mask_bias(attention_mask: &Tensor) -> Result<Tensor> {
    // (1 - mask) * fill
    let fill = crate::config::inference::ATTENTION_MASK_FILL;
    attention_mask
        .to_dtype(candle_core::DType::F32)?
        .affine(-fill, fill)?
        .unsqueeze(1)?
        .unsqueeze(1)
}
