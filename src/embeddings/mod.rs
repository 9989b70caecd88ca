// embeddings/ — Local sentence embedding engine using candle (pure Rust).
//
// Provides:
// - Model id resolution (default model, aliases)
// - Model download + local cache with manifest
// - BERT / DistilBERT / MPNet inference with sentence-transformers pooling

pub mod attention;
pub mod distilbert;
pub mod download;
pub mod engine;
pub mod mpnet;
pub mod pooling;
pub mod resolve;
