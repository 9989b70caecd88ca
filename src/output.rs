use std::io::{self, Write};

use anyhow::Context;
use serde::Serialize;
use serde_json::ser::Formatter;

/// Widen the engine's f32 vectors into plain nested f64 lists.
///
/// Values print the way a float32 does once converted to a native double,
/// e.g. 0.1f32 serializes as `0.10000000149011612`.
pub fn to_nested_lists(embeddings: &[Vec<f32>]) -> Vec<Vec<f64>> {
    embeddings
        .iter()
        .map(|v| v.iter().map(|&x| f64::from(x)).collect())
        .collect()
}

/// Serialize embeddings as a JSON array of arrays, laid out like Python's `json.dumps`.
pub fn to_json(embeddings: &[Vec<f32>]) -> anyhow::Result<String> {
    let lists = to_nested_lists(embeddings);
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
    lists.serialize(&mut ser).context("failed serializing embeddings")?;
    String::from_utf8(buf).context("serialized embeddings are not UTF-8")
}

/// Write the JSON text with no trailing newline.
pub fn write_output(out: &mut dyn Write, json: &str) -> anyhow::Result<()> {
    out.write_all(json.as_bytes()).context("failed writing output")?;
    out.flush().context("failed flushing stdout")?;
    Ok(())
}

/// Compact formatter that separates elements with `", "`.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }
}
