use std::path::Path;

use anyhow::Context;

/// Read the input file: a UTF-8 JSON array of strings.
pub fn read_input(path: &Path) -> anyhow::Result<Vec<String>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read input file {}", path.display()))?;
    let texts = parse_input(&raw).with_context(|| format!("invalid input in {}", path.display()))?;
    log::info!("Read {} input texts from {}", texts.len(), path.display());
    Ok(texts)
}

pub fn parse_input(raw: &str) -> anyhow::Result<Vec<String>> {
    serde_json::from_str(raw).context("input is not a JSON array of strings")
}
