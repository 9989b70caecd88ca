// resolve.rs — Model identifier resolution.
//
// Applies the default model and the alias table, and maps a model name onto its hub repo.

use crate::config::models;

/// Resolve the model name to load from an optional CLI model id.
///
/// Missing, empty, and placeholder ids fall back to `DEFAULT_MODEL`; aliased ids are
/// substituted; anything else is used verbatim.
pub fn resolve_model_name(model_id: Option<&str>) -> &str {
    let id = match model_id.map(str::trim) {
        Some(id) if !id.is_empty() && !models::PLACEHOLDER_IDS.contains(&id) => id,
        _ => return models::DEFAULT_MODEL,
    };

    models::MODEL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == id)
        .map(|(_, target)| *target)
        .unwrap_or(id)
}

/// Hub repository id for a resolved model name.
pub fn hub_repo_id(model_name: &str) -> String {
    format!("{}/{}", models::HUB_ORGANIZATION, model_name)
}
