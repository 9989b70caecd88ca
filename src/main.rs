mod config;
mod embeddings;
mod input;
mod logging;
mod output;

use std::io::stdout;
use std::path::PathBuf;

use anyhow::bail;

use crate::embeddings::download::ensure_model_files;
use crate::embeddings::engine::EmbeddingEngine;
use crate::embeddings::resolve::resolve_model_name;

const USAGE: &str = "usage: embed <input_path> [model_id]";

fn main() {
    if let Err(e) = real_main() {
        eprintln!("[herd-embed] fatal error: {e:?}");
        log::error!("Fatal error: {:?}", e);
        std::process::exit(1);
    }
}

fn real_main() -> anyhow::Result<()> {
    let settings = config::Settings::from_env()?;
    let _logger = logging::init_logging(&settings)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = parse_args(&args)?;

    let model_name = resolve_model_name(invocation.model_id.as_deref());
    log::info!(
        "Model id {:?} resolved to {}",
        invocation.model_id.as_deref().unwrap_or(""),
        model_name
    );

    // Bad input fails before the (slow) model load, and nothing is printed until encode succeeds.
    let texts = input::read_input(&invocation.input_path)?;

    let files = ensure_model_files(&settings, model_name)?;
    let engine = EmbeddingEngine::load(&files)?;

    let embeddings = engine.embed_batch(&texts)?;
    log::info!("Embedded {} texts ({} dims)", embeddings.len(), engine.dimensions());

    let json = output::to_json(&embeddings)?;
    output::write_output(&mut stdout(), &json)
}

#[derive(Debug, PartialEq, Eq)]
struct Invocation {
    input_path: PathBuf,
    model_id: Option<String>,
}

fn parse_args(args: &[String]) -> anyhow::Result<Invocation> {
    let (input_path, model_id) = match args {
        [input] => (input, None),
        [input, model] => (input, Some(model.clone())),
        _ => bail!("{USAGE}"),
    };
    Ok(Invocation {
        input_path: PathBuf::from(input_path),
        model_id,
    })
}
