use anyhow::Context;
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};

use crate::config::{self, Settings};

/// Start the logger. Stdout carries the JSON result, so logs go to stderr, or to a
/// rotating file with warnings duplicated to stderr when a log dir is configured.
///
/// The returned handle must stay alive until the process exits.
pub fn init_logging(settings: &Settings) -> anyhow::Result<LoggerHandle> {
    let logger = Logger::try_with_str(&settings.log_spec)
        .with_context(|| format!("invalid log spec {:?}", settings.log_spec))?
        .format(flexi_logger::detailed_format);

    let logger = match &settings.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("failed creating log dir {}", dir.display()))?;
            logger
                .log_to_file(FileSpec::default().directory(dir).basename(config::logging::LOG_FILE_NAME))
                .rotate(
                    Criterion::Size(config::logging::LOG_ROTATE_SIZE_BYTES),
                    Naming::Numbers,
                    Cleanup::KeepLogFiles(config::logging::LOG_ROTATE_KEEP_FILES),
                )
                .duplicate_to_stderr(Duplicate::Warn)
        }
        None => logger.log_to_stderr(),
    };

    let handle = logger.start().context("failed to start logger")?;

    log::info!("herd-embed {} starting (platform: {})", config::VERSION, std::env::consts::OS);
    log::debug!("Settings: {:?}", settings);

    Ok(handle)
}
