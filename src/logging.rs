//! Logger bootstrap.
//!
//! stdout carries the request/response protocol, so diagnostics go to stderr
//! unless `log.dir` selects size-rotated files.

use crate::config::LogConfig;
use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming, WriteMode};
use log::info;

const LOG_FILE_BASENAME: &str = "academyd";
const MAX_LOG_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
const MAX_LOG_FILES: usize = 5;

/// Starts the global logger. The returned handle must stay alive for the
/// lifetime of the process so buffered file output is flushed.
pub fn init(config: &LogConfig) -> anyhow::Result<LoggerHandle> {
    let level = config.level.to_ascii_lowercase();
    let logger = Logger::try_with_str(&level)?;

    let handle = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            logger
                .log_to_file(
                    FileSpec::default()
                        .directory(dir.as_path())
                        .basename(LOG_FILE_BASENAME),
                )
                .rotate(
                    Criterion::Size(MAX_LOG_FILE_SIZE_BYTES),
                    Naming::Numbers,
                    Cleanup::KeepLogFiles(MAX_LOG_FILES),
                )
                .write_mode(WriteMode::BufferAndFlush)
                .append()
                .format_for_files(flexi_logger::detailed_format)
                .start()?
        }
        None => logger
            .log_to_stderr()
            .format_for_stderr(flexi_logger::detailed_format)
            .start()?,
    };

    info!(
        "event=app_start module=core status=ok version={} level={} sink={}",
        env!("CARGO_PKG_VERSION"),
        level,
        config
            .dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "stderr".to_string())
    );

    Ok(handle)
}
