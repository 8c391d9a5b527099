use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogSettings;
use crate::errors::SyncError;

/// Filter directives: `RUST_LOG` when set, otherwise `LOG_LEVEL` with the
/// HTTP stack kept at warn.
pub fn filter_directives(level: &str) -> String {
    format!("{},reqwest=warn,hyper=warn,hyper_util=warn", level.to_ascii_lowercase())
}

/// Logs to stdout and, when `LOG_FILE` is set, appends the same lines
/// without colours to that file.
pub fn init(settings: &LogSettings) -> Result<(), SyncError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directives(&settings.level)))
        .map_err(|e| SyncError::Config(format!("LOG_LEVEL={:?}: {}", settings.level, e)))?;

    let file_layer = match &settings.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()
        .map_err(|e| SyncError::Config(format!("logging already initialised: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_crates_are_capped() {
        let directives = filter_directives("DEBUG");
        assert!(directives.starts_with("debug,"));
        assert!(directives.contains("reqwest=warn"));
        assert!(EnvFilter::try_new(directives).is_ok());
    }
}
