//! Tracing setup for the QBridge crates.

use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::BridgeError;

/// Targets that get the configured level when `RUST_LOG` is unset.
const TARGETS: [&str; 4] = [
    "qbridge_common",
    "qbridge_protocol",
    "qbridge_idb",
    "qbridge_engine",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact single-line text.
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Route output through the libtest capture.
    pub test_writer: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Text,
            test_writer: false,
        }
    }
}

impl LogConfig {
    /// Debug-level text output captured per test.
    pub fn test() -> Self {
        Self {
            level: Level::DEBUG,
            test_writer: true,
            ..Default::default()
        }
    }

    fn directives(&self) -> String {
        let level = self.level.as_str().to_ascii_lowercase();
        TARGETS
            .iter()
            .map(|target| format!("{}={}", target, level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: LogConfig) -> Result<(), BridgeError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directives()));

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match (config.format, config.test_writer) {
        (LogFormat::Json, _) => fmt::layer().json().boxed(),
        (LogFormat::Text, true) => fmt::layer().compact().with_test_writer().boxed(),
        (LogFormat::Text, false) => fmt::layer().compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|e| BridgeError::Config(format!("logging already initialized: {}", e)))
}
