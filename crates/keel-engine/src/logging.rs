use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

impl LoggingConfig {
    fn normalized_level(&self) -> String {
        let trimmed = self.level.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" => "info".to_owned(),
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            // Anything else is an `EnvFilter` directive string.
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(self.normalized_level())
            .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::INFO.into()))
    }

    /// The effective filter: the configured level, with `RUST_LOG` merged in
    /// when it is set.
    pub fn env_filter(&self) -> EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());
        match env_directives {
            Some(env_directives) => {
                let combined = format!("{},{env_directives}", self.normalized_level());
                EnvFilter::try_new(combined)
                    .or_else(|_| EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

/// Installs a global `tracing` subscriber writing to stderr.
///
/// Best-effort: if a subscriber is already installed (by the embedding
/// build tool, or an earlier call) this does nothing.
pub fn init_tracing(config: &LoggingConfig) {
    if !config.stderr {
        return;
    }
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.env_filter())
        .with_writer(std::io::stderr)
        .with_ansi(false);
    let installed = if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };
    if installed {
        tracing::debug!(target = "keel.engine", level = %config.level, json = config.json, "tracing initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(level: &str) -> LoggingConfig {
        LoggingConfig {
            level: level.to_owned(),
            ..LoggingConfig::default()
        }
    }

    #[test]
    fn levels_are_forgiving() {
        assert_eq!(config("WARNING").normalized_level(), "warn");
        assert_eq!(config("  Debug ").normalized_level(), "debug");
        assert_eq!(config("").normalized_level(), "info");
        assert_eq!(
            config("keel.cache=trace,info").normalized_level(),
            "keel.cache=trace,info"
        );
    }

    #[test]
    fn invalid_directives_fall_back_to_info() {
        let filter = config("keel=loud").config_env_filter();
        assert!(filter.to_string().contains("info"));
    }

    #[test]
    fn repeated_initialization_is_harmless() {
        let config = LoggingConfig {
            stderr: true,
            ..config("error")
        };
        init_tracing(&config);
        init_tracing(&config);
    }
}
