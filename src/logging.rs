use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn rotation(config: &AppConfig) -> Rotation {
    match config.rotation.as_str() {
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}

/// `EnvFilter` directives: the global level, then each per-module override
pub fn filter_directives(config: &AppConfig) -> String {
    let mut directives = vec![config.log_level.clone()];
    for (target, level) in &config.log_targets {
        directives.push(format!("{}={}", target, level));
    }
    directives.join(",")
}

/// Install the global subscriber; keep the guard alive to flush the file writer.
///
/// `RUST_LOG` replaces the configured directives when set.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let file_appender = RollingFileAppender::new(rotation(config), &config.log_dir, &config.log_file);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        // Targets only in the file, where coordinator, journal and pool lines interleave
        let file_layer = fmt::layer()
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(targets: &[(&str, &str)]) -> AppConfig {
        let mut config = AppConfig::load_env("dev").unwrap();
        config.log_level = "info".to_string();
        config.log_targets = targets
            .iter()
            .map(|(t, l)| (t.to_string(), l.to_string()))
            .collect();
        config
    }

    #[test]
    fn test_filter_directives() {
        assert_eq!(filter_directives(&config(&[])), "info");
        assert_eq!(
            filter_directives(&config(&[
                ("xa_coordinator::resource::pool", "warn"),
                ("xa_coordinator::journal", "debug"),
            ])),
            "info,xa_coordinator::journal=debug,xa_coordinator::resource::pool=warn"
        );
    }

    #[test]
    fn test_dev_targets_are_crate_modules() {
        let dev = AppConfig::load_env("dev").unwrap();
        assert!(!dev.log_targets.is_empty());
        assert!(dev.log_targets.contains_key("xa_coordinator::journal"));
        assert!(dev.log_targets.keys().all(|t| t.starts_with("xa_coordinator::")));
        assert!(EnvFilter::try_new(filter_directives(&dev)).is_ok());
    }
}
