//! Subscriber setup from the `logging` config section.

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use callbridge_core::config::LoggingConfig;

/// Filter directives: the base level followed by per-target overrides.
pub fn filter_directives(logging: &LoggingConfig, verbose: bool) -> String {
    let level = if verbose {
        "debug"
    } else {
        logging.level.as_deref().unwrap_or("info")
    };
    std::iter::once(level)
        .chain(logging.filters.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber. `RUST_LOG` wins over the config unless `verbose` is set.
pub fn init(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let directives = filter_directives(logging, verbose);
    let filter = if verbose {
        EnvFilter::new(directives)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives))
    };

    let writer = match logging.output.as_str() {
        "stdout" => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };
    let fmt_layer = match logging.format.as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .boxed(),
        _ => tracing_subscriber::fmt::layer().with_writer(writer).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives() {
        assert_eq!(filter_directives(&LoggingConfig::default(), false), "info");
    }

    #[test]
    fn test_level_and_filters() {
        let logging = LoggingConfig {
            level: Some("warn".into()),
            filters: vec!["callbridge_session=trace".into(), "hyper=off".into()],
            ..LoggingConfig::default()
        };
        assert_eq!(
            filter_directives(&logging, false),
            "warn,callbridge_session=trace,hyper=off"
        );
        assert_eq!(
            filter_directives(&logging, true),
            "debug,callbridge_session=trace,hyper=off"
        );
    }
}
