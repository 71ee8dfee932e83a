//! Tracing subscriber setup shared by both binaries

use clap::ValueEnum;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Log level selectable on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

impl LogLevel {
    /// Apply `-v` repetitions on top of the configured level
    pub fn with_verbosity(self, verbose_count: u8) -> Self {
        match verbose_count {
            0 => self,
            1 => LogLevel::Verbose,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Default `EnvFilter` directive for this level
    pub fn filter(self) -> &'static str {
        match self {
            LogLevel::Error => "audio_router=error",
            LogLevel::Warn => "audio_router=warn",
            LogLevel::Info => "audio_router=info",
            LogLevel::Verbose => "audio_router=debug,bluer=info",
            LogLevel::Debug => "audio_router=debug,bluer=debug",
            LogLevel::Trace => "audio_router=trace,bluer=debug",
        }
    }
}

/// Initialize logging; `RUST_LOG` takes precedence over the CLI level
pub fn init_logging(level: LogLevel, verbose_count: u8) {
    let filter = level.with_verbosity(verbose_count).filter();

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    // Workers run under systemd or the supervisor, both of which timestamp
    // and collect stderr
    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_overrides_level() {
        assert_eq!(LogLevel::Warn.with_verbosity(0), LogLevel::Warn);
        assert_eq!(LogLevel::Warn.with_verbosity(1), LogLevel::Verbose);
        assert_eq!(LogLevel::Error.with_verbosity(2), LogLevel::Debug);
        assert_eq!(LogLevel::Info.with_verbosity(9), LogLevel::Trace);
        assert_eq!(LogLevel::Info.filter(), "audio_router=info");
    }
}
