/// Milliseconds since the unix epoch, as carried in diagnostic payloads.
pub fn timestamp_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub mod logging {
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    /// Replaces the filter derived from `--log-level` when set.
    pub const LOG_FILTER_VAR: &str = "VOICE_ROOM_LOG_FILTER";

    /// Targets that get the requested verbosity; everything else stays at
    /// `info` so websocket and TLS internals do not flood signaling traces.
    const CLIENT_TARGETS: &[&str] = &["voice_room_core", "voice_room", "signaling"];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to install subscriber: {0}")]
        Install(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }
        let filter = std::env::var(LOG_FILTER_VAR)
            .map(EnvFilter::new)
            .unwrap_or_else(|_| EnvFilter::new(directives(config.level)));

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.level >= LogLevel::Debug)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Install(err.to_string()))?;
        let _ = GUARD.set(guard);
        Ok(())
    }

    fn directives(level: LogLevel) -> String {
        let verbose = match level {
            LogLevel::Error => return "error".into(),
            LogLevel::Warn => return "warn".into(),
            LogLevel::Info => return "info".into(),
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        CLIENT_TARGETS
            .iter()
            .fold(String::from("info"), |mut filter, target| {
                filter.push_str(&format!(",{target}={verbose}"));
                filter
            })
    }

}
