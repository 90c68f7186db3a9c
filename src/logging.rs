//! Logger setup
//!
//! env_logger does the formatting and filtering; records on the
//! `displaced` target additionally pass through the runtime switch in
//! [`crate::displaced::set_debug`].

use log::{LevelFilter, Log, Metadata, Record};

use crate::displaced::{self, LOG_TARGET};

/// env_logger with the `displaced` target gated by a runtime switch.
pub struct DisplacedGate {
    inner: env_logger::Logger,
}

impl DisplacedGate {
    pub fn new(inner: env_logger::Logger) -> Self {
        Self { inner }
    }
}

impl Log for DisplacedGate {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if metadata.target() == LOG_TARGET && !displaced::debug_enabled() {
            return false;
        }
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.inner.log(record);
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Default filter for a `-v` count.
pub fn default_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the global logger.
///
/// `RUST_LOG` overrides the verbosity-derived default. The `displaced`
/// target is always let through env_logger at debug level or finer, so that
/// it can be switched on later without reinstalling the logger.
pub fn init(verbosity: u8, debug_displaced: bool) -> Result<(), log::SetLoggerError> {
    let directive = std::env::var("RUST_LOG")
        .ok()
        .as_deref()
        .and_then(displaced_directive);
    let displaced_level = directive.map_or(LevelFilter::Debug, |level| level.max(LevelFilter::Debug));

    let logger = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter(verbosity)),
    )
    .filter_module(LOG_TARGET, displaced_level)
    .build();

    let max_level = logger.filter().max(displaced_level);
    let env_wants_displaced = directive.is_some_and(|level| level != LevelFilter::Off);
    displaced::set_debug(debug_displaced || env_wants_displaced);

    log::set_boxed_logger(Box::new(DisplacedGate::new(logger)))?;
    log::set_max_level(max_level);
    Ok(())
}

/// Level a `displaced[=level]` directive in a `RUST_LOG` value asks for.
fn displaced_directive(rust_log: &str) -> Option<LevelFilter> {
    rust_log
        .split('/')
        .next()
        .unwrap_or_default()
        .split(',')
        .filter_map(|directive| {
            let (name, level) = match directive.trim().split_once('=') {
                Some((name, level)) => (name, Some(level)),
                None => (directive.trim(), None),
            };
            (name == LOG_TARGET).then(|| {
                level
                    .and_then(|level| level.trim().parse().ok())
                    .unwrap_or(LevelFilter::Trace)
            })
        })
        .last()
}
