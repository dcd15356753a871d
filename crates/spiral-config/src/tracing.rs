// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();
static CHROME_GUARD: OnceLock<Mutex<Option<tracing_chrome::FlushGuard>>> = OnceLock::new();

/// Filter used when neither `RUST_LOG` nor `SPIRAL_LOG` is set.
pub const DEFAULT_DIRECTIVES: &str = "info";

/// Installs the global subscriber: an env filter, a formatted stdout layer and,
/// when `SPIRAL_TRACE_CHROME` names a file, a Chrome trace layer.
pub fn init_tracing() -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stdout().is_terminal());
    let registry = Registry::default().with(env_filter()?).with(fmt_layer);

    match chrome_trace_path()? {
        Some(path) => {
            let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
                .file(path)
                .include_args(true)
                .build();
            let cell = CHROME_GUARD.get_or_init(|| Mutex::new(None));
            if let Ok(mut slot) = cell.lock() {
                *slot = Some(guard);
            }
            registry
                .with(chrome_layer)
                .try_init()
                .map_err(|err| InitError::Install(err.to_string()))
        }
        None => registry
            .try_init()
            .map_err(|err| InitError::Install(err.to_string())),
    }
}

/// Flushes and drops the Chrome trace writer, if one was installed.
pub fn flush_chrome_trace() {
    if let Some(cell) = CHROME_GUARD.get() {
        if let Ok(mut slot) = cell.lock() {
            slot.take();
        }
    }
}

fn env_filter() -> Result<EnvFilter, InitError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    match read_var("SPIRAL_LOG")? {
        Some(directives) => EnvFilter::try_new(&directives).map_err(|err| InitError::Filter {
            directives,
            message: err.to_string(),
        }),
        None => Ok(EnvFilter::new(DEFAULT_DIRECTIVES)),
    }
}

fn chrome_trace_path() -> Result<Option<PathBuf>, InitError> {
    Ok(read_var("SPIRAL_TRACE_CHROME")?.map(PathBuf::from))
}

fn read_var(key: &'static str) -> Result<Option<String>, InitError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => Ok(Some(raw)),
        Ok(_) | Err(std::env::VarError::NotPresent) => Ok(None),
        Err(source) => Err(InitError::Env { key, source }),
    }
}

/// Errors emitted when configuring the tracing subscriber.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    #[error("failed to read {key}: {source}")]
    Env {
        key: &'static str,
        source: std::env::VarError,
    },
    #[error("invalid log directives '{directives}': {message}")]
    Filter { directives: String, message: String },
    #[error("failed to install subscriber: {0}")]
    Install(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_env::with_env;

    #[test]
    fn blank_chrome_path_is_ignored() {
        with_env(&[("SPIRAL_TRACE_CHROME", Some("  "))], || {
            assert!(chrome_trace_path().unwrap().is_none());
        });
    }

    #[test]
    fn spiral_log_feeds_the_filter() {
        with_env(
            &[("RUST_LOG", None), ("SPIRAL_LOG", Some("st_curvature=debug"))],
            || {
                let filter = env_filter().unwrap();
                assert!(filter.to_string().contains("st_curvature=debug"));
            },
        );
    }

    #[test]
    fn malformed_directives_are_reported() {
        with_env(
            &[("RUST_LOG", None), ("SPIRAL_LOG", Some("st_curvature=loud"))],
            || {
                let err = env_filter().unwrap_err();
                assert!(matches!(err, InitError::Filter { .. }));
            },
        );
    }
}
