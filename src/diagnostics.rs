//! Diagnostics: leveled logging and filter self-description
//!
//! Info messages go through `log::info!` and only show under `--verbose`.
//! Warnings always show; they are also kept on a `Diagnostics` ledger so a
//! run can report (and tests can check) exactly what was lossy. Fatal
//! conditions are `RunGenError`s, printed by the CLI before exiting.

use std::fmt::Write as _;
use std::io::Write as _;

use log::LevelFilter;

use crate::filter::{ArgumentKind, FilterMetadata};

/// Warnings raised during one run.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: Vec<String>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log a warning and keep it on the ledger.
    pub fn warn(&mut self, message: String) {
        log::warn!(target: WARNING_TARGET, "{}", message);
        self.warnings.push(message);
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

/// Log target of `Diagnostics` warnings. It stays enabled at `Warn` whatever
/// `RUST_LOG` says.
pub const WARNING_TARGET: &str = "hlx_rungen::warning";

/// Logger configuration for `init_logging`, with `filters` in `RUST_LOG`
/// syntax.
pub fn logger_builder(verbose: bool, filters: Option<&str>) -> env_logger::Builder {
    let default_level = if verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(default_level);
    if let Some(filters) = filters {
        builder.parse_filters(filters);
    }
    builder
        .filter_module(WARNING_TARGET, LevelFilter::Warn)
        .target(env_logger::Target::Stderr)
        .format(|buf, record| match record.level() {
            log::Level::Warn => writeln!(buf, "Warning: {}", record.args()),
            log::Level::Error => writeln!(buf, "Error: {}", record.args()),
            _ => writeln!(buf, "{}", record.args()),
        });
    builder
}

/// Install the stderr logger.
///
/// `verbose` raises the default level from `Warn` to `Info`; `RUST_LOG`
/// overrides either, except that run warnings always show. Calling this
/// more than once is harmless.
pub fn init_logging(verbose: bool) {
    let filters = std::env::var("RUST_LOG").ok();
    let _ = logger_builder(verbose, filters.as_deref()).try_init();
}

/// Render the `--describe` listing of a filter's arguments.
pub fn describe(metadata: &FilterMetadata) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Filter name: \"{}\"", metadata.name);
    for arg in &metadata.arguments {
        let direction = if arg.kind.is_input() { "Input" } else { "Output" };
        let _ = match arg.kind {
            ArgumentKind::InputScalar => writeln!(
                out,
                "  {} \"{}\" is of type {}",
                direction, arg.name, arg.type_tag
            ),
            ArgumentKind::InputBuffer | ArgumentKind::OutputBuffer => writeln!(
                out,
                "  {} \"{}\" is of type Buffer<{}> with {} dimensions",
                direction, arg.name, arg.type_tag, arg.dimensions
            ),
        };
    }
    out
}
