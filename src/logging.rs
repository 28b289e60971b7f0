/*
 * linpama - Package transaction engine for Arch Linux front ends.
 * Copyright (C) 2025  linpama contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Diagnostic logging with tracing.
//!
//! Child-process output is not routed through here; it goes to the
//! transaction log buffer. This is the engine's own diagnostics channel.

use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize logging at `warn`, overridable through `RUST_LOG`
pub fn init() {
    init_with_level("warn")
}

/// Initialize logging with a specific level
pub fn init_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .compact(),
        )
        .init();
}

/// Initialize logging with optional file output
pub fn init_with_file(level: &str, log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr).compact())
                .with(file_layer)
                .init();

            return;
        }
    }

    init_with_level(level);
}

/// Initialize from the `[logging]` section, letting the command line raise verbosity
pub fn init_from_config(config: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.level.as_str() };
    init_with_file(level, config.file.as_deref());
}

/// Span covering one supervised transaction
#[macro_export]
macro_rules! span_transaction {
    ($kind:expr, $package:expr) => {
        tracing::info_span!("transaction", kind = %$kind, package = %$package)
    };
}

/// Span covering one aggregated search
#[macro_export]
macro_rules! span_search {
    ($id:expr, $query:expr) => {
        tracing::debug_span!("search", id = $id, query = %$query)
    };
}
