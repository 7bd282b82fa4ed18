// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Parse a configured level name (`trace` .. `error`, any case).
pub fn parse_level(name: &str) -> Option<Level> {
    name.trim().parse::<Level>().ok()
}

/// Install the global subscriber. Falls back to INFO when the level is
/// missing or unknown. A second call leaves the first subscriber in place.
pub fn init_logging(log_level: Option<&str>) {
    let level = log_level.and_then(parse_level).unwrap_or(Level::INFO);

    let installed = FmtSubscriber::builder()
        .with_target(false)
        .with_max_level(level)
        .try_init();
    if installed.is_err() {
        tracing::debug!("Logging already initialized");
    }
}
