// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod config;
pub mod logging;
pub mod util;

pub use config::{ConfigError, ConfigFile, CONFIG_FILE_NAME};
pub use logging::{init_logging, parse_level};
pub use util::split_assignment;
