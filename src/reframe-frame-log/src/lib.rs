// SPDX-FileCopyrightText: 2026 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Frame logging to CSV files.
//!
//! Provides [`FrameLogConfig`] for TOML configuration and [`FrameLogger`],
//! a relay listener that appends one CSV record per frame event and rotates
//! to a new file when the date in the file-name template changes.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use reframe_core::relay::controller::{FrameEvent, RelayListener};

/// Column header written at the top of every new file.
pub const CSV_HEADER: &str = "Timestamp,WallClock,Direction,Path,ID,DLC,Data";

fn default_frame_log_dir() -> String {
    if let Some(data_dir) = dirs::data_dir() {
        return data_dir
            .join("can-reframe")
            .join("frames")
            .to_string_lossy()
            .to_string();
    }
    "logs/frames".to_string()
}

/// Frame file logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameLogConfig {
    /// Whether frame logging is enabled
    pub enabled: bool,
    /// Base directory for log files
    pub dir: String,
    /// File name template; `%YYYY%`, `%MM%` and `%DD%` are replaced
    pub file: String,
}

impl Default for FrameLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_frame_log_dir(),
            file: "REFRAME-%YYYY%-%MM%-%DD%.csv".to_string(),
        }
    }
}

/// Expand the date placeholders of a file-name template.
pub fn resolve_file_name(template: &str, now: DateTime<Utc>) -> String {
    template
        .replace("%YYYY%", &now.format("%Y").to_string())
        .replace("%MM%", &now.format("%m").to_string())
        .replace("%DD%", &now.format("%d").to_string())
}

/// One CSV record, without the line terminator.
pub fn format_record(event: &FrameEvent, wall_clock: DateTime<Utc>) -> String {
    format!(
        "{}.{:03},{},{},{},{:X},{},{}",
        event.timestamp_ms / 1000,
        event.timestamp_ms % 1000,
        wall_clock.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        event.direction,
        event.path,
        event.id,
        event.dlc,
        hex::encode_upper(&event.data)
    )
}

struct FrameFileState {
    current_file_name: String,
    writer: BufWriter<File>,
}

/// Appends frame events to daily CSV files.
pub struct FrameLogger {
    base_dir: PathBuf,
    file_template: String,
    state: Mutex<FrameFileState>,
}

impl FrameLogger {
    /// Create a logger from config, or return `None` when logging is disabled.
    pub fn from_config(cfg: &FrameLogConfig) -> Result<Option<Arc<Self>>, String> {
        if !cfg.enabled {
            return Ok(None);
        }
        let base_dir = PathBuf::from(cfg.dir.trim());
        Self::open(&base_dir, &cfg.file).map(|logger| Some(Arc::new(logger)))
    }

    pub fn open(base_dir: &Path, template: &str) -> Result<Self, String> {
        create_dir_all(base_dir)
            .map_err(|e| format!("create frame log dir '{}': {}", base_dir.display(), e))?;
        let file_name = resolve_file_name(template, Utc::now());
        let writer = Self::open_writer(&base_dir.join(&file_name))?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            file_template: template.to_string(),
            state: Mutex::new(FrameFileState {
                current_file_name: file_name,
                writer,
            }),
        })
    }

    /// Path of the file currently written to.
    pub fn current_path(&self) -> Option<PathBuf> {
        let state = self.state.lock().ok()?;
        Some(self.base_dir.join(&state.current_file_name))
    }

    fn open_writer(path: &Path) -> Result<BufWriter<File>, String> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .map_err(|e| format!("create frame log dir '{}': {}", parent.display(), e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| format!("open frame log '{}': {}", path.display(), e))?;
        let empty = file
            .metadata()
            .map(|meta| meta.len() == 0)
            .map_err(|e| format!("stat frame log '{}': {}", path.display(), e))?;

        let mut writer = BufWriter::new(file);
        if empty {
            writeln!(writer, "{}", CSV_HEADER)
                .and_then(|_| writer.flush())
                .map_err(|e| format!("write frame log header '{}': {}", path.display(), e))?;
        }
        Ok(writer)
    }

    /// Append one record, rotating first if the date changed.
    pub fn write_event(&self, event: &FrameEvent) {
        let now = Utc::now();
        let Ok(mut state) = self.state.lock() else {
            warn!("frame log mutex poisoned");
            return;
        };

        let next_file_name = resolve_file_name(&self.file_template, now);
        if next_file_name != state.current_file_name {
            match Self::open_writer(&self.base_dir.join(&next_file_name)) {
                Ok(next_writer) => {
                    state.current_file_name = next_file_name;
                    state.writer = next_writer;
                }
                Err(e) => {
                    warn!("frame log rotation failed: {}", e);
                    return;
                }
            }
        }

        let record = format_record(event, now);
        if writeln!(state.writer, "{}", record).is_err() {
            warn!("frame log write failed for {}", state.current_file_name);
            return;
        }
        let _ = state.writer.flush();
    }
}

impl RelayListener for FrameLogger {
    fn on_frame(&self, event: &FrameEvent) {
        self.write_event(event);
    }
}
