// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Shared configuration-file loading.
//!
//! Every binary reads its own `[<section>]` table out of a common
//! `can-reframe.toml`, so one file can configure several tools.

use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name looked up in each search directory.
pub const CONFIG_FILE_NAME: &str = "can-reframe.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config file {0}: {1}")]
    ParseError(PathBuf, String),

    #[error("Config file {0} has no [{1}] section")]
    MissingSection(PathBuf, String),
}

/// Default search paths: current directory, then the user config
/// directory, then `/etc`.
pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("can-reframe").join(CONFIG_FILE_NAME));
    }
    paths.push(PathBuf::from("/etc/can-reframe").join(CONFIG_FILE_NAME));
    paths
}

/// Deserialize the `key` table of a TOML document.
///
/// `Ok(None)` means the document parsed but has no such table. `origin` is
/// only used in error messages.
fn parse_section<T: DeserializeOwned>(
    content: &str,
    key: &str,
    origin: &Path,
) -> Result<Option<T>, ConfigError> {
    let mut table: toml::Table = toml::from_str(content)
        .map_err(|e| ConfigError::ParseError(origin.to_path_buf(), e.to_string()))?;

    let Some(section) = table.remove(key) else {
        return Ok(None);
    };

    section
        .try_into::<T>()
        .map(Some)
        .map_err(|e| ConfigError::ParseError(origin.to_path_buf(), e.to_string()))
}

fn read_section<T: DeserializeOwned>(path: &Path, key: &str) -> Result<Option<T>, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;
    parse_section(&content, key, path)
}

/// Trait for configuration types stored as a section of `can-reframe.toml`.
pub trait ConfigFile: Sized + Default + DeserializeOwned {
    /// Section key, e.g. `"reframe-server"`.
    fn section_key() -> &'static str;

    /// Parse the section out of TOML text.
    fn load_from_str(content: &str) -> Result<Self, ConfigError> {
        let origin = Path::new("<inline>");
        parse_section::<Self>(content, Self::section_key(), origin)?.ok_or_else(|| {
            ConfigError::MissingSection(origin.to_path_buf(), Self::section_key().to_string())
        })
    }

    /// Load the section from a specific file. The section must be present.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        read_section::<Self>(path, Self::section_key())?.ok_or_else(|| {
            ConfigError::MissingSection(path.to_path_buf(), Self::section_key().to_string())
        })
    }

    /// Load the first default-path file that carries the section.
    ///
    /// Returns `(Default::default(), None)` when none does.
    fn load_from_default_paths() -> Result<(Self, Option<PathBuf>), ConfigError> {
        Self::load_from_paths(&config_search_paths())
    }

    /// Like [`ConfigFile::load_from_default_paths`] with explicit candidates.
    fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Option<PathBuf>), ConfigError> {
        for path in paths {
            if path.exists() {
                if let Some(cfg) = read_section::<Self>(path, Self::section_key())? {
                    return Ok((cfg, Some(path.clone())));
                }
            }
        }
        Ok((Self::default(), None))
    }

    /// Use `explicit` when given, otherwise search the default paths.
    fn resolve(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        match explicit {
            Some(path) => Ok((Self::load_from_file(path)?, Some(path.to_path_buf()))),
            None => Self::load_from_default_paths(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        name: String,
        count: u32,
    }

    impl ConfigFile for Sample {
        fn section_key() -> &'static str {
            "sample"
        }
    }

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_from_str_applies_defaults() {
        let cfg = Sample::load_from_str("[sample]\nname = \"relay\"\n").unwrap();
        assert_eq!(cfg.name, "relay");
        assert_eq!(cfg.count, 0);
    }

    #[test]
    fn test_missing_section_is_error() {
        let err = Sample::load_from_str("[other]\nname = \"x\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection(_, _)));
    }

    #[test]
    fn test_parse_error_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "bad.toml", "[sample\nname = ");
        match Sample::load_from_file(&path) {
            Err(ConfigError::ParseError(p, _)) => assert_eq!(p, path),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_load_from_paths_skips_files_without_section() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_file(dir.path(), "a.toml", "[other]\ncount = 1\n");
        let second = write_file(dir.path(), "b.toml", "[sample]\ncount = 7\n");
        let missing = dir.path().join("missing.toml");

        let (cfg, found) = Sample::load_from_paths(&[missing, first, second.clone()]).unwrap();
        assert_eq!(cfg.count, 7);
        assert_eq!(found, Some(second));
    }

    #[test]
    fn test_load_from_paths_defaults_when_nothing_found() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, found) = Sample::load_from_paths(&[dir.path().join("none.toml")]).unwrap();
        assert_eq!(cfg, Sample::default());
        assert!(found.is_none());
    }

    #[test]
    fn test_search_paths_end_in_etc() {
        let paths = config_search_paths();
        assert_eq!(paths[0], PathBuf::from(CONFIG_FILE_NAME));
        assert_eq!(
            paths.last().unwrap(),
            &PathBuf::from("/etc/can-reframe/can-reframe.toml")
        );
    }
}
