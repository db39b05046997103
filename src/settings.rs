use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// User-editable settings, persisted as JSON.
///
/// Both background loops read these on every tick, so changes made by the
/// token check or the snapshot command take effect without a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub auth_token: String,
    pub snapshot_url: String,
    pub webrtc_url: String,
    /// Last WebRTC auth key a stream was requested for.
    pub webrtc_auth_key: Option<String>,
    pub nozzle_tip_coords_x: i64,
    pub nozzle_tip_coords_y: i64,
    pub flip_h: bool,
    pub flip_v: bool,
    pub rotate: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auth_token: String::new(),
            snapshot_url: "http://localhost/webcam/?action=snapshot".to_string(),
            webrtc_url: "http://localhost/webcam/webrtc".to_string(),
            webrtc_auth_key: None,
            nozzle_tip_coords_x: 10,
            nozzle_tip_coords_y: 10,
            flip_h: false,
            flip_v: false,
            rotate: false,
        }
    }
}

/// Thread-safe settings store backed by a JSON file.
pub struct SettingsStore {
    path: PathBuf,
    inner: RwLock<Settings>,
}

impl SettingsStore {
    /// Load settings from `path`, falling back to defaults when the file is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let settings = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            serde_json::from_str(&raw).map_err(|e| ConfigError::FileReadError {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
        } else {
            debug!("No settings file at {}, using defaults", path.display());
            Settings::default()
        };

        Ok(Self {
            path,
            inner: RwLock::new(settings),
        })
    }

    /// In-memory store that never touches disk until [`save`](Self::save) is called.
    pub fn in_memory(path: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            path: path.into(),
            inner: RwLock::new(settings),
        }
    }

    /// Snapshot of the current settings.
    pub fn get(&self) -> Settings {
        self.inner.read().clone()
    }

    pub fn auth_token(&self) -> String {
        self.inner.read().auth_token.clone()
    }

    /// Apply `change` and persist the result.
    pub fn update<F>(&self, change: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut Settings),
    {
        {
            let mut settings = self.inner.write();
            change(&mut settings);
        }
        self.save()
    }

    /// Write the current settings to disk.
    pub fn save(&self) -> Result<(), ConfigError> {
        let snapshot = self.get();
        let write_err = |e: String| ConfigError::FileWriteError {
            path: self.path.display().to_string(),
            reason: e,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
        }
        let raw = serde_json::to_string_pretty(&snapshot).map_err(|e| write_err(e.to_string()))?;
        fs::write(&self.path, raw).map_err(|e| write_err(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("settings.json")).unwrap();
        assert_eq!(store.get(), Settings::default());
        assert_eq!(store.get().nozzle_tip_coords_x, 10);
    }

    #[test]
    fn test_update_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let store = SettingsStore::load(&path).unwrap();
        store
            .update(|s| {
                s.auth_token = "abc".to_string();
                s.flip_h = true;
            })
            .unwrap();

        let reloaded = SettingsStore::load(&path).unwrap();
        assert_eq!(reloaded.auth_token(), "abc");
        assert!(reloaded.get().flip_h);
        assert_eq!(reloaded.path(), path.as_path());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"auth_token":"t","rotate":true}"#).unwrap();
        let store = SettingsStore::load(&path).unwrap();
        let settings = store.get();
        assert_eq!(settings.auth_token, "t");
        assert!(settings.rotate);
        assert_eq!(settings.webrtc_url, "http://localhost/webcam/webrtc");
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();
        assert!(SettingsStore::load(&path).is_err());
    }
}
