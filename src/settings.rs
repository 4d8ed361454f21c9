//! Settings store.
//!
//! A small JSON key-value file (`settings.json`) holding hotkey bindings,
//! the status-indicator corner and the start-on-boot / show-level flags.
//! Listeners receive the full snapshot immediately on registration and again
//! after every successful save. The engine itself only consumes
//! [`Config::show_level`]; the rest is for the UI and hotkey collaborators.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::audio::ListenerId;

/// Default settings file name, resolved relative to the working directory.
pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to write settings: {0}")]
    Write(#[source] std::io::Error),

    #[error("malformed settings file: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("failed to encode settings: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Screen corner for the status indicator overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

/// The full settings snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hotkey_mute: String,
    pub hotkey_unmute: String,
    pub hotkey_toggle: String,
    pub status_corner: Corner,
    pub start_on_boot: bool,
    pub show_level: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hotkey_mute: "ctrl+alt+m".into(),
            hotkey_unmute: "ctrl+alt+u".into(),
            hotkey_toggle: "ctrl+alt+t".into(),
            status_corner: Corner::TopRight,
            start_on_boot: false,
            show_level: false,
        }
    }
}

/// Settings change callback; receives the full snapshot.
pub type SettingsListener = Arc<dyn Fn(&Config) + Send + Sync>;

/// File-backed settings with change notification.
pub struct SettingsStore {
    path: PathBuf,
    config: Mutex<Config>,
    listeners: Mutex<Vec<(ListenerId, SettingsListener)>>,
    next_listener_id: AtomicU64,
}

impl SettingsStore {
    /// Load settings from `path`, falling back to defaults when the file
    /// does not exist. A malformed file is an error, not a silent reset.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let config = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(SettingsError::Read)?;
            serde_json::from_str(&raw).map_err(SettingsError::Parse)?
        } else {
            Config::default()
        };
        info!(path = %path.display(), "settings loaded");
        Ok(Self {
            path,
            config: Mutex::new(config),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        })
    }

    /// Current snapshot.
    pub fn get(&self) -> Config {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Persist a new snapshot and notify listeners. Listeners are only
    /// notified after the write succeeded.
    pub fn save(&self, config: Config) -> Result<(), SettingsError> {
        let raw = serde_json::to_string_pretty(&config).map_err(SettingsError::Encode)?;
        std::fs::write(&self.path, raw).map_err(SettingsError::Write)?;
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config;
        info!(path = %self.path.display(), "settings saved");
        self.notify();
        Ok(())
    }

    /// Modify the current snapshot in place and save it.
    pub fn update(&self, mutate: impl FnOnce(&mut Config)) -> Result<(), SettingsError> {
        let mut next = self.get();
        mutate(&mut next);
        self.save(next)
    }

    /// Register a listener; the current snapshot is delivered synchronously
    /// before this returns.
    pub fn add_listener(&self, listener: SettingsListener) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::clone(&listener)));
        listener(&self.get());
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(lid, _)| *lid != id);
    }

    fn notify(&self) {
        let config = self.get();
        let listeners: Vec<SettingsListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&config))).is_err() {
                error!("settings listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("bettermute-test-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = scratch_path("missing");
        let _ = std::fs::remove_file(&path);
        let store = SettingsStore::load(&path).unwrap();
        assert_eq!(store.get(), Config::default());
        assert_eq!(store.get().hotkey_mute, "ctrl+alt+m");
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = scratch_path("roundtrip");
        let _ = std::fs::remove_file(&path);
        let store = SettingsStore::load(&path).unwrap();
        store
            .update(|c| {
                c.show_level = true;
                c.status_corner = Corner::BottomLeft;
            })
            .unwrap();

        let reloaded = SettingsStore::load(&path).unwrap();
        assert!(reloaded.get().show_level);
        assert_eq!(reloaded.get().status_corner, Corner::BottomLeft);

        // Corner names match the original key values on disk.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("bottom-left"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn listeners_get_snapshot_now_and_on_save() {
        let path = scratch_path("listeners");
        let _ = std::fs::remove_file(&path);
        let store = SettingsStore::load(&path).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&hits);
        let id = store.add_listener(Arc::new(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        store.update(|c| c.start_on_boot = true).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        store.remove_listener(id);
        store.update(|c| c.start_on_boot = false).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let path = scratch_path("malformed");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            SettingsStore::load(&path),
            Err(SettingsError::Parse(_))
        ));
        let _ = std::fs::remove_file(&path);
    }
}
