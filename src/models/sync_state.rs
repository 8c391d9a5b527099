use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SyncError;
use crate::models::inbox::InboxMarker;
use crate::models::period::Period;

/// State carried from one sync tick to the next. Only `last_marker` drives
/// behaviour; the other fields are bookkeeping for logs and `check-inbox`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_marker: Option<InboxMarker>,
    pub last_period: Option<Period>,
    pub last_published_at: Option<DateTime<Utc>>,
}

impl SyncState {
    /// Reads the state file; a missing file is a fresh start.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| SyncError::Config(format!("unreadable state file {}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> Result<(), SyncError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let body = serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::Config(format!("cannot encode state: {}", e)))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = SyncState::load(&dir.path().join("state.json")).unwrap();
        assert_eq!(state, SyncState::default());
    }

    #[test]
    fn save_then_load_keeps_the_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let state = SyncState {
            last_marker: Some(InboxMarker(812)),
            last_period: Some(Period::new(2025, 43).unwrap()),
            last_published_at: None,
        };
        state.save(&path).unwrap();
        assert_eq!(SyncState::load(&path).unwrap(), state);
    }
}
