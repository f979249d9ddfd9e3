//! Persists the currently selected provider id across restarts as a
//! sibling `<config>.state.json` file, written with the same atomic
//! tmp-then-rename sequence as the teacher's state-file persistence.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    current_provider: String,
}

/// No-op if `path` is `None`. Logs a warning rather than failing the
/// request on any I/O error.
pub fn save_current_provider(path: Option<&Path>, provider_id: &str) {
    let Some(path) = path else { return };

    let json = match serde_json::to_string_pretty(&PersistedState { current_provider: provider_id.to_string() }) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "persist: failed to serialize state");
            return;
        }
    };

    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!(error = %e, dir = %parent.display(), "persist: failed to create state dir");
            return;
        }
    }

    let tmp = path.with_extension("json.tmp");
    if let Err(e) = std::fs::write(&tmp, &json) {
        tracing::warn!(error = %e, path = %tmp.display(), "persist: failed to write tmp file");
        return;
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        tracing::warn!(error = %e, "persist: failed to rename tmp -> state file");
        return;
    }

    tracing::debug!(path = %path.display(), "persist: state saved");
}

/// Returns `None` on a missing file, malformed JSON, or when `path` is
/// `None` — all of these mean "start with the config's default provider".
pub fn load_current_provider(path: Option<&Path>) -> Option<String> {
    let path = path?;
    if !path.exists() {
        return None;
    }
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str::<PersistedState>(&data).ok().map(|p| p.current_provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_current_provider() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ccrelay.state.json");
        save_current_provider(Some(&path), "alt");
        assert_eq!(load_current_provider(Some(&path)), Some("alt".to_string()));
    }

    #[test]
    fn missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent.state.json");
        assert_eq!(load_current_provider(Some(&path)), None);
    }

    #[test]
    fn malformed_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.state.json");
        std::fs::write(&path, "not json {{{").unwrap();
        assert_eq!(load_current_provider(Some(&path)), None);
    }

    #[test]
    fn no_path_configured_is_a_silent_no_op() {
        save_current_provider(None, "alt");
        assert_eq!(load_current_provider(None), None);
    }
}
