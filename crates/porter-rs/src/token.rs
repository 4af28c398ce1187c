//! Bearer-token access for driver calls.
//!
//! The host platform stores the token in a plain file; the bridge only ever
//! reads it. [`TokenFile`] caches the value keyed by the file's modification
//! time and re-reads only when the file changes, so the hot path is a stat
//! plus a mutex-guarded clone.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use tracing::debug;

/// Synchronous credential accessor for driver calls.
///
/// Returning `None` makes the client fail a call before any network I/O.
pub trait TokenSource: Send + Sync {
    /// The current bearer token, or `None` when unavailable.
    fn token(&self) -> Option<String>;
}

/// Any closure works as a token source — for hosts that keep the credential
/// somewhere unusual, and for tests.
impl<F> TokenSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

/// A bearer token kept in a file, re-read only when the file changes.
pub struct TokenFile {
    path: PathBuf,
    cache: Mutex<Option<CachedToken>>,
}

#[derive(Clone)]
struct CachedToken {
    modified: SystemTime,
    value: String,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }
}

impl TokenSource for TokenFile {
    fn token(&self) -> Option<String> {
        let modified = fs::metadata(&self.path).ok()?.modified().ok()?;
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());

        if !needs_reload(modified, cache.as_ref()) {
            return cache.as_ref().map(|c| c.value.clone());
        }

        let raw = fs::read_to_string(&self.path).ok()?;
        let value = raw.trim().to_string();
        if value.is_empty() {
            *cache = None;
            return None;
        }
        debug!("Reloaded bearer token from {}", self.path.display());
        *cache = Some(CachedToken {
            modified,
            value: value.clone(),
        });
        Some(value)
    }
}

/// Reload decision as a pure function of the fresh stat and the cached entry.
fn needs_reload(modified: SystemTime, cached: Option<&CachedToken>) -> bool {
    !matches!(cached, Some(c) if c.modified == modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write_token(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("token");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn reads_and_trims_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_token(&dir, "  tok-abc123\n");
        let source = TokenFile::new(&path);
        assert_eq!(source.token().as_deref(), Some("tok-abc123"));
    }

    #[test]
    fn missing_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let source = TokenFile::new(dir.path().join("nope"));
        assert!(source.token().is_none());
    }

    #[test]
    fn empty_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_token(&dir, "   \n");
        let source = TokenFile::new(&path);
        assert!(source.token().is_none());
    }

    #[test]
    fn unchanged_mtime_serves_cached_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_token(&dir, "original");
        let source = TokenFile::new(&path);
        assert_eq!(source.token().as_deref(), Some("original"));

        // Rewrite the contents but pin the mtime back to the cached one —
        // the source must not notice.
        let modified = fs::metadata(&path).unwrap().modified().unwrap();
        fs::write(&path, "rewritten").unwrap();
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
        assert_eq!(source.token().as_deref(), Some("original"));
    }

    #[test]
    fn changed_mtime_triggers_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_token(&dir, "original");
        let source = TokenFile::new(&path);
        assert_eq!(source.token().as_deref(), Some("original"));

        let modified = fs::metadata(&path).unwrap().modified().unwrap();
        fs::write(&path, "rotated").unwrap();
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(modified + Duration::from_secs(5))
            .unwrap();
        assert_eq!(source.token().as_deref(), Some("rotated"));
    }

    #[test]
    fn reload_decision_is_pure() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let t1 = SystemTime::UNIX_EPOCH + Duration::from_secs(200);
        let cached = CachedToken {
            modified: t0,
            value: "tok".into(),
        };
        assert!(needs_reload(t0, None));
        assert!(!needs_reload(t0, Some(&cached)));
        assert!(needs_reload(t1, Some(&cached)));
    }

    #[test]
    fn closures_are_token_sources() {
        let source = || Some("from-closure".to_string());
        assert_eq!(TokenSource::token(&source).as_deref(), Some("from-closure"));
    }
}
