//! Credential storage for the current session
//!
//! The session owns exactly one access/refresh token pair. `FileCredentialStore`
//! persists it under a single key of a JSON key-value file so it survives a
//! restart, the way a browser keeps it in local storage. Other keys in that
//! file belong to someone else and are carried through every rewrite untouched.
//!
//! Reads are synchronous and served from an in-memory copy; every request on
//! the hot path calls `get()`. Writes are serialized by a tokio Mutex and use
//! atomic temp-file + rename so a crash mid-write never leaves half a pair.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{PoisonError, RwLock};

use common::Secret;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::constants::BEARER_SCHEME;
use crate::error::{Error, Result};

/// The session's access and refresh tokens.
///
/// Serialized as `{"token": ..., "refreshToken": ...}`. Any further fields the
/// server returned alongside the tokens (user name, roles) are kept in
/// `profile` and written back verbatim. Both tokens are required: an entry
/// missing either one fails to parse, so a pair is always whole or absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialPair {
    /// Bearer token attached to outgoing requests
    #[serde(rename = "token")]
    pub access_token: Secret<String>,
    /// Longer-lived token exchanged for a new pair on expiry
    #[serde(rename = "refreshToken")]
    pub refresh_token: Secret<String>,
    #[serde(flatten)]
    pub profile: Map<String, Value>,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            refresh_token: Secret::new(refresh_token.into()),
            profile: Map::new(),
        }
    }

    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("{BEARER_SCHEME} {}", self.access_token.expose())
    }
}

/// Storage for the session's credential pair.
///
/// `get` is synchronous because the interceptor reads it once per request.
/// `clear` must be idempotent: clearing an empty store succeeds.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn CredentialStore>`).
pub trait CredentialStore: Send + Sync {
    /// Current pair, if a session exists.
    fn get(&self) -> Option<CredentialPair>;

    /// Replace the stored pair.
    fn save<'a>(
        &'a self,
        pair: &'a CredentialPair,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Remove the stored pair unconditionally.
    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// File-backed credential store.
pub struct FileCredentialStore {
    path: PathBuf,
    key: String,
    cache: RwLock<Option<CredentialPair>>,
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    /// Load the pair stored under `key` in the file at `path`.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start, no session).
    /// A present but malformed entry is an error rather than an empty session.
    pub async fn load(path: PathBuf, key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let cached = if path.exists() {
            let entries = read_entries(&path).await?;
            let pair = match entries.get(&key) {
                Some(Value::Null) | None => None,
                Some(entry) => Some(
                    serde_json::from_value::<CredentialPair>(entry.clone()).map_err(|e| {
                        Error::CredentialParse(format!("parsing entry `{key}`: {e}"))
                    })?,
                ),
            };
            info!(path = %path.display(), key = %key, session = pair.is_some(), "loaded credentials");
            pair
        } else {
            info!(path = %path.display(), "credential file not found, starting without a session");
            // Create the empty file so future loads don't need the cold-start path
            write_atomic(&path, &Map::new()).await?;
            None
        };

        Ok(Self {
            path,
            key,
            cache: RwLock::new(cached),
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn set_cached(&self, pair: Option<CredentialPair>) {
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = pair;
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Option<CredentialPair> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn save<'a>(
        &'a self,
        pair: &'a CredentialPair,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let mut entries = read_entries(&self.path).await?;
            let value = serde_json::to_value(pair)
                .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;
            entries.insert(self.key.clone(), value);
            write_atomic(&self.path, &entries).await?;
            self.set_cached(Some(pair.clone()));
            debug!(key = %self.key, "saved credentials");
            Ok(())
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            // The session ends here even if the file can't be rewritten
            self.set_cached(None);
            let mut entries = match read_entries(&self.path).await {
                Ok(entries) => entries,
                Err(Error::CredentialParse(reason)) => {
                    warn!(path = %self.path.display(), %reason, "credential file unreadable, resetting it");
                    write_atomic(&self.path, &Map::new()).await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            if entries.remove(&self.key).is_some() {
                write_atomic(&self.path, &entries).await?;
                debug!(key = %self.key, "cleared credentials");
            }
            Ok(())
        })
    }
}

/// Non-persistent credential store.
#[derive(Default)]
pub struct MemoryCredentialStore {
    pair: RwLock<Option<CredentialPair>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            pair: RwLock::new(Some(pair)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<CredentialPair> {
        self.pair
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn save<'a>(
        &'a self,
        pair: &'a CredentialPair,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            *self.pair.write().unwrap_or_else(PoisonError::into_inner) = Some(pair.clone());
            Ok(())
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            *self.pair.write().unwrap_or_else(PoisonError::into_inner) = None;
            Ok(())
        })
    }
}

/// Read the whole key-value file, or an empty map if it doesn't exist.
async fn read_entries(path: &Path) -> Result<Map<String, Value>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(e) => return Err(Error::Io(format!("reading credential file: {e}"))),
    };
    if contents.trim().is_empty() {
        return Ok(Map::new());
    }
    serde_json::from_str(&contents)
        .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))
}

/// Write the key-value file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains session tokens.
async fn write_atomic(path: &Path, entries: &Map<String, Value>) -> Result<()> {
    let json = serde_json::to_string_pretty(entries)
        .map_err(|e| Error::CredentialParse(format!("serializing credential file: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("credentials");

    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential file");
    Ok(())
}
