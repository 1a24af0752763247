use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::sync::RwLock;

use crate::errors::Result;

/// Storage contract the identity client persists sessions through
///
/// The backend session handling drives this during its own token rotation, so
/// implementations must behave correctly under arbitrary call interleaving.
/// `set` must not return until the write is durable: the rotation path calls it
/// with a brand-new refresh token the instant the old one is invalidated, and
/// losing that write after return locks the user out.
#[async_trait::async_trait]
pub trait SessionStorage: Send + Sync {
    /// Read a value; `None` both for missing keys and before any successful load
    async fn get(&self, key: &str) -> Option<String>;

    /// Durably write a value
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value
    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove every value
    async fn clear(&self) -> Result<()>;
}

/// Write a file via temp-then-rename so a reader never observes a partial write
pub(crate) async fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, contents).await?;

    // Sync to disk before the rename makes it visible
    let file = std::fs::File::open(&temp_path)?;
    file.sync_all()?;

    fs::rename(&temp_path, path).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }

    Ok(())
}

/// File-backed session store: one JSON object holding a `string -> string` map
///
/// Each process constructs a fresh instance and reloads the file at startup;
/// writes replace the whole file atomically, which serializes concurrent
/// processes without a lock file. A corrupt or unreadable file degrades to an
/// empty store - "cannot read session" always means "not authenticated",
/// never a startup failure.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl FileSessionStore {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o700);
                std::fs::set_permissions(dir, perms)?;
            }
        }

        let entries = Self::load(&path).await;

        Ok(Self {
            path,
            entries: Arc::new(RwLock::new(entries)),
        })
    }

    async fn load(path: &Path) -> HashMap<String, String> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
            Err(e) => {
                tracing::warn!("Could not read session store {}: {}", path.display(), e);
                return HashMap::new();
            }
        };

        match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    "Session store {} is corrupt ({}); starting empty",
                    path.display(),
                    e
                );
                HashMap::new()
            }
        }
    }

    async fn persist(&self, entries: &HashMap<String, String>) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)?;
        write_atomic(&self.path, &json).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SessionStorage for FileSessionStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        // Hold the write lock across the disk write so interleaved sets
        // serialize and the file always matches the in-memory map.
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.remove(key).is_none() {
            return Ok(());
        }
        self.persist(&entries).await
    }

    async fn clear(&self) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.clear();
        self.persist(&entries).await
    }
}

/// In-memory session store for tests and ephemeral use
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    entries: Arc<std::sync::RwLock<HashMap<String, String>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SessionStorage for MemorySessionStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.entries.read().ok()?.get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| crate::errors::AuthError::Storage("Lock poisoned".to_string()))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| crate::errors::AuthError::Storage("Lock poisoned".to_string()))?
            .remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| crate::errors::AuthError::Storage("Lock poisoned".to_string()))?
            .clear();
        Ok(())
    }
}
