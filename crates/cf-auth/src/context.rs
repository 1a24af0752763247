use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;

use crate::errors::Result;
use crate::models::UserContext;
use crate::storage::write_atomic;

/// File-backed store for non-auth user context
///
/// The auth core only touches the `{user_id, email}` slice; other preferences
/// (the selected workspace context) belong to the rest of the CLI and survive
/// sign-out.
#[derive(Debug, Clone)]
pub struct ContextStore {
    path: PathBuf,
}

impl ContextStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load the stored context; a missing or corrupt file reads as absent
    pub async fn load(&self) -> Option<UserContext> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Could not read context file {}: {}", self.path.display(), e);
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(context) => Some(context),
            Err(e) => {
                tracing::warn!(
                    "Context file {} is corrupt ({}); ignoring it",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    /// Persist the identity slice after an auth event
    pub async fn save_identity(&self, user_id: &str, email: Option<&str>) -> Result<()> {
        let mut context = self.load().await.unwrap_or_default();
        context.user_id = Some(user_id.to_string());
        context.email = email.map(str::to_string);
        context.last_updated = Some(Utc::now());
        self.write(&context).await
    }

    /// Record the workspace context selection
    pub async fn set_selected_context(&self, selected: Option<&str>) -> Result<()> {
        let mut context = self.load().await.unwrap_or_default();
        context.selected_context = selected.map(str::to_string);
        context.last_updated = Some(Utc::now());
        self.write(&context).await
    }

    /// Drop the identity slice on sign-out, preserving non-auth preferences
    pub async fn clear_identity(&self) -> Result<()> {
        let Some(mut context) = self.load().await else {
            return Ok(());
        };
        context.user_id = None;
        context.email = None;
        context.last_updated = Some(Utc::now());
        self.write(&context).await
    }

    async fn write(&self, context: &UserContext) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_string_pretty(context)?;
        write_atomic(&self.path, &json).await?;
        Ok(())
    }
}
