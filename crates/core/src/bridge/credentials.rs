use std::{
    fmt,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::Result;

/// Address and whitelisted username for one bridge.
#[derive(Clone, PartialEq, Eq)]
pub struct BridgeCredentials {
    pub address: String,
    pub username: String,
}

impl fmt::Debug for BridgeCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeCredentials")
            .field("address", &self.address)
            .field("username", &"***REDACTED***")
            .finish()
    }
}

/// What was found in the cache file. Either line may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedCredentials {
    pub address: Option<String>,
    pub username: Option<String>,
}

/// Two-line text file: bridge address on the first line, username on the
/// second.
#[derive(Debug, Clone)]
pub struct CredentialCache {
    path: PathBuf,
}

impl CredentialCache {
    /// Creates a cache backed by `path`. Nothing is read until [`load`](Self::load).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `None` when the file does not exist.
    pub fn load(&self) -> Result<Option<CachedCredentials>> {
        if !self.path.exists() {
            debug!(path = ?self.path, "no credential cache");
            return Ok(None);
        }

        let text = std::fs::read_to_string(&self.path)?;
        let mut lines = text.lines().map(str::trim);
        let mut next_value = || {
            lines
                .next()
                .filter(|line| !line.is_empty())
                .map(str::to_string)
        };

        Ok(Some(CachedCredentials {
            address: next_value(),
            username: next_value(),
        }))
    }

    /// Writes both lines, creating parent directories as needed.
    pub fn store(&self, credentials: &BridgeCredentials) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            &self.path,
            format!("{}\n{}\n", credentials.address, credentials.username),
        )?;
        debug!(path = ?self.path, "credential cache written");
        Ok(())
    }
}
