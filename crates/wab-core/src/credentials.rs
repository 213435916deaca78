use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{errors::Error, Result};

const CREDS_FILE: &str = "creds.json";

/// Authentication state of the bot identity.
///
/// Only `registered` is interpreted by the core; everything else is owned by
/// the protocol client and round-tripped untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub state: serde_json::Value,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Credentials>;
    async fn save(&self, credentials: &Credentials) -> Result<()>;
}

/// Stores credentials as `creds.json` inside a directory.
#[derive(Clone, Debug)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn creds_path(&self) -> PathBuf {
        self.dir.join(CREDS_FILE)
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Credentials> {
        let path = self.creds_path();
        let txt = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Credentials::default())
            }
            Err(e) => return Err(Error::Io(e)),
        };
        serde_json::from_str(&txt)
            .map_err(|e| Error::Credentials(format!("{}: {e}", path.display())))
    }

    async fn save(&self, credentials: &Credentials) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.creds_path();
        let tmp = self.dir.join(format!("{CREDS_FILE}.tmp"));
        let body = serde_json::to_vec_pretty(credentials)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
