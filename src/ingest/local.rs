#![forbid(unsafe_code)]

//! Filesystem stream source: `<root>/<node account id>/<filename>`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;

use crate::core::AccountId;
use crate::filename::StreamFilename;
use crate::registry::SigningNode;

use super::StreamSource;

#[derive(Clone, Debug)]
pub struct LocalStreamSource {
    root: PathBuf,
}

impl LocalStreamSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, account: &AccountId, filename: &StreamFilename) -> PathBuf {
        self.root.join(account.to_string()).join(filename.to_string())
    }

    /// Writes a file where [`StreamSource`] will look for it. Readers see
    /// either nothing or the whole file (write to `.tmp`, then rename).
    pub async fn publish(
        &self,
        account: &AccountId,
        filename: &StreamFilename,
        bytes: &[u8],
    ) -> anyhow::Result<()> {
        let path = self.path_for(account, filename);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let tmp = tmp_path(&path);
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))
    }

    async fn read(&self, account: &AccountId, filename: &StreamFilename) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.path_for(account, filename);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[async_trait]
impl StreamSource for LocalStreamSource {
    async fn signature(
        &self,
        node: &SigningNode,
        filename: &StreamFilename,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        self.read(&node.account_id, filename).await
    }

    async fn data(&self, node: &SigningNode, filename: &StreamFilename) -> anyhow::Result<Option<Vec<u8>>> {
        self.read(&node.account_id, filename).await
    }
}
