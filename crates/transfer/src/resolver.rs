//! Destination naming for downloads.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use crate::TransferError;
use crate::validation::validate_filename;

/// Future returned by [`DestinationResolver::resolve`].
pub type ResolveFuture<'a> = Pin<Box<dyn Future<Output = Result<PathBuf, TransferError>> + Send + 'a>>;

/// Chooses where an incoming file is written.
///
/// Called once per download item, when its first bytes arrive. The returned
/// path must not exist yet. Runs on the transfer task, so filesystem work
/// goes through `tokio::fs`.
pub trait DestinationResolver: Send + Sync {
    fn resolve<'a>(&'a self, filename: &'a str) -> ResolveFuture<'a>;
}

/// Writes downloads into one directory, never overwriting existing files.
///
/// Conflicts are resolved by appending ` (1)`, ` (2)`, ... to the name.
#[derive(Debug, Clone)]
pub struct DownloadDirectory {
    root: PathBuf,
}

impl DownloadDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl DestinationResolver for DownloadDirectory {
    fn resolve<'a>(&'a self, filename: &'a str) -> ResolveFuture<'a> {
        Box::pin(async move {
            validate_filename(filename)?;
            tokio::fs::create_dir_all(&self.root).await?;

            let candidate = self.root.join(filename);
            if !tokio::fs::try_exists(&candidate).await? {
                return Ok(candidate);
            }

            for n in 1..=u32::MAX {
                let candidate = self.root.join(format!("{filename} ({n})"));
                if !tokio::fs::try_exists(&candidate).await? {
                    return Ok(candidate);
                }
            }

            Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("no free name for {filename}"),
            )))
        })
    }
}
