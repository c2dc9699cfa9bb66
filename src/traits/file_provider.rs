use std::path::Path;

#[cfg(test)]
use mockall::automock;

use crate::dfu::DfuResult;

/// Abstraction over reading firmware packages from storage.
/// This allows mocking the filesystem in command tests.
#[cfg_attr(test, automock)]
pub trait FileProvider: Send + Sync {
    /// Read the whole file at `path`
    fn read(&self, path: &Path) -> DfuResult<Vec<u8>>;
}

/// Real implementation that reads from the local filesystem
#[derive(Default)]
pub struct FsFileProvider;

impl FileProvider for FsFileProvider {
    fn read(&self, path: &Path) -> DfuResult<Vec<u8>> {
        Ok(std::fs::read(path)?)
    }
}
