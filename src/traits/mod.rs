pub mod file_provider;

pub use file_provider::{FileProvider, FsFileProvider};

#[cfg(test)]
pub use file_provider::MockFileProvider;
