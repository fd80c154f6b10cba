//! Sources bundled with the `trove` binary.

pub mod catalog;
pub mod filesystem;

pub use filesystem::FilesystemSource;
