//! Git integration for diffcache.
//!
//! The read layer wraps a `git2::Repository`. Repository is !Send, so each
//! worker thread opens its own `GitReader` and never hands it to another
//! thread; only the owned types in [`types`] cross thread boundaries.
pub mod reader;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use reader::GitReader;
