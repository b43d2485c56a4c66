//! # Source Synchronizers
//!
//! Every synchronizer fetches one source's content into its staging
//! directory before a build pass and returns metadata for the revision
//! expression. Synchronizers are not thread-safe; the pool guarantees at
//! most one in-flight pass per bundle.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

mod database;
mod git;
mod http;

pub use database::DatabaseSynchronizer;
pub use git::GitSynchronizer;
pub use http::HttpSynchronizer;

/// Arbitrary metadata handed to the revision expression as
/// `input.sources.<name>`.
pub use crate::builder::Metadata;

#[async_trait]
pub trait Synchronizer: Send + Sync {
    /// Name of the source this synchronizer feeds.
    fn source(&self) -> &str;

    /// Fetch into the staging directory so the builder can read it.
    async fn execute(&mut self) -> Result<Metadata>;

    /// Directory to wipe before each pass, if the synchronizer starts from
    /// scratch every time (HTTP and database staging do; git working copies
    /// survive).
    fn wipe_dir(&self) -> Option<PathBuf> {
        None
    }

    /// Release resources; called when the worker retires.
    async fn close(&mut self) {}
}
