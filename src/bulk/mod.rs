//! Bulk id fetching
//!
//! Downloads large sets of tweets or users by id through the dispatcher,
//! caching each item on disk so repeated runs only fetch what is missing.

mod artifact;
mod fetcher;

pub use artifact::{ArtifactStore, FileArtifactStore};
pub use fetcher::{
    lookup_users, BulkFetcher, BulkOptions, FetchOutcome, LookupKind, MAX_LOOKUP_BATCH,
};
