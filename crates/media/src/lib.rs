//! `herdbook-media` — remote image storage boundary.
//!
//! Daily reports reference their photos by link only; the binary content
//! lives in an external store behind the [`ImageStore`] trait. Uploads and
//! deletions are a best-effort side-channel: ledger reconciliation never
//! depends on them succeeding.

pub mod store;

pub use store::{ImagePayload, ImageStore, ImageStoreError, InMemoryImageStore};
