//! Content-addressed storage for the cairn engine.
//!
//! Blobs are immutable byte strings identified by a [`Digest`] (SHA-256 plus
//! length). Directory trees are stored as blobs too: each level is a canonical
//! [`DirectoryNode`] referring to files and child directories by digest, so a
//! single digest identifies a whole tree.
//!
//! The [`Store`] keeps blobs in memory and optionally in an on-disk
//! [`LocalStore`]. The [`ActionCache`] maps request fingerprints to the digest
//! of a previously computed result.

pub mod action_cache;
pub mod digest;
pub mod directory;
pub mod error;
pub mod gc;
pub mod local;
pub mod store;

pub use action_cache::{ActionCache, ActionEntry};
pub use digest::{Digest, EMPTY_DIGEST, EMPTY_FINGERPRINT, FINGERPRINT_SIZE, Fingerprint};
pub use directory::{
    DirectoryNode, DirectoryTree, EMPTY_DIRECTORY_DIGEST, FileEntry, TreeEntry, path_components,
};
pub use error::{Error, Result};
pub use gc::{GcPolicy, GcResult, StoreStats};
pub use local::{DiskBlob, LocalStore};
pub use store::{DEFAULT_MEMORY_CACHE_BYTES, FileContent, PathEntry, Store};
