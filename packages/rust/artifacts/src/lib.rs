//! Artifact naming and storage for materialized selections.
//!
//! [`key`] derives the deterministic storage key of a selection artifact,
//! [`store`] puts the bytes somewhere reachable by a public URL, and
//! [`tsv`] renders article lists into the stored format.

pub mod key;
pub mod store;
pub mod tsv;

pub use key::{
    DEFAULT_ARTIFACT_NAME, KeyShape, ParsedKey, UNKNOWN_EXTENSION, derive_key, extension_for,
    legacy_key, parse_key,
};
pub use store::{ArtifactStore, LocalArtifactStore, public_url};
pub use tsv::{content_hash, render_tsv};
