//! Durable append-only log of recorded audio artifacts.

pub mod artifacts;
pub mod database;
pub mod error;
pub mod schema;

pub use artifacts::{ArtifactRecord, ArtifactRepo, NewArtifact};
pub use database::Database;
pub use error::StoreError;
