//! Object storage backends.
//!
//! The [`backend::StorageBackend`] trait abstracts over where bytes
//! physically live.  Implementations include an in-memory map, the local
//! filesystem, and a gateway to S3-compatible services.

pub mod aws;
pub mod backend;
pub mod local;
pub mod memory;
pub mod range;
