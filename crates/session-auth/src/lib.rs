//! Session credential library
//!
//! Owns the two leaf components of the authenticated request pipeline: the
//! credential store holding the current access/refresh token pair, and the
//! refresh exchange client that trades a refresh token for a new pair. This
//! crate has no knowledge of interception or single-flight coordination; the
//! `auth-pipeline` crate builds those on top of the traits defined here.
//!
//! Credential flow:
//! 1. A login surface hands over a pair, saved via `CredentialStore::save()`
//! 2. Every outgoing request reads it with `CredentialStore::get()`
//! 3. On a 401 the coordinator calls `RefreshExchange::refresh()`
//! 4. The new pair is saved, or the store is cleared on failure

pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use constants::*;
pub use credentials::{CredentialPair, CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use error::{Error, Result};
pub use token::{HttpRefreshExchange, RefreshEnvelope, RefreshExchange, RefreshRequest};
