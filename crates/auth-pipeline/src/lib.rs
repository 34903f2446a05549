//! Authenticated request pipeline
//!
//! Wraps every outgoing API call so it carries the session's bearer token and
//! survives token expiry. When a request comes back 401 the pipeline refreshes
//! the token once, shared by every request that hit the same 401, replays the
//! request with the new token, and logs the session out if the refresh fails.
//!
//! Request lifecycle:
//! 1. `RequestInterceptor::execute()` reads the pair and attaches `Authorization`
//! 2. The `Transport` sends it; anything but a 401 goes straight back
//! 3. A 401 joins or starts the refresh in `RefreshCoordinator`
//! 4. Success: the original request is resent once with the new token
//! 5. Failure: `SessionInvalidator` clears credentials and navigates to login
//!
//! Collaborators are injected explicitly as trait objects; nothing here is
//! global. One coordinator per token scope.

pub mod coordinator;
pub mod error;
pub mod interceptor;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use coordinator::{RefreshCoordinator, RefreshFailure, RefreshOutcome, RefreshState};
pub use error::{Error, Result};
pub use interceptor::{RefreshEndpoint, RequestInterceptor};
pub use session::{Navigator, SessionInvalidator};
pub use transport::{HttpTransport, PendingRequest, Transport, TransportResponse};
