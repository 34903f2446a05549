//! Pipeline defaults
//!
//! Values used when the service configuration leaves a field unset.

/// Key under which the credential pair is stored in the key-value file.
pub const DEFAULT_STORAGE_KEY: &str = "session";

/// Path of the token refresh endpoint, relative to the upstream API base.
pub const DEFAULT_REFRESH_PATH: &str = "/api/auth/refresh-token";

/// Route the navigator is sent to when a session is invalidated.
pub const DEFAULT_LOGIN_ROUTE: &str = "/login";

/// Authorization scheme prefix attached to every authenticated request.
pub const BEARER_SCHEME: &str = "Bearer";
