//! Error types for the DNS gateway

use std::io;

use thiserror::Error;

/// Result type alias for the DNS gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Sub-reason attached to a [`Error::PermissionDenied`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The requested operation is not in the token's allowed set.
    OperationNotAllowed,
    /// The DNS record type is not in the token's allowed set.
    RecordTypeNotAllowed,
    /// The target domain is outside the token's authoritative zone.
    ZoneNotInRealm,
    /// The caller's network origin matched no allowlist entry.
    OriginNotAllowed,
    /// The domain-root policy excluded the operation or record type.
    RootPolicyRefused,
}

impl DenyReason {
    /// Stable wire identifier for this deny reason.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OperationNotAllowed => "operation_not_allowed",
            Self::RecordTypeNotAllowed => "record_type_not_allowed",
            Self::ZoneNotInRealm => "zone_not_in_realm",
            Self::OriginNotAllowed => "origin_not_allowed",
            Self::RootPolicyRefused => "root_policy_refused",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// DNS gateway errors
///
/// The variants are the wire-level error taxonomy: every variant maps to a
/// stable `reason` string and an HTTP status. Upstream provider messages are
/// never carried to the caller; they are kept in the audit record only.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fail-fast at startup or on backend-service write)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication failed. Deliberately opaque: no distinction between
    /// unknown prefix and wrong secret.
    #[error("Invalid token")]
    InvalidToken,

    /// Token exists but is past its expiry
    #[error("Token expired")]
    TokenExpired,

    /// Account is locked out until the stored instant passes
    #[error("Account locked")]
    AccountLocked,

    /// Account is soft-deleted or disabled
    #[error("Account disabled")]
    AccountDisabled,

    /// Authorization denied with a taxonomized sub-reason
    #[error("Permission denied: {0}")]
    PermissionDenied(DenyReason),

    /// Token's realm does not resolve
    #[error("Realm not found")]
    RealmNotFound,

    /// Target zone unknown to the resolved backend
    #[error("Zone not found: {0}")]
    ZoneNotFound(String),

    /// Upstream provider is unreachable or its service/root is inactive
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Upstream provider rejected the request (4xx)
    #[error("Backend refused: {0}")]
    BackendRefused(String),

    /// Upstream response violated the provider's own schema
    #[error("Backend protocol error: {0}")]
    BackendProtocolError(String),

    /// Upstream call exceeded its deadline
    #[error("Backend timeout: {0}")]
    BackendTimeout(String),

    /// Per-IP token bucket exhausted; value is the suggested retry delay
    #[error("Rate limited, retry after {0}s")]
    RateLimited(u64),

    /// Request body exceeded `MAX_BODY_BYTES`
    #[error("Payload too large")]
    PayloadTooLarge,

    /// Request body failed to parse or violated a request limit
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Unique-constraint violation (duplicate realm, prefix, username)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Entity lookup miss on an admin/CRUD path
    #[error("Not found: {0}")]
    NotFound(String),

    /// Database failure
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Schema migration failure at startup; never reaches the wire
    #[error("Migration error: {0}")]
    Migration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable `reason` identifier used in the response envelope and audit records.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_invalid",
            Self::InvalidToken => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::AccountLocked => "account_locked",
            Self::AccountDisabled => "account_disabled",
            Self::PermissionDenied(r) => r.as_str(),
            Self::RealmNotFound => "realm_not_found",
            Self::ZoneNotFound(_) => "zone_not_found",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::BackendRefused(_) => "backend_refused",
            Self::BackendProtocolError(_) => "backend_protocol_error",
            Self::BackendTimeout(_) => "backend_timeout",
            Self::RateLimited(_) => "rate_limited",
            Self::PayloadTooLarge => "payload_too_large",
            Self::MalformedRequest(_) | Self::Json(_) => "malformed_request",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::StorageError(_) | Self::Io(_) => "storage_error",
            Self::Migration(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// Map to the HTTP status code of the response envelope.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::MalformedRequest(_) | Self::Json(_) => 400,
            Self::InvalidToken
            | Self::TokenExpired
            | Self::AccountLocked
            | Self::AccountDisabled => 401,
            Self::PermissionDenied(_) => 403,
            Self::RealmNotFound | Self::ZoneNotFound(_) | Self::NotFound(_) => 404,
            Self::BackendTimeout(_) => 408,
            Self::Conflict(_) => 409,
            Self::PayloadTooLarge => 413,
            Self::Config(_) => 422,
            Self::RateLimited(_) => 429,
            Self::BackendRefused(_) | Self::BackendProtocolError(_) => 502,
            Self::BackendUnavailable(_) => 503,
            Self::StorageError(_) | Self::Io(_) | Self::Migration(_) | Self::Internal(_) => 500,
        }
    }

    /// Message safe to show the caller. Upstream detail is stripped from
    /// backend errors; auth errors stay generic.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::BackendUnavailable(_) => "upstream DNS provider unavailable".to_string(),
            Self::BackendRefused(_) => "upstream DNS provider refused the request".to_string(),
            Self::BackendProtocolError(_) => {
                "upstream DNS provider returned an invalid response".to_string()
            }
            Self::BackendTimeout(_) => "upstream DNS provider timed out".to_string(),
            Self::StorageError(_) | Self::Io(_) | Self::Migration(_) | Self::Internal(_) => {
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Audit outcome class for this error.
    #[must_use]
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::InvalidToken
            | Self::TokenExpired
            | Self::AccountLocked
            | Self::AccountDisabled
            | Self::PermissionDenied(_) => "denied",
            _ => "error",
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db) = e {
            if db.is_unique_violation() {
                return Self::Conflict(db.message().to_string());
            }
        }
        if matches!(e, sqlx::Error::RowNotFound) {
            return Self::NotFound("row not found".to_string());
        }
        Self::StorageError(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::BackendTimeout(e.to_string());
        }
        if e.is_connect() {
            return Self::BackendUnavailable(e.to_string());
        }
        if let Some(status) = e.status() {
            if status.is_client_error() {
                return Self::BackendRefused(e.to_string());
            }
            return Self::BackendUnavailable(e.to_string());
        }
        Self::BackendUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_are_stable_wire_identifiers() {
        // GIVEN: one error of each externally visible kind
        let cases: Vec<(Error, &str, u16)> = vec![
            (Error::InvalidToken, "invalid_token", 401),
            (Error::TokenExpired, "token_expired", 401),
            (
                Error::PermissionDenied(DenyReason::ZoneNotInRealm),
                "zone_not_in_realm",
                403,
            ),
            (Error::RealmNotFound, "realm_not_found", 404),
            (Error::RateLimited(30), "rate_limited", 429),
            (Error::PayloadTooLarge, "payload_too_large", 413),
            (
                Error::BackendUnavailable("x".into()),
                "backend_unavailable",
                503,
            ),
            (Error::BackendTimeout("x".into()), "backend_timeout", 408),
            (Error::Conflict("dup".into()), "conflict", 409),
        ];

        // THEN: reason strings and status codes match the wire contract
        for (err, reason, status) in cases {
            assert_eq!(err.reason(), reason);
            assert_eq!(err.http_status(), status);
        }
    }

    #[test]
    fn backend_errors_do_not_leak_upstream_detail() {
        // GIVEN: a backend error carrying an upstream message
        let err = Error::BackendRefused("secret api key rejected by vendor".into());

        // THEN: the public message hides the upstream text
        assert!(!err.public_message().contains("secret"));
    }

    #[test]
    fn auth_failures_classify_as_denied() {
        assert_eq!(Error::InvalidToken.outcome(), "denied");
        assert_eq!(
            Error::PermissionDenied(DenyReason::OriginNotAllowed).outcome(),
            "denied"
        );
        assert_eq!(Error::BackendUnavailable("x".into()).outcome(), "error");
    }
}
