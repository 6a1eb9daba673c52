//! Protocol error codes.
//!
//! Hub and payee services answer failed requests with an [`ErrorBody`]:
//!
//! ```json
//! { "errorCode": "SCP_002_QUOTE_EXPIRED", "message": "quote expired", "retryable": false }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine-readable error codes shared by every SCP service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScpErrorCode {
    /// The asset is not accepted by this hub.
    #[serde(rename = "SCP_001_UNSUPPORTED_ASSET")]
    UnsupportedAsset,
    /// The quote is unknown or past its expiry.
    #[serde(rename = "SCP_002_QUOTE_EXPIRED")]
    QuoteExpired,
    /// The computed fee exceeds the payer's `maxFee`.
    #[serde(rename = "SCP_003_FEE_EXCEEDS_MAX")]
    FeeExceedsMax,
    /// The state nonce is not the successor of the last accepted nonce.
    #[serde(rename = "SCP_005_NONCE_CONFLICT")]
    NonceConflict,
    /// The signed state is past its `stateExpiry`.
    #[serde(rename = "SCP_006_STATE_EXPIRED")]
    StateExpired,
    /// The channel or payment does not exist.
    #[serde(rename = "SCP_007_CHANNEL_NOT_FOUND")]
    ChannelNotFound,
    /// Any other validation failure.
    #[serde(rename = "SCP_009_POLICY_VIOLATION")]
    PolicyViolation,
    /// On-chain verification is required but no ledger is configured.
    #[serde(rename = "SCP_010_SETTLEMENT_UNAVAILABLE")]
    SettlementUnavailable,
    /// Too many requests.
    #[serde(rename = "SCP_011_RATE_LIMITED")]
    RateLimited,
    /// Missing or wrong credentials on an admin endpoint.
    #[serde(rename = "SCP_012_UNAUTHORIZED")]
    Unauthorized,
}

impl ScpErrorCode {
    /// Returns the wire string for this code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedAsset => "SCP_001_UNSUPPORTED_ASSET",
            Self::QuoteExpired => "SCP_002_QUOTE_EXPIRED",
            Self::FeeExceedsMax => "SCP_003_FEE_EXCEEDS_MAX",
            Self::NonceConflict => "SCP_005_NONCE_CONFLICT",
            Self::StateExpired => "SCP_006_STATE_EXPIRED",
            Self::ChannelNotFound => "SCP_007_CHANNEL_NOT_FOUND",
            Self::PolicyViolation => "SCP_009_POLICY_VIOLATION",
            Self::SettlementUnavailable => "SCP_010_SETTLEMENT_UNAVAILABLE",
            Self::RateLimited => "SCP_011_RATE_LIMITED",
            Self::Unauthorized => "SCP_012_UNAUTHORIZED",
        }
    }
}

impl fmt::Display for ScpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON error body returned by hub endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Error code.
    pub error_code: ScpErrorCode,
    /// Human-readable detail.
    pub message: String,
    /// Whether the same request may succeed later.
    #[serde(default)]
    pub retryable: bool,
}

impl ErrorBody {
    /// Creates a non-retryable error body.
    #[must_use]
    pub fn new(error_code: ScpErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            retryable: false,
        }
    }

    /// Marks the error as retryable.
    #[must_use]
    pub const fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_code, self.message)
    }
}

impl std::error::Error for ErrorBody {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_display() {
        for code in [
            ScpErrorCode::QuoteExpired,
            ScpErrorCode::NonceConflict,
            ScpErrorCode::SettlementUnavailable,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn error_body_shape() {
        let body = ErrorBody::new(ScpErrorCode::FeeExceedsMax, "fee > maxFee");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "errorCode": "SCP_003_FEE_EXCEEDS_MAX",
                "message": "fee > maxFee",
                "retryable": false
            })
        );
    }
}
