use thiserror::Error;

/// Stable wire error codes published in failure notices.
pub mod codes {
    pub const INVALID_AUTHOR_SIGNATURE: u32 = 1001;
    pub const INSUFFICIENT_BALANCE: u32 = 2001;
    pub const CONFLICT: u32 = 2002;
    pub const RECIPIENT_INVALID: u32 = 2003;
    pub const VALIDATION_FAILED: u32 = 3001;
    pub const BACKEND_UNAVAILABLE: u32 = 3002;
    pub const STEP_TIMEOUT: u32 = 3003;
    pub const FEE_OUTPUT_INVALID: u32 = 4001;
    pub const SIGNATURE_MISSING: u32 = 4002;
    pub const SIGNATURE_INVALID: u32 = 4003;
    pub const CANCELLED: u32 = 5001;
    pub const EXPIRED: u32 = 5002;
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid author signature: {0}")]
    InvalidAuthorSignature(String),

    #[error("insufficient balance: have {available}, need {needed}")]
    InsufficientBalance { available: i64, needed: i64 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("step {0} timed out")]
    StepTimeout(&'static str),

    #[error("fee output missing or incorrect: {0}")]
    FeeOutput(String),

    #[error("signature missing for session {0}")]
    SignatureMissing(String),

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("cancelled")]
    Cancelled,

    #[error("expired: {0}")]
    Expired(String),

    #[error("gateway busy, concurrent session ceiling reached")]
    Busy,

    #[error("invalid session state: {0}")]
    InvalidTransition(String),

    #[error("store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("relay error: {0}")]
    Relay(#[from] relay::RelayError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable wire code for failure notices. Internal detail is never put on
    /// the wire; only the code and a generic message travel.
    pub fn code(&self) -> u32 {
        use GatewayError::*;
        match self {
            InvalidAuthorSignature(_) => codes::INVALID_AUTHOR_SIGNATURE,
            InsufficientBalance { .. } => codes::INSUFFICIENT_BALANCE,
            Conflict(_) => codes::CONFLICT,
            InvalidRecipient(_) => codes::RECIPIENT_INVALID,
            Validation(_) => codes::VALIDATION_FAILED,
            BackendUnavailable(_) | Busy => codes::BACKEND_UNAVAILABLE,
            StepTimeout(_) => codes::STEP_TIMEOUT,
            FeeOutput(_) => codes::FEE_OUTPUT_INVALID,
            SignatureMissing(_) => codes::SIGNATURE_MISSING,
            SignatureInvalid(_) => codes::SIGNATURE_INVALID,
            Cancelled => codes::CANCELLED,
            Expired(_) => codes::EXPIRED,
            InvalidTransition(_) => codes::CONFLICT,
            Store(store::StoreError::InsufficientBalance { .. }) => codes::INSUFFICIENT_BALANCE,
            Store(store::StoreError::Conflict(_)) | Store(store::StoreError::Duplicate(_)) => {
                codes::CONFLICT
            }
            Store(_) | Relay(_) | Internal(_) => codes::BACKEND_UNAVAILABLE,
        }
    }

    /// Message safe to publish to the wallet.
    pub fn wire_message(&self) -> String {
        use GatewayError::*;
        match self {
            Store(_) | Internal(_) | Relay(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn from_daemon(err: daemons::DaemonError) -> Self {
        use daemons::DaemonError;
        match err {
            DaemonError::Conflict(msg) => GatewayError::Conflict(msg),
            DaemonError::InvalidRequest(msg) => GatewayError::Validation(msg),
            DaemonError::NotFound(msg) => GatewayError::Validation(msg),
            other => GatewayError::BackendUnavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_wire_table() {
        assert_eq!(GatewayError::InvalidAuthorSignature("x".into()).code(), 1001);
        assert_eq!(
            GatewayError::InsufficientBalance {
                available: 1,
                needed: 2
            }
            .code(),
            2001
        );
        assert_eq!(GatewayError::Conflict("x".into()).code(), 2002);
        assert_eq!(GatewayError::InvalidRecipient("x".into()).code(), 2003);
        assert_eq!(GatewayError::Validation("x".into()).code(), 3001);
        assert_eq!(GatewayError::BackendUnavailable("x".into()).code(), 3002);
        assert_eq!(GatewayError::StepTimeout("x").code(), 3003);
        assert_eq!(GatewayError::FeeOutput("x".into()).code(), 4001);
        assert_eq!(GatewayError::SignatureMissing("x".into()).code(), 4002);
        assert_eq!(GatewayError::SignatureInvalid("x".into()).code(), 4003);
        assert_eq!(GatewayError::Cancelled.code(), 5001);
        assert_eq!(GatewayError::Expired("x".into()).code(), 5002);
    }

    #[test]
    fn internal_detail_never_reaches_the_wire() {
        let err = GatewayError::Internal("user table corrupt at row 17".into());
        assert_eq!(err.wire_message(), "internal error");
        let err = GatewayError::Store(store::StoreError::NotFound("vtxo v9".into()));
        assert_eq!(err.wire_message(), "internal error");
    }
}
