use thiserror::Error;

/// Terminal outcomes of a dispatched request. All retry and classification
/// happen inside the engine; the caller sees a clean stream end or exactly
/// one of these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// No selectable account remains after all swaps.
    #[error("no accounts with remaining capacity are available")]
    ResourceExhausted,

    /// Every endpoint returned 403 for the chosen account. The account is
    /// only disabled when the first 403 was not a permission-denied: that
    /// class sticks to the account across endpoints and recovers on its own.
    #[error("all endpoints returned 403 (permission_denied: {permission_denied})")]
    AllEndpoints403 { permission_denied: bool },

    #[error("request image exceeds the 5 MB upstream maximum")]
    ImageTooLarge,

    /// Upstream rejected the request body; surfaced raw, account untouched.
    #[error("upstream rejected the request: {body}")]
    InvalidArgument { body: String },

    /// 500 "Internal error encountered": the prompt itself trips upstream.
    #[error("upstream cannot process this prompt")]
    IllegalPrompt,

    /// A fatal account-class error; the account has been disabled.
    #[error("account disabled after upstream {status}: {body}")]
    AccountDisabled { status: u16, body: String },

    #[error("upstream error {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("store error: {0}")]
    Store(String),
}

impl DispatchError {
    /// Stable taxonomy tag carried on the terminal error event.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::ResourceExhausted => "resource-exhausted",
            DispatchError::AllEndpoints403 { .. } => "all-endpoints-403",
            DispatchError::ImageTooLarge => "image-too-large",
            DispatchError::InvalidArgument { .. } => "invalid-argument",
            DispatchError::IllegalPrompt => "illegal-prompt",
            DispatchError::AccountDisabled { .. } => "account-disabled",
            DispatchError::Upstream { .. } => "upstream-error",
            DispatchError::Network(_) => "network-error",
            DispatchError::Store(_) => "internal-error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error403Class {
    PermissionDenied,
    Other,
}

pub fn classify_403(body: &str) -> Error403Class {
    if body.contains("PERMISSION_DENIED") || body.contains("The caller does not have permission") {
        Error403Class::PermissionDenied
    } else {
        Error403Class::Other
    }
}

/// Failure classes of one Antigravity upstream attempt, in matrix order.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureClass {
    ProjectInvalid,
    QuotaExhausted,
    ImageTooLarge,
    InvalidArgument,
    BadRequestOther,
    Forbidden(Error403Class),
    RateLimited,
    IllegalPrompt,
    ServerError,
}

pub fn classify_antigravity_failure(status: u16, body: &str) -> FailureClass {
    match status {
        400 => {
            if body.contains("RESOURCE_PROJECT_INVALID") {
                FailureClass::ProjectInvalid
            } else if body.contains("quota") || body.contains("RESOURCE_EXHAUSTED") {
                FailureClass::QuotaExhausted
            } else if body.contains("image exceeds 5 MB maximum") {
                FailureClass::ImageTooLarge
            } else if body.contains("INVALID_ARGUMENT") || body.contains("invalid_request_error") {
                FailureClass::InvalidArgument
            } else {
                FailureClass::BadRequestOther
            }
        }
        403 => FailureClass::Forbidden(classify_403(body)),
        429 => FailureClass::RateLimited,
        500 if body.contains("Internal error encountered") => FailureClass::IllegalPrompt,
        _ if body.contains("RESOURCE_EXHAUSTED") => FailureClass::RateLimited,
        _ => FailureClass::ServerError,
    }
}
