use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Wire-visible error classification.
///
/// Classification guidance:
/// - [`ErrorClass::Query`]: request shape/name/filter issues discovered before fan-out
/// - [`ErrorClass::Parse`]: script compilation and sort-alias resolution failures
/// - [`ErrorClass::Config`]: table/cluster/route contract violations
/// - [`ErrorClass::Internode`]: fork transport and reply-decode failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Invalid query request (bad filter, missing body, unknown table).
    Query,
    /// Script/sort compilation failure.
    Parse,
    /// Configuration or routing contract violation.
    Config,
    /// Cluster dispatch or fork-reply decode failure.
    Internode,
}

/// Wire-visible error code, paired with [`ErrorClass`] in every reply body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Catch-all request failure.
    GeneralError,
    /// Script, filter, or alias syntax failure.
    SyntaxError,
    /// Catch-all configuration failure.
    GeneralConfigError,
    /// A node could not be reached or replied unusably; client should re-issue.
    RouteError,
    /// A fork reply could not be interpreted.
    InternodeError,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Query => "query",
            Self::Parse => "parse",
            Self::Config => "config",
            Self::Internode => "internode",
        };
        f.write_str(s)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::GeneralError => "general_error",
            Self::SyntaxError => "syntax_error",
            Self::GeneralConfigError => "general_config_error",
            Self::RouteError => "route_error",
            Self::InternodeError => "internode_error",
        };
        f.write_str(s)
    }
}

/// Canonical EVQ error carried across every layer and surfaced to clients
/// as HTTP 400 with a `{"error":{...}}` JSON body.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{class}/{code}: {message}")]
pub struct EvqError {
    /// Error class.
    pub class: ErrorClass,
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message, forwarded verbatim to the client.
    pub message: String,
}

impl EvqError {
    /// Build an error from its parts.
    pub fn new(class: ErrorClass, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            class,
            code,
            message: message.into(),
        }
    }

    /// `query/general_error`.
    pub fn query(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Query, ErrorCode::GeneralError, message)
    }

    /// `query/syntax_error`.
    pub fn query_syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Query, ErrorCode::SyntaxError, message)
    }

    /// `parse/syntax_error`.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Parse, ErrorCode::SyntaxError, message)
    }

    /// `config/general_config_error`.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Config, ErrorCode::GeneralConfigError, message)
    }

    /// `config/route_error` with the canonical retry message.
    pub fn route() -> Self {
        Self::new(
            ErrorClass::Config,
            ErrorCode::RouteError,
            "potential node failure - please re-issue the request",
        )
    }

    /// `internode/internode_error`.
    pub fn internode(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Internode, ErrorCode::InternodeError, message)
    }

    /// Render the client-facing JSON body.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "error": {
                "class": self.class.to_string(),
                "code": self.code.to_string(),
                "message": self.message,
            }
        })
    }

    /// Serialized form of [`EvqError::to_json`].
    pub fn to_json_bytes(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }
}

/// Standard EVQ result alias.
pub type Result<T> = std::result::Result<T, EvqError>;
