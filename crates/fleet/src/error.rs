//! Fleet error types.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by fleet operations.
///
/// `Display` carries operator detail (including collaborator output); use
/// [`Error::user_message`] for anything shown to the requesting user.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid quota: {0}")]
    InvalidQuota(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("unknown promo code: {0}")]
    UnknownPromoCode(String),

    #[error("instance already exists: {0}")]
    DuplicateInstance(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("container runtime error: {0:#}")]
    Runtime(#[source] anyhow::Error),

    #[error("tunnel provider error: {0:#}")]
    TunnelProvider(#[source] anyhow::Error),

    #[error("{operation} timed out after {}s", after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("could not generate a unique promo code after {attempts} attempts")]
    CodeSpaceExhausted { attempts: u32 },

    #[error("{0}")]
    InvalidCommand(String),
}

impl Error {
    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(anyhow::anyhow!(message.into()))
    }

    #[must_use]
    pub fn tunnel(message: impl Into<String>) -> Self {
        Self::TunnelProvider(anyhow::anyhow!(message.into()))
    }

    /// Short machine-friendly name of the error kind, used as a log field.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidQuota(_) => "invalid_quota",
            Self::InvalidCredentials(_) => "invalid_credentials",
            Self::UnknownPromoCode(_) => "unknown_promo_code",
            Self::DuplicateInstance(_) => "duplicate_instance",
            Self::InstanceNotFound(_) => "instance_not_found",
            Self::NotAuthorized(_) => "not_authorized",
            Self::Runtime(_) => "runtime",
            Self::TunnelProvider(_) => "tunnel_provider",
            Self::Timeout { .. } => "timeout",
            Self::CodeSpaceExhausted { .. } => "code_space_exhausted",
            Self::InvalidCommand(_) => "invalid_command",
        }
    }

    /// Message safe to show to the requesting user.
    ///
    /// Validation errors keep their detail; collaborator failures collapse
    /// to a generic sentence so CLI output never leaks to chat.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidQuota(_)
            | Self::InvalidCredentials(_)
            | Self::UnknownPromoCode(_)
            | Self::DuplicateInstance(_)
            | Self::InstanceNotFound(_)
            | Self::InvalidCommand(_) => self.to_string(),
            Self::NotAuthorized(_) => "You are not allowed to use this command.".into(),
            Self::Runtime(_) => "The container runtime failed; an operator has the details.".into(),
            Self::TunnelProvider(_) => {
                "The tunnel could not be opened; an operator has the details.".into()
            },
            Self::Timeout { operation, .. } => {
                format!("The {operation} request took too long and was abandoned.")
            },
            Self::CodeSpaceExhausted { .. } => {
                "No promo code could be generated right now, try again.".into()
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
