use thiserror::Error;

#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("establish failed: {0}")]
    EstablishFailed(String),

    #[error("native error {code}: {message}")]
    Native { code: i32, message: String },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl FirewallError {
    /// Whether the same attempt may succeed later without user action.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Whether the feature must be switched off and the user told.
    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }

    /// Extracts a FirewallError from an anyhow::Error, or classifies it by
    /// its underlying type.
    pub fn classify(err: &anyhow::Error) -> FirewallErrorKind {
        if let Some(fe) = err.downcast_ref::<FirewallError>() {
            return fe.kind();
        }
        if err.downcast_ref::<std::io::Error>().is_some() {
            return FirewallErrorKind::Io;
        }
        FirewallErrorKind::Other
    }

    pub fn kind(&self) -> FirewallErrorKind {
        match self {
            FirewallError::Io(_) => FirewallErrorKind::Io,
            FirewallError::Config(_) => FirewallErrorKind::Config,
            FirewallError::EstablishFailed(_) => FirewallErrorKind::EstablishFailed,
            FirewallError::Native { .. } => FirewallErrorKind::Native,
            FirewallError::Other(inner) => FirewallError::classify(inner),
        }
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallErrorKind {
    Io,
    Config,
    EstablishFailed,
    Native,
    Other,
}

impl FirewallErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, FirewallErrorKind::Io | FirewallErrorKind::Other)
    }

    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            FirewallErrorKind::EstablishFailed | FirewallErrorKind::Native
                | FirewallErrorKind::Config
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FirewallErrorKind::Io => "IO",
            FirewallErrorKind::Config => "CONFIG",
            FirewallErrorKind::EstablishFailed => "ESTABLISH_FAILED",
            FirewallErrorKind::Native => "NATIVE",
            FirewallErrorKind::Other => "OTHER",
        }
    }
}

pub type Result<T> = std::result::Result<T, FirewallError>;
