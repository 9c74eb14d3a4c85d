#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Failed to parse DateTime: {source}")]
    Chrono {
        #[from]
        source: chrono::ParseError,
    },

    #[error("Out of range: {source}")]
    OutOfRange {
        #[from]
        source: chrono::OutOfRangeError,
    },

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Parse duration: {source}")]
    ParseDuration {
        #[from]
        source: parse_duration::parse::Error,
    },

    /// A failure from the IaaS capability. `terminal` mirrors the
    /// `IsTerminal` classification: quota/plan/limit errors the caller must
    /// not retry.
    #[error("IaaS error: {message}")]
    Iaas { message: String, terminal: bool },
}

impl Error {
    pub fn iaas(message: impl Into<String>) -> Self {
        Error::Iaas {
            message: message.into(),
            terminal: false,
        }
    }

    pub fn iaas_terminal(message: impl Into<String>) -> Self {
        Error::Iaas {
            message: message.into(),
            terminal: true,
        }
    }

    /// Whether retrying this error is pointless — a terminal provider
    /// error (quota/plan/limit); everything else is treated as transient.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Iaas { terminal: true, .. })
    }
}
