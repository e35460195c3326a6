#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("unknown access candidate: {0}")]
    UnknownCandidate(String),

    #[error("access denied to secrets of team {0}")]
    Forbidden(String),

    #[error("token endpoint failed: {0}")]
    Token(String),

    #[error("secret store unreachable: {0}")]
    Unreachable(String),

    #[error("secret store returned HTTP {status}")]
    Status { status: u16 },

    #[error("invalid secret store response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for VaultError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Unreachable(err.to_string())
        }
    }
}
