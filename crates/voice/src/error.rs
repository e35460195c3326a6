#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("realtime connection failed: {0}")]
    Connect(String),

    #[error("speech provider returned HTTP {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("speech provider unreachable: {0}")]
    Transport(String),

    #[error("invalid provider response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}
