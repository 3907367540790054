#[derive(Debug)]
pub enum RaftError {
    /// The receiving node is not the leader; the caller should try another
    /// node.
    NotLeader,
    /// The command was accepted but not observed as committed within the
    /// submit timeout. The log entry is not rolled back.
    CommitTimeout,
    /// The node has been stopped.
    Stopped,
    TransportError(String),
    SerializationError(String),
    InvalidConfig(String),
}

impl std::fmt::Display for RaftError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftError::NotLeader => write!(f, "not the leader"),
            RaftError::CommitTimeout => {
                write!(f, "command not committed within the submit timeout")
            }
            RaftError::Stopped => write!(f, "node has been stopped"),
            RaftError::TransportError(msg) => write!(f, "Transport error: {}", msg),
            RaftError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            RaftError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for RaftError {}

impl From<bincode::Error> for RaftError {
    fn from(err: bincode::Error) -> Self {
        RaftError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
