use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("region allocation failed for key {key:#010x}: {reason}")]
    Allocation { key: u32, reason: &'static str },
    #[error("region attach failed for key {key:#010x}: {reason}")]
    Attach { key: u32, reason: &'static str },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("corrupt region: {0}")]
    Corrupt(&'static str),
    #[error("no commerce reply for agent {agent} within {waited_ms} ms")]
    ProtocolTimeout { agent: usize, waited_ms: u64 },
    #[error("agent {agent} struck by {hazard}")]
    HazardFault { agent: usize, hazard: &'static str },
    #[error("simulation terminated")]
    Terminated,
    #[error("mailbox for destination {0} is full")]
    ChannelFull(usize),
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
