use thiserror::Error;

pub type Result<T> = std::result::Result<T, TapeBackupError>;

#[derive(Error, Debug)]
pub enum TapeBackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Hardware command failed: '{command}': {diagnostic}")]
    HardwareCommandFailed { command: String, diagnostic: String },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Interrupted by signal")]
    Interrupted,

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl TapeBackupError {
    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn hardware<C: Into<String>, D: Into<String>>(command: C, diagnostic: D) -> Self {
        Self::HardwareCommandFailed {
            command: command.into(),
            diagnostic: diagnostic.into(),
        }
    }

    pub fn archive<T: Into<String>>(msg: T) -> Self {
        Self::Archive(msg.into())
    }

    pub fn notification<T: Into<String>>(msg: T) -> Self {
        Self::Notification(msg.into())
    }

    pub fn parse<T: Into<String>>(msg: T) -> Self {
        Self::Parse(msg.into())
    }
}
