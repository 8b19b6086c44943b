use thiserror::Error;

#[derive(Error, Debug)]
pub enum TimelapseError {
    #[error("Invalid capture configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Capture already running")]
    AlreadyRunning,

    #[error("No active capture session")]
    NoActiveSession,

    #[error("Media engine unavailable: {message}")]
    EngineUnavailable { message: String },

    #[error("Source unreachable: {message}")]
    SourceUnreachable { message: String },

    #[error("Frame grab failed: {message}")]
    GrabFailed { message: String },

    #[error("Video assembly failed: {message}")]
    AssemblyFailed { message: String },

    #[error("FFmpeg error: {message}")]
    Engine { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },
}

impl TimelapseError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig { message: message.into() }
    }

    pub fn engine_unavailable(message: impl Into<String>) -> Self {
        Self::EngineUnavailable { message: message.into() }
    }

    pub fn source_unreachable(message: impl Into<String>) -> Self {
        Self::SourceUnreachable { message: message.into() }
    }

    pub fn grab_failed(message: impl Into<String>) -> Self {
        Self::GrabFailed { message: message.into() }
    }

    pub fn assembly_failed(message: impl Into<String>) -> Self {
        Self::AssemblyFailed { message: message.into() }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine { message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, TimelapseError>;
