use thiserror::Error;

#[derive(Error, Debug)]
pub enum BoxcatError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Read error: {0}")]
    Read(String),

    #[error("Write error: {0}")]
    Write(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Build error: {0}")]
    Build(String),

    #[error("Launch error: {0}")]
    Launch(String),

    /// The server never accepted a connection. Carries whatever it printed.
    #[error("Server at {address} not ready: {reason}\nstderr: {stderr}\nstdout: {stdout}")]
    NotReady {
        address: String,
        reason: String,
        stderr: String,
        stdout: String,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, BoxcatError>;
