use nix::errno::Errno;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("could not open `{library}`: {reason}")]
    OpenLibrary { library: String, reason: String },

    #[error("no usable krun backend: {standard}; {confidential}")]
    NoBackend { standard: String, confidential: String },

    #[error("the container requires `{library}` but it is not available")]
    BackendNotLoaded { library: &'static str },

    #[error("could not find symbol `{symbol}` in `{library}`")]
    MissingSymbol { library: String, symbol: &'static str },

    #[error("`{operation}` failed in `{library}`: {errno}")]
    BackendCall {
        library: String,
        operation: &'static str,
        errno: Errno,
    },

    #[error("could not unload `{library}`: {reason}")]
    CloseLibrary { library: String, reason: String },

    #[error("{operation} not allowed in lifecycle state `{state}`")]
    LifecycleOrder {
        operation: &'static str,
        state: &'static str,
    },

    #[error("invalid microVM configuration: {0}")]
    InvalidVmConfig(String),

    #[error("stat `{path}` failed: {errno}")]
    HostDevice { path: PathBuf, errno: Errno },

    #[error("open `{path}` failed: {errno}")]
    Open { path: PathBuf, errno: Errno },

    #[error("could not create device node `{path}`: {errno}")]
    DeviceNode { path: PathBuf, errno: Errno },

    #[error("refusing to open `{path}` below the container root: {errno}")]
    RelayTarget { path: PathBuf, errno: Errno },

    #[error("path contains an embedded NUL byte: {0}")]
    EmbeddedNul(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("oci spec error: {0}")]
    OciSpec(#[from] oci_spec::OciSpecError),

    #[error("system error: {0}")]
    Errno(#[from] Errno),
}
