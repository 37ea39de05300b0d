#[derive(Debug, thiserror::Error)]
pub enum NetfilterError {
    #[error("Command '{cmd}' failed: {output}")]
    Command { cmd: String, output: String },

    #[error("Interface conflict: {namespace}-{interface}")]
    InterfaceConflict {
        namespace: String,
        interface: String,
    },

    #[error("Invalid live rule: {0}")]
    Parse(String),

    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type NetfilterResult<T> = Result<T, NetfilterError>;
