mod value;
pub use value::{from_json, to_json, Dict, DictExt, Value};

mod message;
pub use message::{Answer, Args, Quest, STATUS_EXCEPTION, STATUS_OK};

mod codec;
pub use codec::{
    decode_args, decode_message, decode_value, encode_answer, encode_args, encode_quest,
    encode_value, Message,
};

mod endpoint;
pub use endpoint::Endpoint;

mod server;
pub use server::{serve, Current, Servant, ServerConfig};

mod proxy;
pub use proxy::Proxy;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid endpoint: '{0}'")]
    InvalidEndpoint(String),
    #[error("invalid argument: {0}")]
    Argument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Protocol(String),
    #[error("timeout: {0}")]
    Timeout(&'static str),
    #[error("{0}")]
    Overload(String),
    #[error("upstream status {status}: {message}")]
    Upstream { status: i32, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] bincode::Error),
    #[error("connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Short taxonomy tag surfaced as `exname` in exception answers.
    pub fn exname(&self) -> &'static str {
        match self {
            Error::InvalidEndpoint(_) => "InvalidEndpoint",
            Error::Argument(_) => "ArgumentError",
            Error::NotFound(_) => "NotFound",
            Error::Protocol(_) => "ProtocolError",
            Error::Timeout(_) => "TimeoutError",
            Error::Overload(_) => "Overload",
            Error::Upstream { .. } => "UpstreamError",
            Error::Io(_) => "IoError",
            Error::Codec(_) => "CodecError",
            Error::ConnectionClosed => "ConnectionClosed",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
