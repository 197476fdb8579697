use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("config file not found: {0}")]
    ConfigMissing(String),

    #[error("malformed config: {0}")]
    ConfigMalformed(String),

    #[error("dns query timed out after {0:?}")]
    DnsTimeout(Duration),

    #[error("malformed dns response")]
    DnsMalformed,

    #[error("dns server answered with rcode {0}")]
    DnsRefused(u8),

    #[error("dns response carried no A record")]
    DnsNoAnswer,

    #[error("all dns servers failed for {domain}: {last}")]
    DnsAllServersFailed {
        domain: String,
        #[source]
        last: Box<ProxyError>,
    },

    #[error("failed to create socket: {0}")]
    SocketCreate(#[source] std::io::Error),

    #[error("failed to bind {addr}: {source}")]
    SocketBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to listen on {addr}: {source}")]
    SocketListen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    SocketConnect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o timed out after {0:?}")]
    IoTimeout(Duration),

    #[error("connection closed by peer")]
    Closed,

    #[error("malformed request line: {0:?}")]
    ParseRequestLine(String),

    #[error("malformed header line")]
    ParseHeader,

    #[error("malformed message body: {0}")]
    ParseBody(&'static str),

    #[error("invalid {0} framing")]
    ParseFraming(&'static str),

    #[error("{0} is not supported")]
    HttpUnsupported(&'static str),

    #[error("no accessible runway for {0}")]
    NoRunwayAvailable(String),

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// True for failures the retry loop may recover from by switching runway.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::DnsTimeout(_)
                | ProxyError::DnsMalformed
                | ProxyError::DnsRefused(_)
                | ProxyError::DnsNoAnswer
                | ProxyError::DnsAllServersFailed { .. }
                | ProxyError::SocketConnect { .. }
                | ProxyError::IoTimeout(_)
                | ProxyError::Closed
                | ProxyError::UpstreamFailure(_)
                | ProxyError::Io(_)
        )
    }
}
