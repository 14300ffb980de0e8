use lens_proto::WireError;
use thiserror::Error;

/// Errors surfaced to callers of `LensClient::execute`/`subscribe`, and the
/// terminal value delivered to a subscription's observer when it closes.
#[derive(Clone, Debug, Error)]
pub enum ClientError {
    #[error("websocket disconnected")]
    Disconnected,
    #[error("operation timed out")]
    Timeout,
    #[error("server error: {0}")]
    Server(WireError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("reconnect failed: {0}")]
    ReconnectFailed(String),
}
