use amqp_kit::TransportError;
use lapin::protocol::AMQPErrorKind;

/// Classify a lapin error.
///
/// Soft protocol errors close only the channel they happened on, hard ones
/// take the whole connection down.
pub(crate) fn map_error(err: &lapin::Error) -> TransportError {
    match err {
        lapin::Error::ProtocolError(e) => match e.kind() {
            AMQPErrorKind::Soft(_) => TransportError::Channel(e.to_string()),
            AMQPErrorKind::Hard(_) => TransportError::Connection(e.to_string()),
        },
        lapin::Error::InvalidChannelState(_) => TransportError::Closed,
        lapin::Error::InvalidChannel(_) | lapin::Error::ChannelsLimitReached => {
            TransportError::Channel(err.to_string())
        }
        lapin::Error::InvalidConnectionState(_) | lapin::Error::IOError(_) => {
            TransportError::Connection(err.to_string())
        }
        _ => TransportError::Other(err.to_string()),
    }
}
