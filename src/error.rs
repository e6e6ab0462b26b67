use bluest::Uuid;
use thiserror::Error;

/// An error produced while reassembling fragmented notifications.
///
/// Any reassembly error clears the in-progress buffer, so the next fragment
/// starts a fresh message. Recoverable: the connection stays up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("message fragment skipped or out of order: expected remaining count {expected}, got {got}")]
    FragmentSkipped { expected: u8, got: u8 },
    #[error("fragment too short to carry a remaining-count header")]
    EmptyFragment,
    #[error("reassembled message would exceed {limit} bytes")]
    MessageTooLarge { limit: usize },
}

/// Errors surfaced on the status stream.
///
/// Transport errors are carried as strings so that status events stay `Clone`
/// for fan-out. Scan, connect and discovery errors abandon the session in
/// progress; the rest are reported without ending the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("scan failed: {0}")]
    Scan(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("disconnect failed: {0}")]
    Disconnect(String),
    #[error("service discovery failed: {0}")]
    Discovery(String),
    #[error("the device does not expose characteristic {0}")]
    CharacteristicNotFound(Uuid),
    #[error("notification error on {characteristic}: {message}")]
    Notification { characteristic: Uuid, message: String },
    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),
    #[error("device disconnected unexpectedly")]
    UnexpectedDisconnect,
    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
}

#[test]
fn test_connect_and_disconnect_errors_read_differently() {
    assert_eq!(
        LinkError::Connect("refused".into()).to_string(),
        "connect failed: refused"
    );
    assert_eq!(
        LinkError::Disconnect("gatt busy".into()).to_string(),
        "disconnect failed: gatt busy"
    );
}
