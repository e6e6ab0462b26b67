use crate::reassembly::MessageSource;
use bluest::Uuid;
use std::time::Duration;

const OBU_SERVICE_ID: &str = "9bb78000-77eb-4ed9-b7d2-48ba9bb5304d";
const ITS_MESSAGE_CHARACTERISTIC_ID: &str = "9bb78050-77eb-4ed9-b7d2-48ba9bb5304d";

/// One notification characteristic to subscribe to, and the decoded-message
/// stream its reassembled messages are routed to.
#[derive(Debug, Clone)]
pub struct CharacteristicConfig {
    pub uuid: Uuid,
    pub source: MessageSource,
}

/// Connection policy for an [`ObuLink`](crate::ObuLink).
///
/// The defaults match the OBU as deployed: its GATT service id, its single
/// ITS message characteristic, and a 3 second delay before reconnecting
/// after an unexpected disconnect.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// The GATT service the OBU advertises. Scanning accepts the first
    /// device advertising it.
    pub service: Uuid,
    /// Characteristics to subscribe to once connected. A characteristic the
    /// device turns out not to have is reported on the status stream and
    /// skipped; the others are unaffected.
    pub characteristics: Vec<CharacteristicConfig>,
    /// How long to scan before giving up on the attempt.
    pub scan_timeout: Duration,
    /// Delay between an unexpected disconnect and the automatic reconnect.
    pub reconnect_delay: Duration,
    /// How many automatic reconnects to attempt before giving up.
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Upper bound on a reassembled message. A fragment that would grow the
    /// pending message past this is a reassembly error.
    pub max_message_len: usize,
    /// Capacity of each event stream. A subscriber that lags further than
    /// this behind the producer misses the oldest events.
    pub event_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service: Uuid::parse_str(OBU_SERVICE_ID).unwrap(),
            characteristics: vec![CharacteristicConfig {
                uuid: Uuid::parse_str(ITS_MESSAGE_CHARACTERISTIC_ID).unwrap(),
                source: MessageSource::ItsMessage,
            }],
            scan_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_millis(3000),
            max_reconnect_attempts: None,
            max_message_len: 4096,
            event_capacity: 32,
        }
    }
}
