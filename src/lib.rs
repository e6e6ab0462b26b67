//! Receive fragmented V2X messages from an on-board unit (OBU) over Bluetooth Low Energy.
//!
//! The OBU advertises a GATT service and streams application messages as
//! characteristic notifications. A notification is capped at roughly 20
//! bytes, so the OBU splits each message into counted fragments: byte 0 of a
//! notification says how many fragments are still to come (0 marks the last
//! one), byte 1 is reserved for the transport, and the rest is payload.
//!
//! [`ObuLink`] owns the whole lifecycle: scan for the service, connect to the
//! first advertising device, subscribe to the notification characteristics,
//! reassemble the fragment stream into whole messages and fan the results out
//! on three independently subscribable streams (status events, OBU position
//! reports, ITS messages). If the device drops the connection, the link
//! releases its subscriptions and reconnects by itself after a fixed delay.
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main]
//! # pub async fn main() {
//!     let transport = obulink::BluestTransport::new().await.unwrap();
//!     let link = obulink::ObuLink::new(obulink::LinkConfig::default(), transport);
//!     let mut messages = link.its_messages();
//!     link.connect();
//!     while let Ok(message) = messages.recv().await {
//!         println!("{}", hex::encode(&message.payload));
//!     }
//! # }
//! ```

mod config;
mod error;
mod event;
mod reassembly;
mod session;
mod supervisor;
mod transport;

pub use config::{CharacteristicConfig, LinkConfig};
pub use error::{LinkError, ReassemblyError};
pub use event::{ConnectionState, StatusEvent};
pub use reassembly::{Message, MessageReassembler, MessageSource};
pub use supervisor::ObuLink;
pub use transport::{
    BleCharacteristic, BleDevice, BleTransport, BluestTransport, NotificationStream,
};
