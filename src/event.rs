//! Fan-out of status events and decoded messages.
//!
//! Three independent broadcast streams: status/log events, OBU position
//! reports, and ITS messages. Any number of subscribers may read each one;
//! only the active session writes. Publishing never blocks on consumers,
//! and a stream with no subscribers simply drops its events.

use crate::error::LinkError;
use crate::reassembly::{Message, MessageSource};
use tokio::sync::broadcast;

/// Which side of the connection lifecycle a status event belongs to.
///
/// `Connected` accompanies the successful-subscription event and in-session
/// recoverable errors (reassembly, per-notification failures); `Disconnected`
/// accompanies setup failures, adapter problems and the disconnect itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// One entry on the status stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub state: ConnectionState,
    pub error: Option<LinkError>,
}

impl StatusEvent {
    pub(crate) fn connected() -> Self {
        Self {
            state: ConnectionState::Connected,
            error: None,
        }
    }

    /// A recoverable error on a live connection.
    pub(crate) fn session_error(error: LinkError) -> Self {
        Self {
            state: ConnectionState::Connected,
            error: Some(error),
        }
    }

    /// A failed or ended session.
    pub(crate) fn disconnected(error: LinkError) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            error: Some(error),
        }
    }
}

#[derive(Clone)]
pub(crate) struct EventSink {
    status: broadcast::Sender<StatusEvent>,
    obu_position: broadcast::Sender<Message>,
    its_messages: broadcast::Sender<Message>,
}

impl EventSink {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            status: broadcast::channel(capacity).0,
            obu_position: broadcast::channel(capacity).0,
            its_messages: broadcast::channel(capacity).0,
        }
    }

    pub(crate) fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    pub(crate) fn subscribe_obu_position(&self) -> broadcast::Receiver<Message> {
        self.obu_position.subscribe()
    }

    pub(crate) fn subscribe_its_messages(&self) -> broadcast::Receiver<Message> {
        self.its_messages.subscribe()
    }

    pub(crate) fn publish_status(&self, event: StatusEvent) {
        let _ = self.status.send(event);
    }

    /// Route a decoded message to the stream its source tag names.
    pub(crate) fn publish_message(&self, message: Message) {
        let stream = match message.source {
            MessageSource::ObuPosition => &self.obu_position,
            MessageSource::ItsMessage => &self.its_messages,
        };
        let _ = stream.send(message);
    }
}

#[test]
fn test_every_subscriber_sees_every_event() {
    let sink = EventSink::new(8);
    let mut first = sink.subscribe_status();
    let mut second = sink.subscribe_status();
    sink.publish_status(StatusEvent::connected());
    assert_eq!(first.try_recv().unwrap(), StatusEvent::connected());
    assert_eq!(second.try_recv().unwrap(), StatusEvent::connected());
}

#[test]
fn test_messages_route_by_source() {
    let sink = EventSink::new(8);
    let mut positions = sink.subscribe_obu_position();
    let mut its = sink.subscribe_its_messages();

    sink.publish_message(Message {
        source: MessageSource::ObuPosition,
        payload: vec![1],
    });
    sink.publish_message(Message {
        source: MessageSource::ItsMessage,
        payload: vec![2],
    });

    assert_eq!(positions.try_recv().unwrap().payload, vec![1]);
    assert!(positions.try_recv().is_err());
    assert_eq!(its.try_recv().unwrap().payload, vec![2]);
}

#[test]
fn test_publishing_without_subscribers_is_fine() {
    let sink = EventSink::new(8);
    sink.publish_status(StatusEvent::disconnected(LinkError::Scan("no device".into())));
}
