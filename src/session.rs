//! One OBU connection attempt: scan, connect, discover, subscribe.
//!
//! Each step depends on the previous and any failure up to discovery fails
//! the whole attempt; retrying is the supervisor's job. Subscribing is the
//! exception: characteristics fail independently, so a bad one is recorded
//! and skipped while the others stay live.
//!
//! An attempt never writes to the sink itself. It hands its setup errors
//! back in [`SessionParts`] and the supervisor publishes them only if the
//! attempt is still the current one, so an attempt cancelled by a
//! disconnect or superseded by a newer connect stays silent.

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::event::{EventSink, StatusEvent};
use crate::reassembly::{MessageReassembler, MessageSource};
use crate::transport::{BleDevice, BleTransport, NotificationStream};
use bluest::Uuid;
use futures_util::StreamExt;
use std::sync::Arc;

/// A live notification registration, released when dropped.
pub(crate) struct Subscription {
    pub(crate) characteristic: Uuid,
    pub(crate) source: MessageSource,
    pub(crate) notifications: NotificationStream,
}

/// Everything a successful attempt produced. The supervisor takes ownership
/// and releases it as one unit when the session ends.
pub(crate) struct SessionParts {
    pub(crate) device: Arc<dyn BleDevice>,
    pub(crate) subscriptions: Vec<Subscription>,
    /// Characteristics that could not be set up. The session is still
    /// usable; these go out on the status stream once the session is live.
    pub(crate) setup_errors: Vec<LinkError>,
}

pub(crate) async fn establish(
    transport: &dyn BleTransport,
    config: &LinkConfig,
) -> Result<SessionParts, LinkError> {
    transport.available().await?;

    let device: Arc<dyn BleDevice> =
        Arc::from(transport.find_device(config.service, config.scan_timeout).await?);
    tracing::debug!(device = %device.id(), "device found, connecting");

    device.connect().await?;

    let mut found = device.discover_characteristics(config.service).await?;

    let mut subscriptions = Vec::with_capacity(config.characteristics.len());
    let mut setup_errors = Vec::new();
    for wanted in &config.characteristics {
        let Some(index) = found.iter().position(|c| c.uuid() == wanted.uuid) else {
            setup_errors.push(LinkError::CharacteristicNotFound(wanted.uuid));
            continue;
        };
        let characteristic = found.swap_remove(index);
        match characteristic.notifications().await {
            Ok(notifications) => subscriptions.push(Subscription {
                characteristic: wanted.uuid,
                source: wanted.source,
                notifications,
            }),
            Err(error) => {
                tracing::warn!(characteristic = %wanted.uuid, %error, "subscription failed");
                setup_errors.push(error);
            }
        }
    }

    Ok(SessionParts {
        device,
        subscriptions,
        setup_errors,
    })
}

/// Forward one characteristic's notifications into its reassembler and the
/// sink. Runs until the stream ends or the supervisor aborts it; reassembly
/// and per-notification errors are reported but never end the session.
pub(crate) async fn pump_notifications(
    mut subscription: Subscription,
    max_message_len: usize,
    sink: EventSink,
) {
    let mut reassembler = MessageReassembler::new(subscription.source, max_message_len);
    while let Some(item) = subscription.notifications.next().await {
        match item {
            Ok(fragment) => {
                tracing::trace!(
                    characteristic = %subscription.characteristic,
                    data = %hex::encode(&fragment),
                    "notification"
                );
                match reassembler.enqueue_fragment(&fragment) {
                    Ok(Some(message)) => sink.publish_message(message),
                    Ok(None) => {}
                    Err(error) => {
                        tracing::debug!(
                            characteristic = %subscription.characteristic,
                            %error,
                            "discarded message in progress"
                        );
                        sink.publish_status(StatusEvent::session_error(error.into()));
                    }
                }
            }
            Err(error) => sink.publish_status(StatusEvent::session_error(error)),
        }
    }
}
