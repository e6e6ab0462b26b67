//! Connection lifecycle policy and the public [`ObuLink`] facade.
//!
//! A single supervisor task owns all mutable lifecycle state. Commands from
//! the application and completions from spawned work arrive on channels, so
//! transport callbacks never touch session state from arbitrary threads.
//! Every attempt carries a generation id; events tagged with a superseded
//! generation are discarded, which is what makes a late-finishing stale
//! session or an already-cancelled reconnect timer harmless.

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::event::{EventSink, StatusEvent};
use crate::reassembly::Message;
use crate::session::{self, SessionParts};
use crate::transport::{BleDevice, BleTransport};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

enum Command {
    Connect,
    Disconnect,
}

enum SupervisorEvent {
    SessionReady {
        generation: u64,
        result: Result<SessionParts, LinkError>,
    },
    DeviceDisconnected {
        generation: u64,
    },
    ReconnectDue {
        generation: u64,
    },
}

struct ActiveSession {
    device: Arc<dyn BleDevice>,
    pumps: Vec<JoinHandle<()>>,
    watch: JoinHandle<()>,
}

/// Handle to a supervised OBU connection.
///
/// Created with a [`LinkConfig`] and a [`BleTransport`]; spawns its
/// supervisor onto the current tokio runtime. Subscribe to the streams you
/// care about *before* calling [`connect`](ObuLink::connect), or the events
/// of the first attempt may be missed. Dropping the handle tears the active
/// session down.
pub struct ObuLink {
    commands: mpsc::UnboundedSender<Command>,
    sink: EventSink,
}

impl ObuLink {
    /// Must be called from within a tokio runtime.
    pub fn new(config: LinkConfig, transport: impl BleTransport + 'static) -> Self {
        let sink = EventSink::new(config.event_capacity);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            config,
            transport: Arc::new(transport),
            sink: sink.clone(),
            state: LinkState::Disconnected,
            generation: 0,
            session: None,
            reconnects_left: None,
            events_tx,
        };
        tokio::spawn(supervisor.run(commands_rx, events_rx));
        Self {
            commands: commands_tx,
            sink,
        }
    }

    /// Begin the scan → connect → subscribe flow. Ignored while an attempt
    /// is already in flight or a session is up.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Tear down the active session and cancel any pending reconnect.
    /// Terminal: the link stays down until the next [`connect`](ObuLink::connect).
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Status and error events.
    pub fn status(&self) -> broadcast::Receiver<StatusEvent> {
        self.sink.subscribe_status()
    }

    /// Decoded OBU position reports.
    pub fn obu_position(&self) -> broadcast::Receiver<Message> {
        self.sink.subscribe_obu_position()
    }

    /// Decoded ITS messages.
    pub fn its_messages(&self) -> broadcast::Receiver<Message> {
        self.sink.subscribe_its_messages()
    }
}

struct Supervisor {
    config: LinkConfig,
    transport: Arc<dyn BleTransport>,
    sink: EventSink,
    state: LinkState,
    generation: u64,
    session: Option<ActiveSession>,
    /// Automatic reconnects left before giving up; `None` is unlimited.
    /// Refilled on every manual connect and every successful session.
    reconnects_left: Option<u32>,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect) => self.on_connect(),
                    Some(Command::Disconnect) => self.on_manual_disconnect(),
                    None => {
                        // Facade dropped.
                        self.teardown();
                        break;
                    }
                },
                Some(event) = events.recv() => self.on_event(event),
            }
        }
    }

    fn on_connect(&mut self) {
        if self.state != LinkState::Disconnected {
            tracing::debug!(state = ?self.state, "connect ignored");
            return;
        }
        self.reconnects_left = self.config.max_reconnect_attempts;
        self.start_attempt();
    }

    fn on_manual_disconnect(&mut self) {
        // Bumping the generation cancels an in-flight attempt and any
        // pending reconnect timer in one move.
        self.generation += 1;
        self.teardown();
        self.state = LinkState::Disconnected;
        tracing::info!("disconnected on request");
    }

    fn start_attempt(&mut self) {
        self.generation += 1;
        self.state = LinkState::Connecting;
        tracing::info!("starting connection attempt");

        let generation = self.generation;
        let transport = Arc::clone(&self.transport);
        let config = self.config.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = session::establish(transport.as_ref(), &config).await;
            let _ = events.send(SupervisorEvent::SessionReady { generation, result });
        });
    }

    fn on_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::SessionReady { generation, result } if generation == self.generation => {
                match result {
                    Ok(parts) => self.on_session_ready(parts),
                    Err(error) => {
                        tracing::warn!(%error, "connection attempt failed");
                        self.state = LinkState::Disconnected;
                        self.sink.publish_status(StatusEvent::disconnected(error));
                    }
                }
            }
            SupervisorEvent::SessionReady { result: Ok(parts), .. } => {
                // A stale attempt finished after a newer connect or
                // disconnect; it must not touch the sink.
                let device = parts.device;
                tokio::spawn(async move {
                    let _ = device.disconnect().await;
                });
            }
            SupervisorEvent::SessionReady { .. } => {}
            SupervisorEvent::DeviceDisconnected { generation }
                if generation == self.generation && self.state == LinkState::Connected =>
            {
                self.on_device_disconnected();
            }
            SupervisorEvent::ReconnectDue { generation }
                if generation == self.generation && self.state == LinkState::Disconnected =>
            {
                tracing::info!("reconnecting");
                self.start_attempt();
            }
            _ => {}
        }
    }

    fn on_session_ready(&mut self, parts: SessionParts) {
        let mut pumps = Vec::with_capacity(parts.subscriptions.len());
        for subscription in parts.subscriptions {
            pumps.push(tokio::spawn(session::pump_notifications(
                subscription,
                self.config.max_message_len,
                self.sink.clone(),
            )));
        }

        let generation = self.generation;
        let device = Arc::clone(&parts.device);
        let events = self.events_tx.clone();
        let watch = tokio::spawn(async move {
            device.disconnected().await;
            let _ = events.send(SupervisorEvent::DeviceDisconnected { generation });
        });

        self.session = Some(ActiveSession {
            device: parts.device,
            pumps,
            watch,
        });
        self.state = LinkState::Connected;
        self.reconnects_left = self.config.max_reconnect_attempts;
        tracing::info!("connected");
        self.sink.publish_status(StatusEvent::connected());
        // Characteristic setup errors go out after the connected event, now
        // that the state they are tagged with is the state the link is in.
        for error in parts.setup_errors {
            self.sink.publish_status(StatusEvent::session_error(error));
        }
    }

    fn on_device_disconnected(&mut self) {
        tracing::warn!("device disconnected unexpectedly");
        self.teardown();
        self.state = LinkState::Disconnected;
        self.sink
            .publish_status(StatusEvent::disconnected(LinkError::UnexpectedDisconnect));

        let allowed = match self.reconnects_left {
            None => true,
            Some(0) => false,
            Some(left) => {
                self.reconnects_left = Some(left - 1);
                true
            }
        };
        if !allowed {
            tracing::warn!("reconnect attempts exhausted, staying down");
            return;
        }

        let generation = self.generation;
        let delay = self.config.reconnect_delay;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = events.send(SupervisorEvent::ReconnectDue { generation });
        });
    }

    /// Release everything the session owned, exactly once.
    fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            session.watch.abort();
            for pump in session.pumps {
                pump.abort();
            }
            let device = session.device;
            tokio::spawn(async move {
                if let Err(error) = device.disconnect().await {
                    tracing::debug!(%error, "disconnect failed");
                }
            });
        }
    }
}
