//! The realtime link to the cloud.
//!
//! One websocket carries full state snapshots out and viewer messages in.
//! Sends happen on an adaptive interval and in reply to every recognized
//! inbound message, both from the same task so two sends are never in flight.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::constants;
use crate::dispatcher::{CommandDispatcher, PrinterCommand};
use crate::error::SyncError;
use crate::packet::PacketBuilder;
use crate::printer_state::SharedPrinterState;
use crate::settings::SettingsStore;
use crate::webrtc::WebrtcRelay;

type SocketWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Period between unsolicited snapshots.
///
/// Only viewer presence matters; an active job alone does not speed up
/// the link.
pub fn send_interval(viewer_online: bool, _job_active: bool) -> Duration {
    if viewer_online {
        constants::ONLINE_SEND_INTERVAL
    } else {
        constants::OFFLINE_SEND_INTERVAL
    }
}

/// An authenticated message from a cloud viewer.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Presence { online: bool },
    WebrtcRequest { auth_key: Option<String> },
    WebrtcCandidate { data: Value, auth_key: Option<String> },
    WebrtcOffer { data: Value, auth_key: Option<String> },
    Heartbeat(Value),
    Update,
    Command(PrinterCommand),
}

/// Decode an inbound frame.
///
/// `None` means the frame must be dropped without a reply: it is not JSON,
/// carries the wrong token or interface, or names nothing we handle.
pub fn parse_inbound(text: &str, token: &str) -> Option<InboundMessage> {
    let message: Value = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("Dropping non-JSON sync frame: {}", e);
            return None;
        }
    };

    let authenticated = !token.is_empty()
        && message["token"].as_str() == Some(token)
        && message["interface"].as_str() == Some("client");
    if !authenticated {
        debug!("Dropping unauthenticated sync message");
        return None;
    }

    let auth_key = message["auth_key"].as_str().map(str::to_string);
    match message["state"].as_str() {
        Some("online") => return Some(InboundMessage::Presence { online: true }),
        Some("offline") => return Some(InboundMessage::Presence { online: false }),
        _ => {}
    }
    match message["webrtc"].as_str() {
        Some("request") => return Some(InboundMessage::WebrtcRequest { auth_key }),
        Some("remote_candidate") => {
            return Some(InboundMessage::WebrtcCandidate {
                data: message["data"].clone(),
                auth_key,
            });
        }
        Some("offer") => {
            return Some(InboundMessage::WebrtcOffer {
                data: message["data"].clone(),
                auth_key,
            });
        }
        _ => {}
    }
    if let Some(heartbeat) = message.get("heartbeat") {
        return Some(InboundMessage::Heartbeat(heartbeat.clone()));
    }
    if message.get("update").is_some() {
        return Some(InboundMessage::Update);
    }

    match PrinterCommand::from_message(&message) {
        Ok(Some(command)) => Some(InboundMessage::Command(command)),
        Ok(None) => {
            debug!("Dropping sync message with no known kind");
            None
        }
        Err(e) => {
            warn!("Dropping malformed printer command: {}", e);
            None
        }
    }
}

pub struct SyncChannel {
    websocket_url: String,
    settings: Arc<SettingsStore>,
    state: SharedPrinterState,
    packets: PacketBuilder,
    webrtc: WebrtcRelay,
    dispatcher: CommandDispatcher,
    viewer_online: bool,
}

impl SyncChannel {
    pub fn new(
        websocket_url: impl Into<String>,
        settings: Arc<SettingsStore>,
        state: SharedPrinterState,
        packets: PacketBuilder,
        webrtc: WebrtcRelay,
        dispatcher: CommandDispatcher,
    ) -> Self {
        Self {
            websocket_url: websocket_url.into(),
            settings,
            state,
            packets,
            webrtc,
            dispatcher,
            viewer_online: false,
        }
    }

    pub fn viewer_online(&self) -> bool {
        self.viewer_online
    }

    /// Interval until the next unsolicited snapshot.
    pub fn interval(&self) -> Duration {
        send_interval(self.viewer_online, self.state.lock().has_job())
    }

    /// Connect, serve, and reconnect until `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.session(&mut shutdown).await {
                Ok(()) => break,
                Err(e) => warn!("Sync channel down: {}", e),
            }
            tokio::select! {
                _ = tokio::time::sleep(constants::RECONNECT_DELAY) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("Sync loop stopped");
    }

    /// One connection lifetime. `Ok` only when shutdown was requested.
    async fn session(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), SyncError> {
        let token = self.settings.auth_token();
        if token.is_empty() {
            return Err(SyncError::MissingToken);
        }

        info!("Connecting sync channel to {}", self.websocket_url);
        let url = format!("{}?token={}", self.websocket_url, token);
        let handshake = tokio::time::timeout(
            constants::CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(url.as_str()),
        );
        let (socket, _) = match handshake.await {
            Ok(connected) => connected.map_err(|e| SyncError::ConnectFailed {
                url: self.websocket_url.clone(),
                reason: e.to_string(),
            })?,
            Err(_) => {
                return Err(SyncError::ConnectFailed {
                    url: self.websocket_url.clone(),
                    reason: format!("no handshake after {:?}", constants::CONNECT_TIMEOUT),
                });
            }
        };
        info!("Sync channel connected");
        self.viewer_online = false;

        let (mut write, mut read) = socket.split();
        self.send_snapshot(&mut write, None).await?;
        let mut next_send = Instant::now() + self.interval();

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = self.handle_text(text.as_str()).await {
                            send(&mut write, &reply).await?;
                            next_send = Instant::now() + self.interval();
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Sync channel close frame: {:?}", frame);
                        return Err(SyncError::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(SyncError::Socket { reason: e.to_string() });
                    }
                    None => return Err(SyncError::Closed),
                },
                _ = tokio::time::sleep_until(next_send) => {
                    self.send_snapshot(&mut write, None).await?;
                    next_send = Instant::now() + self.interval();
                }
                _ = shutdown.changed() => {
                    info!("Closing sync channel");
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!("Close frame not sent: {}", e);
                    }
                    if let Err(e) = write.close().await {
                        debug!("Socket close failed: {}", e);
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn send_snapshot(
        &self,
        write: &mut SocketWriter,
        extra: Option<Value>,
    ) -> Result<(), SyncError> {
        let packet = self.packets.build(extra).await;
        send(write, &packet).await
    }

    /// Handle one inbound frame and produce the reply, if any.
    pub async fn handle_text(&mut self, text: &str) -> Option<Value> {
        let message = parse_inbound(text, &self.settings.auth_token())?;
        let extra = self.handle(message).await;
        Some(self.packets.build(extra).await)
    }

    /// Apply a message and return the payload merged into its reply.
    async fn handle(&mut self, message: InboundMessage) -> Option<Value> {
        match message {
            InboundMessage::Presence { online } => {
                info!("Viewer {}", if online { "online" } else { "offline" });
                self.viewer_online = online;
                None
            }
            InboundMessage::WebrtcRequest { auth_key } => {
                self.webrtc.request(auth_key.as_deref()).await
            }
            InboundMessage::WebrtcCandidate { data, auth_key } => {
                Some(self.webrtc.remote_candidate(&data, auth_key.as_deref()).await)
            }
            InboundMessage::WebrtcOffer { data, auth_key } => {
                Some(self.webrtc.offer(&data, auth_key.as_deref()).await)
            }
            InboundMessage::Heartbeat(value) => Some(json!({ "heartbeat": value })),
            InboundMessage::Update => None,
            InboundMessage::Command(command) => {
                debug!("Dispatching {:?}", command);
                if let Err(e) = self.dispatcher.dispatch(command).await {
                    warn!("Printer command failed: {}", e);
                }
                None
            }
        }
    }
}

async fn send(write: &mut SocketWriter, packet: &Value) -> Result<(), SyncError> {
    write
        .send(Message::Text(packet.to_string().into()))
        .await
        .map_err(|e| SyncError::Socket {
            reason: e.to_string(),
        })
}
