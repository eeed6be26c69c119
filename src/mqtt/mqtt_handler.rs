//! Broker session: connection lifecycle and message dispatch
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──► Connecting ──► Subscribed ──► Disconnected
//!                      │              │  ▲
//!                      ▼              │  │ (transport error, backoff, reconnect)
//!               refused/unreachable   └──┘
//!                   (fatal)
//! ```
//!
//! The typestate covers the startup path. While subscribed, transport errors
//! are handled inside [`BrokerSession::run`]: the event loop reconnects on the
//! next poll and the topic is subscribed again on every CONNACK. A refused
//! CONNACK is fatal at any point, credentials do not fix themselves.

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use statum::{machine, state};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::MqttConfig;
use super::message_manager::{InboundMessage, MessageHandler};
use crate::device::DeviceChannel;

const REQUEST_CHANNEL_CAPACITY: usize = 10;
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Reasons a broker rejects the connection handshake
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefusalReason {
    ProtocolVersion,
    InvalidClientId,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
    Unknown(u8),
}

impl RefusalReason {
    /// Interprets a CONNACK status code; 0 means accepted
    pub fn from_status(code: u8) -> Option<Self> {
        match code {
            0 => None,
            1 => Some(Self::ProtocolVersion),
            2 => Some(Self::InvalidClientId),
            3 => Some(Self::ServerUnavailable),
            4 => Some(Self::BadCredentials),
            5 => Some(Self::NotAuthorized),
            other => Some(Self::Unknown(other)),
        }
    }

    pub fn from_return_code(code: ConnectReturnCode) -> Option<Self> {
        let status = match code {
            ConnectReturnCode::Success => 0,
            ConnectReturnCode::RefusedProtocolVersion => 1,
            ConnectReturnCode::BadClientId => 2,
            ConnectReturnCode::ServiceUnavailable => 3,
            ConnectReturnCode::BadUserNamePassword => 4,
            ConnectReturnCode::NotAuthorized => 5,
        };
        Self::from_status(status)
    }

    pub fn status_code(&self) -> u8 {
        match self {
            Self::ProtocolVersion => 1,
            Self::InvalidClientId => 2,
            Self::ServerUnavailable => 3,
            Self::BadCredentials => 4,
            Self::NotAuthorized => 5,
            Self::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let reason = match self {
            Self::ProtocolVersion => "incorrect protocol version",
            Self::InvalidClientId => "invalid client identifier",
            Self::ServerUnavailable => "server unavailable",
            Self::BadCredentials => "bad credentials",
            Self::NotAuthorized => "not authorized",
            Self::Unknown(_) => "unknown error code",
        };
        write!(f, "{} (code {})", reason, self.status_code())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Broker connection refused: {reason}")]
    Refused { reason: RefusalReason },

    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Subscribe request failed: {0}")]
    Subscribe(String),
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
}

/// What the session does with one event loop notification
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Refused(RefusalReason),
    Subscribed { accepted: bool },
    Message(InboundMessage),
    BrokerDisconnect,
    Other,
}

impl From<Event> for SessionEvent {
    fn from(event: Event) -> Self {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => match RefusalReason::from_return_code(ack.code) {
                None => SessionEvent::Connected,
                Some(reason) => SessionEvent::Refused(reason),
            },
            Event::Incoming(Packet::SubAck(ack)) => SessionEvent::Subscribed {
                accepted: ack
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_))),
            },
            Event::Incoming(Packet::Publish(publish)) => SessionEvent::Message(publish.into()),
            Event::Incoming(Packet::Disconnect) => SessionEvent::BrokerDisconnect,
            _ => SessionEvent::Other,
        }
    }
}

/// Capped exponential delay between reconnect attempts
#[derive(Clone, Debug)]
pub struct Backoff {
    next: Duration,
    initial: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial,
            initial,
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Error for a refusal reported by the transport instead of a CONNACK event
fn refusal(code: ConnectReturnCode) -> SessionError {
    match RefusalReason::from_return_code(code) {
        Some(reason) => SessionError::Refused { reason },
        None => SessionError::Unreachable(format!(
            "connection reported as refused with status {code:?}"
        )),
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Disconnected, // Client built, nothing sent yet
    Connecting,   // CONNECT sent, waiting for CONNACK
    Subscribed,   // Accepted and subscribed, dispatching messages
}

#[machine]
pub struct BrokerSession<S: SessionState> {
    config: MqttConfig,
    client: AsyncClient,
    eventloop: EventLoop,
    connection_state: ConnectionState,
    backoff: Backoff,
}

impl<S: SessionState> BrokerSession<S> {
    /// Runtime view of the connection, finer than the typestate
    ///
    /// `connect` returns a `BrokerSession<Subscribed>` as soon as the SUBSCRIBE
    /// is queued, while this still reports [`ConnectionState::Connected`]. It
    /// becomes [`ConnectionState::Subscribed`] once the broker's SUBACK arrives
    /// inside [`BrokerSession::run`], and drops back to `Disconnected` or
    /// `Connecting` while a reconnect is pending.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    async fn subscribe(&mut self) -> Result<(), SessionError> {
        info!("Subscribing to {}", self.config.topic);
        self.client
            .subscribe(self.config.topic.clone(), QoS::AtMostOnce)
            .await
            .map_err(|e| SessionError::Subscribe(e.to_string()))
    }
}

impl BrokerSession<Disconnected> {
    pub fn create(config: MqttConfig) -> Self {
        info!(
            "Creating broker session for {}:{} as {}",
            config.host, config.port, config.client_id
        );
        let (client, eventloop) = AsyncClient::new(config.mqtt_options(), REQUEST_CHANNEL_CAPACITY);

        Self::new(
            config,
            client,
            eventloop,
            ConnectionState::Disconnected,
            Backoff::default(),
        )
    }

    /// Connects, waits for the handshake and subscribes to the command topic
    pub async fn connect(self) -> Result<BrokerSession<Subscribed>, SessionError> {
        let mut connecting: BrokerSession<Connecting> = self.transition();
        connecting.connection_state = ConnectionState::Connecting;
        connecting.await_handshake().await
    }
}

impl BrokerSession<Connecting> {
    async fn await_handshake(mut self) -> Result<BrokerSession<Subscribed>, SessionError> {
        loop {
            match self.eventloop.poll().await {
                Ok(event) => match SessionEvent::from(event) {
                    SessionEvent::Connected => {
                        info!("Connected (Code 0)");
                        self.connection_state = ConnectionState::Connected;
                        break;
                    }
                    SessionEvent::Refused(reason) => {
                        error!("Connection refused: {}", reason);
                        return Err(SessionError::Refused { reason });
                    }
                    other => debug!("Ignoring {:?} during handshake", other),
                },
                Err(ConnectionError::ConnectionRefused(code)) => {
                    let err = refusal(code);
                    error!("{}", err);
                    return Err(err);
                }
                Err(e) => {
                    error!("Could not reach broker {}:{}: {}", self.config.host, self.config.port, e);
                    self.connection_state = ConnectionState::Disconnected;
                    return Err(SessionError::Unreachable(e.to_string()));
                }
            }
        }

        self.subscribe().await?;
        Ok(self.transition())
    }
}

impl BrokerSession<Subscribed> {
    /// Dispatches inbound messages until cancelled
    ///
    /// Messages are handled inline, one at a time, in arrival order. Only a
    /// refused handshake on reconnect ends the loop with an error.
    pub async fn run<D: DeviceChannel>(
        mut self,
        handler: &mut MessageHandler<D>,
        cancel: CancellationToken,
    ) -> Result<BrokerSession<Disconnected>, SessionError> {
        info!("Dispatching messages from {}", self.config.topic);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown requested, leaving broker session");
                    self.disconnect().await;
                    break;
                }
                polled = self.eventloop.poll() => match polled {
                    Ok(event) => self.on_event(SessionEvent::from(event), &mut *handler).await?,
                    Err(ConnectionError::ConnectionRefused(code)) => {
                        let err = refusal(code);
                        error!("Reconnect failed: {}", err);
                        return Err(err);
                    }
                    Err(e) => {
                        self.connection_state = ConnectionState::Disconnected;
                        let delay = self.backoff.next_delay();
                        warn!("Broker connection lost: {}. Reconnecting in {:?}", e, delay);

                        tokio::select! {
                            _ = cancel.cancelled() => {
                                info!("Shutdown requested while disconnected");
                                break;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        self.connection_state = ConnectionState::Connecting;
                    }
                },
            }
        }

        self.connection_state = ConnectionState::Disconnected;
        Ok(self.transition())
    }

    async fn on_event<D: DeviceChannel>(
        &mut self,
        event: SessionEvent,
        handler: &mut MessageHandler<D>,
    ) -> Result<(), SessionError> {
        match event {
            SessionEvent::Message(message) => handler.handle(&message),
            SessionEvent::Connected => {
                info!("Reconnected (Code 0)");
                self.connection_state = ConnectionState::Connected;
                self.backoff.reset();
                self.subscribe().await?;
            }
            SessionEvent::Refused(reason) => {
                error!("Reconnect refused: {}", reason);
                return Err(SessionError::Refused { reason });
            }
            SessionEvent::Subscribed { accepted: true } => {
                info!("Subscribed to {}", self.config.topic);
                self.connection_state = ConnectionState::Subscribed;
            }
            SessionEvent::Subscribed { accepted: false } => {
                error!("Broker rejected subscription to {}", self.config.topic);
                return Err(SessionError::Subscribe(format!(
                    "broker rejected subscription to {}",
                    self.config.topic
                )));
            }
            SessionEvent::BrokerDisconnect => {
                warn!("Broker sent DISCONNECT");
            }
            SessionEvent::Other => {}
        }
        Ok(())
    }

    /// Sends DISCONNECT and drives the event loop until it is on the wire
    async fn disconnect(&mut self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("Could not queue disconnect: {}", e);
            return;
        }

        let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;

        if flushed.is_err() {
            warn!("Broker disconnect did not complete within {:?}", DISCONNECT_GRACE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::{AliasTable, CodeResolver};
    use crate::mqtt::message_manager::tests::RecordingDevice;
    use rumqttc::{ConnAck, Publish, SubAck};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn status_codes_map_to_reasons() {
        assert_eq!(RefusalReason::from_status(0), None);
        assert_eq!(RefusalReason::from_status(1), Some(RefusalReason::ProtocolVersion));
        assert_eq!(RefusalReason::from_status(2), Some(RefusalReason::InvalidClientId));
        assert_eq!(RefusalReason::from_status(3), Some(RefusalReason::ServerUnavailable));
        assert_eq!(RefusalReason::from_status(4), Some(RefusalReason::BadCredentials));
        assert_eq!(RefusalReason::from_status(5), Some(RefusalReason::NotAuthorized));
        assert_eq!(RefusalReason::from_status(42), Some(RefusalReason::Unknown(42)));
    }

    #[test]
    fn reason_text() {
        assert_eq!(
            RefusalReason::BadCredentials.to_string(),
            "bad credentials (code 4)"
        );
        assert_eq!(
            RefusalReason::Unknown(9).to_string(),
            "unknown error code (code 9)"
        );
    }

    #[test]
    fn return_codes_agree_with_status_codes() {
        let codes = [
            ConnectReturnCode::RefusedProtocolVersion,
            ConnectReturnCode::BadClientId,
            ConnectReturnCode::ServiceUnavailable,
            ConnectReturnCode::BadUserNamePassword,
            ConnectReturnCode::NotAuthorized,
        ];
        for (status, code) in (1u8..).zip(codes) {
            assert_eq!(
                RefusalReason::from_return_code(code),
                RefusalReason::from_status(status)
            );
        }
        assert_eq!(RefusalReason::from_return_code(ConnectReturnCode::Success), None);
    }

    #[test]
    fn classifies_events() {
        let accepted = Event::Incoming(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)));
        assert_eq!(SessionEvent::from(accepted), SessionEvent::Connected);

        let refused = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::BadUserNamePassword,
            false,
        )));
        assert_eq!(
            SessionEvent::from(refused),
            SessionEvent::Refused(RefusalReason::BadCredentials)
        );

        let publish = Event::Incoming(Packet::Publish(Publish::new(
            "nec/tx",
            QoS::AtMostOnce,
            r#"{"codes":["FF"]}"#,
        )));
        assert_eq!(
            SessionEvent::from(publish),
            SessionEvent::Message(InboundMessage::new("nec/tx", r#"{"codes":["FF"]}"#))
        );

        let rejected = Event::Incoming(Packet::SubAck(SubAck::new(
            1,
            vec![SubscribeReasonCode::Failure],
        )));
        assert_eq!(
            SessionEvent::from(rejected),
            SessionEvent::Subscribed { accepted: false }
        );

        assert_eq!(SessionEvent::from(Event::Outgoing(Outgoing::PingReq)), SessionEvent::Other);
    }

    #[test]
    fn backoff_doubles_up_to_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn transport_refusal_never_reports_accepted_code() {
        assert!(matches!(
            refusal(ConnectReturnCode::NotAuthorized),
            SessionError::Refused { reason: RefusalReason::NotAuthorized }
        ));
        assert!(matches!(
            refusal(ConnectReturnCode::Success),
            SessionError::Unreachable(_)
        ));
    }

    async fn local_broker() -> (TcpListener, MqttConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = MqttConfig::new("127.0.0.1");
        config.port = listener.local_addr().unwrap().port();
        (listener, config)
    }

    /// Accepts one client, answers CONNACK 0 and the SUBSCRIBE with `suback_code`
    async fn accept_subscriber(listener: &TcpListener, suback_code: u8) -> TcpStream {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];

        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(buf[0] >> 4, 1, "expected CONNECT, got {:?}", &buf[..n]);
        socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x82, "expected SUBSCRIBE, got {:?}", &buf[..n]);
        socket
            .write_all(&[0x90, 0x03, buf[2], buf[3], suback_code])
            .await
            .unwrap();
        socket
    }

    fn publish_packet(body: &str) -> Vec<u8> {
        let topic = b"nec/tx";
        let mut packet = vec![0x30, (2 + topic.len() + body.len()) as u8, 0x00, topic.len() as u8];
        packet.extend_from_slice(topic);
        packet.extend_from_slice(body.as_bytes());
        packet
    }

    fn recording_handler(device: &RecordingDevice) -> MessageHandler<RecordingDevice> {
        let aliases = AliasTable::from_csv("power,E0E040BF").unwrap();
        MessageHandler::new(CodeResolver::new(aliases), device.clone())
    }

    /// Cancels once the device saw a write, or after five seconds
    fn cancel_after_first_write(
        device: &RecordingDevice,
        cancel: &CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cancel = cancel.clone();
        let device = device.clone();
        tokio::spawn(async move {
            for _ in 0..500 {
                if !device.written().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            cancel.cancel();
        })
    }

    async fn drain(mut socket: TcpStream, wait: Duration) {
        let mut rest = Vec::new();
        let _ = tokio::time::timeout(wait, socket.read_to_end(&mut rest)).await;
    }

    #[tokio::test]
    async fn refused_handshake_is_fatal_before_subscribe() {
        let (listener, config) = local_broker().await;

        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(buf[0] >> 4, 1, "expected CONNECT, got {:?}", &buf[..n]);

            // CONNACK, bad username or password
            socket.write_all(&[0x20, 0x02, 0x00, 0x04]).await.unwrap();

            let mut rest = Vec::new();
            let _ = tokio::time::timeout(Duration::from_millis(500), socket.read_to_end(&mut rest)).await;
            rest
        });

        let result = BrokerSession::create(config).connect().await;
        assert!(matches!(
            result,
            Err(SessionError::Refused { reason: RefusalReason::BadCredentials })
        ));

        let after_connack = broker.await.unwrap();
        assert!(
            !after_connack.contains(&0x82),
            "client sent SUBSCRIBE after refusal: {after_connack:?}"
        );
    }

    #[tokio::test]
    async fn unreachable_broker_is_fatal() {
        let (listener, config) = local_broker().await;
        drop(listener);

        let result = BrokerSession::create(config).connect().await;
        assert!(matches!(result, Err(SessionError::Unreachable(_))));
    }

    #[tokio::test]
    async fn forwards_published_commands_until_cancelled() {
        let (listener, config) = local_broker().await;

        let broker = tokio::spawn(async move {
            let mut socket = accept_subscriber(&listener, 0x00).await;
            for body in [r#"{"codes":["ZZZZ"]}"#, r#"{"codes":["power","1A2B3C4D"]}"#] {
                socket.write_all(&publish_packet(body)).await.unwrap();
            }
            drain(socket, Duration::from_secs(5)).await;
        });

        let device = RecordingDevice::default();
        let mut handler = recording_handler(&device);
        let cancel = CancellationToken::new();
        let watcher = cancel_after_first_write(&device, &cancel);

        let session = BrokerSession::create(config).connect().await.unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Connected);

        let stopped = session.run(&mut handler, cancel).await.unwrap();
        assert_eq!(stopped.connection_state(), ConnectionState::Disconnected);

        watcher.await.unwrap();
        broker.abort();

        assert_eq!(device.written(), vec!["3772793023;439041101"]);
        assert_eq!(handler.stats().dropped, 1);
        assert_eq!(handler.stats().forwarded, 1);
    }

    #[tokio::test]
    async fn resubscribes_after_connection_drop() {
        let (listener, config) = local_broker().await;

        let broker = tokio::spawn(async move {
            let first = accept_subscriber(&listener, 0x00).await;
            drop(first);

            // accept_subscriber fails unless SUBSCRIBE follows the new CONNACK
            let mut second = accept_subscriber(&listener, 0x00).await;
            second
                .write_all(&publish_packet(r#"{"codes":["power"]}"#))
                .await
                .unwrap();
            drain(second, Duration::from_secs(5)).await;
        });

        let device = RecordingDevice::default();
        let mut handler = recording_handler(&device);
        let cancel = CancellationToken::new();
        let watcher = cancel_after_first_write(&device, &cancel);

        let session = BrokerSession::create(config).connect().await.unwrap();
        let stopped = session.run(&mut handler, cancel).await.unwrap();
        assert_eq!(stopped.connection_state(), ConnectionState::Disconnected);
        drop(stopped);

        watcher.await.unwrap();
        broker.await.unwrap();

        assert_eq!(device.written(), vec!["3772793023"]);
    }

    #[tokio::test]
    async fn refused_reconnect_is_fatal() {
        let (listener, config) = local_broker().await;

        let broker = tokio::spawn(async move {
            let first = accept_subscriber(&listener, 0x00).await;
            drop(first);

            let (mut second, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = second.read(&mut buf).await.unwrap();
            // CONNACK, not authorized
            second.write_all(&[0x20, 0x02, 0x00, 0x05]).await.unwrap();
            drain(second, Duration::from_secs(2)).await;
        });

        let device = RecordingDevice::default();
        let mut handler = recording_handler(&device);

        let session = BrokerSession::create(config).connect().await.unwrap();
        let result = session.run(&mut handler, CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(SessionError::Refused { reason: RefusalReason::NotAuthorized })
        ));

        broker.abort();
        assert!(device.written().is_empty());
    }

    #[tokio::test]
    async fn rejected_subscription_is_fatal() {
        let (listener, config) = local_broker().await;

        let broker = tokio::spawn(async move {
            let socket = accept_subscriber(&listener, 0x80).await;
            drain(socket, Duration::from_secs(2)).await;
        });

        let device = RecordingDevice::default();
        let mut handler = recording_handler(&device);

        let session = BrokerSession::create(config).connect().await.unwrap();
        let result = session.run(&mut handler, CancellationToken::new()).await;
        assert!(matches!(result, Err(SessionError::Subscribe(_))));

        broker.abort();
    }
}
