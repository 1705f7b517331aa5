use std::io::ErrorKind;
use std::time::Duration;

use log::{debug, info, warn};
use mac_address::MacAddress;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, StateError, SubscribeReasonCode, Transport,
};
use tokio::time::{Instant, timeout};

use crate::config;
use crate::messages::InboundMessage;

/// How long `poll_inbound` waits for more traffic before handing back control.
const SERVICE_WINDOW: Duration = Duration::from_millis(10);
const MAX_EVENTS_PER_SERVICE: usize = 32;

/// Why a broker operation failed. Only used for diagnostics; the display
/// form carries the numeric state common to embedded MQTT clients.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionFailure {
    #[error("MQTT_CONNECTION_TIMEOUT (-4)")]
    Timeout,
    #[error("MQTT_CONNECTION_LOST (-3)")]
    ConnectionLost,
    #[error("MQTT_CONNECT_FAILED (-2)")]
    ConnectFailed,
    #[error("MQTT_DISCONNECTED (-1)")]
    Disconnected,
    #[error("MQTT_CONNECT_BAD_PROTOCOL (1)")]
    BadProtocol,
    #[error("MQTT_CONNECT_BAD_CLIENT_ID (2)")]
    BadClientId,
    #[error("MQTT_CONNECT_UNAVAILABLE (3)")]
    Unavailable,
    #[error("MQTT_CONNECT_BAD_CREDENTIALS (4)")]
    BadCredentials,
    #[error("MQTT_CONNECT_UNAUTHORIZED (5)")]
    Unauthorized,
}

impl SessionFailure {
    pub fn from_connection_error(err: &ConnectionError) -> Self {
        match err {
            ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
                SessionFailure::Timeout
            }
            ConnectionError::MqttState(StateError::AwaitPingResp) => SessionFailure::Timeout,
            ConnectionError::MqttState(_) => SessionFailure::ConnectionLost,
            ConnectionError::Io(e) => match e.kind() {
                ErrorKind::TimedOut => SessionFailure::Timeout,
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof => SessionFailure::ConnectionLost,
                _ => SessionFailure::ConnectFailed,
            },
            ConnectionError::ConnectionRefused(code) => Self::from_return_code(*code),
            ConnectionError::NotConnAck(_) => SessionFailure::BadProtocol,
            ConnectionError::RequestsDone => SessionFailure::Disconnected,
            _ => SessionFailure::ConnectFailed,
        }
    }

    pub fn from_return_code(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::RefusedProtocolVersion => SessionFailure::BadProtocol,
            ConnectReturnCode::BadClientId => SessionFailure::BadClientId,
            ConnectReturnCode::ServiceUnavailable => SessionFailure::Unavailable,
            ConnectReturnCode::BadUserNamePassword => SessionFailure::BadCredentials,
            ConnectReturnCode::NotAuthorized => SessionFailure::Unauthorized,
            ConnectReturnCode::Success => SessionFailure::ConnectFailed,
        }
    }
}

/// The broker operations the control loop needs.
#[allow(async_fn_in_trait)]
pub trait BrokerSession {
    fn is_connected(&self) -> bool;

    async fn connect(&mut self) -> Result<(), SessionFailure>;

    /// A subscription the broker refuses is reported as `Unauthorized`.
    async fn subscribe(&mut self, topic: &str) -> Result<(), SessionFailure>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), SessionFailure>;

    /// Drain whatever arrived since the last call without blocking for long.
    /// Never reconnects a dropped session.
    async fn poll_inbound(&mut self) -> Vec<InboundMessage>;
}

/// `rumqttc` session driven entirely from the caller's loop.
pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    connected: bool,
    op_timeout: Duration,
    inbound: Vec<InboundMessage>,
}

impl MqttSession {
    pub fn new(config: &config::MqttConfig, client_id: &str) -> Self {
        let mut mqttoptions = MqttOptions::new(client_id, config.host.clone(), config.port());

        mqttoptions.set_keep_alive(config.keep_alive());
        mqttoptions.set_clean_session(true);
        let max_packet = config.max_packet_bytes();
        mqttoptions.set_max_packet_size(max_packet, max_packet);

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        if config.tls() {
            mqttoptions.set_transport(Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 10);

        MqttSession {
            client,
            eventloop,
            connected: false,
            op_timeout: config.connect_timeout(),
            inbound: Vec::new(),
        }
    }

    /// Poll the event loop until `done` accepts an event or the deadline passes.
    async fn drive_until<F>(&mut self, mut done: F) -> Result<(), SessionFailure>
    where
        F: FnMut(&Event) -> Option<Result<(), SessionFailure>>,
    {
        let deadline = Instant::now() + self.op_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = match timeout(remaining, self.eventloop.poll()).await {
                Err(_) => return Err(SessionFailure::Timeout),
                Ok(Err(e)) => {
                    debug!("MQTT event loop error: {:?}", e);
                    self.connected = false;
                    return Err(SessionFailure::from_connection_error(&e));
                }
                Ok(Ok(event)) => event,
            };
            self.record(&event);
            if let Some(result) = done(&event) {
                return result;
            }
        }
    }

    fn record(&mut self, event: &Event) {
        match event {
            Event::Incoming(Packet::Publish(p)) => {
                self.inbound.push(InboundMessage {
                    topic: p.topic.clone(),
                    payload: p.payload.to_vec(),
                });
            }
            Event::Incoming(Packet::ConnAck(ack)) => {
                self.connected = ack.code == ConnectReturnCode::Success;
            }
            Event::Incoming(Packet::Disconnect) | Event::Outgoing(Outgoing::Disconnect) => {
                self.connected = false;
            }
            _ => {}
        }
    }
}

impl BrokerSession for MqttSession {
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), SessionFailure> {
        if self.connected {
            return Ok(());
        }
        self.drive_until(|event| match event {
            Event::Incoming(Packet::ConnAck(ack)) if ack.code == ConnectReturnCode::Success => {
                Some(Ok(()))
            }
            Event::Incoming(Packet::ConnAck(ack)) => {
                Some(Err(SessionFailure::from_return_code(ack.code)))
            }
            _ => None,
        })
        .await
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), SessionFailure> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|_| SessionFailure::Disconnected)?;
        self.drive_until(|event| match event {
            Event::Incoming(Packet::SubAck(ack)) => {
                if ack
                    .return_codes
                    .iter()
                    .all(|c| matches!(c, SubscribeReasonCode::Success(_)))
                {
                    Some(Ok(()))
                } else {
                    Some(Err(SessionFailure::Unauthorized))
                }
            }
            _ => None,
        })
        .await
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), SessionFailure> {
        self.client
            .publish(topic, QoS::AtMostOnce, retain, payload)
            .await
            .map_err(|_| SessionFailure::Disconnected)?;
        // QoS 0 has no ack; the publish is done once it has been written out.
        self.drive_until(|event| match event {
            Event::Outgoing(Outgoing::Publish(_)) => Some(Ok(())),
            _ => None,
        })
        .await
    }

    async fn poll_inbound(&mut self) -> Vec<InboundMessage> {
        // polling here would let rumqttc reconnect outside `connect`
        if !self.connected {
            return std::mem::take(&mut self.inbound);
        }
        for _ in 0..MAX_EVENTS_PER_SERVICE {
            match timeout(SERVICE_WINDOW, self.eventloop.poll()).await {
                Err(_) => break,
                Ok(Ok(event)) => self.record(&event),
                Ok(Err(e)) => {
                    warn!(
                        "MQTT session dropped: {}",
                        SessionFailure::from_connection_error(&e)
                    );
                    self.connected = false;
                    break;
                }
            }
        }
        std::mem::take(&mut self.inbound)
    }
}

/// Client identity: the configured override, or `prefix` followed by the
/// first four octets of the hardware address in unpadded lowercase hex.
pub fn client_identity(config: &config::MqttConfig) -> String {
    if let Some(id) = &config.client_id {
        return id.clone();
    }
    let mac = config.mac_address.or_else(|| match mac_address::get_mac_address() {
        Ok(mac) => mac,
        Err(e) => {
            warn!("Could not read hardware address: {}", e);
            None
        }
    });
    let id = derive_identity(config.client_prefix(), mac);
    info!("Derived MQTT client id {}", id);
    id
}

fn derive_identity(prefix: &str, mac: Option<MacAddress>) -> String {
    let bytes = mac.map(|m| m.bytes()).unwrap_or_default();
    let suffix: String = bytes[..4].iter().map(|b| format!("{:x}", b)).collect();
    format!("{}{}", prefix, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::Connectivity;
    use crate::connectivity::tests::{MockNetwork, policy};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Minimal MQTT 3.1.1 broker on a loopback port.
    struct LoopbackBroker {
        port: u16,
        connects: Arc<AtomicU32>,
        subscribes: Arc<AtomicU32>,
    }

    impl LoopbackBroker {
        /// `refuse_first` answers the first CONNECT with "not authorized".
        /// `control` is published to the subscriber right after each SUBACK.
        async fn start(refuse_first: bool, control: Option<Vec<u8>>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let connects = Arc::new(AtomicU32::new(0));
            let subscribes = Arc::new(AtomicU32::new(0));
            let (c, s) = (connects.clone(), subscribes.clone());
            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    while let Some((header, body)) = read_packet(&mut stream).await {
                        match header >> 4 {
                            1 => {
                                let n = c.fetch_add(1, Ordering::SeqCst);
                                let code = if refuse_first && n == 0 { 5 } else { 0 };
                                stream.write_all(&[0x20, 0x02, 0x00, code]).await.unwrap();
                                if code != 0 {
                                    break;
                                }
                            }
                            8 => {
                                s.fetch_add(1, Ordering::SeqCst);
                                let suback = [0x90, 0x03, body[0], body[1], 0x00];
                                stream.write_all(&suback).await.unwrap();
                                if let Some(payload) = &control {
                                    let packet = publish_packet("smartparking/control", payload);
                                    stream.write_all(&packet).await.unwrap();
                                }
                            }
                            12 => stream.write_all(&[0xd0, 0x00]).await.unwrap(),
                            14 => break,
                            _ => {}
                        }
                    }
                }
            });
            LoopbackBroker {
                port,
                connects,
                subscribes,
            }
        }

        fn config(&self) -> config::MqttConfig {
            toml::de::from_str(&format!(
                "host = \"127.0.0.1\"\nport = {}\ntls = false\nconnect_timeout_ms = 2000",
                self.port
            ))
            .unwrap()
        }

        fn connects(&self) -> u32 {
            self.connects.load(Ordering::SeqCst)
        }

        fn subscribes(&self) -> u32 {
            self.subscribes.load(Ordering::SeqCst)
        }
    }

    async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let header = stream.read_u8().await.ok()?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.ok()?;
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.ok()?;
        Some((header, body))
    }

    fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = (topic.len() as u16).to_be_bytes().to_vec();
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload);

        let mut packet = vec![0x30];
        let mut len = body.len();
        loop {
            let byte = (len % 128) as u8;
            len /= 128;
            packet.push(if len > 0 { byte | 0x80 } else { byte });
            if len == 0 {
                break;
            }
        }
        packet.extend(body);
        packet
    }

    async fn drain(session: &mut MqttSession) -> Vec<InboundMessage> {
        let mut received = Vec::new();
        for _ in 0..50 {
            received.extend(session.poll_inbound().await);
            if !received.is_empty() {
                break;
            }
        }
        received
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let broker = LoopbackBroker::start(false, Some(b"reset".to_vec())).await;
        let mut session = MqttSession::new(&broker.config(), "dev");
        assert!(!session.is_connected());

        session.connect().await.unwrap();
        assert!(session.is_connected());
        session.subscribe("smartparking/control").await.unwrap();
        assert_eq!(broker.subscribes(), 1);

        let received = drain(&mut session).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].topic, "smartparking/control");
        assert_eq!(received[0].payload_text(), "reset");

        session
            .publish("smartparking/status", b"{}".to_vec(), true)
            .await
            .unwrap();
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_large_control_message_keeps_session() {
        let payload = vec![b'x'; 600];
        let broker = LoopbackBroker::start(false, Some(payload.clone())).await;
        let mut session = MqttSession::new(&broker.config(), "dev");
        session.connect().await.unwrap();
        session.subscribe("smartparking/control").await.unwrap();

        let received = drain(&mut session).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload, payload);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_refused_connect_maps_to_unauthorized() {
        let broker = LoopbackBroker::start(true, None).await;
        let mut session = MqttSession::new(&broker.config(), "dev");
        assert_eq!(session.connect().await, Err(SessionFailure::Unauthorized));
        assert!(!session.is_connected());
        session.connect().await.unwrap();
        assert_eq!(broker.connects(), 2);
    }

    #[tokio::test]
    async fn test_dropped_session_reconnects_only_through_connect() {
        let broker = LoopbackBroker::start(true, None).await;
        let session = MqttSession::new(&broker.config(), "dev");
        let mut policy = policy();
        policy.broker_attempts = 1;
        let mut conn = Connectivity::new(MockNetwork::up(), session, policy, "dev");

        conn.ensure_session().await.unwrap();
        conn.service().await;
        assert!(!conn.is_session_connected());
        assert_eq!(broker.connects(), 1);

        conn.ensure_session().await.unwrap();
        conn.service().await;
        assert!(conn.is_session_connected());
        assert_eq!(broker.connects(), 2);
        assert_eq!(broker.subscribes(), 1);
    }

    #[test]
    fn test_refusal_codes() {
        let cases = [
            (ConnectReturnCode::RefusedProtocolVersion, SessionFailure::BadProtocol),
            (ConnectReturnCode::BadClientId, SessionFailure::BadClientId),
            (ConnectReturnCode::ServiceUnavailable, SessionFailure::Unavailable),
            (ConnectReturnCode::BadUserNamePassword, SessionFailure::BadCredentials),
            (ConnectReturnCode::NotAuthorized, SessionFailure::Unauthorized),
        ];
        for (code, expected) in cases {
            let err = ConnectionError::ConnectionRefused(code);
            assert_eq!(SessionFailure::from_connection_error(&err), expected);
        }
    }

    #[test]
    fn test_transport_errors() {
        let io = |kind| ConnectionError::Io(std::io::Error::new(kind, "test"));
        assert_eq!(
            SessionFailure::from_connection_error(&io(ErrorKind::TimedOut)),
            SessionFailure::Timeout
        );
        assert_eq!(
            SessionFailure::from_connection_error(&io(ErrorKind::ConnectionReset)),
            SessionFailure::ConnectionLost
        );
        assert_eq!(
            SessionFailure::from_connection_error(&io(ErrorKind::ConnectionRefused)),
            SessionFailure::ConnectFailed
        );
        assert_eq!(
            SessionFailure::from_connection_error(&ConnectionError::NetworkTimeout),
            SessionFailure::Timeout
        );
        assert_eq!(
            SessionFailure::from_connection_error(&ConnectionError::RequestsDone),
            SessionFailure::Disconnected
        );
    }

    #[test]
    fn test_failure_display() {
        assert_eq!(
            SessionFailure::Unauthorized.to_string(),
            "MQTT_CONNECT_UNAUTHORIZED (5)"
        );
        assert_eq!(SessionFailure::Timeout.to_string(), "MQTT_CONNECTION_TIMEOUT (-4)");
    }

    #[test]
    fn test_derive_identity() {
        let mac = MacAddress::new([0x24, 0x0a, 0xc4, 0x01, 0x02, 0x03]);
        assert_eq!(derive_identity("ESP32-", Some(mac)), "ESP32-24ac41");
        assert_eq!(derive_identity("lot-a-", None), "lot-a-0000");
    }

    #[test]
    fn test_identity_override() {
        let config: config::MqttConfig = toml::de::from_str(
            r#"
            host = "localhost"
            client_id = "gate-7"
        "#,
        )
        .unwrap();
        assert_eq!(client_identity(&config), "gate-7");

        let config: config::MqttConfig = toml::de::from_str(
            r#"
            host = "localhost"
            client_prefix = "lot-"
            mac_address = "de:ad:be:ef:00:01"
        "#,
        )
        .unwrap();
        assert_eq!(client_identity(&config), "lot-deadbeef");
    }
}
