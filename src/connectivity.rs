//! Network link and broker session supervision.
//!
//! The network link gets a fixed number of polls to come up; running out is
//! unrecoverable and reported as [`RestartRequired`]. Broker failures are soft:
//! a bounded number of attempts per call, then the caller tries again on its
//! next tick.

use std::time::Duration;

use log::{error, info, warn};
use tokio::time::sleep;

use crate::config::AppConfig;
use crate::messages::InboundMessage;
use crate::mqtt::{BrokerSession, SessionFailure};
use crate::network::NetworkLink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// The network link could not be brought up within its attempt budget.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
#[error("network link still down after {attempts} attempts")]
pub struct RestartRequired {
    pub attempts: u32,
}

pub type MessageHandler = Box<dyn FnMut(&InboundMessage)>;

#[derive(Debug, Clone)]
pub struct Policy {
    pub ssid: String,
    pub password: String,
    pub network_attempts: u32,
    pub network_retry_delay: Duration,
    pub broker_attempts: u32,
    pub broker_retry_delay: Duration,
    pub broker_label: String,
    pub username: Option<String>,
    pub control_topic: String,
}

impl Policy {
    pub fn from_config(config: &AppConfig) -> Self {
        let network = config.network();
        Policy {
            ssid: network.ssid().to_string(),
            password: network.password.clone().unwrap_or_default(),
            network_attempts: network.attempts(),
            network_retry_delay: network.retry_delay(),
            broker_attempts: config.mqtt.connect_attempts(),
            broker_retry_delay: config.mqtt.retry_delay(),
            broker_label: format!("{}:{}", config.mqtt.host, config.mqtt.port()),
            username: config.mqtt.username.clone(),
            control_topic: config.mqtt.control_topic().to_string(),
        }
    }
}

pub struct Connectivity<N, B> {
    network: N,
    broker: B,
    policy: Policy,
    client_id: String,
    network_state: LinkState,
    broker_state: LinkState,
    handler: MessageHandler,
}

impl<N: NetworkLink, B: BrokerSession> Connectivity<N, B> {
    pub fn new(network: N, broker: B, policy: Policy, client_id: &str) -> Self {
        Connectivity {
            network,
            broker,
            policy,
            client_id: client_id.to_string(),
            network_state: LinkState::Disconnected,
            broker_state: LinkState::Disconnected,
            handler: Box::new(log_message),
        }
    }

    /// Replace the handler that inbound control messages are dispatched to.
    #[allow(dead_code)]
    pub fn on_message<F>(&mut self, handler: F)
    where
        F: FnMut(&InboundMessage) + 'static,
    {
        self.handler = Box::new(handler);
    }

    pub fn network_state(&self) -> LinkState {
        self.network_state
    }

    pub fn broker_state(&self) -> LinkState {
        self.broker_state
    }

    pub fn is_session_connected(&self) -> bool {
        self.broker_state == LinkState::Connected && self.broker.is_connected()
    }

    #[cfg(test)]
    pub(crate) fn broker_ref(&self) -> &B {
        &self.broker
    }

    #[cfg(test)]
    pub(crate) fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    pub async fn ensure_network(&mut self) -> Result<(), RestartRequired> {
        info!("Connecting to WiFi: {}", self.policy.ssid);
        self.network_state = LinkState::Connecting;
        self.network.begin(&self.policy.ssid, &self.policy.password);

        let mut attempts = 0;
        let mut up = self.network.is_connected();
        while !up && attempts < self.policy.network_attempts {
            sleep(self.policy.network_retry_delay).await;
            attempts += 1;
            up = self.network.is_connected();
        }

        if !up {
            self.network_state = LinkState::Disconnected;
            error!("WiFi connection failed after {} attempts", attempts);
            return Err(RestartRequired { attempts });
        }

        self.network_state = LinkState::Connected;
        info!("WiFi connected: {}", self.network.describe());
        Ok(())
    }

    /// Bring the broker session back if it has dropped. Called once per tick.
    pub async fn ensure_session(&mut self) -> Result<(), RestartRequired> {
        if self.broker.is_connected() {
            self.broker_state = LinkState::Connected;
            return Ok(());
        }
        self.broker_state = LinkState::Disconnected;

        if !self.network.is_connected() {
            warn!("WiFi not connected - cannot connect to MQTT");
            self.network_state = LinkState::Disconnected;
            return self.ensure_network().await;
        }
        self.network_state = LinkState::Connected;

        self.connect_broker().await;
        Ok(())
    }

    async fn connect_broker(&mut self) {
        self.broker_state = LinkState::Connecting;
        let mut attempts = 0;
        while attempts < self.policy.broker_attempts {
            info!(
                "Attempting MQTT connection to {} as {} (user {})",
                self.policy.broker_label,
                self.client_id,
                self.policy.username.as_deref().unwrap_or("-")
            );
            match self.broker.connect().await {
                Ok(()) => {
                    self.broker_state = LinkState::Connected;
                    info!("MQTT connected");
                    match self.broker.subscribe(&self.policy.control_topic).await {
                        Ok(()) => info!("Subscribed to {}", self.policy.control_topic),
                        Err(failure) => warn!(
                            "Subscribe to {} failed: {}",
                            self.policy.control_topic, failure
                        ),
                    }
                    return;
                }
                Err(failure) => {
                    report_failure(failure);
                    attempts += 1;
                    if attempts < self.policy.broker_attempts {
                        info!("Retrying in {:?}", self.policy.broker_retry_delay);
                        sleep(self.policy.broker_retry_delay).await;
                    }
                }
            }
        }
        self.broker_state = LinkState::Disconnected;
        warn!("Could not connect to MQTT broker, continuing without MQTT");
    }

    /// Dispatch everything received since the last call to the handler.
    pub async fn service(&mut self) -> usize {
        let messages = self.broker.poll_inbound().await;
        for message in &messages {
            (self.handler)(message);
        }
        if !self.broker.is_connected() {
            self.broker_state = LinkState::Disconnected;
        }
        messages.len()
    }

    pub async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), SessionFailure> {
        let result = self.broker.publish(topic, payload, retain).await;
        if !self.broker.is_connected() {
            self.broker_state = LinkState::Disconnected;
        }
        result
    }
}

fn report_failure(failure: SessionFailure) {
    error!("MQTT connection failed: {}", failure);
    if failure == SessionFailure::Unauthorized {
        error!("Check the MQTT username and password");
    }
}

fn log_message(message: &InboundMessage) {
    info!(
        "Message received [{}]: {}",
        message.topic,
        message.payload_text()
    );
}
