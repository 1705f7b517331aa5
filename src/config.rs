use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, bail};
use mac_address::MacAddress;
use serde_derive::Deserialize;

use crate::messages::SPACE_COUNT;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub network: Option<NetworkConfig>,
    pub mqtt: MqttConfig,
    pub sensing: Option<SensingConfig>,
    pub publish: Option<PublishConfig>,
    pub spaces: Vec<SpacePins>,
    pub simulation: Option<SimulationConfig>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct NetworkConfig {
    pub ssid: Option<String>,
    pub password: Option<String>,
    pub attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub restart_delay_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub tls: Option<bool>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Overrides the identity derived from the hardware address.
    pub client_id: Option<String>,
    pub client_prefix: Option<String>,
    /// Overrides the hardware address read from the host.
    pub mac_address: Option<MacAddress>,
    pub status_topic: Option<String>,
    pub control_topic: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    pub connect_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    /// Largest packet accepted from or sent to the broker.
    pub max_packet_bytes: Option<usize>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct SensingConfig {
    pub threshold_cm: Option<f32>,
    pub echo_timeout_us: Option<u64>,
    /// Centimeters of distance per microsecond of echo pulse.
    pub cm_per_us: Option<f32>,
    pub inter_sensor_delay_ms: Option<u64>,
    pub loop_delay_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PublishConfig {
    pub interval_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpacePins {
    pub trigger: u8,
    pub echo: u8,
    pub green: u8,
    pub red: u8,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct SimulationConfig {
    /// Distance in front of each sensor; zero or negative means nothing in range.
    pub distances: Option<Vec<f32>>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = Self::parse(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::de::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.spaces.len() != SPACE_COUNT {
            bail!(
                "expected {} [[spaces]] entries, found {}",
                SPACE_COUNT,
                self.spaces.len()
            );
        }
        let threshold = self.sensing().threshold_cm();
        if threshold.is_nan() || threshold <= 0.0 {
            bail!("sensing.threshold_cm must be positive, got {}", threshold);
        }
        if let Some(distances) = self.simulation.as_ref().and_then(|s| s.distances.as_ref()) {
            if distances.len() != SPACE_COUNT {
                bail!(
                    "simulation.distances needs {} values, found {}",
                    SPACE_COUNT,
                    distances.len()
                );
            }
        }
        Ok(())
    }

    pub fn network(&self) -> NetworkConfig {
        self.network.clone().unwrap_or_default()
    }

    pub fn sensing(&self) -> SensingConfig {
        self.sensing.clone().unwrap_or_default()
    }

    pub fn publish(&self) -> PublishConfig {
        self.publish.clone().unwrap_or_default()
    }

    pub fn simulation(&self) -> SimulationConfig {
        self.simulation.clone().unwrap_or_default()
    }
}

impl NetworkConfig {
    pub fn ssid(&self) -> &str {
        self.ssid.as_deref().unwrap_or("Wokwi-GUEST")
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.unwrap_or(30)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.unwrap_or(500))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms.unwrap_or(5_000))
    }
}

impl MqttConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8883)
    }

    pub fn tls(&self) -> bool {
        self.tls.unwrap_or(true)
    }

    pub fn client_prefix(&self) -> &str {
        self.client_prefix.as_deref().unwrap_or("ESP32-")
    }

    pub fn status_topic(&self) -> &str {
        self.status_topic.as_deref().unwrap_or("smartparking/status")
    }

    pub fn control_topic(&self) -> &str {
        self.control_topic.as_deref().unwrap_or("smartparking/control")
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_seconds.unwrap_or(15))
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.unwrap_or(5)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.unwrap_or(3_000))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(10_000))
    }

    pub fn max_packet_bytes(&self) -> usize {
        self.max_packet_bytes.unwrap_or(10 * 1024)
    }
}

impl SensingConfig {
    pub fn threshold_cm(&self) -> f32 {
        self.threshold_cm.unwrap_or(50.0)
    }

    pub fn echo_timeout(&self) -> Duration {
        Duration::from_micros(self.echo_timeout_us.unwrap_or(30_000))
    }

    pub fn cm_per_us(&self) -> f32 {
        self.cm_per_us.unwrap_or(0.01715)
    }

    pub fn inter_sensor_delay(&self) -> Duration {
        Duration::from_millis(self.inter_sensor_delay_ms.unwrap_or(100))
    }

    pub fn loop_delay(&self) -> Duration {
        Duration::from_millis(self.loop_delay_ms.unwrap_or(500))
    }
}

impl PublishConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.unwrap_or(2_000))
    }
}

impl SimulationConfig {
    pub fn distances(&self) -> Vec<f32> {
        self.distances
            .clone()
            .unwrap_or_else(|| vec![0.0; SPACE_COUNT])
    }
}
