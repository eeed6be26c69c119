use rumqttc::MqttOptions;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TOPIC: &str = "nec/tx";
pub const DEFAULT_CLIENT_ID: &str = "mqtt2nec";
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Broker connection settings, fixed for the lifetime of the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub topic: String,
    pub client_id: String,
    pub keep_alive: Duration,
}

impl MqttConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            credentials: None,
            topic: DEFAULT_TOPIC.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
        }
    }

    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true);

        if let Some(credentials) = &self.credentials {
            options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }

        options
    }
}
