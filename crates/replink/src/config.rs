//! Client configuration.
//!
//! The key strings in [`keys`] are the contract with the embedding
//! frontend's configuration loader; [`ClientConfig`] is the typed form this
//! library consumes. `REPLINK_*` environment variables override individual
//! fields for operational tuning.

use std::time::Duration;

use replink_core::rpc::RpcConfig;
use replink_core::sasl::SaslQop;
use replink_core::MECH_DIGEST_MD5;
use tracing::Level;

/// Configuration key names, as the frontend's config files spell them.
pub mod keys {
    pub const CONNECT_TIMEOUT_MS: &str = "replink.rpc.client.connect.timeout.ms";
    pub const HANDSHAKE_TIMEOUT_MS: &str = "replink.rpc.client.handshake.timeout.ms";
    pub const MAX_MESSAGE_SIZE: &str = "replink.rpc.max.message.size";
    pub const CHANNEL_LOG_LEVEL: &str = "replink.rpc.channel.log.level";
    pub const SASL_MECHANISMS: &str = "replink.rpc.sasl.mechanisms";
    pub const SASL_QOP: &str = "replink.rpc.sasl.qop";
    pub const REPL_JARS: &str = "replink.repl.jars";
    pub const REPL_DRIVER_CLASS_PATH: &str = "replink.repl.driver-class-path";
    pub const SESSION_KIND: &str = "replink.session.kind";
    pub const PROXY_USER: &str = "replink.session.proxy-user";
    pub const CLIENT_ID: &str = "replink.client.auth.id";
    pub const SECRET: &str = "replink.client.auth.secret";
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_message_size: usize,
    pub channel_log_level: Level,
    pub sasl_mechanism: String,
    pub sasl_qop: SaslQop,
    /// Jars placed on the remote repl's classpath.
    pub repl_jars: Option<String>,
    pub repl_driver_class_path: Option<String>,
    /// Identity presented during the SASL handshake.
    pub client_id: String,
    /// Shared secret backing the handshake.
    pub secret: String,
}

impl ClientConfig {
    pub fn new(client_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(90),
            max_message_size: 50 * 1024 * 1024,
            channel_log_level: Level::TRACE,
            sasl_mechanism: MECH_DIGEST_MD5.to_string(),
            sasl_qop: SaslQop::Auth,
            repl_jars: None,
            repl_driver_class_path: None,
            client_id: client_id.into(),
            secret: secret.into(),
        }
    }

    /// Fresh random credentials for a new session.
    pub fn generate_credentials() -> (String, String) {
        let id: [u8; 8] = rand::random();
        let secret: [u8; 16] = rand::random();
        (hex::encode(id), hex::encode(secret))
    }

    /// Apply `REPLINK_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = env_parse::<u64>("REPLINK_CONNECT_TIMEOUT_MS") {
            self.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("REPLINK_HANDSHAKE_TIMEOUT_MS") {
            self.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = env_parse::<usize>("REPLINK_MAX_MESSAGE_SIZE") {
            self.max_message_size = size;
        }
        if let Some(level) = env_parse::<Level>("REPLINK_CHANNEL_LOG_LEVEL") {
            self.channel_log_level = level;
        }
        self
    }

    /// The channel-level slice of this configuration.
    pub fn rpc(&self) -> RpcConfig {
        RpcConfig {
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
            max_message_size: self.max_message_size,
            channel_log_level: self.channel_log_level,
            mechanism: self.sasl_mechanism.clone(),
            qop: self.sasl_qop,
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|v| v.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ClientConfig::new("id", "secret");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.sasl_mechanism, MECH_DIGEST_MD5);
        assert_eq!(config.sasl_qop, SaslQop::Auth);
    }

    #[test]
    fn generated_credentials_are_distinct() {
        let (id_a, secret_a) = ClientConfig::generate_credentials();
        let (id_b, secret_b) = ClientConfig::generate_credentials();
        assert_ne!(id_a, id_b);
        assert_ne!(secret_a, secret_b);
        assert_eq!(id_a.len(), 16);
        assert_eq!(secret_a.len(), 32);
    }

    #[test]
    fn env_override_applies() {
        std::env::set_var("REPLINK_CONNECT_TIMEOUT_MS", "1234");
        let config = ClientConfig::new("id", "secret").with_env_overrides();
        assert_eq!(config.connect_timeout, Duration::from_millis(1234));
        std::env::remove_var("REPLINK_CONNECT_TIMEOUT_MS");
    }
}
