//! Kafka consumer for the ingestion chains. Every chain owns one [`KafkaSource`] bound to a single
//! topic-partition, and reads it from explicit offsets handed in by the caller. The consumer never
//! commits offsets to the broker; the position of record is the caller's checkpoint.

use std::fmt;

use rdkafka::config::ClientConfig;
use tracing::warn;

pub mod source;

pub use source::{KafkaMessage, KafkaSource, KafkaSourceConfig};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("{0}")]
    Other(String),
}

/// SASL credentials used to authenticate with the brokers.
#[derive(Clone, PartialEq)]
pub struct KafkaSaslAuth {
    /// e.g. `PLAIN`, `SCRAM-SHA-256`
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for KafkaSaslAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaSaslAuth")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TlsConfig {
    pub insecure_skip_verify: bool,
    /// Path to the CA certificate file.
    pub ca_cert: Option<String>,
}

pub(crate) fn update_auth_config(
    client_config: &mut ClientConfig,
    tls: Option<TlsConfig>,
    auth: Option<KafkaSaslAuth>,
) {
    let protocol = match (&tls, &auth) {
        (Some(_), Some(_)) => "SASL_SSL",
        (None, Some(_)) => "SASL_PLAINTEXT",
        (Some(_), None) => "SSL",
        (None, None) => "PLAINTEXT",
    };
    client_config.set("security.protocol", protocol);

    if let Some(auth) = auth {
        client_config
            .set("sasl.mechanisms", auth.mechanism)
            .set("sasl.username", auth.username)
            .set("sasl.password", auth.password);
    }

    if let Some(tls) = tls {
        if tls.insecure_skip_verify {
            warn!(
                "'insecureSkipVerify' is set to true, certificate validation will not be performed when connecting to Kafka server"
            );
            client_config
                .set("enable.ssl.certificate.verification", "false")
                .set("ssl.endpoint.identification.algorithm", "none");
        }
        if let Some(ca_cert) = tls.ca_cert {
            client_config.set("ssl.ca.location", ca_cert);
        }
    }
}
