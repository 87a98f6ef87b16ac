//! Static configuration, read once from the environment at startup.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use backoff::strategy::exponential::Exponential;
use smartcity_kafka::{KafkaSaslAuth, TlsConfig};
use tracing::info;

use crate::schema::{StreamDefinition, registry};
use crate::store::StorageLocation;
use crate::{Error, Result};

const ENV_KAFKA_BROKERS: &str = "SMARTCITY_KAFKA_BROKERS";
const ENV_KAFKA_CONSUMER_GROUP: &str = "SMARTCITY_KAFKA_CONSUMER_GROUP";
const ENV_KAFKA_PARTITION: &str = "SMARTCITY_KAFKA_PARTITION";
const ENV_KAFKA_CONFIG: &str = "SMARTCITY_KAFKA_CONFIG";
const ENV_KAFKA_SASL_MECHANISM: &str = "SMARTCITY_KAFKA_SASL_MECHANISM";
const ENV_KAFKA_SASL_USERNAME: &str = "SMARTCITY_KAFKA_SASL_USERNAME";
const ENV_KAFKA_SASL_PASSWORD: &str = "SMARTCITY_KAFKA_SASL_PASSWORD";
const ENV_KAFKA_TLS_ENABLED: &str = "SMARTCITY_KAFKA_TLS_ENABLED";
const ENV_KAFKA_TLS_CA_CERT: &str = "SMARTCITY_KAFKA_TLS_CA_CERT";
const ENV_KAFKA_TLS_INSECURE_SKIP_VERIFY: &str = "SMARTCITY_KAFKA_TLS_INSECURE_SKIP_VERIFY";
const ENV_READ_BATCH_SIZE: &str = "SMARTCITY_READ_BATCH_SIZE";
const ENV_READ_TIMEOUT: &str = "SMARTCITY_READ_TIMEOUT";
const ENV_STORAGE_PREFIX: &str = "SMARTCITY_STORAGE_PREFIX";
const ENV_AWS_ACCESS_KEY: &str = "AWS_ACCESS_KEY";
const ENV_AWS_SECRET_KEY: &str = "AWS_SECRET_KEY";
const ENV_AWS_REGION: &str = "AWS_REGION";
const ENV_AWS_ENDPOINT: &str = "AWS_ENDPOINT";
const ENV_LATENESS_TOLERANCE: &str = "SMARTCITY_LATENESS_TOLERANCE";
const ENV_STARTING_OFFSET: &str = "SMARTCITY_STARTING_OFFSET";
const ENV_RETRY_MAX_ATTEMPTS: &str = "SMARTCITY_RETRY_MAX_ATTEMPTS";
const ENV_RETRY_BASE_INTERVAL: &str = "SMARTCITY_RETRY_BASE_INTERVAL";
const ENV_RETRY_MAX_INTERVAL: &str = "SMARTCITY_RETRY_MAX_INTERVAL";
const ENV_DEAD_LETTER_ENABLED: &str = "SMARTCITY_DEAD_LETTER_ENABLED";
const ENV_METRICS_PORT: &str = "SMARTCITY_METRICS_PORT";
const ENV_DEBUG: &str = "SMARTCITY_DEBUG";

const DEFAULT_KAFKA_BROKERS: &str = "broker:29092";
const DEFAULT_CONSUMER_GROUP: &str = "smartcity-ingest";
const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_LATENESS_TOLERANCE: Duration = Duration::from_secs(5 * 60);
const DEFAULT_RETRY_MAX_ATTEMPTS: usize = 10;
const DEFAULT_RETRY_BASE_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_RETRY_MAX_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSettings {
    pub brokers: Vec<String>,
    pub consumer_group: String,
    pub partition: i32,
    pub raw_config: HashMap<String, String>,
    pub auth: Option<KafkaSaslAuth>,
    pub tls: Option<TlsConfig>,
}

#[derive(Clone, PartialEq)]
pub struct StorageSettings {
    /// The prefix as configured, used in checkpoints and logs.
    pub prefix: String,
    pub location: StorageLocation,
    /// Options handed to the S3 builder.
    pub options: Vec<(String, String)>,
}

// credentials stay out of the logs
impl fmt::Debug for StorageSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageSettings")
            .field("prefix", &self.prefix)
            .field("location", &self.location)
            .field(
                "options",
                &self.options.iter().map(|(k, _)| k).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Bounded exponential backoff used for the bus and the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub base_interval: Duration,
    pub max_interval: Duration,
}

impl RetrySettings {
    pub fn backoff(&self) -> Exponential {
        Exponential::new(self.base_interval, self.max_interval)
            .with_jitter(0.1)
            .with_max_attempts(self.max_attempts)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_interval: DEFAULT_RETRY_BASE_INTERVAL,
            max_interval: DEFAULT_RETRY_MAX_INTERVAL,
        }
    }
}

/// Per stream settings, one for every entry of the schema registry.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub definition: &'static StreamDefinition,
    pub topic: String,
    pub lateness_tolerance: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub kafka: KafkaSettings,
    pub read_batch_size: usize,
    pub read_timeout: Duration,
    pub storage: StorageSettings,
    pub streams: Vec<StreamSettings>,
    /// Offset a stream starts from when it has no checkpoint.
    pub starting_offset: i64,
    pub retry: RetrySettings,
    pub dead_letter_enabled: bool,
    pub metrics_port: Option<u16>,
    pub debug: bool,
}

impl Settings {
    /// Loads the settings from the given environment, e.g. `Settings::load(std::env::vars())`.
    pub fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .filter(|(key, _)| key.starts_with("SMARTCITY_") || key.starts_with("AWS_"))
            .collect();
        let get = |var: &str| env_vars.get(var).map(|v| v.trim()).filter(|v| !v.is_empty());

        let brokers: Vec<String> = get(ENV_KAFKA_BROKERS)
            .unwrap_or(DEFAULT_KAFKA_BROKERS)
            .split(',')
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .collect();
        if brokers.is_empty() {
            return Err(Error::Config(format!("{ENV_KAFKA_BROKERS} has no brokers")));
        }

        let partition: i32 = parse_or(&get, ENV_KAFKA_PARTITION, 0)?;
        if partition < 0 {
            return Err(Error::Config(format!(
                "{ENV_KAFKA_PARTITION} must not be negative, got {partition}"
            )));
        }

        let kafka = KafkaSettings {
            brokers,
            consumer_group: get(ENV_KAFKA_CONSUMER_GROUP)
                .unwrap_or(DEFAULT_CONSUMER_GROUP)
                .to_string(),
            partition,
            raw_config: parse_raw_config(get(ENV_KAFKA_CONFIG).unwrap_or_default())?,
            auth: sasl_auth(&get)?,
            tls: tls_config(&get)?,
        };

        let read_batch_size: usize = parse_or(&get, ENV_READ_BATCH_SIZE, DEFAULT_BATCH_SIZE)?;
        if read_batch_size == 0 {
            return Err(Error::Config(format!(
                "{ENV_READ_BATCH_SIZE} must be greater than zero"
            )));
        }
        let read_timeout = duration_or(&get, ENV_READ_TIMEOUT, DEFAULT_READ_TIMEOUT)?;
        if read_timeout.is_zero() {
            return Err(Error::Config(format!(
                "{ENV_READ_TIMEOUT} must be greater than zero"
            )));
        }

        let prefix = get(ENV_STORAGE_PREFIX)
            .ok_or_else(|| {
                Error::Config(format!("Environment variable {ENV_STORAGE_PREFIX} is not set"))
            })?
            .to_string();
        let storage = StorageSettings {
            location: StorageLocation::parse(&prefix)?,
            prefix,
            options: aws_options(&get),
        };

        let lateness_tolerance =
            duration_or(&get, ENV_LATENESS_TOLERANCE, DEFAULT_LATENESS_TOLERANCE)?;
        let mut streams = Vec::with_capacity(registry().len());
        let mut topics = HashSet::new();
        for definition in registry() {
            let env_name = definition.name.to_uppercase();
            let topic = get(format!("SMARTCITY_{env_name}_TOPIC").as_str())
                .unwrap_or(definition.name)
                .to_string();
            if !topics.insert(topic.clone()) {
                return Err(Error::Config(format!(
                    "Topic {topic} is configured for more than one stream"
                )));
            }
            streams.push(StreamSettings {
                definition,
                topic,
                lateness_tolerance: duration_or(
                    &get,
                    &format!("SMARTCITY_{env_name}_LATENESS_TOLERANCE"),
                    lateness_tolerance,
                )?,
            });
        }

        let starting_offset: i64 = parse_or(&get, ENV_STARTING_OFFSET, 0)?;
        if starting_offset < 0 {
            return Err(Error::Config(format!(
                "{ENV_STARTING_OFFSET} must not be negative, got {starting_offset}"
            )));
        }

        let retry = RetrySettings {
            max_attempts: parse_or(&get, ENV_RETRY_MAX_ATTEMPTS, DEFAULT_RETRY_MAX_ATTEMPTS)?,
            base_interval: duration_or(&get, ENV_RETRY_BASE_INTERVAL, DEFAULT_RETRY_BASE_INTERVAL)?,
            max_interval: duration_or(&get, ENV_RETRY_MAX_INTERVAL, DEFAULT_RETRY_MAX_INTERVAL)?,
        };
        if retry.base_interval > retry.max_interval {
            return Err(Error::Config(format!(
                "{ENV_RETRY_BASE_INTERVAL} ({:?}) exceeds {ENV_RETRY_MAX_INTERVAL} ({:?})",
                retry.base_interval, retry.max_interval
            )));
        }

        let settings = Settings {
            kafka,
            read_batch_size,
            read_timeout,
            storage,
            streams,
            starting_offset,
            retry,
            dead_letter_enabled: parse_or(&get, ENV_DEAD_LETTER_ENABLED, true)?,
            metrics_port: get(ENV_METRICS_PORT)
                .map(|port| parse(ENV_METRICS_PORT, port))
                .transpose()?,
            debug: parse_or(&get, ENV_DEBUG, false)?,
        };
        info!(?settings, "Loaded settings");
        Ok(settings)
    }

    pub fn stream(&self, name: &str) -> Option<&StreamSettings> {
        self.streams.iter().find(|s| s.definition.name == name)
    }
}

fn parse<T>(var: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .parse()
        .map_err(|e| Error::Config(format!("Invalid value {value:?} for {var}: {e}")))
}

fn parse_or<'a, T>(get: &impl Fn(&str) -> Option<&'a str>, var: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    get(var).map_or(Ok(default), |value| parse(var, value))
}

fn duration_or<'a>(
    get: &impl Fn(&str) -> Option<&'a str>,
    var: &str,
    default: Duration,
) -> Result<Duration> {
    get(var).map_or(Ok(default), |value| {
        humantime::parse_duration(value)
            .map_err(|e| Error::Config(format!("Invalid duration {value:?} for {var}: {e}")))
    })
}

/// `key=value,key=value` pairs of librdkafka options.
fn parse_raw_config(raw: &str) -> Result<HashMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::Config(format!("Invalid {ENV_KAFKA_CONFIG} entry {pair:?}, expected key=value"))
            })?;
            Ok((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn sasl_auth<'a>(get: &impl Fn(&str) -> Option<&'a str>) -> Result<Option<KafkaSaslAuth>> {
    let Some(mechanism) = get(ENV_KAFKA_SASL_MECHANISM) else {
        return Ok(None);
    };
    let required = |var: &str| {
        get(var).map(str::to_string).ok_or_else(|| {
            Error::Config(format!("{var} is required when {ENV_KAFKA_SASL_MECHANISM} is set"))
        })
    };
    Ok(Some(KafkaSaslAuth {
        mechanism: mechanism.to_uppercase(),
        username: required(ENV_KAFKA_SASL_USERNAME)?,
        password: required(ENV_KAFKA_SASL_PASSWORD)?,
    }))
}

fn tls_config<'a>(get: &impl Fn(&str) -> Option<&'a str>) -> Result<Option<TlsConfig>> {
    if !parse_or(get, ENV_KAFKA_TLS_ENABLED, false)? {
        return Ok(None);
    }
    Ok(Some(TlsConfig {
        insecure_skip_verify: parse_or(get, ENV_KAFKA_TLS_INSECURE_SKIP_VERIFY, false)?,
        ca_cert: get(ENV_KAFKA_TLS_CA_CERT).map(str::to_string),
    }))
}

/// Maps the AWS variables onto the S3 builder configuration keys.
fn aws_options<'a>(get: &impl Fn(&str) -> Option<&'a str>) -> Vec<(String, String)> {
    let mut options: Vec<(String, String)> = [
        (ENV_AWS_ACCESS_KEY, "aws_access_key_id"),
        (ENV_AWS_SECRET_KEY, "aws_secret_access_key"),
        (ENV_AWS_REGION, "aws_region"),
        (ENV_AWS_ENDPOINT, "aws_endpoint"),
    ]
    .into_iter()
    .filter_map(|(var, key)| get(var).map(|value| (key.to_string(), value.to_string())))
    .collect();

    // MinIO and other local endpoints are usually plain http
    if get(ENV_AWS_ENDPOINT).is_some_and(|endpoint| endpoint.starts_with("http://")) {
        options.push(("aws_allow_http".to_string(), "true".to_string()));
    }
    options
}
