//! MQTT broker credentials
//!
//! The broker address and login live in persistent storage rather than in
//! the firmware image, so each field is a fixed-capacity string that mirrors
//! the stored record (see [`crate::storage`]).

use core::fmt::{Debug, Display, Formatter};

use heapless::String;
use log::warn;
use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;

use crate::config::{MQTT_HOST_CAPACITY, MQTT_PASS_CAPACITY, MQTT_PORT_CAPACITY, MQTT_USER_CAPACITY};

/// Credential fields, in storage order
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoStaticStr)]
pub enum Field {
    #[strum(serialize = "host")]
    Host,
    #[strum(serialize = "port")]
    Port,
    #[strum(serialize = "user")]
    User,
    #[strum(serialize = "password")]
    Password,
}

/// Broker connection parameters.
///
/// An empty field means "not configured". `Default` is all empty, which is
/// also what a device with blank storage runs with. Deserializing goes
/// through [`MqttCredentials::new`], so stored values get the same checks.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StoredCredentials")]
pub struct MqttCredentials {
    host: String<MQTT_HOST_CAPACITY>,
    port: String<MQTT_PORT_CAPACITY>,
    user: String<MQTT_USER_CAPACITY>,
    password: String<MQTT_PASS_CAPACITY>,
}

impl MqttCredentials {
    /// Create credentials, checking capacities and the port format
    pub fn new(host: &str, port: &str, user: &str, password: &str) -> Result<Self, Error> {
        if !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidPort);
        }

        Ok(Self {
            host: bounded(host, Field::Host)?,
            port: bounded(port, Field::Port)?,
            user: bounded(user, Field::User)?,
            password: bounded(password, Field::Password)?,
        })
    }

    /// Credentials baked into the image at build time.
    ///
    /// Reads `MQTT_HOSTNAME`, `MQTT_PORT`, `MQTT_USERNAME` and `MQTT_PASSWORD`
    /// from the build environment. Missing variables become empty fields and
    /// invalid values yield empty credentials.
    pub fn provisioned() -> Self {
        let credentials = Self::new(
            option_env!("MQTT_HOSTNAME").unwrap_or_default(),
            option_env!("MQTT_PORT").unwrap_or_default(),
            option_env!("MQTT_USERNAME").unwrap_or_default(),
            option_env!("MQTT_PASSWORD").unwrap_or_default(),
        );

        credentials.unwrap_or_else(|e| {
            warn!("Ignoring build-time MQTT credentials: {}", e);
            Self::default()
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port exactly as stored
    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Parsed port, `None` if empty, zero or out of range
    pub fn port_number(&self) -> Option<u16> {
        self.port.parse::<u16>().ok().filter(|&port| port != 0)
    }

    /// Whether there is enough to attempt a broker connection
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && self.port_number().is_some()
    }

    /// The field named by `field`
    pub fn field(&self, field: Field) -> &str {
        match field {
            Field::Host => self.host(),
            Field::Port => self.port(),
            Field::User => self.user(),
            Field::Password => self.password(),
        }
    }
}

impl Debug for MqttCredentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MqttCredentials")
            .field("host", &self.host.as_str())
            .field("port", &self.port.as_str())
            .field("user", &self.user.as_str())
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .finish()
    }
}

/// Unchecked wire form of [`MqttCredentials`]
#[derive(Deserialize)]
struct StoredCredentials {
    host: String<MQTT_HOST_CAPACITY>,
    port: String<MQTT_PORT_CAPACITY>,
    user: String<MQTT_USER_CAPACITY>,
    password: String<MQTT_PASS_CAPACITY>,
}

impl TryFrom<StoredCredentials> for MqttCredentials {
    type Error = Error;

    fn try_from(stored: StoredCredentials) -> Result<Self, Self::Error> {
        Self::new(&stored.host, &stored.port, &stored.user, &stored.password)
    }
}

fn bounded<const N: usize>(value: &str, field: Field) -> Result<String<N>, Error> {
    String::try_from(value).map_err(|_| Error::TooLong { field, max: N })
}

/// A credentials error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    TooLong { field: Field, max: usize },
    InvalidPort,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::TooLong { field, max } => {
                write!(f, "MQTT {} is longer than {} characters", <&str>::from(*field), max)
            }
            Error::InvalidPort => write!(f, "MQTT port must be digits only"),
        }
    }
}
