//! Typed, validated device settings
//!
//! [`Settings`] gathers the constants from [`crate::config`] into one owned
//! value that the rest of the firmware borrows. Intervals are
//! [`embassy_time::Duration`]s and bus addresses are [`I2cAddress`]es, so the
//! sanity checks in [`Settings::validate`] can run once at startup instead of
//! at every use site.

use core::fmt::{Display, Formatter, Write};

use embassy_time::{Duration, Instant};
use heapless::String;
use strum::IntoStaticStr;

use crate::config::{
    DISPLAY_I2C_ADDR, DISPLAY_RESET_PIN, DISPLAY_UPDATE_FREQUENCY_MS, HOSTNAME, LUX_METER_I2C_ADDR,
    LUX_METER_READ_FREQUENCY_MS, LUX_TEXT_CAPACITY, MQTT_MAX_PACKET_SIZE,
    MQTT_MAX_RECONNECT_TRIES, MQTT_RECONNECT_DELAY_MS, MQTT_SENSOR_CHANNEL,
    MQTT_UPDATE_FREQUENCY_MS, OTA_PASSWORD, SERIAL_BAUD_RATE, WATCHDOG_TIMEOUT_SECONDS,
    WIFI_TIMEOUT_MS,
};

/// Longest topic [`sensor_topic`] will build
pub const TOPIC_CAPACITY: usize = 64;
/// Longest hostname a DHCP client will announce
pub const HOSTNAME_CAPACITY: usize = 32;
/// Fixed header, topic length prefix and packet id of a PUBLISH packet
const PUBLISH_OVERHEAD: usize = 7;
const TOPIC_ROOT: &str = "sensors";

/// A 7-bit I2C bus address.
///
/// Addresses `0x00..=0x07` and `0x78..=0x7F` are reserved on the I2C bus
/// and rejected by [`I2cAddress::new`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct I2cAddress(u8);

impl I2cAddress {
    pub const FIRST: u8 = 0x08;
    pub const LAST: u8 = 0x77;

    /// Create an address, rejecting reserved and 10-bit values
    pub const fn new(address: u8) -> Option<Self> {
        if address >= Self::FIRST && address <= Self::LAST {
            Some(Self(address))
        } else {
            None
        }
    }

    /// Wrap a raw value without checking it, for use in constants.
    /// [`Settings::validate`] catches bad values later.
    pub const fn from_raw(address: u8) -> Self {
        Self(address)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        Self::new(self.0).is_some()
    }
}

impl Display for I2cAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Names of the configured intervals, used in validation errors
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoStaticStr)]
pub enum Interval {
    #[strum(serialize = "wifi timeout")]
    WifiTimeout,
    #[strum(serialize = "mqtt reconnect delay")]
    ReconnectDelay,
    #[strum(serialize = "mqtt publish interval")]
    Publish,
    #[strum(serialize = "display refresh interval")]
    DisplayRefresh,
    #[strum(serialize = "sensor read interval")]
    SensorRead,
    #[strum(serialize = "watchdog timeout")]
    Watchdog,
}

/// MQTT settings that do not come from persistent storage
#[derive(Clone, Debug, PartialEq)]
pub struct MqttSettings {
    pub max_packet_size: usize,
    pub max_reconnect_tries: u8,
    pub reconnect_delay: Duration,
    pub publish_interval: Duration,
    /// Where readings are published, `sensors/<device name>/<channel>`
    pub sensor_topic: String<TOPIC_CAPACITY>,
}

/// Owned device configuration
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub hostname: &'static str,
    pub ota_password: &'static str,
    pub wifi_timeout: Duration,
    pub serial_baud_rate: u32,
    pub display_address: I2cAddress,
    pub display_reset_pin: u8,
    pub lux_sensor_address: I2cAddress,
    pub mqtt: MqttSettings,
    pub display_refresh_interval: Duration,
    pub sensor_read_interval: Duration,
    pub watchdog_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self::with_hostname(HOSTNAME)
    }
}

impl Settings {
    /// The default settings for a device called `hostname`.
    ///
    /// The sensor topic is derived from the device name. A hostname that
    /// cannot form a topic leaves it empty, which [`Settings::validate`]
    /// rejects.
    pub fn with_hostname(hostname: &'static str) -> Self {
        let sensor_topic =
            sensor_topic(device_name(hostname), MQTT_SENSOR_CHANNEL).unwrap_or_default();

        Self {
            hostname,
            ota_password: OTA_PASSWORD,
            wifi_timeout: Duration::from_millis(WIFI_TIMEOUT_MS),
            serial_baud_rate: SERIAL_BAUD_RATE,
            display_address: I2cAddress::from_raw(DISPLAY_I2C_ADDR),
            display_reset_pin: DISPLAY_RESET_PIN,
            lux_sensor_address: I2cAddress::from_raw(LUX_METER_I2C_ADDR),
            mqtt: MqttSettings {
                max_packet_size: MQTT_MAX_PACKET_SIZE,
                max_reconnect_tries: MQTT_MAX_RECONNECT_TRIES,
                reconnect_delay: Duration::from_millis(MQTT_RECONNECT_DELAY_MS),
                publish_interval: Duration::from_millis(MQTT_UPDATE_FREQUENCY_MS),
                sensor_topic,
            },
            display_refresh_interval: Duration::from_millis(DISPLAY_UPDATE_FREQUENCY_MS),
            sensor_read_interval: Duration::from_millis(LUX_METER_READ_FREQUENCY_MS),
            watchdog_timeout: Duration::from_secs(WATCHDOG_TIMEOUT_SECONDS),
        }
    }

    /// First label of the hostname, e.g. `luxmeter1` for `luxmeter1.home`
    pub fn device_name(&self) -> &'static str {
        device_name(self.hostname)
    }

    /// The instant at which a Wi-Fi connection started at `started` gives
    /// up, `None` if that is past the end of time
    pub fn wifi_deadline(&self, started: Instant) -> Option<Instant> {
        started.checked_add(self.wifi_timeout)
    }

    fn intervals(&self) -> [(Interval, Duration); 6] {
        [
            (Interval::WifiTimeout, self.wifi_timeout),
            (Interval::ReconnectDelay, self.mqtt.reconnect_delay),
            (Interval::Publish, self.mqtt.publish_interval),
            (Interval::DisplayRefresh, self.display_refresh_interval),
            (Interval::SensorRead, self.sensor_read_interval),
            (Interval::Watchdog, self.watchdog_timeout),
        ]
    }

    /// Check the settings for values the firmware cannot work with.
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), Error> {
        let device = self.device_name();
        if device.is_empty() || self.hostname.len() > HOSTNAME_CAPACITY {
            return Err(Error::Hostname);
        }
        if self.ota_password.is_empty() {
            return Err(Error::EmptyOtaPassword);
        }

        for address in [self.display_address, self.lux_sensor_address] {
            if !address.is_valid() {
                return Err(Error::InvalidAddress(address.get()));
            }
        }
        if self.display_address == self.lux_sensor_address {
            return Err(Error::AddressConflict(self.display_address.get()));
        }

        if let Some((interval, _)) = self
            .intervals()
            .into_iter()
            .find(|(_, duration)| duration.as_ticks() == 0)
        {
            return Err(Error::ZeroInterval(interval));
        }

        if self.mqtt.max_reconnect_tries == 0 {
            return Err(Error::NoReconnectTries);
        }

        validate_topic(&self.mqtt.sensor_topic)?;
        if !is_device_topic(&self.mqtt.sensor_topic, device) {
            return Err(Error::ForeignTopic);
        }
        let needed = self.mqtt.sensor_topic.len() + LUX_TEXT_CAPACITY + PUBLISH_OVERHEAD;
        if needed > self.mqtt.max_packet_size {
            return Err(Error::PacketTooSmall {
                needed,
                max: self.mqtt.max_packet_size,
            });
        }

        Ok(())
    }
}

fn device_name(hostname: &str) -> &str {
    hostname.split('.').next().unwrap_or_default()
}

/// Whether `topic` is `sensors/<device>/<something>`
fn is_device_topic(topic: &str, device: &str) -> bool {
    topic
        .strip_prefix(TOPIC_ROOT)
        .and_then(|rest| rest.strip_prefix('/'))
        .and_then(|rest| rest.strip_prefix(device))
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|channel| !channel.is_empty())
}

/// Build a topic following the `sensors/<device>/<channel>` pattern
pub fn sensor_topic(device: &str, channel: &str) -> Result<String<TOPIC_CAPACITY>, Error> {
    if device.is_empty() || channel.is_empty() {
        return Err(Error::EmptyTopic);
    }

    let mut topic = String::new();
    write!(topic, "{}/{}/{}", TOPIC_ROOT, device, channel).map_err(|_| Error::TopicTooLong)?;
    validate_topic(&topic)?;
    Ok(topic)
}

fn validate_topic(topic: &str) -> Result<(), Error> {
    if topic.is_empty() {
        return Err(Error::EmptyTopic);
    }
    if topic.len() > TOPIC_CAPACITY {
        return Err(Error::TopicTooLong);
    }
    if topic.contains(['+', '#', '\0']) {
        return Err(Error::TopicWildcard);
    }
    Ok(())
}

/// A settings error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    Hostname,
    EmptyOtaPassword,
    InvalidAddress(u8),
    AddressConflict(u8),
    ZeroInterval(Interval),
    NoReconnectTries,
    EmptyTopic,
    TopicTooLong,
    TopicWildcard,
    /// The topic is not under `sensors/<device name>/`
    ForeignTopic,
    PacketTooSmall { needed: usize, max: usize },
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Hostname => write!(f, "Hostname must be 1 to {HOSTNAME_CAPACITY} characters"),
            Error::EmptyOtaPassword => write!(f, "OTA password is empty"),
            Error::InvalidAddress(a) => write!(f, "Invalid 7-bit I2C address {a:#04x}"),
            Error::AddressConflict(a) => write!(f, "Display and sensor share address {a:#04x}"),
            Error::ZeroInterval(i) => write!(f, "{} must be positive", <&str>::from(*i)),
            Error::NoReconnectTries => write!(f, "MQTT reconnect tries must be positive"),
            Error::EmptyTopic => write!(f, "MQTT topic is empty"),
            Error::TopicTooLong => write!(f, "MQTT topic exceeds {TOPIC_CAPACITY} characters"),
            Error::TopicWildcard => write!(f, "MQTT publish topic contains a wildcard"),
            Error::ForeignTopic => write!(f, "MQTT topic does not belong to this device"),
            Error::PacketTooSmall { needed, max } => {
                write!(f, "MQTT packet needs {needed} bytes but max is {max}")
            }
        }
    }
}
