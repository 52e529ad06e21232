//! The cooperative main loop
//!
//! [`LuxMeter`] owns the settings, the broker credentials and the runtime
//! state. The firmware calls [`LuxMeter::poll`] from its main loop; each call
//! checks the elapsed time against every interval and calls out to the
//! hardware and network through [`Subsystems`].

use core::fmt::{Debug, Display, Formatter};

use embassy_time::Instant;
use log::{debug, error, info, warn};
use strum::IntoEnumIterator;

use crate::credentials::MqttCredentials;
use crate::domain::{LuxReading, Task};
use crate::settings::{self, Settings};
use crate::state::{ReconnectOutcome, RuntimeState, StateError};
use crate::storage::{self, CredentialStore, StorageError};

/// Collaborators the main loop drives
pub trait Subsystems {
    type Error: Debug;

    /// Read the light sensor, in lux
    fn read_lux(&mut self) -> Result<u16, Self::Error>;

    fn broker_connected(&self) -> bool;

    fn connect_broker(&mut self, credentials: &MqttCredentials) -> Result<(), Self::Error>;

    /// Drop the broker session, if any
    fn disconnect_broker(&mut self);

    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), Self::Error>;

    /// Redraw the display; `None` until the first successful read
    fn render(&mut self, reading: Option<&LuxReading>) -> Result<(), Self::Error>;
}

/// Why the device should reset
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartReason {
    ReconnectExhausted,
}

/// Result of one loop iteration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Poll {
    /// Nothing was due
    Idle,
    /// At least one task ran
    Worked,
    Restart(RestartReason),
}

pub struct LuxMeter {
    settings: Settings,
    credentials: MqttCredentials,
    state: RuntimeState,
    /// The broker session, if any, still uses the previous credentials
    credentials_changed: bool,
}

impl LuxMeter {
    /// Create a lux meter that booted at `boot`
    pub fn new(
        settings: Settings,
        credentials: MqttCredentials,
        boot: Instant,
    ) -> Result<Self, Error> {
        settings.validate()?;
        let state = RuntimeState::new(&settings, boot);

        Ok(Self {
            settings,
            credentials,
            state,
            credentials_changed: false,
        })
    }

    /// Startup: validate settings and load the credentials from `store`,
    /// falling back to the build-time ones
    pub fn boot<S: CredentialStore>(
        settings: Settings,
        store: &mut S,
        boot: Instant,
    ) -> Result<Self, Error> {
        info!("Booting {}", settings.hostname);
        let credentials = storage::load_or(store, MqttCredentials::provisioned());
        if !credentials.is_configured() {
            warn!("MQTT broker not configured, publishing disabled");
        }
        Self::new(settings, credentials, boot)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn credentials(&self) -> &MqttCredentials {
        &self.credentials
    }

    pub fn state(&self) -> &RuntimeState {
        &self.state
    }

    /// Persist new broker credentials and use them from the next poll on.
    ///
    /// The next poll drops the current broker session and connects with the
    /// new credentials right away.
    pub fn update_credentials<S: CredentialStore>(
        &mut self,
        store: &mut S,
        credentials: MqttCredentials,
    ) -> Result<(), StorageError> {
        storage::save_credentials(store, &credentials)?;
        self.credentials = credentials;
        self.state.mqtt.reset_attempts();
        self.credentials_changed = true;
        Ok(())
    }

    pub fn watchdog_expired(&self, now: Instant) -> bool {
        self.state.watchdog_expired(now)
    }

    /// Run one iteration of the main loop at `now`
    pub fn poll<S: Subsystems>(&mut self, now: Instant, subsystems: &mut S) -> Poll {
        self.state.heartbeat.beat(now);

        match self.keep_broker(now, subsystems) {
            Ok(Some(reason)) => return Poll::Restart(reason),
            Ok(None) => {}
            Err(e) => error!("Broker upkeep failed: {}", e),
        }

        let mut worked = false;
        for task in Task::iter() {
            if !self.state.is_due(task, now) {
                continue;
            }

            let ran = match task {
                Task::SampleSensor => self.sample(now, subsystems),
                Task::Publish => self.publish(now, subsystems),
                Task::RefreshDisplay => self.refresh(now, subsystems),
            };

            match ran {
                Ok(ran) => worked |= ran,
                Err(e) => error!("Skipping {}: {}", task, e),
            }
        }

        if worked {
            Poll::Worked
        } else {
            Poll::Idle
        }
    }

    fn keep_broker<S: Subsystems>(
        &mut self,
        now: Instant,
        subsystems: &mut S,
    ) -> Result<Option<RestartReason>, StateError> {
        if self.credentials_changed {
            self.credentials_changed = false;
            if subsystems.broker_connected() {
                info!("MQTT credentials changed, dropping broker session");
                subsystems.disconnect_broker();
            }
        }

        if !self.credentials.is_configured()
            || subsystems.broker_connected()
            || !self.state.mqtt.should_attempt(now)
        {
            return Ok(None);
        }

        info!(
            "Connecting to MQTT broker {}:{}",
            self.credentials.host(),
            self.credentials.port()
        );
        match subsystems.connect_broker(&self.credentials) {
            Ok(()) => {
                self.state.mqtt.record_success(now)?;
                info!("MQTT broker connected");
                Ok(None)
            }
            Err(e) => match self.state.mqtt.record_failure(now)? {
                ReconnectOutcome::Retry { attempt, remaining } => {
                    warn!(
                        "MQTT connect attempt {} failed: {:?}, {} left",
                        attempt, e, remaining
                    );
                    Ok(None)
                }
                ReconnectOutcome::Exhausted => {
                    error!(
                        "MQTT connect failed {} times: {:?}",
                        self.state.mqtt.attempts(),
                        e
                    );
                    Ok(Some(RestartReason::ReconnectExhausted))
                }
            },
        }
    }

    fn sample<S: Subsystems>(&mut self, now: Instant, subsystems: &mut S) -> Result<bool, StateError> {
        match subsystems.read_lux() {
            Ok(lux) => {
                if self.state.sensor.record(now, lux)? {
                    debug!("Lux changed to {}", lux);
                    self.state.display.mark_dirty();
                }
            }
            Err(e) => {
                self.state.sensor.missed(now)?;
                warn!("Error reading light sensor: {:?}", e);
            }
        }
        Ok(true)
    }

    fn publish<S: Subsystems>(&mut self, now: Instant, subsystems: &mut S) -> Result<bool, StateError> {
        let Some(reading) = self.state.sensor.last_value() else {
            return Ok(false);
        };
        if !subsystems.broker_connected() {
            return Ok(false);
        }

        let topic = self.settings.mqtt.sensor_topic.as_str();
        debug!("Publishing to topic {}, message: {}", topic, reading.as_str());
        if let Err(e) = subsystems.publish(topic, reading.as_str()) {
            warn!("Error publishing to {}: {:?}", topic, e);
        }
        self.state.publish.mark(now)?;
        Ok(true)
    }

    fn refresh<S: Subsystems>(&mut self, now: Instant, subsystems: &mut S) -> Result<bool, StateError> {
        match subsystems.render(self.state.sensor.last_value()) {
            Ok(()) => self.state.display.refreshed(now)?,
            Err(e) => {
                warn!("Error updating display: {:?}", e);
                self.state.display.retry_later(now)?;
            }
        }
        Ok(true)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    Settings(settings::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Settings(e) => write!(f, "Settings error: {e}"),
        }
    }
}

impl From<settings::Error> for Error {
    fn from(error: settings::Error) -> Self {
        Self::Settings(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_time::Duration;

    #[derive(Default)]
    struct FakeBoard {
        lux: Option<u16>,
        connected: bool,
        accept_connect: bool,
        render_fails: bool,
        connects: u32,
        disconnects: u32,
        connected_to: Option<String>,
        published: Vec<(String, String)>,
        rendered: Vec<Option<u16>>,
    }

    impl Subsystems for FakeBoard {
        type Error = &'static str;

        fn read_lux(&mut self) -> Result<u16, Self::Error> {
            self.lux.ok_or("sensor missing")
        }

        fn broker_connected(&self) -> bool {
            self.connected
        }

        fn connect_broker(&mut self, credentials: &MqttCredentials) -> Result<(), Self::Error> {
            self.connects += 1;
            if self.accept_connect {
                self.connected = true;
                self.connected_to = Some(credentials.host().to_string());
                Ok(())
            } else {
                Err("refused")
            }
        }

        fn disconnect_broker(&mut self) {
            self.disconnects += 1;
            self.connected = false;
            self.connected_to = None;
        }

        fn publish(&mut self, topic: &str, payload: &str) -> Result<(), Self::Error> {
            self.published.push((topic.to_string(), payload.to_string()));
            Ok(())
        }

        fn render(&mut self, reading: Option<&LuxReading>) -> Result<(), Self::Error> {
            if self.render_fails {
                return Err("i2c nack");
            }
            self.rendered.push(reading.map(LuxReading::lux));
            Ok(())
        }
    }

    /// In-memory store for credential updates
    #[derive(Default)]
    struct MemStore {
        record: Option<storage::Record>,
    }

    impl CredentialStore for MemStore {
        fn read(&mut self, record: &mut storage::Record) -> Result<(), StorageError> {
            *record = self.record.unwrap_or([0xFF; storage::RECORD_LEN]);
            Ok(())
        }

        fn write(&mut self, record: &storage::Record) -> Result<(), StorageError> {
            self.record = Some(*record);
            Ok(())
        }
    }

    fn ms(millis: u64) -> Instant {
        Instant::from_millis(millis)
    }

    fn broker() -> MqttCredentials {
        MqttCredentials::new("mqtt.home", "1883", "lux", "secret").unwrap()
    }

    fn meter(credentials: MqttCredentials) -> LuxMeter {
        LuxMeter::new(Settings::default(), credentials, ms(0)).unwrap()
    }

    #[test]
    fn rejects_invalid_settings() {
        let settings = Settings {
            sensor_read_interval: Duration::from_millis(0),
            ..Settings::default()
        };
        assert!(matches!(
            LuxMeter::new(settings, MqttCredentials::default(), ms(0)),
            Err(Error::Settings(_))
        ));
    }

    #[test]
    fn nothing_due_right_after_boot() {
        let mut meter = meter(MqttCredentials::default());
        let mut board = FakeBoard::default();
        assert_eq!(meter.poll(ms(10), &mut board), Poll::Idle);
        assert_eq!(meter.state().heartbeat.last(), ms(10));
    }

    #[test]
    fn samples_every_second_and_marks_display_dirty() {
        let mut meter = meter(MqttCredentials::default());
        let mut board = FakeBoard {
            lux: Some(420),
            ..FakeBoard::default()
        };

        assert_eq!(meter.poll(ms(1_000), &mut board), Poll::Worked);
        let reading = meter.state().sensor.last_value().map(LuxReading::lux);
        assert_eq!(reading, Some(420));
        assert!(meter.state().display.is_dirty());

        assert_eq!(meter.poll(ms(1_500), &mut board), Poll::Idle);
        assert_eq!(meter.poll(ms(2_000), &mut board), Poll::Worked);
    }

    #[test]
    fn display_refreshes_only_when_dirty() {
        let mut meter = meter(MqttCredentials::default());
        let mut board = FakeBoard {
            lux: Some(100),
            ..FakeBoard::default()
        };

        for t in (1_000..=5_000).step_by(1_000) {
            meter.poll(ms(t), &mut board);
        }
        assert_eq!(board.rendered, vec![Some(100)]);
        assert!(!meter.state().display.is_dirty());

        // unchanged value, nothing to redraw
        for t in (6_000..=10_000).step_by(1_000) {
            meter.poll(ms(t), &mut board);
        }
        assert_eq!(board.rendered.len(), 1);

        board.lux = Some(150);
        for t in (11_000..=15_000).step_by(1_000) {
            meter.poll(ms(t), &mut board);
        }
        assert_eq!(board.rendered, vec![Some(100), Some(150)]);
    }

    #[test]
    fn failed_render_keeps_display_dirty() {
        let mut meter = meter(MqttCredentials::default());
        let mut board = FakeBoard {
            render_fails: true,
            ..FakeBoard::default()
        };
        meter.poll(ms(5_000), &mut board);
        assert!(meter.state().display.is_dirty());
        assert!(board.rendered.is_empty());

        board.render_fails = false;
        meter.poll(ms(9_999), &mut board);
        assert!(board.rendered.is_empty());
        meter.poll(ms(10_000), &mut board);
        assert_eq!(board.rendered, vec![None]);
    }

    #[test]
    fn publishes_last_reading_to_sensor_topic() {
        let mut meter = meter(broker());
        let mut board = FakeBoard {
            lux: Some(321),
            accept_connect: true,
            ..FakeBoard::default()
        };

        for t in (0..=5_000).step_by(1_000) {
            meter.poll(ms(t), &mut board);
        }
        assert_eq!(board.connects, 1);
        let topic = format!("sensors/{}/lux", meter.settings().device_name());
        assert_eq!(board.published, vec![(topic, "321".to_string())]);
        assert_eq!(meter.state().publish.last(), ms(5_000));
        assert_eq!(meter.state().mqtt.last_connected(), Some(ms(0)));
    }

    #[test]
    fn publish_waits_for_connection_and_reading() {
        let mut meter = meter(MqttCredentials::default());
        let mut board = FakeBoard {
            lux: Some(10),
            connected: false,
            ..FakeBoard::default()
        };
        meter.poll(ms(5_000), &mut board);
        assert!(board.published.is_empty());
        // not marked, so it goes out as soon as the broker is up
        assert_eq!(meter.state().publish.last(), ms(0));

        board.connected = true;
        meter.poll(ms(5_100), &mut board);
        assert_eq!(board.published.len(), 1);
    }

    #[test]
    fn unconfigured_broker_is_never_contacted() {
        let mut meter = meter(MqttCredentials::default());
        let mut board = FakeBoard::default();
        for t in (0..60_000).step_by(1_000) {
            assert_ne!(meter.poll(ms(t), &mut board), Poll::Restart(RestartReason::ReconnectExhausted));
        }
        assert_eq!(board.connects, 0);
    }

    #[test]
    fn restarts_after_reconnect_exhaustion() {
        let mut meter = meter(broker());
        let mut board = FakeBoard::default();

        let mut restart_at = None;
        for t in (0..=60_000).step_by(5_000) {
            if let Poll::Restart(reason) = meter.poll(ms(t), &mut board) {
                assert_eq!(reason, RestartReason::ReconnectExhausted);
                restart_at = Some(t);
                break;
            }
        }
        assert_eq!(board.connects, 10);
        assert_eq!(restart_at, Some(45_000));
    }

    #[test]
    fn reconnect_waits_for_delay() {
        let mut meter = meter(broker());
        let mut board = FakeBoard::default();
        meter.poll(ms(0), &mut board);
        meter.poll(ms(4_999), &mut board);
        assert_eq!(board.connects, 1);
        meter.poll(ms(5_000), &mut board);
        assert_eq!(board.connects, 2);
    }

    #[test]
    fn dropped_connection_waits_for_delay() {
        let mut meter = meter(broker());
        let mut board = FakeBoard {
            accept_connect: true,
            ..FakeBoard::default()
        };
        meter.poll(ms(0), &mut board);
        assert_eq!(board.connects, 1);

        board.connected = false;
        for t in [1_000, 2_500, 4_999] {
            meter.poll(ms(t), &mut board);
        }
        assert_eq!(board.connects, 1);

        meter.poll(ms(5_000), &mut board);
        assert_eq!(board.connects, 2);
        assert!(board.connected);
        assert_eq!(meter.state().mqtt.last_connected(), Some(ms(5_000)));
    }

    #[test]
    fn boot_loads_stored_credentials() {
        let mut store = MemStore::default();
        storage::save_credentials(&mut store, &broker()).unwrap();
        let meter = LuxMeter::boot(Settings::default(), &mut store, ms(0)).unwrap();
        assert_eq!(meter.credentials(), &broker());
    }

    #[test]
    fn update_credentials_persists_and_resets_reconnects() {
        let mut meter = meter(broker());
        let mut board = FakeBoard::default();
        meter.poll(ms(0), &mut board);
        assert_eq!(meter.state().mqtt.attempts(), 1);

        let mut store = MemStore::default();
        let updated = MqttCredentials::new("other.home", "8883", "", "").unwrap();
        meter.update_credentials(&mut store, updated.clone()).unwrap();

        assert_eq!(meter.credentials(), &updated);
        assert_eq!(meter.state().mqtt.attempts(), 0);
        assert_eq!(meter.state().mqtt.last_attempt(), None);
        assert_eq!(storage::load_credentials(&mut store), Ok(updated));
    }

    #[test]
    fn update_while_connected_switches_broker() {
        let mut meter = meter(broker());
        let mut board = FakeBoard {
            lux: Some(50),
            accept_connect: true,
            ..FakeBoard::default()
        };
        meter.poll(ms(0), &mut board);
        assert_eq!(board.connected_to.as_deref(), Some("mqtt.home"));

        let mut store = MemStore::default();
        let updated = MqttCredentials::new("other.home", "8883", "", "").unwrap();
        meter.update_credentials(&mut store, updated).unwrap();
        assert_eq!(meter.state().mqtt.last_connected(), Some(ms(0)));

        // no reconnect delay for a deliberate switch
        meter.poll(ms(1_000), &mut board);
        assert_eq!(board.disconnects, 1);
        assert_eq!(board.connects, 2);
        assert_eq!(board.connected_to.as_deref(), Some("other.home"));
        assert_eq!(meter.state().mqtt.last_connected(), Some(ms(1_000)));

        for t in (2_000..=60_000).step_by(1_000) {
            meter.poll(ms(t), &mut board);
        }
        assert_eq!(board.disconnects, 1);
        assert_eq!(board.connects, 2);
    }

    #[test]
    fn update_to_unconfigured_drops_session() {
        let mut meter = meter(broker());
        let mut board = FakeBoard {
            accept_connect: true,
            ..FakeBoard::default()
        };
        meter.poll(ms(0), &mut board);

        let mut store = MemStore::default();
        meter
            .update_credentials(&mut store, MqttCredentials::default())
            .unwrap();
        meter.poll(ms(1_000), &mut board);
        assert!(!board.connected);
        assert_eq!(board.connects, 1);
    }

    #[test]
    fn watchdog_expires_without_polls() {
        let mut meter = meter(MqttCredentials::default());
        let mut board = FakeBoard::default();
        meter.poll(ms(1_000), &mut board);
        assert!(!meter.watchdog_expired(ms(300_999)));
        assert!(meter.watchdog_expired(ms(301_000)));
    }
}
