//! Runtime state of the main loop
//!
//! Each subsystem gets its own piece of state and is the only one to update
//! it: the sensor task marks [`SensorState`], the publisher marks the publish
//! [`Cadence`], the display marks [`DisplayState`] and broker upkeep goes
//! through [`ReconnectPolicy`]. Timestamps only ever move forward; an update
//! with an older instant is rejected and leaves the state as it was.

use core::fmt::{Display, Formatter};

use embassy_time::{Duration, Instant};
use log::debug;

use crate::domain::{LuxReading, Task};
use crate::heartbeat::Heartbeat;
use crate::settings::Settings;

/// An interval and the last time the work behind it ran
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cadence {
    interval: Duration,
    last: Instant,
}

impl Cadence {
    /// A cadence that last ran at `boot`, so it first becomes due one
    /// interval later
    pub const fn new(interval: Duration, boot: Instant) -> Self {
        Self {
            interval,
            last: boot,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last(&self) -> Instant {
        self.last
    }

    /// When the work is due next, `None` if that is past the end of time
    pub fn next_due(&self) -> Option<Instant> {
        self.last.checked_add(self.interval)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last) >= self.interval
    }

    /// Record that the work ran at `now`
    pub fn mark(&mut self, now: Instant) -> Result<(), StateError> {
        self.last = advance(self.last, now)?;
        Ok(())
    }
}

/// What to do after a failed broker connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// Try again once the reconnect delay has passed
    Retry { attempt: u8, remaining: u8 },
    /// Every allowed attempt failed
    Exhausted,
}

/// Broker reconnect bookkeeping
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    delay: Duration,
    max_tries: u8,
    attempts: u8,
    last_attempt: Option<Instant>,
    last_connected: Option<Instant>,
}

impl ReconnectPolicy {
    pub const fn new(delay: Duration, max_tries: u8) -> Self {
        Self {
            delay,
            max_tries,
            attempts: 0,
            last_attempt: None,
            last_connected: None,
        }
    }

    /// Consecutive failed attempts since the last successful connect
    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    pub fn max_tries(&self) -> u8 {
        self.max_tries
    }

    pub fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }

    pub fn last_connected(&self) -> Option<Instant> {
        self.last_connected
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_tries
    }

    /// The first attempt may happen right away, later ones wait for the delay
    pub fn should_attempt(&self, now: Instant) -> bool {
        if self.is_exhausted() {
            return false;
        }
        match self.last_attempt {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.delay,
        }
    }

    pub fn record_success(&mut self, now: Instant) -> Result<(), StateError> {
        let attempted = advance_option(self.last_attempt, now)?;
        let connected = advance_option(self.last_connected, now)?;
        self.last_attempt = Some(attempted);
        self.last_connected = Some(connected);
        self.attempts = 0;
        Ok(())
    }

    /// Start counting from zero again, e.g. for new broker credentials.
    /// The next attempt may happen right away. `last_connected` is kept.
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
        self.last_attempt = None;
    }

    pub fn record_failure(&mut self, now: Instant) -> Result<ReconnectOutcome, StateError> {
        self.last_attempt = Some(advance_option(self.last_attempt, now)?);
        self.attempts = self.attempts.saturating_add(1);

        if self.is_exhausted() {
            Ok(ReconnectOutcome::Exhausted)
        } else {
            Ok(ReconnectOutcome::Retry {
                attempt: self.attempts,
                remaining: self.max_tries - self.attempts,
            })
        }
    }
}

/// Display refresh bookkeeping
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayState {
    dirty: bool,
    cadence: Cadence,
}

impl DisplayState {
    /// Starts dirty so the first refresh draws the screen
    pub const fn new(interval: Duration, boot: Instant) -> Self {
        Self {
            dirty: true,
            cadence: Cadence::new(interval, boot),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn cadence(&self) -> &Cadence {
        &self.cadence
    }

    pub fn should_refresh(&self, now: Instant) -> bool {
        self.dirty && self.cadence.is_due(now)
    }

    /// A redraw failed at `now`; stay dirty and retry next interval
    pub fn retry_later(&mut self, now: Instant) -> Result<(), StateError> {
        self.cadence.mark(now)
    }

    /// Record a redraw at `now`
    pub fn refreshed(&mut self, now: Instant) -> Result<(), StateError> {
        self.cadence.mark(now)?;
        self.dirty = false;
        Ok(())
    }
}

/// Light sensor sampling bookkeeping
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SensorState {
    cadence: Cadence,
    last_value: Option<LuxReading>,
}

impl SensorState {
    pub const fn new(interval: Duration, boot: Instant) -> Self {
        Self {
            cadence: Cadence::new(interval, boot),
            last_value: None,
        }
    }

    pub fn cadence(&self) -> &Cadence {
        &self.cadence
    }

    pub fn last_value(&self) -> Option<&LuxReading> {
        self.last_value.as_ref()
    }

    /// A read was attempted at `now` but produced no value
    pub fn missed(&mut self, now: Instant) -> Result<(), StateError> {
        self.cadence.mark(now)
    }

    /// Store a reading taken at `now`, returning whether the value changed
    pub fn record(&mut self, now: Instant, lux: u16) -> Result<bool, StateError> {
        self.cadence.mark(now)?;
        let changed = self.last_value.as_ref().map(LuxReading::lux) != Some(lux);
        if changed {
            self.last_value = Some(LuxReading::new(lux));
        }
        Ok(changed)
    }
}

/// All mutable state of the firmware
pub struct RuntimeState {
    pub mqtt: ReconnectPolicy,
    pub publish: Cadence,
    pub display: DisplayState,
    pub sensor: SensorState,
    pub heartbeat: Heartbeat,
    watchdog_timeout: Duration,
}

impl RuntimeState {
    /// Fresh state for a device that booted at `boot`
    pub fn new(settings: &Settings, boot: Instant) -> Self {
        debug!("Initializing runtime state at {}ms", boot.as_millis());
        Self {
            mqtt: ReconnectPolicy::new(
                settings.mqtt.reconnect_delay,
                settings.mqtt.max_reconnect_tries,
            ),
            publish: Cadence::new(settings.mqtt.publish_interval, boot),
            display: DisplayState::new(settings.display_refresh_interval, boot),
            sensor: SensorState::new(settings.sensor_read_interval, boot),
            heartbeat: Heartbeat::new(boot),
            watchdog_timeout: settings.watchdog_timeout,
        }
    }

    /// Whether `task` should run at `now`
    pub fn is_due(&self, task: Task, now: Instant) -> bool {
        match task {
            Task::SampleSensor => self.sensor.cadence().is_due(now),
            Task::Publish => self.publish.is_due(now),
            Task::RefreshDisplay => self.display.should_refresh(now),
        }
    }

    pub fn watchdog_expired(&self, now: Instant) -> bool {
        self.heartbeat.stalled(now, self.watchdog_timeout)
    }
}

fn advance(last: Instant, now: Instant) -> Result<Instant, StateError> {
    if now < last {
        Err(StateError::ClockWentBackwards { last, now })
    } else {
        Ok(now)
    }
}

fn advance_option(last: Option<Instant>, now: Instant) -> Result<Instant, StateError> {
    match last {
        Some(last) => advance(last, now),
        None => Ok(now),
    }
}

/// A state error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateError {
    ClockWentBackwards { last: Instant, now: Instant },
}

impl Display for StateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            StateError::ClockWentBackwards { last, now } => write!(
                f,
                "Timestamp {}ms is older than {}ms",
                now.as_millis(),
                last.as_millis()
            ),
        }
    }
}
