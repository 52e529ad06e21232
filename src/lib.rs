//! Settings and runtime state of a lux meter
//!
//! A lux meter reads a light sensor over I2C, shows the value on an OLED
//! display and publishes it to an MQTT broker. This crate owns everything
//! those parts share: the constants in [`config`], the validated
//! [`Settings`], broker [`MqttCredentials`] loaded through a
//! [`CredentialStore`], and the timing state the main loop runs on.
//!
//! ```text
//! boot ──> LuxMeter::boot(settings, store)
//!             │  load credentials (fallback: build-time / empty)
//!             ▼
//! loop ──> LuxMeter::poll(now, subsystems)
//!             │  heartbeat, broker upkeep,
//!             │  sensor read -> publish -> display refresh
//!             ▼
//! timer ISR ──> Heartbeat::stalled(now, watchdog timeout)
//! ```
//!
//! The sensor driver, MQTT client, display driver, Wi-Fi and OTA live in the
//! firmware and plug in through [`Subsystems`].

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod credentials;
pub mod domain;
pub mod heartbeat;
pub mod settings;
pub mod state;
pub mod storage;
pub mod supervisor;

pub use credentials::MqttCredentials;
pub use domain::{LuxReading, Task};
pub use heartbeat::Heartbeat;
pub use settings::{I2cAddress, Settings};
pub use state::RuntimeState;
pub use storage::{CredentialStore, FlashCredentialStore, StorageError};
pub use supervisor::{LuxMeter, Poll, RestartReason, Subsystems};
