//! Storage port - persistence of the MQTT credentials
//!
//! The firmware never touches flash directly. It reads and writes one
//! fixed-size record through a [`CredentialStore`], so the loader can be
//! tested against memory and run on hardware against any
//! [`embedded_storage`] NOR flash via [`FlashCredentialStore`].
//!
//! # Record layout
//!
//! ```text
//! offset  size  field
//!      0     4  magic "LUXM"
//!      4     1  version
//!      5     1  body length
//!      6   137  body      (postcard encoded credentials, zero padded)
//!    143     1  checksum  (wrapping sum of bytes 0..143)
//! ```
//!
//! The body is at most 134 bytes, the size of the four C buffers it
//! replaces. The record is padded to a multiple of 4 for word-sized flash
//! writes.

use core::fmt::{Display, Formatter};

use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash};
use log::{info, warn};

use crate::config::{MQTT_HOST_CAPACITY, MQTT_PASS_CAPACITY, MQTT_PORT_CAPACITY, MQTT_USER_CAPACITY};
use crate::credentials::MqttCredentials;

pub const MAGIC: [u8; 4] = *b"LUXM";
pub const VERSION: u8 = 2;

const HEADER_LEN: usize = MAGIC.len() + 2;
/// Largest postcard body: each string is a one-byte length plus its text
const BODY_MAX: usize = (1 + MQTT_HOST_CAPACITY)
    + (1 + MQTT_PORT_CAPACITY)
    + (1 + MQTT_USER_CAPACITY)
    + (1 + MQTT_PASS_CAPACITY);

/// Size of a stored credentials record
pub const RECORD_LEN: usize = (HEADER_LEN + BODY_MAX + 1).next_multiple_of(4);
const BODY_CAPACITY: usize = RECORD_LEN - HEADER_LEN - 1;

pub type Record = [u8; RECORD_LEN];

/// Error type for storage operations
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageError {
    /// Nothing has been stored yet
    Blank,
    /// Written by an incompatible firmware
    UnsupportedVersion(u8),
    /// Stored checksum does not match the record
    ChecksumMismatch,
    /// The body does not hold valid credentials
    Codec(postcard::Error),
    /// The record does not fit the flash geometry
    Layout,
    /// Flash driver failure
    Flash(NorFlashErrorKind),
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            StorageError::Blank => write!(f, "No credentials stored"),
            StorageError::UnsupportedVersion(v) => write!(f, "Unsupported record version {v}"),
            StorageError::ChecksumMismatch => write!(f, "Credentials record checksum mismatch"),
            StorageError::Codec(e) => write!(f, "Malformed credentials record: {e}"),
            StorageError::Layout => write!(f, "Credentials record does not fit flash layout"),
            StorageError::Flash(kind) => write!(f, "Flash error: {kind:?}"),
        }
    }
}

impl From<postcard::Error> for StorageError {
    fn from(error: postcard::Error) -> Self {
        StorageError::Codec(error)
    }
}

/// Port for reading and writing the raw credentials record
pub trait CredentialStore {
    /// Fill `record` with whatever is stored, blank or not
    fn read(&mut self, record: &mut Record) -> Result<(), StorageError>;

    /// Replace the stored record
    fn write(&mut self, record: &Record) -> Result<(), StorageError>;
}

/// Serialize credentials into a record
pub fn encode(credentials: &MqttCredentials) -> Result<Record, StorageError> {
    let mut record = [0u8; RECORD_LEN];
    record[..MAGIC.len()].copy_from_slice(&MAGIC);
    record[MAGIC.len()] = VERSION;

    let body = &mut record[HEADER_LEN..HEADER_LEN + BODY_CAPACITY];
    let body_len = postcard::to_slice(credentials, body)?.len();
    // BODY_CAPACITY < 256
    record[MAGIC.len() + 1] = body_len as u8;

    record[RECORD_LEN - 1] = checksum(&record[..RECORD_LEN - 1]);
    Ok(record)
}

/// Parse a record, rejecting blank and corrupt ones
pub fn decode(record: &Record) -> Result<MqttCredentials, StorageError> {
    if record[..MAGIC.len()] != MAGIC {
        return Err(StorageError::Blank);
    }

    let version = record[MAGIC.len()];
    if version != VERSION {
        return Err(StorageError::UnsupportedVersion(version));
    }

    if checksum(&record[..RECORD_LEN - 1]) != record[RECORD_LEN - 1] {
        return Err(StorageError::ChecksumMismatch);
    }

    let body_len = record[MAGIC.len() + 1] as usize;
    if body_len > BODY_CAPACITY {
        return Err(StorageError::Codec(postcard::Error::DeserializeUnexpectedEnd));
    }

    postcard::from_bytes(&record[HEADER_LEN..HEADER_LEN + body_len]).map_err(|e| {
        warn!("Stored credentials rejected: {}", e);
        StorageError::Codec(e)
    })
}

/// Load the stored credentials
pub fn load_credentials<S: CredentialStore>(store: &mut S) -> Result<MqttCredentials, StorageError> {
    let mut record = [0u8; RECORD_LEN];
    store.read(&mut record)?;
    decode(&record)
}

/// Load the stored credentials, using `fallback` when storage is blank or
/// corrupt
pub fn load_or<S: CredentialStore>(store: &mut S, fallback: MqttCredentials) -> MqttCredentials {
    match load_credentials(store) {
        Ok(credentials) => {
            info!("Loaded MQTT credentials for {}", credentials.host());
            credentials
        }
        Err(StorageError::Blank) => {
            info!("No MQTT credentials stored, using defaults");
            fallback
        }
        Err(e) => {
            warn!("Cannot load MQTT credentials: {}", e);
            fallback
        }
    }
}

/// Persist credentials
pub fn save_credentials<S: CredentialStore>(
    store: &mut S,
    credentials: &MqttCredentials,
) -> Result<(), StorageError> {
    store.write(&encode(credentials)?)?;
    info!("Saved MQTT credentials for {}", credentials.host());
    Ok(())
}

/// Wrapping byte sum, the same scheme sensor frames use
fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// [`CredentialStore`] on a NOR flash sector
///
/// `offset` must be aligned to the flash erase size. Writing erases the whole
/// sector, so nothing else may live in it.
pub struct FlashCredentialStore<F> {
    flash: F,
    offset: u32,
}

impl<F: NorFlash> FlashCredentialStore<F> {
    pub fn new(flash: F, offset: u32) -> Result<Self, StorageError> {
        let offset_usize = offset as usize;
        let fits = offset_usize % F::ERASE_SIZE == 0
            && RECORD_LEN <= F::ERASE_SIZE
            && RECORD_LEN % F::WRITE_SIZE == 0
            && RECORD_LEN % F::READ_SIZE == 0
            && offset_usize + F::ERASE_SIZE <= flash.capacity();

        if fits {
            Ok(Self { flash, offset })
        } else {
            Err(StorageError::Layout)
        }
    }

    pub fn release(self) -> F {
        self.flash
    }
}

impl<F: NorFlash> CredentialStore for FlashCredentialStore<F> {
    fn read(&mut self, record: &mut Record) -> Result<(), StorageError> {
        self.flash
            .read(self.offset, record)
            .map_err(|e| StorageError::Flash(e.kind()))
    }

    fn write(&mut self, record: &Record) -> Result<(), StorageError> {
        let sector_end = self.offset + F::ERASE_SIZE as u32;
        self.flash
            .erase(self.offset, sector_end)
            .map_err(|e| StorageError::Flash(e.kind()))?;
        self.flash
            .write(self.offset, record)
            .map_err(|e| StorageError::Flash(e.kind()))
    }
}
