use crc32fast::Hasher;
use log::{info, warn};

use crate::{
    config::{
        Config, PendingUpdate, NTP_SERVER_CAPACITY, PASSPHRASE_CAPACITY, SSID_CAPACITY,
        UPDATE_URL_CAPACITY, UPDATE_VERSION_CAPACITY,
    },
    error::{ClockError, Result},
};

/// Flat addressable persistent bytes. Writes are only durable after `commit`.
pub trait ByteStore {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<()>;
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
}

impl<T: ByteStore + ?Sized> ByteStore for Box<T> {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        (**self).read(offset, buf)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        (**self).write(offset, data)
    }

    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }
}

/// RAM-backed store with the same sizing rules as a flash or EEPROM page.
#[derive(Debug, Clone)]
pub struct MemoryByteStore {
    bytes: Vec<u8>,
    commits: usize,
}

impl MemoryByteStore {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0xFF; size],
            commits: 0,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn commits(&self) -> usize {
        self.commits
    }
}

impl ByteStore for MemoryByteStore {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len();
        let source = self
            .bytes
            .get(offset..end)
            .ok_or_else(|| ClockError::Storage(format!("read past end at {end}")))?;
        buf.copy_from_slice(source);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset + data.len();
        let target = self
            .bytes
            .get_mut(offset..end)
            .ok_or_else(|| ClockError::Storage(format!("write past end at {end}")))?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.commits += 1;
        Ok(())
    }
}

pub const CONFIG_ADDRESS: usize = 0;
pub const LAYOUT_VERSION: u8 = 1;

const VERSION_OFFSET: usize = 0;
const SSID_OFFSET: usize = VERSION_OFFSET + 1;
const PASSPHRASE_OFFSET: usize = SSID_OFFSET + SSID_CAPACITY;
const NTP_OFFSET: usize = PASSPHRASE_OFFSET + PASSPHRASE_CAPACITY;
const UTC_OFFSET_OFFSET: usize = NTP_OFFSET + NTP_SERVER_CAPACITY;
const BRIGHTNESS_OFFSET: usize = UTC_OFFSET_OFFSET + 4;
const CONFIGURED_OFFSET: usize = BRIGHTNESS_OFFSET + 1;
const DST_OFFSET: usize = CONFIGURED_OFFSET + 1;
const PENDING_OFFSET: usize = DST_OFFSET + 1;
const PRIOR_FAILED_OFFSET: usize = PENDING_OFFSET + 1;
const UPDATE_VERSION_OFFSET: usize = PRIOR_FAILED_OFFSET + 1;
const UPDATE_URL_OFFSET: usize = UPDATE_VERSION_OFFSET + UPDATE_VERSION_CAPACITY;
const CRC_OFFSET: usize = UPDATE_URL_OFFSET + UPDATE_URL_CAPACITY;

pub const RECORD_SIZE: usize = CRC_OFFSET + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded(Config),
    NotConfigured,
}

impl LoadOutcome {
    pub fn config(self) -> Option<Config> {
        match self {
            Self::Loaded(config) => Some(config),
            Self::NotConfigured => None,
        }
    }
}

/// Persists [`Config`] as one fixed-size CRC-protected record.
///
/// A save writes the whole record and commits before returning. A power loss
/// between write and commit leaves the stored bytes undefined, which the next
/// load reports as `NotConfigured`.
pub struct ConfigStore<B> {
    storage: B,
}

impl<B: ByteStore> ConfigStore<B> {
    pub fn new(storage: B) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &B {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut B {
        &mut self.storage
    }

    pub fn load(&mut self) -> LoadOutcome {
        let mut record = [0u8; RECORD_SIZE];
        if let Err(err) = self.storage.read(CONFIG_ADDRESS, &mut record) {
            warn!("config read failed: {err}");
            return LoadOutcome::NotConfigured;
        }

        match decode_record(&record) {
            Ok(config) if config.configured => LoadOutcome::Loaded(config),
            Ok(_) => LoadOutcome::NotConfigured,
            Err(err) => {
                warn!("ignoring stored config: {err}");
                LoadOutcome::NotConfigured
            }
        }
    }

    /// Persists `config` with `configured` forced on and returns what was stored.
    pub fn save(&mut self, config: &Config) -> Result<Config> {
        let mut stored = config.clone();
        stored.configured = true;
        let record = encode_record(&stored)?;
        self.write_record(&record)?;
        info!("configuration saved");
        Ok(stored)
    }

    /// Zeroes the stored record and hands back compiled-in defaults.
    pub fn reset(&mut self) -> Result<Config> {
        let mut record = [0u8; RECORD_SIZE];
        record[VERSION_OFFSET] = LAYOUT_VERSION;
        seal(&mut record);
        self.write_record(&record)?;
        info!("configuration reset to defaults");
        Ok(Config::default())
    }

    fn write_record(&mut self, record: &[u8; RECORD_SIZE]) -> Result<()> {
        self.storage.write(CONFIG_ADDRESS, record)?;
        self.storage.commit()
    }
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn seal(record: &mut [u8; RECORD_SIZE]) {
    let crc = compute_crc(&record[..CRC_OFFSET]);
    record[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
}

pub fn encode_record(config: &Config) -> Result<[u8; RECORD_SIZE]> {
    config.validate()?;

    let mut record = [0u8; RECORD_SIZE];
    record[VERSION_OFFSET] = LAYOUT_VERSION;
    put_text(&mut record, SSID_OFFSET, SSID_CAPACITY, &config.ssid);
    put_text(&mut record, PASSPHRASE_OFFSET, PASSPHRASE_CAPACITY, &config.passphrase);
    put_text(&mut record, NTP_OFFSET, NTP_SERVER_CAPACITY, &config.ntp_server);
    record[UTC_OFFSET_OFFSET..UTC_OFFSET_OFFSET + 4]
        .copy_from_slice(&config.utc_offset_secs.to_le_bytes());
    record[BRIGHTNESS_OFFSET] = config.brightness;
    record[CONFIGURED_OFFSET] = u8::from(config.configured);
    record[DST_OFFSET] = u8::from(config.dst_enabled);
    record[PRIOR_FAILED_OFFSET] = u8::from(config.prior_update_failed);
    if let Some(pending) = &config.pending_update {
        record[PENDING_OFFSET] = 1;
        put_text(&mut record, UPDATE_VERSION_OFFSET, UPDATE_VERSION_CAPACITY, &pending.version);
        put_text(&mut record, UPDATE_URL_OFFSET, UPDATE_URL_CAPACITY, &pending.url);
    }
    seal(&mut record);
    Ok(record)
}

pub fn decode_record(record: &[u8; RECORD_SIZE]) -> Result<Config> {
    let stored_crc = u32::from_le_bytes([
        record[CRC_OFFSET],
        record[CRC_OFFSET + 1],
        record[CRC_OFFSET + 2],
        record[CRC_OFFSET + 3],
    ]);
    if compute_crc(&record[..CRC_OFFSET]) != stored_crc {
        return Err(ClockError::ConfigCorrupt);
    }
    if record[VERSION_OFFSET] != LAYOUT_VERSION {
        return Err(ClockError::ConfigCorrupt);
    }

    let pending = get_flag(record, PENDING_OFFSET)?;
    let pending_update = if pending {
        Some(PendingUpdate {
            version: get_text(record, UPDATE_VERSION_OFFSET, UPDATE_VERSION_CAPACITY)?,
            url: get_text(record, UPDATE_URL_OFFSET, UPDATE_URL_CAPACITY)?,
        })
    } else {
        None
    };

    Ok(Config {
        ssid: get_text(record, SSID_OFFSET, SSID_CAPACITY)?,
        passphrase: get_text(record, PASSPHRASE_OFFSET, PASSPHRASE_CAPACITY)?,
        ntp_server: get_text(record, NTP_OFFSET, NTP_SERVER_CAPACITY)?,
        utc_offset_secs: i32::from_le_bytes([
            record[UTC_OFFSET_OFFSET],
            record[UTC_OFFSET_OFFSET + 1],
            record[UTC_OFFSET_OFFSET + 2],
            record[UTC_OFFSET_OFFSET + 3],
        ]),
        brightness: record[BRIGHTNESS_OFFSET],
        configured: get_flag(record, CONFIGURED_OFFSET)?,
        dst_enabled: get_flag(record, DST_OFFSET)?,
        pending_update,
        prior_update_failed: get_flag(record, PRIOR_FAILED_OFFSET)?,
    })
}

fn put_text(record: &mut [u8], offset: usize, capacity: usize, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(capacity);
    record[offset..offset + len].copy_from_slice(&bytes[..len]);
}

fn get_text(record: &[u8], offset: usize, capacity: usize) -> Result<String> {
    let slot = &record[offset..offset + capacity];
    let len = slot.iter().position(|b| *b == 0).unwrap_or(capacity);
    if slot[len..].iter().any(|b| *b != 0) {
        return Err(ClockError::ConfigCorrupt);
    }
    String::from_utf8(slot[..len].to_vec()).map_err(|_| ClockError::ConfigCorrupt)
}

fn get_flag(record: &[u8], offset: usize) -> Result<bool> {
    match record[offset] {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(ClockError::ConfigCorrupt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_config() -> Config {
        Config {
            ssid: "HomeNet".to_string(),
            passphrase: "correct horse battery staple".to_string(),
            ntp_server: "nl.pool.ntp.org".to_string(),
            utc_offset_secs: 3600,
            brightness: 128,
            dst_enabled: true,
            configured: true,
            pending_update: Some(PendingUpdate {
                version: "1.2.0".to_string(),
                url: "https://example.org/wordclock-1.2.0.bin".to_string(),
            }),
            prior_update_failed: false,
        }
    }

    fn store() -> ConfigStore<MemoryByteStore> {
        ConfigStore::new(MemoryByteStore::new(512))
    }

    #[test]
    fn record_fits_the_storage_page() {
        assert!(RECORD_SIZE <= 512);
    }

    #[test]
    fn blank_flash_loads_as_not_configured() {
        let mut store = store();
        assert_eq!(store.load(), LoadOutcome::NotConfigured);
    }

    #[test]
    fn save_then_load_round_trips_every_field() {
        let mut store = store();
        let config = sample_config();
        let stored = store.save(&config).unwrap();

        assert_eq!(stored, config);
        assert_eq!(store.load(), LoadOutcome::Loaded(config));
        assert_eq!(store.storage().commits(), 1);
    }

    #[test]
    fn save_forces_configured_flag() {
        let mut store = store();
        let config = Config {
            ssid: "HomeNet".to_string(),
            ..Config::default()
        };
        let stored = store.save(&config).unwrap();
        assert!(stored.configured);
        assert!(matches!(store.load(), LoadOutcome::Loaded(c) if c.configured));
    }

    #[test]
    fn negative_offsets_and_extremes_survive() {
        let mut store = store();
        let config = Config {
            ssid: "s".repeat(SSID_CAPACITY),
            passphrase: "p".repeat(PASSPHRASE_CAPACITY),
            utc_offset_secs: -12 * 3600,
            brightness: 255,
            dst_enabled: false,
            prior_update_failed: true,
            pending_update: None,
            ..sample_config()
        };
        store.save(&config).unwrap();
        assert_eq!(store.load(), LoadOutcome::Loaded(config));
    }

    #[test]
    fn any_single_byte_flip_is_rejected() {
        let mut store = store();
        store.save(&sample_config()).unwrap();
        let pristine = store.storage().bytes().to_vec();

        for index in 0..RECORD_SIZE {
            for mask in [0x01u8, 0x80, 0xFF] {
                store.storage_mut().bytes_mut()[index] ^= mask;
                assert_eq!(
                    store.load(),
                    LoadOutcome::NotConfigured,
                    "flip {mask:#04x} at byte {index} was accepted"
                );
                store.storage_mut().bytes_mut().copy_from_slice(&pristine);
            }
        }
    }

    #[test]
    fn reset_leaves_a_valid_unconfigured_record() {
        let mut store = store();
        store.save(&sample_config()).unwrap();

        let defaults = store.reset().unwrap();
        assert_eq!(defaults, Config::default());
        assert_eq!(store.load(), LoadOutcome::NotConfigured);

        let mut record = [0u8; RECORD_SIZE];
        record.copy_from_slice(&store.storage().bytes()[..RECORD_SIZE]);
        let decoded = decode_record(&record).unwrap();
        assert!(!decoded.configured);
        assert!(decoded.ssid.is_empty());
    }

    #[test]
    fn sealed_record_with_bad_flag_byte_is_rejected() {
        let mut record = encode_record(&sample_config()).unwrap();
        record[DST_OFFSET] = 7;
        seal(&mut record);
        assert_eq!(decode_record(&record), Err(ClockError::ConfigCorrupt));
    }

    #[test]
    fn invalid_config_is_not_written() {
        let mut store = store();
        let config = Config {
            ssid: "bad\0ssid".to_string(),
            ..sample_config()
        };
        assert!(store.save(&config).is_err());
        assert_eq!(store.storage().commits(), 0);
    }
}
