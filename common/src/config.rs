use std::collections::HashMap;

use crate::{
    error::{ClockError, Result},
    settings::{DEFAULT_BRIGHTNESS, DEFAULT_NTP_SERVER},
};

pub const SSID_CAPACITY: usize = 64;
pub const PASSPHRASE_CAPACITY: usize = 128;
pub const NTP_SERVER_CAPACITY: usize = 64;
pub const UPDATE_VERSION_CAPACITY: usize = 16;
pub const UPDATE_URL_CAPACITY: usize = 160;

/// An update the user asked to install, kept across restarts until it is
/// either applied or abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub version: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub ssid: String,
    pub passphrase: String,
    pub ntp_server: String,
    pub utc_offset_secs: i32,
    pub brightness: u8,
    pub dst_enabled: bool,
    pub configured: bool,
    pub pending_update: Option<PendingUpdate>,
    pub prior_update_failed: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            passphrase: String::new(),
            ntp_server: DEFAULT_NTP_SERVER.to_string(),
            utc_offset_secs: 0,
            brightness: DEFAULT_BRIGHTNESS,
            dst_enabled: true,
            configured: false,
            pending_update: None,
            prior_update_failed: false,
        }
    }
}

impl Config {
    /// Checks every text field fits its fixed slot in the stored record.
    pub fn validate(&self) -> Result<()> {
        check_text("ssid", &self.ssid, SSID_CAPACITY)?;
        check_text("password", &self.passphrase, PASSPHRASE_CAPACITY)?;
        check_text("ntpserver", &self.ntp_server, NTP_SERVER_CAPACITY)?;
        if let Some(pending) = &self.pending_update {
            if pending.version.is_empty() {
                return Err(ClockError::InvalidConfig(
                    "pending update has no version".to_string(),
                ));
            }
            check_text("update version", &pending.version, UPDATE_VERSION_CAPACITY)?;
            check_text("update url", &pending.url, UPDATE_URL_CAPACITY)?;
        }
        Ok(())
    }

    pub fn has_credentials(&self) -> bool {
        !self.ssid.is_empty()
    }
}

fn check_text(field: &str, value: &str, capacity: usize) -> Result<()> {
    if value.len() > capacity {
        return Err(ClockError::InvalidConfig(format!(
            "{field} exceeds {capacity} bytes"
        )));
    }
    if value.contains('\0') {
        return Err(ClockError::InvalidConfig(format!(
            "{field} contains a NUL byte"
        )));
    }
    Ok(())
}

/// Fields posted by the setup form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigForm {
    pub ssid: String,
    pub password: String,
    pub ntp_server: String,
    pub timezone: String,
    pub brightness: String,
    pub daylight_saving: bool,
}

impl ConfigForm {
    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        let text = |key: &str| fields.get(key).map(|v| v.trim().to_string()).unwrap_or_default();
        Self {
            ssid: text("ssid"),
            password: fields.get("password").cloned().unwrap_or_default(),
            ntp_server: text("ntpserver"),
            timezone: text("timezone"),
            brightness: text("brightness"),
            daylight_saving: fields.get("daylight_saving").map(String::as_str) == Some("1"),
        }
    }

    /// Builds the record a save would persist, leaving update bookkeeping
    /// from `current` untouched. A blank password keeps the stored one while
    /// the network stays the same.
    pub fn apply_to(&self, current: &Config) -> Result<Config> {
        let utc_offset_secs = if self.timezone.is_empty() {
            0
        } else {
            self.timezone.parse::<i32>().map_err(|_| {
                ClockError::InvalidConfig(format!("timezone '{}' is not a number", self.timezone))
            })?
        };

        let brightness = if self.brightness.is_empty() {
            DEFAULT_BRIGHTNESS
        } else {
            let raw = self.brightness.parse::<i64>().map_err(|_| {
                ClockError::InvalidConfig(format!(
                    "brightness '{}' is not a number",
                    self.brightness
                ))
            })?;
            raw.clamp(0, 255) as u8
        };

        let ntp_server = if self.ntp_server.is_empty() {
            DEFAULT_NTP_SERVER.to_string()
        } else {
            self.ntp_server.clone()
        };

        // The form never echoes the stored password back.
        let passphrase = if self.password.is_empty() && self.ssid == current.ssid {
            current.passphrase.clone()
        } else {
            self.password.clone()
        };

        let config = Config {
            ssid: self.ssid.clone(),
            passphrase,
            ntp_server,
            utc_offset_secs,
            brightness,
            dst_enabled: self.daylight_saving,
            configured: true,
            pending_update: current.pending_update.clone(),
            prior_update_failed: current.prior_update_failed,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_first_boot_values() {
        let config = Config::default();
        assert_eq!(config.ntp_server, "pool.ntp.org");
        assert_eq!(config.brightness, 64);
        assert_eq!(config.utc_offset_secs, 0);
        assert!(config.dst_enabled);
        assert!(!config.configured);
        assert!(config.pending_update.is_none());
    }

    #[test]
    fn form_fields_build_a_configured_record() {
        let form = ConfigForm::from_fields(&fields(&[
            ("ssid", "HomeNet"),
            ("password", "secret pass"),
            ("ntpserver", "time.example.org"),
            ("timezone", "3600"),
            ("brightness", "300"),
            ("daylight_saving", "1"),
        ]));

        let config = form.apply_to(&Config::default()).unwrap();
        assert_eq!(config.ssid, "HomeNet");
        assert_eq!(config.passphrase, "secret pass");
        assert_eq!(config.ntp_server, "time.example.org");
        assert_eq!(config.utc_offset_secs, 3600);
        assert_eq!(config.brightness, 255);
        assert!(config.dst_enabled);
        assert!(config.configured);
    }

    #[test]
    fn missing_daylight_flag_disables_dst_and_empty_server_uses_default() {
        let form = ConfigForm::from_fields(&fields(&[("ssid", "HomeNet"), ("ntpserver", " ")]));
        let config = form.apply_to(&Config::default()).unwrap();
        assert!(!config.dst_enabled);
        assert_eq!(config.ntp_server, "pool.ntp.org");
        assert_eq!(config.brightness, 64);
    }

    #[test]
    fn overlong_ssid_is_rejected() {
        let long = "x".repeat(SSID_CAPACITY + 1);
        let form = ConfigForm::from_fields(&fields(&[("ssid", long.as_str())]));
        assert!(matches!(
            form.apply_to(&Config::default()),
            Err(ClockError::InvalidConfig(_))
        ));
    }

    #[test]
    fn non_numeric_timezone_is_rejected() {
        let form = ConfigForm::from_fields(&fields(&[("ssid", "a"), ("timezone", "CET")]));
        assert!(form.apply_to(&Config::default()).is_err());
    }

    #[test]
    fn save_form_keeps_update_bookkeeping() {
        let current = Config {
            pending_update: Some(PendingUpdate {
                version: "1.2.0".to_string(),
                url: "https://example.org/fw.bin".to_string(),
            }),
            prior_update_failed: true,
            ..Config::default()
        };
        let form = ConfigForm::from_fields(&fields(&[("ssid", "HomeNet")]));
        let config = form.apply_to(&current).unwrap();
        assert_eq!(config.pending_update, current.pending_update);
        assert!(config.prior_update_failed);
    }

    #[test]
    fn blank_password_keeps_stored_one_for_same_network() {
        let current = Config {
            ssid: "HomeNet".to_string(),
            passphrase: "secret".to_string(),
            configured: true,
            ..Config::default()
        };

        let resaved = ConfigForm::from_fields(&fields(&[
            ("ssid", "HomeNet"),
            ("password", ""),
            ("brightness", "90"),
        ]))
        .apply_to(&current)
        .unwrap();
        assert_eq!(resaved.passphrase, "secret");
        assert_eq!(resaved.brightness, 90);

        let moved = ConfigForm::from_fields(&fields(&[("ssid", "CafeNet"), ("password", "")]))
            .apply_to(&current)
            .unwrap();
        assert_eq!(moved.passphrase, "");
    }
}
