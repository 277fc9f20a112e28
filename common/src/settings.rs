//! Compile-time parameters of the firmware.

pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const AP_SSID: &str = "WordClock-Setup";
pub const AP_PASSPHRASE: &str = "Wordclock";

pub const DEFAULT_NTP_SERVER: &str = "pool.ntp.org";
pub const DEFAULT_BRIGHTNESS: u8 = 64;

pub const BUTTON_HOLD_MS: u64 = 3_000;
pub const WIFI_CONNECT_TIMEOUT_MS: u64 = 30_000;
pub const NTP_RESYNC_INTERVAL_MS: u64 = 30 * 60 * 1_000;
pub const UPDATE_CHECK_INTERVAL_MS: u64 = 24 * 60 * 60 * 1_000;

pub const TICK_MS: u64 = 50;
pub const RENDER_INTERVAL_MS: u64 = 1_000;
pub const PORTAL_ANIMATION_STEP_MS: u64 = 50;
pub const RESTART_GRACE_MS: u64 = 1_000;

pub const UPDATE_MANIFEST_URL: &str =
    "https://api.github.com/repos/wordclock-firmware/wordclock/releases/latest";
pub const UPDATE_USER_AGENT: &str = "WordClock-OTA-Updater";
pub const FIRMWARE_ASSET_EXTENSIONS: &[&str] = &[".bin", ".uf2"];

/// Size of the persistent byte page the configuration record lives in.
pub const STORE_SIZE: usize = 512;
/// How long an HTTP handler waits for the control loop to answer.
pub const PORTAL_CALL_TIMEOUT_MS: u64 = 15_000;
