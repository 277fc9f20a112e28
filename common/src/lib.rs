pub mod button;
pub mod config;
pub mod device;
pub mod display;
pub mod dns;
pub mod error;
pub mod pages;
pub mod portal;
pub mod settings;
pub mod store;
pub mod time;
pub mod update;
pub mod version;
pub mod words;

pub use config::{Config, ConfigForm, PendingUpdate};
pub use device::{DeviceController, DeviceMode, LoopControl, Platform, ScannedNetwork};
pub use display::{Frame, LedSink, LED_COUNT};
pub use error::{ClockError, Result};
pub use portal::{Method, PortalClient, PortalReply, PortalRequest, ReplyBody, Route};
pub use store::{ByteStore, ConfigStore, LoadOutcome};
pub use time::{NetworkTime, Ticker, TimeSource, WallClock};
pub use update::{
    FileUpdateStorage, FlashApplier, HttpBody, HttpTransport, ManualInstallOnly,
    MemoryUpdateStorage, UpdateManager, UpdateStorage,
};
pub use words::{render, Segment, SegmentSet};
