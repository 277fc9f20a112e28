use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use log::{debug, info, warn};

use crate::error::{ClockError, Result};

/// Broken-down local time as shown on the clock face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallClock {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    /// 0 = Sunday.
    pub weekday: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl Default for WallClock {
    fn default() -> Self {
        Self {
            year: 2000,
            month: 1,
            day: 1,
            weekday: 6,
            hour: 0,
            minute: 0,
            second: 0,
        }
    }
}

impl WallClock {
    pub fn from_naive(value: NaiveDateTime) -> Self {
        Self {
            year: value.year(),
            month: value.month(),
            day: value.day(),
            weekday: value.weekday().num_days_from_sunday(),
            hour: value.hour(),
            minute: value.minute(),
            second: value.second(),
        }
    }

    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)?.and_hms_opt(
            self.hour,
            self.minute,
            self.second,
        )
    }

    /// Interprets `secs` as seconds since the epoch already shifted into local time.
    pub fn from_local_secs(secs: i64) -> Option<Self> {
        DateTime::from_timestamp(secs, 0).map(|value| Self::from_naive(value.naive_utc()))
    }
}

/// Fixed-date approximation of the EU summer-time window: last week of March
/// through the 24th of October. Up to six days off around the switch dates.
pub fn is_dst_active_for(dst_enabled: bool, month: u32, day: u32) -> bool {
    if !dst_enabled {
        return false;
    }
    match month {
        3 => day >= 25,
        4..=9 => true,
        10 => day < 25,
        _ => false,
    }
}

/// Local wall time for a UTC epoch. The DST hour is decided from the
/// standard-time date and added once.
pub fn wall_clock_from_epoch(
    epoch_secs: i64,
    utc_offset_secs: i32,
    dst_enabled: bool,
) -> Option<WallClock> {
    let standard = epoch_secs + i64::from(utc_offset_secs);
    let date = WallClock::from_local_secs(standard)?;
    let shift = if is_dst_active_for(dst_enabled, date.month, date.day) {
        3_600
    } else {
        0
    };
    WallClock::from_local_secs(standard + shift)
}

pub trait NetworkTime {
    /// One query against the time server; UTC seconds since the epoch.
    fn query_epoch(&mut self) -> Result<i64>;
}

pub trait Ticker {
    fn now_ms(&self) -> u64;
    fn sleep_ms(&mut self, ms: u64);
}

pub trait HardwareClock {
    fn enable(&mut self);
    fn set(&mut self, wall: WallClock, now_ms: u64);
    fn read(&self, now_ms: u64) -> Result<WallClock>;
}

/// Real-time clock kept in software: a wall-time anchor plus the monotonic
/// time it was set at.
#[derive(Debug, Default, Clone)]
pub struct SoftRtc {
    enabled: bool,
    anchor: Option<(NaiveDateTime, u64)>,
}

impl HardwareClock for SoftRtc {
    fn enable(&mut self) {
        self.enabled = true;
    }

    fn set(&mut self, wall: WallClock, now_ms: u64) {
        if !self.enabled {
            return;
        }
        self.anchor = wall.to_naive().map(|value| (value, now_ms));
    }

    fn read(&self, now_ms: u64) -> Result<WallClock> {
        let (base, set_at) = self.anchor.ok_or(ClockError::HardwareClockUnavailable)?;
        let elapsed_ms = i64::try_from(now_ms.saturating_sub(set_at)).unwrap_or(i64::MAX);
        base.checked_add_signed(Duration::milliseconds(elapsed_ms))
            .map(WallClock::from_naive)
            .ok_or(ClockError::HardwareClockUnavailable)
    }
}

/// Retry budget for one network time sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    pub attempts: u32,
    pub retry_delay_ms: u64,
}

impl SyncPolicy {
    /// Boot and user-facing syncs.
    pub const INTERACTIVE: Self = Self {
        attempts: 10,
        retry_delay_ms: 1_000,
    };
    /// Periodic resync from the display loop.
    pub const BACKGROUND: Self = Self {
        attempts: 5,
        retry_delay_ms: 500,
    };
}

#[derive(Debug, Clone, Copy)]
struct NetworkSample {
    epoch_secs: i64,
    taken_at_ms: u64,
    utc_offset_secs: i32,
    dst_enabled: bool,
}

pub struct TimeSource<C> {
    clock: C,
    rtc_available: bool,
    last_sample: Option<NetworkSample>,
    cached: WallClock,
}

impl<C: HardwareClock> TimeSource<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            rtc_available: false,
            last_sample: None,
            cached: WallClock::default(),
        }
    }

    pub fn initialize_local_clock(&mut self) {
        if !self.rtc_available {
            self.clock.enable();
            self.rtc_available = true;
        }
    }

    pub fn is_synced(&self) -> bool {
        self.last_sample.is_some()
    }

    pub fn last_sync_ms(&self) -> Option<u64> {
        self.last_sample.map(|sample| sample.taken_at_ms)
    }

    pub fn sync_from_network<N>(
        &mut self,
        net: &mut N,
        policy: SyncPolicy,
        utc_offset_secs: i32,
        dst_enabled: bool,
    ) -> Result<WallClock>
    where
        N: NetworkTime + Ticker + ?Sized,
    {
        let mut last_error = ClockError::network("no attempts made");
        for attempt in 1..=policy.attempts {
            match net.query_epoch() {
                Ok(epoch_secs) => {
                    let wall = wall_clock_from_epoch(epoch_secs, utc_offset_secs, dst_enabled)
                        .ok_or_else(|| {
                            ClockError::network(format!("epoch {epoch_secs} out of range"))
                        })?;
                    let now_ms = net.now_ms();
                    self.last_sample = Some(NetworkSample {
                        epoch_secs,
                        taken_at_ms: now_ms,
                        utc_offset_secs,
                        dst_enabled,
                    });
                    if self.rtc_available {
                        self.clock.set(wall, now_ms);
                    }
                    self.cached = wall;
                    info!(
                        "time synced on attempt {attempt}: {:02}:{:02}:{:02}",
                        wall.hour, wall.minute, wall.second
                    );
                    return Ok(wall);
                }
                Err(err) => {
                    debug!("time sync attempt {attempt}/{} failed: {err}", policy.attempts);
                    last_error = err;
                    if attempt < policy.attempts {
                        net.sleep_ms(policy.retry_delay_ms);
                    }
                }
            }
        }
        warn!("time sync gave up after {} attempts", policy.attempts);
        Err(match last_error {
            err @ ClockError::NetworkUnavailable(_) => err,
            other => ClockError::network(other),
        })
    }

    pub fn current_wall_clock(&mut self, now_ms: u64) -> WallClock {
        if self.rtc_available {
            match self.clock.read(now_ms) {
                Ok(wall) => {
                    self.cached = wall;
                    return wall;
                }
                Err(err) => debug!("rtc read failed, deriving from network time: {err}"),
            }
        }

        if let Some(sample) = self.last_sample {
            let elapsed_secs = i64::try_from(now_ms.saturating_sub(sample.taken_at_ms) / 1_000)
                .unwrap_or(0);
            if let Some(wall) = wall_clock_from_epoch(
                sample.epoch_secs + elapsed_secs,
                sample.utc_offset_secs,
                sample.dst_enabled,
            ) {
                self.cached = wall;
            }
        }
        self.cached
    }

    pub fn needs_resync(&self, now_ms: u64, interval_ms: u64) -> bool {
        match self.last_sample {
            Some(sample) => now_ms.saturating_sub(sample.taken_at_ms) > interval_ms,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    // 2024-07-01T12:00:00Z and 2024-01-15T08:30:00Z
    const SUMMER_NOON_UTC: i64 = 1_719_835_200;
    const WINTER_MORNING_UTC: i64 = 1_705_307_400;

    struct ScriptedNetwork {
        replies: VecDeque<Result<i64>>,
        now_ms: u64,
        sleeps: Vec<u64>,
    }

    impl ScriptedNetwork {
        fn new(replies: Vec<Result<i64>>) -> Self {
            Self {
                replies: replies.into(),
                now_ms: 1_000,
                sleeps: Vec::new(),
            }
        }
    }

    impl NetworkTime for ScriptedNetwork {
        fn query_epoch(&mut self) -> Result<i64> {
            self.replies
                .pop_front()
                .unwrap_or_else(|| Err(ClockError::network("timeout")))
        }
    }

    impl Ticker for ScriptedNetwork {
        fn now_ms(&self) -> u64 {
            self.now_ms
        }

        fn sleep_ms(&mut self, ms: u64) {
            self.now_ms += ms;
            self.sleeps.push(ms);
        }
    }

    struct DeadRtc;

    impl HardwareClock for DeadRtc {
        fn enable(&mut self) {}
        fn set(&mut self, _wall: WallClock, _now_ms: u64) {}
        fn read(&self, _now_ms: u64) -> Result<WallClock> {
            Err(ClockError::HardwareClockUnavailable)
        }
    }

    #[test]
    fn dst_rule_uses_fixed_calendar_dates() {
        assert!(is_dst_active_for(true, 4, 1));
        assert!(!is_dst_active_for(true, 2, 15));
        assert!(!is_dst_active_for(true, 3, 24));
        assert!(is_dst_active_for(true, 3, 25));
        assert!(is_dst_active_for(true, 10, 24));
        assert!(!is_dst_active_for(true, 10, 25));
        assert!(!is_dst_active_for(true, 11, 1));
    }

    #[test]
    fn dst_rule_is_off_when_disabled() {
        assert!(!is_dst_active_for(false, 7, 1));
    }

    #[test]
    fn summer_epoch_gets_offset_plus_dst_hour() {
        let wall = wall_clock_from_epoch(SUMMER_NOON_UTC, 3_600, true).unwrap();
        assert_eq!((wall.hour, wall.minute), (14, 0));
        assert_eq!((wall.year, wall.month, wall.day), (2024, 7, 1));
        assert_eq!(wall.weekday, 1);
    }

    #[test]
    fn winter_epoch_gets_offset_only() {
        let wall = wall_clock_from_epoch(WINTER_MORNING_UTC, 3_600, true).unwrap();
        assert_eq!((wall.hour, wall.minute), (9, 30));
    }

    #[test]
    fn interactive_sync_retries_then_commits_to_rtc() {
        let mut net = ScriptedNetwork::new(vec![
            Err(ClockError::network("timeout")),
            Err(ClockError::network("timeout")),
            Ok(SUMMER_NOON_UTC),
        ]);
        let mut time = TimeSource::new(SoftRtc::default());
        time.initialize_local_clock();

        let wall = time
            .sync_from_network(&mut net, SyncPolicy::INTERACTIVE, 3_600, true)
            .unwrap();
        assert_eq!(wall.hour, 14);
        assert_eq!(net.sleeps, vec![1_000, 1_000]);

        let later = time.current_wall_clock(net.now_ms + 90_000);
        assert_eq!((later.hour, later.minute, later.second), (14, 1, 30));
    }

    #[test]
    fn exhausted_background_sync_leaves_clock_untouched() {
        let mut net = ScriptedNetwork::new(Vec::new());
        let mut time = TimeSource::new(SoftRtc::default());
        time.initialize_local_clock();

        let result = time.sync_from_network(&mut net, SyncPolicy::BACKGROUND, 0, false);
        assert!(matches!(result, Err(ClockError::NetworkUnavailable(_))));
        assert_eq!(net.sleeps, vec![500; 4]);
        assert!(!time.is_synced());
        assert_eq!(time.current_wall_clock(10_000), WallClock::default());
    }

    #[test]
    fn repeated_syncs_apply_dst_once() {
        let mut net = ScriptedNetwork::new(vec![Ok(SUMMER_NOON_UTC), Ok(SUMMER_NOON_UTC)]);
        let mut time = TimeSource::new(SoftRtc::default());
        time.initialize_local_clock();

        time.sync_from_network(&mut net, SyncPolicy::BACKGROUND, 3_600, true)
            .unwrap();
        let second = time
            .sync_from_network(&mut net, SyncPolicy::BACKGROUND, 3_600, true)
            .unwrap();
        assert_eq!(second.hour, 14);
        assert_eq!(time.current_wall_clock(net.now_ms).hour, 14);
    }

    #[test]
    fn dead_rtc_falls_back_to_network_epoch() {
        let mut net = ScriptedNetwork::new(vec![Ok(SUMMER_NOON_UTC)]);
        let mut time = TimeSource::new(DeadRtc);
        time.initialize_local_clock();
        time.sync_from_network(&mut net, SyncPolicy::INTERACTIVE, 3_600, true)
            .unwrap();

        let wall = time.current_wall_clock(net.now_ms + 61_000);
        assert_eq!((wall.hour, wall.minute, wall.second), (14, 1, 1));
    }

    #[test]
    fn resync_is_due_after_interval() {
        let mut net = ScriptedNetwork::new(vec![Ok(SUMMER_NOON_UTC)]);
        let mut time = TimeSource::new(SoftRtc::default());
        assert!(time.needs_resync(0, 60_000));

        time.sync_from_network(&mut net, SyncPolicy::BACKGROUND, 0, false)
            .unwrap();
        assert!(!time.needs_resync(net.now_ms + 60_000, 60_000));
        assert!(time.needs_resync(net.now_ms + 60_001, 60_000));
    }
}
