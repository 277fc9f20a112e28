use log::{debug, error, info, warn};

use crate::{
    button::HoldButton,
    config::{Config, ConfigForm},
    display::{
        ambient_brightness, failure_flash, manual_update_frame, portal_frame, progress_frame,
        startup_sweep, success_flash, Frame, LedSink,
    },
    error::Result,
    pages::{self, StatusView},
    portal::{
        portal_channel, PortalClient, PortalInbox, PortalReply, PortalRequest, ReplyBody, Route,
    },
    settings::{
        AP_PASSPHRASE, AP_SSID, BUTTON_HOLD_MS, NTP_RESYNC_INTERVAL_MS, PORTAL_ANIMATION_STEP_MS,
        RENDER_INTERVAL_MS, RESTART_GRACE_MS, TICK_MS, UPDATE_CHECK_INTERVAL_MS,
        WIFI_CONNECT_TIMEOUT_MS,
    },
    store::{ByteStore, ConfigStore, LoadOutcome},
    time::{is_dst_active_for, NetworkTime, SoftRtc, SyncPolicy, Ticker, TimeSource},
    update::{ApplyOutcome, FlashApplier, HttpTransport, UpdateManager, UpdateStorage},
    words::render,
};

/// Retry spacing for network time while the clock has never been set.
const UNSYNCED_RETRY_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    Normal,
    ConfigPortal,
    UpdateChecking,
    UpdateDownloading,
    UpdateApplying,
    UpdateManualFallback,
}

impl DeviceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::ConfigPortal => "CONFIG_PORTAL",
            Self::UpdateChecking => "UPDATE_CHECKING",
            Self::UpdateDownloading => "UPDATE_DOWNLOADING",
            Self::UpdateApplying => "UPDATE_APPLYING",
            Self::UpdateManualFallback => "UPDATE_MANUAL_FALLBACK",
        }
    }

    fn uses_station(self) -> bool {
        matches!(self, Self::Normal | Self::UpdateChecking | Self::UpdateDownloading)
    }

    fn serves_portal(self) -> bool {
        matches!(self, Self::ConfigPortal | Self::UpdateManualFallback)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedNetwork {
    pub ssid: String,
    pub rssi: i8,
}

/// Board services the mode controller drives. Each backend maps these onto
/// its radio, time client and HTTP listener.
pub trait Platform: Ticker + NetworkTime + HttpTransport {
    fn connect_station(&mut self, ssid: &str, passphrase: &str, timeout_ms: u64) -> Result<()>;
    fn start_access_point(&mut self, ssid: &str, passphrase: &str) -> Result<()>;
    fn scan_networks(&mut self) -> Result<Vec<ScannedNetwork>>;
    fn station_address(&self) -> Option<String>;
    /// Disconnects everything and powers the radio down.
    fn radio_off(&mut self);

    fn start_portal(&mut self, client: PortalClient) -> Result<()>;
    fn stop_portal(&mut self);

    fn start_time_client(&mut self, server: &str) -> Result<()>;
    fn stop_time_client(&mut self);

    fn button_pressed(&mut self) -> bool;

    /// Raw 12-bit light sensor reading, when the board has one.
    fn ambient_light(&mut self) -> Option<u16> {
        None
    }

    fn restart(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterReply {
    Restart,
    Enter(DeviceMode),
}

/// What the current mode holds; everything here is released before the next
/// mode acquires anything.
#[derive(Debug, Default, Clone, Copy)]
struct Held {
    portal: bool,
    time_client: bool,
    radio: bool,
}

pub struct DeviceController<P> {
    platform: P,
    leds: Box<dyn LedSink + Send>,
    store: ConfigStore<Box<dyn ByteStore + Send>>,
    config: Config,
    time: TimeSource<SoftRtc>,
    updates: UpdateManager<Box<dyn UpdateStorage + Send>>,
    mode: DeviceMode,
    held: Held,
    portal_client: PortalClient,
    inbox: PortalInbox,
    button: HoldButton,
    frame: Frame,
    after_reply: Option<AfterReply>,
    last_render_ms: Option<u64>,
    last_sync_attempt_ms: Option<u64>,
    last_animation_ms: u64,
    animation_tick: u32,
}

impl<P: Platform> DeviceController<P> {
    pub fn new(
        platform: P,
        leds: Box<dyn LedSink + Send>,
        storage: Box<dyn ByteStore + Send>,
        update_storage: Box<dyn UpdateStorage + Send>,
        applier: Box<dyn FlashApplier + Send>,
        manifest_url: &str,
        firmware_version: &str,
    ) -> Self {
        let (portal_client, inbox) = portal_channel();
        Self {
            platform,
            leds,
            store: ConfigStore::new(storage),
            config: Config::default(),
            time: TimeSource::new(SoftRtc::default()),
            updates: UpdateManager::new(update_storage, applier, manifest_url, firmware_version),
            mode: DeviceMode::ConfigPortal,
            held: Held::default(),
            portal_client,
            inbox,
            button: HoldButton::new(BUTTON_HOLD_MS),
            frame: Frame::default(),
            after_reply: None,
            last_render_ms: None,
            last_sync_attempt_ms: None,
            last_animation_ms: 0,
            animation_tick: 0,
        }
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Boots, then runs the cooperative loop until a restart is due.
    pub fn run(&mut self) {
        self.boot();
        loop {
            if self.tick() == LoopControl::Restart {
                self.platform.restart();
                return;
            }
            self.platform.sleep_ms(TICK_MS);
        }
    }

    pub fn boot(&mut self) {
        info!("word clock booting");
        self.time.initialize_local_clock();

        let configured = match self.store.load() {
            LoadOutcome::Loaded(config) => {
                self.config = config;
                true
            }
            LoadOutcome::NotConfigured => {
                info!("no valid configuration stored");
                self.config = Config::default();
                false
            }
        };
        startup_sweep(self.leds.as_mut(), &mut self.platform, self.config.brightness);

        let target = if !configured {
            DeviceMode::ConfigPortal
        } else if let Some(pending) = self.config.pending_update.clone() {
            info!("scheduled update to {} found", pending.version);
            self.updates.restore_pending(&pending);
            DeviceMode::UpdateChecking
        } else {
            DeviceMode::Normal
        };
        self.enter(target);
    }

    /// One pass of the control loop: at most one unit of work per subsystem.
    pub fn tick(&mut self) -> LoopControl {
        if let Some(next) = self.after_reply.take() {
            self.platform.sleep_ms(RESTART_GRACE_MS);
            match next {
                AfterReply::Restart => return self.hard_reset(),
                AfterReply::Enter(mode) => {
                    self.enter(mode);
                    return LoopControl::Continue;
                }
            }
        }

        let now_ms = self.platform.now_ms();
        match self.mode {
            DeviceMode::Normal => self.tick_normal(now_ms),
            DeviceMode::ConfigPortal | DeviceMode::UpdateManualFallback => self.tick_portal(now_ms),
            DeviceMode::UpdateChecking => self.tick_update_check(now_ms),
            DeviceMode::UpdateDownloading => self.tick_download(),
            DeviceMode::UpdateApplying => return self.tick_apply(),
        }
        LoopControl::Continue
    }

    fn enter(&mut self, target: DeviceMode) {
        self.release_all();
        info!("mode {} -> {}", self.mode.as_str(), target.as_str());
        self.mode = target;

        if let Err(err) = self.acquire(target) {
            warn!("could not enter {}: {err}", target.as_str());
            self.release_all();
            if target != DeviceMode::ConfigPortal {
                self.mode = DeviceMode::ConfigPortal;
                if let Err(err) = self.acquire(DeviceMode::ConfigPortal) {
                    error!("setup portal unavailable: {err}");
                }
            }
        }
    }

    fn acquire(&mut self, mode: DeviceMode) -> Result<()> {
        self.button.reset();
        self.last_render_ms = None;
        self.animation_tick = 0;

        if mode.uses_station() {
            self.held.radio = true;
            self.platform.connect_station(
                &self.config.ssid,
                &self.config.passphrase,
                WIFI_CONNECT_TIMEOUT_MS,
            )?;
            info!("joined {}", self.config.ssid);
        }

        if mode == DeviceMode::Normal {
            self.held.time_client = true;
            self.platform.start_time_client(&self.config.ntp_server)?;
            self.sync_time(SyncPolicy::INTERACTIVE);
        }

        if mode.serves_portal() {
            self.held.radio = true;
            self.platform.start_access_point(AP_SSID, AP_PASSPHRASE)?;
            self.held.portal = true;
            self.inbox.open();
            self.platform.start_portal(self.portal_client.clone())?;
            info!("setup portal open on {AP_SSID}");
        }
        Ok(())
    }

    /// Stops the listener, the time client, then the radio, then blanks the face.
    /// The inbox closes first: server threads parked in a call must return
    /// before the listener can shut down.
    fn release_all(&mut self) {
        if self.held.portal {
            let dropped = self.inbox.close();
            if dropped > 0 {
                warn!("dropped {dropped} unanswered portal requests");
            }
            self.platform.stop_portal();
        }
        if self.held.time_client {
            self.platform.stop_time_client();
        }
        if self.held.radio {
            self.platform.radio_off();
        }
        self.held = Held::default();
        self.frame.clear();
        self.frame.write_to(self.leds.as_mut(), 0);
    }

    fn hard_reset(&mut self) -> LoopControl {
        info!("restarting");
        self.release_all();
        self.platform.sleep_ms(RESTART_GRACE_MS);
        LoopControl::Restart
    }

    fn display_level(&mut self) -> u8 {
        self.platform
            .ambient_light()
            .map(ambient_brightness)
            .unwrap_or(self.config.brightness)
    }

    fn sync_time(&mut self, policy: SyncPolicy) {
        self.last_sync_attempt_ms = Some(self.platform.now_ms());
        if let Err(err) = self.time.sync_from_network(
            &mut self.platform,
            policy,
            self.config.utc_offset_secs,
            self.config.dst_enabled,
        ) {
            warn!("time sync failed: {err}");
        }
    }

    fn sync_due(&self, now_ms: u64) -> bool {
        if !self.time.needs_resync(now_ms, NTP_RESYNC_INTERVAL_MS) {
            return false;
        }
        self.last_sync_attempt_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= UNSYNCED_RETRY_MS)
    }

    fn tick_normal(&mut self, now_ms: u64) {
        let pressed = self.platform.button_pressed();
        if self.button.sample(pressed, now_ms) {
            info!("setup button held, opening portal");
            self.enter(DeviceMode::ConfigPortal);
            return;
        }

        if self.sync_due(now_ms) {
            self.sync_time(SyncPolicy::BACKGROUND);
        } else if self.updates.check_due(now_ms, UPDATE_CHECK_INTERVAL_MS) {
            // Availability is only recorded; installing is the user's call.
            match self.updates.check_remote_manifest(&mut self.platform, now_ms) {
                Ok(Some(found)) => {
                    info!("update {} can be installed from the portal", found.version)
                }
                Ok(None) => {}
                Err(err) => debug!("periodic update check failed, keeping previous state: {err}"),
            }
        }

        let render_due = self
            .last_render_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= RENDER_INTERVAL_MS);
        if render_due {
            self.last_render_ms = Some(now_ms);
            let wall = self.time.current_wall_clock(now_ms);
            let level = self.display_level();
            self.frame.clear();
            self.frame.paint_segments(&render(wall.hour, wall.minute));
            self.frame.write_to(self.leds.as_mut(), level);
        }
    }

    fn tick_portal(&mut self, now_ms: u64) {
        if let Some(call) = self.inbox.try_next() {
            let reply = self.handle_request(&call.request);
            call.respond(reply);
        }

        if now_ms.saturating_sub(self.last_animation_ms) >= PORTAL_ANIMATION_STEP_MS {
            self.last_animation_ms = now_ms;
            self.animation_tick = self.animation_tick.wrapping_add(1);
            self.frame = if self.mode == DeviceMode::UpdateManualFallback {
                manual_update_frame(self.animation_tick)
            } else {
                portal_frame(self.animation_tick)
            };
            let level = self.config.brightness.max(32);
            self.frame.write_to(self.leds.as_mut(), level);
        }
    }

    fn tick_update_check(&mut self, now_ms: u64) {
        match self.updates.check_remote_manifest(&mut self.platform, now_ms) {
            Ok(Some(found)) => {
                self.config.pending_update = Some(found.to_pending());
                self.persist();
                self.enter(DeviceMode::UpdateDownloading);
            }
            Ok(None) => {
                info!("scheduled update no longer newer, dropping it");
                self.config.pending_update = None;
                self.persist();
                self.enter(DeviceMode::Normal);
            }
            Err(err) => {
                warn!("scheduled update check failed, will retry next boot: {err}");
                self.enter(DeviceMode::Normal);
            }
        }
    }

    fn tick_download(&mut self) {
        let level = self.display_level();
        let leds = &mut self.leds;
        let result = self.updates.download_available(&mut self.platform, |progress| {
            progress_frame(progress.percent()).write_to(leds.as_mut(), level);
        });

        match result {
            Ok(report) => {
                info!("image staged: {} bytes, sha256 {}", report.bytes, report.sha256);
                self.enter(DeviceMode::UpdateApplying);
            }
            Err(err) => {
                warn!("update download failed: {err}");
                failure_flash(self.leds.as_mut(), &mut self.platform, level);
                self.config.pending_update = None;
                self.persist();
                self.enter(DeviceMode::Normal);
            }
        }
    }

    fn tick_apply(&mut self) -> LoopControl {
        let level = self.display_level();
        match self.updates.apply_tiered() {
            ApplyOutcome::Applied => {
                self.config.pending_update = None;
                self.config.prior_update_failed = false;
                self.persist();
                success_flash(self.leds.as_mut(), &mut self.platform, level);
                self.hard_reset()
            }
            ApplyOutcome::ManualFallback { reason } => {
                warn!("manual install required: {reason}");
                self.config.pending_update = None;
                self.config.prior_update_failed = true;
                self.persist();
                failure_flash(self.leds.as_mut(), &mut self.platform, level);
                self.enter(DeviceMode::UpdateManualFallback);
                LoopControl::Continue
            }
        }
    }

    fn persist(&mut self) {
        if !self.config.configured {
            return;
        }
        match self.store.save(&self.config) {
            Ok(stored) => self.config = stored,
            Err(err) => warn!("failed to persist configuration: {err}"),
        }
    }

    /// Answers one portal request. Restarts and mode changes it triggers run
    /// on the next tick, after the reply has gone out.
    pub fn handle_request(&mut self, request: &PortalRequest) -> PortalReply {
        if self.mode == DeviceMode::UpdateManualFallback
            && !request.route.allowed_in_manual_fallback()
        {
            return PortalReply::text(409, "Not available while a manual update is pending");
        }

        match request.route {
            Route::Root if self.mode == DeviceMode::UpdateManualFallback => {
                PortalReply::html(pages::update_status_page(&self.updates.status()))
            }
            Route::Root => {
                let page = pages::setup_page(
                    &self.config,
                    &self.updates.status(),
                    self.config.prior_update_failed,
                );
                self.acknowledge_update_failure();
                PortalReply::html(page)
            }
            Route::Save => self.handle_save(request),
            Route::Status => self.handle_status(),
            Route::Scan => match self.platform.scan_networks() {
                Ok(networks) => {
                    let networks: Vec<(String, i8)> =
                        networks.into_iter().map(|n| (n.ssid, n.rssi)).collect();
                    PortalReply::html(pages::scan_fragment(&networks))
                }
                Err(err) => PortalReply::text(503, format!("Scan failed: {err}")),
            },
            Route::Reset => match self.store.reset() {
                Ok(defaults) => {
                    info!("factory reset");
                    self.config = defaults;
                    self.after_reply = Some(AfterReply::Restart);
                    PortalReply::html(pages::message_page(
                        "Factory Reset Complete",
                        &["System will restart in a few seconds..."],
                    ))
                }
                Err(err) => PortalReply::text(500, format!("Reset failed: {err}")),
            },
            Route::Restart => {
                self.after_reply = Some(AfterReply::Restart);
                PortalReply::html(pages::message_page(
                    "System Restarting",
                    &["Please wait for restart to complete..."],
                ))
            }
            Route::CheckUpdate => self.handle_check_update(),
            Route::PerformUpdate => self.handle_perform_update(),
            Route::UpdateProgress => {
                PortalReply::text(200, self.updates.progress_percent().to_string())
            }
            Route::UpdateStatus => {
                PortalReply::html(pages::update_status_page(&self.updates.status()))
            }
            Route::DownloadUpdate => match self.updates.open_image() {
                Ok(Some((reader, file_name, len))) => {
                    info!("handing out {file_name}");
                    PortalReply {
                        status: 200,
                        body: ReplyBody::Attachment {
                            reader,
                            file_name,
                            len,
                        },
                    }
                }
                Ok(None) => PortalReply::text(404, "Update file not found"),
                Err(err) => PortalReply::text(500, format!("Cannot open update file: {err}")),
            },
        }
    }

    fn handle_save(&mut self, request: &PortalRequest) -> PortalReply {
        let form = ConfigForm::from_fields(&request.form);
        let candidate = match form.apply_to(&self.config) {
            Ok(candidate) => candidate,
            Err(err) => return PortalReply::text(400, err.to_string()),
        };
        match self.store.save(&candidate) {
            Ok(stored) => {
                self.config = stored;
                self.after_reply = Some(AfterReply::Restart);
                PortalReply::html(pages::message_page(
                    "Configuration Saved!",
                    &[
                        "System will restart in a few seconds...",
                        "Please reconnect to your regular WiFi network after restart.",
                    ],
                ))
            }
            Err(err) => PortalReply::text(500, format!("Saving failed: {err}")),
        }
    }

    fn handle_status(&mut self) -> PortalReply {
        let now_ms = self.platform.now_ms();
        let time = self.time.current_wall_clock(now_ms);
        let update = self.updates.status();
        let address = self.platform.station_address();
        let view = StatusView {
            mode: self.mode.as_str(),
            connected: address.is_some(),
            address: address.as_deref(),
            ssid: &self.config.ssid,
            time,
            dst_active: is_dst_active_for(self.config.dst_enabled, time.month, time.day),
            time_synced: self.time.is_synced(),
            update: &update,
            prior_update_failed: self.config.prior_update_failed,
        };
        let page = pages::status_page(&view);
        self.acknowledge_update_failure();
        PortalReply::html(page)
    }

    /// The failed-update notice is shown once outside manual fallback, then
    /// dropped so a manually flashed clock stops warning about it.
    fn acknowledge_update_failure(&mut self) {
        if self.config.prior_update_failed && self.mode != DeviceMode::UpdateManualFallback {
            info!("failed-update notice shown, clearing it");
            self.config.prior_update_failed = false;
            self.persist();
        }
    }

    fn handle_check_update(&mut self) -> PortalReply {
        let now_ms = self.platform.now_ms();
        let current = self.updates.status().current_version;
        let line = match self.updates.check_remote_manifest(&mut self.platform, now_ms) {
            Ok(Some(found)) => format!("Update available: {}", found.version),
            Ok(None) => "No updates available".to_string(),
            Err(err) => format!("Update check failed: {err}"),
        };
        PortalReply::text(200, format!("Current version: {current}\n{line}"))
    }

    fn handle_perform_update(&mut self) -> PortalReply {
        let Some(found) = self.updates.available().cloned() else {
            return PortalReply::text(400, "No update available");
        };
        if !self.config.configured || !self.config.has_credentials() {
            return PortalReply::text(409, "Save WiFi settings before updating");
        }

        self.config.pending_update = Some(found.to_pending());
        match self.store.save(&self.config) {
            Ok(stored) => self.config = stored,
            Err(err) => return PortalReply::text(500, format!("Could not schedule update: {err}")),
        }
        info!("update to {} scheduled by user", found.version);
        self.after_reply = Some(AfterReply::Enter(DeviceMode::UpdateDownloading));
        PortalReply::html(pages::perform_update_page(&found.version))
    }
}
