use std::{
    net::{Ipv4Addr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::{
    http::{Headers, Method as EspMethod},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyIOPin, IOPin, Input, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{
        adc::{
            attenuation::DB_11,
            oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
            ADC1,
        },
        gpio::Gpio1,
        prelude::Peripherals,
    },
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::{EspSntp, SntpConf, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};

use wordclock_common::{
    dns::{captive_answer, DNS_PORT, MAX_DNS_PACKET},
    portal::{self, parse_form, CAPTIVE_CHECK_PATHS, ROUTES},
    settings::{FIRMWARE_VERSION, PORTAL_CALL_TIMEOUT_MS, STORE_SIZE, UPDATE_MANIFEST_URL},
    store::MemoryByteStore,
    ByteStore, ClockError, DeviceController, FileUpdateStorage, HttpBody, HttpTransport,
    ManualInstallOnly, MemoryUpdateStorage, Method, NetworkTime, Platform, PortalClient,
    PortalReply, PortalRequest, ReplyBody, Result, ScannedNetwork, Ticker, UpdateStorage,
};

use crate::leds::LedStrip;

const NVS_NAMESPACE: &str = "wordclock";
const NVS_CONFIG_KEY: &str = "config";
const MAX_HTTP_BODY: usize = 4096;
const TRANSFER_CHUNK_SIZE: usize = 4096;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const SPIFFS_BASE_PATH: &core::ffi::CStr = c"/spiffs";
const UPDATE_FILE_PATH: &str = "/spiffs/update.bin";
const DEFAULT_AP_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);
const DNS_POLL_MS: u64 = 200;

type LightSensor = AdcChannelDriver<'static, Gpio1, AdcDriver<'static, ADC1>>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let leds = match LedStrip::new(peripherals.rmt.channel0, peripherals.pins.gpio5) {
        Ok(strip) => {
            info!("LED strip initialized on RMT channel0 / GPIO5");
            strip
        }
        Err(err) => {
            warn!("failed to initialize LED strip, running dark: {err:#}");
            LedStrip::disabled()
        }
    };

    let storage = NvsByteStore::open(nvs_partition.clone())?;
    let update_storage: Box<dyn UpdateStorage + Send> = match mount_spiffs() {
        Ok(()) => Box::new(FileUpdateStorage::new(UPDATE_FILE_PATH)),
        Err(err) => {
            warn!("update staging falls back to RAM: {err:#}");
            Box::new(MemoryUpdateStorage::default())
        }
    };

    let wifi = BlockingWifi::wrap(
        EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs_partition))?,
        sys_loop,
    )?;

    let mut button = PinDriver::input(peripherals.pins.gpio0.downgrade())?;
    button.set_pull(Pull::Up)?;

    let light = if option_env!("WORDCLOCK_LIGHT_SENSOR").is_some() {
        init_light_sensor(peripherals.adc1, peripherals.pins.gpio1)
    } else {
        None
    };

    let board = EspBoard {
        wifi,
        sntp: None,
        portal: None,
        dns: None,
        button,
        light,
    };

    let mut controller = DeviceController::new(
        board,
        Box::new(leds),
        Box::new(storage),
        update_storage,
        Box::new(ManualInstallOnly),
        UPDATE_MANIFEST_URL,
        FIRMWARE_VERSION,
    );
    controller.run();
    Ok(())
}

struct EspBoard {
    wifi: BlockingWifi<EspWifi<'static>>,
    sntp: Option<EspSntp<'static>>,
    portal: Option<EspHttpServer<'static>>,
    dns: Option<CaptiveDns>,
    button: PinDriver<'static, AnyIOPin, Input>,
    light: Option<LightSensor>,
}

fn esp_err(err: impl core::fmt::Debug) -> ClockError {
    ClockError::network(format!("{err:?}"))
}

impl Ticker for EspBoard {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&mut self, ms: u64) {
        feed_watchdog();
        thread::sleep(Duration::from_millis(ms));
    }
}

impl NetworkTime for EspBoard {
    fn query_epoch(&mut self) -> Result<i64> {
        match &self.sntp {
            Some(sntp) if sntp.get_sync_status() == SyncStatus::Completed => {
                Ok(Utc::now().timestamp())
            }
            Some(_) => Err(ClockError::network("SNTP not synchronized yet")),
            None => Err(ClockError::network("time client not running")),
        }
    }
}

struct EspBody {
    connection: EspHttpConnection,
}

impl HttpBody for EspBody {
    fn status(&self) -> u16 {
        self.connection.status()
    }

    fn content_length(&self) -> Option<u64> {
        self.connection
            .header("Content-Length")
            .or_else(|| self.connection.header("content-length"))
            .and_then(|value| value.parse::<u64>().ok())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        feed_watchdog();
        self.connection.read(buf).map_err(esp_err)
    }
}

impl HttpTransport for EspBoard {
    fn get<'a>(
        &'a mut self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<Box<dyn HttpBody + 'a>> {
        if !self.wifi.is_connected().unwrap_or(false) {
            return Err(ClockError::network("station not connected"));
        }
        let conf = HttpClientConfiguration {
            timeout: Some(Duration::from_secs(30)),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let mut connection = EspHttpConnection::new(&conf).map_err(esp_err)?;
        connection
            .initiate_request(EspMethod::Get, url, headers)
            .map_err(esp_err)?;
        connection.initiate_response().map_err(esp_err)?;
        Ok(Box::new(EspBody { connection }))
    }
}

impl Platform for EspBoard {
    fn connect_station(&mut self, ssid: &str, passphrase: &str, timeout_ms: u64) -> Result<()> {
        let auth_method = if passphrase.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| ClockError::network("wifi ssid too long"))?,
                password: passphrase
                    .try_into()
                    .map_err(|_| ClockError::network("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))
            .map_err(esp_err)?;
        self.wifi.start().map_err(esp_err)?;
        info!("wifi started, connecting to `{ssid}`");

        let deadline = monotonic_ms().saturating_add(timeout_ms);
        let mut attempt = 0;
        loop {
            attempt += 1;
            feed_watchdog();
            let result = self.wifi.connect().and_then(|()| self.wifi.wait_netif_up());
            match result {
                Ok(()) => {
                    info!("wifi connected and netif up on attempt {attempt}");
                    disable_wifi_power_save();
                    return Ok(());
                }
                Err(err) => warn!("wifi connect attempt {attempt} failed: {err:#}"),
            }
            if monotonic_ms() >= deadline {
                return Err(ClockError::network(format!(
                    "could not join `{ssid}` within {timeout_ms} ms"
                )));
            }
            let _ = self.wifi.disconnect();
            self.sleep_ms(WIFI_RETRY_DELAY_MS);
        }
    }

    fn start_access_point(&mut self, ssid: &str, passphrase: &str) -> Result<()> {
        // Mixed mode keeps station scans available while the AP is up.
        self.wifi
            .set_configuration(&Configuration::Mixed(
                ClientConfiguration::default(),
                AccessPointConfiguration {
                    ssid: ssid
                        .try_into()
                        .map_err(|_| ClockError::network("AP SSID too long"))?,
                    password: passphrase
                        .try_into()
                        .map_err(|_| ClockError::network("AP password too long"))?,
                    auth_method: AuthMethod::WPA2Personal,
                    channel: 1,
                    ..Default::default()
                },
            ))
            .map_err(esp_err)?;
        self.wifi.start().map_err(esp_err)?;
        self.wifi.wait_netif_up().map_err(esp_err)?;
        info!("setup AP started on `{ssid}`");
        Ok(())
    }

    fn scan_networks(&mut self) -> Result<Vec<ScannedNetwork>> {
        let found = self.wifi.scan().map_err(esp_err)?;
        Ok(found
            .into_iter()
            .filter(|ap| !ap.ssid.is_empty())
            .map(|ap| ScannedNetwork {
                ssid: ap.ssid.to_string(),
                rssi: ap.signal_strength,
            })
            .collect())
    }

    fn station_address(&self) -> Option<String> {
        if !self.wifi.is_connected().unwrap_or(false) {
            return None;
        }
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip.to_string())
    }

    fn radio_off(&mut self) {
        let _ = self.wifi.disconnect();
        if let Err(err) = self.wifi.stop() {
            debug!("wifi stop: {err:?}");
        }
    }

    fn start_portal(&mut self, client: PortalClient) -> Result<()> {
        let server = create_portal_server(client).map_err(esp_err)?;
        self.portal = Some(server);
        info!("portal listening");

        let ap_ip = self
            .wifi
            .wifi()
            .ap_netif()
            .get_ip_info()
            .map(|info| info.ip)
            .unwrap_or(DEFAULT_AP_IP);
        match CaptiveDns::start(ap_ip) {
            Ok(dns) => self.dns = Some(dns),
            Err(err) => warn!("captive DNS unavailable: {err:#}"),
        }
        Ok(())
    }

    fn stop_portal(&mut self) {
        if let Some(dns) = self.dns.take() {
            dns.stop();
        }
        if self.portal.take().is_some() {
            info!("portal stopped");
        }
    }

    fn start_time_client(&mut self, server: &str) -> Result<()> {
        let mut conf = SntpConf::default();
        conf.servers[0] = server;
        self.sntp = Some(EspSntp::new(&conf).map_err(esp_err)?);
        info!("SNTP started against {server}");
        Ok(())
    }

    fn stop_time_client(&mut self) {
        self.sntp = None;
    }

    fn button_pressed(&mut self) -> bool {
        self.button.is_low()
    }

    fn ambient_light(&mut self) -> Option<u16> {
        self.light.as_mut().and_then(|sensor| sensor.read_raw().ok())
    }

    fn restart(&mut self) {
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

/// Answers every DNS query with the access point address until stopped.
struct CaptiveDns {
    running: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl CaptiveDns {
    fn start(answer_ip: Ipv4Addr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, DNS_PORT))
            .context("failed to bind DNS port")?;
        socket.set_read_timeout(Some(Duration::from_millis(DNS_POLL_MS)))?;
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let running = running.clone();
            thread::Builder::new()
                .name("captive-dns".into())
                .stack_size(6 * 1024)
                .spawn(move || serve_dns(&socket, &running, answer_ip))?
        };
        info!("captive DNS answering with {answer_ip}");
        Ok(Self { running, worker })
    }

    fn stop(self) {
        self.running.store(false, Ordering::Relaxed);
        if self.worker.join().is_err() {
            warn!("captive DNS thread panicked");
        }
        debug!("captive DNS stopped");
    }
}

fn serve_dns(socket: &UdpSocket, running: &AtomicBool, answer_ip: Ipv4Addr) {
    let mut frame = [0_u8; MAX_DNS_PACKET];
    while running.load(Ordering::Relaxed) {
        let (len, remote) = match socket.recv_from(&mut frame) {
            Ok(received) => received,
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue
            }
            Err(err) => {
                warn!("DNS receive error: {err}");
                thread::sleep(Duration::from_millis(DNS_POLL_MS));
                continue;
            }
        };
        let Some(reply) = captive_answer(&frame[..len], answer_ip) else {
            continue;
        };
        if let Err(err) = socket.send_to(&reply, remote) {
            warn!("DNS send error: {err}");
        }
    }
}

fn create_portal_server(client: PortalClient) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        max_uri_handlers: ROUTES.len() + CAPTIVE_CHECK_PATHS.len() + 4,
        uri_match_wildcard: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    // Registration order is match order, so the catch-all goes last.
    let captive = CAPTIVE_CHECK_PATHS
        .iter()
        .map(|path| (Method::Get, *path))
        .chain([(Method::Get, "/*")]);
    let endpoints = ROUTES.iter().map(|(method, path, _)| (*method, *path)).chain(captive);
    for (method, path) in endpoints {
        let client = client.clone();
        let esp_method = match method {
            Method::Get => EspMethod::Get,
            Method::Post => EspMethod::Post,
        };
        server.fn_handler::<anyhow::Error, _>(path, esp_method, move |mut req| {
            let uri = req.uri().to_string();
            let encoded = match method {
                Method::Post => String::from_utf8_lossy(&read_request_body(&mut req)?).into_owned(),
                Method::Get => uri
                    .split_once('?')
                    .map(|(_, query)| query.to_string())
                    .unwrap_or_default(),
            };
            let route = portal::resolve(method, &uri);
            let request = PortalRequest::with_form(route, parse_form(&encoded));

            match client.call(request, Duration::from_millis(PORTAL_CALL_TIMEOUT_MS)) {
                Ok(reply) => write_reply(req, reply),
                Err(err) => write_error(req, 503, &err.to_string()),
            }
        })?;
    }

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_reply(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    reply: PortalReply,
) -> anyhow::Result<()> {
    let disposition = reply.content_disposition();
    let mut headers = vec![("Content-Type", reply.content_type())];
    if let Some(disposition) = disposition.as_deref() {
        headers.push(("Content-Disposition", disposition));
    }

    let mut response = req.into_response(reply.status, None, &headers)?;
    match reply.body {
        ReplyBody::Html(text) | ReplyBody::Text(text) => response.write_all(text.as_bytes())?,
        ReplyBody::Attachment { mut reader, .. } => {
            let mut chunk = [0_u8; TRANSFER_CHUNK_SIZE];
            loop {
                let read = std::io::Read::read(&mut reader, &mut chunk)?;
                if read == 0 {
                    break;
                }
                response.write_all(&chunk[..read])?;
            }
        }
    }
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "text/plain; charset=utf-8")],
    )?
    .write_all(message.as_bytes())?;
    Ok(())
}

/// The configuration page kept as one NVS blob; commits write it back whole.
struct NvsByteStore {
    nvs: EspNvs<NvsDefault>,
    page: MemoryByteStore,
}

impl NvsByteStore {
    fn open(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)?;
        let mut page = MemoryByteStore::new(STORE_SIZE);
        let mut buffer = vec![0_u8; STORE_SIZE];
        if let Some(stored) = nvs.get_blob(NVS_CONFIG_KEY, &mut buffer)? {
            let len = stored.len().min(STORE_SIZE);
            page.bytes_mut()[..len].copy_from_slice(&stored[..len]);
        }
        Ok(Self { nvs, page })
    }
}

impl ByteStore for NvsByteStore {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.page.read(offset, buf)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.page.write(offset, data)
    }

    fn commit(&mut self) -> Result<()> {
        self.page.commit()?;
        self.nvs
            .set_blob(NVS_CONFIG_KEY, self.page.bytes())
            .map_err(|err| ClockError::storage(format!("{err:?}")))
    }
}

fn mount_spiffs() -> anyhow::Result<()> {
    let conf = esp_idf_svc::sys::esp_vfs_spiffs_conf_t {
        base_path: SPIFFS_BASE_PATH.as_ptr(),
        partition_label: core::ptr::null(),
        max_files: 2,
        format_if_mount_failed: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_vfs_spiffs_register(&conf) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_vfs_spiffs_register failed with code {}", rc))
}

fn init_light_sensor(adc: ADC1, pin: Gpio1) -> Option<LightSensor> {
    let config = AdcChannelConfig {
        attenuation: DB_11,
        ..Default::default()
    };
    let sensor = AdcDriver::new(adc)
        .and_then(|driver| AdcChannelDriver::new(driver, pin, &config))
        .context("failed to init light sensor ADC");
    match sensor {
        Ok(sensor) => {
            info!("ambient light sensor on GPIO1");
            Some(sensor)
        }
        Err(err) => {
            warn!("ambient light sensor unavailable: {err:#}");
            None
        }
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        debug!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
