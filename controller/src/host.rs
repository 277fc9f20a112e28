use std::{
    io::{ErrorKind, Read},
    net::SocketAddr,
    path::PathBuf,
    sync::OnceLock,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, HeaderValue, Method as HttpMethod, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use smart_leds::RGB8;
use tokio::{net::TcpListener, runtime::Handle, sync::oneshot, task::JoinHandle};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use wordclock_common::{
    portal::{self, parse_form},
    settings::{FIRMWARE_VERSION, PORTAL_CALL_TIMEOUT_MS, STORE_SIZE, UPDATE_MANIFEST_URL},
    store::MemoryByteStore,
    ByteStore, ClockError, DeviceController, FileUpdateStorage, HttpBody, HttpTransport, LedSink,
    ManualInstallOnly, Method, NetworkTime, Platform, PortalClient, PortalReply, PortalRequest,
    ReplyBody, Result, ScannedNetwork, Segment, Ticker, LED_COUNT,
};

/// Process-level settings for the desktop build, all from the environment.
#[derive(Debug, Clone)]
struct HostOptions {
    data_dir: PathBuf,
    http_addr: SocketAddr,
    manifest_url: String,
    networks: Vec<ScannedNetwork>,
}

impl HostOptions {
    fn from_env() -> anyhow::Result<Self> {
        let data_dir = std::env::var("WORDCLOCK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.wordclock"));
        let http_addr = std::env::var("WORDCLOCK_HTTP_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let http_addr = http_addr
            .parse()
            .with_context(|| format!("WORDCLOCK_HTTP_ADDR '{http_addr}' is not a socket address"))?;
        let manifest_url = std::env::var("WORDCLOCK_MANIFEST_URL")
            .unwrap_or_else(|_| UPDATE_MANIFEST_URL.to_string());
        let networks = std::env::var("WORDCLOCK_SIM_NETWORKS")
            .map(|raw| parse_networks(&raw))
            .unwrap_or_default();

        Ok(Self {
            data_dir,
            http_addr,
            manifest_url,
            networks,
        })
    }
}

/// `ssid:rssi` pairs separated by commas; a missing rssi reads as -60 dBm.
fn parse_networks(raw: &str) -> Vec<ScannedNetwork> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (ssid, rssi) = entry.rsplit_once(':').unwrap_or((entry, "-60"));
            ScannedNetwork {
                ssid: ssid.to_string(),
                rssi: rssi.trim().parse().unwrap_or(-60),
            }
        })
        .collect()
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let options = HostOptions::from_env()?;
    std::fs::create_dir_all(&options.data_dir)
        .with_context(|| format!("failed to create {}", options.data_dir.display()))?;
    info!(
        "word clock {FIRMWARE_VERSION} simulator, data in {}",
        options.data_dir.display()
    );

    loop {
        let options = options.clone();
        let runtime = Handle::current();
        // The controller blocks, so it gets a thread of its own; the portal
        // server it starts runs back on this runtime.
        let controller = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut controller = build_controller(&options, runtime)?;
            controller.run();
            Ok(())
        });

        tokio::select! {
            result = controller => {
                result.context("controller thread panicked")??;
                info!("simulated restart");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, exiting");
                std::process::exit(0);
            }
        }
    }
}

fn build_controller(
    options: &HostOptions,
    runtime: Handle,
) -> anyhow::Result<DeviceController<HostPlatform>> {
    let storage = FileByteStore::open(options.data_dir.join("config.bin"), STORE_SIZE)?;
    let platform = HostPlatform::new(options, runtime)?;
    Ok(DeviceController::new(
        platform,
        Box::new(TerminalFace::new()),
        Box::new(storage),
        Box::new(FileUpdateStorage::new(options.data_dir.join("update.bin"))),
        Box::new(ManualInstallOnly),
        &options.manifest_url,
        FIRMWARE_VERSION,
    ))
}

/// Byte page mirrored to a file; `commit` replaces the file atomically.
struct FileByteStore {
    path: PathBuf,
    page: MemoryByteStore,
}

impl FileByteStore {
    fn open(path: PathBuf, size: usize) -> Result<Self> {
        let mut page = MemoryByteStore::new(size);
        match std::fs::read(&path) {
            Ok(raw) => {
                let len = raw.len().min(size);
                page.bytes_mut()[..len].copy_from_slice(&raw[..len]);
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(Self { path, page })
    }
}

impl ByteStore for FileByteStore {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.page.read(offset, buf)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.page.write(offset, data)
    }

    fn commit(&mut self) -> Result<()> {
        self.page.commit()?;
        let staging = self.path.with_extension("tmp");
        std::fs::write(&staging, self.page.bytes())?;
        std::fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

/// Logs the words the face would show whenever they change.
struct TerminalFace {
    pixels: [RGB8; LED_COUNT],
    shown: String,
}

impl TerminalFace {
    fn new() -> Self {
        Self {
            pixels: [RGB8::default(); LED_COUNT],
            shown: String::new(),
        }
    }

    fn describe(&self) -> String {
        let lit: Vec<&str> = Segment::all()
            .filter(|segment| {
                segment
                    .leds()
                    .iter()
                    .all(|led| self.pixels[*led] != RGB8::default())
            })
            .map(Segment::label)
            .collect();
        lit.join(" ")
    }
}

impl LedSink for TerminalFace {
    fn set_pixel(&mut self, index: usize, color: RGB8) {
        if let Some(pixel) = self.pixels.get_mut(index) {
            *pixel = color;
        }
    }

    fn flush(&mut self) {
        let text = self.describe();
        if text != self.shown {
            debug!("face: {text}");
            self.shown = text;
        }
    }
}

struct PortalServer {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Desktop stand-in for the board: the radio is simulated, network time is
/// the system clock, and the portal is a local axum server.
struct HostPlatform {
    runtime: Handle,
    http: reqwest::blocking::Client,
    http_addr: SocketAddr,
    networks: Vec<ScannedNetwork>,
    button_path: PathBuf,
    station: Option<String>,
    access_point: bool,
    time_server: Option<String>,
    portal: Option<PortalServer>,
}

impl HostPlatform {
    fn new(options: &HostOptions, runtime: Handle) -> anyhow::Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            runtime,
            http,
            http_addr: options.http_addr,
            networks: options.networks.clone(),
            button_path: options.data_dir.join("button"),
            station: None,
            access_point: false,
            time_server: None,
            portal: None,
        })
    }
}

impl Ticker for HostPlatform {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

impl NetworkTime for HostPlatform {
    fn query_epoch(&mut self) -> Result<i64> {
        match (&self.station, &self.time_server) {
            (Some(_), Some(_)) => Ok(chrono::Utc::now().timestamp()),
            _ => Err(ClockError::network("time client not running")),
        }
    }
}

struct ReqwestBody {
    response: reqwest::blocking::Response,
}

impl HttpBody for ReqwestBody {
    fn status(&self) -> u16 {
        self.response.status().as_u16()
    }

    fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.response.read(buf).map_err(ClockError::network)
    }
}

impl HttpTransport for HostPlatform {
    fn get<'a>(
        &'a mut self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<Box<dyn HttpBody + 'a>> {
        if self.station.is_none() {
            return Err(ClockError::network("station not connected"));
        }
        let mut request = self.http.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = request.send().map_err(ClockError::network)?;
        Ok(Box::new(ReqwestBody { response }))
    }
}

impl Platform for HostPlatform {
    fn connect_station(&mut self, ssid: &str, _passphrase: &str, _timeout_ms: u64) -> Result<()> {
        if ssid.is_empty() {
            return Err(ClockError::network("no network configured"));
        }
        if !self.networks.is_empty() && !self.networks.iter().any(|network| network.ssid == ssid) {
            return Err(ClockError::network(format!("{ssid} is not in range")));
        }
        info!("joined {ssid} (simulated)");
        self.station = Some(ssid.to_string());
        Ok(())
    }

    fn start_access_point(&mut self, ssid: &str, _passphrase: &str) -> Result<()> {
        info!("access point {ssid} up (simulated)");
        self.access_point = true;
        Ok(())
    }

    fn scan_networks(&mut self) -> Result<Vec<ScannedNetwork>> {
        Ok(self.networks.clone())
    }

    fn station_address(&self) -> Option<String> {
        self.station.as_ref().map(|_| "127.0.0.1".to_string())
    }

    fn radio_off(&mut self) {
        if self.station.take().is_some() || self.access_point {
            debug!("radio off");
        }
        self.access_point = false;
    }

    fn start_portal(&mut self, client: PortalClient) -> Result<()> {
        let addr = self.http_addr;
        let listener = self
            .runtime
            .block_on(TcpListener::bind(addr))
            .map_err(|err| ClockError::network(format!("failed to bind portal at {addr}: {err}")))?;

        let (shutdown, signal) = oneshot::channel::<()>();
        let app = portal_router(client);
        let task = self.runtime.spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = signal.await;
            });
            if let Err(err) = serve.await {
                warn!("portal server stopped: {err}");
            }
        });
        info!("portal listening on http://{addr}");
        self.portal = Some(PortalServer { shutdown, task });
        Ok(())
    }

    fn stop_portal(&mut self) {
        if let Some(server) = self.portal.take() {
            let _ = server.shutdown.send(());
            let stopped = self
                .runtime
                .block_on(async {
                    tokio::time::timeout(Duration::from_secs(2), server.task).await
                });
            if stopped.is_err() {
                warn!("portal connections still open, not waiting for them");
            }
            info!("portal stopped");
        }
    }

    fn start_time_client(&mut self, server: &str) -> Result<()> {
        info!("time client using {server} (system clock)");
        self.time_server = Some(server.to_string());
        Ok(())
    }

    fn stop_time_client(&mut self) {
        self.time_server = None;
    }

    /// `touch <data dir>/button` holds the button, removing the file releases it.
    fn button_pressed(&mut self) -> bool {
        self.button_path.exists()
    }

    fn restart(&mut self) {
        info!("restart requested");
    }
}

#[derive(Clone)]
struct PortalState {
    client: PortalClient,
}

fn portal_router(client: PortalClient) -> Router {
    Router::new()
        .fallback(forward)
        .with_state(PortalState { client })
        .layer(TraceLayer::new_for_http())
}

/// Every path lands here; `portal::resolve` maps it to a route, with unknown
/// paths and captive-portal checks getting the setup page.
async fn forward(
    State(state): State<PortalState>,
    method: HttpMethod,
    uri: Uri,
    body: String,
) -> Response {
    let method = if method == HttpMethod::GET {
        Method::Get
    } else if method == HttpMethod::POST {
        Method::Post
    } else {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    };
    let route = portal::resolve(method, uri.path());
    let encoded = match method {
        Method::Post => body,
        Method::Get => uri.query().unwrap_or_default().to_string(),
    };
    let request = PortalRequest::with_form(route, parse_form(&encoded));

    let client = state.client.clone();
    let result = tokio::task::spawn_blocking(move || {
        let reply = client.call(request, Duration::from_millis(PORTAL_CALL_TIMEOUT_MS))?;
        ReplyParts::collect(reply)
    })
    .await;

    match result {
        Ok(Ok(parts)) => parts.into_response(),
        Ok(Err(err)) => {
            warn!("portal request failed: {err}");
            error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string())
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

/// A reply with any attachment read into memory, ready for axum.
struct ReplyParts {
    status: StatusCode,
    content_type: &'static str,
    disposition: Option<String>,
    body: Vec<u8>,
}

impl ReplyParts {
    fn collect(reply: PortalReply) -> Result<Self> {
        let status =
            StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let content_type = reply.content_type();
        let disposition = reply.content_disposition();
        let body = match reply.body {
            ReplyBody::Html(text) | ReplyBody::Text(text) => text.into_bytes(),
            ReplyBody::Attachment { mut reader, len, .. } => {
                let mut bytes = Vec::with_capacity(len.unwrap_or(0) as usize);
                reader.read_to_end(&mut bytes)?;
                bytes
            }
        };
        Ok(Self {
            status,
            content_type,
            disposition,
            body,
        })
    }
}

impl IntoResponse for ReplyParts {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            [(header::CONTENT_TYPE, self.content_type)],
            self.body,
        )
            .into_response();
        if let Some(value) = self
            .disposition
            .and_then(|disposition| HeaderValue::from_str(&disposition).ok())
        {
            response
                .headers_mut()
                .insert(header::CONTENT_DISPOSITION, value);
        }
        response
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
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
