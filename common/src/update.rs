use std::{
    fs::{self, File},
    io::{Cursor, Read, Write},
    path::{Path, PathBuf},
};

use log::{info, warn};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::{
    config::PendingUpdate,
    error::{ClockError, Result},
    settings::{FIRMWARE_ASSET_EXTENSIONS, UPDATE_USER_AGENT},
    version::Version,
};

pub const DOWNLOAD_CHUNK_SIZE: usize = 4096;

/// Streaming body of one HTTP response.
pub trait HttpBody {
    fn status(&self) -> u16;
    fn content_length(&self) -> Option<u64>;
    /// Reads up to `buf.len()` bytes; 0 means the peer closed the body.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

pub trait HttpTransport {
    fn get<'a>(&'a mut self, url: &str, headers: &[(&str, &str)]) -> Result<Box<dyn HttpBody + 'a>>;
}

/// Where a downloaded image is staged before it is applied or handed out.
pub trait UpdateStorage {
    fn begin(&mut self) -> Result<()>;
    fn append(&mut self, chunk: &[u8]) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
    /// Removes any staged bytes, complete or not.
    fn discard(&mut self);
    /// Size of a complete staged image, if any.
    fn stored_len(&self) -> Option<u64>;
    fn open(&self) -> Result<Box<dyn Read + Send>>;
}

impl<T: UpdateStorage + ?Sized> UpdateStorage for Box<T> {
    fn begin(&mut self) -> Result<()> {
        (**self).begin()
    }

    fn append(&mut self, chunk: &[u8]) -> Result<()> {
        (**self).append(chunk)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }

    fn discard(&mut self) {
        (**self).discard()
    }

    fn stored_len(&self) -> Option<u64> {
        (**self).stored_len()
    }

    fn open(&self) -> Result<Box<dyn Read + Send>> {
        (**self).open()
    }
}

/// Image file on a filesystem. Bytes land in `<path>.part` and only reach
/// `path` once `finish` renames them, so a file at `path` is always complete.
pub struct FileUpdateStorage {
    path: PathBuf,
    staging: PathBuf,
    writer: Option<File>,
}

impl FileUpdateStorage {
    /// Any staging file left by an interrupted download is removed here.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut staging = path.clone().into_os_string();
        staging.push(".part");
        let storage = Self {
            path,
            staging: staging.into(),
            writer: None,
        };
        storage.remove_staging();
        storage
    }

    fn remove_staging(&self) {
        remove_if_present(&self.staging);
    }
}

fn remove_if_present(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove {}: {err}", path.display());
        }
    }
}

impl UpdateStorage for FileUpdateStorage {
    fn begin(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        remove_if_present(&self.path);
        self.writer = Some(File::create(&self.staging)?);
        Ok(())
    }

    fn append(&mut self, chunk: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ClockError::storage("update file not open"))?;
        writer.write_all(chunk)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Err(ClockError::storage("update file not open"));
        };
        writer.flush()?;
        writer.sync_all()?;
        drop(writer);
        fs::rename(&self.staging, &self.path)?;
        Ok(())
    }

    fn discard(&mut self) {
        self.writer = None;
        self.remove_staging();
        remove_if_present(&self.path);
    }

    fn stored_len(&self) -> Option<u64> {
        if self.writer.is_some() {
            return None;
        }
        fs::metadata(&self.path).ok().map(|meta| meta.len())
    }

    fn open(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&self.path)?))
    }
}

/// Staging in RAM, for boards without a filesystem partition.
#[derive(Debug, Default)]
pub struct MemoryUpdateStorage {
    bytes: Vec<u8>,
    writing: bool,
    complete: bool,
}

impl UpdateStorage for MemoryUpdateStorage {
    fn begin(&mut self) -> Result<()> {
        self.bytes.clear();
        self.writing = true;
        self.complete = false;
        Ok(())
    }

    fn append(&mut self, chunk: &[u8]) -> Result<()> {
        if !self.writing {
            return Err(ClockError::storage("update buffer not open"));
        }
        self.bytes.extend_from_slice(chunk);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writing = false;
        self.complete = true;
        Ok(())
    }

    fn discard(&mut self) {
        self.bytes.clear();
        self.writing = false;
        self.complete = false;
    }

    fn stored_len(&self) -> Option<u64> {
        self.complete.then_some(self.bytes.len() as u64)
    }

    fn open(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.bytes.clone())))
    }
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub version: String,
    pub download_url: Option<String>,
}

/// Reads a release manifest: the tag (without a leading `v`) and the first
/// asset whose name ends in one of `extensions`.
pub fn parse_manifest(body: &[u8], extensions: &[&str]) -> Result<ManifestEntry> {
    let release: Release = serde_json::from_slice(body)
        .map_err(|err| ClockError::ManifestFetchFailed(format!("bad manifest: {err}")))?;
    let version = release
        .tag_name
        .strip_prefix('v')
        .unwrap_or(&release.tag_name)
        .to_string();
    let download_url = release
        .assets
        .into_iter()
        .find(|asset| extensions.iter().any(|ext| asset.name.ends_with(ext)))
        .map(|asset| asset.browser_download_url)
        .filter(|url| !url.is_empty());
    Ok(ManifestEntry {
        version,
        download_url,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

impl DownloadProgress {
    pub fn percent(&self) -> u8 {
        match self.total {
            Some(0) | None => 0,
            Some(total) => (self.downloaded.min(total) * 100 / total) as u8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub bytes: u64,
    pub sha256: String,
}

/// Streams `url` into `storage` chunk by chunk. Any failure, or a body that
/// ends short of its declared length, discards what was staged.
pub fn download<T, S>(
    transport: &mut T,
    storage: &mut S,
    url: &str,
    mut on_progress: impl FnMut(DownloadProgress),
) -> Result<DownloadReport>
where
    T: HttpTransport + ?Sized,
    S: UpdateStorage + ?Sized,
{
    let mut body = transport.get(url, &[("User-Agent", UPDATE_USER_AGENT)])?;
    if body.status() != 200 {
        return Err(ClockError::network(format!("download returned HTTP {}", body.status())));
    }
    let total = body.content_length();

    storage.begin()?;
    let mut hasher = Sha256::new();
    let mut progress = DownloadProgress {
        downloaded: 0,
        total,
    };
    let mut buf = vec![0u8; DOWNLOAD_CHUNK_SIZE];

    let streamed = loop {
        if total.is_some_and(|total| progress.downloaded >= total) {
            break Ok(());
        }
        let read = match body.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(read) => read,
            Err(err) => break Err(err),
        };
        if let Err(err) = storage.append(&buf[..read]) {
            break Err(err);
        }
        hasher.update(&buf[..read]);
        progress.downloaded += read as u64;
        on_progress(progress);
    };

    let complete = match total {
        Some(total) => progress.downloaded == total,
        None => progress.downloaded > 0,
    };
    if let Err(err) = streamed.and_then(|()| {
        if complete {
            storage.finish()
        } else {
            Err(ClockError::DownloadIncomplete {
                received: progress.downloaded,
                expected: total.unwrap_or(0),
            })
        }
    }) {
        warn!("download of {url} failed after {} bytes: {err}", progress.downloaded);
        storage.discard();
        return Err(match err {
            err @ ClockError::DownloadIncomplete { .. } => err,
            _ => ClockError::DownloadIncomplete {
                received: progress.downloaded,
                expected: total.unwrap_or(0),
            },
        });
    }

    let sha256 = hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect();
    info!("downloaded {} bytes from {url}", progress.downloaded);
    Ok(DownloadReport {
        bytes: progress.downloaded,
        sha256,
    })
}

/// Writes a staged image to the inactive firmware slot.
pub trait FlashApplier {
    fn apply(&mut self, image: &mut dyn Read, len: u64) -> Result<()>;
}

/// Never flashes; every image goes to manual installation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualInstallOnly;

impl FlashApplier for ManualInstallOnly {
    fn apply(&mut self, _image: &mut dyn Read, _len: u64) -> Result<()> {
        Err(ClockError::ApplyFailed(
            "automatic flashing is disabled, install manually".to_string(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateDescriptor {
    pub version: String,
    pub url: String,
    pub downloaded: u64,
    pub total: Option<u64>,
    pub auto_apply_attempted: bool,
}

impl UpdateDescriptor {
    pub fn new(version: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            url: url.into(),
            downloaded: 0,
            total: None,
            auto_apply_attempted: false,
        }
    }

    pub fn progress(&self) -> DownloadProgress {
        DownloadProgress {
            downloaded: self.downloaded,
            total: self.total,
        }
    }

    pub fn to_pending(&self) -> PendingUpdate {
        PendingUpdate {
            version: self.version.clone(),
            url: self.url.clone(),
        }
    }

    pub fn file_name(&self) -> String {
        let extension = FIRMWARE_ASSET_EXTENSIONS
            .iter()
            .find(|ext| self.url.ends_with(**ext))
            .copied()
            .unwrap_or(".bin");
        format!("wordclock-update-{}{extension}", self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    ManualFallback { reason: String },
}

/// Snapshot for the portal pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStatus {
    pub current_version: String,
    pub available: Option<UpdateDescriptor>,
    pub downloading: bool,
    pub progress_pct: u8,
    pub image_ready: bool,
    pub image_sha256: Option<String>,
    pub last_error: Option<String>,
}

pub struct UpdateManager<S> {
    storage: S,
    applier: Box<dyn FlashApplier + Send>,
    manifest_url: String,
    current_version: Version,
    current_version_text: String,
    available: Option<UpdateDescriptor>,
    image: Option<DownloadReport>,
    downloading: bool,
    last_check_ms: Option<u64>,
    last_error: Option<String>,
}

impl<S: UpdateStorage> UpdateManager<S> {
    pub fn new(
        storage: S,
        applier: Box<dyn FlashApplier + Send>,
        manifest_url: impl Into<String>,
        current_version: &str,
    ) -> Self {
        Self {
            storage,
            applier,
            manifest_url: manifest_url.into(),
            current_version: Version::parse(current_version),
            current_version_text: current_version.to_string(),
            available: None,
            image: None,
            downloading: false,
            last_check_ms: None,
            last_error: None,
        }
    }

    pub fn available(&self) -> Option<&UpdateDescriptor> {
        self.available.as_ref()
    }

    /// Re-arms an update that was scheduled before a restart.
    pub fn restore_pending(&mut self, pending: &PendingUpdate) {
        self.available = Some(UpdateDescriptor::new(&pending.version, &pending.url));
    }

    pub fn check_due(&self, now_ms: u64, interval_ms: u64) -> bool {
        self.last_check_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= interval_ms)
    }

    pub fn check_remote_manifest<T: HttpTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        now_ms: u64,
    ) -> Result<Option<UpdateDescriptor>> {
        self.last_check_ms = Some(now_ms);
        match self.fetch_manifest(transport) {
            Ok(entry) => {
                self.last_error = None;
                let newer = Version::parse(&entry.version) > self.current_version;
                self.available = match entry.download_url {
                    Some(url) if newer => {
                        info!("update available: {} -> {}", self.current_version, entry.version);
                        Some(UpdateDescriptor::new(entry.version, url))
                    }
                    _ => {
                        info!("no update newer than {}", self.current_version);
                        None
                    }
                };
                Ok(self.available.clone())
            }
            // A failed fetch says nothing about the release; keep what we knew.
            Err(err) => {
                warn!("update check failed: {err}");
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    fn fetch_manifest<T>(&self, transport: &mut T) -> Result<ManifestEntry>
    where
        T: HttpTransport + ?Sized,
    {
        let fetch_error = |err: ClockError| ClockError::ManifestFetchFailed(err.to_string());
        let mut body = transport
            .get(
                &self.manifest_url,
                &[
                    ("User-Agent", UPDATE_USER_AGENT),
                    ("Accept", "application/vnd.github+json"),
                ],
            )
            .map_err(fetch_error)?;
        if body.status() != 200 {
            return Err(ClockError::ManifestFetchFailed(format!(
                "manifest returned HTTP {}",
                body.status()
            )));
        }

        let mut raw = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let read = body.read(&mut buf).map_err(fetch_error)?;
            if read == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..read]);
        }
        parse_manifest(&raw, FIRMWARE_ASSET_EXTENSIONS)
    }

    /// Downloads the known update. On failure the update stays available so
    /// the user can retry.
    pub fn download_available<T: HttpTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        mut on_progress: impl FnMut(DownloadProgress),
    ) -> Result<DownloadReport> {
        let url = match &self.available {
            Some(descriptor) => descriptor.url.clone(),
            None => return Err(ClockError::ManifestFetchFailed("no update available".to_string())),
        };

        self.image = None;
        self.downloading = true;
        let available = &mut self.available;
        let result = download(transport, &mut self.storage, &url, |progress| {
            if let Some(descriptor) = available.as_mut() {
                descriptor.downloaded = progress.downloaded;
                descriptor.total = progress.total;
            }
            on_progress(progress);
        });
        self.downloading = false;

        match &result {
            Ok(report) => {
                self.last_error = None;
                self.image = Some(report.clone());
            }
            Err(err) => self.last_error = Some(err.to_string()),
        }
        result
    }

    /// Tries the automatic flash first; anything short of success leaves the
    /// staged image for manual installation.
    pub fn apply_tiered(&mut self) -> ApplyOutcome {
        if let Some(descriptor) = self.available.as_mut() {
            descriptor.auto_apply_attempted = true;
        }
        let Some(len) = self.storage.stored_len() else {
            let reason = "no downloaded image to apply".to_string();
            self.last_error = Some(reason.clone());
            return ApplyOutcome::ManualFallback { reason };
        };

        let result = self
            .storage
            .open()
            .and_then(|mut image| self.applier.apply(&mut image, len));
        match result {
            Ok(()) => {
                info!("update applied automatically");
                ApplyOutcome::Applied
            }
            Err(err) => {
                warn!("automatic apply declined: {err}");
                let reason = err.to_string();
                self.last_error = Some(reason.clone());
                ApplyOutcome::ManualFallback { reason }
            }
        }
    }

    pub fn progress_percent(&self) -> u8 {
        if self.image.is_some() {
            return 100;
        }
        self.available
            .as_ref()
            .map_or(0, |descriptor| descriptor.progress().percent())
    }

    pub fn image_ready(&self) -> bool {
        self.image.is_some() || self.storage.stored_len().is_some()
    }

    /// Staged image and the file name to offer it under.
    pub fn open_image(&self) -> Result<Option<(Box<dyn Read + Send>, String, Option<u64>)>> {
        let Some(len) = self.storage.stored_len() else {
            return Ok(None);
        };
        let name = self
            .available
            .as_ref()
            .map(UpdateDescriptor::file_name)
            .unwrap_or_else(|| "wordclock-update.bin".to_string());
        Ok(Some((self.storage.open()?, name, Some(len))))
    }

    pub fn status(&self) -> UpdateStatus {
        UpdateStatus {
            current_version: self.current_version_text.clone(),
            available: self.available.clone(),
            downloading: self.downloading,
            progress_pct: self.progress_percent(),
            image_ready: self.image_ready(),
            image_sha256: self.image.as_ref().map(|image| image.sha256.clone()),
            last_error: self.last_error.clone(),
        }
    }
}
