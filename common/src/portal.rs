use std::{
    collections::HashMap,
    io::Read,
    sync::{
        mpsc::{self, Receiver, Sender, SyncSender},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use crate::error::{ClockError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Root,
    Save,
    Status,
    Scan,
    Reset,
    Restart,
    CheckUpdate,
    PerformUpdate,
    UpdateProgress,
    UpdateStatus,
    DownloadUpdate,
}

/// Every endpoint the portal listens on.
pub const ROUTES: &[(Method, &str, Route)] = &[
    (Method::Get, "/", Route::Root),
    (Method::Post, "/save", Route::Save),
    (Method::Get, "/status", Route::Status),
    (Method::Get, "/scan", Route::Scan),
    (Method::Post, "/reset", Route::Reset),
    (Method::Post, "/restart", Route::Restart),
    (Method::Get, "/check-update", Route::CheckUpdate),
    (Method::Get, "/perform-update", Route::PerformUpdate),
    (Method::Post, "/perform-update", Route::PerformUpdate),
    (Method::Get, "/update-progress", Route::UpdateProgress),
    (Method::Get, "/update-status", Route::UpdateStatus),
    (Method::Get, "/download-update", Route::DownloadUpdate),
];

/// URLs phones and laptops hit to detect a captive portal.
pub const CAPTIVE_CHECK_PATHS: &[&str] = &[
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/library/test/success.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

/// Unknown paths and method mismatches land on the setup page.
pub fn resolve(method: Method, path: &str) -> Route {
    let path = path.split('?').next().unwrap_or(path);
    ROUTES
        .iter()
        .find(|(m, p, _)| *m == method && *p == path)
        .map_or(Route::Root, |(_, _, route)| *route)
}

impl Route {
    pub fn allowed_in_manual_fallback(self) -> bool {
        matches!(
            self,
            Self::Root
                | Self::Status
                | Self::UpdateStatus
                | Self::UpdateProgress
                | Self::DownloadUpdate
                | Self::Restart
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalRequest {
    pub route: Route,
    pub form: HashMap<String, String>,
}

impl PortalRequest {
    pub fn new(route: Route) -> Self {
        Self {
            route,
            form: HashMap::new(),
        }
    }

    pub fn with_form(route: Route, form: HashMap<String, String>) -> Self {
        Self { route, form }
    }
}

pub enum ReplyBody {
    Html(String),
    Text(String),
    Attachment {
        reader: Box<dyn Read + Send>,
        file_name: String,
        len: Option<u64>,
    },
}

pub struct PortalReply {
    pub status: u16,
    pub body: ReplyBody,
}

impl PortalReply {
    pub fn html(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: ReplyBody::Html(body.into()),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: ReplyBody::Text(body.into()),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self.body {
            ReplyBody::Html(_) => "text/html; charset=utf-8",
            ReplyBody::Text(_) => "text/plain; charset=utf-8",
            ReplyBody::Attachment { .. } => "application/octet-stream",
        }
    }

    pub fn content_disposition(&self) -> Option<String> {
        match &self.body {
            ReplyBody::Attachment { file_name, .. } => {
                Some(format!("attachment; filename=\"{file_name}\""))
            }
            _ => None,
        }
    }

    /// Text body for assertions and logs; attachments read as empty.
    pub fn body_text(&self) -> &str {
        match &self.body {
            ReplyBody::Html(text) | ReplyBody::Text(text) => text,
            ReplyBody::Attachment { .. } => "",
        }
    }
}

impl std::fmt::Debug for PortalReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalReply")
            .field("status", &self.status)
            .field("content_type", &self.content_type())
            .finish()
    }
}

/// One request waiting for the control loop to answer.
pub struct PortalCall {
    pub request: PortalRequest,
    reply: SyncSender<PortalReply>,
}

impl PortalCall {
    pub fn respond(self, reply: PortalReply) {
        // The HTTP side may have timed out and dropped its receiver.
        let _ = self.reply.send(reply);
    }
}

/// Whether the control loop is taking requests. Sends happen under this lock,
/// so once `close` returns every request that got through is in the inbox.
type Gate = Arc<Mutex<bool>>;

fn lock(gate: &Gate) -> MutexGuard<'_, bool> {
    gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle the HTTP server threads use to reach the control loop.
#[derive(Clone)]
pub struct PortalClient {
    tx: Sender<PortalCall>,
    gate: Gate,
}

impl PortalClient {
    pub fn call(&self, request: PortalRequest, timeout: Duration) -> Result<PortalReply> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        {
            let open = lock(&self.gate);
            if !*open {
                return Err(ClockError::network("portal is shutting down"));
            }
            self.tx
                .send(PortalCall {
                    request,
                    reply: reply_tx,
                })
                .map_err(|_| ClockError::network("control loop is gone"))?;
        }
        reply_rx
            .recv_timeout(timeout)
            .map_err(|_| ClockError::network("control loop did not answer"))
    }
}

/// Receiving end, owned by the control loop. Starts closed.
pub struct PortalInbox {
    rx: Receiver<PortalCall>,
    gate: Gate,
}

impl PortalInbox {
    pub fn try_next(&self) -> Option<PortalCall> {
        self.rx.try_recv().ok()
    }

    pub fn open(&self) {
        *lock(&self.gate) = true;
    }

    /// Refuses new calls and answers the queued ones with 503, so no server
    /// thread is left waiting on the loop.
    pub fn close(&self) -> usize {
        *lock(&self.gate) = false;
        self.drain()
    }

    /// Drops requests that arrived while nothing was serving them.
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        while let Some(call) = self.try_next() {
            call.respond(PortalReply::text(503, "Busy, try again"));
            dropped += 1;
        }
        dropped
    }
}

pub fn portal_channel() -> (PortalClient, PortalInbox) {
    let (tx, rx) = mpsc::channel();
    let gate = Gate::default();
    (
        PortalClient {
            tx,
            gate: gate.clone(),
        },
        PortalInbox { rx, gate },
    )
}

/// Parses an `application/x-www-form-urlencoded` body or query string.
pub fn parse_form(encoded: &str) -> HashMap<String, String> {
    encoded
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(key), percent_decode(value))
        })
        .collect()
}

fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => out.push(b' '),
            b'%' if index + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[index + 1..index + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(value) => {
                        out.push(value);
                        index += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        index += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Instant};

    use super::*;

    #[test]
    fn routes_resolve_by_method_and_path() {
        assert_eq!(resolve(Method::Post, "/save"), Route::Save);
        assert_eq!(resolve(Method::Get, "/perform-update"), Route::PerformUpdate);
        assert_eq!(resolve(Method::Post, "/perform-update"), Route::PerformUpdate);
        assert_eq!(resolve(Method::Get, "/status?x=1"), Route::Status);
    }

    #[test]
    fn unknown_paths_fall_back_to_setup_page() {
        assert_eq!(resolve(Method::Get, "/generate_204"), Route::Root);
        assert_eq!(resolve(Method::Get, "/save"), Route::Root);
    }

    #[test]
    fn manual_fallback_scope() {
        assert!(Route::DownloadUpdate.allowed_in_manual_fallback());
        assert!(!Route::Save.allowed_in_manual_fallback());
        assert!(!Route::PerformUpdate.allowed_in_manual_fallback());
    }

    #[test]
    fn form_decoding_handles_escapes() {
        let form = parse_form("ssid=My+Home%21&password=a%26b%3Dc&daylight_saving=1&bad=%zz");
        assert_eq!(form["ssid"], "My Home!");
        assert_eq!(form["password"], "a&b=c");
        assert_eq!(form["daylight_saving"], "1");
        assert_eq!(form["bad"], "%zz");
    }

    #[test]
    fn call_is_answered_by_the_inbox_owner() {
        let (client, inbox) = portal_channel();
        inbox.open();
        let server = thread::spawn(move || {
            client.call(PortalRequest::new(Route::Status), Duration::from_secs(5))
        });

        let call = loop {
            if let Some(call) = inbox.try_next() {
                break call;
            }
            thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(call.request.route, Route::Status);
        call.respond(PortalReply::text(200, "ok"));

        let reply = server.join().unwrap().unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body_text(), "ok");
    }

    #[test]
    fn attachment_sets_disposition() {
        let reply = PortalReply {
            status: 200,
            body: ReplyBody::Attachment {
                reader: Box::new(std::io::empty()),
                file_name: "wordclock-update-1.1.0.bin".to_string(),
                len: Some(0),
            },
        };
        assert_eq!(reply.content_type(), "application/octet-stream");
        assert_eq!(
            reply.content_disposition().as_deref(),
            Some("attachment; filename=\"wordclock-update-1.1.0.bin\"")
        );
    }

    #[test]
    fn closed_inbox_refuses_calls_without_waiting() {
        let (client, inbox) = portal_channel();
        let started = Instant::now();
        assert!(client.call(PortalRequest::new(Route::Root), Duration::from_secs(5)).is_err());

        inbox.open();
        let waiting = {
            let client = client.clone();
            thread::spawn(move || {
                client.call(PortalRequest::new(Route::Status), Duration::from_secs(5))
            })
        };
        thread::sleep(Duration::from_millis(20));
        inbox.close();

        // Either queued and answered with 503, or refused at the gate.
        match waiting.join().unwrap() {
            Ok(reply) => assert_eq!(reply.status, 503),
            Err(err) => assert_eq!(err, ClockError::network("portal is shutting down")),
        }
        assert!(client.call(PortalRequest::new(Route::Root), Duration::from_secs(5)).is_err());
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
