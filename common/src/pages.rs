//! HTML for the setup portal.

use std::fmt::Write;

use crate::{
    config::Config,
    time::WallClock,
    update::UpdateStatus,
};

const STYLE: &str = "<style>body{font-family:Arial,sans-serif;margin:20px;background:#f0f0f0}\
.box{max-width:600px;margin:0 auto;background:#fff;padding:20px;border-radius:10px}\
.item{margin:10px 0;padding:10px;background:#f9f9f9;border-radius:5px}\
.ok{background:#e8f5e8;color:#2e7d2e}.warn{background:#fff3cd;color:#856404}\
input,select{width:100%;padding:8px;margin:4px 0 12px;box-sizing:border-box}\
button{background:#4CAF50;color:#fff;padding:10px 20px;border:none;border-radius:4px}</style>";

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn page(title: &str, head_extra: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><title>{title}</title>\
<meta name='viewport' content='width=device-width, initial-scale=1'>{head_extra}{STYLE}</head>\
<body><div class='box'>{body}</div></body></html>"
    )
}

pub fn setup_page(config: &Config, update: &UpdateStatus, prior_update_failed: bool) -> String {
    let mut body = String::from("<h1>Word Clock Setup</h1>");
    if prior_update_failed {
        body.push_str(
            "<div class='item warn'>The previous automatic update did not install. \
Download it from <a href='/update-status'>update status</a> and install it by hand.</div>",
        );
    }
    if let Some(available) = &update.available {
        let _ = write!(
            body,
            "<div class='item ok'>Update available: {} \
<form method='post' action='/perform-update'><button>Install</button></form></div>",
            escape_html(&available.version)
        );
    }

    let _ = write!(
        body,
        "<form method='post' action='/save'>\
<label>WiFi network</label><input name='ssid' id='ssid' value='{ssid}'>\
<div id='networks'><button type='button' \
onclick=\"fetch('/scan').then(r=>r.text()).then(h=>networks.innerHTML=h)\">\
Scan</button></div>\
<label>Password</label><input name='password' type='password' value=''>\
<label>Time server</label><input name='ntpserver' value='{ntp}'>\
<label>UTC offset (seconds)</label><input name='timezone' type='number' value='{offset}'>\
<label>Brightness (0-255)</label>\
<input name='brightness' type='number' min='0' max='255' value='{brightness}'>\
<label><input name='daylight_saving' type='checkbox' value='1'{dst}> Daylight saving time</label>\
<button>Save</button></form>\
<p><a href='/status'>Status</a> | <a href='/check-update'>Check for updates</a></p>\
<form method='post' action='/restart'><button>Restart</button></form>\
<form method='post' action='/reset'>\
<button style='background:#c62828'>Factory reset</button></form>\
<script>function selectWiFi(s){{ssid.value=s}}</script>",
        ssid = escape_html(&config.ssid),
        ntp = escape_html(&config.ntp_server),
        offset = config.utc_offset_secs,
        brightness = config.brightness,
        dst = if config.dst_enabled { " checked" } else { "" },
    );
    page("Word Clock Setup", "", &body)
}

pub fn scan_fragment(networks: &[(String, i8)]) -> String {
    if networks.is_empty() {
        return "<div>No networks found</div>".to_string();
    }
    networks
        .iter()
        .map(|(ssid, rssi)| {
            let ssid = escape_html(ssid);
            format!(
                "<div class='wifi-item' onclick='selectWiFi(this.dataset.ssid)' \
data-ssid=\"{ssid}\">{ssid} ({rssi} dBm)</div>"
            )
        })
        .collect()
}

pub struct StatusView<'a> {
    pub mode: &'a str,
    pub connected: bool,
    pub address: Option<&'a str>,
    pub ssid: &'a str,
    pub time: WallClock,
    pub dst_active: bool,
    pub time_synced: bool,
    pub update: &'a UpdateStatus,
    pub prior_update_failed: bool,
}

pub fn status_page(view: &StatusView<'_>) -> String {
    let mut body = String::from("<h1>Word Clock Status</h1>");
    let _ = write!(
        body,
        "<div class='item'>Firmware: {}</div>\
<div class='item'>Mode: {}</div>\
<div class='item'>WiFi: {}</div>\
<div class='item'>IP: {}</div>\
<div class='item'>SSID: {}</div>\
<div class='item'>Time: {}:{:02} ({}){}</div>",
        escape_html(&view.update.current_version),
        view.mode,
        if view.connected { "Connected" } else { "Disconnected" },
        view.address.unwrap_or("None"),
        escape_html(view.ssid),
        view.time.hour,
        view.time.minute,
        if view.dst_active { "DST" } else { "STD" },
        if view.time_synced { "" } else { " not synced" },
    );
    if let Some(available) = &view.update.available {
        let _ = write!(
            body,
            "<div class='item ok'>Update Available: {}</div>",
            escape_html(&available.version)
        );
    }
    if view.update.image_ready {
        body.push_str(
            "<div class='item warn'>Update Downloaded - \
<a href='/update-status'>Installation Instructions</a></div>",
        );
    }
    if view.prior_update_failed {
        body.push_str("<div class='item warn'>Previous automatic update attempt failed.</div>");
    }
    body.push_str("<button onclick=\"location.href='/'\">Back</button>");
    page("Word Clock Status", "<meta http-equiv='refresh' content='10'>", &body)
}

pub fn message_page(title: &str, lines: &[&str]) -> String {
    let mut body = format!("<h1>{title}</h1>");
    for line in lines {
        let _ = write!(body, "<p>{line}</p>");
    }
    page(title, "", &body)
}

pub fn perform_update_page(version: &str) -> String {
    let body = format!(
        "<h1>Firmware Update</h1><p>Downloading firmware version {}.</p>\
<p>The clock leaves setup mode and shows download progress on its face. \
Do NOT power off the device.</p>\
<p>If the update cannot be installed automatically, reconnect to the setup network \
and open <a href='/update-status'>update status</a>.</p>",
        escape_html(version)
    );
    page("Updating", "", &body)
}

pub fn update_status_page(update: &UpdateStatus) -> String {
    let mut body = String::new();
    if update.downloading {
        let _ = write!(
            body,
            "<h1>Download In Progress</h1><p>Progress: {}%</p><p>Please wait...</p>",
            update.progress_pct
        );
        return page("Update Status", "<meta http-equiv='refresh' content='5'>", &body);
    }

    if update.image_ready {
        let version = update
            .available
            .as_ref()
            .map(|a| escape_html(&a.version))
            .unwrap_or_default();
        body.push_str(
            "<h1>Download Complete</h1><h2>Manual Update Required</h2>\
<div class='item ok'><h3>Step 1: Download the firmware file</h3>\
<p><a href='/download-update'><button>Download firmware</button></a></p></div>\
<div class='item'><h3>Step 2: Flash it</h3>\
<p>Connect the clock over USB and write the file with your usual flashing tool.</p></div>",
        );
        let _ = write!(body, "<p><strong>Version:</strong> {version}</p>");
        if let Some(sha) = &update.image_sha256 {
            let _ = write!(body, "<p><strong>SHA-256:</strong> <code>{sha}</code></p>");
        }
    } else {
        body.push_str(
            "<h1>Download Failed</h1><p>Please try again or check your internet connection.</p>",
        );
        if let Some(err) = &update.last_error {
            let _ = write!(body, "<p>{}</p>", escape_html(err));
        }
        body.push_str("<button onclick=\"location.href='/'\">Back to Config</button>");
    }
    page("Update Status", "", &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup_in_user_text() {
        assert_eq!(escape_html("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }

    #[test]
    fn scan_lists_each_network_with_rssi() {
        let html = scan_fragment(&[("Home".to_string(), -48), ("<evil>".to_string(), -80)]);
        assert!(html.contains("Home (-48 dBm)"));
        assert!(html.contains("&lt;evil&gt; (-80 dBm)"));
        assert_eq!(scan_fragment(&[]), "<div>No networks found</div>");
    }

    #[test]
    fn setup_page_prefills_saved_values() {
        let config = Config {
            ssid: "Home".to_string(),
            brightness: 99,
            dst_enabled: false,
            ..Config::default()
        };
        let update = UpdateStatus {
            current_version: "1.0.1".to_string(),
            available: None,
            downloading: false,
            progress_pct: 0,
            image_ready: false,
            image_sha256: None,
            last_error: None,
        };
        let html = setup_page(&config, &update, true);
        assert!(html.contains("value='Home'"));
        assert!(html.contains("value='99'"));
        assert!(!html.contains(" checked"));
        assert!(html.contains("previous automatic update did not install"));
    }
}
