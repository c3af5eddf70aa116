//! Configuration and control routes over plain HTTP/1.0.
//!
//! One instance serves the station stack and one the fallback AP, so the
//! device is configurable in either mode. Static pages are out of scope;
//! every route answers plain text.

use core::fmt::Write as _;

use embassy_net::{IpListenEndpoint, Stack, tcp::TcpSocket};
use embassy_time::{Duration, with_timeout};
use embedded_io_async::Write as _;
use heapless::String;
use log::{info, warn};
use wakeon_core::connectivity::WifiMode;
use wakeon_core::dispatch::{self, Trigger, WAKE_PULSE_MS};
use wakeon_core::settings::{
    DeviceSettings, PASSPHRASE_MAX, SettingsStore, SSID_MAX,
};

use super::net::NetStatus;
use super::{SharedSettings, SharedStore, VERSION};

const HTTP_PORT: u16 = 80;
const HTTP_HEADER_MAX: usize = 1024;
const HTTP_BODY_MAX: usize = 512;
const HTTP_RW_BUF: usize = 1536;
const SOCKET_TIMEOUT_SECS: u64 = 10;

#[derive(Clone, Copy)]
pub(crate) struct WebContext {
    pub stack: Stack<'static>,
    pub status: &'static NetStatus,
    pub settings: &'static SharedSettings,
    pub store: &'static SharedStore,
}

pub(crate) async fn serve(ctx: WebContext) -> ! {
    let mut rx_buffer = [0u8; HTTP_RW_BUF];
    let mut tx_buffer = [0u8; HTTP_RW_BUF];

    loop {
        let mut socket = TcpSocket::new(ctx.stack, &mut rx_buffer, &mut tx_buffer);
        socket.set_timeout(Some(Duration::from_secs(SOCKET_TIMEOUT_SECS)));

        if let Err(err) = socket
            .accept(IpListenEndpoint {
                addr: None,
                port: HTTP_PORT,
            })
            .await
        {
            warn!("web: accept failed: {err:?}");
            continue;
        }

        if let Err(err) = handle_connection(&mut socket, ctx).await {
            info!("web: request failed: {err}");
        }

        let _ = with_timeout(Duration::from_millis(250), socket.flush()).await;
        socket.close();
    }
}

async fn handle_connection(
    socket: &mut TcpSocket<'_>,
    ctx: WebContext,
) -> Result<(), &'static str> {
    let mut header_buf = [0u8; HTTP_HEADER_MAX];
    let mut filled = 0usize;
    let header_end = loop {
        if filled == header_buf.len() {
            write_response(socket, b"431 Request Header Fields Too Large", b"header too large")
                .await;
            return Err("header too large");
        }

        let n = socket
            .read(&mut header_buf[filled..])
            .await
            .map_err(|_| "read")?;
        if n == 0 {
            return Err("eof");
        }
        filled += n;

        if let Some(end) = find_header_end(&header_buf[..filled]) {
            break end;
        }
    };

    let header = core::str::from_utf8(&header_buf[..header_end]).map_err(|_| "header utf8")?;
    let (method, target) = parse_request_line(header).ok_or("bad request line")?;
    let content_length = parse_content_length(header).unwrap_or(0);
    if content_length > HTTP_BODY_MAX {
        write_response(socket, b"413 Payload Too Large", b"body too large").await;
        return Err("body too large");
    }

    let body_start = header_end + 4;
    let mut body = [0u8; HTTP_BODY_MAX];
    let mut body_len = filled.saturating_sub(body_start).min(content_length);
    body[..body_len].copy_from_slice(&header_buf[body_start..body_start + body_len]);
    while body_len < content_length {
        let n = socket
            .read(&mut body[body_len..content_length])
            .await
            .map_err(|_| "read body")?;
        if n == 0 {
            write_response(socket, b"400 Bad Request", b"incomplete body").await;
            return Err("incomplete body");
        }
        body_len += n;
    }
    let body = core::str::from_utf8(&body[..body_len]).map_err(|_| "body utf8")?;

    match (method, target_path(target)) {
        ("GET", "/") | ("GET", "/status") => {
            let page = status_text(ctx);
            write_response(socket, b"200 OK", page.as_bytes()).await;
            Ok(())
        }
        ("POST", "/wifi") => handle_wifi_update(socket, ctx, body).await,
        ("POST", "/mqtt") => handle_broker_update(socket, ctx, body).await,
        ("POST", "/pulse") => handle_pulse(socket, body).await,
        _ => {
            write_response(socket, b"404 Not Found", b"not found").await;
            Ok(())
        }
    }
}

/// The status lines the original dashboard template rendered: version,
/// mode, address, signal, session state, switch state.
fn status_text(ctx: WebContext) -> String<384> {
    let snapshot = ctx.status.snapshot();
    let mut out = String::new();

    let _ = writeln!(out, "wakeon v{VERSION}");
    let mode = match snapshot.mode {
        WifiMode::Uninitialized => "starting",
        WifiMode::ConnectingStation => "station-connecting",
        WifiMode::ConnectedStation => "station",
        WifiMode::AccessPoint => "access-point",
    };
    let _ = writeln!(out, "mode={mode}");
    let _ = writeln!(out, "link={}", if snapshot.has_ip { "up" } else { "down" });

    match ctx.stack.config_v4() {
        Some(config) => {
            let _ = writeln!(out, "ip={}", config.address.address());
        }
        None => {
            let _ = writeln!(out, "ip=none");
        }
    }
    match snapshot.rssi_dbm {
        Some(rssi) => {
            let _ = writeln!(out, "rssi={rssi}dBm");
        }
        None => {
            let _ = writeln!(out, "rssi=unknown");
        }
    }
    let _ = writeln!(
        out,
        "mqtt={}",
        if snapshot.mqtt_connected { "ENABLED" } else { "DISABLED" }
    );
    let switch = if snapshot.switch_asserted {
        "ON"
    } else if snapshot.pulse_busy {
        "PENDING"
    } else {
        "OFF"
    };
    let _ = writeln!(out, "switch={switch}");
    out
}

async fn handle_wifi_update(
    socket: &mut TcpSocket<'_>,
    ctx: WebContext,
    body: &str,
) -> Result<(), &'static str> {
    let Some(ssid) = form_field::<SSID_MAX>(body, "ssid") else {
        write_response(socket, b"400 Bad Request", b"missing or oversized ssid").await;
        return Err("bad ssid");
    };
    let Some(passphrase) = form_field::<PASSPHRASE_MAX>(body, "pass") else {
        write_response(socket, b"400 Bad Request", b"missing or oversized pass").await;
        return Err("bad pass");
    };
    if ssid.is_empty() || passphrase.is_empty() || !printable(&ssid) || !printable(&passphrase) {
        write_response(socket, b"400 Bad Request", b"invalid credentials").await;
        return Err("invalid credentials");
    }

    {
        let mut settings = ctx.settings.lock().await;
        settings.wifi.ssid = ssid;
        settings.wifi.passphrase = passphrase;
        if !persist(ctx, &settings).await {
            write_response(socket, b"500 Internal Server Error", b"failed to save settings")
                .await;
            return Err("save failed");
        }
    }

    info!("web: wifi credentials updated");
    crate::schedule_restart("wifi credentials updated");
    write_response(socket, b"200 OK", b"credentials saved; device restarting").await;
    Ok(())
}

async fn handle_broker_update(
    socket: &mut TcpSocket<'_>,
    ctx: WebContext,
    body: &str,
) -> Result<(), &'static str> {
    {
        let mut settings = ctx.settings.lock().await;
        let broker = &mut settings.broker;

        // Values land in the key=value settings text, so control
        // characters are refused wholesale.
        if let Some(host) = form_field(body, "host").filter(|v| printable(v)) {
            broker.host = host;
        }
        if let Some(port) = form_field::<8>(body, "port").and_then(|p| p.parse::<u16>().ok()) {
            broker.port = port;
        }
        if let Some(username) = form_field(body, "user").filter(|v| printable(v)) {
            broker.username = username;
        }
        if let Some(password) = form_field(body, "pass").filter(|v| printable(v)) {
            broker.password = password;
        }
        if let Some(client_id) = form_field(body, "client").filter(|v| printable(v)) {
            broker.client_id = client_id;
        }
        if let Some(topic) = form_field(body, "topic").filter(|v| printable(v)) {
            broker.command_topic = topic;
        }

        if !persist(ctx, &settings).await {
            write_response(socket, b"500 Internal Server Error", b"failed to save settings")
                .await;
            return Err("save failed");
        }
    }

    info!("web: broker settings updated");
    crate::schedule_restart("broker settings updated");
    write_response(socket, b"200 OK", b"broker settings saved; device restarting").await;
    Ok(())
}

async fn handle_pulse(socket: &mut TcpSocket<'_>, body: &str) -> Result<(), &'static str> {
    let duration_ms = form_field::<8>(body, "ms")
        .and_then(|ms| ms.parse::<u32>().ok())
        .unwrap_or(WAKE_PULSE_MS);

    let Some(request) = dispatch::translate(Trigger::WebPulse { duration_ms }) else {
        write_response(socket, b"400 Bad Request", b"invalid pulse request").await;
        return Err("invalid pulse");
    };

    match crate::submit_switch_request(request) {
        Ok(()) => {
            info!("web: pulse requested ({duration_ms}ms)");
            write_response(socket, b"200 OK", b"pulse started").await;
            Ok(())
        }
        Err(_) => {
            write_response(socket, b"409 Conflict", b"switch busy").await;
            Ok(())
        }
    }
}

async fn persist(ctx: WebContext, settings: &DeviceSettings) -> bool {
    let mut store = ctx.store.lock().await;
    match store.as_mut() {
        Some(store) => match store.save(settings) {
            Ok(()) => true,
            Err(err) => {
                warn!("web: settings save failed: {err:?}");
                false
            }
        }
        None => {
            warn!("web: settings storage unavailable");
            false
        }
    }
}

fn printable(value: &str) -> bool {
    value.chars().all(|c| !c.is_control())
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_request_line(header: &str) -> Option<(&str, &str)> {
    let first_line = header.lines().next()?;
    let mut parts = first_line.split_ascii_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    let _version = parts.next()?;
    Some((method, target))
}

fn parse_content_length(header: &str) -> Option<usize> {
    for line in header.lines().skip(1) {
        let (name, value) = line.split_once(':')?;
        if name.eq_ignore_ascii_case("content-length") {
            return value.trim().parse::<usize>().ok();
        }
    }
    None
}

fn target_path(target: &str) -> &str {
    target.split('?').next().unwrap_or(target)
}

/// Extract and percent-decode one urlencoded form field.
fn form_field<const N: usize>(body: &str, key: &str) -> Option<String<N>> {
    for pair in body.split('&') {
        let Some((k, v)) = pair.split_once('=') else {
            continue;
        };
        if k == key {
            return percent_decode(v);
        }
    }
    None
}

fn percent_decode<const N: usize>(encoded: &str) -> Option<String<N>> {
    let mut raw = heapless::Vec::<u8, N>::new();
    let bytes = encoded.as_bytes();
    let mut i = 0usize;

    while i < bytes.len() {
        let decoded = match bytes[i] {
            b'%' => {
                if i + 2 >= bytes.len() {
                    return None;
                }
                let hi = decode_hex(bytes[i + 1])?;
                let lo = decode_hex(bytes[i + 2])?;
                i += 3;
                (hi << 4) | lo
            }
            b'+' => {
                i += 1;
                b' '
            }
            b => {
                i += 1;
                b
            }
        };
        raw.push(decoded).ok()?;
    }

    let text = core::str::from_utf8(&raw).ok()?;
    let mut out = String::new();
    out.push_str(text).ok()?;
    Some(out)
}

fn decode_hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(10 + (b - b'a')),
        b'A'..=b'F' => Some(10 + (b - b'A')),
        _ => None,
    }
}

async fn write_response(socket: &mut TcpSocket<'_>, status: &[u8], body: &[u8]) {
    let mut content_length = [0u8; 20];
    let mut idx = content_length.len();
    let mut remaining = body.len();
    loop {
        idx -= 1;
        content_length[idx] = b'0' + (remaining % 10) as u8;
        remaining /= 10;
        if remaining == 0 {
            break;
        }
    }

    let _ = socket.write_all(b"HTTP/1.0 ").await;
    let _ = socket.write_all(status).await;
    let _ = socket
        .write_all(b"\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: ")
        .await;
    let _ = socket.write_all(&content_length[idx..]).await;
    let _ = socket.write_all(b"\r\n\r\n").await;
    let _ = socket.write_all(body).await;
}
