//! Wifi supervision: executes the connectivity manager's directives
//! against esp-radio and publishes a lock-free status snapshot for the
//! web routes.
//!
//! The manager decides; this task observes link state between directives
//! and reports connects/disconnects back as events. Radio callbacks are
//! never used directly — everything funnels through the 500 ms
//! observation tick.

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use embassy_net::{Stack, dns::DnsQueryType};
use embassy_time::{Duration, Timer, WithTimeout};
use esp_radio::wifi::{
    AccessPointConfig, AuthMethod, ClientConfig, ModeConfig, ScanConfig, WifiController,
};
use log::{info, warn};
use wakeon_core::connectivity::{
    ApPin, ConnectRequest, ConnectivityConfig, ConnectivityManager, FALLBACK_AP_SSID, WifiCommand,
    WifiMode,
};
use wakeon_core::settings::StationCredentials;

const NETWORK_POLL_INTERVAL_MS: u64 = 500;
const DHCP_TIMEOUT_SECS: u64 = 15;
const CONNECT_PHASE_TIMEOUT_SECS: u64 = 20;
const WIFI_START_SETTLE_MS: u64 = 800;
const SCAN_MAX_APS: usize = 16;

/// RSSI placeholder when the last attempt was not pinned.
const RSSI_UNKNOWN: i8 = i8::MIN;

/// Lock-free connectivity/session status shared with the web routes.
#[derive(Debug)]
pub(crate) struct NetStatus {
    mode: AtomicU8,
    has_ip: AtomicBool,
    rssi: AtomicU8,
    mqtt_connected: AtomicBool,
    switch_asserted: AtomicBool,
    pulse_busy: AtomicBool,
    revision: AtomicU32,
}

/// Immutable copy for rendering.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct NetStatusSnapshot {
    pub mode: WifiMode,
    pub has_ip: bool,
    pub rssi_dbm: Option<i8>,
    pub mqtt_connected: bool,
    pub switch_asserted: bool,
    pub pulse_busy: bool,
}

impl NetStatus {
    pub const fn new() -> Self {
        Self {
            mode: AtomicU8::new(0),
            has_ip: AtomicBool::new(false),
            rssi: AtomicU8::new(RSSI_UNKNOWN as u8),
            mqtt_connected: AtomicBool::new(false),
            switch_asserted: AtomicBool::new(false),
            pulse_busy: AtomicBool::new(false),
            revision: AtomicU32::new(0),
        }
    }

    pub fn snapshot(&self) -> NetStatusSnapshot {
        let rssi = self.rssi.load(Ordering::Acquire) as i8;
        NetStatusSnapshot {
            mode: mode_from_raw(self.mode.load(Ordering::Acquire)),
            has_ip: self.has_ip.load(Ordering::Acquire),
            rssi_dbm: (rssi != RSSI_UNKNOWN).then_some(rssi),
            mqtt_connected: self.mqtt_connected.load(Ordering::Acquire),
            switch_asserted: self.switch_asserted.load(Ordering::Acquire),
            pulse_busy: self.pulse_busy.load(Ordering::Acquire),
        }
    }

    pub fn set_mode(&self, mode: WifiMode) {
        self.store_u8(&self.mode, mode_to_raw(mode));
    }

    pub fn set_link(&self, has_ip: bool) {
        self.store_bool(&self.has_ip, has_ip);
    }

    pub fn set_rssi(&self, rssi_dbm: Option<i8>) {
        self.store_u8(&self.rssi, rssi_dbm.unwrap_or(RSSI_UNKNOWN) as u8);
    }

    pub fn set_mqtt(&self, connected: bool) {
        self.store_bool(&self.mqtt_connected, connected);
    }

    pub fn update_switch(&self, asserted: bool, busy: bool) {
        let mut changed = false;
        changed |= self.switch_asserted.swap(asserted, Ordering::AcqRel) != asserted;
        changed |= self.pulse_busy.swap(busy, Ordering::AcqRel) != busy;
        if changed {
            self.revision.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn store_bool(&self, cell: &AtomicBool, next: bool) {
        if cell.swap(next, Ordering::AcqRel) != next {
            self.revision.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn store_u8(&self, cell: &AtomicU8, next: u8) {
        if cell.swap(next, Ordering::AcqRel) != next {
            self.revision.fetch_add(1, Ordering::AcqRel);
        }
    }
}

fn mode_to_raw(mode: WifiMode) -> u8 {
    match mode {
        WifiMode::Uninitialized => 0,
        WifiMode::ConnectingStation => 1,
        WifiMode::ConnectedStation => 2,
        WifiMode::AccessPoint => 3,
    }
}

fn mode_from_raw(raw: u8) -> WifiMode {
    match raw {
        1 => WifiMode::ConnectingStation,
        2 => WifiMode::ConnectedStation,
        3 => WifiMode::AccessPoint,
        _ => WifiMode::Uninitialized,
    }
}

/// Resolve a hostname on the station stack; dotted-quad hosts skip the
/// resolver round trip.
pub(crate) async fn resolve_host(
    stack: Stack<'static>,
    host: &str,
) -> Option<embassy_net::IpAddress> {
    if let Ok(addr) = host.parse::<embassy_net::Ipv4Address>() {
        return Some(embassy_net::IpAddress::Ipv4(addr));
    }

    match stack.dns_query(host, DnsQueryType::A).await {
        Ok(addrs) => addrs.first().copied(),
        Err(err) => {
            warn!("dns: lookup for '{host}' failed: {err:?}");
            None
        }
    }
}

pub(crate) async fn wifi_supervisor(
    mut controller: WifiController<'static>,
    sta_stack: Stack<'static>,
    credentials: StationCredentials,
    status: &'static NetStatus,
) -> ! {
    let target_ssid = credentials.ssid.clone();
    let mut manager = ConnectivityManager::new(ConnectivityConfig::default());
    let mut pinned_rssi: Option<i8> = None;

    let mut command = Some(manager.initialize(credentials, crate::now_ms()));
    loop {
        while let Some(next) = command.take() {
            command = execute(
                &mut controller,
                sta_stack,
                &mut manager,
                status,
                &target_ssid,
                &mut pinned_rssi,
                next,
            )
            .await;
        }

        observe_station(&mut controller, sta_stack, &mut manager, status).await;

        command = manager.poll(crate::now_ms());
        status.set_mode(manager.mode());
        Timer::after_millis(NETWORK_POLL_INTERVAL_MS).await;
    }
}

/// Watch an established station connection; a lost link, address, or
/// radio association becomes a disconnect observation for the manager.
async fn observe_station(
    controller: &mut WifiController<'static>,
    sta_stack: Stack<'static>,
    manager: &mut ConnectivityManager,
    status: &'static NetStatus,
) {
    if manager.mode() != WifiMode::ConnectedStation {
        return;
    }

    let link_up = sta_stack.is_link_up();
    let has_ip = sta_stack.config_v4().is_some();
    let radio_up = matches!(controller.is_connected(), Ok(true));
    status.set_link(link_up && has_ip);

    if !(link_up && has_ip && radio_up) {
        info!(
            "wifi: station state lost (link_up={link_up} has_ip={has_ip} connected={radio_up})"
        );
        status.set_link(false);
        status.set_rssi(None);
        let _ = controller.disconnect_async().await;
        manager.on_disconnected(crate::now_ms());
    }
}

async fn execute(
    controller: &mut WifiController<'static>,
    sta_stack: Stack<'static>,
    manager: &mut ConnectivityManager,
    status: &'static NetStatus,
    target_ssid: &str,
    pinned_rssi: &mut Option<i8>,
    command: WifiCommand,
) -> Option<WifiCommand> {
    match command {
        WifiCommand::Scan => {
            status.set_mode(WifiMode::ConnectingStation);
            let strongest = scan_for_target(controller, target_ssid).await;
            manager.scan_complete(strongest)
        }
        WifiCommand::Connect(request) => {
            connect_station(controller, sta_stack, manager, status, pinned_rssi, request).await;
            None
        }
        WifiCommand::StartAccessPoint => {
            start_access_point(controller, status).await;
            None
        }
    }
}

/// Scan for the target network and return its strongest access point.
/// Any failure degrades to `None`, which the manager turns into a
/// name-only connect.
async fn scan_for_target(
    controller: &mut WifiController<'static>,
    target_ssid: &str,
) -> Option<ApPin> {
    if !matches!(controller.is_started(), Ok(true)) {
        let bootstrap = ClientConfig::default().with_ssid(target_ssid.into());
        if let Err(err) = controller.set_config(&ModeConfig::Client(bootstrap)) {
            warn!("wifi: station config for scan failed: {err:?}");
            return None;
        }
        if let Err(err) = controller.start_async().await {
            warn!("wifi: start for scan failed: {err:?}");
            return None;
        }
        Timer::after_millis(WIFI_START_SETTLE_MS).await;
    }

    let scan_config = ScanConfig::default()
        .with_ssid(target_ssid)
        .with_show_hidden(false)
        .with_max(SCAN_MAX_APS);
    match controller.scan_with_config_async(scan_config).await {
        Ok(results) => {
            for ap in results.iter() {
                info!(
                    "wifi: scan hit ssid={} channel={} rssi={}dBm",
                    ap.ssid, ap.channel, ap.signal_strength
                );
            }
            results
                .iter()
                .filter(|ap| ap.ssid.as_str() == target_ssid)
                .max_by_key(|ap| ap.signal_strength)
                .map(|ap| ApPin {
                    bssid: ap.bssid,
                    channel: ap.channel,
                    rssi_dbm: ap.signal_strength,
                })
        }
        Err(err) => {
            warn!("wifi: scan failed: {err:?}");
            None
        }
    }
}

async fn connect_station(
    controller: &mut WifiController<'static>,
    sta_stack: Stack<'static>,
    manager: &mut ConnectivityManager,
    status: &'static NetStatus,
    pinned_rssi: &mut Option<i8>,
    request: ConnectRequest,
) {
    let mut client = ClientConfig::default()
        .with_ssid(request.credentials.ssid.as_str().into())
        .with_password(request.credentials.passphrase.as_str().into());
    if let Some(pin) = request.pin {
        client = client.with_bssid(pin.bssid).with_channel(pin.channel);
    }
    *pinned_rssi = request.pin.map(|pin| pin.rssi_dbm);

    if let Err(err) = controller.set_config(&ModeConfig::Client(client)) {
        warn!("wifi: station config failed: {err:?}");
        manager.on_disconnected(crate::now_ms());
        return;
    }

    if !matches!(controller.is_started(), Ok(true)) {
        if let Err(err) = controller.start_async().await {
            warn!("wifi: start failed: {err:?}");
            manager.on_disconnected(crate::now_ms());
            return;
        }
        Timer::after_millis(WIFI_START_SETTLE_MS).await;
    }

    match controller
        .connect_async()
        .with_timeout(Duration::from_secs(CONNECT_PHASE_TIMEOUT_SECS))
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            info!("wifi: connect failed: {err:?}");
            let _ = controller.disconnect_async().await;
            manager.on_disconnected(crate::now_ms());
            return;
        }
        Err(_) => {
            info!("wifi: connect stalled; aborting attempt");
            let _ = controller.disconnect_async().await;
            manager.on_disconnected(crate::now_ms());
            return;
        }
    }

    match sta_stack
        .wait_config_up()
        .with_timeout(Duration::from_secs(DHCP_TIMEOUT_SECS))
        .await
    {
        Ok(()) => {
            manager.on_connected(crate::now_ms());
            status.set_mode(WifiMode::ConnectedStation);
            status.set_link(true);
            status.set_rssi(*pinned_rssi);
            if let Some(config) = sta_stack.config_v4() {
                info!("wifi: dhcp ready, address {}", config.address);
            }
        }
        Err(_) => {
            info!("wifi: dhcp timeout; treating attempt as failed");
            let _ = controller.disconnect_async().await;
            manager.on_disconnected(crate::now_ms());
        }
    }
}

async fn start_access_point(controller: &mut WifiController<'static>, status: &'static NetStatus) {
    let _ = controller.disconnect_async().await;
    let _ = controller.stop_async().await;

    let ap_config = AccessPointConfig::default()
        .with_ssid(FALLBACK_AP_SSID.into())
        .with_auth_method(AuthMethod::None);
    if let Err(err) = controller.set_config(&ModeConfig::AccessPoint(ap_config)) {
        warn!("wifi: access point config failed: {err:?}");
        return;
    }
    if let Err(err) = controller.start_async().await {
        warn!("wifi: access point start failed: {err:?}");
        return;
    }

    status.set_mode(WifiMode::AccessPoint);
    status.set_link(false);
    status.set_rssi(None);
    info!(
        "wifi: access point '{}' up at {}; connect to reconfigure",
        FALLBACK_AP_SSID,
        crate::AP_ADDR
    );
}
