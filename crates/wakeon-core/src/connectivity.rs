//! WiFi connectivity policy: station attempts, bounded retry, AP fallback.
//!
//! The manager owns mode selection and retry timing only. Radio work is
//! described by [`WifiCommand`] directives that the platform supervisor
//! executes; radio outcomes come back as `on_connected`/`on_disconnected`
//! observations which mutate flags and timestamps, nothing more. Every
//! decision happens inside [`ConnectivityManager::poll`], so a late event
//! and a timeout landing in the same tick funnel into one attempt counter.

use log::{debug, info, warn};

use crate::settings::StationCredentials;

/// Fallback network name broadcast when the device cannot join a network.
pub const FALLBACK_AP_SSID: &str = "wakeon-setup";

/// Retry policy knobs. Defaults mirror the deployed device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectivityConfig {
    /// How long a single connect attempt may run before it counts as failed.
    pub connect_timeout_ms: u64,
    /// Delay between a disconnect and the retry it schedules.
    pub reconnect_delay_ms: u64,
    /// Attempt budget before falling back to the access point.
    pub max_attempts: u8,
    /// Scan hits weaker than this are not pinned; the vendor roam logic
    /// picks instead.
    pub min_pin_rssi_dbm: i8,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 120_000,
            reconnect_delay_ms: 10_000,
            max_attempts: 5,
            min_pin_rssi_dbm: -80,
        }
    }
}

/// Current WiFi role of the device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WifiMode {
    Uninitialized,
    ConnectingStation,
    ConnectedStation,
    AccessPoint,
}

/// Strongest access point found for the target network during a scan.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ApPin {
    pub bssid: [u8; 6],
    pub channel: u8,
    pub rssi_dbm: i8,
}

/// Station connect parameters handed to the radio.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectRequest {
    pub credentials: StationCredentials,
    /// Pinning skips the vendor scan-and-roam pass; `None` connects by
    /// network name alone.
    pub pin: Option<ApPin>,
}

/// Directive for the platform supervisor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WifiCommand {
    /// Scan for the target network, then report the strongest hit through
    /// [`ConnectivityManager::scan_complete`].
    Scan,
    /// Issue a station connect attempt.
    Connect(ConnectRequest),
    /// Tear down any station state and broadcast [`FALLBACK_AP_SSID`].
    StartAccessPoint,
}

/// Read-only state published to the web routes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectivitySnapshot {
    pub mode: WifiMode,
    pub attempt_count: u8,
    pub pending_reconnect: bool,
}

pub struct ConnectivityManager {
    config: ConnectivityConfig,
    credentials: StationCredentials,
    mode: WifiMode,
    attempt_count: u8,
    attempt_started_at: Option<u64>,
    last_disconnected_at: Option<u64>,
    pending_reconnect: bool,
    fallback_pending: bool,
    awaiting_scan: bool,
}

impl ConnectivityManager {
    pub fn new(config: ConnectivityConfig) -> Self {
        Self {
            config,
            credentials: StationCredentials::default(),
            mode: WifiMode::Uninitialized,
            attempt_count: 0,
            attempt_started_at: None,
            last_disconnected_at: None,
            pending_reconnect: false,
            fallback_pending: false,
            awaiting_scan: false,
        }
    }

    pub fn mode(&self) -> WifiMode {
        self.mode
    }

    pub fn snapshot(&self) -> ConnectivitySnapshot {
        ConnectivitySnapshot {
            mode: self.mode,
            attempt_count: self.attempt_count,
            pending_reconnect: self.pending_reconnect,
        }
    }

    /// Pick the startup mode from the stored credentials and return the
    /// first directive. Called once at boot; a credential rewrite restarts
    /// the device instead of re-initializing a live manager.
    pub fn initialize(&mut self, credentials: StationCredentials, now_ms: u64) -> WifiCommand {
        if !credentials.is_usable() {
            info!("wifi: no stored credentials; starting fallback access point");
            return self.enter_access_point();
        }

        info!("wifi: credentials found; connecting to '{}'", credentials.ssid);
        self.credentials = credentials;
        self.begin_attempt(now_ms)
    }

    /// Report the scan outcome for an attempt started with
    /// [`WifiCommand::Scan`]. A missed scan degrades to a name-only
    /// connect; it does not consume the attempt.
    pub fn scan_complete(&mut self, strongest: Option<ApPin>) -> Option<WifiCommand> {
        if !self.awaiting_scan {
            return None;
        }
        self.awaiting_scan = false;

        let pin = match strongest {
            Some(hit) if hit.rssi_dbm >= self.config.min_pin_rssi_dbm => {
                info!(
                    "wifi: pinning strongest match channel={} rssi={}dBm",
                    hit.channel, hit.rssi_dbm
                );
                Some(hit)
            }
            Some(hit) => {
                info!(
                    "wifi: strongest match below pin floor (rssi={}dBm); connecting by name",
                    hit.rssi_dbm
                );
                None
            }
            None => {
                warn!("wifi: target network not found in scan; connecting by name");
                None
            }
        };

        Some(WifiCommand::Connect(ConnectRequest {
            credentials: self.credentials.clone(),
            pin,
        }))
    }

    /// Observation: the station has an address and is usable.
    pub fn on_connected(&mut self, _now_ms: u64) {
        if self.mode == WifiMode::AccessPoint {
            // A stale radio event after the fallback decision; the AP stays.
            return;
        }

        self.mode = WifiMode::ConnectedStation;
        self.attempt_count = 0;
        self.attempt_started_at = None;
        self.last_disconnected_at = None;
        self.pending_reconnect = false;
        self.awaiting_scan = false;
        info!("wifi: station connected");
    }

    /// Observation: the station lost its connection or an attempt failed.
    /// Never retries inline; the retry is scheduled for a later poll.
    pub fn on_disconnected(&mut self, now_ms: u64) {
        if matches!(self.mode, WifiMode::AccessPoint | WifiMode::Uninitialized) {
            return;
        }

        // The attempt concluded, one way or the other. Clearing the timer
        // here is what keeps a timeout in the same tick from counting the
        // failure twice.
        self.attempt_started_at = None;
        self.awaiting_scan = false;
        self.mode = WifiMode::ConnectingStation;

        if self.attempt_count < self.config.max_attempts {
            self.pending_reconnect = true;
            self.last_disconnected_at = Some(now_ms);
            debug!(
                "wifi: disconnected; retry {}/{} scheduled in {}ms",
                self.attempt_count + 1,
                self.config.max_attempts,
                self.config.reconnect_delay_ms
            );
        } else {
            warn!("wifi: attempt budget exhausted after disconnect; access point next");
            self.pending_reconnect = false;
            self.fallback_pending = true;
        }
    }

    /// Advance timers. Never sleeps or spins; all waiting happens by
    /// comparing timestamps against `now_ms`.
    pub fn poll(&mut self, now_ms: u64) -> Option<WifiCommand> {
        if self.fallback_pending {
            self.fallback_pending = false;
            return Some(self.enter_access_point());
        }

        if self.mode == WifiMode::ConnectingStation
            && let Some(started) = self.attempt_started_at
            && now_ms.saturating_sub(started) >= self.config.connect_timeout_ms
        {
            self.attempt_started_at = None;
            self.awaiting_scan = false;
            if self.attempt_count < self.config.max_attempts {
                info!(
                    "wifi: connect attempt timed out; retrying ({}/{})",
                    self.attempt_count + 1,
                    self.config.max_attempts
                );
                return Some(self.begin_attempt(now_ms));
            }
            warn!("wifi: attempt budget exhausted after timeout; access point next");
            return Some(self.enter_access_point());
        }

        if self.pending_reconnect
            && let Some(lost) = self.last_disconnected_at
            && now_ms.saturating_sub(lost) >= self.config.reconnect_delay_ms
        {
            self.pending_reconnect = false;
            if self.mode != WifiMode::ConnectedStation {
                return Some(self.begin_attempt(now_ms));
            }
            debug!("wifi: already connected; dropping scheduled reconnect");
        }

        None
    }

    fn begin_attempt(&mut self, now_ms: u64) -> WifiCommand {
        self.mode = WifiMode::ConnectingStation;
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.attempt_started_at = Some(now_ms);
        self.awaiting_scan = true;
        debug!(
            "wifi: attempt {}/{} started",
            self.attempt_count, self.config.max_attempts
        );
        WifiCommand::Scan
    }

    fn enter_access_point(&mut self) -> WifiCommand {
        self.mode = WifiMode::AccessPoint;
        self.attempt_count = 0;
        self.attempt_started_at = None;
        self.last_disconnected_at = None;
        self.pending_reconnect = false;
        self.fallback_pending = false;
        self.awaiting_scan = false;
        WifiCommand::StartAccessPoint
    }
}

#[cfg(test)]
mod tests;
