//! Wall-clock synchronization feeding the secure-session trust predicate.
//!
//! One SNTP exchange pins the epoch to the monotonic uptime clock; the
//! published reading is epoch-at-sync plus elapsed uptime, so readers
//! never see time move backwards between syncs.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use embassy_net::Stack;
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_time::{Duration, Instant, with_timeout};
use log::{debug, info};

use super::net::resolve_host;

const NTP_SERVER: &str = "pool.ntp.org";
const NTP_PORT: u16 = 123;
const NTP_LOCAL_PORT: u16 = 50123;
const NTP_PACKET_BYTES: usize = 48;
/// Seconds between the NTP era (1900) and the Unix epoch.
const NTP_UNIX_OFFSET_SECS: u32 = 2_208_988_800;
const REPLY_TIMEOUT_SECS: u64 = 2;
const RETRY_INTERVAL_SECS: u64 = 15;
const RESYNC_INTERVAL_SECS: u64 = 3_600;

/// Lock-free wall-clock cell. Epoch seconds fit a u32 until 2106, which
/// outlives this hardware.
pub(crate) struct WallClock {
    synced: AtomicBool,
    epoch_at_sync: AtomicU32,
    uptime_at_sync_secs: AtomicU32,
}

impl WallClock {
    pub const fn new() -> Self {
        Self {
            synced: AtomicBool::new(false),
            epoch_at_sync: AtomicU32::new(0),
            uptime_at_sync_secs: AtomicU32::new(0),
        }
    }

    /// Current epoch reading, `None` until the first successful sync.
    pub fn epoch_secs(&self) -> Option<u64> {
        if !self.synced.load(Ordering::Acquire) {
            return None;
        }
        let base = self.epoch_at_sync.load(Ordering::Acquire) as u64;
        let at = self.uptime_at_sync_secs.load(Ordering::Acquire) as u64;
        Some(base + Instant::now().as_secs().saturating_sub(at))
    }

    fn record(&self, epoch: u32) {
        self.epoch_at_sync.store(epoch, Ordering::Release);
        self.uptime_at_sync_secs
            .store(Instant::now().as_secs() as u32, Ordering::Release);
        self.synced.store(true, Ordering::Release);
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SntpError {
    Dns,
    Bind,
    Send,
    Timeout,
    Malformed,
}

pub(crate) async fn sync_loop(stack: Stack<'static>, clock: &'static WallClock) -> ! {
    let mut rx_meta = [PacketMetadata::EMPTY; 2];
    let mut tx_meta = [PacketMetadata::EMPTY; 2];
    let mut rx_buffer = [0u8; 128];
    let mut tx_buffer = [0u8; 128];

    loop {
        stack.wait_config_up().await;

        match query(
            stack,
            &mut rx_meta,
            &mut rx_buffer,
            &mut tx_meta,
            &mut tx_buffer,
        )
        .await
        {
            Ok(epoch) => {
                let first = clock.epoch_secs().is_none();
                clock.record(epoch);
                if first {
                    info!("sntp: clock set (epoch {epoch}s)");
                } else {
                    debug!("sntp: resynced (epoch {epoch}s)");
                }
                embassy_time::Timer::after_secs(RESYNC_INTERVAL_SECS).await;
            }
            Err(err) => {
                debug!("sntp: sync failed ({err:?}); retrying");
                embassy_time::Timer::after_secs(RETRY_INTERVAL_SECS).await;
            }
        }
    }
}

async fn query(
    stack: Stack<'static>,
    rx_meta: &mut [PacketMetadata],
    rx_buffer: &mut [u8],
    tx_meta: &mut [PacketMetadata],
    tx_buffer: &mut [u8],
) -> Result<u32, SntpError> {
    let server = resolve_host(stack, NTP_SERVER).await.ok_or(SntpError::Dns)?;

    let mut socket = UdpSocket::new(stack, rx_meta, rx_buffer, tx_meta, tx_buffer);
    socket.bind(NTP_LOCAL_PORT).map_err(|_| SntpError::Bind)?;

    // LI=0, VN=3, mode=3 (client); everything else zero.
    let mut request = [0u8; NTP_PACKET_BYTES];
    request[0] = 0x1B;
    socket
        .send_to(&request, (server, NTP_PORT))
        .await
        .map_err(|_| SntpError::Send)?;

    let mut reply = [0u8; NTP_PACKET_BYTES];
    let (len, _meta) = with_timeout(
        Duration::from_secs(REPLY_TIMEOUT_SECS),
        socket.recv_from(&mut reply),
    )
    .await
    .map_err(|_| SntpError::Timeout)?
    .map_err(|_| SntpError::Malformed)?;

    parse_reply(&reply[..len])
}

fn parse_reply(reply: &[u8]) -> Result<u32, SntpError> {
    if reply.len() < 44 {
        return Err(SntpError::Malformed);
    }
    // Server (4) or broadcast (5) mode, and a synchronized stratum.
    let mode = reply[0] & 0x07;
    if !(mode == 4 || mode == 5) || reply[1] == 0 {
        return Err(SntpError::Malformed);
    }

    let transmit_secs = u32::from_be_bytes([reply[40], reply[41], reply[42], reply[43]]);
    transmit_secs
        .checked_sub(NTP_UNIX_OFFSET_SECS)
        .ok_or(SntpError::Malformed)
}
