//! Minimal DHCP responder for fallback-AP clients.
//!
//! Just enough of the protocol to get a phone onto the setup network:
//! DISCOVER is answered with an OFFER and REQUEST with an ACK out of a
//! tiny fixed pool. Renewals rebind to the same slot by hardware address.

use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpAddress, IpEndpoint, Ipv4Address, Stack};
use log::{debug, info, warn};

use super::AP_ADDR;

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;
const BOOTP_MIN_BYTES: usize = 240;
const REPLY_BYTES: usize = 300;
const LEASE_SECS: u32 = 3_600;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_END: u8 = 255;

const DISCOVER: u8 = 1;
const OFFER: u8 = 2;
const REQUEST: u8 = 3;
const ACK: u8 = 5;

/// First handed-out address; slots count up from here.
const POOL_BASE: [u8; 4] = [192, 168, 4, 100];
const POOL_SLOTS: usize = 4;

pub(crate) async fn serve(ap_stack: Stack<'static>) -> ! {
    let mut rx_meta = [PacketMetadata::EMPTY; 4];
    let mut tx_meta = [PacketMetadata::EMPTY; 4];
    let mut rx_buffer = [0u8; 1024];
    let mut tx_buffer = [0u8; 1024];

    let mut socket = UdpSocket::new(
        ap_stack,
        &mut rx_meta,
        &mut rx_buffer,
        &mut tx_meta,
        &mut tx_buffer,
    );
    if let Err(err) = socket.bind(DHCP_SERVER_PORT) {
        warn!("dhcp: bind failed ({err:?}); AP clients need static addresses");
        loop {
            embassy_time::Timer::after_secs(3600).await;
        }
    }

    // Lease table: slot index is the address offset, keyed by client MAC.
    let mut leases: [Option<[u8; 6]>; POOL_SLOTS] = [None; POOL_SLOTS];
    let mut request = [0u8; 576];

    loop {
        let Ok((len, _meta)) = socket.recv_from(&mut request).await else {
            continue;
        };

        let Some((message_type, xid, chaddr, flags)) = parse_request(&request[..len]) else {
            continue;
        };

        let reply_type = match message_type {
            DISCOVER => OFFER,
            REQUEST => ACK,
            _ => continue,
        };

        let Some(slot) = allocate_slot(&mut leases, chaddr) else {
            debug!("dhcp: pool exhausted; ignoring request");
            continue;
        };
        let client_addr = Ipv4Address::new(
            POOL_BASE[0],
            POOL_BASE[1],
            POOL_BASE[2],
            POOL_BASE[3] + slot as u8,
        );

        let mut reply = [0u8; REPLY_BYTES];
        let reply_len = build_reply(&mut reply, reply_type, xid, chaddr, flags, client_addr);

        let destination = IpEndpoint::new(
            IpAddress::Ipv4(Ipv4Address::BROADCAST),
            DHCP_CLIENT_PORT,
        );
        if let Err(err) = socket.send_to(&reply[..reply_len], destination).await {
            debug!("dhcp: reply send failed: {err:?}");
            continue;
        }

        if reply_type == ACK {
            info!(
                "dhcp: leased {} to {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                client_addr, chaddr[0], chaddr[1], chaddr[2], chaddr[3], chaddr[4], chaddr[5]
            );
        }
    }
}

/// Pull the message type, transaction id, client hardware address, and
/// flags out of a BOOTP request.
fn parse_request(packet: &[u8]) -> Option<(u8, [u8; 4], [u8; 6], [u8; 2])> {
    if packet.len() < BOOTP_MIN_BYTES {
        return None;
    }
    // BOOTREQUEST over ethernet only.
    if packet[0] != 1 || packet[1] != 1 || packet[2] != 6 {
        return None;
    }
    if packet[236..240] != MAGIC_COOKIE {
        return None;
    }

    let xid = [packet[4], packet[5], packet[6], packet[7]];
    let flags = [packet[10], packet[11]];
    let mut chaddr = [0u8; 6];
    chaddr.copy_from_slice(&packet[28..34]);

    let mut message_type = None;
    let mut i = BOOTP_MIN_BYTES;
    while i < packet.len() {
        match packet[i] {
            0 => i += 1,
            OPT_END => break,
            code => {
                let len = *packet.get(i + 1)? as usize;
                if code == OPT_MESSAGE_TYPE && len == 1 {
                    message_type = packet.get(i + 2).copied();
                }
                i += 2 + len;
            }
        }
    }

    Some((message_type?, xid, chaddr, flags))
}

/// Reuse the slot already bound to this client, or claim a free one.
fn allocate_slot(leases: &mut [Option<[u8; 6]>; POOL_SLOTS], chaddr: [u8; 6]) -> Option<usize> {
    if let Some(slot) = leases.iter().position(|lease| *lease == Some(chaddr)) {
        return Some(slot);
    }
    let free = leases.iter().position(|lease| lease.is_none())?;
    leases[free] = Some(chaddr);
    Some(free)
}

fn build_reply(
    reply: &mut [u8; REPLY_BYTES],
    reply_type: u8,
    xid: [u8; 4],
    chaddr: [u8; 6],
    flags: [u8; 2],
    client_addr: Ipv4Address,
) -> usize {
    reply[0] = 2; // BOOTREPLY
    reply[1] = 1;
    reply[2] = 6;
    reply[4..8].copy_from_slice(&xid);
    reply[10..12].copy_from_slice(&flags);
    reply[16..20].copy_from_slice(&client_addr.octets());
    reply[20..24].copy_from_slice(&AP_ADDR.octets());
    reply[28..34].copy_from_slice(&chaddr);
    reply[236..240].copy_from_slice(&MAGIC_COOKIE);

    let mut i = 240;
    for (code, value) in [
        (OPT_MESSAGE_TYPE, &[reply_type][..]),
        (OPT_SERVER_ID, &AP_ADDR.octets()[..]),
        (OPT_LEASE_TIME, &LEASE_SECS.to_be_bytes()[..]),
        (OPT_SUBNET_MASK, &[255, 255, 255, 0][..]),
        (OPT_ROUTER, &AP_ADDR.octets()[..]),
        (OPT_DNS, &AP_ADDR.octets()[..]),
    ] {
        reply[i] = code;
        reply[i + 1] = value.len() as u8;
        reply[i + 2..i + 2 + value.len()].copy_from_slice(value);
        i += 2 + value.len();
    }
    reply[i] = OPT_END;

    REPLY_BYTES
}
