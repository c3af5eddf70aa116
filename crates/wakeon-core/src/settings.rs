//! Device settings: WiFi credentials, broker endpoint, persistence.
//!
//! Settings travel as one newline-delimited `key=value` text blob so the
//! web routes, the flash record, and the boot path all share a single
//! codec.

use core::fmt::Write as _;

use heapless::String;

pub const SSID_MAX: usize = 32;
pub const PASSPHRASE_MAX: usize = 64;
pub const HOST_MAX: usize = 64;
pub const SECRET_MAX: usize = 64;
pub const CLIENT_ID_MAX: usize = 32;
pub const TOPIC_MAX: usize = 64;

/// Upper bound for the encoded settings text.
pub const SETTINGS_TEXT_MAX: usize = 512;

/// Default TLS port of the broker.
pub const DEFAULT_BROKER_PORT: u16 = 8883;

/// Stored WiFi station credentials.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StationCredentials {
    pub ssid: String<SSID_MAX>,
    pub passphrase: String<PASSPHRASE_MAX>,
}

impl StationCredentials {
    /// Whether the connectivity manager can attempt a station connection
    /// with these credentials. An empty passphrase counts as unusable and
    /// sends the device to the fallback access point.
    pub fn is_usable(&self) -> bool {
        !self.ssid.is_empty() && !self.passphrase.is_empty()
    }
}

/// Broker endpoint for the secure session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BrokerConfig {
    pub host: String<HOST_MAX>,
    pub port: u16,
    pub username: String<SECRET_MAX>,
    pub password: String<SECRET_MAX>,
    pub client_id: String<CLIENT_ID_MAX>,
    pub command_topic: String<TOPIC_MAX>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_BROKER_PORT,
            username: String::new(),
            password: String::new(),
            client_id: String::new(),
            command_topic: String::new(),
        }
    }
}

impl BrokerConfig {
    /// An empty host means the secure session stays disabled.
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty()
    }
}

/// Everything the device persists across restarts.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceSettings {
    pub wifi: StationCredentials,
    pub broker: BrokerConfig,
}

/// Encoded settings text did not fit [`SETTINGS_TEXT_MAX`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EncodeOverflow;

impl DeviceSettings {
    /// Parse newline-delimited `key=value` settings text.
    ///
    /// Unknown keys are skipped so records written by newer firmware still
    /// load; oversized values are dropped rather than truncated.
    pub fn decode(text: &str) -> Self {
        let mut settings = Self::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "ssid" => set_field(&mut settings.wifi.ssid, value),
                "pass" => set_field(&mut settings.wifi.passphrase, value),
                "mqtt_host" => set_field(&mut settings.broker.host, value),
                "mqtt_port" => {
                    if let Ok(port) = value.parse::<u16>() {
                        settings.broker.port = port;
                    }
                }
                "mqtt_user" => set_field(&mut settings.broker.username, value),
                "mqtt_pass" => set_field(&mut settings.broker.password, value),
                "mqtt_client" => set_field(&mut settings.broker.client_id, value),
                "mqtt_topic" => set_field(&mut settings.broker.command_topic, value),
                _ => {}
            }
        }
        settings
    }

    pub fn encode(&self) -> Result<String<SETTINGS_TEXT_MAX>, EncodeOverflow> {
        let mut out = String::new();
        write!(
            out,
            "ssid={}\npass={}\nmqtt_host={}\nmqtt_port={}\nmqtt_user={}\nmqtt_pass={}\nmqtt_client={}\nmqtt_topic={}\n",
            self.wifi.ssid,
            self.wifi.passphrase,
            self.broker.host,
            self.broker.port,
            self.broker.username,
            self.broker.password,
            self.broker.client_id,
            self.broker.command_topic,
        )
        .map_err(|_| EncodeOverflow)?;
        Ok(out)
    }
}

fn set_field<const N: usize>(slot: &mut String<N>, value: &str) {
    if value.len() <= N {
        slot.clear();
        let _ = slot.push_str(value);
    }
}

/// Abstract persistence backend for [`DeviceSettings`].
pub trait SettingsStore {
    type Error;

    fn load(&mut self) -> Result<Option<DeviceSettings>, Self::Error>;
    fn save(&mut self, settings: &DeviceSettings) -> Result<(), Self::Error>;
}

pub const RECORD_MAGIC: u32 = 0x314E_4B57; // "WKN1"
pub const RECORD_VERSION: u8 = 1;
pub const RECORD_HEADER_LEN: usize = 8;
pub const RECORD_TRAILER_LEN: usize = 4;

/// Worst-case framed record size; storage backends size their buffers
/// with this.
pub const RECORD_MAX_LEN: usize = RECORD_HEADER_LEN + SETTINGS_TEXT_MAX + RECORD_TRAILER_LEN;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordError {
    /// Payload does not fit the record buffer.
    Oversized,
    /// Record claims our magic but fails checksum, length, or UTF-8
    /// validation.
    Corrupted,
}

/// Frame settings text for raw storage: magic, version, payload length,
/// payload, then an FNV-1a checksum over everything before the trailer.
/// Returns the number of bytes written.
pub fn encode_record(text: &str, out: &mut [u8]) -> Result<usize, RecordError> {
    let total = RECORD_HEADER_LEN + text.len() + RECORD_TRAILER_LEN;
    if text.len() > SETTINGS_TEXT_MAX || out.len() < total {
        return Err(RecordError::Oversized);
    }

    out[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
    out[4] = RECORD_VERSION;
    out[5] = 0;
    out[6..8].copy_from_slice(&(text.len() as u16).to_le_bytes());
    out[RECORD_HEADER_LEN..RECORD_HEADER_LEN + text.len()].copy_from_slice(text.as_bytes());

    let checksum = checksum32(&out[..RECORD_HEADER_LEN + text.len()]);
    out[RECORD_HEADER_LEN + text.len()..total].copy_from_slice(&checksum.to_le_bytes());
    Ok(total)
}

/// Decode a framed settings record. `Ok(None)` means the storage is erased
/// or holds something that was never ours; a record carrying our magic
/// that fails validation is corruption.
pub fn decode_record(buf: &[u8]) -> Result<Option<&str>, RecordError> {
    if buf.len() < RECORD_HEADER_LEN + RECORD_TRAILER_LEN {
        return Ok(None);
    }
    if buf[..RECORD_HEADER_LEN].iter().all(|b| *b == 0xFF) {
        return Ok(None);
    }

    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != RECORD_MAGIC {
        return Ok(None);
    }
    if buf[4] != RECORD_VERSION {
        return Ok(None);
    }

    let len = u16::from_le_bytes([buf[6], buf[7]]) as usize;
    let payload_end = RECORD_HEADER_LEN + len;
    if len > SETTINGS_TEXT_MAX || payload_end + RECORD_TRAILER_LEN > buf.len() {
        return Err(RecordError::Corrupted);
    }

    let expected = u32::from_le_bytes([
        buf[payload_end],
        buf[payload_end + 1],
        buf[payload_end + 2],
        buf[payload_end + 3],
    ]);
    if checksum32(&buf[..payload_end]) != expected {
        return Err(RecordError::Corrupted);
    }

    core::str::from_utf8(&buf[RECORD_HEADER_LEN..payload_end])
        .map(Some)
        .map_err(|_| RecordError::Corrupted)
}

fn checksum32(bytes: &[u8]) -> u32 {
    let mut hash = 0x811C_9DC5u32;
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DeviceSettings {
        let mut settings = DeviceSettings::default();
        settings.wifi.ssid.push_str("home-net").unwrap();
        settings.wifi.passphrase.push_str("hunter22").unwrap();
        settings.broker.host.push_str("broker.example.com").unwrap();
        settings.broker.port = 8883;
        settings.broker.username.push_str("wakeon").unwrap();
        settings.broker.password.push_str("s3cret").unwrap();
        settings.broker.client_id.push_str("wakeon-01").unwrap();
        settings.broker.command_topic.push_str("wakeon/cmd").unwrap();
        settings
    }

    #[test]
    fn text_codec_round_trips() {
        let settings = sample();
        let text = settings.encode().unwrap();
        assert_eq!(DeviceSettings::decode(&text), settings);
    }

    #[test]
    fn decode_ignores_unknown_keys_and_garbage_lines() {
        let settings =
            DeviceSettings::decode("ssid=net\npass=pw\nfuture_key=1\nnot a pair\nmqtt_port=1883\n");
        assert_eq!(settings.wifi.ssid.as_str(), "net");
        assert_eq!(settings.broker.port, 1883);
        assert!(!settings.broker.is_configured());
    }

    #[test]
    fn decode_drops_oversized_values() {
        let mut text = heapless::String::<256>::new();
        text.push_str("ssid=").unwrap();
        for _ in 0..SSID_MAX + 1 {
            text.push('x').unwrap();
        }
        text.push('\n').unwrap();
        let settings = DeviceSettings::decode(&text);
        assert!(settings.wifi.ssid.is_empty());
    }

    #[test]
    fn empty_text_decodes_to_defaults() {
        let settings = DeviceSettings::decode("");
        assert!(!settings.wifi.is_usable());
        assert!(!settings.broker.is_configured());
        assert_eq!(settings.broker.port, DEFAULT_BROKER_PORT);
    }

    #[test]
    fn missing_passphrase_is_unusable() {
        let settings = DeviceSettings::decode("ssid=net\n");
        assert!(!settings.wifi.is_usable());
    }

    #[test]
    fn record_round_trips() {
        let text = sample().encode().unwrap();
        let mut buf = [0xFFu8; RECORD_MAX_LEN];
        let written = encode_record(&text, &mut buf).unwrap();
        assert!(written <= RECORD_MAX_LEN);
        assert_eq!(decode_record(&buf).unwrap(), Some(text.as_str()));
    }

    #[test]
    fn erased_storage_decodes_to_none() {
        let buf = [0xFFu8; RECORD_MAX_LEN];
        assert_eq!(decode_record(&buf).unwrap(), None);
    }

    #[test]
    fn foreign_magic_decodes_to_none() {
        let mut buf = [0u8; RECORD_MAX_LEN];
        buf[0..4].copy_from_slice(b"ELF\x7f");
        assert_eq!(decode_record(&buf).unwrap(), None);
    }

    #[test]
    fn payload_bit_flip_is_corruption() {
        let text = sample().encode().unwrap();
        let mut buf = [0xFFu8; RECORD_MAX_LEN];
        encode_record(&text, &mut buf).unwrap();
        buf[RECORD_HEADER_LEN] ^= 0x01;
        assert_eq!(decode_record(&buf), Err(RecordError::Corrupted));
    }

    #[test]
    fn record_rejects_oversized_payload() {
        let mut buf = [0u8; 16];
        assert_eq!(encode_record("0123456789", &mut buf), Err(RecordError::Oversized));
    }
}
