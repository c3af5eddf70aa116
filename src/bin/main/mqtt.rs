//! Secure session driver: TLS + MQTT client, sequenced by the core gate.
//!
//! The gate decides *when* a connect may happen (trusted clock, station
//! link, backoff); this module does the plumbing for one session and
//! reports the outcome. A session that drops for any reason simply ends
//! the inner loop and the gate schedules the next attempt.

use embassy_futures::select::{Either, select};
use embassy_net::{Stack, tcp::TcpSocket};
use embassy_time::{Duration, Timer};
use esp_hal::peripherals::{RSA, SHA};
use log::{info, warn};
use mbedtls_rs::{Certificates, Mode, Tls, TlsVersion, X509, asynch::Session};
use rust_mqtt::client::client::MqttClient;
use rust_mqtt::client::client_config::{ClientConfig, MqttVersion};
use rust_mqtt::packet::v5::publish_packet::QualityOfService;
use rust_mqtt::packet::v5::reason_codes::ReasonCode;
use rust_mqtt::utils::rng_generator::CountingRng;
use wakeon_core::dispatch::{self, Trigger};
use wakeon_core::session::{SessionAction, SessionConfig, SessionGate};
use wakeon_core::settings::BrokerConfig;

use super::net::{NetStatus, resolve_host};
use super::sntp::WallClock;

/// Root CA for the broker endpoint, baked in at build time (certificate
/// storage itself is the platform's concern, not this firmware's).
/// mbedtls wants the PEM NUL-terminated.
const BROKER_CA_PEM: &str = concat!(include_str!("../../../certs/broker_ca.pem"), "\0");

const SESSION_POLL_INTERVAL_MS: u64 = 500;
const SESSION_TCP_TIMEOUT_SECS: u64 = 20;
const KEEPALIVE_SECS: u16 = 60;
const PING_INTERVAL_SECS: u64 = 30;
const MQTT_BUF_BYTES: usize = 1024;
const TCP_BUF_BYTES: usize = 2048;

#[derive(Debug)]
enum SessionError {
    Dns,
    Tcp(embassy_net::tcp::ConnectError),
    Tls(mbedtls_rs::TlsError),
    Mqtt(ReasonCode),
}

pub(crate) async fn session_loop(
    stack: Stack<'static>,
    broker: BrokerConfig,
    sha: SHA<'static>,
    rsa: RSA<'static>,
    clock: &'static WallClock,
    status: &'static NetStatus,
) -> ! {
    if !broker.is_configured() {
        info!("mqtt: no broker configured; session disabled");
        park().await
    }

    let ca_chain = match X509::pem(BROKER_CA_PEM.as_bytes()) {
        Ok(ca) => ca,
        Err(err) => {
            warn!("mqtt: broker CA certificate unusable ({err:?}); session disabled");
            park().await
        }
    };

    let tls = match Tls::new(sha) {
        Ok(tls) => tls.with_hardware_rsa(rsa),
        Err(err) => {
            warn!("mqtt: tls stack init failed ({err:?}); session disabled");
            park().await
        }
    };

    let mut gate = SessionGate::new(SessionConfig::default());
    let mut rx_buffer = [0u8; TCP_BUF_BYTES];
    let mut tx_buffer = [0u8; TCP_BUF_BYTES];

    loop {
        let station_connected = stack.is_link_up() && stack.config_v4().is_some();
        let action = gate.poll(
            crate::now_ms(),
            station_connected,
            clock.epoch_secs(),
            false,
        );

        if action == SessionAction::Connect {
            info!("mqtt: attempting connection to {}:{}", broker.host, broker.port);
            match run_session(
                stack,
                &broker,
                &tls,
                &ca_chain,
                status,
                &mut rx_buffer,
                &mut tx_buffer,
            )
            .await
            {
                Ok(never) => match never {},
                Err(err) => warn!("mqtt: session ended: {err:?}"),
            }
            status.set_mqtt(false);
        }

        Timer::after_millis(SESSION_POLL_INTERVAL_MS).await;
    }
}

async fn run_session(
    stack: Stack<'static>,
    broker: &BrokerConfig,
    tls: &Tls<'_>,
    ca_chain: &X509<'_>,
    status: &'static NetStatus,
    rx_buffer: &mut [u8],
    tx_buffer: &mut [u8],
) -> Result<core::convert::Infallible, SessionError> {
    let addr = resolve_host(stack, &broker.host)
        .await
        .ok_or(SessionError::Dns)?;

    let mut socket = TcpSocket::new(stack, rx_buffer, tx_buffer);
    socket.set_timeout(Some(Duration::from_secs(SESSION_TCP_TIMEOUT_SECS)));
    socket
        .connect((addr, broker.port))
        .await
        .map_err(SessionError::Tcp)?;

    let certificates = Certificates {
        ca_chain: Some(*ca_chain),
        ..Default::default()
    };
    let mut session = Session::new(
        socket,
        Mode::Client {
            servername: broker.host.as_str(),
        },
        TlsVersion::Tls1_2,
        certificates,
        tls.reference(),
    )
    .map_err(SessionError::Tls)?;
    session.connect().await.map_err(SessionError::Tls)?;
    info!("mqtt: tls session established");

    let mut config = ClientConfig::new(MqttVersion::MQTTv5, CountingRng(20000));
    config.add_client_id(&broker.client_id);
    if !broker.username.is_empty() {
        config.add_username(&broker.username);
        config.add_password(&broker.password);
    }
    config.add_max_subscribe_qos(QualityOfService::QoS1);
    config.keep_alive = KEEPALIVE_SECS;
    config.max_packet_size = MQTT_BUF_BYTES as u32;

    let mut write_buffer = [0u8; MQTT_BUF_BYTES];
    let mut recv_buffer = [0u8; MQTT_BUF_BYTES];
    let mut client = MqttClient::<_, 5, CountingRng>::new(
        session,
        &mut write_buffer,
        MQTT_BUF_BYTES,
        &mut recv_buffer,
        MQTT_BUF_BYTES,
        config,
    );

    client.connect_to_broker().await.map_err(SessionError::Mqtt)?;
    client
        .subscribe_to_topic(&broker.command_topic)
        .await
        .map_err(SessionError::Mqtt)?;
    info!(
        "mqtt: connected as '{}', subscribed to '{}'",
        broker.client_id, broker.command_topic
    );
    status.set_mqtt(true);

    loop {
        match select(
            client.receive_message(),
            Timer::after_secs(PING_INTERVAL_SECS),
        )
        .await
        {
            Either::First(Ok((topic, payload))) => {
                info!("mqtt: message on '{}' ({} bytes)", topic, payload.len());
                if let Some(request) = dispatch::translate(Trigger::Broker(payload))
                    && crate::submit_switch_request(request).is_err()
                {
                    info!("mqtt: switch busy; command dropped");
                }
            }
            Either::First(Err(code)) => return Err(SessionError::Mqtt(code)),
            Either::Second(()) => {
                client.send_ping().await.map_err(SessionError::Mqtt)?;
            }
        }
    }
}

async fn park() -> ! {
    loop {
        Timer::after_secs(3600).await;
    }
}
