#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Instant, Timer};
use esp_hal::{
    clock::CpuClock,
    gpio::{Level, Output, OutputConfig},
    timer::timg::TimerGroup,
};
use log::{LevelFilter, info, warn};
use static_cell::StaticCell;
use wakeon_core::{
    dispatch::SwitchRequest,
    pulse::{PulseBusy, PulseSequencer},
    settings::{DeviceSettings, SettingsStore},
};
use wakeon_hal_esp32s3::{power::SwitchLine, storage::flash_config::FlashConfigStore};

use net::NetStatus;
use sntp::WallClock;

#[path = "main/dhcp.rs"]
mod dhcp;
#[path = "main/mqtt.rs"]
mod mqtt;
#[path = "main/net.rs"]
mod net;
#[path = "main/sntp.rs"]
mod sntp;
#[path = "main/web.rs"]
mod web;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// Power-switch header wiring: one output drives the optocoupler.
const SWITCH_ACTIVE_LOW: bool = false;
const SWITCH_POLL_INTERVAL_MS: u64 = 10;

/// Delay between a settings rewrite and the restart it schedules, so the
/// HTTP response has time to flush.
const RESTART_DELAY_MS: u64 = 5_000;

const AP_ADDR: embassy_net::Ipv4Address = embassy_net::Ipv4Address::new(192, 168, 4, 1);

pub(crate) type SharedSettings = Mutex<CriticalSectionRawMutex, DeviceSettings>;
pub(crate) type SharedStore = Mutex<CriticalSectionRawMutex, Option<FlashConfigStore>>;

static NET_STATUS: NetStatus = NetStatus::new();
static WALL_CLOCK: WallClock = WallClock::new();
static RESTART: Signal<CriticalSectionRawMutex, &'static str> = Signal::new();

/// The sequencer is shared between the switch loop and the request paths
/// (web, broker); the lock is only ever held for a single state
/// transition.
static SWITCH: BlockingMutex<CriticalSectionRawMutex, RefCell<PulseSequencer>> =
    BlockingMutex::new(RefCell::new(PulseSequencer::new()));
static FORCE_RELEASE: AtomicBool = AtomicBool::new(false);

static SETTINGS: StaticCell<SharedSettings> = StaticCell::new();
static STORE: StaticCell<SharedStore> = StaticCell::new();
static STA_RESOURCES: StaticCell<embassy_net::StackResources<6>> = StaticCell::new();
static AP_RESOURCES: StaticCell<embassy_net::StackResources<6>> = StaticCell::new();

pub(crate) fn now_ms() -> u64 {
    Instant::now().as_millis()
}

/// Entry point for every trigger source. Pulse requests go straight to
/// the sequencer and answer busy; ensure-low is latched for the switch
/// loop, which applies it only when no pulse is holding.
pub(crate) fn submit_switch_request(request: SwitchRequest) -> Result<(), PulseBusy> {
    match request {
        SwitchRequest::Pulse { duration_ms } => {
            SWITCH.lock(|cell| cell.borrow_mut().request(duration_ms, now_ms()))
        }
        SwitchRequest::EnsureLow => {
            FORCE_RELEASE.store(true, Ordering::Release);
            Ok(())
        }
    }
}

pub(crate) fn schedule_restart(reason: &'static str) {
    RESTART.signal(reason);
}

#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    loop {}
}

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(_spawner: Spawner) -> ! {
    esp_println::logger::init_logger(LevelFilter::Info);
    esp_println::println!("boot: wakeon v{} starting", VERSION);

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    // esp-radio and the TLS handshake both need an allocator.
    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 131072);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    // Switch header wiring used by this board: OUT=GPIO2.
    let mut switch_line = SwitchLine::new(
        Output::new(peripherals.GPIO2, Level::Low, OutputConfig::default()),
        SWITCH_ACTIVE_LOW,
    );

    let mut store = match FlashConfigStore::new() {
        Ok(store) => Some(store),
        Err(err) => {
            warn!("settings storage unavailable ({err:?}); changes will be volatile");
            None
        }
    };

    let settings = match store.as_mut().map(|store| store.load()) {
        Some(Ok(Some(settings))) => {
            info!("settings restored from flash");
            settings
        }
        Some(Ok(None)) => {
            info!("no saved settings in flash");
            DeviceSettings::default()
        }
        Some(Err(err)) => {
            warn!("failed to read saved settings ({err:?}); using defaults");
            DeviceSettings::default()
        }
        None => DeviceSettings::default(),
    };

    let credentials = settings.wifi.clone();
    let broker = settings.broker.clone();

    let radio = match esp_radio::init() {
        Ok(radio) => radio,
        Err(err) => {
            warn!("esp-radio init failed: {err:?}");
            loop {
                Timer::after_secs(1).await;
            }
        }
    };

    let (controller, interfaces) =
        match esp_radio::wifi::new(&radio, peripherals.WIFI, esp_radio::wifi::Config::default()) {
            Ok(parts) => parts,
            Err(err) => {
                warn!("wifi peripheral init failed: {err:?}");
                loop {
                    Timer::after_secs(1).await;
                }
            }
        };

    let sta_config = embassy_net::Config::dhcpv4(Default::default());
    let (sta_stack, mut sta_runner) = embassy_net::new(
        interfaces.sta,
        sta_config,
        STA_RESOURCES.init(embassy_net::StackResources::<6>::new()),
        0x6077_11C2_84F0_3D55,
    );

    let ap_config = embassy_net::Config::ipv4_static(embassy_net::StaticConfigV4 {
        address: embassy_net::Ipv4Cidr::new(AP_ADDR, 24),
        gateway: Some(AP_ADDR),
        dns_servers: heapless::Vec::from_slice(&[AP_ADDR]).unwrap(),
    });
    let (ap_stack, mut ap_runner) = embassy_net::new(
        interfaces.ap,
        ap_config,
        AP_RESOURCES.init(embassy_net::StackResources::<6>::new()),
        0x1BD8_40AA_90C3_7F12,
    );

    let shared_settings: &'static SharedSettings = SETTINGS.init(Mutex::new(settings));
    let shared_store: &'static SharedStore = STORE.init(Mutex::new(store));

    info!("wakeon v{} ready; switch on GPIO2, web on port 80", VERSION);

    let sta_net_future = sta_runner.run();
    let ap_net_future = ap_runner.run();
    let supervisor_future = net::wifi_supervisor(controller, sta_stack, credentials, &NET_STATUS);
    let web_sta_future = web::serve(web::WebContext {
        stack: sta_stack,
        status: &NET_STATUS,
        settings: shared_settings,
        store: shared_store,
    });
    let web_ap_future = web::serve(web::WebContext {
        stack: ap_stack,
        status: &NET_STATUS,
        settings: shared_settings,
        store: shared_store,
    });
    let dhcp_future = dhcp::serve(ap_stack);
    let sntp_future = sntp::sync_loop(sta_stack, &WALL_CLOCK);
    let mqtt_future = mqtt::session_loop(
        sta_stack,
        broker,
        peripherals.SHA,
        peripherals.RSA,
        &WALL_CLOCK,
        &NET_STATUS,
    );

    let switch_future = async {
        loop {
            let now_ms = now_ms();
            let drive = SWITCH.lock(|cell| cell.borrow_mut().poll(now_ms));
            if let Some(drive) = drive {
                switch_line.apply(drive);
            }
            if FORCE_RELEASE.swap(false, Ordering::AcqRel)
                && SWITCH.lock(|cell| cell.borrow().is_idle())
            {
                switch_line.release();
            }
            NET_STATUS.update_switch(
                switch_line.is_asserted(),
                SWITCH.lock(|cell| !cell.borrow().is_idle()),
            );
            Timer::after_millis(SWITCH_POLL_INTERVAL_MS).await;
        }
    };

    let restart_future = async {
        let reason = RESTART.wait().await;
        info!("restart scheduled in {}ms: {}", RESTART_DELAY_MS, reason);
        Timer::after_millis(RESTART_DELAY_MS).await;
        esp_hal::system::software_reset()
    };

    let _ = embassy_futures::join::join5(
        embassy_futures::join::join(sta_net_future, ap_net_future),
        embassy_futures::join::join(supervisor_future, switch_future),
        embassy_futures::join::join3(web_sta_future, web_ap_future, dhcp_future),
        embassy_futures::join::join(sntp_future, mqtt_future),
        restart_future,
    )
    .await;
    unreachable!()
}
