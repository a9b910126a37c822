#![no_std]
#![no_main]

// ログマクロは後続のモジュールから使うため最初に宣言する
mod fmt;

mod clock;
mod config;
mod hardware;
mod state;
mod tasks;

#[cfg(not(feature = "esp-backtrace"))]
use panic_halt as _;
#[cfg(feature = "defmt-rtt")]
use defmt_rtt as _;
#[cfg(feature = "esp-backtrace")]
use esp_backtrace as _;

use embassy_executor::Spawner;
use embassy_net::StackResources;
use embassy_time::{Duration, Timer};
use esp_hal::clock::CpuClock;
use esp_hal::gpio::Io;
use esp_hal::rng::Rng;
use esp_hal::timer::systimer::SystemTimer;
use esp_hal::timer::timg::TimerGroup;
use esp_storage::FlashStorage;
use esp_wifi::EspWifiController;
use ev_energy_meter::config::{load_or_initialize_config, MeterConfig};
use ev_energy_meter::mqtt::DeviceTopics;
use ev_energy_meter::store::FlashLogStore;

use config::{pins, CHIP, FLASH_LAYOUT};
use tasks::{charging_task, connection_task, mqtt_task, net_task, pulse_task, time_sync_task};

esp_bootloader_esp_idf::esp_app_desc!();

macro_rules! mk_static {
    ($t:ty,$val:expr) => {{
        static STATIC_CELL: static_cell::StaticCell<$t> = static_cell::StaticCell::new();
        #[deny(unused_attributes)]
        let x = STATIC_CELL.uninit().write(($val));
        x
    }};
}

#[esp_hal_embassy::main]
async fn main(spawner: Spawner) {
    // ハードウェア初期化
    let peripherals = esp_hal::init(esp_hal::Config::default().with_cpu_clock(CpuClock::max()));
    esp_alloc::heap_allocator!(size: 72 * 1024);

    let systimer = SystemTimer::new(peripherals.SYSTIMER);
    esp_hal_embassy::init(systimer.alarm0);

    info!("═══════════════════════════════════════════════════════════════════");
    info!("");
    info!("   ███████╗██╗   ██╗   ███╗   ███╗███████╗████████╗███████╗██████╗");
    info!("   ██╔════╝██║   ██║   ████╗ ████║██╔════╝╚══██╔══╝██╔════╝██╔══██╗");
    info!("   █████╗  ██║   ██║   ██╔████╔██║█████╗     ██║   █████╗  ██████╔╝");
    info!("   ██╔══╝  ╚██╗ ██╔╝   ██║╚██╔╝██║██╔══╝     ██║   ██╔══╝  ██╔══██╗");
    info!("   ███████╗ ╚████╔╝    ██║ ╚═╝ ██║███████╗   ██║   ███████╗██║  ██║");
    info!("   ╚══════╝  ╚═══╝     ╚═╝     ╚═╝╚══════╝   ╚═╝   ╚══════╝╚═╝  ╚═╝");
    info!("");
    info!("        EV Energy Meter • {}", CHIP);
    info!("");
    info!("═══════════════════════════════════════════════════════════════════");

    // 設定をフラッシュから読み込み（失敗時はデフォルト）
    info!("Loading configuration from flash...");
    let meter_config = match FlashLogStore::new(FlashStorage::new(), FLASH_LAYOUT) {
        Ok(mut store) => load_or_initialize_config(&mut store),
        Err(e) => {
            error!("Flash store unavailable ({}), using defaults", e);
            MeterConfig::new()
        }
    };
    info!(
        "Config loaded: {} pulses/kWh, save every {}s",
        meter_config.pulses_per_kwh, meter_config.save_interval_s
    );

    // Wi-Fi初期化
    let mut rng = Rng::new(peripherals.RNG);
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let wifi_ctrl = &*mk_static!(
        EspWifiController<'static>,
        esp_wifi::init(timg0.timer0, rng.clone()).unwrap()
    );
    let (controller, interfaces) = esp_wifi::wifi::new(wifi_ctrl, peripherals.WIFI).unwrap();
    let wifi_device = interfaces.sta;

    // MACアドレスからMQTTのデバイス名・トピックを決める
    let topics = &*mk_static!(DeviceTopics, DeviceTopics::from_mac(wifi_device.mac_address()));
    info!("Device name: {}", topics.device_name.as_str());

    let seed = (rng.random() as u64) << 32 | rng.random() as u64;
    let (stack, runner) = embassy_net::new(
        wifi_device,
        embassy_net::Config::dhcpv4(Default::default()),
        mk_static!(StackResources<6>, StackResources::<6>::new()),
        seed,
    );

    spawner.spawn(connection_task(controller)).unwrap();
    spawner.spawn(net_task(runner)).unwrap();
    spawner.spawn(time_sync_task(stack)).unwrap();
    spawner
        .spawn(mqtt_task(stack, topics, meter_config.pulses_per_kwh))
        .unwrap();

    // パルス入力（割り込みはパルス集計タスクが準備完了後に有効化する）
    let mut io = Io::new(peripherals.IO_MUX);
    if pins::PULSE_INPUT_ENABLED {
        hardware::init_pulse_input(&mut io, peripherals.GPIO4);
    } else {
        warn!("Pulse input disabled, pulse capture not started");
    }

    match FlashLogStore::new(FlashStorage::new(), FLASH_LAYOUT) {
        Ok(counter_store) => spawner
            .spawn(pulse_task(counter_store, meter_config, topics))
            .unwrap(),
        Err(e) => error!("Flash store unavailable ({}), pulse accounting not started", e),
    }

    // 充電検出（アナログ入力がなければ起動しない）
    if !pins::CHARGING_INPUT_ENABLED {
        warn!("Analog input disabled, charging detector not started");
    } else {
        match FlashLogStore::new(FlashStorage::new(), FLASH_LAYOUT) {
            Ok(charging_store) => {
                let analog = hardware::AnalogInput::new(peripherals.ADC1, peripherals.GPIO3);
                let tls_seed = (rng.random() as u64) << 32 | rng.random() as u64;
                spawner
                    .spawn(charging_task(
                        stack,
                        charging_store,
                        analog,
                        meter_config,
                        topics,
                        tls_seed,
                    ))
                    .unwrap();
            }
            Err(e) => error!("Flash store unavailable ({}), charging detector not started", e),
        }
    }

    info!("All tasks started");

    loop {
        Timer::after(Duration::from_secs(60)).await;
    }
}
