//! ネットワークタスク
//!
//! - `connection_task`: Wi-Fiステーション接続の維持（切断時は5秒後に再接続）
//! - `net_task`: embassy-net スタックの駆動
//! - `time_sync_task`: SNTPで壁時計を同期

use core::net::{IpAddr, SocketAddr};

use embassy_net::dns::DnsQueryType;
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{Runner, Stack};
use embassy_time::{Duration, Timer};
use esp_wifi::wifi::{
    ClientConfiguration, Configuration, WifiController, WifiDevice, WifiEvent, WifiState,
};
use sntpc::{NtpContext, NtpTimestampGenerator};

use crate::clock;
use crate::config::{time, wifi};

/// Wi-Fi接続タスク - 切断を待って再接続を繰り返す
#[embassy_executor::task]
pub async fn connection_task(mut controller: WifiController<'static>) {
    info!("Wi-Fi connection task started");

    loop {
        if matches!(esp_wifi::wifi::sta_state(), WifiState::StaConnected) {
            controller.wait_for_event(WifiEvent::StaDisconnected).await;
            warn!("Wi-Fi disconnected");
            Timer::after(Duration::from_millis(wifi::RETRY_MS)).await;
        }

        if !matches!(controller.is_started(), Ok(true)) {
            let client_config = Configuration::Client(ClientConfiguration {
                ssid: wifi::SSID.into(),
                password: wifi::PASSWORD.into(),
                ..Default::default()
            });
            if let Err(e) = controller.set_configuration(&client_config) {
                error!("Wi-Fi configuration rejected: {:?}", e);
            }

            info!("Starting Wi-Fi");
            if let Err(e) = controller.start_async().await {
                error!("Wi-Fi start failed: {:?}", e);
                Timer::after(Duration::from_millis(wifi::RETRY_MS)).await;
                continue;
            }
        }

        info!("Connecting to Wi-Fi");
        match controller.connect_async().await {
            Ok(()) => info!("Wi-Fi connected"),
            Err(e) => {
                warn!("Wi-Fi connect failed: {:?}", e);
                Timer::after(Duration::from_millis(wifi::RETRY_MS)).await;
            }
        }
    }
}

#[embassy_executor::task]
pub async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) -> ! {
    runner.run().await
}

/// 時刻同期タスク - ネットワーク接続後にSNTPで同期し、以後は定期的に再同期
#[embassy_executor::task]
pub async fn time_sync_task(stack: Stack<'static>) {
    loop {
        stack.wait_config_up().await;

        match fetch_unix_time(stack).await {
            Ok(epoch_s) => {
                clock::set_epoch(epoch_s);
                info!("Clock synchronised: epoch={}", epoch_s);
                Timer::after(Duration::from_secs(time::RESYNC_S)).await;
            }
            Err(()) => {
                Timer::after(Duration::from_secs(time::RETRY_S)).await;
            }
        }
    }
}

async fn fetch_unix_time(stack: Stack<'_>) -> Result<u64, ()> {
    let mut rx_meta = [PacketMetadata::EMPTY; 4];
    let mut rx_buffer = [0; 512];
    let mut tx_meta = [PacketMetadata::EMPTY; 4];
    let mut tx_buffer = [0; 512];

    let mut socket = UdpSocket::new(
        stack,
        &mut rx_meta,
        &mut rx_buffer,
        &mut tx_meta,
        &mut tx_buffer,
    );
    socket.bind(time::NTP_PORT).map_err(|e| {
        error!("NTP socket bind failed: {:?}", e);
    })?;

    let addrs = stack
        .dns_query(time::NTP_SERVER, DnsQueryType::A)
        .await
        .map_err(|e| {
            warn!("NTP server lookup failed: {:?}", e);
        })?;
    let Some(addr) = addrs.first() else {
        warn!("NTP server lookup returned no address");
        return Err(());
    };

    let addr: IpAddr = (*addr).into();
    let context = NtpContext::new(TimestampGen::default());

    match sntpc::get_time(SocketAddr::from((addr, time::NTP_PORT)), &socket, context).await {
        Ok(result) => Ok(u64::from(result.seconds)),
        Err(e) => {
            warn!("NTP request failed: {:?}", e);
            Err(())
        }
    }
}

#[derive(Copy, Clone, Default)]
struct TimestampGen {}

impl NtpTimestampGenerator for TimestampGen {
    fn init(&mut self) {}

    fn timestamp_sec(&self) -> u64 {
        0
    }

    fn timestamp_subsec_micros(&self) -> u32 {
        0
    }
}
