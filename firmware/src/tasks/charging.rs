//! 充電セッションタスク
//!
//! サンプリング周期ごとにアナログ入力を読み、充電セッションを1tick進める。
//! 車両テレメトリの取得とセッションレコードの送信はこのタスクだけがHTTPSで行う。

use core::fmt::Write;

use embassy_net::dns::DnsSocket;
use embassy_net::tcp::client::{TcpClient, TcpClientState};
use embassy_net::Stack;
use embassy_time::{with_timeout, Duration, Instant, Ticker, Timer};
use esp_storage::FlashStorage;
use ev_energy_meter::charging::{ChargingSession, IoError, SessionIo, UploadTarget};
use ev_energy_meter::config::MeterConfig;
use ev_energy_meter::mqtt::{DeviceTopics, LogTopic, MqttPublisher};
use ev_energy_meter::store::FlashLogStore;
use ev_energy_meter::telemetry::{parse_vehicle_data, VehicleTelemetry};
use heapless::String;
use reqwless::client::{HttpClient, TlsConfig, TlsVerify};
use reqwless::headers::ContentType;
use reqwless::request::{Method, RequestBuilder};

use crate::clock;
use crate::config::{http, upload, vehicle};
use crate::hardware::AnalogInput;
use crate::state::{METER, OUTBOUND};

type Http<'a> = HttpClient<'a, TcpClient<'a, 1, 1024, 1024>, DnsSocket<'a>>;

/// `SessionIo` のHTTPS実装
struct CloudIo<'a> {
    stack: Stack<'static>,
    http: Http<'a>,
    rx_buffer: [u8; http::RX_BUFFER_SIZE],
    publisher: MqttPublisher<'static>,
}

impl CloudIo<'_> {
    fn timeout() -> Duration {
        Duration::from_secs(http::TIMEOUT_S)
    }

    fn ensure_online(&self) -> Result<(), IoError> {
        if self.stack.is_config_up() {
            Ok(())
        } else {
            Err(IoError::Offline)
        }
    }

    async fn get_vehicle_data(&mut self) -> Result<VehicleTelemetry, IoError> {
        let headers = [("Authorization", vehicle::AUTHORIZATION)];

        let mut request = match with_timeout(
            Self::timeout(),
            self.http.request(Method::GET, vehicle::VEHICLE_DATA_URL),
        )
        .await
        {
            Ok(Ok(request)) => request.headers(&headers),
            Ok(Err(e)) => {
                warn!("vehicle_data request failed: {}", e);
                return Err(IoError::Request);
            }
            Err(_) => {
                warn!("vehicle_data request failed: timeout");
                return Err(IoError::Request);
            }
        };

        let response = match with_timeout(Self::timeout(), request.send(&mut self.rx_buffer)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("vehicle_data response failed: {}", e);
                return Err(IoError::Request);
            }
            Err(_) => {
                warn!("vehicle_data response failed: timeout");
                return Err(IoError::Request);
            }
        };

        let status = response.status.0;
        if !(200..300).contains(&status) {
            warn!("vehicle_data status={}", status);
            return Err(IoError::Status(status));
        }

        let body = match with_timeout(Self::timeout(), response.body().read_to_end()).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                warn!("vehicle_data body read failed: {}", e);
                return Err(IoError::Request);
            }
            Err(_) => {
                warn!("vehicle_data body read failed: timeout");
                return Err(IoError::Request);
            }
        };

        Ok(parse_vehicle_data(body)?)
    }

    /// スリープ中の車両を起こす（応答は待たない、次の再試行で取り直す）
    async fn wake_up(&mut self) {
        info!("Vehicle asleep, requesting wake_up");
        let headers = [("Authorization", vehicle::AUTHORIZATION)];

        let mut request = match with_timeout(
            Self::timeout(),
            self.http.request(Method::POST, vehicle::WAKE_UP_URL),
        )
        .await
        {
            Ok(Ok(request)) => request.headers(&headers),
            _ => {
                warn!("wake_up request failed");
                return;
            }
        };

        match with_timeout(Self::timeout(), request.send(&mut self.rx_buffer)).await {
            Ok(Ok(response)) => debug!("wake_up status={}", response.status.0),
            _ => warn!("wake_up request failed"),
        }
    }
}

impl SessionIo for CloudIo<'_> {
    async fn fetch_telemetry(&mut self) -> Result<VehicleTelemetry, IoError> {
        self.ensure_online()?;

        let result = self.get_vehicle_data().await;
        if let Err(IoError::Status(vehicle::STATUS_ASLEEP)) = result {
            self.wake_up().await;
        }
        result
    }

    async fn upload(&mut self, target: UploadTarget, payload: &str) -> Result<(), IoError> {
        self.ensure_online()?;

        let mut url: String<256> = String::new();
        write!(url, "{}?sheet={}", upload::URL, target.as_str()).map_err(|_| IoError::Request)?;

        let mut request =
            match with_timeout(Self::timeout(), self.http.request(Method::POST, &url)).await {
                Ok(Ok(request)) => request
                    .content_type(ContentType::TextPlain)
                    .body(payload.as_bytes()),
                Ok(Err(e)) => {
                    warn!("{} upload failed: {}", target.as_str(), e);
                    return Err(IoError::Request);
                }
                Err(_) => {
                    warn!("{} upload failed: timeout", target.as_str());
                    return Err(IoError::Request);
                }
            };

        let status = match with_timeout(Self::timeout(), request.send(&mut self.rx_buffer)).await {
            Ok(Ok(response)) => response.status.0,
            Ok(Err(e)) => {
                warn!("{} upload failed: {}", target.as_str(), e);
                return Err(IoError::Request);
            }
            Err(_) => {
                warn!("{} upload failed: timeout", target.as_str());
                return Err(IoError::Request);
            }
        };

        // スクリプト系の受け口は成功時に302を返す
        if (200..400).contains(&status) {
            debug!("{} upload status={}", target.as_str(), status);
            Ok(())
        } else {
            warn!("{} upload status={}", target.as_str(), status);
            Err(IoError::Status(status))
        }
    }

    async fn delay_ms(&mut self, ms: u64) {
        Timer::after(Duration::from_millis(ms)).await;
    }

    fn epoch_now(&self) -> Option<u64> {
        clock::epoch_now()
    }

    fn log(&mut self, topic: LogTopic, message: &str) {
        match topic {
            LogTopic::Log => info!("{}", message),
            LogTopic::Status => warn!("{}", message),
        }
        self.publisher.publish_log(topic, message, false);
    }
}

/// 充電セッションタスク - アナログ入力から充電を検出し、セッションを記録・送信
#[embassy_executor::task]
pub async fn charging_task(
    stack: Stack<'static>,
    store: FlashLogStore<FlashStorage>,
    mut analog: AnalogInput,
    config: MeterConfig,
    topics: &'static DeviceTopics,
    tls_seed: u64,
) {
    info!("Charging session task started");

    let mut tls_read_buffer = [0; http::TLS_BUFFER_SIZE];
    let mut tls_write_buffer = [0; http::TLS_BUFFER_SIZE];

    let client_state = TcpClientState::<1, 1024, 1024>::new();
    let tcp_client = TcpClient::new(stack, &client_state);
    let dns_client = DnsSocket::new(stack);
    let tls_config = TlsConfig::new(
        tls_seed,
        &mut tls_read_buffer,
        &mut tls_write_buffer,
        TlsVerify::None,
    );

    let mut io = CloudIo {
        stack,
        http: HttpClient::new_with_tls(&tcp_client, &dns_client, tls_config),
        rx_buffer: [0; http::RX_BUFFER_SIZE],
        publisher: MqttPublisher::new(&OUTBOUND, topics),
    };

    let mut session = ChargingSession::restore(store, &METER.snapshot, &config, &mut io);
    info!(
        "Charging detector: threshold={} hysteresis={} confirm={}s/{}s",
        config.charging_threshold,
        config.charging_hysteresis,
        config.start_confirm_s,
        config.end_confirm_s
    );

    let mut ticker = Ticker::every(Duration::from_millis(config.sample_interval_ms.max(1) as u64));

    loop {
        ticker.next().await;

        let Some(value) = analog.read() else {
            warn!("Analog read failed");
            continue;
        };
        session.tick(Instant::now().as_millis(), value, &mut io).await;
    }
}
