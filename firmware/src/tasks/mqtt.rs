//! MQTT task
//!
//! Owns the broker connection. On connect it publishes the online flag, the firmware
//! version and the Home Assistant discovery entities, then subscribes to the set topic.
//! Afterwards it forwards the outbound queue, keeps the session alive and stages
//! inbound set commands for the pulse accounting task.
//!
//! The client's receive is only started once `Lookahead` has seen an inbound byte,
//! and it always runs to completion. Keep-alive is a retained re-publish of the
//! online flag instead of PINGREQ, so no reply ever has to be matched against
//! inbound traffic. A silent broker is caught by the socket timeout.

use embassy_futures::select::{select3, Either3};
use embassy_net::tcp::TcpSocket;
use embassy_net::Stack;
use embassy_time::{Duration, Ticker, Timer};
use ev_energy_meter::commands::{dispatch, parse_set_payload};
use ev_energy_meter::mqtt::transport::Lookahead;
use ev_energy_meter::mqtt::{
    discovery_message, DeviceTopics, Entity, LogTopic, MqttPublisher,
    PAYLOAD_OFFLINE, PAYLOAD_ONLINE, SKETCH_VERSION,
};
use heapless::Vec;
use rust_mqtt::{
    client::{
        client::MqttClient,
        client_config::{ClientConfig, MqttVersion},
    },
    packet::v5::{publish_packet::QualityOfService, reason_codes::ReasonCode},
    utils::rng_generator::CountingRng,
};

use crate::config::mqtt;
use crate::state::{METER, OUTBOUND};

/// Largest set-topic payload we accept
const SET_PAYLOAD_LEN: usize = 128;

/// What arrived on the subscription
enum Inbound {
    Set(Vec<u8, SET_PAYLOAD_LEN>),
    Ignored,
    Failed,
}

trait ClientExt {
    async fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), ()>;
}

impl<T: embedded_io_async::Read + embedded_io_async::Write> ClientExt
    for MqttClient<'_, T, 5, CountingRng>
{
    async fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), ()> {
        match self
            .send_message(topic, payload, QualityOfService::QoS0, retain)
            .await
        {
            Ok(_) => Ok(()),
            Err(ReasonCode::NoMatchingSubscribers) => Ok(()),
            Err(e) => {
                warn!("MQTT publish error: {:?}", e);
                Err(())
            }
        }
    }
}

/// MQTT task - keeps the broker session alive and reconnects on failure
#[embassy_executor::task]
pub async fn mqtt_task(stack: Stack<'static>, topics: &'static DeviceTopics, pulses_per_kwh: u32) {
    info!("MQTT task started");

    loop {
        stack.wait_config_up().await;

        if run_client(stack, topics, pulses_per_kwh).await.is_err() {
            warn!("MQTT session ended, reconnecting");
        }
        Timer::after(Duration::from_millis(mqtt::RECONNECT_MS)).await;
    }
}

async fn run_client(
    stack: Stack<'_>,
    topics: &DeviceTopics,
    pulses_per_kwh: u32,
) -> Result<(), ()> {
    let mut rx_buffer = [0; 4096];
    let mut tx_buffer = [0; 4096];

    let mut mqtt_rx_buffer = [0; mqtt::BUFFER_SIZE];
    let mut mqtt_tx_buffer = [0; mqtt::BUFFER_SIZE];

    let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);
    socket.set_timeout(Some(Duration::from_secs(mqtt::KEEP_ALIVE_S * 2)));

    info!(
        "Connecting to MQTT broker {}:{}",
        mqtt::BROKER_IP,
        mqtt::BROKER_PORT
    );
    socket
        .connect((mqtt::BROKER_IP, mqtt::BROKER_PORT))
        .await
        .map_err(|e| {
            warn!("Broker socket connection error: {:?}", e);
        })?;

    let link = Lookahead::new(socket);
    let mut client = {
        let mut config = ClientConfig::new(MqttVersion::MQTTv5, CountingRng(20000));
        config.add_client_id(&topics.client_id);
        config.add_username(mqtt::USERNAME);
        config.add_password(mqtt::PASSWORD);
        config.max_packet_size = mqtt::BUFFER_SIZE as u32;
        config.keep_alive = mqtt::KEEP_ALIVE_S as u16;
        config.add_will(&topics.online, PAYLOAD_OFFLINE.as_bytes(), true);

        MqttClient::<_, 5, _>::new(
            link.io(),
            &mut mqtt_tx_buffer,
            mqtt::BUFFER_SIZE,
            &mut mqtt_rx_buffer,
            mqtt::BUFFER_SIZE,
            config,
        )
    };

    match client.connect_to_broker().await {
        Ok(()) => info!("Connected to MQTT broker as {}", topics.client_id.as_str()),
        Err(e) => {
            warn!("MQTT error: {:?}", e);
            return Err(());
        }
    }

    announce(&mut client, topics).await?;

    client.subscribe_to_topic(&topics.set).await.map_err(|e| {
        warn!("MQTT subscribe error: {:?}", e);
    })?;
    info!("Subscribed to {}", topics.set.as_str());

    let mut heartbeat = Ticker::every(Duration::from_secs(mqtt::KEEP_ALIVE_S / 2));

    loop {
        match select3(heartbeat.next(), OUTBOUND.receive(), link.wait_readable()).await {
            Either3::First(_) => {
                client
                    .publish(&topics.online, PAYLOAD_ONLINE.as_bytes(), true)
                    .await?;
                debug!("MQTT heartbeat sent");
            }
            Either3::Second(message) => {
                client
                    .publish(&message.topic, message.payload.as_bytes(), message.retain)
                    .await?;
            }
            Either3::Third(Ok(())) => match receive_inbound(&mut client, topics).await {
                Inbound::Set(payload) => handle_set(&payload, topics, pulses_per_kwh),
                Inbound::Ignored => {}
                Inbound::Failed => return Err(()),
            },
            Either3::Third(Err(e)) => {
                warn!("MQTT socket error: {:?}", e);
                return Err(());
            }
        }
    }
}

/// Read one complete packet; only called once inbound data is waiting
async fn receive_inbound<T: embedded_io_async::Read + embedded_io_async::Write>(
    client: &mut MqttClient<'_, T, 5, CountingRng>,
    topics: &DeviceTopics,
) -> Inbound {
    match client.receive_message().await {
        Ok((topic, payload)) if topics.is_set_topic(topic) => match Vec::from_slice(payload) {
            Ok(payload) => Inbound::Set(payload),
            Err(()) => {
                warn!("Set payload too long ({} bytes)", payload.len());
                Inbound::Ignored
            }
        },
        Ok(_) => Inbound::Ignored,
        Err(e) => {
            warn!("MQTT receive error: {:?}", e);
            Inbound::Failed
        }
    }
}

/// Online flag, version and discovery entities (all retained)
async fn announce<T: embedded_io_async::Read + embedded_io_async::Write>(
    client: &mut MqttClient<'_, T, 5, CountingRng>,
    topics: &DeviceTopics,
) -> Result<(), ()> {
    client
        .publish(&topics.online, PAYLOAD_ONLINE.as_bytes(), true)
        .await?;
    client
        .publish(&topics.version, SKETCH_VERSION.as_bytes(), true)
        .await?;

    for entity in Entity::ALL {
        match discovery_message(topics, entity) {
            Ok(message) => {
                client
                    .publish(&message.topic, message.payload.as_bytes(), message.retain)
                    .await?
            }
            Err(e) => warn!("Discovery payload rejected: {}", e),
        }
    }

    debug!("Discovery published for {} entities", Entity::ALL.len());
    Ok(())
}

/// Parse and stage a set command; the accounting task applies it on its next loop
fn handle_set(payload: &[u8], topics: &DeviceTopics, pulses_per_kwh: u32) {
    let mut publisher = MqttPublisher::new(&OUTBOUND, topics);

    match parse_set_payload(payload, pulses_per_kwh) {
        Ok(commands) => {
            dispatch(&commands, &METER);
            publisher.publish_log(LogTopic::Status, "Set command accepted", false);
        }
        Err(e) => {
            warn!("Set command rejected: {}", e);
            publisher.publish_log(LogTopic::Status, "Set command rejected", false);
        }
    }
}
