// MQTT topic scheme, payload builders and the bounded outbound queue
//
// The network task owns the broker connection and drains `OutboundChannel`.
// Every other task only enqueues; a full queue drops the new message.

pub mod transport;

use core::fmt::Write;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use heapless::String;
use serde::Serialize;

use crate::accounting::EnergyPublisher;
use crate::energy::EnergySnapshot;

/// Topic prefix for device topics (includes trailing '/')
pub const TOPIC_PREFIX: &str = "ev-e-monitor/";

/// Device name prefix, followed by the MAC address
pub const DEVICE_NAME_PREFIX: &str = "esp32-device_";

/// Client id prefix, followed by the last 3 MAC bytes
pub const CLIENT_ID_PREFIX: &str = "ev-energy-monitor_";

/// Home Assistant discovery prefix (includes trailing '/')
pub const DISCOVERY_PREFIX: &str = "homeassistant/";

/// Retained state topic read by the discovery entities
pub const STATE_TOPIC: &str = "homeassistant/ev-e-monitor/state";

/// Brokers speaking MQTT 3.1 limit client ids to 23 characters
pub const CLIENT_ID_MAX_LEN: usize = 23;

/// Availability payloads
pub const PAYLOAD_ONLINE: &str = "True";
pub const PAYLOAD_OFFLINE: &str = "False";

/// Firmware version string published on the version topic
pub const SKETCH_VERSION: &str = concat!("EV-charging ESP32 MQTT interface - V", env!("CARGO_PKG_VERSION"));

pub const TOPIC_LEN: usize = 64;
pub const PAYLOAD_LEN: usize = 768;

/// Outbound queue depth
pub const OUTBOUND_QUEUE_DEPTH: usize = 10;

/// Entity names shown in Home Assistant (also the JSON keys of the state payload)
pub mod entity {
    pub const SUBTOTAL: &str = "Subtotal";
    pub const POWER: &str = "Forbrug";
    pub const TOTAL: &str = "Total";
}

/// Builder errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MqttError {
    /// Payload does not fit the message buffer
    PayloadTooLong,
    /// Topic does not fit the topic buffer
    TopicTooLong,
}

/// Per-device topic set, derived from the station MAC address
#[derive(Debug, Clone)]
pub struct DeviceTopics {
    pub device_name: String<32>,
    pub client_id: String<CLIENT_ID_MAX_LEN>,
    pub online: String<TOPIC_LEN>,
    pub version: String<TOPIC_LEN>,
    pub log: String<TOPIC_LEN>,
    pub status: String<TOPIC_LEN>,
    pub set: String<TOPIC_LEN>,
}

fn device_topic(device_name: &str, suffix: &str) -> String<TOPIC_LEN> {
    let mut topic = String::new();
    let _ = write!(topic, "{}{}{}", TOPIC_PREFIX, device_name, suffix);
    topic
}

impl DeviceTopics {
    /// Build the topic set for a MAC address
    pub fn from_mac(mac: [u8; 6]) -> Self {
        let mut hex: String<12> = String::new();
        for byte in mac {
            let _ = write!(hex, "{:02X}", byte);
        }

        let mut device_name: String<32> = String::new();
        let _ = write!(device_name, "{}{}", DEVICE_NAME_PREFIX, hex);

        let mut client_id: String<CLIENT_ID_MAX_LEN> = String::new();
        for c in CLIENT_ID_PREFIX.chars().chain(hex[6..].chars()) {
            if client_id.push(c).is_err() {
                break;
            }
        }

        Self {
            online: device_topic(&device_name, "/online"),
            version: device_topic(&device_name, "/sketch_version"),
            log: device_topic(&device_name, "/log"),
            status: device_topic(&device_name, "/log/status"),
            set: device_topic(&device_name, "/set"),
            device_name,
            client_id,
        }
    }

    /// Whether an inbound topic is this device's set topic
    pub fn is_set_topic(&self, topic: &str) -> bool {
        topic == self.set.as_str()
    }
}

/// A queued outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String<TOPIC_LEN>,
    pub payload: String<PAYLOAD_LEN>,
    pub retain: bool,
}

impl MqttMessage {
    pub fn new(topic: &str, payload: &str, retain: bool) -> Result<Self, MqttError> {
        let mut message = Self {
            topic: String::new(),
            payload: String::new(),
            retain,
        };
        message
            .topic
            .push_str(topic)
            .map_err(|_| MqttError::TopicTooLong)?;
        message
            .payload
            .push_str(payload)
            .map_err(|_| MqttError::PayloadTooLong)?;
        Ok(message)
    }
}

#[derive(Serialize)]
struct StatePayload {
    #[serde(rename = "Forbrug")]
    power_w: f32,
    #[serde(rename = "Total")]
    energy_kwh: f32,
    #[serde(rename = "Subtotal")]
    subtotal_kwh: f32,
}

/// Build the retained state JSON `{"Forbrug": W, "Total": kWh, "Subtotal": kWh}`
pub fn state_payload(snapshot: &EnergySnapshot) -> Result<String<128>, MqttError> {
    serde_json_core::to_string(&StatePayload {
        power_w: snapshot.power_w,
        energy_kwh: snapshot.energy_kwh,
        subtotal_kwh: snapshot.subtotal_kwh,
    })
    .map_err(|_| MqttError::PayloadTooLong)
}

/// Home Assistant discovery entities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Entity {
    /// Subtotal energy sensor (kWh)
    SubtotalSensor,
    /// Instantaneous power sensor (W)
    PowerSensor,
    /// Cumulative energy, settable from Home Assistant (kWh)
    TotalNumber,
}

impl Entity {
    pub const ALL: [Entity; 3] = [Entity::SubtotalSensor, Entity::PowerSensor, Entity::TotalNumber];

    fn component(self) -> &'static str {
        match self {
            Entity::SubtotalSensor | Entity::PowerSensor => "sensor",
            Entity::TotalNumber => "number",
        }
    }

    fn device_class(self) -> &'static str {
        match self {
            Entity::PowerSensor => "power",
            Entity::SubtotalSensor | Entity::TotalNumber => "energy",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Entity::SubtotalSensor => entity::SUBTOTAL,
            Entity::PowerSensor => entity::POWER,
            Entity::TotalNumber => entity::TOTAL,
        }
    }

    fn unit(self) -> &'static str {
        match self {
            Entity::PowerSensor => "W",
            Entity::SubtotalSensor | Entity::TotalNumber => "kWh",
        }
    }
}

#[derive(Serialize)]
struct DeviceInfo<'a> {
    identifiers: [&'a str; 1],
    name: &'a str,
}

#[derive(Serialize)]
struct DiscoveryConfig<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    command_topic: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command_template: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<f32>,
    name: &'a str,
    state_topic: &'a str,
    availability_topic: &'a str,
    payload_available: &'a str,
    payload_not_available: &'a str,
    device_class: &'a str,
    unit_of_measurement: &'a str,
    unique_id: &'a str,
    qos: u8,
    value_template: &'a str,
    device: DeviceInfo<'a>,
}

/// Build the retained discovery config message for one entity
pub fn discovery_message(topics: &DeviceTopics, entity: Entity) -> Result<MqttMessage, MqttError> {
    let name = entity.name();

    let mut unique_id: String<64> = String::new();
    write!(unique_id, "{}_{}", name, topics.device_name).map_err(|_| MqttError::PayloadTooLong)?;

    let mut value_template: String<64> = String::new();
    match entity {
        Entity::PowerSensor => write!(value_template, "{{{{ value_json.{}}}}}", name),
        _ => write!(value_template, "{{{{ value_json.{} | round(2)}}}}", name),
    }
    .map_err(|_| MqttError::PayloadTooLong)?;

    let mut command_template: String<64> = String::new();
    let settable = entity == Entity::TotalNumber;
    if settable {
        write!(command_template, "{{\"{}\": {{{{ value }}}} }}", name)
            .map_err(|_| MqttError::PayloadTooLong)?;
    }

    let config = DiscoveryConfig {
        command_topic: settable.then_some(topics.set.as_str()),
        command_template: settable.then_some(command_template.as_str()),
        max: settable.then_some(99_999.99),
        min: settable.then_some(0.0),
        step: settable.then_some(0.01),
        name,
        state_topic: STATE_TOPIC,
        availability_topic: &topics.online,
        payload_available: PAYLOAD_ONLINE,
        payload_not_available: PAYLOAD_OFFLINE,
        device_class: entity.device_class(),
        unit_of_measurement: entity.unit(),
        unique_id: &unique_id,
        qos: 0,
        value_template: &value_template,
        device: DeviceInfo {
            identifiers: ["Meter"],
            name: "Energi - EV ESP32 Monitor",
        },
    };

    let payload: String<PAYLOAD_LEN> =
        serde_json_core::to_string(&config).map_err(|_| MqttError::PayloadTooLong)?;

    let mut topic: String<TOPIC_LEN> = String::new();
    write!(
        topic,
        "{}{}/{}/config",
        DISCOVERY_PREFIX,
        entity.component(),
        entity.device_class()
    )
    .map_err(|_| MqttError::TopicTooLong)?;

    Ok(MqttMessage {
        topic,
        payload,
        retain: true,
    })
}

/// Outbound message queue drained by the network task
pub type OutboundChannel = Channel<CriticalSectionRawMutex, MqttMessage, OUTBOUND_QUEUE_DEPTH>;

/// Log topic selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTopic {
    /// General log (`/log`)
    Log,
    /// Status log (`/log/status`)
    Status,
}

/// Enqueues messages for the network task
pub struct MqttPublisher<'a> {
    channel: &'a OutboundChannel,
    topics: &'a DeviceTopics,
    dropped: u32,
}

impl<'a> MqttPublisher<'a> {
    pub fn new(channel: &'a OutboundChannel, topics: &'a DeviceTopics) -> Self {
        Self {
            channel,
            topics,
            dropped: 0,
        }
    }

    /// Messages dropped because the queue was full
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Try to enqueue a message without waiting
    pub fn enqueue(&mut self, message: MqttMessage) -> bool {
        match self.channel.try_send(message) {
            Ok(()) => true,
            Err(_) => {
                self.dropped = self.dropped.wrapping_add(1);
                warn!("MQTT outbound queue full, message dropped ({} total)", self.dropped);
                false
            }
        }
    }

    /// Publish a text message on one of the log topics
    pub fn publish_log(&mut self, topic: LogTopic, message: &str, retain: bool) -> bool {
        let topic = match topic {
            LogTopic::Log => self.topics.log.as_str(),
            LogTopic::Status => self.topics.status.as_str(),
        };
        match MqttMessage::new(topic, message, retain) {
            Ok(message) => self.enqueue(message),
            Err(e) => {
                warn!("MQTT log message rejected: {}", e);
                false
            }
        }
    }
}

impl EnergyPublisher for MqttPublisher<'_> {
    fn publish_energy(&mut self, snapshot: &EnergySnapshot) {
        match state_payload(snapshot).and_then(|payload| MqttMessage::new(STATE_TOPIC, &payload, true)) {
            Ok(message) => {
                self.enqueue(message);
            }
            Err(e) => warn!("State payload rejected: {}", e),
        }
    }

    fn publish_status(&mut self, message: &str) {
        self.publish_log(LogTopic::Status, message, false);
    }

    fn publish_event(&mut self, message: &str) {
        self.publish_log(LogTopic::Log, message, false);
    }
}
