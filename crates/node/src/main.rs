mod relay;
mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::{env, time::Duration};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use relay::RelayBoard;
use sim::{Actuator, GrowSim};

const COMMAND_FILTER: &str = "cmd/+/set";

#[derive(Debug, Serialize)]
struct StateMsg<'a> {
    state: &'a str,
}

/// Entity names this node owns.
struct Entities {
    light: String,
    fan: String,
    pump: String,
    temperature: String,
    humidity: String,
    moisture: String,
}

impl Entities {
    fn from_env() -> Self {
        let var = |k: &str, default: &str| env::var(k).unwrap_or_else(|_| default.to_string());
        Self {
            light: var("LIGHT_ENTITY", "switch.tent_light"),
            fan: var("FAN_ENTITY", "switch.tent_fan"),
            pump: var("PUMP_ENTITY", "switch.tent_pump"),
            temperature: var("TEMP_ENTITY", "sensor.tent_temperature"),
            humidity: var("HUMIDITY_ENTITY", "sensor.tent_humidity"),
            moisture: var("MOISTURE_ENTITY", "sensor.tent_moisture"),
        }
    }

    fn actuators(&self) -> [(&str, Actuator); 3] {
        [
            (self.light.as_str(), Actuator::Light),
            (self.fan.as_str(), Actuator::Fan),
            (self.pump.as_str(), Actuator::Pump),
        ]
    }

    fn actuator(&self, entity: &str) -> Option<Actuator> {
        self.actuators()
            .into_iter()
            .find(|(e, _)| *e == entity)
            .map(|(_, a)| a)
    }
}

/// What the MQTT task hands to the device loop.
enum NodeEvent {
    Connected,
    Command { entity: String, on: bool },
    LinkError,
}

/// Extract the entity from "cmd/<entity>/set".
fn extract_command_entity(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "cmd" && parts[2] == "set" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

fn parse_command(payload: &[u8]) -> Result<bool, String> {
    let text = String::from_utf8_lossy(payload);
    match text.trim().to_ascii_uppercase().as_str() {
        "ON" => Ok(true),
        "OFF" => Ok(false),
        other => Err(format!("invalid command payload '{other}'")),
    }
}

fn state_payload(state: &str) -> Vec<u8> {
    // Serialising a struct of one &str cannot fail.
    serde_json::to_vec(&StateMsg { state }).unwrap_or_default()
}

/// Queue a retained state message.  Never waits on the client queue: the
/// MQTT task may itself be blocked handing us an event.  Returns false when
/// the message was dropped.
fn publish_state(client: &AsyncClient, entity: &str, state: &str) -> bool {
    let topic = format!("state/{entity}");
    match client.try_publish(topic, QoS::AtLeastOnce, true, state_payload(state)) {
        Ok(()) => true,
        Err(e) => {
            warn!(entity, "publish dropped: {e}");
            false
        }
    }
}

fn publish_all(client: &AsyncClient, entities: &Entities, sim: &GrowSim, relays: &RelayBoard) {
    let s = sim.sample();
    publish_state(client, &entities.temperature, &format!("{:.1}", s.temperature));
    publish_state(client, &entities.humidity, &format!("{:.1}", s.humidity));
    publish_state(client, &entities.moisture, &format!("{:.1}", s.moisture));
    for (entity, _) in entities.actuators() {
        let on = relays.is_on(entity).unwrap_or(false);
        publish_state(client, entity, if on { "on" } else { "off" });
    }
    debug!(
        temperature = s.temperature,
        humidity = s.humidity,
        moisture = s.moisture,
        "published sample"
    );
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let node_id = env::var("NODE_ID").unwrap_or_else(|_| "tent-1".to_string());
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);
    let gpio = |k: &str, default: u8| env::var(k).ok().and_then(|s| s.parse().ok()).unwrap_or(default);
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    let entities = Entities::from_env();
    let pins = vec![
        (entities.light.clone(), gpio("LIGHT_GPIO", 17)),
        (entities.fan.clone(), gpio("FAN_GPIO", 27)),
        (entities.pump.clone(), gpio("PUMP_GPIO", 22)),
    ];

    // Fail-safe: everything off until the hub says otherwise.
    let mut relays = RelayBoard::new(&pins, active_low)?;
    relays.all_off();
    let mut sim = GrowSim::default();

    let mut mqttoptions = MqttOptions::new(format!("growbox-node-{node_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);

    let (tx, mut rx) = mpsc::channel::<NodeEvent>(32);
    let sub_client = client.clone();
    tokio::spawn(async move {
        loop {
            let event = match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to mqtt");
                    if let Err(e) = sub_client.try_subscribe(COMMAND_FILTER, QoS::AtLeastOnce) {
                        warn!("subscribe failed: {e}");
                    }
                    Some(NodeEvent::Connected)
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    match (extract_command_entity(&p.topic), parse_command(&p.payload)) {
                        (Some(entity), Ok(on)) => Some(NodeEvent::Command {
                            entity: entity.to_string(),
                            on,
                        }),
                        (Some(entity), Err(msg)) => {
                            warn!(entity, "{msg} (use ON/OFF)");
                            None
                        }
                        (None, _) => None,
                    }
                }
                Ok(_) => None,
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                    Some(NodeEvent::LinkError)
                }
            };
            if let Some(ev) = event {
                if tx.send(ev).await.is_err() {
                    break;
                }
            }
        }
    });

    info!(node_id = %node_id, sample_every_s, "node started");

    let mut ticker = tokio::time::interval(Duration::from_secs(sample_every_s.max(1)));
    let mut last_step = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sim.step(last_step.elapsed().as_secs_f64());
                last_step = Instant::now();
                publish_all(&client, &entities, &sim, &relays);
            }
            ev = rx.recv() => {
                let Some(ev) = ev else { break };
                // Bring the model up to date before inputs change.
                sim.step(last_step.elapsed().as_secs_f64());
                last_step = Instant::now();

                match ev {
                    NodeEvent::Connected => publish_all(&client, &entities, &sim, &relays),
                    NodeEvent::Command { entity, on } => match entities.actuator(&entity) {
                        Some(actuator) => {
                            relays.set(&entity, on);
                            sim.set(actuator, on);
                            publish_state(&client, &entity, if on { "on" } else { "off" });
                        }
                        None => debug!(entity = %entity, "command for an entity this node does not own"),
                    },
                    NodeEvent::LinkError => {
                        relays.all_off();
                        sim.all_off();
                    }
                }
            }
        }
    }

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
