mod climate;
mod config;
mod control;
mod db;
mod gateway;
mod light;
mod mqtt;
mod options;
mod phase;
mod scheduler;
mod state;
mod water;
mod web;
mod zone;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use gateway::MqttActuators;
use mqtt::{extract_state_entity, parse_state_payload, STATE_FILTER};
use scheduler::{Job, Runner, Scheduler, TICK_INTERVAL};
use state::SystemState;
use zone::LocalZone;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:growbox.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let tz = env::var("TZ").unwrap_or_else(|_| "UTC".to_string());
    let zone = LocalZone::parse(&tz).with_context(|| format!("invalid TZ '{tz}'"))?;
    info!(zone = %tz, offset = %zone.now().offset(), "local time zone");

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file + persisted state ───────────────────────────────
    let cfg = config::load(&config_path)?;
    let boxes = config::restore_boxes(&cfg, &db, &zone, zone.now()).await?;
    if boxes.is_empty() {
        warn!("no boxes configured in {config_path}");
    }

    // ── Shared state (read side for the API) ────────────────────────
    let shared = SystemState::shared();
    {
        let mut st = shared.write().await;
        st.record_system("hub started".to_string());
    }

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("growbox-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 64);

    // ── Runner + periodic tick ──────────────────────────────────────
    let (scheduler, rx) = Scheduler::channel();
    let runner = Runner::new(
        boxes,
        Box::new(MqttActuators::new(client.clone())),
        db.clone(),
        shared.clone(),
        scheduler.clone(),
        zone,
    );
    tokio::spawn(runner.run(rx));
    scheduler.schedule_every(TICK_INTERVAL);

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        shared: shared.clone(),
        scheduler: scheduler.clone(),
        db,
        zone,
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(app, web_port).await {
            error!("{e:#}");
        }
    });

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(entity) = extract_state_entity(&p.topic) else {
                    debug!(topic = %p.topic, "unhandled topic");
                    continue;
                };
                match parse_state_payload(&p.payload) {
                    Ok(state) => {
                        let job = Job::Observe {
                            entity: entity.to_string(),
                            state,
                        };
                        if let Err(e) = scheduler.submit(job).await {
                            error!("{e:#}");
                            break;
                        }
                    }
                    Err(msg) => {
                        warn!(entity, "{msg}");
                        let mut st = shared.write().await;
                        st.record_error(format!("{entity}: {msg}"));
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Subscriptions do not survive a clean-session reconnect.
                if let Err(e) = client.try_subscribe(STATE_FILTER, QoS::AtLeastOnce) {
                    error!("mqtt subscribe failed: {e}");
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                // Entity states are stale until devices republish.
                if let Err(e) = scheduler.submit(Job::LinkDown).await {
                    error!("{e:#}");
                    break;
                }

                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }

    Ok(())
}
