use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::config::MqttConfig;
use crate::metering_mercury::protocol::Measurement;

/// One value (or fault) of one channel as the sink receives it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub id: String,
    pub chan: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Measurement>,
    /// 1 when the meter did not answer for this channel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chstatus: Option<u8>,
    /// Milliseconds since the Unix epoch
    pub ts: i64,
    pub parentname: String,
}

impl Sample {
    pub fn reading(id: &str, chan: &str, value: Measurement, ts: i64, parentname: &str) -> Self {
        Sample {
            id: id.to_string(),
            chan: chan.to_string(),
            value: Some(value),
            chstatus: None,
            ts,
            parentname: parentname.to_string(),
        }
    }

    pub fn fault(id: &str, chan: &str, ts: i64, parentname: &str) -> Self {
        Sample {
            id: id.to_string(),
            chan: chan.to_string(),
            value: None,
            chstatus: Some(1),
            ts,
            parentname: parentname.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkingState {
    Working,
}

impl WorkingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkingState::Working => "working",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transmission {
    Metering(Vec<Sample>),
    State(WorkingState),
}

pub struct MqttManager {
    rx: Receiver<Transmission>,
    exit_thread: bool,
    client: AsyncClient,
    topic: String,
}

impl MqttManager {
    pub fn new(config: &MqttConfig) -> (Self, Sender<Transmission>) {
        let (mtx, mrx) = tokio::sync::mpsc::channel(100);

        info!("MQTT connection to {}:{} starting up", config.host, config.port);
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if !config.user.is_empty() {
            mqttoptions.set_credentials(config.user.clone(), config.pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        /* The eventloop has to be polled for anything to go out */
        tokio::spawn(async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to the MQTT broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting ", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        (MqttManager {
            rx: mrx,
            exit_thread: false,
            client,
            topic: config.topic.clone(),
        }, mtx)
    }

    pub async fn start_thread(&mut self) {
        while !self.exit_thread {
            let transmission = match self.rx.recv().await {
                Some(t) => t,
                None => {
                    debug!("Reading returned none, we exit now");
                    self.exit_thread = true;
                    continue;
                }
            };

            match transmission {
                Transmission::Metering(samples) => {
                    let payload = match serde_json::to_string(&samples) {
                        Ok(p) => p,
                        Err(e) => {
                            error!("Unable to serialize {} samples: {e}", samples.len());
                            continue;
                        }
                    };

                    debug!("Publishing {} samples", samples.len());
                    match self.client.publish(format!("{}/data", self.topic), QoS::AtLeastOnce, false, payload).await {
                        Err(e) => { error!("Error sending: {}", e); },
                        Ok(_) => { debug!("Send successfully"); }
                    }
                }
                Transmission::State(state) => {
                    info!("Agent state {}", state.as_str());
                    if let Err(e) = self.client.publish(format!("{}/state", self.topic), QoS::AtLeastOnce, true, state.as_str()).await {
                        warn!("Error publishing state: {}", e);
                    }
                }
            }
        }

        info!("MQTT thread exit");
    }
}
