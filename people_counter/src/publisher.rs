//! Publishing of stats messages to an MQTT broker.
//!
use std::time::Duration;

use anyhow::{bail, Context, Result};
use common::protocol::StatsMsg;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;

/// Capacity of the request queue between the client handle and its event loop.
const REQUEST_CAPACITY: usize = 64;

/// Sink for the messages produced by the people counter.
pub trait StatsPublisher {
    fn publish(&self, msg: &StatsMsg) -> Result<()>;
}

impl<T: StatsPublisher + ?Sized> StatsPublisher for &T {
    fn publish(&self, msg: &StatsMsg) -> Result<()> {
        (**self).publish(msg)
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await?;
        Ok(())
    }
}

impl StatsPublisher for MqttPublisher {
    fn publish(&self, msg: &StatsMsg) -> Result<()> {
        let payload = msg.to_json()?;
        self.client
            .try_publish(msg.topic(), QoS::AtMostOnce, false, payload)
            .with_context(|| format!("failed to publish to {}", msg.topic()))
    }
}

/// Build MQTT options with a process-unique client id.
pub fn mqtt_options(name: &str, host: &str, port: u16, keepalive: Duration) -> MqttOptions {
    let mut options = MqttOptions::new(format!("{name}-{}", std::process::id()), host, port);
    options.set_keep_alive(keepalive);
    options
}

/// Drive the event loop until the broker acknowledged the connection.
pub async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await.context("failed to connect to MQTT broker")? {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code != ConnectReturnCode::Success {
                    bail!("MQTT broker refused connection: {:?}", ack.code);
                }
                return Ok(());
            }
            event => log::trace!("MQTT event before CONNACK: {event:?}"),
        }
    }
}

/// Connect to the MQTT broker and keep the connection alive in a background task.
pub async fn connect_mqtt(
    host: &str,
    port: u16,
    keepalive: Duration,
) -> Result<(MqttPublisher, JoinHandle<()>)> {
    let options = mqtt_options("people_counter", host, port, keepalive);
    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

    wait_for_connack(&mut eventloop).await?;
    log::info!("Connected to MQTT broker at {host}:{port}");

    let handle = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                    log::debug!("MQTT connection closed");
                    break;
                }
                Ok(event) => log::trace!("MQTT event: {event:?}"),
                Err(err) => {
                    log::warn!("MQTT connection error: {err}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    Ok((MqttPublisher { client }, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options() {
        let options = mqtt_options("people_counter", "broker", 3001, Duration::from_secs(60));

        assert_eq!(options.broker_address(), ("broker".to_owned(), 3001));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
        assert!(options.client_id().starts_with("people_counter-"));
    }

    #[tokio::test]
    async fn test_connect_fails_without_broker() {
        // Nothing listens on port 1
        let res = connect_mqtt("127.0.0.1", 1, Duration::from_secs(5)).await;
        assert!(res.is_err());
    }
}
