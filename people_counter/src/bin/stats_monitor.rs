//! Subscribe to the people counter topics and log every message.
//!
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use common::protocol::{StatsMsg, DURATION_TOPIC, PERSON_TOPIC};
use env_logger::TimestampPrecision;
use people_counter::publisher::{mqtt_options, wait_for_connack};
use rumqttc::{AsyncClient, Event, Packet, QoS};

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Host of the MQTT broker
    #[clap(long, env = "MQTT_HOST", default_value = "localhost")]
    mqtt_host: String,

    /// Port of the MQTT broker
    #[clap(long, env = "MQTT_PORT", default_value_t = 3001)]
    mqtt_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let options = mqtt_options(
        "stats_monitor",
        &args.mqtt_host,
        args.mqtt_port,
        Duration::from_secs(60),
    );
    let (client, mut eventloop) = AsyncClient::new(options, 10);
    wait_for_connack(&mut eventloop).await?;

    client.subscribe(PERSON_TOPIC, QoS::AtMostOnce).await?;
    client.subscribe(DURATION_TOPIC, QoS::AtMostOnce).await?;
    log::info!("Listening on {PERSON_TOPIC} and {DURATION_TOPIC}");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match StatsMsg::from_json(&publish.payload) {
                    Ok(msg) => log::info!("{}: {msg:?}", publish.topic),
                    Err(err) => log::warn!("{}: undecodable payload: {err}", publish.topic),
                }
            }
            Ok(_) => (),
            Err(err) => {
                log::warn!("MQTT connection error: {err}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
