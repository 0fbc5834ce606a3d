//! People counter binary.
//!
//! Raw frames go to stdout, so pipe them into a video server, e.g.
//! `people_counter -m ssd.onnx -i walk.mp4 | ffmpeg -f rawvideo -pixel_format bgr24 ...`.
use std::time::Duration;

use anyhow::Result;
use env_logger::TimestampPrecision;
use people_counter::{
    config::Args, meter::spawn_meter_logger, pipeline::infer_on_stream, publisher::connect_mqtt,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_cli(std::env::args_os());

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    // Connect to the MQTT server
    let (publisher, mqtt_handle) = connect_mqtt(
        &args.mqtt_host,
        args.mqtt_port,
        Duration::from_secs(args.mqtt_keepalive),
    )
    .await?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    spawn_meter_logger(Duration::from_secs(2));

    // Perform inference on the input stream
    let res = infer_on_stream(&args, &publisher, shutdown).await;

    if let Err(err) = publisher.disconnect().await {
        log::warn!("Failed to disconnect from MQTT broker: {err:#}");
    }
    // Let queued messages and the DISCONNECT reach the broker
    tokio::time::timeout(Duration::from_secs(2), mqtt_handle)
        .await
        .ok();

    res
}
