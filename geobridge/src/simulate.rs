use std::time::{Duration, Instant};

use clap::Args;
use futures::{SinkExt, future::try_join_all};
use rand::Rng;
use snafu::ResultExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConnectSnafu, InvalidArgumentSnafu, Result};

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// The WebSocket endpoint of the bridge.
    #[arg(long, default_value = "ws://127.0.0.1:30000/ws")]
    url: String,
    /// Number of devices, each with its own connection.
    #[arg(long, default_value = "1")]
    devices: usize,
    /// Time between two records of the same device.
    #[arg(long, default_value = "1000")]
    interval_ms: u64,
    /// Stop each device after this many records.
    #[arg(long)]
    count: Option<u64>,
}

impl SimulateArgs {
    pub async fn run(self, ct: CancellationToken) -> Result<()> {
        if self.devices == 0 {
            return InvalidArgumentSnafu {
                name: "devices",
                message: "must be at least 1",
            }
            .fail();
        }

        if self.interval_ms == 0 {
            return InvalidArgumentSnafu {
                name: "interval-ms",
                message: "must be at least 1",
            }
            .fail();
        }

        info!(
            url = %self.url,
            devices = self.devices,
            interval_ms = self.interval_ms,
            "starting device simulation"
        );

        let interval = Duration::from_millis(self.interval_ms);
        let devices = (0..self.devices).map(|_| {
            let obuid = rand::rng().random_range(1..=i64::from(i32::MAX));
            run_device(&self.url, obuid, interval, self.count, ct.clone())
        });

        let sent = try_join_all(devices).await?;
        info!(records = sent.iter().sum::<u64>(), "device simulation stopped");

        Ok(())
    }
}

/// Pushes random coordinates for one device until cancelled, the device
/// reaches `count` records, or the bridge goes away.
async fn run_device(
    url: &str,
    obuid: i64,
    interval: Duration,
    count: Option<u64>,
    ct: CancellationToken,
) -> Result<u64> {
    let (mut socket, _) = tokio_tungstenite::connect_async(url)
        .await
        .context(ConnectSnafu { url })?;

    debug!(obuid, "device connected");

    let mut ticker = tokio::time::interval(interval);
    let mut sent = 0;

    while count.is_none_or(|count| sent < count) {
        tokio::select! {
            _ = ct.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let message = random_message(&mut rand::rng(), obuid);
        let start = Instant::now();

        if let Err(err) = socket.send(Message::text(message)).await {
            warn!(obuid, err = %err, "failed to send record");
            return Ok(sent);
        }

        sent += 1;
        debug!(obuid, elapsed_us = start.elapsed().as_micros() as u64, "record sent");
    }

    if let Err(err) = socket.close(None).await {
        debug!(obuid, err = %err, "failed to close connection");
    }

    Ok(sent)
}

fn random_message(rng: &mut impl Rng, obuid: i64) -> String {
    serde_json::json!({
        "obuid": obuid,
        "lat": rng.random_range(-90.0..=90.0),
        "lon": rng.random_range(-180.0..=180.0),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use geobridge_core::{SourceId, decode};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn test_random_messages_decode() {
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..1000 {
            let message = random_message(&mut rng, 42);
            let record = decode(message.as_bytes()).unwrap();
            assert_eq!(record.source_id(), SourceId(42));
        }
    }
}
