use std::{net::SocketAddr, sync::Arc, time::Duration};

use clap::{Args, ValueEnum};
use geobridge_core::{
    BackpressurePolicy, Bridge, BridgeOptions, BrokerClient, DeadLetterSink, RetryOptions,
};
use geobridge_ws::WsIngestor;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{InvalidOptionsSnafu, InvalidServerUrlSnafu, Result, ServerSnafu, ServerTaskSnafu},
    sink::{LogBroker, LogDeadLetterSink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BrokerKind {
    /// Log records instead of publishing them
    Log,
    /// Publish records to Kafka
    Kafka,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackpressureArg {
    /// Drop records that do not fit in the queue
    FailOpen,
    /// Close the connection of a device that cannot be kept up with
    FailClosed,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// The address of the WebSocket server.
    #[arg(long, default_value = "127.0.0.1:30000")]
    address: String,
    /// Where records are published.
    #[arg(long, value_enum, default_value = "log")]
    broker: BrokerKind,
    /// Kafka bootstrap servers.
    #[cfg_attr(not(feature = "kafka"), allow(dead_code))]
    #[arg(long, default_value = "localhost:9092")]
    kafka_brokers: String,
    /// The topic records are published to.
    #[arg(long, default_value = "gpscoords")]
    topic: String,
    /// The topic undeliverable records are written to.
    #[cfg_attr(not(feature = "kafka"), allow(dead_code))]
    #[arg(long, default_value = "gpscoords-dlq")]
    dead_letter_topic: String,
    /// Maximum number of records waiting to be published.
    #[arg(long, default_value = "1024")]
    queue_capacity: usize,
    /// How long a device waits for room in a full queue.
    #[arg(long, default_value = "100")]
    enqueue_timeout_ms: u64,
    /// What to do when the queue stays full.
    #[arg(long, value_enum, default_value = "fail-open")]
    backpressure: BackpressureArg,
    #[arg(long, default_value = "100")]
    max_batch_size: usize,
    /// Maximum time a batch waits for more records.
    #[arg(long, default_value = "50")]
    linger_ms: u64,
    /// Retries of a transient publish failure before dead-lettering.
    #[arg(long, default_value = "5")]
    max_retries: u32,
    #[arg(long, default_value = "50")]
    initial_backoff_ms: u64,
    #[arg(long, default_value = "5000")]
    max_backoff_ms: u64,
    /// Time allowed for shutdown after ctrl-c.
    #[arg(long, default_value = "5000")]
    shutdown_timeout_ms: u64,
    /// Part of the shutdown timeout reserved to flush and dead-letter.
    #[arg(long, default_value = "500")]
    shutdown_grace_ms: u64,
    /// Maximum size of a device message, in bytes.
    #[arg(long, default_value_t = geobridge_ws::DEFAULT_MAX_MESSAGE_SIZE)]
    max_message_size: usize,
}

impl ServeArgs {
    pub async fn run(self, ct: CancellationToken) -> Result<()> {
        let address = self
            .address
            .parse::<SocketAddr>()
            .context(InvalidServerUrlSnafu {})?;

        let options = self.bridge_options()?;
        let (broker, dead_letter) = self.broker_clients()?;

        let listener = geobridge_ws::bind(address).await.context(ServerSnafu {})?;
        let bridge = Bridge::start(options, broker, dead_letter).context(InvalidOptionsSnafu {})?;

        info!(
            %address,
            broker = ?self.broker,
            topic = %self.topic,
            "accepting devices"
        );

        let router = WsIngestor::new(bridge.handle())
            .with_max_message_size(self.max_message_size)
            .into_router();

        let server_ct = CancellationToken::new();
        let mut server = tokio::spawn(geobridge_ws::serve(listener, router, server_ct.clone()));

        let server_result = tokio::select! {
            _ = ct.cancelled() => None,
            result = &mut server => Some(result),
        };

        // The server keeps answering 503 to new devices while the bridge drains.
        let report = bridge.shutdown(self.shutdown_timeout()).await;

        if report.publisher.is_none()
            || !report.sessions_completed
            || report.stats.records_abandoned > 0
        {
            warn!(
                elapsed_ms = report.elapsed.as_millis() as u64,
                abandoned = report.stats.records_abandoned,
                "bridge did not stop cleanly before the shutdown deadline"
            );
        }

        let server_result = match server_result {
            Some(result) => result,
            None => {
                server_ct.cancel();
                server.await
            }
        };

        match server_result.context(ServerTaskSnafu {})? {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(err = %err, "websocket server failed");
                Err(err).context(ServerSnafu {})
            }
        }
    }

    fn bridge_options(&self) -> Result<BridgeOptions> {
        let backpressure = match self.backpressure {
            BackpressureArg::FailOpen => BackpressurePolicy::FailOpen,
            BackpressureArg::FailClosed => BackpressurePolicy::FailClosed,
        };

        let options = BridgeOptions::default()
            .with_topic(self.topic.clone())
            .with_queue_capacity(self.queue_capacity)
            .with_enqueue_timeout(Duration::from_millis(self.enqueue_timeout_ms))
            .with_backpressure(backpressure)
            .with_batching(self.max_batch_size, Duration::from_millis(self.linger_ms))
            .with_retry(RetryOptions {
                max_retries: self.max_retries,
                initial_backoff: Duration::from_millis(self.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.max_backoff_ms),
                ..RetryOptions::default()
            })
            .with_shutdown_grace(Duration::from_millis(self.shutdown_grace_ms));

        options.validate().context(InvalidOptionsSnafu {})?;

        Ok(options)
    }

    fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    fn broker_clients(&self) -> Result<(Arc<dyn BrokerClient>, Arc<dyn DeadLetterSink>)> {
        match self.broker {
            BrokerKind::Log => {
                let broker: Arc<dyn BrokerClient> = Arc::new(LogBroker::new());
                let dead_letter: Arc<dyn DeadLetterSink> = Arc::new(LogDeadLetterSink);
                Ok((broker, dead_letter))
            }
            BrokerKind::Kafka => self.kafka_clients(),
        }
    }

    #[cfg(feature = "kafka")]
    fn kafka_clients(&self) -> Result<(Arc<dyn BrokerClient>, Arc<dyn DeadLetterSink>)> {
        let (broker, dead_letter) =
            crate::kafka::clients(&self.kafka_brokers, &self.dead_letter_topic, &self.topic)?;
        let broker: Arc<dyn BrokerClient> = broker;
        let dead_letter: Arc<dyn DeadLetterSink> = dead_letter;
        Ok((broker, dead_letter))
    }

    #[cfg(not(feature = "kafka"))]
    fn kafka_clients(&self) -> Result<(Arc<dyn BrokerClient>, Arc<dyn DeadLetterSink>)> {
        crate::error::BrokerUnavailableSnafu { broker: "kafka" }.fail()
    }
}
