use std::net::AddrParseError;

use geobridge_core::BridgeError;
use geobridge_observability::ObservabilityError;
use geobridge_ws::WsServerError;
use snafu::Snafu;

/// CLI error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CliError {
    #[snafu(display("Invalid {name} argument: {message}"))]
    InvalidArgument { name: &'static str, message: String },
    #[snafu(display("Invalid server address"))]
    InvalidServerUrl { source: AddrParseError },
    #[snafu(display("Invalid bridge options"))]
    InvalidOptions { source: BridgeError },
    #[snafu(display("Failed to initialize observability"))]
    Observability { source: ObservabilityError },
    #[snafu(display("WebSocket server error"))]
    Server { source: WsServerError },
    #[snafu(display("WebSocket server task failed"))]
    ServerTask { source: tokio::task::JoinError },
    #[snafu(display("Broker {broker} is not available in this build"))]
    BrokerUnavailable { broker: &'static str },
    #[cfg(feature = "kafka")]
    #[snafu(display("Failed to create Kafka client"))]
    KafkaClient {
        source: rdkafka::error::KafkaError,
    },
    #[snafu(display("Failed to connect to {url}"))]
    Connect {
        url: String,
        source: tokio_tungstenite::tungstenite::Error,
    },
}

pub type Result<T, E = CliError> = std::result::Result<T, E>;
