use snafu::Snafu;

/// Bridge error types.
///
/// These are the errors returned to the code driving the bridge. Errors
/// caused by a single device or a single record never surface here.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum BridgeError {
    /// Invalid options.
    ///
    /// Returned by [`Bridge::start`](crate::Bridge::start) when the options
    /// fail validation.
    #[snafu(display("invalid options: {message}"))]
    InvalidOptions { message: String },
    /// The bridge is shutting down and does not accept new connections.
    #[snafu(display("bridge is shutting down"))]
    ShuttingDown,
    /// The supervisor task is gone.
    #[snafu(display("supervisor channel closed"))]
    SupervisorGone,
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
