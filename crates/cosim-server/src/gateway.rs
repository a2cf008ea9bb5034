//! One-shot gateway: ask a running server for one EWMA step, then stop it.

use std::time::{Duration, Instant};

use cosim_config::ClientConfig;
use cosim_net::{
    FramingConfig, Message, MessageType, Payload, ReliableClient, TERMINATE_TOKEN, TcpConnector,
};

use crate::error::AppError;
use crate::ewma::EWMA_FUNCTION;

/// Arguments of the demonstration call: `prev, current, beta, iter`.
pub const DEMO_ARGS: [f64; 4] = [0.0, 4.32, 0.99, 1.0];

/// Outcome of [`run_gateway`].
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayReport {
    /// `[ma, bias_corrected]` returned by the server.
    pub ewma: Vec<f64>,
    /// Wall time of the function call round trip.
    pub elapsed: Duration,
}

/// Call [`EWMA_FUNCTION`] with [`DEMO_ARGS`] on the configured server, then
/// send the terminate sentinel so the server exits.
pub async fn run_gateway(config: &ClientConfig) -> Result<GatewayReport, AppError> {
    let connector = TcpConnector::new(config.address()).with_framing(FramingConfig {
        max_frame_len: config.max_frame_size,
    });
    let mut client = ReliableClient::new(connector, crate::client_policy(config)?);

    let started = Instant::now();
    let reply = client.call(&Message::call(EWMA_FUNCTION, DEMO_ARGS)).await?;
    let elapsed = started.elapsed();
    let ewma = numeric_reply(reply, MessageType::FunctionReply)?;
    tracing::info!(?ewma, elapsed_ms = elapsed.as_secs_f64() * 1e3, "ewma reply");

    let ack = client
        .call(&Message::text(MessageType::Shutdown, TERMINATE_TOKEN))
        .await?;
    if let Some(reason) = ack.remote_error() {
        return Err(AppError::Remote(reason.to_string()));
    }
    tracing::info!("server asked to terminate");
    client.disconnect();

    Ok(GatewayReport { ewma, elapsed })
}

fn numeric_reply(reply: Message, expected: MessageType) -> Result<Vec<f64>, AppError> {
    if let Some(reason) = reply.remote_error() {
        return Err(AppError::Remote(reason.to_string()));
    }
    let shape = reply.payload.shape();
    match (reply.kind, reply.payload) {
        (kind, Payload::Numeric(values)) if kind == expected => Ok(values),
        (kind, _) => Err(AppError::UnexpectedReply { kind, shape }),
    }
}
