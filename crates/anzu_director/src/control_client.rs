//! REQ-side client for the control API, used by the CLI subcommands.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use zeromq::{Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::control::{ControlEnvelope, ControlRequest, ControlResponse};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ControlClient {
    socket: zeromq::ReqSocket,
    token: Option<String>,
}

impl ControlClient {
    /// Connect to a running daemon's control socket.
    pub async fn connect(addr: &str, token: Option<String>) -> Result<Self> {
        let mut socket = zeromq::ReqSocket::new();
        socket
            .connect(addr)
            .await
            .with_context(|| format!("connecting to control socket {}", addr))?;
        Ok(ControlClient { socket, token })
    }

    /// Send one request and wait for the reply.
    pub async fn request(&mut self, request: ControlRequest) -> Result<ControlResponse> {
        let envelope = ControlEnvelope {
            token: self.token.clone(),
            request,
        };
        let body = serde_json::to_vec(&envelope)?;
        self.socket.send(ZmqMessage::from(body)).await?;

        let reply = tokio::time::timeout(REQUEST_TIMEOUT, self.socket.recv())
            .await
            .map_err(|_| anyhow!("control request timed out (is the daemon running?)"))??;

        let frames: Vec<Vec<u8>> = reply.into_vec().into_iter().map(|b| b.to_vec()).collect();
        let frame = frames
            .first()
            .ok_or_else(|| anyhow!("empty control reply"))?;
        let response = serde_json::from_slice(frame).context("unparseable control reply")?;
        Ok(response)
    }
}
