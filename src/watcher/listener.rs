// src/watcher/listener.rs

//! The admin TCP listener. Accepts RESP clients, forwards each command to
//! the coordinator over the admin channel, and writes the reply back. The
//! listener holds no watcher state of its own.

use super::events::{AdminRequest, AdminSender};
use crate::core::RespValue;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use anyhow::Context;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

pub async fn run(bind: &str, admin: AdminSender) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind admin listener on {bind}"))?;
    info!("admin listener on {bind}");
    serve(listener, admin).await
}

/// Accept loop over an already-bound listener.
pub async fn serve(listener: TcpListener, admin: AdminSender) -> anyhow::Result<()> {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                debug!("admin client connected from {peer}");
                let admin = admin.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_client(socket, admin).await {
                        debug!("admin client {peer} gone: {e:#}");
                    }
                });
            }
            Err(e) => {
                warn!("accept failed: {e}");
            }
        }
    }
}

async fn serve_client(socket: TcpStream, admin: AdminSender) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, RespFrameCodec);

    while let Some(frame) = framed.next().await {
        let frame = frame.context("protocol error")?;
        let args = match frame {
            RespFrame::Array(items) => items,
            // A lone inline-ish frame is treated as a one-word command.
            other @ (RespFrame::BulkString(_) | RespFrame::SimpleString(_)) => vec![other],
            _ => {
                framed
                    .send(RespFrame::Error(
                        "ERR Protocol error: expected a command array".into(),
                    ))
                    .await?;
                continue;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = AdminRequest {
            args,
            reply: reply_tx,
        };
        if admin.send(request).await.is_err() {
            anyhow::bail!("coordinator is gone");
        }
        let reply = reply_rx
            .await
            .unwrap_or_else(|_| RespValue::Error("ERR internal error".into()));
        framed.send(reply.into()).await?;
    }
    Ok(())
}
