// src/watcher/conn.rs

//! The connection IO tasks behind each `Link`: one for the command channel,
//! one for the pub/sub channel. Both are thin collaborators — they connect,
//! optionally authenticate, and shuttle frames; every decision about what the
//! traffic means is made by the coordinator when it drains its event inbox.

use super::events::{CommandCtx, Event, EventSender, LinkId, LinkRequest};
use crate::core::protocol::{RespFrame, RespFrameCodec};
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const AUTH_TIMEOUT: Duration = Duration::from_secs(2);

type RespStream = Framed<TcpStream, RespFrameCodec>;

async fn open(target: &str, auth: &Option<String>) -> Result<RespStream, String> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(target))
        .await
        .map_err(|_| "connect timeout".to_string())?
        .map_err(|e| e.to_string())?;
    let mut framed = Framed::new(stream, RespFrameCodec);

    if let Some(pass) = auth {
        let cmd = RespFrame::command(["AUTH".to_string(), pass.clone()]);
        framed.send(cmd).await.map_err(|e| e.to_string())?;
        // Read one reply so the stream stays in lockstep; a wrong-password
        // error will surface as ping failures soon enough.
        match timeout(AUTH_TIMEOUT, framed.next()).await {
            Ok(Some(Ok(RespFrame::Error(e)))) => debug!("AUTH to {target} refused: {e}"),
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => return Err(e.to_string()),
            Ok(None) => return Err("connection closed during AUTH".to_string()),
            Err(_) => return Err("AUTH timeout".to_string()),
        }
    }
    Ok(framed)
}

/// Runs the command channel of a link. Commands arrive over `rx` and replies
/// are matched to them in FIFO order, as RESP guarantees ordered replies.
/// The task exits when the coordinator drops the sender or the socket dies.
pub async fn run_command_conn(
    target: String,
    link: LinkId,
    generation: u64,
    auth: Option<String>,
    events: EventSender,
    mut rx: mpsc::Receiver<LinkRequest>,
) {
    let mut framed = match open(&target, &auth).await {
        Ok(f) => f,
        Err(reason) => {
            let _ = events
                .send(Event::CmdDown {
                    link,
                    generation,
                    reason,
                })
                .await;
            return;
        }
    };

    if events.send(Event::CmdUp { link, generation }).await.is_err() {
        return;
    }

    let mut inflight: VecDeque<CommandCtx> = VecDeque::new();
    loop {
        tokio::select! {
            req = rx.recv() => {
                let Some(req) = req else {
                    // Link released or force-disconnected; tear down quietly.
                    return;
                };
                if let Err(e) = framed.send(req.frame).await {
                    let _ = events.send(Event::CmdDown { link, generation, reason: e.to_string() }).await;
                    return;
                }
                inflight.push_back(req.ctx);
            }
            frame = framed.next() => {
                match frame {
                    Some(Ok(frame)) => {
                        let Some(ctx) = inflight.pop_front() else {
                            debug!("unsolicited frame from {target} dropped");
                            continue;
                        };
                        if events.send(Event::Reply { link, generation, ctx, frame }).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = events.send(Event::CmdDown { link, generation, reason: e.to_string() }).await;
                        return;
                    }
                    None => {
                        let _ = events.send(Event::CmdDown { link, generation, reason: "connection closed by peer".into() }).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Runs the pub/sub channel of a link: subscribes to the hello channel and
/// forwards every message. Closed by dropping the shutdown sender.
pub async fn run_pubsub_conn(
    target: String,
    link: LinkId,
    generation: u64,
    auth: Option<String>,
    channel: String,
    events: EventSender,
    mut shutdown: mpsc::Receiver<()>,
) {
    let mut framed = match open(&target, &auth).await {
        Ok(f) => f,
        Err(reason) => {
            let _ = events
                .send(Event::PubsubDown {
                    link,
                    generation,
                    reason,
                })
                .await;
            return;
        }
    };

    let subscribe = RespFrame::command(["SUBSCRIBE".to_string(), channel]);
    if let Err(e) = framed.send(subscribe).await {
        let _ = events
            .send(Event::PubsubDown {
                link,
                generation,
                reason: e.to_string(),
            })
            .await;
        return;
    }

    if events
        .send(Event::PubsubUp { link, generation })
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            frame = framed.next() => {
                match frame {
                    Some(Ok(RespFrame::Array(parts))) if parts.len() == 3 => {
                        // [b"message", channel, payload]; subscribe acks share
                        // the shape but carry an integer third element.
                        if let (
                            Some(RespFrame::BulkString(kind)),
                            Some(RespFrame::BulkString(payload)),
                        ) = (parts.first(), parts.get(2))
                            && kind.eq_ignore_ascii_case(b"message")
                        {
                            let payload = payload.clone();
                            if events
                                .send(Event::PubsubMessage { link, generation, payload })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events.send(Event::PubsubDown { link, generation, reason: e.to_string() }).await;
                        return;
                    }
                    None => {
                        let _ = events.send(Event::PubsubDown { link, generation, reason: "connection closed by peer".into() }).await;
                        return;
                    }
                }
            }
        }
    }
}
