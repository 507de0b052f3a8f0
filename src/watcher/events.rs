// src/watcher/events.rs

//! Message types flowing between the coordinator loop, the connection IO
//! tasks, and the admin listener.
//!
//! All mutable state lives in the coordinator; IO tasks only report what
//! happened on the wire. Every event carries the link generation observed at
//! spawn time, and the coordinator drops events whose generation no longer
//! matches — a reply can never be delivered into an instance whose link was
//! recycled or released in the meantime.

use crate::core::RespValue;
use crate::core::protocol::RespFrame;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

/// Identifies one shared connection link inside the `LinkSet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

/// Which logical instance a command was issued on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Primary,
    /// Replica addr key under the named primary.
    Replica(String),
    /// Peer watcher run id under the named primary.
    Peer(String),
}

/// Why a command was sent; drives reply routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Ping,
    Info,
    Hello,
    AskDown,
    Promote,
    Reconfigure,
}

/// Context attached to every outbound command and echoed back with its reply.
#[derive(Debug, Clone)]
pub struct CommandCtx {
    pub primary: String,
    pub target: Target,
    pub kind: CommandKind,
}

/// One outbound command handed to a command-channel IO task.
#[derive(Debug)]
pub struct LinkRequest {
    pub frame: RespFrame,
    pub ctx: CommandCtx,
}

/// Everything the IO tasks can report back to the coordinator.
#[derive(Debug)]
pub enum Event {
    /// Command channel finished connecting (and authenticating).
    CmdUp { link: LinkId, generation: u64 },
    /// Command channel failed to connect or died.
    CmdDown {
        link: LinkId,
        generation: u64,
        reason: String,
    },
    /// A reply arrived for the oldest in-flight command on the link.
    Reply {
        link: LinkId,
        generation: u64,
        ctx: CommandCtx,
        frame: RespFrame,
    },
    /// Pub/sub channel subscribed successfully.
    PubsubUp { link: LinkId, generation: u64 },
    /// Pub/sub channel failed or closed.
    PubsubDown {
        link: LinkId,
        generation: u64,
        reason: String,
    },
    /// A message was received on the hello channel.
    PubsubMessage {
        link: LinkId,
        generation: u64,
        payload: Bytes,
    },
}

/// An admin command forwarded from the listener, answered over a oneshot.
#[derive(Debug)]
pub struct AdminRequest {
    pub args: Vec<RespFrame>,
    pub reply: oneshot::Sender<RespValue>,
}

pub type EventSender = mpsc::Sender<Event>;
pub type EventReceiver = mpsc::Receiver<Event>;
pub type AdminSender = mpsc::Sender<AdminRequest>;
pub type AdminReceiver = mpsc::Receiver<AdminRequest>;
