//! Message bus seam
//!
//! The cluster layer only needs point-to-point send and broadcast of
//! encoded frames. Delivery is unordered and may duplicate; a send to an
//! unreachable member is silently lost, exactly like a frame dropped on
//! the wire.
//!
//! [`MemoryNetwork`] connects nodes inside one process and is what the
//! tests run on.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use replikv_common::{Error, InstanceId, Result};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Outbound side of the message bus
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a frame to one member
    async fn send(&self, target: &InstanceId, frame: Bytes) -> Result<()>;

    /// Send a frame to every member except the local one
    async fn broadcast(&self, frame: Bytes) -> Result<()>;
}

/// Inbound side: receives every frame addressed to the local member
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_receive(&self, sender: InstanceId, frame: Bytes);
}

type Inbox = mpsc::UnboundedSender<(InstanceId, Bytes)>;

struct Link {
    inbox: Inbox,
    connected: bool,
}

/// In-process network joining any number of members
#[derive(Default)]
pub struct MemoryNetwork {
    links: RwLock<HashMap<InstanceId, Link>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Outbound endpoint for `local`
    pub fn endpoint(self: &Arc<Self>, local: impl Into<InstanceId>) -> MemoryTransport {
        MemoryTransport {
            network: Arc::clone(self),
            local: local.into(),
        }
    }

    /// Join `id` to the network and deliver its frames to `handler`.
    ///
    /// Frames are handled one at a time in arrival order. The receive loop
    /// ends when the handler is dropped. Must be called inside a tokio
    /// runtime.
    pub fn attach(&self, id: impl Into<InstanceId>, handler: Weak<dyn InboundHandler>) {
        let id = id.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<(InstanceId, Bytes)>();
        self.links.write().insert(
            id.clone(),
            Link {
                inbox: tx,
                connected: true,
            },
        );

        tokio::spawn(async move {
            while let Some((sender, frame)) = rx.recv().await {
                let Some(handler) = handler.upgrade() else {
                    break;
                };
                handler.on_receive(sender, frame).await;
            }
            debug!(member = %id, "receive loop stopped");
        });
    }

    /// Remove `id` from the network; its receive loop drains and stops
    pub fn detach(&self, id: &InstanceId) {
        self.links.write().remove(id);
    }

    /// Cut `id` off: frames to or from it are lost until reconnected
    pub fn disconnect(&self, id: &InstanceId) {
        self.set_connected(id, false);
    }

    pub fn reconnect(&self, id: &InstanceId) {
        self.set_connected(id, true);
    }

    fn set_connected(&self, id: &InstanceId, connected: bool) {
        if let Some(link) = self.links.write().get_mut(id) {
            link.connected = connected;
        }
    }

    /// Members currently attached
    pub fn members(&self) -> Vec<InstanceId> {
        let mut members: Vec<_> = self.links.read().keys().cloned().collect();
        members.sort();
        members
    }

    fn is_connected(&self, id: &InstanceId) -> bool {
        self.links.read().get(id).is_some_and(|l| l.connected)
    }

    fn deliver(&self, from: &InstanceId, to: &InstanceId, frame: Bytes) -> Result<()> {
        let links = self.links.read();
        let Some(link) = links.get(to) else {
            return Err(Error::transport(format!("unknown member {to}")));
        };
        if !link.connected || !connected_in(&links, from) {
            trace!(%from, %to, "frame lost: member disconnected");
            return Ok(());
        }
        if link.inbox.send((from.clone(), frame)).is_err() {
            trace!(%from, %to, "frame lost: receive loop stopped");
        }
        Ok(())
    }
}

/// Senders that never attached count as connected
fn connected_in(links: &HashMap<InstanceId, Link>, id: &InstanceId) -> bool {
    links.get(id).is_none_or(|l| l.connected)
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("members", &self.members())
            .finish()
    }
}

/// One member's outbound handle on a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local: InstanceId,
}

impl MemoryTransport {
    pub fn local(&self) -> &InstanceId {
        &self.local
    }

    pub fn is_connected(&self) -> bool {
        self.network.is_connected(&self.local)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, target: &InstanceId, frame: Bytes) -> Result<()> {
        self.network.deliver(&self.local, target, frame)
    }

    async fn broadcast(&self, frame: Bytes) -> Result<()> {
        for member in self.network.members() {
            if member != self.local {
                self.network.deliver(&self.local, &member, frame.clone())?;
            }
        }
        Ok(())
    }
}
