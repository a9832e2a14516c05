// src/link.rs

//! The Link Manager: one duplex TCP connection per peer, driven by a
//! non-blocking read/write loop over a growing parse buffer. Mirrors the
//! host store's connection-handling idiom (buffered reads, framed codec,
//! teardown-on-error) applied to the cluster bus instead of client RESP.

use crate::errors::ClusterError;
use crate::wire::{ClusterBusCodec, ClusterFrame};
use bytes::BytesMut;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Starting size of a link's inbound parse buffer.
pub const INITIAL_BUFFER_CAPACITY: usize = 1024;
/// Buffer capacity doubles on every growth until this ceiling, after which it
/// grows linearly — guards against an unbounded doubling runaway on a
/// pathological peer.
pub const BUFFER_DOUBLING_CEILING: usize = 1024 * 1024;
/// Linear growth increment once past the doubling ceiling.
const LINEAR_GROWTH_STEP: usize = 256 * 1024;

/// Any duplex byte stream the link manager can frame a cluster bus over;
/// generic so a TLS-wrapped stream slots in without the link manager caring.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Grows a buffer's capacity following the doubling-then-linear policy,
/// called whenever a `Decoder` reports it needs more room than is currently
/// reserved.
pub fn grow_buffer(buf: &mut BytesMut, needed_additional: usize) {
    let current_cap = buf.capacity();
    let target = if current_cap < BUFFER_DOUBLING_CEILING {
        (current_cap * 2).max(current_cap + needed_additional)
    } else {
        current_cap + LINEAR_GROWTH_STEP.max(needed_additional)
    };
    let extra = target.saturating_sub(buf.capacity());
    if extra > 0 {
        buf.reserve(extra);
    }
}

/// Handle to an established peer link: identity once resolved, and a channel
/// to queue outbound frames without blocking the caller on the socket.
pub struct Link {
    pub peer_id: Option<String>,
    pub outbound: mpsc::UnboundedSender<ClusterFrame>,
}

/// Owns the set of active links, keyed by peer node id once identity is
/// resolved. Links still in the handshake phase (peer id unknown) are not
/// tracked here; the caller holds them until the first MEET/PING/PONG names
/// the peer.
#[derive(Default)]
pub struct LinkTable {
    links: DashMap<String, Link>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer_id: String, link: Link) {
        self.links.insert(peer_id, link);
    }

    pub fn remove(&self, peer_id: &str) {
        self.links.remove(peer_id);
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.links.contains_key(peer_id)
    }

    /// Queues `frame` for delivery to `peer_id`; silently drops if no link is
    /// currently established (the cron loop will reconnect and the next
    /// gossip tick will retry).
    pub fn send(&self, peer_id: &str, frame: ClusterFrame) {
        if let Some(link) = self.links.get(peer_id) {
            let _ = link.outbound.send(frame);
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Drives one established connection: reads frames off the wire and forwards
/// them to `inbound`, while draining `outbound_rx` onto the socket. Returns
/// when the connection is torn down, either by I/O error or channel closure.
pub async fn run_link<T: Transport>(
    stream: T,
    mut outbound_rx: mpsc::UnboundedReceiver<ClusterFrame>,
    inbound: mpsc::UnboundedSender<ClusterFrame>,
    peer_label: String,
) {
    let mut framed = Framed::with_capacity(stream, ClusterBusCodec, INITIAL_BUFFER_CAPACITY);

    loop {
        tokio::select! {
            maybe_frame = framed.next() => {
                match maybe_frame {
                    Some(Ok(frame)) => {
                        if inbound.send(frame).is_err() {
                            debug!(peer = %peer_label, "inbound channel closed, tearing down link");
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(peer = %peer_label, error = %err, "cluster bus protocol error, tearing down link");
                        break;
                    }
                    None => {
                        debug!(peer = %peer_label, "peer closed cluster bus connection");
                        break;
                    }
                }
            }
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        if let Err(err) = framed.send(frame).await {
                            warn!(peer = %peer_label, error = %err, "write failed, tearing down link");
                            break;
                        }
                    }
                    None => {
                        debug!(peer = %peer_label, "outbound channel closed, tearing down link");
                        break;
                    }
                }
            }
        }
    }
}

/// Dials a peer's cluster-bus address, spawning the link-driving task once
/// connected. Returns the sender half so the caller can start queuing frames
/// immediately; actual delivery begins once the handshake completes.
pub async fn connect(
    bus_addr: &str,
    inbound: mpsc::UnboundedSender<ClusterFrame>,
) -> Result<mpsc::UnboundedSender<ClusterFrame>, ClusterError> {
    let stream = TcpStream::connect(bus_addr).await?;
    let (tx, rx) = mpsc::unbounded_channel();
    let label = bus_addr.to_string();
    tokio::spawn(run_link(stream, rx, inbound, label));
    Ok(tx)
}

/// Wraps an inbound TCP connection accepted by the bus listener the same way
/// `connect` wraps an outbound one; identity is unknown until the first
/// frame arrives.
pub fn accept(stream: TcpStream, inbound: mpsc::UnboundedSender<ClusterFrame>) -> mpsc::UnboundedSender<ClusterFrame> {
    let (tx, rx) = mpsc::unbounded_channel();
    let label = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    tokio::spawn(run_link(stream, rx, inbound, label));
    tx
}

#[allow(dead_code)]
fn _link_table_is_send_sync(_: Arc<LinkTable>) {}
