//! UDP driver — the socket-owning reactor task.
//!
//! Exactly one task touches the socket. Inbound datagrams pass the loss
//! model, are decoded, and land on the event queue; outbound packets arrive
//! over an mpsc channel and are written with send_to. Engine handlers never
//! block on the network: they emit through a cheap cloneable `PacketSink`
//! and the driver does the rest. The driver exits once every sink is gone.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;

use rft_core::wire::{Packet, WireError, MAX_PACKET_SIZE};

use crate::event::Event;
use crate::loss::GilbertLoss;
use crate::queue::EventQueue;

/// Outbound channel depth. The driver drains quickly; a sustained backlog
/// means the link is saturated and dropping is the honest outcome.
const OUTBOUND_DEPTH: usize = 256;

/// Socket buffer request, large enough for a full window burst.
const SOCKET_BUFFER: usize = 1 << 20;

/// Handle engines use to emit packets. Sends are fire-and-forget.
#[derive(Clone)]
pub struct PacketSink {
    tx: mpsc::Sender<(Bytes, SocketAddr)>,
}

impl PacketSink {
    pub fn send(&self, packet: &Packet, to: SocketAddr) {
        if self.tx.try_send((packet.encode(), to)).is_err() {
            tracing::warn!(tag = packet.tag(), %to, "outbound channel full, dropping packet");
        }
    }
}

pub struct UdpDriver {
    socket: UdpSocket,
    queue: Arc<EventQueue>,
    outbound: mpsc::Receiver<(Bytes, SocketAddr)>,
    loss: GilbertLoss,
    abort: Arc<AtomicBool>,
}

impl UdpDriver {
    /// Bind the socket and produce the driver plus the sink engines write to.
    pub async fn bind(
        addr: SocketAddr,
        queue: Arc<EventQueue>,
        loss: GilbertLoss,
        abort: Arc<AtomicBool>,
    ) -> Result<(Self, PacketSink)> {
        let socket = bind_socket(addr).with_context(|| format!("binding udp socket on {addr}"))?;
        let socket = UdpSocket::from_std(socket).context("registering socket with the runtime")?;
        let (tx, outbound) = mpsc::channel(OUTBOUND_DEPTH);
        Ok((
            Self {
                socket,
                queue,
                outbound,
                loss,
                abort,
            },
            PacketSink { tx },
        ))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("querying local address")
    }

    /// Run until every `PacketSink` clone is dropped.
    pub async fn run(mut self) -> Result<()> {
        // One extra byte so an oversized datagram is detectable instead of
        // silently truncated by recv_from.
        let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
        loop {
            tokio::select! {
                outgoing = self.outbound.recv() => {
                    match outgoing {
                        Some((bytes, to)) => {
                            if let Err(error) = self.socket.send_to(&bytes, to).await {
                                tracing::warn!(%error, %to, "send_to failed");
                            }
                        }
                        None => {
                            tracing::debug!("all packet sinks dropped, driver exiting");
                            return Ok(());
                        }
                    }
                }

                incoming = self.socket.recv_from(&mut buf) => {
                    let (len, remote) = match incoming {
                        Ok(r) => r,
                        Err(error) => {
                            tracing::warn!(%error, "recv_from failed");
                            continue;
                        }
                    };
                    if self.abort.load(Ordering::Relaxed) {
                        // Shutting down: inbound traffic is no longer accepted.
                        continue;
                    }
                    if self.loss.should_drop() {
                        tracing::trace!(len, %remote, "datagram dropped by loss model");
                        continue;
                    }
                    if len > MAX_PACKET_SIZE {
                        tracing::warn!(len, %remote, "rejecting oversized datagram");
                        continue;
                    }
                    match Packet::decode(&buf[..len]) {
                        Ok(packet) => {
                            self.queue.push(Event::Packet {
                                packet,
                                remote,
                                received_at: Instant::now(),
                            });
                        }
                        Err(WireError::UnknownTag(tag)) => {
                            tracing::trace!(tag, %remote, "ignoring unknown packet tag");
                        }
                        Err(error) => {
                            tracing::debug!(%error, %remote, "discarding malformed datagram");
                        }
                    }
                }
            }
        }
    }
}

/// Plain std socket with enlarged buffers, left nonblocking for tokio.
fn bind_socket(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    let _ = socket.set_recv_buffer_size(SOCKET_BUFFER);
    let _ = socket.set_send_buffer_size(SOCKET_BUFFER);
    socket.bind(&addr.into())?;
    Ok(socket.into())
}
