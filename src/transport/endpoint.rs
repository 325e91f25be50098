//! # Receive Loops
//!
//! Long-running tasks that read raw packets from a transport and feed them to a
//! [`Messenger`]:
//!
//! - [`run_tcp_loop`] reads length-prefixed frames from a stream.
//! - [`run_udp_loop`] reads one packet per datagram from a bound socket.
//!
//! Both loops stop cooperatively: the owner clears the `active` flag and signals the
//! shutdown channel, which abandons a pending read at once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio_util::codec::FramedRead;
use tracing::{debug, trace, warn};

use crate::config::MAX_DATAGRAM_SIZE;
use crate::core::codec::FrameCodec;
use crate::protocol::messenger::Messenger;
use crate::transport::recipient::Recipient;

/// Why a receive loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The owner stopped the loop
    Shutdown,
    /// The remote side closed the stream
    Closed,
    /// A read failed or a frame was rejected
    Failed,
}

/// Read frames from `reader` until the stream closes or the loop is stopped.
///
/// Each complete frame is handed to `messenger` with `sender` as its origin. A frame
/// split across any number of reads is reassembled before dispatch.
pub async fn run_tcp_loop<R>(
    reader: R,
    codec: FrameCodec,
    messenger: Messenger,
    sender: Recipient,
    active: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) -> LoopExit
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, codec);
    loop {
        if !active.load(Ordering::SeqCst) || *shutdown.borrow() {
            return LoopExit::Shutdown;
        }

        tokio::select! {
            _ = shutdown.changed() => return LoopExit::Shutdown,
            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    messenger.handle(frame.freeze(), &sender).await;
                }
                Some(Err(e)) => {
                    if e.is_protocol_violation() {
                        warn!(peer = %sender, error = %e, "Rejected frame, closing connection");
                    } else {
                        debug!(peer = %sender, error = %e, "TCP read failed");
                    }
                    return LoopExit::Failed;
                }
                None => {
                    debug!(peer = %sender, "Connection closed by remote");
                    return LoopExit::Closed;
                }
            },
        }
    }
}

/// Read datagrams from `socket` until the loop is stopped.
///
/// Empty datagrams are skipped. Replies go back to the datagram's source address on
/// the same socket.
pub async fn run_udp_loop(
    socket: Arc<UdpSocket>,
    messenger: Messenger,
    active: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) -> LoopExit {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        if !active.load(Ordering::SeqCst) || *shutdown.borrow() {
            return LoopExit::Shutdown;
        }

        let received: std::io::Result<(usize, SocketAddr)> = tokio::select! {
            _ = shutdown.changed() => return LoopExit::Shutdown,
            received = socket.recv_from(&mut buf) => received,
        };

        match received {
            Ok((0, from)) => trace!(%from, "Ignoring empty datagram"),
            Ok((len, from)) => {
                let sender = Recipient::datagram(socket.clone(), from);
                messenger
                    .handle(Bytes::copy_from_slice(&buf[..len]), &sender)
                    .await;
            }
            // ICMP port unreachable surfaces here on some platforms; the socket stays usable
            Err(e) => debug!(error = %e, "UDP receive failed"),
        }
    }
}
