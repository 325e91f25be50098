//! # Recipient
//!
//! A destination for outbound bytes: either a framed stream connection or a UDP
//! socket paired with a remote endpoint.
//!
//! Stream sends go through a per-connection async mutex around the `FramedWrite`, so
//! concurrent senders never interleave partial frames. Datagram sends are independent.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tracing::trace;

use crate::core::codec::FrameCodec;
use crate::error::Result;

/// Write half of any stream transport
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

type SharedSink = Arc<Mutex<FramedWrite<BoxedWriter, FrameCodec>>>;

#[derive(Clone)]
pub struct StreamRecipient {
    sink: SharedSink,
    peer_addr: Option<SocketAddr>,
}

impl StreamRecipient {
    pub fn new<W>(writer: W, codec: FrameCodec, peer_addr: Option<SocketAddr>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: BoxedWriter = Box::new(writer);
        Self {
            sink: Arc::new(Mutex::new(FramedWrite::new(writer, codec))),
            peer_addr,
        }
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(data).await
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            trace!(error = %e, "Stream already closed");
        }
    }

    fn same_connection(&self, other: &StreamRecipient) -> bool {
        Arc::ptr_eq(&self.sink, &other.sink)
    }
}

#[derive(Clone)]
pub struct DatagramRecipient {
    socket: Arc<UdpSocket>,
    endpoint: SocketAddr,
}

impl DatagramRecipient {
    pub fn new(socket: Arc<UdpSocket>, endpoint: SocketAddr) -> Self {
        Self { socket, endpoint }
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        self.socket.send_to(&data, self.endpoint).await?;
        Ok(())
    }
}

/// Where a message goes, or where it came from.
#[derive(Clone)]
pub enum Recipient {
    Stream(StreamRecipient),
    Datagram(DatagramRecipient),
}

impl Recipient {
    /// Framed stream over any async writer
    pub fn stream<W>(writer: W, codec: FrameCodec, peer_addr: Option<SocketAddr>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Recipient::Stream(StreamRecipient::new(writer, codec, peer_addr))
    }

    pub fn datagram(socket: Arc<UdpSocket>, endpoint: SocketAddr) -> Self {
        Recipient::Datagram(DatagramRecipient::new(socket, endpoint))
    }

    /// Transmit one packet. Streams add the length prefix, datagrams do not.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        match self {
            Recipient::Stream(stream) => stream.send(data).await,
            Recipient::Datagram(datagram) => datagram.send(data).await,
        }
    }

    /// Flush and shut down a stream. No-op for datagrams.
    pub async fn close(&self) {
        if let Recipient::Stream(stream) = self {
            stream.close().await;
        }
    }

    /// Remote address, when known
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Recipient::Stream(stream) => stream.peer_addr,
            Recipient::Datagram(datagram) => Some(datagram.endpoint),
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Recipient::Stream(_))
    }

    /// Whether both point at the same connection or endpoint
    pub fn same_destination(&self, other: &Recipient) -> bool {
        match (self, other) {
            (Recipient::Stream(a), Recipient::Stream(b)) => a.same_connection(b),
            (Recipient::Datagram(a), Recipient::Datagram(b)) => {
                a.endpoint == b.endpoint && Arc::ptr_eq(&a.socket, &b.socket)
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Stream(stream) => f
                .debug_struct("Stream")
                .field("peer_addr", &stream.peer_addr)
                .finish(),
            Recipient::Datagram(datagram) => f
                .debug_struct("Datagram")
                .field("endpoint", &datagram.endpoint)
                .finish(),
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Stream(stream) => match stream.peer_addr {
                Some(addr) => write!(f, "tcp://{addr}"),
                None => f.write_str("stream"),
            },
            Recipient::Datagram(datagram) => write!(f, "udp://{}", datagram.endpoint),
        }
    }
}
