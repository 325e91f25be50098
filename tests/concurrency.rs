//! Concurrent use of shared recipients and messengers
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use hybrid_net::core::codec::FrameCodec;
use hybrid_net::core::packet::Packet;
use hybrid_net::core::serialization::{DataBuilder, DataReader};
use hybrid_net::error::Result;
use hybrid_net::protocol::message::{NetMessage, ObjectSerializer};
use hybrid_net::protocol::{Dispatch, MessageType, MessageTypeRegistry, Messenger};
use hybrid_net::transport::Recipient;
use tokio::task::JoinSet;
use tokio_util::codec::FramedRead;

const TASKS: u32 = 16;
const PER_TASK: u32 = 50;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_stream_writes_do_not_interleave() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let recipient = Recipient::stream(client, FrameCodec::new(4096), None);

    let reader = tokio::spawn(async move {
        let mut frames = FramedRead::new(server, FrameCodec::new(4096));
        let mut seen = HashSet::new();
        while let Some(frame) = frames.next().await {
            let packet = Packet::from_bytes(&frame.unwrap()).unwrap();
            let mut reader = DataReader::new(&packet.payload);
            let task = reader.u32().unwrap();
            let seq = reader.u32().unwrap();
            // Padding identifies a torn frame
            let padding = reader.bytes(256).unwrap();
            assert!(padding.iter().all(|b| *b == task as u8));
            assert!(seen.insert((task, seq)));
            if seen.len() == (TASKS * PER_TASK) as usize {
                break;
            }
        }
        seen.len()
    });

    let mut writers = JoinSet::new();
    for task in 0..TASKS {
        let recipient = recipient.clone();
        writers.spawn(async move {
            for seq in 0..PER_TASK {
                let mut payload = DataBuilder::new();
                payload.u32(task).u32(seq).append(&[task as u8; 256]);
                let packet = Packet::new(task as i32, payload.freeze());
                recipient.send(packet.to_bytes()).await.unwrap();
            }
        });
    }
    while let Some(joined) = writers.join_next().await {
        joined.unwrap();
    }

    assert_eq!(reader.await.unwrap(), (TASKS * PER_TASK) as usize);
}

#[derive(Debug)]
struct Tick(u64);

impl NetMessage for Tick {}

struct TickSerializer;

impl ObjectSerializer<Tick> for TickSerializer {
    fn serialize(&self, object: &Tick, builder: &mut DataBuilder) -> Result<()> {
        builder.u64(object.0);
        Ok(())
    }

    fn deserialize(&self, reader: &mut DataReader<'_>) -> Result<Tick> {
        Ok(Tick(reader.u64()?))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_handle_calls() {
    let sum = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let (total, count) = (sum.clone(), calls.clone());

    let registry = Arc::new(MessageTypeRegistry::new());
    let id = registry
        .register(
            MessageType::new::<Tick>()
                .serializer(TickSerializer)
                .handler(move |tick: &Tick, _| {
                    total.fetch_add(tick.0 as usize, Ordering::SeqCst);
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .build(),
        )
        .unwrap();
    let messenger = Messenger::new(registry).unwrap();

    let (client, _server) = tokio::io::duplex(1024);
    let sender = Recipient::stream(client, FrameCodec::default(), None);

    let mut handlers = JoinSet::new();
    for task in 0..TASKS {
        let messenger = messenger.clone();
        let sender = sender.clone();
        handlers.spawn(async move {
            for n in 0..PER_TASK {
                let mut payload = DataBuilder::new();
                payload.u64(u64::from(task * PER_TASK + n));
                let data = Packet::new(id, payload.freeze()).to_bytes();
                assert_eq!(messenger.handle(data, &sender).await, Dispatch::Dispatched(id));
            }
        });
    }
    while let Some(joined) = handlers.join_next().await {
        joined.unwrap();
    }

    let n = (TASKS * PER_TASK) as usize;
    assert_eq!(calls.load(Ordering::SeqCst), n);
    assert_eq!(sum.load(Ordering::SeqCst), n * (n - 1) / 2);
    assert_eq!(messenger.metrics().snapshot().messages_received, n as u64);
}
