//! Framed transport over one peer stream.
//!
//! A [`PeerSession`] owns the write half of a stream behind an async mutex,
//! so concurrent senders never interleave frames.  [`run`] drives the read
//! half and hands every decoded packet to a [`SessionHandler`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use parley_net::BoxedStream;
use parley_shared::frame::{encode_frame, read_frame, write_frame, FrameRead};
use parley_shared::{DataPacket, PeerIdentity};

use crate::error::Result;

pub type SessionReader = ReadHalf<BoxedStream>;

pub struct PeerSession {
    id: u64,
    peer: PeerIdentity,
    writer: Mutex<WriteHalf<BoxedStream>>,
    closed: CancellationToken,
}

impl PeerSession {
    /// Split `stream` into a session and the reader [`run`] consumes.
    /// Cancelling `closed` ends the read loop.
    pub fn new(id: u64, peer: PeerIdentity, stream: BoxedStream, closed: CancellationToken) -> (Arc<Self>, SessionReader) {
        let (reader, writer) = tokio::io::split(stream);
        let session = Arc::new(Self {
            id,
            peer,
            writer: Mutex::new(writer),
            closed,
        });
        (session, reader)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Encode and write one frame.
    pub async fn send(&self, packet: &DataPacket) -> Result<()> {
        let frame = encode_frame(packet)?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &frame).await?;
        Ok(())
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves when the session has ended.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn on_packet(&self, session: &Arc<PeerSession>, packet: DataPacket);

    /// Called once after the read loop ended.
    async fn on_closed(&self, session: &Arc<PeerSession>);
}

/// Read frames until the stream fails or the session is closed.
pub async fn run(session: Arc<PeerSession>, mut reader: SessionReader, handler: Arc<dyn SessionHandler>) {
    debug!(peer = %session.peer.short(), session = session.id, "Session read loop started");

    loop {
        let frame = tokio::select! {
            _ = session.closed.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(FrameRead::Packet(packet)) => {
                trace!(peer = %session.peer.short(), kind = packet.kind(), "Frame received");
                handler.on_packet(&session, packet).await;
            }
            Ok(FrameRead::Oversized(len)) => {
                warn!(peer = %session.peer.short(), len, "Oversized frame skipped");
            }
            Ok(FrameRead::Malformed(e)) => {
                warn!(peer = %session.peer.short(), error = %e, "Undecodable frame dropped");
            }
            Err(e) => {
                info!(peer = %session.peer.short(), session = session.id, error = %e, "Session stream ended");
                break;
            }
        }
    }

    session.closed.cancel();
    handler.on_closed(&session).await;
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::io::AsyncWriteExt;
    use tokio::sync::Notify;

    use parley_shared::protocol::ResendRequest;
    use parley_shared::{ChatId, MessageId};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        packets: StdMutex<Vec<DataPacket>>,
        closed: Notify,
    }

    #[async_trait]
    impl SessionHandler for Recorder {
        async fn on_packet(&self, _session: &Arc<PeerSession>, packet: DataPacket) {
            self.packets.lock().unwrap().push(packet);
        }

        async fn on_closed(&self, _session: &Arc<PeerSession>) {
            self.closed.notify_one();
        }
    }

    fn pair() -> (Arc<PeerSession>, SessionReader, Arc<PeerSession>, SessionReader) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (left, left_reader) = PeerSession::new(1, PeerIdentity::from("B"), Box::new(a), CancellationToken::new());
        let (right, right_reader) = PeerSession::new(2, PeerIdentity::from("A"), Box::new(b), CancellationToken::new());
        (left, left_reader, right, right_reader)
    }

    fn resend(i: usize) -> DataPacket {
        DataPacket::ResendRequest(ResendRequest {
            chat_id: ChatId::from("c1"),
            message_id: MessageId::from(format!("m{i}").as_str()),
        })
    }

    #[tokio::test]
    async fn concurrent_sends_arrive_as_whole_frames() {
        let (left, _left_reader, right, right_reader) = pair();
        let recorder = Arc::new(Recorder::default());
        let reader_task = tokio::spawn(run(right.clone(), right_reader, recorder.clone()));

        let mut sends = Vec::new();
        for i in 0..20 {
            let left = left.clone();
            sends.push(tokio::spawn(async move { left.send(&resend(i)).await }));
        }
        for send in sends {
            send.await.unwrap().unwrap();
        }

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while recorder.packets.lock().unwrap().len() < 20 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        right.close();
        reader_task.await.unwrap();
        let packets = recorder.packets.lock().unwrap();
        assert!(packets.iter().all(|p| matches!(p, DataPacket::ResendRequest(_))));
    }

    #[tokio::test]
    async fn bad_frames_do_not_end_the_session() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (session, reader) = PeerSession::new(7, PeerIdentity::from("A"), Box::new(b), CancellationToken::new());
        let recorder = Arc::new(Recorder::default());
        let task = tokio::spawn(run(session.clone(), reader, recorder.clone()));

        let mut raw = a;
        // Unknown variant tag.
        raw.write_all(&4u32.to_be_bytes()).await.unwrap();
        raw.write_all(&77u32.to_le_bytes()).await.unwrap();
        raw.write_all(&encode_frame(&DataPacket::Ping).unwrap()).await.unwrap();
        raw.flush().await.unwrap();
        drop(raw);

        recorder.closed.notified().await;
        task.await.unwrap();
        assert_eq!(*recorder.packets.lock().unwrap(), vec![DataPacket::Ping]);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn closing_the_session_ends_the_loop() {
        let (_left, _left_reader, right, right_reader) = pair();
        let recorder = Arc::new(Recorder::default());
        let task = tokio::spawn(run(right.clone(), right_reader, recorder.clone()));
        right.close();
        task.await.unwrap();
        assert!(recorder.packets.lock().unwrap().is_empty());
    }
}
