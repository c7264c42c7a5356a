//! Network Module
//!
//! Moves envelopes between nodes. The TCP transport is used in
//! production; the in-memory network wires nodes of one process together
//! and can simulate partitions.

mod client;
mod memory;
mod server;

pub use client::NetworkClient;
pub use memory::{InMemoryNetwork, InMemoryTransport};
pub use server::NetworkServer;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::replication::{Envelope, FrameHeader};

/// Upper bound on a single frame; larger frames are treated as corruption
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// One-way delivery of envelopes to another node
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver `envelope` to the node listening on `address`.
    /// Delivery is best effort; the protocol retransmits.
    async fn send(&self, address: &str, envelope: &Envelope) -> Result<()>;
}

/// Read a framed envelope from a reader
pub async fn read_envelope<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope> {
    use tokio::io::AsyncReadExt;

    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length as usize > MAX_FRAME_SIZE {
        return Err(Error::Network(format!("frame of {} bytes exceeds limit", header.length)));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    Ok(Envelope::deserialize(&body)?)
}

/// Write a framed envelope to a writer
pub async fn write_envelope<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = envelope.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::Message;

    fn envelope() -> Envelope {
        Envelope {
            from: "a".into(),
            from_address: "127.0.0.1:1".into(),
            to: "b".into(),
            message: Message::VoteResponse {
                term: 3,
                vote_granted: true,
            },
        }
    }

    #[tokio::test]
    async fn test_framing_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_envelope(&mut client, &envelope()).await.unwrap();
        let received = read_envelope(&mut server).await.unwrap();
        assert_eq!(received.to, "b");
        assert_eq!(received.message.term(), 3);
    }

    #[tokio::test]
    async fn test_corrupt_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let body = envelope().serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 1;

        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(&header.to_bytes()).await.unwrap();
        client.write_all(&body).await.unwrap();

        assert!(matches!(read_envelope(&mut server).await, Err(Error::Network(_))));
    }
}
