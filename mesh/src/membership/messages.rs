//! Engine messages. Packets are one bincode value; streams carry
//! `[u32 big-endian length][bincode]` frames.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Member;
use crate::error::{KvError, WireError};

/// Largest stream frame accepted. Push/pull carries the whole store.
const MAX_FRAME_LEN: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(super) enum GossipPacket {
    /// Delegate broadcasts.
    User(Vec<Vec<u8>>),
    /// Member state announcements.
    Members(Vec<Member>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(super) enum StreamMessage {
    Ping { from: String },
    Ack,
    PushPull {
        join: bool,
        members: Vec<Member>,
        user_state: Vec<u8>,
    },
}

pub(super) fn encode_packet(packet: &GossipPacket) -> Result<Vec<u8>, WireError> {
    Ok(bincode::serialize(packet)?)
}

pub(super) fn decode_packet(buf: &[u8]) -> Result<GossipPacket, WireError> {
    Ok(bincode::deserialize(buf)?)
}

pub(super) async fn write_message<W>(w: &mut W, msg: &StreamMessage) -> Result<(), KvError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let body = bincode::serialize(msg).map_err(WireError::from)?;
    let len = u32::try_from(body.len()).map_err(|_| WireError::TooLarge(body.len()))?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&body).await?;
    w.flush().await?;
    Ok(())
}

pub(super) async fn read_message<R>(r: &mut R) -> Result<StreamMessage, KvError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len = [0u8; 4];
    r.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::TooLarge(len).into());
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(bincode::deserialize(&body).map_err(WireError::from)?)
}
