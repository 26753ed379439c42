//! Wire protocol: length-prefixed (u32 big-endian) frames whose payload is
//! a single-byte message kind discriminant followed by the canonically
//! encoded body.

use cpc_core::{codec, Block, ConsensusAddress, Hash32, NetError, Transaction};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Frames above this size are dropped as malformed.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

const KIND_HELLO: u8 = 0;
const KIND_BLOCK: u8 = 1;
const KIND_TX: u8 = 2;
const KIND_GET_BLOCKS: u8 = 3;
const KIND_BLOCKS: u8 = 4;
const KIND_PING: u8 = 5;
const KIND_PONG: u8 = 6;

/// Session opener; the genesis hash gates admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub genesis_hash: Hash32,
    pub tip_height: u64,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<ConsensusAddress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(Hello),
    Block(Box<Block>),
    Tx(Box<Transaction>),
    GetBlocks(BlockRange),
    Blocks(Vec<Block>),
    Ping,
    Pong,
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, NetError> {
        let (kind, body) = match self {
            Message::Hello(h) => (KIND_HELLO, encode_body(h)?),
            Message::Block(b) => (KIND_BLOCK, encode_body(b)?),
            Message::Tx(t) => (KIND_TX, encode_body(t)?),
            Message::GetBlocks(r) => (KIND_GET_BLOCKS, encode_body(r)?),
            Message::Blocks(b) => (KIND_BLOCKS, encode_body(b)?),
            Message::Ping => (KIND_PING, Vec::new()),
            Message::Pong => (KIND_PONG, Vec::new()),
        };
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(kind);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, NetError> {
        let (&kind, body) = payload
            .split_first()
            .ok_or_else(|| NetError::Network("empty frame".into()))?;
        match kind {
            KIND_HELLO => Ok(Message::Hello(decode_body(body)?)),
            KIND_BLOCK => Ok(Message::Block(Box::new(decode_body(body)?))),
            KIND_TX => Ok(Message::Tx(Box::new(decode_body(body)?))),
            KIND_GET_BLOCKS => Ok(Message::GetBlocks(decode_body(body)?)),
            KIND_BLOCKS => Ok(Message::Blocks(decode_body(body)?)),
            KIND_PING => Ok(Message::Ping),
            KIND_PONG => Ok(Message::Pong),
            other => Err(NetError::Network(format!("unknown message kind {other}"))),
        }
    }
}

fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, NetError> {
    codec::to_canonical(value).map_err(|e| NetError::Network(e.to_string()))
}

fn decode_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, NetError> {
    codec::from_canonical(body).map_err(|e| NetError::Network(e.to_string()))
}

pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), NetError> {
    let payload = message.encode()?;
    if payload.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(NetError::Network("frame too large".into()));
    }
    let len = (payload.len() as u32).to_be_bytes();
    writer
        .write_all(&len)
        .await
        .map_err(|e| NetError::Network(e.to_string()))?;
    writer
        .write_all(&payload)
        .await
        .map_err(|e| NetError::Network(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| NetError::Network(e.to_string()))?;
    Ok(())
}

pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Message, NetError> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| NetError::Network(e.to_string()))?;
    let len = u32::from_be_bytes(len_bytes);
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(NetError::Network(format!("bad frame length {len}")));
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| NetError::Network(e.to_string()))?;
    Message::decode(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024 * 1024);
        let hello = Message::Hello(Hello {
            genesis_hash: cpc_core::hash_bytes(b"genesis"),
            tip_height: 42,
            node_id: "node-1".into(),
            validator: None,
        });
        write_frame(&mut a, &hello).await.unwrap();
        write_frame(&mut a, &Message::Ping).await.unwrap();

        assert_eq!(read_frame(&mut b).await.unwrap(), hello);
        assert_eq!(read_frame(&mut b).await.unwrap(), Message::Ping);
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let bad = (MAX_FRAME_BYTES + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &bad).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(Message::decode(&[250, 1, 2, 3]).is_err());
    }

    #[test]
    fn get_blocks_round_trips() {
        let msg = Message::GetBlocks(BlockRange { from: 10, to: 20 });
        let bytes = msg.encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }
}
