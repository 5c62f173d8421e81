//! remux/src/message.rs
//! Framed, typed messages on the multiplexed control channel.
//!
//! Wire frame: `type: u8 | length: u32-little-endian | body: length bytes`.
//! Body is encoded with `bincode`, a deterministic serde-native binary codec
//! standing in for the protobuf schema named in the design notes — any
//! compatible encoding works as long as both peers agree, and both peers here
//! are this crate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RemuxError, Result};

pub const MAX_PACKET_SIZE: u32 = 128 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckStatus {
    Failed = 0,
    Success = 1,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Login {
    pub agent: String,
    pub console_proto: String,
    pub console_ip: String,
    pub console_port: u16,
    pub r#mod: String,
    pub token: String,
    pub interfaces: Vec<String>,
    pub hostname: String,
    pub username: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Ack {
    pub status: i8,
    pub error: String,
    pub port: u16,
}

impl Ack {
    pub fn success() -> Self {
        Ack { status: AckStatus::Success as i8, error: String::new(), port: 0 }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Ack { status: AckStatus::Failed as i8, error: error.into(), port: 0 }
    }

    pub fn is_success(&self) -> bool {
        self.status == AckStatus::Success as i8
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Control {
    pub r#mod: String,
    pub remote: String,
    pub local: String,
    pub source: String,
    pub destination: String,
    pub options: HashMap<String, String>,
    pub fork: bool,
}

impl Control {
    pub fn remote_url(&self) -> Result<crate::url::TunnelUrl> {
        crate::url::TunnelUrl::parse(&self.remote)
    }

    pub fn local_url(&self) -> Result<crate::url::TunnelUrl> {
        crate::url::TunnelUrl::parse(&self.local)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Ping {
    pub ping: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Pong {
    pub pong: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Packet {
    pub id: u64,
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ConnStart {
    pub id: u64,
    pub source: String,
    pub destination: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ConnEnd {
    pub id: u64,
    pub msg: String,
}

/// The single message a Redirect envelope may carry.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RedirectInner {
    Packet(Packet),
    ConnStart(ConnStart),
    ConnEnd(ConnEnd),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Redirect {
    pub source: String,
    pub destination: String,
    pub inner: RedirectInner,
}

#[derive(Debug, Clone)]
pub enum Message {
    Login(Login),
    Ack(Ack),
    Control(Control),
    Ping(Ping),
    Pong(Pong),
    Packet(Packet),
    ConnStart(ConnStart),
    ConnEnd(ConnEnd),
    Redirect(Redirect),
}

impl Message {
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::Login(_) => 1,
            Message::Ack(_) => 2,
            Message::Control(_) => 3,
            Message::Ping(_) => 4,
            Message::Pong(_) => 5,
            Message::Packet(_) => 6,
            Message::ConnStart(_) => 7,
            Message::ConnEnd(_) => 8,
            Message::Redirect(_) => 9,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        let body = match self {
            Message::Login(m) => bincode::serialize(m),
            Message::Ack(m) => bincode::serialize(m),
            Message::Control(m) => bincode::serialize(m),
            Message::Ping(m) => bincode::serialize(m),
            Message::Pong(m) => bincode::serialize(m),
            Message::Packet(m) => bincode::serialize(m),
            Message::ConnStart(m) => bincode::serialize(m),
            Message::ConnEnd(m) => bincode::serialize(m),
            Message::Redirect(m) => bincode::serialize(m),
        };
        body.map_err(|e| RemuxError::Marshal(e.to_string()))
    }

    fn decode_body(msg_type: u8, bytes: &[u8]) -> Result<Message> {
        fn de<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
            bincode::deserialize(bytes).map_err(|e| RemuxError::Unmarshal(e.to_string()))
        }
        Ok(match msg_type {
            1 => Message::Login(de(bytes)?),
            2 => Message::Ack(de(bytes)?),
            3 => Message::Control(de(bytes)?),
            4 => Message::Ping(de(bytes)?),
            5 => Message::Pong(de(bytes)?),
            6 => Message::Packet(de(bytes)?),
            7 => Message::ConnStart(de(bytes)?),
            8 => Message::ConnEnd(de(bytes)?),
            9 => Message::Redirect(de(bytes)?),
            0 | 10.. => return Err(RemuxError::InvalidType(msg_type)),
        })
    }
}

/// Wraps a Packet/ConnStart/ConnEnd into a Redirect envelope addressed
/// `source -> destination`; plain messages pass through unwrapped when the
/// route has no redirect (source == destination), matching `Bridge.write`'s
/// routing decision in the design notes.
pub fn wrap(source: &str, destination: &str, msg: Message) -> Message {
    if source == destination {
        return msg;
    }
    let inner = match msg {
        Message::Packet(p) => RedirectInner::Packet(p),
        Message::ConnStart(c) => RedirectInner::ConnStart(c),
        Message::ConnEnd(c) => RedirectInner::ConnEnd(c),
        other => return other,
    };
    Message::Redirect(Redirect {
        source: source.to_string(),
        destination: destination.to_string(),
        inner,
    })
}

pub fn unwrap(r: Redirect) -> Message {
    match r.inner {
        RedirectInner::Packet(p) => Message::Packet(p),
        RedirectInner::ConnStart(c) => Message::ConnStart(c),
        RedirectInner::ConnEnd(c) => Message::ConnEnd(c),
    }
}

pub async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> Result<()> {
    let body = msg.encode_body()?;
    if body.len() as u32 > MAX_PACKET_SIZE {
        return Err(RemuxError::MessageLength { got: body.len() as u32, max: MAX_PACKET_SIZE });
    }
    let mut frame = Vec::with_capacity(5 + body.len());
    frame.push(msg.msg_type());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    w.write_all(&frame).await?;
    Ok(())
}

pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message> {
    let mut header = [0u8; 5];
    r.read_exact(&mut header).await?;
    let msg_type = header[0];
    let length = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
    if length > MAX_PACKET_SIZE {
        return Err(RemuxError::MessageLength { got: length, max: MAX_PACKET_SIZE });
    }
    let mut body = vec![0u8; length as usize];
    if length > 0 {
        r.read_exact(&mut body).await?;
    } else {
        return Err(RemuxError::EmptyMessage);
    }
    Message::decode_body(msg_type, &body)
}

pub async fn read_and_assert<R: AsyncRead + Unpin>(r: &mut R, expect: u8) -> Result<Message> {
    let msg = read_message(r).await?;
    if msg.msg_type() != expect {
        return Err(RemuxError::TypeMismatch { expected: expect, got: msg.msg_type() });
    }
    Ok(msg)
}

/// Writes `msg` then reads exactly one `Ack`; succeeds iff `Ack.status == Success`.
pub async fn write_and_assert<S: AsyncRead + AsyncWrite + Unpin>(
    s: &mut S,
    msg: &Message,
) -> Result<Ack> {
    write_message(s, msg).await?;
    let ack_msg = read_and_assert(s, 2).await?;
    match ack_msg {
        Message::Ack(ack) if ack.is_success() => Ok(ack),
        Message::Ack(ack) => Err(RemuxError::Unmarshal(ack.error)),
        _ => Err(RemuxError::InvalidStatus),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_packet_over_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = Message::Packet(Packet { id: 42, data: vec![1, 2, 3, 4, 5] });
        write_message(&mut a, &msg).await.unwrap();
        let got = read_message(&mut b).await.unwrap();
        match got {
            Message::Packet(p) => {
                assert_eq!(p.id, 42);
                assert_eq!(p.data, vec![1, 2, 3, 4, 5]);
            }
            _ => panic!("wrong message type"),
        }
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let (mut a, mut _b) = tokio::io::duplex(1 << 20);
        let msg = Message::Packet(Packet { id: 1, data: vec![0u8; (MAX_PACKET_SIZE + 1) as usize] });
        let err = write_message(&mut a, &msg).await.unwrap_err();
        assert!(matches!(err, RemuxError::MessageLength { .. }));
    }

    #[tokio::test]
    async fn write_and_assert_succeeds_on_ack_success() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let _ = read_message(&mut b).await.unwrap();
            write_message(&mut b, &Message::Ack(Ack::success())).await.unwrap();
        });
        let ack = write_and_assert(&mut a, &Message::Ping(Ping { ping: "ping".into() }))
            .await
            .unwrap();
        assert!(ack.is_success());
    }

    #[test]
    fn wrap_unwrap_round_trips_through_redirect() {
        let packet = Message::Packet(Packet { id: 7, data: vec![9, 9] });
        let wrapped = wrap("a1", "b1", packet.clone());
        match wrapped {
            Message::Redirect(r) => {
                assert_eq!(r.source, "a1");
                assert_eq!(r.destination, "b1");
                let unwrapped = unwrap(r);
                match (unwrapped, packet) {
                    (Message::Packet(p1), Message::Packet(p2)) => assert_eq!(p1.id, p2.id),
                    _ => panic!(),
                }
            }
            _ => panic!("expected Redirect"),
        }
    }

    #[test]
    fn wrap_is_passthrough_when_source_equals_destination() {
        let packet = Message::Packet(Packet { id: 1, data: vec![] });
        let wrapped = wrap("a1", "a1", packet);
        assert!(matches!(wrapped, Message::Packet(_)));
    }
}
