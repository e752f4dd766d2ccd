//! Binary encoding of [`Packet`]s.
//!
//! Wire format per packet: `[type|flags][remaining length varint][body]`.
//! WebSocket frames may split or batch packets, so decoding goes through
//! [`FrameBuffer`], which yields complete packets only.

use crate::error::CodecError;
use crate::packet::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, SubAck, Subscribe,
};

/// Largest value the 4-byte remaining-length varint can express.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

const FLAG_USERNAME: u8 = 0x80;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_WILL: u8 = 0x04;
const FLAG_CLEAN_SESSION: u8 = 0x02;

impl Packet {
    /// Serialize this packet into a standalone byte vector.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut body = Vec::new();
        let header = match self {
            Packet::Connect(c) => {
                write_str(&mut body, &c.protocol_name)?;
                body.push(c.protocol_level);
                let mut flags = 0u8;
                if c.username.is_some() {
                    flags |= FLAG_USERNAME;
                }
                if c.password.is_some() {
                    flags |= FLAG_PASSWORD;
                }
                if c.clean_session {
                    flags |= FLAG_CLEAN_SESSION;
                }
                body.push(flags);
                body.extend_from_slice(&c.keep_alive.to_be_bytes());
                write_str(&mut body, &c.client_id)?;
                if let Some(username) = &c.username {
                    write_str(&mut body, username)?;
                }
                if let Some(password) = &c.password {
                    write_bytes(&mut body, password)?;
                }
                CONNECT << 4
            }
            Packet::ConnAck(ack) => {
                body.push(u8::from(ack.session_present));
                body.push(ack.code.as_u8());
                CONNACK << 4
            }
            Packet::Publish(p) => {
                write_str(&mut body, &p.topic)?;
                if p.qos != QoS::AtMostOnce {
                    body.extend_from_slice(&p.packet_id.unwrap_or(0).to_be_bytes());
                }
                body.extend_from_slice(&p.payload);
                (PUBLISH << 4)
                    | (u8::from(p.dup) << 3)
                    | ((p.qos as u8) << 1)
                    | u8::from(p.retain)
            }
            Packet::PubAck(id) => {
                body.extend_from_slice(&id.to_be_bytes());
                PUBACK << 4
            }
            Packet::Subscribe(s) => {
                body.extend_from_slice(&s.packet_id.to_be_bytes());
                for (filter, qos) in &s.filters {
                    write_str(&mut body, filter)?;
                    body.push(*qos as u8);
                }
                (SUBSCRIBE << 4) | 0x02
            }
            Packet::SubAck(ack) => {
                body.extend_from_slice(&ack.packet_id.to_be_bytes());
                body.extend_from_slice(&ack.return_codes);
                SUBACK << 4
            }
            Packet::PingReq => PINGREQ << 4,
            Packet::PingResp => PINGRESP << 4,
            Packet::Disconnect => DISCONNECT << 4,
        };

        if body.len() > MAX_REMAINING_LENGTH {
            return Err(CodecError::PacketTooLarge(body.len()));
        }

        let mut out = Vec::with_capacity(body.len() + 5);
        out.push(header);
        write_remaining_length(&mut out, body.len());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Try to decode one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete packet,
    /// otherwise the packet and the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<Option<(Packet, usize)>, CodecError> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };
        let Some((remaining, len_bytes)) = read_remaining_length(&buf[1..])? else {
            return Ok(None);
        };
        let header_len = 1 + len_bytes;
        let total = header_len + remaining;
        if buf.len() < total {
            return Ok(None);
        }

        let packet_type = first >> 4;
        let flags = first & 0x0F;
        let mut r = Reader::new(&buf[header_len..total]);

        let packet = match packet_type {
            CONNECT => {
                let protocol_name = r.string("protocol name")?;
                let protocol_level = r.u8("protocol level")?;
                let connect_flags = r.u8("connect flags")?;
                let keep_alive = r.u16("keep alive")?;
                let client_id = r.string("client id")?;
                if connect_flags & FLAG_WILL != 0 {
                    r.string("will topic")?;
                    r.binary("will message")?;
                }
                let username = if connect_flags & FLAG_USERNAME != 0 {
                    Some(r.string("username")?)
                } else {
                    None
                };
                let password = if connect_flags & FLAG_PASSWORD != 0 {
                    Some(r.binary("password")?.to_vec())
                } else {
                    None
                };
                Packet::Connect(Connect {
                    protocol_name,
                    protocol_level,
                    client_id,
                    username,
                    password,
                    clean_session: connect_flags & FLAG_CLEAN_SESSION != 0,
                    keep_alive,
                })
            }
            CONNACK => {
                let ack_flags = r.u8("connack flags")?;
                let code = r.u8("connack code")?;
                Packet::ConnAck(ConnAck {
                    session_present: ack_flags & 0x01 != 0,
                    code: ConnectReturnCode::from_u8(code),
                })
            }
            PUBLISH => {
                let qos = QoS::from_u8((flags >> 1) & 0x03)?;
                let topic = r.string("topic")?;
                let packet_id = if qos == QoS::AtMostOnce {
                    None
                } else {
                    Some(r.u16("packet id")?)
                };
                Packet::Publish(Publish {
                    topic,
                    qos,
                    retain: flags & 0x01 != 0,
                    dup: flags & 0x08 != 0,
                    packet_id,
                    payload: r.rest().to_vec(),
                })
            }
            PUBACK => Packet::PubAck(r.u16("packet id")?),
            SUBSCRIBE => {
                let packet_id = r.u16("packet id")?;
                let mut filters = Vec::new();
                while !r.is_empty() {
                    let filter = r.string("topic filter")?;
                    let qos = QoS::from_u8(r.u8("requested qos")?)?;
                    filters.push((filter, qos));
                }
                Packet::Subscribe(Subscribe { packet_id, filters })
            }
            SUBACK => {
                let packet_id = r.u16("packet id")?;
                Packet::SubAck(SubAck {
                    packet_id,
                    return_codes: r.rest().to_vec(),
                })
            }
            PINGREQ => Packet::PingReq,
            PINGRESP => Packet::PingResp,
            DISCONNECT => Packet::Disconnect,
            other => return Err(CodecError::UnsupportedPacketType(other)),
        };

        Ok(Some((packet, total)))
    }
}

/// Accumulates bytes from transport frames and yields whole packets.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete packet, if any.
    ///
    /// A decode error leaves the buffer cleared: the stream is unrecoverable
    /// at that point and the caller is expected to drop the connection.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, CodecError> {
        match Packet::decode(&self.buf) {
            Ok(Some((packet, used))) => {
                self.buf.drain(..used);
                Ok(Some(packet))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.buf.clear();
                Err(e)
            }
        }
    }

    /// Bytes held that do not yet form a complete packet.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn write_remaining_length(out: &mut Vec<u8>, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Returns `(value, bytes consumed)` or `None` if the varint is incomplete.
fn read_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, &byte) in buf.iter().enumerate() {
        if i == 4 {
            return Err(CodecError::MalformedLength);
        }
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    if buf.len() >= 4 {
        return Err(CodecError::MalformedLength);
    }
    Ok(None)
}

fn write_str(out: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    write_bytes(out, s.as_bytes())
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(bytes.len()).map_err(|_| CodecError::StringTooLong(bytes.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], CodecError> {
        if self.buf.len() - self.pos < n {
            return Err(CodecError::Truncated(what));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, CodecError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, CodecError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn binary(&mut self, what: &'static str) -> Result<&'a [u8], CodecError> {
        let len = self.u16(what)? as usize;
        self.take(len, what)
    }

    fn string(&mut self, what: &'static str) -> Result<String, CodecError> {
        let bytes = self.binary(what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_packet() -> Packet {
        Packet::Connect(Connect {
            protocol_name: "MQIsdp".to_string(),
            protocol_level: 3,
            client_id: "mqttwsclient".to_string(),
            username: Some(r#"{"u":"100"}"#.to_string()),
            password: None,
            clean_session: true,
            keep_alive: 60,
        })
    }

    #[test]
    fn remaining_length_boundaries() {
        for (len, expected) in [
            (0usize, vec![0x00]),
            (127, vec![0x7F]),
            (128, vec![0x80, 0x01]),
            (16_383, vec![0xFF, 0x7F]),
            (16_384, vec![0x80, 0x80, 0x01]),
            (MAX_REMAINING_LENGTH, vec![0xFF, 0xFF, 0xFF, 0x7F]),
        ] {
            let mut out = Vec::new();
            write_remaining_length(&mut out, len);
            assert_eq!(out, expected, "encoding {len}");
            assert_eq!(
                read_remaining_length(&out).unwrap(),
                Some((len, expected.len()))
            );
        }
    }

    #[test]
    fn remaining_length_rejects_fifth_byte() {
        let err = read_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]).unwrap_err();
        assert_eq!(err, CodecError::MalformedLength);
    }

    #[test]
    fn connect_layout_matches_mqisdp() {
        let bytes = connect_packet().encode().unwrap();
        assert_eq!(bytes[0], 0x10);
        // protocol name length + "MQIsdp"
        assert_eq!(&bytes[2..10], b"\x00\x06MQIsdp");
        assert_eq!(bytes[10], 3);
        assert_eq!(bytes[11], FLAG_USERNAME | FLAG_CLEAN_SESSION);
        assert_eq!(&bytes[12..14], &60u16.to_be_bytes());
    }

    #[test]
    fn connect_decodes_back() {
        let packet = connect_packet();
        let bytes = packet.encode().unwrap();
        let (decoded, used) = Packet::decode(&bytes).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn qos1_publish_carries_packet_id() {
        let bytes = Packet::Publish(Publish::at_least_once("/t_ms", b"{}".to_vec(), 42))
            .encode()
            .unwrap();
        assert_eq!(bytes[0], 0x32);
        let (decoded, _) = Packet::decode(&bytes).unwrap().unwrap();
        match decoded {
            Packet::Publish(p) => {
                assert_eq!(p.topic, "/t_ms");
                assert_eq!(p.packet_id, Some(42));
                assert_eq!(p.payload, b"{}");
            }
            other => panic!("expected publish, got {other:?}"),
        }
    }

    #[test]
    fn subscribe_header_has_reserved_bits() {
        let bytes = Packet::Subscribe(Subscribe {
            packet_id: 1,
            filters: vec![("/t_ms".to_string(), QoS::AtMostOnce)],
        })
        .encode()
        .unwrap();
        assert_eq!(bytes[0], 0x82);
    }

    #[test]
    fn ping_and_disconnect_are_two_bytes() {
        assert_eq!(Packet::PingReq.encode().unwrap(), vec![0xC0, 0x00]);
        assert_eq!(Packet::PingResp.encode().unwrap(), vec![0xD0, 0x00]);
        assert_eq!(Packet::Disconnect.encode().unwrap(), vec![0xE0, 0x00]);
    }

    #[test]
    fn incomplete_input_yields_none() {
        let bytes = connect_packet().encode().unwrap();
        for cut in 0..bytes.len() {
            assert_eq!(Packet::decode(&bytes[..cut]).unwrap(), None, "cut at {cut}");
        }
    }

    #[test]
    fn unsupported_type_is_an_error() {
        // UNSUBSCRIBE (10) is never used by the edge client
        let err = Packet::decode(&[0xA2, 0x00]).unwrap_err();
        assert_eq!(err, CodecError::UnsupportedPacketType(10));
    }

    #[test]
    fn truncated_body_is_an_error() {
        // PUBACK with a one-byte body
        let err = Packet::decode(&[0x40, 0x01, 0x00]).unwrap_err();
        assert_eq!(err, CodecError::Truncated("packet id"));
    }

    #[test]
    fn frame_buffer_handles_split_and_batched_frames() {
        let mut stream = Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Accepted,
        })
        .encode()
        .unwrap();
        stream.extend(Packet::PingResp.encode().unwrap());

        let mut fb = FrameBuffer::new();
        fb.extend(&stream[..3]);
        assert_eq!(fb.next_packet().unwrap(), None);
        fb.extend(&stream[3..]);
        assert!(matches!(fb.next_packet().unwrap(), Some(Packet::ConnAck(_))));
        assert_eq!(fb.next_packet().unwrap(), Some(Packet::PingResp));
        assert_eq!(fb.next_packet().unwrap(), None);
        assert_eq!(fb.pending(), 0);
    }

    #[test]
    fn frame_buffer_clears_after_error() {
        let mut fb = FrameBuffer::new();
        fb.extend(&[0xA2, 0x00, 0xC0]);
        assert!(fb.next_packet().is_err());
        assert_eq!(fb.pending(), 0);
    }
}
