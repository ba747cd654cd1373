// Copyright (C) 2024 the macula authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! tokio-based connection plumbing.
//!
//! In theory there could be a similar async-std-based implementation.

use bytes::{Buf, Bytes, BytesMut};
use std::net::IpAddr;
use std::ops::Range;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::message::{self, Data, Message};
use crate::{ConnectionContext, RtspMessageContext, WallTime};

pub(crate) type ReadHalf = FramedRead<OwnedReadHalf, Codec>;
pub(crate) type WriteHalf = FramedWrite<OwnedWriteHalf, Codec>;

/// A received RTSP message, annotated with its position in the stream.
#[derive(Debug)]
pub(crate) struct ReceivedMessage {
    pub(crate) ctx: RtspMessageContext,
    pub(crate) msg: Message,
}

/// An RTSP control connection, split so the read half can be handed to a
/// background reader task while writes stay with the session.
pub(crate) struct Connection {
    pub(crate) ctx: ConnectionContext,
    pub(crate) read: ReadHalf,
    pub(crate) write: WriteHalf,
}

impl Connection {
    pub(crate) async fn connect(host: &str, port: u16) -> Result<Self, std::io::Error> {
        let stream = TcpStream::connect((host, port)).await?;
        Self::from_stream(stream)
    }

    pub(crate) fn from_stream(stream: TcpStream) -> Result<Self, std::io::Error> {
        let established_wall = WallTime::now();
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        Ok(Self {
            ctx: ConnectionContext {
                local_addr,
                peer_addr,
                established_wall,
            },
            read: FramedRead::new(read, Codec { read_pos: 0 }),
            write: FramedWrite::new(write, Codec { read_pos: 0 }),
        })
    }
}

/// Encodes and decodes RTSP messages and interleaved data frames.
pub(crate) struct Codec {
    /// Number of bytes read and processed (drained from the input buffer).
    read_pos: u64,
}

impl Codec {
    pub(crate) fn new() -> Self {
        Codec { read_pos: 0 }
    }
}

/// An intermediate error type that exists because `Framed` expects the
/// codec's error type to implement `From<std::io::Error>`, and
/// [`crate::Error`] takes additional context.
#[derive(Debug)]
pub(crate) enum CodecError {
    IoError(std::io::Error),
    ParseError { description: String, pos: u64 },
}

impl std::convert::From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::IoError(e)
    }
}

impl Codec {
    fn parse_msg(&self, src: &mut BytesMut) -> Result<Option<(usize, Message)>, CodecError> {
        // Skip stray CRLF pairs between messages; some servers emit them
        // after a response body.
        while src.starts_with(b"\r\n") {
            src.advance(2);
        }

        if !src.is_empty() && src[0] == b'$' {
            // Interleaved data frame: $, channel id, 2-byte length, payload.
            // The payload is split out of the buffer rather than copied.
            if src.len() < 4 {
                return Ok(None);
            }
            let channel_id = src[1];
            let len = 4 + usize::from(u16::from_be_bytes([src[2], src[3]]));
            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }
            let mut frame = src.split_to(len);
            frame.advance(4);
            return Ok(Some((
                len,
                Message::Data(Data {
                    channel_id,
                    payload: frame.freeze(),
                }),
            )));
        }

        let (msg, len) = match message::parse(&src[..]) {
            Ok(Some(v)) => v,
            Ok(None) => return Ok(None),
            Err(description) => {
                return Err(CodecError::ParseError {
                    description: format!(
                        "{}; buffered:\n{:#?}",
                        description,
                        crate::hex::LimitedHex::new(&src[..], 128),
                    ),
                    pos: self.read_pos,
                });
            }
        };
        src.advance(len);
        Ok(Some((len, msg)))
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = ReceivedMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (len, msg) = match self.parse_msg(src) {
            Err(e) => return Err(e),
            Ok(None) => return Ok(None),
            Ok(Some((len, msg))) => (len, msg),
        };
        let msg = ReceivedMessage {
            msg,
            ctx: RtspMessageContext {
                pos: self.read_pos,
                received_wall: WallTime::now(),
            },
        };
        self.read_pos += crate::to_u64(len);
        Ok(Some(msg))
    }
}

impl tokio_util::codec::Encoder<Message> for Codec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Request(r) => r.write_to(dst),
            Message::Response(r) => r.write_to(dst),
            Message::Data(d) => {
                debug_assert!(d.payload.len() <= usize::from(u16::MAX));
                dst.extend_from_slice(&[b'$', d.channel_id]);
                dst.extend_from_slice(&(d.payload.len() as u16).to_be_bytes());
                dst.extend_from_slice(&d.payload);
            }
        }
        Ok(())
    }
}

/// tokio-specific version of [`crate::UdpPair`].
pub(crate) struct UdpPair {
    pub(crate) rtp_port: u16,
    pub(crate) rtp_socket: UdpSocket,
    pub(crate) rtcp_socket: UdpSocket,
}

impl UdpPair {
    pub(crate) fn for_ip(ip_addr: IpAddr, port_range: &Range<u16>) -> Result<Self, std::io::Error> {
        Self::from_inner(crate::UdpPair::for_ip(ip_addr, port_range)?)
    }

    pub(crate) fn bind_exact(ip_addr: IpAddr, rtp_port: u16) -> Result<Self, std::io::Error> {
        Self::from_inner(crate::UdpPair::bind_exact(ip_addr, rtp_port)?)
    }

    fn from_inner(inner: crate::UdpPair) -> Result<Self, std::io::Error> {
        inner.rtp_socket.set_nonblocking(true)?;
        inner.rtcp_socket.set_nonblocking(true)?;
        Ok(Self {
            rtp_port: inner.rtp_port,
            rtp_socket: UdpSocket::from_std(inner.rtp_socket)?,
            rtcp_socket: UdpSocket::from_std(inner.rtcp_socket)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::codec::{Decoder, Encoder};

    use super::*;
    use crate::message::{Method, Request, StatusCode};

    #[test]
    fn crlf_data() {
        let mut codec = Codec { read_pos: 0 };
        let mut buf = BytesMut::from(&b"\r\n$\x00\x00\x04asdfrest"[..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        match msg.msg {
            Message::Data(d) => {
                assert_eq!(d.channel_id, 0);
                assert_eq!(&d.payload[..], b"asdf");
            }
            o => panic!("expected data, got {o:?}"),
        }
        assert_eq!(&buf[..], b"rest");
    }

    #[test]
    fn partial_data_frame() {
        let mut codec = Codec { read_pos: 0 };
        let mut buf = BytesMut::from(&b"$\x01\x00\x04ab"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"cd");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        match msg.msg {
            Message::Data(d) => {
                assert_eq!(d.channel_id, 1);
                assert_eq!(&d.payload[..], b"abcd");
            }
            o => panic!("expected data, got {o:?}"),
        }
    }

    #[test]
    fn data_then_response() {
        let mut codec = Codec { read_pos: 0 };
        let mut buf = BytesMut::from(&b"$\x00\x00\x02hiRTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n"[..]);
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first.msg, Message::Data(_)));
        let second = codec.decode(&mut buf).unwrap().unwrap();
        match second.msg {
            Message::Response(r) => assert_eq!(r.status, StatusCode::OK),
            o => panic!("expected response, got {o:?}"),
        }
    }

    #[test]
    fn read_pos_advances() {
        let mut codec = Codec { read_pos: 0 };
        let mut buf = BytesMut::from(&b"$\x00\x00\x01a$\x01\x00\x01b"[..]);
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.ctx.pos(), 0);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.ctx.pos(), 5);
    }

    #[test]
    fn encode_data_frame() {
        let mut codec = Codec { read_pos: 0 };
        let mut buf = BytesMut::new();
        codec
            .encode(
                Message::Data(Data {
                    channel_id: 0,
                    payload: Bytes::from_static(b"\xaa\xbb\xcc\xdd"),
                }),
                &mut buf,
            )
            .unwrap();
        assert_eq!(&buf[..], b"$\x00\x00\x04\xaa\xbb\xcc\xdd");
    }

    #[test]
    fn encode_request_is_parseable() {
        let mut codec = Codec { read_pos: 0 };
        let mut buf = BytesMut::new();
        let req = Request::new(
            Method::Options,
            url::Url::parse("rtsp://example.com/").unwrap(),
        )
        .header("CSeq", "1");
        codec.encode(Message::Request(req.clone()), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.msg, Message::Request(req));
    }
}
