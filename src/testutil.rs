// Copyright (C) 2024 the macula authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-process mock RTSP server helpers for tests.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Decoder;
use url::Url;

use crate::message::{headers, Message, Request, Response, StatusCode};
use crate::tokio::Codec;

/// Binds a listener on an ephemeral localhost port and returns it together
/// with an `rtsp://` URL pointing at it.
pub(crate) async fn bind_server(path: &str) -> (TcpListener, Url) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = Url::parse(&format!("rtsp://{addr}{path}")).unwrap();
    (listener, url)
}

/// The server side of one accepted RTSP connection, speaking through the
/// same codec the client uses.
pub(crate) struct ServerConn {
    stream: TcpStream,
    buf: BytesMut,
    codec: Codec,
}

impl ServerConn {
    pub(crate) async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        Self {
            stream,
            buf: BytesMut::new(),
            codec: Codec::new(),
        }
    }

    pub(crate) async fn next_message(&mut self) -> Message {
        loop {
            if let Some(m) = self.codec.decode(&mut self.buf).unwrap() {
                return m.msg;
            }
            let n = self.stream.read_buf(&mut self.buf).await.unwrap();
            assert!(n > 0, "client closed the connection mid-message");
        }
    }

    pub(crate) async fn next_request(&mut self) -> Request {
        match self.next_message().await {
            Message::Request(r) => r,
            o => panic!("expected request, got {o:?}"),
        }
    }

    pub(crate) async fn send_response(&mut self, resp: Response) {
        let mut buf = BytesMut::new();
        resp.write_to(&mut buf);
        self.stream.write_all(&buf).await.unwrap();
    }

    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }
}

/// A `200 OK` response echoing the request's `CSeq`.
pub(crate) fn ok_response(req: &Request) -> Response {
    response_to(req, StatusCode::OK, "OK")
}

pub(crate) fn response_to(req: &Request, status: StatusCode, reason: &str) -> Response {
    Response::new(status, reason).header(
        headers::CSEQ,
        req.headers.get(headers::CSEQ).unwrap_or("0"),
    )
}

/// Extracts `client_port=P-P+1` from a `Transport` header value.
pub(crate) fn client_ports(transport: &str) -> (u16, u16) {
    let ports = transport
        .split(';')
        .find_map(|p| p.trim().strip_prefix("client_port="))
        .expect("Transport header has client_port");
    let (rtp, rtcp) = ports.split_once('-').expect("client_port is a range");
    (rtp.parse().unwrap(), rtcp.parse().unwrap())
}
