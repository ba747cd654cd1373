// Copyright (C) 2024 the macula authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! High-level RTSP client library.
//!
//! `macula` drives the client side of an RTSP 1.0 dialog: it connects to a
//! server, negotiates per-track transports, then moves RTP/RTCP packets in
//! either direction. Both **reading** (`DESCRIBE`/`SETUP`/`PLAY`) and
//! **publishing** (`ANNOUNCE`/`SETUP`/`RECORD`) are supported, over UDP
//! socket pairs or TCP interleaved framing on the control connection.
//!
//! The usual entry points are [`dial_read`] and [`dial_publish`], which run
//! the whole request ladder and hand back a streaming [`client::Client`].
//! Sessions that need finer control build a [`client::Client`] from
//! [`client::SessionOptions`] and issue each method themselves.

#![forbid(clippy::print_stderr, clippy::print_stdout)]
// I prefer to use from_str_radix(..., 10) to explicitly note the base.
#![allow(clippy::from_str_radix_10)]

use log::trace;
use rand::Rng;
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::ops::Range;

mod error;
mod hex;
pub mod message;
mod rtcp;
mod rtp;

#[cfg(test)]
mod testutil;

pub use error::{Error, ErrorKind};

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

pub mod client;
mod tokio;

use client::{Client, SessionOptions, Track, TransportMode};

/// Connects to `address` and starts reading all described tracks.
///
/// Runs `OPTIONS`, `DESCRIBE` (following redirects), one `SETUP` per track
/// with auto-allocated transport parameters, then `PLAY`. The returned
/// client is in the streaming phase; packets arrive through the callbacks
/// configured in `options` and [`client::Client::wait`] blocks until the
/// session dies.
pub async fn dial_read(address: &str, options: SessionOptions) -> Result<Client, Error> {
    let url = client::parse_url(address)?;
    let client = Client::new(options);
    if let Err(e) = dial_read_inner(&client, &url).await {
        client.close().await;
        return Err(e);
    }
    Ok(client)
}

async fn dial_read_inner(client: &Client, url: &url::Url) -> Result<(), Error> {
    client.start(url).await?;
    client.options(url).await?;
    let (tracks, base_url, _) = client.describe(url).await?;
    for track in &tracks {
        client
            .setup(TransportMode::Play, track, &base_url, 0, 0)
            .await?;
    }
    client.play(None).await?;
    Ok(())
}

/// Connects to `address` and starts publishing the supplied tracks.
///
/// Runs `OPTIONS`, `ANNOUNCE`, one `SETUP` per track, then `RECORD`. After
/// this returns, packets are sent with
/// [`client::Client::write_packet_rtp`].
pub async fn dial_publish(
    address: &str,
    tracks: Vec<Track>,
    options: SessionOptions,
) -> Result<Client, Error> {
    let url = client::parse_url(address)?;
    let client = Client::new(options);
    if let Err(e) = dial_publish_inner(&client, &url, tracks).await {
        client.close().await;
        return Err(e);
    }
    Ok(client)
}

async fn dial_publish_inner(
    client: &Client,
    url: &url::Url,
    tracks: Vec<Track>,
) -> Result<(), Error> {
    client.start(url).await?;
    client.options(url).await?;
    client.announce(url, tracks).await?;
    let announced = client.tracks();
    for track in &announced {
        client
            .setup(TransportMode::Record, track, url, 0, 0)
            .await?;
    }
    client.record().await?;
    Ok(())
}

/// A wall time taken from the local machine's realtime clock, used in error
/// reporting.
#[derive(Copy, Clone, Debug)]
pub struct WallTime(chrono::DateTime<chrono::Utc>);

impl WallTime {
    pub(crate) fn now() -> Self {
        Self(chrono::Utc::now())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%FT%T"))
    }
}

/// RTSP connection context.
///
/// This gives enough information to pick out the flow in a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionContext {
    pub(crate) local_addr: SocketAddr,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) established_wall: WallTime,
}

impl ConnectionContext {
    #[doc(hidden)]
    pub fn dummy() -> Self {
        let addr = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        Self {
            local_addr: addr,
            peer_addr: addr,
            established_wall: WallTime::now(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(me)->{}@{}",
            &self.local_addr, &self.peer_addr, &self.established_wall,
        )
    }
}

/// Context of a received message (or read error) within an RTSP connection.
///
/// When paired with a [`ConnectionContext`], this should allow picking the
/// message out of a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct RtspMessageContext {
    /// The starting byte position within the input stream. The bottom 32
    /// bits can be compared to the relative TCP sequence number.
    pos: u64,

    /// Time when the application parsed the message. Caveat: this may not
    /// closely match the time on a packet capture if the application is
    /// overloaded (or if `CLOCK_REALTIME` jumps).
    received_wall: WallTime,
}

impl RtspMessageContext {
    #[doc(hidden)]
    pub fn dummy() -> Self {
        Self {
            pos: 0,
            received_wall: WallTime::now(),
        }
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }
}

impl Display for RtspMessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pos, &self.received_wall)
    }
}

pub(crate) fn to_u64(v: usize) -> u64 {
    v as u64
}

/// A pair of local UDP sockets used for RTP and RTCP transmission.
///
/// The RTP port is always even, and the RTCP port is always the following
/// (odd) integer.
pub(crate) struct UdpPair {
    pub(crate) rtp_port: u16,
    pub(crate) rtp_socket: UdpSocket,
    pub(crate) rtcp_socket: UdpSocket,
}

impl UdpPair {
    pub(crate) fn for_ip(
        ip_addr: IpAddr,
        port_range: &Range<u16>,
    ) -> Result<Self, std::io::Error> {
        const MAX_TRIES: usize = 10;
        let mut rng = rand::thread_rng();
        for i in 0..MAX_TRIES {
            let rtp_port = rng.gen_range(port_range.clone()) & !0b1;
            let rtp_addr = SocketAddr::new(ip_addr, rtp_port);
            let rtp_socket = match UdpSocket::bind(rtp_addr) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    trace!(
                        "Try {}/{}: unable to bind RTP addr {:?}",
                        i,
                        MAX_TRIES,
                        rtp_addr
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            let rtcp_addr = SocketAddr::new(ip_addr, rtp_port + 1);
            let rtcp_socket = match UdpSocket::bind(rtcp_addr) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    trace!(
                        "Try {}/{}: unable to bind RTCP addr {:?}",
                        i,
                        MAX_TRIES,
                        rtcp_addr
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            return Ok(Self {
                rtp_port,
                rtp_socket,
                rtcp_socket,
            });
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!(
                "Unable to find even/odd pair in {}:{}..{} after {} tries",
                ip_addr, port_range.start, port_range.end, MAX_TRIES
            ),
        ))
    }

    /// Binds exactly the requested pair, for callers that pass explicit
    /// `client_port` values to `SETUP`.
    pub(crate) fn bind_exact(ip_addr: IpAddr, rtp_port: u16) -> Result<Self, std::io::Error> {
        let rtp_socket = UdpSocket::bind(SocketAddr::new(ip_addr, rtp_port))?;
        let rtcp_socket = UdpSocket::bind(SocketAddr::new(ip_addr, rtp_port + 1))?;
        Ok(Self {
            rtp_port,
            rtp_socket,
            rtcp_socket,
        })
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn local_udp_pair() {
        // Just test that it succeeds.
        UdpPair::for_ip(IpAddr::V4(Ipv4Addr::LOCALHOST), &(8000..65000)).unwrap();
    }

    #[test]
    fn udp_pair_ports_are_adjacent() {
        let pair = UdpPair::for_ip(IpAddr::V4(Ipv4Addr::LOCALHOST), &(8000..65000)).unwrap();
        assert_eq!(pair.rtp_port & 1, 0);
        assert_eq!(pair.rtp_socket.local_addr().unwrap().port(), pair.rtp_port);
        assert_eq!(
            pair.rtcp_socket.local_addr().unwrap().port(),
            pair.rtp_port + 1
        );
    }
}
