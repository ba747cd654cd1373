// Copyright (C) 2024 the macula authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP client: session state machine, transport negotiation, reader loops.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch, Mutex as TokioMutex};
use url::Url;

use crate::error::ErrorInt;
use crate::message::{headers, Data, Message, Method, Request, Response, StatusCode};
use crate::rtp::{RawPacket, ReceptionStats, TransmissionStats};
use crate::tokio::{CodecError, Connection, ReadHalf, ReceivedMessage, WriteHalf};
use crate::{ConnectionContext, Error, RtspMessageContext};

use self::channel_mapping::{ChannelMappings, PacketKind};

mod channel_mapping;
mod parse;

#[cfg(test)]
mod tests;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(15);
const DEFAULT_REDIRECT_LIMIT: usize = 5;
const DEFAULT_UDP_PORT_RANGE: Range<u16> = 8000..65000;

/// Bounds on the keep-alive period derived from the server's advertised
/// session timeout.
const KEEP_ALIVE_MIN: Duration = Duration::from_secs(5);
const KEEP_ALIVE_MAX: Duration = Duration::from_secs(30);

/// Interval between synthesized RTCP reports during streaming.
const RTCP_REPORT_PERIOD: Duration = Duration::from_secs(10);

/// Deadline for the best-effort `TEARDOWN` issued by [`Client::close`].
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Size of each datagram receive buffer. Media packets are bounded by the
/// path MTU in practice.
const UDP_RECV_BUFFER_SIZE: usize = 2048;

/// Username/password for Basic or Digest authentication.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// How RTP/RTCP packets travel between the peers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Transport {
    /// One pair of UDP sockets per track.
    #[default]
    Udp,

    /// Interleaved binary frames on the RTSP control connection.
    Tcp,
}

/// Direction of a track's media flow, as sent in the `Transport` header's
/// `mode` parameter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportMode {
    Play,
    Record,
}

impl TransportMode {
    fn as_str(self) -> &'static str {
        match self {
            TransportMode::Play => "play",
            TransportMode::Record => "record",
        }
    }
}

/// Callback invoked with `(track_id, packet)` for each arriving RTP or RTCP
/// packet. Invoked from the reader task that owns the packet's byte source;
/// it must not block indefinitely and should offload real work.
pub type PacketCallback = dyn Fn(usize, Bytes) + Send + Sync;

/// Phase of the RTSP dialog. Transitions are driven by successful method
/// calls; every fatal error lands in `Closed`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Initial,
    PreSetup,
    PrePlay,
    PreRecord,
    Play,
    Record,
    Closed,
}

impl SessionPhase {
    /// The legal outbound methods for this phase.
    fn allows(self, method: Method) -> bool {
        use Method::*;
        match self {
            SessionPhase::Initial => matches!(method, Options | Describe | Announce),
            SessionPhase::PreSetup => matches!(method, Options | Setup),
            SessionPhase::PrePlay => matches!(method, Options | Setup | Play | Teardown),
            SessionPhase::PreRecord => matches!(method, Options | Setup | Record | Teardown),
            SessionPhase::Play | SessionPhase::Record => {
                matches!(method, Options | Pause | GetParameter | Teardown)
            }
            SessionPhase::Closed => false,
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            SessionPhase::Initial => "Initial",
            SessionPhase::PreSetup => "PreSetup",
            SessionPhase::PrePlay => "PrePlay",
            SessionPhase::PreRecord => "PreRecord",
            SessionPhase::Play => "Play",
            SessionPhase::Record => "Record",
            SessionPhase::Closed => "Closed",
        })
    }
}

/// One media stream within a session.
///
/// Reading sessions obtain tracks from [`Client::describe`]; publishing
/// sessions construct them from the media descriptions they intend to
/// announce.
#[derive(Clone, Debug)]
pub struct Track {
    /// Stable per-session id, assigned by insertion order.
    pub id: usize,

    /// The raw media description. The library does not interpret the
    /// payload format; it only reads the `control` and `rtpmap` attributes.
    pub media: sdp_types::Media,

    /// Absolute control URL, if the description supplied one.
    pub control: Option<Url>,

    /// RTP clock rate in Hz, used for interarrival jitter accounting.
    pub clock_rate: u32,
}

impl Track {
    pub fn new(id: usize, media: sdp_types::Media) -> Self {
        let clock_rate = parse::clock_rate(&media);
        Self {
            id,
            media,
            control: None,
            clock_rate,
        }
    }
}

/// Options affecting the entire session.
pub struct SessionOptions {
    creds: Option<Credentials>,
    user_agent: String,
    transport: Transport,
    fallback_to_tcp: bool,
    read_timeout: Duration,
    write_timeout: Duration,
    read_buffer_count: usize,
    keep_alive_period: Option<Duration>,
    redirect_limit: usize,
    udp_port_range: Range<u16>,
    on_rtp: Option<Arc<PacketCallback>>,
    on_rtcp: Option<Arc<PacketCallback>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            creds: None,
            user_agent: concat!("macula/", env!("CARGO_PKG_VERSION")).to_owned(),
            transport: Transport::default(),
            fallback_to_tcp: false,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            read_buffer_count: 1,
            keep_alive_period: None,
            redirect_limit: DEFAULT_REDIRECT_LIMIT,
            udp_port_range: DEFAULT_UDP_PORT_RANGE,
            on_rtp: None,
            on_rtcp: None,
        }
    }
}

impl SessionOptions {
    /// Uses the given credentials when the server challenges.
    ///
    /// Credentials embedded in a URL passed to [`Client::start`] are adopted
    /// automatically when none are set here.
    pub fn creds(self, creds: Option<Credentials>) -> Self {
        Self { creds, ..self }
    }

    pub fn user_agent(self, user_agent: String) -> Self {
        Self { user_agent, ..self }
    }

    /// Preferred transport for the session's first `SETUP`.
    pub fn transport(self, transport: Transport) -> Self {
        Self { transport, ..self }
    }

    /// Retries `SETUP` over TCP once if the server rejects UDP with
    /// `461 Unsupported Transport`.
    pub fn fallback_to_tcp(self, fallback_to_tcp: bool) -> Self {
        Self {
            fallback_to_tcp,
            ..self
        }
    }

    pub fn read_timeout(self, read_timeout: Duration) -> Self {
        Self {
            read_timeout,
            ..self
        }
    }

    pub fn write_timeout(self, write_timeout: Duration) -> Self {
        Self {
            write_timeout,
            ..self
        }
    }

    /// Number of datagram buffers kept per UDP socket, allowing callbacks
    /// to retain packet payloads without forcing a fresh allocation for
    /// every receive.
    pub fn read_buffer_count(self, read_buffer_count: usize) -> Self {
        Self {
            read_buffer_count: read_buffer_count.max(1),
            ..self
        }
    }

    /// Fixed keep-alive period. When unset, half the server's advertised
    /// session timeout is used, clamped to [5 s, 30 s]; 15 s if the server
    /// advertised none.
    pub fn keep_alive_period(self, keep_alive_period: Option<Duration>) -> Self {
        Self {
            keep_alive_period,
            ..self
        }
    }

    pub fn redirect_limit(self, redirect_limit: usize) -> Self {
        Self {
            redirect_limit,
            ..self
        }
    }

    /// Local port range for UDP transport; an even RTP port is drawn from
    /// it at random.
    pub fn udp_port_range(self, udp_port_range: Range<u16>) -> Self {
        Self {
            udp_port_range,
            ..self
        }
    }

    /// Called for every arriving RTP packet.
    pub fn on_rtp<F: Fn(usize, Bytes) + Send + Sync + 'static>(self, f: F) -> Self {
        Self {
            on_rtp: Some(Arc::new(f)),
            ..self
        }
    }

    /// Called for every arriving RTCP packet.
    pub fn on_rtcp<F: Fn(usize, Bytes) + Send + Sync + 'static>(self, f: F) -> Self {
        Self {
            on_rtcp: Some(Arc::new(f)),
            ..self
        }
    }
}

/// Validates an `rtsp://` or `rtsps://` address string.
pub(crate) fn parse_url(address: &str) -> Result<Url, Error> {
    let url = Url::parse(address).map_err(|e| {
        wrap!(ErrorInt::InvalidUrl {
            url: address.to_owned(),
            description: e.to_string(),
        })
    })?;
    if url.scheme() != "rtsp" && url.scheme() != "rtsps" {
        bail!(ErrorInt::InvalidUrl {
            url: address.to_owned(),
            description: format!("unsupported scheme {:?}", url.scheme()),
        });
    }
    if url.host_str().is_none() {
        bail!(ErrorInt::InvalidUrl {
            url: address.to_owned(),
            description: "missing host".to_owned(),
        });
    }
    Ok(url)
}

fn default_port(url: &Url) -> u16 {
    match url.scheme() {
        "rtsps" => 322,
        _ => 554,
    }
}

/// Returns `url` with any userinfo removed; credentials never go on the
/// wire as part of a request target.
fn strip_credentials(url: &Url) -> Url {
    if url.username().is_empty() && url.password().is_none() {
        return url.clone();
    }
    let mut stripped = url.clone();
    let _ = stripped.set_username("");
    let _ = stripped.set_password(None);
    stripped
}

fn url_credentials(url: &Url) -> Option<Credentials> {
    if url.username().is_empty() {
        return None;
    }
    Some(Credentials {
        username: url.username().to_owned(),
        password: url.password().unwrap_or("").to_owned(),
    })
}

enum AuthScheme {
    Digest(digest_auth::WwwAuthenticateHeader),
    Basic,
}

/// Negotiated transport parameters of one track.
enum TrackTransport {
    Udp {
        rtp_socket: Arc<UdpSocket>,
        rtcp_socket: Arc<UdpSocket>,
        remote_rtp: SocketAddr,
        remote_rtcp: SocketAddr,
    },
    Tcp {
        rtp_channel: u8,
    },
}

struct TrackState {
    track: Track,
    mode: TransportMode,
    transport: Option<TrackTransport>,
    local_ssrc: u32,
    recv_stats: Arc<StdMutex<ReceptionStats>>,
    send_stats: Arc<StdMutex<TransmissionStats>>,
}

impl TrackState {
    fn new(track: Track, mode: TransportMode) -> Self {
        Self {
            track,
            mode,
            transport: None,
            local_ssrc: rand::thread_rng().gen(),
            recv_stats: Arc::new(StdMutex::new(ReceptionStats::default())),
            send_stats: Arc::new(StdMutex::new(TransmissionStats::default())),
        }
    }
}

struct SessionState {
    phase: SessionPhase,
    transport: Option<Transport>,
    tracks: BTreeMap<usize, TrackState>,
    channels: ChannelMappings,
    base_url: Option<Url>,
    get_parameter_supported: bool,
    session_established: bool,
    session_timeout: Option<Duration>,
    keepalive_spawned: bool,
    reports_spawned: bool,
}

/// State serialized by the request lock: the pre-streaming read half plus
/// everything a request cycle mutates (`CSeq`, `Session`, auth).
struct ReqState {
    read: Option<ReadHalf>,
    next_cseq: u32,
    requested_auth: Option<AuthScheme>,
    session_id: Option<Box<str>>,
}

struct Inner {
    options: SessionOptions,
    creds: StdMutex<Option<Credentials>>,

    /// Serializes outbound RTSP requests so `CSeq` assignment and `Session`
    /// adoption stay coherent.
    req: TokioMutex<ReqState>,

    /// Exclusive access to the control connection's write half. Held only
    /// for the duration of a single socket write so the reader task can
    /// answer server-initiated requests mid-stream.
    write: TokioMutex<Option<WriteHalf>>,

    state: StdMutex<SessionState>,
    conn_ctx: StdMutex<Option<ConnectionContext>>,

    /// Routes a response from the reader task to the waiting requester.
    pending: StdMutex<Option<oneshot::Sender<(Response, RtspMessageContext)>>>,

    fatal_tx: watch::Sender<Option<Error>>,
    fatal_rx: watch::Receiver<Option<Error>>,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// An RTSP client session.
///
/// Cheap to clone; clones share the same session. The public methods are
/// meant to be driven from a single user task, while internal reader and
/// timer tasks run on their own.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(options: SessionOptions) -> Self {
        let (fatal_tx, fatal_rx) = watch::channel(None);
        let creds = options.creds.clone();
        Self {
            inner: Arc::new(Inner {
                options,
                creds: StdMutex::new(creds),
                req: TokioMutex::new(ReqState {
                    read: None,
                    next_cseq: 1,
                    requested_auth: None,
                    session_id: None,
                }),
                write: TokioMutex::new(None),
                state: StdMutex::new(SessionState {
                    phase: SessionPhase::Initial,
                    transport: None,
                    tracks: BTreeMap::new(),
                    channels: ChannelMappings::default(),
                    base_url: None,
                    get_parameter_supported: false,
                    session_established: false,
                    session_timeout: None,
                    keepalive_spawned: false,
                    reports_spawned: false,
                }),
                conn_ctx: StdMutex::new(None),
                pending: StdMutex::new(None),
                fatal_tx,
                fatal_rx,
                tasks: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// The tracks known to the session, in id order.
    pub fn tracks(&self) -> Vec<Track> {
        let state = self.inner.state.lock().unwrap();
        state.tracks.values().map(|t| t.track.clone()).collect()
    }

    fn conn_ctx(&self) -> ConnectionContext {
        self.inner
            .conn_ctx
            .lock()
            .unwrap()
            .unwrap_or_else(ConnectionContext::dummy)
    }

    fn latched(&self) -> Option<Error> {
        self.inner.fatal_rx.borrow().clone()
    }

    fn check_open(&self) -> Result<(), Error> {
        match self.latched() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Latches `e` as the session's fatal error and moves to `Closed`.
    /// Returns the latched error, which is the *first* fatal error if one
    /// beat this call to it.
    fn fatal(&self, e: Error) -> Error {
        let mut prior = None;
        self.inner.fatal_tx.send_if_modified(|cur| match cur {
            Some(p) => {
                prior = Some(p.clone());
                false
            }
            None => {
                *cur = Some(e.clone());
                true
            }
        });
        self.inner.state.lock().unwrap().phase = SessionPhase::Closed;
        prior.unwrap_or(e)
    }

    fn check_phase(&self, op: Method) -> Result<(), Error> {
        if let Some(e) = self.latched() {
            return Err(e);
        }
        let phase = self.inner.state.lock().unwrap().phase;
        if !phase.allows(op) {
            bail!(ErrorInt::StateViolation { op, phase });
        }
        Ok(())
    }

    /// Connects the control connection. The session starts (and stays) in
    /// the `Initial` phase; no request is sent.
    pub async fn start(&self, url: &Url) -> Result<(), Error> {
        self.check_open()?;
        if url.scheme() == "rtsps" {
            bail!(ErrorInt::Tls {
                description: "rtsps:// requires TLS, which is not supported yet".to_owned(),
            });
        }
        if url.scheme() != "rtsp" {
            bail!(ErrorInt::InvalidUrl {
                url: url.to_string(),
                description: format!("unsupported scheme {:?}", url.scheme()),
            });
        }
        let host = match url.host_str() {
            Some(h) => h.to_owned(),
            None => bail!(ErrorInt::InvalidUrl {
                url: url.to_string(),
                description: "missing host".to_owned(),
            }),
        };
        let port = url.port().unwrap_or_else(|| default_port(url));
        if let Some(creds) = url_credentials(url) {
            let mut guard = self.inner.creds.lock().unwrap();
            if guard.is_none() {
                *guard = Some(creds);
            }
        }

        let mut rs = self.inner.req.lock().await;
        let mut write = self.inner.write.lock().await;
        if write.is_some() {
            bail!(ErrorInt::FailedPrecondition(
                "session is already connected".to_owned()
            ));
        }
        let conn = match tokio::time::timeout(
            self.inner.options.read_timeout,
            Connection::connect(&host, port),
        )
        .await
        {
            Err(_) => bail!(ErrorInt::Timeout),
            Ok(Err(e)) => bail!(ErrorInt::ConnectError(e)),
            Ok(Ok(c)) => c,
        };
        debug!("connected to {}", &conn.ctx);
        *self.inner.conn_ctx.lock().unwrap() = Some(conn.ctx);
        *write = Some(conn.write);
        rs.read = Some(conn.read);
        Ok(())
    }

    /// Replaces the control connection, used when chasing a redirect.
    /// Caller holds the request lock.
    async fn reconnect(&self, rs: &mut ReqState, url: &Url) -> Result<(), Error> {
        let host = match url.host_str() {
            Some(h) => h.to_owned(),
            None => bail!(ErrorInt::InvalidUrl {
                url: url.to_string(),
                description: "missing host".to_owned(),
            }),
        };
        let port = url.port().unwrap_or_else(|| default_port(url));
        let conn = match tokio::time::timeout(
            self.inner.options.read_timeout,
            Connection::connect(&host, port),
        )
        .await
        {
            Err(_) => bail!(ErrorInt::Timeout),
            Ok(Err(e)) => bail!(ErrorInt::ConnectError(e)),
            Ok(Ok(c)) => c,
        };
        debug!("redirected to {}", &conn.ctx);
        *self.inner.conn_ctx.lock().unwrap() = Some(conn.ctx);
        *self.inner.write.lock().await = Some(conn.write);
        rs.read = Some(conn.read);
        rs.requested_auth = None;
        Ok(())
    }

    /// Sends a single message on the control connection, bounded by the
    /// write timeout. Write failures are fatal.
    async fn write_message(&self, msg: Message) -> Result<(), Error> {
        let mut guard = self.inner.write.lock().await;
        let write = match guard.as_mut() {
            Some(w) => w,
            None => bail!(ErrorInt::FailedPrecondition(
                "session is not connected".to_owned()
            )),
        };
        match tokio::time::timeout(self.inner.options.write_timeout, write.send(msg)).await {
            Err(_) => Err(self.fatal(wrap!(ErrorInt::Timeout))),
            Ok(Err(CodecError::IoError(source))) => Err(self.fatal(wrap!(ErrorInt::WriteError {
                conn_ctx: self.conn_ctx(),
                source,
            }))),
            Ok(Err(CodecError::ParseError { .. })) => unreachable!("encoding is infallible"),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Replies to a server-initiated request (`ANNOUNCE`, `SET_PARAMETER`,
    /// ...) with `200 OK`, echoing its `CSeq`.
    async fn answer_server_request(&self, req: &Request) -> Result<(), Error> {
        debug!("answering server-initiated {} request", req.method);
        let mut resp = Response::new(StatusCode::OK, "OK");
        if let Some(cseq) = req.headers.get(headers::CSEQ) {
            resp.headers.set(headers::CSEQ, cseq);
        }
        self.write_message(Message::Response(resp)).await
    }

    /// Reads messages from the pre-streaming read half until a response
    /// arrives. The read timeout applies to the whole wait.
    async fn read_response_direct(
        &self,
        rs: &mut ReqState,
    ) -> Result<(Response, RtspMessageContext), Error> {
        loop {
            let read = match rs.read.as_mut() {
                Some(r) => r,
                None => bail!(ErrorInt::FailedPrecondition(
                    "session is not connected".to_owned()
                )),
            };
            let msg = match tokio::time::timeout(self.inner.options.read_timeout, read.next()).await
            {
                Err(_) => return Err(self.fatal(wrap!(ErrorInt::Timeout))),
                Ok(None) => {
                    return Err(self.fatal(wrap!(ErrorInt::ConnectionClosed {
                        conn_ctx: self.conn_ctx(),
                    })))
                }
                Ok(Some(Err(e))) => return Err(self.fatal(self.map_read_error(e))),
                Ok(Some(Ok(msg))) => msg,
            };
            match msg.msg {
                Message::Response(resp) => return Ok((resp, msg.ctx)),
                Message::Request(req) => self.answer_server_request(&req).await?,
                Message::Data(data) => {
                    debug!(
                        "ignoring interleaved data on channel {} before streaming",
                        data.channel_id
                    );
                }
            }
        }
    }

    fn map_read_error(&self, e: CodecError) -> Error {
        match e {
            CodecError::IoError(source) => wrap!(ErrorInt::ReadError {
                conn_ctx: self.conn_ctx(),
                source,
            }),
            CodecError::ParseError { description, pos } => wrap!(ErrorInt::RtspFramingError {
                conn_ctx: self.conn_ctx(),
                msg_ctx: RtspMessageContext {
                    pos,
                    received_wall: crate::WallTime::now(),
                },
                description,
            }),
        }
    }

    /// Core request/response cycle: assigns `CSeq`, attaches `Session` and
    /// `Authorization`, sends, and waits for the correlated response.
    /// Retries once on a 401 challenge; a second 401 is fatal.
    async fn send_inner(
        &self,
        rs: &mut ReqState,
        req: &mut Request,
    ) -> Result<(Response, RtspMessageContext), Error> {
        let mut attempted_auth = false;
        loop {
            let cseq = rs.next_cseq;
            rs.next_cseq += 1;
            req.headers.set(headers::CSEQ, cseq.to_string());
            req.headers
                .set(headers::USER_AGENT, self.inner.options.user_agent.clone());
            if let Some(session_id) = rs.session_id.as_deref() {
                req.headers.set(headers::SESSION, session_id);
            }
            if let Some(auth) = rs.requested_auth.as_mut() {
                let creds = self.inner.creds.lock().unwrap().clone();
                let creds = match creds {
                    Some(c) => c,
                    None => {
                        return Err(self.fatal(wrap!(ErrorInt::AuthFailed {
                            description: "server requires authentication; no credentials supplied"
                                .to_owned(),
                        })))
                    }
                };
                let value = authorization_for(auth, &creds, req.method, &req.url)?;
                req.headers.set(headers::AUTHORIZATION, value);
            } else {
                req.headers.remove(headers::AUTHORIZATION);
            }
            trace!("sending {} CSeq={}", req.method, cseq);

            // When the reader task owns the read half, register for the
            // routed response before writing so the response can't race us.
            let rx = if rs.read.is_none() {
                let (tx, rx) = oneshot::channel();
                *self.inner.pending.lock().unwrap() = Some(tx);
                Some(rx)
            } else {
                None
            };
            if let Err(e) = self.write_message(Message::Request(req.clone())).await {
                self.inner.pending.lock().unwrap().take();
                return Err(e);
            }
            let (resp, msg_ctx) = match rx {
                Some(rx) => {
                    match tokio::time::timeout(self.inner.options.read_timeout, rx).await {
                        Err(_) => {
                            self.inner.pending.lock().unwrap().take();
                            return Err(self.fatal(wrap!(ErrorInt::Timeout)));
                        }
                        // The reader task died; its fatal error is latched.
                        Ok(Err(_)) => {
                            return Err(match self.latched() {
                                Some(e) => e,
                                None => self.fatal(wrap!(ErrorInt::Canceled)),
                            })
                        }
                        Ok(Ok(v)) => v,
                    }
                }
                None => self.read_response_direct(rs).await?,
            };

            if parse::get_cseq(&resp.headers) != Some(cseq) {
                return Err(self.fatal(wrap!(ErrorInt::RtspFramingError {
                    conn_ctx: self.conn_ctx(),
                    msg_ctx,
                    description: format!(
                        "response CSeq {:?} doesn't match request CSeq {}",
                        resp.headers.get(headers::CSEQ),
                        cseq
                    ),
                })));
            }

            if resp.status == StatusCode::UNAUTHORIZED {
                if attempted_auth {
                    return Err(self.fatal(wrap!(ErrorInt::AuthFailed {
                        description: format!(
                            "server rejected the {} credentials",
                            match rs.requested_auth {
                                Some(AuthScheme::Basic) => "Basic",
                                _ => "Digest",
                            }
                        ),
                    })));
                }
                rs.requested_auth = Some(select_auth_scheme(&resp)?);
                attempted_auth = true;
                continue;
            }
            return Ok((resp, msg_ctx));
        }
    }

    async fn send_request(&self, req: &mut Request) -> Result<(Response, RtspMessageContext), Error> {
        self.check_open()?;
        let mut rs = self.inner.req.lock().await;
        self.send_inner(&mut rs, req).await
    }

    fn expect_success(&self, method: Method, resp: &Response) -> Result<(), Error> {
        if resp.status.is_success() {
            return Ok(());
        }
        bail!(ErrorInt::RtspResponseError {
            method,
            cseq: parse::get_cseq(&resp.headers).unwrap_or(0),
            status: resp.status,
            description: resp.reason.clone(),
        });
    }

    /// Sends `OPTIONS` and records whether the server supports
    /// `GET_PARAMETER` (used for keep-alives).
    pub async fn options(&self, url: &Url) -> Result<Response, Error> {
        self.check_phase(Method::Options)?;
        let mut req = Request::new(Method::Options, strip_credentials(url));
        let (resp, _) = self.send_request(&mut req).await?;
        self.expect_success(Method::Options, &resp)?;
        let methods = parse::parse_public(&resp);
        if !methods.is_empty() {
            self.inner.state.lock().unwrap().get_parameter_supported =
                methods.contains(&Method::GetParameter);
        }
        Ok(resp)
    }

    /// Sends `DESCRIBE` and parses the track list, following up to
    /// `redirect_limit` redirects (re-running `OPTIONS` against each new
    /// target). On success the session moves to `PrePlay` and the returned
    /// URL is the base for subsequent `SETUP`/`PLAY` requests.
    pub async fn describe(&self, url: &Url) -> Result<(Vec<Track>, Url, Response), Error> {
        self.check_phase(Method::Describe)?;
        let mut url = strip_credentials(url);
        let mut rs = self.inner.req.lock().await;
        let mut redirects = 0usize;
        loop {
            let mut req = Request::new(Method::Describe, url.clone())
                .header(headers::ACCEPT, "application/sdp");
            let (resp, msg_ctx) = self.send_inner(&mut rs, &mut req).await?;

            if resp.status.is_redirect() {
                let location = match resp.headers.get(headers::LOCATION) {
                    Some(l) => l.to_owned(),
                    None => {
                        return Err(self.fatal(wrap!(ErrorInt::RtspFramingError {
                            conn_ctx: self.conn_ctx(),
                            msg_ctx,
                            description: format!(
                                "{} redirect without a Location header",
                                resp.status
                            ),
                        })))
                    }
                };
                redirects += 1;
                if redirects > self.inner.options.redirect_limit {
                    return Err(self.fatal(wrap!(ErrorInt::TooManyRedirects {
                        limit: self.inner.options.redirect_limit,
                        last: location,
                    })));
                }
                let new_url = parse_url(&location)?;
                if let Some(creds) = url_credentials(&new_url) {
                    let mut guard = self.inner.creds.lock().unwrap();
                    if guard.is_none() {
                        *guard = Some(creds);
                    }
                }
                debug!("following {} redirect to {}", resp.status, &new_url);
                url = strip_credentials(&new_url);
                self.reconnect(&mut rs, &url).await?;

                let mut options_req = Request::new(Method::Options, url.clone());
                let (options_resp, _) = self.send_inner(&mut rs, &mut options_req).await?;
                self.expect_success(Method::Options, &options_resp)?;
                let methods = parse::parse_public(&options_resp);
                if !methods.is_empty() {
                    self.inner.state.lock().unwrap().get_parameter_supported =
                        methods.contains(&Method::GetParameter);
                }
                continue;
            }

            self.expect_success(Method::Describe, &resp)?;
            let (tracks, _base, control) =
                parse::parse_describe(&url, &resp).map_err(|description| {
                    wrap!(ErrorInt::RtspFramingError {
                        conn_ctx: self.conn_ctx(),
                        msg_ctx,
                        description,
                    })
                })?;
            {
                let mut state = self.inner.state.lock().unwrap();
                state.phase = SessionPhase::PrePlay;
                state.base_url = Some(control.clone());
                state.tracks = tracks
                    .iter()
                    .map(|t| (t.id, TrackState::new(t.clone(), TransportMode::Play)))
                    .collect();
            }
            return Ok((tracks, control, resp));
        }
    }

    /// Sends `ANNOUNCE` with the tracks encoded as SDP. On success the
    /// session moves to `PreRecord`.
    pub async fn announce(&self, url: &Url, tracks: Vec<Track>) -> Result<Response, Error> {
        self.check_phase(Method::Announce)?;
        let url = strip_credentials(url);
        let body = parse::encode_announce(&tracks).map_err(|description| {
            wrap!(ErrorInt::RtspFramingError {
                conn_ctx: self.conn_ctx(),
                msg_ctx: RtspMessageContext::dummy(),
                description,
            })
        })?;
        let mut req = Request::new(Method::Announce, url.clone())
            .header(headers::CONTENT_TYPE, "application/sdp")
            .body(body);
        let (resp, _) = self.send_request(&mut req).await?;
        self.expect_success(Method::Announce, &resp)?;
        {
            let mut state = self.inner.state.lock().unwrap();
            state.phase = SessionPhase::PreRecord;
            state.base_url = Some(url.clone());
            state.tracks = tracks
                .into_iter()
                .map(|mut t| {
                    if t.control.is_none() {
                        t.control = parse::join_control(&url, &format!("trackID={}", t.id)).ok();
                    }
                    (t.id, TrackState::new(t, TransportMode::Record))
                })
                .collect();
        }
        Ok(resp)
    }

    /// Sends `SETUP` for one track. `rtp_port == 0` auto-allocates a local
    /// UDP pair (ignored for TCP transport); explicit ports must be an
    /// adjacent even/odd pair.
    ///
    /// The first successful `SETUP` fixes the session's transport. A `461
    /// Unsupported Transport` rejection of UDP falls back to TCP once when
    /// [`SessionOptions::fallback_to_tcp`] is set.
    pub async fn setup(
        &self,
        mode: TransportMode,
        track: &Track,
        base_url: &Url,
        rtp_port: u16,
        rtcp_port: u16,
    ) -> Result<Response, Error> {
        self.check_phase(Method::Setup)?;
        {
            let state = self.inner.state.lock().unwrap();
            let phase_mode_ok = match state.phase {
                SessionPhase::PreRecord => mode == TransportMode::Record,
                SessionPhase::PrePlay | SessionPhase::PreSetup => mode == TransportMode::Play,
                _ => true,
            };
            if !phase_mode_ok {
                bail!(ErrorInt::StateViolation {
                    op: Method::Setup,
                    phase: state.phase,
                });
            }
        }
        let (session_transport, first_setup) = {
            let state = self.inner.state.lock().unwrap();
            (state.transport, state.transport.is_none())
        };
        let transport = session_transport.unwrap_or(self.inner.options.transport);

        match self
            .attempt_setup(transport, mode, track, base_url, rtp_port, rtcp_port)
            .await
        {
            Ok(resp) => Ok(resp),
            Err(e) if e.status_code() == Some(461) => {
                if transport == Transport::Udp && self.inner.options.fallback_to_tcp && first_setup
                {
                    debug!("server rejected UDP transport; retrying interleaved");
                    match self
                        .attempt_setup(Transport::Tcp, mode, track, base_url, rtp_port, rtcp_port)
                        .await
                    {
                        Ok(resp) => Ok(resp),
                        Err(e2) if e2.status_code() == Some(461) => {
                            Err(self.fatal(wrap!(ErrorInt::TransportNegotiation {
                                description: "server rejected both UDP and interleaved transport"
                                    .to_owned(),
                            })))
                        }
                        Err(e2) => Err(e2),
                    }
                } else {
                    Err(self.fatal(wrap!(ErrorInt::TransportNegotiation {
                        description: "server rejected the offered transport with 461".to_owned(),
                    })))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn attempt_setup(
        &self,
        transport: Transport,
        mode: TransportMode,
        track: &Track,
        base_url: &Url,
        rtp_port: u16,
        rtcp_port: u16,
    ) -> Result<Response, Error> {
        let setup_url = match &track.control {
            Some(c) => strip_credentials(c),
            None => strip_credentials(base_url),
        };
        let conn_ctx = self.conn_ctx();

        let (transport_header, udp_pair, proposed_channel) = match transport {
            Transport::Udp => {
                let local_ip = conn_ctx.local_addr.ip();
                let pair = if rtp_port == 0 {
                    crate::tokio::UdpPair::for_ip(local_ip, &self.inner.options.udp_port_range)
                } else {
                    if rtp_port % 2 != 0 || rtcp_port != rtp_port + 1 {
                        bail!(ErrorInt::TransportNegotiation {
                            description: format!(
                                "client ports must be an adjacent even/odd pair; got {rtp_port}-{rtcp_port}"
                            ),
                        });
                    }
                    crate::tokio::UdpPair::bind_exact(local_ip, rtp_port)
                };
                let pair = pair.map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
                let header = format!(
                    "RTP/AVP;unicast;client_port={}-{};mode={}",
                    pair.rtp_port,
                    pair.rtp_port + 1,
                    mode.as_str()
                );
                (header, Some(pair), None)
            }
            Transport::Tcp => {
                let channel = self
                    .inner
                    .state
                    .lock()
                    .unwrap()
                    .channels
                    .propose(track.id)
                    .map_err(|description| {
                        wrap!(ErrorInt::TransportNegotiation { description })
                    })?;
                let mut header = format!(
                    "RTP/AVP/TCP;unicast;interleaved={}-{}",
                    channel,
                    channel + 1
                );
                if mode == TransportMode::Record {
                    header.push_str(";mode=record");
                }
                (header, None, Some(channel))
            }
        };

        let mut req =
            Request::new(Method::Setup, setup_url).header(headers::TRANSPORT, transport_header);
        let (resp, msg_ctx) = self.send_request(&mut req).await?;
        self.expect_success(Method::Setup, &resp)?;

        let framing_err = |description: String| {
            wrap!(ErrorInt::RtspFramingError {
                conn_ctx,
                msg_ctx,
                description,
            })
        };

        // Adopt (or verify) the session id.
        let session = resp
            .headers
            .get(headers::SESSION)
            .ok_or_else(|| framing_err("SETUP response missing Session header".to_owned()))
            .and_then(|v| parse::parse_session(v).map_err(framing_err))?;
        {
            let mut rs = self.inner.req.lock().await;
            match rs.session_id.as_deref() {
                Some(old) if old != &*session.id => {
                    return Err(self.fatal(framing_err(format!(
                        "SETUP response changed session id from {:?} to {:?}",
                        old, session.id
                    ))));
                }
                Some(_) => {}
                None => rs.session_id = Some(session.id.clone()),
            }
        }

        let params = resp
            .headers
            .get(headers::TRANSPORT)
            .map(parse::parse_transport)
            .transpose()
            .map_err(framing_err)?
            .unwrap_or_default();

        let track_transport = match (transport, udp_pair) {
            (Transport::Udp, Some(pair)) => {
                let server_port = match params.server_port {
                    Some(p) => p,
                    // Deriving the peer from the first received datagram
                    // risks cross-session confusion; refuse instead.
                    None => bail!(ErrorInt::TransportNegotiation {
                        description: "SETUP response provides no server_port".to_owned(),
                    }),
                };
                let remote_ip = params
                    .source
                    .or(params.destination)
                    .unwrap_or_else(|| conn_ctx.peer_addr.ip());
                TrackTransport::Udp {
                    rtp_socket: Arc::new(pair.rtp_socket),
                    rtcp_socket: Arc::new(pair.rtcp_socket),
                    remote_rtp: SocketAddr::new(remote_ip, server_port.0),
                    remote_rtcp: SocketAddr::new(remote_ip, server_port.1),
                }
            }
            (Transport::Tcp, _) => {
                let channel = params
                    .channel_id
                    .or(proposed_channel)
                    .expect("proposed_channel is always set for TCP");
                let mut state = self.inner.state.lock().unwrap();
                state
                    .channels
                    .assign(channel, track.id)
                    .map_err(|description| {
                        wrap!(ErrorInt::TransportNegotiation { description })
                    })?;
                TrackTransport::Tcp {
                    rtp_channel: channel,
                }
            }
            (Transport::Udp, None) => unreachable!("UDP setup always binds a pair"),
        };

        {
            let mut state = self.inner.state.lock().unwrap();
            state.transport = Some(transport);
            state.session_established = true;
            if let Some(timeout_sec) = session.timeout_sec {
                state.session_timeout = Some(Duration::from_secs(u64::from(timeout_sec)));
            }
            let entry = state
                .tracks
                .entry(track.id)
                .or_insert_with(|| TrackState::new(track.clone(), mode));
            entry.mode = mode;
            entry.transport = Some(track_transport);
            if let Some(ssrc) = params.ssrc {
                entry.send_stats.lock().unwrap().ssrc = Some(ssrc);
            }
        }
        Ok(resp)
    }

    /// Sends `PLAY` and enters the streaming phase: the reader tasks and
    /// the keep-alive timer are spawned, and packets start flowing to the
    /// configured callbacks.
    pub async fn play(&self, range: Option<&str>) -> Result<Response, Error> {
        self.check_phase(Method::Play)?;
        let base_url = self.streaming_precondition()?;
        let mut req = Request::new(Method::Play, base_url)
            .header(headers::RANGE, range.unwrap_or("npt=0.000-"));
        let (resp, _) = self.send_request(&mut req).await?;
        self.expect_success(Method::Play, &resp)?;
        self.inner.state.lock().unwrap().phase = SessionPhase::Play;
        self.spawn_streaming_tasks(TransportMode::Play).await;
        Ok(resp)
    }

    /// Sends `RECORD` and enters the publishing phase.
    pub async fn record(&self) -> Result<Response, Error> {
        self.check_phase(Method::Record)?;
        let base_url = self.streaming_precondition()?;
        let mut req = Request::new(Method::Record, base_url);
        let (resp, _) = self.send_request(&mut req).await?;
        self.expect_success(Method::Record, &resp)?;
        self.inner.state.lock().unwrap().phase = SessionPhase::Record;
        self.spawn_streaming_tasks(TransportMode::Record).await;
        Ok(resp)
    }

    fn streaming_precondition(&self) -> Result<Url, Error> {
        let state = self.inner.state.lock().unwrap();
        if !state.session_established {
            bail!(ErrorInt::FailedPrecondition(
                "at least one SETUP must succeed first".to_owned()
            ));
        }
        match &state.base_url {
            Some(u) => Ok(u.clone()),
            None => bail!(ErrorInt::FailedPrecondition(
                "no aggregate control URL is known".to_owned()
            )),
        }
    }

    /// Sends `PAUSE`, returning the session to `PrePlay`/`PreRecord`. The
    /// reader tasks and keep-alive timer stay alive so streaming can be
    /// resumed with another `PLAY`/`RECORD`.
    pub async fn pause(&self) -> Result<Response, Error> {
        self.check_phase(Method::Pause)?;
        let (base_url, resumed) = {
            let state = self.inner.state.lock().unwrap();
            let resumed = match state.phase {
                SessionPhase::Record => SessionPhase::PreRecord,
                _ => SessionPhase::PrePlay,
            };
            match &state.base_url {
                Some(u) => (u.clone(), resumed),
                None => bail!(ErrorInt::FailedPrecondition(
                    "no aggregate control URL is known".to_owned()
                )),
            }
        };
        let mut req = Request::new(Method::Pause, base_url);
        let (resp, _) = self.send_request(&mut req).await?;
        self.expect_success(Method::Pause, &resp)?;
        self.inner.state.lock().unwrap().phase = resumed;
        Ok(resp)
    }

    /// Writes one RTP packet on a track. Valid only while recording.
    pub async fn write_packet_rtp(&self, track_id: usize, payload: Bytes) -> Result<(), Error> {
        self.check_open()?;
        {
            let state = self.inner.state.lock().unwrap();
            if state.phase != SessionPhase::Record {
                bail!(ErrorInt::FailedPrecondition(format!(
                    "RTP packets can only be written in the Record phase, not {}",
                    state.phase
                )));
            }
        }
        if let Ok(pkt) = RawPacket::new(&payload[..]) {
            let send_stats = {
                let state = self.inner.state.lock().unwrap();
                state.tracks.get(&track_id).map(|t| t.send_stats.clone())
            };
            if let Some(send_stats) = send_stats {
                send_stats.lock().unwrap().record(&pkt, payload.len());
            }
        }
        self.write_packet(track_id, PacketKind::Rtp, payload).await
    }

    /// Writes one RTCP packet on a track. Valid while recording, or while
    /// playing (receiver feedback).
    pub async fn write_packet_rtcp(&self, track_id: usize, payload: Bytes) -> Result<(), Error> {
        self.check_open()?;
        {
            let state = self.inner.state.lock().unwrap();
            if !matches!(state.phase, SessionPhase::Play | SessionPhase::Record) {
                bail!(ErrorInt::FailedPrecondition(format!(
                    "RTCP packets can only be written in the Play or Record phase, not {}",
                    state.phase
                )));
            }
        }
        self.write_packet(track_id, PacketKind::Rtcp, payload).await
    }

    async fn write_packet(
        &self,
        track_id: usize,
        kind: PacketKind,
        payload: Bytes,
    ) -> Result<(), Error> {
        enum Target {
            Udp(Arc<UdpSocket>, SocketAddr),
            Tcp(u8),
        }
        let target = {
            let state = self.inner.state.lock().unwrap();
            let track = match state.tracks.get(&track_id) {
                Some(t) => t,
                None => bail!(ErrorInt::FailedPrecondition(format!(
                    "unknown track id {track_id}"
                ))),
            };
            match &track.transport {
                Some(TrackTransport::Udp {
                    rtp_socket,
                    rtcp_socket,
                    remote_rtp,
                    remote_rtcp,
                    ..
                }) => match kind {
                    PacketKind::Rtp => Target::Udp(rtp_socket.clone(), *remote_rtp),
                    PacketKind::Rtcp => Target::Udp(rtcp_socket.clone(), *remote_rtcp),
                },
                Some(TrackTransport::Tcp { rtp_channel }) => Target::Tcp(match kind {
                    PacketKind::Rtp => *rtp_channel,
                    PacketKind::Rtcp => *rtp_channel + 1,
                }),
                None => bail!(ErrorInt::FailedPrecondition(format!(
                    "track {track_id} has no negotiated transport"
                ))),
            }
        };
        match target {
            Target::Udp(socket, addr) => {
                match tokio::time::timeout(
                    self.inner.options.write_timeout,
                    socket.send_to(&payload, addr),
                )
                .await
                {
                    Err(_) => Err(self.fatal(wrap!(ErrorInt::Timeout))),
                    Ok(Err(source)) => {
                        Err(self.fatal(wrap!(ErrorInt::UdpSendError { track_id, source })))
                    }
                    Ok(Ok(_)) => Ok(()),
                }
            }
            Target::Tcp(channel_id) => {
                if payload.len() > usize::from(u16::MAX) {
                    bail!(ErrorInt::FailedPrecondition(format!(
                        "interleaved payload of {} bytes exceeds the 16-bit length field",
                        payload.len()
                    )));
                }
                self.write_message(Message::Data(Data {
                    channel_id,
                    payload,
                }))
                .await
            }
        }
    }

    /// Blocks until the session dies and returns the terminating error:
    /// the first fatal error, or `Canceled` after a local [`Client::close`].
    pub async fn wait(&self) -> Error {
        let mut rx = self.inner.fatal_rx.clone();
        loop {
            if let Some(e) = rx.borrow_and_update().clone() {
                return e;
            }
            if rx.changed().await.is_err() {
                return wrap!(ErrorInt::Canceled);
            }
        }
    }

    /// Tears the session down: best-effort `TEARDOWN` (bounded by a short
    /// deadline), then cancels all internal tasks and releases all sockets.
    /// [`Client::wait`] returns `Canceled` unless a fatal error preceded.
    pub async fn close(&self) {
        let do_teardown = {
            let state = self.inner.state.lock().unwrap();
            state.session_established
                && state.phase != SessionPhase::Closed
                && state.base_url.is_some()
        };
        if do_teardown && self.latched().is_none() {
            let base_url = self.inner.state.lock().unwrap().base_url.clone();
            if let Some(base_url) = base_url {
                let mut req = Request::new(Method::Teardown, base_url);
                match tokio::time::timeout(TEARDOWN_TIMEOUT, self.send_request(&mut req)).await {
                    Ok(Ok(_)) => debug!("TEARDOWN succeeded"),
                    Ok(Err(e)) => debug!("TEARDOWN failed: {e}"),
                    Err(_) => debug!("TEARDOWN timed out"),
                }
            }
        }
        self.fatal(wrap!(ErrorInt::Canceled));
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.inner.req.lock().await.read = None;
        *self.inner.write.lock().await = None;
        self.inner.state.lock().unwrap().tracks.clear();
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        self.inner
            .tasks
            .lock()
            .unwrap()
            .push(tokio::spawn(task));
    }

    /// Spawns the streaming-phase tasks (idempotent across `PAUSE`/`PLAY`
    /// cycles): the control-connection reader, per-socket UDP readers, the
    /// keep-alive timer, and the RTCP report timer.
    async fn spawn_streaming_tasks(&self, mode: TransportMode) {
        let read = self.inner.req.lock().await.read.take();
        let transport = self.inner.state.lock().unwrap().transport;

        if let Some(read) = read {
            let enforce_timeout =
                transport == Some(Transport::Tcp) && mode == TransportMode::Play;
            let client = self.clone();
            self.spawn(run_tcp_reader(client, read, enforce_timeout));
        }

        if transport == Some(Transport::Udp) {
            let readers = {
                let state = self.inner.state.lock().unwrap();
                let mut readers = Vec::new();
                for (id, track) in &state.tracks {
                    if let Some(TrackTransport::Udp {
                        rtp_socket,
                        rtcp_socket,
                        remote_rtp,
                        remote_rtcp,
                    }) = &track.transport
                    {
                        if track.mode == TransportMode::Play {
                            readers.push(UdpReader {
                                socket: rtp_socket.clone(),
                                track_id: *id,
                                kind: PacketKind::Rtp,
                                remote: *remote_rtp,
                                clock_rate: track.track.clock_rate,
                                stats: Some(track.recv_stats.clone()),
                                enforce_timeout: true,
                            });
                        }
                        readers.push(UdpReader {
                            socket: rtcp_socket.clone(),
                            track_id: *id,
                            kind: PacketKind::Rtcp,
                            remote: *remote_rtcp,
                            clock_rate: track.track.clock_rate,
                            stats: None,
                            enforce_timeout: false,
                        });
                    }
                }
                readers
            };
            for reader in readers {
                self.spawn(run_udp_reader(self.clone(), reader));
            }
        }

        let (spawn_keepalive, spawn_reports, keepalive_period) = {
            let mut state = self.inner.state.lock().unwrap();
            let keepalive_period = self.inner.options.keep_alive_period.unwrap_or_else(|| {
                match state.session_timeout {
                    Some(t) => (t / 2).clamp(KEEP_ALIVE_MIN, KEEP_ALIVE_MAX),
                    None => DEFAULT_KEEP_ALIVE_PERIOD,
                }
            });
            let spawn_keepalive = !state.keepalive_spawned;
            state.keepalive_spawned = true;
            let want_reports = mode == TransportMode::Record
                || (mode == TransportMode::Play && transport == Some(Transport::Udp));
            let spawn_reports = want_reports && !state.reports_spawned;
            state.reports_spawned |= want_reports;
            (spawn_keepalive, spawn_reports, keepalive_period)
        };
        if spawn_keepalive {
            self.spawn(run_keepalive(self.clone(), keepalive_period));
        }
        if spawn_reports {
            self.spawn(run_rtcp_reports(self.clone(), mode));
        }
    }

    fn dispatch_packet(&self, track_id: usize, kind: PacketKind, payload: Bytes) {
        let callback = match kind {
            PacketKind::Rtp => self.inner.options.on_rtp.clone(),
            PacketKind::Rtcp => self.inner.options.on_rtcp.clone(),
        };
        if let Some(callback) = callback {
            (*callback)(track_id, payload);
        }
    }
}

fn select_auth_scheme(resp: &Response) -> Result<AuthScheme, Error> {
    let mut basic_offered = false;
    for value in resp.headers.get_all(headers::WWW_AUTHENTICATE) {
        if value.starts_with("Digest") {
            let header = digest_auth::WwwAuthenticateHeader::parse(value).map_err(|e| {
                wrap!(ErrorInt::AuthFailed {
                    description: format!("unparseable Digest challenge: {e}"),
                })
            })?;
            return Ok(AuthScheme::Digest(header));
        } else if value.starts_with("Basic") {
            basic_offered = true;
        }
    }
    if basic_offered {
        return Ok(AuthScheme::Basic);
    }
    bail!(ErrorInt::AuthFailed {
        description: "401 response offers no supported authentication scheme".to_owned(),
    });
}

fn authorization_for(
    auth: &mut AuthScheme,
    creds: &Credentials,
    method: Method,
    url: &Url,
) -> Result<String, Error> {
    match auth {
        AuthScheme::Digest(challenge) => {
            let http_method =
                digest_auth::HttpMethod(std::borrow::Cow::Borrowed(method.as_str()));
            let ctx = digest_auth::AuthContext::new_with_method(
                &creds.username,
                &creds.password,
                url.as_str(),
                Option::<&'static [u8]>::None,
                http_method,
            );
            let answer = challenge.respond(&ctx).map_err(|e| {
                wrap!(ErrorInt::AuthFailed {
                    description: format!("unable to answer Digest challenge: {e}"),
                })
            })?;
            Ok(answer.to_string())
        }
        AuthScheme::Basic => {
            use base64::Engine as _;
            let token = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", creds.username, creds.password));
            Ok(format!("Basic {token}"))
        }
    }
}

/// Owns the control connection's read half during the streaming phase:
/// dispatches interleaved frames to callbacks, routes responses to the
/// waiting requester, and acknowledges server-initiated requests.
async fn run_tcp_reader(client: Client, mut read: ReadHalf, enforce_timeout: bool) {
    let read_timeout = client.inner.options.read_timeout;
    let mut fatal_rx = client.inner.fatal_rx.clone();
    loop {
        if fatal_rx.borrow_and_update().is_some() {
            break;
        }
        let next = tokio::select! {
            _ = fatal_rx.changed() => break,
            r = tokio::time::timeout(read_timeout, read.next()) => r,
        };
        let item = match next {
            Err(_) => {
                // Media stops flowing while paused; only a streaming
                // session is held to the inactivity deadline.
                let playing = client.inner.state.lock().unwrap().phase == SessionPhase::Play;
                if enforce_timeout && playing {
                    client.fatal(wrap!(ErrorInt::Timeout));
                    break;
                }
                continue;
            }
            Ok(item) => item,
        };
        match item {
            None => {
                client.fatal(wrap!(ErrorInt::ConnectionClosed {
                    conn_ctx: client.conn_ctx(),
                }));
                break;
            }
            Some(Err(e)) => {
                let e = client.map_read_error(e);
                client.fatal(e);
                break;
            }
            Some(Ok(ReceivedMessage { ctx, msg })) => match msg {
                Message::Data(data) => {
                    let mapping = client
                        .inner
                        .state
                        .lock()
                        .unwrap()
                        .channels
                        .lookup(data.channel_id);
                    match mapping {
                        Some(m) => client.dispatch_packet(m.track_id, m.kind, data.payload),
                        None => {
                            client.fatal(wrap!(ErrorInt::UnassignedChannelError {
                                conn_ctx: client.conn_ctx(),
                                channel_id: data.channel_id,
                                data: data.payload,
                            }));
                            break;
                        }
                    }
                }
                Message::Response(resp) => {
                    let pending = client.inner.pending.lock().unwrap().take();
                    match pending {
                        Some(tx) => {
                            let _ = tx.send((resp, ctx));
                        }
                        None => debug!("dropping response with no request in flight at {ctx}"),
                    }
                }
                Message::Request(req) => {
                    if client.answer_server_request(&req).await.is_err() {
                        break;
                    }
                }
            },
        }
    }
    // Unblock any requester still waiting on a routed response.
    client.inner.pending.lock().unwrap().take();
}

struct UdpReader {
    socket: Arc<UdpSocket>,
    track_id: usize,
    kind: PacketKind,
    remote: SocketAddr,
    clock_rate: u32,
    stats: Option<Arc<StdMutex<ReceptionStats>>>,
    enforce_timeout: bool,
}

/// Drains one UDP socket, feeding the matching callback. Datagrams from
/// anyone but the negotiated peer are dropped.
async fn run_udp_reader(client: Client, reader: UdpReader) {
    let UdpReader {
        socket,
        track_id,
        kind,
        remote,
        clock_rate,
        stats,
        enforce_timeout,
    } = reader;
    let read_timeout = client.inner.options.read_timeout;
    let mut fatal_rx = client.inner.fatal_rx.clone();
    let epoch = Instant::now();

    // Buffers are carved out of an arena sized by `read_buffer_count` so
    // callbacks can hold onto `read_buffer_count` payloads before a new
    // allocation happens.
    let arena_size = UDP_RECV_BUFFER_SIZE * client.inner.options.read_buffer_count;
    let mut arena = bytes::BytesMut::with_capacity(arena_size);

    loop {
        if fatal_rx.borrow_and_update().is_some() {
            break;
        }
        if arena.capacity() < UDP_RECV_BUFFER_SIZE {
            arena = bytes::BytesMut::with_capacity(arena_size);
        }
        arena.resize(UDP_RECV_BUFFER_SIZE, 0);
        let recv = tokio::select! {
            _ = fatal_rx.changed() => break,
            r = tokio::time::timeout(read_timeout, socket.recv_from(&mut arena[..])) => r,
        };
        let (len, from) = match recv {
            Err(_) => {
                let playing = client.inner.state.lock().unwrap().phase == SessionPhase::Play;
                if enforce_timeout && playing {
                    client.fatal(wrap!(ErrorInt::Timeout));
                    break;
                }
                continue;
            }
            Ok(Err(source)) => {
                client.fatal(wrap!(ErrorInt::UdpRecvError { track_id, source }));
                break;
            }
            Ok(Ok(v)) => v,
        };
        if from != remote {
            trace!("dropping datagram from unexpected peer {from} (expected {remote})");
            continue;
        }
        let payload = arena.split_to(len).freeze();
        if kind == PacketKind::Rtp {
            if let (Some(stats), Ok(pkt)) = (&stats, RawPacket::new(&payload[..])) {
                let arrival =
                    (epoch.elapsed().as_secs_f64() * f64::from(clock_rate)) as u64 as u32;
                stats.lock().unwrap().record(
                    pkt.ssrc(),
                    pkt.sequence_number(),
                    pkt.timestamp(),
                    arrival,
                );
            }
        }
        client.dispatch_packet(track_id, kind, payload);
    }
}

/// Periodically refreshes the session so the server doesn't expire it:
/// `GET_PARAMETER` when advertised and legal in the current phase,
/// `OPTIONS` otherwise.
async fn run_keepalive(client: Client, period: Duration) {
    let mut fatal_rx = client.inner.fatal_rx.clone();
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = fatal_rx.changed() => break,
            _ = interval.tick() => {}
        }
        if client.latched().is_some() {
            break;
        }
        let (method, base_url) = {
            let state = client.inner.state.lock().unwrap();
            if state.phase == SessionPhase::Closed {
                break;
            }
            let streaming = matches!(state.phase, SessionPhase::Play | SessionPhase::Record);
            let method = if state.get_parameter_supported && streaming {
                Method::GetParameter
            } else {
                Method::Options
            };
            match &state.base_url {
                Some(u) => (method, u.clone()),
                None => continue,
            }
        };
        let mut req = Request::new(method, base_url);
        match client.send_request(&mut req).await {
            // The keep-alive only has to reach the server; its status is
            // irrelevant.
            Ok(_) => trace!("keep-alive {} acknowledged", method),
            Err(e) => {
                if client.latched().is_some() {
                    break;
                }
                warn!("keep-alive {} failed: {}", method, e);
            }
        }
    }
}

/// Sends periodic RTCP reports: receiver reports for reading sessions (UDP
/// only, summarizing reception statistics), sender reports for publishing
/// sessions.
async fn run_rtcp_reports(client: Client, mode: TransportMode) {
    let mut fatal_rx = client.inner.fatal_rx.clone();
    let mut interval = tokio::time::interval_at(
        tokio::time::Instant::now() + RTCP_REPORT_PERIOD,
        RTCP_REPORT_PERIOD,
    );
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = fatal_rx.changed() => break,
            _ = interval.tick() => {}
        }
        if client.latched().is_some() {
            break;
        }

        enum Outbound {
            Udp(Arc<UdpSocket>, SocketAddr, Bytes),
            Tcp(u8, Bytes),
        }
        let outbound = {
            let state = client.inner.state.lock().unwrap();
            if !matches!(state.phase, SessionPhase::Play | SessionPhase::Record) {
                continue;
            }
            let mut outbound = Vec::new();
            for track in state.tracks.values() {
                let pkt = match mode {
                    TransportMode::Play => {
                        let block = track.recv_stats.lock().unwrap().report();
                        match block {
                            Some(block) => {
                                crate::rtcp::build_receiver_report(track.local_ssrc, &block)
                            }
                            None => continue,
                        }
                    }
                    TransportMode::Record => {
                        let stats = track.send_stats.lock().unwrap();
                        if stats.packets == 0 {
                            continue;
                        }
                        crate::rtcp::build_sender_report(
                            stats.ssrc.unwrap_or(track.local_ssrc),
                            crate::rtcp::NtpTimestamp::now(),
                            stats.last_rtp_timestamp.unwrap_or(0),
                            stats.packets,
                            stats.octets,
                        )
                    }
                };
                match &track.transport {
                    Some(TrackTransport::Udp {
                        rtcp_socket,
                        remote_rtcp,
                        ..
                    }) => outbound.push(Outbound::Udp(rtcp_socket.clone(), *remote_rtcp, pkt)),
                    Some(TrackTransport::Tcp { rtp_channel }) => {
                        outbound.push(Outbound::Tcp(rtp_channel + 1, pkt))
                    }
                    None => {}
                }
            }
            outbound
        };

        for item in outbound {
            let result = match item {
                Outbound::Udp(socket, addr, pkt) => {
                    match tokio::time::timeout(
                        client.inner.options.write_timeout,
                        socket.send_to(&pkt, addr),
                    )
                    .await
                    {
                        Err(_) => Err(client.fatal(wrap!(ErrorInt::Timeout))),
                        Ok(Err(e)) => {
                            warn!("RTCP report send failed: {e}");
                            Ok(())
                        }
                        Ok(Ok(_)) => Ok(()),
                    }
                }
                Outbound::Tcp(channel_id, pkt) => {
                    client
                        .write_message(Message::Data(Data {
                            channel_id,
                            payload: pkt,
                        }))
                        .await
                }
            };
            if result.is_err() {
                return;
            }
        }
    }
}
