// Copyright (C) 2024 the macula authors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::client::SessionPhase;
use crate::message::{Method, StatusCode};
use crate::{ConnectionContext, RtspMessageContext};
use bytes::Bytes;
use thiserror::Error as ThisError;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// Errors are cheaply cloneable; the first fatal error in a session is
/// latched and handed back from [`crate::client::Client::wait`] as well as
/// from every subsequent operation. Use [`Error::kind`] to inspect an error
/// programmatically; the `Display` form carries enough context to find the
/// offending message in a packet capture.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

/// Broad classification of an [`Error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The supplied RTSP URL could not be parsed.
    InvalidUrl,

    /// A socket-level failure (connect error, I/O error, EOF). Fatal.
    Network,

    /// A read or write deadline expired. Fatal.
    Timeout,

    /// Malformed RTSP framing or an unexpected message. Fatal.
    ProtocolError,

    /// A non-2xx response, excluding handled redirects and the first 401.
    Status,

    /// The method is not allowed in the session's current phase.
    StateViolation,

    /// The server rejected or under-specified every offered transport.
    TransportNegotiation,

    /// The redirect loop limit was reached. Fatal.
    TooManyRedirects,

    /// The server rejected the supplied credentials. Fatal.
    AuthFailed,

    /// The session was closed locally.
    Canceled,

    /// `rtsps` was requested but TLS is not supported.
    Tls,
}

impl Error {
    /// Returns the broad classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self.0.as_ref() {
            ErrorInt::InvalidUrl { .. } => ErrorKind::InvalidUrl,
            ErrorInt::ConnectError(_)
            | ErrorInt::ReadError { .. }
            | ErrorInt::WriteError { .. }
            | ErrorInt::UdpRecvError { .. }
            | ErrorInt::UdpSendError { .. }
            | ErrorInt::ConnectionClosed { .. } => ErrorKind::Network,
            ErrorInt::Timeout => ErrorKind::Timeout,
            ErrorInt::RtspFramingError { .. } | ErrorInt::UnassignedChannelError { .. } => {
                ErrorKind::ProtocolError
            }
            ErrorInt::RtspResponseError { .. } => ErrorKind::Status,
            ErrorInt::StateViolation { .. } | ErrorInt::FailedPrecondition(_) => {
                ErrorKind::StateViolation
            }
            ErrorInt::TransportNegotiation { .. } => ErrorKind::TransportNegotiation,
            ErrorInt::TooManyRedirects { .. } => ErrorKind::TooManyRedirects,
            ErrorInt::AuthFailed { .. } => ErrorKind::AuthFailed,
            ErrorInt::Canceled => ErrorKind::Canceled,
            ErrorInt::Tls { .. } => ErrorKind::Tls,
        }
    }

    /// Returns the status code, if the error was generated from a response.
    pub fn status_code(&self) -> Option<u16> {
        match self.0.as_ref() {
            ErrorInt::RtspResponseError { status, .. } => Some(status.0),
            _ => None,
        }
    }

    /// Returns the offending method and session phase of a
    /// [`ErrorKind::StateViolation`] error.
    pub fn state_violation(&self) -> Option<(Method, SessionPhase)> {
        match self.0.as_ref() {
            ErrorInt::StateViolation { op, phase } => Some((*op, *phase)),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, ThisError)]
pub(crate) enum ErrorInt {
    #[error("Invalid RTSP URL {url:?}: {description}")]
    InvalidUrl { url: String, description: String },

    #[error("Unable to connect to RTSP server: {0}")]
    ConnectError(#[source] std::io::Error),

    #[error("Error reading from RTSP peer: {source}\n\nconn: {conn_ctx}")]
    ReadError {
        conn_ctx: ConnectionContext,
        #[source]
        source: std::io::Error,
    },

    #[error("Error writing to RTSP peer: {source}\n\nconn: {conn_ctx}")]
    WriteError {
        conn_ctx: ConnectionContext,
        #[source]
        source: std::io::Error,
    },

    #[error("Error receiving UDP packet on track {track_id}: {source}")]
    UdpRecvError {
        track_id: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Error sending UDP packet on track {track_id}: {source}")]
    UdpSendError {
        track_id: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Server closed the RTSP connection\n\nconn: {conn_ctx}")]
    ConnectionClosed { conn_ctx: ConnectionContext },

    #[error("Timeout")]
    Timeout,

    /// Unparseable or unexpected RTSP message.
    #[error("RTSP framing error: {description}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    RtspFramingError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error(
        "Received interleaved data on unassigned channel {channel_id}: \n\
         {:?}\n\nconn: {conn_ctx}",
        crate::hex::LimitedHex::new(data, 64)
    )]
    UnassignedChannelError {
        conn_ctx: ConnectionContext,
        channel_id: u8,
        data: Bytes,
    },

    #[error("{status} response to {} CSeq={cseq}: {description}", .method.as_str())]
    RtspResponseError {
        method: Method,
        cseq: u32,
        status: StatusCode,
        description: String,
    },

    #[error("{} not allowed in {phase} phase", .op.as_str())]
    StateViolation { op: Method, phase: SessionPhase },

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Transport negotiation failed: {description}")]
    TransportNegotiation { description: String },

    #[error("Redirect limit of {limit} exceeded; last Location was {last:?}")]
    TooManyRedirects { limit: usize, last: String },

    #[error("Authentication failed: {description}")]
    AuthFailed { description: String },

    #[error("Session closed")]
    Canceled,

    #[error("TLS unsupported: {description}")]
    Tls { description: String },
}
