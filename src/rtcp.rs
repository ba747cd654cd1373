// Copyright (C) 2024 the macula authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Synthesizes RTCP reports as described in
//! [RFC 3550 section 6.4](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4).
//!
//! Reading sessions periodically send receiver reports summarizing what
//! arrived on each track; publishing sessions send sender reports with the
//! wallclock/RTP timestamp pair and traffic counters. Inbound RTCP is not
//! interpreted here; it is handed to the user callback as raw bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::rtp::ReportBlock;

/// The Unix epoch as an [`NtpTimestamp`].
pub(crate) const UNIX_EPOCH: NtpTimestamp = NtpTimestamp(2_208_988_800 << 32);

/// A wallclock time represented using the format of the Network Time
/// Protocol: a fixed-point count of seconds since 0h UTC on 1 January 1900,
/// integer part in the top 32 bits.
///
/// An `NtpTimestamp` isn't necessarily gathered from a real NTP server; it
/// is only as good as the local realtime clock.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct NtpTimestamp(pub(crate) u64);

impl NtpTimestamp {
    pub(crate) fn now() -> Self {
        let now = chrono::Utc::now();
        let sec_since_unix = now.timestamp().max(0) as u64;
        let nanos = u64::from(now.timestamp_subsec_nanos());
        let frac = (nanos << 32) / 1_000_000_000;
        NtpTimestamp(UNIX_EPOCH.0.wrapping_add(sec_since_unix << 32).wrapping_add(frac))
    }
}

/// A receiver report with a single report block, per
/// [RFC 3550 section 6.4.2](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4.2).
///
/// ```text
///         0                   1                   2                   3
///         0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// header |V=2|P|    RC   |   PT=RR=201   |             length            |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                     SSRC of packet sender                     |
///        +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// report |                 SSRC_1 (SSRC of first source)                 |
/// block  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   1    | fraction lost |       cumulative number of packets lost       |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |           extended highest sequence number received           |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                      interarrival jitter                      |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                         last SR (LSR)                         |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                   delay since last SR (DLSR)                  |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// LSR/DLSR are zero; sender reports from the peer are passed through to the
/// user rather than tracked here.
pub(crate) fn build_receiver_report(sender_ssrc: u32, block: &ReportBlock) -> Bytes {
    let mut buf = BytesMut::with_capacity(32);
    buf.put_u8(0x81); // V=2, P=0, RC=1
    buf.put_u8(201); // PT=RR
    buf.put_u16(7); // length in 32-bit words minus one
    buf.put_u32(sender_ssrc);
    buf.put_u32(block.ssrc);
    buf.put_u32((u32::from(block.fraction_lost) << 24) | (block.cumulative_lost & 0x00ff_ffff));
    buf.put_u32(block.highest_seq);
    buf.put_u32(block.jitter);
    buf.put_u32(0); // LSR
    buf.put_u32(0); // DLSR
    buf.freeze()
}

/// A sender report without report blocks, per
/// [RFC 3550 section 6.4.1](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4.1).
pub(crate) fn build_sender_report(
    ssrc: u32,
    ntp: NtpTimestamp,
    rtp_timestamp: u32,
    packet_count: u32,
    octet_count: u32,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(28);
    buf.put_u8(0x80); // V=2, P=0, RC=0
    buf.put_u8(200); // PT=SR
    buf.put_u16(6); // length in 32-bit words minus one
    buf.put_u32(ssrc);
    buf.put_u64(ntp.0);
    buf.put_u32(rtp_timestamp);
    buf.put_u32(packet_count);
    buf.put_u32(octet_count);
    buf.freeze()
}
