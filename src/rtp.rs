// Copyright (C) 2024 the macula authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Handles RTP data as described in
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).
//!
//! The library does not depacketize; it only validates the fixed header far
//! enough to feed reception statistics for receiver reports and to count
//! outbound traffic for sender reports.

/// The minimum length of an RTP header (no CSRCs or extensions).
const MIN_HEADER_LEN: usize = 12;

/// Raw packet without state-specific interpretation or metadata.
///
/// Primarily validates a raw buffer then provides accessors for it; the
/// payload itself is never examined.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug)]
pub(crate) struct RawPacket<'a>(&'a [u8]);

impl<'a> RawPacket<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Result<Self, &'static str> {
        if data.len() < MIN_HEADER_LEN {
            return Err("too short");
        }
        if (data[0] & 0b1100_0000) != 2 << 6 {
            return Err("must be version 2");
        }
        Ok(Self(data))
    }

    pub(crate) fn payload_type(&self) -> u8 {
        self.0[1] & 0x7f
    }

    pub(crate) fn sequence_number(&self) -> u16 {
        u16::from_be_bytes([self.0[2], self.0[3]])
    }

    pub(crate) fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    pub(crate) fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.0[8], self.0[9], self.0[10], self.0[11]])
    }
}

/// Per-source reception statistics, maintained as in
/// [RFC 3550 appendix A](https://datatracker.ietf.org/doc/html/rfc3550#appendix-A),
/// without the probation stage (the source is trusted: it was negotiated via
/// `SETUP`).
#[derive(Default)]
pub(crate) struct ReceptionStats {
    ssrc: Option<u32>,
    base_seq: u16,
    max_seq: u16,
    /// Count of sequence number wraparounds, shifted left 16.
    cycles: u32,
    received: u32,
    expected_prior: u32,
    received_prior: u32,
    /// Interarrival jitter, scaled by 16 per the A.8 integer update.
    jitter: u32,
    last_transit: Option<i64>,
}

/// A snapshot of reception state formatted as a report block.
pub(crate) struct ReportBlock {
    pub(crate) ssrc: u32,
    pub(crate) fraction_lost: u8,
    pub(crate) cumulative_lost: u32,
    pub(crate) highest_seq: u32,
    pub(crate) jitter: u32,
}

impl ReceptionStats {
    /// Records one received packet. `arrival` is the arrival time expressed
    /// in RTP timestamp units (monotonic clock scaled by the track's clock
    /// rate).
    pub(crate) fn record(&mut self, ssrc: u32, seq: u16, rtp_timestamp: u32, arrival: u32) {
        const MAX_DROPOUT: u16 = 3000;
        if self.ssrc.is_none() {
            self.ssrc = Some(ssrc);
            self.base_seq = seq;
            self.max_seq = seq;
        } else {
            let udelta = seq.wrapping_sub(self.max_seq);
            if udelta < MAX_DROPOUT {
                if seq < self.max_seq {
                    self.cycles = self.cycles.wrapping_add(1 << 16);
                }
                self.max_seq = seq;
            }
            // Out-of-order or wildly jumped packets still count as received.
        }
        self.received = self.received.wrapping_add(1);

        let transit = i64::from(arrival) - i64::from(rtp_timestamp);
        if let Some(last) = self.last_transit {
            let d = transit.wrapping_sub(last).unsigned_abs() as u32;
            self.jitter = self
                .jitter
                .wrapping_add(d.wrapping_sub((self.jitter + 8) >> 4));
        }
        self.last_transit = Some(transit);
    }

    /// Produces a report block and resets the per-interval counters, or
    /// `None` if no packet has been seen yet.
    pub(crate) fn report(&mut self) -> Option<ReportBlock> {
        let ssrc = self.ssrc?;
        let extended = self.cycles.wrapping_add(u32::from(self.max_seq));
        let expected = extended
            .wrapping_sub(u32::from(self.base_seq))
            .wrapping_add(1);
        let lost = expected.saturating_sub(self.received);

        let expected_interval = expected.wrapping_sub(self.expected_prior);
        let received_interval = self.received.wrapping_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received;
        let lost_interval = expected_interval.saturating_sub(received_interval);
        let fraction_lost = if expected_interval == 0 || lost_interval == 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval).min(255) as u8
        };

        Some(ReportBlock {
            ssrc,
            fraction_lost,
            cumulative_lost: lost & 0x00ff_ffff,
            highest_seq: extended,
            jitter: self.jitter >> 4,
        })
    }
}

/// Outbound counters feeding sender reports.
#[derive(Default)]
pub(crate) struct TransmissionStats {
    pub(crate) packets: u32,
    pub(crate) octets: u32,
    pub(crate) ssrc: Option<u32>,
    pub(crate) last_rtp_timestamp: Option<u32>,
}

impl TransmissionStats {
    pub(crate) fn record(&mut self, pkt: &RawPacket<'_>, payload_len: usize) {
        self.packets = self.packets.wrapping_add(1);
        self.octets = self
            .octets
            .wrapping_add(payload_len.saturating_sub(MIN_HEADER_LEN) as u32);
        self.ssrc = Some(pkt.ssrc());
        self.last_rtp_timestamp = Some(pkt.timestamp());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PKT: [u8; 16] = [
        0x80, 0x60, 0x12, 0x34, // V=2, PT=96, seq=0x1234
        0x00, 0x00, 0x03, 0xe8, // timestamp 1000
        0xde, 0xad, 0xbe, 0xef, // ssrc
        0x01, 0x02, 0x03, 0x04,
    ];

    #[test]
    fn raw_packet_accessors() {
        let pkt = RawPacket::new(&PKT).unwrap();
        assert_eq!(pkt.payload_type(), 96);
        assert_eq!(pkt.sequence_number(), 0x1234);
        assert_eq!(pkt.timestamp(), 1000);
        assert_eq!(pkt.ssrc(), 0xdead_beef);
    }

    #[test]
    fn raw_packet_rejects_short_and_bad_version() {
        RawPacket::new(&PKT[..11]).unwrap_err();
        let mut bad = PKT;
        bad[0] = 0x40;
        RawPacket::new(&bad).unwrap_err();
    }

    #[test]
    fn stats_no_loss() {
        let mut stats = ReceptionStats::default();
        for i in 0u16..10 {
            stats.record(1, 100 + i, 1000 + u32::from(i) * 90, 1000 + u32::from(i) * 90);
        }
        let block = stats.report().unwrap();
        assert_eq!(block.ssrc, 1);
        assert_eq!(block.fraction_lost, 0);
        assert_eq!(block.cumulative_lost, 0);
        assert_eq!(block.highest_seq, 109);
        assert_eq!(block.jitter, 0);
    }

    #[test]
    fn stats_counts_loss() {
        let mut stats = ReceptionStats::default();
        for seq in [100u16, 101, 103, 104, 107] {
            stats.record(1, seq, 0, 0);
        }
        let block = stats.report().unwrap();
        // seq 102, 105, 106 missing: expected 8, received 5.
        assert_eq!(block.cumulative_lost, 3);
        assert!(block.fraction_lost > 0);
    }

    #[test]
    fn stats_seq_wraparound_extends() {
        let mut stats = ReceptionStats::default();
        stats.record(1, 65534, 0, 0);
        stats.record(1, 65535, 0, 0);
        stats.record(1, 0, 0, 0);
        stats.record(1, 1, 0, 0);
        let block = stats.report().unwrap();
        assert_eq!(block.highest_seq, (1 << 16) + 1);
        assert_eq!(block.cumulative_lost, 0);
    }

    #[test]
    fn stats_empty_reports_none() {
        assert!(ReceptionStats::default().report().is_none());
    }
}
