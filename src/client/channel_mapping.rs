// Copyright (C) 2024 the macula authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tracks RTSP interleaved channel->track assignments.

/// Whether a packet (or channel) carries media or control traffic.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Rtp,
    Rtcp,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ChannelMapping {
    pub(crate) track_id: usize,
    pub(crate) kind: PacketKind,
}

/// Interleaved channel assignments, one even/odd pair per set-up track:
/// the even channel carries the track's RTP, its odd successor the RTCP
/// ([RFC 2326 section 10.12](https://tools.ietf.org/html/rfc2326#section-10.12)
/// says `interleaved=n` also assigns channel `n+1`).
///
/// Stored as an association list of `(rtp_channel, track_id)` pairs: a
/// session has at most a handful of tracks, so a linear scan on every
/// received frame beats maintaining an index, and the entries stay inline
/// until a presentation carries more than eight tracks.
#[derive(Debug, Default)]
pub(crate) struct ChannelMappings(smallvec::SmallVec<[(u8, usize); 8]>);

impl ChannelMappings {
    /// Returns the channel pair to propose in a `SETUP` for `track_id`:
    /// twice the track id when that pair is free (the convention most
    /// servers echo back unchanged), otherwise the lowest free even
    /// channel. The server may still renegotiate; only [`Self::assign`]
    /// records the final pair.
    pub(crate) fn propose(&self, track_id: usize) -> Result<u8, String> {
        let preferred = track_id.checked_mul(2).filter(|&c| c + 1 <= usize::from(u8::MAX));
        if let Some(preferred) = preferred {
            let preferred = preferred as u8;
            if !self.is_assigned(preferred) {
                return Ok(preferred);
            }
        }
        match (0..=u8::MAX - 1).step_by(2).find(|&c| !self.is_assigned(c)) {
            Some(c) => Ok(c),
            None => Err("all interleaved channel pairs are assigned".to_owned()),
        }
    }

    fn is_assigned(&self, rtp_channel: u8) -> bool {
        self.0.iter().any(|&(c, _)| c == rtp_channel)
    }

    /// Records the pair the server settled on: `rtp_channel` (even) for
    /// RTP, its odd successor for RTCP. Each track gets exactly one pair
    /// and each pair one track; violations mean the negotiation went
    /// wrong.
    pub(crate) fn assign(&mut self, rtp_channel: u8, track_id: usize) -> Result<(), String> {
        if (rtp_channel & 1) != 0 {
            return Err(format!("can't assign odd channel id {rtp_channel}"));
        }
        if let Some(&(_, t)) = self.0.iter().find(|&&(c, _)| c == rtp_channel) {
            return Err(format!(
                "channel pair {}-{} is already assigned to track {}",
                rtp_channel,
                rtp_channel + 1,
                t
            ));
        }
        if let Some(&(c, _)) = self.0.iter().find(|&&(_, t)| t == track_id) {
            return Err(format!(
                "track {} already uses channel pair {}-{}",
                track_id,
                c,
                c + 1
            ));
        }
        self.0.push((rtp_channel, track_id));
        Ok(())
    }

    /// Resolves a received frame's channel id to its track and parity.
    pub(crate) fn lookup(&self, channel_id: u8) -> Option<ChannelMapping> {
        let rtp_channel = channel_id & !1;
        self.0
            .iter()
            .find(|&&(c, _)| c == rtp_channel)
            .map(|&(_, track_id)| ChannelMapping {
                track_id,
                kind: match (channel_id & 1) != 0 {
                    false => PacketKind::Rtp,
                    true => PacketKind::Rtcp,
                },
            })
    }
}

#[cfg(test)]
mod tests {
    use super::{ChannelMapping, PacketKind};

    #[test]
    fn propose_prefers_twice_the_track_id() {
        let mut mappings = super::ChannelMappings::default();
        assert_eq!(mappings.propose(0).unwrap(), 0);
        assert_eq!(mappings.propose(3).unwrap(), 6);
        mappings.assign(6, 0).unwrap();
        // Track 3's preferred pair is taken; the lowest free pair wins.
        assert_eq!(mappings.propose(3).unwrap(), 0);
        // A track id past the 8-bit channel space still gets a pair.
        assert_eq!(mappings.propose(500).unwrap(), 0);
    }

    #[test]
    fn assign_rejects_conflicts() {
        let mut mappings = super::ChannelMappings::default();
        mappings.assign(0, 42).unwrap();
        mappings.assign(0, 43).unwrap_err(); // pair taken
        mappings.assign(1, 43).unwrap_err(); // odd channel
        mappings.assign(2, 42).unwrap_err(); // track already paired
        mappings.assign(2, 43).unwrap();
    }

    #[test]
    fn lookup_resolves_parity() {
        let mut mappings = super::ChannelMappings::default();
        assert_eq!(mappings.lookup(0), None);
        mappings.assign(0, 42).unwrap();
        assert_eq!(
            mappings.lookup(0),
            Some(ChannelMapping {
                track_id: 42,
                kind: PacketKind::Rtp,
            })
        );
        assert_eq!(
            mappings.lookup(1),
            Some(ChannelMapping {
                track_id: 42,
                kind: PacketKind::Rtcp,
            })
        );

        // A server-renegotiated pair well past our proposal still resolves,
        // on both the RTP and the RTCP channel.
        mappings.assign(8, 26).unwrap();
        assert_eq!(
            mappings.lookup(8),
            Some(ChannelMapping {
                track_id: 26,
                kind: PacketKind::Rtp,
            })
        );
        assert_eq!(
            mappings.lookup(9),
            Some(ChannelMapping {
                track_id: 26,
                kind: PacketKind::Rtcp,
            })
        );
        assert_eq!(mappings.lookup(4), None);
    }
}
