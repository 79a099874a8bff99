// Rust RTSP Server
//
// Copyright (C) 2020-2021 Sebastian Dröge <sebastian@centricular.com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use crate::error::TransportError;

use super::StreamType;

/// Negotiated transport of a single track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackTransport {
    /// Frames are interleaved into the RTSP control stream on the given
    /// (RTP, RTCP) channel id pair.
    Interleaved { channels: (u8, u8) },
    /// Frames travel over the server's UDP sockets. Ports are (RTP, RTCP)
    /// pairs.
    Udp {
        client_ports: (u16, u16),
        server_ports: (u16, u16),
    },
}

impl TrackTransport {
    fn family(&self) -> TransportFamily {
        match self {
            TrackTransport::Interleaved { .. } => TransportFamily::Interleaved,
            TrackTransport::Udp { .. } => TransportFamily::Udp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportFamily {
    Interleaved,
    Udp,
}

/// A single set-up track of a connection.
#[derive(Debug, Clone)]
pub struct Track {
    pub path: String,
    pub transport: TrackTransport,
}

/// The tracks set up on one connection, in SETUP order.
///
/// All registered tracks share one path and one transport family, and their
/// channel ids respectively client ports don't overlap. [`check`] verifies
/// those constraints for a candidate track before it is offered to the
/// application; [`insert`] assumes they hold.
///
/// [`check`]: TrackRegistry::check
/// [`insert`]: TrackRegistry::insert
#[derive(Debug, Default)]
pub(crate) struct TrackRegistry {
    tracks: Vec<(usize, Track)>,
}

impl TrackRegistry {
    pub fn new() -> Self {
        TrackRegistry { tracks: Vec::new() }
    }

    pub fn get(&self, track_id: usize) -> Option<&Track> {
        self.tracks
            .iter()
            .find(|(id, _)| *id == track_id)
            .map(|(_, track)| track)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Track)> {
        self.tracks.iter().map(|(id, track)| (*id, track))
    }

    /// Whether a candidate track can join this registry.
    pub fn check(
        &self,
        track_id: usize,
        path: &str,
        transport: &TrackTransport,
    ) -> Result<(), TransportError> {
        if self.get(track_id).is_some() {
            return Err(TransportError::TrackInUse);
        }

        if let Some((_, existing)) = self.tracks.first() {
            if existing.path != path {
                return Err(TransportError::PathMismatch);
            }

            if existing.transport.family() != transport.family() {
                return Err(TransportError::MixedFamilies);
            }
        }

        for (_, existing) in &self.tracks {
            match (&existing.transport, transport) {
                (
                    TrackTransport::Interleaved { channels: a },
                    TrackTransport::Interleaved { channels: b },
                ) => {
                    if a.0 == b.0 || a.0 == b.1 || a.1 == b.0 || a.1 == b.1 {
                        return Err(TransportError::ChannelsInUse);
                    }
                }
                (
                    TrackTransport::Udp { client_ports: a, .. },
                    TrackTransport::Udp { client_ports: b, .. },
                ) => {
                    if a.0 == b.0 || a.0 == b.1 || a.1 == b.0 || a.1 == b.1 {
                        return Err(TransportError::PortsInUse);
                    }
                }
                _ => (),
            }
        }

        Ok(())
    }

    pub fn insert(&mut self, track_id: usize, track: Track) {
        debug_assert!(self.check(track_id, &track.path, &track.transport).is_ok());

        self.tracks.push((track_id, track));
    }

    /// Map an interleaved channel id to the track and stream type it
    /// belongs to.
    pub fn track_for_channel(&self, channel_id: u8) -> Option<(usize, StreamType)> {
        self.tracks.iter().find_map(|(id, track)| match track.transport {
            TrackTransport::Interleaved { channels } if channels.0 == channel_id => {
                Some((*id, StreamType::Rtp))
            }
            TrackTransport::Interleaved { channels } if channels.1 == channel_id => {
                Some((*id, StreamType::Rtcp))
            }
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interleaved(channels: (u8, u8)) -> TrackTransport {
        TrackTransport::Interleaved { channels }
    }

    fn udp(client_ports: (u16, u16)) -> TrackTransport {
        TrackTransport::Udp {
            client_ports,
            server_ports: (8000, 8001),
        }
    }

    fn track(path: &str, transport: TrackTransport) -> Track {
        Track {
            path: path.to_string(),
            transport,
        }
    }

    #[test]
    fn tracks_share_one_path() {
        let mut registry = TrackRegistry::new();
        registry.insert(0, track("teststream", interleaved((0, 1))));

        assert_eq!(
            registry.check(1, "test12stream", &interleaved((2, 3))),
            Err(TransportError::PathMismatch)
        );
        assert_eq!(registry.check(1, "teststream", &interleaved((2, 3))), Ok(()));
    }

    #[test]
    fn tracks_share_one_family() {
        let mut registry = TrackRegistry::new();
        registry.insert(0, track("teststream", interleaved((0, 1))));

        assert_eq!(
            registry.check(1, "teststream", &udp((35466, 35467))),
            Err(TransportError::MixedFamilies)
        );
    }

    #[test]
    fn overlapping_channels_rejected() {
        let mut registry = TrackRegistry::new();
        registry.insert(0, track("teststream", interleaved((0, 1))));

        assert_eq!(
            registry.check(1, "teststream", &interleaved((1, 2))),
            Err(TransportError::ChannelsInUse)
        );
    }

    #[test]
    fn overlapping_ports_rejected() {
        let mut registry = TrackRegistry::new();
        registry.insert(0, track("teststream", udp((35466, 35467))));

        assert_eq!(
            registry.check(1, "teststream", &udp((35467, 35468))),
            Err(TransportError::PortsInUse)
        );
        assert_eq!(registry.check(1, "teststream", &udp((35468, 35469))), Ok(()));
    }

    #[test]
    fn duplicate_track_id_rejected() {
        let mut registry = TrackRegistry::new();
        registry.insert(0, track("teststream", interleaved((0, 1))));

        assert_eq!(
            registry.check(0, "teststream", &interleaved((2, 3))),
            Err(TransportError::TrackInUse)
        );
    }

    #[test]
    fn channel_lookup() {
        let mut registry = TrackRegistry::new();
        registry.insert(0, track("teststream", interleaved((0, 1))));
        registry.insert(1, track("teststream", interleaved((2, 3))));

        assert_eq!(registry.track_for_channel(0), Some((0, StreamType::Rtp)));
        assert_eq!(registry.track_for_channel(1), Some((0, StreamType::Rtcp)));
        assert_eq!(registry.track_for_channel(3), Some((1, StreamType::Rtcp)));
        assert_eq!(registry.track_for_channel(4), None);
    }
}
