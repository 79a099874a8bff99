// Rust RTSP Server
//
// Copyright (C) 2020-2021 Sebastian Dröge <sebastian@centricular.com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use rtsp_types::headers::transport::{RtpLowerTransport, RtpTransport};
use rtsp_types::headers::{Transport, TransportMode, Transports};

use crate::error::TransportError;

use super::track::{TrackRegistry, TrackTransport};

/// Outcome of a successful transport negotiation.
pub(crate) struct Negotiated {
    /// The client-proposed transport the negotiation selected.
    pub client_transport: RtpTransport,
    /// Registry entry for the new track.
    pub track_transport: TrackTransport,
    /// Transport header for the SETUP response.
    pub response_header: Transports,
}

/// Validate a client-proposed transport against the connection's existing
/// tracks and produce the server's response transport.
///
/// Only unicast delivery and play mode are supported. TCP-interleaved
/// requires an ordered channel id pair, UDP requires a client port pair and
/// configured UDP listeners. The new track must agree with all existing
/// tracks on path and transport family and must not overlap their channels
/// or ports.
pub(crate) fn negotiate(
    transports: &Transports,
    registry: &TrackRegistry,
    track_id: usize,
    path: &str,
    udp_server_ports: Option<(u16, u16)>,
) -> Result<Negotiated, TransportError> {
    let rtp = transports
        .iter()
        .find_map(|transport| match transport {
            Transport::Rtp(rtp) => Some(rtp),
            _ => None,
        })
        .ok_or(TransportError::Unsupported)?;

    if rtp.params.multicast && !rtp.params.unicast {
        return Err(TransportError::Unsupported);
    }

    if rtp.params.mode.iter().any(|mode| *mode != TransportMode::Play) {
        return Err(TransportError::Unsupported);
    }

    let track_transport = if rtp.lower_transport == Some(RtpLowerTransport::Tcp) {
        let channels = match rtp.params.interleaved {
            Some((rtp_channel, Some(rtcp_channel))) if rtcp_channel > rtp_channel => {
                (rtp_channel, rtcp_channel)
            }
            _ => return Err(TransportError::MalformedHeader),
        };

        TrackTransport::Interleaved { channels }
    } else {
        let server_ports = udp_server_ports.ok_or(TransportError::UdpUnavailable)?;

        let client_ports = match rtp.params.client_port {
            Some((rtp_port, Some(rtcp_port))) => (rtp_port, rtcp_port),
            _ => return Err(TransportError::MalformedHeader),
        };

        TrackTransport::Udp {
            client_ports,
            server_ports,
        }
    };

    registry.check(track_id, path, &track_transport)?;

    let mut response = rtp.clone();
    response.params.unicast = true;
    response.params.multicast = false;
    response.params.mode = vec![TransportMode::Play];
    if let TrackTransport::Udp { server_ports, .. } = track_transport {
        response.params.server_port = Some((server_ports.0, Some(server_ports.1)));
    }

    Ok(Negotiated {
        client_transport: rtp.clone(),
        track_transport,
        response_header: Transports::from(vec![Transport::Rtp(response)]),
    })
}
