// Rust RTSP Server
//
// Copyright (C) 2020-2021 Sebastian Dröge <sebastian@centricular.com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use crate::body::Body;

use super::StreamType;

/// Messages delivered into a connection's read loop from other tasks.
#[derive(Debug)]
pub(crate) enum ConnMessage {
    /// A datagram routed to this connection by one of the UDP listeners.
    UdpFrame {
        track_id: usize,
        stream_type: StreamType,
        payload: Body,
    },
    /// The send task failed writing to the peer.
    WriterError(std::io::Error),
}
