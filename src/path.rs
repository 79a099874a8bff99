// Rust RTSP Server
//
// Copyright (C) 2020-2021 Sebastian Dröge <sebastian@centricular.com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use crate::error::MalformedUrl;

const TRACK_ID_PREFIX: &str = "trackID=";

/// Decompose a request URL into the presentation path and the track id.
///
/// The track suffix is only recognised as the final `/`-separated segment,
/// and it may follow a query string (`rtsp://host/path?query/trackID=2`),
/// which some clients produce. Without a track suffix the track id defaults
/// to 0 so that clients addressing the stream as a whole keep working.
pub(crate) fn decompose(url: &url::Url) -> Result<(String, usize), MalformedUrl> {
    let path = url.path();
    let path = path.strip_prefix('/').unwrap_or(path);

    // The query is part of the suffix search space, not of the path
    let mut path_and_query = path.to_string();
    if let Some(query) = url.query() {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }

    let (remainder, track_id) = match path_and_query.rfind('/') {
        Some(idx) if path_and_query[idx + 1..].starts_with(TRACK_ID_PREFIX) => {
            let track_id = path_and_query[idx + 1 + TRACK_ID_PREFIX.len()..]
                .parse::<usize>()
                .map_err(|_| MalformedUrl)?;

            (&path_and_query[..idx], track_id)
        }
        _ => (path_and_query.as_str(), 0),
    };

    let remainder = match remainder.find('?') {
        Some(idx) => &remainder[..idx],
        None => remainder,
    };

    let remainder = remainder.strip_suffix('/').unwrap_or(remainder);

    Ok((remainder.to_string(), track_id))
}
