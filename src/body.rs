// Rust RTSP Server
//
// Copyright (C) 2020-2021 Sebastian Dröge <sebastian@centricular.com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::fmt;
use std::sync::Arc;

/// Body of RTSP messages and payload of media frames.
///
/// Cloning is cheap: the underlying storage is shared, not copied. Frame
/// payloads are opaque to this crate and passed through unmodified.
#[derive(Clone)]
pub struct Body(Inner);

#[derive(Clone)]
enum Inner {
    Empty,
    Vec(Arc<Vec<u8>>),
}

impl Body {
    /// Length of the body in bytes.
    pub fn len(&self) -> usize {
        match self.0 {
            Inner::Empty => 0,
            Inner::Vec(ref vec) => vec.len(),
        }
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Body {
    fn default() -> Self {
        Body(Inner::Empty)
    }
}

impl AsRef<[u8]> for Body {
    fn as_ref(&self) -> &[u8] {
        match self.0 {
            Inner::Empty => &[],
            Inner::Vec(ref vec) => vec.as_slice(),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Self {
        if vec.is_empty() {
            Body(Inner::Empty)
        } else {
            Body(Inner::Vec(Arc::new(vec)))
        }
    }
}

impl<'a> From<&'a [u8]> for Body {
    fn from(slice: &'a [u8]) -> Self {
        if slice.is_empty() {
            Body(Inner::Empty)
        } else {
            Body(Inner::Vec(Arc::new(slice.to_vec())))
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body").field("len", &self.len()).finish()
    }
}
