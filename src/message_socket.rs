// Rust RTSP Server
//
// Copyright (C) 2020-2021 Sebastian Dröge <sebastian@centricular.com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Byte-level RTSP message framing.
//!
//! Turns one half of a TCP stream into a [`Stream`] of parsed
//! [`rtsp_types::Message`]s (requests, responses and interleaved data
//! frames), and the other half into a [`Sink`] for serialized messages. The
//! wire encoding itself is delegated to `rtsp-types`.

use futures::prelude::*;

use std::cmp;
use std::pin::Pin;

use crate::body::Body;
use crate::error::ReadError;

pub type MessageStream =
    Pin<Box<dyn Stream<Item = Result<rtsp_types::Message<Body>, ReadError>> + Send>>;

pub type MessageSink = Pin<Box<dyn Sink<rtsp_types::Message<Body>, Error = std::io::Error> + Send>>;

const INITIAL_BUF_SIZE: usize = 8192;

struct ReadState<R> {
    read: R,
    buf: Vec<u8>,
    filled: usize,
    max_size: usize,
}

/// Read RTSP messages from `read`.
///
/// The stream ends once the underlying byte stream signals end-of-file
/// between two messages; end-of-file in the middle of a message is reported
/// as an I/O error. Messages bigger than `max_size` abort the stream.
pub(crate) fn async_read<R: AsyncRead + Unpin + Send + 'static>(
    read: R,
    max_size: usize,
) -> impl Stream<Item = Result<rtsp_types::Message<Body>, ReadError>> + Send {
    let state = ReadState {
        read,
        buf: vec![0; INITIAL_BUF_SIZE],
        filled: 0,
        max_size,
    };

    stream::unfold(Some(state), |state| async move {
        let mut state = state?;

        loop {
            match rtsp_types::Message::<Body>::parse(&state.buf[..state.filled]) {
                Ok((msg, consumed)) => {
                    state.buf.copy_within(consumed..state.filled, 0);
                    state.filled -= consumed;

                    return Some((Ok(msg), Some(state)));
                }
                Err(rtsp_types::ParseError::Incomplete) => (),
                Err(_) => {
                    return Some((Err(ReadError::Parse), None));
                }
            }

            if state.filled >= state.max_size {
                return Some((Err(ReadError::MessageTooBig), None));
            }

            if state.filled == state.buf.len() {
                let new_size = cmp::min(2 * state.buf.len(), state.max_size);
                state.buf.resize(new_size, 0);
            }

            let ReadState {
                ref mut read,
                ref mut buf,
                filled,
                ..
            } = state;

            match read.read(&mut buf[filled..]).await {
                Ok(0) => {
                    if state.filled > 0 {
                        // Mid-message end-of-file
                        return Some((
                            Err(ReadError::Io(std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "Stream closed in the middle of a message",
                            ))),
                            None,
                        ));
                    }

                    return None;
                }
                Ok(n) => {
                    state.filled += n;
                }
                Err(err) => {
                    return Some((Err(ReadError::Io(err)), None));
                }
            }
        }
    })
}

/// Write RTSP messages to `write`, one fully-serialized message at a time.
pub(crate) fn async_write<W: AsyncWrite + Unpin + Send + 'static>(
    write: W,
) -> impl Sink<rtsp_types::Message<Body>, Error = std::io::Error> + Send {
    sink::unfold(write, |mut write, msg: rtsp_types::Message<Body>| async move {
        let mut data = Vec::new();
        msg.write(&mut data)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "Serialization failed"))?;

        write.write_all(&data).await?;
        write.flush().await?;

        Ok(write)
    })
}
