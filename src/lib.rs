// Rust RTSP Server
//
// Copyright (C) 2020-2021 Sebastian Dröge <sebastian@centricular.com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! # RTSP Connection Handling Library
//!
//! ## Overview of the components
//!
//! ### `Server`
//!
//! The [`server::Server`] binds the RTSP control port and optionally a pair
//! of UDP sockets for RTP/RTCP delivery, and yields one
//! [`conn::ServerConn`] per accepted client connection via
//! [`server::Server::accept`]. Timeouts and the UDP addresses are set
//! through [`server::ServerConfig`].
//!
//! ### `ServerConn`
//!
//! A [`conn::ServerConn`] owns a single client connection. Its read loop,
//! started with [`conn::ServerConn::read`], decodes RTSP requests and
//! TCP-interleaved data frames from the control stream, enforces the legal
//! method sequence (SETUP before PLAY, PLAY before PAUSE, ...), negotiates
//! one transport per track and dispatches to the application's
//! [`conn::ReadHandlers`]:
//!
//!  * Request handlers (`on_describe`, `on_setup`, `on_play`, ...) produce
//!    the RTSP response for their method, or an [`error::Error`] which is
//!    turned into an error response. Methods without a handler are answered
//!    with 405 Method Not Allowed.
//!  * `on_frame` receives inbound media frames, both TCP-interleaved ones
//!    and datagrams arriving on the UDP listeners.
//!
//! Outbound media frames are produced from any task via
//! [`conn::ServerConn::write_frame`]. A dedicated send task per connection
//! serializes responses and frames onto the control stream and guarantees
//! that the response to a request is on the wire before any frame produced
//! by that request's handler, so an `on_play` handler can start producing
//! frames immediately.
//!
//! The read loop finishes with an [`error::ReadError`] once the control
//! stream ends; [`error::ReadError::Closed`] for a clean disconnect.
//!
//! Message parsing and serialization is delegated to the [`rtsp_types`]
//! crate, re-exported as [`types`].

pub mod body;
pub mod channel;
pub mod conn;
pub mod error;
pub(crate) mod message_socket;
pub(crate) mod path;
pub mod server;

pub use rtsp_types as types;
pub use url::Url;
