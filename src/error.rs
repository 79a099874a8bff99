// Rust RTSP Server
//
// Copyright (C) 2020-2021 Sebastian Dröge <sebastian@centricular.com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::any::{Any, TypeId};
use std::sync::Arc;
use std::{error, fmt, ops};

use crate::conn::ConnState;

/// Request-level error.
///
/// Failures while handling a single request are reported to the peer as an
/// RTSP error response with the status code of the contained [`ServerError`];
/// the connection itself continues.
#[derive(Debug, Clone)]
pub struct Error(Arc<dyn ServerError>);

impl ops::Deref for Error {
    type Target = dyn ServerError;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl Error {
    pub fn is<T: ServerError>(&self) -> bool {
        <dyn ServerError as Any>::type_id(&*self.0) == TypeId::of::<T>()
    }

    pub fn downcast<T: ServerError>(&self) -> Option<&T> {
        if self.is::<T>() {
            unsafe { Some(&*(&*self.0 as *const dyn ServerError as *const T)) }
        } else {
            None
        }
    }
}

/// Errors that can be turned into an RTSP error response.
pub trait ServerError: Any + std::error::Error + Send + Sync {
    fn status_code(&self) -> rtsp_types::StatusCode;
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, fmt)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        error::Error::source(&*self.0)
    }
}

impl<T: ServerError + 'static> From<T> for Error {
    fn from(v: T) -> Error {
        Error(Arc::new(v))
    }
}

impl ServerError for std::io::Error {
    fn status_code(&self) -> rtsp_types::StatusCode {
        rtsp_types::StatusCode::InternalServerError
    }
}

/// Error with an arbitrary error status code.
#[derive(Debug)]
pub struct ErrorStatus(rtsp_types::StatusCode);

impl From<rtsp_types::StatusCode> for ErrorStatus {
    fn from(code: rtsp_types::StatusCode) -> Self {
        assert!(code.is_client_error() || code.is_server_error());

        Self(code)
    }
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        <rtsp_types::StatusCode as fmt::Display>::fmt(&self.0, fmt)
    }
}

impl error::Error for ErrorStatus {}

impl ServerError for ErrorStatus {
    fn status_code(&self) -> rtsp_types::StatusCode {
        self.0
    }
}

/// Request URL that can't be decomposed into a path and track id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedUrl;

impl fmt::Display for MalformedUrl {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "Malformed request URL")
    }
}

impl error::Error for MalformedUrl {}

impl ServerError for MalformedUrl {
    fn status_code(&self) -> rtsp_types::StatusCode {
        rtsp_types::StatusCode::BadRequest
    }
}

/// Request that is not legal in the connection's current state.
#[derive(Debug, Clone)]
pub struct InvalidState {
    pub method: rtsp_types::Method,
    pub state: ConnState,
}

impl fmt::Display for InvalidState {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "Method {:?} not allowed in state {:?}",
            self.method, self.state
        )
    }
}

impl error::Error for InvalidState {}

impl ServerError for InvalidState {
    fn status_code(&self) -> rtsp_types::StatusCode {
        rtsp_types::StatusCode::BadRequest
    }
}

/// Transport negotiation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No transport in the header is usable by this server.
    Unsupported,
    /// Channel ids or client ports are missing or not an ordered pair.
    MalformedHeader,
    /// The connection already uses the other transport family.
    MixedFamilies,
    /// The request path differs from the already-registered tracks' path.
    PathMismatch,
    /// Interleaved channel ids overlap an existing track.
    ChannelsInUse,
    /// Client ports overlap an existing track.
    PortsInUse,
    /// UDP was requested but the server has no UDP listeners.
    UdpUnavailable,
    /// The track id is already registered.
    TrackInUse,
}

impl fmt::Display for TransportError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Unsupported => write!(fmt, "No supported transport"),
            TransportError::MalformedHeader => write!(fmt, "Malformed transport header"),
            TransportError::MixedFamilies => {
                write!(fmt, "Transport family differs from existing tracks")
            }
            TransportError::PathMismatch => write!(fmt, "Path differs from existing tracks"),
            TransportError::ChannelsInUse => write!(fmt, "Interleaved channels already in use"),
            TransportError::PortsInUse => write!(fmt, "Client ports already in use"),
            TransportError::UdpUnavailable => write!(fmt, "No UDP listeners configured"),
            TransportError::TrackInUse => write!(fmt, "Track already set up"),
        }
    }
}

impl error::Error for TransportError {}

impl ServerError for TransportError {
    fn status_code(&self) -> rtsp_types::StatusCode {
        rtsp_types::StatusCode::BadRequest
    }
}

/// Terminal outcome of a connection's read loop.
#[derive(Debug)]
pub enum ReadError {
    /// The peer closed the connection.
    Closed,
    /// Data on the control stream that is not a valid RTSP message.
    Parse,
    /// A message exceeded the maximum accepted size.
    MessageTooBig,
    /// I/O error on the control stream.
    Io(std::io::Error),
}

impl ReadError {
    /// Whether the stream ended with a clean close from the peer.
    pub fn is_closed(&self) -> bool {
        matches!(self, ReadError::Closed)
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Closed => write!(fmt, "Stream closed"),
            ReadError::Parse => write!(fmt, "Invalid RTSP message"),
            ReadError::MessageTooBig => write!(fmt, "Maximum message size exceeded"),
            ReadError::Io(err) => write!(fmt, "I/O error: {}", err),
        }
    }
}

impl error::Error for ReadError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ReadError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ReadError {
    fn from(err: std::io::Error) -> Self {
        ReadError::Io(err)
    }
}
