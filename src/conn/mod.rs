// Rust RTSP Server
//
// Copyright (C) 2020-2021 Sebastian Dröge <sebastian@centricular.com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Accepted client connections.
//!
//! A [`ServerConn`] is created for every accepted control connection and
//! drives the RTSP method state machine from within [`ServerConn::read`]:
//! requests and interleaved frames are decoded from the control stream and
//! dispatched to the [`ReadHandlers`] supplied by the application, which
//! in turn can push media frames to the peer at any time via
//! [`ServerConn::write_frame`].

use futures::lock::Mutex;

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use async_std::net::TcpStream;

use log::warn;

use crate::body::Body;
use crate::channel::mpsc;
use crate::error::{Error, ReadError};
use crate::server::udp_listener::UdpEndpoint;

mod messages;
pub(crate) use messages::ConnMessage;

pub(crate) mod track;
pub use track::{Track, TrackTransport};

pub(crate) mod transport;

mod task;

/// Unique identifier for a specific connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(uuid::Uuid);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Id {
    pub(crate) fn new() -> Self {
        use once_cell::sync::Lazy;
        use std::time;
        use uuid::v1;

        static INIT: Lazy<uuid::v1::Context> = Lazy::new(|| v1::Context::new(0));

        let time = time::SystemTime::now()
            .duration_since(time::UNIX_EPOCH)
            .unwrap();

        let timestamp = v1::Timestamp::from_unix(&*INIT, time.as_secs(), time.subsec_nanos());

        let mut node_id = [0; 6];
        node_id[0..4].copy_from_slice(&std::process::id().to_be_bytes());

        Id(uuid::Uuid::new_v1(timestamp, &node_id).unwrap())
    }
}

/// State of a connection's RTSP state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No track has been set up yet.
    Initial,
    /// At least one track is set up for playing, no delivery running.
    Prelay,
    /// Delivery to the client is running.
    Play,
    /// At least one track is set up for recording.
    Prerecord,
    /// Recording from the client is running.
    Record,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            0 => ConnState::Initial,
            1 => ConnState::Prelay,
            2 => ConnState::Play,
            3 => ConnState::Prerecord,
            _ => ConnState::Record,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnState::Initial => 0,
            ConnState::Prelay => 1,
            ConnState::Play => 2,
            ConnState::Prerecord => 3,
            ConnState::Record => 4,
        }
    }
}

/// Kind of a media frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Rtp,
    Rtcp,
}

pub type OnRequestHandler = Box<
    dyn FnMut(&rtsp_types::Request<Body>) -> Result<rtsp_types::Response<Body>, Error>
        + Send
        + Sync,
>;

pub type OnSetupHandler = Box<
    dyn FnMut(
            &rtsp_types::Request<Body>,
            &rtsp_types::headers::transport::RtpTransport,
            &str,
            usize,
        ) -> Result<rtsp_types::Response<Body>, Error>
        + Send
        + Sync,
>;

pub type OnFrameHandler = Box<dyn FnMut(usize, StreamType, &[u8]) + Send + Sync>;

/// Callbacks invoked by [`ServerConn::read`].
///
/// One field per supported RTSP method plus the inbound frame callback.
/// Methods whose handler is unset are answered with 405 Method Not Allowed
/// (except OPTIONS, which has a built-in answer); frames received while
/// `on_frame` is unset are discarded.
#[derive(Default)]
pub struct ReadHandlers {
    pub on_options: Option<OnRequestHandler>,
    pub on_describe: Option<OnRequestHandler>,
    pub on_setup: Option<OnSetupHandler>,
    pub on_play: Option<OnRequestHandler>,
    pub on_pause: Option<OnRequestHandler>,
    pub on_teardown: Option<OnRequestHandler>,
    pub on_frame: Option<OnFrameHandler>,
}

impl fmt::Debug for ReadHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = |opt: bool| if opt { "Some" } else { "None" };

        f.debug_struct("ReadHandlers")
            .field("on_options", &set(self.on_options.is_some()))
            .field("on_describe", &set(self.on_describe.is_some()))
            .field("on_setup", &set(self.on_setup.is_some()))
            .field("on_play", &set(self.on_play.is_some()))
            .field("on_pause", &set(self.on_pause.is_some()))
            .field("on_teardown", &set(self.on_teardown.is_some()))
            .field("on_frame", &set(self.on_frame.is_some()))
            .finish()
    }
}

/// Error returned from [`ServerConn::write_frame`].
#[derive(Debug)]
pub enum WriteFrameError {
    /// No track with this id is set up.
    UnknownTrack,
    /// The frame queue towards the peer is full.
    QueueFull,
    /// The connection is shutting down.
    Disconnected,
    /// Sending a UDP frame failed.
    Io(std::io::Error),
}

impl fmt::Display for WriteFrameError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteFrameError::UnknownTrack => write!(fmt, "No such track"),
            WriteFrameError::QueueFull => write!(fmt, "Frame queue is full"),
            WriteFrameError::Disconnected => write!(fmt, "Connection is shutting down"),
            WriteFrameError::Io(err) => write!(fmt, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for WriteFrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WriteFrameError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WriteFrameError {
    fn from(err: std::io::Error) -> Self {
        WriteFrameError::Io(err)
    }
}

pub(crate) struct UdpHandles {
    pub rtp: UdpEndpoint,
    pub rtcp: UdpEndpoint,
}

pub(crate) struct Inner {
    id: Id,
    stream: TcpStream,
    local_addr: std::net::SocketAddr,
    peer_addr: std::net::SocketAddr,
    session_id: String,
    state: AtomicU8,
    pending_responses: AtomicUsize,
    tracks: Mutex<track::TrackRegistry>,
    frame_sender: Mutex<mpsc::Sender<rtsp_types::Message<Body>>>,
    conn_sender: Mutex<mpsc::Sender<ConnMessage>>,
    reader: Mutex<Option<ReaderParts>>,
    udp: Option<UdpHandles>,
    read_timeout: std::time::Duration,
    write_timeout: std::time::Duration,
}

struct ReaderParts {
    frame_receiver: mpsc::Receiver<rtsp_types::Message<Body>>,
    conn_receiver: mpsc::Receiver<ConnMessage>,
}

/// One accepted RTSP control connection.
///
/// Cloning is cheap and yields another handle to the same connection, e.g.
/// for producing frames from another task while the read loop runs.
#[derive(Clone)]
pub struct ServerConn {
    inner: Arc<Inner>,
}

impl fmt::Debug for ServerConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConn")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl ServerConn {
    pub(crate) fn new(
        stream: TcpStream,
        read_timeout: std::time::Duration,
        write_timeout: std::time::Duration,
        udp: Option<UdpHandles>,
    ) -> Result<ServerConn, std::io::Error> {
        let id = Id::new();
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;

        let (frame_sender, frame_receiver) = mpsc::channel();
        let (conn_sender, conn_receiver) = mpsc::channel();

        let session_id = Id::new().0.to_simple().to_string();

        Ok(ServerConn {
            inner: Arc::new(Inner {
                id,
                stream,
                local_addr,
                peer_addr,
                session_id,
                state: AtomicU8::new(ConnState::Initial.as_u8()),
                pending_responses: AtomicUsize::new(0),
                tracks: Mutex::new(track::TrackRegistry::new()),
                frame_sender: Mutex::new(frame_sender),
                conn_sender: Mutex::new(conn_sender),
                reader: Mutex::new(Some(ReaderParts {
                    frame_receiver,
                    conn_receiver,
                })),
                udp,
                read_timeout,
                write_timeout,
            }),
        })
    }

    /// Unique identifier of this connection.
    pub fn id(&self) -> Id {
        self.inner.id
    }

    /// Address of the peer.
    pub fn peer_addr(&self) -> std::net::SocketAddr {
        self.inner.peer_addr
    }

    /// Local address the peer connected to.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.inner.local_addr
    }

    /// Current state of the connection's state machine.
    ///
    /// Callable from any task; a concurrent transition is observed either
    /// before or after, never torn.
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        self.inner.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Run the connection's read loop until the control stream ends.
    ///
    /// Decodes requests and interleaved frames, drives the state machine and
    /// invokes `handlers`. Returns the terminal error of the stream;
    /// [`ReadError::Closed`] for a clean disconnect from the peer.
    ///
    /// Can only be called once per connection.
    pub async fn read(&self, handlers: ReadHandlers) -> ReadError {
        let parts = match self.inner.reader.lock().await.take() {
            Some(parts) => parts,
            None => {
                warn!("Connection {}: Read called more than once", self.inner.id);
                return ReadError::Closed;
            }
        };

        task::read_task(
            self.clone(),
            handlers,
            parts.frame_receiver,
            parts.conn_receiver,
        )
        .await
    }

    /// Send a media frame to the peer on an already set-up track.
    ///
    /// For TCP-interleaved tracks this is a bounded enqueue towards the
    /// connection's writer; the frame goes out after any response the
    /// writer still owes to the peer. For UDP tracks the frame is sent
    /// directly to the client's negotiated port.
    pub async fn write_frame(
        &self,
        track_id: usize,
        stream_type: StreamType,
        payload: impl Into<Body>,
    ) -> Result<(), WriteFrameError> {
        let payload = payload.into();

        let transport = {
            let tracks = self.inner.tracks.lock().await;
            match tracks.get(track_id) {
                Some(track) => track.transport.clone(),
                None => return Err(WriteFrameError::UnknownTrack),
            }
        };

        match transport {
            TrackTransport::Interleaved { channels } => {
                let channel_id = match stream_type {
                    StreamType::Rtp => channels.0,
                    StreamType::Rtcp => channels.1,
                };

                let data = rtsp_types::Data::new(channel_id, payload);

                self.inner
                    .frame_sender
                    .lock()
                    .await
                    .try_send(data.into())
                    .map_err(|err| {
                        if err.is_full() {
                            WriteFrameError::QueueFull
                        } else {
                            WriteFrameError::Disconnected
                        }
                    })
            }
            TrackTransport::Udp { client_ports, .. } => {
                let udp = match self.inner.udp {
                    Some(ref udp) => udp,
                    None => return Err(WriteFrameError::UnknownTrack),
                };

                let (socket, port) = match stream_type {
                    StreamType::Rtp => (&udp.rtp.socket, client_ports.0),
                    StreamType::Rtcp => (&udp.rtcp.socket, client_ports.1),
                };

                socket
                    .send_to(payload.as_ref(), (self.inner.peer_addr.ip(), port))
                    .await?;

                Ok(())
            }
        }
    }

    /// Close the connection.
    ///
    /// The read loop observes end-of-stream and returns.
    pub fn close(&self) {
        let _ = self.inner.stream.shutdown(std::net::Shutdown::Both);
    }

    pub(crate) fn inner(&self) -> &Inner {
        &self.inner
    }
}

impl Inner {
    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn peer_addr(&self) -> std::net::SocketAddr {
        self.peer_addr
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn pending_responses(&self) -> &AtomicUsize {
        &self.pending_responses
    }

    pub(crate) fn tracks(&self) -> &Mutex<track::TrackRegistry> {
        &self.tracks
    }

    pub(crate) fn conn_sender(&self) -> &Mutex<mpsc::Sender<ConnMessage>> {
        &self.conn_sender
    }

    pub(crate) fn udp(&self) -> Option<&UdpHandles> {
        self.udp.as_ref()
    }

    pub(crate) fn read_timeout(&self) -> std::time::Duration {
        self.read_timeout
    }

    pub(crate) fn write_timeout(&self) -> std::time::Duration {
        self.write_timeout
    }
}
