use futures::prelude::*;

use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use log::{debug, trace, warn};

use async_std::future::timeout;
use async_std::task;

use pin_utils::pin_mut;

use crate::body::Body;
use crate::channel::mpsc;
use crate::error::{InvalidState, ReadError, ServerError};
use crate::message_socket::{self, MessageSink, MessageStream};
use crate::path;
use crate::server::udp_listener;
use crate::server::MAX_MESSAGE_SIZE;

use super::track::{Track, TrackTransport};
use super::transport;
use super::{ConnMessage, ConnState, ReadHandlers, ServerConn};

enum RequestOutcome {
    Continue,
    Teardown,
}

enum Item {
    Conn(Option<ConnMessage>),
    Rtsp(Option<Result<rtsp_types::Message<Body>, ReadError>>),
    TimedOut,
}

/// Run a connection's read loop to completion.
///
/// Spawns the send task, drives the state machine and, once the control
/// stream ends, tears the send task down again. The returned error is the
/// stream-ending condition surfaced to the owner of the connection.
pub(crate) async fn read_task(
    conn: ServerConn,
    handlers: ReadHandlers,
    frame_receiver: mpsc::Receiver<rtsp_types::Message<Body>>,
    mut conn_receiver: mpsc::Receiver<ConnMessage>,
) -> ReadError {
    let id = conn.inner().id();

    let stream = conn.inner().stream().clone();
    let mut rtsp_stream: MessageStream =
        Box::pin(message_socket::async_read(stream.clone(), MAX_MESSAGE_SIZE));
    let rtsp_sink: MessageSink = Box::pin(message_socket::async_write(stream));

    let (resp_sender, resp_receiver) = mpsc::channel();

    let send_task = task::spawn(send_task(
        conn.clone(),
        rtsp_sink,
        resp_receiver,
        frame_receiver,
    ));

    let mut read = ReadTask {
        conn: conn.clone(),
        handlers,
        resp_sender,
    };

    let err = read.run(&mut rtsp_stream, &mut conn_receiver).await;

    debug!("Connection {}: Read loop finished: {}", id, err);

    // Let the send task flush responses it still owes, then stop it.
    // Queued frames are dropped with it.
    read.resp_sender.close_channel();
    conn_receiver.close();

    deregister_udp_routes(&conn).await;

    send_task.await;

    conn.close();

    err
}

async fn deregister_udp_routes(conn: &ServerConn) {
    let inner = conn.inner();

    let udp = match inner.udp() {
        Some(udp) => udp,
        None => return,
    };

    let peer_ip = inner.peer_addr().ip();

    let tracks = inner.tracks().lock().await;
    for (_, track) in tracks.iter() {
        if let TrackTransport::Udp { client_ports, .. } = track.transport {
            udp.rtp
                .routes
                .lock()
                .await
                .remove(&(peer_ip, client_ports.0));
            udp.rtcp
                .routes
                .lock()
                .await
                .remove(&(peer_ip, client_ports.1));
        }
    }
}

struct ReadTask {
    conn: ServerConn,
    handlers: ReadHandlers,
    resp_sender: mpsc::Sender<rtsp_types::Message<Body>>,
}

impl ReadTask {
    async fn run(
        &mut self,
        rtsp_stream: &mut MessageStream,
        conn_receiver: &mut mpsc::Receiver<ConnMessage>,
    ) -> ReadError {
        let id = self.conn.inner().id();

        loop {
            let item = {
                use future::Either::{Left, Right};

                let conn_fut = conn_receiver.next();
                let rtsp_fut = rtsp_stream.next();

                if self.conn.state() != ConnState::Play {
                    // Idle timeout, but only while no delivery is running
                    let rtsp_fut = timeout(self.conn.inner().read_timeout(), rtsp_fut);
                    pin_mut!(rtsp_fut);

                    match future::select(conn_fut, rtsp_fut).await {
                        Left((msg, _)) => Item::Conn(msg),
                        Right((Ok(msg), _)) => Item::Rtsp(msg),
                        Right((Err(_), _)) => Item::TimedOut,
                    }
                } else {
                    match future::select(conn_fut, rtsp_fut).await {
                        Left((msg, _)) => Item::Conn(msg),
                        Right((msg, _)) => Item::Rtsp(msg),
                    }
                }
            };

            match item {
                Item::Conn(Some(ConnMessage::UdpFrame {
                    track_id,
                    stream_type,
                    payload,
                })) => {
                    if let Some(ref mut on_frame) = self.handlers.on_frame {
                        on_frame(track_id, stream_type, payload.as_ref());
                    }
                }
                Item::Conn(Some(ConnMessage::WriterError(err))) => {
                    warn!("Connection {}: Send error {}", id, err);
                    return ReadError::Io(err);
                }
                Item::Conn(None) => {
                    // The connection handle keeps a sender alive
                    return ReadError::Closed;
                }
                Item::Rtsp(Some(Ok(rtsp_types::Message::Request(req)))) => {
                    trace!("Connection {}: Received request {:?}", id, req);

                    match self.handle_request(req).await {
                        Ok(RequestOutcome::Continue) => (),
                        Ok(RequestOutcome::Teardown) => {
                            debug!("Connection {}: Torn down", id);
                            return ReadError::Closed;
                        }
                        Err(err) => return err,
                    }
                }
                Item::Rtsp(Some(Ok(rtsp_types::Message::Data(data)))) => {
                    self.handle_data(data).await;
                }
                Item::Rtsp(Some(Ok(rtsp_types::Message::Response(resp)))) => {
                    debug!("Connection {}: Dropping unexpected response {:?}", id, resp);
                }
                Item::Rtsp(Some(Err(err))) => {
                    warn!("Connection {}: Receive error {}", id, err);
                    return err;
                }
                Item::Rtsp(None) => {
                    debug!("Connection {}: Disconnected", id);
                    return ReadError::Closed;
                }
                Item::TimedOut => {
                    warn!("Connection {}: Timed out", id);
                    return ReadError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "Read timed out",
                    ));
                }
            }
        }
    }

    async fn handle_data(&mut self, data: rtsp_types::Data<Body>) {
        let channel_id = data.channel_id();

        let target = self
            .conn
            .inner()
            .tracks()
            .lock()
            .await
            .track_for_channel(channel_id);

        match target {
            Some((track_id, stream_type)) => {
                if let Some(ref mut on_frame) = self.handlers.on_frame {
                    let payload = data.into_body();
                    on_frame(track_id, stream_type, payload.as_ref());
                }
            }
            None => {
                trace!(
                    "Connection {}: Dropping data on unknown channel {}",
                    self.conn.inner().id(),
                    channel_id
                );
            }
        }
    }

    async fn handle_request(
        &mut self,
        req: rtsp_types::Request<Body>,
    ) -> Result<RequestOutcome, ReadError> {
        use rtsp_types::headers::CSeq;

        let id = self.conn.inner().id();

        self.conn
            .inner()
            .pending_responses()
            .fetch_add(1, Ordering::SeqCst);

        let cseq = match req.typed_header::<CSeq>() {
            Ok(Some(cseq)) => Some(*cseq),
            _ => None,
        };

        let (mut resp, outcome) = match cseq {
            Some(_) => self.dispatch(&req).await,
            None => {
                warn!("Connection {}: No valid CSeq in request", id);

                (
                    error_response(req.version(), rtsp_types::StatusCode::BadRequest),
                    RequestOutcome::Continue,
                )
            }
        };

        if let Some(cseq) = cseq {
            resp.insert_typed_header(&CSeq::from(cseq));
        }

        resp.insert_header(
            rtsp_types::headers::SERVER,
            concat!("rtsp-relay/", env!("CARGO_PKG_VERSION")),
        );
        {
            use chrono::prelude::*;
            let date = Local::now();
            resp.insert_header(rtsp_types::headers::DATE, date.to_rfc2822());
        }

        trace!("Connection {}: Sending response {:?}", id, resp);

        if self.resp_sender.try_send(resp.into()).is_err() {
            warn!("Connection {}: Can't queue response", id);

            return Err(ReadError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "Response queue unavailable",
            )));
        }

        Ok(outcome)
    }

    async fn dispatch(
        &mut self,
        req: &rtsp_types::Request<Body>,
    ) -> (rtsp_types::Response<Body>, RequestOutcome) {
        let id = self.conn.inner().id();
        let method = req.method().clone();
        let state = self.conn.state();

        let allowed = match method {
            rtsp_types::Method::Options | rtsp_types::Method::Teardown => true,
            rtsp_types::Method::Describe | rtsp_types::Method::Setup => {
                matches!(state, ConnState::Initial | ConnState::Prelay)
            }
            rtsp_types::Method::Play | rtsp_types::Method::Pause => {
                matches!(state, ConnState::Prelay | ConnState::Play)
            }
            _ => {
                debug!("Connection {}: Unsupported method {:?}", id, method);

                return (
                    error_response(req.version(), rtsp_types::StatusCode::MethodNotAllowed),
                    RequestOutcome::Continue,
                );
            }
        };

        if !allowed {
            let err = InvalidState { method, state };
            warn!("Connection {}: {}", id, err);

            return (
                error_response(req.version(), err.status_code()),
                RequestOutcome::Continue,
            );
        }

        match method {
            rtsp_types::Method::Options => (self.handle_options(req), RequestOutcome::Continue),
            rtsp_types::Method::Describe => (self.handle_describe(req), RequestOutcome::Continue),
            rtsp_types::Method::Setup => (self.handle_setup(req).await, RequestOutcome::Continue),
            rtsp_types::Method::Play => (self.handle_play(req), RequestOutcome::Continue),
            rtsp_types::Method::Pause => (self.handle_pause(req), RequestOutcome::Continue),
            rtsp_types::Method::Teardown => self.handle_teardown(req),
            _ => unreachable!(),
        }
    }

    fn handle_options(&mut self, req: &rtsp_types::Request<Body>) -> rtsp_types::Response<Body> {
        match self.handlers.on_options {
            Some(ref mut on_options) => result_to_response(on_options(req), req.version()),
            None => {
                let mut resp =
                    rtsp_types::Response::builder(req.version(), rtsp_types::StatusCode::Ok)
                        .build(Body::default());

                resp.insert_header(
                    rtsp_types::headers::PUBLIC,
                    "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN",
                );

                resp
            }
        }
    }

    fn handle_describe(&mut self, req: &rtsp_types::Request<Body>) -> rtsp_types::Response<Body> {
        match self.handlers.on_describe {
            Some(ref mut on_describe) => result_to_response(on_describe(req), req.version()),
            None => error_response(req.version(), rtsp_types::StatusCode::MethodNotAllowed),
        }
    }

    async fn handle_setup(&mut self, req: &rtsp_types::Request<Body>) -> rtsp_types::Response<Body> {
        let id = self.conn.inner().id();

        let url = match req.request_uri() {
            Some(url) => url,
            None => {
                warn!("Connection {}: SETUP without a request URL", id);
                return error_response(req.version(), rtsp_types::StatusCode::BadRequest);
            }
        };

        let (path, track_id) = match path::decompose(url) {
            Ok(decomposed) => decomposed,
            Err(err) => {
                warn!("Connection {}: {} ({})", id, err, url);
                return error_response(req.version(), err.status_code());
            }
        };

        let transports = match req.typed_header::<rtsp_types::headers::Transports>() {
            Ok(Some(transports)) => transports,
            _ => {
                warn!("Connection {}: SETUP without a valid transport header", id);
                return error_response(req.version(), rtsp_types::StatusCode::BadRequest);
            }
        };

        let udp_server_ports = self
            .conn
            .inner()
            .udp()
            .map(|udp| (udp.rtp.port, udp.rtcp.port));

        let negotiated = {
            let tracks = self.conn.inner().tracks().lock().await;

            match transport::negotiate(&transports, &tracks, track_id, &path, udp_server_ports) {
                Ok(negotiated) => negotiated,
                Err(err) => {
                    warn!(
                        "Connection {}: SETUP for track {} rejected: {}",
                        id, track_id, err
                    );
                    return error_response(req.version(), err.status_code());
                }
            }
        };

        let on_setup = match self.handlers.on_setup {
            Some(ref mut on_setup) => on_setup,
            None => return error_response(req.version(), rtsp_types::StatusCode::MethodNotAllowed),
        };

        match on_setup(req, &negotiated.client_transport, &path, track_id) {
            Ok(mut resp) => {
                if response_is_success(&resp) {
                    resp.insert_typed_header(&negotiated.response_header);
                    resp.insert_header(
                        rtsp_types::headers::SESSION,
                        self.conn.inner().session_id(),
                    );

                    debug!(
                        "Connection {}: Set up track {} of {} with {:?}",
                        id, track_id, path, negotiated.track_transport
                    );

                    self.conn.inner().tracks().lock().await.insert(
                        track_id,
                        Track {
                            path,
                            transport: negotiated.track_transport.clone(),
                        },
                    );

                    if let TrackTransport::Udp { client_ports, .. } = negotiated.track_transport {
                        self.register_udp_routes(track_id, client_ports).await;
                    }

                    if self.conn.state() == ConnState::Initial {
                        self.conn.set_state(ConnState::Prelay);
                    }
                }

                resp
            }
            Err(err) => {
                warn!("Connection {}: SETUP handler failed: {}", id, err);
                error_response(req.version(), err.status_code())
            }
        }
    }

    async fn register_udp_routes(&self, track_id: usize, client_ports: (u16, u16)) {
        let inner = self.conn.inner();

        let udp = match inner.udp() {
            Some(udp) => udp,
            None => return,
        };

        let peer_ip = inner.peer_addr().ip();
        let sender = inner.conn_sender().lock().await.clone();

        udp.rtp.routes.lock().await.insert(
            (peer_ip, client_ports.0),
            udp_listener::Route {
                track_id,
                sender: sender.clone(),
            },
        );
        udp.rtcp.routes.lock().await.insert(
            (peer_ip, client_ports.1),
            udp_listener::Route { track_id, sender },
        );
    }

    fn handle_play(&mut self, req: &rtsp_types::Request<Body>) -> rtsp_types::Response<Body> {
        let id = self.conn.inner().id();

        let on_play = match self.handlers.on_play {
            Some(ref mut on_play) => on_play,
            None => return error_response(req.version(), rtsp_types::StatusCode::MethodNotAllowed),
        };

        match on_play(req) {
            Ok(mut resp) => {
                if response_is_success(&resp) {
                    // A repeated PLAY invokes the handler but restarts nothing
                    self.conn.set_state(ConnState::Play);
                    resp.insert_header(
                        rtsp_types::headers::SESSION,
                        self.conn.inner().session_id(),
                    );
                }

                resp
            }
            Err(err) => {
                warn!("Connection {}: PLAY handler failed: {}", id, err);
                error_response(req.version(), err.status_code())
            }
        }
    }

    fn handle_pause(&mut self, req: &rtsp_types::Request<Body>) -> rtsp_types::Response<Body> {
        let id = self.conn.inner().id();

        let on_pause = match self.handlers.on_pause {
            Some(ref mut on_pause) => on_pause,
            None => return error_response(req.version(), rtsp_types::StatusCode::MethodNotAllowed),
        };

        match on_pause(req) {
            Ok(mut resp) => {
                if response_is_success(&resp) {
                    self.conn.set_state(ConnState::Prelay);
                    resp.insert_header(
                        rtsp_types::headers::SESSION,
                        self.conn.inner().session_id(),
                    );
                }

                resp
            }
            Err(err) => {
                warn!("Connection {}: PAUSE handler failed: {}", id, err);
                error_response(req.version(), err.status_code())
            }
        }
    }

    fn handle_teardown(
        &mut self,
        req: &rtsp_types::Request<Body>,
    ) -> (rtsp_types::Response<Body>, RequestOutcome) {
        let resp = match self.handlers.on_teardown {
            Some(ref mut on_teardown) => result_to_response(on_teardown(req), req.version()),
            None => rtsp_types::Response::builder(req.version(), rtsp_types::StatusCode::Ok)
                .build(Body::default()),
        };

        let mut resp = resp;
        if response_is_success(&resp) {
            resp.insert_header(rtsp_types::headers::SESSION, self.conn.inner().session_id());
        }

        (resp, RequestOutcome::Teardown)
    }
}

fn error_response(
    version: rtsp_types::Version,
    status: rtsp_types::StatusCode,
) -> rtsp_types::Response<Body> {
    rtsp_types::Response::builder(version, status).build(Body::default())
}

fn result_to_response(
    res: Result<rtsp_types::Response<Body>, crate::error::Error>,
    version: rtsp_types::Version,
) -> rtsp_types::Response<Body> {
    res.unwrap_or_else(|err| error_response(version, err.status_code()))
}

fn response_is_success(resp: &rtsp_types::Response<Body>) -> bool {
    !resp.status().is_client_error() && !resp.status().is_server_error()
}

async fn send_task(
    conn: ServerConn,
    mut rtsp_sink: MessageSink,
    mut resp_receiver: mpsc::Receiver<rtsp_types::Message<Body>>,
    mut frame_receiver: mpsc::Receiver<rtsp_types::Message<Body>>,
) {
    use future::Either::{Left, Right};

    enum SendItem {
        Response(rtsp_types::Message<Body>),
        Frame(rtsp_types::Message<Body>),
        DeferredFrame(rtsp_types::Message<Body>),
    }

    let inner = conn.inner();
    let id = inner.id();
    let write_timeout = inner.write_timeout();

    // Frames held back while a response is owed to the peer
    let mut deferred: VecDeque<rtsp_types::Message<Body>> = VecDeque::new();

    loop {
        let item = if inner.pending_responses().load(Ordering::SeqCst) > 0 {
            match resp_receiver.next().await {
                Some(msg) => SendItem::Response(msg),
                None => break,
            }
        } else if let Some(msg) = deferred.pop_front() {
            SendItem::DeferredFrame(msg)
        } else {
            match future::select(resp_receiver.next(), frame_receiver.next()).await {
                Left((Some(msg), _)) => SendItem::Response(msg),
                Left((None, _)) => break,
                Right((Some(msg), _)) => SendItem::Frame(msg),
                Right((None, _)) => break,
            }
        };

        let (msg, is_response) = match item {
            SendItem::Response(msg) => (msg, true),
            SendItem::Frame(msg) => {
                if inner.pending_responses().load(Ordering::SeqCst) > 0 {
                    // The frame may come from the handler of the pending
                    // request; its response goes out first
                    deferred.push_back(msg);
                    continue;
                }

                (msg, false)
            }
            // Produced before the currently-pending request, no need to
            // hold it back again
            SendItem::DeferredFrame(msg) => (msg, false),
        };

        match timeout(write_timeout, rtsp_sink.send(msg)).await {
            Err(_) => {
                warn!("Connection {}: Send timeout", id);
                let _ = inner
                    .conn_sender()
                    .lock()
                    .await
                    .try_send(ConnMessage::WriterError(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "Send timed out",
                    )));
                break;
            }
            Ok(Err(err)) => {
                warn!("Connection {}: Send error {}", id, err);
                let _ = inner
                    .conn_sender()
                    .lock()
                    .await
                    .try_send(ConnMessage::WriterError(err));
                break;
            }
            Ok(Ok(())) => {
                trace!("Connection {}: Successfully sent message", id);
            }
        }

        if is_response {
            inner.pending_responses().fetch_sub(1, Ordering::SeqCst);
        }
    }

    debug!("Connection {}: Send task finished", id);
}
