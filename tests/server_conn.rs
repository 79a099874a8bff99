// Rust RTSP Server
//
// Copyright (C) 2020-2021 Sebastian Dröge <sebastian@centricular.com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use futures::channel::mpsc;
use futures::prelude::*;

use std::time::Duration;

use async_std::net::{TcpStream, UdpSocket};
use async_std::task;

use rtsp_types::headers::transport::{RtpLowerTransport, RtpProfile, RtpTransport};
use rtsp_types::headers::{self, Transport, TransportMode, Transports};
use rtsp_types::{Empty, Method, StatusCode, Version};

use rtsp_relay::body::Body;
use rtsp_relay::conn::{ReadHandlers, StreamType};
use rtsp_relay::error::ReadError;
use rtsp_relay::server::{Server, ServerConfig};
use rtsp_relay::Url;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn loopback() -> std::net::SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn ok_response(req: &rtsp_types::Request<Body>) -> rtsp_types::Response<Body> {
    rtsp_types::Response::builder(req.version(), StatusCode::Ok).build(Body::default())
}

fn interleaved_transports(channels: (u8, u8)) -> Transports {
    Transports::from(vec![Transport::Rtp(RtpTransport {
        profile: RtpProfile::Avp,
        lower_transport: Some(RtpLowerTransport::Tcp),
        params: rtsp_types::headers::transport::RtpTransportParameters {
            unicast: true,
            interleaved: Some((channels.0, Some(channels.1))),
            mode: vec![TransportMode::Play],
            ..Default::default()
        },
    })])
}

fn udp_transports(client_ports: (u16, u16)) -> Transports {
    Transports::from(vec![Transport::Rtp(RtpTransport {
        profile: RtpProfile::Avp,
        lower_transport: None,
        params: rtsp_types::headers::transport::RtpTransportParameters {
            unicast: true,
            client_port: Some((client_ports.0, Some(client_ports.1))),
            mode: vec![TransportMode::Play],
            ..Default::default()
        },
    })])
}

fn setup_request(url: &str, cseq: &str, transports: &Transports) -> rtsp_types::Request<Empty> {
    rtsp_types::Request::builder(Method::Setup, Version::V1_0)
        .request_uri(Url::parse(url).unwrap())
        .header(headers::CSEQ, cseq)
        .typed_header(transports)
        .build(Empty)
}

fn plain_request(method: Method, url: &str, cseq: &str) -> rtsp_types::Request<Empty> {
    rtsp_types::Request::builder(method, Version::V1_0)
        .request_uri(Url::parse(url).unwrap())
        .header(headers::CSEQ, cseq)
        .build(Empty)
}

/// Minimal blocking-style RTSP client on top of an async TCP stream.
struct TestConn {
    stream: TcpStream,
    buf: Vec<u8>,
    filled: usize,
}

impl TestConn {
    async fn connect(addr: std::net::SocketAddr) -> TestConn {
        TestConn {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: vec![0; 8192],
            filled: 0,
        }
    }

    async fn send<B: AsRef<[u8]>>(&mut self, msg: rtsp_types::Message<B>) {
        let mut data = Vec::new();
        msg.write(&mut data).unwrap();

        self.stream.write_all(&data).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    async fn recv(&mut self) -> rtsp_types::Message<Vec<u8>> {
        loop {
            match rtsp_types::Message::<Vec<u8>>::parse(&self.buf[..self.filled]) {
                Ok((msg, consumed)) => {
                    self.buf.copy_within(consumed..self.filled, 0);
                    self.filled -= consumed;

                    return msg;
                }
                Err(rtsp_types::ParseError::Incomplete) => (),
                Err(err) => panic!("Invalid message from server: {:?}", err),
            }

            if self.filled == self.buf.len() {
                let new_size = self.buf.len() * 2;
                self.buf.resize(new_size, 0);
            }

            let n = self.stream.read(&mut self.buf[self.filled..]).await.unwrap();
            assert!(n > 0, "Server closed the connection");
            self.filled += n;
        }
    }

    /// Next response, skipping interleaved frames.
    async fn recv_response(&mut self) -> rtsp_types::Response<Vec<u8>> {
        loop {
            match self.recv().await {
                rtsp_types::Message::Response(resp) => return resp,
                rtsp_types::Message::Data(_) => (),
                msg => panic!("Unexpected message from server: {:?}", msg),
            }
        }
    }
}

#[async_std::test]
async fn setup_path_extraction() {
    init();

    for (url, expected_path, expected_track_id) in vec![
        (
            "rtsp://localhost:8554/teststream/trackID=2",
            "teststream",
            2usize,
        ),
        (
            "rtsp://localhost:8554/teststream?testing=123/trackID=4",
            "teststream",
            4,
        ),
        ("rtsp://localhost:8554/teststream/", "teststream", 0),
        ("rtsp://localhost:8554/test/stream/trackID=0", "test/stream", 0),
        ("rtsp://localhost:8554/test/stream/", "test/stream", 0),
        (
            "rtsp://localhost:8554/test/stream?testing=123/trackID=4",
            "test/stream",
            4,
        ),
    ] {
        let server = Server::serve(loopback()).await.unwrap();
        let addr = server.local_addr();

        let (setup_sender, mut setup_receiver) = mpsc::unbounded();
        let (err_sender, mut err_receiver) = mpsc::unbounded();

        let server_task = task::spawn(async move {
            let conn = server.accept().await.unwrap();

            let handlers = ReadHandlers {
                on_setup: Some(Box::new(move |req, _transport, path, track_id| {
                    let _ = setup_sender.unbounded_send((path.to_string(), track_id));
                    Ok(ok_response(req))
                })),
                ..Default::default()
            };

            let err = conn.read(handlers).await;
            let _ = err_sender.unbounded_send(err);
        });

        let mut client = TestConn::connect(addr).await;

        let track_id = expected_track_id as u8;
        client
            .send(
                setup_request(
                    url,
                    "1",
                    &interleaved_transports((track_id * 2, track_id * 2 + 1)),
                )
                .into(),
            )
            .await;

        let (path, track_id) = setup_receiver.next().await.unwrap();
        assert_eq!(path, expected_path);
        assert_eq!(track_id, expected_track_id);

        let resp = client.recv_response().await;
        assert_eq!(resp.status(), StatusCode::Ok);

        drop(client);

        let err = err_receiver.next().await.unwrap();
        assert!(err.is_closed(), "{}", err);

        server_task.await;
    }
}

#[async_std::test]
async fn setup_with_different_paths_rejected() {
    init();

    let server = Server::serve(loopback()).await.unwrap();
    let addr = server.local_addr();

    let server_task = task::spawn(async move {
        let conn = server.accept().await.unwrap();

        let handlers = ReadHandlers {
            on_setup: Some(Box::new(|req, _transport, _path, _track_id| {
                Ok(ok_response(req))
            })),
            ..Default::default()
        };

        conn.read(handlers).await;
    });

    let mut client = TestConn::connect(addr).await;

    client
        .send(
            setup_request(
                "rtsp://localhost:8554/teststream/trackID=0",
                "1",
                &interleaved_transports((0, 1)),
            )
            .into(),
        )
        .await;

    let resp = client.recv_response().await;
    assert_eq!(resp.status(), StatusCode::Ok);

    client
        .send(
            setup_request(
                "rtsp://localhost:8554/test12stream/trackID=1",
                "2",
                &interleaved_transports((2, 3)),
            )
            .into(),
        )
        .await;

    let resp = client.recv_response().await;
    assert_eq!(resp.status(), StatusCode::BadRequest);

    drop(client);
    server_task.await;
}

#[async_std::test]
async fn play_response_precedes_frames() {
    init();

    let server = Server::serve(loopback()).await.unwrap();
    let addr = server.local_addr();

    let server_task = task::spawn(async move {
        let conn = server.accept().await.unwrap();

        let writer_conn = conn.clone();
        let handlers = ReadHandlers {
            on_setup: Some(Box::new(|req, _transport, _path, _track_id| {
                Ok(ok_response(req))
            })),
            on_play: Some(Box::new(move |req| {
                let conn = writer_conn.clone();
                task::spawn(async move {
                    let _ = conn
                        .write_frame(0, StreamType::Rtp, vec![0u8, 0, 0, 0])
                        .await;

                    loop {
                        task::sleep(Duration::from_millis(50)).await;

                        if conn
                            .write_frame(0, StreamType::Rtp, vec![0u8, 0, 0, 0])
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });

                // Frames are already being produced while the response is
                // still outstanding
                std::thread::sleep(Duration::from_millis(50));

                Ok(ok_response(req))
            })),
            ..Default::default()
        };

        conn.read(handlers).await;
    });

    let mut client = TestConn::connect(addr).await;

    client
        .send(
            setup_request(
                "rtsp://localhost:8554/teststream/trackID=0",
                "1",
                &interleaved_transports((0, 1)),
            )
            .into(),
        )
        .await;

    let resp = client.recv_response().await;
    assert_eq!(resp.status(), StatusCode::Ok);

    client
        .send(plain_request(Method::Play, "rtsp://localhost:8554/teststream", "2").into())
        .await;

    // The first message after PLAY must be its response, not a frame
    match client.recv().await {
        rtsp_types::Message::Response(resp) => assert_eq!(resp.status(), StatusCode::Ok),
        msg => panic!("Received {:?} before the PLAY response", msg),
    }

    loop {
        if let rtsp_types::Message::Data(data) = client.recv().await {
            assert_eq!(data.channel_id(), 0);
            break;
        }
    }

    drop(client);
    server_task.await;
}

#[async_std::test]
async fn repeated_play_is_idempotent() {
    init();

    let server = Server::serve(loopback()).await.unwrap();
    let addr = server.local_addr();

    let (play_state_sender, mut play_state_receiver) = mpsc::unbounded();

    let server_task = task::spawn(async move {
        let conn = server.accept().await.unwrap();

        let play_conn = conn.clone();
        let handlers = ReadHandlers {
            on_setup: Some(Box::new(|req, _transport, _path, _track_id| {
                Ok(ok_response(req))
            })),
            on_play: Some(Box::new(move |req| {
                use rtsp_relay::conn::ConnState;

                let _ = play_state_sender.unbounded_send(play_conn.state());

                if play_conn.state() != ConnState::Play {
                    let conn = play_conn.clone();
                    task::spawn(async move {
                        loop {
                            task::sleep(Duration::from_millis(50)).await;

                            if conn
                                .write_frame(0, StreamType::Rtp, vec![0u8, 0, 0, 0])
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    });
                }

                Ok(ok_response(req))
            })),
            ..Default::default()
        };

        conn.read(handlers).await;
    });

    let mut client = TestConn::connect(addr).await;

    client
        .send(
            setup_request(
                "rtsp://localhost:8554/teststream/trackID=0",
                "1",
                &interleaved_transports((0, 1)),
            )
            .into(),
        )
        .await;
    assert_eq!(client.recv_response().await.status(), StatusCode::Ok);

    client
        .send(plain_request(Method::Play, "rtsp://localhost:8554/teststream", "2").into())
        .await;
    assert_eq!(client.recv_response().await.status(), StatusCode::Ok);

    client
        .send(plain_request(Method::Play, "rtsp://localhost:8554/teststream", "3").into())
        .await;
    assert_eq!(client.recv_response().await.status(), StatusCode::Ok);

    // The handler ran twice: before delivery and while already playing
    use rtsp_relay::conn::ConnState;
    assert_eq!(play_state_receiver.next().await.unwrap(), ConnState::Prelay);
    assert_eq!(play_state_receiver.next().await.unwrap(), ConnState::Play);

    drop(client);
    server_task.await;
}

#[async_std::test]
async fn repeated_pause_is_idempotent() {
    init();

    let server = Server::serve(loopback()).await.unwrap();
    let addr = server.local_addr();

    let server_task = task::spawn(async move {
        let conn = server.accept().await.unwrap();

        let writer_conn = conn.clone();
        let handlers = ReadHandlers {
            on_setup: Some(Box::new(|req, _transport, _path, _track_id| {
                Ok(ok_response(req))
            })),
            on_play: Some(Box::new(move |req| {
                let conn = writer_conn.clone();
                task::spawn(async move {
                    loop {
                        task::sleep(Duration::from_millis(50)).await;

                        if conn
                            .write_frame(0, StreamType::Rtp, vec![0u8, 0, 0, 0])
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });

                Ok(ok_response(req))
            })),
            on_pause: Some(Box::new(|req| Ok(ok_response(req)))),
            ..Default::default()
        };

        conn.read(handlers).await;
    });

    let mut client = TestConn::connect(addr).await;

    client
        .send(
            setup_request(
                "rtsp://localhost:8554/teststream/trackID=0",
                "1",
                &interleaved_transports((0, 1)),
            )
            .into(),
        )
        .await;
    assert_eq!(client.recv_response().await.status(), StatusCode::Ok);

    client
        .send(plain_request(Method::Play, "rtsp://localhost:8554/teststream", "2").into())
        .await;
    assert_eq!(client.recv_response().await.status(), StatusCode::Ok);

    client
        .send(plain_request(Method::Pause, "rtsp://localhost:8554/teststream", "3").into())
        .await;
    assert_eq!(client.recv_response().await.status(), StatusCode::Ok);

    client
        .send(plain_request(Method::Pause, "rtsp://localhost:8554/teststream", "4").into())
        .await;
    assert_eq!(client.recv_response().await.status(), StatusCode::Ok);

    drop(client);
    server_task.await;
}

#[async_std::test]
async fn interleaved_frame_invokes_on_frame() {
    init();

    let server = Server::serve(loopback()).await.unwrap();
    let addr = server.local_addr();

    let (frame_sender, mut frame_receiver) = mpsc::unbounded();

    let server_task = task::spawn(async move {
        let conn = server.accept().await.unwrap();

        let handlers = ReadHandlers {
            on_setup: Some(Box::new(|req, _transport, _path, _track_id| {
                Ok(ok_response(req))
            })),
            on_play: Some(Box::new(|req| Ok(ok_response(req)))),
            on_frame: Some(Box::new(move |track_id, stream_type, payload| {
                let _ = frame_sender.unbounded_send((track_id, stream_type, payload.to_vec()));
            })),
            ..Default::default()
        };

        conn.read(handlers).await;
    });

    let mut client = TestConn::connect(addr).await;

    client
        .send(
            setup_request(
                "rtsp://localhost:8554/teststream/trackID=0",
                "1",
                &interleaved_transports((0, 1)),
            )
            .into(),
        )
        .await;
    assert_eq!(client.recv_response().await.status(), StatusCode::Ok);

    client
        .send(plain_request(Method::Play, "rtsp://localhost:8554/teststream", "2").into())
        .await;
    assert_eq!(client.recv_response().await.status(), StatusCode::Ok);

    let frame = rtsp_types::Data::new(1u8, b"\x01\x02\x03\x04".to_vec());
    client.send(frame.into()).await;

    let (track_id, stream_type, payload) = frame_receiver.next().await.unwrap();
    assert_eq!(track_id, 0);
    assert_eq!(stream_type, StreamType::Rtcp);
    assert_eq!(payload, b"\x01\x02\x03\x04");

    drop(client);
    server_task.await;
}

#[async_std::test]
async fn udp_frame_invokes_on_frame() {
    init();

    let config = ServerConfig {
        udp_rtp_address: Some(loopback()),
        udp_rtcp_address: Some(loopback()),
        ..Default::default()
    };

    let server = config.serve(loopback()).await.unwrap();
    let addr = server.local_addr();

    let (frame_sender, mut frame_receiver) = mpsc::unbounded();
    let (done_sender, mut done_receiver) = mpsc::unbounded();

    let server_task = task::spawn(async move {
        let conn = server.accept().await.unwrap();

        let handlers = ReadHandlers {
            on_setup: Some(Box::new(|req, _transport, _path, _track_id| {
                Ok(ok_response(req))
            })),
            on_play: Some(Box::new(|req| Ok(ok_response(req)))),
            on_frame: Some(Box::new(move |track_id, stream_type, payload| {
                let _ = frame_sender.unbounded_send((track_id, stream_type, payload.to_vec()));
            })),
            ..Default::default()
        };

        let err = conn.read(handlers).await;
        let _ = done_sender.unbounded_send(err);

        server.close().await;
    });

    // The client's UDP endpoints; their ports go into the transport header
    let client_rtp_socket = UdpSocket::bind(loopback()).await.unwrap();
    let client_rtcp_socket = UdpSocket::bind(loopback()).await.unwrap();
    let client_ports = (
        client_rtp_socket.local_addr().unwrap().port(),
        client_rtcp_socket.local_addr().unwrap().port(),
    );

    let mut client = TestConn::connect(addr).await;

    client
        .send(
            setup_request(
                "rtsp://localhost:8554/teststream/trackID=0",
                "1",
                &udp_transports(client_ports),
            )
            .into(),
        )
        .await;

    let resp = client.recv_response().await;
    assert_eq!(resp.status(), StatusCode::Ok);

    let transports = resp
        .typed_header::<Transports>()
        .unwrap()
        .expect("No transport header in SETUP response");
    let server_ports = transports
        .iter()
        .find_map(|transport| match transport {
            Transport::Rtp(rtp) => rtp.params.server_port,
            _ => None,
        })
        .expect("No server ports in SETUP response");
    let server_rtcp_port = server_ports.1.unwrap();

    client
        .send(plain_request(Method::Play, "rtsp://localhost:8554/teststream", "2").into())
        .await;
    assert_eq!(client.recv_response().await.status(), StatusCode::Ok);

    client_rtcp_socket
        .send_to(
            b"\x01\x02\x03\x04",
            ("127.0.0.1".parse::<std::net::IpAddr>().unwrap(), server_rtcp_port),
        )
        .await
        .unwrap();

    let (track_id, stream_type, payload) = frame_receiver.next().await.unwrap();
    assert_eq!(track_id, 0);
    assert_eq!(stream_type, StreamType::Rtcp);
    assert_eq!(payload, b"\x01\x02\x03\x04");

    drop(client);

    let err = done_receiver.next().await.unwrap();
    assert!(err.is_closed(), "{}", err);

    server_task.await;
}

#[async_std::test]
async fn clean_close_surfaces_closed() {
    init();

    let server = Server::serve(loopback()).await.unwrap();
    let addr = server.local_addr();

    let (err_sender, mut err_receiver) = mpsc::unbounded();

    let server_task = task::spawn(async move {
        let conn = server.accept().await.unwrap();

        let err = conn.read(ReadHandlers::default()).await;
        let _ = err_sender.unbounded_send(err);
    });

    let mut client = TestConn::connect(addr).await;

    // Built-in OPTIONS answer, no handler needed
    client
        .send(plain_request(Method::Options, "rtsp://localhost:8554/teststream", "1").into())
        .await;
    let resp = client.recv_response().await;
    assert_eq!(resp.status(), StatusCode::Ok);
    assert!(resp.header(&headers::PUBLIC).is_some());

    drop(client);

    let err = err_receiver.next().await.unwrap();
    assert!(matches!(err, ReadError::Closed));

    server_task.await;
}

#[async_std::test]
async fn teardown_closes_the_connection() {
    init();

    let server = Server::serve(loopback()).await.unwrap();
    let addr = server.local_addr();

    let (err_sender, mut err_receiver) = mpsc::unbounded();

    let server_task = task::spawn(async move {
        let conn = server.accept().await.unwrap();

        let handlers = ReadHandlers {
            on_setup: Some(Box::new(|req, _transport, _path, _track_id| {
                Ok(ok_response(req))
            })),
            ..Default::default()
        };

        let err = conn.read(handlers).await;
        let _ = err_sender.unbounded_send(err);
    });

    let mut client = TestConn::connect(addr).await;

    client
        .send(
            setup_request(
                "rtsp://localhost:8554/teststream/trackID=0",
                "1",
                &interleaved_transports((0, 1)),
            )
            .into(),
        )
        .await;
    assert_eq!(client.recv_response().await.status(), StatusCode::Ok);

    client
        .send(plain_request(Method::Teardown, "rtsp://localhost:8554/teststream", "2").into())
        .await;
    assert_eq!(client.recv_response().await.status(), StatusCode::Ok);

    let err = err_receiver.next().await.unwrap();
    assert!(err.is_closed(), "{}", err);

    server_task.await;
}

#[async_std::test]
async fn play_before_setup_rejected() {
    init();

    let server = Server::serve(loopback()).await.unwrap();
    let addr = server.local_addr();

    let server_task = task::spawn(async move {
        let conn = server.accept().await.unwrap();

        let handlers = ReadHandlers {
            on_setup: Some(Box::new(|req, _transport, _path, _track_id| {
                Ok(ok_response(req))
            })),
            on_play: Some(Box::new(|req| Ok(ok_response(req)))),
            ..Default::default()
        };

        conn.read(handlers).await;
    });

    let mut client = TestConn::connect(addr).await;

    client
        .send(plain_request(Method::Play, "rtsp://localhost:8554/teststream", "1").into())
        .await;
    assert_eq!(client.recv_response().await.status(), StatusCode::BadRequest);

    // The connection survives the rejected request
    client
        .send(
            setup_request(
                "rtsp://localhost:8554/teststream/trackID=0",
                "2",
                &interleaved_transports((0, 1)),
            )
            .into(),
        )
        .await;
    assert_eq!(client.recv_response().await.status(), StatusCode::Ok);

    drop(client);
    server_task.await;
}
