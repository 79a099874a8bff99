// Rust RTSP Server
//
// Copyright (C) 2020-2021 Sebastian Dröge <sebastian@centricular.com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use futures::lock::Mutex;
use futures::prelude::*;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use log::{debug, trace, warn};

use async_std::net::UdpSocket;
use async_std::task;

use pin_utils::pin_mut;

use crate::body::Body;
use crate::channel::mpsc;
use crate::conn::{ConnMessage, StreamType};

/// Where a datagram from a given client endpoint is delivered.
#[derive(Clone)]
pub(crate) struct Route {
    pub track_id: usize,
    pub sender: mpsc::Sender<ConnMessage>,
}

pub(crate) type RouteTable = Arc<Mutex<HashMap<(IpAddr, u16), Route>>>;

/// Shared handle to one of the server's UDP sockets.
///
/// Connections insert routes for their negotiated client ports on SETUP and
/// send outbound frames directly through the socket.
#[derive(Clone)]
pub(crate) struct UdpEndpoint {
    pub socket: Arc<UdpSocket>,
    pub port: u16,
    pub routes: RouteTable,
}

/// One bound UDP socket plus its receive task.
///
/// Each server has at most one listener for RTP and one for RTCP; received
/// datagrams are routed to the owning connection by their source address.
pub(crate) struct UdpListener {
    endpoint: UdpEndpoint,
    quit_sender: Mutex<mpsc::Sender<()>>,
    join_handle: Mutex<Option<task::JoinHandle<()>>>,
}

impl UdpListener {
    pub async fn bind(
        addr: std::net::SocketAddr,
        stream_type: StreamType,
    ) -> Result<UdpListener, std::io::Error> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let port = socket.local_addr()?.port();

        debug!("Started UDP listener on port {} ({:?})", port, stream_type);

        let routes: RouteTable = Arc::new(Mutex::new(HashMap::new()));

        let (quit_sender, quit_receiver) = mpsc::channel();

        let join_handle = task::spawn(recv_task(
            socket.clone(),
            routes.clone(),
            stream_type,
            quit_receiver,
        ));

        Ok(UdpListener {
            endpoint: UdpEndpoint {
                socket,
                port,
                routes,
            },
            quit_sender: Mutex::new(quit_sender),
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    pub fn endpoint(&self) -> UdpEndpoint {
        self.endpoint.clone()
    }

    pub async fn shutdown(&self) {
        let _ = self.quit_sender.lock().await.try_send(());

        if let Some(join_handle) = self.join_handle.lock().await.take() {
            join_handle.await;
        }
    }
}

async fn recv_task(
    socket: Arc<UdpSocket>,
    routes: RouteTable,
    stream_type: StreamType,
    mut quit_receiver: mpsc::Receiver<()>,
) {
    use future::Either::{Left, Right};

    let mut buf = vec![0u8; 65536];

    enum RecvOutcome {
        Data(usize, std::net::SocketAddr),
        Err(std::io::Error),
        Quit,
    }

    loop {
        let outcome = {
            let recv = socket.recv_from(&mut buf);
            pin_mut!(recv);

            match future::select(recv, quit_receiver.next()).await {
                Left((Ok((len, addr)), _)) => RecvOutcome::Data(len, addr),
                Left((Err(err), _)) => RecvOutcome::Err(err),
                Right(_) => RecvOutcome::Quit,
            }
        };

        match outcome {
            RecvOutcome::Data(len, addr) => {
                let route = routes.lock().await.get(&(addr.ip(), addr.port())).cloned();

                match route {
                    Some(Route {
                        track_id,
                        mut sender,
                    }) => {
                        let msg = ConnMessage::UdpFrame {
                            track_id,
                            stream_type,
                            payload: Body::from(&buf[..len]),
                        };

                        // The connection may be going away; dropping the
                        // datagram then is fine
                        if let Err(err) = sender.try_send(msg) {
                            trace!(
                                "Dropping {:?} datagram from {} for track {}: {}",
                                stream_type,
                                addr,
                                track_id,
                                err
                            );
                        }
                    }
                    None => {
                        trace!("Dropping unroutable {:?} datagram from {}", stream_type, addr);
                    }
                }
            }
            RecvOutcome::Err(err) => {
                warn!("UDP receive error on port {}: {}", socket.local_addr().map(|a| a.port()).unwrap_or(0), err);
                break;
            }
            RecvOutcome::Quit => break,
        }
    }

    debug!("UDP listener task finished ({:?})", stream_type);
}
