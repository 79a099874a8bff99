// Rust RTSP Server
//
// Copyright (C) 2020-2021 Sebastian Dröge <sebastian@centricular.com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Server setup and accepting of connections.

use futures::lock::Mutex;
use futures::prelude::*;

use log::{debug, error};

use async_std::net::TcpListener;

use pin_utils::pin_mut;

use crate::channel::mpsc;
use crate::conn::{ServerConn, StreamType, UdpHandles};

pub(crate) mod udp_listener;
use udp_listener::UdpListener;

pub(crate) const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Server configuration.
///
/// The UDP addresses enable the UDP transport family and must be given as a
/// pair or not at all; without them only TCP-interleaved SETUPs are
/// accepted.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub udp_rtp_address: Option<std::net::SocketAddr>,
    pub udp_rtcp_address: Option<std::net::SocketAddr>,
    /// Applied to every read from the control stream while no delivery is
    /// running.
    pub read_timeout: std::time::Duration,
    /// Applied to every write to the control stream.
    pub write_timeout: std::time::Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            udp_rtp_address: None,
            udp_rtcp_address: None,
            read_timeout: std::time::Duration::from_secs(10),
            write_timeout: std::time::Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Bind the control port and, if configured, the UDP listener pair.
    pub async fn serve(self, addr: std::net::SocketAddr) -> Result<Server, std::io::Error> {
        let udp = match (self.udp_rtp_address, self.udp_rtcp_address) {
            (Some(rtp_addr), Some(rtcp_addr)) => Some((
                UdpListener::bind(rtp_addr, StreamType::Rtp).await?,
                UdpListener::bind(rtcp_addr, StreamType::Rtcp).await?,
            )),
            (None, None) => None,
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "UDP addresses must be configured as a pair",
                ));
            }
        };

        let listener = TcpListener::bind(addr).await.map_err(|err| {
            error!("Failed binding to address {}", addr);
            err
        })?;
        let local_addr = listener.local_addr()?;

        debug!("Started server on {}", local_addr);

        let (close_sender, close_receiver) = mpsc::channel();

        Ok(Server {
            listener,
            local_addr,
            udp,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            close_sender: Mutex::new(close_sender),
            close_receiver: Mutex::new(close_receiver),
        })
    }
}

/// A listening RTSP server.
///
/// Hands out one [`ServerConn`] per accepted control connection; ownership
/// of the connection transfers to the caller.
pub struct Server {
    listener: TcpListener,
    local_addr: std::net::SocketAddr,
    udp: Option<(UdpListener, UdpListener)>,
    read_timeout: std::time::Duration,
    write_timeout: std::time::Duration,
    close_sender: Mutex<mpsc::Sender<()>>,
    close_receiver: Mutex<mpsc::Receiver<()>>,
}

impl Server {
    /// Serve with the default configuration.
    pub async fn serve(addr: std::net::SocketAddr) -> Result<Server, std::io::Error> {
        ServerConfig::default().serve(addr).await
    }

    /// The address the control port is bound to.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Wait for the next incoming connection.
    ///
    /// Fails once [`close`](Server::close) has been called.
    pub async fn accept(&self) -> Result<ServerConn, std::io::Error> {
        use future::Either::{Left, Right};

        let mut close_receiver = self.close_receiver.lock().await;

        let accept = self.listener.accept();
        pin_mut!(accept);

        match future::select(accept, close_receiver.next()).await {
            Left((Ok((stream, peer_addr)), _)) => {
                debug!(
                    "Accepted new connection on {} from {}",
                    self.local_addr, peer_addr
                );

                let udp = self.udp.as_ref().map(|(rtp, rtcp)| UdpHandles {
                    rtp: rtp.endpoint(),
                    rtcp: rtcp.endpoint(),
                });

                ServerConn::new(stream, self.read_timeout, self.write_timeout, udp)
            }
            Left((Err(err), _)) => Err(err),
            Right(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "Server closed",
            )),
        }
    }

    /// Shut the server down.
    ///
    /// Stops the UDP listeners and unblocks a pending
    /// [`accept`](Server::accept). Connections already handed out stay
    /// alive.
    pub async fn close(&self) {
        debug!("Closing server on {}", self.local_addr);

        let _ = self.close_sender.lock().await.try_send(());

        if let Some((ref rtp, ref rtcp)) = self.udp {
            rtp.shutdown().await;
            rtcp.shutdown().await;
        }
    }
}
