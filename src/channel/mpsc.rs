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

use std::error;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

/// MPSC Receiver.
#[derive(Debug)]
pub struct Receiver<T>(mpsc::Receiver<T>);

/// MPSC Sender.
#[derive(Debug)]
pub struct Sender<T>(mpsc::Sender<T>);

impl<T: Send + 'static> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender(self.0.clone())
    }
}

pub fn channel<T: Send + 'static>() -> (Sender<T>, Receiver<T>) {
    let (sender, receiver) = mpsc::channel(100);

    (Sender(sender), Receiver(receiver))
}

impl<T: Send + 'static> Sender<T> {
    /// Close the channel from the sender side.
    ///
    /// Items already queued are still delivered to the receiver.
    pub fn close_channel(&mut self) {
        self.0.close_channel();
    }

    /// Try sending an item without blocking.
    pub fn try_send(&mut self, msg: T) -> Result<(), SendError> {
        self.0.try_send(msg).map_err(SendError::from_try_send_error)
    }
}

impl<T: Send + 'static> Receiver<T> {
    /// Close the channel.
    pub fn close(&mut self) {
        self.0.close();
    }
}

/// Send error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Channel is full.
    Full,
    /// Channel is disconnected.
    Disconnected,
}

impl SendError {
    pub fn is_full(self) -> bool {
        matches!(self, SendError::Full)
    }

    pub fn is_disconnected(self) -> bool {
        matches!(self, SendError::Disconnected)
    }

    fn from_try_send_error<T>(err: mpsc::TrySendError<T>) -> Self {
        if err.is_full() {
            SendError::Full
        } else {
            SendError::Disconnected
        }
    }

    fn from_send_error(err: mpsc::SendError) -> Self {
        if err.is_full() {
            SendError::Full
        } else {
            SendError::Disconnected
        }
    }
}

impl error::Error for SendError {}
impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Full => write!(f, "Channel is full"),
            SendError::Disconnected => write!(f, "Channel is disconnected"),
        }
    }
}

impl<T: Send + 'static> Sink<T> for Sender<T> {
    type Error = SendError;

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        Pin::new(&mut self.get_mut().0)
            .start_send(item)
            .map_err(SendError::from_send_error)
    }

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.get_mut().0)
            .poll_ready(cx)
            .map_err(SendError::from_send_error)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.get_mut().0)
            .poll_close(cx)
            .map_err(SendError::from_send_error)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.get_mut().0)
            .poll_flush(cx)
            .map_err(SendError::from_send_error)
    }
}

impl<T: Send + 'static> Stream for Receiver<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().0).poll_next(cx)
    }
}
