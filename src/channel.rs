// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! Hand-off channels built on top of async-std bounded channels.
//!
//! [simple_channel] is the plain mpmc pipe used between the service and the
//! peer transports. [GatedChannel] wraps a bounded pipe with an explicit
//! lifecycle so that producers get a typed error, instead of a panic or a
//! silently dropped item, when they send during or after shutdown.

use crate::{base::Mutex, Error, ErrorKind, Result};
use async_std::{
    channel::{self as async_channel, Receiver as AsyncReceiver, Sender as AsyncSender, TryRecvError},
    task,
};
use std::{fmt::Display, pin::Pin, time::Duration};

/// Upper bound to outstanding channel elements.
const CHANNEL_BOUND: usize = 1000;

/// Errors which can be triggered by a channel.
#[derive(Debug, PartialEq, Eq)]
pub enum ChannelError {
    /// Error during send. Broken channel.
    SendError,
    /// Error during receive. Broken channel.
    RecvError,
    /// Timeout during receive.
    RecvTimeout,
}

impl std::error::Error for ChannelError {}

impl Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ChannelError::SendError => "channel send error",
            ChannelError::RecvError => "channel recv error",
            ChannelError::RecvTimeout => "channel recv timeout",
        };
        write!(f, "{}", msg)
    }
}

/// Creates a simple mpmc channel.
pub fn simple_channel<T>() -> (Sender<T>, Receiver<T>) {
    bounded_channel(CHANNEL_BOUND)
}

/// Creates a mpmc channel holding at most `capacity` elements.
pub fn bounded_channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let (sender, receiver) = async_channel::bounded::<T>(capacity.max(1));
    (Sender(sender), Receiver(receiver))
}

/// Channel sender side.
#[derive(Clone)]
pub struct Sender<T>(AsyncSender<T>);

impl<T> Sender<T> {
    /// Send a value, waiting for room if the channel is full.
    pub async fn send(&self, value: T) -> std::result::Result<(), ChannelError> {
        self.0.send(value).await.map_err(|_| ChannelError::SendError)
    }

    /// Send a value, synchronous wrapper.
    pub fn send_sync(&self, value: T) -> std::result::Result<(), ChannelError> {
        task::block_on(self.send(value))
    }

    /// Closes the channel.
    /// Returns true if this call has closed the channel and it was not closed already.
    /// The remaining messages can still be received.
    pub fn close(&self) -> bool {
        self.0.close()
    }

    /// Returns true if the channel is closed.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Channel receiver side.
#[derive(Clone)]
pub struct Receiver<T>(AsyncReceiver<T>);

impl<T> Receiver<T> {
    /// Wait for the next value.
    pub async fn recv(&self) -> std::result::Result<T, ChannelError> {
        self.0.recv().await.map_err(|_| ChannelError::RecvError)
    }

    /// Wait for the next value at most `timeout`.
    pub async fn recv_timeout(&self, timeout: Duration) -> std::result::Result<T, ChannelError> {
        let mut timeout = timeout;
        let sleep_time = Duration::from_millis(10);
        loop {
            match self.0.try_recv() {
                Ok(res) => return Ok(res),
                Err(TryRecvError::Empty) if timeout > Duration::from_millis(0) => {
                    task::sleep(sleep_time).await;
                    timeout = timeout
                        .checked_sub(sleep_time)
                        .unwrap_or_else(|| Duration::from_millis(0));
                }
                Err(TryRecvError::Empty) => return Err(ChannelError::RecvTimeout),
                _ => return Err(ChannelError::RecvError),
            }
        }
    }

    /// Take a value if one is ready.
    pub fn try_recv(&self) -> Option<T> {
        self.0.try_recv().ok()
    }

    /// Wait for the next value, synchronous wrapper.
    pub fn recv_sync(&self) -> std::result::Result<T, ChannelError> {
        task::block_on(self.recv())
    }

    /// Wait for the next value with timeout, synchronous wrapper.
    pub fn recv_timeout_sync(&self, timeout: Duration) -> std::result::Result<T, ChannelError> {
        task::block_on(self.recv_timeout(timeout))
    }

    /// Closes the channel.
    /// Returns true if this call has closed the channel and it was not closed already.
    /// The remaining messages can still be received.
    pub fn close(&self) -> bool {
        self.0.close()
    }

    /// Returns true if the channel is closed.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    /// Number of queued values.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Stream implementation for [Receiver].
impl<T> futures::Stream for Receiver<T> {
    type Item = T;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let pin = Pin::new(&mut self.0);
        pin.poll_next(cx)
    }
}

/// Lifecycle of a [GatedChannel].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Open,
    /// Close requested, waiting for in-flight sends to drain.
    Closing,
    Closed,
}

/// Bounded hand-off queue with an explicit open/closing/closed lifecycle.
///
/// Producers block while the queue is full (backpressure). `add` fails with
/// `ChannelClosed` in any state other than `Open`; `close` waits for a send
/// already in progress before releasing the underlying pipe.
pub struct GatedChannel<T> {
    state: Mutex<GateState>,
    sender: Mutex<Option<Sender<T>>>,
}

impl<T> Default for GatedChannel<T> {
    fn default() -> Self {
        GatedChannel {
            state: Mutex::new(GateState::Closed),
            sender: Mutex::new(None),
        }
    }
}

impl<T> GatedChannel<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the channel with room for `capacity` elements and returns the
    /// consumer side. Fails if the channel is not closed.
    pub fn open(&self, capacity: usize) -> Result<Receiver<T>> {
        let mut state = self.state.lock();
        if *state != GateState::Closed {
            return Err(Error::new_ext(ErrorKind::Other, "channel already open"));
        }
        let (sender, receiver) = bounded_channel(capacity);
        *self.sender.lock() = Some(sender);
        *state = GateState::Open;
        Ok(receiver)
    }

    /// Pushes a value, blocking while the channel is full.
    pub fn add(&self, value: T) -> Result<()> {
        if *self.state.lock() != GateState::Open {
            return Err(ErrorKind::ChannelClosed.into());
        }
        // Holding the sender slot serializes sends against `close`.
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => sender.send_sync(value).map_err(Into::into),
            None => Err(ErrorKind::ChannelClosed.into()),
        }
    }

    /// Closes the channel. Values already queued can still be received.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != GateState::Open {
                return Err(ErrorKind::ChannelClosed.into());
            }
            *state = GateState::Closing;
        }
        if let Some(sender) = self.sender.lock().take() {
            sender.close();
        }
        *self.state.lock() = GateState::Closed;
        Ok(())
    }

    pub fn state(&self) -> GateState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == GateState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    const TIMEOUT_DURATION: Duration = Duration::from_millis(200);

    #[test]
    fn send_recv() {
        let (tx_chan, rx_chan) = simple_channel::<u32>();

        tx_chan.send_sync(3).unwrap();
        let val = rx_chan.recv_sync().unwrap();

        assert_eq!(val, 3);
    }

    #[test]
    fn send_closed_receiver() {
        let (tx_chan, _) = simple_channel::<()>();

        let err = tx_chan.send_sync(()).unwrap_err();

        assert_eq!(err, ChannelError::SendError);
    }

    #[test]
    fn recv_closed_sender() {
        let (_, rx_chan) = simple_channel::<()>();

        let err = rx_chan.recv_sync().unwrap_err();

        assert_eq!(err, ChannelError::RecvError);
    }

    #[test]
    fn recv_with_timeout() {
        let (_tx_chan, rx_chan) = simple_channel::<()>();

        let err = rx_chan.recv_timeout_sync(TIMEOUT_DURATION).unwrap_err();

        assert_eq!(err, ChannelError::RecvTimeout);
    }

    #[test]
    fn gated_add_before_open() {
        let chan = GatedChannel::<u32>::new();

        let err = chan.add(1).unwrap_err();

        assert_eq!(err.kind, ErrorKind::ChannelClosed);
    }

    #[test]
    fn gated_open_add_close() {
        let chan = GatedChannel::<u32>::new();
        let rx_chan = chan.open(4).unwrap();

        chan.add(7).unwrap();
        chan.close().unwrap();

        assert_eq!(rx_chan.recv_sync().unwrap(), 7);
        assert_eq!(chan.add(8).unwrap_err().kind, ErrorKind::ChannelClosed);
        assert_eq!(chan.state(), GateState::Closed);
    }

    #[test]
    fn gated_double_close() {
        let chan = GatedChannel::<u32>::new();
        let _rx_chan = chan.open(4).unwrap();
        chan.close().unwrap();

        let err = chan.close().unwrap_err();

        assert_eq!(err.kind, ErrorKind::ChannelClosed);
    }

    #[test]
    fn gated_double_open() {
        let chan = GatedChannel::<u32>::new();
        let _rx_chan = chan.open(4).unwrap();

        assert!(chan.open(4).is_err());
    }

    #[test]
    fn gated_backpressure_then_close() {
        let chan = Arc::new(GatedChannel::<u32>::new());
        let rx_chan = chan.open(1).unwrap();
        chan.add(1).unwrap();

        let producer = {
            let chan = chan.clone();
            thread::spawn(move || chan.add(2))
        };
        thread::sleep(TIMEOUT_DURATION);
        assert_eq!(rx_chan.recv_sync().unwrap(), 1);
        producer.join().unwrap().unwrap();
        chan.close().unwrap();

        assert_eq!(rx_chan.recv_sync().unwrap(), 2);
        assert_eq!(rx_chan.recv_sync().unwrap_err(), ChannelError::RecvError);
    }
}
