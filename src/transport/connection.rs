//! Per-connection protocol state machines.
//!
//! Each accepted socket runs one of two loops on the relay's I/O thread. The
//! loop owns the socket, a [`Dispatcher`] and the receiving half of a bounded
//! delivery queue. The multiplexer only ever touches the sending half, so a
//! slow peer can fill its own queue but never stall an emission.

use crate::config::ServerConfig;
use crate::core::channel_name::ChannelName;
use crate::core::codec::{FrameCodec, FrameInput, LineCodec, TextInput};
use crate::error::{constants, Result};
use crate::mux::{Listener, ListenerHandle, Multiplexer};
use crate::protocol::command::{Command, Reply};
use crate::protocol::dispatcher::{Dispatcher, Outcome};
use crate::protocol::frame::Frame;
use crate::utils::metrics::global_metrics;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::codec::Framed;
use tracing::{debug, instrument, warn};

/// One envelope waiting to be written to a peer
pub type Outbound = (ChannelName, Bytes);

/// Listener that queues deliveries for a connection's write side
#[derive(Debug)]
pub struct QueueListener {
    tx: mpsc::Sender<Outbound>,
}

impl Listener for QueueListener {
    fn deliver(&self, channel: &ChannelName, envelope: &Bytes) -> bool {
        match self.tx.try_send((channel.clone(), envelope.clone())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(%channel, "Outbound queue full, dropping delivery");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Listener handle plus the queue it feeds
pub fn outbound_queue(limit: usize) -> (ListenerHandle, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(limit.max(1));
    (ListenerHandle::new(Arc::new(QueueListener { tx })), rx)
}

/// Serve the line protocol until the peer quits or the socket fails
#[instrument(skip_all, fields(%peer, protocol = "text"))]
pub async fn serve_text(
    stream: TcpStream,
    peer: SocketAddr,
    mux: Arc<Multiplexer>,
    settings: Arc<ServerConfig>,
) {
    let (listener, rx) = outbound_queue(settings.outbound_queue_limit);
    let mut dispatcher = Dispatcher::new(mux, listener);
    let framed = Framed::new(stream, LineCodec::new(settings.max_line_length));

    match run_text(framed, &mut dispatcher, rx, &settings).await {
        Ok(()) => debug!("Connection closed"),
        Err(e) => {
            global_metrics().connection_error();
            debug!(error = %e, "Connection dropped");
        }
    }
    dispatcher.teardown();
}

async fn run_text(
    mut framed: Framed<TcpStream, LineCodec>,
    dispatcher: &mut Dispatcher,
    mut rx: mpsc::Receiver<Outbound>,
    settings: &ServerConfig,
) -> Result<()> {
    send_line(
        &mut framed,
        Reply::Greeting {
            name: settings.name.clone(),
            banner: settings.banner.clone(),
        },
    )
    .await?;

    loop {
        tokio::select! {
            input = framed.next() => {
                let Some(input) = input else {
                    return Ok(());
                };
                let reply = match input? {
                    TextInput::Line(line) => {
                        global_metrics().bytes_in(line.len() as u64 + 2);
                        match Command::parse(&line).and_then(|c| dispatcher.dispatch(c)) {
                            Ok(Outcome::Continue) => Reply::Ok,
                            Ok(Outcome::Close) => {
                                send_line(&mut framed, Reply::Closing).await?;
                                return Ok(());
                            }
                            Err(e) => {
                                global_metrics().protocol_error();
                                debug!(error = %e, "Command failed");
                                Reply::from_error(&e)
                            }
                        }
                    }
                    TextInput::Overlong => {
                        global_metrics().protocol_error();
                        Reply::Error(constants::ERR_LINE_TOO_LONG.to_string())
                    }
                    TextInput::Malformed => {
                        global_metrics().protocol_error();
                        Reply::Error(constants::ERR_MALFORMED_LINE.to_string())
                    }
                };
                send_line(&mut framed, reply).await?;
            }
            Some((channel, envelope)) = rx.recv() => {
                send_line(&mut framed, Reply::Item { channel, envelope }).await?;
            }
        }
    }
}

async fn send_line(framed: &mut Framed<TcpStream, LineCodec>, reply: Reply) -> Result<()> {
    let line = reply.to_string();
    global_metrics().bytes_out(line.len() as u64 + 2);
    framed.send(line).await
}

/// Serve the framed protocol until the peer disconnects or the socket fails
#[instrument(skip_all, fields(%peer, protocol = "binary"))]
pub async fn serve_binary(
    stream: TcpStream,
    peer: SocketAddr,
    mux: Arc<Multiplexer>,
    settings: Arc<ServerConfig>,
) {
    let (listener, rx) = outbound_queue(settings.outbound_queue_limit);
    let mut dispatcher = Dispatcher::new(mux, listener);
    let framed = Framed::new(stream, FrameCodec::server(settings.max_frame_length));

    match run_binary(framed, &mut dispatcher, rx).await {
        Ok(()) => debug!("Connection closed"),
        Err(e) => {
            global_metrics().connection_error();
            debug!(error = %e, "Connection dropped");
        }
    }
    dispatcher.teardown();
}

async fn run_binary(
    mut framed: Framed<TcpStream, FrameCodec>,
    dispatcher: &mut Dispatcher,
    mut rx: mpsc::Receiver<Outbound>,
) -> Result<()> {
    loop {
        tokio::select! {
            input = framed.next() => {
                let Some(input) = input else {
                    return Ok(());
                };
                match input? {
                    FrameInput::Frame(frame) => {
                        global_metrics().bytes_in(frame.payload.len() as u64 + 8);
                        match dispatcher.handle_frame(&frame) {
                            Ok(Outcome::Close) => return Ok(()),
                            Ok(Outcome::Continue) => {}
                            Err(e) => {
                                global_metrics().protocol_error();
                                warn!(tag = ?frame.tag, error = %e, "Frame dropped");
                            }
                        }
                    }
                    FrameInput::Rejected(e) => {
                        global_metrics().protocol_error();
                        warn!(error = %e, "Frame rejected");
                    }
                }
            }
            Some((channel, envelope)) = rx.recv() => {
                let frame = Frame::delivery(&channel, &envelope);
                global_metrics().bytes_out(frame.payload.len() as u64 + 8);
                framed.send(frame).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn channel() -> ChannelName {
        ChannelName::parse("foo").unwrap()
    }

    #[tokio::test]
    async fn full_queue_refuses_delivery() {
        let (tx, mut rx) = mpsc::channel(1);
        let listener = QueueListener { tx };

        assert!(listener.deliver(&channel(), &Bytes::from_static(b"a")));
        assert!(!listener.deliver(&channel(), &Bytes::from_static(b"b")));
        assert_eq!(rx.recv().await.unwrap().1, Bytes::from_static(b"a"));
        assert!(listener.deliver(&channel(), &Bytes::from_static(b"c")));
    }

    #[tokio::test]
    async fn closed_queue_refuses_quietly() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let listener = QueueListener { tx };
        assert!(!listener.deliver(&channel(), &Bytes::from_static(b"a")));
    }

    #[tokio::test]
    async fn handles_from_separate_queues_differ() {
        let (a, _rx_a) = outbound_queue(4);
        let (b, _rx_b) = outbound_queue(4);
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
    }
}
