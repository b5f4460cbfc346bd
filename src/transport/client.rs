//! Relay clients for both wire protocols.
//!
//! Used by relays that subscribe to each other and by the integration tests.

use crate::core::channel_name::ChannelName;
use crate::core::codec::{FrameCodec, FrameInput, LineCodec, TextInput, DEFAULT_MAX_FRAME_LEN};
use crate::error::{PortalError, Result};
use crate::protocol::command::{Command, Reply};
use crate::protocol::frame::Frame;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

/// Line protocol client
pub struct TextClient {
    framed: Framed<TcpStream, LineCodec>,
    greeting: Reply,
}

impl TextClient {
    /// Connect and wait for the `220` greeting
    #[instrument(skip(addr))]
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let mut framed = Framed::new(stream, LineCodec::new(usize::MAX));
        let greeting = read_reply(&mut framed).await?;
        if greeting.code() != 220 {
            return Err(PortalError::InvalidArguments(format!(
                "unexpected greeting: {greeting}"
            )));
        }
        debug!(%greeting, "Connected");
        Ok(Self { framed, greeting })
    }

    pub fn greeting(&self) -> &Reply {
        &self.greeting
    }

    /// Send one command without waiting
    pub async fn send(&mut self, command: &Command) -> Result<()> {
        self.framed.send(command.to_line()).await
    }

    /// Send a raw line, for exercising error paths
    pub async fn send_raw(&mut self, line: &str) -> Result<()> {
        self.framed.send(line).await
    }

    /// Next line from the relay
    pub async fn receive(&mut self) -> Result<Reply> {
        read_reply(&mut self.framed).await
    }

    /// Send a command and wait for its reply
    pub async fn request(&mut self, command: &Command) -> Result<Reply> {
        self.send(command).await?;
        self.receive().await
    }

    pub async fn subscribe(&mut self, channel: &ChannelName, password: Option<&str>) -> Result<Reply> {
        self.request(&Command::Subscribe {
            channel: channel.clone(),
            password: password.map(str::to_string),
        })
        .await
    }

    pub async fn submit(&mut self, channel: &ChannelName, envelope: Bytes) -> Result<Reply> {
        self.request(&Command::Submit {
            channel: channel.clone(),
            envelope,
        })
        .await
    }

    pub async fn quit(mut self) -> Result<Reply> {
        self.request(&Command::Quit).await
    }
}

async fn read_reply(framed: &mut Framed<TcpStream, LineCodec>) -> Result<Reply> {
    match framed.next().await {
        Some(Ok(TextInput::Line(line))) => Reply::parse(&line),
        Some(Ok(other)) => Err(PortalError::InvalidArguments(format!("{other:?}"))),
        Some(Err(e)) => Err(e),
        None => Err(PortalError::ConnectionClosed),
    }
}

/// Framed protocol client
pub struct BinaryClient {
    framed: Framed<TcpStream, FrameCodec>,
}

impl BinaryClient {
    #[instrument(skip(addr))]
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(stream, FrameCodec::client(DEFAULT_MAX_FRAME_LEN)),
        })
    }

    pub async fn send(&mut self, frame: Frame) -> Result<()> {
        self.framed.send(frame).await
    }

    pub async fn subscribe(&mut self, channel: &ChannelName) -> Result<()> {
        self.send(Frame::subscribe(channel)).await
    }

    pub async fn unsubscribe(&mut self, channel: &ChannelName) -> Result<()> {
        self.send(Frame::unsubscribe(channel)).await
    }

    pub async fn submit(&mut self, channel: &ChannelName, envelope: &[u8]) -> Result<()> {
        self.send(Frame::submit(channel, envelope)).await
    }

    /// Wait for the next `ITEM_DELIVERY` frame
    pub async fn receive(&mut self) -> Result<(ChannelName, Bytes)> {
        loop {
            match self.framed.next().await {
                Some(Ok(FrameInput::Frame(frame))) => return frame.parse_addressed(),
                Some(Ok(FrameInput::Rejected(e))) => debug!(error = %e, "Skipping rejected frame"),
                Some(Err(e)) => return Err(e),
                None => return Err(PortalError::ConnectionClosed),
            }
        }
    }
}
