use crate::core::channel_name::ChannelName;
use crate::error::{PortalError, Result};
use crate::mux::{ListenerHandle, Multiplexer};
use crate::protocol::command::Command;
use crate::protocol::frame::{Frame, FrameTag};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// What the connection should do after a command succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Close,
}

/// Per-connection command router.
///
/// Owns the connection's listener identity and remembers which channels it
/// joined, so a closing connection leaves no subscriptions behind.
pub struct Dispatcher {
    mux: Arc<Multiplexer>,
    listener: ListenerHandle,
    subscriptions: HashSet<ChannelName>,
}

impl Dispatcher {
    pub fn new(mux: Arc<Multiplexer>, listener: ListenerHandle) -> Self {
        Self {
            mux,
            listener,
            subscriptions: HashSet::new(),
        }
    }

    pub fn listener(&self) -> &ListenerHandle {
        &self.listener
    }

    pub fn is_subscribed(&self, channel: &ChannelName) -> bool {
        self.subscriptions.contains(channel)
    }

    pub fn dispatch(&mut self, command: Command) -> Result<Outcome> {
        match command {
            Command::Subscribe { channel, password } => {
                self.mux
                    .subscribe(&channel, password.as_deref(), &self.listener)?;
                self.subscriptions.insert(channel);
            }
            Command::Unsubscribe { channel } => {
                self.mux.unsubscribe(&channel, &self.listener)?;
                self.subscriptions.remove(&channel);
            }
            Command::Submit { channel, envelope } => {
                self.mux.submit(&channel, &envelope)?;
            }
            Command::Quit => return Ok(Outcome::Close),
        }
        Ok(Outcome::Continue)
    }

    /// Run the command carried by a binary frame
    pub fn handle_frame(&mut self, frame: &Frame) -> Result<Outcome> {
        let command = command_for(frame)?;
        self.dispatch(command)
    }

    /// Drop every subscription this connection still holds
    pub fn teardown(&mut self) {
        for channel in self.subscriptions.drain() {
            match self.mux.unsubscribe(&channel, &self.listener) {
                Ok(()) => debug!(%channel, listener = %self.listener.id(), "Released subscription"),
                Err(PortalError::NotSubscribed(_)) => {}
                Err(e) => warn!(%channel, error = %e, "Failed to release subscription"),
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Map an inbound frame onto the equivalent text command
pub fn command_for(frame: &Frame) -> Result<Command> {
    match frame.tag {
        FrameTag::SubscribePortal => Ok(Command::Subscribe {
            channel: ChannelName::from_bytes(&frame.payload)?,
            password: None,
        }),
        FrameTag::UnsubscribePortal => Ok(Command::Unsubscribe {
            channel: ChannelName::from_bytes(&frame.payload)?,
        }),
        FrameTag::SubmitItems => {
            let (channel, envelope) = frame.parse_addressed()?;
            Ok(Command::Submit { channel, envelope })
        }
        FrameTag::ItemDelivery => Err(PortalError::UnknownFrameTag(frame.tag.into())),
    }
}
