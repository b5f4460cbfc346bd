//! # Pub/Sub Multiplexer
//!
//! Routes signed envelopes between named channels and the listeners
//! subscribed to them.
//!
//! ## Operations
//! - **subscribe**: attach a listener to a channel, gated by the channel password
//! - **unsubscribe**: detach a listener
//! - **emit_message**: seal a payload once and fan it out to every subscriber
//! - **submit**: verify an inbound envelope and hand its payload to the channel
//!
//! All four run under one mutex for their whole duration, so emissions on a
//! channel reach each subscriber in the order they were made. Nothing inside
//! the lock blocks or awaits. Channels and listeners are called with the lock
//! held and must never call back into the multiplexer synchronously.

pub mod directory;

use crate::core::channel_name::ChannelName;
use crate::core::envelope::EnvelopeCodec;
use crate::error::{PortalError, Result};
use crate::utils::metrics::global_metrics;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use subtle::ConstantTimeEq;
use tracing::{debug, instrument, warn};

/// Receives envelopes emitted on channels it subscribed to
pub trait Listener: Send + Sync {
    /// Queue `envelope` for delivery. Returns false when it could not be accepted.
    fn deliver(&self, channel: &ChannelName, envelope: &Bytes) -> bool;
}

/// A named source/sink of payloads supplied by the host
pub trait Channel: Send + Sync {
    fn name(&self) -> &ChannelName;

    /// Password required to subscribe, if any
    fn password(&self) -> Option<&str>;

    /// Accept the payload of a verified submission
    fn accept_payload(&self, payload: Bytes) -> Result<()>;

    /// Ask the channel to push pending payloads soon. Must not block.
    fn request_flush(&self);
}

/// Looks channels up by name
pub trait ChannelDirectory: Send + Sync {
    fn resolve(&self, name: &ChannelName) -> Option<Arc<dyn Channel>>;
}

/// Unique identity of a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Listener plus identity; equality is by identity only
#[derive(Clone)]
pub struct ListenerHandle {
    id: ListenerId,
    inner: Arc<dyn Listener>,
}

impl ListenerHandle {
    pub fn new(listener: Arc<dyn Listener>) -> Self {
        Self {
            id: ListenerId::next(),
            inner: listener,
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    fn deliver(&self, channel: &ChannelName, envelope: &Bytes) -> bool {
        self.inner.deliver(channel, envelope)
    }
}

impl PartialEq for ListenerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ListenerHandle {}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ListenerHandle").field(&self.id).finish()
    }
}

/// Unset and empty configured passwords both mean "open channel"
fn password_matches(configured: Option<&str>, supplied: Option<&str>) -> bool {
    match configured.filter(|p| !p.is_empty()) {
        None => true,
        Some(expected) => supplied
            .map(|given| bool::from(expected.as_bytes().ct_eq(given.as_bytes())))
            .unwrap_or(false),
    }
}

pub struct Multiplexer {
    directory: Arc<dyn ChannelDirectory>,
    codec: EnvelopeCodec,
    subscriptions: Mutex<HashMap<ChannelName, Vec<ListenerHandle>>>,
}

impl Multiplexer {
    pub fn new(directory: Arc<dyn ChannelDirectory>, codec: EnvelopeCodec) -> Self {
        Self {
            directory,
            codec,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn codec(&self) -> &EnvelopeCodec {
        &self.codec
    }

    fn resolve(&self, channel: &ChannelName) -> Result<Arc<dyn Channel>> {
        self.directory
            .resolve(channel)
            .ok_or_else(|| PortalError::UnknownChannel(channel.to_string()))
    }

    /// Attach `listener` to `channel`, then ask the channel to flush so the
    /// new subscriber picks up anything already queued.
    #[instrument(skip(self, password, listener), fields(listener = %listener.id()))]
    pub fn subscribe(
        &self,
        channel: &ChannelName,
        password: Option<&str>,
        listener: &ListenerHandle,
    ) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock()?;
        let target = self.resolve(channel)?;

        if subscriptions
            .get(channel)
            .is_some_and(|listeners| listeners.contains(listener))
        {
            return Err(PortalError::AlreadySubscribed(channel.to_string()));
        }

        if !password_matches(target.password(), password) {
            warn!("Subscription refused: password mismatch");
            return Err(PortalError::PasswordMismatch);
        }

        subscriptions
            .entry(channel.clone())
            .or_default()
            .push(listener.clone());
        global_metrics().subscription_added();
        debug!("Listener subscribed");

        target.request_flush();
        Ok(())
    }

    #[instrument(skip(self, listener), fields(listener = %listener.id()))]
    pub fn unsubscribe(&self, channel: &ChannelName, listener: &ListenerHandle) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock()?;
        let not_subscribed = || PortalError::NotSubscribed(channel.to_string());

        let listeners = subscriptions.get_mut(channel).ok_or_else(not_subscribed)?;
        let position = listeners
            .iter()
            .position(|l| l == listener)
            .ok_or_else(not_subscribed)?;
        listeners.remove(position);

        if listeners.is_empty() {
            subscriptions.remove(channel);
        }
        debug!("Listener unsubscribed");
        Ok(())
    }

    /// Seal `payload` and deliver it to every subscriber of `channel`.
    ///
    /// Returns `Ok(false)` without consuming a serial when nobody is
    /// subscribed, and otherwise whether at least one listener accepted it.
    /// Every listener is offered the envelope even after one has accepted.
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub fn emit_message(&self, channel: &ChannelName, payload: &[u8]) -> Result<bool> {
        let subscriptions = self.subscriptions.lock()?;

        let Some(listeners) = subscriptions.get(channel).filter(|l| !l.is_empty()) else {
            debug!("No subscribers");
            return Ok(false);
        };

        let envelope = self.codec.seal(payload)?;
        global_metrics().envelope_emitted();

        let mut accepted = false;
        for listener in listeners {
            let delivered = listener.deliver(channel, &envelope);
            global_metrics().delivery(delivered);
            accepted |= delivered;
        }
        Ok(accepted)
    }

    /// Verify `envelope` and hand its payload to `channel`
    #[instrument(skip(self, envelope), fields(bytes = envelope.len()))]
    pub fn submit(&self, channel: &ChannelName, envelope: &[u8]) -> Result<()> {
        let _guard = self.subscriptions.lock()?;
        let target = self.resolve(channel)?;

        let opened = match self.codec.unseal(envelope) {
            Ok(opened) => opened,
            Err(e) => {
                global_metrics().envelope_rejected();
                return Err(e);
            }
        };
        global_metrics().envelope_accepted();
        debug!(serial = opened.serial, "Envelope accepted");

        target.accept_payload(opened.payload)
    }

    /// Number of listeners on `channel`
    pub fn subscriber_count(&self, channel: &ChannelName) -> usize {
        self.subscriptions
            .lock()
            .map(|s| s.get(channel).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Number of channels with at least one listener
    pub fn active_channels(&self) -> usize {
        self.subscriptions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("active_channels", &self.active_channels())
            .finish_non_exhaustive()
    }
}
