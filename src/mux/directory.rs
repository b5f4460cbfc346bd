//! In-memory channel directory.
//!
//! `out` channels hold payloads produced by the host and push them to
//! subscribers through the multiplexer. `in` channels collect the payloads of
//! verified submissions in a bounded inbox for the host to drain.

use crate::config::ChannelsConfig;
use crate::core::channel_name::ChannelName;
use crate::error::{constants, PortalError, Result};
use crate::mux::{Channel, ChannelDirectory, Multiplexer};
use crate::utils::flush::FlushScheduler;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Accepts submitted payloads
    In,
    /// Publishes host payloads to subscribers
    #[default]
    Out,
}

type MuxSlot = Arc<OnceLock<Weak<Multiplexer>>>;

pub struct MemoryChannel {
    name: ChannelName,
    password: Option<String>,
    direction: Direction,
    inbox: Mutex<VecDeque<Bytes>>,
    inbox_capacity: usize,
    outbox: Mutex<VecDeque<Bytes>>,
    /// Held for a whole flush so two flushes never interleave their pops
    flushing: Mutex<()>,
    scheduler: FlushScheduler,
    mux: MuxSlot,
    this: Weak<MemoryChannel>,
}

impl MemoryChannel {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Queue a payload for subscribers and schedule a flush
    pub fn publish(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.outbox.lock()?.push_back(payload.into());
        self.schedule_flush();
        Ok(())
    }

    /// Take everything submitted so far
    pub fn drain_inbox(&self) -> Result<Vec<Bytes>> {
        Ok(self.inbox.lock()?.drain(..).collect())
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn inbox_len(&self) -> usize {
        self.inbox.lock().map(|i| i.len()).unwrap_or(0)
    }

    fn schedule_flush(&self) {
        let channel = self.this.clone();
        self.scheduler.request(move || {
            if let Some(channel) = channel.upgrade() {
                channel.flush_now();
            }
        });
    }

    /// Emit queued payloads until the outbox is empty or nobody takes one.
    ///
    /// Concurrent calls run one after another, so payloads reach subscribers
    /// in outbox order. The outbox lock is released around each emission; the
    /// multiplexer may call `request_flush` on this channel while holding its
    /// own lock. Lock order is flush guard, then multiplexer, then outbox.
    pub fn flush_now(&self) -> usize {
        let Some(mux) = self.mux.get().and_then(Weak::upgrade) else {
            debug!(channel = %self.name, "Flush skipped: no multiplexer attached");
            return 0;
        };
        let Ok(_flushing) = self.flushing.lock() else {
            warn!(channel = %self.name, "Flush guard poisoned");
            return 0;
        };

        let mut sent = 0;
        loop {
            let Some(payload) = self.outbox.lock().ok().and_then(|mut o| o.pop_front()) else {
                break;
            };
            match mux.emit_message(&self.name, &payload) {
                Ok(true) => sent += 1,
                Ok(false) => {
                    self.requeue(payload);
                    break;
                }
                Err(e) => {
                    warn!(channel = %self.name, error = %e, "Flush failed");
                    self.requeue(payload);
                    break;
                }
            }
        }
        if sent > 0 {
            debug!(channel = %self.name, sent, "Outbox flushed");
        }
        sent
    }

    fn requeue(&self, payload: Bytes) {
        if let Ok(mut outbox) = self.outbox.lock() {
            outbox.push_front(payload);
        }
    }
}

impl Channel for MemoryChannel {
    fn name(&self) -> &ChannelName {
        &self.name
    }

    fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    fn accept_payload(&self, payload: Bytes) -> Result<()> {
        if self.direction == Direction::Out {
            return Err(PortalError::ChannelRejected(
                constants::ERR_OUTBOUND_ONLY.to_string(),
            ));
        }

        let mut inbox = self.inbox.lock()?;
        if inbox.len() < self.inbox_capacity {
            inbox.push_back(payload);
            return Ok(());
        }
        drop(inbox);

        // Inbox full: send the excess back out
        debug!(channel = %self.name, "Inbox full, re-emitting payload");
        self.outbox.lock()?.push_back(payload);
        self.schedule_flush();
        Ok(())
    }

    fn request_flush(&self) {
        if self.outbox_len() > 0 {
            self.schedule_flush();
        }
    }
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("protected", &self.password.is_some())
            .finish_non_exhaustive()
    }
}

/// Name -> channel map backing a relay
pub struct MemoryDirectory {
    channels: RwLock<HashMap<ChannelName, Arc<MemoryChannel>>>,
    mux: MuxSlot,
    runtime: Handle,
    settings: ChannelsConfig,
}

impl MemoryDirectory {
    /// Build a directory holding the configured static channels.
    ///
    /// Flush timers run on `runtime`.
    pub fn new(runtime: Handle, settings: &ChannelsConfig) -> Arc<Self> {
        let directory = Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
            mux: Arc::new(OnceLock::new()),
            runtime,
            settings: settings.clone(),
        });
        for channel in &settings.static_channels {
            directory.register(
                channel.name.clone(),
                channel.password.clone(),
                channel.direction,
            );
        }
        directory
    }

    /// Point flushes at `mux`. Later calls are ignored.
    pub fn attach(&self, mux: &Arc<Multiplexer>) {
        if self.mux.set(Arc::downgrade(mux)).is_err() {
            warn!("Directory already attached to a multiplexer");
        }
    }

    /// Add or replace a channel
    pub fn register(
        &self,
        name: ChannelName,
        password: Option<String>,
        direction: Direction,
    ) -> Arc<MemoryChannel> {
        let channel = Arc::new_cyclic(|this| MemoryChannel {
            name: name.clone(),
            password,
            direction,
            inbox: Mutex::new(VecDeque::new()),
            inbox_capacity: self.settings.inbox_capacity,
            outbox: Mutex::new(VecDeque::new()),
            flushing: Mutex::new(()),
            scheduler: FlushScheduler::new(
                self.runtime.clone(),
                self.settings.update_delay,
                self.settings.max_update_delay,
            ),
            mux: Arc::clone(&self.mux),
            this: this.clone(),
        });

        info!(channel = %name, ?direction, "Channel registered");
        if let Ok(mut channels) = self.channels.write() {
            channels.insert(name, Arc::clone(&channel));
        }
        channel
    }

    /// Remove a channel. Later subscribes and submits to it fail.
    pub fn unregister(&self, name: &ChannelName) -> Option<Arc<MemoryChannel>> {
        self.channels.write().ok()?.remove(name)
    }

    pub fn channel(&self, name: &ChannelName) -> Option<Arc<MemoryChannel>> {
        self.channels.read().ok()?.get(name).cloned()
    }

    pub fn names(&self) -> Vec<ChannelName> {
        let mut names: Vec<ChannelName> = self
            .channels
            .read()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl ChannelDirectory for MemoryDirectory {
    fn resolve(&self, name: &ChannelName) -> Option<Arc<dyn Channel>> {
        self.channel(name).map(|c| c as Arc<dyn Channel>)
    }
}

impl std::fmt::Debug for MemoryDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDirectory")
            .field("channels", &self.names())
            .finish_non_exhaustive()
    }
}
