#![allow(clippy::unwrap_used)]

use bytes::Bytes;
use portal_mux::core::channel_name::ChannelName;
use portal_mux::core::envelope::{open, EnvelopeCodec, SharedSecret};
use portal_mux::mux::{Channel, ChannelDirectory, Listener, ListenerHandle, Multiplexer};
use portal_mux::utils::SerialRegistry;
use portal_mux::Result;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Open(ChannelName);

impl Channel for Open {
    fn name(&self) -> &ChannelName {
        &self.0
    }
    fn password(&self) -> Option<&str> {
        None
    }
    fn accept_payload(&self, _payload: Bytes) -> Result<()> {
        Ok(())
    }
    fn request_flush(&self) {}
}

struct Single(Arc<Open>);

impl ChannelDirectory for Single {
    fn resolve(&self, name: &ChannelName) -> Option<Arc<dyn Channel>> {
        (name == &self.0 .0).then(|| Arc::clone(&self.0) as Arc<dyn Channel>)
    }
}

#[derive(Default)]
struct Sink(Mutex<Vec<Bytes>>);

impl Listener for Sink {
    fn deliver(&self, _channel: &ChannelName, envelope: &Bytes) -> bool {
        self.0.lock().unwrap().push(envelope.clone());
        true
    }
}

fn mux() -> (Arc<Multiplexer>, ChannelName) {
    let channel = ChannelName::parse("busy").unwrap();
    let directory = Arc::new(Single(Arc::new(Open(channel.clone()))));
    let registry = Arc::new(SerialRegistry::new(Duration::from_secs(60)));
    let codec = EnvelopeCodec::new(SharedSecret::from("foobar"), registry);
    (Arc::new(Multiplexer::new(directory, codec)), channel)
}

#[test]
fn concurrent_emitters_share_one_order() {
    let (mux, channel) = mux();
    let first = Arc::new(Sink::default());
    let second = Arc::new(Sink::default());
    mux.subscribe(&channel, None, &ListenerHandle::new(first.clone()))
        .unwrap();
    mux.subscribe(&channel, None, &ListenerHandle::new(second.clone()))
        .unwrap();

    let threads: Vec<_> = (0..8u8)
        .map(|t| {
            let mux = Arc::clone(&mux);
            let channel = channel.clone();
            std::thread::spawn(move || {
                for i in 0..250u32 {
                    let payload = [t, (i >> 8) as u8, i as u8];
                    assert!(mux.emit_message(&channel, &payload).unwrap());
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let a = first.0.lock().unwrap();
    let b = second.0.lock().unwrap();
    assert_eq!(a.len(), 2_000);
    // Both listeners saw the same envelopes in the same order
    assert_eq!(*a, *b);

    let secret = SharedSecret::from("foobar");
    let serials: HashSet<u32> = a.iter().map(|e| open(&secret, e).unwrap().0).collect();
    assert_eq!(serials.len(), 2_000);
}

#[test]
fn concurrent_submissions_accept_each_envelope_once() {
    let (mux, channel) = mux();
    let sealed: Vec<Bytes> = (0..200u32)
        .map(|i| mux.codec().seal(&i.to_be_bytes()).unwrap())
        .collect();
    let sealed = Arc::new(sealed);

    // Four threads race to redeem the same envelopes
    let threads: Vec<_> = (0..4)
        .map(|_| {
            let mux = Arc::clone(&mux);
            let sealed = Arc::clone(&sealed);
            let channel = channel.clone();
            std::thread::spawn(move || {
                sealed
                    .iter()
                    .filter(|e| mux.submit(&channel, e).is_ok())
                    .count()
            })
        })
        .collect();

    let accepted: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
    assert_eq!(accepted, 200);
    assert_eq!(mux.codec().registry().active_count(), 0);
}
