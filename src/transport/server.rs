//! Relay event loop.
//!
//! One dedicated OS thread runs a current-thread runtime that accepts on the
//! text listener and, when configured, the binary listener. Every connection
//! is a local task on that thread, so per-connection state needs no locking.
//! The multiplexer is the only state shared with other threads.

use crate::config::ServerConfig;
use crate::error::Result;
use crate::mux::Multiplexer;
use crate::transport::connection::{serve_binary, serve_text};
use crate::utils::metrics::global_metrics;
use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Text,
    Binary,
}

/// Handle to a running relay
#[derive(Debug)]
pub struct ServerHandle {
    text_addr: SocketAddr,
    binary_addr: Option<SocketAddr>,
    shutdown_tx: mpsc::Sender<()>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl ServerHandle {
    /// Bound text protocol address
    pub fn text_addr(&self) -> SocketAddr {
        self.text_addr
    }

    /// Bound binary protocol address, if enabled
    pub fn binary_addr(&self) -> Option<SocketAddr> {
        self.binary_addr
    }

    /// Stop accepting, close every connection and wait for the I/O thread
    pub fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown_tx.try_send(());
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => {
                error!("Relay I/O thread panicked");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        // Detach; the loop exits once it sees the signal
        let _ = self.shutdown_tx.try_send(());
    }
}

/// Bind the configured listeners and start the relay thread.
///
/// Binding happens on the caller's thread so address errors surface here.
pub fn spawn(config: &ServerConfig, mux: Arc<Multiplexer>) -> Result<ServerHandle> {
    let text = bind(&config.text_address)?;
    let binary = config.binary_address.as_deref().map(bind).transpose()?;

    let text_addr = text.local_addr()?;
    let binary_addr = binary.as_ref().map(|l| l.local_addr()).transpose()?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let settings = Arc::new(config.clone());
    let thread = std::thread::Builder::new()
        .name("portal-mux-io".into())
        .spawn(move || run(text, binary, mux, settings, shutdown_rx))?;

    info!(%text_addr, ?binary_addr, "Relay listening");
    Ok(ServerHandle {
        text_addr,
        binary_addr,
        shutdown_tx,
        thread: Some(thread),
    })
}

fn bind(address: &str) -> Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind(address)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn run(
    text: std::net::TcpListener,
    binary: Option<std::net::TcpListener>,
    mux: Arc<Multiplexer>,
    settings: Arc<ServerConfig>,
    shutdown_rx: mpsc::Receiver<()>,
) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = LocalSet::new();
    // Dropping the LocalSet on return drops every connection task
    local.block_on(&runtime, serve(text, binary, mux, settings, shutdown_rx))
}

async fn serve(
    text: std::net::TcpListener,
    binary: Option<std::net::TcpListener>,
    mux: Arc<Multiplexer>,
    settings: Arc<ServerConfig>,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> Result<()> {
    let text = TcpListener::from_std(text)?;
    let binary = binary.map(TcpListener::from_std).transpose()?;
    let active = Rc::new(Cell::new(0usize));

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!(connections = active.get(), "Shutting down relay");
                return Ok(());
            }
            accepted = text.accept() => {
                on_accept(accepted, Protocol::Text, &mux, &settings, &active);
            }
            accepted = accept_optional(binary.as_ref()) => {
                on_accept(accepted, Protocol::Binary, &mux, &settings, &active);
            }
        }
    }
}

async fn accept_optional(
    listener: Option<&TcpListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Decrements the live connection count when a connection task ends
struct ActiveGuard(Rc<Cell<usize>>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
        global_metrics().connection_closed();
    }
}

fn on_accept(
    accepted: std::io::Result<(TcpStream, SocketAddr)>,
    protocol: Protocol,
    mux: &Arc<Multiplexer>,
    settings: &Arc<ServerConfig>,
    active: &Rc<Cell<usize>>,
) {
    let (stream, peer) = match accepted {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, ?protocol, "Error accepting connection");
            return;
        }
    };

    if active.get() >= settings.max_connections {
        global_metrics().connection_refused();
        warn!(%peer, limit = settings.max_connections, "Connection limit reached, closing");
        return;
    }

    if let Err(e) = stream.set_nodelay(true) {
        warn!(%peer, error = %e, "Failed to set TCP_NODELAY");
    }

    active.set(active.get() + 1);
    global_metrics().connection_established();
    info!(%peer, ?protocol, "Connection accepted");

    let guard = ActiveGuard(Rc::clone(active));
    let mux = Arc::clone(mux);
    let settings = Arc::clone(settings);
    tokio::task::spawn_local(async move {
        let _guard = guard;
        match protocol {
            Protocol::Text => serve_text(stream, peer, mux, settings).await,
            Protocol::Binary => serve_binary(stream, peer, mux, settings).await,
        }
    });
}
