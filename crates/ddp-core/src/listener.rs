//! ---
//! ddp_section: "01-core-functionality"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "TCP ingress for physical devices."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};

use anyhow::{Context, Result};
use ddp_msg::{FramedConnection, WireFormat};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::supervisor::DeviceSupervisor;

/// Bind `addr` and hand every accepted socket to `supervisor`.
pub fn spawn_listener(supervisor: DeviceSupervisor, addr: SocketAddr) -> Result<ListenerServer> {
    let socket = StdTcpListener::bind(addr)
        .and_then(|socket| socket.set_nonblocking(true).map(|()| socket))
        .with_context(|| format!("failed to bind device listener {addr}"))?;
    let bound = socket.local_addr().context("device listener has no local address")?;
    let listener = TcpListener::from_std(socket).context("failed to register device listener")?;
    info!(address = %bound, "device listener starting");

    let format = supervisor.config().format;
    let (stop, stopped) = oneshot::channel();
    Ok(ListenerServer {
        addr: bound,
        stop: Some(stop),
        task: tokio::spawn(accept_loop(listener, supervisor, format, stopped)),
    })
}

async fn accept_loop(
    listener: TcpListener,
    supervisor: DeviceSupervisor,
    format: WireFormat,
    mut stopped: oneshot::Receiver<()>,
) {
    loop {
        let (socket, peer) = tokio::select! {
            _ = &mut stopped => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "failed to accept device connection");
                    continue;
                }
            },
        };
        if let Err(err) = socket.set_nodelay(true) {
            debug!(peer = %peer, error = %err, "unable to disable nagle");
        }
        let connection = FramedConnection::new(socket, format, peer.to_string());
        let supervisor = supervisor.clone();
        let span = info_span!("connection", peer = %peer);
        tokio::spawn(
            async move {
                // Outcomes are logged by the supervisor.
                let _ = supervisor.serve_connection(connection).await;
            }
            .instrument(span),
        );
    }
    info!("device listener stopped");
}

/// Handle to the running device listener.
#[derive(Debug)]
pub struct ListenerServer {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ListenerServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and release the socket. Sessions already
    /// running are unaffected.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.context("device listener task panicked")
    }
}
