//! Accepts TCP connections and runs each as its own task.
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::Backend;
use crate::connection::Connection;
use crate::line_reader::LineReader;
use crate::session::Session;

pub struct Server<B: Backend> {
    listener: TcpListener,
    backend: Arc<B>,
    max_job_size: u32,
}

impl<B: Backend> Server<B> {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        backend: Arc<B>,
        max_job_size: u32,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.context("binding listener")?;

        Ok(Self {
            listener,
            backend,
            max_job_size,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts incoming connections until `cancel` fires, handling each
    /// connection as its own task. Every task holds a clone of
    /// `shutdown_hold` until it ends, so the receiving side can wait for all
    /// of them to finish.
    pub async fn serve(
        self,
        cancel: CancellationToken,
        shutdown_hold: mpsc::Sender<()>,
    ) -> Result<()> {
        info!(addr = %self.listener.local_addr()?, "listening");

        loop {
            let conn = match select! {
                accept = self.listener.accept() => accept,
                _ = cancel.cancelled() => break,
            } {
                Ok((conn, _)) => conn,
                Err(error) => {
                    warn!(%error, "failed to accept connection");
                    continue;
                },
            };

            tokio::spawn(begin_handle(
                Arc::clone(&self.backend),
                self.max_job_size,
                cancel.clone(),
                shutdown_hold.clone(),
                conn,
            ));
        }

        info!("stopped listening");

        Ok(())
    }
}

#[instrument(name = "handle", err, fields(peer = %conn.peer_addr()?), skip_all)]
async fn begin_handle<B: Backend>(
    backend: Arc<B>,
    max_job_size: u32,
    cancel: CancellationToken,
    _shutdown_hold: mpsc::Sender<()>,
    mut conn: TcpStream,
) -> Result<()> {
    debug!("accepted connection");

    conn.set_nodelay(true).context("setting NODELAY")?;

    let session = Session::new(backend).context("starting session")?;

    let ret = {
        // Split conn into read and write halves, where the read half uses our
        // LineReader.
        let (r, w) = conn.split();
        Connection::new(session, max_job_size, cancel)
            .run(LineReader::from(r), w)
            .await
    };

    // The peer may already be gone.
    if let Err(error) = conn.shutdown().await {
        debug!(%error, "shutdown failed");
    }

    debug!("closed connection");

    ret
}
