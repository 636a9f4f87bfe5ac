use std::{future::Future, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::{
    net::{TcpListener, TcpSocket},
    sync::watch,
    task::JoinSet,
};

use crate::{client, lottery::Lottery};

const AGENCY_FILE_PREFIX: &str = "agency-";
const AGENCY_FILE_SUFFIX: &str = ".csv";
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type Registry = Arc<DashMap<u64, SocketAddr>>;

/// Counts the agencies provisioned for this round, one `agency-<id>.csv` file each
pub async fn count_agency_files(dir: &Path) -> tokio::io::Result<usize> {
    let mut entries = tokio::fs::read_dir(dir).await?;

    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(AGENCY_FILE_PREFIX) && name.ends_with(AGENCY_FILE_SUFFIX) {
            count += 1;
        }
    }

    Ok(count)
}

// Keeps a connection listed as live for as long as its handler runs,
// however the handler ends
struct ConnectionGuard {
    id: u64,
    registry: Registry,
}

impl ConnectionGuard {
    fn register(registry: Registry, id: u64, addr: SocketAddr) -> Self {
        registry.insert(id, addr);
        Self { id, registry }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

pub struct Server {
    listener: TcpListener,
    lottery: Arc<Lottery>,
    handlers: JoinSet<()>,
    connections: Registry,
    stop: watch::Sender<bool>,
    shutdown_timeout: Duration,
}

impl Server {
    pub async fn bind(
        addr: SocketAddr,
        backlog: u32,
        lottery: Arc<Lottery>,
        shutdown_timeout: Duration,
    ) -> tokio::io::Result<Self> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(backlog)?;

        let (stop, _) = watch::channel(false);

        Ok(Self {
            listener,
            lottery,
            handlers: JoinSet::new(),
            connections: Registry::default(),
            stop,
            shutdown_timeout,
        })
    }

    pub fn local_addr(&self) -> tokio::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the lottery round until every agency is done, or until `shutdown` resolves
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let result = tokio::select! {
            result = self.serve() => result,
            _ = shutdown => {
                tracing::info!("received a shutdown signal, stopping the server");
                Ok(())
            }
        };

        self.shutdown().await;
        result
    }

    async fn serve(&mut self) -> anyhow::Result<()> {
        let agencies = self.lottery.agencies();

        let mut accepted = 0;
        while accepted < agencies {
            let (conn, addr) = accept_retrying(|| self.listener.accept()).await;

            accepted += 1;
            tracing::info!(
                "accepted a connection from {} ({}/{} agencies)",
                addr,
                accepted,
                agencies
            );

            let guard = ConnectionGuard::register(self.connections.clone(), accepted as u64, addr);
            let lottery = self.lottery.clone();
            let mut stop = self.stop.subscribe();

            self.handlers.spawn(async move {
                let _guard = guard;

                tokio::select! {
                    result = client::handle(conn, &lottery) => match result {
                        Ok(()) => tracing::info!("closing the connection with {}", addr),
                        Err(reason) => tracing::error!("connection with {} failed: {:#}", addr, reason),
                    },
                    _ = stop.changed() => tracing::info!("closing the connection with {} on shutdown", addr),
                }
            });
        }

        tracing::info!("all {} agencies are connected", agencies);
        join_handlers(&mut self.handlers).await;

        tracing::info!(
            "lottery round over, {}/{} agencies finished",
            self.lottery.finished_count().await,
            agencies
        );

        Ok(())
    }

    async fn shutdown(&mut self) {
        // handlers drop their sockets as soon as they notice
        let _ = self.stop.send(true);

        let drained =
            tokio::time::timeout(self.shutdown_timeout, join_handlers(&mut self.handlers)).await;

        if drained.is_err() {
            for connection in self.connections.iter() {
                tracing::warn!(
                    "connection {} with {} did not terminate in time",
                    connection.key(),
                    connection.value()
                );
            }
            self.handlers.abort_all();
        }

        tracing::info!("server shutdown finished");
    }
}

// errors such as running out of file descriptors don't clear up at once,
// so every failed attempt is followed by a pause
async fn accept_retrying<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = tokio::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(reason) => {
                tracing::error!("failed to accept a connection: {}", reason);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn join_handlers(handlers: &mut JoinSet<()>) {
    while let Some(result) = handlers.join_next().await {
        if let Err(reason) = result {
            tracing::error!("an agency handler crashed: {}", reason);
        }
    }
}
