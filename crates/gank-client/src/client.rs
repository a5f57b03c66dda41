//! Per-tunnel control connections with reconnection

use crate::status::{log_status, StatusCallback, StatusReporter, TunnelStatus};
use crate::udp::{serve_udp_stream, UDP_IDLE_TIMEOUT};
use crate::{ClientConfig, ClientError, TunnelDescriptor};
use gank_connection::{bridge, Incoming, Tunnel, TunnelConfig, VirtualStream};
use gank_proto::TunnelType;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

/// Limit for reaching the server
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Limit for reaching the local service behind a stream
pub const LOCAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Pause between reconnection attempts
pub const RETRY_DELAY: Duration = Duration::from_secs(3);

/// Runs every tunnel of a [`ClientConfig`]
pub struct TunnelClient {
    config: ClientConfig,
    on_status: StatusCallback,
    retry_delay: Duration,
    udp_idle_timeout: Duration,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            on_status: Arc::new(log_status),
            retry_delay: RETRY_DELAY,
            udp_idle_timeout: UDP_IDLE_TIMEOUT,
        }
    }

    pub fn with_status_callback(mut self, callback: StatusCallback) -> Self {
        self.on_status = callback;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_udp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.udp_idle_timeout = timeout;
        self
    }

    /// Start one independent task per tunnel
    pub fn start(self) -> Result<ClientHandle, ClientError> {
        self.config.validate()?;

        let mut statuses = HashMap::new();
        let mut tasks = Vec::new();
        for descriptor in &self.config.tunnels {
            let reporter = Arc::new(StatusReporter::new(
                descriptor.name.clone(),
                self.on_status.clone(),
            ));
            statuses.insert(descriptor.name.clone(), reporter.subscribe());

            let session = Session {
                server_addr: self.config.server_addr.clone(),
                token: self.config.token.clone(),
                descriptor: descriptor.clone(),
                udp_idle_timeout: self.udp_idle_timeout,
                status: reporter,
            };
            tasks.push(tokio::spawn(run_tunnel(session, self.retry_delay)));
        }

        Ok(ClientHandle { statuses, tasks })
    }
}

/// Running tunnels of a started client
pub struct ClientHandle {
    statuses: HashMap<String, watch::Receiver<TunnelStatus>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ClientHandle {
    /// Live status of the named tunnel
    pub fn status(&self, name: &str) -> Option<watch::Receiver<TunnelStatus>> {
        self.statuses.get(name).cloned()
    }

    /// Stop every tunnel. Dropping the control connections closes them.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Wait for the tunnel tasks, which only end on shutdown
    pub async fn wait(mut self) {
        for task in std::mem::take(&mut self.tasks) {
            let _ = task.await;
        }
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Session {
    server_addr: String,
    token: String,
    descriptor: TunnelDescriptor,
    udp_idle_timeout: Duration,
    status: Arc<StatusReporter>,
}

/// Keep one tunnel up, reconnecting after a fixed delay
async fn run_tunnel(session: Session, retry_delay: Duration) {
    let name = session.descriptor.name.clone();
    loop {
        session.status.set(TunnelStatus::Connecting);
        match session.connect_once().await {
            Ok(()) => {
                info!("[{}] Connection lost, reconnecting in {:?}", name, retry_delay);
                session.status.set(TunnelStatus::Disconnected);
            }
            Err(e) => {
                error!("[{}] {}", name, e);
                session.status.set(TunnelStatus::Error(e.to_string()));
            }
        }
        tokio::time::sleep(retry_delay).await;
    }
}

impl Session {
    /// Run one control connection. Returns `Ok` once the server goes away.
    async fn connect_once(&self) -> Result<(), ClientError> {
        let socket = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.server_addr))
            .await
            .map_err(|_| ClientError::ConnectTimeout(self.server_addr.clone()))?
            .map_err(|source| ClientError::Connect {
                address: self.server_addr.clone(),
                source,
            })?;
        let _ = socket.set_nodelay(true);

        let (tunnel, incoming) = Tunnel::spawn(socket, TunnelConfig::default());
        let _guard = CloseOnDrop(tunnel.clone());
        self.serve(&tunnel, incoming).await
    }

    async fn serve(&self, tunnel: &Tunnel, incoming: Incoming) -> Result<(), ClientError> {
        self.status.set(TunnelStatus::Authenticating);
        tunnel.start_auth(&self.token).await?;

        let url = tunnel.prepare_tunnel(self.descriptor.request()).await?;

        if self.descriptor.is_visitor() {
            let listener = self.bind_visitor().await?;
            self.status.set(TunnelStatus::Ready(url));
            return self.serve_visitor(tunnel, incoming, listener).await;
        }
        self.status.set(TunnelStatus::Ready(url));
        self.serve_incoming(tunnel, incoming).await;
        Ok(())
    }

    /// Answer streams opened by the server until the tunnel closes
    async fn serve_incoming(&self, tunnel: &Tunnel, mut incoming: Incoming) {
        let local_addr = self.descriptor.local_addr();
        while let Some(stream) = incoming.next_stream().await {
            trace!("[{}] Incoming stream {}", self.descriptor.name, stream.id());
            let tunnel = tunnel.clone();
            let local_addr = local_addr.clone();
            match self.descriptor.tunnel_type {
                TunnelType::Udp => {
                    if tunnel.set_ready(&stream).is_err() {
                        continue;
                    }
                    tokio::spawn(serve_udp_stream(stream, local_addr, self.udp_idle_timeout));
                }
                TunnelType::Tcp | TunnelType::Web | TunnelType::Stcp => {
                    tokio::spawn(serve_local_stream(tunnel, stream, local_addr));
                }
            }
        }
    }

    async fn bind_visitor(&self) -> Result<TcpListener, ClientError> {
        let bind_addr = self
            .descriptor
            .bind_addr()
            .ok_or_else(|| ClientError::Config("stcp visitor without bind_port".to_string()))?;
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| ClientError::Connect {
                address: bind_addr.to_string(),
                source,
            })?;
        info!("[{}] Visitor listening on {}", self.descriptor.name, bind_addr);
        Ok(listener)
    }

    /// Open one stream per connection accepted on the visitor listener
    async fn serve_visitor(
        &self,
        tunnel: &Tunnel,
        mut incoming: Incoming,
        listener: TcpListener,
    ) -> Result<(), ClientError> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = accepted?;
                    let _ = socket.set_nodelay(true);
                    let tunnel = tunnel.clone();
                    tokio::spawn(async move {
                        match tunnel.create_stream().await {
                            Ok(stream) => {
                                if let Err(e) = bridge(stream, socket).await {
                                    debug!("Visitor connection from {} ended: {}", peer, e);
                                }
                            }
                            Err(e) => debug!("Could not open stcp stream for {}: {}", peer, e),
                        }
                    });
                }
                stream = incoming.next_stream() => {
                    match stream {
                        Some(stream) => tunnel.reset_stream(&stream, "unexpected stream"),
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}

/// Closes the session when the task serving it ends or is aborted
struct CloseOnDrop(Tunnel);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Connect a stream opened by the server to the local service
async fn serve_local_stream(tunnel: Tunnel, stream: VirtualStream, local_addr: String) {
    let socket = match tokio::time::timeout(LOCAL_CONNECT_TIMEOUT, TcpStream::connect(&local_addr)).await {
        Ok(Ok(socket)) => socket,
        Ok(Err(e)) => {
            debug!("Local service {} unreachable: {}", local_addr, e);
            tunnel.reset_stream(&stream, &e.to_string());
            return;
        }
        Err(_) => {
            debug!("Timed out connecting to local service {}", local_addr);
            tunnel.reset_stream(&stream, "local connect timeout");
            return;
        }
    };
    let _ = socket.set_nodelay(true);

    if let Err(e) = tunnel.set_ready(&stream) {
        debug!("Stream {} gone before local connect finished: {}", stream.id(), e);
        return;
    }
    if let Err(e) = bridge(stream, socket).await {
        let e = ClientError::LocalBridge(e.to_string());
        debug!("{}", e);
    }
}
