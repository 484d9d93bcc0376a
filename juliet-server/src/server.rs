//! TCP server implementation.

use crate::config::Config;
use crate::error::ServerError;
use crate::handler::{CommandHandler, ServerInfo};
use crate::line::LineBuffer;
use crate::liveness::LivenessMonitor;
use crate::registry::Registry;
use crate::session::Session;
use juliet_protocol::Message;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Silence before a client is probed. Twice this evicts it.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Name used as the prefix of server replies.
    pub server_name: String,
    pub motd: Option<String>,
    pub password: Option<String>,
    /// Sender id for uplinked radio messages.
    pub callsign: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 6667)),
            idle_timeout: Duration::from_secs(120),
            max_connections: 256,
            server_name: "localhost".to_string(),
            motd: None,
            password: None,
            callsign: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds server settings from a loaded [`Config`].
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            idle_timeout: config.network.idle_timeout(),
            max_connections: config.network.max_connections,
            server_name: config.server.name.clone(),
            motd: config.server.motd.clone(),
            password: config.server.password.clone(),
            callsign: config.radio.callsign.clone(),
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub lines_total: AtomicU64,
}

/// Chat server.
pub struct Server {
    config: ServerConfig,
    handler: Arc<CommandHandler>,
    registry: Arc<Registry>,
    liveness: Arc<LivenessMonitor>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a server that forwards channel traffic to `uplink`.
    pub fn with_uplink(config: ServerConfig, uplink: mpsc::UnboundedSender<Message>) -> Self {
        Self::build(config, Some(uplink))
    }

    fn build(config: ServerConfig, uplink: Option<mpsc::UnboundedSender<Message>>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = Arc::new(Registry::new());

        let info = ServerInfo::new(config.server_name.clone()).with_motd(config.motd.clone());
        let mut handler = CommandHandler::new(info, registry.clone())
            .with_callsign(config.callsign.clone());
        if let Some(password) = config.password.as_deref() {
            handler = handler.with_password(password);
        }
        if let Some(uplink) = uplink {
            handler = handler.with_uplink(uplink);
        }

        let liveness = Arc::new(LivenessMonitor::new(
            registry.clone(),
            config.server_name.clone(),
            config.idle_timeout,
        ));

        Self {
            config,
            handler: Arc::new(handler),
            registry,
            liveness,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        Ok(TcpListener::bind(self.config.bind_addr).await?)
    }

    /// Binds and runs the server until [`Server::shutdown`].
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener` until [`Server::shutdown`].
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Server {} listening on {}",
            self.config.server_name,
            listener.local_addr()?
        );

        let liveness = self.liveness.clone();
        let liveness_task = tokio::spawn(async move { liveness.run().await });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept(stream, addr),
                        Err(e) => tracing::error!("Accept error: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.liveness.shutdown();
        let _ = liveness_task.await;

        for session in self.registry.sessions() {
            session.send("ERROR :Server shutting down");
            self.registry.disconnect(&session, "Server shutting down");
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Server stopped");
        Ok(())
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        if self.stats.connections_active.load(Ordering::Relaxed)
            >= self.config.max_connections as u64
        {
            tracing::warn!("Connection limit reached, rejecting {}", addr);
            self.stats
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let handler = self.handler.clone();
        let stats = self.stats.clone();
        let mut conn_shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let result =
                Self::handle_connection(stream, addr, handler, stats.clone(), &mut conn_shutdown)
                    .await;

            if let Err(e) = result {
                tracing::debug!("Connection {} error: {}", addr, e);
            }

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            tracing::info!("Client disconnected: {}", addr);
        });
    }

    /// Runs one client connection until it closes.
    async fn handle_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        handler: Arc<CommandHandler>,
        stats: Arc<ServerStats>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        tracing::info!("Client connected: {}", addr);

        let (session, mut outbound) = Session::new(addr);
        let session = Arc::new(session);
        handler.registry().register(session.clone());

        let mut lines = LineBuffer::new();
        let mut buf = [0u8; 4096];

        let result = loop {
            tokio::select! {
                biased;

                Some(line) = outbound.recv() => {
                    tracing::debug!("[{}] >> {}", addr, line);
                    if let Err(e) = Self::write_line(&mut stream, &line).await {
                        break Err(ServerError::Io(e));
                    }
                }

                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", addr);
                            break Ok("Connection closed");
                        }
                        Ok(n) => {
                            session.touch();
                            lines.extend(&buf[..n]);
                            while let Some(line) = lines.next_line() {
                                if session.is_closed() {
                                    break;
                                }
                                stats.lines_total.fetch_add(1, Ordering::Relaxed);
                                handler.handle_line(&session, &line);
                            }
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", addr, e);
                            break Err(ServerError::Io(e));
                        }
                    }
                }

                _ = session.closed() => {
                    break Ok("Session closed");
                }

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    session.send("ERROR :Server shutting down");
                    break Err(ServerError::ShuttingDown);
                }
            }
        };

        let reason = match &result {
            Ok(reason) => reason.to_string(),
            Err(e) => e.to_string(),
        };
        handler.registry().disconnect(&session, &reason);

        // Flush whatever was queued before the session closed.
        outbound.close();
        while let Ok(line) = outbound.try_recv() {
            if Self::write_line(&mut stream, &line).await.is_err() {
                break;
            }
        }
        let _ = stream.shutdown().await;

        result.map(|_| ())
    }

    pub(crate) async fn write_line(stream: &mut TcpStream, line: &str) -> std::io::Result<()> {
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        stream.write_all(&data).await
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::tcp::OwnedReadHalf;

    async fn start(config: ServerConfig) -> (Arc<Server>, SocketAddr, tokio::task::JoinHandle<()>) {
        let server = Arc::new(Server::new(config.with_server_name("irc.test")));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = {
            let server = server.clone();
            tokio::spawn(async move {
                server.serve(listener).await.unwrap();
            })
        };
        (server, addr, task)
    }

    async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        line.trim_end().to_string()
    }

    #[tokio::test]
    async fn test_server_not_running_before_serve() {
        let server = Server::new(ServerConfig::new("127.0.0.1:0".parse().unwrap()));
        assert!(!server.is_running());
        assert_eq!(server.registry().session_count(), 0);
    }

    #[tokio::test]
    async fn test_registration_over_tcp() {
        let (server, addr, task) = start(ServerConfig::default()).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        write
            .write_all(b"NICK alice\r\nUSER alice 0 * :Alice\r\n")
            .await
            .unwrap();

        let welcome = read_line(&mut reader).await;
        assert!(
            welcome.starts_with(":irc.test 001 alice :Welcome to the mesh IRC network alice"),
            "{}",
            welcome
        );
        for expected in ["002", "003", "004", "422"] {
            let line = read_line(&mut reader).await;
            assert_eq!(line.split(' ').nth(1), Some(expected), "{}", line);
        }

        write.write_all(b"PING :abc\r\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, ":irc.test PONG irc.test :abc");

        write.write_all(b"QUIT :bye\r\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "ERROR :Closing link");

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!server.is_running());
        assert_eq!(server.registry().session_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_chat_over_tcp() {
        let (server, addr, _task) = start(ServerConfig::default()).await;

        let mut readers = Vec::new();
        let mut writers = Vec::new();
        for nick in ["amy", "ben"] {
            let (read, mut write) = TcpStream::connect(addr).await.unwrap().into_split();
            let mut reader = BufReader::new(read);
            write
                .write_all(format!("NICK {0}\r\nUSER {0} 0 * :{0}\r\nJOIN #chat\r\n", nick).as_bytes())
                .await
                .unwrap();
            // 001-004, 422, JOIN, 331, 353, 366
            for _ in 0..9 {
                read_line(&mut reader).await;
            }
            readers.push(reader);
            writers.push(write);
        }

        // amy sees ben's join.
        assert_eq!(
            read_line(&mut readers[0]).await,
            ":ben!ben@127.0.0.1 JOIN #chat"
        );

        writers[0].write_all(b"PRIVMSG #chat :hi ben\r\n").await.unwrap();
        assert_eq!(
            read_line(&mut readers[1]).await,
            ":amy!amy@127.0.0.1 PRIVMSG #chat :hi ben"
        );

        server.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_deregisters() {
        let (server, addr, _task) = start(ServerConfig::default()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"NICK temp\r\n").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while server.registry().find_by_nick("temp").is_none() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(stream);
        while server.registry().session_count() > 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        server.shutdown();
    }
}
