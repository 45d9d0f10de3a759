//! TCP server for pixelflut connections.
//!
//! Accepts connections, frames and decodes commands, and executes them
//! against the shared canvases. Also starts the render pacers, the stats
//! stream and the viewer listener.

use crate::broadcast::{BroadcastHub, Pacer};
use crate::canvas::{CanvasError, Canvases};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::protocol::command::{ICON_GRID, MAIN_GRID};
use crate::protocol::{Command, Framer, ProtocolError, Scan};
use crate::render::{JpegRenderer, Renderer};
use crate::stats::{stats_loop, ServerStats};
use crate::viewer::{self, Viewer};
use bytes::{Buf, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Reasons a connection worker stops.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("canvas error: {0}")]
    Canvas(#[from] CanvasError),

    #[error("unrecognized opcode, no progress for {0:?}")]
    Stalled(Duration),
}

/// Per-connection limits.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub max_line_length: usize,
    pub stall_grace: Duration,
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_line_length: config.max_line_length,
            stall_grace: config.stall_grace,
        }
    }
}

/// Server instance
pub struct Server {
    config: Config,
    canvases: Arc<Canvases>,
    stats: Arc<ServerStats>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance with its main and icon canvases
    pub fn new(config: Config) -> Result<Self, CanvasError> {
        let mut canvases = Canvases::new();
        canvases.create(config.width, config.height, config.fill)?;
        canvases.create(config.icon_width, config.icon_height, config.fill)?;

        Ok(Server {
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            config,
            canvases: Arc::new(canvases),
            stats: ServerStats::new(),
        })
    }

    /// Start the server and begin accepting connections
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = bind_listener(&self.config.listen)?;
        info!(address = %self.config.listen, "Pixelflut listening");

        self.start_broadcast()?;

        let dispatcher = Dispatcher::new(Arc::clone(&self.canvases));
        let settings = ConnectionSettings::from(&self.config);

        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let dispatcher = dispatcher.clone();
                    let guard = self.stats.track_connection();

                    tokio::spawn(async move {
                        match handle_connection(stream, &dispatcher, settings).await {
                            Ok(()) => debug!(peer = %addr, "Connection closed"),
                            Err(ConnectionError::Io(e)) => {
                                debug!(peer = %addr, error = %e, "Connection error")
                            }
                            Err(e) => warn!(peer = %addr, error = %e, "Closing connection"),
                        }
                        drop(guard);
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Spawn a pacer per canvas, the stats stream and the viewer server.
    fn start_broadcast(&self) -> Result<(), Box<dyn std::error::Error>> {
        let main = Arc::clone(self.canvases.get(MAIN_GRID)?);
        let icon = Arc::clone(self.canvases.get(ICON_GRID)?);
        let grid_renderer: Arc<dyn Renderer> =
            Arc::new(JpegRenderer::new(self.config.grid_quality));
        let icon_renderer: Arc<dyn Renderer> =
            Arc::new(JpegRenderer::new(self.config.icon_quality));

        let grid_hub = BroadcastHub::new("grid", self.config.hub);
        let icon_hub = BroadcastHub::new("icon", self.config.hub);
        let stats_hub = BroadcastHub::new("stats", self.config.hub);

        for (canvas, hub, renderer) in [
            (&main, &grid_hub, &grid_renderer),
            (&icon, &icon_hub, &icon_renderer),
        ] {
            let pacer = Pacer::new(
                Arc::clone(canvas),
                Arc::clone(hub),
                Arc::clone(renderer),
                self.config.pacer,
            );
            tokio::spawn(pacer.run());
        }

        tokio::spawn(stats_loop(
            Arc::clone(&self.stats),
            Arc::clone(&self.canvases),
            Arc::clone(&stats_hub),
            self.config.stats_interval,
        ));

        let viewer = Viewer {
            grid: grid_hub,
            icon: icon_hub,
            stats: stats_hub,
            icon_canvas: icon,
            grid_renderer,
            icon_renderer,
            write_timeout: self.config.hub.write_timeout,
        };
        let addr: SocketAddr = self.config.viewer_listen.parse()?;
        let (bound, server) = viewer::bind(addr, viewer)?;
        info!(address = %bound, "Viewer listening");
        tokio::spawn(server);
        Ok(())
    }

    /// Get a reference to the canvases for testing
    #[cfg(test)]
    pub fn canvases(&self) -> &Arc<Canvases> {
        &self.canvases
    }
}

/// What stopped the frame loop over the current buffer.
enum Progress {
    NeedData,
    Stalled,
}

/// Handle a single client connection
pub async fn handle_connection<S>(
    mut stream: S,
    dispatcher: &Dispatcher,
    settings: ConnectionSettings,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let framer = Framer::new(settings.max_line_length);
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let mut replies = BytesMut::with_capacity(BUFFER_SIZE);
    let mut eof = false;

    loop {
        let progress = process_buffer(&framer, dispatcher, &mut buffer, &mut replies, eof);

        // Replies of commands that ran before a failure still go out.
        if !replies.is_empty() {
            stream.write_all(&replies).await?;
            replies.clear();
        }

        match progress? {
            Progress::NeedData => {}
            Progress::Stalled if eof => return Ok(()),
            Progress::Stalled => return stall(&mut stream, settings.stall_grace).await,
        }

        if eof {
            trace!("Connection closed by client");
            return Ok(());
        }

        if stream.read_buf(&mut buffer).await? == 0 {
            eof = true;
        }
    }
}

/// Run every complete frame in `buffer`, appending replies.
fn process_buffer(
    framer: &Framer,
    dispatcher: &Dispatcher,
    buffer: &mut BytesMut,
    replies: &mut BytesMut,
    eof: bool,
) -> Result<Progress, ConnectionError> {
    loop {
        match framer.next_frame(buffer, eof) {
            Scan::Frame(frame, consumed) => {
                let command = Command::decode(frame)?;
                trace!(?command, "Processing command");
                dispatcher.dispatch(&command, replies)?;
                buffer.advance(consumed);
            }
            Scan::Incomplete => return Ok(Progress::NeedData),
            Scan::Unrecognized => return Ok(Progress::Stalled),
            Scan::Invalid(e) => return Err(e.into()),
        }
    }
}

/// Discard input until the peer hangs up or the grace period ends.
///
/// Nothing after an unrecognized opcode can be framed, so the connection is
/// only kept long enough to let a peer notice and close it cleanly.
async fn stall<S>(stream: &mut S, grace: Duration) -> Result<(), ConnectionError>
where
    S: AsyncRead + Unpin,
{
    debug!(grace_ms = grace.as_millis() as u64, "Unrecognized opcode, stalling");
    let deadline = tokio::time::Instant::now() + grace;
    let mut scratch = [0u8; 512];

    loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut scratch)).await {
            Err(_) => return Err(ConnectionError::Stalled(grace)),
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
        }
    }
}

/// Create a TCP listener with SO_REUSEADDR set.
pub fn bind_listener(addr: &str) -> io::Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{HubConfig, PacerConfig};
    use crate::canvas::Fill;
    use crate::color::Color;
    use tokio::io::duplex;
    use tokio_test::io::Builder;

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            viewer_listen: "127.0.0.1:0".to_string(),
            max_connections: 16,
            workers: None,
            width: 800,
            height: 600,
            icon_width: 32,
            icon_height: 32,
            fill: Fill::Solid(Color::BLACK),
            max_line_length: 64,
            stall_grace: Duration::from_millis(50),
            hub: HubConfig::default(),
            pacer: PacerConfig::default(),
            stats_interval: Duration::from_secs(1),
            grid_quality: 75,
            icon_quality: 90,
            log_level: "info".to_string(),
        }
    }

    fn setup() -> (Dispatcher, ConnectionSettings) {
        let config = test_config();
        let server = Server::new(config.clone()).unwrap();
        (
            Dispatcher::new(Arc::clone(server.canvases())),
            ConnectionSettings::from(&config),
        )
    }

    #[test]
    fn test_server_creation() {
        let server = Server::new(test_config()).unwrap();
        assert_eq!(server.canvases().len(), 2);
        assert_eq!(server.canvases().get(0).unwrap().width(), 800);
        assert_eq!(server.canvases().get(1).unwrap().height(), 32);
    }

    #[tokio::test]
    async fn test_text_size() {
        let (dispatcher, settings) = setup();
        let stream = Builder::new()
            .read(b"SIZE\n")
            .write(b"SIZE 800 600\n")
            .build();
        handle_connection(stream, &dispatcher, settings).await.unwrap();
    }

    #[tokio::test]
    async fn test_text_write_then_read() {
        let (dispatcher, settings) = setup();
        let stream = Builder::new()
            .read(b"PX 10 10 ff0000\nPX 10 10\n")
            .write(b"PX 10 10 ff0000\n")
            .build();
        handle_connection(stream, &dispatcher, settings).await.unwrap();
    }

    #[tokio::test]
    async fn test_text_split_across_reads() {
        let (dispatcher, settings) = setup();
        let stream = Builder::new()
            .read(b"PX 1 2 0")
            .read(b"000ff\r\nP")
            .read(b"X 1 2\r\n")
            .write(b"PX 1 2 0000ff\n")
            .build();
        handle_connection(stream, &dispatcher, settings).await.unwrap();
    }

    #[tokio::test]
    async fn test_unterminated_line_at_eof() {
        let (dispatcher, settings) = setup();
        let (server_side, mut client) = duplex(64);
        client.write_all(b"ISIZE").await.unwrap();
        client.shutdown().await.unwrap();

        tokio::time::timeout(
            Duration::from_secs(2),
            handle_connection(server_side, &dispatcher, settings),
        )
        .await
        .expect("unterminated line was never flushed")
        .unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"ISIZE 32 32\n");
    }

    #[tokio::test]
    async fn test_binary_in_chunks() {
        let (dispatcher, settings) = setup();
        let stream = Builder::new()
            .read(&[0xB0, 0x00, 0x01])
            .read(&[0x00, 0x02, 0x09])
            .read(&[0x08, 0x07, 0x80, 0x00])
            .read(&[0x01, 0x00, 0x02, 0x21])
            .write(&[0x09, 0x08, 0x07, 0x00, 0x20, 0x00, 0x20])
            .build();
        handle_connection(stream, &dispatcher, settings).await.unwrap();
        assert_eq!(dispatcher.canvases().get(0).unwrap().mutations(), 1);
    }

    #[tokio::test]
    async fn test_mixed_protocols() {
        let (dispatcher, settings) = setup();
        let stream = Builder::new()
            .read(b"PX 0 0 ff\n\x10SIZE\n")
            .write(b"There are 2 grids\nSIZE 800 600\n")
            .build();
        handle_connection(stream, &dispatcher, settings).await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_bounds_closes() {
        let (dispatcher, settings) = setup();
        let stream = Builder::new()
            .read(b"SIZE\nPX 800 0 ffffff\nSIZE\n")
            .write(b"SIZE 800 600\n")
            .build();
        let result = handle_connection(stream, &dispatcher, settings).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Canvas(CanvasError::OutOfBounds { .. }))
        ));
    }

    #[tokio::test]
    async fn test_malformed_command_closes() {
        let (dispatcher, settings) = setup();
        let stream = Builder::new().read(b"PX 1 2 fffff\n").build();
        let result = handle_connection(stream, &dispatcher, settings).await;
        assert!(matches!(result, Err(ConnectionError::Protocol(_))));

        let stream = Builder::new().read(b"PXX\n").build();
        let result = handle_connection(stream, &dispatcher, settings).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Protocol(ProtocolError::UnknownCommand))
        ));
    }

    #[tokio::test]
    async fn test_unknown_grid_closes() {
        let (dispatcher, settings) = setup();
        let stream = Builder::new().read(&[0x27]).build();
        let result = handle_connection(stream, &dispatcher, settings).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Canvas(CanvasError::UnknownGrid(7)))
        ));
    }

    #[tokio::test]
    async fn test_overlong_line_closes() {
        let (dispatcher, settings) = setup();
        let stream = Builder::new().read(&[b'P'; 100]).build();
        let result = handle_connection(stream, &dispatcher, settings).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Protocol(ProtocolError::LineTooLong(64)))
        ));
    }

    #[tokio::test]
    async fn test_unrecognized_opcode_times_out() {
        let (dispatcher, settings) = setup();
        let (server_side, mut client) = duplex(64);
        client.write_all(b"SIZE\n\x00garbage").await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            handle_connection(server_side, &dispatcher, settings),
        )
        .await
        .expect("connection should not stall forever");
        assert!(matches!(result, Err(ConnectionError::Stalled(_))));

        // Commands before the bad byte were still answered.
        let mut reply = [0u8; 13];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"SIZE 800 600\n");
    }

    #[tokio::test]
    async fn test_unrecognized_opcode_then_hangup() {
        let (dispatcher, settings) = setup();
        let stream = Builder::new().read(&[0x05]).build();
        handle_connection(stream, &dispatcher, settings).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_listener() {
        let listener = bind_listener("127.0.0.1:0").unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
        assert!(bind_listener("not an address").is_err());
    }
}
