//! Connection supervision
//!
//! Binds the six endpoints, runs one acceptor per stream endpoint and one
//! receiver per datagram plane, and drives orderly shutdown: acceptors stop
//! first, then the media workers, then the remaining connection workers.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::server::{ServerState, control, files, screen};

/// Resolved addresses of the six endpoints after binding
#[derive(Debug, Clone, Copy)]
pub struct EndpointAddrs {
    pub control: SocketAddr,
    pub video: SocketAddr,
    pub audio: SocketAddr,
    pub screen_control: SocketAddr,
    pub screen_data: SocketAddr,
    pub file: SocketAddr,
}

/// A running conference server
#[derive(Debug)]
pub struct ConferenceServer {
    state: Arc<ServerState>,
    addrs: EndpointAddrs,
    acceptors: Vec<JoinHandle<()>>,
    media_tasks: Vec<JoinHandle<()>>,
    connections: Arc<Mutex<JoinSet<()>>>,
    shutdown: watch::Sender<bool>,
}

impl ConferenceServer {
    /// Bind every endpoint and enter the serving state
    ///
    /// Any bind failure aborts startup; endpoints bound earlier are released
    /// as they drop.
    pub async fn start(config: ServerConfig) -> Result<Self> {
        let bind = config.bind_addr;
        let control_listener = bind_tcp(bind, config.control_port, "control").await?;
        let screen_listener = bind_tcp(bind, config.screen_control_port, "screen-control").await?;
        let file_listener = bind_tcp(bind, config.file_port, "file").await?;
        let video_socket = bind_udp(bind, config.video_port, "video").await?;
        let audio_socket = bind_udp(bind, config.audio_port, "audio").await?;
        let screen_socket = bind_udp(bind, config.screen_data_port, "screen-data").await?;

        let addrs = EndpointAddrs {
            control: control_listener.local_addr()?,
            video: video_socket.local_addr()?,
            audio: audio_socket.local_addr()?,
            screen_control: screen_listener.local_addr()?,
            screen_data: screen_socket.local_addr()?,
            file: file_listener.local_addr()?,
        };

        let state = ServerState::new(config);
        let (shutdown, _) = watch::channel(false);
        let connections = Arc::new(Mutex::new(JoinSet::new()));

        let acceptors = vec![
            tokio::spawn(accept_control(
                control_listener,
                Arc::clone(&state),
                shutdown.subscribe(),
                Arc::clone(&connections),
            )),
            tokio::spawn(accept_screen_control(
                screen_listener,
                Arc::clone(&state),
                shutdown.subscribe(),
                Arc::clone(&connections),
            )),
            tokio::spawn(accept_file(
                file_listener,
                Arc::clone(&state),
                shutdown.subscribe(),
                Arc::clone(&connections),
            )),
        ];

        let media_tasks = vec![
            tokio::spawn(
                Arc::clone(&state.video).receive_loop(Arc::clone(&video_socket)),
            ),
            tokio::spawn(
                Arc::clone(&state.mixer).receive_loop(Arc::clone(&audio_socket)),
            ),
            tokio::spawn(
                Arc::clone(&state.mixer).mix_loop(audio_socket, state.config.mixer_tick()),
            ),
            tokio::spawn(Arc::clone(&state.screen).receive_loop(screen_socket)),
        ];

        info!(
            control = %addrs.control,
            video = %addrs.video,
            audio = %addrs.audio,
            screen_control = %addrs.screen_control,
            screen_data = %addrs.screen_data,
            file = %addrs.file,
            "Conference server listening"
        );

        Ok(Self {
            state,
            addrs,
            acceptors,
            media_tasks,
            connections,
            shutdown,
        })
    }

    /// The resolved endpoint addresses
    pub fn local_addrs(&self) -> EndpointAddrs {
        self.addrs
    }

    /// The shared server state
    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Stop serving: drain acceptors, cancel media workers, then terminate
    /// the remaining connection workers
    pub async fn stop(self) {
        info!("Stopping conference server");
        let _ = self.shutdown.send(true);
        for acceptor in self.acceptors {
            let _ = acceptor.await;
        }
        for task in &self.media_tasks {
            task.abort();
        }
        for task in self.media_tasks {
            let _ = task.await;
        }
        self.connections.lock().await.shutdown().await;
        info!("Conference server stopped");
    }
}

async fn bind_tcp(addr: IpAddr, port: u16, plane: &str) -> Result<TcpListener> {
    TcpListener::bind((addr, port)).await.map_err(|e| {
        ServerError::bind(format!("{} endpoint {}:{}: {}", plane, addr, port, e))
    })
}

async fn bind_udp(addr: IpAddr, port: u16, plane: &str) -> Result<Arc<UdpSocket>> {
    let socket = UdpSocket::bind((addr, port)).await.map_err(|e| {
        ServerError::bind(format!("{} endpoint {}:{}: {}", plane, addr, port, e))
    })?;
    Ok(Arc::new(socket))
}

async fn accept_control(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
    connections: Arc<Mutex<JoinSet<()>>>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Control accept failed");
                        continue;
                    }
                };
                debug!(%addr, "Control connection accepted");
                let state = Arc::clone(&state);
                let mut set = connections.lock().await;
                while set.try_join_next().is_some() {}
                set.spawn(async move {
                    if let Err(e) = control::handle_control(stream, state).await {
                        debug!(error = %e, "Control connection ended with error");
                    }
                });
            }
        }
    }
    debug!("Control acceptor stopped");
}

async fn accept_screen_control(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
    connections: Arc<Mutex<JoinSet<()>>>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Screen-control accept failed");
                        continue;
                    }
                };
                debug!(%addr, "Screen-control connection accepted");
                let arbiter = Arc::clone(&state.arbiter);
                let registry = Arc::clone(&state.registry);
                let mut set = connections.lock().await;
                while set.try_join_next().is_some() {}
                set.spawn(async move {
                    if let Err(e) = screen::handle_screen_control(stream, arbiter, registry).await {
                        debug!(error = %e, "Screen-control connection ended with error");
                    }
                });
            }
        }
    }
    debug!("Screen-control acceptor stopped");
}

async fn accept_file(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
    connections: Arc<Mutex<JoinSet<()>>>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "File accept failed");
                        continue;
                    }
                };
                debug!(%addr, "File connection accepted");
                let catalog = Arc::clone(&state.catalog);
                let registry = Arc::clone(&state.registry);
                let chat = Arc::clone(&state.chat);
                let config = state.config.clone();
                let mut set = connections.lock().await;
                while set.try_join_next().is_some() {}
                set.spawn(async move {
                    if let Err(e) =
                        files::handle_transfer(stream, catalog, registry, chat, &config).await
                    {
                        debug!(error = %e, "File connection ended with error");
                    }
                });
            }
        }
    }
    debug!("File acceptor stopped");
}
