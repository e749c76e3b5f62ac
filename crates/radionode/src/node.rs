use anyhow::{Context, Result};
use meshradio_network::{
    ConnectionOrchestrator, FileDirectory, MemoryDirectory, PeerDirectory, TcpTransport,
    WebSocketRendezvous,
};
use meshradio_protocol::{ApplicationMessage, MessageKind, NodeId};
use meshradio_routing::{MeshEvents, MeshNode};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::api::{ApiServer, ApiState};
use crate::config::{Config, DirectoryBackend};
use crate::console::{self, ConsoleCommand};
use crate::inbox::Inbox;
use crate::storage::SqliteDirectory;

/// A running radio node: mesh node, orchestrator and local surfaces
pub struct RadioNode {
    config: Config,
    orchestrator: ConnectionOrchestrator,
    inbox: Arc<Inbox>,
    events: Option<MeshEvents>,
    api_server: Option<ApiServer>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl RadioNode {
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing node components...");

        let node_id = NodeId::generate();
        let (mesh, events) = MeshNode::new(node_id, config.mesh.clone());

        let transport = Arc::new(TcpTransport::new(config.transport.clone()));
        let mut builder =
            ConnectionOrchestrator::builder(mesh, transport).config(config.orchestrator.clone());

        match &config.rendezvous.url {
            Some(url) => {
                builder = builder.rendezvous(Arc::new(WebSocketRendezvous::new(url.clone())));
            }
            None => info!("No rendezvous server configured"),
        }

        if let Some(directory) = open_directory(&config).await? {
            builder = builder.directory(directory);
        }

        let orchestrator = builder.build();
        let inbox = Arc::new(Inbox::new(config.api.history_size));

        let api_server = if config.api.enabled {
            let state = Arc::new(ApiState {
                name: config.node.name.clone(),
                orchestrator: orchestrator.clone(),
                inbox: inbox.clone(),
                started_at: Instant::now(),
            });
            Some(ApiServer::new(config.api.clone(), state))
        } else {
            info!("API server disabled");
            None
        };

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Ok(Self {
            config,
            orchestrator,
            inbox,
            events: Some(events),
            api_server,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn orchestrator(&self) -> &ConnectionOrchestrator {
        &self.orchestrator
    }

    pub fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run until Ctrl+C, `/quit` or a shutdown request
    pub async fn run(&mut self, console: bool) -> Result<()> {
        info!("Starting radio node services...");

        self.orchestrator
            .initialize()
            .await
            .context("Failed to start connection orchestrator")?;

        if let Some(events) = self.events.take() {
            tokio::spawn(pump_events(events, self.inbox.clone(), console));
        }

        if let Some(api_server) = &self.api_server {
            let server_handle = api_server.start().await?;
            tokio::spawn(async move {
                match server_handle.await {
                    Ok(Err(e)) => error!("API server error: {}", e),
                    Err(e) => error!("API server task failed: {}", e),
                    Ok(Ok(())) => {}
                }
            });
        }

        if console {
            tokio::spawn(run_console(
                self.orchestrator.clone(),
                self.shutdown_tx.clone(),
            ));
        }

        info!("Radio node {} is running", self.orchestrator.local_id());
        info!("  Name: {}", self.config.node.name);
        if self.config.api.enabled {
            info!("  API: http://{}:{}", self.config.api.bind, self.config.api.port);
        }
        info!(
            "  Rendezvous: {}",
            self.config.rendezvous.url.as_deref().unwrap_or("none")
        );

        self.wait_for_shutdown().await;

        info!("Shutting down radio node...");
        self.orchestrator.shutdown().await;
        info!("Shutdown complete");
        Ok(())
    }

    async fn wait_for_shutdown(&mut self) {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C signal");
            }
            _ = self.shutdown_rx.recv() => {
                info!("Received shutdown signal");
            }
        }
    }
}

async fn open_directory(config: &Config) -> Result<Option<Arc<dyn PeerDirectory>>> {
    let path = config.directory_path();
    let directory: Arc<dyn PeerDirectory> = match config.directory.backend {
        DirectoryBackend::None => return Ok(None),
        DirectoryBackend::Memory => Arc::new(MemoryDirectory::new()),
        DirectoryBackend::File => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Arc::new(FileDirectory::new(path))
        }
        DirectoryBackend::Sqlite => Arc::new(
            SqliteDirectory::open(&path)
                .await
                .context("Failed to open discovery database")?,
        ),
    };
    info!("Local discovery directory: {}", directory.describe());
    Ok(Some(directory))
}

fn print_message(message: &ApplicationMessage) {
    match message.kind {
        MessageKind::Text => println!("[{}] {}", message.sender, message.payload),
        MessageKind::Voice => println!(
            "[{}] voice note ({} bytes)",
            message.sender,
            message.payload.len()
        ),
    }
}

/// Forward mesh events to the inbox, the log and optionally the console
async fn pump_events(mut events: MeshEvents, inbox: Arc<Inbox>, echo: bool) {
    loop {
        tokio::select! {
            Some(message) = events.messages.recv() => {
                if echo {
                    print_message(&message);
                }
                inbox.push(message).await;
            }
            Some(peers) = events.peers.recv() => {
                info!("Connected peers ({}): {:?}", peers.len(), peers);
                if echo {
                    println!("* {} peer(s) connected", peers.len());
                }
            }
            Some(report) = events.undeliverable.recv() => {
                warn!(
                    "Message to {} undeliverable after {} retries",
                    report.message.destination.as_str(),
                    report.attempts
                );
                if echo {
                    println!("! could not reach {}", report.message.destination.as_str());
                }
            }
            else => break,
        }
    }
}

async fn run_console(orchestrator: ConnectionOrchestrator, shutdown: mpsc::Sender<()>) {
    println!("{}", console::help());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Console read failed: {}", e);
                break;
            }
        };

        match console::parse_command(&line) {
            ConsoleCommand::Empty => {}
            ConsoleCommand::Broadcast { payload, kind } => {
                if let Err(e) = orchestrator.send_message(payload, kind).await {
                    println!("! {}", e);
                }
            }
            ConsoleCommand::SendTo { target, payload } => {
                if let Err(e) = orchestrator.send_to(target, payload, MessageKind::Text).await {
                    println!("! {}", e);
                }
            }
            ConsoleCommand::Peers => {
                let peers = orchestrator.node().peers().await;
                if peers.is_empty() {
                    println!("no peers connected");
                }
                for peer in peers {
                    println!("  {}", peer);
                }
            }
            ConsoleCommand::Routes => {
                for (destination, route) in orchestrator.node().routes().await {
                    println!(
                        "  {} via {} ({} hop(s))",
                        destination, route.next_hop, route.hop_count
                    );
                }
            }
            ConsoleCommand::Stats => {
                let stats = orchestrator.node().stats().await;
                match serde_json::to_string_pretty(&stats) {
                    Ok(text) => println!("{}", text),
                    Err(e) => println!("! {}", e),
                }
            }
            ConsoleCommand::Help => println!("{}", console::help()),
            ConsoleCommand::Quit => break,
            ConsoleCommand::Invalid(reason) => println!("! {}", reason),
        }
    }

    let _ = shutdown.send(()).await;
}
