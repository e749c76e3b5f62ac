//! TCP transport substrate
//!
//! The initiator listens on an ephemeral port and offers `tcp <addr>`; the
//! responder dials that address and answers with its own local address.
//! Frames travel as newline-delimited JSON text; an over-long line fails
//! the link.

use super::{LinkEvent, LinkFactory, LinkOptions, LinkState, NewLink, TransportLink};
use crate::error::{NetworkError, Result};
use meshradio_protocol::message::MAX_PAYLOAD_SIZE;
use meshradio_protocol::{IceCandidate, NodeId, SdpKind, SessionDescription};
use meshradio_routing::{PeerChannel, RoutingError};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const DESCRIPTION_PREFIX: &str = "tcp ";

/// JSON escaping can grow a payload up to six times, plus envelope fields
pub const DEFAULT_MAX_LINE_BYTES: usize = 6 * MAX_PAYLOAD_SIZE + 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// TCP transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpTransportConfig {
    /// Interface offer listeners bind to
    pub bind_addr: String,

    /// Host advertised in offers instead of the bound address
    pub advertise_host: Option<String>,

    pub connect_timeout_secs: u64,

    /// Longest frame line accepted before the link is failed
    pub max_line_bytes: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        TcpTransportConfig {
            bind_addr: "0.0.0.0".to_string(),
            advertise_host: None,
            connect_timeout_secs: 10,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

/// Transport creating one TCP connection per link
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        TcpTransport { config }
    }
}

#[async_trait::async_trait]
impl LinkFactory for TcpTransport {
    async fn create_link(&self, options: LinkOptions) -> Result<NewLink> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let inner = Arc::new(TcpLinkInner {
            options,
            config: self.config.clone(),
            state: Mutex::new(LinkState::New),
            events: events_tx,
            writer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
        });

        Ok(NewLink {
            link: Arc::new(TcpLink { inner }),
            events,
        })
    }
}

/// Parse the address out of a `tcp <addr>` description or candidate
pub fn parse_tcp_address(description: &str) -> Result<String> {
    description
        .strip_prefix(DESCRIPTION_PREFIX)
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
        .ok_or_else(|| NetworkError::InvalidDescription(description.to_string()))
}

struct TcpLinkInner {
    options: LinkOptions,
    config: TcpTransportConfig,
    state: Mutex<LinkState>,
    events: mpsc::UnboundedSender<LinkEvent>,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
}

impl TcpLinkInner {
    fn state(&self) -> LinkState {
        *lock(&self.state)
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn transition(&self, next: LinkState) -> Option<LinkState> {
        let previous = {
            let mut state = lock(&self.state);
            if state.is_terminal() || *state == next {
                return None;
            }
            std::mem::replace(&mut *state, next)
        };
        self.emit(LinkEvent::StateChanged(next));
        Some(previous)
    }

    fn advertised(&self, addr: SocketAddr) -> String {
        match &self.config.advertise_host {
            Some(host) => format!("{}:{}", host, addr.port()),
            None if addr.ip().is_unspecified() => {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port()).to_string()
            }
            None => addr.to_string(),
        }
    }

    /// Start moving frames over an established stream
    fn attach(self: &Arc<Self>, stream: TcpStream) {
        if self.state().is_terminal() {
            return;
        }

        let _ = stream.set_nodelay(true);
        let (read_half, mut write_half) = stream.into_split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();
        *lock(&self.writer) = Some(writer_tx);

        let peer = self.options.remote.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                let line = format!("{}\n", frame);
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    debug!("Write to {} failed: {}", peer, e);
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let inner = Arc::clone(self);
        let reader = tokio::spawn(async move {
            let limit = inner.config.max_line_bytes;
            let mut reader = BufReader::new(read_half);
            let mut line = Vec::new();
            loop {
                line.clear();
                let read = (&mut reader)
                    .take(limit as u64 + 1)
                    .read_until(b'\n', &mut line)
                    .await;
                match read {
                    Ok(0) => break,
                    Ok(_) if line.last() != Some(&b'\n') && line.len() > limit => {
                        inner.abort_connected(&format!("frame line exceeds {} bytes", limit));
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Read from {} failed: {}", inner.options.remote, e);
                        break;
                    }
                }

                while matches!(line.last(), Some(b'\n' | b'\r')) {
                    line.pop();
                }
                if line.is_empty() {
                    continue;
                }
                match String::from_utf8(std::mem::take(&mut line)) {
                    Ok(frame) => inner.emit(LinkEvent::Frame(frame)),
                    Err(e) => warn!(
                        "Dropping non UTF-8 frame from {}: {}",
                        inner.options.remote, e
                    ),
                }
            }
            inner.remote_dropped();
        });

        lock(&self.tasks).extend([writer, reader]);

        if self.transition(LinkState::Connected).is_some() {
            self.emit(LinkEvent::ChannelOpen(Arc::new(TcpChannel {
                link: Arc::downgrade(self),
                remote: self.options.remote.clone(),
            })));
        }
    }

    fn remote_dropped(&self) {
        *lock(&self.writer) = None;
        if self.transition(LinkState::Disconnected) == Some(LinkState::Connected) {
            self.emit(LinkEvent::ChannelClosed);
        }
    }

    /// Fail a link whose peer broke the framing
    fn abort_connected(&self, reason: &str) {
        *lock(&self.writer) = None;
        warn!("Link to {} failed: {}", self.options.remote, reason);
        if self.transition(LinkState::Failed) == Some(LinkState::Connected) {
            self.emit(LinkEvent::ChannelClosed);
        }
    }

    fn fail(&self, reason: &str) {
        warn!("Link to {} failed: {}", self.options.remote, reason);
        self.transition(LinkState::Failed);
    }
}

/// A link created by [`TcpTransport`]
pub struct TcpLink {
    inner: Arc<TcpLinkInner>,
}

impl TcpLink {
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.inner.remote_candidates).clone()
    }
}

#[async_trait::async_trait]
impl TransportLink for TcpLink {
    async fn create_offer(&self) -> Result<SessionDescription> {
        if self.inner.state().is_terminal() {
            return Err(NetworkError::LinkClosed);
        }

        let listener = TcpListener::bind(format!("{}:0", self.inner.config.bind_addr)).await?;
        let advertised = self.inner.advertised(listener.local_addr()?);
        let description = format!("{}{}", DESCRIPTION_PREFIX, advertised);

        self.inner.transition(LinkState::Connecting);
        self.inner
            .emit(LinkEvent::LocalCandidate(IceCandidate::new(description.clone())));

        let inner = Arc::clone(&self.inner);
        let accept = tokio::spawn(async move {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Accepted link from {} at {}", inner.options.remote, addr);
                    inner.attach(stream);
                }
                Err(e) => inner.fail(&e.to_string()),
            }
        });
        lock(&self.inner.tasks).push(accept);

        Ok(SessionDescription::offer(description))
    }

    async fn accept_offer(&self, offer: &SessionDescription) -> Result<SessionDescription> {
        if offer.kind != SdpKind::Offer {
            return Err(NetworkError::InvalidDescription(
                "expected an offer".to_string(),
            ));
        }
        let addr = parse_tcp_address(&offer.sdp)?;
        self.inner.transition(LinkState::Connecting);

        let timeout = Duration::from_secs(self.inner.config.connect_timeout_secs);
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.inner.fail(&e.to_string());
                return Err(e.into());
            }
            Err(_) => {
                self.inner.fail("connect timed out");
                return Err(NetworkError::NegotiationTimedOut(
                    self.inner.options.remote.clone(),
                ));
            }
        };

        let local = stream.local_addr()?;
        self.inner.attach(stream);
        Ok(SessionDescription::answer(format!(
            "{}{}",
            DESCRIPTION_PREFIX, local
        )))
    }

    async fn accept_answer(&self, answer: &SessionDescription) -> Result<()> {
        if answer.kind != SdpKind::Answer {
            return Err(NetworkError::InvalidDescription(
                "expected an answer".to_string(),
            ));
        }
        parse_tcp_address(&answer.sdp)?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        if self.inner.state().is_terminal() {
            return Err(NetworkError::LinkClosed);
        }
        lock(&self.inner.remote_candidates).push(candidate.clone());
        Ok(())
    }

    fn state(&self) -> LinkState {
        self.inner.state()
    }

    fn close(&self) {
        let Some(previous) = self.inner.transition(LinkState::Closed) else {
            return;
        };

        *lock(&self.inner.writer) = None;
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }

        if previous == LinkState::Connected {
            self.inner.emit(LinkEvent::ChannelClosed);
        }
    }
}

struct TcpChannel {
    link: Weak<TcpLinkInner>,
    remote: NodeId,
}

impl PeerChannel for TcpChannel {
    fn is_open(&self) -> bool {
        self.link
            .upgrade()
            .map(|link| link.state() == LinkState::Connected)
            .unwrap_or(false)
    }

    fn send(&self, frame: &str) -> meshradio_routing::Result<()> {
        let closed = || RoutingError::ChannelClosed(self.remote.clone());

        let link = self.link.upgrade().ok_or_else(closed)?;
        let writer = lock(&link.writer).clone().ok_or_else(closed)?;
        writer.send(frame.to_string()).map_err(|_| closed())
    }
}
