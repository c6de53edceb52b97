//! Network Tunnel Bridge
//!
//! Makes the watch a tethered client of the host network through a local
//! network-emulation backend.
//!
//! ```text
//!  tunnel-incoming ─► Reassembler ─► queue ─► [link→backend] ─► u32_be(len)||frame ─► socket
//!  tunnel-outgoing ◄─ Fragmenter(mtu-14) ◄─ [backend→link] ◄─ FrameDecoder ◄──────── socket
//! ```
//!
//! One [`TunnelSession`] exists per successful `sync()`. It owns the backend
//! process, both pumps and a supervisor; dropping it tears all of them down.

use super::framing::reassembling;
use super::{emit, ServiceError, SyncContext};
use crate::domain::channels::{
    Channel, ChannelId, TUNNEL_CHANNELS, TUNNEL_INCOMING, TUNNEL_OUTGOING,
};
use crate::domain::fragmentation::Fragmenter;
use crate::domain::models::{AppEvent, ServiceKind};
use crate::domain::tunnel_frame::{self, FrameDecoder};
use crate::infrastructure::backend::{Backend, BackendConfig, BackendError};
use crate::infrastructure::link::{ChannelCallback, DeviceLink};
use interprocess::local_socket::tokio::{RecvHalf, SendHalf};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// Bytes of each MTU reserved for the backend's own link-layer framing.
pub const TUNNEL_HEADROOM: u32 = 14;

/// Packets waiting for the backend socket. Overflow is dropped.
pub const INBOUND_QUEUE_LEN: usize = 256;

const READ_BUFFER_LEN: usize = 16 * 1024;
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

type InboundSlot = Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>;

/// Fragment payload size for tunnel traffic at `mtu`.
pub fn max_chunk_for_tunnel(mtu: u32) -> usize {
    (mtu.saturating_sub(TUNNEL_HEADROOM) as usize).max(1)
}

/// Outbound fragmentation context, rebuilt whenever the link MTU changes.
#[derive(Debug)]
pub struct OutboundFraming {
    mtu: u32,
    fragmenter: Fragmenter,
}

impl OutboundFraming {
    pub fn new(mtu: u32) -> Self {
        Self {
            mtu,
            fragmenter: Fragmenter::new(max_chunk_for_tunnel(mtu)),
        }
    }

    /// MTU the current chunk size was derived from.
    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Returns `true` if the context was rebuilt. The sequence counter carries
    /// over so the watch keeps reassembling in order.
    pub fn refresh(&mut self, mtu: u32) -> bool {
        if mtu == self.mtu {
            return false;
        }
        info!(old = self.mtu, new = mtu, "Link MTU changed, rebuilding tunnel framing");
        self.fragmenter =
            Fragmenter::with_sequence(max_chunk_for_tunnel(mtu), self.fragmenter.next_sequence());
        self.mtu = mtu;
        true
    }

    /// Fragment one backend packet for the outgoing channel.
    pub fn encode(&mut self, payload: &[u8]) -> Vec<Vec<u8>> {
        self.fragmenter.encode(payload)
    }
}

/// Reports the first fatal error of a session to the registry.
#[derive(Clone)]
struct FailureReporter {
    ctx: SyncContext,
    reported: Arc<AtomicBool>,
    stopping: watch::Receiver<bool>,
}

impl FailureReporter {
    fn report(&self, reason: impl Display) {
        if *self.stopping.borrow() {
            debug!("Tunnel stopping, not reporting: {}", reason);
            return;
        }
        if !self.reported.swap(true, Ordering::SeqCst) {
            error!("Tunnel failed: {}", reason);
            self.ctx.report_failure(ServiceKind::Tunnel, reason.to_string());
        }
    }
}

struct Pumps {
    to_backend: JoinHandle<()>,
    to_link: JoinHandle<()>,
}

impl Drop for Pumps {
    fn drop(&mut self) {
        self.to_backend.abort();
        self.to_link.abort();
    }
}

/// Running bridge: backend process, two pumps and their supervisor.
pub struct TunnelSession {
    shutdown: watch::Sender<bool>,
    supervisor: Option<JoinHandle<()>>,
}

impl TunnelSession {
    /// Launch the backend and start both pumps and the supervisor.
    pub async fn start(
        config: &BackendConfig,
        ctx: &SyncContext,
        inbound: mpsc::Receiver<Vec<u8>>,
    ) -> Result<Self, BackendError> {
        let (backend, recv, send) = Backend::launch(config).await?;

        let (shutdown, stopping) = watch::channel(false);
        let reporter = FailureReporter {
            ctx: ctx.clone(),
            reported: Arc::new(AtomicBool::new(false)),
            stopping: stopping.clone(),
        };

        let pumps = Pumps {
            to_backend: tokio::spawn(link_to_backend(
                send,
                inbound,
                stopping.clone(),
                reporter.clone(),
            )),
            to_link: tokio::spawn(backend_to_link(
                recv,
                ctx.link.clone(),
                config.max_frame_len,
                stopping.clone(),
                reporter.clone(),
            )),
        };
        let supervisor = tokio::spawn(supervise(backend, pumps, stopping, reporter));

        Ok(Self {
            shutdown,
            supervisor: Some(supervisor),
        })
    }

    /// Stop both pumps, close the socket, kill and reap the backend.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(mut supervisor) = self.supervisor.take() {
            if tokio::time::timeout(STOP_TIMEOUT, &mut supervisor)
                .await
                .is_err()
            {
                warn!("Tunnel session did not stop in time");
                supervisor.abort();
            }
        }
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
    }
}

async fn supervise(
    mut backend: Backend,
    mut pumps: Pumps,
    mut stopping: watch::Receiver<bool>,
    reporter: FailureReporter,
) {
    tokio::select! {
        _ = stopping.changed() => debug!("Tunnel supervisor stopping"),
        e = backend.exited() => reporter.report(e),
        result = &mut pumps.to_backend => pump_stopped("link->backend", result, &reporter),
        result = &mut pumps.to_link => pump_stopped("backend->link", result, &reporter),
    }
    // Aborting the pumps drops both socket halves.
    drop(pumps);
    backend.shutdown().await;
}

fn pump_stopped(name: &str, result: Result<(), JoinError>, reporter: &FailureReporter) {
    match result {
        Err(e) if e.is_panic() => reporter.report(format!("{name} pump panicked")),
        _ => reporter.report(format!("{name} pump stopped")),
    }
}

async fn link_to_backend(
    mut socket: SendHalf,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    mut stopping: watch::Receiver<bool>,
    reporter: FailureReporter,
) {
    loop {
        let message = tokio::select! {
            _ = stopping.changed() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let framed = match tunnel_frame::frame(&message) {
            Ok(framed) => framed,
            Err(e) => {
                reporter.report(BackendError::from(e));
                break;
            }
        };
        trace!(len = message.len(), "link -> backend");
        if let Err(e) = socket.write_all(&framed).await {
            reporter.report(BackendError::SocketIo(e));
            break;
        }
    }
    debug!("link -> backend pump finished");
}

async fn backend_to_link(
    mut socket: RecvHalf,
    link: Arc<dyn DeviceLink>,
    max_frame_len: usize,
    mut stopping: watch::Receiver<bool>,
    reporter: FailureReporter,
) {
    let mut decoder = FrameDecoder::new(max_frame_len);
    let mut framing = OutboundFraming::new(link.negotiated_mtu());
    let mut buf = vec![0u8; READ_BUFFER_LEN];

    'read: loop {
        let n = tokio::select! {
            _ = stopping.changed() => break,
            read = socket.read(&mut buf) => match read {
                Ok(0) => {
                    reporter.report(BackendError::SocketClosed);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    reporter.report(BackendError::SocketIo(e));
                    break;
                }
            },
        };
        decoder.extend(&buf[..n]);

        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    framing.refresh(link.negotiated_mtu());
                    forward(link.as_ref(), &mut framing, &frame).await;
                }
                Ok(None) => break,
                Err(e) => {
                    reporter.report(BackendError::from(e));
                    break 'read;
                }
            }
        }
    }
    debug!("backend -> link pump finished");
}

/// Send one frame as fragments. A failed write drops the rest of the frame.
async fn forward(link: &dyn DeviceLink, framing: &mut OutboundFraming, frame: &[u8]) {
    trace!(len = frame.len(), "backend -> link");
    for chunk in framing.encode(frame) {
        if let Err(e) = link.send(TUNNEL_OUTGOING.id, &chunk).await {
            warn!("Dropping tunnel frame of {} bytes: {}", frame.len(), e);
            return;
        }
    }
}

/// The tunnel service. Inbound fragments are reassembled in the channel
/// callback and queued to the running session, if any.
pub struct TunnelBridge {
    config: BackendConfig,
    events: mpsc::UnboundedSender<AppEvent>,
    inbound: InboundSlot,
    session: Option<TunnelSession>,
}

impl TunnelBridge {
    /// The backend is launched on `sync`, not here.
    pub fn new(config: BackendConfig, events: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self {
            config,
            events,
            inbound: Arc::new(Mutex::new(None)),
            session: None,
        }
    }

    pub fn channels() -> &'static [Channel] {
        TUNNEL_CHANNELS
    }

    /// True between a successful `sync` and the next `unsync`.
    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    pub(super) fn handler(&self, channel: ChannelId) -> Option<ChannelCallback> {
        if channel != TUNNEL_INCOMING.id {
            return None;
        }
        let slot = self.inbound.clone();
        Some(reassembling(move |message| {
            let queue = slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
            let Some(queue) = queue else {
                debug!(len = message.len(), "Tunnel not running, dropping packet");
                return;
            };
            match queue.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(message)) => {
                    warn!(len = message.len(), "Tunnel backend busy, dropping packet")
                }
                Err(TrySendError::Closed(_)) => debug!("Tunnel stopped, dropping packet"),
            }
        }))
    }

    pub(super) async fn sync(&mut self, ctx: &SyncContext) -> Result<(), ServiceError> {
        self.unsync().await;

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_LEN);
        let session = TunnelSession::start(&self.config, ctx, rx).await?;
        *self.inbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        self.session = Some(session);
        info!("Tunnel up");
        emit(&self.events, AppEvent::TunnelUp);
        Ok(())
    }

    pub(super) async fn unsync(&mut self) {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = self.session.take() {
            session.stop().await;
            info!("Tunnel down");
            emit(&self.events, AppEvent::TunnelDown);
        }
    }
}
