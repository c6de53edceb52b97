//! Screenshot Transfer Protocol
//!
//! ```text
//!   Idle ──request_capture()──► Requested ──4-byte size──► SizeKnown
//!    ▲                                                        │ data
//!    └──── sink(bytes) ◄── received == total ◄── Receiving ◄──┘
//! ```
//!
//! Content notifications are Fragmentation Codec fragments; the state machine
//! only sees reassembled messages. The first message is the little-endian
//! size preamble. A watch-initiated capture may send the preamble while we
//! are still `Idle`. Link loss, `unsync()` and `sync()` all drop back to
//! `Idle` and discard whatever was received.

use super::{emit, ServiceError, SyncContext};
use crate::domain::channels::{
    Channel, ChannelId, SCREENSHOT_CHANNELS, SCREENSHOT_CONTENT, SCREENSHOT_REQUEST,
};
use crate::domain::fragmentation::Reassembler;
use crate::domain::models::AppEvent;
use crate::infrastructure::link::{ChannelCallback, DeviceLink, LinkError};
use anyhow::Context;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The only defined capture command.
pub const CAPTURE_COMMAND: u8 = 0x00;
pub const SIZE_PREAMBLE_LEN: usize = 4;

/// Upper bound on the buffer reserved from an announced size; larger images
/// grow the buffer as data arrives.
const MAX_INITIAL_RESERVE: u32 = 1 << 20;

/// Receives a completed image. Never called with partial data.
pub trait ScreenshotSink: Send + Sync {
    fn store(&self, image: &[u8]) -> anyhow::Result<PathBuf>;
}

/// Writes each capture to `<dir>/screenshot-<unix-millis>.jpg`.
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    /// Images are written under `dir`, created on first use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ScreenshotSink for FileSink {
    fn store(&self, image: &[u8]) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let path = self.dir.join(format!("screenshot-{millis}.jpg"));
        fs::write(&path, image).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureRequest {
    Sent,
    AlreadyInProgress,
}

#[derive(Debug, Default)]
struct ScreenshotTransfer {
    total_size: u32,
    received: u32,
    buffer: Vec<u8>,
    last_percent: Option<u32>,
}

impl ScreenshotTransfer {
    fn new(total_size: u32) -> Self {
        Self {
            total_size,
            buffer: Vec::with_capacity(total_size.min(MAX_INITIAL_RESERVE) as usize),
            ..Self::default()
        }
    }

    fn percent(&self) -> u32 {
        if self.total_size == 0 {
            return 100;
        }
        (u64::from(self.received) * 100 / u64::from(self.total_size)) as u32
    }
}

#[derive(Debug, Default)]
enum ScreenshotState {
    #[default]
    Idle,
    Requested,
    SizeKnown(ScreenshotTransfer),
    Receiving(ScreenshotTransfer),
}

/// Public view of [`ScreenshotState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePhase {
    Idle,
    Requested,
    SizeKnown,
    Receiving { received: u32, total: u32 },
}

enum Step {
    Nothing,
    Progress { received: u32, total: u32 },
    Complete(Vec<u8>),
}

struct Shared {
    state: Mutex<ScreenshotState>,
    reassembler: Mutex<Reassembler>,
    sink: Box<dyn ScreenshotSink>,
    events: mpsc::UnboundedSender<AppEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ScreenshotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reassembler(&self) -> MutexGuard<'_, Reassembler> {
        self.reassembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn on_fragment(&self, fragment: &[u8]) {
        let message = self.reassembler().push(fragment);
        if let Some(message) = message {
            self.on_content(&message);
        }
    }

    fn on_content(&self, bytes: &[u8]) {
        let step = self.advance(bytes);
        match step {
            Step::Nothing => {}
            Step::Progress { received, total } => {
                emit(&self.events, AppEvent::ScreenshotProgress { received, total });
            }
            Step::Complete(image) => self.finish(image),
        }
    }

    fn advance(&self, bytes: &[u8]) -> Step {
        let mut state = self.lock();
        match std::mem::take(&mut *state) {
            waiting @ (ScreenshotState::Idle | ScreenshotState::Requested) => {
                let Ok(preamble) = <[u8; SIZE_PREAMBLE_LEN]>::try_from(bytes) else {
                    *state = waiting;
                    warn!(
                        len = bytes.len(),
                        "Ignoring screenshot data without a size preamble"
                    );
                    return Step::Nothing;
                };
                let total = u32::from_le_bytes(preamble);
                info!(total, "Screenshot transfer started");
                if total == 0 {
                    return Step::Complete(Vec::new());
                }
                *state = ScreenshotState::SizeKnown(ScreenshotTransfer::new(total));
                Step::Nothing
            }
            ScreenshotState::SizeKnown(mut transfer) | ScreenshotState::Receiving(mut transfer) => {
                let remaining = (transfer.total_size - transfer.received) as usize;
                let take = bytes.len().min(remaining);
                if take < bytes.len() {
                    warn!(
                        dropped = bytes.len() - take,
                        "Screenshot data past the announced size"
                    );
                }
                transfer.buffer.extend_from_slice(&bytes[..take]);
                transfer.received += take as u32;

                if transfer.received == transfer.total_size {
                    return Step::Complete(transfer.buffer);
                }

                let percent = transfer.percent();
                let step = if transfer.last_percent != Some(percent) {
                    transfer.last_percent = Some(percent);
                    Step::Progress {
                        received: transfer.received,
                        total: transfer.total_size,
                    }
                } else {
                    Step::Nothing
                };
                *state = ScreenshotState::Receiving(transfer);
                step
            }
        }
    }

    fn finish(&self, image: Vec<u8>) {
        let total = image.len() as u32;
        emit(
            &self.events,
            AppEvent::ScreenshotProgress {
                received: total,
                total,
            },
        );
        let stored = self
            .sink
            .store(&image)
            .map_err(|e| ServiceError::Sink(format!("{e:#}")));
        match stored {
            Ok(path) => {
                info!("Screenshot saved to {}", path.display());
                emit(&self.events, AppEvent::ScreenshotSaved(path));
            }
            Err(e) => {
                warn!("{}", e);
                emit(&self.events, AppEvent::ScreenshotFailed(e.to_string()));
            }
        }
    }

    fn reset(&self) {
        self.reassembler().reset();
        let previous = std::mem::take(&mut *self.lock());
        if let ScreenshotState::SizeKnown(t) | ScreenshotState::Receiving(t) = previous {
            warn!(
                received = t.received,
                total = t.total_size,
                "Discarding partial screenshot"
            );
        }
    }
}

/// Cheap to clone; clones share one transfer.
#[derive(Clone)]
pub struct ScreenshotService {
    shared: Arc<Shared>,
}

impl ScreenshotService {
    pub fn new(sink: Box<dyn ScreenshotSink>, events: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ScreenshotState::Idle),
                reassembler: Mutex::new(Reassembler::new()),
                sink,
                events,
            }),
        }
    }

    pub fn channels() -> &'static [Channel] {
        SCREENSHOT_CHANNELS
    }

    /// Where the current transfer stands.
    pub fn phase(&self) -> CapturePhase {
        match &*self.shared.lock() {
            ScreenshotState::Idle => CapturePhase::Idle,
            ScreenshotState::Requested => CapturePhase::Requested,
            ScreenshotState::SizeKnown(_) => CapturePhase::SizeKnown,
            ScreenshotState::Receiving(t) => CapturePhase::Receiving {
                received: t.received,
                total: t.total_size,
            },
        }
    }

    /// Ask the watch for a capture. At most one transfer is in flight; a
    /// request whose preamble never arrived may be repeated.
    pub async fn request_capture(&self, link: &dyn DeviceLink) -> Result<CaptureRequest, LinkError> {
        {
            let mut state = self.shared.lock();
            match *state {
                ScreenshotState::SizeKnown(_) | ScreenshotState::Receiving(_) => {
                    debug!("Capture already in progress");
                    return Ok(CaptureRequest::AlreadyInProgress);
                }
                ScreenshotState::Requested => {
                    debug!("No preamble for the previous request, asking again")
                }
                ScreenshotState::Idle => {}
            }
            *state = ScreenshotState::Requested;
            self.shared.reassembler().reset();
        }

        if let Err(e) = link.send(SCREENSHOT_REQUEST.id, &[CAPTURE_COMMAND]).await {
            let mut state = self.shared.lock();
            if matches!(*state, ScreenshotState::Requested) {
                *state = ScreenshotState::Idle;
            }
            return Err(e);
        }
        info!("Screenshot requested");
        Ok(CaptureRequest::Sent)
    }

    pub(super) fn handler(&self, channel: ChannelId) -> Option<ChannelCallback> {
        if channel != SCREENSHOT_CONTENT.id {
            return None;
        }
        let shared = self.shared.clone();
        Some(Box::new(move |fragment: &[u8]| shared.on_fragment(fragment)))
    }

    pub(super) async fn sync(&mut self, _ctx: &SyncContext) -> Result<(), ServiceError> {
        self.shared.reset();
        Ok(())
    }

    pub(super) fn unsync(&mut self) {
        self.shared.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fragmentation::Fragmenter;
    use crate::domain::models::LinkState;
    use crate::infrastructure::link::memory::MemoryLink;

    #[derive(Clone, Default)]
    struct RecordingSink {
        images: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl ScreenshotSink for RecordingSink {
        fn store(&self, image: &[u8]) -> anyhow::Result<PathBuf> {
            self.images.lock().unwrap().push(image.to_vec());
            Ok(PathBuf::from("memory.jpg"))
        }
    }

    struct FailingSink;

    impl ScreenshotSink for FailingSink {
        fn store(&self, _image: &[u8]) -> anyhow::Result<PathBuf> {
            anyhow::bail!("disk full")
        }
    }

    /// The watch's side of the content channel.
    struct Watch {
        handler: ChannelCallback,
        fragmenter: Fragmenter,
    }

    impl Watch {
        fn new(handler: ChannelCallback) -> Self {
            Self {
                handler,
                fragmenter: Fragmenter::for_mtu(23),
            }
        }

        fn send(&mut self, message: &[u8]) {
            for fragment in self.fragmenter.encode(message) {
                (self.handler)(fragment.as_slice());
            }
        }
    }

    fn service() -> (
        ScreenshotService,
        RecordingSink,
        Watch,
        mpsc::UnboundedReceiver<AppEvent>,
    ) {
        let sink = RecordingSink::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let service = ScreenshotService::new(Box::new(sink.clone()), tx);
        let watch = Watch::new(service.handler(SCREENSHOT_CONTENT.id).unwrap());
        (service, sink, watch, rx)
    }

    fn connected() -> MemoryLink {
        let link = MemoryLink::new(23);
        link.set_state(LinkState::Connected);
        link
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<AppEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_full_transfer() {
        let (service, sink, mut watch, mut rx) = service();
        let link = connected();

        assert_eq!(
            service.request_capture(&link).await.unwrap(),
            CaptureRequest::Sent
        );
        assert_eq!(link.writes_on(SCREENSHOT_REQUEST.id), vec![vec![0x00]]);
        assert_eq!(service.phase(), CapturePhase::Requested);

        watch.send(&10u32.to_le_bytes());
        assert_eq!(service.phase(), CapturePhase::SizeKnown);
        watch.send(&[1, 2, 3, 4]);
        assert_eq!(
            service.phase(),
            CapturePhase::Receiving {
                received: 4,
                total: 10
            }
        );
        watch.send(&[5, 6, 7, 8, 9, 10]);

        assert_eq!(service.phase(), CapturePhase::Idle);
        assert_eq!(
            *sink.images.lock().unwrap(),
            vec![vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]]
        );
        let events = drain(&mut rx);
        assert!(matches!(
            events[0],
            AppEvent::ScreenshotProgress {
                received: 4,
                total: 10
            }
        ));
        assert!(matches!(events.last(), Some(AppEvent::ScreenshotSaved(_))));
    }

    #[test]
    fn test_fragment_headers_are_not_image_data() {
        let (_service, sink, mut watch, _rx) = service();
        watch.send(&3u32.to_le_bytes());
        watch.send(&[7, 8, 9]);
        assert_eq!(*sink.images.lock().unwrap(), vec![vec![7, 8, 9]]);
    }

    #[test]
    fn test_messages_longer_than_one_packet() {
        let (_service, sink, mut watch, _rx) = service();
        let image: Vec<u8> = (0..100).collect();
        watch.send(&(image.len() as u32).to_le_bytes());
        watch.send(&image[..70]);
        watch.send(&image[70..]);
        assert_eq!(*sink.images.lock().unwrap(), vec![image]);
    }

    #[test]
    fn test_lost_fragment_drops_only_that_message() {
        let (service, sink, mut watch, _rx) = service();
        watch.send(&8u32.to_le_bytes());

        let mut lost = watch.fragmenter.encode(&[0xaa; 30]);
        lost.pop();
        for fragment in &lost {
            (watch.handler)(fragment.as_slice());
        }
        assert_eq!(service.phase(), CapturePhase::SizeKnown);

        watch.send(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(*sink.images.lock().unwrap(), vec![vec![1, 2, 3, 4, 5, 6, 7, 8]]);
    }

    #[tokio::test]
    async fn test_second_request_during_transfer_is_ignored() {
        let (service, _sink, mut watch, _rx) = service();
        let link = connected();

        service.request_capture(&link).await.unwrap();
        watch.send(&100u32.to_le_bytes());
        assert_eq!(
            service.request_capture(&link).await.unwrap(),
            CaptureRequest::AlreadyInProgress
        );
        watch.send(&[0; 10]);
        assert_eq!(
            service.request_capture(&link).await.unwrap(),
            CaptureRequest::AlreadyInProgress
        );
        assert_eq!(link.writes_on(SCREENSHOT_REQUEST.id).len(), 1);
    }

    #[tokio::test]
    async fn test_request_without_preamble_can_be_repeated() {
        let (service, sink, mut watch, _rx) = service();
        let link = connected();

        service.request_capture(&link).await.unwrap();
        assert_eq!(
            service.request_capture(&link).await.unwrap(),
            CaptureRequest::Sent
        );
        assert_eq!(link.writes_on(SCREENSHOT_REQUEST.id).len(), 2);
        assert_eq!(service.phase(), CapturePhase::Requested);

        watch.send(&1u32.to_le_bytes());
        watch.send(&[0xff]);
        assert_eq!(*sink.images.lock().unwrap(), vec![vec![0xff]]);
    }

    #[tokio::test]
    async fn test_failed_request_stays_idle() {
        let (service, _sink, _watch, _rx) = service();
        let link = MemoryLink::new(23);
        assert_eq!(
            service.request_capture(&link).await,
            Err(LinkError::NotConnected)
        );
        assert_eq!(service.phase(), CapturePhase::Idle);
    }

    #[test]
    fn test_zero_size_completes_immediately() {
        let (service, sink, mut watch, _rx) = service();
        watch.send(&0u32.to_le_bytes());
        assert_eq!(*sink.images.lock().unwrap(), vec![Vec::<u8>::new()]);
        assert_eq!(service.phase(), CapturePhase::Idle);
    }

    #[tokio::test]
    async fn test_bad_preamble_keeps_request_pending() {
        let (service, _sink, mut watch, _rx) = service();
        let link = connected();
        service.request_capture(&link).await.unwrap();
        watch.send(&[1, 2]);
        assert_eq!(service.phase(), CapturePhase::Requested);
    }

    #[test]
    fn test_data_without_preamble_is_ignored() {
        let (service, sink, mut watch, _rx) = service();
        watch.send(&[1, 2, 3]);
        assert_eq!(service.phase(), CapturePhase::Idle);
        assert!(sink.images.lock().unwrap().is_empty());
    }

    #[test]
    fn test_announced_size_does_not_reserve_unbounded_memory() {
        let transfer = ScreenshotTransfer::new(u32::MAX);
        assert!(transfer.buffer.capacity() <= MAX_INITIAL_RESERVE as usize);

        let (service, _sink, mut watch, _rx) = service();
        watch.send(&u32::MAX.to_le_bytes());
        assert_eq!(service.phase(), CapturePhase::SizeKnown);
    }

    #[test]
    fn test_excess_bytes_are_dropped() {
        let (_service, sink, mut watch, _rx) = service();
        watch.send(&3u32.to_le_bytes());
        watch.send(&[7, 8, 9, 10, 11]);
        assert_eq!(*sink.images.lock().unwrap(), vec![vec![7, 8, 9]]);
    }

    #[test]
    fn test_progress_only_on_percent_change() {
        let (_service, _sink, mut watch, mut rx) = service();
        watch.send(&1000u32.to_le_bytes());
        for _ in 0..20 {
            watch.send(&[0u8; 1]);
        }
        // 20 bytes of 1000 cross two whole percent steps (1% and 2%); the
        // first byte reports 0%.
        let progress = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, AppEvent::ScreenshotProgress { .. }))
            .count();
        assert_eq!(progress, 3);
    }

    #[test]
    fn test_unsync_discards_partial_transfer() {
        let (mut service, sink, mut watch, _rx) = service();
        watch.send(&10_000u32.to_le_bytes());
        watch.send(&[0u8; 4096]);
        assert_eq!(
            service.phase(),
            CapturePhase::Receiving {
                received: 4096,
                total: 10_000
            }
        );

        service.unsync();
        assert_eq!(service.phase(), CapturePhase::Idle);
        assert!(sink.images.lock().unwrap().is_empty());
    }

    #[test]
    fn test_sink_failure_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let service = ScreenshotService::new(Box::new(FailingSink), tx);
        let mut watch = Watch::new(service.handler(SCREENSHOT_CONTENT.id).unwrap());
        watch.send(&1u32.to_le_bytes());
        watch.send(&[0xff]);

        let events = drain(&mut rx);
        match events.last() {
            Some(AppEvent::ScreenshotFailed(reason)) => assert!(reason.contains("disk full")),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(service.phase(), CapturePhase::Idle);
    }

    #[test]
    fn test_file_sink_writes_jpg() {
        let dir = std::env::temp_dir().join(format!("watch_sync_shots_{}", std::process::id()));
        let path = FileSink::new(&dir).store(&[0xff, 0xd8]).unwrap();
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("jpg"));
        assert_eq!(fs::read(&path).unwrap(), vec![0xff, 0xd8]);
        let _ = fs::remove_dir_all(dir);
    }
}
