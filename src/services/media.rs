//! Now-playing mirror and remote control.

use super::framing::ChannelWriter;
use super::{emit, ServiceError, SyncContext};
use crate::domain::channels::{
    Channel, ChannelId, MEDIA_ALBUM, MEDIA_ARTIST, MEDIA_CHANNELS, MEDIA_COMMANDS, MEDIA_PLAYING,
    MEDIA_TITLE, MEDIA_VOLUME,
};
use crate::domain::models::{AppEvent, MediaCommand};
use crate::infrastructure::link::{ChannelCallback, DeviceLink, LinkError};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const CMD_PREVIOUS: u8 = 0x00;
const CMD_NEXT: u8 = 0x01;
const CMD_PLAY: u8 = 0x02;
const CMD_PAUSE: u8 = 0x03;
const CMD_VOLUME: u8 = 0x04;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaInfo {
    pub title: String,
    pub album: String,
    pub artist: String,
    pub playing: bool,
    /// 0-100
    pub volume: u8,
}

/// Decode a media-commands notification.
pub fn parse_command(bytes: &[u8]) -> Option<MediaCommand> {
    match bytes {
        [CMD_PREVIOUS, ..] => Some(MediaCommand::Previous),
        [CMD_NEXT, ..] => Some(MediaCommand::Next),
        [CMD_PLAY, ..] => Some(MediaCommand::Play),
        [CMD_PAUSE, ..] => Some(MediaCommand::Pause),
        [CMD_VOLUME, volume, ..] => Some(MediaCommand::Volume((*volume).min(100))),
        _ => None,
    }
}

/// Cheap to clone; clones share the last accepted [`MediaInfo`].
#[derive(Clone)]
pub struct MediaService {
    current: Arc<Mutex<Option<MediaInfo>>>,
    writer: Arc<ChannelWriter>,
    events: mpsc::UnboundedSender<AppEvent>,
}

impl MediaService {
    pub fn new(events: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self {
            current: Arc::new(Mutex::new(None)),
            writer: Arc::new(ChannelWriter::new()),
            events,
        }
    }

    /// Last state the watch accepted.
    pub fn current(&self) -> Option<MediaInfo> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn channels() -> &'static [Channel] {
        MEDIA_CHANNELS
    }

    /// Push `info` to the watch and remember it once every write went through.
    pub async fn update(&self, link: &dyn DeviceLink, info: MediaInfo) -> Result<(), LinkError> {
        self.push(link, &info).await?;
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(info);
        Ok(())
    }

    async fn push(&self, link: &dyn DeviceLink, info: &MediaInfo) -> Result<(), LinkError> {
        let writer = &self.writer;
        writer.send(link, &MEDIA_TITLE, info.title.as_bytes()).await?;
        writer.send(link, &MEDIA_ALBUM, info.album.as_bytes()).await?;
        writer.send(link, &MEDIA_ARTIST, info.artist.as_bytes()).await?;
        writer
            .send(link, &MEDIA_PLAYING, &[u8::from(info.playing)])
            .await?;
        writer
            .send(link, &MEDIA_VOLUME, &[info.volume.min(100)])
            .await
    }

    pub(super) fn handler(&self, channel: ChannelId) -> Option<ChannelCallback> {
        if channel != MEDIA_COMMANDS.id {
            return None;
        }
        let events = self.events.clone();
        Some(Box::new(move |bytes: &[u8]| match parse_command(bytes) {
            Some(command) => {
                debug!(?command, "Media command from watch");
                emit(&events, AppEvent::MediaCommand(command));
            }
            None => warn!("Ignoring unknown media command {:02x?}", bytes),
        }))
    }

    /// Re-push the last known state after a reconnect.
    pub(super) async fn sync(&mut self, ctx: &SyncContext) -> Result<(), ServiceError> {
        self.writer.reset();
        if let Some(info) = self.current() {
            self.push(ctx.link.as_ref(), &info).await?;
            info!("Media state restored: {} - {}", info.artist, info.title);
        }
        Ok(())
    }

    pub(super) fn unsync(&mut self) {}
}
