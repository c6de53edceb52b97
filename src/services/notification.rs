//! Notification mirroring.
//!
//! Outbound updates are small tag-delimited documents; the watch answers on
//! the feedback channel when the user dismisses one.

use super::framing::{reassembling, ChannelWriter};
use super::{emit, ServiceError, SyncContext};
use crate::domain::channels::{
    Channel, ChannelId, NOTIFICATION_CHANNELS, NOTIFICATION_FEEDBACK, NOTIFICATION_UPDATE,
};
use crate::domain::models::AppEvent;
use crate::infrastructure::link::{ChannelCallback, DeviceLink, LinkError};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notification {
    pub id: u32,
    pub package_name: String,
    pub app_name: String,
    /// Icon identifier the watch resolves locally.
    pub app_icon: String,
    pub summary: String,
    pub body: String,
    pub vibrate: bool,
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}

fn element(out: &mut String, tag: &str, value: &str) {
    let _ = write!(out, "<{tag}>{}</{tag}>", escape(value));
}

/// Build the `<insert>` document for a new notification.
pub fn encode_insert(notification: &Notification) -> Vec<u8> {
    let mut out = String::from("<insert>");
    element(&mut out, "pn", &notification.package_name);
    element(&mut out, "id", &notification.id.to_string());
    element(&mut out, "an", &notification.app_name);
    element(&mut out, "ai", &notification.app_icon);
    element(&mut out, "su", &notification.summary);
    element(&mut out, "bo", &notification.body);
    element(&mut out, "vb", if notification.vibrate { "1" } else { "0" });
    out.push_str("</insert>");
    out.into_bytes()
}

/// Build the `<removed>` document for a dismissed notification.
pub fn encode_removed(id: u32) -> Vec<u8> {
    format!("<removed><id>{id}</id></removed>").into_bytes()
}

/// Extract the id from a `<removed><id>N</id></removed>` feedback message.
pub fn parse_feedback(bytes: &[u8]) -> Option<u32> {
    let text = std::str::from_utf8(bytes).ok()?;
    let start = text.find("<id>")? + "<id>".len();
    let end = start + text[start..].find("</id>")?;
    text[start..end].trim().parse().ok()
}

#[derive(Clone)]
pub struct NotificationService {
    writer: Arc<ChannelWriter>,
    events: mpsc::UnboundedSender<AppEvent>,
}

impl NotificationService {
    pub fn new(events: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self {
            writer: Arc::new(ChannelWriter::new()),
            events,
        }
    }

    /// Channels the service claims.
    pub fn channels() -> &'static [Channel] {
        NOTIFICATION_CHANNELS
    }

    /// Show `notification` on the watch.
    pub async fn post(
        &self,
        link: &dyn DeviceLink,
        notification: &Notification,
    ) -> Result<(), LinkError> {
        debug!(id = notification.id, app = %notification.app_name, "Posting notification");
        self.writer
            .send(link, &NOTIFICATION_UPDATE, &encode_insert(notification))
            .await
    }

    /// Withdraw a notification dismissed on the phone.
    pub async fn remove(&self, link: &dyn DeviceLink, id: u32) -> Result<(), LinkError> {
        debug!(id, "Removing notification");
        self.writer
            .send(link, &NOTIFICATION_UPDATE, &encode_removed(id))
            .await
    }

    pub(super) fn handler(&self, channel: ChannelId) -> Option<ChannelCallback> {
        if channel != NOTIFICATION_FEEDBACK.id {
            return None;
        }
        let events = self.events.clone();
        Some(reassembling(move |message| match parse_feedback(&message) {
            Some(id) => emit(&events, AppEvent::NotificationDismissed(id)),
            None => warn!(
                "Unrecognized notification feedback: {}",
                String::from_utf8_lossy(&message)
            ),
        }))
    }

    pub(super) async fn sync(&mut self, _ctx: &SyncContext) -> Result<(), ServiceError> {
        self.writer.reset();
        Ok(())
    }

    pub(super) fn unsync(&mut self) {}
}
