//! In-memory Device Link.
//!
//! Records every write, lets the caller drive the connection state and MTU,
//! and delivers inbound notifications to registered callbacks on the calling
//! thread. Used as the link double in tests.

use super::{check_inbound, check_outbound, ChannelCallback, DeviceLink, LinkError};
use crate::domain::channels::ChannelId;
use crate::domain::models::LinkState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub channel: ChannelId,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    callbacks: HashMap<ChannelId, Arc<ChannelCallback>>,
    writes: Vec<Write>,
    fail_next: Option<LinkError>,
}

pub struct MemoryLink {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<LinkState>,
    mtu: AtomicU32,
    written: Notify,
}

impl MemoryLink {
    pub fn new(mtu: u32) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        Self {
            inner: Mutex::new(Inner::default()),
            state_tx,
            mtu: AtomicU32::new(mtu),
            written: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_state(&self, state: LinkState) {
        self.state_tx.send_replace(state);
    }

    pub fn set_mtu(&self, mtu: u32) {
        self.mtu.store(mtu, Ordering::SeqCst);
    }

    /// Make the next `send` fail with `error` instead of writing.
    pub fn fail_next_send(&self, error: LinkError) {
        self.lock().fail_next = Some(error);
    }

    /// Deliver one inbound notification. Returns `false` when nobody is
    /// registered for `channel`.
    pub fn deliver(&self, channel: ChannelId, bytes: &[u8]) -> bool {
        let callback = self.lock().callbacks.get(&channel).cloned();
        match callback {
            Some(callback) => {
                callback(bytes);
                true
            }
            None => false,
        }
    }

    pub fn has_callback(&self, channel: ChannelId) -> bool {
        self.lock().callbacks.contains_key(&channel)
    }

    pub fn writes(&self) -> Vec<Write> {
        self.lock().writes.clone()
    }

    pub fn writes_on(&self, channel: ChannelId) -> Vec<Vec<u8>> {
        self.lock()
            .writes
            .iter()
            .filter(|w| w.channel == channel)
            .map(|w| w.bytes.clone())
            .collect()
    }

    pub fn take_writes(&self) -> Vec<Write> {
        std::mem::take(&mut self.lock().writes)
    }

    /// Wait until at least `count` writes landed on `channel`.
    pub async fn wait_for_writes(
        &self,
        channel: ChannelId,
        count: usize,
        timeout: Duration,
    ) -> Option<Vec<Vec<u8>>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.written.notified();
            let writes = self.writes_on(channel);
            if writes.len() >= count {
                return Some(writes);
            }
            tokio::time::timeout_at(deadline, notified).await.ok()?;
        }
    }
}

#[async_trait]
impl DeviceLink for MemoryLink {
    fn connection_state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    async fn send(&self, channel: ChannelId, bytes: &[u8]) -> Result<(), LinkError> {
        if self.connection_state() != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }
        check_outbound(channel)?;
        {
            let mut inner = self.lock();
            if let Some(error) = inner.fail_next.take() {
                return Err(error);
            }
            trace!(%channel, len = bytes.len(), "memory link write");
            inner.writes.push(Write {
                channel,
                bytes: bytes.to_vec(),
            });
        }
        self.written.notify_waiters();
        Ok(())
    }

    async fn register_callback(
        &self,
        channel: ChannelId,
        callback: ChannelCallback,
    ) -> Result<(), LinkError> {
        check_inbound(channel)?;
        self.lock().callbacks.insert(channel, Arc::new(callback));
        Ok(())
    }

    async fn unregister_callback(&self, channel: ChannelId) {
        self.lock().callbacks.remove(&channel);
    }

    fn negotiated_mtu(&self) -> u32 {
        self.mtu.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::channels::{MEDIA_COMMANDS, MEDIA_TITLE, TIME_SET};
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_send_requires_connection() {
        let link = MemoryLink::new(23);
        assert_eq!(
            link.send(TIME_SET.id, &[1]).await,
            Err(LinkError::NotConnected)
        );
        link.set_state(LinkState::Connected);
        link.send(TIME_SET.id, &[1]).await.unwrap();
        assert_eq!(link.writes_on(TIME_SET.id), vec![vec![1]]);
    }

    #[tokio::test]
    async fn test_send_on_inbound_channel_is_rejected() {
        let link = MemoryLink::new(23);
        link.set_state(LinkState::Connected);
        assert_eq!(
            link.send(MEDIA_COMMANDS.id, &[0]).await,
            Err(LinkError::InvalidDirection(MEDIA_COMMANDS.id))
        );
        assert!(link.writes().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_is_not_retried() {
        let link = MemoryLink::new(23);
        link.set_state(LinkState::Connected);
        link.fail_next_send(LinkError::Timeout);
        assert_eq!(link.send(MEDIA_TITLE.id, b"a").await, Err(LinkError::Timeout));
        link.send(MEDIA_TITLE.id, b"b").await.unwrap();
        assert_eq!(link.writes_on(MEDIA_TITLE.id), vec![b"b".to_vec()]);
    }

    #[tokio::test]
    async fn test_callbacks_receive_in_order() {
        let link = MemoryLink::new(23);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        link.register_callback(
            MEDIA_COMMANDS.id,
            Box::new(move |bytes| sink.lock().unwrap().push(bytes.to_vec())),
        )
        .await
        .unwrap();

        assert!(link.deliver(MEDIA_COMMANDS.id, &[1]));
        assert!(link.deliver(MEDIA_COMMANDS.id, &[2]));
        assert_eq!(*seen.lock().unwrap(), vec![vec![1], vec![2]]);

        link.unregister_callback(MEDIA_COMMANDS.id).await;
        assert!(!link.deliver(MEDIA_COMMANDS.id, &[3]));
    }

    #[tokio::test]
    async fn test_register_on_outbound_channel_is_rejected() {
        let link = MemoryLink::new(23);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = link
            .register_callback(
                TIME_SET.id,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;
        assert_eq!(result, Err(LinkError::InvalidDirection(TIME_SET.id)));
        assert!(!link.has_callback(TIME_SET.id));
    }
}
