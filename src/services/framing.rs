//! Channel framing shared by the services.
//!
//! [`ChannelWriter`] keeps one outbound sequence counter per channel and
//! fragments to the link's current MTU. [`reassembling`] wraps an inbound
//! message handler with a per-channel [`Reassembler`].

use crate::domain::channels::{Channel, ChannelId, Framing};
use crate::domain::fragmentation::{max_chunk_for_mtu, Fragmenter, Reassembler};
use crate::infrastructure::link::{ChannelCallback, DeviceLink, LinkError};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Outbound framing state for the channels of one service.
#[derive(Debug, Default)]
pub struct ChannelWriter {
    sequences: Mutex<HashMap<ChannelId, u8>>,
}

impl ChannelWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn sequences(&self) -> MutexGuard<'_, HashMap<ChannelId, u8>> {
        self.sequences.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start every channel's counter over, as on a fresh connection.
    pub fn reset(&self) {
        self.sequences().clear();
    }

    /// Split `payload` for `channel` at `mtu`, advancing its counter.
    pub fn fragment(&self, channel: ChannelId, payload: &[u8], mtu: u32) -> Vec<Vec<u8>> {
        let mut sequences = self.sequences();
        let next = sequences.get(&channel).copied().unwrap_or(0);
        let mut fragmenter = Fragmenter::with_sequence(max_chunk_for_mtu(mtu), next);
        let fragments = fragmenter.encode(payload);
        sequences.insert(channel, fragmenter.next_sequence());
        fragments
    }

    /// Send one message on `channel` using its declared framing. Stops at the
    /// first failed write.
    pub async fn send(
        &self,
        link: &dyn DeviceLink,
        channel: &Channel,
        payload: &[u8],
    ) -> Result<(), LinkError> {
        match channel.framing {
            Framing::Raw => link.send(channel.id, payload).await,
            Framing::Fragmented => {
                let fragments = self.fragment(channel.id, payload, link.negotiated_mtu());
                trace!(channel = channel.name, fragments = fragments.len(), "framed send");
                for fragment in fragments {
                    link.send(channel.id, &fragment).await?;
                }
                Ok(())
            }
        }
    }
}

/// Wrap `on_message` so it sees whole messages instead of fragments.
pub fn reassembling<F>(on_message: F) -> ChannelCallback
where
    F: Fn(Vec<u8>) + Send + Sync + 'static,
{
    let reassembler = Mutex::new(Reassembler::new());
    Box::new(move |fragment: &[u8]| {
        let message = reassembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(fragment);
        if let Some(message) = message {
            on_message(message);
        }
    })
}
