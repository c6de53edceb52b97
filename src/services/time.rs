//! Clock synchronization.
//!
//! The watch keeps wall-clock time from a 6-byte packet:
//! `[year - 1900, month - 1, day, hour, minute, second]`.

use super::{ServiceError, SyncContext};
use crate::domain::channels::{Channel, TIME_CHANNELS, TIME_SET};
use crate::infrastructure::link::{DeviceLink, LinkError};
use ::time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Broken-down UTC time as the watch understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchTime {
    pub year: u16,
    /// 1-12
    pub month: u8,
    /// 1-31
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl From<OffsetDateTime> for WatchTime {
    fn from(dt: OffsetDateTime) -> Self {
        Self {
            year: u16::try_from(dt.year()).unwrap_or(0),
            month: u8::from(dt.month()),
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
        }
    }
}

impl WatchTime {
    /// `None` when `secs` is outside the representable date range.
    pub fn from_unix_seconds(secs: i64) -> Option<Self> {
        OffsetDateTime::from_unix_timestamp(secs)
            .map(Self::from)
            .map_err(|e| warn!("Invalid timestamp {}: {}", secs, e))
            .ok()
    }

    /// Current UTC time.
    pub fn now() -> Self {
        Self::from(OffsetDateTime::now_utc())
    }

    /// Wire form, see the module docs.
    pub fn encode(&self) -> [u8; 6] {
        [
            self.year.saturating_sub(1900).min(u8::MAX as u16) as u8,
            self.month.saturating_sub(1),
            self.day,
            self.hour,
            self.minute,
            self.second,
        ]
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimeService;

impl TimeService {
    pub fn new() -> Self {
        Self
    }

    pub fn channels() -> &'static [Channel] {
        TIME_CHANNELS
    }

    /// Write `time` to the watch clock.
    pub async fn set_time(&self, link: &dyn DeviceLink, time: WatchTime) -> Result<(), LinkError> {
        debug!(?time, "Setting watch time");
        link.send(TIME_SET.id, &time.encode()).await
    }

    /// Push the current clock on every (re)connect.
    pub(super) async fn sync(&mut self, ctx: &SyncContext) -> Result<(), ServiceError> {
        let now = WatchTime::now();
        self.set_time(ctx.link.as_ref(), now).await?;
        info!(
            "Watch clock set to {:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC",
            now.year, now.month, now.day, now.hour, now.minute, now.second
        );
        Ok(())
    }

    pub(super) fn unsync(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::LinkState;
    use crate::infrastructure::link::memory::MemoryLink;

    #[test]
    fn test_epoch() {
        let t = WatchTime::from_unix_seconds(0).unwrap();
        assert_eq!((t.year, t.month, t.day), (1970, 1, 1));
        assert_eq!(t.encode(), [70, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_leap_day() {
        // 2024-02-29 13:45:30 UTC
        let t = WatchTime::from_unix_seconds(1_709_214_330).unwrap();
        assert_eq!(
            t,
            WatchTime {
                year: 2024,
                month: 2,
                day: 29,
                hour: 13,
                minute: 45,
                second: 30,
            }
        );
        assert_eq!(t.encode(), [124, 1, 29, 13, 45, 30]);
    }

    #[test]
    fn test_end_of_year() {
        // 1999-12-31 23:59:59 UTC
        let t = WatchTime::from_unix_seconds(946_684_799).unwrap();
        assert_eq!((t.year, t.month, t.day), (1999, 12, 31));
        assert_eq!((t.hour, t.minute, t.second), (23, 59, 59));
    }

    #[test]
    fn test_out_of_range_timestamp() {
        assert!(WatchTime::from_unix_seconds(i64::MAX).is_none());
    }

    #[tokio::test]
    async fn test_set_time_writes_six_bytes() {
        let link = MemoryLink::new(23);
        link.set_state(LinkState::Connected);
        let service = TimeService::new();
        service
            .set_time(&link, WatchTime::from_unix_seconds(0).unwrap())
            .await
            .unwrap();
        assert_eq!(link.writes_on(TIME_SET.id), vec![vec![70, 0, 1, 0, 0, 0]]);
    }
}
