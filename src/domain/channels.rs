//! Channel Directory
//!
//! Static table of every logical channel carried over the watch link. Each
//! channel is one GATT characteristic on the watch; its UUID lives in the
//! `0000XXXX-0000-0000-0000-00a57e401d05` family where `XXXX` is the short
//! code below.
//!
//! Channels are grouped per service. The groups are what a service reports
//! from `channels()`, the flat [`DIRECTORY`] is what the link uses to check
//! directions.
//!
//! Fixed-size control values (clock, capture byte, play state, volume, media
//! commands) fit one packet at any MTU and travel raw. Every variable-length
//! channel carries Fragmentation Codec messages.

use std::fmt;
use thiserror::Error;

/// Base UUID with the 16-bit short code zeroed out.
const BASE_UUID: u128 = 0x0000_0000_0000_0000_0000_00a5_7e40_1d05;

/// Opaque 128-bit channel identifier (a characteristic UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u128);

impl ChannelId {
    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    /// Build an id in the watch's UUID family from its 16-bit short code.
    pub const fn from_short(short: u16) -> Self {
        Self(BASE_UUID | ((short as u128) << 96))
    }

    pub const fn as_u128(self) -> u128 {
        self.0
    }

    /// Parse a UUID string (`8-4-4-4-12`, dashes optional, any case).
    pub fn parse(uuid_str: &str) -> Result<Self, ChannelParseError> {
        let hex = uuid_str.replace('-', "");
        if hex.len() != 32 {
            return Err(ChannelParseError::Length(hex.len()));
        }
        u128::from_str_radix(&hex, 16)
            .map(Self)
            .map_err(|_| ChannelParseError::Digit(uuid_str.to_string()))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            v & 0xffff_ffff_ffff
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelParseError {
    #[error("expected 32 hex digits, got {0}")]
    Length(usize),
    #[error("invalid hex digit in {0:?}")]
    Digit(String),
}

/// Which way data flows on a channel, seen from the phone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ToDevice,
    FromDevice,
}

/// How payloads are laid out on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Framing {
    /// One write or notification is one message.
    Raw,
    /// Messages are split with the 1-byte fragment header.
    Fragmented,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub name: &'static str,
    pub id: ChannelId,
    pub direction: Direction,
    pub framing: Framing,
}

const fn channel(name: &'static str, short: u16, direction: Direction) -> Channel {
    Channel {
        name,
        id: ChannelId::from_short(short),
        direction,
        framing: Framing::Fragmented,
    }
}

const fn raw(name: &'static str, short: u16, direction: Direction) -> Channel {
    Channel {
        framing: Framing::Raw,
        ..channel(name, short, direction)
    }
}

// Time
pub const TIME_SET: Channel = raw("time-set", 0x5001, Direction::ToDevice);

// Screenshot
pub const SCREENSHOT_REQUEST: Channel = raw("screenshot-request", 0x6001, Direction::ToDevice);
pub const SCREENSHOT_CONTENT: Channel =
    channel("screenshot-content", 0x6002, Direction::FromDevice);

// Media
pub const MEDIA_TITLE: Channel = channel("media-title", 0x7001, Direction::ToDevice);
pub const MEDIA_ALBUM: Channel = channel("media-album", 0x7002, Direction::ToDevice);
pub const MEDIA_ARTIST: Channel = channel("media-artist", 0x7003, Direction::ToDevice);
pub const MEDIA_PLAYING: Channel = raw("media-playing", 0x7004, Direction::ToDevice);
pub const MEDIA_COMMANDS: Channel = raw("media-commands", 0x7005, Direction::FromDevice);
pub const MEDIA_VOLUME: Channel = raw("media-volume", 0x7006, Direction::ToDevice);

// Weather
pub const WEATHER_CITY: Channel = channel("weather-city", 0x8001, Direction::ToDevice);
pub const WEATHER_IDS: Channel = channel("weather-ids", 0x8002, Direction::ToDevice);
pub const WEATHER_MIN_TEMPS: Channel = channel("weather-min-temps", 0x8003, Direction::ToDevice);
pub const WEATHER_MAX_TEMPS: Channel = channel("weather-max-temps", 0x8004, Direction::ToDevice);

// Notifications
pub const NOTIFICATION_UPDATE: Channel =
    channel("notification-update", 0x9001, Direction::ToDevice);
pub const NOTIFICATION_FEEDBACK: Channel =
    channel("notification-feedback", 0x9002, Direction::FromDevice);

// IP tunnel
pub const TUNNEL_OUTGOING: Channel = channel("tunnel-outgoing", 0xa001, Direction::ToDevice);
pub const TUNNEL_INCOMING: Channel = channel("tunnel-incoming", 0xa002, Direction::FromDevice);

pub const TIME_CHANNELS: &[Channel] = &[TIME_SET];
pub const SCREENSHOT_CHANNELS: &[Channel] = &[SCREENSHOT_REQUEST, SCREENSHOT_CONTENT];
pub const MEDIA_CHANNELS: &[Channel] = &[
    MEDIA_TITLE,
    MEDIA_ALBUM,
    MEDIA_ARTIST,
    MEDIA_PLAYING,
    MEDIA_COMMANDS,
    MEDIA_VOLUME,
];
pub const WEATHER_CHANNELS: &[Channel] = &[
    WEATHER_CITY,
    WEATHER_IDS,
    WEATHER_MIN_TEMPS,
    WEATHER_MAX_TEMPS,
];
pub const NOTIFICATION_CHANNELS: &[Channel] = &[NOTIFICATION_UPDATE, NOTIFICATION_FEEDBACK];
pub const TUNNEL_CHANNELS: &[Channel] = &[TUNNEL_OUTGOING, TUNNEL_INCOMING];

/// Every known channel.
pub const DIRECTORY: &[Channel] = &[
    TIME_SET,
    SCREENSHOT_REQUEST,
    SCREENSHOT_CONTENT,
    MEDIA_TITLE,
    MEDIA_ALBUM,
    MEDIA_ARTIST,
    MEDIA_PLAYING,
    MEDIA_COMMANDS,
    MEDIA_VOLUME,
    WEATHER_CITY,
    WEATHER_IDS,
    WEATHER_MIN_TEMPS,
    WEATHER_MAX_TEMPS,
    NOTIFICATION_UPDATE,
    NOTIFICATION_FEEDBACK,
    TUNNEL_OUTGOING,
    TUNNEL_INCOMING,
];

/// Directory entry for `id`.
pub fn lookup(id: ChannelId) -> Option<&'static Channel> {
    DIRECTORY.iter().find(|c| c.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_directory_ids_are_unique() {
        let ids: HashSet<_> = DIRECTORY.iter().map(|c| c.id).collect();
        assert_eq!(ids.len(), DIRECTORY.len());
    }

    #[test]
    fn test_groups_cover_directory() {
        let grouped: usize = [
            TIME_CHANNELS,
            SCREENSHOT_CHANNELS,
            MEDIA_CHANNELS,
            WEATHER_CHANNELS,
            NOTIFICATION_CHANNELS,
            TUNNEL_CHANNELS,
        ]
        .iter()
        .map(|g| g.len())
        .sum();
        assert_eq!(grouped, DIRECTORY.len());
    }

    #[test]
    fn test_display_and_parse() {
        let id = SCREENSHOT_CONTENT.id;
        assert_eq!(id.to_string(), "00006002-0000-0000-0000-00a57e401d05");
        assert_eq!(ChannelId::parse("00006002-0000-0000-0000-00A57E401D05"), Ok(id));
        assert_eq!(ChannelId::parse("1234"), Err(ChannelParseError::Length(4)));
        assert!(matches!(
            ChannelId::parse("zz006002-0000-0000-0000-00a57e401d05"),
            Err(ChannelParseError::Digit(_))
        ));
    }

    #[test]
    fn test_lookup_direction() {
        assert_eq!(
            lookup(TUNNEL_INCOMING.id).map(|c| c.direction),
            Some(Direction::FromDevice)
        );
        assert_eq!(
            lookup(TUNNEL_OUTGOING.id).map(|c| c.direction),
            Some(Direction::ToDevice)
        );
        assert!(lookup(ChannelId::from_short(0x0bad)).is_none());
    }

    #[test]
    fn test_variable_length_channels_are_fragmented() {
        for channel in [
            SCREENSHOT_CONTENT,
            MEDIA_TITLE,
            WEATHER_IDS,
            NOTIFICATION_UPDATE,
            NOTIFICATION_FEEDBACK,
            TUNNEL_OUTGOING,
            TUNNEL_INCOMING,
        ] {
            assert_eq!(channel.framing, Framing::Fragmented, "{}", channel.name);
        }
        for channel in [TIME_SET, SCREENSHOT_REQUEST, MEDIA_PLAYING, MEDIA_VOLUME, MEDIA_COMMANDS] {
            assert_eq!(channel.framing, Framing::Raw, "{}", channel.name);
        }
    }
}
