//! GATT glue
//!
//! Conversions between WinRT types and the byte slices / channel ids the rest
//! of the crate works with.

use crate::domain::channels::ChannelId;
use windows::core::{Result, GUID};
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

/// ATT header bytes taken out of every PDU (opcode + handle).
pub const ATT_HEADER_LEN: u16 = 3;

/// Payload bytes usable per write/notification for an ATT MTU.
pub fn payload_mtu(max_pdu_size: u16) -> u32 {
    u32::from(max_pdu_size.saturating_sub(ATT_HEADER_LEN).max(1))
}

/// WinRT GUID of a channel.
pub fn guid_for(channel: ChannelId) -> GUID {
    GUID::from_u128(channel.as_u128())
}

/// Channel id of a characteristic UUID.
pub fn channel_for(uuid: &GUID) -> ChannelId {
    ChannelId::from_u128(uuid.to_u128())
}

/// Copy a WinRT buffer into owned bytes.
pub fn read_buffer(buffer: &IBuffer) -> Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

/// Wrap bytes in a WinRT buffer for a characteristic write.
pub fn to_buffer(bytes: &[u8]) -> Result<IBuffer> {
    let writer = DataWriter::new()?;
    writer.WriteBytes(bytes)?;
    writer.DetachBuffer()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::channels::{DIRECTORY, TUNNEL_OUTGOING};

    #[test]
    fn test_guid_matches_display() {
        let guid = guid_for(TUNNEL_OUTGOING.id);
        assert_eq!(
            format!("{guid:?}").to_lowercase(),
            TUNNEL_OUTGOING.id.to_string()
        );
    }

    #[test]
    fn test_directory_round_trips_through_guid() {
        for channel in DIRECTORY {
            assert_eq!(channel_for(&guid_for(channel.id)), channel.id);
        }
    }

    #[test]
    fn test_payload_mtu() {
        assert_eq!(payload_mtu(23), 20);
        assert_eq!(payload_mtu(247), 244);
        assert_eq!(payload_mtu(0), 1);
    }

    #[test]
    fn test_buffer_round_trip() {
        let buffer = to_buffer(&[1, 2, 3]).unwrap();
        assert_eq!(read_buffer(&buffer).unwrap(), vec![1, 2, 3]);
    }
}
