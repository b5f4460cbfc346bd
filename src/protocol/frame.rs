//! Binary sub-protocol frames.
//!
//! ```text
//! [Tag(4, i32 BE)] [Length(4, i32 BE)] [Payload(Length)]
//! ```
//!
//! | Tag | Name                 | Direction       | Payload                          |
//! |-----|----------------------|-----------------|----------------------------------|
//! | 0   | `SUBMIT_ITEMS`       | client → relay  | `[name_len:u8][name][envelope]`  |
//! | 1   | `SUBSCRIBE_PORTAL`   | client → relay  | channel name bytes               |
//! | 2   | `UNSUBSCRIBE_PORTAL` | client → relay  | channel name bytes               |
//! | 3   | `ITEM_DELIVERY`      | relay → client  | `[name_len:u8][name][envelope]`  |

use crate::core::channel_name::ChannelName;
use crate::error::{PortalError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the fixed frame header
pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FrameTag {
    SubmitItems = 0,
    SubscribePortal = 1,
    UnsubscribePortal = 2,
    ItemDelivery = 3,
}

impl FrameTag {
    /// Tags a client may send to the relay
    pub fn is_inbound(self) -> bool {
        !matches!(self, FrameTag::ItemDelivery)
    }
}

impl TryFrom<i32> for FrameTag {
    type Error = PortalError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(FrameTag::SubmitItems),
            1 => Ok(FrameTag::SubscribePortal),
            2 => Ok(FrameTag::UnsubscribePortal),
            3 => Ok(FrameTag::ItemDelivery),
            other => Err(PortalError::UnknownFrameTag(other)),
        }
    }
}

impl From<FrameTag> for i32 {
    fn from(tag: FrameTag) -> Self {
        tag as i32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: FrameTag,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(tag: FrameTag, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// Submission of `envelope` addressed to `channel`
    pub fn submit(channel: &ChannelName, envelope: &[u8]) -> Self {
        Self::addressed(FrameTag::SubmitItems, channel, envelope)
    }

    pub fn subscribe(channel: &ChannelName) -> Self {
        Self::new(
            FrameTag::SubscribePortal,
            Bytes::copy_from_slice(channel.as_bytes()),
        )
    }

    pub fn unsubscribe(channel: &ChannelName) -> Self {
        Self::new(
            FrameTag::UnsubscribePortal,
            Bytes::copy_from_slice(channel.as_bytes()),
        )
    }

    /// Outbound delivery of `envelope` published on `channel`
    pub fn delivery(channel: &ChannelName, envelope: &[u8]) -> Self {
        Self::addressed(FrameTag::ItemDelivery, channel, envelope)
    }

    fn addressed(tag: FrameTag, channel: &ChannelName, envelope: &[u8]) -> Self {
        let name = channel.as_bytes();
        let mut payload = BytesMut::with_capacity(1 + name.len() + envelope.len());
        // Channel names are at most 16 bytes
        payload.put_u8(name.len() as u8);
        payload.put_slice(name);
        payload.put_slice(envelope);
        Self::new(tag, payload.freeze())
    }

    /// Split a `SUBMIT_ITEMS` or `ITEM_DELIVERY` payload into channel and envelope
    pub fn parse_addressed(&self) -> Result<(ChannelName, Bytes)> {
        if !matches!(self.tag, FrameTag::SubmitItems | FrameTag::ItemDelivery) {
            return Err(PortalError::UnknownFrameTag(self.tag.into()));
        }
        let name_len = *self
            .payload
            .first()
            .ok_or(PortalError::InvalidFrameLength(0))? as usize;
        if self.payload.len() < 1 + name_len {
            return Err(PortalError::InvalidFrameLength(self.payload.len() as i32));
        }
        let channel = ChannelName::from_bytes(&self.payload[1..1 + name_len])?;
        Ok((channel, self.payload.slice(1 + name_len..)))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn tags_map_to_wire_numbers() {
        assert_eq!(i32::from(FrameTag::SubmitItems), 0);
        assert_eq!(i32::from(FrameTag::SubscribePortal), 1);
        assert_eq!(i32::from(FrameTag::UnsubscribePortal), 2);
        assert_eq!(FrameTag::try_from(2).unwrap(), FrameTag::UnsubscribePortal);
        assert!(matches!(
            FrameTag::try_from(9),
            Err(PortalError::UnknownFrameTag(9))
        ));
        assert!(!FrameTag::ItemDelivery.is_inbound());
    }

    #[test]
    fn delivery_payload_carries_name_then_envelope() {
        let channel = ChannelName::parse("myportal").unwrap();
        let frame = Frame::delivery(&channel, b"sealed");
        assert_eq!(frame.payload[0], 8);
        assert_eq!(&frame.payload[1..9], b"myportal");

        let (name, envelope) = frame.parse_addressed().unwrap();
        assert_eq!(name, channel);
        assert_eq!(&envelope[..], b"sealed");
    }

    #[test]
    fn subscribe_frames_are_not_addressed() {
        let channel = ChannelName::parse("myportal").unwrap();
        assert!(Frame::subscribe(&channel).parse_addressed().is_err());
        let (name, envelope) = Frame::submit(&channel, b"x").parse_addressed().unwrap();
        assert_eq!(name, channel);
        assert_eq!(&envelope[..], b"x");
    }

    #[test]
    fn truncated_delivery_rejected() {
        let frame = Frame::new(FrameTag::ItemDelivery, Bytes::from_static(&[10, b'a', b'b']));
        assert!(frame.parse_addressed().is_err());
    }
}
