//! VP8 frame tag parser
//!
//! Every VP8 frame starts with a 3-byte little-endian frame tag. Keyframes
//! follow it with a start code and the frame dimensions, 10 bytes in total.
//!
//! ```text
//!  bit 0      inverted keyframe flag
//!  bits 1-2   version
//!  bit 3      experimental
//!  bit 4      show frame
//!  bits 5-23  size of the first data partition
//! ```

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Cursor;

use crate::error::{Result, SfuError};

const KEYFRAME_START_CODE: u32 = 0x9d_01_2a;
const INTERFRAME_TAG_LEN: usize = 3;
const KEYFRAME_TAG_LEN: usize = 10;

/// Frame dimensions carried by keyframes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub width: u16,
    pub width_scale: u8,
    pub height: u16,
    pub height_scale: u8,
}

/// Decoded frame tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameTag {
    pub keyframe: bool,
    pub version: u8,
    pub is_experimental: bool,
    pub show_frame: bool,
    pub part_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

impl FrameTag {
    /// Parse the tag at the start of `data`. Trailing bytes are ignored.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(data);
        let tag = reader.read_u24::<LittleEndian>().map_err(truncated)?;

        let keyframe = tag & 0x1 == 0;
        let mut frame = Self {
            keyframe,
            version: ((tag >> 1) & 0x3) as u8,
            is_experimental: (tag >> 3) & 0x1 == 1,
            show_frame: (tag >> 4) & 0x1 == 1,
            part_size: (tag >> 5) & 0x7_ffff,
            resolution: None,
        };

        if keyframe {
            let start_code = reader.read_u24::<BigEndian>().map_err(truncated)?;
            if start_code != KEYFRAME_START_CODE {
                return Err(SfuError::InvalidBitstream(format!(
                    "unsupported start code {start_code:#08x}"
                )));
            }

            let horizontal = reader.read_u16::<LittleEndian>().map_err(truncated)?;
            let vertical = reader.read_u16::<LittleEndian>().map_err(truncated)?;
            frame.resolution = Some(Resolution {
                width: horizontal & 0x3fff,
                width_scale: (horizontal >> 14) as u8,
                height: vertical & 0x3fff,
                height_scale: (vertical >> 14) as u8,
            });
        }

        Ok(frame)
    }

    /// Number of bytes the tag occupies
    #[must_use]
    pub const fn tag_len(&self) -> usize {
        if self.keyframe {
            KEYFRAME_TAG_LEN
        } else {
            INTERFRAME_TAG_LEN
        }
    }

    /// JSON view used by diagnostics
    #[must_use]
    pub fn dump(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Encode the tag back into its wire form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.tag_len());
        let tag = u32::from(!self.keyframe)
            | (u32::from(self.version & 0x3) << 1)
            | (u32::from(self.is_experimental) << 3)
            | (u32::from(self.show_frame) << 4)
            | ((self.part_size & 0x7_ffff) << 5);
        out.write_u24::<LittleEndian>(tag)?;

        if self.keyframe {
            let resolution = self.resolution.ok_or_else(|| {
                SfuError::InvalidBitstream("keyframe without resolution".to_string())
            })?;
            out.write_u24::<BigEndian>(KEYFRAME_START_CODE)?;
            out.write_u16::<LittleEndian>(
                (resolution.width & 0x3fff) | (u16::from(resolution.width_scale & 0x3) << 14),
            )?;
            out.write_u16::<LittleEndian>(
                (resolution.height & 0x3fff) | (u16::from(resolution.height_scale & 0x3) << 14),
            )?;
        }

        Ok(out)
    }
}

fn truncated(_: std::io::Error) -> SfuError {
    SfuError::InvalidBitstream("truncated frame tag".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_keyframe() {
        let data = [0x90, 0x18, 0x06, 0x9d, 0x01, 0x2a, 0x00, 0x05, 0xd0, 0x02];
        let tag = FrameTag::parse(&data).unwrap();

        assert!(tag.keyframe);
        assert_eq!(tag.version, 0);
        assert!(!tag.is_experimental);
        assert!(tag.show_frame);
        assert_eq!(tag.part_size, 12484);
        assert_eq!(
            tag.resolution,
            Some(Resolution {
                width: 1280,
                width_scale: 0,
                height: 720,
                height_scale: 0,
            })
        );
    }

    #[test]
    fn test_parse_interframe() {
        let tag = FrameTag::parse(&[0xb1, 0x1b, 0x02]).unwrap();

        assert!(!tag.keyframe);
        assert_eq!(tag.version, 0);
        assert!(tag.show_frame);
        assert_eq!(tag.part_size, 4317);
        assert!(tag.resolution.is_none());
        assert_eq!(tag.tag_len(), 3);
    }

    #[test]
    fn test_dump() {
        let tag = FrameTag::parse(&[0xb1, 0x1b, 0x02]).unwrap();
        assert_eq!(
            tag.dump(),
            json!({
                "keyframe": false,
                "version": 0,
                "isExperimental": false,
                "showFrame": true,
                "partSize": 4317,
            })
        );

        let tag = FrameTag::parse(&[0x90, 0x18, 0x06, 0x9d, 0x01, 0x2a, 0x00, 0x05, 0xd0, 0x02])
            .unwrap();
        assert_eq!(tag.dump()["resolution"]["width"], 1280);
        assert_eq!(tag.dump()["resolution"]["heightScale"], 0);
    }

    #[test]
    fn test_keyframe_round_trip() {
        let tag = FrameTag {
            keyframe: true,
            version: 0,
            is_experimental: false,
            show_frame: true,
            part_size: 2048,
            resolution: Some(Resolution {
                width: 640,
                width_scale: 0,
                height: 480,
                height_scale: 0,
            }),
        };

        let bytes = tag.to_bytes().unwrap();
        assert_eq!(bytes.len(), 10);
        assert_eq!(FrameTag::parse(&bytes).unwrap(), tag);
    }

    #[test]
    fn test_invalid_bitstream() {
        let err = FrameTag::parse(&[0x90, 0x18, 0x06, 0x00, 0x00, 0x00, 0x00, 0x05, 0xd0, 0x02])
            .unwrap_err();
        assert!(matches!(err, SfuError::InvalidBitstream(_)));

        // keyframe tag cut short before the dimensions
        let err = FrameTag::parse(&[0x90, 0x18, 0x06, 0x9d, 0x01]).unwrap_err();
        assert!(matches!(err, SfuError::InvalidBitstream(_)));

        assert!(FrameTag::parse(&[0xb1]).is_err());
    }
}
