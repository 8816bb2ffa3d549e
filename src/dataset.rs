//! Fuzz-safe dataset parsers (C8, §4.8): `DeviceInfo`, `StorageInfo`,
//! `ObjectInfo`, and `PropList`, decoded from the Data phase of their
//! respective opcodes. Every decoder here must never read past the end of
//! its input, never allocate proportional to an untrusted count without
//! first checking enough bytes remain, and return a "parse failed" error
//! instead of propagating partial state.

use crate::error::CodecError;
use crate::wire::{Cursor, PtpValue};

fn truncated(cursor: &Cursor) -> CodecError {
    CodecError::Truncated { at: cursor.position() }
}

/// Parsed result of opcode `0x1001`'s Data phase (§3 `DeviceInfo`).
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub standard_version: u16,
    pub vendor_extension_id: u32,
    pub vendor_extension_version: u16,
    pub vendor_extension_desc: String,
    pub functional_mode: u16,
    pub operations_supported: Vec<u16>,
    pub events_supported: Vec<u16>,
    pub device_properties_supported: Vec<u16>,
    pub capture_formats: Vec<u16>,
    pub playback_formats: Vec<u16>,
    pub manufacturer: String,
    pub model: String,
    pub device_version: String,
    pub serial_number: String,
}

impl DeviceInfo {
    pub fn decode(data: &[u8]) -> Result<DeviceInfo, CodecError> {
        let mut c = Cursor::new(data);
        Ok(DeviceInfo {
            standard_version: c.read_u16().ok_or_else(|| truncated(&c))?,
            vendor_extension_id: c.read_u32().ok_or_else(|| truncated(&c))?,
            vendor_extension_version: c.read_u16().ok_or_else(|| truncated(&c))?,
            vendor_extension_desc: c.read_string().ok_or_else(|| truncated(&c))?,
            functional_mode: c.read_u16().ok_or_else(|| truncated(&c))?,
            operations_supported: c.read_u16_array().ok_or_else(|| truncated(&c))?,
            events_supported: c.read_u16_array().ok_or_else(|| truncated(&c))?,
            device_properties_supported: c.read_u16_array().ok_or_else(|| truncated(&c))?,
            capture_formats: c.read_u16_array().ok_or_else(|| truncated(&c))?,
            playback_formats: c.read_u16_array().ok_or_else(|| truncated(&c))?,
            manufacturer: c.read_string().ok_or_else(|| truncated(&c))?,
            model: c.read_string().ok_or_else(|| truncated(&c))?,
            device_version: c.read_string().ok_or_else(|| truncated(&c))?,
            serial_number: c.read_string().ok_or_else(|| truncated(&c))?,
        })
    }
}

/// Parsed result of opcode `0x1005`'s Data phase (§3 `StorageInfo`).
#[derive(Debug, Clone, PartialEq)]
pub struct StorageInfo {
    pub storage_type: u16,
    pub filesystem_type: u16,
    pub access_capability: u16,
    pub max_capacity: u64,
    pub free_space_bytes: u64,
    pub free_space_images: u32,
    pub storage_description: String,
    pub volume_label: String,
}

impl StorageInfo {
    pub fn decode(data: &[u8]) -> Result<StorageInfo, CodecError> {
        let mut c = Cursor::new(data);
        Ok(StorageInfo {
            storage_type: c.read_u16().ok_or_else(|| truncated(&c))?,
            filesystem_type: c.read_u16().ok_or_else(|| truncated(&c))?,
            access_capability: c.read_u16().ok_or_else(|| truncated(&c))?,
            max_capacity: c.read_u64().ok_or_else(|| truncated(&c))?,
            free_space_bytes: c.read_u64().ok_or_else(|| truncated(&c))?,
            free_space_images: c.read_u32().ok_or_else(|| truncated(&c))?,
            storage_description: c.read_string().ok_or_else(|| truncated(&c))?,
            volume_label: c.read_string().ok_or_else(|| truncated(&c))?,
        })
    }
}

/// Parsed result of opcode `0x1008`'s Data phase (§3 `ObjectInfo`).
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub storage_id: u32,
    pub object_format: u16,
    pub protection_status: u16,
    pub object_compressed_size: u32,
    pub thumb_format: u16,
    pub thumb_compressed_size: u32,
    pub thumb_pix_width: u32,
    pub thumb_pix_height: u32,
    pub image_pix_width: u32,
    pub image_pix_height: u32,
    pub image_bit_depth: u32,
    pub parent_object: u32,
    pub association_type: u16,
    pub association_desc: u32,
    pub sequence_number: u32,
    pub filename: String,
    pub capture_date: String,
    pub modification_date: String,
    pub keywords: String,
}

impl ObjectInfo {
    pub fn decode(data: &[u8]) -> Result<ObjectInfo, CodecError> {
        let mut c = Cursor::new(data);
        Ok(ObjectInfo {
            storage_id: c.read_u32().ok_or_else(|| truncated(&c))?,
            object_format: c.read_u16().ok_or_else(|| truncated(&c))?,
            protection_status: c.read_u16().ok_or_else(|| truncated(&c))?,
            object_compressed_size: c.read_u32().ok_or_else(|| truncated(&c))?,
            thumb_format: c.read_u16().ok_or_else(|| truncated(&c))?,
            thumb_compressed_size: c.read_u32().ok_or_else(|| truncated(&c))?,
            thumb_pix_width: c.read_u32().ok_or_else(|| truncated(&c))?,
            thumb_pix_height: c.read_u32().ok_or_else(|| truncated(&c))?,
            image_pix_width: c.read_u32().ok_or_else(|| truncated(&c))?,
            image_pix_height: c.read_u32().ok_or_else(|| truncated(&c))?,
            image_bit_depth: c.read_u32().ok_or_else(|| truncated(&c))?,
            parent_object: c.read_u32().ok_or_else(|| truncated(&c))?,
            association_type: c.read_u16().ok_or_else(|| truncated(&c))?,
            association_desc: c.read_u32().ok_or_else(|| truncated(&c))?,
            sequence_number: c.read_u32().ok_or_else(|| truncated(&c))?,
            filename: c.read_string().ok_or_else(|| truncated(&c))?,
            capture_date: c.read_string().ok_or_else(|| truncated(&c))?,
            modification_date: c.read_string().ok_or_else(|| truncated(&c))?,
            keywords: c.read_string().ok_or_else(|| truncated(&c))?,
        })
    }

    /// Encodes back to wire bytes, used by `send_object_info` (§4.6).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.storage_id.to_le_bytes());
        buf.extend_from_slice(&self.object_format.to_le_bytes());
        buf.extend_from_slice(&self.protection_status.to_le_bytes());
        buf.extend_from_slice(&self.object_compressed_size.to_le_bytes());
        buf.extend_from_slice(&self.thumb_format.to_le_bytes());
        buf.extend_from_slice(&self.thumb_compressed_size.to_le_bytes());
        buf.extend_from_slice(&self.thumb_pix_width.to_le_bytes());
        buf.extend_from_slice(&self.thumb_pix_height.to_le_bytes());
        buf.extend_from_slice(&self.image_pix_width.to_le_bytes());
        buf.extend_from_slice(&self.image_pix_height.to_le_bytes());
        buf.extend_from_slice(&self.image_bit_depth.to_le_bytes());
        buf.extend_from_slice(&self.parent_object.to_le_bytes());
        buf.extend_from_slice(&self.association_type.to_le_bytes());
        buf.extend_from_slice(&self.association_desc.to_le_bytes());
        buf.extend_from_slice(&self.sequence_number.to_le_bytes());
        buf.extend_from_slice(&crate::wire::encode_string(&self.filename));
        buf.extend_from_slice(&crate::wire::encode_string(&self.capture_date));
        buf.extend_from_slice(&crate::wire::encode_string(&self.modification_date));
        buf.extend_from_slice(&crate::wire::encode_string(&self.keywords));
        buf
    }
}

/// One entry of a `GetObjectPropList` response (§3 `PropList entry`).
#[derive(Debug, Clone, PartialEq)]
pub struct PropListEntry {
    pub object_handle: u32,
    pub property_code: u16,
    pub data_type: u16,
    pub value: PtpValue,
}

/// `u32 count` followed by `count` [`PropListEntry`] records (§3, §4.8).
pub fn decode_prop_list(data: &[u8]) -> Result<Vec<PropListEntry>, CodecError> {
    let mut c = Cursor::new(data);
    let count = c.read_u32().ok_or_else(|| truncated(&c))? as usize;
    let mut out = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let object_handle = c.read_u32().ok_or_else(|| truncated(&c))?;
        let property_code = c.read_u16().ok_or_else(|| truncated(&c))?;
        let data_type = c.read_u16().ok_or_else(|| truncated(&c))?;
        let value = crate::wire::read_value(&mut c, data_type).ok_or_else(|| truncated(&c))?;
        out.push(PropListEntry {
            object_handle,
            property_code,
            data_type,
            value,
        });
    }
    Ok(out)
}

/// `u32 count` followed by `count` storage-id words (§4.6 `get_storage_ids`).
pub fn decode_storage_ids(data: &[u8]) -> Result<Vec<u32>, CodecError> {
    let mut c = Cursor::new(data);
    c.read_u32_array().ok_or_else(|| truncated(&c))
}

/// `u32 count` followed by `count` object handles (§4.6 `get_object_handles`).
pub fn decode_object_handles(data: &[u8]) -> Result<Vec<u32>, CodecError> {
    let mut c = Cursor::new(data);
    c.read_u32_array().ok_or_else(|| truncated(&c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode_string;

    fn sample_device_info_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&100u16.to_le_bytes()); // standard_version
        buf.extend_from_slice(&6u32.to_le_bytes()); // vendor_extension_id
        buf.extend_from_slice(&100u16.to_le_bytes()); // vendor_extension_version
        buf.extend_from_slice(&encode_string("")); // vendor_extension_desc
        buf.extend_from_slice(&0u16.to_le_bytes()); // functional_mode
        buf.extend_from_slice(&0u32.to_le_bytes()); // operations_supported count=0
        buf.extend_from_slice(&0u32.to_le_bytes()); // events_supported count=0
        buf.extend_from_slice(&0u32.to_le_bytes()); // device_properties_supported count=0
        buf.extend_from_slice(&0u32.to_le_bytes()); // capture_formats count=0
        buf.extend_from_slice(&0u32.to_le_bytes()); // playback_formats count=0
        buf.extend_from_slice(&encode_string("Google"));
        buf.extend_from_slice(&encode_string("Pixel 7"));
        buf.extend_from_slice(&encode_string("1.0"));
        buf.extend_from_slice(&encode_string("ABC123"));
        buf
    }

    #[test]
    fn decodes_s1_device_info() {
        let info = DeviceInfo::decode(&sample_device_info_bytes()).unwrap();
        assert_eq!(info.manufacturer, "Google");
        assert_eq!(info.model, "Pixel 7");
        assert_eq!(info.device_version, "1.0");
        assert_eq!(info.serial_number, "ABC123");
    }

    #[test]
    fn device_info_reports_truncated() {
        let full = sample_device_info_bytes();
        let err = DeviceInfo::decode(&full[..full.len() - 3]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn object_info_round_trip() {
        let info = ObjectInfo {
            storage_id: 0x00010001,
            object_format: 0x3801,
            protection_status: 0,
            object_compressed_size: 1234,
            thumb_format: 0,
            thumb_compressed_size: 0,
            thumb_pix_width: 0,
            thumb_pix_height: 0,
            image_pix_width: 1920,
            image_pix_height: 1080,
            image_bit_depth: 24,
            parent_object: 0,
            association_type: 0,
            association_desc: 0,
            sequence_number: 0,
            filename: "IMG_0001.JPG".into(),
            capture_date: "20240101T000000".into(),
            modification_date: "20240101T000000".into(),
            keywords: "".into(),
        };
        let encoded = info.encode();
        let decoded = ObjectInfo::decode(&encoded).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn prop_list_rejects_huge_count_without_allocating() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = decode_prop_list(&buf).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn fuzz_corpus_never_panics() {
        // Deterministic pseudo-random bytes, not proptest, to keep this
        // test fast and dependency-free; proptest covers the property in
        // `wire.rs` for the codec primitives these decoders are built on.
        let mut state: u32 = 0x1234_5678;
        for len in 0..256usize {
            let mut buf = vec![0u8; len];
            for b in buf.iter_mut() {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                *b = (state >> 24) as u8;
            }
            let _ = DeviceInfo::decode(&buf);
            let _ = StorageInfo::decode(&buf);
            let _ = ObjectInfo::decode(&buf);
            let _ = decode_prop_list(&buf);
            let _ = decode_storage_ids(&buf);
        }
    }
}
