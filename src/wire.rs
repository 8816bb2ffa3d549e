//! PTP-over-USB wire codec (C1): container framing, UTF-16LE strings, and
//! the tagged `PtpValue` union over PTP data-type codes. §4.1, §6.1.
//!
//! Every decoder here takes untrusted device bytes and must never panic,
//! read out of bounds, or allocate proportional to an attacker-controlled
//! length without first checking enough input remains.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Size in bytes of a PTP container header: `length(4) + kind(2) + code(2) + txid(4)`.
pub const HEADER_SIZE: usize = 12;

/// Maximum number of parameters a Command container may carry (§4.1).
pub const MAX_COMMAND_PARAMS: usize = 5;

/// PTP container kind (offset 4, 2 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum ContainerKind {
    Command = 1,
    Data = 2,
    Response = 3,
    Event = 4,
}

/// A decoded 12-byte PTP container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtpHeader {
    pub length: u32,
    pub kind: ContainerKind,
    pub code: u16,
    pub txid: u32,
}

/// Encodes a Command container: header plus up to [`MAX_COMMAND_PARAMS`]
/// little-endian `u32` parameters.
///
/// # Panics
///
/// Panics if `params.len() > 5`. This is a caller bug (an internal
/// precondition violated by code in this crate, never by device bytes), not
/// a recoverable protocol condition, so it is not part of the `MtpError`
/// taxonomy.
pub fn encode_command(opcode: u16, txid: u32, params: &[u32]) -> Vec<u8> {
    assert!(
        params.len() <= MAX_COMMAND_PARAMS,
        "PTP command carries at most {MAX_COMMAND_PARAMS} parameters, got {}",
        params.len()
    );
    let length = (HEADER_SIZE + params.len() * 4) as u32;
    let mut buf = Vec::with_capacity(length as usize);
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&(ContainerKind::Command as u16).to_le_bytes());
    buf.extend_from_slice(&opcode.to_le_bytes());
    buf.extend_from_slice(&txid.to_le_bytes());
    for p in params {
        buf.extend_from_slice(&p.to_le_bytes());
    }
    buf
}

/// Encodes just the 12-byte header of a Data container; the caller streams
/// the payload separately (§4.1).
pub fn encode_data_header(total_length: u32, code: u16, txid: u32) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0..4].copy_from_slice(&total_length.to_le_bytes());
    buf[4..6].copy_from_slice(&(ContainerKind::Data as u16).to_le_bytes());
    buf[6..8].copy_from_slice(&code.to_le_bytes());
    buf[8..12].copy_from_slice(&txid.to_le_bytes());
    buf
}

/// Decodes a 12-byte container header. Returns `None` on short input or an
/// unrecognised `kind`; never panics.
pub fn decode_header(data: &[u8]) -> Option<PtpHeader> {
    if data.len() < HEADER_SIZE {
        return None;
    }
    let length = u32::from_le_bytes(data[0..4].try_into().ok()?);
    let kind_raw = u16::from_le_bytes(data[4..6].try_into().ok()?);
    let code = u16::from_le_bytes(data[6..8].try_into().ok()?);
    let txid = u32::from_le_bytes(data[8..12].try_into().ok()?);
    let kind = ContainerKind::from_u16(kind_raw)?;
    Some(PtpHeader {
        length,
        kind,
        code,
        txid,
    })
}

/// Maximum number of UTF-16 code units a PTP string may hold, not counting
/// the terminating NUL (the length byte is a `u8` including the NUL, so
/// `255 - 1`).
pub const MAX_STRING_UNITS: usize = 254;

/// Encodes a UTF-8 string as a length-prefixed UTF-16LE PTP string,
/// truncating to [`MAX_STRING_UNITS`] code units before appending the NUL
/// terminator (§4.1, §8 property 2).
pub fn encode_string(s: &str) -> Vec<u8> {
    let mut units: Vec<u16> = s.encode_utf16().collect();
    if units.len() > MAX_STRING_UNITS {
        units.truncate(MAX_STRING_UNITS);
    }
    if units.is_empty() {
        return vec![0u8];
    }
    units.push(0); // NUL terminator
    let len_byte = units.len() as u8; // <= 255
    let mut buf = Vec::with_capacity(1 + units.len() * 2);
    buf.push(len_byte);
    for u in units {
        buf.extend_from_slice(&u.to_le_bytes());
    }
    buf
}

/// Parses a length-prefixed UTF-16LE PTP string. Returns `(string,
/// bytes_consumed)`. Returns `None` if `data` is shorter than the length
/// byte declares; never panics.
pub fn parse_string(data: &[u8]) -> Option<(String, usize)> {
    let len = *data.first()? as usize;
    if len == 0 {
        return Some((String::new(), 1));
    }
    let byte_len = len * 2;
    if data.len() < 1 + byte_len {
        return None;
    }
    let mut units = Vec::with_capacity(len);
    for chunk in data[1..1 + byte_len].chunks_exact(2) {
        units.push(u16::from_le_bytes([chunk[0], chunk[1]]));
    }
    // Strip a single trailing NUL, if present, per §4.1.
    if units.last() == Some(&0) {
        units.pop();
    }
    let s = String::from_utf16_lossy(&units);
    Some((s, 1 + byte_len))
}

/// A tagged union over the PTP data-type codes (§3 `PtpValue`, Design Note
/// in §9: "avoid runtime-typed values ... use an enum with a fixed set of
/// variants").
#[derive(Debug, Clone, PartialEq)]
pub enum PtpValue {
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Int128(i128),
    UInt128(u128),
    String(String),
    Array(Vec<PtpValue>),
}

/// Standard PTP data-type codes (USB Still Image Capture spec table 3).
pub mod data_type {
    pub const UNDEFINED: u16 = 0x0000;
    pub const INT8: u16 = 0x0001;
    pub const UINT8: u16 = 0x0002;
    pub const INT16: u16 = 0x0003;
    pub const UINT16: u16 = 0x0004;
    pub const INT32: u16 = 0x0005;
    pub const UINT32: u16 = 0x0006;
    pub const INT64: u16 = 0x0007;
    pub const UINT64: u16 = 0x0008;
    pub const INT128: u16 = 0x0009;
    pub const UINT128: u16 = 0x000A;
    /// Set when `data_type_code` names an array of the scalar type with
    /// this bit cleared. `STRING` is the one code in the `0x4xxx` range
    /// that is *not* an array and must be checked first.
    pub const ARRAY_BIT: u16 = 0x4000;
    pub const STRING: u16 = 0xFFFF;
}

/// A byte cursor used by the dataset decoders (C8) and by [`read_value`].
/// All reads are bounds-checked and return `None` rather than panicking.
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        Some(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Option<i8> {
        Some(self.take(1)?[0] as i8)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        Some(u16::from_le_bytes(self.take(2)?.try_into().ok()?))
    }

    pub fn read_i16(&mut self) -> Option<i16> {
        Some(i16::from_le_bytes(self.take(2)?.try_into().ok()?))
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.take(4)?.try_into().ok()?))
    }

    pub fn read_i32(&mut self) -> Option<i32> {
        Some(i32::from_le_bytes(self.take(4)?.try_into().ok()?))
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.take(8)?.try_into().ok()?))
    }

    pub fn read_i64(&mut self) -> Option<i64> {
        Some(i64::from_le_bytes(self.take(8)?.try_into().ok()?))
    }

    pub fn read_u128(&mut self) -> Option<u128> {
        Some(u128::from_le_bytes(self.take(16)?.try_into().ok()?))
    }

    pub fn read_i128(&mut self) -> Option<i128> {
        Some(i128::from_le_bytes(self.take(16)?.try_into().ok()?))
    }

    /// Reads a PTP string at the current position, advancing past it.
    pub fn read_string(&mut self) -> Option<String> {
        let (s, consumed) = parse_string(&self.data[self.pos..])?;
        self.pos += consumed;
        Some(s)
    }

    /// Reads a `u32 count` followed by `count` `u32` elements, bounds
    /// checked against the remaining input before allocating (§4.8).
    pub fn read_u32_array(&mut self) -> Option<Vec<u32>> {
        let count = self.read_u32()? as usize;
        if self.remaining() < count.checked_mul(4)? {
            return None;
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_u32()?);
        }
        Some(out)
    }

    /// Reads a `u32 count` followed by `count` `u16` elements.
    pub fn read_u16_array(&mut self) -> Option<Vec<u16>> {
        let count = self.read_u32()? as usize;
        if self.remaining() < count.checked_mul(2)? {
            return None;
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_u16()?);
        }
        Some(out)
    }
}

/// Decodes a single [`PtpValue`] of the given PTP data-type code from
/// `cursor`. `0xFFFF` (string) is special-cased before the array-bit test,
/// since `0xFFFF & 0x4000 != 0` would otherwise misclassify it (§4.1 edge
/// case). Returns `None` on short input or an unrecognised scalar type.
pub fn read_value(cursor: &mut Cursor, data_type_code: u16) -> Option<PtpValue> {
    use data_type::*;

    if data_type_code == STRING {
        return cursor.read_string().map(PtpValue::String);
    }

    if data_type_code & ARRAY_BIT != 0 {
        let elem_type = data_type_code & !ARRAY_BIT;
        let count = cursor.read_u32()? as usize;
        // Reject counts that cannot possibly fit in what remains, without
        // allocating first.
        let min_elem_size = scalar_size(elem_type)?;
        if cursor.remaining() < count.checked_mul(min_elem_size)? {
            return None;
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(read_scalar(cursor, elem_type)?);
        }
        return Some(PtpValue::Array(items));
    }

    read_scalar(cursor, data_type_code)
}

fn scalar_size(code: u16) -> Option<usize> {
    use data_type::*;
    Some(match code {
        INT8 | UINT8 => 1,
        INT16 | UINT16 => 2,
        INT32 | UINT32 => 4,
        INT64 | UINT64 => 8,
        INT128 | UINT128 => 16,
        _ => return None,
    })
}

fn read_scalar(cursor: &mut Cursor, code: u16) -> Option<PtpValue> {
    use data_type::*;
    Some(match code {
        INT8 => PtpValue::Int8(cursor.read_i8()?),
        UINT8 => PtpValue::UInt8(cursor.read_u8()?),
        INT16 => PtpValue::Int16(cursor.read_i16()?),
        UINT16 => PtpValue::UInt16(cursor.read_u16()?),
        INT32 => PtpValue::Int32(cursor.read_i32()?),
        UINT32 => PtpValue::UInt32(cursor.read_u32()?),
        INT64 => PtpValue::Int64(cursor.read_i64()?),
        UINT64 => PtpValue::UInt64(cursor.read_u64()?),
        INT128 => PtpValue::Int128(cursor.read_i128()?),
        UINT128 => PtpValue::UInt128(cursor.read_u128()?),
        UNDEFINED => return None,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let cmd = encode_command(0x1001, 7, &[1, 2, 3]);
        let hdr = decode_header(&cmd).unwrap();
        assert_eq!(hdr.length, 12 + 12);
        assert_eq!(hdr.kind, ContainerKind::Command);
        assert_eq!(hdr.code, 0x1001);
        assert_eq!(hdr.txid, 7);
    }

    #[test]
    fn decode_header_rejects_short_input() {
        assert!(decode_header(&[0u8; 11]).is_none());
        assert!(decode_header(&[]).is_none());
    }

    #[test]
    #[should_panic]
    fn encode_command_rejects_too_many_params() {
        encode_command(0x1001, 1, &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn string_round_trip_short() {
        let encoded = encode_string("Pixel 7");
        let (s, consumed) = parse_string(&encoded).unwrap();
        assert_eq!(s, "Pixel 7");
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn string_round_trip_empty() {
        let encoded = encode_string("");
        assert_eq!(encoded, vec![0u8]);
        let (s, consumed) = parse_string(&encoded).unwrap();
        assert_eq!(s, "");
        assert_eq!(consumed, 1);
    }

    #[test]
    fn string_truncates_to_254_units() {
        let long = "x".repeat(300);
        let encoded = encode_string(&long);
        // length byte counts 254 units + NUL = 255
        assert_eq!(encoded[0], 255);
        let (s, _) = parse_string(&encoded).unwrap();
        assert_eq!(s.chars().count(), 254);
    }

    #[test]
    fn parse_string_rejects_short_input() {
        // length byte says 5 units, but only 2 bytes follow
        assert!(parse_string(&[5, 0, 0]).is_none());
    }

    #[test]
    fn read_value_string_special_case() {
        let encoded = encode_string("hi");
        let mut cur = Cursor::new(&encoded);
        let v = read_value(&mut cur, data_type::STRING).unwrap();
        assert_eq!(v, PtpValue::String("hi".into()));
    }

    #[test]
    fn read_value_array_of_u32() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes());
        let mut cur = Cursor::new(&buf);
        let v = read_value(&mut cur, data_type::ARRAY_BIT | data_type::UINT32).unwrap();
        match v {
            PtpValue::Array(items) => assert_eq!(items.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn read_value_array_rejects_oversized_count() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_le_bytes());
        let mut cur = Cursor::new(&buf);
        assert!(read_value(&mut cur, data_type::ARRAY_BIT | data_type::UINT32).is_none());
    }

    #[test]
    fn cursor_never_panics_on_empty() {
        let mut cur = Cursor::new(&[]);
        assert!(cur.read_u32().is_none());
        assert!(cur.read_string().is_none());
        assert!(cur.read_u32_array().is_none());
    }

    proptest::proptest! {
        #[test]
        fn prop_header_round_trip(length: u32, kind_raw in 1u16..=4u16, code: u16, txid: u32) {
            let mut buf = Vec::with_capacity(12);
            buf.extend_from_slice(&length.to_le_bytes());
            buf.extend_from_slice(&kind_raw.to_le_bytes());
            buf.extend_from_slice(&code.to_le_bytes());
            buf.extend_from_slice(&txid.to_le_bytes());
            let hdr = decode_header(&buf).unwrap();
            prop_assert_eq!(hdr.length, length);
            prop_assert_eq!(hdr.code, code);
            prop_assert_eq!(hdr.txid, txid);
        }

        #[test]
        fn prop_string_round_trip(s in "\\PC{0,64}") {
            let units = s.encode_utf16().count();
            let encoded = encode_string(&s);
            let (decoded, _) = parse_string(&encoded).unwrap();
            if units < MAX_STRING_UNITS {
                prop_assert_eq!(decoded, s);
            } else {
                let expected: String = s.chars().take(MAX_STRING_UNITS).collect();
                // utf16 units vs chars can diverge for surrogate pairs; only
                // assert the no-panic/consumes-everything properties for
                // strings we can't cheaply pin down 1:1 with `MAX_STRING_UNITS`.
                let _ = expected;
            }
        }

        #[test]
        fn prop_codec_safety_header(bytes in proptest::collection::vec(proptest::num::u8::ANY, 0..1024)) {
            // Must never panic, regardless of content.
            let _ = decode_header(&bytes);
        }

        #[test]
        fn prop_codec_safety_string(bytes in proptest::collection::vec(proptest::num::u8::ANY, 0..1024)) {
            if let Some((_, consumed)) = parse_string(&bytes) {
                prop_assert!(consumed <= bytes.len());
            }
        }
    }
}
