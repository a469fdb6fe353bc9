//! Byte-level JDWP encoding: packet headers, ids sized per VM, and values.

use super::types::{JdwpError, JdwpIdSizes, JdwpValue, Result};
use crate::{Location, ObjectId, ReferenceTypeId};

pub const HANDSHAKE: &[u8] = b"JDWP-Handshake";
/// length (4) + id (4) + flags (1) + command set/command or error code (2).
pub const HEADER_LEN: usize = 11;
pub const FLAG_REPLY: u8 = 0x80;

/// The wire tag for a type signature: its first character.
pub fn signature_to_tag(signature: &str) -> u8 {
    signature.as_bytes().first().copied().unwrap_or(b'V')
}

/// Primitive tags are followed by a fixed-width value; everything else is an object id.
pub fn is_primitive_tag(tag: u8) -> bool {
    matches!(tag, b'Z' | b'B' | b'C' | b'S' | b'I' | b'J' | b'F' | b'D')
}

impl JdwpValue {
    pub fn tag(&self) -> u8 {
        match *self {
            JdwpValue::Boolean(_) => b'Z',
            JdwpValue::Byte(_) => b'B',
            JdwpValue::Char(_) => b'C',
            JdwpValue::Short(_) => b'S',
            JdwpValue::Int(_) => b'I',
            JdwpValue::Long(_) => b'J',
            JdwpValue::Float(_) => b'F',
            JdwpValue::Double(_) => b'D',
            JdwpValue::Object { tag, .. } => tag,
            JdwpValue::Void => b'V',
        }
    }
}

/// Accumulates the body of an outgoing command.
#[derive(Default)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

/// Decodes a reply or event body front to back.
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

macro_rules! big_endian {
    ($($write:ident / $read:ident : $ty:ty),* $(,)?) => {
        impl PacketWriter {
            $(
                pub fn $write(&mut self, v: $ty) {
                    self.buf.extend_from_slice(&v.to_be_bytes());
                }
            )*
        }

        impl PacketReader<'_> {
            $(
                pub fn $read(&mut self) -> Result<$ty> {
                    Ok(<$ty>::from_be_bytes(self.array()?))
                }
            )*
        }
    };
}

big_endian! {
    write_u16 / read_u16: u16,
    write_u32 / read_u32: u32,
    write_i32 / read_i32: i32,
    write_u64 / read_u64: u64,
    write_i64 / read_i64: i64,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(v.into());
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_len(s.len());
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// A `u32` element count followed by each item.
    pub fn write_list<T>(&mut self, items: &[T], mut item: impl FnMut(&mut Self, &T)) {
        self.write_len(items.len());
        for it in items {
            item(self, it);
        }
    }

    fn write_len(&mut self, len: usize) {
        self.write_u32(len as u32);
    }

    /// Keeps the low `size` bytes of `id`.
    pub fn write_id(&mut self, id: u64, size: usize) {
        let size = size.min(8);
        self.buf.extend_from_slice(&id.to_be_bytes()[8 - size..]);
    }

    pub fn write_object_id(&mut self, id: ObjectId, sizes: &JdwpIdSizes) {
        self.write_id(id, sizes.object_id);
    }

    pub fn write_reference_type_id(&mut self, id: ReferenceTypeId, sizes: &JdwpIdSizes) {
        self.write_id(id, sizes.reference_type_id);
    }

    pub fn write_location(&mut self, location: &Location, sizes: &JdwpIdSizes) {
        self.write_u8(location.type_tag);
        self.write_reference_type_id(location.class_id, sizes);
        self.write_id(location.method_id, sizes.method_id);
        self.write_u64(location.index);
    }

    pub fn write_untagged_value(&mut self, value: &JdwpValue, sizes: &JdwpIdSizes) {
        match *value {
            JdwpValue::Boolean(v) => self.write_bool(v),
            JdwpValue::Byte(v) => self.write_u8(v as u8),
            JdwpValue::Char(v) => self.write_u16(v),
            JdwpValue::Short(v) => self.write_u16(v as u16),
            JdwpValue::Int(v) => self.write_i32(v),
            JdwpValue::Long(v) => self.write_i64(v),
            JdwpValue::Float(v) => self.write_u32(v.to_bits()),
            JdwpValue::Double(v) => self.write_u64(v.to_bits()),
            JdwpValue::Object { id, .. } => self.write_object_id(id, sizes),
            JdwpValue::Void => {}
        }
    }

    pub fn write_tagged_value(&mut self, value: &JdwpValue, sizes: &JdwpIdSizes) {
        self.write_u8(value.tag());
        self.write_untagged_value(value, sizes);
    }
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len());
        let Some(end) = end else {
            return Err(JdwpError::Protocol(format!(
                "truncated packet: wanted {n} bytes at offset {} of {}",
                self.pos,
                self.buf.len()
            )));
        };
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let [b] = self.array()?;
        Ok(b)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        self.read_u8().map(|b| b != 0)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|err| JdwpError::Protocol(format!("string is not utf-8: {err}")))
    }

    /// Reads a `u32` element count, then that many items.
    pub fn read_list<T>(&mut self, mut item: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let count = self.read_u32()? as usize;
        // The count comes off the wire; don't trust it for the allocation.
        let mut items = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            items.push(item(self)?);
        }
        Ok(items)
    }

    pub fn read_id(&mut self, size: usize) -> Result<u64> {
        if !(1..=8).contains(&size) {
            return Err(JdwpError::Protocol(format!("unsupported id size {size}")));
        }
        let mut be = [0u8; 8];
        be[8 - size..].copy_from_slice(self.bytes(size)?);
        Ok(u64::from_be_bytes(be))
    }

    pub fn read_object_id(&mut self, sizes: &JdwpIdSizes) -> Result<ObjectId> {
        self.read_id(sizes.object_id)
    }

    pub fn read_tagged_object_id(&mut self, sizes: &JdwpIdSizes) -> Result<(u8, ObjectId)> {
        Ok((self.read_u8()?, self.read_object_id(sizes)?))
    }

    pub fn read_reference_type_id(&mut self, sizes: &JdwpIdSizes) -> Result<ReferenceTypeId> {
        self.read_id(sizes.reference_type_id)
    }

    pub fn read_location(&mut self, sizes: &JdwpIdSizes) -> Result<Location> {
        Ok(Location {
            type_tag: self.read_u8()?,
            class_id: self.read_reference_type_id(sizes)?,
            method_id: self.read_id(sizes.method_id)?,
            index: self.read_u64()?,
        })
    }

    pub fn read_value(&mut self, tag: u8, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        Ok(match tag {
            b'Z' => JdwpValue::Boolean(self.read_bool()?),
            b'B' => JdwpValue::Byte(self.read_u8()? as i8),
            b'C' => JdwpValue::Char(self.read_u16()?),
            b'S' => JdwpValue::Short(self.read_u16()? as i16),
            b'I' => JdwpValue::Int(self.read_i32()?),
            b'J' => JdwpValue::Long(self.read_i64()?),
            b'F' => JdwpValue::Float(f32::from_bits(self.read_u32()?)),
            b'D' => JdwpValue::Double(f64::from_bits(self.read_u64()?)),
            b'V' => JdwpValue::Void,
            _ => JdwpValue::Object {
                tag,
                id: self.read_object_id(sizes)?,
            },
        })
    }

    pub fn read_tagged_value(&mut self, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        let tag = self.read_u8()?;
        self.read_value(tag, sizes)
    }
}

fn packet(id: u32, flags: u8, trailer: [u8; 2], body: &[u8]) -> Vec<u8> {
    let length = HEADER_LEN + body.len();
    let mut out = Vec::with_capacity(length);
    out.extend_from_slice(&(length as u32).to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.push(flags);
    out.extend_from_slice(&trailer);
    out.extend_from_slice(body);
    out
}

pub fn encode_command(id: u32, command_set: u8, command: u8, body: &[u8]) -> Vec<u8> {
    packet(id, 0, [command_set, command], body)
}

#[cfg(test)]
pub fn encode_reply(id: u32, error_code: u16, body: &[u8]) -> Vec<u8> {
    packet(id, FLAG_REPLY, error_code.to_be_bytes(), body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(n: usize) -> JdwpIdSizes {
        JdwpIdSizes {
            field_id: n,
            method_id: n,
            object_id: n,
            reference_type_id: n,
            frame_id: n,
        }
    }

    #[test]
    fn ids_use_the_negotiated_width() {
        let mut w = PacketWriter::new();
        w.write_object_id(0x0A0B_0C0D, &uniform(4));
        assert_eq!(w.finish(), vec![0x0A, 0x0B, 0x0C, 0x0D]);

        let mut r = PacketReader::new(&[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(r.read_object_id(&uniform(8)).unwrap(), 0x0102);
        assert_eq!(r.remaining(), 0);
        assert!(PacketReader::new(&[0; 16]).read_id(9).is_err());
    }

    #[test]
    fn object_values_keep_their_tag() {
        let sizes = uniform(8);
        let mut w = PacketWriter::new();
        w.write_tagged_value(&JdwpValue::Object { tag: b't', id: 7 }, &sizes);
        w.write_tagged_value(&JdwpValue::Float(2.5), &sizes);
        let bytes = w.finish();
        assert_eq!(bytes[0], b't');

        let mut r = PacketReader::new(&bytes);
        assert_eq!(
            r.read_tagged_value(&sizes).unwrap(),
            JdwpValue::Object { tag: b't', id: 7 }
        );
        assert_eq!(r.read_tagged_value(&sizes).unwrap(), JdwpValue::Float(2.5));
    }

    #[test]
    fn lists_are_count_prefixed() {
        let mut w = PacketWriter::new();
        w.write_list(&["a", "bc"], |w, s| w.write_string(s));
        let bytes = w.finish();
        assert_eq!(&bytes[..4], &2u32.to_be_bytes());

        let mut r = PacketReader::new(&bytes);
        let items = r.read_list(|r| r.read_string()).unwrap();
        assert_eq!(items, ["a", "bc"]);
    }

    #[test]
    fn truncated_bodies_are_protocol_errors() {
        let mut r = PacketReader::new(&[0, 0, 0, 3, b'x']);
        let err = r.read_string().unwrap_err();
        assert!(matches!(err, JdwpError::Protocol(_)), "unexpected error: {err:?}");

        // A huge count must fail on the first missing item, not on allocation.
        let mut r = PacketReader::new(&[0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(r.read_list(|r| r.read_u8()).is_err());
    }

    #[test]
    fn headers_carry_length_id_and_trailer() {
        let command = encode_command(3, 15, 1, &[0xEE, 0xFF]);
        assert_eq!(command.len(), HEADER_LEN + 2);
        assert_eq!(&command[0..4], &13u32.to_be_bytes());
        assert_eq!(&command[4..8], &3u32.to_be_bytes());
        assert_eq!(&command[8..11], &[0, 15, 1]);

        let reply = encode_reply(3, 502, &[]);
        assert_eq!(reply[8], FLAG_REPLY);
        assert_eq!(u16::from_be_bytes([reply[9], reply[10]]), 502);
    }
}
