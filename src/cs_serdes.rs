// Wire serialization primitives
//
// Byte order is little-endian throughout:
// - integers and floats: fixed width
// - bool: one byte (0 / 1)
// - string: u32 byte length + UTF-8 bytes
// - sequence (Vec<T>, byte vectors included): u32 element count + elements
// - fixed array [T; N]: N elements, no prefix
// - Duration: i64 nanosecond ticks
// - SystemTime: i64 nanoseconds since the Unix epoch, truncated to microseconds

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cs_error::{CsError, Result};

/// Append-only encoder over a growable buffer.
#[derive(Debug, Default)]
pub struct Serializer {
    buffer: Vec<u8>,
}

impl Serializer {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn write<T: WireType>(&mut self, value: &T) -> &mut Self {
        value.encode(self);
        self
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }
}

/// Cursor-based decoder. Every read checks the remaining length.
#[derive(Debug)]
pub struct Deserializer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Deserializer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn read<T: WireType>(&mut self) -> Result<T> {
        T::decode(self)
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(CsError::protocol(format!(
                "truncated message: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Fails when undecoded bytes are left over.
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(CsError::protocol(format!(
                "{} trailing bytes after message",
                self.remaining()
            )));
        }
        Ok(())
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_len(&mut self) -> Result<usize> {
        let len = u32::decode(self)? as usize;
        // every element is at least one byte, so a larger count can never be satisfied
        if len > self.remaining() {
            return Err(CsError::protocol(format!(
                "length prefix {} exceeds remaining {} bytes",
                len,
                self.remaining()
            )));
        }
        Ok(len)
    }
}

/// Symmetric encode/decode for every type that appears on the wire.
pub trait WireType: Sized {
    fn encode(&self, s: &mut Serializer);
    fn decode(d: &mut Deserializer<'_>) -> Result<Self>;
}

macro_rules! wire_number {
    ($($t:ty),*) => {
        $(
            impl WireType for $t {
                fn encode(&self, s: &mut Serializer) {
                    s.put_slice(&self.to_le_bytes());
                }

                fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
                    Ok(<$t>::from_le_bytes(d.take_array()?))
                }
            }
        )*
    };
}

wire_number!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl WireType for bool {
    fn encode(&self, s: &mut Serializer) {
        (*self as u8).encode(s);
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        match u8::decode(d)? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(CsError::protocol(format!("invalid bool value {}", v))),
        }
    }
}

impl WireType for String {
    fn encode(&self, s: &mut Serializer) {
        (self.len() as u32).encode(s);
        s.put_slice(self.as_bytes());
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        let len = d.read_len()?;
        let bytes = d.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CsError::protocol(format!("invalid utf-8 in string: {}", e)))
    }
}

impl<T: WireType> WireType for Vec<T> {
    fn encode(&self, s: &mut Serializer) {
        (self.len() as u32).encode(s);
        for item in self {
            item.encode(s);
        }
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        let len = d.read_len()?;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(T::decode(d)?);
        }
        Ok(out)
    }
}

impl<T: WireType, const N: usize> WireType for [T; N] {
    fn encode(&self, s: &mut Serializer) {
        for item in self {
            item.encode(s);
        }
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        let mut items = Vec::with_capacity(N);
        for _ in 0..N {
            items.push(T::decode(d)?);
        }
        items
            .try_into()
            .map_err(|_| CsError::protocol("fixed array length mismatch"))
    }
}

impl WireType for Duration {
    fn encode(&self, s: &mut Serializer) {
        let ticks = i64::try_from(self.as_nanos()).unwrap_or(i64::MAX);
        ticks.encode(s);
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        let ticks = i64::decode(d)?;
        if ticks < 0 {
            return Err(CsError::protocol(format!("negative duration {}ns", ticks)));
        }
        Ok(Duration::from_nanos(ticks as u64))
    }
}

impl WireType for SystemTime {
    fn encode(&self, s: &mut Serializer) {
        let nanos: i64 = match self.duration_since(UNIX_EPOCH) {
            Ok(after) => i64::try_from(after.as_micros()).unwrap_or(i64::MAX / 1000) * 1000,
            Err(before) => -(i64::try_from(before.duration().as_micros()).unwrap_or(i64::MAX / 1000) * 1000),
        };
        nanos.encode(s);
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        let nanos = i64::decode(d)?;
        let offset = Duration::from_nanos(nanos.unsigned_abs());
        let time = if nanos >= 0 {
            UNIX_EPOCH.checked_add(offset)
        } else {
            UNIX_EPOCH.checked_sub(offset)
        };
        time.ok_or_else(|| CsError::protocol(format!("time point {}ns out of range", nanos)))
    }
}

/// Encode a single value into a fresh buffer.
pub fn to_bytes<T: WireType>(value: &T) -> Vec<u8> {
    let mut s = Serializer::new();
    value.encode(&mut s);
    s.finish()
}

/// Decode a single value that must span the whole buffer.
pub fn from_bytes<T: WireType>(bytes: &[u8]) -> Result<T> {
    let mut d = Deserializer::new(bytes);
    let value = T::decode(&mut d)?;
    d.finish()?;
    Ok(value)
}
