//! Binary reader and writer shared by every wire format in the crate.
//!
//! All multi-byte integers are little-endian. The `_be` variants exist only
//! for the big-endian fields of the room-server stream protocol and are
//! named per call site so the byte order of a field is visible where it is
//! written.
//!
//! Strings carry a 7-bit variable-length byte-count prefix followed by the
//! UTF-8 bytes:
//!
//! ```text
//! +-----------------------------+----------------+
//! | byte count (1..=5 bytes)    |  UTF-8 bytes   |
//! | low 7 bits first, high bit  |                |
//! | set while more bytes follow |                |
//! +-----------------------------+----------------+
//! ```

/// Errors produced while reading from a [`Reader`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The buffer ended before the value was complete.
    #[error("unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left in the readable window.
        remaining: usize,
    },

    /// A string field did not hold valid UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// A 7-bit length prefix ran past five bytes.
    #[error("malformed 7-bit length prefix")]
    BadLengthPrefix,

    /// A signed length field was negative.
    #[error("negative length {0}")]
    NegativeLength(i32),
}

// ---------------------------------------------------------------------------
// Struct encodings
// ---------------------------------------------------------------------------

/// Three-component vector, encoded as three `f32` values.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    /// Construct from components.
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Rotation quaternion, encoded as `x, y, z, w` `f32` values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    /// The identity rotation.
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    /// Construct from components.
    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Spawn pose carried by transform-bearing instantiate messages.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Growable output buffer.
///
/// Capacity doubles whenever a write would overflow it; bytes already
/// written are preserved. [`Writer::reset`] rewinds without releasing the
/// allocation, so one writer can be reused for every outgoing message.
#[derive(Debug, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

impl Writer {
    /// Initial capacity of a writer created with [`Writer::new`].
    pub const DEFAULT_CAPACITY: usize = 256;

    /// Create an empty writer.
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create an empty writer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.max(1)),
        }
    }

    /// Discard the written bytes, keeping the allocation.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Number of bytes written since the last reset.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written since the last reset.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Current buffer capacity.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// View of the written bytes. No copy is made.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the writer and return the written bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    fn grow_for(&mut self, additional: usize) {
        let needed = self.buf.len() + additional;
        let mut cap = self.buf.capacity().max(1);
        if needed <= cap {
            return;
        }
        while cap < needed {
            cap *= 2;
        }
        self.buf.reserve_exact(cap - self.buf.len());
    }

    /// Append raw bytes without a length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.grow_for(bytes.len());
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.write_bytes(&[v]);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(u8::from(v));
    }

    pub fn write_i16(&mut self, v: i16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.write_bytes(&v.to_le_bytes());
    }

    /// Big-endian `i32`, used by room-server framing fields.
    pub fn write_i32_be(&mut self, v: i32) {
        self.write_bytes(&v.to_be_bytes());
    }

    /// Write `v` as a 7-bit variable-length integer.
    pub fn write_7bit(&mut self, mut v: u32) {
        while v >= 0x80 {
            self.write_u8((v as u8) | 0x80);
            v >>= 7;
        }
        self.write_u8(v as u8);
    }

    /// Write a string with a 7-bit byte-count prefix.
    pub fn write_string(&mut self, s: &str) {
        self.write_7bit(s.len() as u32);
        self.write_bytes(s.as_bytes());
    }

    pub fn write_vec3(&mut self, v: Vec3) {
        self.write_f32(v.x);
        self.write_f32(v.y);
        self.write_f32(v.z);
    }

    pub fn write_quat(&mut self, q: Quat) {
        self.write_f32(q.x);
        self.write_f32(q.y);
        self.write_f32(q.z);
        self.write_f32(q.w);
    }

    pub fn write_transform(&mut self, t: &Transform) {
        self.write_vec3(t.position);
        self.write_quat(t.rotation);
    }

    /// Reserve `n` zeroed bytes and return their position for a later patch.
    pub fn reserve(&mut self, n: usize) -> usize {
        let pos = self.buf.len();
        self.grow_for(n);
        self.buf.resize(pos + n, 0);
        pos
    }

    /// Overwrite four bytes at `pos` with a little-endian `i32`.
    ///
    /// # Panics
    ///
    /// Panics if `pos + 4` exceeds the written length.
    pub fn patch_i32(&mut self, pos: usize, v: i32) {
        self.buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Overwrite four bytes at `pos` with a big-endian `i32`.
    ///
    /// # Panics
    ///
    /// Panics if `pos + 4` exceeds the written length.
    pub fn patch_i32_be(&mut self, pos: usize, v: i32) {
        self.buf[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }

    /// Overwrite one byte at `pos`.
    pub fn patch_u8(&mut self, pos: usize, v: u8) {
        self.buf[pos] = v;
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Cursor over a borrowed byte window.
///
/// Reads never go past the window set by [`Reader::set_buffer`]; a short
/// window yields [`WireError::Truncated`] and leaves the cursor unchanged.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Reader<'a> {
    /// Read the whole of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            end: data.len(),
        }
    }

    /// Point the reader at `len` bytes of `data` starting at `offset`.
    ///
    /// The window is clamped to the bounds of `data`.
    pub fn set_buffer(&mut self, data: &'a [u8], offset: usize, len: usize) {
        let start = offset.min(data.len());
        self.data = data;
        self.pos = start;
        self.end = start.saturating_add(len).min(data.len());
    }

    /// Bytes left in the window.
    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }

    /// Absolute position of the cursor in the underlying slice.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Borrow the next `n` bytes and advance past them.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if n > self.remaining() {
            return Err(WireError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Borrow everything left in the window.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..self.end];
        self.pos = self.end;
        out
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i16(&mut self) -> Result<i16, WireError> {
        Ok(i16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, WireError> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    /// Big-endian `i32`, used by room-server framing fields.
    pub fn read_i32_be(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    /// Read a non-negative little-endian `i32` length field.
    pub fn read_len(&mut self) -> Result<usize, WireError> {
        let n = self.read_i32()?;
        usize::try_from(n).map_err(|_| WireError::NegativeLength(n))
    }

    /// Read a non-negative big-endian `i32` length field.
    pub fn read_len_be(&mut self) -> Result<usize, WireError> {
        let n = self.read_i32_be()?;
        usize::try_from(n).map_err(|_| WireError::NegativeLength(n))
    }

    /// Read a 7-bit variable-length integer.
    pub fn read_7bit(&mut self) -> Result<u32, WireError> {
        let start = self.pos;
        let mut value: u32 = 0;
        for shift in (0..35).step_by(7) {
            let byte = match self.read_u8() {
                Ok(b) => b,
                Err(e) => {
                    self.pos = start;
                    return Err(e);
                }
            };
            value |= u32::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        self.pos = start;
        Err(WireError::BadLengthPrefix)
    }

    /// Read a string with a 7-bit byte-count prefix.
    pub fn read_string(&mut self) -> Result<String, WireError> {
        let start = self.pos;
        let len = self.read_7bit()? as usize;
        let bytes = match self.read_bytes(len) {
            Ok(b) => b,
            Err(e) => {
                self.pos = start;
                return Err(e);
            }
        };
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8)
    }

    pub fn read_vec3(&mut self) -> Result<Vec3, WireError> {
        let raw: [u8; 12] = self.read_array()?;
        let f = |i: usize| f32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Ok(Vec3::new(f(0), f(4), f(8)))
    }

    pub fn read_quat(&mut self) -> Result<Quat, WireError> {
        let raw: [u8; 16] = self.read_array()?;
        let f = |i: usize| f32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Ok(Quat::new(f(0), f(4), f(8), f(12)))
    }

    pub fn read_transform(&mut self) -> Result<Transform, WireError> {
        let raw: [u8; 28] = self.read_array()?;
        let mut r = Reader::new(&raw);
        Ok(Transform {
            position: r.read_vec3()?,
            rotation: r.read_quat()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
