// Byte + bit cursor over a DataSource
//
// The cursor is fully described by a `ReaderState` value. Nothing is cached
// between reads, so saving and restoring a state is a plain copy and any
// state captured at reservation time decodes identically later on.

pub mod data_source;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, EvalError};
use crate::types::BasicKind;
use crate::eval::value::Value;
use data_source::DataSource;

/// Byte order for multi-byte reads and padded bitfield units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// Order in which bitfields are carved out of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitOrder {
    /// First field takes the most significant bits
    LeftToRight,
    /// First field takes the least significant bits
    #[default]
    RightToLeft,
}

/// Snapshot of the cursor.
///
/// `bit_offset` is always strictly less than `pack_width * 8`; filling the
/// unit advances `position` by `pack_width` and resets the offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderState {
    /// Byte position of the current unit (or of the next byte when aligned)
    pub position: u64,
    /// Bits already consumed from the unit at `position`
    pub bit_offset: u32,
    pub endian: Endianness,
    pub bit_order: BitOrder,
    /// Whether bitfields consume whole units of their declared type
    pub padded: bool,
    /// Width in bytes of the current bitfield unit (1, 2, 4 or 8)
    pub pack_width: u8,
}

impl Default for ReaderState {
    fn default() -> Self {
        Self {
            position: 0,
            bit_offset: 0,
            endian: Endianness::Little,
            bit_order: BitOrder::RightToLeft,
            padded: true,
            pack_width: 1,
        }
    }
}

impl ReaderState {
    pub fn at(position: u64) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// Absolute bit address of the cursor
    pub fn bit_position(&self) -> u64 {
        self.position * 8 + self.bit_offset as u64
    }

    pub fn is_aligned(&self) -> bool {
        self.bit_offset == 0
    }

    /// First byte not touched by anything consumed so far. A partially used
    /// unit counts as fully occupied.
    pub fn aligned_end(&self) -> u64 {
        if self.bit_offset == 0 {
            self.position
        } else {
            self.position + self.pack_width as u64
        }
    }

    /// Drop any partially consumed unit.
    pub fn align(&mut self) {
        if self.bit_offset != 0 {
            self.position += self.pack_width as u64;
            self.bit_offset = 0;
        }
    }
}

#[inline]
fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

#[inline]
fn sign_extend(raw: u64, width: u32) -> i64 {
    if width == 0 {
        0
    } else if width >= 64 {
        raw as i64
    } else {
        let shift = 64 - width;
        ((raw << shift) as i64) >> shift
    }
}

fn check_pack(pack_bytes: u8) -> Result<u32, EvalError> {
    match pack_bytes {
        1 | 2 | 4 | 8 => Ok(pack_bytes as u32 * 8),
        other => Err(ErrorKind::NoDecoder(format!("{}-byte bitfield unit", other)).into()),
    }
}

/// Cursor over a single data source
pub struct BitReader<'a> {
    source: &'a dyn DataSource,
    state: ReaderState,
}

impl<'a> BitReader<'a> {
    pub fn new(source: &'a dyn DataSource) -> Self {
        Self::with_state(source, ReaderState::default())
    }

    pub fn with_state(source: &'a dyn DataSource, state: ReaderState) -> Self {
        Self { source, state }
    }

    pub fn source(&self) -> &'a dyn DataSource {
        self.source
    }

    pub fn size(&self) -> u64 {
        self.source.size()
    }

    pub fn save_state(&self) -> ReaderState {
        self.state
    }

    pub fn load_state(&mut self, state: ReaderState) {
        self.state = state;
    }

    pub fn position(&self) -> u64 {
        self.state.position
    }

    /// Move to an absolute byte position, discarding any partial unit.
    pub fn set_position(&mut self, position: u64) {
        self.state.position = position;
        self.state.bit_offset = 0;
    }

    pub fn is_eof(&self) -> bool {
        self.state.aligned_end() >= self.source.size()
    }

    pub fn set_endian(&mut self, endian: Endianness) {
        self.state.endian = endian;
    }

    pub fn set_bit_order(&mut self, order: BitOrder) {
        self.state.bit_order = order;
    }

    /// Switching between padded and unpadded bitfields starts a fresh unit.
    pub fn set_padded(&mut self, padded: bool) {
        if self.state.padded != padded {
            self.state.align();
            self.state.padded = padded;
            self.state.pack_width = 1;
        }
    }

    pub fn align(&mut self) {
        self.state.align();
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), EvalError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.source.size() => Ok(()),
            _ => Err(ErrorKind::ReadOutOfBounds {
                offset,
                size: len,
                len: self.source.size(),
            }
            .into()),
        }
    }

    /// Read `N` bytes at the aligned cursor and advance past them.
    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], EvalError> {
        let mut next = self.state;
        next.align();
        let mut buf = [0u8; N];
        self.source.read_into(next.position, &mut buf)?;
        next.position += N as u64;
        self.state = next;
        Ok(buf)
    }

    pub fn read_bytes(&mut self, len: u64) -> Result<Vec<u8>, EvalError> {
        let mut next = self.state;
        next.align();
        let bytes = self.source.read_bytes(next.position, len)?;
        next.position += len;
        self.state = next;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8, EvalError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, EvalError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16, EvalError> {
        let b = self.read_array::<2>()?;
        Ok(match self.state.endian {
            Endianness::Little => u16::from_le_bytes(b),
            Endianness::Big => u16::from_be_bytes(b),
        })
    }

    pub fn read_i16(&mut self) -> Result<i16, EvalError> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> Result<u32, EvalError> {
        let b = self.read_array::<4>()?;
        Ok(match self.state.endian {
            Endianness::Little => u32::from_le_bytes(b),
            Endianness::Big => u32::from_be_bytes(b),
        })
    }

    pub fn read_i32(&mut self) -> Result<i32, EvalError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64, EvalError> {
        let b = self.read_array::<8>()?;
        Ok(match self.state.endian {
            Endianness::Little => u64::from_le_bytes(b),
            Endianness::Big => u64::from_be_bytes(b),
        })
    }

    pub fn read_i64(&mut self) -> Result<i64, EvalError> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f32(&mut self) -> Result<f32, EvalError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, EvalError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Decode one byte-aligned value of a basic kind.
    pub fn read_basic(&mut self, kind: BasicKind) -> Result<Value, EvalError> {
        Ok(match kind {
            BasicKind::U8 => Value::Unsigned(self.read_u8()? as u64),
            BasicKind::U16 => Value::Unsigned(self.read_u16()? as u64),
            BasicKind::U32 => Value::Unsigned(self.read_u32()? as u64),
            BasicKind::U64 => Value::Unsigned(self.read_u64()?),
            BasicKind::S8 => Value::Signed(self.read_i8()? as i64),
            BasicKind::S16 => Value::Signed(self.read_i16()? as i64),
            BasicKind::S32 => Value::Signed(self.read_i32()? as i64),
            BasicKind::S64 => Value::Signed(self.read_i64()?),
            BasicKind::Float => Value::Float(self.read_f32()? as f64),
            BasicKind::Double => Value::Float(self.read_f64()?),
            BasicKind::Bool => Value::Bool(self.read_u8()? != 0),
            BasicKind::Char => Value::Char(self.read_u8()? as char),
            BasicKind::Char16 => {
                let unit = self.read_u16()?;
                Value::Char(char::from_u32(unit as u32).unwrap_or('\u{FFFD}'))
            }
        })
    }

    /// Validate a bitfield request and move to where its first bit lives:
    /// a new unit is started when the pack width changes or the field does
    /// not fit in what is left of the current one.
    fn prepare_bits(&mut self, width: u32, pack_bytes: u8) -> Result<(), EvalError> {
        let capacity = check_pack(pack_bytes)?;
        if width > capacity {
            return Err(ErrorKind::BitWidthOverflow {
                ty: format!("{}-byte unit", pack_bytes),
                width: width as u64,
                capacity: capacity as u64,
            }
            .into());
        }
        let state = &mut self.state;
        if state.padded {
            let unit_bits = state.pack_width as u32 * 8;
            if state.bit_offset != 0
                && (width == 0
                    || state.pack_width != pack_bytes
                    || state.bit_offset + width > unit_bits)
            {
                state.align();
            }
            state.pack_width = pack_bytes;
        } else {
            if width == 0 {
                state.align();
            }
            state.pack_width = 1;
        }
        Ok(())
    }

    fn advance_bits(&mut self, width: u32) {
        let state = &mut self.state;
        if state.padded {
            state.bit_offset += width;
            if state.bit_offset == state.pack_width as u32 * 8 {
                state.position += state.pack_width as u64;
                state.bit_offset = 0;
            }
        } else {
            let total = state.bit_offset as u64 + width as u64;
            state.position += total / 8;
            state.bit_offset = (total % 8) as u32;
        }
    }

    fn fetch_unit(&self, pack_bytes: u8) -> Result<u64, EvalError> {
        let mut buf = [0u8; 8];
        let unit = &mut buf[..pack_bytes as usize];
        self.source.read_into(self.state.position, unit)?;
        Ok(match self.state.endian {
            Endianness::Little => unit
                .iter()
                .rev()
                .fold(0u64, |acc, &b| (acc << 8) | b as u64),
            Endianness::Big => unit.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64),
        })
    }

    fn extract_bits(&self, width: u32, pack_bytes: u8) -> Result<u64, EvalError> {
        if width == 0 {
            return Ok(0);
        }
        let state = &self.state;
        if state.padded {
            let unit = self.fetch_unit(pack_bytes)?;
            let unit_bits = pack_bytes as u32 * 8;
            let shift = match state.bit_order {
                BitOrder::RightToLeft => state.bit_offset,
                BitOrder::LeftToRight => unit_bits - state.bit_offset - width,
            };
            return Ok((unit >> shift) & mask(width));
        }

        // Unpadded: one rolling byte at a time
        let needed = (state.bit_offset as u64 + width as u64).div_ceil(8);
        let bytes = self.source.read_bytes(state.position, needed)?;
        let mut value = 0u64;
        let mut got = 0u32;
        let mut bit_in_byte = state.bit_offset;
        for byte in bytes {
            let take = (8 - bit_in_byte).min(width - got);
            let chunk = match state.bit_order {
                BitOrder::RightToLeft => (byte as u64 >> bit_in_byte) & mask(take),
                BitOrder::LeftToRight => (byte as u64 >> (8 - bit_in_byte - take)) & mask(take),
            };
            value = match state.bit_order {
                BitOrder::RightToLeft => value | (chunk << got),
                BitOrder::LeftToRight => (value << take) | chunk,
            };
            got += take;
            bit_in_byte = 0;
        }
        Ok(value)
    }

    /// Read `width` bits as a bitfield whose declared type is `pack_bytes`
    /// wide. Signed fields are sign-extended from `width` bits.
    pub fn read_bits(&mut self, signed: bool, width: u32, pack_bytes: u8) -> Result<Value, EvalError> {
        let saved = self.state;
        let result = self
            .prepare_bits(width, pack_bytes)
            .and_then(|_| self.extract_bits(width, pack_bytes));
        match result {
            Ok(raw) => {
                self.advance_bits(width);
                Ok(if signed {
                    Value::Signed(sign_extend(raw, width))
                } else {
                    Value::Unsigned(raw)
                })
            }
            Err(e) => {
                self.state = saved;
                Err(e)
            }
        }
    }

    /// Reserve `len` bytes without decoding them.
    /// Returns the state at the start of the reserved range.
    pub fn skip_bytes(&mut self, len: u64) -> Result<ReaderState, EvalError> {
        let mut start = self.state;
        start.align();
        self.check_range(start.position, len)?;
        self.state = start;
        self.state.position += len;
        Ok(start)
    }

    /// Reserve a `width`-bit field without decoding it.
    /// Returns the state from which `read_bits` will decode the field.
    pub fn skip_bits(&mut self, width: u32, pack_bytes: u8) -> Result<ReaderState, EvalError> {
        let saved = self.state;
        self.prepare_bits(width, pack_bytes)?;
        let start = self.state;
        let unit_len = if start.padded {
            pack_bytes as u64
        } else {
            (start.bit_offset as u64 + width as u64).div_ceil(8)
        };
        if width > 0 {
            if let Err(e) = self.check_range(start.position, unit_len) {
                self.state = saved;
                return Err(e);
            }
        }
        self.advance_bits(width);
        Ok(start)
    }

    /// Run `f` with the cursor at `state`, then restore the cursor to exactly
    /// where it was. Diversions nest.
    pub fn with_state_at<T>(
        &mut self,
        state: ReaderState,
        f: impl FnOnce(&mut Self) -> Result<T, EvalError>,
    ) -> Result<T, EvalError> {
        let saved = self.save_state();
        self.load_state(state);
        let result = f(self);
        self.load_state(saved);
        result
    }
}
