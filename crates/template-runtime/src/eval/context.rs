// Execution context: attached streams, the active cursor and creation hooks

use crate::error::{ErrorKind, EvalError};
use crate::reader::data_source::DataSource;
use crate::reader::{BitReader, Endianness, ReaderState};
use crate::schema::VariableDeclaration;
use crate::types::TypeDefinition;

use super::observer::Observer;
use super::variable::{StreamId, VarId, Variable};

/// Bytes fetched per step while scanning for a string terminator
const SCAN_CHUNK: u64 = 256;

pub struct Context<'a> {
    streams: Vec<BitReader<'a>>,
    active: StreamId,
    observers: Vec<Box<dyn Observer + 'a>>,
}

impl<'a> Context<'a> {
    pub fn new(source: &'a dyn DataSource, initial: ReaderState) -> Self {
        Self {
            streams: vec![BitReader::with_state(source, initial)],
            active: StreamId(0),
            observers: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn Observer + 'a>) {
        self.observers.push(observer);
    }

    pub fn active(&self) -> StreamId {
        self.active
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Attach another stream and make it the active one. The new cursor
    /// starts at offset 0 with the current byte order and bitfield settings.
    pub fn open_stream(&mut self, source: &'a dyn DataSource) -> StreamId {
        let mut state = self.reader().save_state();
        state.position = 0;
        state.bit_offset = 0;
        state.pack_width = 1;
        let id = StreamId(self.streams.len() as u16);
        self.streams.push(BitReader::with_state(source, state));
        self.active = id;
        id
    }

    pub fn set_active(&mut self, id: StreamId) -> Result<(), EvalError> {
        if id.0 as usize >= self.streams.len() {
            return Err(ErrorKind::IndexOutOfRange {
                name: "streams".to_string(),
                index: id.0 as u64,
                len: self.streams.len() as u64,
            }
            .into());
        }
        self.active = id;
        Ok(())
    }

    pub fn reader(&self) -> &BitReader<'a> {
        &self.streams[self.active.0 as usize]
    }

    pub fn reader_mut(&mut self) -> &mut BitReader<'a> {
        &mut self.streams[self.active.0 as usize]
    }

    pub fn stream_mut(&mut self, id: StreamId) -> Result<&mut BitReader<'a>, EvalError> {
        let len = self.streams.len() as u64;
        self.streams
            .get_mut(id.0 as usize)
            .ok_or_else(|| {
                ErrorKind::IndexOutOfRange {
                    name: "streams".to_string(),
                    index: id.0 as u64,
                    len,
                }
                .into()
            })
    }

    pub fn position(&self) -> u64 {
        self.reader().position()
    }

    /// Seek the active stream. Any partially consumed bitfield unit is dropped.
    pub fn set_position(&mut self, position: u64) {
        self.reader_mut().set_position(position);
    }

    /// Reserve the bytes or bits of a fixed-size type without decoding them.
    /// Returns the cursor state the value will later be decoded from.
    pub fn reserve_range(&mut self, ty: &TypeDefinition) -> Result<ReaderState, EvalError> {
        if let TypeDefinition::Bitfield { base, width } = ty.resolved() {
            let width = width.ok_or_else(|| ErrorKind::IncompleteType(ty.name()))?;
            let kind = base
                .basic_kind()
                .ok_or_else(|| ErrorKind::NoDecoder(ty.name()))?;
            return self.reader_mut().skip_bits(width as u32, kind.size() as u8);
        }
        let size = ty.size().ok_or_else(|| ErrorKind::NoSize(ty.name()))?;
        self.reader_mut().skip_bytes(size)
    }

    /// Read a NUL-terminated byte string at the cursor, looking at no more
    /// than `max_len` bytes. The cursor moves past the terminator if one was
    /// found, else past everything scanned.
    pub fn read_cstring(&mut self, max_len: Option<u64>) -> Result<String, EvalError> {
        let reader = self.reader_mut();
        reader.align();
        let start = reader.position();
        let limit = reader
            .size()
            .saturating_sub(start)
            .min(max_len.unwrap_or(u64::MAX));

        let mut text = String::new();
        let mut scanned = 0u64;
        while scanned < limit {
            let chunk = reader
                .source()
                .read_bytes(start + scanned, SCAN_CHUNK.min(limit - scanned))?;
            if let Some(nul) = memchr::memchr(0, &chunk) {
                text.extend(chunk[..nul].iter().map(|&b| b as char));
                reader.set_position(start + scanned + nul as u64 + 1);
                return Ok(text);
            }
            text.extend(chunk.iter().map(|&b| b as char));
            scanned += chunk.len() as u64;
        }
        reader.set_position(start + scanned);
        Ok(text)
    }

    /// Read a NUL-terminated UTF-16 string in the cursor's byte order,
    /// looking at no more than `max_units` code units.
    pub fn read_wstring(&mut self, max_units: Option<u64>) -> Result<String, EvalError> {
        let reader = self.reader_mut();
        reader.align();
        let start = reader.position();
        let available = reader.size().saturating_sub(start) / 2;
        let limit = available.min(max_units.unwrap_or(u64::MAX));
        let encoding = match reader.save_state().endian {
            Endianness::Little => encoding_rs::UTF_16LE,
            Endianness::Big => encoding_rs::UTF_16BE,
        };

        let mut units = Vec::new();
        let mut scanned = 0u64;
        'scan: while scanned < limit {
            let count = (SCAN_CHUNK / 2).min(limit - scanned);
            let chunk = reader.source().read_bytes(start + scanned * 2, count * 2)?;
            for unit in chunk.chunks_exact(2) {
                scanned += 1;
                if unit[0] == 0 && unit[1] == 0 {
                    break 'scan;
                }
                units.extend_from_slice(unit);
            }
        }
        reader.set_position(start + scanned * 2);
        let (text, _) = encoding.decode_without_bom_handling(&units);
        Ok(text.into_owned())
    }

    pub(crate) fn notify_creating(&mut self, decl: &VariableDeclaration, name: &str) {
        for observer in &mut self.observers {
            if let Err(message) = observer.on_variable_creating(decl) {
                tracing::warn!("observer failed before creating '{}': {}", name, message);
            }
        }
    }

    pub(crate) fn notify_created(
        &mut self,
        decl: &VariableDeclaration,
        name: &str,
        id: VarId,
        var: &Variable,
    ) {
        for observer in &mut self.observers {
            if let Err(message) = observer.on_variable_created(decl, id, var) {
                tracing::warn!("observer failed after creating '{}': {}", name, message);
            }
        }
    }
}
