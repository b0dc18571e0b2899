//! The delta-compressed, alphabetically sorted symbol table codec (encoder for the host-side
//! builders, cursor-based decoder for the device-side loader).

use thiserror::Error;

use crate::format::{MAX_SYMBOL_LEN, SYMBOL_HEADER_SIZE};

/// Errors from encoding or decoding a symbol table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SymtabError {
    /// A symbol name is longer than [`MAX_SYMBOL_LEN`].
    #[error("symbol name {0:?} is longer than {MAX_SYMBOL_LEN} bytes")]
    NameTooLong(String),
    /// The entries passed to the encoder were not strictly ascending by name.
    #[error("symbol entries are not strictly ascending by name: {0:?} >= {1:?}")]
    NotSorted(String, String),
    /// The on-disk stream ended before an expected field.
    #[error("truncated symbol table")]
    Truncated,
    /// A name suffix was not valid UTF-8 or was missing its NUL terminator.
    #[error("malformed symbol name")]
    MalformedName,
}

/// One entry to encode: a name and its absolute 16-bit value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    /// The symbol's name.
    pub name: String,
    /// The symbol's absolute value.
    pub value: u16,
}

/// The encoding mode chosen for one entry's value, matching the bits packed into `attr[6:8]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Absolute,
    NegativeSmall,
    PositiveSmall,
    PositiveMedium,
}

impl Mode {
    fn bits(self) -> u8 {
        match self {
            Mode::Absolute => 0,
            Mode::NegativeSmall => 1,
            Mode::PositiveSmall => 2,
            Mode::PositiveMedium => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Mode::Absolute,
            1 => Mode::NegativeSmall,
            2 => Mode::PositiveSmall,
            3 => Mode::PositiveMedium,
            _ => unreachable!("attr mode is only ever 2 bits"),
        }
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn choose_mode(delta: i32) -> (Mode, u8, u8) {
    if (-256..=-1).contains(&delta) {
        (Mode::NegativeSmall, u8::try_from(-delta - 1).unwrap(), 1)
    } else if (0..=255).contains(&delta) {
        (Mode::PositiveSmall, u8::try_from(delta).unwrap(), 1)
    } else if (256..=511).contains(&delta) {
        (Mode::PositiveMedium, u8::try_from(delta - 256).unwrap(), 1)
    } else {
        (Mode::Absolute, 0, 2)
    }
}

/// Encodes `entries`, which must already be sorted strictly ascending by name (byte-wise), into
/// the on-disk symbol list (not including the file header or the trailing EOF sentinel).
pub fn encode_symbol_table(entries: &[SymbolEntry]) -> Result<Vec<u8>, SymtabError> {
    let mut out = Vec::new();
    let mut prev_name: &[u8] = b"";
    let mut prev_value: i64 = 0;

    for entry in entries {
        if entry.name.len() > MAX_SYMBOL_LEN {
            return Err(SymtabError::NameTooLong(entry.name.clone()));
        }
        let name_bytes = entry.name.as_bytes();
        if name_bytes <= prev_name {
            return Err(SymtabError::NotSorted(
                String::from_utf8_lossy(prev_name).into_owned(),
                entry.name.clone(),
            ));
        }

        let shared = shared_prefix_len(prev_name, name_bytes).min(63);
        let delta = i32::from(entry.value) - i32::try_from(prev_value).unwrap();
        let (mode, v, width) = choose_mode(delta);

        let attr = (mode.bits() << 6) | u8::try_from(shared).unwrap();
        out.push(attr);
        out.extend_from_slice(&name_bytes[shared..]);
        out.push(0);

        if width == 2 {
            out.extend_from_slice(&entry.value.to_le_bytes());
        } else {
            out.push(v);
        }

        prev_name = name_bytes;
        prev_value = i64::from(entry.value);
    }

    Ok(out)
}

/// Decodes an encoded symbol table back into entries, in on-disk order. Mainly used by tests and
/// by the module builder when it needs a materialized view; the on-device loader instead uses
/// [`SymbolCursor`] to avoid holding the whole table in memory at once.
pub fn decode_symbol_table(data: &[u8]) -> Result<Vec<SymbolEntry>, SymtabError> {
    let mut entries = Vec::new();
    let mut cursor = SymbolCursor::new(data);

    while !cursor.at_end() {
        cursor.advance()?;
        entries.push(SymbolEntry {
            name: cursor.current_name().to_string(),
            value: cursor.current_value(),
        });
    }

    Ok(entries)
}

/// A streaming decoder for the on-disk symbol list, pumped forward one entry at a time. Models
/// the loader's resolve/decode coupling: the decoder never materializes the whole table, only the
/// currently reconstructed name and value.
pub struct SymbolCursor<'a> {
    remaining: &'a [u8],
    consumed: usize,
    name_buf: [u8; MAX_SYMBOL_LEN],
    name_len: usize,
    value: u16,
}

impl<'a> SymbolCursor<'a> {
    /// Creates a cursor over the on-disk symbol list, positioned before the first entry.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            remaining: data,
            consumed: 0,
            name_buf: [0; MAX_SYMBOL_LEN],
            name_len: 0,
            value: 0,
        }
    }

    /// Bytes consumed from the original buffer so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// The bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        self.remaining
    }

    /// True once the cursor has reached the EOF sentinel (or run out of bytes).
    pub fn at_end(&self) -> bool {
        self.remaining.is_empty() || self.remaining[0] == crate::format::EOF_SENTINEL
    }

    /// The currently reconstructed name.
    pub fn current_name(&self) -> &str {
        std::str::from_utf8(&self.name_buf[..self.name_len]).unwrap_or("")
    }

    /// The currently reconstructed absolute value.
    pub fn current_value(&self) -> u16 {
        self.value
    }

    /// Returns the number of leading bytes `key` shares with the current name; used by callers
    /// (the loader's import resolver) to short-circuit repeated comparisons against a fixed key
    /// while walking forward.
    pub fn shared_prefix_with(&self, key: &str) -> usize {
        shared_prefix_len(&self.name_buf[..self.name_len], key.as_bytes())
    }

    /// Decodes and applies the next on-disk entry, advancing the cursor past it.
    pub fn advance(&mut self) -> Result<(), SymtabError> {
        let buf = self.remaining;
        let attr = *buf.first().ok_or(SymtabError::Truncated)?;
        let shared = usize::from(attr & 0x3F);
        let mode = Mode::from_bits(attr >> 6);

        if shared > self.name_len {
            return Err(SymtabError::MalformedName);
        }

        let mut pos = 1;
        let mut len = shared;
        loop {
            let byte = *buf.get(pos).ok_or(SymtabError::Truncated)?;
            pos += 1;
            if byte == 0 {
                break;
            }
            if len >= MAX_SYMBOL_LEN {
                return Err(SymtabError::MalformedName);
            }
            self.name_buf[len] = byte;
            len += 1;
        }
        self.name_len = len;

        let (value, value_len) = match mode {
            Mode::Absolute => {
                let bytes = buf.get(pos..pos + 2).ok_or(SymtabError::Truncated)?;
                (u16::from_le_bytes(bytes.try_into().unwrap()), 2)
            }
            Mode::NegativeSmall => {
                let b = *buf.get(pos).ok_or(SymtabError::Truncated)?;
                (self.value.wrapping_sub(u16::from(b)).wrapping_sub(1), 1)
            }
            Mode::PositiveSmall => {
                let b = *buf.get(pos).ok_or(SymtabError::Truncated)?;
                (self.value.wrapping_add(u16::from(b)), 1)
            }
            Mode::PositiveMedium => {
                let b = *buf.get(pos).ok_or(SymtabError::Truncated)?;
                (self.value.wrapping_add(0x100).wrapping_add(u16::from(b)), 1)
            }
        };
        pos += value_len;

        self.value = value;
        self.consumed += pos;
        self.remaining = &buf[pos..];

        Ok(())
    }
}

/// Result of looking up a single import in the symbol file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The symbol was found; carries its resolved absolute value.
    Found(u16),
    /// The cursor passed the search key alphabetically without finding it.
    Unresolved,
}

/// Drives `cursor` forward to find `key`. Both the cursor's underlying entries and the sequence
/// of calls to this function (one per import, in ascending order) must be sorted, which is the
/// property that lets this resolve in O(N) total across all imports rather than O(N) per import.
pub fn resolve_one(cursor: &mut SymbolCursor<'_>, key: &str) -> Result<Lookup, SymtabError> {
    loop {
        if cursor.at_end() {
            return Ok(Lookup::Unresolved);
        }

        cursor.advance()?;
        let name = cursor.current_name();

        if name == key {
            return Ok(Lookup::Found(cursor.current_value()));
        }
        if name.as_bytes() > key.as_bytes() {
            return Ok(Lookup::Unresolved);
        }
    }
}

/// Encodes a sorted, deduplicated list of import names using the same shared-prefix compression
/// as [`encode_symbol_table`], but without a value field: a module's import list only names what
/// it needs resolved, not what it resolves to. Grounded on the host module builder's own
/// `write_symbollist`, which is a distinct, simpler function from the kernel symbol table
/// encoder above despite the shared name in the original sources.
pub fn encode_import_names(names: &[String]) -> Result<Vec<u8>, SymtabError> {
    let mut out = Vec::new();
    let mut prev: &[u8] = b"";

    for name in names {
        if name.len() > MAX_SYMBOL_LEN {
            return Err(SymtabError::NameTooLong(name.clone()));
        }
        let name_bytes = name.as_bytes();
        if name_bytes <= prev {
            return Err(SymtabError::NotSorted(
                String::from_utf8_lossy(prev).into_owned(),
                name.clone(),
            ));
        }

        let shared = shared_prefix_len(prev, name_bytes).min(usize::from(u8::MAX));
        out.push(u8::try_from(shared).unwrap());
        out.extend_from_slice(&name_bytes[shared..]);
        out.push(0);

        prev = name_bytes;
    }

    Ok(out)
}

/// A streaming decoder for an encoded import list, one name at a time. Unlike [`SymbolCursor`],
/// there is no value to reconstruct and no EOF sentinel to stop at: callers know the entry count
/// up front from the module header's `sym_entries` field and must stop there themselves.
pub struct ImportCursor<'a> {
    remaining: &'a [u8],
    name_buf: [u8; MAX_SYMBOL_LEN],
    name_len: usize,
}

impl<'a> ImportCursor<'a> {
    /// Creates a cursor over the encoded import list, positioned before the first entry.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            remaining: data,
            name_buf: [0; MAX_SYMBOL_LEN],
            name_len: 0,
        }
    }

    /// The bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        self.remaining
    }

    /// The currently reconstructed name.
    pub fn current_name(&self) -> &str {
        std::str::from_utf8(&self.name_buf[..self.name_len]).unwrap_or("")
    }

    /// Decodes and applies the next entry, advancing the cursor past it.
    pub fn advance(&mut self) -> Result<(), SymtabError> {
        let buf = self.remaining;
        let shared = usize::from(*buf.first().ok_or(SymtabError::Truncated)?);

        if shared > self.name_len {
            return Err(SymtabError::MalformedName);
        }

        let mut pos = 1;
        let mut len = shared;
        loop {
            let byte = *buf.get(pos).ok_or(SymtabError::Truncated)?;
            pos += 1;
            if byte == 0 {
                break;
            }
            if len >= MAX_SYMBOL_LEN {
                return Err(SymtabError::MalformedName);
            }
            self.name_buf[len] = byte;
            len += 1;
        }
        self.name_len = len;
        self.remaining = &buf[pos..];

        Ok(())
    }
}

/// Decodes exactly `count` import names in on-disk order. Used by tests and by the host module
/// builder's own round-trip checks; the device loader instead drives [`ImportCursor`] directly,
/// one name at a time, resolving each against a [`SymbolCursor`] as it goes.
pub fn decode_import_names(data: &[u8], count: usize) -> Result<Vec<String>, SymtabError> {
    let mut cursor = ImportCursor::new(data);
    let mut names = Vec::with_capacity(count);
    for _ in 0..count {
        cursor.advance()?;
        names.push(cursor.current_name().to_string());
    }
    Ok(names)
}
