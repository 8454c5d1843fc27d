/*! FlatBuffer-style wire tables and size-prefixed record framing.

The stream message wire format: a `u32` little-endian size prefix followed
by a body whose first four bytes are the root table offset and whose next
four are the schema's file identifier. Tables address their fields through
a vtable, scalars equal to their default are elided, and references to
strings, vectors and sub-tables are forward `u32` offsets relative to the
referencing field.

[`Builder`] produces record bytes front to back, backpatching reference
fields once their target is written. The read side ([`Table`], [`Vector`])
is fully bounds-checked: malformed content surfaces as absent fields and
never as a panic, so the codecs can skip damaged items and keep iterating.
*/
use byteorder::{ByteOrder, LittleEndian};

use crate::Result;
use crate::stream::{PosOp, SeekOp, Stream};

/// Bytes occupied by the record size prefix.
pub const SIZE_PREFIX_LEN: usize = 4;

const IDENT_POS: usize = 4;
const IDENT_LEN: usize = 4;

// ---------------------------------------------------------------------
// Write side.
// ---------------------------------------------------------------------

/// Record builder. One builder produces one size-prefixed record.
#[derive(Debug)]
pub struct Builder {
    body: Vec<u8>,
}

/// In-progress table: position plus the vtable slots recorded so far.
#[derive(Debug)]
pub struct TableState {
    pos: usize,
    slots: Vec<(u16, u16)>,
}

/// A reference field awaiting its target position.
#[derive(Debug)]
#[must_use]
pub struct PatchSlot(usize);

impl Builder {
    /// Start a record body carrying the given file identifier.
    #[must_use]
    pub fn new(ident: &[u8; IDENT_LEN]) -> Self {
        let mut body = vec![0u8; IDENT_POS];
        body.extend_from_slice(ident);
        Self { body }
    }

    fn align(&mut self, n: usize) {
        while self.body.len() % n != 0 {
            self.body.push(0);
        }
    }

    /// Open a table. Fields are added through the `field_*` methods and the
    /// table is placed by [`Builder::end_table`].
    pub fn start_table(&mut self) -> TableState {
        self.align(4);
        let pos = self.body.len();
        self.body.extend_from_slice(&[0u8; 4]); // vtable backlink
        TableState {
            pos,
            slots: Vec::new(),
        }
    }

    fn record_slot(&mut self, t: &mut TableState, id: u16, size: usize) {
        self.align(size);
        t.slots.push((id, (self.body.len() - t.pos) as u16));
    }

    /// Add a `u8` scalar field, elided when it equals `default`.
    pub fn field_u8(&mut self, t: &mut TableState, id: u16, v: u8, default: u8) {
        if v == default {
            return;
        }
        self.record_slot(t, id, 1);
        self.body.push(v);
    }

    /// Add a bool field, elided when it equals `default`.
    pub fn field_bool(&mut self, t: &mut TableState, id: u16, v: bool, default: bool) {
        self.field_u8(t, id, u8::from(v), u8::from(default));
    }

    /// Add a `u16` scalar field, elided when it equals `default`.
    pub fn field_u16(&mut self, t: &mut TableState, id: u16, v: u16, default: u16) {
        if v == default {
            return;
        }
        self.record_slot(t, id, 2);
        self.body.extend_from_slice(&v.to_le_bytes());
    }

    /// Add a `u32` scalar field, elided when it equals `default`.
    pub fn field_u32(&mut self, t: &mut TableState, id: u16, v: u32, default: u32) {
        if v == default {
            return;
        }
        self.record_slot(t, id, 4);
        self.body.extend_from_slice(&v.to_le_bytes());
    }

    /// Add a `u64` scalar field, elided when it equals `default`.
    pub fn field_u64(&mut self, t: &mut TableState, id: u16, v: u64, default: u64) {
        if v == default {
            return;
        }
        self.record_slot(t, id, 8);
        self.body.extend_from_slice(&v.to_le_bytes());
    }

    /// Add an inline struct field (fixed-size bytes, e.g. address words).
    pub fn field_struct(&mut self, t: &mut TableState, id: u16, bytes: &[u8], align: usize) {
        self.record_slot(t, id, align);
        self.body.extend_from_slice(bytes);
    }

    /// Add a reference field. The returned slot must be patched with the
    /// target's position once the target has been written.
    pub fn field_ref(&mut self, t: &mut TableState, id: u16) -> PatchSlot {
        self.record_slot(t, id, 4);
        let pos = self.body.len();
        self.body.extend_from_slice(&[0u8; 4]);
        PatchSlot(pos)
    }

    /// Close a table: emit its vtable and resolve the backlink. Returns the
    /// table position for use with [`Builder::patch`].
    pub fn end_table(&mut self, t: TableState) -> usize {
        let data_len = (self.body.len() - t.pos) as u16;
        self.align(2);
        let vt_pos = self.body.len();
        let max_id = t.slots.iter().map(|&(id, _)| id).max();
        let entries = max_id.map_or(0, |m| usize::from(m) + 1);
        let vt_len = (4 + 2 * entries) as u16;
        self.body.extend_from_slice(&vt_len.to_le_bytes());
        self.body.extend_from_slice(&data_len.to_le_bytes());
        for id in 0..entries {
            let off = t
                .slots
                .iter()
                .find(|&&(sid, _)| usize::from(sid) == id)
                .map_or(0, |&(_, off)| off);
            self.body.extend_from_slice(&off.to_le_bytes());
        }
        // Backlink: vtable position = table position - stored value.
        let backlink = t.pos as i64 - vt_pos as i64;
        LittleEndian::write_i32(&mut self.body[t.pos..t.pos + 4], backlink as i32);
        t.pos
    }

    /// Resolve a reference field to a previously returned position.
    pub fn patch(&mut self, slot: PatchSlot, target_pos: usize) {
        let rel = (target_pos - slot.0) as u32;
        LittleEndian::write_u32(&mut self.body[slot.0..slot.0 + 4], rel);
    }

    /// Write a byte vector, returning its position.
    pub fn byte_vector(&mut self, data: &[u8]) -> usize {
        self.align(4);
        let pos = self.body.len();
        self.body
            .extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.body.extend_from_slice(data);
        pos
    }

    /// Write a NUL-terminated string, returning its position.
    pub fn string(&mut self, s: &str) -> usize {
        self.align(4);
        let pos = self.body.len();
        self.body
            .extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.body.extend_from_slice(s.as_bytes());
        self.body.push(0);
        pos
    }

    /// Write a vector of `count` table references, all awaiting patches.
    pub fn ref_vector(&mut self, count: usize) -> (usize, Vec<PatchSlot>) {
        self.align(4);
        let pos = self.body.len();
        self.body.extend_from_slice(&(count as u32).to_le_bytes());
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            slots.push(PatchSlot(self.body.len()));
            self.body.extend_from_slice(&[0u8; 4]);
        }
        (pos, slots)
    }

    /// Finalize: set the root table offset and prepend the size prefix.
    #[must_use]
    pub fn finish(mut self, root_pos: usize) -> Vec<u8> {
        LittleEndian::write_u32(&mut self.body[0..4], root_pos as u32);
        let mut out = Vec::with_capacity(SIZE_PREFIX_LEN + self.body.len());
        out.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

// ---------------------------------------------------------------------
// Read side.
// ---------------------------------------------------------------------

fn read_u16_at(buf: &[u8], pos: usize) -> Option<u16> {
    buf.get(pos..pos + 2).map(LittleEndian::read_u16)
}

fn read_u32_at(buf: &[u8], pos: usize) -> Option<u32> {
    buf.get(pos..pos + 4).map(LittleEndian::read_u32)
}

/// True if the record body carries the given file identifier.
#[must_use]
pub fn has_identifier(body: &[u8], ident: &[u8; IDENT_LEN]) -> bool {
    body.get(IDENT_POS..IDENT_POS + IDENT_LEN) == Some(ident.as_slice())
}

/// Resolve the root table of a record body, verifying the identifier.
#[must_use]
pub fn root_table<'a>(body: &'a [u8], ident: &[u8; IDENT_LEN]) -> Option<Table<'a>> {
    if !has_identifier(body, ident) {
        return None;
    }
    let root = read_u32_at(body, 0)? as usize;
    Table::at(body, root)
}

/// A table within a record body. Field access never panics; out-of-bounds
/// or absent content reads as the field default.
#[derive(Debug, Clone, Copy)]
pub struct Table<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Table<'a> {
    fn at(buf: &'a [u8], pos: usize) -> Option<Self> {
        if pos + 4 > buf.len() {
            return None;
        }
        Some(Self { buf, pos })
    }

    /// Position of a field's data, or `None` when absent.
    fn field(&self, id: u16) -> Option<usize> {
        let backlink = read_u32_at(self.buf, self.pos)? as i32;
        let vt = self.pos as i64 - i64::from(backlink);
        if vt < 0 {
            return None;
        }
        let vt = vt as usize;
        let vt_len = read_u16_at(self.buf, vt)?;
        let entry = 4 + 2 * usize::from(id);
        if entry + 2 > usize::from(vt_len) {
            return None;
        }
        let off = read_u16_at(self.buf, vt + entry)?;
        if off == 0 {
            return None;
        }
        Some(self.pos + usize::from(off))
    }

    /// Read a `u8` field, with default.
    #[must_use]
    pub fn get_u8(&self, id: u16, default: u8) -> u8 {
        self.field(id)
            .and_then(|p| self.buf.get(p).copied())
            .unwrap_or(default)
    }

    /// Read a bool field, with default.
    #[must_use]
    pub fn get_bool(&self, id: u16, default: bool) -> bool {
        self.get_u8(id, u8::from(default)) != 0
    }

    /// Read a `u16` field, with default.
    #[must_use]
    pub fn get_u16(&self, id: u16, default: u16) -> u16 {
        self.field(id)
            .and_then(|p| read_u16_at(self.buf, p))
            .unwrap_or(default)
    }

    /// Read a `u32` field, with default.
    #[must_use]
    pub fn get_u32(&self, id: u16, default: u32) -> u32 {
        self.field(id)
            .and_then(|p| read_u32_at(self.buf, p))
            .unwrap_or(default)
    }

    /// Read a `u64` field, with default.
    #[must_use]
    pub fn get_u64(&self, id: u16, default: u64) -> u64 {
        self.field(id)
            .and_then(|p| self.buf.get(p..p + 8))
            .map_or(default, LittleEndian::read_u64)
    }

    /// Follow a reference field to a sub-table.
    #[must_use]
    pub fn get_table(&self, id: u16) -> Option<Table<'a>> {
        let fp = self.field(id)?;
        let rel = read_u32_at(self.buf, fp)? as usize;
        Table::at(self.buf, fp + rel)
    }

    /// Follow a reference field to a byte vector.
    #[must_use]
    pub fn get_bytes(&self, id: u16) -> Option<&'a [u8]> {
        let fp = self.field(id)?;
        let rel = read_u32_at(self.buf, fp)? as usize;
        let vpos = fp + rel;
        let n = read_u32_at(self.buf, vpos)? as usize;
        self.buf.get(vpos + 4..(vpos + 4).checked_add(n)?)
    }

    /// Follow a reference field to a string.
    #[must_use]
    pub fn get_str(&self, id: u16) -> Option<&'a str> {
        std::str::from_utf8(self.get_bytes(id)?).ok()
    }

    /// Read an inline struct field of `len` bytes.
    #[must_use]
    pub fn get_struct(&self, id: u16, len: usize) -> Option<&'a [u8]> {
        let fp = self.field(id)?;
        self.buf.get(fp..fp.checked_add(len)?)
    }

    /// Follow a reference field to a vector of table references.
    #[must_use]
    pub fn get_vector(&self, id: u16) -> Option<Vector<'a>> {
        let fp = self.field(id)?;
        let rel = read_u32_at(self.buf, fp)? as usize;
        let vpos = fp + rel;
        let count = read_u32_at(self.buf, vpos)? as usize;
        if (vpos + 4).checked_add(count.checked_mul(4)?)? > self.buf.len() {
            return None;
        }
        Some(Vector {
            buf: self.buf,
            pos: vpos + 4,
            count,
        })
    }
}

/// A vector of table references.
#[derive(Debug, Clone, Copy)]
pub struct Vector<'a> {
    buf: &'a [u8],
    pos: usize,
    count: usize,
}

impl<'a> Vector<'a> {
    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// True when the vector holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Resolve element `i` as a table.
    #[must_use]
    pub fn table(&self, i: usize) -> Option<Table<'a>> {
        if i >= self.count {
            return None;
        }
        let epos = self.pos + 4 * i;
        let rel = read_u32_at(self.buf, epos)? as usize;
        Table::at(self.buf, epos + rel)
    }
}

// ---------------------------------------------------------------------
// Record framing.
// ---------------------------------------------------------------------

/// Scan the unread region of `stream` for the next record with a matching
/// file identifier.
///
/// Every inspected record advances the stream cursor past itself; records
/// with a foreign identifier are skipped. A zero size prefix ends the scan.
/// On success the matching body is returned (copied out of the stream) and
/// the cursor rests just past it. On exhaustion the cursor is left at the
/// stream end and `None` is returned; the caller reports no-message.
pub fn find_next_record<S: Stream>(
    stream: &mut S,
    ident: &[u8; IDENT_LEN],
) -> Result<Option<Vec<u8>>> {
    let mut found: Option<(Vec<u8>, usize)> = None;
    {
        let data = stream.read(PosOp::Nc)?;
        let mut off = 0usize;
        while off + SIZE_PREFIX_LEN <= data.len() {
            let size = LittleEndian::read_u32(&data[off..]) as usize;
            if size == 0 {
                break;
            }
            let start = off + SIZE_PREFIX_LEN;
            let Some(end) = start.checked_add(size) else {
                break;
            };
            if end > data.len() {
                // Truncated trailing record; nothing more to consume.
                break;
            }
            off = end;
            if has_identifier(&data[start..end], ident) {
                found = Some((data[start..end].to_vec(), off));
                break;
            }
            log::trace!("skipping record with foreign identifier ({size} bytes)");
        }
    }
    match found {
        Some((body, advance)) => {
            stream.seek(advance as u64, SeekOp::Cur)?;
            Ok(Some(body))
        }
        None => {
            stream.seek(0, SeekOp::End)?;
            Ok(None)
        }
    }
}
