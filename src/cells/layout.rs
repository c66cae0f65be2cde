//! Persisted byte layouts for the two cell kinds the engine owns: security
//! cells (descriptor + refcount + ring links) and key nodes. All fields are
//! little-endian; each cell opens with a signature tag that readers verify.

use super::CellIndex;

pub const SECURITY_SIGNATURE: u32 = 0x6b73; // "sk"
pub const NODE_SIGNATURE: u32 = 0x6b6e; // "nk"

/// Marks the root node of a hive; its security cell anchors the ring.
pub const NODE_FLAG_HIVE_ENTRY: u32 = 0x1;

pub const SECURITY_HEADER_LEN: usize = 20;
pub const NODE_SIZE: usize = 32;

/// Cell size required to hold a descriptor of the given length.
pub fn security_cell_size(descriptor_len: usize) -> usize {
    SECURITY_HEADER_LEN + descriptor_len
}

pub fn child_list_size(count: usize) -> usize {
    count * 4
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn get_i64(buf: &[u8], off: usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    i64::from_le_bytes(b)
}

fn put_i64(buf: &mut [u8], off: usize, v: i64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Header of a security cell. `reference_count` equals the number of nodes
/// currently pointing at this cell; `flink`/`blink` thread the per-hive
/// ring of live security cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecurityHeader {
    pub reference_count: u32,
    pub flink: CellIndex,
    pub blink: CellIndex,
    pub descriptor_length: u32,
}

impl SecurityHeader {
    pub fn read(buf: &[u8]) -> Option<Self> {
        if buf.len() < SECURITY_HEADER_LEN || get_u32(buf, 0) != SECURITY_SIGNATURE {
            return None;
        }
        let hdr = Self {
            reference_count: get_u32(buf, 4),
            flink: CellIndex(get_u32(buf, 8)),
            blink: CellIndex(get_u32(buf, 12)),
            descriptor_length: get_u32(buf, 16),
        };
        if buf.len() < security_cell_size(hdr.descriptor_length as usize) {
            return None;
        }
        Some(hdr)
    }

    pub fn write(&self, buf: &mut [u8]) {
        put_u32(buf, 0, SECURITY_SIGNATURE);
        put_u32(buf, 4, self.reference_count);
        put_u32(buf, 8, self.flink.0);
        put_u32(buf, 12, self.blink.0);
        put_u32(buf, 16, self.descriptor_length);
    }
}

/// Initialize a freshly allocated security cell: refcount 1, NIL links
/// (ring linkage happens separately), descriptor bytes copied inline.
pub fn init_security_cell(buf: &mut [u8], descriptor: &[u8]) {
    let hdr = SecurityHeader {
        reference_count: 1,
        flink: CellIndex::NIL,
        blink: CellIndex::NIL,
        descriptor_length: descriptor.len() as u32,
    };
    hdr.write(buf);
    buf[SECURITY_HEADER_LEN..SECURITY_HEADER_LEN + descriptor.len()].copy_from_slice(descriptor);
}

pub fn security_descriptor_bytes(buf: &[u8]) -> Option<&[u8]> {
    let hdr = SecurityHeader::read(buf)?;
    let len = hdr.descriptor_length as usize;
    Some(&buf[SECURITY_HEADER_LEN..SECURITY_HEADER_LEN + len])
}

/// Overwrite the descriptor bytes of a cell in place. Only valid when the
/// new descriptor has exactly the stored length.
pub fn overwrite_security_descriptor(buf: &mut [u8], descriptor: &[u8]) {
    debug_assert_eq!(
        SecurityHeader::read(buf).map(|h| h.descriptor_length as usize),
        Some(descriptor.len())
    );
    buf[SECURITY_HEADER_LEN..SECURITY_HEADER_LEN + descriptor.len()].copy_from_slice(descriptor);
}

/// Persisted key node. The subkey list lives in its own cell so the node
/// cell keeps a stable index while the list grows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyNode {
    pub flags: u32,
    pub parent: CellIndex,
    pub security: CellIndex,
    pub last_write_ms: i64,
    pub subkey_count: u32,
    pub subkey_list: CellIndex,
}

impl KeyNode {
    pub fn new(parent: CellIndex, flags: u32, last_write_ms: i64) -> Self {
        Self {
            flags,
            parent,
            security: CellIndex::NIL,
            last_write_ms,
            subkey_count: 0,
            subkey_list: CellIndex::NIL,
        }
    }

    pub fn read(buf: &[u8]) -> Option<Self> {
        if buf.len() < NODE_SIZE || get_u32(buf, 0) != NODE_SIGNATURE {
            return None;
        }
        Some(Self {
            flags: get_u32(buf, 4),
            parent: CellIndex(get_u32(buf, 8)),
            security: CellIndex(get_u32(buf, 12)),
            last_write_ms: get_i64(buf, 16),
            subkey_count: get_u32(buf, 24),
            subkey_list: CellIndex(get_u32(buf, 28)),
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        put_u32(buf, 0, NODE_SIGNATURE);
        put_u32(buf, 4, self.flags);
        put_u32(buf, 8, self.parent.0);
        put_u32(buf, 12, self.security.0);
        put_i64(buf, 16, self.last_write_ms);
        put_u32(buf, 24, self.subkey_count);
        put_u32(buf, 28, self.subkey_list.0);
    }

    pub fn is_hive_entry(&self) -> bool {
        self.flags & NODE_FLAG_HIVE_ENTRY != 0
    }
}

pub fn child_at(list: &[u8], i: usize) -> Option<CellIndex> {
    if list.len() < (i + 1) * 4 {
        return None;
    }
    Some(CellIndex(get_u32(list, i * 4)))
}

pub fn write_child(list: &mut [u8], i: usize, child: CellIndex) {
    put_u32(list, i * 4, child.0);
}
