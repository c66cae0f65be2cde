//! Access rights for namespace keys and the fixed generic mapping applied
//! before any access evaluation.

pub const KEY_QUERY_VALUE: u32 = 0x0001;
pub const KEY_SET_VALUE: u32 = 0x0002;
pub const KEY_CREATE_SUB_KEY: u32 = 0x0004;
pub const KEY_ENUMERATE_SUB_KEYS: u32 = 0x0008;
pub const KEY_NOTIFY: u32 = 0x0010;
pub const KEY_CREATE_LINK: u32 = 0x0020;

pub const DELETE: u32 = 0x0001_0000;
pub const READ_CONTROL: u32 = 0x0002_0000;
pub const WRITE_DAC: u32 = 0x0004_0000;
pub const WRITE_OWNER: u32 = 0x0008_0000;

pub const KEY_READ: u32 =
    READ_CONTROL | KEY_QUERY_VALUE | KEY_ENUMERATE_SUB_KEYS | KEY_NOTIFY;
pub const KEY_WRITE: u32 = READ_CONTROL | KEY_SET_VALUE | KEY_CREATE_SUB_KEY;
pub const KEY_EXECUTE: u32 = KEY_READ;
pub const KEY_ALL_ACCESS: u32 = KEY_READ
    | KEY_WRITE
    | KEY_CREATE_LINK
    | DELETE
    | WRITE_DAC
    | WRITE_OWNER;

pub const GENERIC_READ: u32 = 0x8000_0000;
pub const GENERIC_WRITE: u32 = 0x4000_0000;
pub const GENERIC_EXECUTE: u32 = 0x2000_0000;
pub const GENERIC_ALL: u32 = 0x1000_0000;

const GENERIC_MASK: u32 = GENERIC_READ | GENERIC_WRITE | GENERIC_EXECUTE | GENERIC_ALL;

/// Translation of generic access bits into object-specific rights.
#[derive(Clone, Copy, Debug)]
pub struct GenericMapping {
    pub read: u32,
    pub write: u32,
    pub execute: u32,
    pub all: u32,
}

impl GenericMapping {
    /// Replace any generic bits in `desired` with their specific rights.
    pub fn map(&self, desired: u32) -> u32 {
        let mut out = desired & !GENERIC_MASK;
        if desired & GENERIC_READ != 0 {
            out |= self.read;
        }
        if desired & GENERIC_WRITE != 0 {
            out |= self.write;
        }
        if desired & GENERIC_EXECUTE != 0 {
            out |= self.execute;
        }
        if desired & GENERIC_ALL != 0 {
            out |= self.all;
        }
        out
    }
}

/// The fixed mapping for namespace keys.
pub fn key_generic_mapping() -> GenericMapping {
    GenericMapping {
        read: KEY_READ,
        write: KEY_WRITE,
        execute: KEY_EXECUTE,
        all: KEY_ALL_ACCESS,
    }
}
