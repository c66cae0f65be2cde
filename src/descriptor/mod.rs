//!
//! Security descriptor primitive
//! -----------------------------
//! Self-relative access-control descriptors: owner and group SIDs plus
//! optional discretionary and system ACLs, with a canonical byte encoding
//! (`codec`), field-level merge/query and subject-vs-descriptor access
//! evaluation (`ops`), and the key rights / generic mapping constants
//! (`rights`). The descriptor store upstream dedups on the exact bytes this
//! module produces, so encoding is canonical: equal descriptors encode to
//! equal bytes.

pub mod codec;
pub mod ops;
pub mod rights;

pub use ops::{evaluate_access, merge_fields, query_fields, ActorContext, QueryError};

use rights::{KEY_ALL_ACCESS, KEY_READ};

/// Security identifier: identifier authority plus sub-authorities.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sid {
    pub authority: [u8; 6],
    pub sub_authorities: Vec<u32>,
}

pub const SID_REVISION: u8 = 1;

impl Sid {
    pub fn new(authority: u8, sub_authorities: &[u32]) -> Self {
        Self {
            authority: [0, 0, 0, 0, 0, authority],
            sub_authorities: sub_authorities.to_vec(),
        }
    }

    /// Everyone (world authority).
    pub fn world() -> Self {
        Sid::new(1, &[0])
    }

    /// Restricted code.
    pub fn restricted() -> Self {
        Sid::new(5, &[12])
    }

    /// The operating system itself.
    pub fn local_system() -> Self {
        Sid::new(5, &[18])
    }

    /// Built-in administrators alias.
    pub fn builtin_admins() -> Self {
        Sid::new(5, &[32, 544])
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AceKind {
    AccessAllowed,
    AccessDenied,
}

/// ACE inheritance flag: child containers inherit this entry.
pub const ACE_CONTAINER_INHERIT: u8 = 0x02;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ace {
    pub kind: AceKind,
    pub flags: u8,
    pub mask: u32,
    pub sid: Sid,
}

impl Ace {
    pub fn allowed(mask: u32, sid: Sid) -> Self {
        Self { kind: AceKind::AccessAllowed, flags: 0, mask, sid }
    }

    pub fn denied(mask: u32, sid: Sid) -> Self {
        Self { kind: AceKind::AccessDenied, flags: 0, mask, sid }
    }

    pub fn inheritable(mut self) -> Self {
        self.flags |= ACE_CONTAINER_INHERIT;
        self
    }
}

pub const ACL_REVISION: u8 = 2;

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Acl {
    pub aces: Vec<Ace>,
}

/// Parsed form of a descriptor. `dacl: None` means "no DACL present",
/// which grants everyone everything; an empty DACL denies everyone.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Descriptor {
    pub owner: Option<Sid>,
    pub group: Option<Sid>,
    pub dacl: Option<Acl>,
    pub sacl: Option<Acl>,
}

impl Descriptor {
    /// Canonical byte image. Fails when a field does not fit the wire
    /// format, an ACL past its 16-bit size field for instance.
    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        codec::encode(self)
    }
}

/// Which descriptor fields an operation addresses. Any subset of
/// owner/group/DACL/SACL.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FieldSet(pub u8);

impl FieldSet {
    pub const OWNER: FieldSet = FieldSet(0x1);
    pub const GROUP: FieldSet = FieldSet(0x2);
    pub const DACL: FieldSet = FieldSet(0x4);
    pub const SACL: FieldSet = FieldSet(0x8);
    pub const ALL: FieldSet = FieldSet(0xF);

    pub fn contains(self, other: FieldSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: FieldSet) -> FieldSet {
        FieldSet(self.0 | other.0)
    }
}

/// Default descriptor for a freshly created hive root: system and
/// administrators get full control, world and restricted code get read,
/// all entries inheritable by child keys. Owner and group are set so the
/// owner rule in access evaluation has something to match.
pub fn root_descriptor() -> Descriptor {
    let dacl = Acl {
        aces: vec![
            Ace::allowed(KEY_ALL_ACCESS, Sid::local_system()).inheritable(),
            Ace::allowed(KEY_ALL_ACCESS, Sid::builtin_admins()).inheritable(),
            Ace::allowed(KEY_READ, Sid::world()).inheritable(),
            Ace::allowed(KEY_READ, Sid::restricted()).inheritable(),
        ],
    };
    Descriptor {
        owner: Some(Sid::builtin_admins()),
        group: Some(Sid::local_system()),
        dacl: Some(dacl),
        sacl: None,
    }
}
