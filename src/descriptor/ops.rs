//! Field-level descriptor operations and access evaluation. These are the
//! primitives the store and checker consume: merge a subset of fields over
//! a current descriptor, extract a subset into a caller buffer, and decide
//! whether a subject holds the desired access.

use tracing::debug;

use super::codec;
use super::rights::{GenericMapping, READ_CONTROL};
use super::{Descriptor, AceKind, FieldSet, Sid};

/// The evaluated subject: the identity SIDs captured by the caller
/// (identity capture itself happens outside this crate).
#[derive(Clone, Debug, Default)]
pub struct ActorContext {
    pub sids: Vec<Sid>,
}

impl ActorContext {
    pub fn new(sids: Vec<Sid>) -> Self {
        Self { sids }
    }

    pub fn holds(&self, sid: &Sid) -> bool {
        self.sids.iter().any(|s| s == sid)
    }
}

/// Merge the selected fields of `modification` over `current`, producing a
/// full canonical descriptor. Unselected fields are carried over unchanged.
pub fn merge_fields(
    current: &[u8],
    fields: FieldSet,
    modification: &[u8],
) -> Result<Vec<u8>, String> {
    let mut base = codec::parse(current)?;
    let patch = codec::parse(modification)?;
    if fields.contains(FieldSet::OWNER) {
        base.owner = patch.owner;
    }
    if fields.contains(FieldSet::GROUP) {
        base.group = patch.group;
    }
    if fields.contains(FieldSet::DACL) {
        base.dacl = patch.dacl;
    }
    if fields.contains(FieldSet::SACL) {
        base.sacl = patch.sacl;
    }
    codec::encode(&base)
}

#[derive(Debug, PartialEq, Eq)]
pub enum QueryError {
    /// Output buffer too small; the required size has been written to the
    /// caller's length so it can retry once with a larger buffer.
    BufferTooSmall,
    Malformed(String),
}

/// Extract the selected fields of `bytes` into `out` as a self-relative
/// descriptor. On success `*length` is the number of bytes written; on
/// `BufferTooSmall` it is the required size.
pub fn query_fields(
    fields: FieldSet,
    bytes: &[u8],
    out: &mut [u8],
    length: &mut usize,
) -> Result<(), QueryError> {
    let full = codec::parse(bytes).map_err(QueryError::Malformed)?;
    let subset = Descriptor {
        owner: if fields.contains(FieldSet::OWNER) { full.owner } else { None },
        group: if fields.contains(FieldSet::GROUP) { full.group } else { None },
        dacl: if fields.contains(FieldSet::DACL) { full.dacl } else { None },
        sacl: if fields.contains(FieldSet::SACL) { full.sacl } else { None },
    };
    let encoded = codec::encode(&subset).map_err(QueryError::Malformed)?;
    if encoded.len() > *length || encoded.len() > out.len() {
        *length = encoded.len();
        return Err(QueryError::BufferTooSmall);
    }
    out[..encoded.len()].copy_from_slice(&encoded);
    *length = encoded.len();
    Ok(())
}

/// Evaluate `desired` access for `actor` against a descriptor. Generic
/// bits are mapped first; an owner match implicitly grants READ_CONTROL;
/// a missing DACL grants everything; a matching denied entry refuses the
/// whole request; otherwise allowed entries must cover every desired bit.
pub fn evaluate_access(
    bytes: &[u8],
    actor: &ActorContext,
    desired: u32,
    mapping: &GenericMapping,
) -> Result<bool, String> {
    let desc = codec::parse(bytes)?;
    let desired = mapping.map(desired);
    let mut remaining = desired;

    if let Some(owner) = &desc.owner {
        if actor.holds(owner) {
            remaining &= !READ_CONTROL;
        }
    }
    if remaining == 0 {
        debug!(target: "regvault::descriptor", "access granted (owner), desired={:#x}", desired);
        return Ok(true);
    }

    let dacl = match &desc.dacl {
        // No DACL at all: everything is granted.
        None => {
            debug!(target: "regvault::descriptor", "access granted (no dacl), desired={:#x}", desired);
            return Ok(true);
        }
        Some(d) => d,
    };

    for ace in &dacl.aces {
        if !actor.holds(&ace.sid) {
            continue;
        }
        match ace.kind {
            AceKind::AccessDenied => {
                // Only outstanding bits can be refused; bits an earlier
                // allowed entry already granted stay granted.
                if ace.mask & remaining != 0 {
                    debug!(target: "regvault::descriptor", "access denied by ace, desired={:#x}", desired);
                    return Ok(false);
                }
            }
            AceKind::AccessAllowed => {
                remaining &= !ace.mask;
                if remaining == 0 {
                    break;
                }
            }
        }
    }

    let granted = remaining == 0;
    debug!(
        target: "regvault::descriptor",
        "access {} desired={:#x} remaining={:#x}",
        if granted { "granted" } else { "denied" },
        desired,
        remaining
    );
    Ok(granted)
}
