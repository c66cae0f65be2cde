//! Access decisions over stored descriptor bytes. The checker never reads
//! the SACL: it extracts owner, group and DACL through the query path
//! (small fixed buffer first, one retry at the exact reported size) and
//! evaluates the result against the key rights mapping.

use tracing::debug;

use crate::descriptor::ops::{evaluate_access, query_fields, ActorContext, QueryError};
use crate::descriptor::rights::key_generic_mapping;
use crate::descriptor::FieldSet;
use crate::error::{RegError, RegResult};

const FIRST_ATTEMPT_LEN: usize = 256;

fn relevant_fields() -> FieldSet {
    FieldSet::OWNER.union(FieldSet::GROUP).union(FieldSet::DACL)
}

/// Decide whether `actor` holds `desired` over the descriptor in `bytes`.
/// `Ok(())` is a grant; a completed negative answer is `Denied`.
pub fn check_descriptor_access(bytes: &[u8], actor: &ActorContext, desired: u32) -> RegResult<()> {
    let fields = relevant_fields();
    let mut first = [0u8; FIRST_ATTEMPT_LEN];
    let mut len = first.len();
    let extracted = match query_fields(fields, bytes, &mut first, &mut len) {
        Ok(()) => first[..len].to_vec(),
        Err(QueryError::BufferTooSmall) => {
            debug!(target: "regvault::access", "descriptor needs {} bytes, retrying", len);
            let mut out = vec![0u8; len];
            let mut len2 = len;
            query_fields(fields, bytes, &mut out, &mut len2).map_err(|e| match e {
                QueryError::Malformed(r) => RegError::malformed(r),
                QueryError::BufferTooSmall => {
                    RegError::malformed("descriptor size changed between query attempts")
                }
            })?;
            out.truncate(len2);
            out
        }
        Err(QueryError::Malformed(r)) => return Err(RegError::malformed(r)),
    };

    let mapping = key_generic_mapping();
    match evaluate_access(&extracted, actor, desired, &mapping) {
        Ok(true) => Ok(()),
        Ok(false) => Err(RegError::Denied),
        Err(r) => Err(RegError::malformed(r)),
    }
}
