//! Canonical self-relative encoding of descriptors. The dedup machinery
//! compares raw bytes, so the encoder is deterministic: one logical
//! descriptor has exactly one byte image. Layout: a fixed 20-byte header
//! (revision, control word, four offsets) followed by the owner SID, group
//! SID, SACL and DACL payloads in that order; offset 0 marks an absent
//! field.

use super::{Ace, AceKind, Acl, Descriptor, Sid, ACL_REVISION, SID_REVISION};

pub const DESCRIPTOR_REVISION: u8 = 1;

pub const CONTROL_DACL_PRESENT: u16 = 0x0004;
pub const CONTROL_SACL_PRESENT: u16 = 0x0010;
pub const CONTROL_SELF_RELATIVE: u16 = 0x8000;

const HEADER_LEN: usize = 20;
const MAX_SUB_AUTHORITIES: usize = 15;

fn sid_len(sid: &Sid) -> usize {
    8 + 4 * sid.sub_authorities.len()
}

fn ace_len(ace: &Ace) -> usize {
    8 + sid_len(&ace.sid)
}

fn acl_len(acl: &Acl) -> usize {
    8 + acl.aces.iter().map(ace_len).sum::<usize>()
}

fn check_sid(sid: &Sid) -> Result<(), String> {
    if sid.sub_authorities.len() > MAX_SUB_AUTHORITIES {
        return Err("sid sub-authority count out of range".into());
    }
    Ok(())
}

fn check_acl(acl: &Acl) -> Result<(), String> {
    for ace in &acl.aces {
        check_sid(&ace.sid)?;
    }
    // The size and count fields are 16 bits on the wire.
    if acl.aces.len() > u16::MAX as usize || acl_len(acl) > u16::MAX as usize {
        return Err("acl exceeds its 16-bit size field".into());
    }
    Ok(())
}

fn encode_sid(out: &mut Vec<u8>, sid: &Sid) {
    out.push(SID_REVISION);
    out.push(sid.sub_authorities.len() as u8);
    out.extend_from_slice(&sid.authority);
    for sub in &sid.sub_authorities {
        out.extend_from_slice(&sub.to_le_bytes());
    }
}

fn encode_acl(out: &mut Vec<u8>, acl: &Acl) {
    out.push(ACL_REVISION);
    out.push(0);
    out.extend_from_slice(&(acl_len(acl) as u16).to_le_bytes());
    out.extend_from_slice(&(acl.aces.len() as u16).to_le_bytes());
    out.extend_from_slice(&[0, 0]);
    for ace in &acl.aces {
        out.push(match ace.kind {
            AceKind::AccessAllowed => 0,
            AceKind::AccessDenied => 1,
        });
        out.push(ace.flags);
        out.extend_from_slice(&(ace_len(ace) as u16).to_le_bytes());
        out.extend_from_slice(&ace.mask.to_le_bytes());
        encode_sid(out, &ace.sid);
    }
}

pub fn encode(desc: &Descriptor) -> Result<Vec<u8>, String> {
    if let Some(s) = &desc.owner {
        check_sid(s)?;
    }
    if let Some(s) = &desc.group {
        check_sid(s)?;
    }
    if let Some(a) = &desc.sacl {
        check_acl(a)?;
    }
    if let Some(a) = &desc.dacl {
        check_acl(a)?;
    }

    let mut control = CONTROL_SELF_RELATIVE;
    if desc.dacl.is_some() {
        control |= CONTROL_DACL_PRESENT;
    }
    if desc.sacl.is_some() {
        control |= CONTROL_SACL_PRESENT;
    }

    let mut off = HEADER_LEN;
    let mut owner_off = 0u32;
    let mut group_off = 0u32;
    let mut sacl_off = 0u32;
    let mut dacl_off = 0u32;
    if let Some(s) = &desc.owner {
        owner_off = off as u32;
        off += sid_len(s);
    }
    if let Some(s) = &desc.group {
        group_off = off as u32;
        off += sid_len(s);
    }
    if let Some(a) = &desc.sacl {
        sacl_off = off as u32;
        off += acl_len(a);
    }
    if let Some(a) = &desc.dacl {
        dacl_off = off as u32;
        off += acl_len(a);
    }

    let mut out = Vec::with_capacity(off);
    out.push(DESCRIPTOR_REVISION);
    out.push(0);
    out.extend_from_slice(&control.to_le_bytes());
    out.extend_from_slice(&owner_off.to_le_bytes());
    out.extend_from_slice(&group_off.to_le_bytes());
    out.extend_from_slice(&sacl_off.to_le_bytes());
    out.extend_from_slice(&dacl_off.to_le_bytes());
    if let Some(s) = &desc.owner {
        encode_sid(&mut out, s);
    }
    if let Some(s) = &desc.group {
        encode_sid(&mut out, s);
    }
    if let Some(a) = &desc.sacl {
        encode_acl(&mut out, a);
    }
    if let Some(a) = &desc.dacl {
        encode_acl(&mut out, a);
    }
    Ok(out)
}

fn get_u16(buf: &[u8], off: usize) -> Result<u16, String> {
    if buf.len() < off + 2 {
        return Err("truncated".into());
    }
    Ok(u16::from_le_bytes([buf[off], buf[off + 1]]))
}

fn get_u32(buf: &[u8], off: usize) -> Result<u32, String> {
    if buf.len() < off + 4 {
        return Err("truncated".into());
    }
    Ok(u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]))
}

fn parse_sid(buf: &[u8], off: usize) -> Result<(Sid, usize), String> {
    if buf.len() < off + 8 {
        return Err("truncated sid".into());
    }
    if buf[off] != SID_REVISION {
        return Err(format!("bad sid revision {}", buf[off]));
    }
    let count = buf[off + 1] as usize;
    if count > MAX_SUB_AUTHORITIES {
        return Err("sid sub-authority count out of range".into());
    }
    let mut authority = [0u8; 6];
    authority.copy_from_slice(&buf[off + 2..off + 8]);
    let mut subs = Vec::with_capacity(count);
    for i in 0..count {
        subs.push(get_u32(buf, off + 8 + i * 4)?);
    }
    Ok((Sid { authority, sub_authorities: subs }, 8 + count * 4))
}

fn parse_acl(buf: &[u8], off: usize) -> Result<Acl, String> {
    if buf.len() < off + 8 {
        return Err("truncated acl".into());
    }
    if buf[off] != ACL_REVISION {
        return Err(format!("bad acl revision {}", buf[off]));
    }
    let total = get_u16(buf, off + 2)? as usize;
    let count = get_u16(buf, off + 4)? as usize;
    if buf.len() < off + total {
        return Err("acl size exceeds descriptor".into());
    }
    let mut aces = Vec::with_capacity(count);
    let mut pos = off + 8;
    for _ in 0..count {
        if buf.len() < pos + 8 {
            return Err("truncated ace".into());
        }
        let kind = match buf[pos] {
            0 => AceKind::AccessAllowed,
            1 => AceKind::AccessDenied,
            other => return Err(format!("unknown ace type {}", other)),
        };
        let flags = buf[pos + 1];
        let size = get_u16(buf, pos + 2)? as usize;
        if size < 8 || pos + size > off + total {
            return Err("ace size out of range".into());
        }
        let mask = get_u32(buf, pos + 4)?;
        let (sid, sid_used) = parse_sid(buf, pos + 8)?;
        if 8 + sid_used != size {
            return Err("ace size disagrees with sid".into());
        }
        aces.push(Ace { kind, flags, mask, sid });
        pos += size;
    }
    Ok(Acl { aces })
}

pub fn parse(bytes: &[u8]) -> Result<Descriptor, String> {
    if bytes.len() < HEADER_LEN {
        return Err("truncated header".into());
    }
    if bytes[0] != DESCRIPTOR_REVISION {
        return Err(format!("bad descriptor revision {}", bytes[0]));
    }
    let control = get_u16(bytes, 2)?;
    if control & CONTROL_SELF_RELATIVE == 0 {
        return Err("descriptor is not self-relative".into());
    }
    let owner_off = get_u32(bytes, 4)? as usize;
    let group_off = get_u32(bytes, 8)? as usize;
    let sacl_off = get_u32(bytes, 12)? as usize;
    let dacl_off = get_u32(bytes, 16)? as usize;

    let owner = if owner_off != 0 { Some(parse_sid(bytes, owner_off)?.0) } else { None };
    let group = if group_off != 0 { Some(parse_sid(bytes, group_off)?.0) } else { None };
    let sacl = if control & CONTROL_SACL_PRESENT != 0 && sacl_off != 0 {
        Some(parse_acl(bytes, sacl_off)?)
    } else {
        None
    };
    let dacl = if control & CONTROL_DACL_PRESENT != 0 && dacl_off != 0 {
        Some(parse_acl(bytes, dacl_off)?)
    } else {
        None
    };
    Ok(Descriptor { owner, group, dacl, sacl })
}
