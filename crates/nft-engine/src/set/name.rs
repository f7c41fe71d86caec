//! Names for anonymous sets.
//!
//! A template such as `__set%d` names a family of sets. Allocation scans
//! the names already taken in a window of ids and hands out the lowest
//! free one, moving the window up until a free id turns up. The result is
//! checked once more against the live table before it is handed out.

use nft_common::{NftError, Result, NAME_MAXLEN};

/// Ids examined per scan.
const WINDOW: u64 = 8 * 4096;

/// Returns true if `name` is a template rather than a literal name.
pub(crate) fn is_template(name: &str) -> bool {
    name.contains('%')
}

fn split_template(template: &str) -> Result<(&str, &str)> {
    let bad = || NftError::invalid(format!("bad set name template {}", template));
    let pos = template.find('%').ok_or_else(bad)?;
    let (prefix, rest) = template.split_at(pos);
    let suffix = rest.strip_prefix("%d").ok_or_else(bad)?;
    if suffix.contains('%') {
        return Err(bad());
    }
    Ok((prefix, suffix))
}

fn parse_id(name: &str, prefix: &str, suffix: &str) -> Option<u64> {
    let digits = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Expands `template` to the lowest name not in `taken`. `exists` is the
/// final lookup; a hit there is a collision and fails the allocation.
pub(crate) fn alloc_name(template: &str, taken: &[String], exists: impl Fn(&str) -> bool) -> Result<String> {
    if template.len() >= NAME_MAXLEN {
        return Err(NftError::invalid("set name template too long"));
    }
    let (prefix, suffix) = split_template(template)?;
    let ids: Vec<u64> = taken.iter().filter_map(|n| parse_id(n, prefix, suffix)).collect();

    let mut base = 0u64;
    loop {
        let mut used = vec![false; WINDOW as usize];
        for id in ids.iter().filter(|id| (base..base + WINDOW).contains(*id)) {
            used[(id - base) as usize] = true;
        }
        if let Some(free) = used.iter().position(|u| !u) {
            let name = format!("{}{}{}", prefix, base + free as u64, suffix);
            if name.len() >= NAME_MAXLEN {
                return Err(NftError::invalid("set name too long"));
            }
            if exists(&name) {
                return Err(NftError::exhausted(format!("anonymous set name {} collides", name)));
            }
            return Ok(name);
        }
        base = base
            .checked_add(WINDOW)
            .ok_or_else(|| NftError::exhausted("no free anonymous set name"))?;
    }
}
