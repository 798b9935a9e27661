use crate::error::{Result, SandboxError};

/// Upper bound on a synthesized map line, terminator included.
const IDMAP_LEN: usize = 32;

/// Builds the single-entry map `"<id> <lowerid> 1"`: `id` inside the new
/// user namespace is `lowerid` outside of it.
pub fn build_idmap(id: u32, lowerid: u32) -> Result<String> {
    let map = format!("{id} {lowerid} 1");

    if map.len() >= IDMAP_LEN {
        return Err(SandboxError::IdMap(map));
    }

    Ok(map)
}
