use anyhow::{Result, anyhow};
use memmap2::{MmapMut, MmapOptions};
use nix::{
    libc::{PROT_NONE, mprotect},
    unistd::{SysconfVar, sysconf},
};

/// An mmap'ed stack for `clone(2)` with a guard page below it.
///
/// Stacks grow down, so the guard sits at the lowest address where an
/// overflow would land.
pub struct GuardedStack {
    mmap: MmapMut,
    guard: usize,
}

impl GuardedStack {
    pub fn new(stack_size: usize) -> Result<Self> {
        let page_size = page_size()?;

        if stack_size == 0 || stack_size % page_size != 0 {
            return Err(anyhow!(
                "stack_size must be a non-zero multiple of the system page size ({page_size} bytes)"
            ));
        }

        let total_size = stack_size
            .checked_add(page_size)
            .ok_or_else(|| anyhow!("stack_size + guard page overflows usize"))?;

        let mut mmap = MmapOptions::new().len(total_size).stack().map_anon()?;

        // SAFETY: the mapping starts page-aligned and is at least one page
        // long; `mmap` keeps it alive for as long as `Self`.
        let ret = unsafe { mprotect(mmap.as_mut_ptr().cast(), page_size, PROT_NONE) };
        if ret != 0 {
            return Err(anyhow!(
                "Failed to set guard page protection: {}",
                std::io::Error::last_os_error()
            ));
        }

        Ok(Self {
            mmap,
            guard: page_size,
        })
    }

    /// The usable stack, above the guard page.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap[self.guard..]
    }
}

fn page_size() -> Result<usize> {
    match sysconf(SysconfVar::PAGE_SIZE)? {
        Some(size) if size > 0 => Ok(size as usize),
        Some(_) => Err(anyhow!("PAGE_SIZE returned non-positive value")),
        None => Err(anyhow!("PAGE_SIZE is not defined on this system")),
    }
}
