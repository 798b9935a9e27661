use anyhow::{Context, Result, bail, ensure};
use memmap2::Mmap;
use std::{fs::File, path::Path};

/// How a program's runtime image gets resolved at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    Static,
    Dynamic,
}

pub trait BinaryClassifier {
    fn classify(&self, path: &Path) -> Result<Linkage>;
}

/// Classifies ELF executables by looking for a `PT_INTERP` program header.
///
/// A binary without an interpreter cannot have a library preloaded into it,
/// which is exactly the distinction the launcher cares about; static-pie
/// binaries therefore count as static.
#[derive(Debug, Default, Clone, Copy)]
pub struct ElfClassifier;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const PT_INTERP: u32 = 3;

impl BinaryClassifier for ElfClassifier {
    fn classify(&self, path: &Path) -> Result<Linkage> {
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let len = file.metadata()?.len();
        ensure!(len >= 64, "{} is too small to be an ELF file", path.display());

        // SAFETY: the mapping is read-only and dropped before returning; a
        // concurrent truncation can only make the header checks fail.
        let image = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to map {}", path.display()))?;

        linkage(&image)
    }
}

/// Classifies an in-memory ELF image.
pub fn linkage(image: &[u8]) -> Result<Linkage> {
    ensure!(image.starts_with(ELF_MAGIC), "missing ELF magic");

    let header = Header::parse(image)?;
    ensure!(
        header.kind == ET_EXEC || header.kind == ET_DYN,
        "ELF type {} is not executable",
        header.kind
    );

    for index in 0..header.phnum {
        let offset = index
            .checked_mul(header.phentsize)
            .and_then(|offset| offset.checked_add(header.phoff))
            .context("program header table overflows")?;

        if header.u32_at(image, offset)? == PT_INTERP {
            return Ok(Linkage::Dynamic);
        }
    }

    Ok(Linkage::Static)
}

struct Header {
    big_endian: bool,
    kind: u16,
    phoff: usize,
    phentsize: usize,
    phnum: usize,
}

impl Header {
    fn parse(image: &[u8]) -> Result<Self> {
        let big_endian = match image.get(EI_DATA) {
            Some(&ELFDATA2LSB) => false,
            Some(&ELFDATA2MSB) => true,
            other => bail!("unknown ELF data encoding {other:?}"),
        };

        let mut header = Self {
            big_endian,
            kind: 0,
            phoff: 0,
            phentsize: 0,
            phnum: 0,
        };

        header.kind = header.u16_at(image, 0x10)?;

        match image.get(EI_CLASS) {
            Some(&ELFCLASS32) => {
                header.phoff = header.u32_at(image, 0x1c)? as usize;
                header.phentsize = header.u16_at(image, 0x2a)? as usize;
                header.phnum = header.u16_at(image, 0x2c)? as usize;
            }
            Some(&ELFCLASS64) => {
                header.phoff = usize::try_from(header.u64_at(image, 0x20)?)
                    .context("program header offset out of range")?;
                header.phentsize = header.u16_at(image, 0x36)? as usize;
                header.phnum = header.u16_at(image, 0x38)? as usize;
            }
            other => bail!("unknown ELF class {other:?}"),
        }

        ensure!(header.phentsize >= 4, "program header entries are too small");
        Ok(header)
    }

    fn bytes<const N: usize>(image: &[u8], offset: usize) -> Result<[u8; N]> {
        image
            .get(offset..offset.saturating_add(N))
            .and_then(|bytes| bytes.try_into().ok())
            .with_context(|| format!("truncated ELF image at offset {offset:#x}"))
    }

    fn u16_at(&self, image: &[u8], offset: usize) -> Result<u16> {
        let bytes: [u8; 2] = Self::bytes(image, offset)?;
        Ok(match self.big_endian {
            true => u16::from_be_bytes(bytes),
            false => u16::from_le_bytes(bytes),
        })
    }

    fn u32_at(&self, image: &[u8], offset: usize) -> Result<u32> {
        let bytes: [u8; 4] = Self::bytes(image, offset)?;
        Ok(match self.big_endian {
            true => u32::from_be_bytes(bytes),
            false => u32::from_le_bytes(bytes),
        })
    }

    fn u64_at(&self, image: &[u8], offset: usize) -> Result<u64> {
        let bytes: [u8; 8] = Self::bytes(image, offset)?;
        Ok(match self.big_endian {
            true => u64::from_be_bytes(bytes),
            false => u64::from_le_bytes(bytes),
        })
    }
}
