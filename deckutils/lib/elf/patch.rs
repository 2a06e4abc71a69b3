use std::{
    fs::OpenOptions,
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use goblin::{
    container::{Container, Ctx},
    elf::{
        header::{Header, EI_DATA, ELFDATA2LSB, ET_DYN, ET_EXEC},
        program_header::{ProgramHeader, PT_INTERP, PT_TLS},
        Elf,
    },
};

use crate::{DeckutilsError, DeckutilsResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The TLS segment alignment the Android dynamic linker requires of the translator.
pub const REQUIRED_TLS_ALIGNMENT: u64 = 64;

/// Offset of `e_type` inside the ELF header.
const E_TYPE_OFFSET: u64 = 16;

/// Offset of `p_align` inside a 64-bit program header.
const P_ALIGN_OFFSET_64: u64 = 48;

/// Offset of `p_align` inside a 32-bit program header.
const P_ALIGN_OFFSET_32: u64 = 28;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What a patch operation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The file was rewritten.
    Patched,

    /// The file already had the requested value; nothing was written.
    AlreadyApplied,

    /// The binary has nothing to patch for this operation (e.g. no TLS segment).
    NotApplicable,
}

/// Patches the ELF header and program headers of one binary on disk.
#[derive(Debug, Clone)]
pub struct ElfPatcher {
    path: PathBuf,
}

/// A parsed view of the parts of the file the patcher touches.
struct ElfImage {
    bytes: Vec<u8>,
    header: Header,
    program_headers: Vec<ProgramHeader>,
    is_64: bool,
    little_endian: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ElfPatcher {
    /// Creates a patcher for the binary at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// The binary this patcher operates on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Converts a fixed-address executable (`ET_EXEC`) into a position-independent one
    /// (`ET_DYN`).
    pub fn ensure_pie(&self) -> DeckutilsResult<PatchOutcome> {
        let image = self.load()?;

        match image.header.e_type {
            ET_DYN => Ok(PatchOutcome::AlreadyApplied),
            ET_EXEC => {
                self.write_at(E_TYPE_OFFSET, &image.encode_u16(ET_DYN))?;
                tracing::info!(binary = %self.path.display(), "converted executable to PIE");
                Ok(PatchOutcome::Patched)
            }
            other => Err(DeckutilsError::patch(
                &self.path,
                format!("unexpected ELF type {other}, expected an executable"),
            )),
        }
    }

    /// Raises the alignment of the `PT_TLS` segment to `alignment`.
    ///
    /// Segments that already satisfy the alignment are left alone, as are binaries without
    /// a TLS segment.
    pub fn ensure_tls_alignment(&self, alignment: u64) -> DeckutilsResult<PatchOutcome> {
        if !alignment.is_power_of_two() {
            return Err(DeckutilsError::patch(
                &self.path,
                format!("requested TLS alignment {alignment} is not a power of two"),
            ));
        }

        let image = self.load()?;
        let Some((index, tls)) = image
            .program_headers
            .iter()
            .enumerate()
            .find(|(_, ph)| ph.p_type == PT_TLS)
        else {
            return Ok(PatchOutcome::NotApplicable);
        };

        if tls.p_align >= alignment {
            return Ok(PatchOutcome::AlreadyApplied);
        }

        let offset = image.program_header_offset(index)
            + if image.is_64 {
                P_ALIGN_OFFSET_64
            } else {
                P_ALIGN_OFFSET_32
            };
        let encoded = if image.is_64 {
            image.encode_u64(alignment)
        } else {
            image.encode_u32(alignment as u32)
        };

        self.write_at(offset, &encoded)?;
        tracing::info!(
            binary = %self.path.display(),
            from = tls.p_align,
            to = alignment,
            "raised TLS segment alignment"
        );

        Ok(PatchOutcome::Patched)
    }

    /// Returns the dynamic linker path stored in the `PT_INTERP` segment, if any.
    pub fn interpreter(&self) -> DeckutilsResult<Option<String>> {
        let image = self.load()?;
        match image.interp_field() {
            Some(Ok((start, len))) => Ok(Some(read_c_string(&image.bytes[start..start + len]))),
            Some(Err(reason)) => Err(DeckutilsError::patch(&self.path, reason)),
            None => Ok(None),
        }
    }

    /// Overwrites the dynamic linker path stored in the `PT_INTERP` segment.
    ///
    /// The segment is a fixed-width field baked in at link time. The replacement plus its
    /// terminating NUL must fit in it; when it does not, the file is left untouched and
    /// [`DeckutilsError::InterpreterTooLong`] is returned.
    pub fn set_interpreter(&self, replacement: &str) -> DeckutilsResult<PatchOutcome> {
        if replacement.is_empty() || replacement.contains('\0') {
            return Err(DeckutilsError::patch(
                &self.path,
                "interpreter path must be non-empty and must not contain NUL",
            ));
        }

        let image = self.load()?;
        let (start, available) = match image.interp_field() {
            Some(Ok(field)) => field,
            Some(Err(reason)) => return Err(DeckutilsError::patch(&self.path, reason)),
            None => {
                return Err(DeckutilsError::patch(
                    &self.path,
                    "binary has no PT_INTERP segment",
                ))
            }
        };

        let current = read_c_string(&image.bytes[start..start + available]);
        if current == replacement {
            return Ok(PatchOutcome::AlreadyApplied);
        }

        let needed = replacement.len() + 1;
        if needed > available {
            return Err(DeckutilsError::InterpreterTooLong {
                path: self.path.clone(),
                replacement: replacement.to_string(),
                needed,
                available,
            });
        }

        let mut field = vec![0u8; available];
        field[..replacement.len()].copy_from_slice(replacement.as_bytes());
        self.write_at(start as u64, &field)?;

        tracing::info!(
            binary = %self.path.display(),
            from = %current,
            to = %replacement,
            "rewrote ELF interpreter"
        );

        Ok(PatchOutcome::Patched)
    }

    fn load(&self) -> DeckutilsResult<ElfImage> {
        let bytes = std::fs::read(&self.path)?;
        let header = Elf::parse_header(&bytes)
            .map_err(|e| DeckutilsError::patch(&self.path, e.to_string()))?;
        let container = header
            .container()
            .map_err(|e| DeckutilsError::patch(&self.path, e.to_string()))?;
        let endian = header
            .endianness()
            .map_err(|e| DeckutilsError::patch(&self.path, e.to_string()))?;

        let program_headers = ProgramHeader::parse(
            &bytes,
            header.e_phoff as usize,
            header.e_phnum as usize,
            Ctx::new(container, endian),
        )
        .map_err(|e| DeckutilsError::patch(&self.path, e.to_string()))?;

        Ok(ElfImage {
            is_64: container == Container::Big,
            little_endian: header.e_ident[EI_DATA] == ELFDATA2LSB,
            bytes,
            header,
            program_headers,
        })
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> DeckutilsResult<()> {
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(())
    }
}

impl ElfImage {
    fn program_header_offset(&self, index: usize) -> u64 {
        self.header.e_phoff + index as u64 * self.header.e_phentsize as u64
    }

    /// Locates the `PT_INTERP` string field as `(file offset, width)`.
    fn interp_field(&self) -> Option<Result<(usize, usize), String>> {
        let interp = self.program_headers.iter().find(|ph| ph.p_type == PT_INTERP)?;
        let start = interp.p_offset as usize;
        let len = interp.p_filesz as usize;

        if len == 0 || start.checked_add(len).map_or(true, |end| end > self.bytes.len()) {
            return Some(Err(format!(
                "PT_INTERP segment ({start:#x}+{len:#x}) lies outside the file"
            )));
        }

        Some(Ok((start, len)))
    }

    fn encode_u16(&self, value: u16) -> Vec<u8> {
        if self.little_endian {
            value.to_le_bytes().to_vec()
        } else {
            value.to_be_bytes().to_vec()
        }
    }

    fn encode_u32(&self, value: u32) -> Vec<u8> {
        if self.little_endian {
            value.to_le_bytes().to_vec()
        } else {
            value.to_be_bytes().to_vec()
        }
    }

    fn encode_u64(&self, value: u64) -> Vec<u8> {
        if self.little_endian {
            value.to_le_bytes().to_vec()
        } else {
            value.to_be_bytes().to_vec()
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn read_c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
