use std::{
    fmt::{self, Display},
    io::Read,
    path::Path,
};

use crate::{DeckutilsError, DeckutilsResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The compression applied on top of a tarball.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    /// LZMA2 in an xz container (`.txz`, `.tar.xz`).
    Xz,

    /// Zstandard (`.tzst`, `.tar.zst`).
    Zstd,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CompressionFormat {
    /// Determines the format from an archive file name.
    pub fn from_path(path: impl AsRef<Path>) -> DeckutilsResult<Self> {
        let name = path
            .as_ref()
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if name.ends_with(".txz") || name.ends_with(".tar.xz") {
            Ok(CompressionFormat::Xz)
        } else if name.ends_with(".tzst") || name.ends_with(".tar.zst") {
            Ok(CompressionFormat::Zstd)
        } else {
            Err(DeckutilsError::UnsupportedArchive(name))
        }
    }

    /// Wraps a compressed byte stream in the matching decoder.
    pub(crate) fn decoder<'a, R>(self, reader: R) -> std::io::Result<Box<dyn Read + 'a>>
    where
        R: Read + 'a,
    {
        Ok(match self {
            CompressionFormat::Xz => Box::new(xz2::read::XzDecoder::new(reader)),
            CompressionFormat::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionFormat::Xz => write!(f, "xz"),
            CompressionFormat::Zstd => write!(f, "zstd"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
