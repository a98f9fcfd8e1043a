//! Reading and writing of Nintendo SARC archives.
//!
//! [`Sarc`] parses an archive into a name index over the original buffer, [`SarcWriter`]
//! lays out and serializes a set of named blobs with the alignment each file needs.
use binread::BinRead;
use binwrite::BinWrite;
mod align;
mod parse;
mod writer;
mod yaz0;
pub use align::{AlignmentConfig, ContextRule, UniformFileSetRule};
pub use parse::{Sarc, SarcError};
pub use writer::{SarcWriteError, SarcWriter};
pub use yaz0::{Decompressor, Yaz0};

const SARC_MAGIC: [u8; 4] = *b"SARC";
const SFAT_MAGIC: [u8; 4] = *b"SFAT";
const SFNT_MAGIC: [u8; 4] = *b"SFNT";

const BOM: u16 = 0xFEFF;
const VERSION: u16 = 0x0100;
const HASH_MULTIPLIER: u32 = 0x65;

/// Hashes a file name the way the archive's node table keys it.
///
/// The hash folds over the characters of `name`, so it does not depend on the archive
/// endianness.
pub fn hash_name(multiplier: u32, name: &str) -> u32 {
    name.chars().fold(0u32, |hash, c| {
        hash.wrapping_mul(multiplier).wrapping_add(c as u32)
    })
}

/// Returns true if `data` is a SARC archive, either plain or inside a Yaz0 stream.
///
/// Only the leading fourCC of the compressed stream is inspected.
pub fn is_sarc_data(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    match &data[0..4] {
        b"SARC" => true,
        b"Yaz0" => data.len() >= 0x15 && &data[0x11..0x15] == b"SARC",
        _ => false,
    }
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Endian {
    Big,
    Little,
}

impl Endian {
    /// Interprets the two BOM bytes as stored in the archive header.
    fn from_bom(bytes: [u8; 2]) -> Option<Self> {
        match bytes {
            [0xFE, 0xFF] => Some(Self::Big),
            [0xFF, 0xFE] => Some(Self::Little),
            _ => None,
        }
    }

    fn writer_options(self) -> binwrite::WriterOption {
        let mut opts = binwrite::WriterOption::default();
        opts.endian = match self {
            Endian::Big => binwrite::Endian::Big,
            Endian::Little => binwrite::Endian::Little,
        };
        opts
    }
}

/// A file stored in an archive, borrowed from the archive buffer.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct File<'a> {
    pub name: &'a str,
    pub data: &'a [u8],
}

/// Size = 0x14
#[derive(Debug, Eq, PartialEq, Copy, Clone, BinRead, BinWrite)]
struct ResHeader {
    magic: [u8; 4],
    header_size: u16,
    bom: u16,
    file_size: u32,
    data_offset: u32,
    version: u16,
    reserved: u16,
}

/// Size = 0x0C
#[derive(Debug, Copy, Clone, Eq, PartialEq, BinRead, BinWrite)]
struct ResFatHeader {
    magic: [u8; 4],
    header_size: u16,
    num_files: u16,
    hash_multiplier: u32,
}

/// Size = 0x10
#[derive(Debug, PartialEq, Eq, Copy, Clone, BinRead, BinWrite)]
struct ResFatEntry {
    name_hash: u32,
    rel_name_opt_offset: u32,
    data_begin: u32,
    data_end: u32,
}

/// Size = 0x8
#[derive(Debug, PartialEq, Eq, Copy, Clone, BinRead, BinWrite)]
struct ResFntHeader {
    magic: [u8; 4],
    header_size: u16,
    reserved: u16,
}

fn is_valid_alignment(alignment: usize) -> bool {
    alignment != 0 && (alignment & (alignment - 1)) == 0
}

fn align(pos: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        pos
    } else {
        pos.next_multiple_of(alignment)
    }
}

fn checked_align(pos: usize, alignment: usize) -> Option<usize> {
    if alignment <= 1 {
        Some(pos)
    } else {
        pos.checked_next_multiple_of(alignment)
    }
}
