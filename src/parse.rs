use crate::*;
use binread::{BinRead, BinReaderExt};
use derivative::*;
use indexmap::IndexMap;
use std::{borrow::Cow, io::Cursor};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
/// An enum representing all possible errors when reading a SARC archive
pub enum SarcError {
    #[error("File index {0} out of range")]
    OutOfRange(usize),
    #[error("File {0} not found in archive")]
    FileNotFound(String),
    #[error("Invalid {0} value: \"{1}\"")]
    InvalidData(String, String),
    #[error("A string in the name table was not terminated")]
    UnterminatedStringError,
    #[error("Invalid UTF file name")]
    InvalidFileName(#[from] std::str::Utf8Error),
    #[error("Failed to decompress archive: {0}")]
    Decompression(String),
    #[error(transparent)]
    ParseError(#[from] binread::Error),
}

pub type Result<T> = core::result::Result<T, SarcError>;

fn find_null(data: &[u8]) -> Result<usize> {
    data.iter()
        .position(|b| b == &0u8)
        .ok_or(SarcError::UnterminatedStringError)
}

fn read<T: BinRead>(endian: Endian, reader: &mut Cursor<&[u8]>) -> Result<T> {
    Ok(match endian {
        Endian::Big => reader.read_be()?,
        Endian::Little => reader.read_le()?,
    })
}

/// Byte range of a file, relative to the start of the data section
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
struct FileRange {
    begin: u32,
    end: u32,
}

#[derive(Derivative)]
#[derivative(Debug)]
/// A simple SARC archive reader
///
/// The index is built once when parsing. File data is never copied: every accessor
/// returns a slice of the buffer the archive was created from.
pub struct Sarc<'a> {
    data_offset: u32,
    endian: Endian,
    entries: IndexMap<String, FileRange>,
    #[derivative(Debug = "ignore")]
    data: Cow<'a, [u8]>,
}

impl PartialEq for Sarc<'_> {
    /// Returns true if and only if the raw archive data is identical
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl<'a> Sarc<'a> {
    /// Parses a SARC archive from binary data
    ///
    /// Archives must declare version 0x0100 and the standard section header sizes (0x14,
    /// 0x0C and 0x08); anything else is rejected as invalid data rather than read leniently.
    pub fn new<T>(data: T) -> Result<Sarc<'a>>
    where
        T: Into<Cow<'a, [u8]>>,
    {
        let data = data.into();
        if !data.starts_with(&SARC_MAGIC) {
            return Err(SarcError::InvalidData(
                "SARC magic".to_owned(),
                String::from_utf8_lossy(&data[..data.len().min(4)]).into_owned(),
            ));
        }
        let endian = data
            .get(6..8)
            .and_then(|bom| Endian::from_bom([bom[0], bom[1]]))
            .ok_or_else(|| {
                SarcError::InvalidData(
                    "SARC byte order mark".to_owned(),
                    format!("{:02X?}", data.get(6..8).unwrap_or_default()),
                )
            })?;

        let mut reader = Cursor::new(data.as_ref());
        let header: ResHeader = read(endian, &mut reader)?;
        if header.version != VERSION {
            return Err(SarcError::InvalidData(
                "SARC version".to_owned(),
                header.version.to_string(),
            ));
        }
        if header.header_size as usize != 0x14 {
            return Err(SarcError::InvalidData(
                "SARC header size".to_owned(),
                header.header_size.to_string(),
            ));
        }

        let fat_header: ResFatHeader = read(endian, &mut reader)?;
        if fat_header.magic != SFAT_MAGIC {
            return Err(SarcError::InvalidData(
                "SFAT magic".to_owned(),
                String::from_utf8_lossy(&fat_header.magic).into_owned(),
            ));
        }
        if fat_header.header_size as usize != 0x0C {
            return Err(SarcError::InvalidData(
                "SFAT header size".to_owned(),
                fat_header.header_size.to_string(),
            ));
        }
        if (fat_header.num_files >> 0xE) != 0 {
            return Err(SarcError::InvalidData(
                "SFAT file count".to_owned(),
                fat_header.num_files.to_string(),
            ));
        }

        // Nodes are stored sorted by name hash. That order is kept as is.
        let nodes = (0..fat_header.num_files)
            .map(|_| read::<ResFatEntry>(endian, &mut reader))
            .collect::<Result<Vec<_>>>()?;

        let fnt_header: ResFntHeader = read(endian, &mut reader)?;
        if fnt_header.magic != SFNT_MAGIC {
            return Err(SarcError::InvalidData(
                "SFNT magic".to_owned(),
                String::from_utf8_lossy(&fnt_header.magic).into_owned(),
            ));
        }
        if fnt_header.header_size as usize != 0x08 {
            return Err(SarcError::InvalidData(
                "SFNT header size".to_owned(),
                fnt_header.header_size.to_string(),
            ));
        }

        let names_offset = reader.position() as usize;
        let data_offset = header.data_offset;
        if (data_offset as usize) < names_offset {
            return Err(SarcError::InvalidData(
                "name table offset".to_owned(),
                names_offset.to_string(),
            ));
        }

        let mut entries = IndexMap::with_capacity(nodes.len());
        let mut rel_name_offset = 0;
        for node in nodes {
            let name_offset = names_offset + align(rel_name_offset, 4);
            let name_data = data
                .get(name_offset..)
                .ok_or(SarcError::UnterminatedStringError)?;
            let term_pos = find_null(name_data)?;
            let name = std::str::from_utf8(&name_data[..term_pos])?;
            rel_name_offset = name_offset - names_offset + term_pos + 1;

            if node.data_end < node.data_begin
                || data_offset as usize + node.data_end as usize > data.len()
            {
                return Err(SarcError::InvalidData(
                    format!("data range of {}", name),
                    format!("{:#x}..{:#x}", node.data_begin, node.data_end),
                ));
            }
            trace!(
                "{} ({:#010x}): {:#x}..{:#x}",
                name,
                node.name_hash,
                node.data_begin,
                node.data_end
            );
            entries.insert(
                name.to_owned(),
                FileRange {
                    begin: node.data_begin,
                    end: node.data_end,
                },
            );
        }

        debug!(
            "Parsed {:?} endian SARC with {} files, data at {:#x}",
            endian,
            entries.len(),
            data_offset
        );
        Ok(Sarc {
            data,
            data_offset,
            endian,
            entries,
        })
    }

    /// Parses an archive that may be wrapped in a compressed stream.
    ///
    /// Returns `Ok(None)` if the data is neither a SARC archive nor a compressed stream whose
    /// payload starts with a SARC archive.
    pub fn from_container(
        data: &'a [u8],
        decompressor: &dyn Decompressor,
    ) -> Result<Option<Sarc<'a>>> {
        if decompressor.is_wrapped(data) {
            if decompressor.payload_magic(data) != Some(&b"SARC"[..]) {
                return Ok(None);
            }
            let decompressed = decompressor.decompress(data)?;
            debug!(
                "Decompressed container: {} bytes -> {} bytes",
                data.len(),
                decompressed.len()
            );
            return Sarc::new(decompressed).map(Some);
        }
        if data.starts_with(b"SARC") {
            Sarc::new(data).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Parses a plain or Yaz0 compressed SARC archive
    pub fn open(data: &'a [u8]) -> Result<Option<Sarc<'a>>> {
        Self::from_container(data, &Yaz0)
    }

    /// Get the number of files that are stored in the archive
    pub fn file_count(&self) -> usize {
        self.entries.len()
    }

    /// Get the offset to the beginning of file data
    pub fn data_offset(&self) -> usize {
        self.data_offset as usize
    }

    /// Get the archive endianness
    pub fn endian(&self) -> Endian {
        self.endian
    }

    fn file_data(&self, range: &FileRange) -> &[u8] {
        &self.data[(self.data_offset + range.begin) as usize..(self.data_offset + range.end) as usize]
    }

    /// Get a file by name
    pub fn get_file(&self, file: &str) -> Option<File> {
        self.entries.get_key_value(file).map(|(name, range)| File {
            name: name.as_str(),
            data: self.file_data(range),
        })
    }

    /// Get a file by index. Returns error if index > file count.
    pub fn file_at(&self, index: usize) -> Result<File> {
        let (name, range) = self
            .entries
            .get_index(index)
            .ok_or(SarcError::OutOfRange(index))?;
        Ok(File {
            name: name.as_str(),
            data: self.file_data(range),
        })
    }

    /// Returns an iterator over the contained files, in name hash order
    pub fn files(&'_ self) -> impl Iterator<Item = File<'_>> {
        self.entries.iter().map(move |(name, range)| File {
            name: name.as_str(),
            data: self.file_data(range),
        })
    }

    /// Get the size of a file in bytes
    pub fn file_size(&self, file: &str) -> Result<usize> {
        self.range(file).map(|r| (r.end - r.begin) as usize)
    }

    /// Get the offset of a file relative to the data section
    pub fn file_data_offset(&self, file: &str) -> Result<usize> {
        self.range(file).map(|r| r.begin as usize)
    }

    /// Lists every file with its data offset, ordered by offset
    pub fn file_offsets(&self) -> Vec<(&str, usize)> {
        let mut offsets: Vec<(&str, usize)> = self
            .entries
            .iter()
            .map(|(name, range)| (name.as_str(), range.begin as usize))
            .collect();
        offsets.sort_by_key(|(_, offset)| *offset);
        offsets
    }

    /// Returns true if a file is itself a SARC archive, possibly Yaz0 compressed
    pub fn is_archive(&self, file: &str) -> Result<bool> {
        let range = self.range(file)?;
        Ok(is_sarc_data(self.file_data(range)))
    }

    fn range(&self, file: &str) -> Result<&FileRange> {
        self.entries
            .get(file)
            .ok_or_else(|| SarcError::FileNotFound(file.to_owned()))
    }

    /// Guess the minimum data alignment for files that are stored in the archive
    pub fn guess_min_alignment(&self) -> usize {
        const MIN_ALIGNMENT: u32 = 4;
        let gcd = self.entries.values().fold(MIN_ALIGNMENT, |gcd, range| {
            num::integer::gcd(gcd, self.data_offset + range.begin)
        });

        if !is_valid_alignment(gcd as usize) {
            return MIN_ALIGNMENT as usize;
        }
        gcd as usize
    }

    /// Returns true is each archive contains the same files
    pub fn are_files_equal(sarc1: &Sarc, sarc2: &Sarc) -> bool {
        sarc1.file_count() == sarc2.file_count()
            && sarc1
                .files()
                .zip(sarc2.files())
                .all(|(file1, file2)| file1 == file2)
    }
}

#[cfg(test)]
mod tests {
    use crate::{Endian, Sarc, SarcError, SarcWriter};

    fn sample(endian: Endian) -> Vec<u8> {
        let mut writer = SarcWriter::new(endian);
        writer.add_file("A/x.txt", &b"hi"[..]);
        writer.add_file("B/y.bin", &b"\x00\x01"[..]);
        writer.write_to_bytes().unwrap()
    }

    #[test]
    fn parse_sarc() {
        let data = sample(Endian::Big);
        let sarc = Sarc::new(&data).unwrap();
        assert_eq!(sarc.endian(), Endian::Big);
        assert_eq!(sarc.file_count(), 2);
        assert_eq!(sarc.guess_min_alignment(), 4);
        assert_eq!(sarc.get_file("A/x.txt").unwrap().data, b"hi");
        assert_eq!(sarc.get_file("B/y.bin").unwrap().data, b"\x00\x01");
        assert_eq!(sarc.file_size("A/x.txt").unwrap(), 2);
        assert!(sarc.get_file("C/z.txt").is_none());
        assert!(matches!(
            sarc.file_size("C/z.txt"),
            Err(SarcError::FileNotFound(_))
        ));
        assert!(matches!(sarc.file_at(2), Err(SarcError::OutOfRange(2))));
    }

    #[test]
    fn parse_keeps_node_order() {
        let data = sample(Endian::Little);
        let sarc = Sarc::new(data).unwrap();
        let hashes: Vec<u32> = sarc
            .files()
            .map(|f| crate::hash_name(0x65, f.name))
            .collect();
        let mut sorted = hashes.clone();
        sorted.sort_unstable();
        assert_eq!(hashes, sorted);
        let offsets = sarc.file_offsets();
        assert_eq!(offsets[0].1, 0);
        assert!(offsets[1].1 >= 2);
    }

    #[test]
    fn reject_bad_magic() {
        let mut data = sample(Endian::Big);
        data[0] = b'X';
        assert!(matches!(
            Sarc::new(&data),
            Err(SarcError::InvalidData(..))
        ));
        assert!(Sarc::new(&b"SA"[..]).is_err());
    }

    #[test]
    fn reject_bad_bom() {
        let mut data = sample(Endian::Big);
        data[6] = 0x12;
        data[7] = 0x34;
        assert!(matches!(
            Sarc::new(&data),
            Err(SarcError::InvalidData(..))
        ));
    }

    #[test]
    fn reject_unknown_version_and_header_size() {
        let mut data = sample(Endian::Big);
        data[0x10..0x12].copy_from_slice(&[0x02, 0x00]);
        assert!(matches!(
            Sarc::new(&data),
            Err(SarcError::InvalidData(ref what, _)) if what == "SARC version"
        ));

        let mut data = sample(Endian::Little);
        data[4] = 0x18;
        assert!(matches!(
            Sarc::new(&data),
            Err(SarcError::InvalidData(ref what, _)) if what == "SARC header size"
        ));
    }

    #[test]
    fn reject_truncated() {
        let data = sample(Endian::Little);
        assert!(Sarc::new(&data[..0x20]).is_err());
        assert!(Sarc::new(&data[..data.len() - 1]).is_err());
    }

    #[test]
    fn detect_nested_archive() {
        let inner = sample(Endian::Big);
        let mut writer = SarcWriter::new(Endian::Big);
        writer.add_file("Pack/Inner.sarc", inner.as_slice());
        writer.add_file("Text/readme.txt", &b"not an archive"[..]);
        let outer = writer.write_to_bytes().unwrap();
        let sarc = Sarc::new(&outer).unwrap();
        assert!(sarc.is_archive("Pack/Inner.sarc").unwrap());
        assert!(!sarc.is_archive("Text/readme.txt").unwrap());
    }

    #[test]
    fn open_plain_and_reject_unknown() {
        let data = sample(Endian::Big);
        let sarc = Sarc::open(&data).unwrap().unwrap();
        assert_eq!(sarc.file_count(), 2);
        assert!(Sarc::open(b"BNTX0000").unwrap().is_none());
    }

    #[test]
    fn equal_files() {
        let be = sample(Endian::Big);
        let le = sample(Endian::Little);
        let sarc_be = Sarc::new(&be).unwrap();
        let sarc_le = Sarc::new(&le).unwrap();
        assert!(Sarc::are_files_equal(&sarc_be, &sarc_le));
        assert!(sarc_be != sarc_le);
    }
}
