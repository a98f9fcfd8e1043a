use crate::align::AlignmentTable;
use crate::*;
use binwrite::BinWrite;
use std::borrow::Cow;
use std::collections::{btree_map::Entry, BTreeMap, HashMap};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

pub type Result<T> = core::result::Result<T, SarcWriteError>;

#[derive(Debug, Error)]
pub enum SarcWriteError {
    #[error("{0} is not a valid alignment")]
    InvalidAlignmentError(usize),
    #[error("File {0} not found in archive")]
    FileNotFound(String),
    #[error("Too many files for one archive: {0}")]
    TooManyFiles(usize),
    #[error("Archive would exceed 4 GiB ({0:#x} bytes)")]
    ArchiveTooLarge(usize),
    #[error("Invalid alignment rule data: {0}")]
    InvalidConfig(#[from] serde_json::Error),
    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, PartialEq, Clone)]
struct FileRecord<'a> {
    name: String,
    data: Cow<'a, [u8]>,
}

/// Position of one file in the data section
#[derive(Debug)]
struct PlannedFile<'w, 'a> {
    hash: u32,
    file: &'w FileRecord<'a>,
    alignment: usize,
    begin: usize,
}

/// Data section layout, checked to fit the archive's 32-bit offsets
#[derive(Debug)]
struct Layout<'w, 'a> {
    files: Vec<PlannedFile<'w, 'a>>,
    data_offset: usize,
    data_alignment: usize,
    file_size: usize,
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| SarcWriteError::ArchiveTooLarge(value))
}

/// Writes zero bytes until the stream position, relative to `base`, is a multiple of
/// `alignment`. Returns the new relative position.
fn pad<W: Write + Seek>(writer: &mut W, base: u64, alignment: usize) -> Result<usize> {
    let pos = (writer.stream_position()? - base) as usize;
    let aligned = align(pos, alignment);
    std::io::copy(&mut std::io::repeat(0).take((aligned - pos) as u64), writer)?;
    Ok(aligned)
}

/// A SARC archive builder
///
/// Files are keyed by their name hash: adding a file whose name hashes to the same value as
/// an existing one replaces it. File data is borrowed where possible and only read when the
/// archive is written.
#[derive(Debug, PartialEq, Clone)]
pub struct SarcWriter<'a> {
    endian: Endian,
    legacy: bool,
    hash_multiplier: u32,
    min_alignment: usize,
    alignment_map: HashMap<String, usize>,
    config: Arc<AlignmentConfig>,
    file_map: BTreeMap<u32, FileRecord<'a>>,
}

impl<'a> SarcWriter<'a> {
    pub fn new(endian: Endian) -> SarcWriter<'a> {
        Self::with_config(endian, Arc::new(AlignmentConfig::default()))
    }

    pub fn with_config(endian: Endian, config: Arc<AlignmentConfig>) -> SarcWriter<'a> {
        SarcWriter {
            endian,
            legacy: false,
            hash_multiplier: HASH_MULTIPLIER,
            min_alignment: 4,
            alignment_map: HashMap::new(),
            config,
            file_map: BTreeMap::new(),
        }
    }

    /// Creates a writer holding every file of an existing archive
    pub fn from_sarc(sarc: &'a Sarc) -> SarcWriter<'a> {
        Self::from_sarc_filtered(sarc, |_| true)
    }

    /// Creates a writer holding the files of an existing archive for which `filter` returns true
    pub fn from_sarc_filtered<F>(sarc: &'a Sarc, filter: F) -> SarcWriter<'a>
    where
        F: Fn(&str) -> bool,
    {
        let mut writer = SarcWriter::new(sarc.endian());
        for file in sarc.files().filter(|f| filter(f.name)) {
            writer.add_file(file.name, file.data);
        }
        writer
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian
    }

    pub fn file_count(&self) -> usize {
        self.file_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file_map.is_empty()
    }

    /// Adds a file, replacing any file whose name has the same hash
    pub fn add_file<N, D>(&mut self, name: N, data: D)
    where
        N: Into<String>,
        D: Into<Cow<'a, [u8]>>,
    {
        let name = name.into();
        let hash = hash_name(self.hash_multiplier, &name);
        let record = FileRecord {
            name,
            data: data.into(),
        };
        match self.file_map.entry(hash) {
            Entry::Occupied(mut entry) => {
                if entry.get().name != record.name {
                    debug!(
                        "{} replaces {} (name hash {:#010x})",
                        record.name,
                        entry.get().name,
                        hash
                    );
                }
                entry.insert(record);
            }
            Entry::Vacant(entry) => {
                entry.insert(record);
            }
        }
    }

    /// Removes the file stored under the hash of `name`
    pub fn delete_file(&mut self, name: &str) -> Result<()> {
        self.file_map
            .remove(&hash_name(self.hash_multiplier, name))
            .map(|_| ())
            .ok_or_else(|| SarcWriteError::FileNotFound(name.to_owned()))
    }

    pub fn get_file(&self, name: &str) -> Option<&[u8]> {
        self.file_map
            .get(&hash_name(self.hash_multiplier, name))
            .filter(|file| file.name == name)
            .map(|file| file.data.as_ref())
    }

    /// Returns the stored files in name hash order
    pub fn files(&self) -> impl Iterator<Item = File<'_>> {
        self.file_map.values().map(|file| File {
            name: file.name.as_str(),
            data: file.data.as_ref(),
        })
    }

    /// Sets an alignment for an extension (without the dot). It takes precedence over the
    /// rule data and the built-in requirements.
    pub fn add_alignment_requirement(&mut self, ext: String, alignment: usize) -> Result<()> {
        if !is_valid_alignment(alignment) {
            return Err(SarcWriteError::InvalidAlignmentError(alignment));
        }
        self.alignment_map.insert(ext, alignment);
        Ok(())
    }

    /// Sets the alignment used for files that no rule applies to
    pub fn set_min_alignment(&mut self, alignment: usize) -> Result<()> {
        if !is_valid_alignment(alignment) {
            return Err(SarcWriteError::InvalidAlignmentError(alignment));
        }
        self.min_alignment = alignment;
        Ok(())
    }

    /// In legacy mode nested archives are aligned to 0x2000 and binary headers are sniffed
    /// for every file, including resource factory extensions
    pub fn set_legacy_mode(&mut self, value: bool) {
        self.legacy = value
    }

    /// Lays out the archive. The alignment table is rebuilt on every call since some rules
    /// depend on the current file set.
    ///
    /// Alignments come partly from file contents, so every offset is checked against the
    /// 32-bit limit here, before anything is written.
    fn layout(&self) -> Result<Layout<'_, 'a>> {
        let names: Vec<&str> = self.file_map.values().map(|f| f.name.as_str()).collect();
        let table = AlignmentTable::build(
            &self.config,
            &names,
            &self.alignment_map,
            self.endian,
            self.legacy,
            self.min_alignment,
        );

        let mut files = Vec::with_capacity(self.file_map.len());
        let mut rel_data_offset = 0usize;
        let mut data_alignment = 1usize;
        let mut names_size = 0usize;
        for (hash, file) in self.file_map.iter() {
            let alignment = table.alignment_for_file(&file.name, &file.data).max(1);
            to_u32(alignment)?;
            let begin = checked_align(rel_data_offset, alignment)
                .ok_or(SarcWriteError::ArchiveTooLarge(usize::MAX))?;
            rel_data_offset = begin
                .checked_add(file.data.len())
                .ok_or(SarcWriteError::ArchiveTooLarge(usize::MAX))?;
            to_u32(rel_data_offset)?;
            // File offsets are relative to the data section, so the section itself must
            // satisfy every file's alignment.
            let gcd = num::integer::gcd(data_alignment, alignment);
            data_alignment = (data_alignment / gcd)
                .checked_mul(alignment)
                .ok_or(SarcWriteError::ArchiveTooLarge(usize::MAX))?;
            to_u32(data_alignment)?;
            names_size += align(file.name.len() + 1, 4);
            trace!(
                "{} ({:#010x}): offset {:#x}, alignment {:#x}",
                file.name,
                hash,
                begin,
                alignment
            );
            files.push(PlannedFile {
                hash: *hash,
                file,
                alignment,
                begin,
            });
        }

        let names_end = 0x14 + 0x0C + 0x10 * files.len() + 0x8 + names_size;
        let data_offset = checked_align(names_end, data_alignment)
            .ok_or(SarcWriteError::ArchiveTooLarge(usize::MAX))?;
        let file_size = data_offset
            .checked_add(rel_data_offset)
            .ok_or(SarcWriteError::ArchiveTooLarge(usize::MAX))?;
        to_u32(file_size)?;
        Ok(Layout {
            files,
            data_offset,
            data_alignment,
            file_size,
        })
    }

    /// Returns each file with its offset relative to the data section, in the order the
    /// files will be written
    pub fn file_offsets(&self) -> Result<Vec<(&str, usize)>> {
        Ok(self
            .layout()?
            .files
            .into_iter()
            .map(|planned| (planned.file.name.as_str(), planned.begin))
            .collect())
    }

    pub fn write_to_bytes(&self) -> Result<Vec<u8>> {
        let est_size: usize = 0x14
            + 0x0C
            + 0x8
            + self
                .file_map
                .values()
                .map(|f| 0x10 + align(f.name.len() + 1, 4) + f.data.len())
                .sum::<usize>();
        let mut buf: Vec<u8> = Vec::with_capacity(est_size + est_size / 2);
        self.write(&mut Cursor::new(&mut buf))?;
        Ok(buf)
    }

    /// Writes the archive at the current stream position.
    ///
    /// The header is written first with placeholder offsets and rewritten once the data
    /// section is complete; the stream is left at the end of the archive. Returns the
    /// alignment of the data section.
    pub fn write<W: Write + Seek>(&self, writer: &mut W) -> Result<usize> {
        if self.file_map.len() >= 0x4000 {
            return Err(SarcWriteError::TooManyFiles(self.file_map.len()));
        }
        let layout = self.layout()?;
        let opts = self.endian.writer_options();
        let base = writer.stream_position()?;

        let mut header = ResHeader {
            magic: SARC_MAGIC,
            header_size: 0x14,
            bom: BOM,
            file_size: 0,
            data_offset: 0,
            version: VERSION,
            reserved: 0,
        };
        header.write_options(writer, &opts)?;

        ResFatHeader {
            magic: SFAT_MAGIC,
            header_size: 0x0C,
            num_files: self.file_map.len() as u16,
            hash_multiplier: self.hash_multiplier,
        }
        .write_options(writer, &opts)?;

        let mut rel_string_offset = 0;
        for planned in &layout.files {
            ResFatEntry {
                name_hash: planned.hash,
                rel_name_opt_offset: 1 << 24 | to_u32(rel_string_offset / 4)?,
                data_begin: to_u32(planned.begin)?,
                data_end: to_u32(planned.begin + planned.file.data.len())?,
            }
            .write_options(writer, &opts)?;
            rel_string_offset += align(planned.file.name.len() + 1, 4);
        }

        ResFntHeader {
            magic: SFNT_MAGIC,
            header_size: 0x8,
            reserved: 0,
        }
        .write_options(writer, &opts)?;
        for planned in &layout.files {
            writer.write_all(planned.file.name.as_bytes())?;
            writer.write_all(&[0])?;
            pad(writer, base, 4)?;
        }

        let data_offset_begin = pad(writer, base, layout.data_alignment)?;
        debug_assert_eq!(data_offset_begin, layout.data_offset);
        for planned in &layout.files {
            let pos = pad(writer, base, planned.alignment)?;
            debug_assert_eq!(pos - data_offset_begin, planned.begin);
            writer.write_all(&planned.file.data)?;
        }

        let file_size = (writer.stream_position()? - base) as usize;
        debug_assert_eq!(file_size, layout.file_size);
        header.file_size = to_u32(file_size)?;
        header.data_offset = to_u32(data_offset_begin)?;
        writer.seek(SeekFrom::Start(base))?;
        header.write_options(writer, &opts)?;
        writer.seek(SeekFrom::Start(base + file_size as u64))?;

        debug!(
            "Wrote {:?} endian SARC with {} files: {:#x} bytes, data at {:#x} (alignment {:#x})",
            self.endian,
            layout.files.len(),
            file_size,
            data_offset_begin,
            layout.data_alignment
        );
        Ok(layout.data_alignment)
    }
}
