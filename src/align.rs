//! Data alignment rules for files stored in an archive.
//!
//! A file's alignment comes from its extension (external rule data, hard-coded overrides and
//! rules that depend on the whole file set), and from sniffing binary headers inside the file.
use crate::*;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Alignments for formats that the rule data does not describe correctly.
const BUILTIN_REQUIREMENTS: &[(&str, usize)] = &[
    // Env/env.sgenvb/postfx/*.bksky (AAMP)
    ("ksky", 8),
    ("bksky", 8),
    // Terrain/System/tera_resource.*.ssarc
    ("gtx", 0x2000),
    ("sharcb", 0x1000),
    ("sharc", 0x1000),
    // Layout/MultiFilter.ssarc/*.baglmf (AAMP)
    ("baglmf", 0x80),
];

/// An alignment requirement that depends on every file name in the archive.
pub trait ContextRule: fmt::Debug + Send + Sync {
    /// Returns an extension and its alignment if the rule applies to this set of names.
    fn requirement(&self, names: &[&str]) -> Option<(String, usize)>;
}

/// Aligns `extension` when every file in the archive is `<prefix>*.<extension>`.
///
/// Event packs align their flowcharts to 0x100 even though the format does not require it,
/// but other archives containing flowcharts do not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformFileSetRule {
    pub prefix: String,
    pub extension: String,
    pub alignment: usize,
}

impl UniformFileSetRule {
    pub fn event_flow() -> Self {
        Self {
            prefix: "EventFlow/".to_owned(),
            extension: "bfevfl".to_owned(),
            alignment: 0x100,
        }
    }
}

impl ContextRule for UniformFileSetRule {
    fn requirement(&self, names: &[&str]) -> Option<(String, usize)> {
        let suffix = format!(".{}", self.extension);
        names
            .iter()
            .all(|name| name.starts_with(&self.prefix) && name.ends_with(&suffix))
            .then(|| (self.extension.clone(), self.alignment))
    }
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct AglEnvInfo {
    id: u16,
    i0: u16,
    ext: String,
    bext: String,
    s: Option<String>,
    align: i32,
    system: String,
    desc: String,
}

/// Alignment rule data shared by writers.
///
/// Built once, then handed to every [`SarcWriter`](crate::SarcWriter) through an `Arc`.
#[derive(Debug, Clone)]
pub struct AlignmentConfig {
    rules: Vec<(String, usize)>,
    factory_extensions: HashSet<String>,
    context_rules: Vec<Arc<dyn ContextRule>>,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            rules: vec![],
            factory_extensions: HashSet::new(),
            context_rules: vec![Arc::new(UniformFileSetRule::event_flow())],
        }
    }
}

impl AlignmentConfig {
    /// Loads extension rules from agl environment file info (a JSON list of records).
    ///
    /// Each record contributes its text and binary extension with the absolute value of its
    /// alignment.
    pub fn from_aglenv_json(json: &str) -> writer::Result<Self> {
        let info: Vec<AglEnvInfo> = serde_json::from_str(json)?;
        let mut config = Self::default();
        for entry in info {
            let alignment = entry.align.unsigned_abs() as usize;
            config = config
                .with_rule(entry.ext, alignment)?
                .with_rule(entry.bext, alignment)?;
        }
        Ok(config)
    }

    /// Adds resource factory extensions from tab separated data; the first column of each
    /// line is the extension.
    pub fn with_factory_extensions_tsv(mut self, tsv: &str) -> Self {
        self.factory_extensions.extend(
            tsv.lines()
                .filter_map(|line| line.split('\t').next())
                .map(str::trim)
                .filter(|ext| !ext.is_empty())
                .map(str::to_owned),
        );
        self
    }

    pub fn with_factory_extension(mut self, ext: impl Into<String>) -> Self {
        self.factory_extensions.insert(ext.into());
        self
    }

    pub fn with_rule(mut self, ext: impl Into<String>, alignment: usize) -> writer::Result<Self> {
        if !is_valid_alignment(alignment) {
            return Err(SarcWriteError::InvalidAlignmentError(alignment));
        }
        self.rules.push((ext.into(), alignment));
        Ok(self)
    }

    pub fn with_context_rule(mut self, rule: impl ContextRule + 'static) -> Self {
        self.context_rules.push(Arc::new(rule));
        self
    }

    pub fn is_factory_extension(&self, ext: &str) -> bool {
        self.factory_extensions.contains(ext)
    }
}

impl PartialEq for AlignmentConfig {
    fn eq(&self, other: &Self) -> bool {
        self.rules == other.rules && self.factory_extensions == other.factory_extensions
    }
}

/// Returns the extension of the last path component, without the dot.
fn extension(name: &str) -> &str {
    let base = name.rsplit('/').next().unwrap_or(name);
    let stem_start = base.len() - base.trim_start_matches('.').len();
    match base[stem_start..].rfind('.') {
        Some(idx) => &base[stem_start + idx + 1..],
        None => "",
    }
}

/// Alignment for files with an `nn::util::BinaryFileHeader`: a BOM at 0xC, the alignment
/// exponent at 0xE and the file size at 0x1C.
fn alignment_for_new_binary_file(data: &[u8]) -> usize {
    if data.len() <= 0x20 {
        return 0;
    }
    let file_size = match Endian::from_bom([data[0xC], data[0xD]]) {
        Some(Endian::Big) => u32::from_be_bytes([data[0x1C], data[0x1D], data[0x1E], data[0x1F]]),
        Some(Endian::Little) => {
            u32::from_le_bytes([data[0x1C], data[0x1D], data[0x1E], data[0x1F]])
        }
        None => return 0,
    };
    if file_size as usize != data.len() {
        return 0;
    }
    1usize.checked_shl(data[0xE] as u32).unwrap_or(0)
}

/// Alignment for Wii U bflim textures, stored near the end of the file.
fn alignment_for_cafe_bflim(data: &[u8]) -> usize {
    if data.len() <= 0x28 || &data[data.len() - 0x28..data.len() - 0x24] != b"FLIM" {
        return 0;
    }
    let pos = data.len() - 0x8;
    u16::from_be_bytes([data[pos], data[pos + 1]]) as usize
}

/// Extension alignment table for one write pass.
#[derive(Debug, Clone)]
pub(crate) struct AlignmentTable<'c> {
    requirements: HashMap<String, usize>,
    config: &'c AlignmentConfig,
    endian: Endian,
    legacy: bool,
    default_alignment: usize,
}

impl<'c> AlignmentTable<'c> {
    /// Builds the table for the current file set. Explicit `overrides` take precedence over
    /// every other extension rule.
    pub fn build(
        config: &'c AlignmentConfig,
        names: &[&str],
        overrides: &HashMap<String, usize>,
        endian: Endian,
        legacy: bool,
        default_alignment: usize,
    ) -> Self {
        let mut requirements: HashMap<String, usize> = config.rules.iter().cloned().collect();
        requirements.extend(
            BUILTIN_REQUIREMENTS
                .iter()
                .map(|(ext, alignment)| (ext.to_string(), *alignment)),
        );
        for rule in &config.context_rules {
            if let Some((ext, alignment)) = rule.requirement(names) {
                trace!("Context rule {:?} applies: {} -> {:#x}", rule, ext, alignment);
                requirements.insert(ext, alignment);
            }
        }
        // Font/*.bfarc/*.bffnt
        requirements.insert(
            "bffnt".to_owned(),
            match endian {
                Endian::Big => 0x2000,
                Endian::Little => 0x1000,
            },
        );
        requirements.extend(overrides.iter().map(|(ext, a)| (ext.clone(), *a)));
        Self {
            requirements,
            config,
            endian,
            legacy,
            default_alignment,
        }
    }

    pub fn alignment_for_file(&self, name: &str, data: &[u8]) -> usize {
        let ext = extension(name);
        let mut alignment = self
            .requirements
            .get(ext)
            .copied()
            .unwrap_or(self.default_alignment);
        if self.legacy && is_sarc_data(data) {
            alignment = alignment.max(0x2000);
        }
        if self.legacy || !self.config.is_factory_extension(ext) {
            alignment = alignment.max(alignment_for_new_binary_file(data));
            if let Endian::Big = self.endian {
                alignment = alignment.max(alignment_for_cafe_bflim(data));
            }
        }
        alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table<'c>(config: &'c AlignmentConfig, names: &[&str], endian: Endian) -> AlignmentTable<'c> {
        AlignmentTable::build(config, names, &HashMap::new(), endian, false, 4)
    }

    fn binary_file(bom: [u8; 2], exponent: u8, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        data[0..4].copy_from_slice(b"BNTX");
        data[0xC..0xE].copy_from_slice(&bom);
        data[0xE] = exponent;
        let size = match bom {
            [0xFE, 0xFF] => (len as u32).to_be_bytes(),
            _ => (len as u32).to_le_bytes(),
        };
        data[0x1C..0x20].copy_from_slice(&size);
        data
    }

    #[test]
    fn extension_of_last_component() {
        assert_eq!(extension("Actor/Pack/Link.sbactorpack"), "sbactorpack");
        assert_eq!(extension("Model/Link.Tex2.sbfres"), "sbfres");
        assert_eq!(extension("Dir.d/file"), "");
        assert_eq!(extension(".hidden"), "");
        assert_eq!(extension("noext"), "");
    }

    #[test]
    fn defaults_and_builtins() {
        let config = AlignmentConfig::default();
        let table = table(&config, &["a.txt", "b.gtx"], Endian::Little);
        assert_eq!(table.alignment_for_file("a.txt", b"hi"), 4);
        assert_eq!(table.alignment_for_file("b.gtx", b"hi"), 0x2000);
        assert_eq!(table.alignment_for_file("Font/a.bffnt", b"hi"), 0x1000);
        let table = table_be(&config);
        assert_eq!(table.alignment_for_file("Font/a.bffnt", b"hi"), 0x2000);
    }

    fn table_be(config: &AlignmentConfig) -> AlignmentTable<'_> {
        table(config, &[], Endian::Big)
    }

    #[test]
    fn rule_replaces_default() {
        let config = AlignmentConfig::default().with_rule("bin", 2).unwrap();
        let table = table(&config, &[], Endian::Little);
        assert_eq!(table.alignment_for_file("x.bin", b"data"), 2);
        assert!(AlignmentConfig::default().with_rule("bin", 3).is_err());
    }

    #[test]
    fn overrides_win() {
        let config = AlignmentConfig::default();
        let mut overrides = HashMap::new();
        overrides.insert("gtx".to_owned(), 0x1000);
        let table = AlignmentTable::build(&config, &[], &overrides, Endian::Big, false, 4);
        assert_eq!(table.alignment_for_file("t.gtx", b""), 0x1000);
    }

    #[test]
    fn sniff_binary_header() {
        let config = AlignmentConfig::default();
        let table = table(&config, &[], Endian::Little);
        let le = binary_file([0xFF, 0xFE], 0xC, 0x40);
        assert_eq!(table.alignment_for_file("x.bntx", &le), 0x1000);
        let be = binary_file([0xFE, 0xFF], 0x8, 0x40);
        assert_eq!(table.alignment_for_file("x.bntx", &be), 0x100);

        let mut wrong_size = le.clone();
        wrong_size.push(0);
        assert_eq!(table.alignment_for_file("x.bntx", &wrong_size), 4);
        assert_eq!(table.alignment_for_file("x.bntx", &le[..0x20]), 4);
    }

    #[test]
    fn factory_extensions_skip_sniff() {
        let config = AlignmentConfig::default().with_factory_extensions_tsv("bntx\t1024\nsbfres\t0\n");
        assert!(config.is_factory_extension("sbfres"));
        let data = binary_file([0xFF, 0xFE], 0xC, 0x40);
        let table = table(&config, &[], Endian::Little);
        assert_eq!(table.alignment_for_file("x.bntx", &data), 4);
        let legacy = AlignmentTable::build(&config, &[], &HashMap::new(), Endian::Little, true, 4);
        assert_eq!(legacy.alignment_for_file("x.bntx", &data), 0x1000);
    }

    #[test]
    fn sniff_bflim_big_endian_only() {
        let mut data = vec![0u8; 0x40];
        let len = data.len();
        data[len - 0x28..len - 0x24].copy_from_slice(b"FLIM");
        data[len - 0x8..len - 0x6].copy_from_slice(&0x200u16.to_be_bytes());
        let config = AlignmentConfig::default();
        assert_eq!(table_be(&config).alignment_for_file("x.bflim", &data), 0x200);
        assert_eq!(
            table(&config, &[], Endian::Little).alignment_for_file("x.bflim", &data),
            4
        );
    }

    #[test]
    fn event_flow_rule_needs_whole_set() {
        let config = AlignmentConfig::default();
        let names = ["EventFlow/A.bfevfl", "EventFlow/B.bfevfl"];
        let only_events = table(&config, &names, Endian::Big);
        assert_eq!(only_events.alignment_for_file(names[0], b"x"), 0x100);

        let mixed = table(&config, &[names[0], "Actor/x.bxml"], Endian::Big);
        assert_eq!(mixed.alignment_for_file(names[0], b"x"), 4);
    }

    #[test]
    fn legacy_aligns_nested_archives() {
        let config = AlignmentConfig::default();
        let table = AlignmentTable::build(&config, &[], &HashMap::new(), Endian::Big, true, 4);
        assert_eq!(table.alignment_for_file("Pack/a.pack", b"SARC\0\0\0\0"), 0x2000);
    }

    #[test]
    fn load_aglenv_rules() {
        let json = r#"[
            {"id": 1, "i0": 0, "ext": "agllmap", "bext": "bagllmap", "s": null,
             "align": 8, "system": "agl", "desc": "light map"},
            {"id": 2, "i0": 0, "ext": "aglenv", "bext": "baglenv", "s": "x",
             "align": -4, "system": "agl", "desc": "env"}
        ]"#;
        let config = AlignmentConfig::from_aglenv_json(json).unwrap();
        let table = table(&config, &[], Endian::Little);
        assert_eq!(table.alignment_for_file("a.bagllmap", b""), 8);
        assert_eq!(table.alignment_for_file("a.aglenv", b""), 4);
        assert!(matches!(
            AlignmentConfig::from_aglenv_json("{"),
            Err(SarcWriteError::InvalidConfig(_))
        ));
    }
}
