use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use globwalk::GlobWalkerBuilder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

/// Horizontal gap, in page units, below which two fragments are joined.
pub const DEFAULT_DISTANCE_LIMIT: f64 = 1.0;
/// Minimum vertical overlap, as a fraction of the shorter box, for two fragments to share a line.
pub const DEFAULT_LINE_OVERLAP: f64 = 0.5;

/// A positioned piece of extracted text. May be a partial word.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextFragment {
    #[serde(alias = "pageNum")]
    pub page: u32,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(alias = "str")]
    pub text: String,
}

impl TextFragment {
    pub fn new(page: u32, x: f64, y: f64, width: f64, height: f64, text: impl Into<String>) -> Self {
        Self { page, x, y, width, height, text: text.into() }
    }

    fn right(&self) -> f64 {
        self.x + self.width
    }

    fn bottom(&self) -> f64 {
        self.y + self.height
    }
}

/// A reconstructed word: the concatenated text and bounding-box union of one or more fragments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedWord {
    pub page: u32,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub text: String,
}

impl MergedWord {
    fn right(&self) -> f64 {
        self.x + self.width
    }

    fn bottom(&self) -> f64 {
        self.y + self.height
    }

    /// Extend this word with the next fragment on the same line.
    fn absorb(&mut self, next: &TextFragment) {
        let left = self.x.min(next.x);
        let top = self.y.min(next.y);
        let right = self.right().max(next.right());
        let bottom = self.bottom().max(next.bottom());
        self.x = left;
        self.y = top;
        self.width = right - left;
        self.height = bottom - top;
        self.text.push_str(&next.text);
    }
}

impl From<TextFragment> for MergedWord {
    fn from(f: TextFragment) -> Self {
        Self { page: f.page, x: f.x, y: f.y, width: f.width, height: f.height, text: f.text }
    }
}

impl From<MergedWord> for TextFragment {
    fn from(w: MergedWord) -> Self {
        Self { page: w.page, x: w.x, y: w.y, width: w.width, height: w.height, text: w.text }
    }
}

/// Words of one page, grouped into lines (top-to-bottom, each left-to-right).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageWords {
    pub page: u32,
    pub lines: Vec<Vec<MergedWord>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub distance_limit: f64,
    pub line_overlap: f64,
    pub parallel: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self { distance_limit: DEFAULT_DISTANCE_LIMIT, line_overlap: DEFAULT_LINE_OVERLAP, parallel: true }
    }
}

impl MergeConfig {
    pub fn validate(&self) -> Result<(), MergeError> {
        if !self.distance_limit.is_finite() || self.distance_limit < 0.0 {
            return Err(MergeError::InvalidConfig(format!(
                "distance_limit must be a non-negative number, got {}",
                self.distance_limit
            )));
        }
        if !(0.0..=1.0).contains(&self.line_overlap) {
            return Err(MergeError::InvalidConfig(format!(
                "line_overlap must be within [0, 1], got {}",
                self.line_overlap
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum MergeError {
    #[error("InvalidFragment: fragment {index}: {reason}")]
    InvalidFragment { index: usize, reason: String },
    #[error("InvalidConfig: {0}")]
    InvalidConfig(String),
}

/// Reject fragments with negative extents or non-finite geometry.
/// Reports the first offending fragment by its input index.
pub fn validate_fragments(fragments: &[TextFragment]) -> Result<(), MergeError> {
    for (index, f) in fragments.iter().enumerate() {
        let fields = [("x", f.x), ("y", f.y), ("width", f.width), ("height", f.height)];
        if let Some((name, value)) = fields.iter().find(|(_, v)| !v.is_finite()) {
            return Err(MergeError::InvalidFragment { index, reason: format!("non-finite {} ({})", name, value) });
        }
        if f.width < 0.0 {
            return Err(MergeError::InvalidFragment { index, reason: format!("negative width ({})", f.width) });
        }
        if f.height < 0.0 {
            return Err(MergeError::InvalidFragment { index, reason: format!("negative height ({})", f.height) });
        }
    }
    Ok(())
}

//   +------+ - - -
//   |  a   | - - +------+   -
//   |      |     |  b   |   | overlap >= shorter height * line_overlap
//   +------+ - - |      |   -
//          - - - +------+
fn shares_line(a: &TextFragment, b: &TextFragment, line_overlap: f64) -> bool {
    let overlap = a.bottom().min(b.bottom()) - a.y.max(b.y);
    let shorter = a.height.min(b.height);
    if shorter <= 0.0 {
        // a zero-height box joins any box it touches
        return overlap >= 0.0;
    }
    overlap > 0.0 && overlap >= shorter * line_overlap
}

struct LineBand<'a> {
    members: Vec<&'a TextFragment>,
}

impl<'a> LineBand<'a> {
    fn new(first: &'a TextFragment) -> Self {
        Self { members: vec![first] }
    }

    /// Every member must overlap `frag` on its own; the band never widens past its members,
    /// so a tall fragment cannot chain two text lines together.
    fn accepts(&self, frag: &TextFragment, line_overlap: f64) -> bool {
        self.members.iter().all(|m| shares_line(m, frag, line_overlap))
    }

    fn push(&mut self, frag: &'a TextFragment) {
        self.members.push(frag);
    }
}

/// Partition the fragments of a single page into lines.
/// - Every pair of fragments in a line overlaps vertically by at least `line_overlap`
///   of the shorter height.
/// - Lines come out top-to-bottom, ordered by the smallest `y` of their members.
/// - Each line is sorted by `x` ascending; ties fall back to `y`, then input order.
/// Page indices are not inspected; callers split by page first.
pub fn group_lines(fragments: &[TextFragment], line_overlap: f64) -> Vec<Vec<TextFragment>> {
    let mut sorted: Vec<&TextFragment> = fragments.iter().collect();
    sorted.sort_by(|a, b| a.y.total_cmp(&b.y).then(a.x.total_cmp(&b.x)));

    let mut bands: Vec<LineBand> = Vec::new();
    for frag in sorted {
        // latest band first; bands are created in top-to-bottom order
        match bands.iter().rposition(|band| band.accepts(frag, line_overlap)) {
            Some(i) => bands[i].push(frag),
            None => bands.push(LineBand::new(frag)),
        }
    }

    bands
        .into_iter()
        .map(|band| {
            let mut members = band.members;
            members.sort_by(|a, b| a.x.total_cmp(&b.x));
            members.into_iter().cloned().collect()
        })
        .collect()
}

/// Greedy left-to-right pass over one x-sorted line.
/// A fragment joins the accumulator only when its gap to the accumulator's right edge
/// is strictly below `distance_limit`; negative gaps (overlaps) always join.
fn merge_line(line: Vec<TextFragment>, distance_limit: f64) -> Vec<MergedWord> {
    let mut words = Vec::new();
    let mut iter = line.into_iter();
    let Some(first) = iter.next() else {
        return words;
    };

    let mut acc = MergedWord::from(first);
    for current in iter {
        let gap = current.x - acc.right();
        if gap < distance_limit {
            trace!(page = current.page, gap, text = %current.text, "joining fragment");
            acc.absorb(&current);
        } else {
            words.push(std::mem::replace(&mut acc, MergedWord::from(current)));
        }
    }
    words.push(acc);
    words
}

fn merge_page(page: u32, fragments: &[TextFragment], cfg: &MergeConfig) -> PageWords {
    let lines: Vec<Vec<MergedWord>> = group_lines(fragments, cfg.line_overlap)
        .into_iter()
        .map(|line| merge_line(line, cfg.distance_limit))
        .collect();
    debug!(
        page,
        fragments = fragments.len(),
        lines = lines.len(),
        words = lines.iter().map(Vec::len).sum::<usize>(),
        "merged page"
    );
    PageWords { page, lines }
}

fn partition_pages(fragments: &[TextFragment]) -> Vec<(u32, Vec<TextFragment>)> {
    let mut pages: BTreeMap<u32, Vec<TextFragment>> = BTreeMap::new();
    for f in fragments {
        pages.entry(f.page).or_default().push(f.clone());
    }
    pages.into_iter().collect()
}

#[cfg(feature = "parallel")]
fn merge_pages(pages: Vec<(u32, Vec<TextFragment>)>, cfg: &MergeConfig) -> Vec<PageWords> {
    use rayon::prelude::*;

    if cfg.parallel {
        // indexed collect keeps ascending page order
        return pages.into_par_iter().map(|(page, frags)| merge_page(page, &frags, cfg)).collect();
    }
    pages.into_iter().map(|(page, frags)| merge_page(page, &frags, cfg)).collect()
}

#[cfg(not(feature = "parallel"))]
fn merge_pages(pages: Vec<(u32, Vec<TextFragment>)>, cfg: &MergeConfig) -> Vec<PageWords> {
    pages.into_iter().map(|(page, frags)| merge_page(page, &frags, cfg)).collect()
}

/// Merge fragments into words, keeping the page and line structure.
/// Validates config and every fragment before any merging happens.
pub fn merge_layout(fragments: &[TextFragment], cfg: &MergeConfig) -> Result<Vec<PageWords>, MergeError> {
    cfg.validate()?;
    validate_fragments(fragments)?;
    Ok(merge_pages(partition_pages(fragments), cfg))
}

/// Reconstruct words from fragments in reading order:
/// page ascending, then lines top-to-bottom, then x ascending.
pub fn merge_words(fragments: &[TextFragment], cfg: &MergeConfig) -> Result<Vec<MergedWord>, MergeError> {
    let pages = merge_layout(fragments, cfg)?;
    Ok(pages.into_iter().flat_map(|p| p.lines).flatten().collect())
}

/// Render merged pages as plain text.
/// Words on a line are separated by a space, lines by `\n`, pages by a form feed.
pub fn render_text(pages: &[PageWords]) -> String {
    pages
        .iter()
        .map(|p| {
            p.lines
                .iter()
                .map(|line| line.iter().map(|w| w.text.as_str()).collect::<Vec<_>>().join(" "))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect::<Vec<_>>()
        .join("\u{000C}")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub fragments: usize,
    pub words: usize,
    pub pages: usize,
    pub lines: usize,
    pub merged_fragments: usize,
}

impl MergeStats {
    pub fn from_layout(fragments: usize, pages: &[PageWords]) -> Self {
        let lines: usize = pages.iter().map(|p| p.lines.len()).sum();
        let words: usize = pages.iter().flat_map(|p| &p.lines).map(Vec::len).sum();
        Self { fragments, words, pages: pages.len(), lines, merged_fragments: fragments.saturating_sub(words) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub id: String,
    #[serde(default)]
    pub inputs: Option<RunInputs>,
    #[serde(default)]
    pub outputs: Option<RunOutputs>,
    #[serde(default)]
    pub merge: MergeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInputs {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutputs {
    pub dir: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(String),
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Read and validate a YAML run configuration.
pub fn validate_config(path: &Path) -> Result<RunConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let cfg: RunConfig = serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;

    if cfg.id.trim().is_empty() {
        return Err(ConfigError::Invalid("missing id".into()));
    }
    cfg.merge.validate().map_err(|e| ConfigError::Invalid(e.to_string()))?;

    Ok(cfg)
}

impl RunConfig {
    pub fn input_glob(&self) -> String {
        self.inputs
            .as_ref()
            .and_then(|i| i.path.clone())
            .unwrap_or_else(|| "./input/**/*.json".to_string())
    }

    pub fn output_dir(&self) -> String {
        self.outputs
            .as_ref()
            .and_then(|o| o.dir.clone())
            .unwrap_or_else(|| "./output".to_string())
    }
}

#[derive(Debug, Error)]
pub enum EnumerateError {
    #[error("NoFilesFound")]
    NoFilesFound { guidance: String },
}

/// Enumerate fragment files using a glob pattern (e.g., "./input/**/*.json").
/// Returns a sorted list of paths.
pub fn enumerate_inputs(glob_pattern: &str) -> Result<Vec<PathBuf>, EnumerateError> {
    let root = if Path::new(glob_pattern).is_absolute() { "/" } else { "." };
    let pat = glob_pattern.trim_start_matches("./");
    let mut paths: Vec<PathBuf> = GlobWalkerBuilder::from_patterns(root, &[pat])
        .case_insensitive(false)
        .follow_links(false)
        .build()
        .map_err(|_| EnumerateError::NoFilesFound { guidance: folder_guidance(glob_pattern) })?
        .filter_map(|e| e.ok())
        .map(|e| e.path().to_path_buf())
        .collect();

    paths.sort();
    paths.retain(|p| p.is_file());

    if paths.is_empty() {
        return Err(EnumerateError::NoFilesFound { guidance: folder_guidance(glob_pattern) });
    }

    Ok(paths)
}

fn folder_guidance(pattern: &str) -> String {
    format!(
        r#"No fragment files match {}
Each file is a JSON array of fragments, e.g.:
  [{{"page": 0, "x": 0.0, "y": 0.0, "width": 5.0, "height": 10.0, "text": "Hel"}}]
Example: place extracted fragments at ./input/<document>.json"#,
        pattern
    )
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to read fragments: {0}")]
    Read(String),
    #[error("Failed to parse fragments: {0}")]
    Parse(String),
}

/// Parse a JSON array of fragments. Accepts `pageNum`/`str` as aliases of `page`/`text`.
pub fn parse_fragments(bytes: &[u8]) -> Result<Vec<TextFragment>, LoadError> {
    serde_json::from_slice(bytes).map_err(|e| LoadError::Parse(e.to_string()))
}

/// Fragments read from one input file, with the digest of the raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentFile {
    pub fragments: Vec<TextFragment>,
    pub source_sha256: String,
}

pub fn load_fragments(path: &Path) -> Result<FragmentFile, LoadError> {
    let raw = std::fs::read(path).map_err(|e| LoadError::Read(format!("{}: {}", path.display(), e)))?;
    let fragments = parse_fragments(&raw)?;
    Ok(FragmentFile { fragments, source_sha256: sha256_hex(&raw) })
}

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("WriteFailed: {0}")]
    WriteFailed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitPaths {
    pub words_path: String,
    pub text_path: Option<String>,
    pub meta_path: String,
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), EmitError> {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("out");
    let tmp = path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()));
    std::fs::write(&tmp, bytes).map_err(|e| EmitError::WriteFailed(e.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|e| EmitError::WriteFailed(e.to_string()))
}

/// Atomically write merged words, optional plain text and meta JSON into outdir with doc_id stem.
pub fn emit_files(
    words: &[MergedWord],
    text: Option<&str>,
    meta: &serde_json::Value,
    outdir: &str,
    doc_id: &str,
) -> Result<EmitPaths, EmitError> {
    std::fs::create_dir_all(outdir).map_err(|e| EmitError::WriteFailed(e.to_string()))?;
    let words_path = Path::new(outdir).join(format!("{}.words.json", doc_id));
    let text_path = Path::new(outdir).join(format!("{}.txt", doc_id));
    let meta_path = Path::new(outdir).join(format!("{}.meta.json", doc_id));

    let words_bytes = serde_json::to_vec_pretty(words).map_err(|e| EmitError::WriteFailed(e.to_string()))?;
    write_atomic(&words_path, &words_bytes)?;
    if let Some(text) = text {
        write_atomic(&text_path, text.as_bytes())?;
    }
    let meta_bytes = serde_json::to_vec_pretty(meta).map_err(|e| EmitError::WriteFailed(e.to_string()))?;
    write_atomic(&meta_path, &meta_bytes)?;

    Ok(EmitPaths {
        words_path: words_path.to_string_lossy().to_string(),
        text_path: text.map(|_| text_path.to_string_lossy().to_string()),
        meta_path: meta_path.to_string_lossy().to_string(),
    })
}

// Utility to compute sha256 hex
pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let out = hasher.finalize();
    out.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Add a `meta_fingerprint` computed over the metadata without its `timestamps`,
/// so identical runs produce identical fingerprints.
pub fn with_fingerprint(meta: serde_json::Value) -> serde_json::Value {
    let mut norm = meta.clone();
    if let Some(obj) = norm.as_object_mut() {
        obj.remove("timestamps");
    }
    let fingerprint = sha256_hex(&serde_json::to_vec(&norm).unwrap_or_default());
    match meta {
        serde_json::Value::Object(mut obj) => {
            obj.insert("meta_fingerprint".to_string(), serde_json::json!(fingerprint));
            serde_json::Value::Object(obj)
        }
        other => other,
    }
}

/// Lowercase ASCII slug of a file stem; falls back to "doc".
pub fn slugify(base: &str) -> String {
    let mapped: String = base
        .to_lowercase()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '-' })
        .collect();
    let collapsed = mapped
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if collapsed.is_empty() {
        "doc".to_string()
    } else {
        collapsed
    }
}

/// Return `slug` if unused, otherwise the first free `slug-N`. Records the result in `used`.
pub fn unique_slug(slug: String, used: &mut HashSet<String>) -> String {
    if used.insert(slug.clone()) {
        return slug;
    }
    let mut i = 1;
    loop {
        let candidate = format!("{}-{}", slug, i);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        i += 1;
    }
}
