//! Daily journal block store.
//!
//! Each user keeps one Markdown document per calendar day. A document is split into a
//! fixed catalog of `## ` sections ("blocks"); this crate parses, normalizes and rebuilds
//! those documents and maps each (user, date) pair onto a stable directory layout.
//! Rendering, authentication and date-string parsing live with the caller.

pub mod core {
    use chrono::{Datelike, Days, NaiveDate};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{fmt, str::FromStr};

    /* ------------------------------ Headers ------------------------------ */

    /// Prefix that opens a block in stored text.
    pub const BLOCK_MARKER: &str = "## ";

    /// One section of a daily document. Declaration order is the catalog order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum Header {
        Goals,
        Focus,
        Challenges,
        EveningGoals,
        Achievements,
        Improvements,
        Gratitude,
        Notes,
    }

    impl Header {
        /// Catalog order; every rebuilt document lists its blocks in this order.
        pub const ALL: [Header; 8] = [
            Header::Goals,
            Header::Focus,
            Header::Challenges,
            Header::EveningGoals,
            Header::Achievements,
            Header::Improvements,
            Header::Gratitude,
            Header::Notes,
        ];

        /// Headers seeded (empty) into a document created by a morning write.
        pub const MORNING: [Header; 3] = [Header::Goals, Header::Focus, Header::Challenges];

        /// The literal marker line, byte-for-byte as stored on disk.
        pub const fn marker(self) -> &'static str {
            match self {
                Header::Goals => "## 🚀 Today's Goals",
                Header::Focus => "## 🎯 Focus Areas",
                Header::Challenges => "## ⚙️ Challenges & Strategies",
                Header::EveningGoals => "## ✅ Goals Checked",
                Header::Achievements => "## 🏆 Achievements",
                Header::Improvements => "## 🔧 Improvements",
                Header::Gratitude => "## 💛 Gratitude",
                Header::Notes => "## 📌 Notes for Tomorrow",
            }
        }

        /// Short machine-friendly name (CLI arguments, JSON keys).
        pub const fn slug(self) -> &'static str {
            match self {
                Header::Goals => "goals",
                Header::Focus => "focus",
                Header::Challenges => "challenges",
                Header::EveningGoals => "evening-goals",
                Header::Achievements => "achievements",
                Header::Improvements => "improvements",
                Header::Gratitude => "gratitude",
                Header::Notes => "notes",
            }
        }

        pub fn is_morning(self) -> bool {
            Self::MORNING.contains(&self)
        }

        /// Exact match against a (trimmed) marker line.
        pub fn from_marker(line: &str) -> Option<Self> {
            Self::ALL.into_iter().find(|h| h.marker() == line)
        }
    }

    impl fmt::Display for Header {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.marker())
        }
    }

    impl FromStr for Header {
        type Err = DomainError;

        /// Accepts either the slug or the full marker line.
        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let s = s.trim();
            Self::ALL
                .into_iter()
                .find(|h| h.slug().eq_ignore_ascii_case(s) || h.marker() == s)
                .ok_or_else(|| DomainError::UnknownHeader(s.to_string()))
        }
    }

    /* ------------------------------ Document ------------------------------ */

    /// In-memory form of one daily document.
    ///
    /// Each catalog header has its own slot: `None` means the block is absent and will not
    /// be emitted, `Some("")` means the header line is present with no body.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Document {
        pub goals: Option<String>,
        pub focus: Option<String>,
        pub challenges: Option<String>,
        pub evening_goals: Option<String>,
        pub achievements: Option<String>,
        pub improvements: Option<String>,
        pub gratitude: Option<String>,
        pub notes: Option<String>,

        /// Blocks whose marker is not in the catalog, keyed by the trimmed marker line in
        /// first-seen order. Kept for inspection only; the formatter never writes them back.
        #[serde(default)]
        pub unknown: IndexMap<String, String>,
    }

    impl Document {
        pub fn new() -> Self {
            Self::default()
        }

        /// Starting point for a brand-new file whose first write targets a morning header.
        pub fn morning_skeleton() -> Self {
            let mut doc = Self::new();
            for header in Header::MORNING {
                doc.set(header, String::new());
            }
            doc
        }

        pub fn slot(&self, header: Header) -> &Option<String> {
            match header {
                Header::Goals => &self.goals,
                Header::Focus => &self.focus,
                Header::Challenges => &self.challenges,
                Header::EveningGoals => &self.evening_goals,
                Header::Achievements => &self.achievements,
                Header::Improvements => &self.improvements,
                Header::Gratitude => &self.gratitude,
                Header::Notes => &self.notes,
            }
        }

        pub fn slot_mut(&mut self, header: Header) -> &mut Option<String> {
            match header {
                Header::Goals => &mut self.goals,
                Header::Focus => &mut self.focus,
                Header::Challenges => &mut self.challenges,
                Header::EveningGoals => &mut self.evening_goals,
                Header::Achievements => &mut self.achievements,
                Header::Improvements => &mut self.improvements,
                Header::Gratitude => &mut self.gratitude,
                Header::Notes => &mut self.notes,
            }
        }

        pub fn get(&self, header: Header) -> Option<&str> {
            self.slot(header).as_deref()
        }

        /// Overwrites the block, marking it present even when `body` is empty.
        pub fn set(&mut self, header: Header, body: impl Into<String>) {
            *self.slot_mut(header) = Some(body.into());
        }

        pub fn contains(&self, header: Header) -> bool {
            self.slot(header).is_some()
        }

        /// Present catalog headers, in catalog order.
        pub fn headers(&self) -> impl Iterator<Item = Header> + '_ {
            Header::ALL.into_iter().filter(|h| self.contains(*h))
        }

    }

    /* ------------------------------ Keys & windows ------------------------------ */

    /// Identifies exactly one document: an opaque user id plus a calendar day.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct LogKey {
        pub user_id: String,
        pub date: NaiveDate,
    }

    impl LogKey {
        pub fn new(user_id: impl Into<String>, date: NaiveDate) -> Self {
            Self {
                user_id: user_id.into(),
                date,
            }
        }
    }

    /// Monday through Sunday around a reference day.
    ///
    /// Days that fall outside chrono's representable range are left out, so a window at
    /// either end of the calendar has fewer than seven days.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct WeekWindow {
        reference: NaiveDate,
        /// Days from the reference back to its Monday, 0..=6.
        back: u64,
    }

    impl WeekWindow {
        pub fn containing(day: NaiveDate) -> Self {
            // Sunday = 0 .. Saturday = 6
            let dow = day.weekday().num_days_from_sunday();
            Self {
                reference: day,
                back: u64::from((dow + 6) % 7),
            }
        }

        pub fn monday(&self) -> Option<NaiveDate> {
            self.reference.checked_sub_days(Days::new(self.back))
        }

        /// Monday through Sunday, ascending, skipping unrepresentable dates.
        pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
            let (reference, back) = (self.reference, self.back);
            (0..7u64).filter_map(move |offset| {
                if offset < back {
                    reference.checked_sub_days(Days::new(back - offset))
                } else {
                    reference.checked_add_days(Days::new(offset - back))
                }
            })
        }
    }

    /// One row of a week listing: only days that have a file are reported.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct WeekEntry {
        pub date: NaiveDate,
        pub has_morning: bool,
        pub has_evening: bool,
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum DomainError {
        #[error("unknown header {0:?}")]
        UnknownHeader(String),
    }

}

pub mod text {
    //! Line-ending canonicalization and body normalization.

    /// Canonical line ending for stored documents and returned bodies.
    pub const LINE_ENDING: &str = "\r\n";

    /// Rewrites `\r\n`, lone `\r` and lone `\n` to [`LINE_ENDING`].
    pub fn to_canonical(text: &str) -> String {
        text.replace("\r\n", "\n")
            .replace('\r', "\n")
            .replace('\n', LINE_ENDING)
    }

    /// Lines of an already-canonical string.
    pub fn canonical_lines(text: &str) -> impl Iterator<Item = &str> {
        text.split(LINE_ENDING)
    }

    /// Splits on `\r\n` or `\n`, dropping zero-length entries.
    pub fn non_empty_lines(text: &str) -> impl Iterator<Item = &str> {
        text.split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .filter(|line| !line.is_empty())
    }

    /// Canonical endings, blank lines removed, every line trimmed.
    pub fn normalize_body(raw: &str) -> String {
        let text = to_canonical(raw);
        if text.is_empty() {
            return String::new();
        }

        let lines: Vec<&str> = canonical_lines(&text)
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        lines.join(LINE_ENDING).trim_end().to_string()
    }

    /// Reverse of the formatter's bullet markup: strips a literal leading `"- "` per line.
    pub fn strip_bullets(body: &str) -> String {
        let lines: Vec<&str> = non_empty_lines(body)
            .map(|line| line.strip_prefix("- ").unwrap_or(line).trim_end())
            .collect();
        lines.join(LINE_ENDING).trim_end().to_string()
    }

}

pub mod parser {
    //! Block parser: raw document text to [`Document`].
    //!
    //! Line-oriented. A line starting with the block marker opens (or re-opens) the block
    //! keyed by the whole trimmed line; following lines accumulate verbatim until the next
    //! marker. Anything before the first marker is dropped.

    use crate::core::{BLOCK_MARKER, Document, Header};
    use crate::text::{LINE_ENDING, canonical_lines, to_canonical};
    use indexmap::IndexMap;
    use nom::{
        IResult,
        bytes::complete::{tag, tag_no_case},
        combinator::{recognize, rest},
        error::VerboseError,
        sequence::preceded,
    };
    use tracing::debug;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn marker_line(i: &str) -> PResult<'_, &str> {
        recognize(preceded(tag(BLOCK_MARKER), rest))(i)
    }

    fn checked_goal(i: &str) -> PResult<'_, &str> {
        preceded(tag_no_case("- [x]"), rest)(i)
    }

    pub fn is_marker_line(line: &str) -> bool {
        marker_line(line).is_ok()
    }

    /// Text of a `- [x] ...` line (case-insensitive `x`), trimmed.
    pub fn checked_goal_text(line: &str) -> Option<&str> {
        checked_goal(line).ok().map(|(_, text)| text.trim())
    }

    /// Parse a whole document. Never fails: malformed input just yields fewer blocks.
    pub fn parse_blocks(text: &str) -> Document {
        let text = to_canonical(text);
        let mut open: IndexMap<String, String> = IndexMap::new();
        let mut current: Option<String> = None;
        let mut discarded = 0usize;

        for line in canonical_lines(&text) {
            if is_marker_line(line) {
                let key = line.trim().to_string();
                open.entry(key.clone()).or_default();
                current = Some(key);
            } else if let Some(key) = &current {
                if let Some(body) = open.get_mut(key) {
                    body.push_str(line);
                    body.push_str(LINE_ENDING);
                }
            } else if !line.trim().is_empty() {
                discarded += 1;
            }
        }

        if discarded > 0 {
            debug!(discarded, "ignored text before the first block marker");
        }

        let mut doc = Document::new();
        for (key, body) in open {
            let body = body.trim_end().to_string();
            match Header::from_marker(&key) {
                Some(header) => doc.set(header, body),
                None => {
                    doc.unknown.insert(key, body);
                }
            }
        }
        doc
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_catalog_blocks_with_verbatim_bodies() {
            let input = "## 🚀 Today's Goals\n- buy milk\n- learn go\n\n## 🏆 Achievements\n";
            let doc = parse_blocks(input);
            assert_eq!(doc.get(Header::Goals), Some("- buy milk\r\n- learn go"));
            assert_eq!(doc.get(Header::Achievements), Some(""));
            assert_eq!(doc.get(Header::Focus), None);
        }

        #[test]
        fn text_before_first_marker_is_discarded() {
            let doc = parse_blocks("stray preamble\nmore\n## 📌 Notes for Tomorrow\nsleep early");
            assert_eq!(doc.get(Header::Notes), Some("sleep early"));
            assert!(doc.unknown.is_empty());
            assert_eq!(doc.headers().count(), 1);
        }

        #[test]
        fn repeated_marker_keeps_accumulating_into_one_block() {
            let input = "## 💛 Gratitude\n- family\n## 🎯 Focus Areas\n- rust\n## 💛 Gratitude\n- coffee";
            let doc = parse_blocks(input);
            assert_eq!(doc.get(Header::Gratitude), Some("- family\r\n- coffee"));
            assert_eq!(doc.get(Header::Focus), Some("- rust"));
        }

        #[test]
        fn unknown_markers_are_kept_aside() {
            let doc = parse_blocks("## Random Thoughts\nhello\n## 🚀 Today's Goals\n- a");
            assert_eq!(doc.unknown.get("## Random Thoughts").map(String::as_str), Some("hello"));
            assert_eq!(doc.get(Header::Goals), Some("- a"));
        }

        #[test]
        fn marker_key_is_the_trimmed_line() {
            let doc = parse_blocks("## 🚀 Today's Goals   \r\n- a");
            assert_eq!(doc.get(Header::Goals), Some("- a"));
        }

        #[test]
        fn headings_of_other_levels_are_body_text() {
            let doc = parse_blocks("## 🎯 Focus Areas\n# not a block\n### nor this");
            assert_eq!(doc.get(Header::Focus), Some("# not a block\r\n### nor this"));
        }

        #[test]
        fn checked_goal_lines() {
            assert_eq!(checked_goal_text("- [x] ship it "), Some("ship it"));
            assert_eq!(checked_goal_text("- [X] loud"), Some("loud"));
            assert_eq!(checked_goal_text("- [ ] not yet"), None);
            assert_eq!(checked_goal_text("  - [x] indented"), None);
        }
    }
}

pub mod format {
    use crate::core::{Document, Header};
    use crate::text::{LINE_ENDING, non_empty_lines};

    /// Rebuild canonical document text: catalog order, bullet markup, CRLF, no trailing blank line.
    ///
    /// Only catalog headers are written; [`Document::unknown`] is ignored.
    pub fn format_document(doc: &Document) -> String {
        let mut out = String::new();
        let mut first = true;

        for header in Header::ALL {
            let Some(body) = doc.get(header) else {
                continue;
            };
            let body = body.trim();

            if !first {
                out.push_str(LINE_ENDING);
            }
            out.push_str(header.marker());
            out.push_str(LINE_ENDING);

            for line in non_empty_lines(body) {
                let clean = line.trim_start_matches(|c: char| c == '-' || c == ' ').trim();
                out.push_str("- ");
                out.push_str(clean);
                out.push_str(LINE_ENDING);
            }

            first = false;
        }

        out.trim_end().to_string()
    }

}

pub mod paths {
    //! Per-user, per-week file layout: `logs/{user}/{yyyy}_{MM}_Week{n}/{yyyy-MM-dd}.md`.
    //!
    //! `n` is a month-relative bucket, `(day - 1) / 7 + 1`, and has nothing to do with the
    //! Monday-anchored [`WeekWindow`](crate::core::WeekWindow).

    use crate::core::LogKey;
    use chrono::{Datelike, NaiveDate};
    use std::path::{Path, PathBuf};
    use tracing::debug;

    pub const LOGS_DIR: &str = "logs";

    /// Month-relative week bucket, 1..=5.
    pub fn week_bucket(date: NaiveDate) -> u32 {
        (date.day() - 1) / 7 + 1
    }

    pub fn folder_name(date: NaiveDate) -> String {
        format!("{}_Week{}", date.format("%Y_%m"), week_bucket(date))
    }

    pub fn file_name(date: NaiveDate) -> String {
        format!("{}.md", date.format("%Y-%m-%d"))
    }

    /// Maps (user, date) to a document path below a fixed root. The user id is used as-is.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PathResolver {
        root: PathBuf,
    }

    impl PathResolver {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        pub fn user_dir(&self, user_id: &str) -> PathBuf {
            self.root.join(LOGS_DIR).join(user_id)
        }

        pub fn resolve(&self, user_id: &str, date: NaiveDate) -> PathBuf {
            let path = self
                .user_dir(user_id)
                .join(folder_name(date))
                .join(file_name(date));
            debug!(user_id, %date, path = %path.display(), "resolved document path");
            path
        }

        pub fn resolve_key(&self, key: &LogKey) -> PathBuf {
            self.resolve(&key.user_id, key.date)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn d(y: i32, m: u32, day: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, day).expect("valid date")
        }

        #[test]
        fn resolves_relative_layout() {
            let resolver = PathResolver::new("");
            assert_eq!(
                resolver.resolve("alice", d(2024, 5, 20)),
                PathBuf::from("logs/alice/2024_05_Week3/2024-05-20.md")
            );
        }

        #[test]
        fn buckets_are_fixed_offsets_from_month_start() {
            assert_eq!(week_bucket(d(2024, 5, 1)), 1);
            assert_eq!(week_bucket(d(2024, 5, 7)), 1);
            assert_eq!(week_bucket(d(2024, 5, 8)), 2);
            assert_eq!(week_bucket(d(2024, 5, 28)), 4);
            assert_eq!(week_bucket(d(2024, 5, 29)), 5);
            assert_eq!(week_bucket(d(2024, 5, 31)), 5);
        }

        #[test]
        fn resolve_key_matches_resolve() {
            let resolver = PathResolver::new("/srv/journal");
            let key = LogKey::new("bob", d(2023, 12, 9));
            assert_eq!(
                resolver.resolve_key(&key),
                PathBuf::from("/srv/journal/logs/bob/2023_12_Week2/2023-12-09.md")
            );
        }
    }
}

pub mod storage {
    //! File-backed block store.
    //!
    //! `WriteMode::Direct` performs an unsynchronized whole-file read-parse-rewrite: two
    //! concurrent writers on the same day can lose one another's update.
    //! `WriteMode::Guarded` serializes writers per resolved path inside this process and
    //! replaces the file through a temp file + rename.

    use crate::core::{Document, Header, WeekEntry, WeekWindow};
    use crate::format::format_document;
    use crate::parser::parse_blocks;
    use crate::paths::PathResolver;
    use crate::text::{canonical_lines, normalize_body, strip_bullets, to_canonical};
    use chrono::NaiveDate;
    use std::{
        collections::HashMap,
        fs, io,
        io::Write,
        path::{Path, PathBuf},
        sync::{Arc, LazyLock, Mutex, PoisonError},
    };
    use tracing::{debug, info, warn};

    /* ------------------------------- Errors ------------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum StoreError {
        #[error("reading {path:?}")]
        Read { path: PathBuf, source: io::Error },
        #[error("writing {path:?}")]
        Write { path: PathBuf, source: io::Error },
        #[error("creating directory {path:?}")]
        CreateDir { path: PathBuf, source: io::Error },
        #[error("replacing {path:?}")]
        Persist {
            path: PathBuf,
            source: tempfile::PersistError,
        },
    }

    pub type Result<T> = std::result::Result<T, StoreError>;

    /* ------------------------------- Config ------------------------------- */

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub enum WriteMode {
        /// Plain read-modify-write with `fs::write`.
        #[default]
        Direct,
        /// Per-path mutex plus atomic temp-file replace.
        Guarded,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct StoreConfig {
        /// Directory that contains `logs/`.
        pub root: PathBuf,
        pub write_mode: WriteMode,
    }

    impl StoreConfig {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self {
                root: root.into(),
                write_mode: WriteMode::default(),
            }
        }

        pub fn guarded(mut self) -> Self {
            self.write_mode = WriteMode::Guarded;
            self
        }
    }

    /* ------------------------------- Seam ------------------------------- */

    /// Block-level access to one user's documents.
    pub trait BlockRepository {
        /// Raw file text, or `None` when there is no document for `date`.
        fn read_raw(&self, date: NaiveDate) -> Result<Option<String>>;

        /// Plain body lines of one block; empty when the file or block is missing.
        fn read_block(&self, date: NaiveDate, header: Header) -> Result<String>;

        /// Replace one block (`None` body = empty) and rewrite the whole document.
        fn write_block(&self, date: NaiveDate, header: Header, body: Option<&str>) -> Result<()>;

        fn morning_exists(&self, date: NaiveDate) -> Result<bool>;

        fn evening_exists(&self, date: NaiveDate) -> Result<bool>;

        /// Days of the Monday-anchored week around `ref_day` that have a document.
        fn list_week(&self, ref_day: NaiveDate) -> Result<Vec<WeekEntry>>;
    }

    /* ------------------------------- Store ------------------------------- */

    #[derive(Debug, Clone)]
    pub struct BlockStore {
        paths: PathResolver,
        user_id: String,
        write_mode: WriteMode,
    }

    impl BlockStore {
        pub fn new(root: impl Into<PathBuf>, user_id: impl Into<String>) -> Self {
            Self::with_config(&StoreConfig::new(root), user_id)
        }

        pub fn with_config(config: &StoreConfig, user_id: impl Into<String>) -> Self {
            Self {
                paths: PathResolver::new(config.root.clone()),
                user_id: user_id.into(),
                write_mode: config.write_mode,
            }
        }

        pub fn user_id(&self) -> &str {
            &self.user_id
        }

        pub fn write_mode(&self) -> WriteMode {
            self.write_mode
        }

        pub fn document_path(&self, date: NaiveDate) -> PathBuf {
            self.paths.resolve(&self.user_id, date)
        }

        /// Parsed document, including any non-catalog blocks, or `None` when absent.
        pub fn read_document(&self, date: NaiveDate) -> Result<Option<Document>> {
            Ok(self.read_raw(date)?.map(|text| parse_blocks(&text)))
        }

        /// Literal line probe: does the file contain `header`'s marker line?
        pub fn header_exists(&self, date: NaiveDate, header: Header) -> Result<bool> {
            let Some(text) = self.read_raw(date)? else {
                return Ok(false);
            };
            let text = to_canonical(&text);
            Ok(canonical_lines(&text).any(|line| line.trim() == header.marker()))
        }

        fn rewrite(&self, path: &Path, header: Header, body: &str) -> Result<()> {
            let mut doc = match read_text(path)? {
                Some(text) => parse_blocks(&text),
                None if header.is_morning() => Document::morning_skeleton(),
                None => Document::new(),
            };

            if !doc.unknown.is_empty() {
                let dropped: Vec<&str> = doc.unknown.keys().map(String::as_str).collect();
                warn!(path = %path.display(), ?dropped, "unrecognized blocks will not be rewritten");
            }

            doc.set(header, normalize_body(body));
            let rebuilt = to_canonical(&format_document(&doc));

            let dir = path.parent().unwrap_or_else(|| self.paths.root());
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }

            match self.write_mode {
                WriteMode::Direct => {
                    fs::write(path, rebuilt.as_bytes()).map_err(|source| StoreError::Write {
                        path: path.to_path_buf(),
                        source,
                    })?
                }
                WriteMode::Guarded => replace_atomically(dir, path, &rebuilt)?,
            }

            info!(
                path = %path.display(),
                header = header.slug(),
                bytes = rebuilt.len(),
                "wrote document"
            );
            Ok(())
        }
    }

    impl BlockRepository for BlockStore {
        fn read_raw(&self, date: NaiveDate) -> Result<Option<String>> {
            read_text(&self.document_path(date))
        }

        fn read_block(&self, date: NaiveDate, header: Header) -> Result<String> {
            let Some(doc) = self.read_document(date)? else {
                return Ok(String::new());
            };
            match doc.get(header) {
                Some(body) if !body.is_empty() => Ok(strip_bullets(body)),
                _ => Ok(String::new()),
            }
        }

        fn write_block(&self, date: NaiveDate, header: Header, body: Option<&str>) -> Result<()> {
            let path = self.document_path(date);
            let body = body.unwrap_or_default();
            match self.write_mode {
                WriteMode::Direct => self.rewrite(&path, header, body),
                WriteMode::Guarded => {
                    let lock = path_lock(&path);
                    let result = {
                        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
                        self.rewrite(&path, header, body)
                    };
                    release_path_lock(&path, lock);
                    result
                }
            }
        }

        fn morning_exists(&self, date: NaiveDate) -> Result<bool> {
            self.header_exists(date, Header::Goals)
        }

        fn evening_exists(&self, date: NaiveDate) -> Result<bool> {
            self.header_exists(date, Header::Achievements)
        }

        fn list_week(&self, ref_day: NaiveDate) -> Result<Vec<WeekEntry>> {
            let window = WeekWindow::containing(ref_day);
            let mut entries = Vec::with_capacity(7);
            for date in window.days() {
                if !self.document_path(date).is_file() {
                    continue;
                }
                entries.push(WeekEntry {
                    date,
                    has_morning: self.morning_exists(date)?,
                    has_evening: self.evening_exists(date)?,
                });
            }
            debug!(monday = ?window.monday(), found = entries.len(), "listed week");
            Ok(entries)
        }
    }

    /* ------------------------------- Helpers ------------------------------- */

    /// Reads UTF-8 text, dropping a leading byte-order mark. Missing file is `Ok(None)`.
    fn read_text(path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(text) => match text.strip_prefix('\u{feff}') {
                Some(stripped) => Ok(Some(stripped.to_string())),
                None => Ok(Some(text)),
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Writes `text` to a temp file in `dir` and renames it over `path`.
    ///
    /// The replacement keeps the permissions of the file it replaces; a new file gets the
    /// same umask-derived mode `fs::write` would give it.
    fn replace_atomically(dir: &Path, path: &Path, text: &str) -> Result<()> {
        let write_err = |source: io::Error| StoreError::Write {
            path: path.to_path_buf(),
            source,
        };

        let mut builder = tempfile::Builder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            builder.permissions(fs::Permissions::from_mode(0o666));
        }
        let mut tmp = builder.tempfile_in(dir).map_err(write_err)?;

        match fs::metadata(path) {
            Ok(meta) => tmp
                .as_file()
                .set_permissions(meta.permissions())
                .map_err(write_err)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }

        tmp.write_all(text.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(path).map_err(|source| StoreError::Persist {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Guarded-mode writer locks, one per resolved path. Entries live only while a write
    /// on that path is in flight.
    static PATH_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
        LazyLock::new(|| Mutex::new(HashMap::new()));

    fn path_lock(path: &Path) -> Arc<Mutex<()>> {
        let mut locks = PATH_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    fn release_path_lock(path: &Path, lock: Arc<Mutex<()>>) {
        let mut locks = PATH_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
        // Clones are only taken under the map lock, so 2 means the map and `lock` alone.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(path);
        }
    }

}

pub mod checklist {
    //! Goal checklist and weekly progress, computed from stored documents.

    use crate::core::{Header, WeekEntry};
    use crate::parser::checked_goal_text;
    use crate::storage::{BlockRepository, Result};
    use crate::text::{LINE_ENDING, non_empty_lines, to_canonical};
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeSet;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct GoalItem {
        pub text: String,
        pub done: bool,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DayProgress {
        pub date: NaiveDate,
        pub achieved: usize,
        pub total: usize,
        pub percent: u32,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct WeekProgress {
        pub days: Vec<DayProgress>,
        pub achieved: usize,
        pub total: usize,
        pub percent: u32,
    }

    /// Truncating percentage; 0 when there is nothing to achieve.
    pub fn percent(achieved: usize, total: usize) -> u32 {
        if total == 0 {
            return 0;
        }
        u32::try_from(achieved * 100 / total).unwrap_or(u32::MAX)
    }

    /// Texts of every `- [x]` line anywhere in the raw document.
    pub fn checked_goals(raw: &str) -> BTreeSet<String> {
        let text = to_canonical(raw);
        text.split(LINE_ENDING)
            .filter_map(checked_goal_text)
            .map(str::to_string)
            .collect()
    }

    fn goal_lines<R: BlockRepository + ?Sized>(repo: &R, date: NaiveDate) -> Result<Vec<String>> {
        let goals = repo.read_block(date, Header::Goals)?;
        Ok(non_empty_lines(&goals)
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Morning goals paired with whether the day's document has them ticked.
    pub fn goal_checklist<R: BlockRepository + ?Sized>(
        repo: &R,
        date: NaiveDate,
    ) -> Result<Vec<GoalItem>> {
        let checked = repo
            .read_raw(date)?
            .map(|raw| checked_goals(&raw))
            .unwrap_or_default();
        Ok(goal_lines(repo, date)?
            .into_iter()
            .map(|text| GoalItem {
                done: checked.contains(&text),
                text,
            })
            .collect())
    }

    pub fn write_goal_checklist<R: BlockRepository + ?Sized>(
        repo: &R,
        date: NaiveDate,
        items: &[GoalItem],
    ) -> Result<()> {
        let body: Vec<String> = items
            .iter()
            .map(|item| format!("- [{}] {}", if item.done { 'x' } else { ' ' }, item.text))
            .collect();
        repo.write_block(date, Header::EveningGoals, Some(&body.join(LINE_ENDING)))
    }

    fn day_progress<R: BlockRepository + ?Sized>(
        repo: &R,
        entry: &WeekEntry,
    ) -> Result<DayProgress> {
        let goals = goal_lines(repo, entry.date)?;
        let achieved = if entry.has_evening {
            let checked = repo
                .read_raw(entry.date)?
                .map(|raw| checked_goals(&raw))
                .unwrap_or_default();
            goals.iter().filter(|g| checked.contains(*g)).count()
        } else {
            0
        };
        Ok(DayProgress {
            date: entry.date,
            achieved,
            total: goals.len(),
            percent: percent(achieved, goals.len()),
        })
    }

    /// Goal completion for each day of the week around `ref_day` that has a document.
    pub fn week_progress<R: BlockRepository + ?Sized>(
        repo: &R,
        ref_day: NaiveDate,
    ) -> Result<WeekProgress> {
        let mut progress = WeekProgress::default();
        for entry in repo.list_week(ref_day)? {
            let day = day_progress(repo, &entry)?;
            progress.achieved += day.achieved;
            progress.total += day.total;
            progress.days.push(day);
        }
        progress.percent = percent(progress.achieved, progress.total);
        Ok(progress)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::storage::BlockStore;

        fn d(y: i32, m: u32, day: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, day).expect("valid date")
        }

        #[test]
        fn percent_truncates() {
            assert_eq!(percent(0, 0), 0);
            assert_eq!(percent(1, 3), 33);
            assert_eq!(percent(2, 3), 66);
            assert_eq!(percent(3, 3), 100);
        }

        #[test]
        fn checklist_round_trip_through_store() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let store = BlockStore::new(tmp.path(), "alice");
            let day = d(2024, 5, 14);
            store
                .write_block(day, Header::Goals, Some("run 5k\nread\nwrite"))
                .expect("goals");

            let mut items = goal_checklist(&store, day).expect("checklist");
            assert_eq!(items.len(), 3);
            assert!(items.iter().all(|i| !i.done));

            items[0].done = true;
            items[2].done = true;
            write_goal_checklist(&store, day, &items).expect("write checklist");

            assert_eq!(
                store.read_block(day, Header::EveningGoals).expect("read"),
                "[x] run 5k\r\n[ ] read\r\n[x] write"
            );
            let done: Vec<_> = goal_checklist(&store, day)
                .expect("checklist")
                .into_iter()
                .filter(|i| i.done)
                .map(|i| i.text)
                .collect();
            assert_eq!(done, vec!["run 5k".to_string(), "write".to_string()]);
        }

        #[test]
        fn week_progress_counts_only_days_with_evening() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let store = BlockStore::new(tmp.path(), "alice");
            let mon = d(2024, 5, 13);
            let tue = d(2024, 5, 14);

            store.write_block(mon, Header::Goals, Some("a\nb")).expect("goals");
            write_goal_checklist(
                &store,
                mon,
                &[
                    GoalItem { text: "a".into(), done: true },
                    GoalItem { text: "b".into(), done: false },
                ],
            )
            .expect("checklist");
            store.write_block(mon, Header::Achievements, Some("shipped")).expect("evening");

            // Ticked but no evening entry: not counted.
            store.write_block(tue, Header::Goals, Some("c")).expect("goals");
            write_goal_checklist(&store, tue, &[GoalItem { text: "c".into(), done: true }])
                .expect("checklist");

            let progress = week_progress(&store, d(2024, 5, 16)).expect("progress");
            assert_eq!(progress.days.len(), 2);
            assert_eq!((progress.days[0].achieved, progress.days[0].total), (1, 2));
            assert_eq!(progress.days[0].percent, 50);
            assert_eq!((progress.days[1].achieved, progress.days[1].total), (0, 1));
            assert_eq!((progress.achieved, progress.total, progress.percent), (1, 3, 33));
        }
    }
}

pub use checklist::{GoalItem, WeekProgress, goal_checklist, week_progress, write_goal_checklist};
pub use crate::core::{Document, Header, LogKey, WeekEntry, WeekWindow};
pub use format::format_document;
pub use parser::parse_blocks;
pub use paths::PathResolver;
pub use storage::{BlockRepository, BlockStore, StoreConfig, StoreError, WriteMode};
pub use text::normalize_body;
