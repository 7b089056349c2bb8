//! Kindle clippings to Org outline conversion.
//! The raw device export and the stored outline are read into the same record model,
//! merged so that edits made in Org survive a re-import, and rendered back to Org text.

pub mod core {
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use sha2::{Digest, Sha256};
    use std::{collections::BTreeSet, fmt};

    /* ------------------------------ Status ------------------------------ */

    /// Status marker of an outline entry: either a checkbox or a TODO keyword.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub enum Todo {
        #[default]
        None,
        Unchecked,    // [ ]
        CheckStarted, // [-]
        CheckWaiting, // [?]
        Checked,      // [X]
        Todo,
        Started, // STRT
        Project, // PROJ
        Waiting, // WAIT
        Held,    // HOLD
        Done,
        Killed, // KILL
    }

    impl Todo {
        /// Keywords recognized at the start of a headline.
        pub const KEYWORDS: [&'static str; 7] = ["TODO", "STRT", "PROJ", "WAIT", "HOLD", "DONE", "KILL"];

        pub fn token(self) -> &'static str {
            match self {
                Todo::None => "",
                Todo::Unchecked => "[ ]",
                Todo::CheckStarted => "[-]",
                Todo::CheckWaiting => "[?]",
                Todo::Checked => "[X]",
                Todo::Todo => "TODO",
                Todo::Started => "STRT",
                Todo::Project => "PROJ",
                Todo::Waiting => "WAIT",
                Todo::Held => "HOLD",
                Todo::Done => "DONE",
                Todo::Killed => "KILL",
            }
        }

        /// Position in the merge progression. Keywords always outrank checkboxes.
        fn rank(self) -> u8 {
            match self {
                Todo::None => 0,
                Todo::Unchecked => 1,
                Todo::CheckStarted => 2,
                Todo::CheckWaiting => 3,
                Todo::Checked => 4,
                Todo::Todo => 5,
                Todo::Started => 6,
                Todo::Project => 7,
                Todo::Waiting => 8,
                Todo::Held => 9,
                Todo::Done => 10,
                Todo::Killed => 11,
            }
        }

        /// Returns whichever status is further along; ties keep `self`.
        pub fn merge(self, other: Todo) -> Todo {
            if self.rank() < other.rank() { other } else { self }
        }

        /// Counted as finished by progress cookies.
        pub fn is_complete(self) -> bool {
            matches!(self, Todo::Done | Todo::Checked)
        }

        pub fn from_keyword(word: &str) -> Option<Todo> {
            match word {
                "TODO" => Some(Todo::Todo),
                "STRT" => Some(Todo::Started),
                "PROJ" => Some(Todo::Project),
                "WAIT" => Some(Todo::Waiting),
                "HOLD" => Some(Todo::Held),
                "DONE" => Some(Todo::Done),
                "KILL" => Some(Todo::Killed),
                _ => None,
            }
        }

        /// Maps the character between checkbox brackets.
        pub fn from_checkbox(mark: char) -> Result<Todo, DomainError> {
            match mark {
                ' ' => Ok(Todo::Unchecked),
                '-' => Ok(Todo::CheckStarted),
                '?' => Ok(Todo::CheckWaiting),
                'X' | 'x' => Ok(Todo::Checked),
                other => Err(DomainError::InvalidCheckbox(other)),
            }
        }
    }

    impl fmt::Display for Todo {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.token())
        }
    }

    /// Completed/total counter shown as `[n/m]` after a heading.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Progress {
        pub done: usize,
        pub total: usize,
    }

    impl std::ops::Add for Progress {
        type Output = Progress;

        fn add(self, rhs: Progress) -> Progress {
            Progress {
                done: self.done + rhs.done,
                total: self.total + rhs.total,
            }
        }
    }

    impl std::iter::Sum for Progress {
        fn sum<I: Iterator<Item = Progress>>(iter: I) -> Progress {
            iter.fold(Progress::default(), |acc, p| acc + p)
        }
    }

    impl fmt::Display for Progress {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "[{}/{}]", self.done, self.total)
        }
    }

    /* ------------------------------ Time ------------------------------ */

    /// Creation time of a record. Rendered as an inactive Org timestamp.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct EmacsDateTime(pub NaiveDateTime);

    impl EmacsDateTime {
        pub const KINDLE_FORMAT: &'static str = "Added on %A, %B %d, %Y %I:%M:%S %p";
        pub const ORG_FORMAT: &'static str = "[%Y-%m-%d %a %H:%M]";

        /// Parses the `Added on ...` segment of a clipping's metadata line.
        pub fn from_kindle(raw: &str) -> Option<Self> {
            NaiveDateTime::parse_from_str(raw.trim(), Self::KINDLE_FORMAT)
                .ok()
                .map(Self)
        }

        /// Accepts `[2020-05-10 Sun 13:08]`, the same with seconds, and the bare
        /// `2020-05-10 13:08:22` form. The weekday name is not checked.
        pub fn from_org(raw: &str) -> Option<Self> {
            let inner = raw
                .trim()
                .trim_start_matches(['[', '<'])
                .trim_end_matches([']', '>']);
            let mut parts = inner.split_whitespace();
            let date = NaiveDate::parse_from_str(parts.next()?, "%Y-%m-%d").ok()?;
            let time = parts.find(|p| p.contains(':'))?;
            let time = NaiveTime::parse_from_str(time, "%H:%M:%S")
                .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M"))
                .ok()?;
            Some(Self(date.and_time(time)))
        }
    }

    impl fmt::Display for EmacsDateTime {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0.format(Self::ORG_FORMAT))
        }
    }

    /// Active `<...>` or inactive `[...]` timestamp on a planning line.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OrgTimestamp {
        pub active: bool,
        pub date: NaiveDate,
        pub time: Option<NaiveTime>,
    }

    impl fmt::Display for OrgTimestamp {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let (open, close) = if self.active { ('<', '>') } else { ('[', ']') };
            write!(f, "{open}{}", self.date.format("%Y-%m-%d %a"))?;
            if let Some(time) = self.time {
                write!(f, " {}", time.format("%H:%M"))?;
            }
            write!(f, "{close}")
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum PlanningKind {
        Scheduled,
        Deadline,
        Closed,
    }

    impl PlanningKind {
        pub fn keyword(self) -> &'static str {
            match self {
                PlanningKind::Scheduled => "SCHEDULED",
                PlanningKind::Deadline => "DEADLINE",
                PlanningKind::Closed => "CLOSED",
            }
        }
    }

    /// One entry of a planning line, e.g. `CLOSED: [2020-07-08 Wed 21:40]`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OrgTime {
        pub kind: PlanningKind,
        pub timestamp: OrgTimestamp,
    }

    impl fmt::Display for OrgTime {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}: {}", self.kind.keyword(), self.timestamp)
        }
    }

    /* ---------------------------- Shared fields ---------------------------- */

    /// Fields every outline entity carries next to its typed data.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct OrgMeta {
        pub status: Todo,
        pub body: Option<String>,
        /// Properties without a typed field, keyed in lowercase.
        #[serde(default)]
        pub properties: IndexMap<String, String>,
        pub created: Option<EmacsDateTime>,
        /// SCHEDULED/DEADLINE/CLOSED entries in source order.
        #[serde(default)]
        pub important_times: Vec<OrgTime>,
        #[serde(default)]
        pub tags: BTreeSet<String>,
    }

    impl OrgMeta {
        pub fn with_status(status: Todo) -> Self {
            Self {
                status,
                ..Self::default()
            }
        }

        /// Overlays `other` (the incoming side) onto `self` (the stored side).
        pub fn merge(&mut self, other: &OrgMeta) {
            self.status = self.status.merge(other.status);
            self.body = merge_body(self.body.as_deref(), other.body.as_deref());
            for (key, value) in &other.properties {
                self.properties.insert(key.clone(), value.clone());
            }
            if self.created.is_none() {
                self.created = other.created;
            }
            for time in &other.important_times {
                if !self.important_times.contains(time) {
                    self.important_times.push(time.clone());
                }
            }
            self.tags.extend(other.tags.iter().cloned());
        }

        pub(crate) fn feed(&self, digest: &mut ContentDigester) {
            digest.field(self.status.token());
            digest.opt_field(self.body.as_deref());
            let mut props: Vec<(&String, &String)> = self.properties.iter().collect();
            props.sort();
            for (key, value) in props {
                digest.field(key).field(value);
            }
            for tag in &self.tags {
                digest.field(tag);
            }
            for time in &self.important_times {
                digest.field(&time.to_string());
            }
        }
    }

    fn merge_body(left: Option<&str>, right: Option<&str>) -> Option<String> {
        let left = left.map(str::trim).unwrap_or_default();
        let right = right.map(str::trim).unwrap_or_default();
        let merged = if left == right || right.is_empty() {
            left.to_string()
        } else if left.is_empty() {
            right.to_string()
        } else {
            format!("{left}\n{right}")
        };
        (!merged.is_empty()).then_some(merged)
    }

    /* ------------------------------ Digests ------------------------------ */

    /// SHA-256 over an entity's content, used to detect unchanged entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct ContentDigest(pub [u8; 32]);

    impl fmt::Display for ContentDigest {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            for byte in self.0 {
                write!(f, "{byte:02x}")?;
            }
            Ok(())
        }
    }

    /// Feeds fields into a digest in a fixed order. Every field is framed by a
    /// presence byte and a zero terminator, so `None` and `""` differ.
    #[derive(Default)]
    pub struct ContentDigester {
        hasher: Sha256,
    }

    impl ContentDigester {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn field(&mut self, value: &str) -> &mut Self {
            self.hasher.update([1]);
            self.hasher.update(value.as_bytes());
            self.hasher.update([0]);
            self
        }

        pub fn opt_field(&mut self, value: Option<&str>) -> &mut Self {
            match value {
                Some(value) => self.field(value),
                None => {
                    self.hasher.update([2, 0]);
                    self
                }
            }
        }

        pub fn digest(&mut self, child: &ContentDigest) -> &mut Self {
            self.hasher.update(child.0);
            self
        }

        pub fn finish(self) -> ContentDigest {
            let mut out = [0u8; 32];
            out.copy_from_slice(&self.hasher.finalize());
            ContentDigest(out)
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, PartialEq, Eq, thiserror::Error)]
    pub enum DomainError {
        #[error("invalid checkbox [{0}]")]
        InvalidCheckbox(char),
        #[error("unknown status keyword {0:?}")]
        UnknownStatus(String),
        #[error("unknown annotation kind {0:?}")]
        UnknownAnnotationKind(String),
        #[error("clipping #{index} has no metadata line")]
        MissingMetadata { index: usize },
        #[error("clipping #{index} has no readable timestamp in {line:?}")]
        MissingTimestamp { index: usize, line: String },
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn status_only_moves_forward() {
            assert_eq!(Todo::Todo.merge(Todo::Done), Todo::Done);
            assert_eq!(Todo::CheckWaiting.merge(Todo::Checked), Todo::Checked);
            assert_eq!(Todo::Checked.merge(Todo::CheckWaiting), Todo::Checked);
            assert_eq!(Todo::Checked.merge(Todo::Todo), Todo::Todo);
            assert_eq!(Todo::Todo.merge(Todo::Todo), Todo::Todo);
            assert_eq!(Todo::Started.merge(Todo::Done), Todo::Done);
            assert_eq!(Todo::Killed.merge(Todo::None), Todo::Killed);

            let all = [
                Todo::None,
                Todo::Unchecked,
                Todo::CheckStarted,
                Todo::CheckWaiting,
                Todo::Checked,
                Todo::Todo,
                Todo::Started,
                Todo::Project,
                Todo::Waiting,
                Todo::Held,
                Todo::Done,
                Todo::Killed,
            ];
            for a in all {
                for b in all {
                    let merged = a.merge(b);
                    assert!(merged == a || merged == b, "{a:?} + {b:?}");
                    assert!(merged.rank() >= a.rank(), "{a:?} + {b:?}");
                    assert!(merged.rank() >= b.rank(), "{a:?} + {b:?}");
                }
            }
        }

        #[test]
        fn checkbox_marks() {
            assert_eq!(Todo::from_checkbox(' '), Ok(Todo::Unchecked));
            assert_eq!(Todo::from_checkbox('X'), Ok(Todo::Checked));
            assert_eq!(Todo::from_checkbox('?'), Ok(Todo::CheckWaiting));
            assert_eq!(
                Todo::from_checkbox('Y'),
                Err(DomainError::InvalidCheckbox('Y'))
            );
        }

        #[test]
        fn progress_renders_as_cookie() {
            let total: Progress = [
                Progress { done: 1, total: 2 },
                Progress { done: 0, total: 98 },
            ]
            .into_iter()
            .sum();
            assert_eq!(total.to_string(), "[1/100]");
        }

        #[test]
        fn kindle_and_org_times() {
            let added = EmacsDateTime::from_kindle("Added on Sunday, May 10, 2020 1:08:22 PM")
                .expect("kindle time");
            assert_eq!(added.to_string(), "[2020-05-10 Sun 13:08]");

            let org = EmacsDateTime::from_org("[2020-05-10 Sun 13:08]").expect("org time");
            assert_eq!(org.to_string(), added.to_string());
            assert!(EmacsDateTime::from_org("2020-05-10 13:08:22").is_some());
            assert!(EmacsDateTime::from_org("sometime in May").is_none());
        }

        #[test]
        fn meta_merge_concatenates_differing_bodies() {
            let mut left = OrgMeta {
                body: Some("kept".into()),
                ..OrgMeta::default()
            };
            left.properties.insert("id".into(), "1".into());
            let mut right = OrgMeta::with_status(Todo::Done);
            right.body = Some("  added \n".into());
            right.properties.insert("id".into(), "2".into());
            right.tags.insert("reread".into());

            left.merge(&right);
            assert_eq!(left.status, Todo::Done);
            assert_eq!(left.body.as_deref(), Some("kept\nadded"));
            assert_eq!(left.properties.get("id").map(String::as_str), Some("2"));
            assert!(left.tags.contains("reread"));

            let snapshot = left.clone();
            left.merge(&snapshot);
            assert_eq!(left, snapshot);
        }

        #[test]
        fn digest_separates_missing_from_empty() {
            let mut a = ContentDigester::new();
            a.opt_field(None);
            let mut b = ContentDigester::new();
            b.opt_field(Some(""));
            assert_ne!(a.finish(), b.finish());
        }
    }
}

pub mod model {
    //! Record model: annotations grouped into books, books into authors.

    use crate::core::*;
    use serde::{Deserialize, Serialize};
    use std::{collections::BTreeMap, fmt};
    use tracing::warn;

    /* ------------------------------ Positions ------------------------------ */

    /// One side of a page range. Front matter is numbered with roman numerals.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum PageValue {
        Number(u32),
        Text(String),
    }

    impl PageValue {
        pub fn parse(raw: &str) -> Self {
            raw.parse::<u32>()
                .map(PageValue::Number)
                .unwrap_or_else(|_| PageValue::Text(raw.to_string()))
        }

        /// Sort weight, `None` for text that is not a roman numeral.
        pub fn weight(&self) -> Option<PageWeight> {
            match self {
                PageValue::Number(n) => Some(PageWeight::whole(*n)),
                PageValue::Text(text) => roman_value(text).map(PageWeight::roman),
            }
        }
    }

    impl fmt::Display for PageValue {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                PageValue::Number(n) => write!(f, "{n}"),
                PageValue::Text(text) => f.write_str(text),
            }
        }
    }

    /// Page position in ten-thousandths of a page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct PageWeight(i64);

    impl PageWeight {
        pub const SCALE: i64 = 10_000;
        /// Weight of a page that is neither a number nor a roman numeral.
        pub const UNKNOWN: PageWeight = PageWeight(-Self::SCALE);

        pub fn whole(page: u32) -> Self {
            Self(i64::from(page) * Self::SCALE)
        }

        /// Roman numeral `value` weighs `value / SCALE` pages, ahead of page 1.
        pub fn roman(value: u32) -> Self {
            Self(i64::from(value))
        }

        pub fn ten_thousandths(self) -> i64 {
            self.0
        }
    }

    /// Value of a roman numeral in either case; `None` for anything else.
    pub fn roman_value(raw: &str) -> Option<u32> {
        let digits = raw
            .chars()
            .map(|c| match c.to_ascii_uppercase() {
                'I' => Some(1),
                'V' => Some(5),
                'X' => Some(10),
                'L' => Some(50),
                'C' => Some(100),
                'D' => Some(500),
                'M' => Some(1000),
                _ => None,
            })
            .collect::<Option<Vec<i64>>>()?;
        let mut total = 0i64;
        for (idx, digit) in digits.iter().enumerate() {
            match digits.get(idx + 1) {
                Some(next) if digit < next => total -= digit,
                _ => total += digit,
            }
        }
        u32::try_from(total).ok().filter(|v| *v > 0)
    }

    /// A `start[-end]` span as printed by the device.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Range<T> {
        pub start: T,
        pub end: Option<T>,
    }

    pub type PageRange = Range<PageValue>;
    pub type LocationRange = Range<u32>;

    impl<T> Range<T> {
        pub fn new(start: T, end: Option<T>) -> Self {
            Self { start, end }
        }
    }

    impl<T: fmt::Display> fmt::Display for Range<T> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match &self.end {
                Some(end) => write!(f, "{}-{}", self.start, end),
                None => write!(f, "{}", self.start),
            }
        }
    }

    impl Range<PageValue> {
        /// Reads the last whitespace-separated token of `raw` as `start[-end]`.
        pub fn parse(raw: &str) -> Option<Self> {
            let token = raw.split_whitespace().last()?;
            let mut sides = token.split('-').filter(|s| !s.is_empty());
            let start = PageValue::parse(sides.next()?);
            Some(Self::new(start, sides.next().map(PageValue::parse)))
        }
    }

    impl Range<u32> {
        pub fn parse(raw: &str) -> Option<Self> {
            let range = PageRange::parse(raw)?;
            let number = |value: &PageValue| match value {
                PageValue::Number(n) => Some(*n),
                PageValue::Text(_) => None,
            };
            let located = number(&range.start).and_then(|start| match &range.end {
                Some(end) => number(end).map(|end| Self::new(start, Some(end))),
                None => Some(Self::new(start, None)),
            });
            if located.is_none() {
                warn!(raw, "ignoring non-numeric location");
            }
            located
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum AnnotationKind {
        Highlight,
        Note,
        Bookmark,
    }

    impl AnnotationKind {
        pub fn name(self) -> &'static str {
            match self {
                AnnotationKind::Highlight => "Highlight",
                AnnotationKind::Note => "Note",
                AnnotationKind::Bookmark => "Bookmark",
            }
        }

        pub fn from_name(name: &str) -> Result<Self, DomainError> {
            match name.trim() {
                "Highlight" => Ok(AnnotationKind::Highlight),
                "Note" => Ok(AnnotationKind::Note),
                "Bookmark" => Ok(AnnotationKind::Bookmark),
                other => Err(DomainError::UnknownAnnotationKind(other.to_string())),
            }
        }
    }

    /// A single highlight, note, or bookmark.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Annotation {
        pub kind: AnnotationKind,
        pub title: String,
        pub author: String,
        pub series: Option<String>,
        pub page: Option<PageRange>,
        pub location: Option<LocationRange>,
        /// Highlighted text.
        pub selection: Option<String>,
        /// Text typed on the device.
        pub note: Option<String>,
        pub meta: OrgMeta,
    }

    /// Which passage an annotation refers to, whatever was edited since.
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct AnnotationIdentity {
        pub title: String,
        pub location: Option<LocationRange>,
        pub page: Option<PageRange>,
    }

    /// Reading order: author, title without its article, page, location, then time.
    /// Missing positions sort first.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct AnnotationSortKey {
        author: String,
        title: String,
        page: Option<PageWeight>,
        location: Option<u32>,
        created: Option<EmacsDateTime>,
    }

    impl Annotation {
        pub fn new(kind: AnnotationKind, title: impl Into<String>, author: impl Into<String>) -> Self {
            Self {
                kind,
                title: title.into(),
                author: author.into(),
                series: None,
                page: None,
                location: None,
                selection: None,
                note: None,
                meta: OrgMeta::default(),
            }
        }

        pub fn created(&self) -> Option<EmacsDateTime> {
            self.meta.created
        }

        pub fn identity(&self) -> AnnotationIdentity {
            AnnotationIdentity {
                title: self.title.clone(),
                location: self.location.clone(),
                page: self.page.clone(),
            }
        }

        pub fn sort_key(&self) -> AnnotationSortKey {
            AnnotationSortKey {
                author: self.author.to_lowercase(),
                title: sort_title(&self.title),
                page: self
                    .page
                    .as_ref()
                    .map(|p| p.start.weight().unwrap_or(PageWeight::UNKNOWN)),
                location: self.location.as_ref().map(|l| l.start),
                created: self.meta.created,
            }
        }

        /// Field order: page, location, kind, selection, note, creation time,
        /// then status, body, extra properties, tags and planning. The creation time
        /// is hashed to the minute, as stored in the outline.
        pub fn digest(&self) -> ContentDigest {
            let mut digest = ContentDigester::new();
            digest
                .opt_field(self.page.as_ref().map(ToString::to_string).as_deref())
                .opt_field(self.location.as_ref().map(ToString::to_string).as_deref())
                .field(self.kind.name())
                .opt_field(self.selection.as_deref())
                .opt_field(self.note.as_deref())
                .opt_field(
                    self.meta
                        .created
                        .map(|c| c.0.format("%Y-%m-%d %H:%M").to_string())
                        .as_deref(),
                );
            self.meta.feed(&mut digest);
            digest.finish()
        }
    }

    fn sort_title(title: &str) -> String {
        let lower = title.trim().to_lowercase();
        for article in ["the ", "a "] {
            if let Some(rest) = lower.strip_prefix(article) {
                return rest.to_string();
            }
        }
        lower
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Book {
        pub title: String,
        pub author: String,
        pub series: Option<String>,
        pub annotations: Vec<Annotation>,
        pub meta: OrgMeta,
    }

    impl Book {
        pub fn new(title: impl Into<String>, author: impl Into<String>) -> Self {
            Self {
                title: title.into(),
                author: author.into(),
                series: None,
                annotations: Vec::new(),
                meta: OrgMeta::default(),
            }
        }

        pub fn progress(&self) -> Progress {
            Progress {
                done: self
                    .annotations
                    .iter()
                    .filter(|a| a.meta.status.is_complete())
                    .count(),
                total: self.annotations.len(),
            }
        }

        /// Child digests are folded in sorted, so annotation order does not matter.
        pub fn digest(&self) -> ContentDigest {
            let mut digest = ContentDigester::new();
            digest
                .field(&self.title)
                .field(&self.author)
                .opt_field(self.series.as_deref());
            self.meta.feed(&mut digest);
            let mut children: Vec<ContentDigest> =
                self.annotations.iter().map(Annotation::digest).collect();
            children.sort();
            for child in &children {
                digest.digest(child);
            }
            digest.finish()
        }

        pub fn sort_annotations(&mut self) {
            self.annotations.sort_by_cached_key(Annotation::sort_key);
        }

        /// The earliest annotation time.
        pub fn refresh_created(&mut self) {
            self.meta.created = self.annotations.iter().filter_map(Annotation::created).min();
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Author {
        pub name: String,
        /// Keyed by title.
        pub books: BTreeMap<String, Book>,
        pub meta: OrgMeta,
    }

    impl Author {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                books: BTreeMap::new(),
                meta: OrgMeta::default(),
            }
        }

        pub fn progress(&self) -> Progress {
            self.books.values().map(Book::progress).sum()
        }

        pub fn digest(&self) -> ContentDigest {
            let mut digest = ContentDigester::new();
            digest.field(&self.name);
            self.meta.feed(&mut digest);
            let mut children: Vec<ContentDigest> = self.books.values().map(Book::digest).collect();
            children.sort();
            for child in &children {
                digest.digest(child);
            }
            digest.finish()
        }

        pub fn refresh_created(&mut self) {
            self.meta.created = self.books.values().filter_map(|b| b.meta.created).min();
        }
    }

    pub type Authors = BTreeMap<String, Author>;

    /// A whole outline document.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Library {
        /// Text before the first heading, kept verbatim.
        pub preamble: Option<String>,
        pub authors: Authors,
    }

    impl Library {
        pub fn is_empty(&self) -> bool {
            self.authors.is_empty()
        }

        pub fn book_count(&self) -> usize {
            self.authors.values().map(|a| a.books.len()).sum()
        }

        pub fn annotations(&self) -> impl Iterator<Item = &Annotation> {
            self.authors
                .values()
                .flat_map(|a| a.books.values())
                .flat_map(|b| b.annotations.iter())
        }
    }

    /* ------------------------- Serialization surface ------------------------- */

    /// What the serializer reads from each entity.
    pub trait OrgEntity {
        fn meta(&self) -> &OrgMeta;
        fn heading(&self) -> &str;
        /// Star count of the headline.
        fn depth(&self) -> usize;
        fn progress(&self) -> Option<Progress> {
            None
        }
        /// Typed fields written into the property drawer over the extras.
        fn typed_properties(&self) -> Vec<(&'static str, Option<String>)>;
    }

    impl OrgEntity for Annotation {
        fn meta(&self) -> &OrgMeta {
            &self.meta
        }

        fn heading(&self) -> &str {
            self.kind.name()
        }

        fn depth(&self) -> usize {
            3
        }

        fn typed_properties(&self) -> Vec<(&'static str, Option<String>)> {
            vec![
                ("page", self.page.as_ref().map(ToString::to_string)),
                ("location", self.location.as_ref().map(ToString::to_string)),
                ("note", self.note.clone()),
                ("highlight", self.selection.clone()),
                ("creation_date", self.meta.created.map(|c| c.to_string())),
                ("title", Some(self.title.clone())),
                ("author", Some(self.author.clone())),
                ("series", self.series.clone()),
            ]
        }
    }

    impl OrgEntity for Book {
        fn meta(&self) -> &OrgMeta {
            &self.meta
        }

        fn heading(&self) -> &str {
            &self.title
        }

        fn depth(&self) -> usize {
            2
        }

        fn progress(&self) -> Option<Progress> {
            Some(Book::progress(self))
        }

        fn typed_properties(&self) -> Vec<(&'static str, Option<String>)> {
            vec![
                ("title", Some(self.title.clone())),
                ("author", Some(self.author.clone())),
                ("series", self.series.clone()),
                ("creation_date", self.meta.created.map(|c| c.to_string())),
            ]
        }
    }

    impl OrgEntity for Author {
        fn meta(&self) -> &OrgMeta {
            &self.meta
        }

        fn heading(&self) -> &str {
            &self.name
        }

        fn depth(&self) -> usize {
            1
        }

        fn progress(&self) -> Option<Progress> {
            Some(Author::progress(self))
        }

        fn typed_properties(&self) -> Vec<(&'static str, Option<String>)> {
            vec![
                ("author", Some(self.name.clone())),
                ("creation_date", self.meta.created.map(|c| c.to_string())),
            ]
        }
    }

}

pub mod clippings {
    //! Reader for the device's `My Clippings.txt` export.
    //!
    //! Each clipping is a block of lines closed by a `==========` separator:
    //! a `Title (Series) (Author)` line, a metadata line
    //! `- Your Highlight on page 12 | Location 170-171 | Added on ...`, and the text.

    use crate::core::*;
    use crate::model::*;
    use nom::{
        IResult, bytes::complete::is_not, character::complete::char, error::VerboseError,
        sequence::delimited,
    };
    use tracing::debug;

    pub const CLIPPINGS_SEPARATOR: &str = "==========";
    /// Stands in for line breaks inside a note or selection, which live in
    /// single-line properties once written to Org.
    pub const NOTE_LINE_JOIN: &str = "[ |n| ]";
    pub const UNKNOWN_AUTHOR: &str = "Unknown";
    const BOM: char = '\u{feff}';

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Parses a whole export into authors and books. Any malformed clipping fails the import.
    pub fn parse_clippings(input: &str) -> Result<Library, DomainError> {
        let text = input.replace(BOM, "");
        let mut parsed = Vec::new();
        for (index, section) in text.split(CLIPPINGS_SEPARATOR).enumerate() {
            if section.trim().is_empty() {
                continue;
            }
            parsed.push(parse_annotation(section, index)?);
        }
        debug!(clippings = parsed.len(), "parsed clippings export");
        Ok(Library {
            preamble: None,
            authors: group_annotations(collate(parsed)),
        })
    }

    /// Parses one separator-delimited clipping; `index` only labels errors.
    pub fn parse_annotation(section: &str, index: usize) -> Result<Annotation, DomainError> {
        let lines: Vec<&str> = section
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .collect();
        let [header, metadata, body @ ..] = lines.as_slice() else {
            return Err(DomainError::MissingMetadata { index });
        };

        let (title, author, series) = title_author_series(header);
        let segments: Vec<&str> = metadata.split('|').map(str::trim).collect();
        let missing_time = || DomainError::MissingTimestamp {
            index,
            line: metadata.to_string(),
        };

        let (kind, page, location, stamp) = match segments.as_slice() {
            [position, stamp] => {
                let lower = position.to_lowercase();
                let (page, location) = if lower.contains("location") {
                    (None, LocationRange::parse(position))
                } else if lower.contains("page") {
                    (PageRange::parse(position), None)
                } else {
                    (None, None)
                };
                (annotation_kind(position), page, location, *stamp)
            }
            [page, location, stamp, ..] => (
                annotation_kind(page),
                PageRange::parse(page),
                LocationRange::parse(location),
                *stamp,
            ),
            _ => return Err(missing_time()),
        };
        let created = EmacsDateTime::from_kindle(stamp).ok_or_else(missing_time)?;

        let joined = body
            .iter()
            .map(|line| line.trim())
            .collect::<Vec<_>>()
            .join(NOTE_LINE_JOIN);
        let text = Some(joined.trim().to_string()).filter(|t| !t.is_empty());

        let mut annotation = Annotation::new(kind, title, author);
        annotation.series = series;
        annotation.page = page;
        annotation.location = location;
        annotation.meta = OrgMeta::with_status(Todo::Unchecked);
        annotation.meta.created = Some(created);
        match kind {
            AnnotationKind::Note => annotation.note = text,
            AnnotationKind::Highlight => annotation.selection = text,
            AnnotationKind::Bookmark => {}
        }
        Ok(annotation)
    }

    fn annotation_kind(segment: &str) -> AnnotationKind {
        if segment.contains("Bookmark") {
            AnnotationKind::Bookmark
        } else if segment.contains("Note") {
            AnnotationKind::Note
        } else {
            AnnotationKind::Highlight
        }
    }

    /// Splits `Title (Series) (Author)`. Any other number of groups leaves the
    /// author unknown and no series.
    pub fn title_author_series(line: &str) -> (String, String, Option<String>) {
        let line = line.trim_matches(BOM).trim();
        let title = line.split('(').next().unwrap_or_default().trim().to_string();
        let groups = parenthesized_groups(line);
        let (series, author) = match groups.as_slice() {
            [author] => (None, Some(*author)),
            [series, author] => (Some(*series), Some(*author)),
            _ => (None, None),
        };
        let author = author
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or(UNKNOWN_AUTHOR)
            .to_string();
        let series = series
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        (title, author, series)
    }

    fn paren_group(i: &str) -> PResult<'_, &str> {
        delimited(char('('), is_not(")"), char(')'))(i)
    }

    fn parenthesized_groups(line: &str) -> Vec<&str> {
        let mut groups = Vec::new();
        let mut rest = line;
        while let Some(pos) = rest.find('(') {
            rest = &rest[pos..];
            match paren_group(rest) {
                Ok((after, group)) => {
                    groups.push(group);
                    rest = after;
                }
                Err(_) => rest = &rest[1..],
            }
        }
        groups
    }

    /// The device saves a note typed on a highlight as a separate clipping written
    /// just before it. A highlight ending where the preceding note sits absorbs it.
    fn collate(annotations: Vec<Annotation>) -> Vec<Annotation> {
        let mut out = Vec::with_capacity(annotations.len());
        let mut pending: Option<Annotation> = None;
        for current in annotations {
            match pending.take() {
                Some(note) if attaches_to(&note, &current) => {
                    debug!(title = %current.title, "attached note to highlight");
                    let mut merged = current;
                    merged.kind = AnnotationKind::Note;
                    merged.note = note.note;
                    out.push(merged);
                }
                Some(previous) => {
                    out.push(previous);
                    pending = Some(current);
                }
                None => pending = Some(current),
            }
        }
        out.extend(pending);
        out
    }

    fn attaches_to(note: &Annotation, highlight: &Annotation) -> bool {
        note.kind == AnnotationKind::Note
            && highlight.kind == AnnotationKind::Highlight
            && note.title == highlight.title
            && match (&note.location, &highlight.location) {
                (Some(at), Some(span)) => span.end == Some(at.start),
                _ => false,
            }
    }

    /// Sorts annotations and groups them by author, then by title.
    pub fn group_annotations(mut annotations: Vec<Annotation>) -> Authors {
        annotations.sort_by_cached_key(Annotation::sort_key);
        let mut authors = Authors::new();
        for annotation in annotations {
            let author = authors
                .entry(annotation.author.clone())
                .or_insert_with(|| Author::new(annotation.author.clone()));
            let book = author
                .books
                .entry(annotation.title.clone())
                .or_insert_with(|| {
                    let mut book = Book::new(annotation.title.clone(), annotation.author.clone());
                    book.series = annotation.series.clone();
                    book
                });
            book.annotations.push(annotation);
        }
        for author in authors.values_mut() {
            for book in author.books.values_mut() {
                book.collapse_duplicates();
                book.refresh_created();
            }
            author.refresh_created();
        }
        authors
    }

}

pub mod storage {
    use crate::outline::OutlineDocument;
    use anyhow::{Context, Result};
    use std::{fs, path::Path};

    /// Source of the heading tree the outline reader works on.
    pub trait OutlineParser {
        fn parse_str(&self, input: &str) -> Result<OutlineDocument>;

        fn parse_file(&self, path: &Path) -> Result<OutlineDocument> {
            let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            self.parse_str(&text)
                .with_context(|| format!("parsing {:?}", path))
        }
    }
}

pub mod outline {
    //! Minimal Org reader built on `nom`, producing the heading tree the importer needs.
    //!
    //! - The scan is line-oriented and stack-builds the tree by star count.
    //! - Headlines (TODO keyword, text, tags), planning lines, property drawers and
    //!   timestamps are parsed with `nom` combinators.
    //! - Every other line under a headline is kept verbatim as body text.

    use crate::core::{OrgTime, OrgTimestamp, PlanningKind, Todo};
    use crate::storage::OutlineParser;
    use anyhow::{Result, anyhow};
    use chrono::{NaiveDate, NaiveTime};
    use indexmap::IndexMap;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while_m_n, take_while1},
        character::complete::{char, line_ending, not_line_ending, space0, space1},
        combinator::{map, map_opt, map_res, opt, recognize, value, verify},
        error::{VerboseError, VerboseErrorKind},
        multi::many1,
        sequence::{preceded, terminated, tuple},
    };
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeSet;

    /// Parsed document: free text before the first heading plus the heading forest.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct OutlineDocument {
        pub preamble: String,
        pub nodes: Vec<OutlineNode>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct OutlineNode {
        pub level: usize,
        /// Headline text without keyword and tags.
        pub heading: String,
        /// Only keywords from `Todo::KEYWORDS` are split off the headline.
        pub todo: Option<String>,
        #[serde(default)]
        pub tags: BTreeSet<String>,
        #[serde(default)]
        pub planning: Vec<OrgTime>,
        /// Property drawer in source order, keys as written.
        #[serde(default)]
        pub properties: IndexMap<String, String>,
        pub body: String,
        #[serde(default)]
        pub children: Vec<OutlineNode>,
    }

    /* ------------------------ Public entry points ------------------------ */

    pub fn parse_outline_from_str(input: &str) -> Result<OutlineDocument> {
        let mut doc = OutlineDocument::default();
        let mut preamble: Vec<&str> = Vec::new();
        let mut stack: Vec<OutlineNode> = Vec::new();
        let mut rest = input;

        while !rest.is_empty() {
            if is_heading_line(rest) {
                let (r, node) = parse_headline(rest).map_err(to_anyhow("headline"))?;
                rest = r;
                while stack.last().is_some_and(|top| top.level >= node.level) {
                    close_node(&mut stack, &mut doc.nodes);
                }
                stack.push(node);
                continue;
            }

            let Some(node) = stack.last_mut() else {
                let (r, line) = till_eol(rest).map_err(to_anyhow("preamble"))?;
                preamble.push(line);
                rest = r;
                continue;
            };

            // Planning and the property drawer are only recognized before any body text.
            if node.body.trim().is_empty() {
                if let Ok((r, times)) = parse_planning_line(rest) {
                    node.planning.extend(times);
                    rest = r;
                    continue;
                }
                if let Ok((r, props)) = parse_properties_drawer(rest) {
                    node.properties.extend(props);
                    rest = r;
                    continue;
                }
            }

            let (r, line) = till_eol(rest).map_err(to_anyhow("section"))?;
            node.body.push_str(line);
            node.body.push('\n');
            rest = r;
        }

        while !stack.is_empty() {
            close_node(&mut stack, &mut doc.nodes);
        }
        doc.preamble = preamble.join("\n").trim().to_string();
        Ok(doc)
    }

    /// Concrete parser implementing the `storage::OutlineParser` trait.
    pub struct NomOutlineParser;

    impl OutlineParser for NomOutlineParser {
        fn parse_str(&self, input: &str) -> Result<OutlineDocument> {
            parse_outline_from_str(input)
        }
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn to_anyhow(label: &'static str) -> impl Fn(nom::Err<VerboseError<&str>>) -> anyhow::Error {
        move |e| match e {
            nom::Err::Error(ve) | nom::Err::Failure(ve) => anyhow!(pretty_verbose_error(label, ve)),
            nom::Err::Incomplete(_) => anyhow!("incomplete input while parsing {}", label),
        }
    }

    fn pretty_verbose_error(label: &str, ve: VerboseError<&str>) -> String {
        use std::fmt::Write;
        let mut s = String::new();
        let _ = writeln!(s, "outline parse error in {}:", label);
        for (frag, kind) in ve.errors {
            let line = frag.lines().next().unwrap_or(frag);
            let _ = writeln!(s, "  at: {:?}  {:?}", line, kind);
        }
        s
    }

    /* ------------------------------- Utils ------------------------------- */

    fn close_node(stack: &mut Vec<OutlineNode>, roots: &mut Vec<OutlineNode>) {
        if let Some(mut node) = stack.pop() {
            node.body = node.body.trim().to_string();
            match stack.last_mut() {
                Some(parent) => parent.children.push(node),
                None => roots.push(node),
            }
        }
    }

    fn is_heading_line(s: &str) -> bool {
        let stars = s.chars().take_while(|c| *c == '*').count();
        stars > 0 && s[stars..].starts_with(' ')
    }

    fn till_eol(i: &str) -> PResult<'_, &str> {
        terminated(not_line_ending, opt(line_ending_ve))(i)
    }

    fn line_ending_ve(i: &str) -> PResult<'_, &str> {
        line_ending::<_, VerboseError<&str>>(i)
    }

    fn is_tag_char(c: char) -> bool {
        c.is_alphanumeric() || c == '_' || c == '-' || c == '@' || c == '+' || c == '#' || c == '%'
    }

    /* ------------------------------ Headlines ------------------------------ */

    fn parse_headline(i: &str) -> PResult<'_, OutlineNode> {
        let (i, stars) = recognize(many1(char('*')))(i)?;
        let (i, _) = space1(i)?;
        let (i, todo) = opt(terminated(todo_keyword, space1))(i)?;
        let (i, text) = till_eol(i)?;
        let (heading, tags) = split_tags(text.trim_end());
        Ok((
            i,
            OutlineNode {
                level: stars.len(),
                heading: heading.to_string(),
                todo: todo.map(str::to_string),
                tags,
                ..OutlineNode::default()
            },
        ))
    }

    fn todo_keyword(i: &str) -> PResult<'_, &str> {
        verify(take_while1(|c: char| c.is_ascii_uppercase()), |word: &str| {
            Todo::from_keyword(word).is_some()
        })(i)
    }

    /// Splits a trailing `:tag1:tag2:` group off the headline text.
    fn split_tags(text: &str) -> (&str, BTreeSet<String>) {
        let mut tags = BTreeSet::new();
        if let Some(pos) = text.rfind(" :") {
            let trail = text[pos + 1..].trim();
            if trail.len() > 1 && trail.starts_with(':') && trail.ends_with(':') {
                let names: Vec<&str> = trail.trim_matches(':').split(':').collect();
                if names.iter().all(|t| !t.is_empty() && t.chars().all(is_tag_char)) {
                    tags.extend(names.into_iter().map(str::to_string));
                    return (text[..pos].trim_end(), tags);
                }
            }
        }
        (text, tags)
    }

    /* --------------------------- Planning & Drawers --------------------------- */

    fn parse_planning_line(i: &str) -> PResult<'_, Vec<OrgTime>> {
        // e.g.: SCHEDULED: <2025-11-15 Sat> CLOSED: [2025-11-15 Sat 14:10]
        let (rest_after_line, line) = till_eol(i)?;
        let mut rest = line;
        let mut times = Vec::new();
        while !rest.trim().is_empty() {
            match planning_entry(rest) {
                Ok((r, time)) => {
                    times.push(time);
                    rest = r;
                }
                Err(_) => {
                    return Err(nom::Err::Error(VerboseError {
                        errors: vec![(i, VerboseErrorKind::Context("planning"))],
                    }));
                }
            }
        }
        if times.is_empty() {
            return Err(nom::Err::Error(VerboseError {
                errors: vec![(i, VerboseErrorKind::Context("planning-empty"))],
            }));
        }
        Ok((rest_after_line, times))
    }

    fn planning_entry(i: &str) -> PResult<'_, OrgTime> {
        let (i, _) = space0(i)?;
        let (i, kind) = alt((
            value(PlanningKind::Scheduled, tag("SCHEDULED:")),
            value(PlanningKind::Deadline, tag("DEADLINE:")),
            value(PlanningKind::Closed, tag("CLOSED:")),
        ))(i)?;
        let (i, _) = space0(i)?;
        let (i, timestamp) = parse_timestamp(i)?;
        Ok((i, OrgTime { kind, timestamp }))
    }

    fn parse_properties_drawer(i: &str) -> PResult<'_, IndexMap<String, String>> {
        // :PROPERTIES:\n :KEY: value\n ... \n:END:
        let (i, _) = tuple((space0, tag(":PROPERTIES:"), space0, line_ending_ve))(i)?;
        let mut props = IndexMap::new();
        let mut rest = i;
        loop {
            if let Ok((r, _)) = tuple((space0, tag(":END:"), space0, opt(line_ending_ve)))(rest) {
                return Ok((r, props));
            }
            let (r, (key, val)) = parse_property_line(rest)?;
            props.insert(key.to_string(), val.trim().to_string());
            rest = r;
        }
    }

    fn parse_property_line(i: &str) -> PResult<'_, (&str, &str)> {
        //  :KEY: value
        map(
            tuple((
                space0,
                char(':'),
                take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
                char(':'),
                space0,
                not_line_ending,
                opt(line_ending_ve),
            )),
            |(_, _, key, _, _, val, _)| (key, val),
        )(i)
    }

    /* ----------------------------- Timestamps ----------------------------- */

    fn parse_timestamp(i: &str) -> PResult<'_, OrgTimestamp> {
        // <YYYY-MM-DD Day [HH:MM]> or [YYYY-MM-DD Day [HH:MM]]; the day name is ignored.
        let (i, open) = alt((char('<'), char('[')))(i)?;
        let (i, date) = parse_date(i)?;
        let (i, _) = opt(preceded(space1, take_while1(|c: char| c.is_alphabetic())))(i)?;
        let (i, time) = opt(preceded(space1, parse_time))(i)?;
        let (i, _) = preceded(space0, char(if open == '<' { '>' } else { ']' }))(i)?;
        Ok((
            i,
            OrgTimestamp {
                active: open == '<',
                date,
                time,
            },
        ))
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_opt(
            tuple((digits(4, 4), char('-'), digits(2, 2), char('-'), digits(2, 2))),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(i32::try_from(y).ok()?, m, d),
        )(i)
    }

    fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_opt(
            tuple((digits(1, 2), char(':'), digits(2, 2))),
            |(h, _, m)| NaiveTime::from_hms_opt(h, m, 0),
        )(i)
    }

    fn digits<'a>(min: usize, max: usize) -> impl FnMut(&'a str) -> PResult<'a, u32> {
        map_res(
            take_while_m_n(min, max, |c: char| c.is_ascii_digit()),
            |s: &str| s.parse::<u32>(),
        )
    }

}

pub mod reader {
    //! Reads authors, books and annotations back out of an outline tree.
    //!
    //! Top-level headings are authors, their children books, and theirs annotations.
    //! Properties with a typed field are lifted out of the drawer; the rest are kept
    //! with lowercase keys.

    use crate::core::*;
    use crate::model::*;
    use crate::outline::{NomOutlineParser, OutlineDocument, OutlineNode};
    use crate::storage::OutlineParser;
    use anyhow::Result;
    use indexmap::IndexMap;
    use nom::{
        IResult,
        branch::alt,
        character::complete::{anychar, char, digit0, space1},
        combinator::{eof, recognize},
        error::VerboseError,
        sequence::{delimited, terminated, tuple},
    };
    use std::collections::btree_map::Entry;
    use tracing::warn;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Parse an outline document into a library.
    pub fn parse_org(input: &str) -> Result<Library> {
        parse_org_with(&NomOutlineParser, input)
    }

    pub fn parse_org_with<P: OutlineParser + ?Sized>(parser: &P, input: &str) -> Result<Library> {
        let doc = parser.parse_str(input)?;
        Ok(library_from_outline(&doc)?)
    }

    /// Duplicate authors or book titles are merged rather than overwritten.
    pub fn library_from_outline(doc: &OutlineDocument) -> Result<Library, DomainError> {
        let mut authors = Authors::new();
        for node in &doc.nodes {
            let author = author_from_node(node)?;
            match authors.entry(author.name.clone()) {
                Entry::Occupied(mut slot) => slot.get_mut().merge(author),
                Entry::Vacant(slot) => {
                    slot.insert(author);
                }
            }
        }
        Ok(Library {
            preamble: Some(doc.preamble.clone()).filter(|p| !p.is_empty()),
            authors,
        })
    }

    /// Splits a node's headline into status and display text.
    ///
    /// A TODO keyword wins over a leading `[c]` checkbox; a `[n/m]` cookie and
    /// anything after it are dropped.
    pub fn parse_heading(node: &OutlineNode) -> Result<(Todo, String), DomainError> {
        let mut text = node.heading.trim();
        let status = match node.todo.as_deref() {
            Some(word) => {
                Todo::from_keyword(word).ok_or_else(|| DomainError::UnknownStatus(word.to_string()))?
            }
            None => match checkbox(text) {
                Ok((rest, mark)) => {
                    text = rest.trim_start();
                    Todo::from_checkbox(mark)?
                }
                Err(_) => Todo::None,
            },
        };
        Ok((status, strip_progress(text).to_string()))
    }

    fn checkbox(i: &str) -> PResult<'_, char> {
        terminated(delimited(char('['), anychar, char(']')), alt((space1, eof)))(i)
    }

    fn progress_cookie(i: &str) -> PResult<'_, &str> {
        recognize(tuple((char('['), digit0, char('/'), digit0, char(']'))))(i)
    }

    fn strip_progress(text: &str) -> &str {
        let mut offset = 0;
        while let Some(pos) = text[offset..].find('[') {
            let start = offset + pos;
            if progress_cookie(&text[start..]).is_ok() {
                return text[..start].trim_end();
            }
            offset = start + 1;
        }
        text
    }

    /* ------------------------------ Entities ------------------------------ */

    /// Status and display text of an author or book headline. A name stored in the
    /// drawer wins over the headline, which may have been read as keyword, checkbox
    /// or cookie.
    fn entity_heading(node: &OutlineNode, stored: Option<String>) -> Result<(Todo, String), DomainError> {
        let Some(name) = stored else {
            return parse_heading(node);
        };
        let raw = match node.todo.as_deref() {
            Some(word) => format!("{word} {}", node.heading.trim()),
            None => node.heading.trim().to_string(),
        };
        if strip_progress(&raw) == name {
            return Ok((Todo::None, name));
        }
        let (status, _) = parse_heading(node)?;
        Ok((status, name))
    }

    fn author_from_node(node: &OutlineNode) -> Result<Author, DomainError> {
        let mut props = lowercase_properties(node);
        let (status, name) = entity_heading(node, take(&mut props, "author"))?;
        props.shift_remove("creation_date");

        let mut author = Author::new(name);
        author.meta = meta_from_node(node, status, props);
        for child in &node.children {
            let book = book_from_node(child, &author.name)?;
            match author.books.entry(book.title.clone()) {
                Entry::Occupied(mut slot) => slot.get_mut().merge(book),
                Entry::Vacant(slot) => {
                    slot.insert(book);
                }
            }
        }
        author.refresh_created();
        Ok(author)
    }

    fn book_from_node(node: &OutlineNode, author_name: &str) -> Result<Book, DomainError> {
        let mut props = lowercase_properties(node);
        let (status, title) = entity_heading(node, take(&mut props, "title"))?;
        let author = take(&mut props, "author").unwrap_or_else(|| author_name.to_string());
        let series = take(&mut props, "series");
        props.shift_remove("creation_date");

        let mut book = Book::new(title, author);
        book.series = series;
        book.meta = meta_from_node(node, status, props);
        for child in &node.children {
            let annotation = annotation_from_node(child, &book)?;
            book.annotations.push(annotation);
        }
        book.collapse_duplicates();
        book.sort_annotations();
        book.refresh_created();
        Ok(book)
    }

    fn annotation_from_node(node: &OutlineNode, book: &Book) -> Result<Annotation, DomainError> {
        let (status, heading) = parse_heading(node)?;
        let kind = AnnotationKind::from_name(&heading)?;
        let mut props = lowercase_properties(node);

        let title = take(&mut props, "title").unwrap_or_else(|| book.title.clone());
        let author = take(&mut props, "author").unwrap_or_else(|| book.author.clone());
        let mut annotation = Annotation::new(kind, title, author);
        annotation.series = take(&mut props, "series");
        annotation.page = take(&mut props, "page").and_then(|raw| PageRange::parse(&raw));
        annotation.location = take(&mut props, "location").and_then(|raw| LocationRange::parse(&raw));
        annotation.selection = take(&mut props, "highlight");
        annotation.note = take(&mut props, "note");
        let created = take_created(&mut props);
        annotation.meta = meta_from_node(node, status, props);
        annotation.meta.created = created;

        if !node.children.is_empty() {
            warn!(
                count = node.children.len(),
                title = %annotation.title,
                "dropping headings nested under an annotation"
            );
        }
        Ok(annotation)
    }

    fn lowercase_properties(node: &OutlineNode) -> IndexMap<String, String> {
        node.properties
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
            .collect()
    }

    fn take(props: &mut IndexMap<String, String>, key: &str) -> Option<String> {
        props.shift_remove(key).filter(|v| !v.is_empty())
    }

    fn take_created(props: &mut IndexMap<String, String>) -> Option<EmacsDateTime> {
        let raw = take(props, "creation_date")?;
        let parsed = EmacsDateTime::from_org(&raw);
        if parsed.is_none() {
            warn!(value = %raw, "unreadable creation date, leaving it unset");
        }
        parsed
    }

    fn meta_from_node(node: &OutlineNode, status: Todo, properties: IndexMap<String, String>) -> OrgMeta {
        OrgMeta {
            status,
            body: Some(node.body.clone()).filter(|b| !b.is_empty()),
            properties,
            created: None,
            important_times: node.planning.clone(),
            tags: node.tags.clone(),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::outline::parse_outline_from_str;

        fn heading_of(line: &str) -> Result<(Todo, String), DomainError> {
            let doc = parse_outline_from_str(line).expect("outline");
            parse_heading(&doc.nodes[0])
        }

        #[test]
        fn heading_status_and_cookie() {
            assert_eq!(
                heading_of("*** [ ] Note [/]"),
                Ok((Todo::Unchecked, "Note".into()))
            );
            assert_eq!(
                heading_of("*** [?] Highlight [1234/1234]"),
                Ok((Todo::CheckWaiting, "Highlight".into()))
            );
            assert_eq!(
                heading_of("*** TODO Note [/]"),
                Ok((Todo::Todo, "Note".into()))
            );
            assert_eq!(
                heading_of("*** DONE Note [1234/1234]"),
                Ok((Todo::Done, "Note".into()))
            );
            assert_eq!(
                heading_of("** [X] The Lord of the Rings [1/2]\nCLOSED: [2020-07-08 Wed 21:40]\n"),
                Ok((Todo::Checked, "The Lord of the Rings".into()))
            );
            assert_eq!(heading_of("* Plain"), Ok((Todo::None, "Plain".into())));
        }

        #[test]
        fn invalid_checkbox_is_an_error() {
            assert_eq!(
                heading_of("*** [Y] Note"),
                Err(DomainError::InvalidCheckbox('Y'))
            );
        }

        #[test]
        fn reads_typed_fields_and_keeps_extras() {
            let input = "* J. R. R. Tolkien [1/2]
:PROPERTIES:
:CREATION_DATE: [2019-09-25 Wed 22:59]
:END:
** [X] The Lord of the Rings [1/2]
:PROPERTIES:
:AUTHOR: J. R. R. Tolkien
:ID: 553394003499142966
:END:
*** DONE Note
:PROPERTIES:
:CREATION_DATE: [2019-09-25 Wed 22:59]
:HIGHLIGHT: dwimmerlaik,
:LOCATION: 16415-16415
:NOTE: Translate
:TITLE: The Lord of the Rings
:END:
Look this up.
*** [ ] Bookmark
:PROPERTIES:
:CREATION_DATE: yesterday-ish
:PAGE: xii
:END:
";
            let library = parse_org(input).expect("parse");
            let author = &library.authors["J. R. R. Tolkien"];
            let book = &author.books["The Lord of the Rings"];
            assert_eq!(book.meta.status, Todo::Checked);
            assert_eq!(book.meta.properties.get("id").map(String::as_str), Some("553394003499142966"));
            assert!(!book.meta.properties.contains_key("author"));
            assert_eq!(book.progress(), Progress { done: 1, total: 2 });

            let note = book
                .annotations
                .iter()
                .find(|a| a.kind == AnnotationKind::Note)
                .expect("note");
            assert_eq!(note.meta.status, Todo::Done);
            assert_eq!(note.selection.as_deref(), Some("dwimmerlaik,"));
            assert_eq!(note.note.as_deref(), Some("Translate"));
            assert_eq!(note.location, Some(Range::new(16415, Some(16415))));
            assert_eq!(note.author, "J. R. R. Tolkien");
            assert_eq!(note.meta.body.as_deref(), Some("Look this up."));
            assert!(note.meta.properties.is_empty());

            let bookmark = book
                .annotations
                .iter()
                .find(|a| a.kind == AnnotationKind::Bookmark)
                .expect("bookmark");
            assert_eq!(bookmark.created(), None);
            assert_eq!(bookmark.title, "The Lord of the Rings");
            assert_eq!(bookmark.page, Some(Range::new(PageValue::Text("xii".into()), None)));

            assert_eq!(book.meta.created, note.created());
            assert_eq!(author.meta.created, note.created());
        }

        #[test]
        fn unknown_annotation_heading_is_an_error() {
            let input = "* A\n** B\n*** Scribble\n";
            let err = parse_org(input).expect_err("unknown kind");
            assert!(err.to_string().contains("Scribble"), "{err}");
        }

        #[test]
        fn duplicate_books_are_merged() {
            let input = "* A
** B
*** [ ] Bookmark
:PROPERTIES:
:LOCATION: 1
:END:
** B
*** DONE Bookmark
:PROPERTIES:
:LOCATION: 1
:END:
";
            let library = parse_org(input).expect("parse");
            let book = &library.authors["A"].books["B"];
            assert_eq!(book.annotations.len(), 1);
            assert_eq!(book.annotations[0].meta.status, Todo::Done);
        }

        #[test]
        fn repeated_annotation_under_one_book_is_folded() {
            let input = "* A
** B
*** [ ] Highlight
:PROPERTIES:
:LOCATION: 5-6
:HIGHLIGHT: words
:END:
*** WAIT Highlight
:PROPERTIES:
:LOCATION: 5-6
:END:
Check the context.
";
            let library = parse_org(input).expect("parse");
            let book = &library.authors["A"].books["B"];
            assert_eq!(book.annotations.len(), 1);
            assert_eq!(book.annotations[0].meta.status, Todo::Waiting);
            assert_eq!(book.annotations[0].selection.as_deref(), Some("words"));
            assert_eq!(book.annotations[0].meta.body.as_deref(), Some("Check the context."));
        }

        #[test]
        fn empty_input_has_no_authors() {
            let library = parse_org("").expect("parse");
            assert!(library.is_empty());
            assert_eq!(library.preamble, None);
        }
    }
}

pub mod format {
    //! Renders a library back to Org text. Entries are emitted in sort order, so the
    //! output depends only on the data.

    use crate::core::*;
    use crate::model::*;
    use std::collections::BTreeMap;

    pub fn format_library(library: &Library) -> String {
        let mut out = String::new();
        if let Some(preamble) = library.preamble.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            out.push_str(preamble);
            out.push('\n');
        }
        for author in library.authors.values() {
            render_author(&mut out, author);
        }
        out
    }

    pub fn format_author(author: &Author) -> String {
        let mut out = String::new();
        render_author(&mut out, author);
        out
    }

    pub fn format_book(book: &Book) -> String {
        let mut out = String::new();
        render_book(&mut out, book);
        out
    }

    pub fn format_annotation(annotation: &Annotation) -> String {
        let mut out = String::new();
        render_entry(&mut out, annotation);
        out
    }

    fn render_author(out: &mut String, author: &Author) {
        render_entry(out, author);
        for book in author.books.values() {
            render_book(out, book);
        }
    }

    fn render_book(out: &mut String, book: &Book) {
        render_entry(out, book);
        let mut ordered: Vec<&Annotation> = book.annotations.iter().collect();
        ordered.sort_by_cached_key(|a| a.sort_key());
        for annotation in ordered {
            render_entry(out, annotation);
        }
    }

    fn render_entry<E: OrgEntity>(out: &mut String, entity: &E) {
        let meta = entity.meta();
        out.push_str(&render_headline(entity));
        if !meta.important_times.is_empty() {
            out.push_str(&render_planning(&meta.important_times));
        }
        out.push_str(&render_properties(entity));
        if let Some(body) = meta.body.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
            out.push_str(body);
            out.push('\n');
        }
    }

    fn render_headline<E: OrgEntity>(entity: &E) -> String {
        let meta = entity.meta();
        let mut buf = "*".repeat(entity.depth());
        if meta.status != Todo::None {
            buf.push(' ');
            buf.push_str(meta.status.token());
        }
        buf.push(' ');
        buf.push_str(entity.heading());
        if let Some(progress) = entity.progress() {
            buf.push(' ');
            buf.push_str(&progress.to_string());
        }
        if !meta.tags.is_empty() {
            buf.push_str(" :");
            for tag in &meta.tags {
                buf.push_str(tag);
                buf.push(':');
            }
        }
        buf.push('\n');
        buf
    }

    fn render_planning(times: &[OrgTime]) -> String {
        let mut line = times
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        line.push('\n');
        line
    }

    /// Keys are uppercased and sorted; empty values are left out.
    fn render_properties<E: OrgEntity>(entity: &E) -> String {
        let mut props: BTreeMap<String, String> = entity
            .meta()
            .properties
            .iter()
            .map(|(k, v)| (k.to_uppercase(), v.trim().to_string()))
            .collect();
        for (key, value) in entity.typed_properties() {
            if let Some(value) = value {
                props.insert(key.to_uppercase(), value.trim().to_string());
            }
        }

        let mut buf = String::from(":PROPERTIES:\n");
        for (key, value) in props.iter().filter(|(_, v)| !v.is_empty()) {
            buf.push(':');
            buf.push_str(key);
            buf.push_str(": ");
            buf.push_str(value);
            buf.push('\n');
        }
        buf.push_str(":END:\n");
        buf
    }

}

pub mod merge {
    //! Reconciles a stored library with a fresh import.
    //!
    //! Every `merge` keeps `self` as the stored side and consumes the incoming side.
    //! Statuses only move forward, differing bodies are concatenated, and extra
    //! properties take the incoming value.

    use crate::core::ContentDigest;
    use crate::model::*;
    use std::collections::{HashMap, HashSet, btree_map::Entry, hash_map};
    use tracing::debug;

    impl Book {
        /// Annotations are matched by identity. Incoming ones whose digest is already
        /// present are skipped, matched ones are overlaid, and new ones are added.
        pub fn merge(&mut self, other: Book) {
            let known: HashSet<ContentDigest> = self.annotations.iter().map(Annotation::digest).collect();
            let mut placed: HashMap<AnnotationIdentity, usize> = HashMap::new();
            let mut merged: Vec<Annotation> =
                Vec::with_capacity(self.annotations.len() + other.annotations.len());

            for annotation in std::mem::take(&mut self.annotations) {
                place(&mut merged, &mut placed, annotation);
            }
            let mut unchanged = 0usize;
            for annotation in other.annotations {
                if known.contains(&annotation.digest()) && placed.contains_key(&annotation.identity()) {
                    unchanged += 1;
                    continue;
                }
                place(&mut merged, &mut placed, annotation);
            }
            debug!(title = %self.title, unchanged, total = merged.len(), "merged book");

            self.annotations = merged;
            self.meta.merge(&other.meta);
            if self.series.is_none() {
                self.series = other.series;
            }
            self.sort_annotations();
            self.refresh_created();
        }

        /// Folds annotations sharing an identity into the first of them.
        pub fn collapse_duplicates(&mut self) {
            let before = self.annotations.len();
            let mut placed: HashMap<AnnotationIdentity, usize> = HashMap::new();
            let mut unique: Vec<Annotation> = Vec::with_capacity(before);
            for annotation in std::mem::take(&mut self.annotations) {
                place(&mut unique, &mut placed, annotation);
            }
            if unique.len() < before {
                debug!(title = %self.title, folded = before - unique.len(), "collapsed duplicate annotations");
            }
            self.annotations = unique;
        }
    }

    fn place(
        merged: &mut Vec<Annotation>,
        placed: &mut HashMap<AnnotationIdentity, usize>,
        annotation: Annotation,
    ) {
        match placed.entry(annotation.identity()) {
            hash_map::Entry::Occupied(slot) => overlay(&mut merged[*slot.get()], annotation),
            hash_map::Entry::Vacant(slot) => {
                slot.insert(merged.len());
                merged.push(annotation);
            }
        }
    }

    /// Position, kind and title stay as stored; text the stored copy lacks is absorbed.
    fn overlay(target: &mut Annotation, incoming: Annotation) {
        target.meta.merge(&incoming.meta);
        if target.note.is_none() && incoming.note.is_some() {
            target.note = incoming.note;
            if incoming.kind == AnnotationKind::Note {
                target.kind = AnnotationKind::Note;
            }
        }
        if target.selection.is_none() {
            target.selection = incoming.selection;
        }
        if target.series.is_none() {
            target.series = incoming.series;
        }
    }

    impl Author {
        /// Equal digests skip the per-book work; the author's own fields always merge.
        pub fn merge(&mut self, other: Author) {
            if self.digest() == other.digest() {
                debug!(author = %self.name, "author unchanged");
            } else {
                for (title, book) in other.books {
                    match self.books.entry(title) {
                        Entry::Occupied(mut slot) => slot.get_mut().merge(book),
                        Entry::Vacant(slot) => {
                            slot.insert(book);
                        }
                    }
                }
            }
            self.meta.merge(&other.meta);
            self.refresh_created();
        }
    }

    /// Names on one side only are kept as they are; shared names merge.
    pub fn merge_authors(mut left: Authors, right: Authors) -> Authors {
        for (name, author) in right {
            match left.entry(name) {
                Entry::Occupied(mut slot) => slot.get_mut().merge(author),
                Entry::Vacant(slot) => {
                    slot.insert(author);
                }
            }
        }
        left
    }

    /// `old` is the stored outline, `new` the fresh import. The order matters.
    pub fn merge_libraries(old: Library, new: Library) -> Library {
        Library {
            preamble: old.preamble.or(new.preamble),
            authors: merge_authors(old.authors, new.authors),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::clippings::parse_clippings;
        use crate::core::Todo;
        use crate::format::format_library;
        use crate::reader::parse_org;

        const EXPORT: &str = "The Lord of the Rings (J. R. R. Tolkien)
- Your Highlight on Location 16415-16415 | Added on Wednesday, September 25, 2019 10:59:56 PM

dwimmerlaik,
==========
The Lord of the Rings (J. R. R. Tolkien)
- Your Bookmark on Location 17000 | Added on Thursday, September 26, 2019 7:00:00 AM


==========
The Hobbit (J. R. R. Tolkien)
- Your Highlight on page 3 | Location 40-41 | Added on Friday, September 27, 2019 7:00:00 AM

In a hole in the ground
==========
Shogun (James Clavell)
- Your Highlight on page 121 | Location 1842-1842 | Added on Sunday, May 10, 2020 1:08:22 PM

gloaming
==========
";

        fn fresh() -> Library {
            parse_clippings(EXPORT).expect("clippings")
        }

        fn stored() -> Library {
            parse_org(&format_library(&fresh())).expect("outline")
        }

        #[test]
        fn merging_with_itself_changes_nothing() {
            let library = stored();
            let merged = merge_libraries(library.clone(), library.clone());
            assert_eq!(merged, library);

            // Different author digests still keep every book.
            let mut edited = library.clone();
            let tolkien = edited.authors.get_mut("J. R. R. Tolkien").expect("author");
            tolkien.meta.body = Some("Inklings".into());
            let merged = merge_libraries(library.clone(), edited.clone());
            assert_eq!(merged.book_count(), library.book_count());
            assert_eq!(
                merged.authors["J. R. R. Tolkien"].meta.body.as_deref(),
                Some("Inklings")
            );
        }

        #[test]
        fn user_edits_survive_reimport() {
            let mut old = stored();
            let book = old
                .authors
                .get_mut("J. R. R. Tolkien")
                .and_then(|a| a.books.get_mut("The Lord of the Rings"))
                .expect("book");
            let highlight = book
                .annotations
                .iter_mut()
                .find(|a| a.kind == AnnotationKind::Highlight)
                .expect("highlight");
            highlight.meta.status = Todo::Done;
            highlight.meta.body = Some("Rohirric for spectre.".into());
            highlight.meta.properties.insert("id".into(), "abc".into());
            book.meta.status = Todo::Project;

            let merged = merge_libraries(old, fresh());
            let book = &merged.authors["J. R. R. Tolkien"].books["The Lord of the Rings"];
            assert_eq!(book.annotations.len(), 2);
            assert_eq!(book.meta.status, Todo::Project);
            let highlight = book
                .annotations
                .iter()
                .find(|a| a.kind == AnnotationKind::Highlight)
                .expect("highlight");
            assert_eq!(highlight.meta.status, Todo::Done);
            assert_eq!(highlight.meta.body.as_deref(), Some("Rohirric for spectre."));
            assert_eq!(highlight.meta.properties.get("id").map(String::as_str), Some("abc"));
        }

        #[test]
        fn new_clippings_are_added_next_to_old_ones() {
            let old = stored();
            let newer = parse_clippings(
                "Shogun (James Clavell)
- Your Note on page 122 | Location 1850 | Added on Monday, May 11, 2020 9:00:00 AM

Anjin-san
==========
Tai-Pan (James Clavell)
- Your Bookmark on Location 10 | Added on Monday, May 11, 2020 9:00:00 AM

==========
",
            )
            .expect("clippings");

            let merged = merge_libraries(old, newer);
            let clavell = &merged.authors["James Clavell"];
            assert_eq!(clavell.books.len(), 2);
            assert_eq!(clavell.books["Shogun"].annotations.len(), 2);
            assert_eq!(merged.authors["J. R. R. Tolkien"].books.len(), 2);
        }

        #[test]
        fn duplicate_identities_collapse_into_one() {
            let mut book = Book::new("Shogun", "James Clavell");
            let mut first = Annotation::new(AnnotationKind::Highlight, "Shogun", "James Clavell");
            first.location = Some(Range::new(10, None));
            first.selection = Some("gloaming".into());
            let mut second = first.clone();
            second.meta.status = Todo::Done;
            second.meta.body = Some("seen".into());
            book.annotations.push(first);

            let mut incoming = Book::new("Shogun", "James Clavell");
            incoming.annotations = vec![second.clone(), second];
            book.merge(incoming);

            assert_eq!(book.annotations.len(), 1);
            assert_eq!(book.annotations[0].meta.status, Todo::Done);
            assert_eq!(book.annotations[0].meta.body.as_deref(), Some("seen"));
        }

        #[test]
        fn late_note_is_absorbed_by_stored_highlight() {
            let mut stored_highlight = Annotation::new(AnnotationKind::Highlight, "Dune", "Frank Herbert");
            stored_highlight.location = Some(Range::new(18, Some(20)));
            stored_highlight.selection = Some("fear".into());
            let mut incoming_note = stored_highlight.clone();
            incoming_note.kind = AnnotationKind::Note;
            incoming_note.note = Some("litany".into());

            let mut book = Book::new("Dune", "Frank Herbert");
            book.annotations.push(stored_highlight);
            let mut incoming = Book::new("Dune", "Frank Herbert");
            incoming.annotations.push(incoming_note);
            book.merge(incoming);

            assert_eq!(book.annotations.len(), 1);
            assert_eq!(book.annotations[0].kind, AnnotationKind::Note);
            assert_eq!(book.annotations[0].note.as_deref(), Some("litany"));
            assert_eq!(book.annotations[0].selection.as_deref(), Some("fear"));
        }

        #[test]
        fn untouched_outline_matches_fresh_import() {
            let (stored, fresh) = (stored(), fresh());
            for (name, author) in &fresh.authors {
                assert_eq!(stored.authors[name].digest(), author.digest(), "{name}");
            }
        }

        #[test]
        fn repeated_passage_stays_single_across_syncs() {
            let export = "Dune (Frank Herbert)
- Your Highlight on page 12 | Location 170-171 | Added on Monday, January 6, 2020 9:00:00 PM

I must not fear.
==========
Dune (Frank Herbert)
- Your Highlight on page 12 | Location 170-171 | Added on Monday, January 6, 2020 9:05:00 PM

I must not fear.
==========
";
            let first = merge_libraries(Library::default(), parse_clippings(export).expect("clippings"));
            assert_eq!(first.annotations().count(), 1);

            let stored = parse_org(&format_library(&first)).expect("outline");
            let second = merge_libraries(stored, parse_clippings(export).expect("clippings"));
            assert_eq!(second.annotations().count(), 1);
            assert_eq!(format_library(&second), format_library(&first));
        }

        #[test]
        fn keyword_titles_survive_reimport() {
            let export = "HOLD ME TIGHT (DONE Right)
- Your Bookmark on Location 10 | Added on Monday, January 6, 2020 9:00:00 PM

==========
";
            let fresh = parse_clippings(export).expect("clippings");
            let stored = parse_org(&format_library(&fresh)).expect("outline");
            let author = &stored.authors["DONE Right"];
            assert_eq!(author.meta.status, Todo::None);
            let book = &author.books["HOLD ME TIGHT"];
            assert_eq!(book.meta.status, Todo::None);

            let merged = merge_libraries(stored, fresh);
            assert_eq!(merged.authors.len(), 1);
            assert_eq!(
                merged.authors["DONE Right"].books.keys().collect::<Vec<_>>(),
                vec!["HOLD ME TIGHT"]
            );
        }

        #[test]
        fn status_set_on_keyword_title_is_read() {
            let input = "* Sue Johnson
:PROPERTIES:
:AUTHOR: Sue Johnson
:END:
** DONE HOLD ME TIGHT [0/0]
:PROPERTIES:
:TITLE: HOLD ME TIGHT
:END:
";
            let library = parse_org(input).expect("outline");
            let book = &library.authors["Sue Johnson"].books["HOLD ME TIGHT"];
            assert_eq!(book.meta.status, Todo::Done);
        }

        #[test]
        fn preamble_prefers_stored_copy() {
            let old = Library {
                preamble: Some("#+TITLE: Mine".into()),
                ..Library::default()
            };
            let new = Library {
                preamble: Some("#+TITLE: Theirs".into()),
                ..Library::default()
            };
            assert_eq!(merge_libraries(old, new).preamble.as_deref(), Some("#+TITLE: Mine"));
            assert!(merge_libraries(Library::default(), Library::default()).is_empty());
        }
    }
}

pub mod sync {
    //! End-to-end import: copy from the device, parse both sides, merge, write back.

    use crate::clippings::parse_clippings;
    use crate::format::format_library;
    use crate::merge::merge_libraries;
    use crate::model::{Annotation, AnnotationIdentity, Library};
    use crate::outline::NomOutlineParser;
    use crate::reader::parse_org_with;
    use crate::storage::OutlineParser;
    use anyhow::{Context, Result};
    use std::{
        collections::HashSet,
        fs,
        io::{self, Write},
        path::{Path, PathBuf},
    };
    use tracing::{debug, info};

    /// Paths for one import run.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SyncConfig {
        /// Clippings file on a mounted device, copied over `clippings` first.
        pub mounted: Option<PathBuf>,
        pub clippings: PathBuf,
        /// Outline to merge into; created when missing.
        pub output: PathBuf,
        /// Render without writing.
        pub dry_run: bool,
    }

    impl SyncConfig {
        pub fn new(clippings: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
            Self {
                mounted: None,
                clippings: clippings.into(),
                output: output.into(),
                dry_run: false,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SyncReport {
        pub authors: usize,
        pub books: usize,
        pub annotations: usize,
        /// Annotations not present in the stored outline.
        pub added: usize,
        pub rendered: String,
        pub written: bool,
    }

    pub fn run(config: &SyncConfig) -> Result<SyncReport> {
        run_with(config, &NomOutlineParser)
    }

    pub fn run_with<P: OutlineParser + ?Sized>(config: &SyncConfig, parser: &P) -> Result<SyncReport> {
        if let Some(mounted) = &config.mounted {
            fs::copy(mounted, &config.clippings)
                .with_context(|| format!("copying {:?} to {:?}", mounted, config.clippings))?;
            info!(from = %mounted.display(), to = %config.clippings.display(), "copied clippings from device");
        }

        let raw = fs::read_to_string(&config.clippings)
            .with_context(|| format!("reading {:?}", config.clippings))?;
        let fresh = parse_clippings(&raw).with_context(|| format!("parsing {:?}", config.clippings))?;
        debug!(annotations = fresh.annotations().count(), "parsed clippings");

        let stored = match read_existing(&config.output)? {
            Some(text) => parse_org_with(parser, &text)
                .with_context(|| format!("parsing {:?}", config.output))?,
            None => {
                info!(path = %config.output.display(), "no existing outline, starting fresh");
                Library::default()
            }
        };

        let before: HashSet<AnnotationIdentity> = stored.annotations().map(Annotation::identity).collect();
        let merged = merge_libraries(stored, fresh);
        let added = merged
            .annotations()
            .filter(|a| !before.contains(&a.identity()))
            .count();
        let rendered = format_library(&merged);

        if !config.dry_run {
            write_atomically(&config.output, &rendered)?;
        }

        Ok(SyncReport {
            authors: merged.authors.len(),
            books: merged.book_count(),
            annotations: merged.annotations().count(),
            added,
            rendered,
            written: !config.dry_run,
        })
    }

    fn read_existing(path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {:?}", path)),
        }
    }

    /// Writes through a temp file in the target directory and renames it into place.
    pub fn write_atomically(path: &Path, contents: &str) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut temp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("creating temp file in {:?}", dir))?;
        temp.write_all(contents.as_bytes())
            .with_context(|| format!("writing temp file for {:?}", path))?;
        if let Ok(existing) = fs::metadata(path) {
            fs::set_permissions(temp.path(), existing.permissions())
                .with_context(|| format!("copying permissions of {:?}", path))?;
        }
        temp.persist(path)
            .map_err(|e| e.error)
            .with_context(|| format!("writing {:?}", path))?;
        Ok(())
    }

}

pub use format::format_library;
pub use outline::{NomOutlineParser, parse_outline_from_str};
pub use reader::parse_org;
