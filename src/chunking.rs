//! Heading-aware chunking of Markdown documents into addressable sections.
//!
//! Every top-level block of a document belongs to exactly one section: the
//! section opened by the most recent heading, or a synthetic root section
//! when no heading precedes it. Section identifiers are derived from the
//! repository-relative path plus the slugged heading hierarchy, so
//! re-indexing unchanged content overwrites instead of duplicating.
//!
//! # Examples
//!
//! ```
//! use ask_the_code::chunking::chunk_markdown;
//!
//! let sections: Vec<_> =
//!     chunk_markdown("docs/guide.md", "# Setup\n\n## Install\n\nRun it.")
//!         .collect();
//!
//! assert_eq!(sections.len(), 2);
//! assert_eq!(sections[1].id, "docs/guide.md#setup-install");
//! assert_eq!(sections[1].text, "Run it.");
//! ```

use std::ops::Range;

use pulldown_cmark::{Event, OffsetIter, Options, Parser, Tag};

/// One indexable chunk of a Markdown document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Stable identifier: `path` or `path#slug-of-hierarchy`.
    pub id: String,
    /// Heading titles from outermost to innermost.
    pub hierarchy: Vec<String>,
    /// Body blocks belonging to this heading, separated by a blank line.
    pub text: String,
}

/// Normalize a heading title into its identifier fragment.
///
/// Leading `#` markers and surrounding whitespace are stripped, internal
/// whitespace runs become `-`, and the result is lowercased.
pub fn slug(title: &str) -> String {
    title
        .trim()
        .trim_start_matches('#')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}

/// Build the identifier of a section from its document path and hierarchy.
pub fn section_id(path: &str, hierarchy: &[String]) -> String {
    if hierarchy.is_empty() {
        return path.to_string();
    }

    let fragment = hierarchy
        .iter()
        .map(|title| slug(title))
        .collect::<Vec<_>>()
        .join("-");
    format!("{path}#{fragment}")
}

/// Accumulator folded over the block sequence of one document.
///
/// Holds the heading stack and the body of the currently open section.
/// Feeding it a heading finalizes the open section and returns it.
#[derive(Debug)]
pub struct Outline {
    path: String,
    hierarchy: Vec<String>,
    body: Vec<String>,
    // The root section only exists if it received content; heading
    // sections are emitted even when empty.
    in_heading: bool,
}

impl Outline {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            hierarchy: Vec::new(),
            body: Vec::new(),
            in_heading: false,
        }
    }

    /// Heading titles of the currently open section.
    pub fn hierarchy(&self) -> &[String] {
        &self.hierarchy
    }

    /// Open a section for a heading of the given level (1-based).
    ///
    /// The stack is truncated to `level - 1` entries before the title is
    /// pushed, closing the previous section and any deeper ancestors.
    pub fn heading(&mut self, level: usize, title: &str) -> Option<Section> {
        let finished = self.take_open();

        self.hierarchy.truncate(level.saturating_sub(1));
        self.hierarchy.push(title.trim().to_string());
        self.in_heading = true;

        finished
    }

    /// Append a rendered body block to the open section.
    pub fn body(&mut self, text: &str) {
        self.body.push(text.to_string());
    }

    /// Close the document, returning the final open section if any.
    pub fn finish(mut self) -> Option<Section> {
        self.take_open()
    }

    fn take_open(&mut self) -> Option<Section> {
        if !self.in_heading && self.body.is_empty() {
            return None;
        }

        let text = std::mem::take(&mut self.body).join("\n\n");
        Some(Section {
            id: section_id(&self.path, &self.hierarchy),
            hierarchy: self.hierarchy.clone(),
            text,
        })
    }
}

/// Lazily split a Markdown document into sections.
///
/// `path` is the repository-relative path used as the identifier prefix.
/// A document without any parseable block yields a single section carrying
/// the raw content.
pub fn chunk_markdown<'a>(path: &str, content: &'a str) -> MarkdownSections<'a> {
    let options = Options::ENABLE_TABLES
        | Options::ENABLE_STRIKETHROUGH
        | Options::ENABLE_TASKLISTS;

    MarkdownSections {
        path: path.to_string(),
        content,
        events: Parser::new_ext(content, options).into_offset_iter(),
        outline: Some(Outline::new(path)),
        depth: 0,
        heading: None,
        saw_block: false,
        cursor: 0,
    }
}

/// Source text with leading blank lines and trailing whitespace removed.
///
/// Indentation of the first non-blank line is kept.
fn block_text(source: &str) -> &str {
    let mut start = 0;
    for line in source.split_inclusive('\n') {
        if !line.trim().is_empty() {
            break;
        }
        start += line.len();
    }
    source[start..].trim_end()
}

/// Iterator returned by [`chunk_markdown`].
pub struct MarkdownSections<'a> {
    path: String,
    content: &'a str,
    events: OffsetIter<'a>,
    outline: Option<Outline>,
    depth: usize,
    heading: Option<(usize, String)>,
    saw_block: bool,
    // End of the last top-level block consumed. Text the parser reports no
    // block for (link reference definitions, indentation) is picked up from
    // the gap between this offset and the next block.
    cursor: usize,
}

impl<'a> MarkdownSections<'a> {
    /// Unconsumed source up to `end`, advancing the cursor past it.
    fn take_until(&mut self, end: usize) -> &'a str {
        let start = self.cursor.min(end);
        self.cursor = self.cursor.max(end);
        self.content.get(start..end).map(block_text).unwrap_or("")
    }

    fn step(&mut self, event: Event<'_>, range: Range<usize>) -> Option<Section> {
        if self.outline.is_none() {
            return None;
        }

        match event {
            Event::Start(tag) => {
                if self.depth == 0 {
                    self.saw_block = true;
                    if let Tag::Heading { level, .. } = tag {
                        let gap = self.take_until(range.start);
                        self.push_body(gap);
                        self.heading = Some((level as usize, String::new()));
                    }
                }
                self.depth += 1;
                None
            }
            Event::End(_) => {
                self.depth = self.depth.saturating_sub(1);
                if self.depth > 0 {
                    return None;
                }

                match self.heading.take() {
                    Some((level, title)) => {
                        self.cursor = self.cursor.max(range.end);
                        self.outline.as_mut()?.heading(level, &title)
                    }
                    None => {
                        let block = self.take_until(range.end);
                        self.push_body(block);
                        None
                    }
                }
            }
            Event::Text(text) | Event::Code(text) => {
                if let Some((_, title)) = self.heading.as_mut() {
                    title.push_str(&text);
                }
                None
            }
            Event::SoftBreak | Event::HardBreak => {
                if let Some((_, title)) = self.heading.as_mut() {
                    title.push(' ');
                }
                None
            }
            // Leaf blocks such as thematic breaks arrive without a Start.
            _ if self.depth == 0 => {
                self.saw_block = true;
                let block = self.take_until(range.end);
                self.push_body(block);
                None
            }
            _ => None,
        }
    }

    fn push_body(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(outline) = self.outline.as_mut() {
            outline.body(text);
        }
    }

    fn finish(&mut self) -> Option<Section> {
        if !self.saw_block {
            self.outline.take()?;
            return Some(Section {
                id: self.path.clone(),
                hierarchy: Vec::new(),
                text: self.content.to_string(),
            });
        }

        let tail = self.take_until(self.content.len());
        self.push_body(tail);
        self.outline.take()?.finish()
    }
}

impl Iterator for MarkdownSections<'_> {
    type Item = Section;

    fn next(&mut self) -> Option<Section> {
        while let Some((event, range)) = self.events.next() {
            if let Some(section) = self.step(event, range) {
                return Some(section);
            }
        }

        self.finish()
    }
}

impl std::fmt::Debug for MarkdownSections<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkdownSections")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
