//! Heading-based section detection for unmarked documents
//!
//! Uses the CommonMark event stream rather than line prefixes, so `#` lines
//! inside code fences never start a section.

use crate::parser::front_matter;
use loom_artifact::{find_ids, type_from_id, ArtifactType};
use pulldown_cmark::{Event, Parser as MdParser, Tag, TagEnd};

/// Section introduced by a heading that names an artifact ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadingSection {
    /// Artifact ID taken from the heading text
    pub id: String,
    /// Type inferred from the ID prefix
    pub artifact_type: ArtifactType,
    /// Heading level (1-6)
    pub level: u8,
    /// Heading text
    pub title: String,
    /// Heading line (1-based)
    pub start_line: usize,
    /// Last non-blank line of the section (1-based, inclusive)
    pub end_line: usize,
}

struct Heading {
    level: u8,
    line: usize,
    title: String,
}

/// Sections keyed by ID headings, in document order
///
/// A section runs from its heading to the line before the next heading of
/// the same or a higher level, or the next ID heading of any level, with
/// trailing blank lines left outside. Sections never overlap.
#[must_use]
pub fn heading_sections(content: &str) -> Vec<HeadingSection> {
    let lines: Vec<&str> = content.split('\n').collect();
    let body_start = front_matter(&lines).map_or(0, |f| f.body_start);
    let body_offset: usize = lines[..body_start].iter().map(|l| l.len() + 1).sum();
    let body = content.get(body_offset..).unwrap_or("");

    let headings = collect_headings(body, body_start);
    let mut sections = Vec::new();

    for (i, heading) in headings.iter().enumerate() {
        let Some((_, id)) = find_ids(&heading.title).next() else {
            continue;
        };
        let Some(artifact_type) = type_from_id(id) else {
            continue;
        };

        let next_line = headings[i + 1..]
            .iter()
            .find(|h| h.level <= heading.level || find_ids(&h.title).next().is_some())
            .map_or(lines.len() + 1, |h| h.line);

        let mut end_line = next_line - 1;
        while end_line > heading.line && lines[end_line - 1].trim().is_empty() {
            end_line -= 1;
        }

        sections.push(HeadingSection {
            id: id.to_string(),
            artifact_type,
            level: heading.level,
            title: heading.title.clone(),
            start_line: heading.line,
            end_line,
        });
    }
    sections
}

fn collect_headings(body: &str, line_offset: usize) -> Vec<Heading> {
    let mut headings = Vec::new();
    let mut current: Option<Heading> = None;

    for (event, range) in MdParser::new(body).into_offset_iter() {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                let line = line_offset + body[..range.start].matches('\n').count() + 1;
                current = Some(Heading {
                    level: level as u8,
                    line,
                    title: String::new(),
                });
            }
            Event::Text(text) | Event::Code(text) => {
                if let Some(heading) = current.as_mut() {
                    heading.title.push_str(&text);
                }
            }
            Event::End(TagEnd::Heading(_)) => {
                if let Some(heading) = current.take() {
                    headings.push(heading);
                }
            }
            _ => {}
        }
    }
    headings
}
