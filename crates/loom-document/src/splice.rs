//! Section splicing
//!
//! Replaces the body of one generated region while leaving the rest of the
//! document byte-for-byte intact, and carries human-authored manual regions
//! across a regeneration.

use crate::error::{DocumentError, DocumentResult};
use crate::markers::{begin_manual, is_marker_line, Marker, END_GENERATED, END_MANUAL};
use crate::parser::{Parser, ParserConfig, SectionKind};

/// Manual region captured from a section body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualRegion {
    /// Section name from the MANUAL marker
    pub name: String,
    /// Lines between the markers
    pub content: String,
}

/// Outcome of [`restore_manual`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualRestore {
    /// New body with manual regions in place
    pub content: String,
    /// Regions put back at a matching marker
    pub in_place: Vec<String>,
    /// Regions whose marker was missing, appended at the end
    pub appended: Vec<String>,
}

impl ManualRestore {
    /// Names of every region carried over
    #[must_use]
    pub fn kept(&self) -> Vec<String> {
        self.in_place.iter().chain(&self.appended).cloned().collect()
    }
}

fn quiet_parser() -> Parser {
    Parser::new(ParserConfig {
        strict: false,
        extract_references: false,
    })
}

/// Body of the generated region `id`, if present
#[must_use]
pub fn section_body(content: &str, id: &str) -> Option<String> {
    quiet_parser()
        .parse_content(content, "")
        .section(id)
        .map(|s| s.content.clone())
}

/// Replace the body of generated region `id` with `new_body`
///
/// Everything outside the region, including its marker lines, is kept as is.
/// An unclosed region gets its END marker back.
///
/// # Errors
/// [`DocumentError::SectionNotFound`] if no generated region has this ID.
pub fn replace_section(content: &str, id: &str, new_body: &str) -> DocumentResult<String> {
    let doc = quiet_parser().parse_content(content, "");
    let section = doc
        .section(id)
        .ok_or_else(|| DocumentError::SectionNotFound(id.to_string()))?;

    let lines: Vec<&str> = content.split('\n').collect();
    let begin_idx = section.start_line - 1;
    let last_idx = section.end_line - 1;
    let closed = last_idx > begin_idx
        && matches!(Marker::parse(lines[last_idx]), Some(Marker::End { kind }) if kind == "generated");

    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    out.extend_from_slice(&lines[..=begin_idx]);
    out.push(new_body);
    if closed {
        out.extend_from_slice(&lines[last_idx..]);
    } else {
        out.push(END_GENERATED);
        out.extend_from_slice(&lines[(last_idx + 1).min(lines.len())..]);
    }
    Ok(out.join("\n"))
}

/// Manual regions inside a section body, in order
#[must_use]
pub fn extract_manual(body: &str) -> Vec<ManualRegion> {
    quiet_parser()
        .parse_content(body, "")
        .sections
        .into_iter()
        .filter(|s| s.kind == SectionKind::Manual)
        .filter_map(|s| {
            Some(ManualRegion {
                name: s.id?,
                content: s.content,
            })
        })
        .collect()
}

/// Put `regions` back into a freshly generated body
///
/// A region whose MANUAL marker appears in `new_body` replaces whatever the
/// generator wrote under that marker; the rest are appended at the end.
#[must_use]
pub fn restore_manual(new_body: &str, regions: &[ManualRegion]) -> ManualRestore {
    let lines: Vec<&str> = new_body.split('\n').collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut in_place = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let region = match Marker::parse(lines[i]) {
            Some(Marker::Manual { section }) => regions
                .iter()
                .find(|r| r.name == section && !in_place.contains(&r.name)),
            _ => None,
        };
        let Some(region) = region else {
            out.push(lines[i].to_string());
            i += 1;
            continue;
        };

        out.push(lines[i].to_string());
        if !region.content.is_empty() {
            out.push(region.content.clone());
        }
        i += 1;
        while i < lines.len() && !is_marker_line(lines[i]) {
            i += 1;
        }
        if i < lines.len() && Marker::parse(lines[i]) == Some(Marker::End { kind: "manual".into() }) {
            i += 1;
        }
        out.push(END_MANUAL.to_string());
        in_place.push(region.name.clone());
    }

    let missing: Vec<&ManualRegion> = regions
        .iter()
        .filter(|r| !in_place.contains(&r.name))
        .collect();
    let mut appended = Vec::new();
    if !missing.is_empty() {
        let trailing_newline = out.last().is_some_and(String::is_empty);
        while out.last().is_some_and(|l| l.trim().is_empty()) {
            out.pop();
        }
        for region in missing {
            out.push(begin_manual(&region.name));
            if !region.content.is_empty() {
                out.push(region.content.clone());
            }
            out.push(END_MANUAL.to_string());
            appended.push(region.name.clone());
        }
        if trailing_newline {
            out.push(String::new());
        }
    }

    ManualRestore {
        content: out.join("\n"),
        in_place,
        appended,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::begin_generated;
    use loom_artifact::ArtifactType;
    use pretty_assertions::assert_eq;

    fn doc() -> String {
        [
            "# Stories",
            &begin_generated("US-ORD-001", ArtifactType::UserStory),
            "old body",
            &begin_manual("notes"),
            "human note",
            END_MANUAL,
            END_GENERATED,
            "tail",
        ]
        .join("\n")
    }

    #[test]
    fn replace_keeps_surroundings() {
        let out = replace_section(&doc(), "US-ORD-001", "new body").unwrap();
        let expected = [
            "# Stories",
            &begin_generated("US-ORD-001", ArtifactType::UserStory),
            "new body",
            END_GENERATED,
            "tail",
        ]
        .join("\n");
        assert_eq!(out, expected);
    }

    #[test]
    fn replace_missing_section_fails() {
        assert!(matches!(
            replace_section("nothing", "US-ORD-001", "x"),
            Err(DocumentError::SectionNotFound(_))
        ));
    }

    #[test]
    fn replace_closes_unclosed_section() {
        let content = format!("{}\nold", begin_generated("US-ORD-001", ArtifactType::UserStory));
        let out = replace_section(&content, "US-ORD-001", "new").unwrap();
        assert!(out.ends_with(&format!("new\n{END_GENERATED}")));
    }

    #[test]
    fn trailing_end_manual_does_not_close_generated() {
        let begin = begin_generated("US-ORD-001", ArtifactType::UserStory);
        let content = format!("{begin}\nold\n{}\nmine\n{END_MANUAL}", begin_manual("notes"));
        let out = replace_section(&content, "US-ORD-001", "new").unwrap();
        assert_eq!(out, format!("{begin}\nnew\n{END_GENERATED}"));
        assert_eq!(section_body(&out, "US-ORD-001").as_deref(), Some("new"));
    }

    #[test]
    fn manual_regions_round_trip() {
        let body = section_body(&doc(), "US-ORD-001").unwrap();
        let regions = extract_manual(&body);
        assert_eq!(
            regions,
            vec![ManualRegion {
                name: "notes".into(),
                content: "human note".into()
            }]
        );

        let regenerated = format!("fresh\n{}\nplaceholder\n{END_MANUAL}\nend", begin_manual("notes"));
        let restored = restore_manual(&regenerated, &regions);
        assert_eq!(
            restored.content,
            format!("fresh\n{}\nhuman note\n{END_MANUAL}\nend", begin_manual("notes"))
        );
        assert_eq!(restored.in_place, vec!["notes"]);
        assert!(restored.appended.is_empty());
    }

    #[test]
    fn missing_marker_appends_region() {
        let regions = vec![ManualRegion {
            name: "notes".into(),
            content: "keep me".into(),
        }];
        let restored = restore_manual("fresh\n", &regions);
        assert_eq!(
            restored.content,
            format!("fresh\n{}\nkeep me\n{END_MANUAL}\n", begin_manual("notes"))
        );
        assert_eq!(restored.kept(), vec!["notes"]);
    }
}
