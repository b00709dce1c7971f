//! Layer detection from document paths

use loom_artifact::Layer;
use std::path::Path;

/// File-name prefixes that identify a layer when the path has no `lN` segment
const NAME_HINTS: &[(Layer, &[&str])] = &[
    (Layer::L0, &["user-stor", "nfr"]),
    (
        Layer::L1,
        &["acceptance", "business-rule", "domain-model", "bounded-context"],
    ),
    (
        Layer::L2,
        &["tech-spec", "interface-contract", "aggregate", "sequence"],
    ),
    (Layer::L3, &["test-case", "openapi", "skeleton", "ticket"]),
];

/// Layer a document belongs to, judged by its path
///
/// A directory named `l0`..`l3` (or starting with `l0-`..`l3-`) wins; then
/// well-known file-name prefixes; anything else is treated as `l1`.
#[must_use]
pub fn detect_layer(path: &Path) -> Layer {
    let dirs = path
        .parent()
        .into_iter()
        .flat_map(Path::components)
        .filter_map(|c| c.as_os_str().to_str())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>();

    for layer in Layer::ALL.into_iter().rev() {
        let name = layer.as_str();
        if dirs
            .iter()
            .any(|d| d == name || d.starts_with(&format!("{name}-")))
        {
            return layer;
        }
    }

    let base = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    NAME_HINTS
        .iter()
        .find(|(_, prefixes)| prefixes.iter().any(|p| base.starts_with(p)))
        .map_or(Layer::L1, |(layer, _)| *layer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_wins() {
        assert_eq!(detect_layer(Path::new("specs/l2/tech-specs.md")), Layer::L2);
        assert_eq!(detect_layer(Path::new("/p/l3-outputs/tests.md")), Layer::L3);
        assert_eq!(detect_layer(Path::new("l0/anything.md")), Layer::L0);
    }

    #[test]
    fn file_name_hints() {
        assert_eq!(detect_layer(Path::new("docs/user-stories.md")), Layer::L0);
        assert_eq!(detect_layer(Path::new("docs/test-cases.md")), Layer::L3);
    }

    #[test]
    fn defaults_to_l1() {
        assert_eq!(detect_layer(Path::new("notes.md")), Layer::L1);
    }
}
