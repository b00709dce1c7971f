//! Graph errors

/// Errors from ordering queries
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// The graph (or the queried part of it) is not acyclic
    #[error("dependency cycle detected among: {}", nodes.join(", "))]
    CycleDetected {
        /// Nodes that sit on a cycle
        nodes: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_nodes() {
        let err = GraphError::CycleDetected {
            nodes: vec!["A".into(), "B".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected among: A, B");
    }
}
