// ABOUTME: Dependency resolution for computed fields
// ABOUTME: Cycle detection, topological ordering, and reverse-dependency lookups

use crate::error::StateError;
use std::collections::{HashMap, HashSet, VecDeque};
use workflow_model::{OnError, StateSchema};

#[derive(Debug, Clone)]
pub struct ResolvedField {
    pub dependencies: Vec<String>,
    pub transform: String,
    pub on_error: OnError,
    pub fallback: serde_json::Value,
}

/// Dependency order, reverse index, and per-field transform metadata for a
/// schema's `computed` section. Built once when a `StateManager` is
/// constructed; computed fields with no dependency on another computed field
/// never enter the dependency graph at all, only the reverse index built from
/// their `from_paths`.
#[derive(Debug, Clone, Default)]
pub struct DependencyIndex {
    order: Vec<String>,
    fields: HashMap<String, ResolvedField>,
    reverse: HashMap<String, HashSet<String>>,
}

impl DependencyIndex {
    pub fn build(schema: &StateSchema) -> Result<Self, StateError> {
        if schema.computed.is_empty() {
            return Ok(Self::default());
        }

        let graph = build_graph(schema);
        detect_cycles(&graph)?;
        let order = topological_sort(&graph, schema)?;

        let mut fields = HashMap::new();
        for name in &order {
            let def = &schema.computed[name];
            fields.insert(
                name.clone(),
                ResolvedField {
                    dependencies: def.from_paths.clone(),
                    transform: def.transform.clone(),
                    on_error: def.on_error,
                    fallback: def.fallback.clone(),
                },
            );
        }

        let mut reverse: HashMap<String, HashSet<String>> = HashMap::new();
        for (name, field) in &fields {
            for dep in &field.dependencies {
                reverse.entry(dep.clone()).or_default().insert(name.clone());
            }
        }

        Ok(Self {
            order,
            fields,
            reverse,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&ResolvedField> {
        self.fields.get(name)
    }

    pub fn all_fields_in_order(&self) -> &[String] {
        &self.order
    }

    /// Computed fields that need recomputation after `changed_paths` were
    /// written, in dependency order, including transitive dependents through
    /// other computed fields.
    pub fn affected_fields(&self, changed_paths: &[String]) -> Vec<String> {
        let mut affected: HashSet<String> = HashSet::new();
        for path in changed_paths {
            if let Some(dependents) = self.reverse.get(path) {
                affected.extend(dependents.iter().cloned());
            }
        }

        let mut queue: VecDeque<String> = affected.iter().cloned().collect();
        while let Some(field) = queue.pop_front() {
            let computed_path = format!("computed.{field}");
            if let Some(dependents) = self.reverse.get(&computed_path) {
                for dep in dependents {
                    if affected.insert(dep.clone()) {
                        queue.push_back(dep.clone());
                    }
                }
            }
        }

        self.order
            .iter()
            .filter(|f| affected.contains(*f))
            .cloned()
            .collect()
    }
}

fn build_graph(schema: &StateSchema) -> HashMap<String, HashSet<String>> {
    let mut graph: HashMap<String, HashSet<String>> = HashMap::new();
    for (name, def) in &schema.computed {
        let entry = graph.entry(name.clone()).or_default();
        for path in &def.from_paths {
            if let Some(dep_field) = path.strip_prefix("computed.") {
                if schema.computed.contains_key(dep_field) {
                    entry.insert(dep_field.to_string());
                }
            }
        }
    }
    graph
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

fn detect_cycles(graph: &HashMap<String, HashSet<String>>) -> Result<(), StateError> {
    let mut colors: HashMap<String, Color> =
        graph.keys().map(|k| (k.clone(), Color::White)).collect();

    fn dfs(
        node: &str,
        graph: &HashMap<String, HashSet<String>>,
        colors: &mut HashMap<String, Color>,
        path: &mut Vec<String>,
    ) -> Result<(), StateError> {
        match colors.get(node).copied().unwrap_or(Color::White) {
            Color::Gray => {
                let cycle_start = path.iter().position(|n| n == node).unwrap_or(0);
                let mut cycle: Vec<String> = path[cycle_start..].to_vec();
                cycle.push(node.to_string());
                return Err(StateError::CircularDependency(cycle.join(" -> ")));
            }
            Color::Black => return Ok(()),
            Color::White => {}
        }

        colors.insert(node.to_string(), Color::Gray);
        path.push(node.to_string());

        if let Some(neighbors) = graph.get(node) {
            for neighbor in neighbors {
                dfs(neighbor, graph, colors, path)?;
            }
        }

        path.pop();
        colors.insert(node.to_string(), Color::Black);
        Ok(())
    }

    let nodes: Vec<String> = graph.keys().cloned().collect();
    for node in nodes {
        if colors.get(&node).copied() == Some(Color::White) {
            let mut path = Vec::new();
            dfs(&node, graph, &mut colors, &mut path)?;
        }
    }
    Ok(())
}

fn topological_sort(
    graph: &HashMap<String, HashSet<String>>,
    schema: &StateSchema,
) -> Result<Vec<String>, StateError> {
    let all_nodes: HashSet<String> = schema.computed.keys().cloned().collect();
    let mut in_degree: HashMap<String, usize> = HashMap::new();
    for node in &all_nodes {
        let deps = graph.get(node).map(HashSet::len).unwrap_or(0);
        in_degree.insert(node.clone(), deps);
    }

    let mut queue: VecDeque<String> = all_nodes
        .iter()
        .filter(|n| in_degree[*n] == 0)
        .cloned()
        .collect();
    let mut result = Vec::new();

    while let Some(node) = queue.pop_front() {
        result.push(node.clone());
        for (other_node, other_deps) in graph {
            if other_deps.contains(&node) {
                let degree = in_degree.get_mut(other_node).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(other_node.clone());
                }
            }
        }
    }

    if result.len() != all_nodes.len() {
        return Err(StateError::CircularDependency(
            "failed to resolve all dependencies".to_string(),
        ));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use workflow_model::ComputedFieldDefinition;

    fn schema_with(computed: Map<&str, Vec<&str>>) -> StateSchema {
        let mut schema = StateSchema::default();
        for (name, deps) in computed {
            schema.computed.insert(
                name.to_string(),
                ComputedFieldDefinition {
                    from_paths: deps.into_iter().map(str::to_string).collect(),
                    transform: "input".to_string(),
                    on_error: OnError::default(),
                    fallback: serde_json::Value::Null,
                },
            );
        }
        schema
    }

    #[test]
    fn detects_a_direct_cycle() {
        let schema = schema_with(Map::from([
            ("a", vec!["computed.b"]),
            ("b", vec!["computed.a"]),
        ]));
        let err = DependencyIndex::build(&schema).unwrap_err();
        assert!(matches!(err, StateError::CircularDependency(_)));
    }

    #[test]
    fn orders_fields_by_dependency() {
        let schema = schema_with(Map::from([
            ("double", vec!["inputs.counter"]),
            ("quadruple", vec!["computed.double"]),
        ]));
        let index = DependencyIndex::build(&schema).unwrap();
        let order = index.all_fields_in_order();
        let double_pos = order.iter().position(|f| f == "double").unwrap();
        let quad_pos = order.iter().position(|f| f == "quadruple").unwrap();
        assert!(double_pos < quad_pos);
    }

    #[test]
    fn affected_fields_include_transitive_dependents() {
        let schema = schema_with(Map::from([
            ("double", vec!["inputs.counter"]),
            ("quadruple", vec!["computed.double"]),
            ("unrelated", vec!["inputs.other"]),
        ]));
        let index = DependencyIndex::build(&schema).unwrap();
        let affected = index.affected_fields(&["inputs.counter".to_string()]);
        assert_eq!(affected, vec!["double".to_string(), "quadruple".to_string()]);
    }
}
