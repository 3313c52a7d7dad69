// Typed roadmap trees, one per major topic, loaded once at startup
//
// Roadmap documents are nested JSON. Accepted shapes:
// - `{"name": "...", "children": [...]}` (also `title`/`label` and `subcategories`/`items`)
// - `{"<node name>": <children>, ...}`
// - `["leaf", {...}, ...]`
// - `"leaf"`

use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::errors::RoadmapError;
use crate::core::types::{normalize_label, LeafCategory, MajorTopic};

const NAME_KEYS: [&str; 3] = ["name", "title", "label"];
const CHILD_KEYS: [&str; 3] = ["children", "subcategories", "items"];

#[derive(Debug, Clone, PartialEq)]
pub struct RoadmapNode {
    pub name: String,
    pub children: Vec<RoadmapNode>,
}

impl RoadmapNode {
    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Immutable hierarchy of subtopics under one major topic
#[derive(Debug, Clone)]
pub struct RoadmapTree {
    topic: MajorTopic,
    roots: Vec<RoadmapNode>,
    leaves: Vec<LeafCategory>,
}

impl RoadmapTree {
    pub fn from_json(topic: MajorTopic, document: &Value) -> Result<Self, RoadmapError> {
        let roots = parse_nodes(document);
        let mut leaves = Vec::new();
        let mut path = Vec::new();
        for root in &roots {
            collect_leaves(root, &mut path, &mut leaves);
        }
        if leaves.is_empty() {
            return Err(RoadmapError::NoLeaves {
                topic: topic.label().to_string(),
            });
        }
        Ok(Self { topic, roots, leaves })
    }

    pub fn topic(&self) -> MajorTopic {
        self.topic
    }

    pub fn roots(&self) -> &[RoadmapNode] {
        &self.roots
    }

    /// Leaves in document order
    pub fn leaves(&self) -> &[LeafCategory] {
        &self.leaves
    }

    /// Resolve a candidate leaf name against this tree only.
    ///
    /// Tries an exact name match, then a whitespace/case-insensitive match, then
    /// the last segment of a `a > b > leaf` style path. Anything not in this
    /// tree resolves to `None`, even if it names a leaf of another topic.
    pub fn resolve(&self, candidate: &str) -> Option<LeafCategory> {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return None;
        }

        if let Some(leaf) = self.leaves.iter().find(|l| l.name == candidate) {
            return Some(leaf.clone());
        }

        let wanted = normalize_label(candidate);
        if let Some(leaf) = self.leaves.iter().find(|l| normalize_label(&l.name) == wanted) {
            return Some(leaf.clone());
        }

        let last = candidate.rsplit(['>', '/']).next().unwrap_or(candidate);
        if last.len() != candidate.len() {
            return self.resolve(last);
        }
        None
    }

    /// Indented outline used when asking the leaf model to choose
    pub fn outline(&self) -> String {
        let mut out = String::new();
        for root in &self.roots {
            write_outline(root, 0, &mut out);
        }
        out
    }
}

fn parse_nodes(value: &Value) -> Vec<RoadmapNode> {
    match value {
        Value::String(name) => leaf_node(name).into_iter().collect(),
        Value::Array(items) => items.iter().flat_map(parse_nodes).collect(),
        Value::Object(map) => {
            let explicit_name = NAME_KEYS
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str));
            match explicit_name {
                Some(name) => {
                    let children = CHILD_KEYS
                        .iter()
                        .find_map(|k| map.get(*k))
                        .map(parse_nodes)
                        .unwrap_or_default();
                    vec![RoadmapNode {
                        name: name.trim().to_string(),
                        children,
                    }]
                }
                None => map
                    .iter()
                    .filter(|(key, _)| !key.trim().is_empty())
                    .map(|(key, child)| RoadmapNode {
                        name: key.trim().to_string(),
                        children: parse_nodes(child),
                    })
                    .collect(),
            }
        }
        _ => Vec::new(),
    }
}

fn leaf_node(name: &str) -> Option<RoadmapNode> {
    let name = name.trim();
    (!name.is_empty()).then(|| RoadmapNode {
        name: name.to_string(),
        children: Vec::new(),
    })
}

fn collect_leaves(node: &RoadmapNode, path: &mut Vec<String>, out: &mut Vec<LeafCategory>) {
    if node.is_leaf() {
        out.push(LeafCategory {
            name: node.name.clone(),
            path: path.clone(),
        });
        return;
    }
    path.push(node.name.clone());
    for child in &node.children {
        collect_leaves(child, path, out);
    }
    path.pop();
}

fn write_outline(node: &RoadmapNode, depth: usize, out: &mut String) {
    out.push_str(&"  ".repeat(depth));
    out.push_str("- ");
    out.push_str(&node.name);
    out.push('\n');
    for child in &node.children {
        write_outline(child, depth + 1, out);
    }
}

/// All roadmap trees, keyed by major topic
#[derive(Debug, Clone, Default)]
pub struct Roadmaps {
    trees: HashMap<MajorTopic, Arc<RoadmapTree>>,
}

impl Roadmaps {
    pub fn new(trees: impl IntoIterator<Item = RoadmapTree>) -> Self {
        Self {
            trees: trees
                .into_iter()
                .map(|tree| (tree.topic(), Arc::new(tree)))
                .collect(),
        }
    }

    /// Load every topic's file from `dir`. A missing file leaves that topic
    /// without a tree; unreadable or malformed files are errors.
    pub fn load_dir(dir: &Path) -> Result<Self, RoadmapError> {
        let mut trees = Vec::new();
        for topic in MajorTopic::ALL {
            let path = dir.join(topic.roadmap_file());
            if !path.exists() {
                warn!("Roadmap for '{}' not found at {}", topic, path.display());
                continue;
            }
            let raw = std::fs::read_to_string(&path).map_err(|source| RoadmapError::Read {
                path: path.clone(),
                source,
            })?;
            let document: Value = serde_json::from_str(&raw).map_err(|source| {
                RoadmapError::Parse {
                    path: path.clone(),
                    source,
                }
            })?;
            let tree = RoadmapTree::from_json(topic, &document)?;
            info!(
                "Loaded roadmap '{}' ({} leaves) from {}",
                topic,
                tree.leaves().len(),
                path.display()
            );
            trees.push(tree);
        }
        Ok(Self::new(trees))
    }

    pub fn get(&self, topic: MajorTopic) -> Option<Arc<RoadmapTree>> {
        self.trees.get(&topic).cloned()
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }
}
