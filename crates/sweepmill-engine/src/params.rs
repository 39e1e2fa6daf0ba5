//! The parameter tree handed to jobs and produced by optimizers.
//!
//! A parameter setting is a nested mapping from names to values. Leaves are
//! restricted to booleans, integers, floats, strings, and tuples thereof;
//! internal nodes are mappings. Flattened names join the path segments with
//! `.` (so `a.b.c` addresses `{a: {b: {c: ...}}}`).

use std::fmt;
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::OBJECT_SEPARATOR;
use crate::constants::RESERVED_PARAMS;
use crate::constants::STD_ENDING;
use crate::error::EngineError;

/// The pattern every parameter name must match.
static VALID_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z0-9_.:-]+$").expect("pattern should compile"));

/// A single parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// A boolean value.
    Bool(bool),
    /// An integer value.
    Int(i64),
    /// A floating point value.
    Float(f64),
    /// A string value.
    String(String),
    /// A tuple of values.
    Tuple(Vec<ParamValue>),
}

impl ParamValue {
    /// Gets the value as a float if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Parses a command line literal into a value.
    ///
    /// JSON literals are accepted directly; anything that does not parse as
    /// JSON is taken as a bare string.
    pub fn parse_literal(s: &str) -> Self {
        serde_json::from_str(s).unwrap_or_else(|_| Self::String(s.to_string()))
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for ParamValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// A node of a parameter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamNode {
    /// A leaf value.
    Leaf(ParamValue),
    /// A nested mapping.
    Tree(ParamTree),
}

/// A nested mapping of parameter names to values.
///
/// Insertion order is preserved so that generated files and command lines are
/// stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamTree(IndexMap<String, ParamNode>);

impl ParamTree {
    /// Constructs an empty parameter tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Determines if the tree has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the direct children of the tree.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamNode)> {
        self.0.iter()
    }

    /// Inserts a value at a dotted path, creating intermediate nodes.
    ///
    /// An existing leaf on the path is replaced by a subtree.
    pub fn insert_path(&mut self, path: &str, value: ParamValue) {
        let mut node = &mut self.0;
        let mut segments = path.split(OBJECT_SEPARATOR).peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                node.insert(segment.to_string(), ParamNode::Leaf(value));
                return;
            }

            let entry = node
                .entry(segment.to_string())
                .or_insert_with(|| ParamNode::Tree(ParamTree::new()));
            if !matches!(entry, ParamNode::Tree(_)) {
                *entry = ParamNode::Tree(ParamTree::new());
            }
            match entry {
                ParamNode::Tree(subtree) => node = &mut subtree.0,
                ParamNode::Leaf(_) => unreachable!("entry was just replaced by a tree"),
            }
        }
    }

    /// Looks up a leaf value at a dotted path.
    pub fn get_path(&self, path: &str) -> Option<&ParamValue> {
        let mut node = self;
        let mut segments = path.split(OBJECT_SEPARATOR).peekable();
        while let Some(segment) = segments.next() {
            match node.0.get(segment)? {
                ParamNode::Leaf(value) if segments.peek().is_none() => return Some(value),
                ParamNode::Tree(subtree) if segments.peek().is_some() => node = subtree,
                _ => return None,
            }
        }
        None
    }

    /// Recursively merges `other` into `self`.
    ///
    /// Leaves in `other` overwrite existing entries; subtrees are merged
    /// entry by entry. Keys unknown to `self` are created.
    pub fn merge(&mut self, other: &ParamTree) {
        for (key, node) in &other.0 {
            match (self.0.get_mut(key), node) {
                (Some(ParamNode::Tree(existing)), ParamNode::Tree(incoming)) => {
                    existing.merge(incoming);
                }
                (_, incoming) => {
                    self.0.insert(key.clone(), incoming.clone());
                }
            }
        }
    }

    /// Flattens the tree into dotted names in depth-first order.
    pub fn flatten(&self) -> IndexMap<String, ParamValue> {
        fn walk(tree: &ParamTree, prefix: &str, out: &mut IndexMap<String, ParamValue>) {
            for (key, node) in &tree.0 {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}{OBJECT_SEPARATOR}{key}")
                };
                match node {
                    ParamNode::Leaf(value) => {
                        out.insert(name, value.clone());
                    }
                    ParamNode::Tree(subtree) => walk(subtree, &name, out),
                }
            }
        }

        let mut out = IndexMap::new();
        walk(self, "", &mut out);
        out
    }

    /// Builds a tree from flattened dotted names.
    pub fn from_flat<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, ParamValue)>,
        S: AsRef<str>,
    {
        let mut tree = Self::new();
        for (name, value) in pairs {
            tree.insert_path(name.as_ref(), value);
        }
        tree
    }
}

impl fmt::Display for ParamTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "{json}")
    }
}

/// Checks a parameter name against the naming rules.
///
/// Names must match `[A-Za-z0-9_.:-]+`, must not be reserved, must not end in
/// the standard deviation suffix, and must not start or end with a dot.
pub fn check_valid_param_name(name: &str) -> Result<(), EngineError> {
    if RESERVED_PARAMS.contains(&name) {
        return Err(EngineError::Settings(format!(
            "parameter name `{name}` is reserved"
        )));
    }
    if name.ends_with(STD_ENDING) {
        return Err(EngineError::Settings(format!(
            "parameter name `{name}` ends with `{STD_ENDING}` (may cause collisions)"
        )));
    }
    if !VALID_NAME.is_match(name) {
        return Err(EngineError::Settings(format!(
            "parameter name `{name}` is not valid; only `[A-Za-z0-9_.:-]` is allowed"
        )));
    }
    if name.starts_with(OBJECT_SEPARATOR) || name.ends_with(OBJECT_SEPARATOR) {
        return Err(EngineError::Settings(format!(
            "parameter name `{name}` may not start or end with `{OBJECT_SEPARATOR}`"
        )));
    }
    Ok(())
}

/// Parses a `dotted.path=literal` command line override.
pub fn parse_override(arg: &str) -> Result<(String, ParamValue), EngineError> {
    let (name, literal) = arg.split_once('=').ok_or_else(|| {
        EngineError::Settings(format!("override `{arg}` is not of the form `key=value`"))
    })?;
    let name = name.trim();
    check_valid_param_name(name)?;
    Ok((name.to_string(), ParamValue::parse_literal(literal.trim())))
}

/// Validates user-supplied fixed parameters against the optimized names.
///
/// Every flattened name must pass [`check_valid_param_name`] and must not
/// collide with a name the optimizer samples.
pub fn validate_fixed_params(
    fixed_params: &ParamTree,
    optimized_names: &[String],
) -> Result<(), EngineError> {
    for (name, _) in fixed_params.flatten() {
        check_valid_param_name(&name)?;
        if optimized_names.iter().any(|n| *n == name) {
            return Err(EngineError::Settings(format!(
                "duplicate setting `{name}` in fixed params"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn flatten_round_trip() {
        let mut tree = ParamTree::new();
        tree.insert_path("model.layers", ParamValue::Int(3));
        tree.insert_path("model.dropout", ParamValue::Float(0.5));
        tree.insert_path("seed", ParamValue::Int(7));

        let flat = tree.flatten();
        assert_eq!(flat.len(), 3);
        assert_eq!(flat["model.layers"], ParamValue::Int(3));
        assert_eq!(flat["model.dropout"], ParamValue::Float(0.5));

        let rebuilt = ParamTree::from_flat(flat);
        assert_eq!(rebuilt, tree);
    }

    #[test]
    fn merge_overwrites_leaves_and_merges_trees() {
        let mut base = ParamTree::new();
        base.insert_path("a.x", ParamValue::Int(1));
        base.insert_path("a.y", ParamValue::Int(2));
        base.insert_path("b", ParamValue::Bool(false));

        let mut update = ParamTree::new();
        update.insert_path("a.y", ParamValue::Int(20));
        update.insert_path("a.z", ParamValue::Int(30));
        update.insert_path("c", "new".into());

        base.merge(&update);
        assert_eq!(base.get_path("a.x"), Some(&ParamValue::Int(1)));
        assert_eq!(base.get_path("a.y"), Some(&ParamValue::Int(20)));
        assert_eq!(base.get_path("a.z"), Some(&ParamValue::Int(30)));
        assert_eq!(base.get_path("b"), Some(&ParamValue::Bool(false)));
        assert_eq!(base.get_path("c"), Some(&ParamValue::String("new".into())));
    }

    #[test]
    fn deserializes_nested_json() {
        let tree: ParamTree =
            serde_json::from_str(r#"{"opt": {"lr": 0.01, "momentum": 0.9}, "tag": "x"}"#)
                .expect("should deserialize");
        assert_eq!(tree.get_path("opt.lr"), Some(&ParamValue::Float(0.01)));
        assert_eq!(tree.get_path("tag"), Some(&ParamValue::String("x".into())));
    }

    #[test]
    fn reserved_and_malformed_names_are_rejected() {
        assert!(check_valid_param_name("_id").is_err());
        assert!(check_valid_param_name("working_dir").is_err());
        assert!(check_valid_param_name("loss__std").is_err());
        assert!(check_valid_param_name("has space").is_err());
        assert!(check_valid_param_name(".leading").is_err());
        assert!(check_valid_param_name("trailing.").is_err());
        assert!(check_valid_param_name("model.lr").is_ok());
        assert!(check_valid_param_name("a-b:c_d").is_ok());
    }

    #[test]
    fn parses_overrides() {
        let (name, value) = parse_override("model.lr=0.1").expect("should parse");
        assert_eq!(name, "model.lr");
        assert_eq!(value, ParamValue::Float(0.1));

        let (_, value) = parse_override("tag=baseline").expect("should parse");
        assert_eq!(value, ParamValue::String("baseline".into()));

        let (_, value) = parse_override("flags=[1, 2]").expect("should parse");
        assert_eq!(
            value,
            ParamValue::Tuple(vec![ParamValue::Int(1), ParamValue::Int(2)])
        );

        assert!(parse_override("no-equals-sign").is_err());
        assert!(parse_override("_iteration=3").is_err());
    }
}
