//! Path-addressed edits over a structured document tree.
//!
//! Same transform contract as the flat text scheme, with sibling-index
//! shifts at the shared path prefix standing in for offset shifts. Text
//! edits on one leaf delegate to [`Operation`]'s transform.

use serde::{Deserialize, Serialize};

use crate::edit::{Edit, Side};
use crate::error::{ApplyError, ValidationError};
use crate::text::Operation;

/// Child indices from the root down to a node. The root itself is `[]`.
pub type Path = Vec<usize>;

/// A document node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    Element { kind: String, children: Vec<Node> },
    Text { text: String },
}

impl Default for Node {
    fn default() -> Self {
        Node::element("root", Vec::new())
    }
}

impl Node {
    pub fn element(kind: impl Into<String>, children: Vec<Node>) -> Self {
        Node::Element {
            kind: kind.into(),
            children,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Node::Text { text: text.into() }
    }

    pub fn children(&self) -> Option<&Vec<Node>> {
        match self {
            Node::Element { children, .. } => Some(children),
            Node::Text { .. } => None,
        }
    }

    /// Node at `path`, if any.
    pub fn get(&self, path: &[usize]) -> Option<&Node> {
        path.iter()
            .try_fold(self, |node, &index| node.children()?.get(index))
    }

    fn get_mut(&mut self, path: &[usize]) -> Option<&mut Node> {
        let mut node = self;
        for &index in path {
            node = match node {
                Node::Element { children, .. } => children.get_mut(index)?,
                Node::Text { .. } => return None,
            };
        }
        Some(node)
    }

    /// Concatenated text of every leaf, depth first.
    pub fn to_plain_text(&self) -> String {
        match self {
            Node::Text { text } => text.clone(),
            Node::Element { children, .. } => children.iter().map(Node::to_plain_text).collect(),
        }
    }
}

/// An edit against a [`Node`] tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeOp {
    InsertNode { path: Path, node: Node },
    RemoveNode { path: Path },
    InsertText { path: Path, offset: usize, text: String },
    RemoveText { path: Path, offset: usize, len: usize },
}

impl TreeOp {
    pub fn path(&self) -> &Path {
        match self {
            TreeOp::InsertNode { path, .. }
            | TreeOp::RemoveNode { path }
            | TreeOp::InsertText { path, .. }
            | TreeOp::RemoveText { path, .. } => path,
        }
    }

    fn with_path(&self, path: Path) -> Self {
        let mut op = self.clone();
        match &mut op {
            TreeOp::InsertNode { path: p, .. }
            | TreeOp::RemoveNode { path: p }
            | TreeOp::InsertText { path: p, .. }
            | TreeOp::RemoveText { path: p, .. } => *p = path,
        }
        op
    }

    /// The flat text edit carried by a text op.
    fn as_text(&self) -> Option<Operation> {
        match self {
            TreeOp::InsertText { offset, text, .. } => Some(Operation::insert(*offset, text.clone())),
            TreeOp::RemoveText { offset, len, .. } => Some(Operation::delete(*offset, *len)),
            _ => None,
        }
    }

    fn from_text(path: Path, op: Operation) -> Self {
        match op {
            Operation::Insert { pos, text } => TreeOp::InsertText { path, offset: pos, text },
            Operation::Delete { pos, len } => TreeOp::RemoveText { path, offset: pos, len },
        }
    }
}

/// Rewrite `path` after a node was inserted at `at`.
fn path_after_insert(path: &[usize], at: &[usize]) -> Path {
    let mut out = path.to_vec();
    if let Some(depth) = sibling_depth(path, at) {
        if at[depth] <= path[depth] {
            out[depth] = out[depth].saturating_add(1);
        }
    }
    out
}

/// Rewrite `path` after the node at `at` was removed. `None` when `path`
/// was `at` or lies beneath it.
fn path_after_remove(path: &[usize], at: &[usize]) -> Option<Path> {
    if path.starts_with(at) {
        return None;
    }
    let mut out = path.to_vec();
    if let Some(depth) = sibling_depth(path, at) {
        if at[depth] < path[depth] {
            out[depth] -= 1;
        }
    }
    Some(out)
}

/// Depth at which `at` is a sibling of `path` or of one of its
/// ancestors: `at`'s parent must be a prefix of `path`.
fn sibling_depth(path: &[usize], at: &[usize]) -> Option<usize> {
    let (_, parent) = at.split_last()?;
    (at.len() <= path.len() && path.starts_with(parent)).then_some(parent.len())
}

impl Edit for TreeOp {
    type Document = Node;

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            TreeOp::InsertNode { path, .. } | TreeOp::RemoveNode { path } if path.is_empty() => {
                Err(ValidationError::RootPath)
            }
            TreeOp::InsertText { text, .. } if text.is_empty() => Err(ValidationError::EmptyInsert),
            TreeOp::RemoveText { len: 0, .. } => Err(ValidationError::EmptyDelete),
            _ => Ok(()),
        }
    }

    fn apply_to(&self, doc: &mut Node) -> Result<(), ApplyError> {
        match self {
            TreeOp::InsertNode { path, node } => {
                let (index, parent) = path
                    .split_last()
                    .ok_or_else(|| ApplyError::InvalidPath(path.clone()))?;
                match doc.get_mut(parent) {
                    Some(Node::Element { children, .. }) if *index <= children.len() => {
                        children.insert(*index, node.clone());
                        Ok(())
                    }
                    Some(Node::Element { .. }) => Err(ApplyError::InvalidPath(path.clone())),
                    Some(Node::Text { .. }) => Err(ApplyError::NotElement(parent.to_vec())),
                    None => Err(ApplyError::InvalidPath(parent.to_vec())),
                }
            }
            TreeOp::RemoveNode { path } => {
                let (index, parent) = path
                    .split_last()
                    .ok_or_else(|| ApplyError::InvalidPath(path.clone()))?;
                match doc.get_mut(parent) {
                    Some(Node::Element { children, .. }) if *index < children.len() => {
                        children.remove(*index);
                        Ok(())
                    }
                    _ => Err(ApplyError::InvalidPath(path.clone())),
                }
            }
            TreeOp::InsertText { path, .. } | TreeOp::RemoveText { path, .. } => {
                let edit = self.as_text().ok_or_else(|| ApplyError::NotText(path.clone()))?;
                match doc.get_mut(path) {
                    Some(Node::Text { text }) => edit.apply_to(text),
                    Some(Node::Element { .. }) => Err(ApplyError::NotText(path.clone())),
                    None => Err(ApplyError::InvalidPath(path.clone())),
                }
            }
        }
    }

    fn transform(&self, against: &Self, side: Side) -> Option<Self> {
        match against {
            TreeOp::InsertNode { path: at, .. } => match self {
                TreeOp::InsertNode { path, .. } if path == at => match side {
                    Side::Left => Some(self.clone()),
                    Side::Right => {
                        let mut shifted = path.clone();
                        if let Some(last) = shifted.last_mut() {
                            *last = last.saturating_add(1);
                        }
                        Some(self.with_path(shifted))
                    }
                },
                _ => Some(self.with_path(path_after_insert(self.path(), at))),
            },

            TreeOp::RemoveNode { path: at } => match self {
                // An insert at the vacated index still lands there.
                TreeOp::InsertNode { path, .. } if path == at => Some(self.clone()),
                _ => path_after_remove(self.path(), at).map(|path| self.with_path(path)),
            },

            TreeOp::InsertText { path: at, .. } | TreeOp::RemoveText { path: at, .. } => {
                match (self.as_text(), against.as_text()) {
                    (Some(mine), Some(theirs)) if self.path() == at => mine
                        .transform(&theirs, side)
                        .map(|op| TreeOp::from_text(at.clone(), op)),
                    _ => Some(self.clone()),
                }
            }
        }
    }
}
