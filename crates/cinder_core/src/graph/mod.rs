pub mod expr;

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use cinder_error::{DbError, Result};
use expr::Expr;
use serde::Serialize;

use crate::ops::{LockMode, TableId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RowOpKind {
    Select,
    Insert,
    Update,
    Delete,
    CreateTable,
}

/// A leaf operation executed by the row operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowOp {
    pub kind: RowOpKind,
    pub table: TableId,
    /// Number of rows the operation touches.
    pub rows: u64,
}

impl RowOp {
    pub fn new(kind: RowOpKind, table: TableId, rows: u64) -> Self {
        RowOp { kind, table, rows }
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Root of every graph. Owns the threads.
    Fork { threads: Vec<NodeId> },
    /// Boundary of a single query thread.
    Thread { body: Option<NodeId> },
    Assignment {
        var: String,
        expr: Expr,
    },
    If {
        cond: Expr,
        then_branch: Option<NodeId>,
        else_branch: Option<NodeId>,
    },
    While {
        cond: Expr,
        body: Option<NodeId>,
    },
    For {
        var: String,
        from: Expr,
        to: Expr,
        body: Option<NodeId>,
    },
    /// Call into another graph. Arguments are evaluated in the caller and
    /// become variables of the callee fork.
    ProcedureCall {
        procedure: Arc<QueryGraph>,
        args: Vec<(String, Expr)>,
    },
    Commit,
    Rollback,
    Lock {
        table: TableId,
        mode: LockMode,
    },
    Return,
    Exit,
    RowOperation(RowOp),
}

impl NodeKind {
    pub fn tag(&self) -> NodeTag {
        match self {
            Self::Fork { .. } => NodeTag::Fork,
            Self::Thread { .. } => NodeTag::Thread,
            Self::Assignment { .. } => NodeTag::Assignment,
            Self::If { .. } => NodeTag::If,
            Self::While { .. } => NodeTag::While,
            Self::For { .. } => NodeTag::For,
            Self::ProcedureCall { .. } => NodeTag::ProcedureCall,
            Self::Commit => NodeTag::Commit,
            Self::Rollback => NodeTag::Rollback,
            Self::Lock { .. } => NodeTag::Lock,
            Self::Return => NodeTag::Return,
            Self::Exit => NodeTag::Exit,
            Self::RowOperation(op) => match op.kind {
                RowOpKind::Select => NodeTag::Select,
                RowOpKind::Insert => NodeTag::Insert,
                RowOpKind::Update => NodeTag::Update,
                RowOpKind::Delete => NodeTag::Delete,
                RowOpKind::CreateTable => NodeTag::CreateTable,
            },
        }
    }

    fn is_loop(&self) -> bool {
        matches!(self, Self::While { .. } | Self::For { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeTag {
    Fork,
    Thread,
    Select,
    Insert,
    Update,
    Delete,
    CreateTable,
    Assignment,
    If,
    While,
    For,
    ProcedureCall,
    Commit,
    Rollback,
    Lock,
    Return,
    Exit,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    /// Containing node. Only the root has no parent.
    pub parent: Option<NodeId>,
    /// Next statement in the same block.
    pub next: Option<NodeId>,
}

/// An immutable, compiled statement or procedure.
#[derive(Debug)]
pub struct QueryGraph {
    name: String,
    nodes: Vec<Node>,
}

impl QueryGraph {
    pub const ROOT: NodeId = NodeId(0);

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn tag(&self, id: NodeId) -> NodeTag {
        self.node(id).kind.tag()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Thread boundary nodes in order.
    pub fn threads(&self) -> &[NodeId] {
        match &self.node(Self::ROOT).kind {
            NodeKind::Fork { threads } => threads,
            other => panic!("graph root is not a fork: {:?}", other.tag()),
        }
    }

    /// Thread boundary node containing `id`.
    pub fn thread_node_of(&self, id: NodeId) -> NodeId {
        let mut curr = id;
        loop {
            let node = self.node(curr);
            if matches!(node.kind, NodeKind::Thread { .. }) {
                return curr;
            }
            curr = node
                .parent
                .unwrap_or_else(|| panic!("{id} is not contained in a thread"));
        }
    }

    /// Innermost While or For containing `id`.
    pub fn innermost_loop(&self, id: NodeId) -> Option<NodeId> {
        let mut curr = self.node(id).parent;
        while let Some(parent) = curr {
            let node = self.node(parent);
            if node.kind.is_loop() {
                return Some(parent);
            }
            if matches!(node.kind, NodeKind::Thread { .. }) {
                return None;
            }
            curr = node.parent;
        }
        None
    }

    /// Multi-line rendering of the graph for debugging.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        // Writing to a string doesn't fail.
        let _ = self.explain_node(&mut out, Self::ROOT, 0);
        out
    }

    fn explain_node(&self, out: &mut String, id: NodeId, indent: usize) -> fmt::Result {
        let node = self.node(id);
        write!(out, "{:indent$}{id} ", "")?;
        match &node.kind {
            NodeKind::Fork { .. } => writeln!(out, "Fork {}", self.name)?,
            NodeKind::Thread { .. } => writeln!(out, "Thread")?,
            NodeKind::Assignment { var, expr } => writeln!(out, "Assign {var} := {expr}")?,
            NodeKind::If { cond, .. } => writeln!(out, "If {cond}")?,
            NodeKind::While { cond, .. } => writeln!(out, "While {cond}")?,
            NodeKind::For { var, from, to, .. } => writeln!(out, "For {var} in {from}..={to}")?,
            NodeKind::ProcedureCall { procedure, .. } => {
                writeln!(out, "Call {}", procedure.name())?
            }
            NodeKind::Lock { table, mode } => writeln!(out, "Lock {table} {mode:?}")?,
            NodeKind::RowOperation(op) => {
                writeln!(out, "{:?} {} rows={}", op.kind, op.table, op.rows)?
            }
            other => writeln!(out, "{:?}", other.tag())?,
        }

        let blocks: Vec<Option<NodeId>> = match &node.kind {
            NodeKind::Fork { threads } => threads.iter().copied().map(Some).collect(),
            NodeKind::Thread { body }
            | NodeKind::While { body, .. }
            | NodeKind::For { body, .. } => vec![*body],
            NodeKind::If {
                then_branch,
                else_branch,
                ..
            } => vec![*then_branch, *else_branch],
            _ => Vec::new(),
        };

        for first in blocks {
            let mut child = first;
            while let Some(c) = child {
                self.explain_node(out, c, indent + 2)?;
                child = self.node(c).next;
            }
        }

        Ok(())
    }
}

impl fmt::Display for QueryGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.explain())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Branch {
    Body,
    Else,
}

/// Builds a query graph by appending statements to blocks.
///
/// Block nodes (If, While, For) must be pushed with empty child links, the
/// builder fills those in as statements are appended.
#[derive(Debug)]
pub struct GraphBuilder {
    name: String,
    nodes: Vec<Node>,
    /// Last statement appended to each block.
    tails: HashMap<(NodeId, Branch), NodeId>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        GraphBuilder {
            name: name.into(),
            nodes: vec![Node {
                kind: NodeKind::Fork {
                    threads: Vec::new(),
                },
                parent: None,
                next: None,
            }],
            tails: HashMap::new(),
        }
    }

    /// Add a new thread to the root fork, returning its boundary node.
    pub fn add_thread(&mut self) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            kind: NodeKind::Thread { body: None },
            parent: Some(QueryGraph::ROOT),
            next: None,
        });
        match &mut self.nodes[0].kind {
            NodeKind::Fork { threads } => threads.push(id),
            _ => unreachable!("root is always a fork"),
        }
        id
    }

    /// Append a statement to the body of `parent` (the then branch for If).
    pub fn push(&mut self, parent: NodeId, kind: NodeKind) -> Result<NodeId> {
        self.append(parent, Branch::Body, kind)
    }

    /// Append a statement to the else branch of an If.
    pub fn push_else(&mut self, parent: NodeId, kind: NodeKind) -> Result<NodeId> {
        self.append(parent, Branch::Else, kind)
    }

    fn append(&mut self, parent: NodeId, branch: Branch, kind: NodeKind) -> Result<NodeId> {
        let parent_node = self
            .nodes
            .get(parent.0)
            .ok_or_else(|| DbError::new("Unknown parent node").with_field("node", parent))?;

        let accepts = match (&parent_node.kind, branch) {
            (NodeKind::Thread { .. }, Branch::Body)
            | (NodeKind::While { .. }, Branch::Body)
            | (NodeKind::For { .. }, Branch::Body)
            | (NodeKind::If { .. }, _) => true,
            _ => false,
        };
        if !accepts {
            return Err(DbError::new("Node cannot contain statements")
                .with_field("node", parent)
                .with_field("tag", format!("{:?}", parent_node.kind.tag())));
        }

        let has_links = match &kind {
            NodeKind::Fork { .. } | NodeKind::Thread { .. } => {
                return Err(DbError::new("Fork and thread nodes cannot be nested"));
            }
            NodeKind::If {
                then_branch,
                else_branch,
                ..
            } => then_branch.is_some() || else_branch.is_some(),
            NodeKind::While { body, .. } | NodeKind::For { body, .. } => body.is_some(),
            _ => false,
        };
        if has_links {
            return Err(DbError::new("Block nodes must be created empty"));
        }

        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            kind,
            parent: Some(parent),
            next: None,
        });

        if matches!(self.nodes[id.0].kind, NodeKind::Exit) && !self.inside_loop(parent) {
            self.nodes.pop();
            return Err(DbError::new("EXIT outside of a loop"));
        }

        match self.tails.insert((parent, branch), id) {
            Some(prev) => self.nodes[prev.0].next = Some(id),
            None => {
                let slot = match (&mut self.nodes[parent.0].kind, branch) {
                    (NodeKind::Thread { body }, _)
                    | (NodeKind::While { body, .. }, _)
                    | (NodeKind::For { body, .. }, _) => body,
                    (NodeKind::If { then_branch, .. }, Branch::Body) => then_branch,
                    (NodeKind::If { else_branch, .. }, Branch::Else) => else_branch,
                    _ => unreachable!("checked above"),
                };
                *slot = Some(id);
            }
        }

        Ok(id)
    }

    fn inside_loop(&self, mut id: NodeId) -> bool {
        loop {
            let node = &self.nodes[id.0];
            if node.kind.is_loop() {
                return true;
            }
            match node.parent {
                Some(parent) if !matches!(node.kind, NodeKind::Thread { .. }) => id = parent,
                _ => return false,
            }
        }
    }

    pub fn build(self) -> Result<Arc<QueryGraph>> {
        let graph = QueryGraph {
            name: self.name,
            nodes: self.nodes,
        };
        if graph.threads().is_empty() {
            return Err(DbError::new("Query graph has no threads").with_field("graph", &graph.name));
        }
        Ok(Arc::new(graph))
    }
}
