//! Cell tree topology and per-cell neighbor state

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::address::CellPath;
use crate::aggregate::add_numbers;
use crate::error::{CellError, Result};

/// What a cell knows about its place in the tree
pub trait TopologyStore: Send + Sync {
    /// Full path of this cell
    fn my_cell_path(&self) -> CellPath;

    /// Cells this one reports to
    fn parent_cells(&self) -> Vec<CellPath>;

    /// Cells that report to this one
    fn child_cells(&self) -> Vec<CellPath>;

    /// Opaque snapshot handed to neighbor cells
    fn cell_info_for_neighbors(&self) -> Value;

    /// This cell's capabilities, children included
    fn our_capabilities(&self) -> Value;

    /// This cell's free capacity, children included
    fn our_capacities(&self) -> Value;

    /// Record capabilities announced by a child
    fn update_cell_capabilities(&self, cell: &CellPath, capabilities: Value);

    /// Record capacities announced by a child
    fn update_cell_capacities(&self, cell: &CellPath, capacities: Value);
}

/// Node in the cell tree
#[derive(Debug, Clone)]
struct CellNode {
    parent: Option<CellPath>,
    children: Vec<CellPath>,
}

/// Registry of every cell in the tree
#[derive(Debug, Default)]
pub struct CellTree {
    /// All nodes by path
    nodes: HashMap<CellPath, CellNode>,
    /// The top cell
    root: Option<CellPath>,
}

impl CellTree {
    /// Create a new empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a cell. Its parent (the path minus its last segment) must already exist.
    pub fn add_cell(&mut self, path: CellPath) -> Result<()> {
        if path.is_local() {
            return Err(CellError::Config("cannot register the local path as a cell".into()));
        }
        if self.nodes.contains_key(&path) {
            return Ok(());
        }

        let parent = path.parent();
        match &parent {
            Some(pid) => {
                let node = self
                    .nodes
                    .get_mut(pid)
                    .ok_or_else(|| CellError::CellNotFound(pid.clone()))?;
                node.children.push(path.clone());
            }
            None => {
                if let Some(root) = &self.root {
                    return Err(CellError::Config(format!(
                        "tree already has top cell {root}, cannot add {path}"
                    )));
                }
                self.root = Some(path.clone());
            }
        }

        debug!(cell = %path, "Registered cell");
        self.nodes.insert(
            path,
            CellNode {
                parent,
                children: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn root(&self) -> Option<&CellPath> {
        self.root.as_ref()
    }

    pub fn contains(&self, path: &CellPath) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn parent(&self, path: &CellPath) -> Option<CellPath> {
        self.nodes.get(path).and_then(|n| n.parent.clone())
    }

    pub fn children(&self, path: &CellPath) -> Vec<CellPath> {
        self.nodes.get(path).map(|n| n.children.clone()).unwrap_or_default()
    }

    /// `path` and every cell below it, parents before children
    pub fn subtree(&self, path: &CellPath) -> Vec<CellPath> {
        let mut out = Vec::new();
        if !self.nodes.contains_key(path) {
            return out;
        }
        let mut stack = vec![path.clone()];
        while let Some(current) = stack.pop() {
            let children = self.children(&current);
            out.push(current);
            stack.extend(children.into_iter().rev());
        }
        out
    }

    /// Every registered cell above `path`, nearest first
    pub fn ancestors(&self, path: &CellPath) -> Vec<CellPath> {
        let mut out = Vec::new();
        let mut current = self.parent(path);
        while let Some(p) = current {
            current = self.parent(&p);
            out.push(p);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Per-child state learned from announcements
#[derive(Debug, Clone, Default)]
struct NeighborState {
    capabilities: Option<Value>,
    capacities: Option<Value>,
}

/// One cell's view of a shared [`CellTree`]
pub struct TreeTopology {
    tree: Arc<RwLock<CellTree>>,
    me: CellPath,
    own_capabilities: RwLock<Value>,
    own_capacities: RwLock<Value>,
    neighbors: RwLock<BTreeMap<CellPath, NeighborState>>,
}

impl TreeTopology {
    /// View of `me`, which must already be registered in `tree`
    pub fn new(tree: Arc<RwLock<CellTree>>, me: CellPath) -> Result<Self> {
        if !tree.read().contains(&me) {
            return Err(CellError::CellNotFound(me));
        }
        Ok(Self {
            tree,
            me,
            own_capabilities: RwLock::new(json!({})),
            own_capacities: RwLock::new(json!({})),
            neighbors: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn set_capabilities(&self, capabilities: Value) {
        *self.own_capabilities.write() = capabilities;
    }

    pub fn set_capacities(&self, capacities: Value) {
        *self.own_capacities.write() = capacities;
    }
}

impl TopologyStore for TreeTopology {
    fn my_cell_path(&self) -> CellPath {
        self.me.clone()
    }

    fn parent_cells(&self) -> Vec<CellPath> {
        self.tree.read().parent(&self.me).into_iter().collect()
    }

    fn child_cells(&self) -> Vec<CellPath> {
        self.tree.read().children(&self.me)
    }

    fn cell_info_for_neighbors(&self) -> Value {
        json!({
            "name": self.me,
            "parents": self.parent_cells(),
            "children": self.child_cells(),
            "capabilities": self.our_capabilities(),
            "capacities": self.our_capacities(),
        })
    }

    fn our_capabilities(&self) -> Value {
        let mut merged = as_map(&self.own_capabilities.read());
        for state in self.neighbors.read().values() {
            if let Some(Value::Object(child)) = &state.capabilities {
                for (key, value) in child {
                    merged.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }
        Value::Object(merged)
    }

    fn our_capacities(&self) -> Value {
        let mut merged = as_map(&self.own_capacities.read());
        for state in self.neighbors.read().values() {
            if let Some(Value::Object(child)) = &state.capacities {
                for (key, value) in child {
                    let Value::Number(add) = value else { continue };
                    let sum = match merged.get(key) {
                        Some(Value::Number(current)) => add_numbers(current, add),
                        _ => Some(add.clone()),
                    };
                    match sum {
                        Some(sum) => {
                            merged.insert(key.clone(), Value::Number(sum));
                        }
                        None => debug!(key = %key, "Capacity sum is not finite, keeping previous value"),
                    }
                }
            }
        }
        Value::Object(merged)
    }

    fn update_cell_capabilities(&self, cell: &CellPath, capabilities: Value) {
        self.neighbors.write().entry(cell.clone()).or_default().capabilities = Some(capabilities);
    }

    fn update_cell_capacities(&self, cell: &CellPath, capacities: Value) {
        self.neighbors.write().entry(cell.clone()).or_default().capacities = Some(capacities);
    }
}

fn as_map(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    }
}
