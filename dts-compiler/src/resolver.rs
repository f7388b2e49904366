use std::collections::{HashMap, HashSet};

use crate::ast::*;
use crate::error::{Error, Position, Result};

/// How a standalone reference such as `prop = &label;` is encoded.
///
/// References inside a cell array are always phandles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// A single cell holding the phandle of the target node.
    Phandle,
    /// The absolute path of the target node, as a string.
    Path,
}

/// Decides how standalone references are encoded, based on the property name.
pub trait ReferencePolicy: Send + Sync {
    fn kind(&self, property: &str) -> ReferenceKind;
}

/// Properties whose value is known to be a phandle.
const PHANDLE_PROPERTIES: &[&str] = &[
    PHANDLE,
    LINUX_PHANDLE,
    "interrupt-parent",
    "interrupts-extended",
    "next-level-cache",
    "clocks",
    "resets",
    "power-domains",
    "memory-region",
    "dmas",
    "phys",
    "iommus",
    "msi-parent",
    "cpu-idle-states",
];

/// Encodes references in well-known phandle properties as phandles, and any
/// other standalone reference as a path.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPolicy;

impl ReferencePolicy for DefaultPolicy {
    fn kind(&self, property: &str) -> ReferenceKind {
        let pinctrl = property
            .strip_prefix("pinctrl-")
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));

        if pinctrl || PHANDLE_PROPERTIES.contains(&property) {
            ReferenceKind::Phandle
        } else {
            ReferenceKind::Path
        }
    }
}

/// Per-property overrides. Properties missing from the map follow [`DefaultPolicy`].
impl ReferencePolicy for HashMap<String, ReferenceKind> {
    fn kind(&self, property: &str) -> ReferenceKind {
        self.get(property)
            .copied()
            .unwrap_or_else(|| DefaultPolicy.kind(property))
    }
}

impl<F> ReferencePolicy for F
where
    F: Fn(&str) -> ReferenceKind + Send + Sync,
{
    fn kind(&self, property: &str) -> ReferenceKind {
        self(property)
    }
}

/// Labels and phandles of a resolved tree.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    /// Label to node path.
    labels: HashMap<String, String>,
    /// Node path to phandle.
    phandles: HashMap<String, u32>,
}

impl SymbolTable {
    /// Path of the node carrying `label`.
    pub fn label(&self, label: &str) -> Option<&str> {
        self.labels.get(label).map(String::as_str)
    }

    /// Phandle of the node at `path`, if it has one.
    pub fn phandle(&self, path: &str) -> Option<u32> {
        self.phandles.get(path).copied()
    }
}

/// Hands out phandle values, skipping the ones reserved by explicit properties.
#[derive(Debug, Default)]
pub struct PhandleAllocator {
    used: HashSet<u32>,
    next: u32,
}

impl PhandleAllocator {
    /// Mark `phandle` as taken. Returns `false` if it already was.
    pub fn reserve(&mut self, phandle: u32) -> bool {
        self.used.insert(phandle)
    }

    /// The smallest positive value not handed out or reserved so far.
    pub fn allocate(&mut self) -> u32 {
        let mut candidate = self.next.max(1);
        while self.used.contains(&candidate) {
            candidate += 1;
        }

        self.used.insert(candidate);
        self.next = candidate + 1;
        candidate
    }
}

/// A reference found in the tree, along with where it was used.
#[derive(Debug)]
struct Use {
    source: String,
    property: String,
    reference: Reference,
    in_cells: bool,
}

/// Resolve all references in `dts`.
///
/// Unreferenced `/omit-if-no-ref/` nodes are removed first, so their explicit
/// phandles neither conflict with nor hold back the values of the remaining
/// nodes. Nodes referenced by a phandle then get one assigned if they do not
/// carry an explicit `phandle` property, in the order in which they are first
/// referenced, and every reference is replaced by the phandle or path of its
/// target.
pub fn resolve(dts: &mut Dts, policy: &dyn ReferencePolicy) -> Result<SymbolTable> {
    let mut resolver = Resolver {
        policy,
        symbols: SymbolTable::default(),
        allocator: PhandleAllocator::default(),
        owners: HashMap::new(),
        uses: vec![],
    };

    resolver.discover(&dts.root, "/")?;

    let mut targets = HashMap::new();
    for u in &resolver.uses {
        let path = resolver
            .target_path(&dts.root, &u.reference.target)
            .ok_or_else(|| u.reference.unresolved())?;
        targets.insert(u.reference.target.clone(), path);
    }

    let referenced: HashSet<&str> = targets.values().map(String::as_str).collect();
    omit_unreferenced(&mut dts.root, "/", &referenced);
    resolver.uses.retain(|u| dts.root.find(&u.source).is_some());

    resolver.reserve(&mut dts.root, "/")?;
    resolver.assign(&mut dts.root, &targets)?;
    resolver.rewrite(&mut dts.root, &targets)?;

    log::debug!(
        "resolved {} references to {} nodes, {} nodes carry a phandle",
        resolver.uses.len(),
        targets.len(),
        resolver.symbols.phandles.len()
    );

    Ok(resolver.symbols)
}

struct Resolver<'p> {
    policy: &'p dyn ReferencePolicy,
    symbols: SymbolTable,
    allocator: PhandleAllocator,
    /// Explicit phandle values and the path of the node declaring them.
    owners: HashMap<u32, String>,
    uses: Vec<Use>,
}

impl Resolver<'_> {
    /// Record labels and references, in pre-order.
    fn discover(&mut self, node: &Node, path: &str) -> Result<()> {
        for label in &node.labels {
            if let Some(first) = self.symbols.labels.get(&label.name) {
                return Err(Error::DuplicateLabel {
                    label: label.name.clone(),
                    first: first.clone(),
                    second: path.to_string(),
                    position: label.position,
                });
            }
            self.symbols.labels.insert(label.name.clone(), path.to_string());
        }

        for prop in &node.properties {
            for fragment in &prop.value {
                let (refs, in_cells) = match fragment {
                    Fragment::Reference(r) => (vec![r], false),
                    Fragment::Cells(array) => (
                        array
                            .cells
                            .iter()
                            .filter_map(|c| match c {
                                Cell::Reference(r) => Some(r),
                                Cell::Value(_) => None,
                            })
                            .collect(),
                        true,
                    ),
                    Fragment::Str(_) | Fragment::Bytes(_) => continue,
                };

                self.uses.extend(refs.into_iter().map(|r| Use {
                    source: path.to_string(),
                    property: prop.name.clone(),
                    reference: r.clone(),
                    in_cells,
                }));
            }
        }

        for child in &node.children {
            let child_path = child_path(path, &child.full_name());
            self.discover(child, &child_path)?;
        }

        Ok(())
    }

    /// Reserve the explicit phandles of the tree, in pre-order.
    ///
    /// A node only carrying `linux,phandle` also gets a `phandle` property with
    /// the same value.
    fn reserve(&mut self, node: &mut Node, path: &str) -> Result<()> {
        if let Some((phandle, position)) = explicit_phandle(node, path)? {
            if let Some(first) = self.owners.get(&phandle) {
                return Err(Error::PhandleConflict {
                    phandle,
                    first: first.clone(),
                    second: path.to_string(),
                    position,
                });
            }

            self.allocator.reserve(phandle);
            self.owners.insert(phandle, path.to_string());
            self.symbols.phandles.insert(path.to_string(), phandle);
            node.phandle = Some(phandle);
            if node.property(PHANDLE).is_none() {
                node.properties.push(Property::cell(PHANDLE, phandle));
            }
        }

        for child in &mut node.children {
            let child_path = child_path(path, &child.full_name());
            self.reserve(child, &child_path)?;
        }

        Ok(())
    }

    fn target_path(&self, root: &Node, target: &RefTarget) -> Option<String> {
        match target {
            RefTarget::Label(label) => self.symbols.labels.get(label).cloned(),
            RefTarget::Path(path) => root.find(path).map(|_| path.clone()),
        }
    }

    /// Give a phandle to every node referenced as one, in first reference order.
    fn assign(&mut self, root: &mut Node, targets: &HashMap<RefTarget, String>) -> Result<()> {
        for u in &self.uses {
            if !u.in_cells && self.policy.kind(&u.property) == ReferenceKind::Path {
                continue;
            }

            let path = targets
                .get(&u.reference.target)
                .ok_or_else(|| u.reference.unresolved())?;
            if self.symbols.phandles.contains_key(path) {
                continue;
            }

            let node = root.find_mut(path).ok_or_else(|| u.reference.unresolved())?;
            let phandle = self.allocator.allocate();
            log::trace!("assigning phandle {phandle:#x} to {path}");

            node.phandle = Some(phandle);
            node.properties.push(Property::cell(PHANDLE, phandle));
            self.symbols.phandles.insert(path.clone(), phandle);
        }

        Ok(())
    }

    /// Replace every reference in the tree by the phandle or path of its target.
    fn rewrite(&self, node: &mut Node, targets: &HashMap<RefTarget, String>) -> Result<()> {
        for prop in &mut node.properties {
            let kind = self.policy.kind(&prop.name);

            for fragment in &mut prop.value {
                match fragment {
                    Fragment::Cells(array) => {
                        for cell in &mut array.cells {
                            if let Cell::Reference(r) = cell {
                                let phandle = self.phandle_of(r, targets)?;
                                *cell = Cell::Value(phandle.into());
                            }
                        }
                    }
                    Fragment::Reference(r) => {
                        let value = match kind {
                            ReferenceKind::Phandle => {
                                Fragment::Cells(CellArray::from_u32(&[self.phandle_of(r, targets)?]))
                            }
                            ReferenceKind::Path => Fragment::Str(
                                targets.get(&r.target).ok_or_else(|| r.unresolved())?.clone(),
                            ),
                        };
                        *fragment = value;
                    }
                    Fragment::Str(_) | Fragment::Bytes(_) => {}
                }
            }
        }

        for child in &mut node.children {
            self.rewrite(child, targets)?;
        }

        Ok(())
    }

    fn phandle_of(&self, r: &Reference, targets: &HashMap<RefTarget, String>) -> Result<u32> {
        targets
            .get(&r.target)
            .and_then(|path| self.symbols.phandle(path))
            .ok_or_else(|| r.unresolved())
    }
}

/// The value of an explicit `phandle` or `linux,phandle` property, and where it is set.
fn explicit_phandle(node: &Node, path: &str) -> Result<Option<(u32, Position)>> {
    let Some(prop) = node
        .property(PHANDLE)
        .or_else(|| node.property(LINUX_PHANDLE))
    else {
        return Ok(None);
    };

    match prop.as_u32() {
        Some(v) if v != 0 && v != u32::MAX => Ok(Some((v, prop.position))),
        _ => Err(Error::InvalidPhandle {
            path: path.to_string(),
            property: prop.name.clone(),
            position: prop.position,
        }),
    }
}

/// Remove `/omit-if-no-ref/` nodes when neither they nor their descendants are referenced.
fn omit_unreferenced(node: &mut Node, path: &str, referenced: &HashSet<&str>) {
    node.children.retain(|child| {
        if !child.omit_if_no_ref {
            return true;
        }

        let path = child_path(path, &child.full_name());
        let prefix = format!("{path}/");
        let keep = referenced
            .iter()
            .any(|r| *r == path || r.starts_with(&prefix));
        if !keep {
            log::debug!("omitting unreferenced node {path}");
        }
        keep
    });

    for child in &mut node.children {
        let path = child_path(path, &child.full_name());
        omit_unreferenced(child, &path, referenced);
    }
}

/* === Unit Tests === */
