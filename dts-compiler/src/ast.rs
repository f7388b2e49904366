use std::fmt;

use crate::error::{Error, Position, Result};

/// Name of the explicit phandle property.
pub const PHANDLE: &str = "phandle";
/// Legacy spelling of the phandle property, still honoured when present.
pub const LINUX_PHANDLE: &str = "linux,phandle";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DtsVersion {
    #[default]
    V0,
    V1,
}

/// A parsed device tree source document.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dts {
    pub version: DtsVersion,
    /// `(address, size)` pairs from `/memreserve/` directives, in source order.
    pub memreserves: Vec<(u64, u64)>,
    pub root: Node,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Node {
    /// Node name without the unit address. Empty for the root node.
    pub name: String,
    pub unit_address: Option<String>,
    pub labels: Vec<Label>,
    pub properties: Vec<Property>,
    pub children: Vec<Node>,
    /// Handle assigned by the resolver, or taken from an explicit `phandle` property.
    pub phandle: Option<u32>,
    /// Drop the node at resolution time unless something references it.
    pub omit_if_no_ref: bool,
}

impl Node {
    pub fn new(name: impl Into<String>, unit_address: Option<String>) -> Self {
        Self {
            name: name.into(),
            unit_address,
            ..Default::default()
        }
    }

    /// The name as it appears in paths and in the blob, i.e. `name@unit-address`.
    pub fn full_name(&self) -> String {
        match &self.unit_address {
            Some(addr) => format!("{}@{}", self.name, addr),
            None => self.name.clone(),
        }
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn child(&self, full_name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.full_name() == full_name)
    }

    fn child_mut(&mut self, full_name: &str) -> Option<&mut Node> {
        self.children.iter_mut().find(|c| c.full_name() == full_name)
    }

    /// Add a property, replacing the value of an existing one with the same name.
    ///
    /// A replaced property keeps its original position among its siblings.
    pub fn set_property(&mut self, prop: Property) {
        match self.properties.iter_mut().find(|p| p.name == prop.name) {
            Some(existing) => {
                existing.value = prop.value;
                existing.position = prop.position;
            }
            None => self.properties.push(prop),
        }
    }

    pub fn remove_property(&mut self, name: &str) -> bool {
        let len = self.properties.len();
        self.properties.retain(|p| p.name != name);
        self.properties.len() != len
    }

    pub fn remove_child(&mut self, full_name: &str) -> bool {
        let len = self.children.len();
        self.children.retain(|c| c.full_name() != full_name);
        self.children.len() != len
    }

    /// Find the child with the given name, creating it if it does not exist yet.
    ///
    /// Later definitions of a node amend the earlier one through this lookup.
    pub fn child_or_insert(&mut self, name: &str, unit_address: Option<&str>) -> &mut Node {
        let index = self
            .children
            .iter()
            .position(|c| c.name == name && c.unit_address.as_deref() == unit_address);

        let index = match index {
            Some(i) => {
                log::trace!("amending existing node '{}'", self.children[i].full_name());
                i
            }
            None => {
                self.children
                    .push(Node::new(name, unit_address.map(str::to_string)));
                self.children.len() - 1
            }
        };

        &mut self.children[index]
    }

    /// Attach `label`, unless the node already carries it.
    pub fn add_label(&mut self, label: &str, position: Position) {
        if !self.labels.iter().any(|l| l.name == label) {
            self.labels.push(Label {
                name: label.to_string(),
                position,
            });
        }
    }

    /// Look up a node by absolute path, e.g. `/cpus/cpu@0`.
    pub fn find(&self, path: &str) -> Option<&Node> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(self, |node, name| node.child(name))
    }

    pub fn find_mut(&mut self, path: &str) -> Option<&mut Node> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(self, |node, name| node.child_mut(name))
    }

    /// Path of the first node, in pre-order, carrying `label`.
    pub fn find_label(&self, label: &str) -> Option<String> {
        let mut found = None;
        self.walk(&mut |path, node| {
            if found.is_none() && node.labels.iter().any(|l| l.name == label) {
                found = Some(path.to_string());
            }
        });
        found
    }

    /// Visit this node and all of its descendants in pre-order, along with their paths.
    pub fn walk<F>(&self, f: &mut F)
    where
        F: FnMut(&str, &Node),
    {
        fn go<F: FnMut(&str, &Node)>(node: &Node, path: &str, f: &mut F) {
            f(path, node);
            for child in &node.children {
                go(child, &child_path(path, &child.full_name()), f);
            }
        }

        go(self, "/", f)
    }
}

/// A label attached to a node, e.g. `uart0:` in `uart0: serial@1000 { ... };`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub name: String,
    /// Where the label was first attached.
    pub position: Position,
}

impl PartialEq<&str> for Label {
    fn eq(&self, other: &&str) -> bool {
        self.name == *other
    }
}

/// Path of a child named `name` below the node at `parent`.
pub(crate) fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    /// Value fragments, concatenated on encoding. Empty for boolean properties.
    pub value: Vec<Fragment>,
    /// Position of the name in the source, or the default for generated properties.
    pub position: Position,
}

impl Property {
    pub fn new(name: impl Into<String>, value: Vec<Fragment>) -> Self {
        Self {
            name: name.into(),
            value,
            position: Position::default(),
        }
    }

    pub fn at(self, position: Position) -> Self {
        Self { position, ..self }
    }

    /// A single 32-bit cell property, such as `phandle = <1>`.
    pub fn cell(name: impl Into<String>, value: u32) -> Self {
        Self::new(name, vec![Fragment::Cells(CellArray::from_u32(&[value]))])
    }

    /// Encode the value as it will appear in the blob.
    ///
    /// Fails if the property still contains a symbolic reference.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        for fragment in &self.value {
            fragment.encode_into(&mut buf)?;
        }
        Ok(buf)
    }

    /// The encoded value as 32-bit cells, if it is a whole number of cells.
    pub fn cells(&self) -> Option<Vec<u32>> {
        let bytes = self.encode().ok()?;
        if bytes.len() % 4 != 0 {
            return None;
        }
        Some(
            bytes
                .chunks_exact(4)
                .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    /// The value as a single 32-bit cell.
    pub fn as_u32(&self) -> Option<u32> {
        match self.cells()?.as_slice() {
            [v] => Some(*v),
            _ => None,
        }
    }

    /// Symbolic references in the value, in source order.
    pub fn references(&self) -> impl Iterator<Item = &Reference> {
        self.value.iter().flat_map(Fragment::references)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Str(String),
    Cells(CellArray),
    Bytes(Vec<u8>),
    /// A reference used as a value of its own, e.g. `serial0 = &uart0;`.
    Reference(Reference),
}

impl Fragment {
    fn references(&self) -> Vec<&Reference> {
        match self {
            Fragment::Reference(r) => vec![r],
            Fragment::Cells(a) => a
                .cells
                .iter()
                .filter_map(|c| match c {
                    Cell::Reference(r) => Some(r),
                    Cell::Value(_) => None,
                })
                .collect(),
            Fragment::Str(_) | Fragment::Bytes(_) => vec![],
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Fragment::Str(s) => {
                buf.extend_from_slice(s.as_bytes());
                buf.push(0);
            }
            Fragment::Cells(a) => a.encode_into(buf)?,
            Fragment::Bytes(b) => buf.extend_from_slice(b),
            Fragment::Reference(r) => return Err(r.unresolved()),
        }
        Ok(())
    }
}

/// A `<...>` array whose elements are `bits` wide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellArray {
    pub bits: u32,
    pub cells: Vec<Cell>,
}

impl CellArray {
    pub fn from_u32(values: &[u32]) -> Self {
        Self {
            bits: 32,
            cells: values.iter().map(|&v| Cell::Value(v.into())).collect(),
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        for cell in &self.cells {
            let v = match cell {
                Cell::Value(v) => *v,
                Cell::Reference(r) => return Err(r.unresolved()),
            };
            // Values were range checked against `bits` when parsed.
            match self.bits {
                8 => buf.push(v as u8),
                16 => buf.extend_from_slice(&(v as u16).to_be_bytes()),
                64 => buf.extend_from_slice(&v.to_be_bytes()),
                _ => buf.extend_from_slice(&(v as u32).to_be_bytes()),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Value(u64),
    Reference(Reference),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub target: RefTarget,
    pub position: Position,
}

impl Reference {
    pub(crate) fn unresolved(&self) -> Error {
        Error::UnresolvedReference {
            label: self.target.to_string(),
            position: self.position,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefTarget {
    /// `&label`
    Label(String),
    /// `&{/path/to@node}`
    Path(String),
}

impl fmt::Display for RefTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefTarget::Label(l) => f.write_str(l),
            RefTarget::Path(p) => f.write_str(p),
        }
    }
}

/// An integer expression found between parentheses in a cell array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Lit(u64),
    Unary(UnaryOperator, Box<Expression>),
    Binary(Box<Expression>, BinaryOperator, Box<Expression>),
    Ternary {
        cond: Box<Expression>,
        left: Box<Expression>,
        right: Box<Expression>,
    },
}

impl Expression {
    /// Evaluate with 64-bit wrapping arithmetic.
    ///
    /// Returns `None` on division or modulo by zero.
    pub fn eval(&self) -> Option<u64> {
        Some(match self {
            Expression::Lit(v) => *v,
            Expression::Unary(op, e) => op.eval(e.eval()?),
            Expression::Binary(l, op, r) => op.eval(l.eval()?, r.eval()?)?,
            Expression::Ternary { cond, left, right } => {
                if cond.eval()? != 0 {
                    left.eval()?
                } else {
                    right.eval()?
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Neg,
    BitNot,
    LogicalNot,
}

impl UnaryOperator {
    fn eval(self, v: u64) -> u64 {
        match self {
            UnaryOperator::Neg => v.wrapping_neg(),
            UnaryOperator::BitNot => !v,
            UnaryOperator::LogicalNot => (v == 0) as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    LShift,
    RShift,
    BitAnd,
    BitOr,
    BitXor,
    And,
    Or,
    Eq,
    Neq,
    Lt,
    Gt,
    Le,
    Ge,
}

impl BinaryOperator {
    fn eval(self, l: u64, r: u64) -> Option<u64> {
        Some(match self {
            BinaryOperator::Add => l.wrapping_add(r),
            BinaryOperator::Sub => l.wrapping_sub(r),
            BinaryOperator::Mul => l.wrapping_mul(r),
            BinaryOperator::Div => l.checked_div(r)?,
            BinaryOperator::Mod => l.checked_rem(r)?,
            BinaryOperator::LShift => l.checked_shl(r as u32).unwrap_or(0),
            BinaryOperator::RShift => l.checked_shr(r as u32).unwrap_or(0),
            BinaryOperator::BitAnd => l & r,
            BinaryOperator::BitOr => l | r,
            BinaryOperator::BitXor => l ^ r,
            BinaryOperator::And => (l != 0 && r != 0) as u64,
            BinaryOperator::Or => (l != 0 || r != 0) as u64,
            BinaryOperator::Eq => (l == r) as u64,
            BinaryOperator::Neq => (l != r) as u64,
            BinaryOperator::Lt => (l < r) as u64,
            BinaryOperator::Gt => (l > r) as u64,
            BinaryOperator::Le => (l <= r) as u64,
            BinaryOperator::Ge => (l >= r) as u64,
        })
    }
}
