use std::mem;

use crate::ast::*;
use crate::error::{Error, ParseError, Position, Result};
use crate::lexer::{Lexer, Mode, Spanned, Token};

/// Parse a Device Tree from a string.
///
/// Repeated definitions of the same node, either through a second `/ { ... };`
/// block or through a `&label { ... };` override, are merged into a single tree.
/// References are left unresolved.
pub fn from_str(s: &str) -> Result<Dts> {
    let mut parser = Parser {
        lexer: Lexer::new(s),
        dts: Dts::default(),
        deferred: vec![],
    };

    let mut has_root = false;
    while let Some(token) = parser.next(Mode::Structure)? {
        has_root |= parser.top_level(token)?;
    }

    if !has_root {
        return Err(parser.unexpected("a root node '/ { ... };'", None));
    }

    log::debug!(
        "parsed device tree with {} top-level nodes and {} memory reservations",
        parser.dts.root.children.len(),
        parser.dts.memreserves.len()
    );

    Ok(parser.dts)
}

struct Parser<'s> {
    lexer: Lexer<'s>,
    dts: Dts,
    /// `/delete-node/ &ref;` statements found inside a node body, applied once
    /// the body has been parsed.
    deferred: Vec<Spanned<'s>>,
}

impl<'s> Parser<'s> {
    /// Parse one top-level statement starting with `token`.
    ///
    /// Returns whether the statement defined the root node.
    fn top_level(&mut self, token: Spanned<'s>) -> Result<bool> {
        match token {
            (Token::Version, _) => {
                self.terminator()?;
                self.dts.version = DtsVersion::V1;
            }
            (Token::MemReserve, _) => {
                let address = self.number()?;
                let size = self.number()?;
                self.terminator()?;
                self.dts.memreserves.push((address, size));
            }
            (Token::Ctrl('/'), _) => {
                self.amend("/", &[])?;
                return Ok(true);
            }
            (Token::Label(label), position) => {
                let mut labels = vec![(label, position)];
                let target = loop {
                    match self.next(Mode::Structure)? {
                        Some((Token::Label(label), position)) => labels.push((label, position)),
                        Some((Token::Ctrl('/'), _)) => {
                            self.amend("/", &labels)?;
                            return Ok(true);
                        }
                        Some(token @ (Token::Ref(_) | Token::PathRef(_), _)) => break token,
                        other => return Err(self.unexpected("a node reference", other)),
                    }
                };
                let path = self.lookup(target)?;
                self.amend(&path, &labels)?;
            }
            token @ (Token::Ref(_) | Token::PathRef(_), _) => {
                let path = self.lookup(token)?;
                self.amend(&path, &[])?;
            }
            (Token::DeleteNode, _) => {
                let target = self.next(Mode::Structure)?;
                let path = match target {
                    Some(token @ (Token::Ref(_) | Token::PathRef(_), _)) => self.lookup(token)?,
                    other => return Err(self.unexpected("a node reference", other)),
                };
                self.terminator()?;
                self.delete_node(&path);
            }
            (Token::OmitIfNoRef, _) => {
                let target = self.next(Mode::Structure)?;
                let path = match target {
                    Some(token @ (Token::Ref(_) | Token::PathRef(_), _)) => self.lookup(token)?,
                    other => return Err(self.unexpected("a node reference", other)),
                };
                self.terminator()?;
                if let Some(node) = self.dts.root.find_mut(&path) {
                    node.omit_if_no_ref = true;
                }
            }
            token @ (Token::Include | Token::Plugin, _) => {
                return Err(self.unexpected("preprocessed, non-overlay source", Some(token)));
            }
            other => return Err(self.unexpected("a root node or a directive", Some(other))),
        }

        Ok(false)
    }

    /// Parse a node body and apply it to the already defined node at `path`.
    fn amend(&mut self, path: &str, labels: &[(&str, Position)]) -> Result<()> {
        let mut root = mem::take(&mut self.dts.root);
        let res = match root.find_mut(path) {
            Some(node) => {
                for &(label, position) in labels {
                    node.add_label(label, position);
                }
                self.node_body(node)
            }
            None => Err(Error::UnresolvedReference {
                label: path.to_string(),
                position: self.lexer.position(),
            }),
        };
        self.dts.root = root;
        res?;

        for target in mem::take(&mut self.deferred) {
            let path = self.lookup(target)?;
            self.delete_node(&path);
        }

        self.terminator()
    }

    /// Path of the node a `&label` or `&{/path}` token designates.
    fn lookup(&self, (token, position): Spanned<'s>) -> Result<String> {
        let (name, path) = match token {
            Token::Ref(label) => (label, self.dts.root.find_label(label)),
            Token::PathRef(path) => (
                path,
                self.dts.root.find(path).map(|_| path.to_string()),
            ),
            other => return Err(self.unexpected("a node reference", Some((other, position)))),
        };

        path.ok_or_else(|| Error::UnresolvedReference {
            label: name.to_string(),
            position,
        })
    }

    fn delete_node(&mut self, path: &str) {
        let Some((parent, name)) = path.rsplit_once('/') else {
            return;
        };

        if name.is_empty() {
            // Deleting the root node clears the whole tree.
            self.dts.root = Node::default();
        } else if let Some(parent) = self.dts.root.find_mut(parent) {
            parent.remove_child(name);
        }
    }

    /// Parse the body of a device tree node into `node`.
    ///
    /// Properties overwrite existing ones with the same name and child nodes are
    /// merged into existing children with the same name.
    fn node_body(&mut self, node: &mut Node) -> Result<()> {
        self.expect(Mode::Structure, '{')?;

        loop {
            let token = self.next(Mode::Structure)?;
            match token {
                Some((Token::Ctrl('}'), _)) => return Ok(()),
                Some((Token::DeleteProp, _)) => {
                    let name = self.property_name()?;
                    self.terminator()?;
                    node.remove_property(name);
                }
                Some((Token::DeleteNode, _)) => match self.next(Mode::Structure)? {
                    Some((Token::Name(name), _)) => {
                        self.terminator()?;
                        node.remove_child(name);
                    }
                    Some(target @ (Token::Ref(_) | Token::PathRef(_), _)) => {
                        self.terminator()?;
                        self.deferred.push(target);
                    }
                    other => return Err(self.unexpected("a node name or reference", other)),
                },
                Some((Token::OmitIfNoRef, _)) => {
                    let (labels, name) = self.labelled_name()?;
                    self.child_node(node, &labels, name, true)?;
                }
                Some((Token::Label(label), position)) => {
                    let (mut labels, (name, name_position)) = self.labelled_name()?;
                    labels.insert(0, (label, position));
                    match self.peek(Mode::Structure)? {
                        Some((Token::Ctrl('{'), _)) => {
                            self.child_node(node, &labels, (name, name_position), false)?
                        }
                        // Property labels are dropped.
                        _ => {
                            let prop = self.property(name, name_position)?;
                            node.set_property(prop);
                        }
                    }
                }
                Some((Token::Name(name), position)) => match self.peek(Mode::Structure)? {
                    Some((Token::Ctrl('{'), _)) => self.child_node(node, &[], (name, position), false)?,
                    _ => {
                        let prop = self.property(name, position)?;
                        node.set_property(prop);
                    }
                },
                other => return Err(self.unexpected("a property or a child node", other)),
            }
        }
    }

    /// Parse zero or more labels followed by a node name.
    fn labelled_name(&mut self) -> Result<(Vec<(&'s str, Position)>, (&'s str, Position))> {
        let mut labels = vec![];
        loop {
            match self.next(Mode::Structure)? {
                Some((Token::Label(label), position)) => labels.push((label, position)),
                Some((Token::Name(name), position)) => return Ok((labels, (name, position))),
                other => return Err(self.unexpected("a node name", other)),
            }
        }
    }

    /// Parse a child node definition, merging it into an existing child with the same name.
    fn child_node(
        &mut self,
        parent: &mut Node,
        labels: &[(&str, Position)],
        (name, position): (&str, Position),
        omit_if_no_ref: bool,
    ) -> Result<()> {
        let (base, unit) = match name.split_once('@') {
            Some((base, unit)) => (base, Some(unit)),
            None => (name, None),
        };

        let valid_char = |c: char| c.is_ascii_alphanumeric() || ",._+-".contains(c);
        let unit_ok = unit.map_or(true, |u| !u.is_empty() && u.chars().all(valid_char));
        if base.is_empty() || !base.chars().all(valid_char) || !unit_ok {
            return Err(ParseError {
                position,
                expected: "a node name".into(),
                found: format!("'{name}'"),
            }
            .into());
        }

        let child = parent.child_or_insert(base, unit);
        for &(label, position) in labels {
            child.add_label(label, position);
        }
        child.omit_if_no_ref |= omit_if_no_ref;

        self.node_body(child)?;
        self.terminator()
    }

    /// Parse the rest of a node property whose name has already been consumed.
    fn property(&mut self, name: &str, position: Position) -> Result<Property> {
        if name.contains('@') {
            return Err(ParseError {
                position,
                expected: "a property name".into(),
                found: format!("'{name}'"),
            }
            .into());
        }

        match self.next(Mode::Structure)? {
            Some((Token::Ctrl(';'), _)) => Ok(Property::new(name, vec![]).at(position)),
            Some((Token::Ctrl('='), _)) => {
                let mut value = vec![self.prop_value()?];
                loop {
                    match self.next(Mode::Structure)? {
                        Some((Token::Ctrl(','), _)) => value.push(self.prop_value()?),
                        Some((Token::Ctrl(';'), _)) => break,
                        other => return Err(self.unexpected("',' or ';'", other)),
                    }
                }
                Ok(Property::new(name, value).at(position))
            }
            other => Err(self.unexpected("'=' or ';'", other)),
        }
    }

    fn property_name(&mut self) -> Result<&'s str> {
        match self.next(Mode::Structure)? {
            Some((Token::Name(name), _)) => Ok(name),
            other => Err(self.unexpected("a property name", other)),
        }
    }

    /// Parse a single property value fragment.
    fn prop_value(&mut self) -> Result<Fragment> {
        match self.next(Mode::Structure)? {
            Some((Token::Str(s), _)) => Ok(Fragment::Str(s)),
            Some((Token::Ctrl('<'), _)) => Ok(Fragment::Cells(self.cell_array(32)?)),
            Some((Token::Bits, _)) => {
                let bits = match self.next(Mode::Cells)? {
                    Some((Token::Num(n @ (8 | 16 | 32 | 64)), _)) => n as u32,
                    other => return Err(self.unexpected("8, 16, 32 or 64", other)),
                };
                self.expect(Mode::Structure, '<')?;
                Ok(Fragment::Cells(self.cell_array(bits)?))
            }
            Some((Token::Ctrl('['), _)) => self.byte_string(),
            Some((Token::Ref(label), position)) => Ok(Fragment::Reference(Reference {
                target: RefTarget::Label(label.to_string()),
                position,
            })),
            Some((Token::PathRef(path), position)) => Ok(Fragment::Reference(Reference {
                target: RefTarget::Path(path.to_string()),
                position,
            })),
            other => Err(self.unexpected("a property value", other)),
        }
    }

    /// Parse the cells of a `<...>` array, after the opening chevron.
    fn cell_array(&mut self, bits: u32) -> Result<CellArray> {
        let max = if bits == 64 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        };
        let mut cells = vec![];

        loop {
            let token = self.next(Mode::Cells)?;
            match token {
                Some((Token::Ctrl('>'), _)) => break,
                // Labels inside a cell array are accepted and dropped.
                Some((Token::Label(_), _)) => {}
                Some((Token::Num(n), position)) => {
                    if n > max {
                        return Err(ParseError {
                            position,
                            expected: format!("a value that fits in {bits} bits"),
                            found: format!("{n:#x}"),
                        }
                        .into());
                    }
                    cells.push(Cell::Value(n));
                }
                Some((Token::Ctrl('('), position)) => {
                    let expr = self.expression()?;
                    self.expect(Mode::Cells, ')')?;
                    let value = expr.eval().ok_or_else(|| {
                        Error::from(ParseError {
                            position,
                            expected: "an expression without division by zero".into(),
                            found: "division by zero".into(),
                        })
                    })?;
                    cells.push(Cell::Value(value & max));
                }
                Some((Token::Ref(_) | Token::PathRef(_), _)) if bits != 32 => {
                    return Err(self.unexpected("a number in a non 32-bit array", token));
                }
                Some((Token::Ref(label), position)) => cells.push(Cell::Reference(Reference {
                    target: RefTarget::Label(label.to_string()),
                    position,
                })),
                Some((Token::PathRef(path), position)) => cells.push(Cell::Reference(Reference {
                    target: RefTarget::Path(path.to_string()),
                    position,
                })),
                other => return Err(self.unexpected("a cell value or '>'", other)),
            }
        }

        Ok(CellArray { bits, cells })
    }

    /// Parse the bytes of a `[...]` byte string, after the opening bracket.
    fn byte_string(&mut self) -> Result<Fragment> {
        let mut bytes = vec![];
        loop {
            match self.next(Mode::Bytes)? {
                Some((Token::Byte(b), _)) => bytes.push(b),
                Some((Token::Ctrl(']'), _)) => return Ok(Fragment::Bytes(bytes)),
                other => return Err(self.unexpected("a byte or ']'", other)),
            }
        }
    }

    /* === Integer expressions === */

    /// Parse an integer expression found between parentheses in a cell array.
    fn expression(&mut self) -> Result<Expression> {
        let cond = self.binary_expr(0)?;
        if !self.eat_op("?")? {
            return Ok(cond);
        }

        let left = self.expression()?;
        if !self.eat_op(":")? {
            let found = self.peek(Mode::Cells)?;
            return Err(self.unexpected("':'", found));
        }
        let right = self.expression()?;

        Ok(Expression::Ternary {
            cond: Box::new(cond),
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    /// Parse a chain of binary operators binding at least as tight as `min_prec`.
    fn binary_expr(&mut self, min_prec: u8) -> Result<Expression> {
        let mut lhs = self.unary_expr()?;

        while let Some((op, prec)) = self.peek_binary_op()? {
            if prec < min_prec {
                break;
            }
            self.next(Mode::Cells)?;
            let rhs = self.binary_expr(prec + 1)?;
            lhs = Expression::Binary(Box::new(lhs), op, Box::new(rhs));
        }

        Ok(lhs)
    }

    fn unary_expr(&mut self) -> Result<Expression> {
        let token = self.next(Mode::Cells)?;
        let op = match token {
            Some((Token::Op("-"), _)) => UnaryOperator::Neg,
            Some((Token::Op("~"), _)) => UnaryOperator::BitNot,
            Some((Token::Op("!"), _)) => UnaryOperator::LogicalNot,
            Some((Token::Num(n), _)) => return Ok(Expression::Lit(n)),
            Some((Token::Ctrl('('), _)) => {
                let expr = self.expression()?;
                self.expect(Mode::Cells, ')')?;
                return Ok(expr);
            }
            other => return Err(self.unexpected("an integer expression", other)),
        };

        Ok(Expression::Unary(op, Box::new(self.unary_expr()?)))
    }

    fn peek_binary_op(&mut self) -> Result<Option<(BinaryOperator, u8)>> {
        use BinaryOperator::*;

        let op = match self.peek(Mode::Cells)? {
            Some((Token::Op(op), _)) => op,
            // Inside parentheses a lone '>' is a comparison.
            Some((Token::Ctrl('>'), _)) => ">",
            _ => return Ok(None),
        };

        Ok(Some(match op {
            "||" => (Or, 1),
            "&&" => (And, 2),
            "|" => (BitOr, 3),
            "^" => (BitXor, 4),
            "&" => (BitAnd, 5),
            "==" => (Eq, 6),
            "!=" => (Neq, 6),
            "<" => (Lt, 7),
            ">" => (Gt, 7),
            "<=" => (Le, 7),
            ">=" => (Ge, 7),
            "<<" => (LShift, 8),
            ">>" => (RShift, 8),
            "+" => (Add, 9),
            "-" => (Sub, 9),
            "*" => (Mul, 10),
            "/" => (Div, 10),
            "%" => (Mod, 10),
            _ => return Ok(None),
        }))
    }

    fn eat_op(&mut self, op: &str) -> Result<bool> {
        match self.peek(Mode::Cells)? {
            Some((Token::Op(found), _)) if found == op => {
                self.next(Mode::Cells)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /* === Low-level helpers === */

    fn next(&mut self, mode: Mode) -> Result<Option<Spanned<'s>>> {
        Ok(self.lexer.next_token(mode)?)
    }

    fn peek(&mut self, mode: Mode) -> Result<Option<Spanned<'s>>> {
        Ok(self.lexer.peek_token(mode)?)
    }

    fn expect(&mut self, mode: Mode, c: char) -> Result<()> {
        match self.next(mode)? {
            Some((Token::Ctrl(found), _)) if found == c => Ok(()),
            other => Err(self.unexpected(&format!("'{c}'"), other)),
        }
    }

    /// Recognize a statement terminator.
    fn terminator(&mut self) -> Result<()> {
        self.expect(Mode::Structure, ';')
    }

    /// Parse an unsigned integer, as used by `/memreserve/`.
    fn number(&mut self) -> Result<u64> {
        match self.next(Mode::Cells)? {
            Some((Token::Num(n), _)) => Ok(n),
            other => Err(self.unexpected("an integer", other)),
        }
    }

    fn unexpected(&self, expected: &str, found: Option<Spanned<'_>>) -> Error {
        let (position, found) = match found {
            Some((token, position)) => (position, token.to_string()),
            None => (self.lexer.position(), "end of input".to_string()),
        };

        ParseError {
            position,
            expected: expected.to_string(),
            found,
        }
        .into()
    }
}

/* === Unit Tests === */
