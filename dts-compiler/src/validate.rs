use std::collections::HashMap;

use crate::ast::{child_path, Node, Property, PHANDLE};
use crate::error::Diagnostic;

/// The `#address-cells` and `#size-cells` values in effect for the children of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellContext {
    pub address_cells: u32,
    pub size_cells: u32,
}

impl Default for CellContext {
    fn default() -> Self {
        Self {
            address_cells: 2,
            size_cells: 1,
        }
    }
}

impl CellContext {
    /// The context `node` establishes for its children.
    fn below(self, node: &Node) -> Self {
        let get = |name| node.property(name).and_then(Property::as_u32);

        Self {
            address_cells: get("#address-cells").unwrap_or(self.address_cells),
            size_cells: get("#size-cells").unwrap_or(self.size_cells),
        }
    }
}

/// Check the shape of `reg`, `ranges` and `interrupts-extended` throughout a
/// resolved tree.
///
/// `root_context` applies where no ancestor sets `#address-cells` or
/// `#size-cells`. The tree is left untouched, problems are only reported.
pub fn validate(root: &Node, root_context: CellContext) -> Vec<Diagnostic> {
    let mut validator = Validator {
        phandles: HashMap::new(),
        diagnostics: vec![],
    };
    validator.index(root, "/");
    validator.node(root, "/", root_context);

    log::debug!("validation found {} problems", validator.diagnostics.len());
    validator.diagnostics
}

struct Validator<'t> {
    phandles: HashMap<u32, (String, &'t Node)>,
    diagnostics: Vec<Diagnostic>,
}

impl<'t> Validator<'t> {
    /// Record which node carries each phandle.
    fn index(&mut self, node: &'t Node, path: &str) {
        let phandle = node
            .phandle
            .or_else(|| node.property(PHANDLE).and_then(Property::as_u32));
        if let Some(phandle) = phandle {
            self.phandles.entry(phandle).or_insert((path.to_string(), node));
        }

        for child in &node.children {
            self.index(child, &child_path(path, &child.full_name()));
        }
    }

    /// Validate `node`, whose parent established `context`.
    fn node(&mut self, node: &'t Node, path: &str, context: CellContext) {
        let own = context.below(node);

        for prop in &node.properties {
            match prop.name.as_str() {
                "reg" => {
                    let width = context.address_cells + context.size_cells;
                    self.multiple_of(path, prop, width);
                }
                "ranges" if !prop.value.is_empty() => {
                    let width = own.address_cells + context.address_cells + own.size_cells;
                    self.multiple_of(path, prop, width);
                }
                "interrupts-extended" => self.interrupts_extended(path, prop),
                _ => {}
            }
        }

        for child in &node.children {
            self.node(child, &child_path(path, &child.full_name()), own);
        }
    }

    fn cells(&mut self, path: &str, prop: &Property) -> Option<Vec<u32>> {
        let cells = prop.cells();
        if cells.is_none() {
            self.diagnostics.push(Diagnostic::UnalignedCells {
                node_path: path.to_string(),
                property: prop.name.clone(),
                len: prop.encode().map_or(0, |b| b.len()),
            });
        }
        cells
    }

    fn multiple_of(&mut self, path: &str, prop: &Property, width: u32) {
        let Some(cells) = self.cells(path, prop) else {
            return;
        };

        let width = width as usize;
        if width == 0 || cells.len() % width == 0 {
            return;
        }

        self.diagnostics.push(Diagnostic::CellWidthMismatch {
            node_path: path.to_string(),
            property: prop.name.clone(),
            expected_multiple: width,
            found: cells.len(),
        });
    }

    /// Walk `(phandle, specifier...)` groups, sized by each target's `#interrupt-cells`.
    fn interrupts_extended(&mut self, path: &str, prop: &Property) {
        let Some(cells) = self.cells(path, prop) else {
            return;
        };

        let mut rest = &cells[..];
        while let [phandle, specifier @ ..] = rest {
            let Some((target, node)) = self.phandles.get(phandle) else {
                self.diagnostics.push(Diagnostic::UnknownInterruptParent {
                    node_path: path.to_string(),
                    property: prop.name.clone(),
                    phandle: *phandle,
                });
                return;
            };

            let Some(n) = node.property("#interrupt-cells").and_then(Property::as_u32) else {
                self.diagnostics.push(Diagnostic::MissingInterruptCells {
                    node_path: path.to_string(),
                    property: prop.name.clone(),
                    target: target.clone(),
                });
                return;
            };

            let n = n as usize;
            if specifier.len() < n {
                self.diagnostics.push(Diagnostic::CellWidthMismatch {
                    node_path: path.to_string(),
                    property: prop.name.clone(),
                    expected_multiple: n + 1,
                    found: cells.len(),
                });
                return;
            }

            rest = &specifier[n..];
        }
    }
}

/* === Unit Tests === */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;
    use crate::resolver::{resolve, DefaultPolicy};

    fn diagnostics(input: &str) -> Vec<Diagnostic> {
        let mut dts = parser::from_str(input).unwrap();
        resolve(&mut dts, &DefaultPolicy).unwrap();
        validate(&dts.root, CellContext::default())
    }

    fn mismatch(node_path: &str, property: &str, expected_multiple: usize, found: usize) -> Diagnostic {
        Diagnostic::CellWidthMismatch {
            node_path: node_path.into(),
            property: property.into(),
            expected_multiple,
            found,
        }
    }

    #[test]
    fn reg_width() {
        for (reg, exp) in [
            ("<0x1000 0x1000>", vec![]),
            ("<0x1000 0x1000 0x2000 0x10>", vec![]),
            ("<>", vec![]),
            ("<0x1000 0x1000 0x1>", vec![mismatch("/dev@1000", "reg", 2, 3)]),
            ("<0x1000>", vec![mismatch("/dev@1000", "reg", 2, 1)]),
        ] {
            let input = format!(
                "/ {{ #address-cells = <1>; #size-cells = <1>; dev@1000 {{ reg = {reg}; }}; }};"
            );
            assert_eq!(diagnostics(&input), exp, "{reg}");
        }
    }

    #[test]
    fn reg_uses_nearest_ancestor_context() {
        let input = r#"/ {
            #address-cells = <2>;
            #size-cells = <2>;
            memory@0 { reg = <0 0 0 0x1000>; };
            soc {
                #address-cells = <1>;
                bus {
                    uart@1000 { reg = <0x1000 0 0x100>; };
                    spi@2000 { reg = <0x2000 0x100>; };
                };
            };
        };"#;

        assert_eq!(
            diagnostics(input),
            [mismatch("/soc/bus/spi@2000", "reg", 3, 2)]
        );
    }

    #[test]
    fn default_root_context() {
        let input = "/ { dev@0 { reg = <0 0 0x1000>; }; other@0 { reg = <0 0x1000>; }; };";
        assert_eq!(diagnostics(input), [mismatch("/other@0", "reg", 3, 2)]);

        let dts = parser::from_str(input).unwrap();
        let context = CellContext {
            address_cells: 1,
            size_cells: 1,
        };
        assert_eq!(validate(&dts.root, context), [mismatch("/dev@0", "reg", 2, 3)]);
    }

    #[test]
    fn ranges_width() {
        let input = r#"/ {
            #address-cells = <1>;
            #size-cells = <1>;
            soc {
                #address-cells = <2>;
                #size-cells = <1>;
                ranges = <0 0x1000 0x2000 0x100>;
            };
            bus {
                ranges;
            };
            broken {
                #address-cells = <1>;
                ranges = <0 0x1000 0x100 0>;
            };
        };"#;

        assert_eq!(diagnostics(input), [mismatch("/broken", "ranges", 3, 4)]);
    }

    #[test]
    fn unaligned_cells() {
        let input = r#"/ { #address-cells = <1>; #size-cells = <0>; dev@0 { reg = [00 01 02]; }; };"#;
        assert_eq!(
            diagnostics(input),
            [Diagnostic::UnalignedCells {
                node_path: "/dev@0".into(),
                property: "reg".into(),
                len: 3,
            }]
        );
    }

    #[test]
    fn interrupts_extended() {
        let input = r#"/ {
            #address-cells = <1>;
            #size-cells = <0>;
            L11: interrupt-controller {
                #interrupt-cells = <1>;
                interrupt-controller;
            };
            gic: gic {
                #interrupt-cells = <3>;
            };
            plain: plain { };
            ok { interrupts-extended = <&L11 3 &gic 0 1 4 &L11 7>; };
            short { interrupts-extended = <&L11 3 &gic 0 1>; };
            missing { interrupts-extended = <&plain 1>; };
            unknown { interrupts-extended = <0x42 1>; };
        };"#;

        assert_eq!(
            diagnostics(input),
            [
                mismatch("/short", "interrupts-extended", 4, 5),
                Diagnostic::MissingInterruptCells {
                    node_path: "/missing".into(),
                    property: "interrupts-extended".into(),
                    target: "/plain".into(),
                },
                Diagnostic::UnknownInterruptParent {
                    node_path: "/unknown".into(),
                    property: "interrupts-extended".into(),
                    phandle: 0x42,
                },
            ]
        );
    }
}
