//! Compiler from Device Tree Source (DTS) text to flattened device tree (FDT) blobs.
//!
//! Compilation runs in four stages, each usable on its own:
//!
//! 1. [`parser::from_str`] builds a [`Dts`] document, merging repeated node definitions,
//! 2. [`resolve`] assigns phandles and replaces `&label` references,
//! 3. [`validate`] checks `reg`, `ranges` and `interrupts-extended` against the cell sizes in effect,
//! 4. [`fdt::serialize`] encodes the tree.
//!
//! [`compile`] chains all of them.

pub mod ast;
pub mod error;
pub mod fdt;
pub mod lexer;
pub mod options;
pub mod parser;
pub mod resolver;
pub mod validate;

pub use ast::Dts;
pub use error::{Diagnostic, Error, LexError, LexErrorKind, ParseError, Position, Result};
pub use options::CompileOptions;
pub use parser::from_str;
pub use resolver::{resolve, DefaultPolicy, ReferenceKind, ReferencePolicy, SymbolTable};
pub use validate::{validate, CellContext};

/// A compiled blob along with the validation problems found on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub blob: Vec<u8>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Compile DTS source text to a flattened device tree blob.
///
/// Syntax and reference errors abort compilation. Validation diagnostics are
/// returned next to the blob, unless [`CompileOptions::warnings_as_errors`] is
/// set, in which case the first one is returned as an error.
pub fn compile(source: &str, options: &CompileOptions) -> Result<Output> {
    let mut dts = parser::from_str(source)?;

    resolve(&mut dts, options.reference_policy.as_ref())?;

    let mut diagnostics = validate(&dts.root, options.cell_context());
    if options.warnings_as_errors && !diagnostics.is_empty() {
        return Err(Error::Validation(diagnostics.swap_remove(0)));
    }

    let blob = fdt::serialize(&dts, &options.reserved_memory, options.boot_cpuid)?;
    log::debug!(
        "compiled {} bytes of source into a {} byte blob",
        source.len(),
        blob.len()
    );

    Ok(Output { blob, diagnostics })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOARD: &str = r#"/dts-v1/;

/ {
    #address-cells = <1>;
    #size-cells = <1>;

    uart0: serial@1000 {
        reg = <0x1000 0x100 0x2000>;
        interrupt-parent = &intc;
    };

    intc: interrupt-controller@2000 {
        reg = <0x2000 0x100>;
        #interrupt-cells = <1>;
    };
};
"#;

    #[test]
    fn compile_reports_diagnostics() {
        let output = compile(BOARD, &CompileOptions::default()).unwrap();

        assert_eq!(fdt::FdtHeader::read(&output.blob).map(|h| h.version), Some(17));
        assert_eq!(
            output.diagnostics,
            [Diagnostic::CellWidthMismatch {
                node_path: "/serial@1000".into(),
                property: "reg".into(),
                expected_multiple: 2,
                found: 3,
            }]
        );
    }

    #[test]
    fn warnings_as_errors() {
        let options = CompileOptions {
            warnings_as_errors: true,
            ..Default::default()
        };

        assert!(matches!(
            compile(BOARD, &options),
            Err(Error::Validation(Diagnostic::CellWidthMismatch { found: 3, .. }))
        ));

        let fixed = BOARD.replace("0x100 0x2000>", "0x100>");
        assert!(compile(&fixed, &options).unwrap().diagnostics.is_empty());
    }

    #[test]
    fn default_cells_come_from_options() {
        let source = "/ { dev@0 { reg = <0 0x10>; }; };";

        assert_eq!(compile(source, &CompileOptions::default()).unwrap().diagnostics.len(), 1);

        let options = CompileOptions {
            default_address_cells: 1,
            default_size_cells: 1,
            ..Default::default()
        };
        assert!(compile(source, &options).unwrap().diagnostics.is_empty());
    }

    #[test]
    fn errors_abort_compilation() {
        for (source, line) in [
            ("/ { a = <1 };", Some(1)),
            ("/ {\n  a = <&missing>;\n};", Some(2)),
            ("/ {\n  a: x { };\n  a: y { };\n};", Some(3)),
            ("/ {\n  x { phandle = <1>; };\n  y { phandle = <1>; };\n};", Some(3)),
            ("/ {\n  x { phandle = <0>; };\n};", Some(2)),
        ] {
            let err = compile(source, &CompileOptions::default()).unwrap_err();
            assert_eq!(err.position().map(|p| p.line), line, "{source}");
        }
    }
}
