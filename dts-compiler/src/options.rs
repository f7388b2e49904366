use std::fmt;
use std::sync::Arc;

use crate::resolver::{DefaultPolicy, ReferencePolicy};
use crate::validate::CellContext;

/// Settings for a single [`compile`](crate::compile) call.
#[derive(Clone)]
pub struct CompileOptions {
    /// Physical id of the boot CPU, stored in the blob header.
    pub boot_cpuid: u32,
    /// `(address, size)` reservations added after the `/memreserve/` entries of the source.
    pub reserved_memory: Vec<(u64, u64)>,
    /// `#address-cells` assumed where no ancestor defines it.
    pub default_address_cells: u32,
    /// `#size-cells` assumed where no ancestor defines it.
    pub default_size_cells: u32,
    /// Fail on the first validation diagnostic instead of returning it next to the blob.
    pub warnings_as_errors: bool,
    /// How standalone `&label` property values are encoded.
    pub reference_policy: Arc<dyn ReferencePolicy>,
}

impl CompileOptions {
    pub(crate) fn cell_context(&self) -> CellContext {
        CellContext {
            address_cells: self.default_address_cells,
            size_cells: self.default_size_cells,
        }
    }
}

impl Default for CompileOptions {
    fn default() -> Self {
        let cells = CellContext::default();

        Self {
            boot_cpuid: 0,
            reserved_memory: vec![],
            default_address_cells: cells.address_cells,
            default_size_cells: cells.size_cells,
            warnings_as_errors: false,
            reference_policy: Arc::new(DefaultPolicy),
        }
    }
}

impl fmt::Debug for CompileOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileOptions")
            .field("boot_cpuid", &self.boot_cpuid)
            .field("reserved_memory", &self.reserved_memory)
            .field("default_address_cells", &self.default_address_cells)
            .field("default_size_cells", &self.default_size_cells)
            .field("warnings_as_errors", &self.warnings_as_errors)
            .finish_non_exhaustive()
    }
}
