//! Flattened device tree (FDT) blob encoding.

use std::collections::HashMap;

use crate::ast::{Dts, Node};
use crate::error::{Error, Result};

/// Magic number found at the start of every blob.
pub const FDT_MAGIC: u32 = 0xd00d_feed;

pub const FDT_BEGIN_NODE: u32 = 0x0000_0001;
pub const FDT_END_NODE: u32 = 0x0000_0002;
pub const FDT_PROP: u32 = 0x0000_0003;
pub const FDT_END: u32 = 0x0000_0009;

/// Blob format version produced, and the oldest version it is compatible with.
pub const FDT_VERSION: u32 = 17;
pub const FDT_LAST_COMP_VERSION: u32 = 16;

const HEADER_SIZE: usize = 40;

/// Blob header, with every field in host byte order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FdtHeader {
    pub magic: u32,
    pub totalsize: u32,
    pub off_dt_struct: u32,
    pub off_dt_strings: u32,
    pub off_mem_rsvmap: u32,
    pub version: u32,
    pub last_comp_version: u32,
    pub boot_cpuid_phys: u32,
    pub size_dt_strings: u32,
    pub size_dt_struct: u32,
}

impl FdtHeader {
    fn fields(&self) -> [u32; 10] {
        [
            self.magic,
            self.totalsize,
            self.off_dt_struct,
            self.off_dt_strings,
            self.off_mem_rsvmap,
            self.version,
            self.last_comp_version,
            self.boot_cpuid_phys,
            self.size_dt_strings,
            self.size_dt_struct,
        ]
    }

    /// Decode the header at the start of `blob`.
    ///
    /// Returns `None` if the blob is too short or does not start with [`FDT_MAGIC`].
    pub fn read(blob: &[u8]) -> Option<Self> {
        let field = |i: usize| {
            let bytes = blob.get(i * 4..i * 4 + 4)?;
            Some(u32::from_be_bytes(bytes.try_into().ok()?))
        };

        let header = Self {
            magic: field(0)?,
            totalsize: field(1)?,
            off_dt_struct: field(2)?,
            off_dt_strings: field(3)?,
            off_mem_rsvmap: field(4)?,
            version: field(5)?,
            last_comp_version: field(6)?,
            boot_cpuid_phys: field(7)?,
            size_dt_strings: field(8)?,
            size_dt_struct: field(9)?,
        };

        (header.magic == FDT_MAGIC).then_some(header)
    }
}

/// Property names, deduplicated and stored in the order they are first seen.
#[derive(Debug, Default)]
struct StringTable {
    data: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl StringTable {
    /// Offset of `name` in the strings block, adding it if needed.
    fn offset(&mut self, name: &str) -> Result<u32> {
        if let Some(&offset) = self.offsets.get(name) {
            return Ok(offset);
        }

        let offset = checked("strings block", self.data.len())?;
        self.data.extend_from_slice(name.as_bytes());
        self.data.push(0);
        self.offsets.insert(name.to_string(), offset);
        Ok(offset)
    }
}

/// Encode a resolved tree as a flattened device tree blob.
///
/// The memory reservation block lists the `/memreserve/` entries of `dts`
/// followed by `reserved`. The output only depends on its inputs.
pub fn serialize(dts: &Dts, reserved: &[(u64, u64)], boot_cpuid: u32) -> Result<Vec<u8>> {
    let mut writer = StructWriter::default();
    writer.node(&dts.root)?;
    writer.u32(FDT_END);

    let reservations: Vec<_> = dts.memreserves.iter().chain(reserved).collect();
    let rsvmap_size = (reservations.len() + 1) * 16;
    let struct_size = writer.buf.len();
    let strings_size = writer.strings.data.len();

    let off_dt_struct = HEADER_SIZE + rsvmap_size;
    let off_dt_strings = off_dt_struct + struct_size;
    // The strings block is not padded, the blob end is.
    let totalsize = (off_dt_strings + strings_size).next_multiple_of(4);

    let header = FdtHeader {
        magic: FDT_MAGIC,
        totalsize: checked("blob", totalsize)?,
        off_dt_struct: checked("memory reservation block", off_dt_struct)?,
        off_dt_strings: checked("structure block", off_dt_strings)?,
        off_mem_rsvmap: HEADER_SIZE as u32,
        version: FDT_VERSION,
        last_comp_version: FDT_LAST_COMP_VERSION,
        boot_cpuid_phys: boot_cpuid,
        size_dt_strings: checked("strings block", strings_size)?,
        size_dt_struct: checked("structure block", struct_size)?,
    };

    let mut blob = Vec::with_capacity(totalsize);
    for field in header.fields() {
        blob.extend_from_slice(&field.to_be_bytes());
    }
    for &&(address, size) in &reservations {
        blob.extend_from_slice(&address.to_be_bytes());
        blob.extend_from_slice(&size.to_be_bytes());
    }
    blob.extend_from_slice(&[0; 16]);
    blob.extend_from_slice(&writer.buf);
    blob.extend_from_slice(&writer.strings.data);
    blob.resize(totalsize, 0);

    log::debug!(
        "serialized {} bytes: {} reservations, {} bytes of structure, {} bytes of strings",
        totalsize,
        reservations.len(),
        struct_size,
        strings_size
    );

    Ok(blob)
}

fn checked(block: &'static str, size: usize) -> Result<u32> {
    u32::try_from(size).map_err(|_| Error::SerializationOverflow { block, size })
}

/// Builds the structure block, collecting property names on the way.
#[derive(Debug, Default)]
struct StructWriter {
    buf: Vec<u8>,
    strings: StringTable,
}

impl StructWriter {
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append `data`, then pad with zeroes up to the next 4-byte boundary.
    fn padded(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        let len = self.buf.len().next_multiple_of(4);
        self.buf.resize(len, 0);
    }

    fn node(&mut self, node: &Node) -> Result<()> {
        self.u32(FDT_BEGIN_NODE);
        let mut name = node.full_name().into_bytes();
        name.push(0);
        self.padded(&name);

        for prop in &node.properties {
            let value = prop.encode()?;
            let len = checked("property", value.len())?;
            let nameoff = self.strings.offset(&prop.name)?;

            self.u32(FDT_PROP);
            self.u32(len);
            self.u32(nameoff);
            self.padded(&value);
        }

        for child in &node.children {
            self.node(child)?;
        }

        self.u32(FDT_END_NODE);
        Ok(())
    }
}

/* === Unit Tests === */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Property;
    use crate::parser;

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn minimal_blob() {
        let dts = parser::from_str("/dts-v1/; / { a = <1>; };").unwrap();
        let blob = serialize(&dts, &[], 0).unwrap();

        let header = FdtHeader::read(&blob).unwrap();
        assert_eq!(
            header,
            FdtHeader {
                magic: FDT_MAGIC,
                totalsize: 92,
                off_dt_struct: 56,
                off_dt_strings: 88,
                off_mem_rsvmap: 40,
                version: 17,
                last_comp_version: 16,
                boot_cpuid_phys: 0,
                size_dt_strings: 2,
                size_dt_struct: 32,
            }
        );
        assert_eq!(blob.len(), 92);
        assert_eq!(&blob[..4], [0xd0, 0x0d, 0xfe, 0xed]);
        assert_eq!(&blob[40..56], [0; 16]);
        assert_eq!(
            words(&blob[56..88]),
            [FDT_BEGIN_NODE, 0, FDT_PROP, 4, 0, 1, FDT_END_NODE, FDT_END]
        );
        assert_eq!(&blob[88..], b"a\0\0\0");
    }

    #[test]
    fn names_and_values_are_padded() {
        let mut dts = Dts::default();
        let mut node = Node::new("serial", Some("1000".into()));
        node.properties.push(Property::new(
            "status",
            vec![crate::ast::Fragment::Str("okay".into())],
        ));
        node.properties.push(Property::new("dma-coherent", vec![]));
        dts.root.children.push(node);

        let blob = serialize(&dts, &[], 0).unwrap();
        let header = FdtHeader::read(&blob).unwrap();
        let start = header.off_dt_struct as usize;
        let structure = &blob[start..start + header.size_dt_struct as usize];

        let mut exp = vec![];
        exp.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
        exp.extend_from_slice(&[0; 4]);
        exp.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
        exp.extend_from_slice(b"serial@1000\0");
        exp.extend_from_slice(&FDT_PROP.to_be_bytes());
        exp.extend_from_slice(&5u32.to_be_bytes());
        exp.extend_from_slice(&0u32.to_be_bytes());
        exp.extend_from_slice(b"okay\0\0\0\0");
        exp.extend_from_slice(&FDT_PROP.to_be_bytes());
        exp.extend_from_slice(&0u32.to_be_bytes());
        exp.extend_from_slice(&7u32.to_be_bytes());
        exp.extend_from_slice(&FDT_END_NODE.to_be_bytes());
        exp.extend_from_slice(&FDT_END_NODE.to_be_bytes());
        exp.extend_from_slice(&FDT_END.to_be_bytes());

        assert_eq!(structure, exp);
        assert_eq!(&blob[header.off_dt_strings as usize..], b"status\0dma-coherent\0");
    }

    #[test]
    fn strings_are_deduplicated() {
        let dts = parser::from_str(
            r#"/ {
                compatible = "acme,board";
                a { compatible = "acme,a"; reg = <0>; };
                b { reg = <1>; status = "okay"; };
            };"#,
        )
        .unwrap();
        let blob = serialize(&dts, &[], 0).unwrap();
        let header = FdtHeader::read(&blob).unwrap();
        let start = header.off_dt_strings as usize;

        assert_eq!(header.size_dt_strings, 22);
        assert_eq!(&blob[start..start + 22], b"compatible\0reg\0status\0");
        assert_eq!(&blob[start + 22..], [0, 0]);
        assert_eq!(header.totalsize % 4, 0);
    }

    #[test]
    fn memory_reservations() {
        let dts = parser::from_str("/dts-v1/; /memreserve/ 0x10000000 0x4000; / { };").unwrap();
        let blob = serialize(&dts, &[(0x8000_0000_0000, 0x1000)], 3).unwrap();
        let header = FdtHeader::read(&blob).unwrap();

        assert_eq!(header.boot_cpuid_phys, 3);
        assert_eq!(header.off_dt_struct, 40 + 3 * 16);
        assert_eq!(
            words(&blob[40..88]),
            [0, 0x1000_0000, 0, 0x4000, 0x8000, 0, 0, 0x1000, 0, 0, 0, 0]
        );
    }

    #[test]
    fn unresolved_references_are_rejected() {
        let dts = parser::from_str("/ { a = <&b>; };").unwrap();
        assert!(matches!(
            serialize(&dts, &[], 0),
            Err(Error::UnresolvedReference { label, .. }) if label == "b"
        ));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn oversized_blocks() {
        assert_eq!(checked("blob", u32::MAX as usize), Ok(u32::MAX));
        assert_eq!(
            checked("strings block", u32::MAX as usize + 1),
            Err(Error::SerializationOverflow {
                block: "strings block",
                size: 1 << 32,
            })
        );
    }

    #[test]
    fn read_rejects_other_data() {
        assert_eq!(FdtHeader::read(&[0xd0, 0x0d, 0xfe]), None);
        assert_eq!(FdtHeader::read(&[0; 40]), None);
    }
}
