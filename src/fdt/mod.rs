//! Flattened device tree construction and serialization.
//!
//! The machine builds one of these per reset and hands the guest its
//! serialized bytes at the configured DTB address. Property and name data is
//! padded to 4-byte boundaries and the structure block is big-endian,
//! matching the devicetree blob format version 17 / last-compatible 16.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const FDT_MAGIC: u32 = 0xD00D_FEED;
const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;

const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
#[allow(dead_code)]
const FDT_NOP: u32 = 4;
const FDT_END: u32 = 9;

fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

/// Lazily assigns `phandle` values starting from 1, shared by every node in
/// one tree so values stay unique across the whole tree.
#[derive(Clone)]
struct PhandleAllocator(Arc<AtomicU32>);

impl PhandleAllocator {
    fn new() -> Self {
        Self(Arc::new(AtomicU32::new(1)))
    }

    fn allocate(&self) -> u32 {
        let value = self.0.fetch_add(1, Ordering::Relaxed);
        // 0 and 0xFFFFFFFF are reserved by the device tree spec and must
        // never be handed out.
        debug_assert!(value != 0 && value != 0xFFFF_FFFF);
        value
    }
}

pub struct FdtNode {
    name: String,
    properties: Vec<(String, Vec<u8>)>,
    children: Vec<FdtNode>,
    phandle: Cell<Option<u32>>,
    allocator: PhandleAllocator,
}

impl FdtNode {
    fn new(name: impl Into<String>, allocator: PhandleAllocator) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
            children: Vec::new(),
            phandle: Cell::new(None),
            allocator,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: Vec<u8>) -> &mut Self {
        let name = name.into();
        if let Some(existing) = self.properties.iter_mut().find(|(n, _)| *n == name) {
            existing.1 = value;
        } else {
            self.properties.push((name, value));
        }
        self
    }

    pub fn set_property_u32(&mut self, name: impl Into<String>, value: u32) -> &mut Self {
        self.set_property(name, value.to_be_bytes().to_vec())
    }

    pub fn set_property_u64(&mut self, name: impl Into<String>, value: u64) -> &mut Self {
        self.set_property(name, value.to_be_bytes().to_vec())
    }

    pub fn set_property_str(&mut self, name: impl Into<String>, value: &str) -> &mut Self {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.set_property(name, bytes)
    }

    pub fn add_child(&mut self, name: impl Into<String>) -> &mut FdtNode {
        self.children
            .push(FdtNode::new(name, self.allocator.clone()));
        self.children.last_mut().unwrap()
    }

    pub fn child(&self, name: &str) -> Option<&FdtNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut FdtNode> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    pub fn property(&self, name: &str) -> Option<&[u8]> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Lazily assigns and returns this node's `phandle`, recording it as a
    /// `phandle` property.
    pub fn phandle(&mut self) -> u32 {
        if let Some(value) = self.phandle.get() {
            return value;
        }
        let value = self.allocator.allocate();
        self.phandle.set(Some(value));
        self.set_property_u32("phandle", value);
        value
    }
}

pub struct Fdt {
    root: FdtNode,
    boot_cpuid_phys: u32,
}

impl Fdt {
    pub fn new() -> Self {
        let allocator = PhandleAllocator::new();
        Self {
            root: FdtNode::new("", allocator),
            boot_cpuid_phys: 0,
        }
    }

    pub fn root(&self) -> &FdtNode {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut FdtNode {
        &mut self.root
    }

    pub fn set_boot_cpuid_phys(&mut self, hartid: u32) {
        self.boot_cpuid_phys = hartid;
    }

    /// The machine's conventional `/soc` child, created on first access.
    pub fn soc_mut(&mut self) -> &mut FdtNode {
        if self.root.child("soc").is_none() {
            let soc = self.root.add_child("soc");
            soc.set_property_u32("#address-cells", 2)
                .set_property_u32("#size-cells", 2);
            soc.set_property("ranges", Vec::new());
        }
        self.root.child_mut("soc").unwrap()
    }

    /// Serialize the tree into a big-endian DTB blob, version 17 /
    /// compatibility 16.
    pub fn serialize(&self) -> Vec<u8> {
        let mut strings = StringTable::new();
        let mut structure = Vec::new();
        write_node(&self.root, &mut structure, &mut strings);
        structure.extend_from_slice(&FDT_END.to_be_bytes());

        let header_size = 40; // 10 u32 fields
        let mem_rsv_size = 16; // one zero sentinel {addr: u64, size: u64}
        let off_mem_rsvmap = header_size as u32;
        let off_dt_struct = off_mem_rsvmap + mem_rsv_size as u32;
        let off_dt_strings = off_dt_struct + structure.len() as u32;
        let size_dt_struct = structure.len() as u32;
        let size_dt_strings = strings.bytes.len() as u32;
        let totalsize = off_dt_strings + size_dt_strings;

        let mut out = Vec::with_capacity(totalsize as usize);
        out.extend_from_slice(&FDT_MAGIC.to_be_bytes());
        out.extend_from_slice(&totalsize.to_be_bytes());
        out.extend_from_slice(&off_dt_struct.to_be_bytes());
        out.extend_from_slice(&off_dt_strings.to_be_bytes());
        out.extend_from_slice(&off_mem_rsvmap.to_be_bytes());
        out.extend_from_slice(&FDT_VERSION.to_be_bytes());
        out.extend_from_slice(&FDT_LAST_COMP_VERSION.to_be_bytes());
        out.extend_from_slice(&self.boot_cpuid_phys.to_be_bytes());
        out.extend_from_slice(&size_dt_strings.to_be_bytes());
        out.extend_from_slice(&size_dt_struct.to_be_bytes());
        debug_assert_eq!(out.len(), header_size);

        out.extend_from_slice(&0u64.to_be_bytes());
        out.extend_from_slice(&0u64.to_be_bytes());
        debug_assert_eq!(out.len() as u32, off_dt_struct);

        out.extend_from_slice(&structure);
        debug_assert_eq!(out.len() as u32, off_dt_strings);

        out.extend_from_slice(&strings.bytes);
        out
    }
}

impl Default for Fdt {
    fn default() -> Self {
        Self::new()
    }
}

struct StringTable {
    bytes: Vec<u8>,
    offsets: BTreeMap<String, u32>,
}

impl StringTable {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            offsets: BTreeMap::new(),
        }
    }

    fn offset_for(&mut self, name: &str) -> u32 {
        if let Some(&off) = self.offsets.get(name) {
            return off;
        }
        let off = self.bytes.len() as u32;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(name.to_string(), off);
        off
    }
}

fn write_padded(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(data);
    let padded = pad4(data.len());
    out.resize(out.len() + (padded - data.len()), 0);
}

fn write_node(node: &FdtNode, out: &mut Vec<u8>, strings: &mut StringTable) {
    out.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
    let mut name_bytes = node.name.as_bytes().to_vec();
    name_bytes.push(0);
    write_padded(out, &name_bytes);

    for (name, value) in &node.properties {
        out.extend_from_slice(&FDT_PROP.to_be_bytes());
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        let nameoff = strings.offset_for(name);
        out.extend_from_slice(&nameoff.to_be_bytes());
        write_padded(out, value);
    }

    for child in &node.children {
        write_node(child, out, strings);
    }

    out.extend_from_slice(&FDT_END_NODE.to_be_bytes());
}

/// Parses a blob produced by [`Fdt::serialize`] back into a
/// structurally-comparable form. This only reads back this module's own
/// output for round-trip testing; general-purpose DTB parsing of
/// firmware-supplied trees is out of scope here.
pub mod reader {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    pub struct ParsedNode {
        pub name: String,
        pub properties: BTreeMap<String, Vec<u8>>,
        pub children: Vec<ParsedNode>,
    }

    pub fn parse(blob: &[u8]) -> Option<ParsedNode> {
        let be32 = |off: usize| -> u32 { u32::from_be_bytes(blob[off..off + 4].try_into().ok()?) };
        let magic = u32::from_be_bytes(blob.get(0..4)?.try_into().ok()?);
        if magic != FDT_MAGIC {
            return None;
        }
        let off_dt_struct = u32::from_be_bytes(blob.get(8..12)?.try_into().ok()?) as usize;
        let off_dt_strings = u32::from_be_bytes(blob.get(12..16)?.try_into().ok()?) as usize;
        let version = u32::from_be_bytes(blob.get(20..24)?.try_into().ok()?);
        if version != FDT_VERSION {
            return None;
        }
        let _ = be32;

        let mut cursor = off_dt_struct;
        let (node, next) = parse_node(blob, cursor, off_dt_strings)?;
        cursor = next;
        let end_token = u32::from_be_bytes(blob.get(cursor..cursor + 4)?.try_into().ok()?);
        if end_token != FDT_END {
            return None;
        }
        Some(node)
    }

    fn read_cstr(blob: &[u8], off: usize) -> Option<(String, usize)> {
        let end = blob[off..].iter().position(|&b| b == 0)? + off;
        let s = std::str::from_utf8(&blob[off..end]).ok()?.to_string();
        Some((s, end + 1))
    }

    fn parse_node(blob: &[u8], mut off: usize, strings_off: usize) -> Option<(ParsedNode, usize)> {
        let token = u32::from_be_bytes(blob.get(off..off + 4)?.try_into().ok()?);
        if token != FDT_BEGIN_NODE {
            return None;
        }
        off += 4;
        let (name, name_end) = read_cstr(blob, off)?;
        off = off + pad4(name_end - off);

        let mut properties = BTreeMap::new();
        let mut children = Vec::new();
        loop {
            let token = u32::from_be_bytes(blob.get(off..off + 4)?.try_into().ok()?);
            match token {
                FDT_PROP => {
                    off += 4;
                    let len = u32::from_be_bytes(blob.get(off..off + 4)?.try_into().ok()?) as usize;
                    off += 4;
                    let nameoff = u32::from_be_bytes(blob.get(off..off + 4)?.try_into().ok()?) as usize;
                    off += 4;
                    let (pname, _) = read_cstr(blob, strings_off + nameoff)?;
                    let value = blob.get(off..off + len)?.to_vec();
                    off += pad4(len);
                    properties.insert(pname, value);
                }
                FDT_BEGIN_NODE => {
                    let (child, next) = parse_node(blob, off, strings_off)?;
                    children.push(child);
                    off = next;
                }
                FDT_END_NODE => {
                    off += 4;
                    break;
                }
                FDT_NOP => off += 4,
                _ => return None,
            }
        }

        Some((
            ParsedNode {
                name,
                properties,
                children,
            },
            off,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phandles_are_unique_and_nonzero() {
        let mut fdt = Fdt::new();
        let mut seen = std::collections::HashSet::new();
        for i in 0..5 {
            let child = fdt.root_mut().add_child(format!("node{i}"));
            let p = child.phandle();
            assert_ne!(p, 0);
            assert_ne!(p, 0xFFFF_FFFF);
            assert!(seen.insert(p));
        }
    }

    #[test]
    fn serialize_round_trips() {
        let mut fdt = Fdt::new();
        fdt.root_mut().set_property_str("compatible", "riscv-virtio");
        fdt.root_mut().set_property_u32("#address-cells", 2);
        let memory = fdt.root_mut().add_child("memory@80000000");
        memory.set_property_str("device_type", "memory");
        memory.set_property_u64("reg-base", 0x8000_0000);
        let _ = memory.phandle();

        let blob = fdt.serialize();
        assert_eq!(&blob[0..4], &FDT_MAGIC.to_be_bytes());

        let parsed = reader::parse(&blob).expect("parses");
        assert_eq!(parsed.name, "");
        assert_eq!(
            parsed.properties.get("compatible").unwrap(),
            b"riscv-virtio\0"
        );
        assert_eq!(parsed.children.len(), 1);
        assert_eq!(parsed.children[0].name, "memory@80000000");
        assert!(parsed.children[0].properties.contains_key("phandle"));
    }

    #[test]
    fn header_fields_match_spec() {
        let fdt = Fdt::new();
        let blob = fdt.serialize();
        let version = u32::from_be_bytes(blob[20..24].try_into().unwrap());
        let last_comp = u32::from_be_bytes(blob[24..28].try_into().unwrap());
        assert_eq!(version, 17);
        assert_eq!(last_comp, 16);
    }

    // Cross-validates `serialize`'s output against an independent DTB
    // parser, rather than only this module's own `reader` (which parses
    // nothing it didn't itself write).
    #[test]
    fn fdt_rs_parses_a_tree_this_crate_serializes() {
        use fdt_rs::base::DevTree;
        use fdt_rs::prelude::*;

        let mut fdt = Fdt::new();
        fdt.set_boot_cpuid_phys(0);
        {
            let root = fdt.root_mut();
            root.set_property_u32("#address-cells", 2);
            root.set_property_u32("#size-cells", 2);
            root.set_property_str("compatible", "riscv-virtio");

            let cpus = root.add_child("cpus");
            cpus.set_property_u32("#address-cells", 1);
            cpus.set_property_u32("#size-cells", 0);
            let cpu = cpus.add_child("cpu@0");
            cpu.set_property_str("device_type", "cpu");
            cpu.set_property_u32("reg", 0);

            let memory = root.add_child("memory@80000000");
            memory.set_property_str("device_type", "memory");
            let mut reg = Vec::with_capacity(16);
            reg.extend_from_slice(&0x8000_0000u64.to_be_bytes());
            reg.extend_from_slice(&0x1000_0000u64.to_be_bytes());
            memory.set_property("reg", reg);
        }

        let blob = fdt.serialize();

        // SAFETY: `blob` is exactly the byte sequence `serialize` just
        // produced, word-aligned in its own `Vec<u8>` allocation.
        let dt = unsafe { DevTree::new(&blob) }.expect("fdt-rs accepts our serialized header/tokens");

        let root = dt
            .nodes()
            .next()
            .expect("iterating nodes succeeds")
            .expect("root node is present");
        assert_eq!(root.name().unwrap_or_default(), "");

        let mut found_memory = false;
        let mut iter = dt.nodes();
        while let Ok(Some(node)) = iter.next() {
            if node.name().unwrap_or_default().starts_with("memory@") {
                found_memory = true;
            }
        }
        assert!(found_memory, "memory@80000000 node round-trips through fdt-rs");

        let mut compatible_iter = dt.compatible_nodes("riscv-virtio");
        let matched = compatible_iter
            .next()
            .expect("compatible_nodes iterator succeeds");
        assert!(matched.is_some(), "root's compatible string is discoverable by fdt-rs");
    }
}
