//! Dual HBM address spaces
//!
//! Every tensor of a layer lives in one of two bump-allocated spaces, `A`
//! and `B`. Offsets are relative while the layer is being built; once both
//! spaces are complete [`reoffset`] binds them to HBM edges and [`freeze`]
//! locks them for dispatch.
//!
//! ```text
//! Accumulating ──reoffset──▶ Reoffset ──freeze──▶ Frozen
//! ```
//!
//! Aliases are named sub-views of an existing allocation. They share its
//! bytes, so they never advance the cursor.

use crate::error::{PlanError, Result};
use crate::shape::Shape;
use serde::Serialize;
use softhier_arch::{align_up, ArchitectureDescriptor, DType, SPACE_B_ALIGN};
use std::collections::HashMap;
use tracing::{debug, info};

/// One of the two address spaces of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum SpaceId {
    /// Space A
    #[serde(rename = "spaceA")]
    A,
    /// Space B
    #[serde(rename = "spaceB")]
    B,
}

impl std::fmt::Display for SpaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "spaceA"),
            Self::B => write!(f, "spaceB"),
        }
    }
}

/// Stable index of an allocation inside its space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(usize);

/// One allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDescriptor {
    name: String,
    offset: u64,
    base: u64,
    shape: Shape,
    view: Option<Shape>,
    dtype: DType,
    size: u64,
}

impl BufferDescriptor {
    fn new(name: String, offset: u64, shape: Shape, view: Option<Shape>, dtype: DType) -> Self {
        let size = shape.total_elements() * dtype.size();
        Self {
            name,
            offset,
            base: 0,
            shape,
            view,
            dtype,
            size,
        }
    }

    /// Buffer name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Offset from the space base
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Absolute HBM address
    #[must_use]
    pub const fn address(&self) -> u64 {
        self.base + self.offset
    }

    /// Storage shape
    #[must_use]
    pub const fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Logical view, when it differs from the storage shape
    #[must_use]
    pub const fn view(&self) -> Option<&Shape> {
        self.view.as_ref()
    }

    /// Element type
    #[must_use]
    pub const fn dtype(&self) -> DType {
        self.dtype
    }

    /// Bytes (`elements × dtype width`)
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// First offset past the buffer
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Named sub-view of an allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    name: String,
    parent: BufferId,
    offset: u64,
    shape: Shape,
    dtype: DType,
}

impl Alias {
    /// Alias name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allocation the alias lies in
    #[must_use]
    pub const fn parent(&self) -> BufferId {
        self.parent
    }

    /// Offset inside the parent
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Shape of the view
    #[must_use]
    pub const fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Bytes covered
    #[must_use]
    pub fn size(&self) -> u64 {
        self.shape.total_elements() * self.dtype.size()
    }
}

/// Resolved location of a buffer or alias
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region<'a> {
    /// Name as bound
    pub name: &'a str,
    /// Absolute address
    pub address: u64,
    /// Shape
    pub shape: &'a Shape,
    /// Element type
    pub dtype: DType,
    /// Bytes
    pub size: u64,
    /// Parent allocation for aliases
    pub parent: Option<&'a str>,
}

/// Lifecycle of an address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpaceState {
    /// Buffers may still be added
    Accumulating,
    /// Bound to its HBM base
    Reoffset,
    /// Locked for dispatch
    Frozen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Buffer(BufferId),
    Alias(usize),
}

/// Bump-allocated arena of buffers
#[derive(Debug, Clone)]
pub struct AddressSpace {
    id: SpaceId,
    buffers: Vec<BufferDescriptor>,
    aliases: Vec<Alias>,
    names: HashMap<String, Entry>,
    cursor: u64,
    base: u64,
    state: SpaceState,
}

impl AddressSpace {
    /// Create an empty space
    #[must_use]
    pub fn new(id: SpaceId) -> Self {
        Self {
            id,
            buffers: Vec::new(),
            aliases: Vec::new(),
            names: HashMap::new(),
            cursor: 0,
            base: 0,
            state: SpaceState::Accumulating,
        }
    }

    /// Which space this is
    #[must_use]
    pub const fn id(&self) -> SpaceId {
        self.id
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> SpaceState {
        self.state
    }

    /// HBM base (0 until rebased)
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Bytes spanned from the base to the cursor, padding included
    #[must_use]
    pub const fn footprint(&self) -> u64 {
        self.cursor
    }

    fn require_accumulating(&self, what: &str) -> Result<()> {
        if self.state == SpaceState::Accumulating {
            Ok(())
        } else {
            Err(PlanError::configuration(format!(
                "{}: cannot {what} after the space was rebased",
                self.id
            )))
        }
    }

    fn require_unique(&self, name: &str) -> Result<()> {
        if self.names.contains_key(name) {
            return Err(PlanError::configuration(format!(
                "{}: buffer '{name}' declared twice",
                self.id
            )));
        }
        Ok(())
    }

    /// Allocate a buffer at the cursor rounded up to `align`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the name is taken, the shape is
    /// empty, or the space is no longer accumulating.
    pub fn allocate(&mut self, name: &str, shape: impl Into<Shape>, dtype: DType, align: u64) -> Result<BufferId> {
        self.push(name, shape.into(), None, dtype, align)
    }

    /// Allocate a buffer that also records a logical view
    ///
    /// # Errors
    ///
    /// As [`AddressSpace::allocate`], and if the view does not cover the
    /// same number of elements as the shape.
    pub fn allocate_view(
        &mut self,
        name: &str,
        shape: impl Into<Shape>,
        view: impl Into<Shape>,
        dtype: DType,
        align: u64,
    ) -> Result<BufferId> {
        let shape = shape.into();
        let view = view.into();
        if view.total_elements() != shape.total_elements() {
            return Err(PlanError::configuration(format!(
                "{}: view {view} of '{name}' does not match shape {shape}",
                self.id
            )));
        }
        self.push(name, shape, Some(view), dtype, align)
    }

    fn require_pow2(&self, align: u64) -> Result<()> {
        if align.is_power_of_two() {
            Ok(())
        } else {
            Err(PlanError::configuration(format!(
                "{}: alignment {align:#x} is not a power of two",
                self.id
            )))
        }
    }

    fn push(&mut self, name: &str, shape: Shape, view: Option<Shape>, dtype: DType, align: u64) -> Result<BufferId> {
        self.require_accumulating("allocate")?;
        self.require_unique(name)?;
        if shape.is_degenerate() || shape.rank() == 0 {
            return Err(PlanError::configuration(format!(
                "{}: buffer '{name}' has empty shape {shape}",
                self.id
            )));
        }
        self.require_pow2(align)?;

        let offset = align_up(self.cursor, align);
        let buffer = BufferDescriptor::new(name.to_string(), offset, shape, view, dtype);
        debug!(
            "{} + {name} {} {} @ {offset:#x} ({} bytes)",
            self.id, buffer.shape, dtype, buffer.size
        );
        self.cursor = buffer.end();
        let id = BufferId(self.buffers.len());
        self.buffers.push(buffer);
        self.names.insert(name.to_string(), Entry::Buffer(id));
        Ok(id)
    }

    /// Pad the cursor up to `align`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the space is no longer accumulating
    /// or `align` is not a power of two.
    pub fn align_cursor(&mut self, align: u64) -> Result<()> {
        self.require_accumulating("align")?;
        self.require_pow2(align)?;
        self.cursor = align_up(self.cursor, align);
        Ok(())
    }

    /// Declare `name` as a view of `parent` starting `offset` bytes in
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the parent is unknown or itself an
    /// alias, the name is taken, or the view runs past the parent.
    pub fn alias(&mut self, name: &str, parent: &str, offset: u64, shape: impl Into<Shape>, dtype: DType) -> Result<()> {
        self.require_accumulating("alias")?;
        self.require_unique(name)?;
        let parent_id = match self.names.get(parent) {
            Some(Entry::Buffer(id)) => *id,
            Some(Entry::Alias(_)) => {
                return Err(PlanError::configuration(format!(
                    "{}: alias '{name}' targets alias '{parent}'",
                    self.id
                )))
            }
            None => {
                return Err(PlanError::configuration(format!(
                    "{}: alias '{name}' targets unknown buffer '{parent}'",
                    self.id
                )))
            }
        };
        let alias = Alias {
            name: name.to_string(),
            parent: parent_id,
            offset,
            shape: shape.into(),
            dtype,
        };
        let parent_size = self.buffers[parent_id.0].size;
        if alias.offset + alias.size() > parent_size {
            return Err(PlanError::configuration(format!(
                "{}: alias '{name}' [{offset:#x}, +{}) exceeds '{parent}' ({parent_size} bytes)",
                self.id,
                alias.size()
            )));
        }
        self.names.insert(name.to_string(), Entry::Alias(self.aliases.len()));
        self.aliases.push(alias);
        Ok(())
    }

    /// Allocations in declaration order
    pub fn buffers(&self) -> impl Iterator<Item = &BufferDescriptor> {
        self.buffers.iter()
    }

    /// Aliases in declaration order
    pub fn aliases(&self) -> impl Iterator<Item = &Alias> {
        self.aliases.iter()
    }

    /// Allocation by id
    #[must_use]
    pub fn buffer(&self, id: BufferId) -> Option<&BufferDescriptor> {
        self.buffers.get(id.0)
    }

    /// Whether a buffer or alias of this name exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Number of allocations (aliases excluded)
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether nothing has been allocated
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Resolve a buffer or alias by name
    #[must_use]
    pub fn region(&self, name: &str) -> Option<Region<'_>> {
        match *self.names.get(name)? {
            Entry::Buffer(id) => {
                let b = &self.buffers[id.0];
                Some(Region {
                    name: &b.name,
                    address: b.address(),
                    shape: &b.shape,
                    dtype: b.dtype,
                    size: b.size,
                    parent: None,
                })
            }
            Entry::Alias(index) => {
                let a = &self.aliases[index];
                let parent = &self.buffers[a.parent.0];
                Some(Region {
                    name: &a.name,
                    address: parent.address() + a.offset,
                    shape: &a.shape,
                    dtype: a.dtype,
                    size: a.size(),
                    parent: Some(&parent.name),
                })
            }
        }
    }

    /// Check that allocations are ordered and disjoint
    ///
    /// # Errors
    ///
    /// Returns an invalid-state error naming the first offending pair.
    pub fn check_layout(&self) -> Result<()> {
        for pair in self.buffers.windows(2) {
            if pair[1].offset < pair[0].end() {
                return Err(PlanError::invalid_state(format!(
                    "{}: '{}' at {:#x} overlaps '{}' ending at {:#x}",
                    self.id,
                    pair[1].name,
                    pair[1].offset,
                    pair[0].name,
                    pair[0].end()
                )));
            }
        }
        Ok(())
    }

    fn check_rebase(&self, base: u64) -> Result<()> {
        if self.state == SpaceState::Frozen && self.base != base {
            return Err(PlanError::configuration(format!(
                "{}: frozen at {:#x}, cannot rebase to {base:#x}",
                self.id, self.base
            )));
        }
        Ok(())
    }

    fn rebase(&mut self, base: u64) {
        if self.state == SpaceState::Frozen {
            return;
        }
        self.base = base;
        for buffer in &mut self.buffers {
            buffer.base = base;
        }
        self.state = SpaceState::Reoffset;
    }
}

/// Bind both spaces to the active HBM edges
///
/// With one active edge, A starts at the edge base and B follows at the next
/// [`SPACE_B_ALIGN`] boundary. With two, each space takes one edge. The base
/// is assigned rather than added, so calling this again is a no-op.
///
/// # Errors
///
/// Returns a topology error for any other edge count, a capacity error if a
/// space does not fit its edge, or a configuration error when a frozen space
/// would move.
pub fn reoffset(arch: &ArchitectureDescriptor, a: &mut AddressSpace, b: &mut AddressSpace) -> Result<()> {
    let mesh = &arch.mesh;
    let hbm = &arch.hbm;
    let edges = hbm.active_edges();

    let (a_start, b_start) = match edges.as_slice() {
        [edge] => {
            let start = hbm.edge_base(*edge, mesh);
            let capacity = hbm.edge_capacity(*edge, mesh);
            let b_start = align_up(start + a.footprint(), SPACE_B_ALIGN);
            let used = b_start - start + b.footprint();
            if used > capacity {
                return Err(PlanError::capacity(format!(
                    "{edge} edge: spaces need {used:#x} bytes, edge holds {capacity:#x}"
                )));
            }
            (start, b_start)
        }
        [first, second] => {
            for (edge, space) in [(first, &*a), (second, &*b)] {
                let capacity = hbm.edge_capacity(*edge, mesh);
                if space.footprint() > capacity {
                    return Err(PlanError::capacity(format!(
                        "{edge} edge: {} needs {:#x} bytes, edge holds {capacity:#x}",
                        space.id,
                        space.footprint()
                    )));
                }
            }
            (hbm.edge_base(*first, mesh), hbm.edge_base(*second, mesh))
        }
        _ => {
            return Err(PlanError::Topology {
                active_edges: edges.len(),
            })
        }
    };

    a.check_rebase(a_start)?;
    b.check_rebase(b_start)?;
    a.rebase(a_start);
    b.rebase(b_start);
    info!("✅ Spaces rebased: A @ {a_start:#x}, B @ {b_start:#x}");
    Ok(())
}

/// Lock both spaces
///
/// # Errors
///
/// Returns an invalid-state error if either space was never rebased or its
/// layout is inconsistent.
pub fn freeze(a: &mut AddressSpace, b: &mut AddressSpace) -> Result<()> {
    for space in [&*a, &*b] {
        if space.state == SpaceState::Accumulating {
            return Err(PlanError::invalid_state(format!(
                "{}: freeze before reoffset",
                space.id
            )));
        }
        space.check_layout()?;
    }
    a.state = SpaceState::Frozen;
    b.state = SpaceState::Frozen;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use softhier_arch::HBM_NODE_ALIGN;

    fn west_only(node_capacity: u64) -> ArchitectureDescriptor {
        let mut arch = ArchitectureDescriptor::SOFTHIER_8X8_DUAL;
        arch.hbm.base = 0xC000_0000;
        arch.hbm.node_capacity = node_capacity;
        arch.hbm.channels = [8, 0, 0, 0];
        arch
    }

    #[test]
    fn test_single_edge_rebase() {
        let arch = west_only(0x4000_0000);
        let mut a = AddressSpace::new(SpaceId::A);
        let mut b = AddressSpace::new(SpaceId::B);
        a.allocate("buf1", [2048], DType::Fp16, 1).unwrap();
        let buf2 = a.allocate("buf2", [4096], DType::Fp16, HBM_NODE_ALIGN).unwrap();
        assert_eq!(a.buffer(buf2).unwrap().offset(), 0x1_0000);
        b.allocate("layer_input", [16], DType::Fp16, 1).unwrap();

        reoffset(&arch, &mut a, &mut b).unwrap();
        assert_eq!(a.base(), 0xC000_0000);
        assert_eq!(b.base(), 0xC010_0000);
        assert_eq!(a.region("buf2").unwrap().address, 0xC001_0000);
        assert_eq!(a.state(), SpaceState::Reoffset);
    }

    #[test]
    fn test_dual_edge_rebase() {
        let arch = ArchitectureDescriptor::SOFTHIER_8X8_DUAL;
        let mut a = AddressSpace::new(SpaceId::A);
        let mut b = AddressSpace::new(SpaceId::B);
        a.allocate("x", [64], DType::Fp8, 1).unwrap();
        b.allocate("y", [64], DType::Fp8, 1).unwrap();
        reoffset(&arch, &mut a, &mut b).unwrap();
        // west base, then south = base + 2·s·8 + s·8
        assert_eq!(a.base(), 0xC000_0000);
        assert_eq!(b.base(), 0xC000_0000 + 24 * 0x4000_0000);
    }

    #[test]
    fn test_rebase_is_idempotent() {
        let arch = west_only(0x4000_0000);
        let mut a = AddressSpace::new(SpaceId::A);
        let mut b = AddressSpace::new(SpaceId::B);
        a.allocate("x", [1024], DType::Fp16, 1).unwrap();
        b.allocate("y", [1024], DType::Fp16, 1).unwrap();
        reoffset(&arch, &mut a, &mut b).unwrap();
        let first = (a.region("x").unwrap().address, b.region("y").unwrap().address);
        reoffset(&arch, &mut a, &mut b).unwrap();
        freeze(&mut a, &mut b).unwrap();
        reoffset(&arch, &mut a, &mut b).unwrap();
        let again = (a.region("x").unwrap().address, b.region("y").unwrap().address);
        assert_eq!(first, again);
        assert_eq!(a.state(), SpaceState::Frozen);
    }

    #[test]
    fn test_frozen_space_cannot_move() {
        let arch = west_only(0x4000_0000);
        let mut a = AddressSpace::new(SpaceId::A);
        let mut b = AddressSpace::new(SpaceId::B);
        a.allocate("x", [1024], DType::Fp16, 1).unwrap();
        reoffset(&arch, &mut a, &mut b).unwrap();
        freeze(&mut a, &mut b).unwrap();

        let mut moved = arch;
        moved.hbm.base = 0x8000_0000;
        let err = reoffset(&moved, &mut a, &mut b).unwrap_err();
        assert!(matches!(err, PlanError::Configuration { .. }));
    }

    #[test]
    fn test_topology_rejected() {
        let mut arch = ArchitectureDescriptor::SOFTHIER_8X8_DUAL;
        arch.hbm.channels = [8, 8, 8, 0];
        let mut a = AddressSpace::new(SpaceId::A);
        let mut b = AddressSpace::new(SpaceId::B);
        let err = reoffset(&arch, &mut a, &mut b).unwrap_err();
        assert!(matches!(err, PlanError::Topology { active_edges: 3 }));

        arch.hbm.channels = [0; 4];
        let err = reoffset(&arch, &mut a, &mut b).unwrap_err();
        assert!(matches!(err, PlanError::Topology { active_edges: 0 }));
    }

    #[test]
    fn test_capacity_includes_padding() {
        // 8 west nodes of 0x2_0000 bytes = 0x10_0000 per edge
        let arch = west_only(0x2_0000);
        let mut a = AddressSpace::new(SpaceId::A);
        let mut b = AddressSpace::new(SpaceId::B);
        a.allocate("x", [16], DType::Fp16, 1).unwrap();
        b.allocate("y", [16], DType::Fp16, 1).unwrap();
        // B lands at +0x10_0000, already past the edge
        let err = reoffset(&arch, &mut a, &mut b).unwrap_err();
        assert!(matches!(err, PlanError::Capacity { .. }));
        assert_eq!(a.state(), SpaceState::Accumulating);
    }

    #[test]
    fn test_allocation_rules() {
        let mut a = AddressSpace::new(SpaceId::A);
        a.allocate("x", [4, 8], DType::Fp16, 1).unwrap();
        assert!(a.allocate("x", [4], DType::Fp16, 1).is_err());
        assert!(a.allocate("empty", [0, 8], DType::Fp16, 1).is_err());
        assert!(a.allocate_view("bad_view", [4, 8], [3, 8], DType::Fp16, 1).is_err());
        a.allocate("idx", [3], DType::U32, 1).unwrap();
        a.align_cursor(HBM_NODE_ALIGN).unwrap();
        assert_eq!(a.footprint(), 0x1_0000);
        for align in [0, 3, 0x3000] {
            let err = a.align_cursor(align).unwrap_err();
            assert!(matches!(err, PlanError::Configuration { .. }));
            assert!(a.allocate("odd", [1], DType::Fp16, align).is_err());
        }
        assert_eq!(a.footprint(), 0x1_0000);
        a.check_layout().unwrap();

        let mut b = AddressSpace::new(SpaceId::B);
        let arch = west_only(0x4000_0000);
        reoffset(&arch, &mut a, &mut b).unwrap();
        let err = a.allocate("late", [4], DType::Fp16, 1).unwrap_err();
        assert!(matches!(err, PlanError::Configuration { .. }));
    }

    #[test]
    fn test_ordering_and_size_law() {
        let mut a = AddressSpace::new(SpaceId::A);
        a.allocate("a", [3, 5], DType::Fp16, 1).unwrap();
        a.allocate("b", [7], DType::U32, 0x100).unwrap();
        a.allocate("c", [9], DType::Fp8, 1).unwrap();
        let buffers: Vec<_> = a.buffers().collect();
        assert_eq!(buffers[0].size(), 30);
        assert_eq!(buffers[1].size(), 28);
        assert_eq!(buffers[1].offset(), 0x100);
        assert_eq!(buffers[2].offset(), 0x100 + 28);
        for pair in buffers.windows(2) {
            assert!(pair[0].end() <= pair[1].offset());
        }
    }

    #[test]
    fn test_alias_containment() {
        let mut a = AddressSpace::new(SpaceId::A);
        a.allocate("pad", [64], DType::Fp16, 1).unwrap();
        a.allocate("dispatch", [4, 16], DType::Fp16, 1).unwrap();
        a.alias("expert_1", "dispatch", 32, [1, 16], DType::Fp16).unwrap();
        assert!(a.alias("too_long", "dispatch", 96, [2, 16], DType::Fp16).is_err());
        assert!(a.alias("nested", "expert_1", 0, [1], DType::Fp16).is_err());
        assert!(a.alias("orphan", "missing", 0, [1], DType::Fp16).is_err());

        let region = a.region("expert_1").unwrap();
        assert_eq!(region.address, 128 + 32);
        assert_eq!(region.parent, Some("dispatch"));
        assert_eq!(a.len(), 2);
        assert_eq!(a.footprint(), 128 + 128);
    }

    #[test]
    fn test_freeze_requires_rebase() {
        let mut a = AddressSpace::new(SpaceId::A);
        let mut b = AddressSpace::new(SpaceId::B);
        let err = freeze(&mut a, &mut b).unwrap_err();
        assert!(matches!(err, PlanError::InvalidState { .. }));
    }
}
