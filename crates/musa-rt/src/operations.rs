use std::ffi::c_void;
use std::ops::Index;

use crate::device::DeviceId;
use crate::instrumentation::InstrumentationSet;

/// Three-dimensional extent or offset, slowest-varying dimension first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Range3([usize; 3]);

impl Range3 {
    pub const fn new(d0: usize, d1: usize, d2: usize) -> Self {
        Self([d0, d1, d2])
    }

    pub const fn linear(count: usize) -> Self {
        Self([1, 1, count])
    }

    pub const fn zero() -> Self {
        Self([0, 0, 0])
    }

    pub fn get(&self, dim: usize) -> usize {
        self.0[dim]
    }

    pub fn size(&self) -> usize {
        self.0.iter().product()
    }
}

impl Index<usize> for Range3 {
    type Output = usize;

    fn index(&self, dim: usize) -> &usize {
        &self.0[dim]
    }
}

/// A window into a 3-D allocation on some device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLocation {
    device: DeviceId,
    base: usize,
    allocation_shape: Range3,
    access_offset: Range3,
    element_size: usize,
}

impl MemoryLocation {
    /// # Safety
    /// `base` must address an allocation of at least
    /// `allocation_shape.size() * element_size` bytes on `device` that stays
    /// valid until every operation using this location has completed.
    pub unsafe fn new(
        device: DeviceId,
        base: *mut c_void,
        allocation_shape: Range3,
        access_offset: Range3,
        element_size: usize,
    ) -> Self {
        Self {
            device,
            base: base as usize,
            allocation_shape,
            access_offset,
            element_size,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn allocation_shape(&self) -> Range3 {
        self.allocation_shape
    }

    pub fn access_offset(&self) -> Range3 {
        self.access_offset
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn base_address(&self) -> usize {
        self.base
    }

    /// Address of the first accessed element.
    pub fn access_address(&self) -> usize {
        let shape = self.allocation_shape;
        let offset = self.access_offset;
        let linear = (offset[0] * shape[1] + offset[1]) * shape[2] + offset[2];
        self.base + linear * self.element_size
    }
}

pub struct MemcpyOperation {
    source: MemoryLocation,
    dest: MemoryLocation,
    transferred: Range3,
    instrumentations: InstrumentationSet,
}

impl MemcpyOperation {
    pub fn new(source: MemoryLocation, dest: MemoryLocation, transferred: Range3) -> Self {
        Self {
            source,
            dest,
            transferred,
            instrumentations: InstrumentationSet::new(),
        }
    }

    pub fn source(&self) -> &MemoryLocation {
        &self.source
    }

    pub fn dest(&self) -> &MemoryLocation {
        &self.dest
    }

    pub fn transferred_range(&self) -> Range3 {
        self.transferred
    }

    pub fn num_transferred_bytes(&self) -> usize {
        self.transferred.size() * self.source.element_size
    }

    pub fn instrumentations(&self) -> &InstrumentationSet {
        &self.instrumentations
    }

    /// Number of dimensions the native copy needs.
    ///
    /// A transfer covering both allocations entirely, from offset zero, is
    /// contiguous and always copied as one linear block.
    pub fn transfer_dimensionality(&self) -> usize {
        let range = self.transferred;
        let contiguous = range == self.source.allocation_shape
            && range == self.dest.allocation_shape
            && self.source.access_offset == Range3::zero()
            && self.dest.access_offset == Range3::zero();
        if contiguous {
            1
        } else if range[0] > 1 {
            3
        } else if range[1] > 1 {
            2
        } else {
            1
        }
    }
}

pub struct MemsetOperation {
    dst: usize,
    pattern: u8,
    bytes: usize,
    instrumentations: InstrumentationSet,
}

impl MemsetOperation {
    /// # Safety
    /// `dst..dst + bytes` must stay valid until the operation completes.
    pub unsafe fn new(dst: *mut c_void, pattern: u8, bytes: usize) -> Self {
        Self {
            dst: dst as usize,
            pattern,
            bytes,
            instrumentations: InstrumentationSet::new(),
        }
    }

    pub fn address(&self) -> usize {
        self.dst
    }

    pub fn pattern(&self) -> u8 {
        self.pattern
    }

    pub fn num_bytes(&self) -> usize {
        self.bytes
    }

    pub fn instrumentations(&self) -> &InstrumentationSet {
        &self.instrumentations
    }
}

/// Migration hint for managed memory.
pub struct PrefetchOperation {
    ptr: usize,
    bytes: usize,
    target: DeviceId,
    instrumentations: InstrumentationSet,
}

impl PrefetchOperation {
    pub fn new(ptr: *const c_void, bytes: usize, target: DeviceId) -> Self {
        Self {
            ptr: ptr as usize,
            bytes,
            target,
            instrumentations: InstrumentationSet::new(),
        }
    }

    pub fn address(&self) -> usize {
        self.ptr
    }

    pub fn num_bytes(&self) -> usize {
        self.bytes
    }

    pub fn target(&self) -> DeviceId {
        self.target
    }

    pub fn instrumentations(&self) -> &InstrumentationSet {
        &self.instrumentations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(shape: Range3, offset: Range3) -> MemoryLocation {
        unsafe { MemoryLocation::new(DeviceId::musa(0), 0x1000 as *mut c_void, shape, offset, 4) }
    }

    #[test]
    fn full_allocation_transfer_is_linear() {
        let shape = Range3::new(4, 8, 16);
        let op = MemcpyOperation::new(
            location(shape, Range3::zero()),
            location(shape, Range3::zero()),
            shape,
        );
        assert_eq!(op.transfer_dimensionality(), 1);
        assert_eq!(op.num_transferred_bytes(), 4 * 8 * 16 * 4);
    }

    #[test]
    fn partial_transfers_pick_dimension_from_extent() {
        let shape = Range3::new(4, 8, 16);
        let offset = Range3::new(0, 1, 0);
        let op = |range| MemcpyOperation::new(location(shape, offset), location(shape, Range3::zero()), range);
        assert_eq!(op(Range3::new(2, 4, 4)).transfer_dimensionality(), 3);
        assert_eq!(op(Range3::new(1, 4, 4)).transfer_dimensionality(), 2);
        assert_eq!(op(Range3::new(1, 1, 4)).transfer_dimensionality(), 1);
    }

    #[test]
    fn access_address_applies_row_major_offset() {
        let loc = location(Range3::new(2, 3, 4), Range3::new(1, 2, 3));
        assert_eq!(loc.access_address(), 0x1000 + ((3 + 2) * 4 + 3) * 4);
    }
}
