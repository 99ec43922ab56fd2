//! Simulated device memory
//!
//! Each simulated device owns a capacity and a table of live allocations.
//! Allocations are real 64-byte aligned host blocks, so device addresses are
//! host addresses and copies/kernels can use them directly once validated.

use crate::error::{Error, Result};
use crate::runtime::DevicePtr;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::BTreeMap;

const ALIGN: usize = 64;

/// Memory bookkeeping for one simulated device
#[derive(Debug)]
pub(super) struct DeviceMemory {
    device: usize,
    capacity: usize,
    used: usize,
    /// base address -> size in bytes
    live: BTreeMap<DevicePtr, usize>,
}

impl DeviceMemory {
    pub(super) fn new(device: usize, capacity: usize) -> Self {
        Self {
            device,
            capacity,
            used: 0,
            live: BTreeMap::new(),
        }
    }

    pub(super) fn info(&self) -> (usize, usize) {
        (self.capacity - self.used, self.capacity)
    }

    pub(super) fn live_allocations(&self) -> usize {
        self.live.len()
    }

    pub(super) fn allocate(&mut self, size_bytes: usize) -> Result<DevicePtr> {
        if size_bytes == 0 {
            return Ok(0);
        }
        if size_bytes > self.capacity - self.used {
            return Err(Error::OutOfMemory {
                device: self.device,
                size: size_bytes,
            });
        }
        let layout = Layout::from_size_align(size_bytes, ALIGN)
            .map_err(|e| Error::device(self.device, "allocate", e.to_string()))?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::OutOfMemory {
                device: self.device,
                size: size_bytes,
            });
        }
        let addr = ptr as DevicePtr;
        self.live.insert(addr, size_bytes);
        self.used += size_bytes;
        Ok(addr)
    }

    pub(super) fn deallocate(&mut self, ptr: DevicePtr) -> Result<()> {
        if ptr == 0 {
            return Ok(());
        }
        let size = self.live.remove(&ptr).ok_or_else(|| {
            Error::device(
                self.device,
                "free",
                format!("0x{ptr:x} is not a live allocation"),
            )
        })?;
        self.used -= size;
        let layout = Layout::from_size_align(size, ALIGN)
            .map_err(|e| Error::device(self.device, "free", e.to_string()))?;
        // SAFETY: ptr was returned by alloc_zeroed with this layout.
        unsafe { dealloc(ptr as *mut u8, layout) };
        Ok(())
    }

    /// Check that `[ptr, ptr + bytes)` lies inside one live allocation.
    pub(super) fn check_range(
        &self,
        operation: &'static str,
        ptr: DevicePtr,
        bytes: usize,
    ) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let inside = self
            .live
            .range(..=ptr)
            .next_back()
            .is_some_and(|(&base, &size)| ptr + bytes as u64 <= base + size as u64);
        if inside {
            Ok(())
        } else {
            Err(Error::device(
                self.device,
                operation,
                format!("illegal address: {bytes} bytes at 0x{ptr:x}"),
            ))
        }
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        for (&ptr, &size) in &self.live {
            if let Ok(layout) = Layout::from_size_align(size, ALIGN) {
                // SAFETY: every live entry came from alloc_zeroed with this layout.
                unsafe { dealloc(ptr as *mut u8, layout) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_accounting() {
        let mut mem = DeviceMemory::new(0, 1024);
        let p = mem.allocate(512).unwrap();
        assert_eq!(mem.info(), (512, 1024));
        assert!(matches!(
            mem.allocate(600),
            Err(Error::OutOfMemory { size: 600, .. })
        ));
        mem.deallocate(p).unwrap();
        assert_eq!(mem.info(), (1024, 1024));
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn test_range_checks() {
        let mut mem = DeviceMemory::new(1, 1 << 16);
        let p = mem.allocate(256).unwrap();
        assert!(mem.check_range("H2D A", p, 256).is_ok());
        assert!(mem.check_range("H2D A", p + 128, 128).is_ok());
        assert!(mem.check_range("H2D A", p + 128, 129).is_err());
        assert!(mem.check_range("H2D A", p - 8, 8).is_err());
        assert!(mem.deallocate(p + 8).is_err());
        mem.deallocate(p).unwrap();
        assert!(mem.check_range("H2D A", p, 1).is_err());
    }
}
