//! The slice of the VFIO ioctl surface this daemon consumes.
//!
//! The structs and constants come from `vfio-bindings`; the request
//! numbers are `_IO(VFIO_TYPE, VFIO_BASE + n)` and cannot be generated
//! by bindgen, so they are spelled out here.

use vfio_bindings::bindings::vfio::{VFIO_BASE, VFIO_TYPE};
use vmm_sys_util::{ioctl_io_nr, ioctl_ioc_nr};

ioctl_io_nr!(VFIO_DEVICE_GET_REGION_INFO, VFIO_TYPE, VFIO_BASE + 8);
ioctl_io_nr!(VFIO_IOMMU_UNMAP_DMA, VFIO_TYPE, VFIO_BASE + 14);

/// Byte offset of a VFIO device region within the device descriptor.
///
/// vfio-pci packs every region into the device file's offset space at
/// `index << 40`.
pub fn region_offset(index: u32) -> u64 {
    u64::from(index) << 40
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_numbers_match_the_kernel_abi() {
        // _IO(';', 100 + n)
        assert_eq!(VFIO_DEVICE_GET_REGION_INFO(), 0x3b6c);
        assert_eq!(VFIO_IOMMU_UNMAP_DMA(), 0x3b72);
    }

    #[test]
    fn test_region_offsets_are_disjoint() {
        assert_eq!(region_offset(0), 0);
        assert_eq!(region_offset(7), 7 << 40);
        assert!(region_offset(7) + 0xffff_ffff < region_offset(8));
    }
}
