//! PF reset fallback: when the worker dies for good, quiesce every held
//! PF by driving the virtio-PCI reset protocol directly through VFIO,
//! then release the global DMA aperture.

use std::fs::{self, File};
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, BorrowedFd};
use std::ptr;
use std::sync::atomic::{fence, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::uio::pread;
use vfio_bindings::bindings::vfio::{
    vfio_iommu_type1_dma_unmap, vfio_region_info, VFIO_PCI_CONFIG_REGION_INDEX,
};
use vm_memory::ByteValued;
use vmm_sys_util::ioctl::ioctl_with_mut_ref;

use crate::message::read_obj;
use crate::registry::{PfEntry, Registry};
use crate::vfio::{region_offset, VFIO_DEVICE_GET_REGION_INFO, VFIO_IOMMU_UNMAP_DMA};

/// Marker file external orchestration uses to gate restarts while the
/// reset fallback runs.
pub const RESET_SENTINEL: &str = "/tmp/pf_resetting";

const PCI_CAPABILITY_LIST: u64 = 0x34;
const PCI_CAP_ID_VNDR: u8 = 0x09;
const VIRTIO_PCI_CAP_COMMON_CFG: u8 = 1;
const VIRTIO_CONFIG_STATUS_RESET: u8 = 0x00;

const RESET_TIMEOUT_MS: u32 = 120_000;
const RESET_POLL_MS: u64 = 1;

/// Virtio-PCI vendor capability as it sits in config space.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct VirtioPciCap {
    cap_vndr: u8,
    cap_next: u8,
    cap_len: u8,
    cfg_type: u8,
    bar: u8,
    padding: [u8; 3],
    offset: u32,
    length: u32,
}

// SAFETY: plain old data matching the config-space layout.
unsafe impl ByteValued for VirtioPciCap {}

/// The virtio-PCI common configuration structure; only `device_status`
/// is touched, the rest pins the layout.
#[repr(C)]
#[allow(dead_code)]
struct VirtioPciCommonCfg {
    device_feature_select: u32,
    device_feature: u32,
    guest_feature_select: u32,
    guest_feature: u32,
    msix_config: u16,
    num_queues: u16,
    device_status: u8,
    config_generation: u8,
    queue_select: u16,
    queue_size: u16,
    queue_msix_vector: u16,
    queue_enable: u16,
    queue_notify_off: u16,
    queue_desc_lo: u32,
    queue_desc_hi: u32,
    queue_avail_lo: u32,
    queue_avail_hi: u32,
    queue_used_lo: u32,
    queue_used_hi: u32,
    queue_notify_data: u16,
    queue_reset: u16,
}

/// Create the reset sentinel. Failure is reported to the caller, which
/// then skips the reset entirely.
pub fn create_sentinel() -> Result<()> {
    File::create(RESET_SENTINEL).context("Failed to create PF reset file")?;
    info!("PF reset file created");
    Ok(())
}

/// Remove the reset sentinel.
pub fn remove_sentinel() {
    match fs::remove_file(RESET_SENTINEL) {
        Ok(()) => info!("PF reset file deleted"),
        Err(e) => error!("Failed to delete PF reset file: {}", e),
    }
}

/// Reset every stored PF, then flush the global DMA aperture.
///
/// Best effort throughout: a PF that cannot be walked, mapped or reset
/// is logged and skipped, and the DMA flush runs regardless.
pub fn reset_all_pfs(registry: &mut Registry) {
    for pf in registry.pfs() {
        match reset_pf(pf) {
            Ok(()) => info!("PF {} reset succeed", pf.name),
            Err(e) => error!("PF {} reset fail: {:#}", pf.name, e),
        }
    }

    // All PF resets attempted; now the DMA mappings can go away safely.
    flush_global_dma(registry);
    info!("All PF reset completed");
}

fn reset_pf(pf: &PfEntry) -> Result<()> {
    let dev = pf.vfio_device.as_fd();
    let cap = find_common_cfg(dev)
        .with_context(|| format!("Failed to locate common config of {}", pf.name))?;

    let mut info = vfio_region_info {
        argsz: std::mem::size_of::<vfio_region_info>() as u32,
        index: u32::from(cap.bar),
        ..Default::default()
    };
    // SAFETY: dev is a VFIO device descriptor and info is the struct the
    // request expects.
    let ret = unsafe { ioctl_with_mut_ref(&dev, VFIO_DEVICE_GET_REGION_INFO(), &mut info) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("Failed to get region info of bar {}", cap.bar));
    }

    let len = NonZeroUsize::new(info.size as usize)
        .with_context(|| format!("Bar {} has zero size", cap.bar))?;
    // SAFETY: mapping a whole device region the kernel advertised.
    let addr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            dev,
            info.offset as i64,
        )
    }
    .with_context(|| format!("Failed to mmap bar {}", cap.bar))?;

    // Unmap no matter how the reset itself goes.
    let addr = scopeguard::guard(addr, |addr| {
        // SAFETY: exactly the mapping established above.
        if let Err(e) = unsafe { munmap(addr, len.get()) } {
            error!("Failed to unmap bar {}: {}", cap.bar, e);
        }
    });

    if (cap.offset as usize) + std::mem::size_of::<VirtioPciCommonCfg>() > len.get() {
        bail!("Common config at {:#x} falls outside bar {}", cap.offset, cap.bar);
    }
    // SAFETY: in bounds of the mapping per the check above.
    let common_cfg =
        unsafe { addr.as_ptr().cast::<u8>().add(cap.offset as usize) }.cast::<VirtioPciCommonCfg>();

    info!("PF {} reset start", pf.name);
    reset_device(common_cfg, RESET_TIMEOUT_MS)
}

/// Walk the PCI capability list through the VFIO config region and
/// return the virtio common-config capability.
fn find_common_cfg(dev: BorrowedFd<'_>) -> Result<VirtioPciCap> {
    let cfg_base = region_offset(VFIO_PCI_CONFIG_REGION_INDEX);

    let mut head = [0u8; 1];
    pread_exact(dev, &mut head, cfg_base + PCI_CAPABILITY_LIST)
        .context("Failed to read capability list head")?;

    let mut pos = head[0];
    while pos != 0 {
        let mut hdr = [0u8; 2];
        pread_exact(dev, &mut hdr, cfg_base + u64::from(pos))
            .with_context(|| format!("Failed to read cap header at {:#x}", pos))?;

        if hdr[0] != PCI_CAP_ID_VNDR {
            pos = hdr[1];
            continue;
        }

        let mut raw = [0u8; std::mem::size_of::<VirtioPciCap>()];
        pread_exact(dev, &mut raw, cfg_base + u64::from(pos))
            .with_context(|| format!("Failed to read cap at {:#x}", pos))?;
        let cap: VirtioPciCap = read_obj(&raw).expect("buffer sized for the capability");

        if cap.cfg_type == VIRTIO_PCI_CAP_COMMON_CFG {
            return Ok(cap);
        }
        pos = cap.cap_next;
    }

    bail!("no virtio common-config capability")
}

fn pread_exact(fd: BorrowedFd<'_>, buf: &mut [u8], offset: u64) -> Result<()> {
    let n = pread(fd, buf, offset as i64).context("pread")?;
    if n != buf.len() {
        bail!("short config read: {} of {} bytes", n, buf.len());
    }
    Ok(())
}

/// Write RESET to `device_status` and poll until the device reports it,
/// logging progress once per second.
///
/// The status byte lives in device memory: every access is volatile and
/// fenced so neither the compiler nor the CPU elides or reorders it.
fn reset_device(common_cfg: *mut VirtioPciCommonCfg, timeout_ms: u32) -> Result<()> {
    // SAFETY: common_cfg points into a live MAP_SHARED device mapping.
    unsafe {
        let status = ptr::addr_of_mut!((*common_cfg).device_status);
        fence(Ordering::SeqCst);
        ptr::write_volatile(status, VIRTIO_CONFIG_STATUS_RESET);
        fence(Ordering::SeqCst);

        let mut waited_ms: u32 = 0;
        while ptr::read_volatile(status) != VIRTIO_CONFIG_STATUS_RESET {
            if waited_ms >= timeout_ms {
                warn!("reset {} ms timeout", timeout_ms);
                bail!("reset timed out after {} ms", timeout_ms);
            }
            if waited_ms > 0 && waited_ms % 1000 == 0 {
                info!("device resetting");
            }
            thread::sleep(Duration::from_millis(RESET_POLL_MS));
            waited_ms += RESET_POLL_MS as u32;
            fence(Ordering::SeqCst);
        }
    }
    Ok(())
}

/// Unmap every global DMA aperture entry through the global container.
///
/// Entries are removed from the registry whatever the kernel says; a
/// short unmap is logged.
pub fn flush_global_dma(registry: &mut Registry) {
    let entries = registry.drain_dma_maps();
    if entries.is_empty() {
        return;
    }

    for map in entries {
        let Some(container) = registry.global_container() else {
            error!(
                "No global container; dropping dma map iova({:#x}) len({:#x})",
                map.iova, map.size
            );
            continue;
        };

        let mut unmap = vfio_iommu_type1_dma_unmap {
            argsz: std::mem::size_of::<vfio_iommu_type1_dma_unmap>() as u32,
            iova: map.iova,
            size: map.size,
            ..Default::default()
        };
        // SAFETY: container is a VFIO container descriptor and unmap is
        // the struct the request expects.
        let ret = unsafe { ioctl_with_mut_ref(container, VFIO_IOMMU_UNMAP_DMA(), &mut unmap) };
        if ret != 0 {
            error!(
                "Cannot clear DMA remapping iova({:#x}) len({:#x}): {}",
                map.iova,
                map.size,
                std::io::Error::last_os_error()
            );
        } else if unmap.size != map.size {
            error!(
                "Unexpected size {:#x} of DMA remapping cleared instead of {:#x}",
                unmap.size, map.size
            );
        } else {
            info!(
                "Cleaned up global dma map: iova({:#x}) len({:#x})",
                map.iova, map.size
            );
        }
    }
}
