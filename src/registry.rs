use std::os::fd::OwnedFd;

use anyhow::{bail, Result};
use log::info;

use crate::message::{DeviceName, DmaMap, MemRegion, VfDevArgs, MAX_MEM_REGIONS};

/// A virtual function held on behalf of the worker.
///
/// The record owns every descriptor stored in it; dropping the record
/// closes them. The region array is inline and sized for the maximum so
/// that DMA table updates never move the record.
pub struct VfEntry {
    /// Device arguments as last stored by the worker.
    pub devargs: VfDevArgs,
    /// VFIO container descriptor.
    pub vfio_container: OwnedFd,
    /// VFIO group descriptor.
    pub vfio_group: OwnedFd,
    /// VFIO device descriptor.
    pub vfio_device: OwnedFd,
    /// Vhost-user socket descriptor, absent until the worker stores one.
    pub vhost: Option<OwnedFd>,
    nregions: u32,
    regions: [MemRegion; MAX_MEM_REGIONS],
}

impl VfEntry {
    fn new(
        devargs: VfDevArgs,
        container: OwnedFd,
        group: OwnedFd,
        device: OwnedFd,
    ) -> Box<Self> {
        Box::new(Self {
            devargs,
            vfio_container: container,
            vfio_group: group,
            vfio_device: device,
            vhost: None,
            nregions: 0,
            regions: [MemRegion::default(); MAX_MEM_REGIONS],
        })
    }

    /// The VF's BDF.
    pub fn name(&self) -> DeviceName {
        self.devargs.vf_name
    }

    /// Replace the vhost descriptor, closing any previous one.
    pub fn set_vhost(&mut self, fd: OwnedFd) {
        if self.vhost.is_some() {
            info!("Close vf {} old vhost fd", self.devargs.vf_name);
        }
        self.vhost = Some(fd);
    }

    /// Close and forget the vhost descriptor.
    pub fn clear_vhost(&mut self) {
        self.vhost = None;
    }

    /// Replace the DMA memory table in place.
    ///
    /// Fails when the region count exceeds the record's fixed capacity.
    /// `mem_tbl_in_use` follows the new region count.
    pub fn store_mem_table(&mut self, regions: &[MemRegion]) -> Result<()> {
        if regions.len() > MAX_MEM_REGIONS {
            bail!(
                "DMA table of {} regions exceeds capacity {}",
                regions.len(),
                MAX_MEM_REGIONS
            );
        }
        self.regions[..regions.len()].copy_from_slice(regions);
        self.nregions = regions.len() as u32;
        self.devargs.mem_tbl_in_use = u8::from(!regions.is_empty());
        Ok(())
    }

    /// Clear the DMA memory table. Descriptors are untouched.
    pub fn clear_mem_table(&mut self) {
        self.nregions = 0;
        self.devargs.mem_tbl_in_use = 0;
    }

    /// The stored DMA regions.
    pub fn mem_table(&self) -> &[MemRegion] {
        &self.regions[..self.nregions as usize]
    }
}

/// A physical function held on behalf of the worker, with its VFs.
pub struct PfEntry {
    /// The PF's BDF.
    pub name: DeviceName,
    /// VFIO group descriptor.
    pub vfio_group: OwnedFd,
    /// VFIO device descriptor.
    pub vfio_device: OwnedFd,
    vfs: Vec<Box<VfEntry>>,
}

impl PfEntry {
    /// Number of VFs under this PF.
    pub fn nr_vf(&self) -> usize {
        self.vfs.len()
    }

    /// Iterate the PF's VFs in insertion order.
    pub fn vfs(&self) -> impl Iterator<Item = &VfEntry> {
        self.vfs.iter().map(|vf| vf.as_ref())
    }

    /// Iterate the PF's VFs mutably, in insertion order.
    pub fn vfs_mut(&mut self) -> impl Iterator<Item = &mut VfEntry> {
        self.vfs.iter_mut().map(|vf| vf.as_mut())
    }

    /// Look up a VF by BDF, newest store first.
    pub fn vf(&self, name: &DeviceName) -> Option<&VfEntry> {
        self.vfs
            .iter()
            .rev()
            .find(|vf| vf.name() == *name)
            .map(|vf| vf.as_ref())
    }

    /// Look up a VF by BDF, mutably, newest store first.
    pub fn vf_mut(&mut self, name: &DeviceName) -> Option<&mut VfEntry> {
        self.vfs
            .iter_mut()
            .rev()
            .find(|vf| vf.name() == *name)
            .map(|vf| vf.as_mut())
    }
}

/// In-memory catalog of everything the custodian holds: PFs with their
/// VFs, the global container descriptor and the global DMA aperture.
///
/// Single-threaded owner semantics: only the reactor mutates the
/// registry. Descriptor lifetime follows record lifetime.
#[derive(Default)]
pub struct Registry {
    pfs: Vec<PfEntry>,
    global_container: Option<OwnedFd>,
    dma_tbl: Vec<DmaMap>,
}

impl Registry {
    /// Number of stored PFs.
    pub fn nr_pf(&self) -> usize {
        self.pfs.len()
    }

    /// Iterate stored PFs in insertion order.
    pub fn pfs(&self) -> impl Iterator<Item = &PfEntry> {
        self.pfs.iter()
    }

    /// Store a PF context, taking ownership of its descriptors.
    ///
    /// The protocol contract is that the worker does not re-store a BDF;
    /// a duplicate is not checked for. Lookups and removal walk newest
    /// first, so a re-stored BDF shadows the older entry rather than
    /// stranding the new one.
    pub fn insert_pf(&mut self, name: DeviceName, group: OwnedFd, device: OwnedFd) {
        self.pfs.push(PfEntry {
            name,
            vfio_group: group,
            vfio_device: device,
            vfs: Vec::new(),
        });
    }

    /// Look up a PF by BDF, newest store first.
    pub fn pf(&self, name: &DeviceName) -> Option<&PfEntry> {
        self.pfs.iter().rev().find(|pf| pf.name == *name)
    }

    /// Look up a PF by BDF, mutably, newest store first.
    pub fn pf_mut(&mut self, name: &DeviceName) -> Option<&mut PfEntry> {
        self.pfs.iter_mut().rev().find(|pf| pf.name == *name)
    }

    /// Remove a PF and every VF under it, closing all owned descriptors.
    /// The newest store of the BDF is the one removed.
    ///
    /// Returns false when the BDF is not present (which is still success
    /// at the protocol level; removes are idempotent).
    pub fn remove_pf(&mut self, name: &DeviceName) -> bool {
        match self.pfs.iter().rposition(|pf| pf.name == *name) {
            Some(idx) => {
                let pf = self.pfs.remove(idx);
                info!("Removed pf {} ctx with {} vf", pf.name, pf.nr_vf());
                true
            }
            None => false,
        }
    }

    /// Store a VF under its parent PF, taking ownership of the three
    /// VFIO descriptors. The vhost descriptor starts out absent.
    pub fn insert_vf(
        &mut self,
        pf_name: &DeviceName,
        devargs: VfDevArgs,
        container: OwnedFd,
        group: OwnedFd,
        device: OwnedFd,
    ) -> Result<()> {
        let Some(pf) = self.pf_mut(pf_name) else {
            bail!("pf {} not stored", pf_name);
        };
        pf.vfs.push(VfEntry::new(devargs, container, group, device));
        Ok(())
    }

    /// Look up a VF by (PF BDF, VF BDF), mutably.
    pub fn vf_mut(&mut self, pf_name: &DeviceName, vf_name: &DeviceName) -> Option<&mut VfEntry> {
        self.pf_mut(pf_name)?.vf_mut(vf_name)
    }

    /// Remove a VF, closing all of its descriptors. The newest store of
    /// the BDF is the one removed. Returns false when absent.
    pub fn remove_vf(&mut self, pf_name: &DeviceName, vf_name: &DeviceName) -> bool {
        let Some(pf) = self.pf_mut(pf_name) else {
            return false;
        };
        match pf.vfs.iter().rposition(|vf| vf.name() == *vf_name) {
            Some(idx) => {
                pf.vfs.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Replace the global container descriptor, closing any previous one.
    pub fn set_global_container(&mut self, fd: OwnedFd) {
        self.global_container = Some(fd);
    }

    /// The global container descriptor, if stored.
    pub fn global_container(&self) -> Option<&OwnedFd> {
        self.global_container.as_ref()
    }

    /// Record a global DMA aperture mapping.
    ///
    /// iova is unique within the table: a second store with the same iova
    /// is a no-op and the first-stored size wins.
    pub fn store_dma_map(&mut self, map: DmaMap) {
        if self.dma_tbl.iter().any(|e| e.iova == map.iova) {
            return;
        }
        self.dma_tbl.push(map);
    }

    /// Forget a global DMA aperture mapping by iova; size is not part of
    /// the match.
    pub fn remove_dma_map(&mut self, iova: u64) {
        self.dma_tbl.retain(|e| e.iova != iova);
    }

    /// The global DMA aperture entries in insertion order.
    pub fn dma_maps(&self) -> &[DmaMap] {
        &self.dma_tbl
    }

    /// Empty the global DMA aperture table, returning its entries.
    pub fn drain_dma_maps(&mut self) -> Vec<DmaMap> {
        std::mem::take(&mut self.dma_tbl)
    }
}
