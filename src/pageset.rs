//! Per-page protection state machine and snapshot membership (spec.md §3
//! "Page info", §4.7). Grounded on original_source's
//! `src/memcheck/addr-range.hh`/`.cc` for the tier derivation rules.

use std::collections::HashMap;

use nix::sys::mman::ProtFlags;

use crate::kernel_abi::page_align_down;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Tier {
    Shared,
    RdOnly,
    RdwrLocked,
    RdwrUnlocked,
}

#[derive(Copy, Clone, Debug)]
pub struct PageInfo {
    pub orig_prot: ProtFlags,
    pub cur_prot: ProtFlags,
    pub map_shared: bool,
    pub tier: Tier,
    pub access_count: u64,
}

impl PageInfo {
    fn derive_tier(map_shared: bool, cur_prot: ProtFlags, was_locked: bool) -> Tier {
        if map_shared {
            return Tier::Shared;
        }
        if !cur_prot.contains(ProtFlags::PROT_WRITE) {
            if was_locked {
                return Tier::RdwrLocked;
            }
            return Tier::RdOnly;
        }
        Tier::RdwrUnlocked
    }
}

/// Canonical record of tracee address space, one entry per 4KiB page.
/// Routes `SIGSEGV` handling and determines which pages participate in
/// snapshot operations (spec.md §4.7: "Only RDWR tiers participate").
#[derive(Default)]
pub struct PageSet {
    pages: HashMap<u64, PageInfo>,
}

impl PageSet {
    pub fn new() -> PageSet {
        PageSet::default()
    }

    pub fn get(&self, addr: u64) -> Option<&PageInfo> {
        self.pages.get(&page_align_down(addr))
    }

    /// `mmap` with `MAP_SHARED`: create SHARED with `cur_prot=PROT_NONE`
    /// so any access faults into the shared-memory sequence point.
    pub fn on_mmap_shared(&mut self, addr: u64) {
        self.pages.insert(
            page_align_down(addr),
            PageInfo {
                orig_prot: ProtFlags::PROT_NONE,
                cur_prot: ProtFlags::PROT_NONE,
                map_shared: true,
                tier: Tier::Shared,
                access_count: 0,
            },
        );
    }

    /// `mmap` private, with the mapping's actual protection flags.
    pub fn on_mmap_private(&mut self, addr: u64, prot: ProtFlags) {
        let tier = PageInfo::derive_tier(false, prot, false);
        self.pages.insert(
            page_align_down(addr),
            PageInfo {
                orig_prot: prot,
                cur_prot: prot,
                map_shared: false,
                tier,
                access_count: 0,
            },
        );
    }

    /// `RDWR_UNLOCKED -> RDWR_LOCKED`; clears `PROT_WRITE` via
    /// `mprotect`. Returns the page's current protection so the caller
    /// can issue the actual `mprotect` remote syscall.
    pub fn lock(&mut self, addr: u64) -> Option<ProtFlags> {
        let key = page_align_down(addr);
        let page = self.pages.get_mut(&key)?;
        if page.tier != Tier::RdwrUnlocked {
            return None;
        }
        page.cur_prot = page.orig_prot & !ProtFlags::PROT_WRITE;
        page.tier = Tier::RdwrLocked;
        Some(page.cur_prot)
    }

    /// `RDWR_LOCKED -> RDWR_UNLOCKED`; restores write permission;
    /// increments `access_count`.
    pub fn unlock(&mut self, addr: u64) -> Option<ProtFlags> {
        let key = page_align_down(addr);
        let page = self.pages.get_mut(&key)?;
        if page.tier != Tier::RdwrLocked {
            return None;
        }
        page.cur_prot = page.orig_prot;
        page.tier = Tier::RdwrUnlocked;
        page.access_count += 1;
        Some(page.cur_prot)
    }

    /// `mprotect`: recompute tier from the new protection.
    pub fn on_mprotect(&mut self, addr: u64, prot: ProtFlags) {
        let key = page_align_down(addr);
        if let Some(page) = self.pages.get_mut(&key) {
            page.orig_prot = prot;
            page.cur_prot = prot;
            page.tier = PageInfo::derive_tier(page.map_shared, prot, false);
        } else {
            self.on_mmap_private(addr, prot);
        }
    }

    /// `munmap`: entry removed. The only tier-exit path for SHARED pages
    /// (spec.md §8 property 6).
    pub fn on_munmap(&mut self, addr: u64) {
        self.pages.remove(&page_align_down(addr));
    }

    pub fn writable_pages(&self) -> Vec<u64> {
        self.pages
            .iter()
            .filter(|(_, p)| matches!(p.tier, Tier::RdwrLocked | Tier::RdwrUnlocked))
            .map(|(&a, _)| a)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shared_page_only_leaves_tier_via_munmap() {
        let mut ps = PageSet::new();
        ps.on_mmap_shared(0x1000);
        assert_eq!(ps.get(0x1000).unwrap().tier, Tier::Shared);
        ps.on_munmap(0x1000);
        assert!(ps.get(0x1000).is_none());
    }

    #[test]
    fn lock_unlock_round_trip() {
        let mut ps = PageSet::new();
        ps.on_mmap_private(0x2000, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE);
        assert_eq!(ps.get(0x2000).unwrap().tier, Tier::RdwrUnlocked);
        ps.lock(0x2000);
        assert_eq!(ps.get(0x2000).unwrap().tier, Tier::RdwrLocked);
        assert!(!ps
            .get(0x2000)
            .unwrap()
            .cur_prot
            .contains(ProtFlags::PROT_WRITE));
        ps.unlock(0x2000);
        assert_eq!(ps.get(0x2000).unwrap().tier, Tier::RdwrUnlocked);
        assert_eq!(ps.get(0x2000).unwrap().access_count, 1);
    }

    #[test]
    fn rdonly_only_transitions_to_rdwr_via_mprotect() {
        let mut ps = PageSet::new();
        ps.on_mmap_private(0x3000, ProtFlags::PROT_READ);
        assert_eq!(ps.get(0x3000).unwrap().tier, Tier::RdOnly);
        ps.on_mprotect(0x3000, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE);
        assert_eq!(ps.get(0x3000).unwrap().tier, Tier::RdwrUnlocked);
    }
}
