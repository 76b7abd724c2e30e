//! Software page directory.
//!
//! Stands in for the CPU-specific page tables: a per-address-space map
//! from user page to frame plus the writable, accessed, and dirty bits.
//! The address-space access helpers play the MMU, setting accessed and
//! dirty on every emulated access; the frame table's victim policy reads
//! and clears accessed, and eviction consults dirty.

use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::vm::addr::UserPage;
use crate::vm::frame::FrameId;

struct PdEntry {
    frame: FrameId,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

pub struct PageDir {
    inner: Mutex<BTreeMap<UserPage, PdEntry>>,
}

impl PageDir {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    /// Installs a mapping. Returns false if `upage` is already mapped.
    pub(crate) fn map(&self, upage: UserPage, frame: FrameId, writable: bool) -> bool {
        let mut inner = self.inner.lock();
        if inner.contains_key(&upage) {
            return false;
        }
        inner.insert(
            upage,
            PdEntry {
                frame,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    /// Drops the mapping for `upage`, if any.
    pub(crate) fn clear(&self, upage: UserPage) {
        self.inner.lock().remove(&upage);
    }

    /// Current mapping for `upage` as `(frame, writable)`.
    pub(crate) fn get(&self, upage: UserPage) -> Option<(FrameId, bool)> {
        self.inner
            .lock()
            .get(&upage)
            .map(|e| (e.frame, e.writable))
    }

    /// Reads and clears the accessed bit. The page must be mapped.
    pub(crate) fn test_and_clear_accessed(&self, upage: UserPage) -> bool {
        let mut inner = self.inner.lock();
        let e = inner.get_mut(&upage).expect("pagedir: unmapped page");
        core::mem::replace(&mut e.accessed, false)
    }

    pub(crate) fn is_dirty(&self, upage: UserPage) -> bool {
        self.inner.lock().get(&upage).map_or(false, |e| e.dirty)
    }

    /// Records an emulated access, as the hardware would.
    pub(crate) fn mark_access(&self, upage: UserPage, write: bool) {
        let mut inner = self.inner.lock();
        if let Some(e) = inner.get_mut(&upage) {
            e.accessed = true;
            if write {
                e.dirty = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessed_and_dirty_bits() {
        let pd = PageDir::new();
        let p = UserPage::containing(0x8000_0000);
        assert!(pd.map(p, FrameId(0), true));
        assert!(!pd.map(p, FrameId(1), true));

        assert!(!pd.test_and_clear_accessed(p));
        pd.mark_access(p, false);
        assert!(pd.test_and_clear_accessed(p));
        assert!(!pd.test_and_clear_accessed(p));

        assert!(!pd.is_dirty(p));
        pd.mark_access(p, true);
        assert!(pd.is_dirty(p));

        pd.clear(p);
        assert_eq!(pd.get(p), None);
    }
}
