//! Supplemental Page Table - Address Space Management
//!
//! The supplemental page table ([`Spt`]) is the authoritative record of what
//! *should* be mapped in one address space, independent of what the hardware
//! table currently holds: one [`Page`] per virtual page, keyed by its
//! page-aligned address.
//!
//! Pages are created lazily — every allocation request produces an Uninit
//! page carrying a deferred initializer — and bound to physical frames on
//! demand through the claim path. Fork support is an eager full copy:
//! [`Spt::copy`] recreates every entry in the child, forces materialization,
//! and duplicates frame content byte for byte.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

use crate::types::SpaceId;
use crate::vm::addr::{is_null_page, is_user_addr, trunc_page};
use crate::vm::backing::{Backing, PageInit, PageKind, Target};
use crate::vm::frame::{copy_frame, frame_bytes, FrameIndex, FramePool};
use crate::vm::mapping::MappingTable;
use crate::vm::VmError;

// ============================================================================
// Page
// ============================================================================

/// Mutable state of a page: its backing variant and its current frame
/// binding. The frame link mirrors the pool's owner back-reference; both are
/// updated only by the claim/evict/destroy paths.
pub(crate) struct PageState {
    pub(crate) backing: Backing,
    pub(crate) frame: Option<FrameIndex>,
}

/// One virtual page within an address space.
///
/// Owned by its [`Spt`] entry. The frame pool keeps only a weak
/// back-reference for eviction bookkeeping.
pub struct Page {
    /// Page-aligned virtual address; unique within the owning table
    pub va: u64,
    /// Write permission, fixed at creation
    pub writable: bool,
    /// Owning address space
    pub space: SpaceId,
    /// The owning space's hardware table, carried so eviction from a
    /// foreign context can invalidate the mapping
    pub(crate) hw: Arc<dyn MappingTable>,
    pub(crate) state: Mutex<PageState>,
}

impl Page {
    pub(crate) fn new(
        va: u64,
        writable: bool,
        space: SpaceId,
        hw: Arc<dyn MappingTable>,
        backing: Backing,
    ) -> Arc<Self> {
        Arc::new(Self {
            va: trunc_page(va),
            writable,
            space,
            hw,
            state: Mutex::new(PageState {
                backing,
                frame: None,
            }),
        })
    }

    /// Effective backing kind (lazy pages report their declared target)
    pub fn kind(&self) -> PageKind {
        self.state.lock().backing.kind()
    }

    /// Check whether a frame is currently bound
    pub fn is_resident(&self) -> bool {
        self.state.lock().frame.is_some()
    }
}

// ============================================================================
// Claim Path
// ============================================================================

/// Materialize `page` and leave its frame pinned.
///
/// If the page is already resident its frame is pinned and returned.
/// Otherwise a frame is acquired (possibly evicting), the backing variant
/// populates it, and the hardware mapping is installed with the page's
/// permission. On failure the frame goes straight back to the pool.
pub(crate) fn claim_pinned(page: &Arc<Page>, pool: &FramePool) -> Result<FrameIndex, VmError> {
    if let Some(idx) = pool.pin_bound_frame(page) {
        return Ok(idx);
    }
    let idx = pool.acquire(page)?;
    let pa = pool.pa_of(idx);

    let mut st = page.state.lock();
    if let Err(e) = st.backing.materialize(frame_bytes(pa), pool.swap()) {
        drop(st);
        pool.release(idx);
        return Err(e);
    }
    if !page.hw.install(page.va, pa, page.writable) {
        drop(st);
        pool.release(idx);
        return Err(VmError::MappingFailed);
    }
    st.frame = Some(idx);
    Ok(idx)
}

/// Materialize `page`: bind a frame, populate it, install the mapping.
pub(crate) fn claim(page: &Arc<Page>, pool: &FramePool) -> Result<(), VmError> {
    let idx = claim_pinned(page, pool)?;
    pool.unpin(idx);
    Ok(())
}

/// Tear one page down: write back dirty file content, release any bound
/// frame, drop variant resources.
pub(crate) fn destroy_page(page: &Arc<Page>, pool: &FramePool) {
    if let Some(idx) = pool.pin_bound_frame(page) {
        let pa = pool.pa_of(idx);
        let mut st = page.state.lock();
        if let Backing::File { file, offset, len } = &st.backing {
            if page.writable && page.hw.dirty(page.va) {
                let n = (*len).min(crate::vm::addr::PAGE_SIZE);
                if let Err(e) = file.write_at(*offset, &frame_bytes(pa)[..n]) {
                    log::warn!("write-back on teardown failed for page {:#x}: {:?}", page.va, e);
                }
            }
        }
        page.hw.clear(page.va);
        st.frame = None;
        st.backing.destroy(pool.swap());
        drop(st);
        pool.release(idx);
    } else {
        page.state.lock().backing.destroy(pool.swap());
    }
}

// ============================================================================
// Supplemental Page Table
// ============================================================================

/// Per-address-space directory of pages.
///
/// Not internally synchronized: per-space serialization is the embedder's
/// contract (one faulting thread per space, or an external lock around it).
pub struct Spt {
    /// Owning address space
    pub space: SpaceId,
    hw: Arc<dyn MappingTable>,
    pages: BTreeMap<u64, Arc<Page>>,
}

impl Spt {
    /// Create an empty table for one address space
    pub fn new(space: SpaceId, hw: Arc<dyn MappingTable>) -> Self {
        Self {
            space,
            hw,
            pages: BTreeMap::new(),
        }
    }

    /// The hardware table this space maps through
    pub fn hw(&self) -> &Arc<dyn MappingTable> {
        &self.hw
    }

    /// Number of pages in the table
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Check whether the table holds no pages
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Look up the page covering `va`. Rounds down to the page boundary;
    /// never mutates and never allocates.
    pub fn find(&self, va: u64) -> Option<&Arc<Page>> {
        self.pages.get(&trunc_page(va))
    }

    /// Record a new lazily-initialized page at `va`.
    ///
    /// The page is created in Uninit form carrying `init` and its declared
    /// `target` kind; it materializes on first claim. Fails with
    /// [`VmError::Occupied`] when a page already covers `va` (the existing
    /// page is never overwritten) and [`VmError::BadAddress`] for null or
    /// kernel-space addresses.
    pub fn alloc_page_with_initializer(
        &mut self,
        va: u64,
        writable: bool,
        target: Target,
        init: Option<PageInit>,
    ) -> Result<(), VmError> {
        if is_null_page(va) || !is_user_addr(va) {
            return Err(VmError::BadAddress);
        }
        let key = trunc_page(va);
        if self.pages.contains_key(&key) {
            return Err(VmError::Occupied);
        }
        let page = Page::new(
            key,
            writable,
            self.space,
            self.hw.clone(),
            Backing::uninit(target, init),
        );
        self.pages.insert(key, page);
        Ok(())
    }

    /// Record a new page without a custom initializer: Anon targets
    /// zero-fill, File targets load their region on first claim.
    pub fn alloc_page(&mut self, va: u64, writable: bool, target: Target) -> Result<(), VmError> {
        self.alloc_page_with_initializer(va, writable, target, None)
    }

    /// Force materialization of the page at `va`
    pub fn claim_page(&self, va: u64, pool: &FramePool) -> Result<(), VmError> {
        let page = self.find(va).ok_or(VmError::NotFound)?;
        claim(page, pool)
    }

    /// Effective kind of the page at `va`
    pub fn page_kind(&self, va: u64) -> Option<PageKind> {
        self.find(va).map(|p| p.kind())
    }

    /// Unbind and destroy the page covering `va`. Returns `false` when no
    /// page covers it.
    pub fn remove(&mut self, va: u64, pool: &FramePool) -> bool {
        match self.pages.remove(&trunc_page(va)) {
            Some(page) => {
                destroy_page(&page, pool);
                true
            }
            None => false,
        }
    }

    /// Destroy every page, releasing frames and writing back dirty
    /// file-backed content first.
    pub fn kill(&mut self, pool: &FramePool) {
        while let Some((_, page)) = self.pages.pop_first() {
            destroy_page(&page, pool);
        }
    }

    /// Duplicate `src` into `dst` for fork: every entry is recreated,
    /// force-materialized, and its frame content copied byte for byte, so
    /// child and parent end up with equal content on distinct frames.
    ///
    /// Uninit entries are recreated retagged as Anonymous-backed (the
    /// child never re-runs the parent's one-shot initializer); Anon and
    /// File entries keep their backing parameters. Unmaterialized source
    /// pages are claimed on demand so their content exists to copy.
    ///
    /// On any failure `dst` is torn down completely before the error
    /// returns; a partially-built address space never survives.
    pub fn copy(dst: &mut Spt, src: &Spt, pool: &FramePool) -> Result<(), VmError> {
        let result = Self::copy_pages(dst, src, pool);
        if result.is_err() {
            dst.kill(pool);
        }
        result
    }

    fn copy_pages(dst: &mut Spt, src: &Spt, pool: &FramePool) -> Result<(), VmError> {
        for (&va, spage) in src.pages.iter() {
            let target = {
                let st = spage.state.lock();
                match &st.backing {
                    Backing::Uninit { .. } | Backing::Anon { .. } => Target::Anon,
                    Backing::File { file, offset, len } => Target::File {
                        file: file.clone(),
                        offset: *offset,
                        len: *len,
                    },
                }
            };
            dst.alloc_page_with_initializer(va, spage.writable, target, None)?;
            let dpage = dst.find(va).ok_or(VmError::NotFound)?.clone();

            let s_idx = claim_pinned(spage, pool)?;
            let d_idx = match claim_pinned(&dpage, pool) {
                Ok(idx) => idx,
                Err(e) => {
                    pool.unpin(s_idx);
                    return Err(e);
                }
            };
            copy_frame(pool.pa_of(s_idx), pool.pa_of(d_idx));
            pool.unpin(s_idx);
            pool.unpin(d_idx);
        }
        Ok(())
    }

    /// Check the frame↔mapping consistency invariant: a page is resident
    /// exactly when its hardware mapping is installed.
    pub fn is_consistent(&self) -> bool {
        self.pages
            .values()
            .all(|p| p.is_resident() == self.hw.is_mapped(p.va))
    }
}
