// SPDX-License-Identifier: GPL-3.0-only

//! Cross-domain page sharing.
//!
//! A shared buffer is described by an ordered list of grant references, one
//! per page. The order of the list is the page order of the buffer. Which
//! domain allocated the references decides who owns the pages: either the
//! foreign domain granted them and we map them, or we allocate and grant them
//! to the foreign domain and hand the references back.

use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use super::{
    error::{Error, Result},
    geometry::{host_page_size, page_count},
};

pub type GrantRef = u32;
pub type GrantRefs = Vec<GrantRef>;
pub type DomId = u16;

/// Domain id the local grant table uses for pages it owns itself.
pub const DOMID_SELF: DomId = 0x7ff0;

/// Access to grant-table operations of the hypervisor.
pub trait GrantTable: Send + Sync {
    fn page_size(&self) -> usize;

    /// Map the pages `dom_id` granted to us, in the given order.
    fn map_refs(&self, dom_id: DomId, refs: &[GrantRef]) -> Result<Box<dyn GrantMapping>>;

    /// Allocate `pages` fresh pages and grant them to `dom_id`.
    fn alloc_refs(&self, dom_id: DomId, pages: usize) -> Result<(GrantRefs, Box<dyn GrantMapping>)>;
}

/// A contiguous view of mapped grant pages.
pub trait GrantMapping: Send + Sync {
    fn len(&self) -> usize;

    /// Copy `dst.len()` bytes starting at `offset` out of the mapping.
    fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()>;
}

/// Memory shared with a foreign domain through grant references.
pub struct GrantBuffer {
    dom_id: DomId,
    refs: GrantRefs,
    size: usize,
    mapping: Box<dyn GrantMapping>,
}

impl fmt::Debug for GrantBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrantBuffer")
            .field("dom_id", &self.dom_id)
            .field("refs", &self.refs)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl GrantBuffer {
    /// Share `size` bytes with `dom_id`.
    ///
    /// With `alloc_refs` set, pages are allocated here and `refs` is
    /// overwritten with their references. Otherwise `refs` must hold exactly
    /// one reference per page of `size`, already granted by `dom_id`.
    pub fn new(
        table: &dyn GrantTable,
        dom_id: DomId,
        refs: &mut GrantRefs,
        alloc_refs: bool,
        size: usize,
    ) -> Result<GrantBuffer> {
        let pages = page_count(size, table.page_size());

        let mapping = if alloc_refs {
            let (allocated, mapping) = table.alloc_refs(dom_id, pages)?;
            *refs = allocated;
            mapping
        } else {
            if refs.len() != pages {
                return Err(Error::InvalidGrantRefCount {
                    got: refs.len(),
                    expected: pages,
                });
            }
            table.map_refs(dom_id, refs)?
        };

        Ok(GrantBuffer {
            dom_id,
            refs: refs.clone(),
            size,
            mapping,
        })
    }

    pub fn dom_id(&self) -> DomId {
        self.dom_id
    }

    pub fn refs(&self) -> &[GrantRef] {
        &self.refs
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy the shared contents into `dst`, which must hold `size()` bytes.
    pub fn read_into(&self, dst: &mut [u8]) -> Result<()> {
        let len = self.size.min(dst.len());
        self.mapping.read(0, &mut dst[..len])
    }
}

struct Page {
    data: Mutex<Box<[u8]>>,
    revoked: AtomicBool,
}

struct Grant {
    owner: DomId,
    peer: DomId,
    page: Arc<Page>,
}

#[derive(Default)]
struct GrantState {
    next_ref: GrantRef,
    grants: HashMap<GrantRef, Grant>,
}

impl GrantState {
    fn insert(&mut self, owner: DomId, peer: DomId, page: Arc<Page>) -> GrantRef {
        // reference 0 is reserved by the hypervisor ABI
        self.next_ref = self.next_ref.wrapping_add(1).max(1);
        while self.grants.contains_key(&self.next_ref) {
            self.next_ref = self.next_ref.wrapping_add(1).max(1);
        }
        self.grants.insert(self.next_ref, Grant { owner, peer, page });
        self.next_ref
    }
}

/// In-process grant table.
///
/// Keeps every granted page in memory and lets the caller act as the foreign
/// domain: grant pages to us, write into them, or revoke them.
#[derive(Clone)]
pub struct LocalGrantTable {
    page_size: usize,
    state: Arc<Mutex<GrantState>>,
}

impl fmt::Debug for LocalGrantTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalGrantTable")
            .field("page_size", &self.page_size)
            .field("grants", &self.state.lock().grants.len())
            .finish()
    }
}

impl Default for LocalGrantTable {
    fn default() -> Self {
        LocalGrantTable::new(host_page_size())
    }
}

impl LocalGrantTable {
    pub fn new(page_size: usize) -> LocalGrantTable {
        LocalGrantTable {
            page_size,
            state: Arc::new(Mutex::new(GrantState::default())),
        }
    }

    /// Grant `count` zeroed pages owned by `owner` to the local domain.
    pub fn grant_pages(&self, owner: DomId, count: usize) -> GrantRefs {
        let mut state = self.state.lock();
        (0..count)
            .map(|_| state.insert(owner, DOMID_SELF, self.new_page()))
            .collect()
    }

    /// Write into a granted page, as the domain on either side would.
    pub fn write(&self, gref: GrantRef, offset: usize, data: &[u8]) -> Result<()> {
        let page = self.page(gref)?;
        let mut contents = page.data.lock();
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= contents.len());
        let Some(end) = end else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("write of {} bytes at {} exceeds page", data.len(), offset),
            )
            .into());
        };
        contents[offset..end].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, gref: GrantRef, offset: usize, dst: &mut [u8]) -> Result<()> {
        let page = self.page(gref)?;
        let contents = page.data.lock();
        let src = offset
            .checked_add(dst.len())
            .and_then(|end| contents.get(offset..end))
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// End a grant. Existing mappings of the page fail from now on.
    pub fn revoke(&self, gref: GrantRef) {
        if let Some(grant) = self.state.lock().grants.remove(&gref) {
            grant.page.revoked.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_granted(&self, gref: GrantRef) -> bool {
        self.state.lock().grants.contains_key(&gref)
    }

    fn new_page(&self) -> Arc<Page> {
        Arc::new(Page {
            data: Mutex::new(vec![0; self.page_size].into_boxed_slice()),
            revoked: AtomicBool::new(false),
        })
    }

    fn page(&self, gref: GrantRef) -> Result<Arc<Page>> {
        self.state
            .lock()
            .grants
            .get(&gref)
            .map(|grant| grant.page.clone())
            .ok_or(Error::GrantRevoked(gref))
    }
}

impl GrantTable for LocalGrantTable {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map_refs(&self, dom_id: DomId, refs: &[GrantRef]) -> Result<Box<dyn GrantMapping>> {
        let state = self.state.lock();
        let pages = refs
            .iter()
            .map(|gref| match state.grants.get(gref) {
                Some(grant) if grant.owner == dom_id && grant.peer == DOMID_SELF => {
                    Ok((*gref, grant.page.clone()))
                }
                _ => Err(Error::GrantMap {
                    dom_id,
                    gref: *gref,
                }),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Box::new(LocalMapping {
            page_size: self.page_size,
            pages,
            owned: None,
        }))
    }

    fn alloc_refs(&self, dom_id: DomId, pages: usize) -> Result<(GrantRefs, Box<dyn GrantMapping>)> {
        let mut state = self.state.lock();
        let pages = (0..pages)
            .map(|_| {
                let page = self.new_page();
                (state.insert(DOMID_SELF, dom_id, page.clone()), page)
            })
            .collect::<Vec<_>>();
        let refs = pages.iter().map(|(gref, _)| *gref).collect();

        Ok((
            refs,
            Box::new(LocalMapping {
                page_size: self.page_size,
                pages,
                owned: Some(self.state.clone()),
            }),
        ))
    }
}

struct LocalMapping {
    page_size: usize,
    pages: Vec<(GrantRef, Arc<Page>)>,
    // set when the grants were allocated by us and must be ended on unmap
    owned: Option<Arc<Mutex<GrantState>>>,
}

impl GrantMapping for LocalMapping {
    fn len(&self) -> usize {
        self.pages.len() * self.page_size
    }

    fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        if offset
            .checked_add(dst.len())
            .map_or(true, |end| end > self.len())
        {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }

        let mut pos = offset;
        let mut written = 0;
        while written < dst.len() {
            let (gref, page) = &self.pages[pos / self.page_size];
            if page.revoked.load(Ordering::SeqCst) {
                return Err(Error::GrantRevoked(*gref));
            }
            let start = pos % self.page_size;
            let len = (self.page_size - start).min(dst.len() - written);
            dst[written..written + len].copy_from_slice(&page.data.lock()[start..start + len]);
            written += len;
            pos += len;
        }

        Ok(())
    }
}

impl Drop for LocalMapping {
    fn drop(&mut self) {
        if let Some(state) = self.owned.take() {
            let mut state = state.lock();
            for (gref, _) in &self.pages {
                state.grants.remove(gref);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    #[test]
    fn maps_foreign_pages_in_order() {
        let table = LocalGrantTable::new(PAGE);
        let mut refs = table.grant_pages(5, 2);
        table.write(refs[0], 0, b"first").unwrap();
        table.write(refs[1], 0, b"second").unwrap();

        let buffer = GrantBuffer::new(&table, 5, &mut refs, false, PAGE + 6).unwrap();
        let mut contents = vec![0; buffer.size()];
        buffer.read_into(&mut contents).unwrap();

        assert_eq!(buffer.dom_id(), 5);
        assert_eq!(&contents[..5], b"first");
        assert_eq!(&contents[PAGE..], b"second");
    }

    #[test]
    fn out_of_range_offsets_are_errors() {
        let table = LocalGrantTable::new(PAGE);
        let refs = table.grant_pages(2, 1);

        table.write(refs[0], PAGE - 2, &[1, 2]).unwrap();
        let mut tail = [0; 2];
        table.read(refs[0], PAGE - 2, &mut tail).unwrap();
        assert_eq!(tail, [1, 2]);

        assert!(table.write(refs[0], PAGE - 1, &[1, 2]).is_err());
        assert!(table.write(refs[0], usize::MAX, &[1]).is_err());
        assert!(table.read(refs[0], usize::MAX, &mut tail).is_err());

        let mapping = table.map_refs(2, &refs).unwrap();
        assert!(mapping.read(usize::MAX, &mut tail).is_err());
        assert!(mapping.read(PAGE - 1, &mut tail).is_err());
    }

    #[test]
    fn rejects_wrong_ref_count() {
        let table = LocalGrantTable::new(PAGE);
        let mut refs = table.grant_pages(5, 2);

        for size in [PAGE, 2 * PAGE + 1] {
            match GrantBuffer::new(&table, 5, &mut refs, false, size) {
                Err(Error::InvalidGrantRefCount { got: 2, .. }) => {}
                other => panic!("unexpected result {:?}", other),
            }
        }
        refs.clear();
        assert!(GrantBuffer::new(&table, 5, &mut refs, false, 1).is_err());
    }

    #[test]
    fn rejects_refs_of_other_domain() {
        let table = LocalGrantTable::new(PAGE);
        let mut refs = table.grant_pages(5, 1);

        assert!(matches!(
            GrantBuffer::new(&table, 6, &mut refs, false, PAGE),
            Err(Error::GrantMap { dom_id: 6, .. })
        ));
    }

    #[test]
    fn allocated_refs_are_returned_and_ended_on_drop() {
        let table = LocalGrantTable::new(PAGE);
        let mut refs = vec![42];

        let buffer = GrantBuffer::new(&table, 3, &mut refs, true, 3 * PAGE - 1).unwrap();
        assert_eq!(refs.len(), 3);
        assert_eq!(buffer.refs(), &refs[..]);
        assert!(refs.iter().all(|gref| table.is_granted(*gref)));

        // the foreign domain fills the pages we granted it
        table.write(refs[2], 10, &[7, 7]).unwrap();
        let mut contents = vec![0; buffer.size()];
        buffer.read_into(&mut contents).unwrap();
        assert_eq!(&contents[2 * PAGE + 10..2 * PAGE + 12], &[7, 7]);

        drop(buffer);
        assert!(refs.iter().all(|gref| !table.is_granted(*gref)));
    }

    #[test]
    fn revoked_page_fails_reads() {
        let table = LocalGrantTable::new(PAGE);
        let mut refs = table.grant_pages(1, 1);
        let buffer = GrantBuffer::new(&table, 1, &mut refs, false, 16).unwrap();

        table.revoke(refs[0]);
        let mut contents = vec![0; 16];
        assert!(matches!(
            buffer.read_into(&mut contents),
            Err(Error::GrantRevoked(_))
        ));
    }
}
