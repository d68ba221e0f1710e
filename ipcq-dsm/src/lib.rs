//! Dynamic shared-memory segment registry.
//!
//! Ported from PipelineDB's `dsm.c`: a single control segment holds a fixed
//! table of `(handle, refcnt)` entries; every other segment is looked up by
//! its random, non-zero `handle` and mapped independently. Refcount
//! convention, taken straight from the original:
//!
//! - `refcnt >= 2` — one or more processes are attached.
//! - `refcnt == 1` — registered, but nothing attached ("moribund"); the slot
//!   is still reserved until `destroy` is called.
//! - `refcnt == 0` — the slot is free and its backing file has been removed.
//!
//! Segments are backed by files under a base directory and mapped with
//! `memmap2`, standing in for `/dev/shm` POSIX segments; the original's
//! `DSM_IMPL_MMAP` path is the closest analogue the teacher's dependency
//! list already provides (`memmap2` is a root dependency of the teacher).

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use thiserror::Error;

pub type Handle = u64;

const CONTROL_FILE_NAME: &str = "dsm_control";
const SEGMENT_PREFIX: &str = "dsm_seg_";

#[derive(Error, Debug)]
pub enum DsmError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown segment handle {0}")]
    UnknownHandle(Handle),
    #[error("segment {0} is still attached ({1} references)")]
    StillAttached(Handle, u32),
    #[error("control table is full ({0} entries)")]
    TableFull(usize),
}

#[derive(Debug, Clone, Copy)]
struct ControlItem {
    handle: Handle,
    refcnt: u32,
}

/// One registered `on_detach` callback. Stored as `FnOnce` since the
/// original's callback fires exactly once, just before the segment's
/// refcount is decremented.
type DetachCallback = Box<dyn FnOnce() + Send>;

/// A live mapping of one segment. Dropping the last clone detaches it from
/// the registry's bookkeeping (decrements `refcnt`) but does not destroy it;
/// destruction is an explicit `Registry::destroy` call, mirroring the
/// original's separation between "nobody's attached" and "gone".
///
/// Each `Segment` value owns its own `on_detach` callback stack, matching
/// `dsm_segment`'s per-struct `on_detach` slist — cloning (the equivalent of
/// a fresh local attachment) starts with an empty stack rather than sharing
/// the original's.
pub struct Segment {
    handle: Handle,
    mmap: Arc<Mutex<MmapMut>>,
    registry: Arc<RegistryInner>,
    on_detach: Mutex<Vec<DetachCallback>>,
    /// Set by `keep_mapping`: suppresses the refcount decrement an implicit
    /// (`Drop`-driven) detach would otherwise perform. An explicit call to
    /// `detach` always runs to completion regardless of this flag.
    kept_mapping: AtomicBool,
    detached: AtomicBool,
}

impl Segment {
    fn fresh(handle: Handle, mmap: Arc<Mutex<MmapMut>>, registry: Arc<RegistryInner>) -> Self {
        Segment {
            handle,
            mmap,
            registry,
            on_detach: Mutex::new(Vec::new()),
            kept_mapping: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.mmap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.mmap.lock())
    }

    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.mmap.lock())
    }

    /// Registers a callback run when this segment handle is detached (either
    /// explicitly via [`detach`](Self::detach) or implicitly on `Drop`),
    /// before the refcount is decremented. Callbacks run most-recently-
    /// registered first, matching the original's stack (`slist_push_head` /
    /// `slist_pop_head_node`) rather than a FIFO queue.
    pub fn on_detach(&self, cb: impl FnOnce() + Send + 'static) {
        self.on_detach.lock().push(Box::new(cb));
    }

    fn run_detach_callbacks(&self) {
        loop {
            let Some(cb) = self.on_detach.lock().pop() else { break };
            cb();
        }
    }

    /// Keeps this mapping alive past the scope that created it: the implicit
    /// detach a `Drop` would otherwise perform is suppressed, so the mapping
    /// survives until an explicit [`detach`](Self::detach) call. Mirrors
    /// `dsm_keep_mapping`'s effect of detaching the segment from its
    /// resource owner.
    pub fn keep_mapping(&self) {
        self.kept_mapping.store(true, Ordering::Release);
    }

    /// Bumps the segment's registry refcount by one, with no `Segment` value
    /// on this side owning the extra unit. The segment now survives even if
    /// every attached process detaches normally; only an explicit
    /// `Registry::destroy` (once the refcount has dropped back to 1) removes
    /// it. Mirrors `dsm_keep_segment`'s "keep until postmaster shutdown".
    pub fn keep_segment(&self) {
        self.registry.bump_refcount(self.handle, 1);
    }

    /// Grows or shrinks the backing file and remaps it in place. Per the
    /// original's `dsm_resize`, other processes that already mapped this
    /// segment do not see the new size until they remap it themselves;
    /// callers must not assume the bytes seen through [`with_bytes`]/
    /// [`with_bytes_mut`](Self::with_bytes_mut) retain their old address.
    pub fn resize(&self, new_size: usize) -> Result<(), DsmError> {
        let path = self.registry.segment_path(self.handle);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.set_len(new_size as u64)?;
        let new_mmap = unsafe { MmapMut::map_mut(&file)? };
        *self.mmap.lock() = new_mmap;
        tracing::debug!(handle = self.handle, new_size, "resized dsm segment");
        Ok(())
    }

    /// Explicitly detaches, running every registered `on_detach` callback
    /// and decrementing the refcount unconditionally (even if `keep_mapping`
    /// was called — that flag only suppresses the *implicit* `Drop` path).
    pub fn detach(self) {
        self.do_detach(true);
    }

    fn do_detach(&self, force: bool) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        if !force && self.kept_mapping.load(Ordering::Acquire) {
            return;
        }
        self.run_detach_callbacks();
        self.registry.bump_refcount(self.handle, -1);
    }
}

impl Clone for Segment {
    fn clone(&self) -> Self {
        self.registry.bump_refcount(self.handle, 1);
        Segment::fresh(self.handle, self.mmap.clone(), self.registry.clone())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.do_detach(false);
    }
}

struct RegistryInner {
    base_dir: PathBuf,
    items: Mutex<HashMap<Handle, ControlItem>>,
    /// Segments this process currently has mapped, keyed by handle, so
    /// `find_mapping` can hand back a new `Segment` over the same mapping
    /// instead of reopening and re-`mmap`ing the backing file. Weak so that
    /// once every `Segment` for a handle is gone the entry naturally stops
    /// resolving, rather than the registry itself keeping the mapping alive.
    local_mappings: Mutex<HashMap<Handle, Weak<Mutex<MmapMut>>>>,
}

impl RegistryInner {
    fn bump_refcount(&self, handle: Handle, delta: i64) {
        let mut items = self.items.lock();
        if let Some(item) = items.get_mut(&handle) {
            item.refcnt = (item.refcnt as i64 + delta).max(0) as u32;
            tracing::trace!(handle, refcnt = item.refcnt, "dsm refcount changed");
        }
    }

    fn segment_path(&self, handle: Handle) -> PathBuf {
        self.base_dir.join(format!("{SEGMENT_PREFIX}{handle:016x}"))
    }

    fn register_local_mapping(&self, handle: Handle, mmap: &Arc<Mutex<MmapMut>>) {
        self.local_mappings.lock().insert(handle, Arc::downgrade(mmap));
    }
}

/// The registry itself. One instance per process; every process that wants
/// to share segments must point at the same `base_dir`.
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Opens the registry rooted at `base_dir`, creating it if necessary,
    /// and performs PipelineDB's postmaster-startup crash-recovery sweep:
    /// every control entry left over from a previous, uncleanly terminated
    /// run is destroyed (since nothing in a fresh process is attached to
    /// it), and any segment file in `base_dir` with no corresponding control
    /// entry is unlinked as an orphan.
    pub fn open_or_create(base_dir: impl AsRef<Path>) -> Result<Self, DsmError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;

        let mut items = HashMap::new();
        let control_path = base_dir.join(CONTROL_FILE_NAME);
        if control_path.exists() {
            for (handle, refcnt) in read_control_file(&control_path)? {
                items.insert(handle, ControlItem { handle, refcnt });
            }
        }

        let inner = Arc::new(RegistryInner {
            base_dir: base_dir.clone(),
            items: Mutex::new(items),
            local_mappings: Mutex::new(HashMap::new()),
        });
        let registry = Registry { inner };
        registry.crash_recovery_sweep()?;
        registry.persist_control()?;
        Ok(registry)
    }

    /// Destroys every segment the control table still references (nothing
    /// in a freshly started process can legitimately be attached to them)
    /// and removes any segment file with no matching control entry.
    fn crash_recovery_sweep(&self) -> Result<(), DsmError> {
        let stale_handles: Vec<Handle> = self.inner.items.lock().keys().copied().collect();
        for handle in stale_handles {
            let path = self.inner.segment_path(handle);
            if path.exists() {
                tracing::warn!(handle, "destroying stale segment left by a previous run");
                fs::remove_file(&path)?;
            }
        }
        self.inner.items.lock().clear();

        for entry in fs::read_dir(&self.inner.base_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(hex) = name.strip_prefix(SEGMENT_PREFIX) {
                if u64::from_str_radix(hex, 16).is_ok() {
                    tracing::warn!(file = %name, "removing orphaned dsm segment file");
                    fs::remove_file(entry.path())?;
                }
            }
        }
        Ok(())
    }

    /// Allocates a fresh segment of `size` bytes, maps it, and registers it
    /// with `refcnt = 2`. The original's `dsm_create` seeds two rather than
    /// one "because refcnt of 1 triggers destruction" — 1 is reserved for
    /// MORIBUND (no live mappings); a segment the caller is holding live and
    /// mapped right now must start above that.
    pub fn create(&self, size: usize) -> Result<Segment, DsmError> {
        let handle = self.fresh_handle();
        let path = self.inner.segment_path(handle);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(size as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        self.inner
            .items
            .lock()
            .insert(handle, ControlItem { handle, refcnt: 2 });
        self.persist_control()?;

        tracing::debug!(handle, size, "created dsm segment");
        let mmap = Arc::new(Mutex::new(mmap));
        self.inner.register_local_mapping(handle, &mmap);
        Ok(Segment::fresh(handle, mmap, self.inner.clone()))
    }

    /// Attaches to an existing segment by handle, incrementing its refcount.
    pub fn attach(&self, handle: Handle) -> Result<Segment, DsmError> {
        {
            let mut items = self.inner.items.lock();
            let item = items.get_mut(&handle).ok_or(DsmError::UnknownHandle(handle))?;
            item.refcnt += 1;
        }
        self.persist_control()?;

        let path = self.inner.segment_path(handle);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let mmap = Arc::new(Mutex::new(mmap));
        self.inner.register_local_mapping(handle, &mmap);
        Ok(Segment::fresh(handle, mmap, self.inner.clone()))
    }

    /// Returns a new handle onto a segment this process already has mapped,
    /// without reopening or re-`mmap`ing its backing file, bumping the
    /// refcount the same as [`attach`](Self::attach) would. Returns `None`
    /// if nothing in this process currently has `handle` mapped. Mirrors
    /// `dsm_find_mapping`, which lets a caller avoid a redundant `dsm_attach`
    /// when it already holds the segment.
    pub fn find_mapping(&self, handle: Handle) -> Option<Segment> {
        let weak = self.inner.local_mappings.lock().get(&handle)?.clone();
        let mmap = weak.upgrade()?;
        self.inner.bump_refcount(handle, 1);
        Some(Segment::fresh(handle, mmap, self.inner.clone()))
    }

    /// Explicitly destroys a segment: only valid once `refcnt <= 1` (no
    /// live attachments besides the registry's own bookkeeping entry).
    /// Removes the backing file and frees the control slot.
    pub fn destroy(&self, handle: Handle) -> Result<(), DsmError> {
        let refcnt = {
            let items = self.inner.items.lock();
            items.get(&handle).ok_or(DsmError::UnknownHandle(handle))?.refcnt
        };
        if refcnt > 1 {
            return Err(DsmError::StillAttached(handle, refcnt));
        }
        self.inner.items.lock().remove(&handle);
        let path = self.inner.segment_path(handle);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        self.persist_control()?;
        tracing::debug!(handle, "destroyed dsm segment");
        Ok(())
    }

    pub fn refcount(&self, handle: Handle) -> Option<u32> {
        self.inner.items.lock().get(&handle).map(|i| i.refcnt)
    }

    fn fresh_handle(&self) -> Handle {
        let mut rng = rand::thread_rng();
        loop {
            let candidate: Handle = rng.gen_range(1..=Handle::MAX);
            if !self.inner.items.lock().contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn persist_control(&self) -> Result<(), DsmError> {
        let items = self.inner.items.lock();
        let path = self.inner.base_dir.join(CONTROL_FILE_NAME);
        let mut buf = Vec::with_capacity(8 + items.len() * 12);
        buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
        for item in items.values() {
            buf.extend_from_slice(&item.handle.to_le_bytes());
            buf.extend_from_slice(&item.refcnt.to_le_bytes());
        }
        fs::write(&path, buf)?;
        Ok(())
    }
}

fn read_control_file(path: &Path) -> Result<Vec<(Handle, u32)>, DsmError> {
    let bytes = fs::read(path)?;
    if bytes.len() < 4 {
        return Ok(Vec::new());
    }
    let nitems = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let mut out = Vec::with_capacity(nitems);
    let mut off = 4;
    for _ in 0..nitems {
        if off + 12 > bytes.len() {
            break;
        }
        let handle = u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
        let refcnt = u32::from_le_bytes(bytes[off + 8..off + 12].try_into().unwrap());
        out.push((handle, refcnt));
        off += 12;
    }
    let _ = File::open(path);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_attach_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open_or_create(dir.path()).unwrap();

        let seg = registry.create(4096).unwrap();
        assert_eq!(registry.refcount(seg.handle()), Some(2));

        let seg2 = registry.attach(seg.handle()).unwrap();
        assert_eq!(registry.refcount(seg.handle()), Some(3));

        seg2.with_bytes_mut(|b| b[0] = 7);
        seg.with_bytes(|b| assert_eq!(b[0], 7));

        drop(seg2);
        assert_eq!(registry.refcount(seg.handle()), Some(2));

        let handle = seg.handle();
        drop(seg);
        assert_eq!(registry.refcount(handle), Some(1), "last detach leaves the slot moribund, not gone");
        registry.destroy(handle).unwrap();
        assert_eq!(registry.refcount(handle), None);
    }

    #[test]
    fn destroy_rejects_live_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open_or_create(dir.path()).unwrap();
        let seg = registry.create(1024).unwrap();
        let _seg2 = registry.attach(seg.handle()).unwrap();
        let err = registry.destroy(seg.handle());
        assert!(matches!(err, Err(DsmError::StillAttached(_, 3))));
    }

    #[test]
    fn crash_recovery_clears_stale_segments() {
        let dir = tempfile::tempdir().unwrap();
        let handle;
        {
            let registry = Registry::open_or_create(dir.path()).unwrap();
            let seg = registry.create(256).unwrap();
            handle = seg.handle();
            std::mem::forget(seg); // simulate a process that never cleanly exits
        }
        assert!(dir.path().join(format!("{SEGMENT_PREFIX}{handle:016x}")).exists());

        let registry = Registry::open_or_create(dir.path()).unwrap();
        assert_eq!(registry.refcount(handle), None);
        assert!(!dir.path().join(format!("{SEGMENT_PREFIX}{handle:016x}")).exists());
    }

    #[test]
    fn orphaned_segment_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(format!("{SEGMENT_PREFIX}{:016x}", 42u64)), b"junk").unwrap();
        let registry = Registry::open_or_create(dir.path()).unwrap();
        assert_eq!(registry.refcount(42), None);
        assert!(!dir.path().join(format!("{SEGMENT_PREFIX}{:016x}", 42u64)).exists());
    }

    #[test]
    fn on_detach_callbacks_run_in_lifo_order_before_refcount_drops() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open_or_create(dir.path()).unwrap();
        let seg = registry.create(64).unwrap();
        let handle = seg.handle();

        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());
        seg.on_detach(move || o1.lock().push(1));
        seg.on_detach(move || o2.lock().push(2));

        seg.detach();
        assert_eq!(*order.lock(), vec![2, 1], "most recently registered callback runs first");
        assert_eq!(registry.refcount(handle), Some(1));
    }

    #[test]
    fn keep_mapping_suppresses_the_implicit_drop_detach() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open_or_create(dir.path()).unwrap();
        let seg = registry.create(64).unwrap();
        let handle = seg.handle();

        seg.keep_mapping();
        drop(seg);
        assert_eq!(registry.refcount(handle), Some(2), "drop must not detach a kept mapping");
    }

    #[test]
    fn keep_segment_survives_every_attachment_detaching() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open_or_create(dir.path()).unwrap();
        let seg = registry.create(64).unwrap();
        let handle = seg.handle();
        seg.keep_segment();

        seg.detach();
        assert_eq!(registry.refcount(handle), Some(2), "keep_segment's extra unit keeps it above moribund->gone");
    }

    #[test]
    fn resize_grows_the_mapping_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open_or_create(dir.path()).unwrap();
        let seg = registry.create(64).unwrap();
        assert_eq!(seg.len(), 64);
        seg.resize(256).unwrap();
        assert_eq!(seg.len(), 256);
    }

    #[test]
    fn find_mapping_returns_the_existing_local_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open_or_create(dir.path()).unwrap();
        let seg = registry.create(64).unwrap();
        let handle = seg.handle();
        assert_eq!(registry.refcount(handle), Some(2));

        let found = registry.find_mapping(handle).unwrap();
        assert_eq!(registry.refcount(handle), Some(3));
        found.with_bytes_mut(|b| b[0] = 9);
        seg.with_bytes(|b| assert_eq!(b[0], 9));
    }

    #[test]
    fn find_mapping_is_none_for_a_handle_nothing_local_has_mapped() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open_or_create(dir.path()).unwrap();
        assert!(registry.find_mapping(999).is_none());
    }
}
