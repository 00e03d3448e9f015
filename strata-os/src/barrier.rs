//! Process-wide write buffer flushing.
//!
//! After [`WriteBufferFlusher::flush`] returns, every thread of the process
//! that was running during the call has executed a full memory barrier. The
//! collector uses this to make its own stores visible to mutator threads
//! without putting fences on their hot paths.
//!
//! Strategies, chosen once at initialize:
//! 1. `membarrier(MEMBARRIER_CMD_PRIVATE_EXPEDITED)` when the kernel offers
//!    it and registration succeeds
//! 2. A locked helper page whose protection is toggled, forcing a TLB
//!    shootdown IPI to every CPU running one of our threads
//! 3. No-op on single-threaded targets

#[cfg(not(target_family = "wasm"))]
use std::ptr::NonNull;
#[cfg(not(target_family = "wasm"))]
use std::sync::atomic::{AtomicUsize, Ordering};
#[cfg(not(target_family = "wasm"))]
use std::sync::{Mutex, PoisonError};

#[cfg(not(target_family = "wasm"))]
use libc::c_void;
use log::{debug, info};
#[cfg(not(target_family = "wasm"))]
use nix::sys::mman::{mlock, mprotect, munlock, ProtFlags};

use crate::error::InitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStrategy {
    Membarrier,
    HelperPage,
    NoOp,
}

impl std::fmt::Display for FlushStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FlushStrategy::Membarrier => "membarrier",
            FlushStrategy::HelperPage => "helper-page",
            FlushStrategy::NoOp => "no-op",
        })
    }
}

#[derive(Debug)]
pub enum WriteBufferFlusher {
    Membarrier,
    #[cfg(not(target_family = "wasm"))]
    HelperPage(HelperPage),
    NoOp,
}

impl WriteBufferFlusher {
    /// Picks the strongest strategy the host supports.
    ///
    /// # Errors
    /// Fails only when the helper page fallback cannot be mapped or locked.
    pub fn initialize(page_size: usize) -> Result<Self, InitError> {
        #[cfg(target_family = "wasm")]
        {
            let _ = page_size;
            debug!("Single-threaded target, write buffer flush is a no-op");
            Ok(Self::NoOp)
        }

        #[cfg(not(target_family = "wasm"))]
        {
            if membarrier::register() {
                info!("Write buffer flush: membarrier (private expedited)");
                return Ok(Self::Membarrier);
            }
            debug!("membarrier unavailable, falling back to helper page flush");
            let flusher = Self::helper_page(page_size)?;
            info!("Write buffer flush: helper page");
            Ok(flusher)
        }
    }

    /// Forces the helper page strategy regardless of kernel support.
    #[cfg(not(target_family = "wasm"))]
    pub fn helper_page(page_size: usize) -> Result<Self, InitError> {
        HelperPage::new(page_size).map(Self::HelperPage)
    }

    pub fn strategy(&self) -> FlushStrategy {
        match self {
            Self::Membarrier => FlushStrategy::Membarrier,
            #[cfg(not(target_family = "wasm"))]
            Self::HelperPage(_) => FlushStrategy::HelperPage,
            Self::NoOp => FlushStrategy::NoOp,
        }
    }

    /// Makes every running thread of the process execute a full barrier.
    ///
    /// Safe to call from any number of threads at once. Kernel failures here
    /// mean the strategy chosen at initialize stopped working, which is an
    /// invariant violation and panics.
    pub fn flush(&self) {
        match self {
            Self::Membarrier => {
                #[cfg(not(target_family = "wasm"))]
                membarrier::private_expedited();
            }
            #[cfg(not(target_family = "wasm"))]
            Self::HelperPage(page) => page.flush(),
            Self::NoOp => {}
        }
    }
}

/// One mlock'd page plus the mutex that serializes flushes through it.
///
/// The page stays locked for its whole lifetime so toggling its protection
/// never faults it in or out; only the IPI side effect matters.
#[cfg(not(target_family = "wasm"))]
#[derive(Debug)]
pub struct HelperPage {
    page: NonNull<u8>,
    size: usize,
    lock: Mutex<()>,
}

// SAFETY: the page is only touched with `lock` held.
#[cfg(not(target_family = "wasm"))]
unsafe impl Send for HelperPage {}
#[cfg(not(target_family = "wasm"))]
unsafe impl Sync for HelperPage {}

#[cfg(not(target_family = "wasm"))]
impl HelperPage {
    fn new(page_size: usize) -> Result<Self, InitError> {
        // Mapped accessible: mlock has to fault the page in, which an
        // inaccessible mapping refuses with ENOMEM.
        // SAFETY: fresh anonymous mapping at a kernel-chosen address.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(InitError::HelperPageMap(std::io::Error::last_os_error()));
        }
        let page = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| InitError::HelperPageMap(std::io::ErrorKind::AddrNotAvailable.into()))?;

        // Built before locking so Drop unmaps the page if mlock fails.
        let helper = Self { page, size: page_size, lock: Mutex::new(()) };

        // SAFETY: `page` is the mapping created above.
        unsafe { mlock(page.as_ptr() as *const c_void, page_size) }.map_err(InitError::HelperPageLock)?;

        // Locked pages stay resident across protection changes.
        // SAFETY: `page` is the mapping created above.
        unsafe { mprotect(page.as_ptr().cast(), page_size, ProtFlags::PROT_NONE) }
            .map_err(|err| InitError::HelperPageMap(err.into()))?;

        Ok(helper)
    }

    /// Number of flushes routed through the page so far.
    #[cfg(test)]
    pub(crate) fn flush_count(&self) -> usize {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        // SAFETY: same protocol as `flush`; the page is only readable while
        // `lock` is held.
        unsafe {
            let ret = mprotect(self.page.as_ptr().cast(), self.size, ProtFlags::PROT_READ);
            assert!(ret.is_ok(), "Failed to make the flush helper page readable: {ret:?}");
            let count = (*self.page.as_ptr().cast::<AtomicUsize>()).load(Ordering::SeqCst);
            let ret = mprotect(self.page.as_ptr().cast(), self.size, ProtFlags::PROT_NONE);
            assert!(ret.is_ok(), "Failed to revoke access to the flush helper page: {ret:?}");
            count
        }
    }

    fn flush(&self) {
        // The mutex guards no data, so a poisoned lock is still usable.
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        // SAFETY: the page is ours and only written between the two
        // protection changes while `lock` is held.
        unsafe {
            let ret = mprotect(self.page.as_ptr().cast(), self.size, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE);
            assert!(ret.is_ok(), "Failed to make the flush helper page writable: {ret:?}");

            // Dirtying the page guarantees the downgrade below has TLB
            // entries to shoot down.
            (*self.page.as_ptr().cast::<AtomicUsize>()).fetch_add(1, Ordering::SeqCst);

            let ret = mprotect(self.page.as_ptr().cast(), self.size, ProtFlags::PROT_NONE);
            assert!(ret.is_ok(), "Failed to revoke access to the flush helper page: {ret:?}");
        }
    }
}

#[cfg(not(target_family = "wasm"))]
impl Drop for HelperPage {
    fn drop(&mut self) {
        // SAFETY: the page is exclusively owned and no flush is running.
        unsafe {
            let _ = munlock(self.page.as_ptr() as *const c_void, self.size);
            libc::munmap(self.page.as_ptr().cast(), self.size);
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod membarrier {
    use log::debug;

    const CMD_QUERY: libc::c_long = 0;
    const CMD_PRIVATE_EXPEDITED: libc::c_long = 1 << 3;
    const CMD_REGISTER_PRIVATE_EXPEDITED: libc::c_long = 1 << 4;

    fn membarrier(cmd: libc::c_long) -> libc::c_long {
        // SAFETY: membarrier takes no pointers.
        unsafe { libc::syscall(libc::SYS_membarrier, cmd, 0 as libc::c_long) }
    }

    /// Probes for the expedited private command and registers the process.
    pub(super) fn register() -> bool {
        if !api_level_supported() {
            return false;
        }

        let mask = membarrier(CMD_QUERY);
        if mask < 0 {
            debug!("membarrier query failed: {}", std::io::Error::last_os_error());
            return false;
        }
        let wanted = CMD_PRIVATE_EXPEDITED | CMD_REGISTER_PRIVATE_EXPEDITED;
        if mask & wanted != wanted {
            debug!("membarrier lacks private expedited support (mask {:#x})", mask);
            return false;
        }

        if membarrier(CMD_REGISTER_PRIVATE_EXPEDITED) != 0 {
            debug!("membarrier registration failed: {}", std::io::Error::last_os_error());
            return false;
        }
        true
    }

    pub(super) fn private_expedited() {
        let ret = membarrier(CMD_PRIVATE_EXPEDITED);
        assert_eq!(ret, 0, "membarrier failed after successful registration: {}", std::io::Error::last_os_error());
    }

    /// The syscall is blocked by the seccomp policy before Android Q (API 29).
    #[cfg(target_os = "android")]
    fn api_level_supported() -> bool {
        const PROP_VALUE_MAX: usize = 92;
        let mut value = [0 as libc::c_char; PROP_VALUE_MAX];
        // SAFETY: the name is NUL-terminated and `value` holds PROP_VALUE_MAX
        // bytes as the property API requires.
        let len = unsafe { libc::__system_property_get(b"ro.build.version.sdk\0".as_ptr().cast(), value.as_mut_ptr()) };
        if len <= 0 {
            return false;
        }
        let bytes: Vec<u8> = value[..len as usize].iter().map(|&c| c as u8).collect();
        std::str::from_utf8(&bytes).ok().and_then(|s| s.trim().parse::<u32>().ok()).is_some_and(|level| level >= 29)
    }

    #[cfg(not(target_os = "android"))]
    fn api_level_supported() -> bool {
        true
    }
}

#[cfg(all(not(target_family = "wasm"), not(any(target_os = "linux", target_os = "android"))))]
mod membarrier {
    pub(super) fn register() -> bool {
        false
    }

    pub(super) fn private_expedited() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::page_size;
    use std::sync::atomic::{compiler_fence, AtomicU64};
    use std::sync::Arc;

    /// One writer publishes `data` then `flag` with a flush in between;
    /// `readers` threads spin on relaxed loads with only a compiler fence on
    /// their side and must never see the flag ahead of the data. Readers
    /// also flush, so flushes run concurrently from every thread.
    fn publish_and_observe(flusher: Arc<WriteBufferFlusher>, readers: usize, rounds: u64) {
        let data = Arc::new(AtomicU64::new(0));
        let flag = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..readers)
            .map(|me| {
                let flusher = Arc::clone(&flusher);
                let data = Arc::clone(&data);
                let flag = Arc::clone(&flag);
                std::thread::spawn(move || {
                    let mut seen_flag = 0;
                    while seen_flag < rounds {
                        seen_flag = flag.load(Ordering::Relaxed);
                        compiler_fence(Ordering::SeqCst);
                        let seen_data = data.load(Ordering::Relaxed);
                        assert!(seen_data >= seen_flag, "reader {me} saw flag {seen_flag} before data {seen_data}");
                        flusher.flush();
                        std::thread::yield_now();
                    }
                })
            })
            .collect();

        for round in 1..=rounds {
            data.store(round, Ordering::Relaxed);
            flusher.flush();
            flag.store(round, Ordering::Relaxed);
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }

    fn counter(flusher: &WriteBufferFlusher) -> usize {
        let WriteBufferFlusher::HelperPage(page) = flusher else { unreachable!() };
        page.flush_count()
    }

    #[test]
    fn test_helper_page_concurrent_flush() {
        let flusher = Arc::new(WriteBufferFlusher::helper_page(page_size()).unwrap());
        assert_eq!(flusher.strategy(), FlushStrategy::HelperPage);
        for threads in [2, 8, 64] {
            let before = counter(&flusher);
            publish_and_observe(Arc::clone(&flusher), threads - 1, 50);
            assert!(counter(&flusher) >= before + 50);
        }
    }

    #[test]
    fn test_initialized_flusher_concurrent_flush() {
        let flusher = Arc::new(WriteBufferFlusher::initialize(page_size()).unwrap());
        assert_ne!(flusher.strategy(), FlushStrategy::NoOp);
        for threads in [2, 8, 64] {
            publish_and_observe(Arc::clone(&flusher), threads - 1, 50);
        }
    }

    #[test]
    fn test_helper_page_counts_flushes() {
        let flusher = WriteBufferFlusher::helper_page(page_size()).unwrap();
        assert_eq!(counter(&flusher), 0);
        for _ in 0..3 {
            flusher.flush();
        }
        assert_eq!(counter(&flusher), 3);

        // Inaccessible again between flushes.
        let WriteBufferFlusher::HelperPage(page) = &flusher else { unreachable!() };
        unsafe {
            mprotect(page.page.as_ptr().cast(), page.size, ProtFlags::PROT_READ).unwrap();
            assert_eq!(*page.page.as_ptr().cast::<usize>(), 3);
            mprotect(page.page.as_ptr().cast(), page.size, ProtFlags::PROT_NONE).unwrap();
        }
    }

    #[test]
    fn test_noop_flush() {
        let flusher = WriteBufferFlusher::NoOp;
        flusher.flush();
        assert_eq!(flusher.strategy().to_string(), "no-op");
    }
}
