//! Owning wrapper for native runtime handles
//!
//! Every vendor runtime hands out raw handles with its own lifetime rules:
//! the CUDA driver returns owned handles that must be destroyed exactly once,
//! OpenCL objects are reference-counted with retain/release, and contexts or
//! queues shared in from a host application must not be destroyed at all.
//! [`Handle`] subsumes the three models behind one wrapper parameterised by a
//! traits type that knows how to release (and optionally retain) the raw
//! value.
//!
//! Exactly one release runs for each owned handle; borrowed handles are never
//! released; `out()` supports the native out-parameter idiom by discarding
//! prior contents and handing the callee the slot's address.

use std::marker::PhantomData;

/// Release discipline for a native handle type
pub trait HandleTraits<H: Copy + PartialEq> {
    /// The "no handle" value (null pointer, zero device address)
    const NULL: H;

    /// Destroy the native object. Best-effort: failures are swallowed.
    fn release(raw: H);
}

/// Retain discipline for reference-counted native handle types
pub trait RetainTraits<H: Copy + PartialEq>: HandleTraits<H> {
    /// Take an additional reference on the native object
    fn retain(raw: H);
}

/// Owning (or borrowing) wrapper around a raw native handle
pub struct Handle<H: Copy + PartialEq, T: HandleTraits<H>> {
    raw: H,
    owned: bool,
    _traits: PhantomData<T>,
}

impl<H: Copy + PartialEq, T: HandleTraits<H>> Handle<H, T> {
    /// An empty handle
    pub fn null() -> Self {
        Self {
            raw: T::NULL,
            owned: false,
            _traits: PhantomData,
        }
    }

    /// Take ownership of `raw` without retaining it
    ///
    /// Used for handles returned by native create calls, which arrive with
    /// their single reference already counted.
    pub fn adopt(raw: H) -> Self {
        Self {
            raw,
            owned: true,
            _traits: PhantomData,
        }
    }

    /// Borrow `raw` without ever releasing it
    ///
    /// Used for handles owned elsewhere, such as a context shared in by the
    /// host application or a device pointer aliased from a host allocation.
    pub fn borrow_raw(raw: H) -> Self {
        Self {
            raw,
            owned: false,
            _traits: PhantomData,
        }
    }

    /// The raw native value
    pub fn get(&self) -> H {
        self.raw
    }

    /// Address of the stored raw value, for reading out of the wrapper in
    /// native calls that take the handle by pointer (e.g. kernel parameter
    /// arrays).
    pub fn raw_ptr(&self) -> *const H {
        &self.raw
    }

    /// Whether no native handle is held
    pub fn is_null(&self) -> bool {
        self.raw == T::NULL
    }

    /// Destroy the held handle now (if owned) and become empty
    pub fn reset(&mut self) {
        if self.owned && self.raw != T::NULL {
            T::release(self.raw);
        }
        self.raw = T::NULL;
        self.owned = false;
    }

    /// Give up ownership without destroying; returns the raw handle
    pub fn release_ownership(&mut self) -> H {
        let raw = self.raw;
        self.raw = T::NULL;
        self.owned = false;
        raw
    }

    /// Destroy the previous handle, then adopt `raw`
    pub fn replace(&mut self, raw: H) {
        self.reset();
        self.raw = raw;
        self.owned = true;
    }

    /// Slot address for native out-parameter patterns
    ///
    /// The native call will overwrite the slot, so prior contents are
    /// destroyed first; whatever the callee writes is owned afterwards.
    pub fn out(&mut self) -> *mut H {
        self.reset();
        self.owned = true;
        &mut self.raw
    }
}

impl<H: Copy + PartialEq, T: RetainTraits<H>> Handle<H, T> {
    /// Share `raw`: retain it, then own the new reference
    pub fn wrap_shared(raw: H) -> Self {
        if raw != T::NULL {
            T::retain(raw);
        }
        Self {
            raw,
            owned: true,
            _traits: PhantomData,
        }
    }
}

/// Copying is only defined for reference-counted handle types: the copy
/// retains. Borrowed handles stay borrowed on copy.
impl<H: Copy + PartialEq, T: RetainTraits<H>> Clone for Handle<H, T> {
    fn clone(&self) -> Self {
        if self.owned && self.raw != T::NULL {
            T::retain(self.raw);
        }
        Self {
            raw: self.raw,
            owned: self.owned,
            _traits: PhantomData,
        }
    }
}

impl<H: Copy + PartialEq, T: HandleTraits<H>> Drop for Handle<H, T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<H: Copy + PartialEq, T: HandleTraits<H>> Default for Handle<H, T> {
    fn default() -> Self {
        Self::null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    static RELEASES: AtomicUsize = AtomicUsize::new(0);
    static RETAINS: AtomicUsize = AtomicUsize::new(0);

    // counter deltas are only meaningful while one test runs at a time
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    struct Counting;

    impl HandleTraits<usize> for Counting {
        const NULL: usize = 0;

        fn release(_raw: usize) {
            RELEASES.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl RetainTraits<usize> for Counting {
        fn retain(_raw: usize) {
            RETAINS.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counters() -> (usize, usize) {
        (RELEASES.load(Ordering::SeqCst), RETAINS.load(Ordering::SeqCst))
    }

    #[test]
    fn test_adopt_releases_once() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let (r0, _) = counters();
        {
            let h: Handle<usize, Counting> = Handle::adopt(7);
            assert_eq!(h.get(), 7);
            assert!(!h.is_null());
        }
        assert_eq!(counters().0, r0 + 1);
    }

    #[test]
    fn test_borrow_never_releases() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let (r0, _) = counters();
        {
            let h: Handle<usize, Counting> = Handle::borrow_raw(9);
            assert_eq!(h.get(), 9);
        }
        assert_eq!(counters().0, r0);
    }

    #[test]
    fn test_release_ownership_suppresses_destroy() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let (r0, _) = counters();
        let mut h: Handle<usize, Counting> = Handle::adopt(3);
        assert_eq!(h.release_ownership(), 3);
        assert!(h.is_null());
        drop(h);
        assert_eq!(counters().0, r0);
    }

    #[test]
    fn test_wrap_shared_retains_and_releases() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let (r0, t0) = counters();
        {
            let h: Handle<usize, Counting> = Handle::wrap_shared(11);
            assert_eq!(h.get(), 11);
            assert_eq!(counters().1, t0 + 1);
        }
        assert_eq!(counters().0, r0 + 1);
    }

    #[test]
    fn test_clone_retains() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let (r0, t0) = counters();
        {
            let a: Handle<usize, Counting> = Handle::adopt(5);
            let b = a.clone();
            assert_eq!(b.get(), 5);
            assert_eq!(counters().1, t0 + 1);
        }
        // both copies released
        assert_eq!(counters().0, r0 + 2);
    }

    #[test]
    fn test_out_destroys_prior_and_owns_result() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let (r0, _) = counters();
        let mut h: Handle<usize, Counting> = Handle::adopt(1);
        unsafe {
            // simulate a native create writing through the out-parameter
            *h.out() = 42;
        }
        // the prior handle was destroyed when out() reset the slot
        assert_eq!(counters().0, r0 + 1);
        assert_eq!(h.get(), 42);
        drop(h);
        assert_eq!(counters().0, r0 + 2);
    }

    #[test]
    fn test_replace() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let (r0, _) = counters();
        let mut h: Handle<usize, Counting> = Handle::adopt(1);
        h.replace(2);
        assert_eq!(counters().0, r0 + 1);
        assert_eq!(h.get(), 2);
        drop(h);
        assert_eq!(counters().0, r0 + 2);
    }

    #[test]
    fn test_null_handle_is_never_released() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let (r0, _) = counters();
        {
            let mut h: Handle<usize, Counting> = Handle::null();
            assert!(h.is_null());
            h.reset();
        }
        assert_eq!(counters().0, r0);
    }
}
