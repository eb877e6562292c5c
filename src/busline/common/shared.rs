use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{fence, AtomicU32};

/// The reference count a shared object embeds in itself. It starts at 1,
/// the reference held by whoever constructs the object, and the object's
/// finalizer (its Drop impl) runs exactly when it returns to 0.
pub struct LifeCount(AtomicU32);

impl LifeCount {
    pub const fn new() -> Self {
        LifeCount(AtomicU32::new(1))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Relaxed)
    }

    fn retain(&self) {
        // Retaining is only legal through a borrow, which proves the count
        // is already positive, so Relaxed suffices here.
        let old = self.0.fetch_add(1, Relaxed);
        assert!(old > 0);
    }

    /// Returns true when this release dropped the last reference. The
    /// Release/Acquire pairing makes every access to the object happen
    /// before its finalizer runs, even when handles are released from
    /// different threads.
    fn release(&self) -> bool {
        let old = self.0.fetch_sub(1, Release);
        assert!(old > 0);
        if old == 1 {
            fence(Acquire);
            true
        } else {
            false
        }
    }
}

/// Objects that embed their own LifeCount. The transport and connection
/// carry one so a single heap allocation holds both the state and its
/// count, and so collaborators holding only a borrow can still pin the
/// object alive across a callback.
pub trait Counted {
    fn life(&self) -> &LifeCount;
}

/// An owning handle to a heap-pinned, internally counted object. Unlike an
/// external refcount, the pointee's address is fixed for its entire life
/// and the handle is never null, which is what lets the transport publish
/// raw back-pointers (the connection back-reference, the counter notify)
/// that stay valid until the finalizer deliberately tears them down.
pub struct Shared<T: Counted> {
    ptr: NonNull<T>,
}

impl<T: Counted> Shared<T> {
    /// Move obj to the heap, taking over the constructor's reference.
    pub fn new(obj: T) -> Self {
        debug_assert_eq!(obj.life().get(), 1);
        Shared {
            ptr: NonNull::from(Box::leak(Box::new(obj))),
        }
    }

    /// Take an additional reference through a plain borrow. This is the
    /// paranoid-ref used around paths that may run user callbacks: the
    /// object cannot be finalized while the returned handle lives, even if
    /// the callback releases every other handle.
    pub fn retain(obj: &T) -> Self {
        obj.life().retain();
        Shared {
            ptr: NonNull::from(obj),
        }
    }

    /// The pointee's stable address, for non-owning back-pointers. Valid
    /// exactly as long as some handle is alive.
    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }

    /// True if both handles pin the same object.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }
}

impl<T: Counted> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: a live handle keeps the count positive, so the pointee
        // has not been finalized or freed
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: Counted> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Shared::retain(self)
    }
}

impl<T: Counted> Drop for Shared<T> {
    fn drop(&mut self) {
        // Safety: this handle still holds its reference
        let last = unsafe { self.ptr.as_ref() }.life().release();
        if last {
            // Last reference: run the finalizer and free the allocation
            unsafe {
                drop(Box::from_raw(self.ptr.as_ptr()));
            }
        }
    }
}

unsafe impl<T: Send + Sync + Counted> Send for Shared<T> {}
unsafe impl<T: Send + Sync + Counted> Sync for Shared<T> {}

impl<T: Counted> std::fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").field("ptr", &self.ptr).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering::SeqCst;

    struct Pinned {
        life: LifeCount,
        finalized: &'static AtomicBool,
    }

    impl Counted for Pinned {
        fn life(&self) -> &LifeCount {
            &self.life
        }
    }

    impl Drop for Pinned {
        fn drop(&mut self) {
            self.finalized.store(true, SeqCst);
        }
    }

    #[test]
    fn test_finalized_exactly_at_zero() {
        static FINALIZED: AtomicBool = AtomicBool::new(false);
        FINALIZED.store(false, SeqCst);

        let a = Shared::new(Pinned {
            life: LifeCount::new(),
            finalized: &FINALIZED,
        });
        let b = a.clone();
        let c = Shared::retain(&*a); // the paranoid-ref path
        assert_eq!(a.life().get(), 3);

        drop(b);
        drop(c);
        assert!(!FINALIZED.load(SeqCst));
        drop(a);
        assert!(FINALIZED.load(SeqCst));
    }

    #[test]
    fn test_address_is_stable_across_retains() {
        static FINALIZED: AtomicBool = AtomicBool::new(false);

        let a = Shared::new(Pinned {
            life: LifeCount::new(),
            finalized: &FINALIZED,
        });
        let addr = a.as_ptr();
        let b = Shared::retain(&*a);
        drop(a);
        // the object survives through b at the same address
        assert_eq!(b.as_ptr(), addr);
        assert!(Shared::ptr_eq(&b, &b));
    }
}
