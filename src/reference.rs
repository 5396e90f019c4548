//! The reference contract for payloads that wrap external resources.
//!
//! A [`Reference`] is a handle to some underlying resource. Every successful
//! [`Reference::try_clone`] hands out one more handle, and every handle must
//! be given back exactly once through [`Reference::close`]. The resource is
//! released when the last handle is closed.
//!
//! `close` consumes the handle, so a closed handle cannot be used again.
//! Types that release in `Drop` get `close` for free; dropping such a handle
//! is the same as closing it.
//!
//! Plain value types take part through [`plain_reference!`], which implements
//! the contract as an ordinary copy with no resource effect. Shared immutable
//! values go through [`SharedRef`]. `Arc` itself is not a `Reference`, so
//! calling `close` on an `Arc` always reaches the pointee.

use crate::error::Result;
use std::sync::Arc;

/// A handle to a possibly shared, possibly external resource.
pub trait Reference: Send + Sync + Sized + 'static {
    /// Create a new handle to the same underlying resource.
    ///
    /// Fails when the resource can no longer hand out handles (for example,
    /// it has already been finalized).
    fn try_clone(&self) -> Result<Self>;

    /// Give this handle back.
    ///
    /// When this was the last handle, the resource is released.
    fn close(self) {
        drop(self);
    }
}

/// Implement [`Reference`] for value types as a plain `Clone`.
///
/// ```rust
/// use flowgraph::plain_reference;
///
/// #[derive(Debug, Clone, PartialEq)]
/// struct Caps {
///     width: u32,
///     height: u32,
/// }
///
/// plain_reference!(Caps);
/// ```
#[macro_export]
macro_rules! plain_reference {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::reference::Reference for $ty {
                #[inline]
                fn try_clone(&self) -> $crate::error::Result<Self> {
                    Ok(::std::clone::Clone::clone(self))
                }
            }
        )+
    };
}

plain_reference!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    &'static str,
    Vec<u8>,
);

/// A value shared between handles through an [`Arc`].
///
/// Cloning hands out another pointer to the same allocation; the value is
/// dropped with the last handle. There is no `Deref`, so a `close(&self)`
/// on the inner value is never shadowed by [`Reference::close`]; use
/// [`get`](Self::get) or `as_ref()`.
///
/// ```rust
/// use flowgraph::reference::{Reference, SharedRef};
///
/// let frame = SharedRef::new(vec![1u8, 2, 3]);
/// let copy = frame.try_clone().unwrap();
/// assert!(SharedRef::ptr_eq(&frame, &copy));
/// assert_eq!(copy.get().len(), 3);
/// ```
#[derive(Debug)]
pub struct SharedRef<T: ?Sized>(Arc<T>);

impl<T> SharedRef<T> {
    /// Wrap `value` in a new allocation.
    pub fn new(value: T) -> Self {
        Self(Arc::new(value))
    }
}

impl<T: ?Sized> SharedRef<T> {
    /// The shared value.
    pub fn get(&self) -> &T {
        &self.0
    }

    /// Whether both handles point to the same allocation.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Number of live handles.
    pub fn handle_count(this: &Self) -> usize {
        Arc::strong_count(&this.0)
    }

    /// The underlying `Arc`.
    pub fn into_arc(self) -> Arc<T> {
        self.0
    }
}

impl<T: ?Sized> From<Arc<T>> for SharedRef<T> {
    fn from(arc: Arc<T>) -> Self {
        Self(arc)
    }
}

impl<T: ?Sized> AsRef<T> for SharedRef<T> {
    fn as_ref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized + PartialEq> PartialEq for SharedRef<T> {
    fn eq(&self, other: &Self) -> bool {
        *self.0 == *other.0
    }
}

impl<T: Send + Sync + ?Sized + 'static> Reference for SharedRef<T> {
    #[inline]
    fn try_clone(&self) -> Result<Self> {
        Ok(Self(Arc::clone(&self.0)))
    }
}

impl Reference for bytes::Bytes {
    #[inline]
    fn try_clone(&self) -> Result<Self> {
        Ok(self.clone())
    }
}

impl<T: Reference> Reference for Option<T> {
    fn try_clone(&self) -> Result<Self> {
        self.as_ref().map(Reference::try_clone).transpose()
    }

    fn close(self) {
        if let Some(inner) = self {
            inner.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counted {
        refs: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
    }

    impl Reference for Counted {
        fn try_clone(&self) -> Result<Self> {
            if self.refs.load(Ordering::Acquire) == 0 {
                return Err(Error::Released);
            }
            self.refs.fetch_add(1, Ordering::AcqRel);
            Ok(Counted {
                refs: self.refs.clone(),
                releases: self.releases.clone(),
            })
        }

        fn close(self) {
            if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.releases.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    #[test]
    fn test_plain_values_copy() {
        let s = String::from("abc");
        let c = s.try_clone().unwrap();
        assert_eq!(c, "abc");
        c.close();
        assert_eq!(s, "abc");
    }

    #[test]
    fn test_option_delegates() {
        let refs = Arc::new(AtomicUsize::new(1));
        let releases = Arc::new(AtomicUsize::new(0));
        let original = Some(Counted {
            refs: refs.clone(),
            releases: releases.clone(),
        });

        let clone = original.try_clone().unwrap();
        assert_eq!(refs.load(Ordering::Acquire), 2);
        clone.close();
        original.close();
        assert_eq!(releases.load(Ordering::Acquire), 1);

        let none: Option<Counted> = None;
        assert!(none.try_clone().unwrap().is_none());
    }

    #[test]
    fn test_shared_ref_shares_allocation() {
        let a = SharedRef::new(7u32);
        let b = a.try_clone().unwrap();
        assert!(SharedRef::ptr_eq(&a, &b));
        assert_eq!(SharedRef::handle_count(&a), 2);
        b.close();
        assert_eq!(SharedRef::handle_count(&a), 1);
        assert_eq!(*a.get(), 7);
    }
}
