use std::num::NonZeroU8;
use std::ops::BitOr;
use std::{fmt, ops};

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

/// Interest used when registering a file descriptor with the selector.
///
/// `Interest` can never be empty; deregistration is expressed by the
/// absence of an `Interest` (`Option::None`) rather than an empty set.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub(crate) struct Interest(NonZeroU8);

impl Interest {
    /// Readiness for read operations.
    pub(crate) const READABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(READABLE) });

    /// Readiness for write operations.
    pub(crate) const WRITABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(WRITABLE) });

    /// Add together two `Interest`s.
    #[must_use = "this returns the result of the operation, without modifying the original"]
    pub(crate) const fn add(self, other: Interest) -> Interest {
        Interest(unsafe { NonZeroU8::new_unchecked(self.0.get() | other.0.get()) })
    }

    /// Removes `other` `Interest` from `self`.
    ///
    /// Returns `None` if the set would be empty after removing `other`.
    #[must_use = "this returns the result of the operation, without modifying the original"]
    pub(crate) fn remove(self, other: Interest) -> Option<Interest> {
        NonZeroU8::new(self.0.get() & !other.0.get()).map(Interest)
    }

    pub(crate) const fn is_readable(self) -> bool {
        (self.0.get() & READABLE) != 0
    }

    pub(crate) const fn is_writable(self) -> bool {
        (self.0.get() & WRITABLE) != 0
    }
}

impl BitOr for Interest {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

impl ops::BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 = (*self | other).0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        if self.is_readable() {
            write!(fmt, "READABLE")?;
            one = true
        }
        if self.is_writable() {
            if one {
                write!(fmt, " | ")?
            }
            write!(fmt, "WRITABLE")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Interest;

    #[test]
    fn add_and_remove() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());

        let read = both.remove(Interest::WRITABLE).unwrap();
        assert!(read.is_readable());
        assert!(!read.is_writable());
        assert_eq!(read.remove(Interest::READABLE), None);

        // Removing an interest that is not part of the set is a no-op.
        assert_eq!(read.remove(Interest::WRITABLE), Some(Interest::READABLE));
    }
}
