use std::fmt;
use std::ops::{Add, Sub};

use crate::globals::{HEAP_WORD_SIZE, LOG_HEAP_WORD_SIZE};

/// A raw address inside (or at the boundary of) the reserved heap.
///
/// Arithmetic on `Address` is in bytes unless the method name says words.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(usize);

impl Address {
    pub const ZERO: Self = Address(0);

    #[inline(always)]
    pub const fn from_usize(raw: usize) -> Self {
        Address(raw)
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Address(ptr as usize)
    }

    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline(always)]
    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline(always)]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn add_words(self, words: usize) -> Self {
        Address(self.0 + (words << LOG_HEAP_WORD_SIZE))
    }

    #[inline(always)]
    pub const fn sub_words(self, words: usize) -> Self {
        Address(self.0 - (words << LOG_HEAP_WORD_SIZE))
    }

    /// Distance in words from `base` up to `self`.
    #[inline(always)]
    pub const fn words_from(self, base: Address) -> usize {
        (self.0 - base.0) >> LOG_HEAP_WORD_SIZE
    }

    #[inline(always)]
    pub const fn is_word_aligned(self) -> bool {
        self.0 % HEAP_WORD_SIZE == 0
    }

    /// Reads the word stored at this address.
    ///
    /// # Safety
    /// The address must point to committed heap memory.
    #[inline(always)]
    pub unsafe fn load_word(self) -> usize {
        *self.to_ptr::<usize>()
    }

    /// # Safety
    /// The address must point to committed heap memory.
    #[inline(always)]
    pub unsafe fn store_word(self, value: usize) {
        *self.to_mut_ptr::<usize>() = value;
    }
}

impl Add<usize> for Address {
    type Output = Address;
    #[inline(always)]
    fn add(self, bytes: usize) -> Address {
        Address(self.0 + bytes)
    }
}

impl Sub<usize> for Address {
    type Output = Address;
    #[inline(always)]
    fn sub(self, bytes: usize) -> Address {
        Address(self.0 - bytes)
    }
}

impl Sub<Address> for Address {
    type Output = usize;
    #[inline(always)]
    fn sub(self, other: Address) -> usize {
        debug_assert!(self.0 >= other.0, "{:?} - {:?} underflows", self, other);
        self.0 - other.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
