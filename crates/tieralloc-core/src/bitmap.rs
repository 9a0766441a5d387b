//! Free bitmaps stored in backing-allocator memory.
//!
//! A set bit means *free*. Slot tables use `u32` words (one 32-slot
//! group per word), slabs use `u64` words.

#![allow(unsafe_code)]

use std::marker::PhantomData;
use std::sync::Arc;

use crate::backing::{BackingAllocator, Extent};

/// Unsigned word usable as a bitmap word. Every bit pattern is valid.
pub(crate) trait BitWord: Copy + Eq {
    const BITS: usize;
    const ALL_FREE: Self;
    const NONE_FREE: Self;

    /// Index of the lowest free bit.
    fn first_free(self) -> Option<usize>;
    fn is_free(self, bit: usize) -> bool;
    fn mark_free(&mut self, bit: usize);
    fn mark_used(&mut self, bit: usize);
}

macro_rules! impl_bit_word {
    ($($t:ty),*) => {$(
        impl BitWord for $t {
            const BITS: usize = <$t>::BITS as usize;
            const ALL_FREE: Self = <$t>::MAX;
            const NONE_FREE: Self = 0;

            #[inline]
            fn first_free(self) -> Option<usize> {
                (self != 0).then(|| self.trailing_zeros() as usize)
            }

            #[inline]
            fn is_free(self, bit: usize) -> bool {
                self & (1 << bit) != 0
            }

            #[inline]
            fn mark_free(&mut self, bit: usize) {
                *self |= 1 << bit;
            }

            #[inline]
            fn mark_used(&mut self, bit: usize) {
                *self &= !(1 << bit);
            }
        }
    )*};
}

impl_bit_word!(u32, u64);

/// Fixed-width bitmap whose words always hold initialized values.
pub(crate) struct Bitmap<W: BitWord> {
    extent: Extent,
    words: usize,
    _word: PhantomData<W>,
}

impl<W: BitWord> Bitmap<W> {
    /// Allocates `words` words, all set to `fill`.
    pub(crate) fn new(backing: &Arc<dyn BackingAllocator>, words: usize, fill: W) -> Option<Self> {
        let bytes = words.checked_mul(size_of::<W>())?;
        let extent = Extent::allocate(backing, bytes)?;
        let mut bitmap = Self {
            extent,
            words,
            _word: PhantomData,
        };
        bitmap.words_mut().fill(fill);
        Some(bitmap)
    }

    /// Resizes to `words` words; appended words are set to `fill`.
    pub(crate) fn resize(&mut self, words: usize, fill: W) -> bool {
        let Some(bytes) = words.checked_mul(size_of::<W>()) else {
            return false;
        };
        if !self.extent.resize(bytes) {
            return false;
        }
        let old = self.words;
        self.words = words;
        if words > old {
            self.words_mut()[old..].fill(fill);
        }
        true
    }

    pub(crate) fn words(&self) -> &[W] {
        // SAFETY: the extent holds `words` initialized words and backing
        // blocks are at least 16-byte aligned.
        unsafe { std::slice::from_raw_parts(self.extent.as_ptr().as_ptr().cast::<W>(), self.words) }
    }

    pub(crate) fn words_mut(&mut self) -> &mut [W] {
        // SAFETY: as in `words`, and `&mut self` guarantees exclusivity.
        unsafe {
            std::slice::from_raw_parts_mut(self.extent.as_ptr().as_ptr().cast::<W>(), self.words)
        }
    }

    pub(crate) fn is_free(&self, bit: usize) -> bool {
        self.words()[bit / W::BITS].is_free(bit % W::BITS)
    }

    pub(crate) fn mark_free(&mut self, bit: usize) {
        self.words_mut()[bit / W::BITS].mark_free(bit % W::BITS);
    }

    pub(crate) fn mark_used(&mut self, bit: usize) {
        self.words_mut()[bit / W::BITS].mark_used(bit % W::BITS);
    }

    /// Lowest free bit in words `from_word..`.
    pub(crate) fn first_free_from(&self, from_word: usize) -> Option<usize> {
        self.words()
            .iter()
            .enumerate()
            .skip(from_word)
            .find_map(|(index, word)| word.first_free().map(|bit| index * W::BITS + bit))
    }

    /// Lowest start of `count` consecutive free bits at or after `from_bit`.
    pub(crate) fn find_free_run(&self, from_bit: usize, count: usize) -> Option<usize> {
        let total = self.words * W::BITS;
        let mut run_start = from_bit;
        let mut run_len = 0;
        let mut bit = from_bit;
        while bit < total {
            let word = self.words()[bit / W::BITS];
            if bit % W::BITS == 0 && word == W::NONE_FREE {
                run_len = 0;
                bit += W::BITS;
                run_start = bit;
                continue;
            }
            if word.is_free(bit % W::BITS) {
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
                run_start = bit + 1;
            }
            bit += 1;
        }
        None
    }
}
