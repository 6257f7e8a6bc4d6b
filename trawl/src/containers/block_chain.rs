//! Append-only segmented sequence.
//!
//! A [`BlockChain`] stores elements in fixed-capacity blocks so that growing
//! the sequence never moves existing elements. The root block is allocated
//! eagerly; later blocks are allocated on demand and retained by
//! [`BlockChain::reset`], which makes a reset-then-refill cycle allocation
//! free.

use std::iter::FusedIterator;

pub const DEFAULT_BLOCK_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct BlockChain<T, const N: usize = DEFAULT_BLOCK_CAPACITY> {
    blocks: Vec<Vec<T>>,
    /// Index of the block currently receiving pushes.
    current: usize,
    len: usize,
}

impl<T, const N: usize> Default for BlockChain<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> BlockChain<T, N> {
    /// # Panics
    /// Panics if `N` is zero.
    #[must_use]
    pub fn new() -> Self {
        assert!(N > 0, "BlockChain block capacity must be non-zero");
        Self { blocks: vec![Vec::with_capacity(N)], current: 0, len: 0 }
    }

    pub fn push_back(&mut self, value: T) {
        if self.blocks[self.current].len() == N {
            self.current += 1;
            if self.current == self.blocks.len() {
                self.blocks.push(Vec::with_capacity(N));
            }
        }
        self.blocks[self.current].push(value);
        self.len += 1;
    }

    /// Drops every block except the root and empties it.
    pub fn clear(&mut self) {
        self.blocks.truncate(1);
        self.blocks[0].clear();
        self.current = 0;
        self.len = 0;
    }

    /// Empties every block but keeps the allocations for reuse.
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            block.clear();
        }
        self.current = 0;
        self.len = 0;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of allocated blocks, including retained empty ones.
    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Data pointer of the root block. Stable across [`reset`](Self::reset).
    #[must_use]
    pub fn root_block_ptr(&self) -> *const T {
        self.blocks[0].as_ptr()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        self.blocks[index / N].get(index % N)
    }

    #[must_use]
    pub fn last(&self) -> Option<&T> {
        self.blocks[self.current].last()
    }

    #[must_use]
    pub fn iter(&self) -> Iter<'_, T, N> {
        self.iter_prefix(self.len)
    }

    /// Iterates over the first `n` elements only.
    ///
    /// Readers that snapshot `len()` under the same lock that guards pushes can
    /// use this to walk a consistent prefix.
    #[must_use]
    pub fn iter_prefix(&self, n: usize) -> Iter<'_, T, N> {
        Iter { chain: self, block: 0, offset: 0, remaining: n.min(self.len) }
    }
}

impl<T: Clone, const N: usize> BlockChain<T, N> {
    /// Equivalent to `count` calls to [`push_back`](Self::push_back).
    pub fn push_back_n(&mut self, value: &T, count: usize) {
        for _ in 0..count {
            self.push_back(value.clone());
        }
    }
}

pub struct Iter<'a, T, const N: usize> {
    chain: &'a BlockChain<T, N>,
    block: usize,
    offset: usize,
    remaining: usize,
}

impl<'a, T, const N: usize> Iterator for Iter<'a, T, N> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        if self.offset == N {
            self.block += 1;
            self.offset = 0;
        }
        let item = self.chain.blocks.get(self.block)?.get(self.offset)?;
        self.offset += 1;
        self.remaining -= 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T, const N: usize> ExactSizeIterator for Iter<'_, T, N> {}
impl<T, const N: usize> FusedIterator for Iter<'_, T, N> {}

impl<'a, T, const N: usize> IntoIterator for &'a BlockChain<T, N> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T, N>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T, const N: usize> Extend<T> for BlockChain<T, N> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for value in iter {
            self.push_back(value);
        }
    }
}
