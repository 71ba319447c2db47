//! Block-allocated storage for feature rows.
//!
//! Feature tables can run to millions of rows, so rows are carved out of
//! large shared blocks instead of being allocated one `Vec` at a time.
//! Rows are addressed by an opaque [`RowId`]; callers never see a raw
//! pointer and releases go back onto a free list for reuse.

/// An opaque handle to one feature row inside a [`FeatureArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RowId(u32);

impl RowId {
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Slab storage for fixed-width `f64` feature rows.
///
/// All rows share the same width, fixed at construction. The arena is
/// append-mostly: `acquire` hands out the next free slot, `release` returns
/// a slot to the free list. During training the arena is only read, so a
/// shared reference can be handed to worker threads.
#[derive(Debug, Default, Clone)]
pub struct FeatureArena {
    num_features: usize,
    rows_per_block: usize,
    blocks: Vec<Box<[f64]>>,
    free_rows: Vec<RowId>,
    next_row: u32,
}

impl FeatureArena {
    /// Target block size in number of `f64` values.
    const BLOCK_SIZE: usize = 65536;

    pub fn new(num_features: usize) -> Self {
        let rows_per_block = (Self::BLOCK_SIZE / num_features.max(1)).max(1);
        Self {
            num_features,
            rows_per_block,
            blocks: Vec::new(),
            free_rows: Vec::new(),
            next_row: 0,
        }
    }

    #[inline]
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    /// The number of rows currently handed out.
    pub fn len(&self) -> usize {
        self.next_row as usize - self.free_rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquire a zeroed row slot.
    pub fn acquire(&mut self) -> RowId {
        if let Some(id) = self.free_rows.pop() {
            let row = self.row_mut(id);
            row.fill(0.0);
            return id;
        }
        let id = RowId(self.next_row);
        self.next_row += 1;
        if self.block_of(id).0 == self.blocks.len() {
            self.blocks
                .push(vec![0.0; self.rows_per_block * self.num_features].into_boxed_slice());
        }
        id
    }

    /// Acquire a row slot and fill it from `values`.
    ///
    /// Panics if `values` does not match the arena's feature width.
    pub fn acquire_from(&mut self, values: &[f64]) -> RowId {
        assert_eq!(values.len(), self.num_features);
        let id = self.acquire();
        self.row_mut(id).copy_from_slice(values);
        id
    }

    /// Return a row slot to the free list. The handle must not be used
    /// afterwards.
    pub fn release(&mut self, id: RowId) {
        debug_assert!(id.0 < self.next_row);
        self.free_rows.push(id);
    }

    #[inline]
    fn block_of(&self, id: RowId) -> (usize, usize) {
        let ix = id.index();
        (ix / self.rows_per_block, ix % self.rows_per_block)
    }

    #[inline]
    pub fn row(&self, id: RowId) -> &[f64] {
        let (block, slot) = self.block_of(id);
        let start = slot * self.num_features;
        &self.blocks[block][start..start + self.num_features]
    }

    #[inline]
    pub fn row_mut(&mut self, id: RowId) -> &mut [f64] {
        let (block, slot) = self.block_of(id);
        let start = slot * self.num_features;
        &mut self.blocks[block][start..start + self.num_features]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_acquire_release_reuse() {
        let mut arena = FeatureArena::new(4);
        let a = arena.acquire_from(&[1.0, 2.0, 3.0, 4.0]);
        let b = arena.acquire_from(&[5.0, 6.0, 7.0, 8.0]);
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.row(a), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(arena.row(b), &[5.0, 6.0, 7.0, 8.0]);

        arena.release(a);
        assert_eq!(arena.len(), 1);
        let c = arena.acquire();
        assert_eq!(c, a, "released slot should be reused");
        assert_eq!(arena.row(c), &[0.0; 4], "reused slot must be zeroed");
    }

    #[test]
    fn test_many_rows_cross_blocks() {
        let width = 1000;
        let mut arena = FeatureArena::new(width);
        let ids: Vec<_> = (0..300)
            .map(|i| arena.acquire_from(&vec![i as f64; width]))
            .collect();
        assert!(arena.blocks.len() > 1);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(arena.row(*id)[0], i as f64);
            assert_eq!(arena.row(*id)[width - 1], i as f64);
        }
    }
}
