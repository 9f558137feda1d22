//! Bump-allocated arenas for compile-time and per-evaluation scratch data.
//!
//! Two flavors: `Arena<T>` hands out stable references to values of a
//! single type and backs the flux's span records, child-id slices, and
//! top-level form lists; `Scratch` backs short-lived work vectors (the
//! annotator's open-form stack, the evaluator's cache-reset worklist)
//! that grow inside the arena and are abandoned wholesale on reset.

use std::marker::PhantomData;

use bumpalo::Bump;

/// An arena-backed vector. Growth allocates a fresh buffer inside the
/// arena and copies; the old buffer stays in arena memory until the
/// arena resets.
pub type BumpVec<'b, T> = bumpalo::collections::Vec<'b, T>;

pub struct Arena<T> {
    bump: Bump,
    _ty: PhantomData<T>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Arena {
            bump: Bump::with_capacity(bytes),
            _ty: PhantomData,
        }
    }

    /// Move `value` into the arena. The reference stays valid across any
    /// number of later allocations, until `reset` or drop.
    pub fn alloc(&self, value: T) -> &T {
        self.bump.alloc(value)
    }

    /// Move a whole sequence into one contiguous arena slice.
    pub fn alloc_slice<I>(&self, items: I) -> &[T]
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        self.bump.alloc_slice_fill_iter(items)
    }

    /// Invalidate every reference and reclaim the memory for the next
    /// program, keeping the allocated capacity.
    pub fn reset(&mut self) {
        self.bump.reset();
    }

    pub fn allocated_bytes(&self) -> usize {
        self.bump.allocated_bytes()
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Untyped scratch arena for transient work vectors.
pub struct Scratch {
    bump: Bump,
}

impl Scratch {
    pub fn new() -> Self {
        Scratch { bump: Bump::new() }
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Scratch {
            bump: Bump::with_capacity(bytes),
        }
    }

    /// Start an empty arena-backed vector.
    pub fn vec<T>(&self) -> BumpVec<'_, T> {
        BumpVec::new_in(&self.bump)
    }

    pub fn reset(&mut self) {
        self.bump.reset();
    }

    pub fn allocated_bytes(&self) -> usize {
        self.bump.allocated_bytes()
    }
}

impl Default for Scratch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flux::{SexprSpan, TopForm};

    #[test]
    fn span_records_stay_put_as_the_table_grows() {
        let arena: Arena<SexprSpan> = Arena::new();
        let first = arena.alloc(SexprSpan {
            id: 1,
            start: 0,
            end: 6,
        });
        let rest: Vec<&SexprSpan> = (2..200)
            .map(|id| {
                arena.alloc(SexprSpan {
                    id,
                    start: id,
                    end: id + 2,
                })
            })
            .collect();
        assert_eq!((first.id, first.start, first.end), (1, 0, 6));
        assert_eq!(rest[0].id, 2);
        assert_eq!(rest.last().unwrap().id, 199);
    }

    #[test]
    fn span_tables_allocate_as_one_slice() {
        let arena: Arena<SexprSpan> = Arena::new();
        // Descending id order, the way the flux builder stores them.
        let table = arena.alloc_slice((1..4).rev().map(|id| SexprSpan {
            id,
            start: id,
            end: id + 1,
        }));
        assert_eq!(table.len(), 3);
        assert_eq!(table[0].id, 3);
        assert_eq!(table[2].id, 1);
    }

    #[test]
    fn child_id_lists_become_nested_arena_slices() {
        let ids: Arena<usize> = Arena::new();
        let lists: Arena<&[usize]> = Arena::new();
        let roots = ids.alloc_slice(vec![1]);
        let inner = ids.alloc_slice(vec![2, 3, 5]);
        let none = ids.alloc_slice(Vec::new());
        let table = lists.alloc_slice(vec![roots, inner, none]);
        assert_eq!(table[0], &[1]);
        assert_eq!(table[1], &[2, 3, 5]);
        assert!(table[2].is_empty());
    }

    #[test]
    fn empty_programs_get_an_empty_form_list() {
        let forms: Arena<TopForm> = Arena::new();
        let top = forms.alloc_slice(Vec::new());
        assert!(top.is_empty());
    }

    #[test]
    fn form_lists_keep_token_order() {
        let forms: Arena<TopForm> = Arena::new();
        let top = forms.alloc_slice(vec![
            TopForm::Atom(0),
            TopForm::Span(1),
            TopForm::Atom(9),
        ]);
        assert_eq!(top.len(), 3);
        assert!(matches!(top[1], TopForm::Span(1)));
        assert!(matches!(top[2], TopForm::Atom(9)));
    }

    #[test]
    fn reset_reclaims_one_program_before_the_next() {
        let mut spans: Arena<SexprSpan> = Arena::with_capacity(4096);
        for id in 1..=64 {
            spans.alloc(SexprSpan {
                id,
                start: id,
                end: id,
            });
        }
        assert!(spans.allocated_bytes() > 0);
        spans.reset();
        let again = spans.alloc(SexprSpan {
            id: 1,
            start: 0,
            end: 2,
        });
        assert_eq!(again.id, 1);
    }

    #[test]
    fn scratch_backs_the_annotators_open_form_stack() {
        let scratch = Scratch::new();
        let mut open = scratch.vec::<(usize, usize)>();
        for depth in 0..128 {
            open.push((depth + 1, depth));
        }
        for depth in (0..128).rev() {
            assert_eq!(open.pop(), Some((depth + 1, depth)));
        }
        assert!(open.is_empty());
    }

    #[test]
    fn scratch_vectors_grow_by_copying_inside_the_arena() {
        let scratch = Scratch::new();
        let mut work = scratch.vec::<usize>();
        for id in 0..1000 {
            work.push(id);
        }
        assert_eq!(work.len(), 1000);
        assert_eq!(work[999], 999);
        // The outgrown buffers stay behind in the arena until reset.
        assert!(scratch.allocated_bytes() >= 1000 * std::mem::size_of::<usize>());
    }

    #[test]
    fn scratch_reset_reuses_capacity_between_top_level_forms() {
        let mut scratch = Scratch::with_capacity(1024);
        {
            let mut work = scratch.vec::<usize>();
            work.extend(0..64);
        }
        scratch.reset();
        let mut work = scratch.vec::<usize>();
        work.push(7);
        assert_eq!(work[0], 7);
    }
}
