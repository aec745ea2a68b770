// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Suffix stealing over the scheduler's shared stack.
//!
//! Per spec §4.1 step 3, an idle worker takes roughly 75% of the shared
//! stack and leaves the rest for other idle workers, finding the split point
//! by walking a quarter of the list from the head rather than scanning the
//! whole thing. The teacher's `scheduler/steal.rs` does the equivalent over
//! an intrusive MPSC queue (`Stealer::spawn_half`); here the shared stack is
//! a plain `Vec<Box<dyn Work>>` (see `DESIGN.md`'s Open Question on this), so
//! the same split is just [`Vec::split_off`] at the computed index.

use crate::work::Work;

/// Splits `shared` into the portion that remains shared (kept) and the
/// portion handed to the stealing worker (returned).
///
/// Leaves roughly `len / 4` items behind; everything else is returned. Never
/// leaves `shared` non-empty and also returns an empty `Vec` when `shared`
/// started non-empty, and never panics on small inputs (`len` 0 or 1).
pub(crate) fn split_steal(shared: &mut Vec<Box<dyn Work>>) -> Vec<Box<dyn Work>> {
    let len = shared.len();
    if len == 0 {
        return Vec::new();
    }

    let keep = if len == 1 { 0 } else { (len / 4).max(1) };
    shared.split_off(keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Worker;

    struct Noop;

    impl Work for Noop {
        fn run(self: Box<Self>, _worker: &mut Worker) {}
    }

    fn stack(n: usize) -> Vec<Box<dyn Work>> {
        (0..n).map(|_| Box::new(Noop) as Box<dyn Work>).collect()
    }

    #[test]
    fn empty_stack_steals_nothing() {
        let mut shared = stack(0);
        assert!(split_steal(&mut shared).is_empty());
        assert!(shared.is_empty());
    }

    #[test]
    fn single_item_is_stolen_whole() {
        let mut shared = stack(1);
        let stolen = split_steal(&mut shared);
        assert_eq!(stolen.len(), 1);
        assert!(shared.is_empty());
    }

    #[test]
    fn steals_roughly_three_quarters() {
        let mut shared = stack(16);
        let stolen = split_steal(&mut shared);
        assert_eq!(shared.len(), 4);
        assert_eq!(stolen.len(), 12);
    }
}
