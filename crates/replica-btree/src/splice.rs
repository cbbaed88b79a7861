//! Replace-ranges between two sorted entry lists.

use std::cmp::Ordering;

use crate::node::Entry;

/// A run of `removed` entries starting at `at` in the old list, replaced by
/// `added` entries starting at `from` in the new list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Splice {
    pub at: usize,
    pub removed: usize,
    pub from: usize,
    pub added: usize,
}

/// Compute the splices that turn `prev` into `next`.
///
/// Both lists must be sorted by key. Entries equal in key and value are
/// shared and split the output into separate splices.
pub fn compute_splices(prev: &[Entry], next: &[Entry]) -> Vec<Splice> {
    let mut splices = Vec::new();
    let mut current: Option<Splice> = None;
    let (mut p, mut n) = (0, 0);

    while p < prev.len() && n < next.len() {
        let (a, b) = (&prev[p], &next[n]);
        if a.key() == b.key() && a.value() == b.value() {
            splices.extend(current.take());
            p += 1;
            n += 1;
            continue;
        }
        let splice = current.get_or_insert(Splice {
            at: p,
            removed: 0,
            from: n,
            added: 0,
        });
        match a.key().cmp(b.key()) {
            Ordering::Less => {
                splice.removed += 1;
                p += 1;
            }
            Ordering::Greater => {
                splice.added += 1;
                n += 1;
            }
            Ordering::Equal => {
                splice.removed += 1;
                splice.added += 1;
                p += 1;
                n += 1;
            }
        }
    }

    if p < prev.len() || n < next.len() {
        let splice = current.get_or_insert(Splice {
            at: p,
            removed: 0,
            from: n,
            added: 0,
        });
        splice.removed += prev.len() - p;
        splice.added += next.len() - n;
    }
    splices.extend(current);
    splices
}
