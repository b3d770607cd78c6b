use crate::{KernelElem, KernelError, Result, check_len};

/// A value paired with a non-differentiable location, as carried by the
/// min-loc / max-loc reductions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Located<T> {
    pub value: T,
    pub loc: i32,
}

impl<T> Located<T> {
    pub fn new(value: T, loc: i32) -> Self {
        Self { value, loc }
    }
}

pub fn sum<T: KernelElem>(acc: T, next: T) -> T {
    acc + next
}

pub fn prod<T: KernelElem>(acc: T, next: T) -> T {
    acc * next
}

/// Keeps `acc` on ties so the earlier (lower rank) contribution wins.
pub fn min<T: KernelElem>(acc: T, next: T) -> T {
    if next < acc { next } else { acc }
}

/// Keeps `acc` on ties so the earlier (lower rank) contribution wins.
pub fn max<T: KernelElem>(acc: T, next: T) -> T {
    if next > acc { next } else { acc }
}

/// Smallest value; equal values resolve to the smaller location.
pub fn min_loc<T: KernelElem>(acc: Located<T>, next: Located<T>) -> Located<T> {
    if next.value < acc.value || (next.value == acc.value && next.loc < acc.loc) {
        next
    } else {
        acc
    }
}

/// Largest value; equal values resolve to the smaller location.
pub fn max_loc<T: KernelElem>(acc: Located<T>, next: Located<T>) -> Located<T> {
    if next.value > acc.value || (next.value == acc.value && next.loc < acc.loc) {
        next
    } else {
        acc
    }
}

/// Folds `ranks` blocks of `elements` values with `f`, in ascending rank order.
///
/// The result is `f(..f(f(b0, b1), b2).., b_{n-1})` per element, which is the
/// same order the in-process transport uses, so a rank that recomputes a
/// reduction locally gets bit-identical values.
pub fn fold_ranks<T, F>(blocks: &[T], elements: usize, ranks: usize, f: F) -> Result<Vec<T>>
where
    T: KernelElem,
    F: Fn(T, T) -> T,
{
    if ranks == 0 {
        return Err(KernelError::NoContributions);
    }
    check_len(blocks.len(), elements * ranks)?;

    let mut acc = blocks[..elements].to_vec();
    for block in blocks.chunks_exact(elements.max(1)).skip(1).take(ranks - 1) {
        for (a, &b) in acc.iter_mut().zip(block) {
            *a = f(*a, b);
        }
    }
    Ok(acc)
}

/// Located counterpart of [`fold_ranks`].
pub fn fold_ranks_located<T, F>(
    blocks: &[Located<T>],
    elements: usize,
    ranks: usize,
    f: F,
) -> Result<Vec<Located<T>>>
where
    T: KernelElem,
    F: Fn(Located<T>, Located<T>) -> Located<T>,
{
    if ranks == 0 {
        return Err(KernelError::NoContributions);
    }
    check_len(blocks.len(), elements * ranks)?;

    let mut acc = blocks[..elements].to_vec();
    for block in blocks.chunks_exact(elements.max(1)).skip(1).take(ranks - 1) {
        for (a, &b) in acc.iter_mut().zip(block) {
            *a = f(*a, b);
        }
    }
    Ok(acc)
}
