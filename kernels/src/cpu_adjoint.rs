use crate::{KernelElem, Located, Result, check_len};

/// Sums block `r` into block `0` for `r` in `1..ranks`, in ascending rank order.
///
/// `buf` holds `ranks` consecutive blocks of `elements` vectors of `width`
/// reals each (the gather layout). Only block `0` is meaningful afterwards.
pub fn sum_rank_blocks<T>(buf: &mut [T], elements: usize, ranks: usize, width: usize) -> Result<()>
where
    T: KernelElem,
{
    check_len(buf.len(), elements * ranks * width)?;

    let block = elements * width;
    for rank in 1..ranks {
        let (head, tail) = buf.split_at_mut(block * rank);
        let src = &tail[..block];
        for (dst, &s) in head[..block].iter_mut().zip(src) {
            *dst += s;
        }
    }
    Ok(())
}

/// Product of every *other* rank's primal, per element.
///
/// This is the local derivative of a product reduction with respect to the
/// contribution of `rank`. Computed directly rather than as `result / x_rank`
/// so zero contributions get the right derivative.
pub fn exclusive_product<T>(primals: &[T], elements: usize, ranks: usize, rank: usize) -> Result<Vec<T>>
where
    T: KernelElem,
{
    check_len(primals.len(), elements * ranks)?;

    let mut out = vec![T::one(); elements];
    for other in (0..ranks).filter(|&r| r != rank) {
        let block = &primals[other * elements..(other + 1) * elements];
        for (o, &p) in out.iter_mut().zip(block) {
            *o *= p;
        }
    }
    Ok(out)
}

/// For each element, the lowest rank whose primal equals the reduced result.
///
/// `None` means no contribution matched, which only happens when `result` was
/// not produced from `primals` (e.g. a NaN made every comparison fail).
pub fn value_winners<T>(primals: &[T], result: &[T], elements: usize, ranks: usize) -> Result<Vec<Option<usize>>>
where
    T: KernelElem,
{
    check_len(primals.len(), elements * ranks)?;
    check_len(result.len(), elements)?;

    Ok((0..elements)
        .map(|e| (0..ranks).find(|&r| primals[r * elements + e] == result[e]))
        .collect())
}

/// Located counterpart of [`value_winners`]: value and location must both match.
pub fn located_winners<T>(
    primals: &[Located<T>],
    result: &[Located<T>],
    elements: usize,
    ranks: usize,
) -> Result<Vec<Option<usize>>>
where
    T: KernelElem,
{
    check_len(primals.len(), elements * ranks)?;
    check_len(result.len(), elements)?;

    Ok((0..elements)
        .map(|e| (0..ranks).find(|&r| primals[r * elements + e] == result[e]))
        .collect())
}

/// Zeroes every element whose winner is not `rank`.
pub fn mask_non_winners<T>(adjoints: &mut [T], winners: &[Option<usize>], rank: usize, width: usize) -> Result<()>
where
    T: KernelElem,
{
    check_len(adjoints.len(), winners.len() * width)?;

    for (chunk, winner) in adjoints.chunks_exact_mut(width.max(1)).zip(winners) {
        if *winner != Some(rank) {
            chunk.iter_mut().for_each(|a| *a = T::zero());
        }
    }
    Ok(())
}

/// Multiplies each `width`-wide vector by its per-element factor.
pub fn scale_blocks<T>(adjoints: &mut [T], factors: &[T], width: usize) -> Result<()>
where
    T: KernelElem,
{
    check_len(adjoints.len(), factors.len() * width)?;

    for (chunk, &f) in adjoints.chunks_exact_mut(width.max(1)).zip(factors) {
        chunk.iter_mut().for_each(|a| *a *= f);
    }
    Ok(())
}

/// `out[e] = sum_r weights[r][e] * values[r][e]`, accumulated in ascending rank order.
///
/// Used to push tangents forward through a reduction once the per-rank local
/// derivatives are known.
pub fn weighted_block_sum<T>(
    values: &[T],
    weights: &[T],
    elements: usize,
    ranks: usize,
    width: usize,
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    check_len(values.len(), ranks * elements * width)?;
    check_len(weights.len(), ranks * elements)?;

    let mut out = vec![T::zero(); elements * width];
    for r in 0..ranks {
        for e in 0..elements {
            let w = weights[r * elements + e];
            let src = &values[(r * elements + e) * width..(r * elements + e + 1) * width];
            for (o, &v) in out[e * width..(e + 1) * width].iter_mut().zip(src) {
                *o += w * v;
            }
        }
    }
    Ok(out)
}
