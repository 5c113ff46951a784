//! Chunked evaluation of the first order linear recurrence
//! `x[t] = a[t] * x[t - 1] + b[t]`.
//!
//! Each step is the pair `(a[t], b[t])`, and pairs compose with the associative
//! operator [ScanPair::combine]. The time axis is split into windows of
//! `chunk_size` steps. Within a window an inclusive prefix combine is computed
//! with a [ScanStrategy], then the carry from the previous window is applied:
//! `x[t] = P_a(t) * carry + P_b(t)`.
//!
//! The reverse (adjoint) recurrence is the same scan run over the reversed
//! sequence with conjugated transitions.

use crate::dtypes::ScanElem;
use std::{marker::PhantomData, ops::Range};

/// How the prefix combine inside a chunk is computed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ScanStrategy {
    /// Left fold, one combine per step.
    #[default]
    Sequential,
    /// Hillis-Steele prefix combine in `ceil(log2(len))` sweeps.
    LogDepth,
}

/// An element of the scan: the affine map `x -> a * x + b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanPair<S> {
    pub a: S,
    pub b: S,
}

impl<S: Copy> ScanPair<S> {
    pub fn new(a: S, b: S) -> Self {
        Self { a, b }
    }
}

impl<S> ScanPair<S> {
    /// `self` followed by `next`: `(a1, b1) o (a2, b2) = (a2 * a1, a2 * b1 + b2)`.
    #[inline(always)]
    pub fn combine<R>(self, next: Self) -> Self
    where
        S: ScanElem<R>,
    {
        Self {
            a: next.a * self.a,
            b: next.a * self.b + next.b,
        }
    }

    #[inline(always)]
    pub fn apply<R>(&self, carry: S) -> S
    where
        S: ScanElem<R>,
    {
        self.a * carry + self.b
    }
}

/// Inclusive prefix combine of `pairs` in place.
pub fn scan_chunk<R, S: ScanElem<R>>(pairs: &mut [ScanPair<S>], strategy: ScanStrategy) {
    match strategy {
        ScanStrategy::Sequential => {
            for i in 1..pairs.len() {
                pairs[i] = pairs[i - 1].combine(pairs[i]);
            }
        }
        ScanStrategy::LogDepth => {
            let mut offset = 1;
            while offset < pairs.len() {
                // descending so every read sees the previous sweep
                for i in (offset..pairs.len()).rev() {
                    pairs[i] = pairs[i - offset].combine(pairs[i]);
                }
                offset *= 2;
            }
        }
    }
}

/// Scans one chunk starting from `carry`, calling `visit(i, x)` for every step,
/// and returns the state after the last step (`carry` for an empty chunk).
pub fn scan_chunk_from<R, S: ScanElem<R>, F: FnMut(usize, S)>(
    pairs: &mut [ScanPair<S>],
    carry: S,
    strategy: ScanStrategy,
    mut visit: F,
) -> S {
    scan_chunk(pairs, strategy);
    let mut last = carry;
    for (i, p) in pairs.iter().enumerate() {
        last = p.apply(carry);
        visit(i, last);
    }
    last
}

/// Number of chunks a time axis of `seqlen` steps is split into.
pub fn n_chunks(seqlen: usize, chunk_size: usize) -> usize {
    seqlen.div_ceil(chunk_size)
}

/// Iterator over the step ranges of each chunk, in time order.
pub fn chunks(seqlen: usize, chunk_size: usize) -> Chunks {
    Chunks {
        start: 0,
        seqlen,
        chunk_size,
    }
}

#[derive(Debug, Clone)]
pub struct Chunks {
    start: usize,
    seqlen: usize,
    chunk_size: usize,
}

impl Iterator for Chunks {
    type Item = Range<usize>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.start >= self.seqlen {
            return None;
        }
        let end = (self.start + self.chunk_size).min(self.seqlen);
        let r = self.start..end;
        self.start = end;
        Some(r)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = n_chunks(self.seqlen - self.start, self.chunk_size);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Chunks {}

impl DoubleEndedIterator for Chunks {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.start >= self.seqlen {
            return None;
        }
        let k = n_chunks(self.seqlen - self.start, self.chunk_size) - 1;
        let begin = self.start + k * self.chunk_size;
        let r = begin..self.seqlen;
        self.seqlen = begin;
        Some(r)
    }
}

/// Runs the whole recurrence over `pairs` from a zero state and returns every state.
pub fn chunked_scan<R, S: ScanElem<R>>(
    pairs: &[ScanPair<S>],
    chunk_size: usize,
    strategy: ScanStrategy,
) -> Vec<S> {
    let mut out = Vec::with_capacity(pairs.len());
    let mut carry = S::zeroed();
    let mut buf: Vec<ScanPair<S>> = Vec::with_capacity(chunk_size.min(pairs.len()));
    for range in chunks(pairs.len(), chunk_size) {
        buf.clear();
        buf.extend_from_slice(&pairs[range]);
        carry = scan_chunk_from(&mut buf, carry, strategy, |_, x| out.push(x));
    }
    out
}

/// Step-by-step recurrence from a zero state.
pub fn sequential_scan<R, S: ScanElem<R>>(pairs: &[ScanPair<S>]) -> Vec<S> {
    let mut x = S::zeroed();
    pairs
        .iter()
        .map(|p| {
            x = p.apply(x);
            x
        })
        .collect()
}

/// Buffers the reversed adjoint scan of one chunk.
///
/// Pushed in reverse time order; each pushed pair is
/// `(conj(a_bar[t + 1]), g[t])` where `g[t]` is the direct gradient reaching
/// `x[t]`.
#[derive(Debug)]
pub struct ReverseChunk<R, S> {
    pairs: Vec<ScanPair<S>>,
    marker: PhantomData<R>,
}

impl<R, S: ScanElem<R>> ReverseChunk<R, S> {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            pairs: Vec::with_capacity(n),
            marker: PhantomData,
        }
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    pub fn push(&mut self, a_next: S, g: S) {
        self.pairs.push(ScanPair::new(a_next.conj(), g));
    }

    /// Scans from the adjoint `carry` flowing in from the later chunk. `visit`
    /// receives the accumulated adjoint of each step in reverse time order (index
    /// `0` is the last step of the chunk).
    pub fn scan<F: FnMut(usize, S)>(&mut self, carry: S, strategy: ScanStrategy, visit: F) -> S {
        scan_chunk_from(&mut self.pairs, carry, strategy, visit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtypes::Complex;
    use crate::tests::*;

    fn pairs(n: usize) -> Vec<ScanPair<f64>> {
        (0..n)
            .map(|i| {
                let t = i as f64;
                ScanPair::new(0.5 + 0.4 * (0.7 * t).sin(), (1.3 * t).cos())
            })
            .collect()
    }

    #[test]
    fn test_combine_is_associative() {
        let p = pairs(3);
        let l = p[0].combine(p[1]).combine(p[2]);
        let r = p[0].combine(p[1].combine(p[2]));
        assert_close!(l.a, r.a, 1e-15);
        assert_close!(l.b, r.b, 1e-15);
    }

    #[test]
    fn test_chunk_sizes_and_strategies_agree() {
        let p = pairs(37);
        let expected = sequential_scan(&p);
        for &chunk in &[1, 2, 5, 16, 37, 64] {
            for &strategy in &[ScanStrategy::Sequential, ScanStrategy::LogDepth] {
                let got = chunked_scan(&p, chunk, strategy);
                assert_close!(got, expected, 1e-12);
            }
        }
    }

    #[test]
    fn test_complex_chunked_scan() {
        let p: Vec<ScanPair<Complex<f64>>> = (0..19)
            .map(|i| {
                let t = i as f64;
                let a = Complex::from_polar(0.9, 0.3 * t);
                ScanPair::new(a, Complex::new(t.sin(), t.cos()))
            })
            .collect();
        let expected = sequential_scan(&p);
        let got = chunked_scan(&p, 4, ScanStrategy::LogDepth);
        for (g, e) in got.iter().zip(expected.iter()) {
            assert_close!(g.re, e.re, 1e-12);
            assert_close!(g.im, e.im, 1e-12);
        }
    }

    #[test]
    fn test_chunk_ranges() {
        let fwd: Vec<_> = chunks(10, 4).collect();
        assert_eq!(fwd, vec![0..4, 4..8, 8..10]);
        let rev: Vec<_> = chunks(10, 4).rev().collect();
        assert_eq!(rev, vec![8..10, 4..8, 0..4]);
        assert_eq!(chunks(0, 4).count(), 0);
        assert_eq!(n_chunks(0, 4), 0);
        assert_eq!(n_chunks(8, 4), 2);
        assert_eq!(n_chunks(9, 4), 3);
    }

    #[test]
    fn test_empty_chunk_returns_carry() {
        let mut empty: Vec<ScanPair<f32>> = Vec::new();
        let last = scan_chunk_from(&mut empty, 3.0, ScanStrategy::LogDepth, |_, _| {
            panic!("no steps")
        });
        assert_eq!(last, 3.0);
    }

    #[test]
    fn test_reverse_chunk_is_adjoint() {
        // for x[t] = a[t] x[t-1] + b[t] and L = sum_t g[t] x[t], dL/db[t] = h[t]
        // with h[t] = g[t] + a[t+1] h[t+1].
        let p = pairs(9);
        let g: Vec<f64> = (0..9).map(|i| 0.1 * i as f64 - 0.3).collect();
        let mut expected = vec![0.0; 9];
        let mut h = 0.0;
        for t in (0..9).rev() {
            let a_next = if t + 1 < 9 { p[t + 1].a } else { 0.0 };
            h = g[t] + a_next * h;
            expected[t] = h;
        }

        let mut got = vec![0.0; 9];
        let mut carry = 0.0;
        let mut carry_a = 0.0;
        for range in chunks(9, 4).rev() {
            let mut rev = ReverseChunk::<f64, f64>::with_capacity(4);
            for t in range.clone().rev() {
                let a_next = if t + 1 == range.end { carry_a } else { p[t + 1].a };
                rev.push(a_next, g[t]);
            }
            let start = range.start;
            let end = range.end;
            carry = rev.scan(carry, ScanStrategy::LogDepth, |i, h| got[end - 1 - i] = h);
            carry_a = p[start].a;
        }
        assert_close!(got, expected, 1e-12);
        assert_close!(carry, expected[0], 1e-12);
    }
}
