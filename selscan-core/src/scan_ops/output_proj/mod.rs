//! Reads the hidden state out into the output sequence:
//!
//! ```text
//! y[t]   = Re(sum_n C[t, n] * x[t, n]) + D * u[t]
//! out[t] = y[t] * silu(z[t])
//! ```
//!
//! Gradients of complex quantities follow `g = dL/d(re) + i * dL/d(im)`.

use crate::dtypes::{Accum, ScanElem};

#[inline]
pub fn sigmoid<R: Accum>(x: R) -> R {
    R::one() / (R::one() + (-x).exp())
}

#[inline]
pub fn silu<R: Accum>(x: R) -> R {
    x * sigmoid(x)
}

/// `d silu(x) / dx = s * (1 + x * (1 - s))` with `s = sigmoid(x)`.
#[inline]
pub fn silu_grad<R: Accum>(x: R) -> R {
    let s = sigmoid(x);
    s * (R::one() + x * (R::one() - s))
}

/// One term of the state readout, `Re(c * x)`.
#[inline]
pub fn project<R: Accum, S: ScanElem<R>>(c: S, x: S) -> R {
    (c * x).re()
}

/// Gradients of [project] given `dy`, returned as `(dc, dx)`.
#[inline]
pub fn project_backward<R: Accum, S: ScanElem<R>>(c: S, x: S, dy: R) -> (S, S) {
    (x.conj().scale(dy), c.conj().scale(dy))
}

/// Applies the gate, if any.
#[inline]
pub fn gate<R: Accum>(y: R, z: Option<R>) -> R {
    match z {
        Some(z) => y * silu(z),
        None => y,
    }
}

/// Gradients of [gate] given `dout`, returned as `(dy, dz)`. `dz` is zero
/// without a gate.
#[inline]
pub fn gate_backward<R: Accum>(y: R, z: Option<R>, dout: R) -> (R, R) {
    match z {
        Some(z) => (dout * silu(z), dout * y * silu_grad(z)),
        None => (dout, R::zero()),
    }
}
