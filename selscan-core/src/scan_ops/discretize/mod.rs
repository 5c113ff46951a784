//! Turns the continuous-time parameters of a state-space model into the discrete
//! coefficients of the recurrence `x[t] = a_bar[t] * x[t - 1] + b_bar[t] * u[t]`.
//!
//! Everything here is a pure per-element function over a [ScanElem], so the same
//! code serves real and complex state.

use crate::dtypes::{Accum, ScanElem};

/// Above this value softplus is the identity.
pub const SOFTPLUS_THRESHOLD: f64 = 20.0;

/// Below this magnitude of `z` the zero-order-hold factor is evaluated by its
/// Taylor series.
pub const EXPM1_SERIES_THRESHOLD: f64 = 0.1;

/// How the input coupling is discretized.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Discretization {
    /// `b_bar = dt * B`
    #[default]
    Euler,
    /// Zero-order hold: `b_bar = dt * phi(dt * A) * B` with `phi(z) = (exp(z) - 1) / z`.
    Zoh,
}

/// What a pass does with transitions that would make the state grow.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum StabilityCheck {
    /// Clamp the real part of `dt * A` to `<= 0` and count how often that happened.
    #[default]
    Clamp,
    /// Reject the pass with [crate::tensor::Error::NumericInstability].
    Strict,
}

/// Returns `(dt, d dt / d v)`.
#[inline]
pub fn time_step<R: Accum>(v: R, softplus: bool) -> (R, R) {
    if !softplus || v > R::cast(SOFTPLUS_THRESHOLD) {
        (v, R::one())
    } else {
        (v.exp().ln_1p(), crate::scan_ops::output_proj::sigmoid(v))
    }
}

/// Discrete transition for one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decay<S> {
    /// `dt * A` after clamping.
    pub z: S,
    /// `exp(z)`.
    pub a_bar: S,
    /// Whether the real part of `dt * A` was positive and got clamped.
    pub clamped: bool,
}

#[inline]
pub fn decay<R: Accum, S: ScanElem<R>>(dt: R, a: S) -> Decay<S> {
    let (z, clamped) = a.scale(dt).clamp_re_nonpos();
    Decay {
        z,
        a_bar: z.exp_elem(),
        clamped,
    }
}

const PHI_SERIES: [f64; 7] = [
    1.0,
    1.0 / 2.0,
    1.0 / 6.0,
    1.0 / 24.0,
    1.0 / 120.0,
    1.0 / 720.0,
    1.0 / 5040.0,
];

const DPHI_SERIES: [f64; 6] = [
    1.0 / 2.0,
    2.0 / 6.0,
    3.0 / 24.0,
    4.0 / 120.0,
    5.0 / 720.0,
    6.0 / 5040.0,
];

#[inline]
fn horner<R: Accum, S: ScanElem<R>>(coeffs: &[f64], z: S) -> S {
    let mut acc = S::zeroed();
    for &c in coeffs.iter().rev() {
        acc = acc * z + S::from_re(R::cast(c));
    }
    acc
}

/// Returns `(phi(z), phi'(z))` for `phi(z) = (exp(z) - 1) / z`, given `exp_z = exp(z)`.
#[inline]
pub fn phi<R: Accum, S: ScanElem<R>>(z: S, exp_z: S) -> (S, S) {
    if z.magnitude() < R::cast(EXPM1_SERIES_THRESHOLD) {
        (
            horner::<R, S>(&PHI_SERIES, z),
            horner::<R, S>(&DPHI_SERIES, z),
        )
    } else {
        let p = (exp_z - S::unit()) / z;
        (p, (exp_z - p) / z)
    }
}

/// Multiplier applied to `dt * B`, with its derivative w.r.t. `z`.
#[inline]
pub fn input_scale<R: Accum, S: ScanElem<R>>(method: Discretization, decay: &Decay<S>) -> (S, S) {
    match method {
        Discretization::Euler => (S::unit(), S::zeroed()),
        Discretization::Zoh => phi::<R, S>(decay.z, decay.a_bar),
    }
}
