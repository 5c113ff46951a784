use super::Dtype;
use num_complex::Complex;
use num_traits::{Float, One, Zero};

/// Whether the hidden state is real or complex.
///
/// Complex tensors are stored as paired `(re, im)` values along a trailing axis of
/// size 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateMode {
    Real,
    Complex,
}

impl StateMode {
    /// Number of stored scalars per state element.
    pub const fn width(&self) -> usize {
        match self {
            Self::Real => 1,
            Self::Complex => 2,
        }
    }
}

/// Element of the hidden state, generic over real and complex arithmetic.
///
/// `R` is the accumulator the element is built from. Every kernel in
/// [crate::scan_ops] is written once against this trait and instantiated for
/// `R` and `Complex<R>`.
pub trait ScanElem<R>:
    Copy
    + Default
    + std::fmt::Debug
    + PartialEq
    + Send
    + Sync
    + std::ops::Add<Output = Self>
    + std::ops::Sub<Output = Self>
    + std::ops::Mul<Output = Self>
    + std::ops::Div<Output = Self>
    + std::ops::AddAssign
{
    const MODE: StateMode;

    fn zeroed() -> Self;
    fn unit() -> Self;
    fn from_re(re: R) -> Self;
    fn re(self) -> R;
    fn conj(self) -> Self;
    fn scale(self, s: R) -> Self;
    fn exp_elem(self) -> Self;
    fn magnitude(self) -> R;
    fn all_finite(self) -> bool;

    /// Clamps the real part to `<= 0`, so that `exp` of the result has magnitude `<= 1`.
    /// The flag is `true` when the clamp changed the value.
    fn clamp_re_nonpos(self) -> (Self, bool);

    /// Zeroes the real part unless `keep`. This is the gradient of [ScanElem::clamp_re_nonpos].
    fn mask_re(self, keep: bool) -> Self;

    /// Reads `MODE.width()` scalars from the front of `src`.
    fn load<E: Dtype<Acc = R>>(src: &[E]) -> Self;
    fn store<E: Dtype<Acc = R>>(self, dst: &mut [E]);
    fn load_acc(src: &[R]) -> Self;
    fn store_acc(self, dst: &mut [R]);
}

macro_rules! real_elem {
    ($R:ty) => {
        impl ScanElem<$R> for $R {
            const MODE: StateMode = StateMode::Real;

            #[inline(always)]
            fn zeroed() -> Self {
                Zero::zero()
            }
            #[inline(always)]
            fn unit() -> Self {
                One::one()
            }
            #[inline(always)]
            fn from_re(re: $R) -> Self {
                re
            }
            #[inline(always)]
            fn re(self) -> $R {
                self
            }
            #[inline(always)]
            fn conj(self) -> Self {
                self
            }
            #[inline(always)]
            fn scale(self, s: $R) -> Self {
                self * s
            }
            #[inline(always)]
            fn exp_elem(self) -> Self {
                Float::exp(self)
            }
            #[inline(always)]
            fn magnitude(self) -> $R {
                Float::abs(self)
            }
            #[inline(always)]
            fn all_finite(self) -> bool {
                Float::is_finite(self)
            }
            #[inline(always)]
            fn clamp_re_nonpos(self) -> (Self, bool) {
                if self > 0.0 {
                    (0.0, true)
                } else {
                    (self, false)
                }
            }
            #[inline(always)]
            fn mask_re(self, keep: bool) -> Self {
                if keep {
                    self
                } else {
                    0.0
                }
            }
            #[inline(always)]
            fn load<E: Dtype<Acc = $R>>(src: &[E]) -> Self {
                src[0].to_acc()
            }
            #[inline(always)]
            fn store<E: Dtype<Acc = $R>>(self, dst: &mut [E]) {
                dst[0] = E::from_acc(self);
            }
            #[inline(always)]
            fn load_acc(src: &[$R]) -> Self {
                src[0]
            }
            #[inline(always)]
            fn store_acc(self, dst: &mut [$R]) {
                dst[0] = self;
            }
        }
    };
}

macro_rules! complex_elem {
    ($R:ty) => {
        impl ScanElem<$R> for Complex<$R> {
            const MODE: StateMode = StateMode::Complex;

            #[inline(always)]
            fn zeroed() -> Self {
                Complex::new(0.0, 0.0)
            }
            #[inline(always)]
            fn unit() -> Self {
                Complex::new(1.0, 0.0)
            }
            #[inline(always)]
            fn from_re(re: $R) -> Self {
                Complex::new(re, 0.0)
            }
            #[inline(always)]
            fn re(self) -> $R {
                self.re
            }
            #[inline(always)]
            fn conj(self) -> Self {
                Complex::new(self.re, -self.im)
            }
            #[inline(always)]
            fn scale(self, s: $R) -> Self {
                Complex::new(self.re * s, self.im * s)
            }
            #[inline(always)]
            fn exp_elem(self) -> Self {
                let r = Float::exp(self.re);
                let (sin, cos) = Float::sin_cos(self.im);
                Complex::new(r * cos, r * sin)
            }
            #[inline(always)]
            fn magnitude(self) -> $R {
                Float::hypot(self.re, self.im)
            }
            #[inline(always)]
            fn all_finite(self) -> bool {
                Float::is_finite(self.re) && Float::is_finite(self.im)
            }
            #[inline(always)]
            fn clamp_re_nonpos(self) -> (Self, bool) {
                if self.re > 0.0 {
                    (Complex::new(0.0, self.im), true)
                } else {
                    (self, false)
                }
            }
            #[inline(always)]
            fn mask_re(self, keep: bool) -> Self {
                if keep {
                    self
                } else {
                    Complex::new(0.0, self.im)
                }
            }
            #[inline(always)]
            fn load<E: Dtype<Acc = $R>>(src: &[E]) -> Self {
                Complex::new(src[0].to_acc(), src[1].to_acc())
            }
            #[inline(always)]
            fn store<E: Dtype<Acc = $R>>(self, dst: &mut [E]) {
                dst[0] = E::from_acc(self.re);
                dst[1] = E::from_acc(self.im);
            }
            #[inline(always)]
            fn load_acc(src: &[$R]) -> Self {
                Complex::new(src[0], src[1])
            }
            #[inline(always)]
            fn store_acc(self, dst: &mut [$R]) {
                dst[0] = self.re;
                dst[1] = self.im;
            }
        }
    };
}

real_elem!(f32);
real_elem!(f64);
complex_elem!(f32);
complex_elem!(f64);
