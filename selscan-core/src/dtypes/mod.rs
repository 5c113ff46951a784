//! Module for data type related traits and structs. Contains things like [Dtype], [Accum],
//! [DType] and the [ScanElem] state-element abstraction.
//!
//! When the `f16` feature is enabled, this exports the [f16] and [bf16] types.
//!
//! # Storage vs accumulation
//!
//! Tensors are stored in a [Dtype]. Every [Dtype] names an accumulator ([Dtype::Acc]),
//! and the scan kernels load into the accumulator, do all arithmetic there, and only
//! round back to storage when writing results:
//!
//! | storage | accumulator |
//! | --- | --- |
//! | `bf16` | `f32` |
//! | `f16` | `f32` |
//! | `f32` | `f32` |
//! | `f64` | `f64` |

mod complex;
mod to_le_bytes;

pub use complex::{ScanElem, StateMode};
pub use to_le_bytes::{FromLeBytes, ToLeBytes};

pub use num_complex::Complex;

#[cfg(feature = "f16")]
pub use half::{bf16, f16};

/// Runtime tag for the element type of a host buffer.
///
/// Only the floating point tags map to a [Dtype]; the rest exist so a host can
/// describe what it handed over and get a precise error back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    BF16,
    F16,
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    Bool,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::I8 | Self::U8 | Self::Bool => 1,
            Self::BF16 | Self::F16 | Self::I16 | Self::U16 => 2,
            Self::F32 | Self::I32 | Self::U32 => 4,
            Self::F64 | Self::I64 | Self::U64 => 8,
        }
    }

    /// Whether a scan can run with this storage type in the current build.
    pub fn is_supported(&self) -> bool {
        match self {
            Self::F32 | Self::F64 => true,
            Self::BF16 | Self::F16 => cfg!(feature = "f16"),
            _ => false,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::BF16 => "bf16",
            Self::F16 => "f16",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// Floating point type every scan reduction is carried out in.
///
/// The supertraits are the capability set the generic kernels need: field
/// arithmetic and transcendental functions from [num_traits::Float], plus the
/// [ScanElem] operations so the accumulator itself is the real state element.
/// [Accum::Complex] is the matching complex state element.
pub trait Accum:
    num_traits::Float
    + num_traits::FromPrimitive
    + std::ops::AddAssign
    + std::ops::SubAssign
    + std::ops::MulAssign
    + Default
    + std::fmt::Debug
    + std::fmt::Display
    + Send
    + Sync
    + 'static
    + ScanElem<Self>
{
    type Complex: ScanElem<Self>;

    /// Lossy conversion of a literal.
    fn cast(x: f64) -> Self;
}

impl Accum for f32 {
    type Complex = Complex<f32>;
    #[inline(always)]
    fn cast(x: f64) -> Self {
        x as f32
    }
}

impl Accum for f64 {
    type Complex = Complex<f64>;
    #[inline(always)]
    fn cast(x: f64) -> Self {
        x
    }
}

/// Represents a storage data type that a scan can run in.
pub trait Dtype:
    'static
    + Copy
    + Clone
    + Default
    + std::fmt::Debug
    + PartialEq
    + PartialOrd
    + Send
    + Sync
    + std::marker::Unpin
    + ToLeBytes
    + FromLeBytes
{
    const ONE: Self;
    const DTYPE: DType;

    /// Accumulator used for every arithmetic operation on this dtype.
    type Acc: Accum;

    fn to_acc(self) -> Self::Acc;
    fn from_acc(acc: Self::Acc) -> Self;
    fn to_f64(self) -> f64;
    fn from_f64(x: f64) -> Self;
}

macro_rules! float_dtype {
    ($type:ty, $tag:expr, $acc:ty, $one:expr) => {
        impl Dtype for $type {
            const ONE: Self = $one;
            const DTYPE: DType = $tag;
            type Acc = $acc;
            #[inline(always)]
            fn to_acc(self) -> Self::Acc {
                self as $acc
            }
            #[inline(always)]
            fn from_acc(acc: Self::Acc) -> Self {
                acc as $type
            }
            #[inline(always)]
            fn to_f64(self) -> f64 {
                self as f64
            }
            #[inline(always)]
            fn from_f64(x: f64) -> Self {
                x as $type
            }
        }
    };
}

float_dtype!(f32, DType::F32, f32, 1.0);
float_dtype!(f64, DType::F64, f64, 1.0);

macro_rules! half_dtype {
    ($type:ty, $tag:expr) => {
        #[cfg(feature = "f16")]
        impl Dtype for $type {
            const ONE: Self = <$type>::ONE;
            const DTYPE: DType = $tag;
            type Acc = f32;
            #[inline(always)]
            fn to_acc(self) -> f32 {
                self.to_f32()
            }
            #[inline(always)]
            fn from_acc(acc: f32) -> Self {
                <$type>::from_f32(acc)
            }
            #[inline(always)]
            fn to_f64(self) -> f64 {
                <$type>::to_f64(self)
            }
            #[inline(always)]
            fn from_f64(x: f64) -> Self {
                <$type>::from_f64(x)
            }
        }
    };
}

half_dtype!(f16, DType::F16);
half_dtype!(bf16, DType::BF16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_tags() {
        assert_eq!(<f32 as Dtype>::DTYPE, DType::F32);
        assert_eq!(<f64 as Dtype>::DTYPE, DType::F64);
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert!(!DType::I32.is_supported());
        assert!(!DType::Bool.is_supported());
        assert!(DType::F64.is_supported());
        assert_eq!(DType::BF16.to_string(), "bf16");
    }

    #[cfg(feature = "f16")]
    #[test]
    fn test_half_accumulates_in_f32() {
        let x = f16::from_f32(1.5);
        let acc: f32 = x.to_acc();
        assert_eq!(acc, 1.5);
        assert_eq!(bf16::from_acc(0.25f32), bf16::from_f32(0.25));
        assert_eq!(<bf16 as Dtype>::DTYPE, DType::BF16);
        assert!(DType::F16.is_supported());
    }
}
