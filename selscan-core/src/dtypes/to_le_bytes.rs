/// Convert a type into a slice of little endian bytes.
pub trait ToLeBytes {
    type Array: IntoIterator<Item = u8>;
    fn to_le_bytes(self) -> Self::Array;
}

/// Read a type back from its little endian bytes.
pub trait FromLeBytes: Sized {
    const NUM_BYTES: usize;
    /// `bytes` must hold exactly [FromLeBytes::NUM_BYTES] bytes.
    fn from_le_slice(bytes: &[u8]) -> Self;
}

macro_rules! le_bytes {
    ($Ty:ty, $N:expr) => {
        impl ToLeBytes for $Ty {
            type Array = [u8; $N];
            fn to_le_bytes(self) -> Self::Array {
                self.to_le_bytes()
            }
        }

        impl FromLeBytes for $Ty {
            const NUM_BYTES: usize = $N;
            fn from_le_slice(bytes: &[u8]) -> Self {
                let mut arr = [0u8; $N];
                arr.copy_from_slice(bytes);
                <$Ty>::from_le_bytes(arr)
            }
        }
    };
}

le_bytes!(f32, 4);
le_bytes!(f64, 8);
#[cfg(feature = "f16")]
le_bytes!(super::f16, 2);
#[cfg(feature = "f16")]
le_bytes!(super::bf16, 2);
