//! Purpose: Typed element codecs between Rust values and stored column bytes.
//! Exports: `Element`, `ClusterSize`.
//! Role: Lets `Column<T>` serialize into pages and map page bytes back without copies.
//! Invariants: Stored representation is little-endian and exactly `COLUMN_TYPE.element_size()` bytes.
//! Invariants: Zero-copy views are only handed out when size and alignment both check out.
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::core::descriptor::ColumnType;

/// A fixed-size value that can live in a column.
pub trait Element: Clone + Default + std::fmt::Debug + Send + Sync + 'static {
    const COLUMN_TYPE: ColumnType;
    /// Stored bytes equal the in-memory representation.
    const MAPPABLE: bool;

    const SIZE: usize = Self::COLUMN_TYPE.element_size();

    /// Writes exactly `Self::SIZE` bytes into `dst`.
    fn serialize(&self, dst: &mut [u8]);

    fn deserialize(src: &[u8]) -> Self;

    /// Borrows one element in place; `None` when not mappable or misaligned.
    fn try_map(_src: &[u8]) -> Option<&Self> {
        None
    }

    fn try_map_slice(_src: &[u8]) -> Option<&[Self]> {
        None
    }
}

/// Cluster-local cumulative collection size stored in offset columns.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, FromBytes, IntoBytes,
    Immutable, KnownLayout,
)]
pub struct ClusterSize(pub u32);

impl From<u32> for ClusterSize {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<ClusterSize> for u64 {
    fn from(value: ClusterSize) -> Self {
        u64::from(value.0)
    }
}

macro_rules! le_element {
    ($ty:ty, $column_type:expr, |$v:ident| $to:expr, |$b:ident| $from:expr) => {
        impl Element for $ty {
            const COLUMN_TYPE: ColumnType = $column_type;
            const MAPPABLE: bool = cfg!(target_endian = "little");

            fn serialize(&self, dst: &mut [u8]) {
                let $v = *self;
                dst[..Self::SIZE].copy_from_slice(&$to);
            }

            fn deserialize(src: &[u8]) -> Self {
                let mut $b = [0u8; std::mem::size_of::<$ty>()];
                $b.copy_from_slice(&src[..Self::SIZE]);
                $from
            }

            fn try_map(src: &[u8]) -> Option<&Self> {
                if !Self::MAPPABLE {
                    return None;
                }
                <$ty>::ref_from_bytes(src).ok()
            }

            fn try_map_slice(src: &[u8]) -> Option<&[Self]> {
                if !Self::MAPPABLE {
                    return None;
                }
                <[$ty]>::ref_from_bytes(src).ok()
            }
        }
    };
}

le_element!(u8, ColumnType::Byte, |v| [v], |b| b[0]);
le_element!(f64, ColumnType::Real64, |v| v.to_le_bytes(), |b| f64::from_le_bytes(b));
le_element!(f32, ColumnType::Real32, |v| v.to_le_bytes(), |b| f32::from_le_bytes(b));
le_element!(i64, ColumnType::Int64, |v| v.to_le_bytes(), |b| i64::from_le_bytes(b));
le_element!(i32, ColumnType::Int32, |v| v.to_le_bytes(), |b| i32::from_le_bytes(b));
le_element!(i16, ColumnType::Int16, |v| v.to_le_bytes(), |b| i16::from_le_bytes(b));
le_element!(
    ClusterSize,
    ColumnType::Index,
    |v| v.0.to_le_bytes(),
    |b| ClusterSize(u32::from_le_bytes(b))
);

// Any stored byte other than 0 reads back as `true`, so bits are never mapped.
impl Element for bool {
    const COLUMN_TYPE: ColumnType = ColumnType::Bit;
    const MAPPABLE: bool = false;

    fn serialize(&self, dst: &mut [u8]) {
        dst[0] = u8::from(*self);
    }

    fn deserialize(src: &[u8]) -> Self {
        src[0] != 0
    }
}
