//! Fixed-point helpers.
//!
//! RED works on [`Scaled`] values with [`RED_SHIFT`] fractional bits. WF2Q+ virtual time is a
//! plain [`Key`] where one byte of service at weight 1 advances the clock by `2^WFQ_SHIFT`.
//! All arithmetic saturates instead of wrapping, except virtual time which is compared with
//! wrapping key comparisons.

use std::{
    fmt,
    ops::{Add, Sub},
};

use crate::heap::Key;

/// Fractional bits of a [`Scaled`] value.
pub const RED_SHIFT: u32 = 16;

/// Fractional bits of WF2Q+ virtual time.
pub const WFQ_SHIFT: u32 = 16;

/// A signed fixed-point number with [`RED_SHIFT`] fractional bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Scaled(i64);

impl Scaled {
    pub const ZERO: Self = Self(0);
    pub const ONE: Self = Self(1 << RED_SHIFT);

    #[inline]
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn from_int(value: i64) -> Self {
        Self(value.saturating_mul(1 << RED_SHIFT))
    }

    /// Converts from a float, saturating at the representable range.
    #[inline]
    pub fn from_f64(value: f64) -> Self {
        Self((value * Self::ONE.0 as f64) as i64)
    }

    /// Integer part, rounded towards negative infinity.
    #[inline]
    pub const fn to_int(self) -> i64 {
        self.0 >> RED_SHIFT
    }

    #[inline]
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / Self::ONE.0 as f64
    }

    /// Fixed-point multiplication, saturating.
    #[inline]
    pub const fn mul(self, rhs: Self) -> Self {
        Self(saturate((self.0 as i128 * rhs.0 as i128) >> RED_SHIFT))
    }

    /// Multiplies by `num / den` with a single rounding step. `den` must be non-zero.
    #[inline]
    pub const fn mul_ratio(self, num: i64, den: i64) -> Self {
        Self(saturate(self.0 as i128 * num as i128 / den as i128))
    }

    /// Clamps into `[0, 1]`.
    #[inline]
    pub fn clamp_unit(self) -> Self {
        self.clamp(Self::ZERO, Self::ONE)
    }
}

impl Add for Scaled {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Scaled {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for Scaled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.to_f64())
    }
}

#[inline]
const fn saturate(value: i128) -> i64 {
    if value > i64::MAX as i128 {
        i64::MAX
    } else if value < i64::MIN as i128 {
        i64::MIN
    } else {
        value as i64
    }
}

/// Virtual service time of `len` bytes shared by `weight`: `(len << WFQ_SHIFT) / weight`.
///
/// A zero weight is treated as 1.
#[inline]
pub const fn service(len: u64, weight: u64) -> Key {
    let weight = if weight == 0 { 1 } else { weight };
    (len << WFQ_SHIFT) / weight
}
