//! The [`Scalar`] trait for provider-generic numeric code.
//!
//! User functions written as `fn f<T: Scalar>(…)` evaluate transparently with
//! plain `f64` (values, finite differences), [`Dual<f64>`](crate::dual::Dual)
//! (forward-mode AD), [`Reverse`](crate::reverse::Reverse) (reverse-mode AD)
//! and `Complex<f64>` (complex-step differentiation). A single generic primal
//! therefore serves every derivative provider.

use std::fmt::{Debug, Display};
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

use num_complex::Complex;
use num_traits::{Float as NumFloat, FloatConst, FromPrimitive};

use crate::dual::Dual;
use crate::reverse::Reverse;

/// Marker trait for base floating-point types (`f32`, `f64`).
///
/// Bundles the numeric and utility traits needed by the dual-number machinery.
/// Only primitive float types implement this; scalar wrapper types do not.
pub trait Float:
    NumFloat + FloatConst + FromPrimitive + Copy + Send + Sync + Default + Debug + Display + 'static
{
}

impl Float for f32 {}
impl Float for f64 {}

/// The element-type abstraction for user-provided primal routines.
///
/// Branching on a scalar (via [`Scalar::value`]) is allowed but freezes the
/// taken branch into the derivative, as with any operator-overloading AD.
pub trait Scalar:
    Copy
    + Clone
    + Debug
    + Display
    + Default
    + PartialEq
    + Send
    + Sync
    + 'static
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
    + DivAssign
{
    /// Lift a plain float to this scalar as a constant (zero derivative).
    fn from_f64(v: f64) -> Self;

    /// Extract the primal value.
    fn value(&self) -> f64;

    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    fn one() -> Self {
        Self::from_f64(1.0)
    }

    fn sin(self) -> Self;
    fn cos(self) -> Self;
    fn tan(self) -> Self;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn sqrt(self) -> Self;
    fn powi(self, n: i32) -> Self;
    fn powf(self, n: Self) -> Self;
    fn recip(self) -> Self;
    fn abs(self) -> Self;

    /// Select the larger operand by primal value.
    fn max(self, other: Self) -> Self {
        if self.value() >= other.value() {
            self
        } else {
            other
        }
    }

    /// Select the smaller operand by primal value.
    fn min(self, other: Self) -> Self {
        if self.value() <= other.value() {
            self
        } else {
            other
        }
    }
}

impl Scalar for f64 {
    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }

    #[inline]
    fn value(&self) -> f64 {
        *self
    }

    #[inline]
    fn sin(self) -> Self {
        f64::sin(self)
    }

    #[inline]
    fn cos(self) -> Self {
        f64::cos(self)
    }

    #[inline]
    fn tan(self) -> Self {
        f64::tan(self)
    }

    #[inline]
    fn exp(self) -> Self {
        f64::exp(self)
    }

    #[inline]
    fn ln(self) -> Self {
        f64::ln(self)
    }

    #[inline]
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }

    #[inline]
    fn powi(self, n: i32) -> Self {
        f64::powi(self, n)
    }

    #[inline]
    fn powf(self, n: Self) -> Self {
        f64::powf(self, n)
    }

    #[inline]
    fn recip(self) -> Self {
        f64::recip(self)
    }

    #[inline]
    fn abs(self) -> Self {
        f64::abs(self)
    }
}

impl Scalar for Dual<f64> {
    #[inline]
    fn from_f64(v: f64) -> Self {
        Dual::constant(v)
    }

    #[inline]
    fn value(&self) -> f64 {
        self.re
    }

    #[inline]
    fn sin(self) -> Self {
        Dual::sin(self)
    }

    #[inline]
    fn cos(self) -> Self {
        Dual::cos(self)
    }

    #[inline]
    fn tan(self) -> Self {
        Dual::tan(self)
    }

    #[inline]
    fn exp(self) -> Self {
        Dual::exp(self)
    }

    #[inline]
    fn ln(self) -> Self {
        Dual::ln(self)
    }

    #[inline]
    fn sqrt(self) -> Self {
        Dual::sqrt(self)
    }

    #[inline]
    fn powi(self, n: i32) -> Self {
        Dual::powi(self, n)
    }

    #[inline]
    fn powf(self, n: Self) -> Self {
        Dual::powf(self, n)
    }

    #[inline]
    fn recip(self) -> Self {
        Dual::recip(self)
    }

    #[inline]
    fn abs(self) -> Self {
        Dual::abs(self)
    }
}

impl Scalar for Reverse {
    #[inline]
    fn from_f64(v: f64) -> Self {
        Reverse::constant(v)
    }

    #[inline]
    fn value(&self) -> f64 {
        Reverse::value(self)
    }

    #[inline]
    fn sin(self) -> Self {
        Reverse::sin(self)
    }

    #[inline]
    fn cos(self) -> Self {
        Reverse::cos(self)
    }

    #[inline]
    fn tan(self) -> Self {
        Reverse::tan(self)
    }

    #[inline]
    fn exp(self) -> Self {
        Reverse::exp(self)
    }

    #[inline]
    fn ln(self) -> Self {
        Reverse::ln(self)
    }

    #[inline]
    fn sqrt(self) -> Self {
        Reverse::sqrt(self)
    }

    #[inline]
    fn powi(self, n: i32) -> Self {
        Reverse::powi(self, n)
    }

    #[inline]
    fn powf(self, n: Self) -> Self {
        Reverse::powf(self, n)
    }

    #[inline]
    fn recip(self) -> Self {
        Reverse::recip(self)
    }

    #[inline]
    fn abs(self) -> Self {
        Reverse::abs(self)
    }
}

// Complex-step support. The non-analytic pieces use the standard
// complex-step-safe definitions: `abs` flips the sign based on the real part
// instead of taking a modulus, and comparisons look only at real parts.
impl Scalar for Complex<f64> {
    #[inline]
    fn from_f64(v: f64) -> Self {
        Complex::new(v, 0.0)
    }

    #[inline]
    fn value(&self) -> f64 {
        self.re
    }

    #[inline]
    fn sin(self) -> Self {
        Complex::sin(self)
    }

    #[inline]
    fn cos(self) -> Self {
        Complex::cos(self)
    }

    #[inline]
    fn tan(self) -> Self {
        Complex::tan(self)
    }

    #[inline]
    fn exp(self) -> Self {
        Complex::exp(self)
    }

    #[inline]
    fn ln(self) -> Self {
        Complex::ln(self)
    }

    #[inline]
    fn sqrt(self) -> Self {
        Complex::sqrt(self)
    }

    #[inline]
    fn powi(self, n: i32) -> Self {
        Complex::powi(&self, n)
    }

    #[inline]
    fn powf(self, n: Self) -> Self {
        Complex::powc(self, n)
    }

    #[inline]
    fn recip(self) -> Self {
        Complex::inv(&self)
    }

    #[inline]
    fn abs(self) -> Self {
        if self.re >= 0.0 {
            self
        } else {
            -self
        }
    }
}
