//! Derivative provider kinds and the numeric Jacobian engines.
//!
//! Each engine computes a dense Jacobian for a flat primal supplied as a
//! closure `(x, out) -> CoupledResult<()>` over the appropriate element type.
//! The component wrappers own packing and unpacking; the engines only sweep.

use ndarray::Array2;
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::dual::Dual;
use crate::errors::{CoupledError, CoupledResult};
use crate::reverse::Reverse;
use crate::tape::{Tape, TapeGuard, CONSTANT};

/// The derivative provider variants.
///
/// `Analytic` uses the user-supplied Jacobian callbacks and fails with
/// [`CoupledError::ProviderUnavailable`] when none are configured. The AD and
/// complex-step variants require a generic primal; the finite-difference
/// variants work with any primal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DerivKind {
    Analytic,
    ForwardAd,
    ReverseAd,
    ForwardFd,
    CentralFd,
    ComplexStep,
}

impl Default for DerivKind {
    fn default() -> Self {
        DerivKind::ForwardFd
    }
}

/// Default step size for a provider kind.
///
/// Forward differences use `√ε`, central differences `ε^(1/3)`; the
/// complex step is immune to subtractive cancellation and uses `1e-20`.
/// The AD and analytic variants take no step.
pub fn default_step(kind: DerivKind) -> f64 {
    match kind {
        DerivKind::ForwardFd => f64::EPSILON.sqrt(),
        DerivKind::CentralFd => f64::EPSILON.cbrt(),
        DerivKind::ComplexStep => 1e-20,
        DerivKind::Analytic | DerivKind::ForwardAd | DerivKind::ReverseAd => 0.0,
    }
}

fn check_jac_shape(jac: &Array2<f64>, m: usize, n: usize) -> CoupledResult<()> {
    if jac.dim() != (m, n) {
        return Err(CoupledError::SizeMismatch {
            expected: m * n,
            actual: jac.len(),
        });
    }
    Ok(())
}

/// One-sided forward differences: `J[:, j] = (f(x + h eⱼ) − f(x)) / h`.
///
/// `y0` must hold `f(x)`; the caller has usually just computed it anyway.
pub(crate) fn forward_fd_jacobian(
    mut eval: impl FnMut(&[f64], &mut [f64]) -> CoupledResult<()>,
    x: &[f64],
    y0: &[f64],
    h: f64,
    jac: &mut Array2<f64>,
) -> CoupledResult<()> {
    let (n, m) = (x.len(), y0.len());
    check_jac_shape(jac, m, n)?;
    let mut xp = x.to_vec();
    let mut yp = vec![0.0; m];
    for j in 0..n {
        let orig = xp[j];
        xp[j] = orig + h;
        eval(&xp, &mut yp)?;
        xp[j] = orig;
        for i in 0..m {
            jac[[i, j]] = (yp[i] - y0[i]) / h;
        }
    }
    Ok(())
}

/// Central differences: `J[:, j] = (f(x + h eⱼ) − f(x − h eⱼ)) / 2h`.
pub(crate) fn central_fd_jacobian(
    mut eval: impl FnMut(&[f64], &mut [f64]) -> CoupledResult<()>,
    x: &[f64],
    m: usize,
    h: f64,
    jac: &mut Array2<f64>,
) -> CoupledResult<()> {
    let n = x.len();
    check_jac_shape(jac, m, n)?;
    let mut xp = x.to_vec();
    let mut y_plus = vec![0.0; m];
    let mut y_minus = vec![0.0; m];
    for j in 0..n {
        let orig = xp[j];
        xp[j] = orig + h;
        eval(&xp, &mut y_plus)?;
        xp[j] = orig - h;
        eval(&xp, &mut y_minus)?;
        xp[j] = orig;
        for i in 0..m {
            jac[[i, j]] = (y_plus[i] - y_minus[i]) / (2.0 * h);
        }
    }
    Ok(())
}

/// Complex step: `J[:, j] = Im f(x + i·h eⱼ) / h`.
///
/// The primal values fall out of the real parts of the first sweep, so `y`
/// can be captured at no extra cost.
pub(crate) fn complex_step_jacobian(
    mut eval: impl FnMut(&[Complex<f64>], &mut [Complex<f64>]) -> CoupledResult<()>,
    x: &[f64],
    m: usize,
    h: f64,
    mut y: Option<&mut [f64]>,
    jac: &mut Array2<f64>,
) -> CoupledResult<()> {
    let n = x.len();
    check_jac_shape(jac, m, n)?;
    let mut xp: Vec<Complex<f64>> = x.iter().map(|&v| Complex::new(v, 0.0)).collect();
    let mut yp = vec![Complex::new(0.0, 0.0); m];
    for j in 0..n {
        xp[j].im = h;
        eval(&xp, &mut yp)?;
        xp[j].im = 0.0;
        for i in 0..m {
            jac[[i, j]] = yp[i].im / h;
        }
        if j == 0 {
            if let Some(y) = y.as_deref_mut() {
                for i in 0..m {
                    y[i] = yp[i].re;
                }
            }
        }
    }
    if n == 0 {
        if let Some(y) = y {
            eval(&xp, &mut yp)?;
            for i in 0..m {
                y[i] = yp[i].re;
            }
        }
    }
    Ok(())
}

/// Forward-mode AD: one dual sweep per input column.
pub(crate) fn forward_ad_jacobian(
    mut eval: impl FnMut(&[Dual<f64>], &mut [Dual<f64>]) -> CoupledResult<()>,
    x: &[f64],
    m: usize,
    mut y: Option<&mut [f64]>,
    jac: &mut Array2<f64>,
) -> CoupledResult<()> {
    let n = x.len();
    check_jac_shape(jac, m, n)?;
    let mut xd: Vec<Dual<f64>> = x.iter().map(|&v| Dual::constant(v)).collect();
    let mut yd = vec![Dual::constant(0.0); m];
    for j in 0..n {
        xd[j].eps = 1.0;
        eval(&xd, &mut yd)?;
        xd[j].eps = 0.0;
        for i in 0..m {
            jac[[i, j]] = yd[i].eps;
        }
        if j == 0 {
            if let Some(y) = y.as_deref_mut() {
                for i in 0..m {
                    y[i] = yd[i].re;
                }
            }
        }
    }
    if n == 0 {
        if let Some(y) = y {
            eval(&xd, &mut yd)?;
            for i in 0..m {
                y[i] = yd[i].re;
            }
        }
    }
    Ok(())
}

/// Reverse-mode AD: record once, then one seeded sweep per output row.
pub(crate) fn reverse_ad_jacobian(
    eval: impl FnOnce(&[Reverse], &mut [Reverse]) -> CoupledResult<()>,
    x: &[f64],
    m: usize,
    y: Option<&mut [f64]>,
    jac: &mut Array2<f64>,
) -> CoupledResult<()> {
    let n = x.len();
    check_jac_shape(jac, m, n)?;
    let mut tape = Tape::with_capacity(n.max(m) * 8);
    let xr: Vec<Reverse> = x
        .iter()
        .map(|&v| {
            let idx = tape.new_variable();
            Reverse::from_tape(v, idx)
        })
        .collect();
    let mut yr = vec![Reverse::constant(0.0); m];
    {
        let _guard = TapeGuard::new(&mut tape);
        eval(&xr, &mut yr)?;
    }
    if let Some(y) = y {
        for i in 0..m {
            y[i] = yr[i].value();
        }
    }
    for i in 0..m {
        if yr[i].index() == CONSTANT {
            // Output did not depend on any input.
            for j in 0..n {
                jac[[i, j]] = 0.0;
            }
            continue;
        }
        let adjoints = tape.sweep(yr[i].index());
        for j in 0..n {
            jac[[i, j]] = adjoints[j];
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::scalar::Scalar;

    /// f(x0, x1) = (x0² · x1, sin(x0) + x1)
    fn primal<T: Scalar>(x: &[T], out: &mut [T]) -> CoupledResult<()> {
        out[0] = x[0] * x[0] * x[1];
        out[1] = x[0].sin() + x[1];
        Ok(())
    }

    fn expected(x: &[f64]) -> Array2<f64> {
        ndarray::array![[2.0 * x[0] * x[1], x[0] * x[0]], [x[0].cos(), 1.0]]
    }

    const X: [f64; 2] = [1.2, -0.7];

    #[test]
    fn test_forward_fd_matches_analytic() {
        let mut y0 = vec![0.0; 2];
        primal(&X, &mut y0).unwrap();
        let mut jac = Array2::zeros((2, 2));
        forward_fd_jacobian(primal::<f64>, &X, &y0, default_step(DerivKind::ForwardFd), &mut jac)
            .unwrap();
        assert_relative_eq!(jac, expected(&X), max_relative = 1e-6);
    }

    #[test]
    fn test_central_fd_matches_analytic() {
        let mut jac = Array2::zeros((2, 2));
        central_fd_jacobian(primal::<f64>, &X, 2, default_step(DerivKind::CentralFd), &mut jac)
            .unwrap();
        assert_relative_eq!(jac, expected(&X), max_relative = 1e-8);
    }

    #[test]
    fn test_complex_step_is_exact_to_roundoff() {
        let mut jac = Array2::zeros((2, 2));
        let mut y = vec![0.0; 2];
        complex_step_jacobian(
            primal::<Complex<f64>>,
            &X,
            2,
            default_step(DerivKind::ComplexStep),
            Some(&mut y),
            &mut jac,
        )
        .unwrap();
        assert_relative_eq!(jac, expected(&X), max_relative = 1e-14);
        assert_relative_eq!(y[0], X[0] * X[0] * X[1], max_relative = 1e-14);
    }

    #[test]
    fn test_forward_ad_is_exact() {
        let mut jac = Array2::zeros((2, 2));
        let mut y = vec![0.0; 2];
        forward_ad_jacobian(primal::<Dual<f64>>, &X, 2, Some(&mut y), &mut jac).unwrap();
        assert_relative_eq!(jac, expected(&X), max_relative = 1e-14);
        assert_relative_eq!(y[1], X[0].sin() + X[1], max_relative = 1e-14);
    }

    #[test]
    fn test_reverse_ad_is_exact() {
        let mut jac = Array2::zeros((2, 2));
        let mut y = vec![0.0; 2];
        reverse_ad_jacobian(primal::<Reverse>, &X, 2, Some(&mut y), &mut jac).unwrap();
        assert_relative_eq!(jac, expected(&X), max_relative = 1e-14);
    }

    #[test]
    fn test_reverse_ad_constant_output_row_is_zero() {
        fn f(x: &[Reverse], out: &mut [Reverse]) -> CoupledResult<()> {
            out[0] = Reverse::constant(4.0);
            out[1] = x[0] + x[1];
            Ok(())
        }
        let mut jac = Array2::zeros((2, 2));
        reverse_ad_jacobian(f, &X, 2, None, &mut jac).unwrap();
        assert_eq!(jac.row(0).to_vec(), vec![0.0, 0.0]);
        assert_eq!(jac.row(1).to_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_default_steps() {
        assert_relative_eq!(default_step(DerivKind::ForwardFd), (f64::EPSILON).sqrt());
        assert_relative_eq!(default_step(DerivKind::CentralFd), (f64::EPSILON).cbrt());
        assert_eq!(default_step(DerivKind::ComplexStep), 1e-20);
    }
}
