//! User-function traits and the evaluation interfaces shared by components
//! and systems.
//!
//! # User functions
//!
//! A primal routine is supplied in one of two forms:
//!
//! - implementing [`Evaluate`] (or [`EvaluateResidual`] for implicit
//!   components): a routine generic over the element type, usable by every
//!   derivative provider including forward/reverse AD and the complex step;
//! - a plain `f64` closure: usable by the finite-difference and analytic
//!   providers only. Requesting an AD or complex-step Jacobian of such a
//!   primal fails with [`CoupledError::ProviderUnavailable`].
//!
//! # The call-suffix ladder
//!
//! Every evaluation operation comes in the variants below, provided as
//! default methods on [`ExplicitEval`] / [`ImplicitEval`] so that components,
//! systems and solver wrappers share one contract:
//!
//! | variant | behavior |
//! |---|---|
//! | `op(&self, x)` | allocate a fresh result, never touch caches |
//! | `op_into(&mut self, buf, x)` | write the caller's buffer *and* the cache |
//! | `update_op(&mut self, x)` | recompute into the cache if stale, return a reference |
//! | `refresh_op(&mut self, x)` | force recomputation even if `x` matches the cache |
//! | `last_op(&self)` | return the cached result without recomputation |
//! | `refresh_op_deep(&mut self, x)` | systems: additionally invalidate every inner component |
//!
//! Staleness is decided by element-wise comparison of `x` (and `y` for
//! implicit components) against the cached copies.

use ndarray::{Array1, Array2, ArrayD, ArrayViewD, ArrayViewMutD};
use num_complex::Complex;

use crate::dual::Dual;
use crate::errors::{CoupledError, CoupledResult};
use crate::reverse::Reverse;
use crate::scalar::Scalar;
use crate::variable::{VarLayout, Variable};

// ---------------------------------------------------------------------------
// User-function traits
// ---------------------------------------------------------------------------

/// A provider-generic explicit primal `y = f(x)`.
///
/// `out_mut` holds the in-place output buffers (in `out_mut` declaration
/// order); `inputs` holds the input values (in `in_vars` declaration order).
/// The returned arrays are the non-mutating outputs, in `out_vars`
/// declaration order; their flattened lengths must match the declarations.
pub trait Evaluate: Send + Sync {
    fn evaluate<T: Scalar>(
        &self,
        out_mut: &mut [ArrayViewMutD<'_, T>],
        inputs: &[ArrayViewD<'_, T>],
    ) -> CoupledResult<Vec<ArrayD<T>>>;
}

/// A provider-generic residual primal `r = r(x, y)` with `nr == ny`.
///
/// `inputs` are the input values, `states` the output (state) values. The
/// returned arrays are the per-output-variable residual blocks, in `out_vars`
/// declaration order.
pub trait EvaluateResidual: Send + Sync {
    fn evaluate<T: Scalar>(
        &self,
        inputs: &[ArrayViewD<'_, T>],
        states: &[ArrayViewD<'_, T>],
    ) -> CoupledResult<Vec<ArrayD<T>>>;
}

/// Object-safe bridge over [`Evaluate`]: one concrete entry point per element
/// type, so components can hold the primal as a trait object while the AD
/// engines still reach the generic code.
pub(crate) trait GenericExplicitFn: Send + Sync {
    fn eval_f64(
        &self,
        out_mut: &mut [ArrayViewMutD<'_, f64>],
        inputs: &[ArrayViewD<'_, f64>],
    ) -> CoupledResult<Vec<ArrayD<f64>>>;
    fn eval_dual(
        &self,
        out_mut: &mut [ArrayViewMutD<'_, Dual<f64>>],
        inputs: &[ArrayViewD<'_, Dual<f64>>],
    ) -> CoupledResult<Vec<ArrayD<Dual<f64>>>>;
    fn eval_reverse(
        &self,
        out_mut: &mut [ArrayViewMutD<'_, Reverse>],
        inputs: &[ArrayViewD<'_, Reverse>],
    ) -> CoupledResult<Vec<ArrayD<Reverse>>>;
    fn eval_complex(
        &self,
        out_mut: &mut [ArrayViewMutD<'_, Complex<f64>>],
        inputs: &[ArrayViewD<'_, Complex<f64>>],
    ) -> CoupledResult<Vec<ArrayD<Complex<f64>>>>;
}

impl<E: Evaluate> GenericExplicitFn for E {
    fn eval_f64(
        &self,
        out_mut: &mut [ArrayViewMutD<'_, f64>],
        inputs: &[ArrayViewD<'_, f64>],
    ) -> CoupledResult<Vec<ArrayD<f64>>> {
        self.evaluate(out_mut, inputs)
    }

    fn eval_dual(
        &self,
        out_mut: &mut [ArrayViewMutD<'_, Dual<f64>>],
        inputs: &[ArrayViewD<'_, Dual<f64>>],
    ) -> CoupledResult<Vec<ArrayD<Dual<f64>>>> {
        self.evaluate(out_mut, inputs)
    }

    fn eval_reverse(
        &self,
        out_mut: &mut [ArrayViewMutD<'_, Reverse>],
        inputs: &[ArrayViewD<'_, Reverse>],
    ) -> CoupledResult<Vec<ArrayD<Reverse>>> {
        self.evaluate(out_mut, inputs)
    }

    fn eval_complex(
        &self,
        out_mut: &mut [ArrayViewMutD<'_, Complex<f64>>],
        inputs: &[ArrayViewD<'_, Complex<f64>>],
    ) -> CoupledResult<Vec<ArrayD<Complex<f64>>>> {
        self.evaluate(out_mut, inputs)
    }
}

/// Object-safe bridge over [`EvaluateResidual`].
pub(crate) trait GenericResidualFn: Send + Sync {
    fn eval_f64(
        &self,
        inputs: &[ArrayViewD<'_, f64>],
        states: &[ArrayViewD<'_, f64>],
    ) -> CoupledResult<Vec<ArrayD<f64>>>;
    fn eval_dual(
        &self,
        inputs: &[ArrayViewD<'_, Dual<f64>>],
        states: &[ArrayViewD<'_, Dual<f64>>],
    ) -> CoupledResult<Vec<ArrayD<Dual<f64>>>>;
    fn eval_reverse(
        &self,
        inputs: &[ArrayViewD<'_, Reverse>],
        states: &[ArrayViewD<'_, Reverse>],
    ) -> CoupledResult<Vec<ArrayD<Reverse>>>;
    fn eval_complex(
        &self,
        inputs: &[ArrayViewD<'_, Complex<f64>>],
        states: &[ArrayViewD<'_, Complex<f64>>],
    ) -> CoupledResult<Vec<ArrayD<Complex<f64>>>>;
}

impl<E: EvaluateResidual> GenericResidualFn for E {
    fn eval_f64(
        &self,
        inputs: &[ArrayViewD<'_, f64>],
        states: &[ArrayViewD<'_, f64>],
    ) -> CoupledResult<Vec<ArrayD<f64>>> {
        self.evaluate(inputs, states)
    }

    fn eval_dual(
        &self,
        inputs: &[ArrayViewD<'_, Dual<f64>>],
        states: &[ArrayViewD<'_, Dual<f64>>],
    ) -> CoupledResult<Vec<ArrayD<Dual<f64>>>> {
        self.evaluate(inputs, states)
    }

    fn eval_reverse(
        &self,
        inputs: &[ArrayViewD<'_, Reverse>],
        states: &[ArrayViewD<'_, Reverse>],
    ) -> CoupledResult<Vec<ArrayD<Reverse>>> {
        self.evaluate(inputs, states)
    }

    fn eval_complex(
        &self,
        inputs: &[ArrayViewD<'_, Complex<f64>>],
        states: &[ArrayViewD<'_, Complex<f64>>],
    ) -> CoupledResult<Vec<ArrayD<Complex<f64>>>> {
        self.evaluate(inputs, states)
    }
}

/// An `f64`-only explicit primal, as stored from a plain closure.
pub(crate) trait RealExplicitFn: Send + Sync {
    fn eval(
        &self,
        out_mut: &mut [ArrayViewMutD<'_, f64>],
        inputs: &[ArrayViewD<'_, f64>],
    ) -> CoupledResult<Vec<ArrayD<f64>>>;
}

impl<F> RealExplicitFn for F
where
    F: Fn(&mut [ArrayViewMutD<'_, f64>], &[ArrayViewD<'_, f64>]) -> CoupledResult<Vec<ArrayD<f64>>>
        + Send
        + Sync,
{
    fn eval(
        &self,
        out_mut: &mut [ArrayViewMutD<'_, f64>],
        inputs: &[ArrayViewD<'_, f64>],
    ) -> CoupledResult<Vec<ArrayD<f64>>> {
        self(out_mut, inputs)
    }
}

/// An `f64`-only residual primal.
pub(crate) trait RealResidualFn: Send + Sync {
    fn eval(
        &self,
        inputs: &[ArrayViewD<'_, f64>],
        states: &[ArrayViewD<'_, f64>],
    ) -> CoupledResult<Vec<ArrayD<f64>>>;
}

impl<F> RealResidualFn for F
where
    F: Fn(&[ArrayViewD<'_, f64>], &[ArrayViewD<'_, f64>]) -> CoupledResult<Vec<ArrayD<f64>>>
        + Send
        + Sync,
{
    fn eval(
        &self,
        inputs: &[ArrayViewD<'_, f64>],
        states: &[ArrayViewD<'_, f64>],
    ) -> CoupledResult<Vec<ArrayD<f64>>> {
        self(inputs, states)
    }
}

/// The stored explicit primal: either provider-generic or `f64`-only.
pub(crate) enum ExplicitCallable {
    Generic(Box<dyn GenericExplicitFn>),
    Real(Box<dyn RealExplicitFn>),
}

impl ExplicitCallable {
    pub(crate) fn eval_f64(
        &self,
        out_mut: &mut [ArrayViewMutD<'_, f64>],
        inputs: &[ArrayViewD<'_, f64>],
    ) -> CoupledResult<Vec<ArrayD<f64>>> {
        match self {
            ExplicitCallable::Generic(f) => f.eval_f64(out_mut, inputs),
            ExplicitCallable::Real(f) => f.eval(out_mut, inputs),
        }
    }

    pub(crate) fn generic(&self) -> Option<&dyn GenericExplicitFn> {
        match self {
            ExplicitCallable::Generic(f) => Some(f.as_ref()),
            ExplicitCallable::Real(_) => None,
        }
    }
}

/// The stored residual primal.
pub(crate) enum ResidualCallable {
    Generic(Box<dyn GenericResidualFn>),
    Real(Box<dyn RealResidualFn>),
}

impl ResidualCallable {
    pub(crate) fn eval_f64(
        &self,
        inputs: &[ArrayViewD<'_, f64>],
        states: &[ArrayViewD<'_, f64>],
    ) -> CoupledResult<Vec<ArrayD<f64>>> {
        match self {
            ResidualCallable::Generic(f) => f.eval_f64(inputs, states),
            ResidualCallable::Real(f) => f.eval(inputs, states),
        }
    }

    pub(crate) fn generic(&self) -> Option<&dyn GenericResidualFn> {
        match self {
            ResidualCallable::Generic(f) => Some(f.as_ref()),
            ResidualCallable::Real(_) => None,
        }
    }
}

// Analytic derivative callbacks are plain f64 closures over shaped input
// views, writing into a dense Jacobian view.
pub(crate) type JacobianFn = Box<
    dyn Fn(&mut ndarray::ArrayViewMut2<'_, f64>, &[ArrayViewD<'_, f64>]) -> CoupledResult<()>
        + Send
        + Sync,
>;
pub(crate) type OutputsAndJacobianFn = Box<
    dyn Fn(
            &mut [ArrayViewMutD<'_, f64>],
            &mut ndarray::ArrayViewMut2<'_, f64>,
            &[ArrayViewD<'_, f64>],
        ) -> CoupledResult<Vec<ArrayD<f64>>>
        + Send
        + Sync,
>;
pub(crate) type ResidualJacobianFn = Box<
    dyn Fn(
            &mut ndarray::ArrayViewMut2<'_, f64>,
            &[ArrayViewD<'_, f64>],
            &[ArrayViewD<'_, f64>],
        ) -> CoupledResult<()>
        + Send
        + Sync,
>;
pub(crate) type ResidualsAndJacobianFn = Box<
    dyn Fn(
            &mut ndarray::ArrayViewMut2<'_, f64>,
            &[ArrayViewD<'_, f64>],
            &[ArrayViewD<'_, f64>],
        ) -> CoupledResult<Vec<ArrayD<f64>>>
        + Send
        + Sync,
>;

// ---------------------------------------------------------------------------
// Packed execution helpers
// ---------------------------------------------------------------------------

/// Unpack `x`, invoke an explicit primal and pack its outputs into `y`.
///
/// `y` is laid out as all returned outputs first (per `ret_layout`), then all
/// in-place outputs (per `mut_layout`).
pub(crate) fn run_explicit_packed<T: Scalar>(
    in_layout: &VarLayout,
    ret_layout: &VarLayout,
    mut_layout: &VarLayout,
    eval: impl FnOnce(
        &mut [ArrayViewMutD<'_, T>],
        &[ArrayViewD<'_, T>],
    ) -> CoupledResult<Vec<ArrayD<T>>>,
    x: &[T],
    y: &mut [T],
) -> CoupledResult<()> {
    let ret_width = ret_layout.width();
    if y.len() < ret_width + mut_layout.width() {
        return Err(CoupledError::SizeMismatch {
            expected: ret_width + mut_layout.width(),
            actual: y.len(),
        });
    }
    let inputs = in_layout.separate(x)?;
    let (ret_slice, mut_slice) = y.split_at_mut(ret_width);
    let mut out_mut = mut_layout.separate_mut(mut_slice)?;
    let returned = eval(&mut out_mut, &inputs)?;

    if returned.len() != ret_layout.len() {
        return Err(CoupledError::SizeMismatch {
            expected: ret_layout.len(),
            actual: returned.len(),
        });
    }
    for (i, arr) in returned.iter().enumerate() {
        let span = ret_layout.span(i);
        if arr.len() != span.size {
            return Err(CoupledError::SizeMismatch {
                expected: span.size,
                actual: arr.len(),
            });
        }
        for (dst, src) in ret_slice[span.offset..span.end()].iter_mut().zip(arr.iter()) {
            *dst = *src;
        }
    }
    Ok(())
}

/// Unpack `x` and `y`, invoke a residual primal and pack the residual blocks
/// into `r` (laid out like the states).
pub(crate) fn run_residual_packed<T: Scalar>(
    in_layout: &VarLayout,
    state_layout: &VarLayout,
    eval: impl FnOnce(&[ArrayViewD<'_, T>], &[ArrayViewD<'_, T>]) -> CoupledResult<Vec<ArrayD<T>>>,
    x: &[T],
    y: &[T],
    r: &mut [T],
) -> CoupledResult<()> {
    if r.len() < state_layout.width() {
        return Err(CoupledError::SizeMismatch {
            expected: state_layout.width(),
            actual: r.len(),
        });
    }
    let inputs = in_layout.separate(x)?;
    let states = state_layout.separate(y)?;
    let returned = eval(&inputs, &states)?;

    if returned.len() != state_layout.len() {
        return Err(CoupledError::SizeMismatch {
            expected: state_layout.len(),
            actual: returned.len(),
        });
    }
    for (i, arr) in returned.iter().enumerate() {
        let span = state_layout.span(i);
        if arr.len() != span.size {
            return Err(CoupledError::SizeMismatch {
                expected: span.size,
                actual: arr.len(),
            });
        }
        for (dst, src) in r[span.offset..span.end()].iter_mut().zip(arr.iter()) {
            *dst = *src;
        }
    }
    Ok(())
}

pub(crate) fn check_flat_len(expected: usize, actual: usize) -> CoupledResult<()> {
    if expected != actual {
        return Err(CoupledError::SizeMismatch { expected, actual });
    }
    Ok(())
}

pub(crate) fn check_jacobian_shape(jac: &Array2<f64>, m: usize, n: usize) -> CoupledResult<()> {
    if jac.dim() != (m, n) {
        return Err(CoupledError::SizeMismatch {
            expected: m * n,
            actual: jac.len(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Evaluation interfaces
// ---------------------------------------------------------------------------

/// The explicit evaluation contract satisfied by
/// [`ExplicitComponent`](crate::explicit::ExplicitComponent),
/// [`ExplicitSystem`](crate::system::ExplicitSystem) and the Newton wrapper,
/// so systems nest arbitrarily.
pub trait ExplicitEval: Send {
    fn name(&self) -> &str;
    fn in_vars(&self) -> &[Variable];
    /// The full output tuple in flat order (returned outputs, then in-place).
    fn out_vars(&self) -> &[Variable];

    /// Flat input width.
    fn nx(&self) -> usize {
        self.in_vars().iter().map(Variable::size).sum()
    }

    /// Flat output width.
    fn ny(&self) -> usize {
        self.out_vars().iter().map(Variable::size).sum()
    }

    /// Evaluate outputs without touching any cache.
    fn eval_outputs(&self, x: &[f64], y: &mut [f64]) -> CoupledResult<()>;

    /// Evaluate the `(ny, nx)` Jacobian without touching any cache.
    fn eval_jacobian(&self, x: &[f64], jac: &mut Array2<f64>) -> CoupledResult<()>;

    /// Evaluate outputs and Jacobian together without touching any cache.
    fn eval_outputs_and_jacobian(
        &self,
        x: &[f64],
        y: &mut [f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()>;

    /// Recompute the cached outputs if `x` differs from the cached input or
    /// the cache is stale.
    fn update_outputs(&mut self, x: &[f64]) -> CoupledResult<&Array1<f64>>;

    /// Recompute the cached Jacobian if stale.
    fn update_jacobian(&mut self, x: &[f64]) -> CoupledResult<&Array2<f64>>;

    /// Recompute outputs and Jacobian together if stale.
    fn update_outputs_and_jacobian(
        &mut self,
        x: &[f64],
    ) -> CoupledResult<(&Array1<f64>, &Array2<f64>)>;

    /// The cached outputs (variable defaults before the first computation).
    fn last_outputs(&self) -> &Array1<f64>;

    /// The cached Jacobian (zeros before the first computation).
    fn last_jacobian(&self) -> &Array2<f64>;

    /// Mark this component's caches stale.
    fn invalidate(&mut self);

    /// Mark the caches of this component and every inner component stale.
    fn invalidate_deep(&mut self) {
        self.invalidate();
    }

    // -- allocation ladder ---------------------------------------------------

    /// Query variant: allocate a fresh output vector.
    fn outputs(&self, x: &[f64]) -> CoupledResult<Array1<f64>> {
        let mut y = Array1::zeros(self.ny());
        self.eval_outputs(x, y.as_slice_mut().unwrap())?;
        Ok(y)
    }

    /// Query variant: allocate a fresh Jacobian.
    fn jacobian(&self, x: &[f64]) -> CoupledResult<Array2<f64>> {
        let mut jac = Array2::zeros((self.ny(), self.nx()));
        self.eval_jacobian(x, &mut jac)?;
        Ok(jac)
    }

    /// Query variant: allocate fresh outputs and Jacobian.
    fn outputs_and_jacobian(&self, x: &[f64]) -> CoupledResult<(Array1<f64>, Array2<f64>)> {
        let mut y = Array1::zeros(self.ny());
        let mut jac = Array2::zeros((self.ny(), self.nx()));
        self.eval_outputs_and_jacobian(x, y.as_slice_mut().unwrap(), &mut jac)?;
        Ok((y, jac))
    }

    /// Buffered variant: update the cache, then copy it into `y`.
    fn outputs_into(&mut self, y: &mut [f64], x: &[f64]) -> CoupledResult<()> {
        if y.len() < self.ny() {
            return Err(CoupledError::SizeMismatch {
                expected: self.ny(),
                actual: y.len(),
            });
        }
        let cache = self.update_outputs(x)?;
        y[..cache.len()].copy_from_slice(cache.as_slice().unwrap());
        Ok(())
    }

    /// Buffered variant: update the cache, then copy it into `jac`.
    fn jacobian_into(&mut self, jac: &mut Array2<f64>, x: &[f64]) -> CoupledResult<()> {
        check_jacobian_shape(jac, self.ny(), self.nx())?;
        let cache = self.update_jacobian(x)?;
        jac.assign(cache);
        Ok(())
    }

    /// Buffered variant for the combined call.
    fn outputs_and_jacobian_into(
        &mut self,
        y: &mut [f64],
        jac: &mut Array2<f64>,
        x: &[f64],
    ) -> CoupledResult<()> {
        if y.len() < self.ny() {
            return Err(CoupledError::SizeMismatch {
                expected: self.ny(),
                actual: y.len(),
            });
        }
        check_jacobian_shape(jac, self.ny(), self.nx())?;
        let (yc, jc) = self.update_outputs_and_jacobian(x)?;
        y[..yc.len()].copy_from_slice(yc.as_slice().unwrap());
        jac.assign(jc);
        Ok(())
    }

    /// Forcing variant: recompute the outputs even if `x` matches the cache.
    fn refresh_outputs(&mut self, x: &[f64]) -> CoupledResult<&Array1<f64>> {
        self.invalidate();
        self.update_outputs(x)
    }

    /// Forcing variant: recompute the Jacobian even if `x` matches the cache.
    fn refresh_jacobian(&mut self, x: &[f64]) -> CoupledResult<&Array2<f64>> {
        self.invalidate();
        self.update_jacobian(x)
    }

    /// Forcing variant for the combined call.
    fn refresh_outputs_and_jacobian(
        &mut self,
        x: &[f64],
    ) -> CoupledResult<(&Array1<f64>, &Array2<f64>)> {
        self.invalidate();
        self.update_outputs_and_jacobian(x)
    }

    /// Deep-forcing variant: invalidate all inner components, then recompute.
    fn refresh_outputs_deep(&mut self, x: &[f64]) -> CoupledResult<&Array1<f64>> {
        self.invalidate_deep();
        self.update_outputs(x)
    }

    /// Deep-forcing variant for the Jacobian.
    fn refresh_jacobian_deep(&mut self, x: &[f64]) -> CoupledResult<&Array2<f64>> {
        self.invalidate_deep();
        self.update_jacobian(x)
    }
}

/// The implicit evaluation contract: a residual relation `r(x, y) = 0` with
/// `nr == ny`, satisfied by implicit components, implicit systems and lifted
/// explicit components.
pub trait ImplicitEval: Send {
    fn name(&self) -> &str;
    fn in_vars(&self) -> &[Variable];
    /// The output (state) tuple; the residual is laid out identically.
    fn out_vars(&self) -> &[Variable];

    fn nx(&self) -> usize {
        self.in_vars().iter().map(Variable::size).sum()
    }

    /// Flat output width; equals the residual width.
    fn ny(&self) -> usize {
        self.out_vars().iter().map(Variable::size).sum()
    }

    fn eval_residuals(&self, x: &[f64], y: &[f64], r: &mut [f64]) -> CoupledResult<()>;

    /// `∂r/∂x`, shape `(ny, nx)`.
    fn eval_input_jacobian(&self, x: &[f64], y: &[f64], jac: &mut Array2<f64>)
        -> CoupledResult<()>;

    /// `∂r/∂y`, shape `(ny, ny)`.
    fn eval_output_jacobian(
        &self,
        x: &[f64],
        y: &[f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()>;

    fn eval_residuals_and_input_jacobian(
        &self,
        x: &[f64],
        y: &[f64],
        r: &mut [f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()> {
        self.eval_residuals(x, y, r)?;
        self.eval_input_jacobian(x, y, jac)
    }

    fn eval_residuals_and_output_jacobian(
        &self,
        x: &[f64],
        y: &[f64],
        r: &mut [f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()> {
        self.eval_residuals(x, y, r)?;
        self.eval_output_jacobian(x, y, jac)
    }

    fn eval_residuals_and_jacobians(
        &self,
        x: &[f64],
        y: &[f64],
        r: &mut [f64],
        drdx: &mut Array2<f64>,
        drdy: &mut Array2<f64>,
    ) -> CoupledResult<()> {
        self.eval_residuals(x, y, r)?;
        self.eval_input_jacobian(x, y, drdx)?;
        self.eval_output_jacobian(x, y, drdy)
    }

    fn update_residuals(&mut self, x: &[f64], y: &[f64]) -> CoupledResult<&Array1<f64>>;
    fn update_input_jacobian(&mut self, x: &[f64], y: &[f64]) -> CoupledResult<&Array2<f64>>;
    fn update_output_jacobian(&mut self, x: &[f64], y: &[f64]) -> CoupledResult<&Array2<f64>>;

    fn update_residuals_and_input_jacobian(
        &mut self,
        x: &[f64],
        y: &[f64],
    ) -> CoupledResult<(&Array1<f64>, &Array2<f64>)> {
        self.update_residuals(x, y)?;
        self.update_input_jacobian(x, y)?;
        Ok((self.last_residuals(), self.last_input_jacobian()))
    }

    fn update_residuals_and_output_jacobian(
        &mut self,
        x: &[f64],
        y: &[f64],
    ) -> CoupledResult<(&Array1<f64>, &Array2<f64>)> {
        self.update_residuals(x, y)?;
        self.update_output_jacobian(x, y)?;
        Ok((self.last_residuals(), self.last_output_jacobian()))
    }

    fn update_residuals_and_jacobians(
        &mut self,
        x: &[f64],
        y: &[f64],
    ) -> CoupledResult<(&Array1<f64>, &Array2<f64>, &Array2<f64>)> {
        self.update_residuals(x, y)?;
        self.update_input_jacobian(x, y)?;
        self.update_output_jacobian(x, y)?;
        Ok((
            self.last_residuals(),
            self.last_input_jacobian(),
            self.last_output_jacobian(),
        ))
    }

    fn last_residuals(&self) -> &Array1<f64>;
    fn last_input_jacobian(&self) -> &Array2<f64>;
    fn last_output_jacobian(&self) -> &Array2<f64>;

    /// The cached state `y*` (variable defaults before the first solve).
    fn cached_state(&self) -> &Array1<f64>;

    /// Overwrite the cached state, e.g. with a converged Newton solution.
    fn set_cached_state(&mut self, y: &[f64]);

    fn invalidate(&mut self);

    fn invalidate_deep(&mut self) {
        self.invalidate();
    }

    // -- allocation ladder ---------------------------------------------------

    fn residuals(&self, x: &[f64], y: &[f64]) -> CoupledResult<Array1<f64>> {
        let mut r = Array1::zeros(self.ny());
        self.eval_residuals(x, y, r.as_slice_mut().unwrap())?;
        Ok(r)
    }

    fn input_jacobian(&self, x: &[f64], y: &[f64]) -> CoupledResult<Array2<f64>> {
        let mut jac = Array2::zeros((self.ny(), self.nx()));
        self.eval_input_jacobian(x, y, &mut jac)?;
        Ok(jac)
    }

    fn output_jacobian(&self, x: &[f64], y: &[f64]) -> CoupledResult<Array2<f64>> {
        let mut jac = Array2::zeros((self.ny(), self.ny()));
        self.eval_output_jacobian(x, y, &mut jac)?;
        Ok(jac)
    }

    fn residuals_and_jacobians(
        &self,
        x: &[f64],
        y: &[f64],
    ) -> CoupledResult<(Array1<f64>, Array2<f64>, Array2<f64>)> {
        let mut r = Array1::zeros(self.ny());
        let mut drdx = Array2::zeros((self.ny(), self.nx()));
        let mut drdy = Array2::zeros((self.ny(), self.ny()));
        self.eval_residuals_and_jacobians(x, y, r.as_slice_mut().unwrap(), &mut drdx, &mut drdy)?;
        Ok((r, drdx, drdy))
    }

    fn residuals_into(&mut self, r: &mut [f64], x: &[f64], y: &[f64]) -> CoupledResult<()> {
        if r.len() < self.ny() {
            return Err(CoupledError::SizeMismatch {
                expected: self.ny(),
                actual: r.len(),
            });
        }
        let cache = self.update_residuals(x, y)?;
        r[..cache.len()].copy_from_slice(cache.as_slice().unwrap());
        Ok(())
    }

    fn input_jacobian_into(
        &mut self,
        jac: &mut Array2<f64>,
        x: &[f64],
        y: &[f64],
    ) -> CoupledResult<()> {
        check_jacobian_shape(jac, self.ny(), self.nx())?;
        let cache = self.update_input_jacobian(x, y)?;
        jac.assign(cache);
        Ok(())
    }

    fn output_jacobian_into(
        &mut self,
        jac: &mut Array2<f64>,
        x: &[f64],
        y: &[f64],
    ) -> CoupledResult<()> {
        check_jacobian_shape(jac, self.ny(), self.ny())?;
        let cache = self.update_output_jacobian(x, y)?;
        jac.assign(cache);
        Ok(())
    }

    fn refresh_residuals(&mut self, x: &[f64], y: &[f64]) -> CoupledResult<&Array1<f64>> {
        self.invalidate();
        self.update_residuals(x, y)
    }

    fn refresh_residuals_and_jacobians(
        &mut self,
        x: &[f64],
        y: &[f64],
    ) -> CoupledResult<(&Array1<f64>, &Array2<f64>, &Array2<f64>)> {
        self.invalidate();
        self.update_residuals_and_jacobians(x, y)
    }

    fn refresh_residuals_deep(&mut self, x: &[f64], y: &[f64]) -> CoupledResult<&Array1<f64>> {
        self.invalidate_deep();
        self.update_residuals(x, y)
    }
}
