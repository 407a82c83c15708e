//! Damped Newton iteration and the implicit→explicit converter.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::component::{check_flat_len, check_jacobian_shape, ExplicitEval, ImplicitEval};
use crate::errors::{CoupledError, CoupledResult};
use crate::utils::linear_algebra::{lu_back_solve, lu_factor, LuFactors};
use crate::variable::Variable;

/// Newton solver parameters.
///
/// Convergence is declared when `‖r‖∞ ≤ atol + rtol·‖y‖∞`. The update is
/// `y ← y − damping·(∂r/∂y)⁻¹ r`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NewtonOptions {
    pub atol: f64,
    pub rtol: f64,
    pub max_iter: usize,
    pub damping: f64,
}

impl Default for NewtonOptions {
    fn default() -> Self {
        NewtonOptions {
            atol: 1e-10,
            rtol: 1e-10,
            max_iter: 50,
            damping: 1.0,
        }
    }
}

/// Number of consecutive iterations without meaningful residual reduction
/// before the solve is declared stagnant.
const STAGNATION_LIMIT: usize = 3;

fn inf_norm(v: &[f64]) -> f64 {
    v.iter().fold(0.0_f64, |acc, &x| acc.max(x.abs()))
}

/// Solve `r(x, y) = 0` for `y` by damped Newton iteration from `y0`.
///
/// Returns the solution, the LU factorization of `∂r/∂y` at the solution
/// (ready for implicit-function-theorem sensitivities) and the iteration
/// count.
fn newton_solve(
    inner: &dyn ImplicitEval,
    x: &[f64],
    y0: &Array1<f64>,
    options: &NewtonOptions,
) -> CoupledResult<(Array1<f64>, LuFactors, usize)> {
    let ny = inner.ny();
    let mut y = y0.clone();
    let mut r = vec![0.0; ny];
    let mut drdy = Array2::zeros((ny, ny));

    inner.eval_residuals(x, y.as_slice().unwrap(), &mut r)?;
    let mut norm = inf_norm(&r);
    let mut best_norm = norm;
    let mut stalled = 0;

    for iteration in 0..=options.max_iter {
        if !norm.is_finite() {
            return Err(CoupledError::SolveDiverged {
                iterations: iteration,
                residual_norm: norm,
            });
        }
        debug!(
            solver = inner.name(),
            iteration,
            residual_norm = norm,
            "newton iteration"
        );
        if norm <= options.atol + options.rtol * inf_norm(y.as_slice().unwrap()) {
            inner.eval_output_jacobian(x, y.as_slice().unwrap(), &mut drdy)?;
            let factors =
                lu_factor(&drdy.view()).ok_or(CoupledError::SingularJacobian)?;
            return Ok((y, factors, iteration));
        }
        if iteration == options.max_iter {
            break;
        }

        inner.eval_output_jacobian(x, y.as_slice().unwrap(), &mut drdy)?;
        let factors = match lu_factor(&drdy.view()) {
            Some(f) => f,
            None => {
                return Err(CoupledError::SolveDiverged {
                    iterations: iteration,
                    residual_norm: norm,
                })
            }
        };
        let delta = lu_back_solve(&factors, &r);
        for i in 0..ny {
            y[i] -= options.damping * delta[i];
        }

        inner.eval_residuals(x, y.as_slice().unwrap(), &mut r)?;
        norm = inf_norm(&r);

        // Stagnation: the residual stopped decreasing.
        if norm > 0.9 * best_norm {
            stalled += 1;
            if stalled >= STAGNATION_LIMIT {
                return Err(CoupledError::SolveDiverged {
                    iterations: iteration + 1,
                    residual_norm: norm,
                });
            }
        } else {
            stalled = 0;
        }
        best_norm = best_norm.min(norm);
    }

    Err(CoupledError::SolveDiverged {
        iterations: options.max_iter,
        residual_norm: norm,
    })
}

/// Solve `−(∂r/∂y)⁻¹ · ∂r/∂x` column by column into `jac`.
fn ift_jacobian(
    factors: &LuFactors,
    drdx: &Array2<f64>,
    jac: &mut Array2<f64>,
) -> CoupledResult<()> {
    let (ny, nx) = drdx.dim();
    let mut rhs = vec![0.0; ny];
    for j in 0..nx {
        for i in 0..ny {
            rhs[i] = -drdx[[i, j]];
        }
        let col = lu_back_solve(factors, &rhs);
        for i in 0..ny {
            jac[[i, j]] = col[i];
        }
    }
    Ok(())
}

struct SolvedCache {
    x: Array1<f64>,
    y: Array1<f64>,
    jac: Array2<f64>,
    y_valid: bool,
    jac_valid: bool,
}

impl SolvedCache {
    fn sync_x(&mut self, x: &[f64]) -> bool {
        if self.x.as_slice().unwrap() == x {
            return false;
        }
        self.x.as_slice_mut().unwrap().copy_from_slice(x);
        self.y_valid = false;
        self.jac_valid = false;
        true
    }
}

/// The explicit view of a residual component or system: outputs are produced
/// by a Newton solve, the Jacobian by the implicit function theorem
/// `∂y/∂x = −(∂r/∂y)⁻¹ · ∂r/∂x`.
///
/// Satisfies [`ExplicitEval`], so a solved residual network drops into an
/// explicit system like any other component.
pub struct SolvedComponent {
    name: String,
    inner: Box<dyn ImplicitEval>,
    options: NewtonOptions,
    cache: SolvedCache,
    /// Factorization of `∂r/∂y` at the converged cached state; reused for
    /// the sensitivity solve instead of refactoring.
    factors: Option<LuFactors>,
}

impl SolvedComponent {
    pub fn new(inner: impl ImplicitEval + 'static, options: NewtonOptions) -> Self {
        Self::from_boxed(Box::new(inner), options)
    }

    pub fn from_boxed(inner: Box<dyn ImplicitEval>, options: NewtonOptions) -> Self {
        let (nx, ny) = (inner.nx(), inner.ny());
        SolvedComponent {
            name: format!("solved({})", inner.name()),
            cache: SolvedCache {
                x: crate::variable::combine(inner.in_vars()),
                y: inner.cached_state().clone(),
                jac: Array2::zeros((ny, nx)),
                y_valid: false,
                jac_valid: false,
            },
            inner,
            options,
            factors: None,
        }
    }

    pub fn options(&self) -> &NewtonOptions {
        &self.options
    }

    /// Solve at `x` (warm-started from the cached state) and store solution
    /// and factorization in the caches.
    fn solve_cached(&mut self, x: &[f64]) -> CoupledResult<()> {
        let (y, factors, iterations) =
            newton_solve(self.inner.as_ref(), x, self.inner.cached_state(), &self.options)?;
        debug!(solver = %self.name, iterations, "newton converged");
        self.inner.set_cached_state(y.as_slice().unwrap());
        self.cache.y.assign(&y);
        self.cache.y_valid = true;
        self.factors = Some(factors);
        Ok(())
    }
}

impl ExplicitEval for SolvedComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn in_vars(&self) -> &[Variable] {
        self.inner.in_vars()
    }

    fn out_vars(&self) -> &[Variable] {
        self.inner.out_vars()
    }

    fn eval_outputs(&self, x: &[f64], y: &mut [f64]) -> CoupledResult<()> {
        check_flat_len(self.nx(), x.len())?;
        check_flat_len(self.ny(), y.len())?;
        let (solution, _, _) =
            newton_solve(self.inner.as_ref(), x, self.inner.cached_state(), &self.options)?;
        y.copy_from_slice(solution.as_slice().unwrap());
        Ok(())
    }

    fn eval_jacobian(&self, x: &[f64], jac: &mut Array2<f64>) -> CoupledResult<()> {
        check_flat_len(self.nx(), x.len())?;
        check_jacobian_shape(jac, self.ny(), self.nx())?;
        let (solution, factors, _) =
            newton_solve(self.inner.as_ref(), x, self.inner.cached_state(), &self.options)?;
        let drdx = self
            .inner
            .input_jacobian(x, solution.as_slice().unwrap())?;
        ift_jacobian(&factors, &drdx, jac)
    }

    fn eval_outputs_and_jacobian(
        &self,
        x: &[f64],
        y: &mut [f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()> {
        check_flat_len(self.nx(), x.len())?;
        check_flat_len(self.ny(), y.len())?;
        check_jacobian_shape(jac, self.ny(), self.nx())?;
        let (solution, factors, _) =
            newton_solve(self.inner.as_ref(), x, self.inner.cached_state(), &self.options)?;
        let drdx = self
            .inner
            .input_jacobian(x, solution.as_slice().unwrap())?;
        ift_jacobian(&factors, &drdx, jac)?;
        y.copy_from_slice(solution.as_slice().unwrap());
        Ok(())
    }

    fn update_outputs(&mut self, x: &[f64]) -> CoupledResult<&Array1<f64>> {
        check_flat_len(self.nx(), x.len())?;
        let changed = self.cache.sync_x(x);
        if changed || !self.cache.y_valid {
            self.solve_cached(x)?;
        }
        Ok(&self.cache.y)
    }

    fn update_jacobian(&mut self, x: &[f64]) -> CoupledResult<&Array2<f64>> {
        check_flat_len(self.nx(), x.len())?;
        let changed = self.cache.sync_x(x);
        if changed || !self.cache.y_valid {
            self.solve_cached(x)?;
        }
        if !self.cache.jac_valid {
            let y = self.cache.y.clone();
            // Reuse the factorization from the converged solve when we still
            // have it; otherwise refactor ∂r/∂y at the cached solution.
            if self.factors.is_none() {
                let drdy = self.inner.update_output_jacobian(x, y.as_slice().unwrap())?;
                self.factors =
                    Some(lu_factor(&drdy.view()).ok_or(CoupledError::SingularJacobian)?);
            }
            let drdx = self
                .inner
                .update_input_jacobian(x, y.as_slice().unwrap())?
                .clone();
            let factors = self.factors.as_ref().unwrap();
            ift_jacobian(factors, &drdx, &mut self.cache.jac)?;
            self.cache.jac_valid = true;
        }
        Ok(&self.cache.jac)
    }

    fn update_outputs_and_jacobian(
        &mut self,
        x: &[f64],
    ) -> CoupledResult<(&Array1<f64>, &Array2<f64>)> {
        self.update_jacobian(x)?;
        Ok((&self.cache.y, &self.cache.jac))
    }

    fn last_outputs(&self) -> &Array1<f64> {
        &self.cache.y
    }

    fn last_jacobian(&self) -> &Array2<f64> {
        &self.cache.jac
    }

    fn invalidate(&mut self) {
        self.cache.y_valid = false;
        self.cache.jac_valid = false;
        self.factors = None;
    }

    fn invalidate_deep(&mut self) {
        self.invalidate();
        self.inner.invalidate_deep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::EvaluateResidual;
    use crate::derivatives::DerivKind;
    use crate::errors::CoupledResult;
    use crate::implicit::ImplicitComponent;
    use crate::scalar::Scalar;
    use crate::variable::declare;
    use approx::assert_relative_eq;
    use ndarray::{ArrayD, IxDyn};

    /// r = y² − x: y(x) = √x, dy/dx = 1/(2√x).
    struct SqrtResidual;
    impl EvaluateResidual for SqrtResidual {
        fn evaluate<T: Scalar>(
            &self,
            inputs: &[ndarray::ArrayViewD<'_, T>],
            states: &[ndarray::ArrayViewD<'_, T>],
        ) -> CoupledResult<Vec<ArrayD<T>>> {
            let x = inputs[0][[0]];
            let y = states[0][[0]];
            Ok(vec![ArrayD::from_elem(IxDyn(&[1]), y * y - x)])
        }
    }

    fn sqrt_solver() -> SolvedComponent {
        let implicit = ImplicitComponent::builder("sqrt")
            .with_residual_function(SqrtResidual)
            .with_inputs([declare("x", 1.0)])
            .with_outputs([declare("y", 1.0)])
            .with_xderiv(DerivKind::ForwardAd)
            .with_yderiv(DerivKind::ForwardAd)
            .build()
            .unwrap();
        SolvedComponent::new(implicit, NewtonOptions::default())
    }

    #[test]
    fn test_newton_finds_the_square_root() {
        let mut solver = sqrt_solver();
        let y = solver.update_outputs(&[9.0]).unwrap();
        assert_relative_eq!(y[0], 3.0, max_relative = 1e-10);
    }

    #[test]
    fn test_ift_jacobian_matches_analytic_derivative() {
        let mut solver = sqrt_solver();
        let jac = solver.update_jacobian(&[9.0]).unwrap();
        assert_relative_eq!(jac[[0, 0]], 1.0 / 6.0, max_relative = 1e-9);
    }

    #[test]
    fn test_implicit_function_theorem_identity() {
        // drdy · dydx + drdx ≈ 0 at the converged solution.
        let mut solver = sqrt_solver();
        let x = [4.0];
        solver.update_outputs(&x).unwrap();
        let y = solver.last_outputs().clone();
        let dydx = solver.update_jacobian(&x).unwrap().clone();

        let implicit = ImplicitComponent::builder("sqrt-check")
            .with_residual_function(SqrtResidual)
            .with_inputs([declare("x", 1.0)])
            .with_outputs([declare("y", 1.0)])
            .with_xderiv(DerivKind::ForwardAd)
            .with_yderiv(DerivKind::ForwardAd)
            .build()
            .unwrap();
        let drdx = implicit.input_jacobian(&x, y.as_slice().unwrap()).unwrap();
        let drdy = implicit.output_jacobian(&x, y.as_slice().unwrap()).unwrap();
        let identity = drdy.dot(&dydx) + &drdx;
        assert_relative_eq!(identity[[0, 0]], 0.0, epsilon = 1e-8);
    }

    #[test]
    fn test_warm_start_reuses_previous_solution() {
        let mut solver = sqrt_solver();
        solver.update_outputs(&[9.0]).unwrap();
        // A nearby input converges from the cached state in a couple of steps.
        let y = solver.update_outputs(&[9.1]).unwrap();
        assert_relative_eq!(y[0], 9.1_f64.sqrt(), max_relative = 1e-10);
    }

    #[test]
    fn test_divergence_is_reported() {
        // r = 1 + y² has no real root.
        struct NoRoot;
        impl EvaluateResidual for NoRoot {
            fn evaluate<T: Scalar>(
                &self,
                _inputs: &[ndarray::ArrayViewD<'_, T>],
                states: &[ndarray::ArrayViewD<'_, T>],
            ) -> CoupledResult<Vec<ArrayD<T>>> {
                let y = states[0][[0]];
                Ok(vec![ArrayD::from_elem(
                    IxDyn(&[1]),
                    T::one() + y * y,
                )])
            }
        }
        let implicit = ImplicitComponent::builder("no-root")
            .with_residual_function(NoRoot)
            .with_inputs([declare("x", 0.0)])
            .with_outputs([declare("y", 1.0)])
            .with_yderiv(DerivKind::ForwardAd)
            .build()
            .unwrap();
        let mut solver = SolvedComponent::new(implicit, NewtonOptions::default());
        assert!(matches!(
            solver.update_outputs(&[0.0]),
            Err(CoupledError::SolveDiverged { .. })
        ));
    }

    #[test]
    fn test_singular_jacobian_at_start_diverges() {
        // ∂r/∂y = 2y is singular at the initial state y = 0.
        let implicit = ImplicitComponent::builder("singular")
            .with_residual_function(SqrtResidual)
            .with_inputs([declare("x", 1.0)])
            .with_outputs([declare("y", 0.0)])
            .with_yderiv(DerivKind::ForwardAd)
            .build()
            .unwrap();
        let mut solver = SolvedComponent::new(implicit, NewtonOptions::default());
        assert!(matches!(
            solver.update_outputs(&[4.0]),
            Err(CoupledError::SolveDiverged { .. })
        ));
    }

    #[test]
    fn test_damping_still_converges() {
        let implicit = ImplicitComponent::builder("damped")
            .with_residual_function(SqrtResidual)
            .with_inputs([declare("x", 1.0)])
            .with_outputs([declare("y", 1.0)])
            .with_yderiv(DerivKind::ForwardAd)
            .with_xderiv(DerivKind::ForwardAd)
            .build()
            .unwrap();
        let options = NewtonOptions {
            damping: 0.8,
            max_iter: 200,
            ..NewtonOptions::default()
        };
        let mut solver = SolvedComponent::new(implicit, options);
        let y = solver.update_outputs(&[16.0]).unwrap();
        assert_relative_eq!(y[0], 4.0, max_relative = 1e-8);
    }
}
