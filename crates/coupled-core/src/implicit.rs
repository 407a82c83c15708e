//! Implicit components: a residual relation `r(x, y) = 0` with `nr == ny`,
//! plus the lift of an explicit component into residual form.

use ndarray::{Array1, Array2};

use crate::component::{
    check_flat_len, check_jacobian_shape, run_residual_packed, EvaluateResidual, ExplicitEval,
    GenericResidualFn, ImplicitEval, ResidualCallable, ResidualJacobianFn, ResidualsAndJacobianFn,
};
use crate::derivatives::{
    central_fd_jacobian, complex_step_jacobian, default_step, forward_ad_jacobian,
    forward_fd_jacobian, reverse_ad_jacobian, DerivKind,
};
use crate::dual::Dual;
use crate::errors::{CoupledError, CoupledResult};
use crate::reverse::Reverse;
use crate::variable::{check_unique, combine, VarLayout, Variable};

use num_complex::Complex;

/// Which argument block a residual Jacobian differentiates against.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Wrt {
    Input,
    Output,
}

pub(crate) struct ImplicitDesc {
    name: String,
    in_vars: Vec<Variable>,
    out_vars: Vec<Variable>,
    in_layout: VarLayout,
    out_layout: VarLayout,
    func: Option<ResidualCallable>,
    dfdx: Option<ResidualJacobianFn>,
    dfdy: Option<ResidualJacobianFn>,
    /// Combined residuals + `∂r/∂x`.
    rdx: Option<ResidualsAndJacobianFn>,
    /// Combined residuals + `∂r/∂y`.
    rdy: Option<ResidualsAndJacobianFn>,
    xderiv: DerivKind,
    yderiv: DerivKind,
    xstep: f64,
    ystep: f64,
}

impl ImplicitDesc {
    fn nx(&self) -> usize {
        self.in_layout.width()
    }

    fn ny(&self) -> usize {
        self.out_layout.width()
    }

    fn provider_unavailable(&self, operation: &str, reason: &str) -> CoupledError {
        CoupledError::ProviderUnavailable {
            operation: format!("{} of component '{}'", operation, self.name),
            reason: reason.to_string(),
        }
    }

    fn residuals_impl(&self, x: &[f64], y: &[f64], r: &mut [f64]) -> CoupledResult<()> {
        if let Some(func) = &self.func {
            return run_residual_packed(
                &self.in_layout,
                &self.out_layout,
                |inputs, states| func.eval_f64(inputs, states),
                x,
                y,
                r,
            );
        }
        // Fall back on a combined routine, discarding its Jacobian half.
        if let Some(combined) = self.rdx.as_ref().or(self.rdy.as_ref()) {
            let cols = if self.rdx.is_some() { self.nx() } else { self.ny() };
            let mut scratch = Array2::zeros((self.ny(), cols));
            return self.combined_impl(combined, x, y, r, &mut scratch);
        }
        Err(self.provider_unavailable(
            "residuals",
            "no residual or combined routine configured",
        ))
    }

    /// Run a combined residuals-and-Jacobian routine.
    fn combined_impl(
        &self,
        combined: &ResidualsAndJacobianFn,
        x: &[f64],
        y: &[f64],
        r: &mut [f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()> {
        run_residual_packed(
            &self.in_layout,
            &self.out_layout,
            |inputs, states| combined(&mut jac.view_mut(), inputs, states),
            x,
            y,
            r,
        )
    }

    fn analytic_impl(
        &self,
        df: &ResidualJacobianFn,
        x: &[f64],
        y: &[f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()> {
        let inputs = self.in_layout.separate(x)?;
        let states = self.out_layout.separate(y)?;
        df(&mut jac.view_mut(), &inputs, &states)
    }

    fn generic_func(&self, what: &str) -> CoupledResult<&dyn GenericResidualFn> {
        self.func
            .as_ref()
            .and_then(ResidualCallable::generic)
            .ok_or_else(|| {
                self.provider_unavailable(
                    "jacobian",
                    &format!("{what} requires a residual with a generic element type"),
                )
            })
    }

    /// Numeric Jacobian with respect to one argument block; the other block is
    /// held constant. Optionally captures the residual values.
    fn numeric_jacobian(
        &self,
        wrt: Wrt,
        x: &[f64],
        y: &[f64],
        jac: &mut Array2<f64>,
        mut r: Option<&mut [f64]>,
    ) -> CoupledResult<()> {
        let m = self.ny();
        let (kind, step) = match wrt {
            Wrt::Input => (self.xderiv, self.xstep),
            Wrt::Output => (self.yderiv, self.ystep),
        };
        let seed: &[f64] = match wrt {
            Wrt::Input => x,
            Wrt::Output => y,
        };
        match kind {
            DerivKind::Analytic => {
                Err(self.provider_unavailable("jacobian", "no analytic routine configured"))
            }
            DerivKind::ForwardFd => {
                let mut r0 = vec![0.0; m];
                self.residuals_impl(x, y, &mut r0)?;
                forward_fd_jacobian(
                    |p, rp| match wrt {
                        Wrt::Input => self.residuals_impl(p, y, rp),
                        Wrt::Output => self.residuals_impl(x, p, rp),
                    },
                    seed,
                    &r0,
                    step,
                    jac,
                )?;
                if let Some(r) = r {
                    r.copy_from_slice(&r0);
                }
                Ok(())
            }
            DerivKind::CentralFd => {
                central_fd_jacobian(
                    |p, rp| match wrt {
                        Wrt::Input => self.residuals_impl(p, y, rp),
                        Wrt::Output => self.residuals_impl(x, p, rp),
                    },
                    seed,
                    m,
                    step,
                    jac,
                )?;
                if let Some(r) = r.as_deref_mut() {
                    self.residuals_impl(x, y, r)?;
                }
                Ok(())
            }
            DerivKind::ForwardAd => {
                let g = self.generic_func("forward-mode AD")?;
                let xd: Vec<Dual<f64>> = x.iter().map(|&v| Dual::constant(v)).collect();
                let yd: Vec<Dual<f64>> = y.iter().map(|&v| Dual::constant(v)).collect();
                forward_ad_jacobian(
                    |p, rp| {
                        let run = |i: &[Dual<f64>], s: &[Dual<f64>], rp: &mut [Dual<f64>]| {
                            run_residual_packed(
                                &self.in_layout,
                                &self.out_layout,
                                |inputs, states| g.eval_dual(inputs, states),
                                i,
                                s,
                                rp,
                            )
                        };
                        match wrt {
                            Wrt::Input => run(p, &yd, rp),
                            Wrt::Output => run(&xd, p, rp),
                        }
                    },
                    seed,
                    m,
                    r,
                    jac,
                )
            }
            DerivKind::ReverseAd => {
                let g = self.generic_func("reverse-mode AD")?;
                reverse_ad_jacobian(
                    |p, rp| {
                        let xr: Vec<Reverse>;
                        let yr: Vec<Reverse>;
                        let (i, s): (&[Reverse], &[Reverse]) = match wrt {
                            Wrt::Input => {
                                yr = y.iter().map(|&v| Reverse::constant(v)).collect();
                                (p, &yr)
                            }
                            Wrt::Output => {
                                xr = x.iter().map(|&v| Reverse::constant(v)).collect();
                                (&xr, p)
                            }
                        };
                        run_residual_packed(
                            &self.in_layout,
                            &self.out_layout,
                            |inputs, states| g.eval_reverse(inputs, states),
                            i,
                            s,
                            rp,
                        )
                    },
                    seed,
                    m,
                    r,
                    jac,
                )
            }
            DerivKind::ComplexStep => {
                let g = self.generic_func("complex-step differentiation")?;
                let xc: Vec<Complex<f64>> = x.iter().map(|&v| Complex::new(v, 0.0)).collect();
                let yc: Vec<Complex<f64>> = y.iter().map(|&v| Complex::new(v, 0.0)).collect();
                complex_step_jacobian(
                    |p, rp| {
                        let run =
                            |i: &[Complex<f64>], s: &[Complex<f64>], rp: &mut [Complex<f64>]| {
                                run_residual_packed(
                                    &self.in_layout,
                                    &self.out_layout,
                                    |inputs, states| g.eval_complex(inputs, states),
                                    i,
                                    s,
                                    rp,
                                )
                            };
                        match wrt {
                            Wrt::Input => run(p, &yc, rp),
                            Wrt::Output => run(&xc, p, rp),
                        }
                    },
                    seed,
                    m,
                    step,
                    r,
                    jac,
                )
            }
        }
    }

    /// Jacobian-only ladder for one block: analytic, then combined (residuals
    /// discarded), then numeric.
    fn jacobian_impl(
        &self,
        wrt: Wrt,
        x: &[f64],
        y: &[f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()> {
        let (df, combined) = match wrt {
            Wrt::Input => (&self.dfdx, &self.rdx),
            Wrt::Output => (&self.dfdy, &self.rdy),
        };
        if let Some(df) = df {
            return self.analytic_impl(df, x, y, jac);
        }
        if let Some(combined) = combined {
            let mut r = vec![0.0; self.ny()];
            return self.combined_impl(combined, x, y, &mut r, jac);
        }
        self.numeric_jacobian(wrt, x, y, jac, None)
    }

    /// Combined residuals-and-one-Jacobian ladder for one block.
    fn residuals_and_jacobian_impl(
        &self,
        wrt: Wrt,
        x: &[f64],
        y: &[f64],
        r: &mut [f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()> {
        let (df, combined) = match wrt {
            Wrt::Input => (&self.dfdx, &self.rdx),
            Wrt::Output => (&self.dfdy, &self.rdy),
        };
        if let Some(combined) = combined {
            return self.combined_impl(combined, x, y, r, jac);
        }
        if let Some(df) = df {
            self.residuals_impl(x, y, r)?;
            return self.analytic_impl(df, x, y, jac);
        }
        self.numeric_jacobian(wrt, x, y, jac, Some(r))
    }
}

struct ImplicitCache {
    x: Array1<f64>,
    y: Array1<f64>,
    r: Array1<f64>,
    drdx: Array2<f64>,
    drdy: Array2<f64>,
    r_valid: bool,
    dx_valid: bool,
    dy_valid: bool,
}

impl ImplicitCache {
    fn sync_xy(&mut self, x: &[f64], y: &[f64]) -> bool {
        let same =
            self.x.as_slice().unwrap() == x && self.y.as_slice().unwrap() == y;
        if same {
            return false;
        }
        self.x.as_slice_mut().unwrap().copy_from_slice(x);
        self.y.as_slice_mut().unwrap().copy_from_slice(y);
        self.r_valid = false;
        self.dx_valid = false;
        self.dy_valid = false;
        true
    }
}

/// A residual component `r(x, y) = 0` with independent derivative providers
/// for `∂r/∂x` and `∂r/∂y`.
pub struct ImplicitComponent {
    desc: ImplicitDesc,
    cache: ImplicitCache,
}

impl ImplicitComponent {
    pub fn builder(name: impl Into<String>) -> ImplicitComponentBuilder {
        ImplicitComponentBuilder {
            name: name.into(),
            in_vars: Vec::new(),
            out_vars: Vec::new(),
            func: None,
            dfdx: None,
            dfdy: None,
            rdx: None,
            rdy: None,
            xderiv: None,
            yderiv: None,
            step: None,
        }
    }
}

/// Builder for [`ImplicitComponent`].
pub struct ImplicitComponentBuilder {
    name: String,
    in_vars: Vec<Variable>,
    out_vars: Vec<Variable>,
    func: Option<ResidualCallable>,
    dfdx: Option<ResidualJacobianFn>,
    dfdy: Option<ResidualJacobianFn>,
    rdx: Option<ResidualsAndJacobianFn>,
    rdy: Option<ResidualsAndJacobianFn>,
    xderiv: Option<DerivKind>,
    yderiv: Option<DerivKind>,
    step: Option<f64>,
}

impl ImplicitComponentBuilder {
    /// Supply a provider-generic residual routine.
    pub fn with_residual_function<E: EvaluateResidual + 'static>(mut self, func: E) -> Self {
        self.func = Some(ResidualCallable::Generic(Box::new(func)));
        self
    }

    /// Supply an `f64`-only residual routine.
    pub fn with_real_residual_function<F>(mut self, func: F) -> Self
    where
        F: Fn(
                &[ndarray::ArrayViewD<'_, f64>],
                &[ndarray::ArrayViewD<'_, f64>],
            ) -> CoupledResult<Vec<ndarray::ArrayD<f64>>>
            + Send
            + Sync
            + 'static,
    {
        self.func = Some(ResidualCallable::Real(Box::new(func)));
        self
    }

    pub fn with_inputs(mut self, vars: impl IntoIterator<Item = Variable>) -> Self {
        self.in_vars.extend(vars);
        self
    }

    pub fn with_outputs(mut self, vars: impl IntoIterator<Item = Variable>) -> Self {
        self.out_vars.extend(vars);
        self
    }

    /// Select the provider for `∂r/∂x`.
    pub fn with_xderiv(mut self, kind: DerivKind) -> Self {
        self.xderiv = Some(kind);
        self
    }

    /// Select the provider for `∂r/∂y`.
    pub fn with_yderiv(mut self, kind: DerivKind) -> Self {
        self.yderiv = Some(kind);
        self
    }

    /// Override the default step size for both providers.
    pub fn with_fd_step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    /// Supply an analytic `∂r/∂x` routine.
    pub fn with_input_jacobian_fn<F>(mut self, dfdx: F) -> Self
    where
        F: Fn(
                &mut ndarray::ArrayViewMut2<'_, f64>,
                &[ndarray::ArrayViewD<'_, f64>],
                &[ndarray::ArrayViewD<'_, f64>],
            ) -> CoupledResult<()>
            + Send
            + Sync
            + 'static,
    {
        self.dfdx = Some(Box::new(dfdx));
        self
    }

    /// Supply an analytic `∂r/∂y` routine.
    pub fn with_output_jacobian_fn<F>(mut self, dfdy: F) -> Self
    where
        F: Fn(
                &mut ndarray::ArrayViewMut2<'_, f64>,
                &[ndarray::ArrayViewD<'_, f64>],
                &[ndarray::ArrayViewD<'_, f64>],
            ) -> CoupledResult<()>
            + Send
            + Sync
            + 'static,
    {
        self.dfdy = Some(Box::new(dfdy));
        self
    }

    /// Supply a combined residuals-and-`∂r/∂x` routine; it satisfies the
    /// input-Jacobian slot, the output Jacobian still comes from `yderiv`.
    pub fn with_residuals_and_input_jacobian_fn<F>(mut self, rdx: F) -> Self
    where
        F: Fn(
                &mut ndarray::ArrayViewMut2<'_, f64>,
                &[ndarray::ArrayViewD<'_, f64>],
                &[ndarray::ArrayViewD<'_, f64>],
            ) -> CoupledResult<Vec<ndarray::ArrayD<f64>>>
            + Send
            + Sync
            + 'static,
    {
        self.rdx = Some(Box::new(rdx));
        self
    }

    /// Supply a combined residuals-and-`∂r/∂y` routine.
    pub fn with_residuals_and_output_jacobian_fn<F>(mut self, rdy: F) -> Self
    where
        F: Fn(
                &mut ndarray::ArrayViewMut2<'_, f64>,
                &[ndarray::ArrayViewD<'_, f64>],
                &[ndarray::ArrayViewD<'_, f64>],
            ) -> CoupledResult<Vec<ndarray::ArrayD<f64>>>
            + Send
            + Sync
            + 'static,
    {
        self.rdy = Some(Box::new(rdy));
        self
    }

    pub fn build(self) -> CoupledResult<ImplicitComponent> {
        check_unique(&self.in_vars)?;
        check_unique(&self.out_vars)?;
        if self.func.is_none() && self.rdx.is_none() && self.rdy.is_none() {
            return Err(CoupledError::ProviderUnavailable {
                operation: format!("residuals of component '{}'", self.name),
                reason: "neither a residual function nor a combined routine was supplied"
                    .to_string(),
            });
        }
        let xderiv = self.xderiv.unwrap_or_default();
        let yderiv = self.yderiv.unwrap_or_default();

        let desc = ImplicitDesc {
            in_layout: VarLayout::new(&self.in_vars),
            out_layout: VarLayout::new(&self.out_vars),
            name: self.name,
            in_vars: self.in_vars,
            out_vars: self.out_vars,
            func: self.func,
            dfdx: self.dfdx,
            dfdy: self.dfdy,
            rdx: self.rdx,
            rdy: self.rdy,
            xderiv,
            yderiv,
            xstep: self.step.unwrap_or_else(|| default_step(xderiv)),
            ystep: self.step.unwrap_or_else(|| default_step(yderiv)),
        };
        let (nx, ny) = (desc.nx(), desc.ny());

        Ok(ImplicitComponent {
            cache: ImplicitCache {
                x: combine(&desc.in_vars),
                y: combine(&desc.out_vars),
                r: Array1::zeros(ny),
                drdx: Array2::zeros((ny, nx)),
                drdy: Array2::zeros((ny, ny)),
                r_valid: false,
                dx_valid: false,
                dy_valid: false,
            },
            desc,
        })
    }
}

impl ImplicitEval for ImplicitComponent {
    fn name(&self) -> &str {
        &self.desc.name
    }

    fn in_vars(&self) -> &[Variable] {
        &self.desc.in_vars
    }

    fn out_vars(&self) -> &[Variable] {
        &self.desc.out_vars
    }

    fn eval_residuals(&self, x: &[f64], y: &[f64], r: &mut [f64]) -> CoupledResult<()> {
        check_flat_len(self.desc.nx(), x.len())?;
        check_flat_len(self.desc.ny(), y.len())?;
        self.desc.residuals_impl(x, y, r)
    }

    fn eval_input_jacobian(
        &self,
        x: &[f64],
        y: &[f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()> {
        check_flat_len(self.desc.nx(), x.len())?;
        check_flat_len(self.desc.ny(), y.len())?;
        check_jacobian_shape(jac, self.desc.ny(), self.desc.nx())?;
        self.desc.jacobian_impl(Wrt::Input, x, y, jac)
    }

    fn eval_output_jacobian(
        &self,
        x: &[f64],
        y: &[f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()> {
        check_flat_len(self.desc.nx(), x.len())?;
        check_flat_len(self.desc.ny(), y.len())?;
        check_jacobian_shape(jac, self.desc.ny(), self.desc.ny())?;
        self.desc.jacobian_impl(Wrt::Output, x, y, jac)
    }

    fn eval_residuals_and_input_jacobian(
        &self,
        x: &[f64],
        y: &[f64],
        r: &mut [f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()> {
        check_flat_len(self.desc.nx(), x.len())?;
        check_flat_len(self.desc.ny(), y.len())?;
        check_jacobian_shape(jac, self.desc.ny(), self.desc.nx())?;
        self.desc
            .residuals_and_jacobian_impl(Wrt::Input, x, y, r, jac)
    }

    fn eval_residuals_and_output_jacobian(
        &self,
        x: &[f64],
        y: &[f64],
        r: &mut [f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()> {
        check_flat_len(self.desc.nx(), x.len())?;
        check_flat_len(self.desc.ny(), y.len())?;
        check_jacobian_shape(jac, self.desc.ny(), self.desc.ny())?;
        self.desc
            .residuals_and_jacobian_impl(Wrt::Output, x, y, r, jac)
    }

    fn update_residuals(&mut self, x: &[f64], y: &[f64]) -> CoupledResult<&Array1<f64>> {
        check_flat_len(self.desc.nx(), x.len())?;
        check_flat_len(self.desc.ny(), y.len())?;
        let changed = self.cache.sync_xy(x, y);
        if changed || !self.cache.r_valid {
            let Self { desc, cache } = self;
            desc.residuals_impl(x, y, cache.r.as_slice_mut().unwrap())?;
            cache.r_valid = true;
        }
        Ok(&self.cache.r)
    }

    fn update_input_jacobian(&mut self, x: &[f64], y: &[f64]) -> CoupledResult<&Array2<f64>> {
        check_flat_len(self.desc.nx(), x.len())?;
        check_flat_len(self.desc.ny(), y.len())?;
        let changed = self.cache.sync_xy(x, y);
        if changed || !self.cache.dx_valid {
            let Self { desc, cache } = self;
            desc.jacobian_impl(Wrt::Input, x, y, &mut cache.drdx)?;
            cache.dx_valid = true;
        }
        Ok(&self.cache.drdx)
    }

    fn update_output_jacobian(&mut self, x: &[f64], y: &[f64]) -> CoupledResult<&Array2<f64>> {
        check_flat_len(self.desc.nx(), x.len())?;
        check_flat_len(self.desc.ny(), y.len())?;
        let changed = self.cache.sync_xy(x, y);
        if changed || !self.cache.dy_valid {
            let Self { desc, cache } = self;
            desc.jacobian_impl(Wrt::Output, x, y, &mut cache.drdy)?;
            cache.dy_valid = true;
        }
        Ok(&self.cache.drdy)
    }

    fn last_residuals(&self) -> &Array1<f64> {
        &self.cache.r
    }

    fn last_input_jacobian(&self) -> &Array2<f64> {
        &self.cache.drdx
    }

    fn last_output_jacobian(&self) -> &Array2<f64> {
        &self.cache.drdy
    }

    fn cached_state(&self) -> &Array1<f64> {
        &self.cache.y
    }

    fn set_cached_state(&mut self, y: &[f64]) {
        self.cache.y.as_slice_mut().unwrap().copy_from_slice(y);
    }

    fn invalidate(&mut self) {
        self.cache.r_valid = false;
        self.cache.dx_valid = false;
        self.cache.dy_valid = false;
    }
}

/// The residual view of an explicit component: `r = y − f(x)`, so
/// `∂r/∂x = −J_f` and `∂r/∂y = I`.
///
/// This is how explicit components join implicit systems, and how an explicit
/// component can be handed to the Newton converter unchanged.
pub struct LiftedExplicit {
    name: String,
    inner: Box<dyn ExplicitEval>,
    state: Array1<f64>,
    r: Array1<f64>,
    drdx: Array2<f64>,
    drdy: Array2<f64>,
    r_valid: bool,
    dx_valid: bool,
    x: Array1<f64>,
    y: Array1<f64>,
}

impl LiftedExplicit {
    pub fn new(inner: impl ExplicitEval + 'static) -> Self {
        Self::from_boxed(Box::new(inner))
    }

    pub fn from_boxed(inner: Box<dyn ExplicitEval>) -> Self {
        let (nx, ny) = (inner.nx(), inner.ny());
        let state = combine(inner.out_vars());
        // ∂r/∂y is the identity for every input; build it once.
        let drdy = Array2::eye(ny);
        LiftedExplicit {
            name: format!("residual({})", inner.name()),
            state: state.clone(),
            r: Array1::zeros(ny),
            drdx: Array2::zeros((ny, nx)),
            drdy,
            r_valid: false,
            dx_valid: false,
            x: combine(inner.in_vars()),
            y: state,
            inner,
        }
    }

    fn sync_xy(&mut self, x: &[f64], y: &[f64]) {
        if self.x.as_slice().unwrap() != x || self.y.as_slice().unwrap() != y {
            self.x.as_slice_mut().unwrap().copy_from_slice(x);
            self.y.as_slice_mut().unwrap().copy_from_slice(y);
            self.r_valid = false;
            self.dx_valid = false;
        }
    }
}

impl ImplicitEval for LiftedExplicit {
    fn name(&self) -> &str {
        &self.name
    }

    fn in_vars(&self) -> &[Variable] {
        self.inner.in_vars()
    }

    fn out_vars(&self) -> &[Variable] {
        self.inner.out_vars()
    }

    fn eval_residuals(&self, x: &[f64], y: &[f64], r: &mut [f64]) -> CoupledResult<()> {
        check_flat_len(self.inner.ny(), y.len())?;
        check_flat_len(self.inner.ny(), r.len())?;
        self.inner.eval_outputs(x, r)?;
        for (ri, &yi) in r.iter_mut().zip(y.iter()) {
            *ri = yi - *ri;
        }
        Ok(())
    }

    fn eval_input_jacobian(
        &self,
        x: &[f64],
        _y: &[f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()> {
        self.inner.eval_jacobian(x, jac)?;
        jac.mapv_inplace(|v| -v);
        Ok(())
    }

    fn eval_output_jacobian(
        &self,
        _x: &[f64],
        _y: &[f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()> {
        check_jacobian_shape(jac, self.inner.ny(), self.inner.ny())?;
        jac.assign(&self.drdy);
        Ok(())
    }

    fn update_residuals(&mut self, x: &[f64], y: &[f64]) -> CoupledResult<&Array1<f64>> {
        check_flat_len(self.inner.ny(), y.len())?;
        self.sync_xy(x, y);
        if !self.r_valid {
            let f = self.inner.update_outputs(x)?;
            for ((ri, &yi), &fi) in self.r.iter_mut().zip(y.iter()).zip(f.iter()) {
                *ri = yi - fi;
            }
            self.r_valid = true;
        }
        Ok(&self.r)
    }

    fn update_input_jacobian(&mut self, x: &[f64], y: &[f64]) -> CoupledResult<&Array2<f64>> {
        check_flat_len(self.inner.ny(), y.len())?;
        self.sync_xy(x, y);
        if !self.dx_valid {
            let jf = self.inner.update_jacobian(x)?;
            self.drdx.assign(jf);
            self.drdx.mapv_inplace(|v| -v);
            self.dx_valid = true;
        }
        Ok(&self.drdx)
    }

    fn update_output_jacobian(&mut self, _x: &[f64], _y: &[f64]) -> CoupledResult<&Array2<f64>> {
        Ok(&self.drdy)
    }

    fn last_residuals(&self) -> &Array1<f64> {
        &self.r
    }

    fn last_input_jacobian(&self) -> &Array2<f64> {
        &self.drdx
    }

    fn last_output_jacobian(&self) -> &Array2<f64> {
        &self.drdy
    }

    fn cached_state(&self) -> &Array1<f64> {
        &self.state
    }

    fn set_cached_state(&mut self, y: &[f64]) {
        self.state.as_slice_mut().unwrap().copy_from_slice(y);
    }

    fn invalidate(&mut self) {
        self.r_valid = false;
        self.dx_valid = false;
        self.inner.invalidate();
    }

    fn invalidate_deep(&mut self) {
        self.r_valid = false;
        self.dx_valid = false;
        self.inner.invalidate_deep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example_components::{paraboloid, Paraboloid};
    use crate::variable::declare;
    use approx::assert_relative_eq;
    use ndarray::{ArrayD, IxDyn};

    /// r = y² − x, so the solution is y = √x.
    struct SqrtResidual;
    impl EvaluateResidual for SqrtResidual {
        fn evaluate<T: crate::scalar::Scalar>(
            &self,
            inputs: &[ndarray::ArrayViewD<'_, T>],
            states: &[ndarray::ArrayViewD<'_, T>],
        ) -> CoupledResult<Vec<ArrayD<T>>> {
            let x = inputs[0][[0]];
            let y = states[0][[0]];
            Ok(vec![ArrayD::from_elem(IxDyn(&[1]), y * y - x)])
        }
    }

    fn sqrt_component(xderiv: DerivKind, yderiv: DerivKind) -> ImplicitComponent {
        ImplicitComponent::builder("sqrt")
            .with_residual_function(SqrtResidual)
            .with_inputs([declare("x", 1.0)])
            .with_outputs([declare("y", 1.0)])
            .with_xderiv(xderiv)
            .with_yderiv(yderiv)
            .build()
            .unwrap()
    }

    #[test]
    fn test_residual_values() {
        let comp = sqrt_component(DerivKind::ForwardAd, DerivKind::ForwardAd);
        let r = comp.residuals(&[4.0], &[3.0]).unwrap();
        assert_relative_eq!(r[0], 5.0);
    }

    #[test]
    fn test_block_jacobians_with_independent_providers() {
        // ∂r/∂x = -1 from complex step, ∂r/∂y = 2y from reverse AD.
        let comp = sqrt_component(DerivKind::ComplexStep, DerivKind::ReverseAd);
        let drdx = comp.input_jacobian(&[4.0], &[3.0]).unwrap();
        let drdy = comp.output_jacobian(&[4.0], &[3.0]).unwrap();
        assert_relative_eq!(drdx[[0, 0]], -1.0, max_relative = 1e-12);
        assert_relative_eq!(drdy[[0, 0]], 6.0, max_relative = 1e-12);
    }

    #[test]
    fn test_finite_difference_providers_agree() {
        let comp = sqrt_component(DerivKind::ForwardFd, DerivKind::CentralFd);
        let (r, drdx, drdy) = comp.residuals_and_jacobians(&[4.0], &[3.0]).unwrap();
        assert_relative_eq!(r[0], 5.0);
        assert_relative_eq!(drdx[[0, 0]], -1.0, max_relative = 1e-6);
        assert_relative_eq!(drdy[[0, 0]], 6.0, max_relative = 1e-6);
    }

    #[test]
    fn test_combined_routine_fills_one_slot() {
        // rdy supplies residuals + ∂r/∂y; ∂r/∂x still comes from the provider.
        let comp = ImplicitComponent::builder("combined")
            .with_residual_function(SqrtResidual)
            .with_residuals_and_output_jacobian_fn(|jac, inputs, states| {
                let x = inputs[0][[0]];
                let y = states[0][[0]];
                jac[[0, 0]] = 2.0 * y;
                Ok(vec![ArrayD::from_elem(IxDyn(&[1]), y * y - x)])
            })
            .with_inputs([declare("x", 1.0)])
            .with_outputs([declare("y", 1.0)])
            .with_xderiv(DerivKind::ForwardAd)
            .build()
            .unwrap();
        let drdy = comp.output_jacobian(&[4.0], &[3.0]).unwrap();
        let drdx = comp.input_jacobian(&[4.0], &[3.0]).unwrap();
        assert_relative_eq!(drdy[[0, 0]], 6.0);
        assert_relative_eq!(drdx[[0, 0]], -1.0, max_relative = 1e-12);
    }

    #[test]
    fn test_cache_ladder_on_residuals() {
        let mut comp = sqrt_component(DerivKind::ForwardAd, DerivKind::ForwardAd);
        let r1 = comp.update_residuals(&[4.0], &[3.0]).unwrap().clone();
        let r2 = comp.last_residuals().clone();
        let r3 = comp.refresh_residuals(&[4.0], &[3.0]).unwrap().clone();
        assert_eq!(r1, r2);
        assert_eq!(r1, r3);
    }

    #[test]
    fn test_lifted_explicit_matches_hand_written_residual() {
        // Wrap the paraboloid (S2): at x = (1, 2), y = 9 the residual is -30
        // and the Jacobian blocks are ∂r/∂x = [2, -13], ∂r/∂y = [1].
        let lifted = LiftedExplicit::new(paraboloid(DerivKind::ForwardAd));
        let x = [1.0, 2.0];
        let y = [9.0];
        let r = lifted.residuals(&x, &y).unwrap();
        assert_relative_eq!(r[0], -30.0);

        let drdx = lifted.input_jacobian(&x, &y).unwrap();
        assert_relative_eq!(drdx[[0, 0]], 2.0, max_relative = 1e-12);
        assert_relative_eq!(drdx[[0, 1]], -13.0, max_relative = 1e-12);

        let drdy = lifted.output_jacobian(&x, &y).unwrap();
        assert_relative_eq!(drdy[[0, 0]], 1.0);
    }

    #[test]
    fn test_lifted_explicit_cached_ladder() {
        let mut lifted = LiftedExplicit::new(paraboloid(DerivKind::ForwardAd));
        let x = [1.0, 2.0];
        let y = [9.0];
        let r = lifted.update_residuals(&x, &y).unwrap().clone();
        assert_relative_eq!(r[0], -30.0);
        let drdx = lifted.update_input_jacobian(&x, &y).unwrap().clone();
        assert_relative_eq!(drdx[[0, 1]], -13.0, max_relative = 1e-12);
        // State cache starts at the declared output defaults.
        assert_eq!(lifted.cached_state().len(), 1);
    }

    #[test]
    fn test_real_residual_rejects_ad() {
        let comp = ImplicitComponent::builder("real")
            .with_real_residual_function(|inputs, states| {
                let x = inputs[0][[0]];
                let y = states[0][[0]];
                Ok(vec![ArrayD::from_elem(IxDyn(&[1]), y - x)])
            })
            .with_inputs([declare("x", 0.0)])
            .with_outputs([declare("y", 0.0)])
            .with_xderiv(DerivKind::ReverseAd)
            .build()
            .unwrap();
        assert!(matches!(
            comp.input_jacobian(&[1.0], &[1.0]),
            Err(CoupledError::ProviderUnavailable { .. })
        ));
    }

    #[test]
    fn test_explicit_paraboloid_used_in_residual_builder() {
        // Guard against the builder rejecting a residual-only configuration.
        let _ = Paraboloid;
        let built = ImplicitComponent::builder("no-residual")
            .with_inputs([declare("x", 0.0)])
            .with_outputs([declare("y", 0.0)])
            .build();
        assert!(matches!(
            built,
            Err(CoupledError::ProviderUnavailable { .. })
        ));
    }
}
