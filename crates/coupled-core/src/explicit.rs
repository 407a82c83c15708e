//! Explicit components: `y = f(x)` with a pluggable Jacobian provider.

use ndarray::{Array1, Array2};

use crate::component::{
    check_flat_len, check_jacobian_shape, run_explicit_packed, Evaluate, ExplicitCallable,
    ExplicitEval, GenericExplicitFn, JacobianFn, OutputsAndJacobianFn,
};
use crate::derivatives::{
    central_fd_jacobian, complex_step_jacobian, default_step, forward_ad_jacobian,
    forward_fd_jacobian, reverse_ad_jacobian, DerivKind,
};
use crate::errors::{CoupledError, CoupledResult};
use crate::variable::{check_unique, combine, VarLayout, Variable};

/// Immutable component descriptor: declarations, primal, providers.
pub(crate) struct ExplicitDesc {
    name: String,
    in_vars: Vec<Variable>,
    /// Returned outputs first, then in-place outputs; the flat output order.
    all_out: Vec<Variable>,
    in_layout: VarLayout,
    /// Layout of the outputs returned by value from the primal.
    ret_layout: VarLayout,
    /// Layout of the outputs populated in place by the primal.
    mut_layout: VarLayout,
    func: Option<ExplicitCallable>,
    df: Option<JacobianFn>,
    fdf: Option<OutputsAndJacobianFn>,
    deriv: DerivKind,
    step: f64,
}

impl ExplicitDesc {
    fn nx(&self) -> usize {
        self.in_layout.width()
    }

    fn ny(&self) -> usize {
        self.ret_layout.width() + self.mut_layout.width()
    }

    fn provider_unavailable(&self, operation: &str, reason: &str) -> CoupledError {
        CoupledError::ProviderUnavailable {
            operation: format!("{} of component '{}'", operation, self.name),
            reason: reason.to_string(),
        }
    }

    /// Evaluate the primal, falling back to a combined analytic routine (with
    /// the Jacobian half discarded) when no primal function was supplied.
    fn outputs_impl(&self, x: &[f64], y: &mut [f64]) -> CoupledResult<()> {
        if let Some(func) = &self.func {
            return run_explicit_packed(
                &self.in_layout,
                &self.ret_layout,
                &self.mut_layout,
                |out_mut, inputs| func.eval_f64(out_mut, inputs),
                x,
                y,
            );
        }
        if self.fdf.is_some() {
            let mut scratch = Array2::zeros((self.ny(), self.nx()));
            return self.fdf_impl(x, y, &mut scratch);
        }
        Err(self.provider_unavailable("outputs", "no primal or combined routine configured"))
    }

    /// Run the combined analytic outputs-and-Jacobian routine.
    fn fdf_impl(&self, x: &[f64], y: &mut [f64], jac: &mut Array2<f64>) -> CoupledResult<()> {
        let fdf = self
            .fdf
            .as_ref()
            .expect("fdf_impl is only called when a combined routine exists");
        run_explicit_packed(
            &self.in_layout,
            &self.ret_layout,
            &self.mut_layout,
            |out_mut, inputs| fdf(out_mut, &mut jac.view_mut(), inputs),
            x,
            y,
        )
    }

    /// Run the analytic Jacobian routine.
    fn df_impl(&self, x: &[f64], jac: &mut Array2<f64>) -> CoupledResult<()> {
        let df = self
            .df
            .as_ref()
            .expect("df_impl is only called when an analytic Jacobian exists");
        let inputs = self.in_layout.separate(x)?;
        df(&mut jac.view_mut(), &inputs)
    }

    /// Compute the Jacobian with the configured numeric provider, optionally
    /// capturing the primal values on the way.
    fn numeric_jacobian(
        &self,
        x: &[f64],
        jac: &mut Array2<f64>,
        mut y: Option<&mut [f64]>,
    ) -> CoupledResult<()> {
        let m = self.ny();
        match self.deriv {
            DerivKind::Analytic => {
                Err(self.provider_unavailable("jacobian", "no analytic routine configured"))
            }
            DerivKind::ForwardFd => {
                let mut y0 = vec![0.0; m];
                self.outputs_impl(x, &mut y0)?;
                forward_fd_jacobian(
                    |xp, yp| self.outputs_impl(xp, yp),
                    x,
                    &y0,
                    self.step,
                    jac,
                )?;
                if let Some(y) = y {
                    y.copy_from_slice(&y0);
                }
                Ok(())
            }
            DerivKind::CentralFd => {
                central_fd_jacobian(|xp, yp| self.outputs_impl(xp, yp), x, m, self.step, jac)?;
                if let Some(y) = y.as_deref_mut() {
                    self.outputs_impl(x, y)?;
                }
                Ok(())
            }
            DerivKind::ForwardAd => {
                let g = self.generic_func("forward-mode AD")?;
                forward_ad_jacobian(
                    |xd, yd| {
                        run_explicit_packed(
                            &self.in_layout,
                            &self.ret_layout,
                            &self.mut_layout,
                            |out_mut, inputs| g.eval_dual(out_mut, inputs),
                            xd,
                            yd,
                        )
                    },
                    x,
                    m,
                    y,
                    jac,
                )
            }
            DerivKind::ReverseAd => {
                let g = self.generic_func("reverse-mode AD")?;
                reverse_ad_jacobian(
                    |xr, yr| {
                        run_explicit_packed(
                            &self.in_layout,
                            &self.ret_layout,
                            &self.mut_layout,
                            |out_mut, inputs| g.eval_reverse(out_mut, inputs),
                            xr,
                            yr,
                        )
                    },
                    x,
                    m,
                    y,
                    jac,
                )
            }
            DerivKind::ComplexStep => {
                let g = self.generic_func("complex-step differentiation")?;
                complex_step_jacobian(
                    |xc, yc| {
                        run_explicit_packed(
                            &self.in_layout,
                            &self.ret_layout,
                            &self.mut_layout,
                            |out_mut, inputs| g.eval_complex(out_mut, inputs),
                            xc,
                            yc,
                        )
                    },
                    x,
                    m,
                    self.step,
                    y,
                    jac,
                )
            }
        }
    }

    fn generic_func(&self, what: &str) -> CoupledResult<&dyn GenericExplicitFn> {
        self.func
            .as_ref()
            .and_then(ExplicitCallable::generic)
            .ok_or_else(|| {
                self.provider_unavailable(
                    "jacobian",
                    &format!("{what} requires a primal with a generic element type"),
                )
            })
    }

    /// Jacobian-only request: analytic `df` wins, then a combined routine
    /// (its outputs half discarded), then the configured numeric provider.
    fn jacobian_impl(&self, x: &[f64], jac: &mut Array2<f64>) -> CoupledResult<()> {
        if self.df.is_some() {
            return self.df_impl(x, jac);
        }
        if self.fdf.is_some() {
            let mut y = vec![0.0; self.ny()];
            return self.fdf_impl(x, &mut y, jac);
        }
        self.numeric_jacobian(x, jac, None)
    }

    /// Combined request: a combined analytic routine wins, then the split
    /// `f`/`df` pair, then one provider sweep capturing both halves.
    fn outputs_and_jacobian_impl(
        &self,
        x: &[f64],
        y: &mut [f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()> {
        if self.fdf.is_some() {
            return self.fdf_impl(x, y, jac);
        }
        if self.df.is_some() {
            self.outputs_impl(x, y)?;
            return self.df_impl(x, jac);
        }
        self.numeric_jacobian(x, jac, Some(y))
    }
}

/// Mutable evaluation caches, seeded from the variable defaults and marked
/// stale until the first mutating call.
struct ExplicitCache {
    x: Array1<f64>,
    y: Array1<f64>,
    jac: Array2<f64>,
    y_valid: bool,
    jac_valid: bool,
}

impl ExplicitCache {
    /// Compare `x` against the cached input; on change, store it and mark
    /// every cache stale. Returns whether the input changed.
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

/// An output-mapping component `y = f(x)` with cached last input, outputs and
/// Jacobian.
///
/// Construct through [`ExplicitComponent::builder`]. Evaluation follows the
/// call-suffix ladder of [`ExplicitEval`].
pub struct ExplicitComponent {
    desc: ExplicitDesc,
    cache: ExplicitCache,
}

impl ExplicitComponent {
    pub fn builder(name: impl Into<String>) -> ExplicitComponentBuilder {
        ExplicitComponentBuilder {
            name: name.into(),
            in_vars: Vec::new(),
            ret_vars: Vec::new(),
            mut_vars: Vec::new(),
            func: None,
            df: None,
            fdf: None,
            deriv: None,
            step: None,
            workspace: None,
        }
    }

    /// The configured derivative provider.
    pub fn deriv(&self) -> DerivKind {
        self.desc.deriv
    }
}

/// Builder for [`ExplicitComponent`].
pub struct ExplicitComponentBuilder {
    name: String,
    in_vars: Vec<Variable>,
    ret_vars: Vec<Variable>,
    mut_vars: Vec<Variable>,
    func: Option<ExplicitCallable>,
    df: Option<JacobianFn>,
    fdf: Option<OutputsAndJacobianFn>,
    deriv: Option<DerivKind>,
    step: Option<f64>,
    workspace: Option<Array2<f64>>,
}

impl ExplicitComponentBuilder {
    /// Supply a provider-generic primal. Every derivative provider can use it.
    pub fn with_function<E: Evaluate + 'static>(mut self, func: E) -> Self {
        self.func = Some(ExplicitCallable::Generic(Box::new(func)));
        self
    }

    /// Supply an `f64`-only primal. The finite-difference and analytic
    /// providers can use it; AD and complex step cannot.
    pub fn with_real_function<F>(mut self, func: F) -> Self
    where
        F: Fn(
                &mut [ndarray::ArrayViewMutD<'_, f64>],
                &[ndarray::ArrayViewD<'_, f64>],
            ) -> CoupledResult<Vec<ndarray::ArrayD<f64>>>
            + Send
            + Sync
            + 'static,
    {
        self.func = Some(ExplicitCallable::Real(Box::new(func)));
        self
    }

    /// Declare the input variables, in call order.
    pub fn with_inputs(mut self, vars: impl IntoIterator<Item = Variable>) -> Self {
        self.in_vars.extend(vars);
        self
    }

    /// Declare the outputs returned by value from the primal.
    pub fn with_outputs(mut self, vars: impl IntoIterator<Item = Variable>) -> Self {
        self.ret_vars.extend(vars);
        self
    }

    /// Declare the outputs the primal populates in place. They follow the
    /// returned outputs in the flat output vector.
    pub fn with_inplace_outputs(mut self, vars: impl IntoIterator<Item = Variable>) -> Self {
        self.mut_vars.extend(vars);
        self
    }

    /// Select the derivative provider. Defaults to forward finite differences.
    pub fn with_deriv(mut self, kind: DerivKind) -> Self {
        self.deriv = Some(kind);
        self
    }

    /// Override the provider's default step size.
    pub fn with_fd_step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    /// Supply an analytic Jacobian routine `df`. When present it is preferred
    /// over any numeric provider for Jacobian-only requests.
    pub fn with_jacobian_fn<F>(mut self, df: F) -> Self
    where
        F: Fn(
                &mut ndarray::ArrayViewMut2<'_, f64>,
                &[ndarray::ArrayViewD<'_, f64>],
            ) -> CoupledResult<()>
            + Send
            + Sync
            + 'static,
    {
        self.df = Some(Box::new(df));
        self
    }

    /// Supply a combined outputs-and-Jacobian routine `fdf`. It is preferred
    /// for combined requests; split requests prefer the primal and `df`.
    pub fn with_outputs_and_jacobian_fn<F>(mut self, fdf: F) -> Self
    where
        F: Fn(
                &mut [ndarray::ArrayViewMutD<'_, f64>],
                &mut ndarray::ArrayViewMut2<'_, f64>,
                &[ndarray::ArrayViewD<'_, f64>],
            ) -> CoupledResult<Vec<ndarray::ArrayD<f64>>>
            + Send
            + Sync
            + 'static,
    {
        self.fdf = Some(Box::new(fdf));
        self
    }

    /// Pre-supply the Jacobian cache buffer. Must be shaped `(ny, nx)`.
    pub fn with_workspace(mut self, jac: Array2<f64>) -> Self {
        self.workspace = Some(jac);
        self
    }

    pub fn build(self) -> CoupledResult<ExplicitComponent> {
        check_unique(&self.in_vars)?;
        let mut all_out = self.ret_vars.clone();
        all_out.extend(self.mut_vars.iter().cloned());
        check_unique(&all_out)?;

        if self.func.is_none() && self.fdf.is_none() {
            return Err(CoupledError::ProviderUnavailable {
                operation: format!("outputs of component '{}'", self.name),
                reason: "neither a primal function nor a combined routine was supplied"
                    .to_string(),
            });
        }

        let deriv = self.deriv.unwrap_or_default();
        if deriv == DerivKind::Analytic && self.df.is_none() && self.fdf.is_none() {
            return Err(CoupledError::ProviderUnavailable {
                operation: format!("jacobian of component '{}'", self.name),
                reason: "the analytic provider requires a jacobian or combined routine"
                    .to_string(),
            });
        }

        let desc = ExplicitDesc {
            in_layout: VarLayout::new(&self.in_vars),
            ret_layout: VarLayout::new(&self.ret_vars),
            mut_layout: VarLayout::new(&self.mut_vars),
            name: self.name,
            in_vars: self.in_vars,
            all_out,
            func: self.func,
            df: self.df,
            fdf: self.fdf,
            deriv,
            step: self.step.unwrap_or_else(|| default_step(deriv)),
        };

        let (nx, ny) = (desc.nx(), desc.ny());
        let jac = match self.workspace {
            Some(ws) => {
                check_jacobian_shape(&ws, ny, nx)?;
                ws
            }
            None => Array2::zeros((ny, nx)),
        };

        Ok(ExplicitComponent {
            cache: ExplicitCache {
                x: combine(&desc.in_vars),
                y: combine(&desc.all_out),
                jac,
                y_valid: false,
                jac_valid: false,
            },
            desc,
        })
    }
}

impl ExplicitEval for ExplicitComponent {
    fn name(&self) -> &str {
        &self.desc.name
    }

    fn in_vars(&self) -> &[Variable] {
        &self.desc.in_vars
    }

    fn out_vars(&self) -> &[Variable] {
        &self.desc.all_out
    }

    fn eval_outputs(&self, x: &[f64], y: &mut [f64]) -> CoupledResult<()> {
        check_flat_len(self.desc.nx(), x.len())?;
        self.desc.outputs_impl(x, y)
    }

    fn eval_jacobian(&self, x: &[f64], jac: &mut Array2<f64>) -> CoupledResult<()> {
        check_flat_len(self.desc.nx(), x.len())?;
        check_jacobian_shape(jac, self.desc.ny(), self.desc.nx())?;
        self.desc.jacobian_impl(x, jac)
    }

    fn eval_outputs_and_jacobian(
        &self,
        x: &[f64],
        y: &mut [f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()> {
        check_flat_len(self.desc.nx(), x.len())?;
        check_jacobian_shape(jac, self.desc.ny(), self.desc.nx())?;
        self.desc.outputs_and_jacobian_impl(x, y, jac)
    }

    fn update_outputs(&mut self, x: &[f64]) -> CoupledResult<&Array1<f64>> {
        check_flat_len(self.desc.nx(), x.len())?;
        let changed = self.cache.sync_x(x);
        if changed || !self.cache.y_valid {
            let Self { desc, cache } = self;
            desc.outputs_impl(x, cache.y.as_slice_mut().unwrap())?;
            cache.y_valid = true;
        }
        Ok(&self.cache.y)
    }

    fn update_jacobian(&mut self, x: &[f64]) -> CoupledResult<&Array2<f64>> {
        check_flat_len(self.desc.nx(), x.len())?;
        let changed = self.cache.sync_x(x);
        if changed || !self.cache.jac_valid {
            let Self { desc, cache } = self;
            desc.jacobian_impl(x, &mut cache.jac)?;
            cache.jac_valid = true;
        }
        Ok(&self.cache.jac)
    }

    fn update_outputs_and_jacobian(
        &mut self,
        x: &[f64],
    ) -> CoupledResult<(&Array1<f64>, &Array2<f64>)> {
        check_flat_len(self.desc.nx(), x.len())?;
        let changed = self.cache.sync_x(x);
        if changed || !self.cache.y_valid || !self.cache.jac_valid {
            let Self { desc, cache } = self;
            desc.outputs_and_jacobian_impl(
                x,
                cache.y.as_slice_mut().unwrap(),
                &mut cache.jac,
            )?;
            cache.y_valid = true;
            cache.jac_valid = true;
        }
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
    }
}
