//! Implicit systems: a residual stack over the concatenated outputs of the
//! inner components, with block-assembled Jacobians.

use ndarray::{s, Array1, Array2};
use tracing::debug;

use crate::component::{check_flat_len, check_jacobian_shape, ExplicitEval, ImplicitEval};
use crate::errors::CoupledResult;
use crate::implicit::LiftedExplicit;
use crate::system::routing::{build_routing, ComponentIo, Routing, SourceRef};
use crate::variable::{combine, Variable};

/// Add a member's `∂r/∂x` contributions into the system Jacobian columns its
/// inputs route from. `select` filters and maps a source to a column base.
fn scatter_member_drdx(
    routing: &Routing,
    member: usize,
    drdx_k: &Array2<f64>,
    jac: &mut Array2<f64>,
    select: impl Fn(SourceRef) -> Option<usize>,
) {
    let row0 = routing.out_offsets[member];
    let ny_k = drdx_k.nrows();
    for route in &routing.routes[member] {
        if let Some(col0) = select(route.src) {
            for i in 0..route.size {
                let src = drdx_k.column(route.dst_offset + i);
                let mut dst = jac.slice_mut(s![row0..row0 + ny_k, col0 + i]);
                dst += &src;
            }
        }
    }
}

/// A tuple of residual components over a shared output vector.
///
/// The system's outputs are the concatenation of every member's outputs;
/// there is no elimination. Residual block `k` may consume any member's
/// outputs, so feedback loops are legal here — this is the construct that
/// closes cycles an explicit system must reject.
pub struct ImplicitSystem {
    name: String,
    argin: Vec<Variable>,
    /// Concatenation of every member's output variables.
    out_vars: Vec<Variable>,
    members: Vec<Box<dyn ImplicitEval>>,
    routing: Routing,
    comp_in: Vec<Vec<f64>>,
    cache: ImplicitSystemCache,
}

struct ImplicitSystemCache {
    x: Array1<f64>,
    y: Array1<f64>,
    r: Array1<f64>,
    drdx: Array2<f64>,
    drdy: Array2<f64>,
    state: Array1<f64>,
    r_valid: bool,
    dx_valid: bool,
    dy_valid: bool,
}

impl ImplicitSystemCache {
    fn sync_xy(&mut self, x: &[f64], y: &[f64]) -> bool {
        if self.x.as_slice().unwrap() == x && self.y.as_slice().unwrap() == y {
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

impl ImplicitSystem {
    pub fn builder(name: impl Into<String>) -> ImplicitSystemBuilder {
        ImplicitSystemBuilder {
            name: name.into(),
            members: Vec::new(),
            argin: Vec::new(),
        }
    }

    fn block(&self, k: usize) -> (usize, usize) {
        let off = self.routing.out_offsets[k];
        (off, off + self.members[k].ny())
    }
}

/// Builder for [`ImplicitSystem`].
pub struct ImplicitSystemBuilder {
    name: String,
    members: Vec<Box<dyn ImplicitEval>>,
    argin: Vec<Variable>,
}

impl ImplicitSystemBuilder {
    /// Register an implicit member.
    pub fn with_component(mut self, component: impl ImplicitEval + 'static) -> Self {
        self.members.push(Box::new(component));
        self
    }

    /// Register an explicit member; it joins the stack through its residual
    /// form `y − f(x)`.
    pub fn with_explicit_component(mut self, component: impl ExplicitEval + 'static) -> Self {
        self.members.push(Box::new(LiftedExplicit::new(component)));
        self
    }

    /// Declare the system's external inputs.
    pub fn with_argin(mut self, vars: impl IntoIterator<Item = Variable>) -> Self {
        self.argin.extend(vars);
        self
    }

    pub fn build(self) -> CoupledResult<ImplicitSystem> {
        let ios: Vec<ComponentIo<'_>> = self
            .members
            .iter()
            .map(|m| ComponentIo {
                name: m.name(),
                in_vars: m.in_vars(),
                out_vars: m.out_vars(),
            })
            .collect();
        let routing = build_routing(&ios, &self.argin, None, false)?;
        drop(ios);

        let out_vars: Vec<Variable> = self
            .members
            .iter()
            .flat_map(|m| m.out_vars().iter().cloned())
            .collect();
        let nx: usize = self.argin.iter().map(Variable::size).sum();
        let ny = routing.total_out;
        debug!(
            system = %self.name,
            members = self.members.len(),
            nx,
            ny,
            "compiled implicit system routing"
        );

        // Seed the warm-start state from the members' cached states.
        let mut state = Array1::zeros(ny);
        for (k, member) in self.members.iter().enumerate() {
            let off = routing.out_offsets[k];
            state
                .slice_mut(s![off..off + member.ny()])
                .assign(member.cached_state());
        }

        Ok(ImplicitSystem {
            comp_in: self.members.iter().map(|m| vec![0.0; m.nx()]).collect(),
            cache: ImplicitSystemCache {
                x: combine(&self.argin),
                y: state.clone(),
                r: Array1::zeros(ny),
                drdx: Array2::zeros((ny, nx)),
                drdy: Array2::zeros((ny, ny)),
                state,
                r_valid: false,
                dx_valid: false,
                dy_valid: false,
            },
            name: self.name,
            argin: self.argin,
            out_vars,
            members: self.members,
            routing,
        })
    }
}

impl ImplicitEval for ImplicitSystem {
    fn name(&self) -> &str {
        &self.name
    }

    fn in_vars(&self) -> &[Variable] {
        &self.argin
    }

    fn out_vars(&self) -> &[Variable] {
        &self.out_vars
    }

    fn eval_residuals(&self, x: &[f64], y: &[f64], r: &mut [f64]) -> CoupledResult<()> {
        check_flat_len(self.nx(), x.len())?;
        check_flat_len(self.ny(), y.len())?;
        check_flat_len(self.ny(), r.len())?;
        for (k, member) in self.members.iter().enumerate() {
            let mut xin = vec![0.0; member.nx()];
            self.routing.gather_inputs(k, x, y, &mut xin);
            let (lo, hi) = self.block(k);
            member.eval_residuals(&xin, &y[lo..hi], &mut r[lo..hi])?;
        }
        Ok(())
    }

    /// `∂r/∂x`: block row `k` is `∂r_k/∂x_k · P_{k,argin}`.
    fn eval_input_jacobian(
        &self,
        x: &[f64],
        y: &[f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()> {
        check_flat_len(self.nx(), x.len())?;
        check_flat_len(self.ny(), y.len())?;
        check_jacobian_shape(jac, self.ny(), self.nx())?;
        jac.fill(0.0);
        for (k, member) in self.members.iter().enumerate() {
            let mut xin = vec![0.0; member.nx()];
            self.routing.gather_inputs(k, x, y, &mut xin);
            let (lo, hi) = self.block(k);
            let drdx_k = member.input_jacobian(&xin, &y[lo..hi])?;
            scatter_member_drdx(&self.routing, k, &drdx_k, jac, |src| match src {
                SourceRef::Argin { offset } => Some(offset),
                SourceRef::Component { .. } => None,
            });
        }
        Ok(())
    }

    /// `∂r/∂y`: block `(k, k)` is `∂r_k/∂y_k`; block `(k, j)` adds
    /// `∂r_k/∂x_k · P_{kj}` for every input slice routed from member `j`.
    fn eval_output_jacobian(
        &self,
        x: &[f64],
        y: &[f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()> {
        check_flat_len(self.nx(), x.len())?;
        check_flat_len(self.ny(), y.len())?;
        check_jacobian_shape(jac, self.ny(), self.ny())?;
        jac.fill(0.0);
        for (k, member) in self.members.iter().enumerate() {
            let mut xin = vec![0.0; member.nx()];
            self.routing.gather_inputs(k, x, y, &mut xin);
            let (lo, hi) = self.block(k);
            let drdy_k = member.output_jacobian(&xin, &y[lo..hi])?;
            jac.slice_mut(s![lo..hi, lo..hi]).assign(&drdy_k);

            // Coupling through routed member outputs.
            if self.routing.routes[k]
                .iter()
                .any(|r| matches!(r.src, SourceRef::Component { .. }))
            {
                let drdx_k = member.input_jacobian(&xin, &y[lo..hi])?;
                let out_offsets = &self.routing.out_offsets;
                scatter_member_drdx(&self.routing, k, &drdx_k, jac, |src| match src {
                    SourceRef::Component { index, offset } => Some(out_offsets[index] + offset),
                    SourceRef::Argin { .. } => None,
                });
            }
        }
        Ok(())
    }

    fn update_residuals(&mut self, x: &[f64], y: &[f64]) -> CoupledResult<&Array1<f64>> {
        check_flat_len(self.nx(), x.len())?;
        check_flat_len(self.ny(), y.len())?;
        let changed = self.cache.sync_xy(x, y);
        if changed || !self.cache.r_valid {
            for (k, member) in self.members.iter_mut().enumerate() {
                self.routing.gather_inputs(k, x, y, &mut self.comp_in[k]);
                let off = self.routing.out_offsets[k];
                let hi = off + member.ny();
                let r_k = member.update_residuals(&self.comp_in[k], &y[off..hi])?;
                self.cache
                    .r
                    .slice_mut(s![off..hi])
                    .assign(r_k);
            }
            self.cache.r_valid = true;
        }
        Ok(&self.cache.r)
    }

    fn update_input_jacobian(&mut self, x: &[f64], y: &[f64]) -> CoupledResult<&Array2<f64>> {
        check_flat_len(self.nx(), x.len())?;
        check_flat_len(self.ny(), y.len())?;
        let changed = self.cache.sync_xy(x, y);
        if changed || !self.cache.dx_valid {
            self.cache.drdx.fill(0.0);
            for (k, member) in self.members.iter_mut().enumerate() {
                self.routing.gather_inputs(k, x, y, &mut self.comp_in[k]);
                let off = self.routing.out_offsets[k];
                let hi = off + member.ny();
                let drdx_k = member.update_input_jacobian(&self.comp_in[k], &y[off..hi])?;
                scatter_member_drdx(&self.routing, k, drdx_k, &mut self.cache.drdx, |src| {
                    match src {
                        SourceRef::Argin { offset } => Some(offset),
                        SourceRef::Component { .. } => None,
                    }
                });
            }
            self.cache.dx_valid = true;
        }
        Ok(&self.cache.drdx)
    }

    fn update_output_jacobian(&mut self, x: &[f64], y: &[f64]) -> CoupledResult<&Array2<f64>> {
        check_flat_len(self.nx(), x.len())?;
        check_flat_len(self.ny(), y.len())?;
        let changed = self.cache.sync_xy(x, y);
        if changed || !self.cache.dy_valid {
            self.cache.drdy.fill(0.0);
            for (k, member) in self.members.iter_mut().enumerate() {
                self.routing.gather_inputs(k, x, y, &mut self.comp_in[k]);
                let off = self.routing.out_offsets[k];
                let hi = off + member.ny();
                let drdy_k = member.update_output_jacobian(&self.comp_in[k], &y[off..hi])?;
                self.cache.drdy.slice_mut(s![off..hi, off..hi]).assign(drdy_k);

                if self.routing.routes[k]
                    .iter()
                    .any(|r| matches!(r.src, SourceRef::Component { .. }))
                {
                    let drdx_k =
                        member.update_input_jacobian(&self.comp_in[k], &y[off..hi])?;
                    let out_offsets = &self.routing.out_offsets;
                    scatter_member_drdx(&self.routing, k, drdx_k, &mut self.cache.drdy, |src| {
                        match src {
                            SourceRef::Component { index, offset } => {
                                Some(out_offsets[index] + offset)
                            }
                            SourceRef::Argin { .. } => None,
                        }
                    });
                }
            }
            self.cache.dy_valid = true;
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
        &self.cache.state
    }

    fn set_cached_state(&mut self, y: &[f64]) {
        self.cache.state.as_slice_mut().unwrap().copy_from_slice(y);
        for (k, member) in self.members.iter_mut().enumerate() {
            let off = self.routing.out_offsets[k];
            member.set_cached_state(&y[off..off + member.ny()]);
        }
    }

    fn invalidate(&mut self) {
        self.cache.r_valid = false;
        self.cache.dx_valid = false;
        self.cache.dy_valid = false;
    }

    fn invalidate_deep(&mut self) {
        self.invalidate();
        for member in &mut self.members {
            member.invalidate_deep();
        }
    }
}
