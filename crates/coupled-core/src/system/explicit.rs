//! Explicit systems: a validated DAG of components evaluated by forward
//! sweeps, with chain-rule Jacobian accumulation in forward or reverse mode.

use ndarray::linalg::general_mat_mul;
use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::component::{check_flat_len, check_jacobian_shape, ExplicitEval};
use crate::errors::CoupledResult;
use crate::system::routing::{build_routing, ComponentIo, Routing, SourceRef};
use crate::variable::{combine, Variable};

/// Jacobian accumulation mode.
///
/// Unless overridden, forward accumulation is chosen when `nx ≤ ny` and
/// reverse accumulation otherwise. Both modes agree up to floating-point
/// accumulation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Forward,
    Reverse,
}

/// Scratch buffers sized at build time and reused by every cached evaluation.
struct SystemScratch {
    /// Concatenation of every component's flat outputs.
    published: Vec<f64>,
    /// Per-component input gather buffers.
    comp_in: Vec<Vec<f64>>,
    /// Forward accumulation matrix `D`, shape `(nx + Σ ny_k, nx)`.
    dmat: Array2<f64>,
    /// Reverse adjoint matrix, shape `(ny, nx + Σ ny_k)`.
    adjoint: Array2<f64>,
    /// Row-gather workspace, shape `(max nx_k, nx)`.
    gather: Array2<f64>,
    /// Adjoint block copy, shape `(ny, max ny_k)`.
    adj_buf: Array2<f64>,
    /// Adjoint contribution workspace, shape `(ny, max nx_k)`.
    cbuf: Array2<f64>,
}

impl SystemScratch {
    fn new(components: &[Box<dyn ExplicitEval>], routing: &Routing, nx: usize, ny: usize) -> Self {
        let max_nx = components.iter().map(|c| c.nx()).max().unwrap_or(0);
        let max_ny = components.iter().map(|c| c.ny()).max().unwrap_or(0);
        let width = nx + routing.total_out;
        SystemScratch {
            published: vec![0.0; routing.total_out],
            comp_in: components.iter().map(|c| vec![0.0; c.nx()]).collect(),
            dmat: Array2::zeros((width, nx)),
            adjoint: Array2::zeros((ny, width)),
            gather: Array2::zeros((max_nx, nx)),
            adj_buf: Array2::zeros((ny, max_ny)),
            cbuf: Array2::zeros((ny, max_nx)),
        }
    }
}

struct SystemCache {
    x: Array1<f64>,
    y: Array1<f64>,
    jac: Array2<f64>,
    y_valid: bool,
    jac_valid: bool,
}

impl SystemCache {
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

/// Evaluate every component in declared order, publishing each output block.
///
/// With `with_jacobian` the per-component Jacobians are refreshed in the same
/// sweep, ready for accumulation.
fn sweep_cached(
    components: &mut [Box<dyn ExplicitEval>],
    routing: &Routing,
    published: &mut [f64],
    comp_in: &mut [Vec<f64>],
    x: &[f64],
    with_jacobian: bool,
) -> CoupledResult<()> {
    for (k, comp) in components.iter_mut().enumerate() {
        routing.gather_inputs(k, x, published, &mut comp_in[k]);
        if with_jacobian {
            comp.update_outputs_and_jacobian(&comp_in[k])?;
        } else {
            comp.update_outputs(&comp_in[k])?;
        }
        let off = routing.out_offsets[k];
        let y_k = comp.last_outputs();
        published[off..off + y_k.len()].copy_from_slice(y_k.as_slice().unwrap());
    }
    Ok(())
}

/// Cache-free forward sweep for the query variants.
fn sweep_pure(
    components: &[Box<dyn ExplicitEval>],
    routing: &Routing,
    x: &[f64],
    published: &mut [f64],
    mut jacs: Option<&mut [Array2<f64>]>,
) -> CoupledResult<()> {
    for (k, comp) in components.iter().enumerate() {
        let mut xin = vec![0.0; comp.nx()];
        routing.gather_inputs(k, x, published, &mut xin);
        let off = routing.out_offsets[k];
        let ny_k = comp.ny();
        match jacs.as_deref_mut() {
            Some(jacs) => comp.eval_outputs_and_jacobian(
                &xin,
                &mut published[off..off + ny_k],
                &mut jacs[k],
            )?,
            None => comp.eval_outputs(&xin, &mut published[off..off + ny_k])?,
        }
    }
    Ok(())
}

/// Forward accumulation: thread `D = ∂(published)/∂x` through the sweep.
///
/// The `argin` block of `D` is the identity; each component appends
/// `J_k · P_k · D` where `P_k` is its routing row-selector. The system
/// Jacobian is the `argout` row selection.
fn assemble_forward(
    routing: &Routing,
    nx: usize,
    jacs: &[&Array2<f64>],
    dmat: &mut Array2<f64>,
    gather: &mut Array2<f64>,
    jac_out: &mut Array2<f64>,
) {
    dmat.fill(0.0);
    for j in 0..nx {
        dmat[[j, j]] = 1.0;
    }
    for (k, jac_k) in jacs.iter().enumerate() {
        let (ny_k, nx_k) = jac_k.dim();
        {
            let mut g = gather.slice_mut(s![..nx_k, ..]);
            for route in &routing.routes[k] {
                for i in 0..route.size {
                    let src_row = match route.src {
                        SourceRef::Argin { offset } => offset + i,
                        SourceRef::Component { index, offset } => {
                            nx + routing.out_offsets[index] + offset + i
                        }
                    };
                    g.row_mut(route.dst_offset + i).assign(&dmat.row(src_row));
                }
            }
        }
        let row0 = nx + routing.out_offsets[k];
        general_mat_mul(
            1.0,
            jac_k,
            &gather.slice(s![..nx_k, ..]),
            0.0,
            &mut dmat.slice_mut(s![row0..row0 + ny_k, ..]),
        );
    }
    for a in &routing.argout {
        for i in 0..a.size {
            let src_row = nx + routing.out_offsets[a.component] + a.offset + i;
            jac_out.row_mut(a.dst_offset + i).assign(&dmat.row(src_row));
        }
    }
}

/// Reverse accumulation: seed the adjoint with the `argout` row selector and
/// sweep the components backwards, summing fan-in contributions.
fn assemble_reverse(
    routing: &Routing,
    nx: usize,
    jacs: &[&Array2<f64>],
    adjoint: &mut Array2<f64>,
    adj_buf: &mut Array2<f64>,
    cbuf: &mut Array2<f64>,
    jac_out: &mut Array2<f64>,
) {
    adjoint.fill(0.0);
    for a in &routing.argout {
        for i in 0..a.size {
            let col = nx + routing.out_offsets[a.component] + a.offset + i;
            adjoint[[a.dst_offset + i, col]] = 1.0;
        }
    }
    for k in (0..jacs.len()).rev() {
        let jac_k = jacs[k];
        let (ny_k, nx_k) = jac_k.dim();
        let col0 = nx + routing.out_offsets[k];
        adj_buf
            .slice_mut(s![.., ..ny_k])
            .assign(&adjoint.slice(s![.., col0..col0 + ny_k]));
        general_mat_mul(
            1.0,
            &adj_buf.slice(s![.., ..ny_k]),
            jac_k,
            0.0,
            &mut cbuf.slice_mut(s![.., ..nx_k]),
        );
        for route in &routing.routes[k] {
            for i in 0..route.size {
                let src_col = match route.src {
                    SourceRef::Argin { offset } => offset + i,
                    SourceRef::Component { index, offset } => {
                        nx + routing.out_offsets[index] + offset + i
                    }
                };
                let src = cbuf.column(route.dst_offset + i);
                let mut dst = adjoint.column_mut(src_col);
                dst += &src;
            }
        }
    }
    jac_out.assign(&adjoint.slice(s![.., ..nx]));
}

fn gather_argout(routing: &Routing, published: &[f64], y: &mut [f64]) {
    for a in &routing.argout {
        let src = routing.out_offsets[a.component] + a.offset;
        y[a.dst_offset..a.dst_offset + a.size].copy_from_slice(&published[src..src + a.size]);
    }
}

/// A DAG of explicit components with declared external inputs and outputs.
///
/// Satisfies [`ExplicitEval`] itself, so systems nest arbitrarily.
pub struct ExplicitSystem {
    name: String,
    argin: Vec<Variable>,
    argout: Vec<Variable>,
    components: Vec<Box<dyn ExplicitEval>>,
    routing: Routing,
    mode: Option<Mode>,
    scratch: SystemScratch,
    cache: SystemCache,
}

impl ExplicitSystem {
    pub fn builder(name: impl Into<String>) -> ExplicitSystemBuilder {
        ExplicitSystemBuilder {
            name: name.into(),
            components: Vec::new(),
            argin: Vec::new(),
            argout: Vec::new(),
            mode: None,
        }
    }

    /// The accumulation mode that will be used for the next Jacobian call.
    pub fn mode(&self) -> Mode {
        match self.mode {
            Some(mode) => mode,
            None => {
                if self.nx() <= self.ny() {
                    Mode::Forward
                } else {
                    Mode::Reverse
                }
            }
        }
    }

    fn assemble(
        routing: &Routing,
        mode: Mode,
        nx: usize,
        jacs: &[&Array2<f64>],
        scratch: &mut SystemScratch,
        jac_out: &mut Array2<f64>,
    ) {
        match mode {
            Mode::Forward => {
                assemble_forward(routing, nx, jacs, &mut scratch.dmat, &mut scratch.gather, jac_out)
            }
            Mode::Reverse => assemble_reverse(
                routing,
                nx,
                jacs,
                &mut scratch.adjoint,
                &mut scratch.adj_buf,
                &mut scratch.cbuf,
                jac_out,
            ),
        }
    }
}

/// Builder for [`ExplicitSystem`].
pub struct ExplicitSystemBuilder {
    name: String,
    components: Vec<Box<dyn ExplicitEval>>,
    argin: Vec<Variable>,
    argout: Vec<Variable>,
    mode: Option<Mode>,
}

impl ExplicitSystemBuilder {
    /// Register an inner component. Declaration order is evaluation order.
    pub fn with_component(mut self, component: impl ExplicitEval + 'static) -> Self {
        self.components.push(Box::new(component));
        self
    }

    /// Register an already-boxed inner component.
    pub fn with_boxed_component(mut self, component: Box<dyn ExplicitEval>) -> Self {
        self.components.push(component);
        self
    }

    /// Declare the system's external inputs.
    pub fn with_argin(mut self, vars: impl IntoIterator<Item = Variable>) -> Self {
        self.argin.extend(vars);
        self
    }

    /// Declare the system's external outputs; each must be produced by an
    /// inner component.
    pub fn with_argout(mut self, vars: impl IntoIterator<Item = Variable>) -> Self {
        self.argout.extend(vars);
        self
    }

    /// Force the Jacobian accumulation mode instead of the `nx ≤ ny` policy.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn build(self) -> CoupledResult<ExplicitSystem> {
        let ios: Vec<ComponentIo<'_>> = self
            .components
            .iter()
            .map(|c| ComponentIo {
                name: c.name(),
                in_vars: c.in_vars(),
                out_vars: c.out_vars(),
            })
            .collect();
        let routing = build_routing(&ios, &self.argin, Some(&self.argout), true)?;
        drop(ios);

        let nx: usize = self.argin.iter().map(Variable::size).sum();
        let ny: usize = self.argout.iter().map(Variable::size).sum();
        debug!(
            system = %self.name,
            components = self.components.len(),
            nx,
            ny,
            published = routing.total_out,
            "compiled explicit system routing"
        );

        let scratch = SystemScratch::new(&self.components, &routing, nx, ny);
        Ok(ExplicitSystem {
            cache: SystemCache {
                x: combine(&self.argin),
                y: combine(&self.argout),
                jac: Array2::zeros((ny, nx)),
                y_valid: false,
                jac_valid: false,
            },
            name: self.name,
            argin: self.argin,
            argout: self.argout,
            components: self.components,
            routing,
            mode: self.mode,
            scratch,
        })
    }
}

impl ExplicitEval for ExplicitSystem {
    fn name(&self) -> &str {
        &self.name
    }

    fn in_vars(&self) -> &[Variable] {
        &self.argin
    }

    fn out_vars(&self) -> &[Variable] {
        &self.argout
    }

    fn eval_outputs(&self, x: &[f64], y: &mut [f64]) -> CoupledResult<()> {
        check_flat_len(self.nx(), x.len())?;
        let mut published = vec![0.0; self.routing.total_out];
        sweep_pure(&self.components, &self.routing, x, &mut published, None)?;
        gather_argout(&self.routing, &published, y);
        Ok(())
    }

    fn eval_jacobian(&self, x: &[f64], jac: &mut Array2<f64>) -> CoupledResult<()> {
        check_flat_len(self.nx(), x.len())?;
        check_jacobian_shape(jac, self.ny(), self.nx())?;
        let mut published = vec![0.0; self.routing.total_out];
        let mut jacs: Vec<Array2<f64>> = self
            .components
            .iter()
            .map(|c| Array2::zeros((c.ny(), c.nx())))
            .collect();
        sweep_pure(&self.components, &self.routing, x, &mut published, Some(&mut jacs))?;
        let jac_refs: Vec<&Array2<f64>> = jacs.iter().collect();
        let mut scratch = SystemScratch::new(&self.components, &self.routing, self.nx(), self.ny());
        Self::assemble(&self.routing, self.mode(), self.nx(), &jac_refs, &mut scratch, jac);
        Ok(())
    }

    fn eval_outputs_and_jacobian(
        &self,
        x: &[f64],
        y: &mut [f64],
        jac: &mut Array2<f64>,
    ) -> CoupledResult<()> {
        self.eval_jacobian(x, jac)?;
        self.eval_outputs(x, y)
    }

    fn update_outputs(&mut self, x: &[f64]) -> CoupledResult<&Array1<f64>> {
        check_flat_len(self.nx(), x.len())?;
        let changed = self.cache.sync_x(x);
        if changed || !self.cache.y_valid {
            let Self {
                components,
                routing,
                scratch,
                cache,
                ..
            } = self;
            sweep_cached(
                components,
                routing,
                &mut scratch.published,
                &mut scratch.comp_in,
                x,
                false,
            )?;
            gather_argout(routing, &scratch.published, cache.y.as_slice_mut().unwrap());
            cache.y_valid = true;
        }
        Ok(&self.cache.y)
    }

    fn update_jacobian(&mut self, x: &[f64]) -> CoupledResult<&Array2<f64>> {
        check_flat_len(self.nx(), x.len())?;
        let changed = self.cache.sync_x(x);
        if changed || !self.cache.jac_valid {
            let nx = self.nx();
            let mode = self.mode();
            let Self {
                components,
                routing,
                scratch,
                cache,
                ..
            } = self;
            sweep_cached(
                components,
                routing,
                &mut scratch.published,
                &mut scratch.comp_in,
                x,
                true,
            )?;
            let jac_refs: Vec<&Array2<f64>> =
                components.iter().map(|c| c.last_jacobian()).collect();
            Self::assemble(routing, mode, nx, &jac_refs, scratch, &mut cache.jac);
            gather_argout(routing, &scratch.published, cache.y.as_slice_mut().unwrap());
            cache.y_valid = true;
            cache.jac_valid = true;
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
    }

    fn invalidate_deep(&mut self) {
        self.invalidate();
        for comp in &mut self.components {
            comp.invalidate_deep();
        }
    }
}
