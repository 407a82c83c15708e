//! Compose multidisciplinary numerical models as a directed graph of
//! components and assemble their outputs and Jacobians.
//!
//! A [`ExplicitComponent`](explicit::ExplicitComponent) wraps an output
//! mapping `y = f(x)`; an [`ImplicitComponent`](implicit::ImplicitComponent)
//! wraps a residual relation `r(x, y) = 0`. Components aggregate into
//! [`ExplicitSystem`](system::ExplicitSystem)s (an acyclic routing of outputs
//! to inputs, with chain-rule Jacobian accumulation in forward or reverse
//! mode) and [`ImplicitSystem`](system::ImplicitSystem)s (a residual stack in
//! which feedback loops are legal). Systems satisfy the component contract,
//! so they nest. A [`SolvedComponent`](solver::SolvedComponent) turns any
//! residual network back into an explicit component via damped Newton
//! iteration, with the Jacobian recovered through the implicit function
//! theorem.
//!
//! Jacobians come from pluggable providers
//! ([`DerivKind`](derivatives::DerivKind)): analytic callbacks, forward- or
//! reverse-mode AD over a generic primal, one-sided or central finite
//! differences, or the complex step.
//!
//! # Evaluation variants
//!
//! Every evaluation operation follows one naming ladder, documented on
//! [`ExplicitEval`](component::ExplicitEval) and
//! [`ImplicitEval`](component::ImplicitEval):
//!
//! | variant | behavior |
//! |---|---|
//! | `op(&self, x)` | fresh allocation, caches untouched |
//! | `op_into(&mut self, buf, x)` | caller buffer + cache update |
//! | `update_op(&mut self, x)` | cache update if stale, reference returned |
//! | `refresh_op(&mut self, x)` | forced recomputation |
//! | `last_op(&self)` | cached value, no recomputation |
//! | `refresh_op_deep(&mut self, x)` | systems: forced recomputation of all inner caches |

pub mod component;
pub mod derivatives;
pub mod dual;
pub mod errors;
mod example_components;
pub mod explicit;
pub mod implicit;
pub mod reverse;
pub mod scalar;
pub mod solver;
pub mod system;
pub mod tape;
pub mod utils;
pub mod variable;

pub use component::{Evaluate, EvaluateResidual, ExplicitEval, ImplicitEval};
pub use derivatives::DerivKind;
pub use errors::{CoupledError, CoupledResult};
pub use explicit::ExplicitComponent;
pub use implicit::{ImplicitComponent, LiftedExplicit};
pub use solver::{NewtonOptions, SolvedComponent};
pub use system::{ExplicitSystem, ImplicitSystem, Mode};
pub use variable::{combine, combine_into, declare, separate, separate_mut, VarLayout, Variable};
