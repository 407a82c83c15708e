#![allow(dead_code)]

//! Small components used across the test suite.

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn};

use crate::component::Evaluate;
use crate::derivatives::DerivKind;
use crate::errors::CoupledResult;
use crate::explicit::ExplicitComponent;
use crate::scalar::Scalar;
use crate::variable::declare;

/// `f_p = (x − 3)² + x·y + (y + 4)² − 3`; value 22 at the origin.
pub(crate) const PARABOLOID_AT_ORIGIN: f64 = 22.0;

pub(crate) struct Paraboloid;

impl Evaluate for Paraboloid {
    fn evaluate<T: Scalar>(
        &self,
        _out_mut: &mut [ArrayViewMutD<'_, T>],
        inputs: &[ArrayViewD<'_, T>],
    ) -> CoupledResult<Vec<ArrayD<T>>> {
        let x = inputs[0][[0]];
        let y = inputs[1][[0]];
        let three = T::from_f64(3.0);
        let four = T::from_f64(4.0);
        let f = (x - three).powi(2) + x * y + (y + four).powi(2) - three;
        Ok(vec![ArrayD::from_elem(IxDyn(&[1]), f)])
    }
}

pub(crate) fn paraboloid(deriv: DerivKind) -> ExplicitComponent {
    ExplicitComponent::builder("paraboloid")
        .with_function(Paraboloid)
        .with_inputs([declare("x", 0.0), declare("y", 0.0)])
        .with_outputs([declare("f_p", 0.0)])
        .with_deriv(deriv)
        .build()
        .expect("paraboloid component is well formed")
}

/// The paraboloid with a hand-written Jacobian instead of a numeric provider.
pub(crate) fn paraboloid_analytic() -> ExplicitComponent {
    ExplicitComponent::builder("paraboloid")
        .with_function(Paraboloid)
        .with_jacobian_fn(|jac, inputs| {
            let x = inputs[0][[0]];
            let y = inputs[1][[0]];
            jac[[0, 0]] = 2.0 * (x - 3.0) + y;
            jac[[0, 1]] = x + 2.0 * (y + 4.0);
            Ok(())
        })
        .with_inputs([declare("x", 0.0), declare("y", 0.0)])
        .with_outputs([declare("f_p", 0.0)])
        .with_deriv(DerivKind::Analytic)
        .build()
        .expect("paraboloid component is well formed")
}

/// `f_q = a·f_p² + (b + c)·f_p + 1`
pub(crate) struct Quadratic;

impl Evaluate for Quadratic {
    fn evaluate<T: Scalar>(
        &self,
        _out_mut: &mut [ArrayViewMutD<'_, T>],
        inputs: &[ArrayViewD<'_, T>],
    ) -> CoupledResult<Vec<ArrayD<T>>> {
        let fp = inputs[0][[0]];
        let a = inputs[1][[0]];
        let b = inputs[2][[0]];
        let c = inputs[3][[0]];
        let fq = a * fp.powi(2) + (b + c) * fp + T::one();
        Ok(vec![ArrayD::from_elem(IxDyn(&[1]), fq)])
    }
}

pub(crate) fn quadratic(deriv: DerivKind) -> ExplicitComponent {
    ExplicitComponent::builder("quadratic")
        .with_function(Quadratic)
        .with_inputs([
            declare("f_p", 0.0),
            declare("a", 1.0),
            declare("b", 1.0),
            declare("c", 1.0),
        ])
        .with_outputs([declare("f_q", 0.0)])
        .with_deriv(deriv)
        .build()
        .expect("quadratic component is well formed")
}

/// `(sin f_p, cos f_q)`
pub(crate) struct Trig;

impl Evaluate for Trig {
    fn evaluate<T: Scalar>(
        &self,
        _out_mut: &mut [ArrayViewMutD<'_, T>],
        inputs: &[ArrayViewD<'_, T>],
    ) -> CoupledResult<Vec<ArrayD<T>>> {
        let fp = inputs[0][[0]];
        let fq = inputs[1][[0]];
        Ok(vec![
            ArrayD::from_elem(IxDyn(&[1]), fp.sin()),
            ArrayD::from_elem(IxDyn(&[1]), fq.cos()),
        ])
    }
}

pub(crate) fn trig(deriv: DerivKind) -> ExplicitComponent {
    ExplicitComponent::builder("trig")
        .with_function(Trig)
        .with_inputs([declare("f_p", 0.0), declare("f_q", 0.0)])
        .with_outputs([declare("sin_fp", 0.0), declare("cos_fq", 0.0)])
        .with_deriv(deriv)
        .build()
        .expect("trig component is well formed")
}
