//! Systems satisfy the component contract, so they nest.

use approx::assert_relative_eq;

use crate::component::ExplicitEval;
use crate::derivatives::DerivKind;
use crate::example_components::{paraboloid, quadratic};
use crate::implicit::LiftedExplicit;
use crate::solver::{NewtonOptions, SolvedComponent};
use crate::system::{ExplicitSystem, ImplicitSystem, Mode};
use crate::variable::declare;

/// An inner system computing `f_q` from `(x, y, a, b, c)`.
fn inner_system() -> ExplicitSystem {
    ExplicitSystem::builder("inner")
        .with_component(paraboloid(DerivKind::ForwardAd))
        .with_component(quadratic(DerivKind::ForwardAd))
        .with_argin([
            declare("x", 0.0),
            declare("y", 0.0),
            declare("a", 1.0),
            declare("b", 1.0),
            declare("c", 1.0),
        ])
        .with_argout([declare("f_q", 0.0)])
        .build()
        .unwrap()
}

#[test]
fn test_explicit_system_nests_in_explicit_system() {
    // The outer system wires the inner system to another quadratic stage
    // consuming f_q as its abscissa.
    let stage = crate::explicit::ExplicitComponent::builder("stage")
        .with_function(crate::example_components::Quadratic)
        .with_inputs([
            declare("f_q", 0.0),
            declare("a", 1.0),
            declare("b", 1.0),
            declare("c", 1.0),
        ])
        .with_outputs([declare("g", 0.0)])
        .with_deriv(DerivKind::ForwardAd)
        .build()
        .unwrap();

    let outer = ExplicitSystem::builder("outer")
        .with_component(inner_system())
        .with_boxed_component(Box::new(stage))
        .with_argin([
            declare("x", 0.0),
            declare("y", 0.0),
            declare("a", 1.0),
            declare("b", 1.0),
            declare("c", 1.0),
        ])
        .with_argout([declare("g", 0.0)])
        .build()
        .unwrap();

    let x: [f64; 5] = [0.7, -0.4, 1.3, 0.5, -0.2];
    let fp = (x[0] - 3.0).powi(2) + x[0] * x[1] + (x[1] + 4.0).powi(2) - 3.0;
    let fq = x[2] * fp * fp + (x[3] + x[4]) * fp + 1.0;
    let g = x[2] * fq * fq + (x[3] + x[4]) * fq + 1.0;

    let y = outer.outputs(&x).unwrap();
    assert_relative_eq!(y[0], g, max_relative = 1e-13);

    // Both accumulation modes thread through the nested system.
    let jac_f = ExplicitSystem::builder("outer-f")
        .with_component(inner_system())
        .with_component(
            crate::explicit::ExplicitComponent::builder("stage")
                .with_function(crate::example_components::Quadratic)
                .with_inputs([
                    declare("f_q", 0.0),
                    declare("a", 1.0),
                    declare("b", 1.0),
                    declare("c", 1.0),
                ])
                .with_outputs([declare("g", 0.0)])
                .with_deriv(DerivKind::ForwardAd)
                .build()
                .unwrap(),
        )
        .with_argin([
            declare("x", 0.0),
            declare("y", 0.0),
            declare("a", 1.0),
            declare("b", 1.0),
            declare("c", 1.0),
        ])
        .with_argout([declare("g", 0.0)])
        .with_mode(Mode::Forward)
        .build()
        .unwrap()
        .jacobian(&x)
        .unwrap();
    let jac_r = outer.jacobian(&x).unwrap();
    assert_relative_eq!(jac_f, jac_r, max_relative = 1e-11);
}

#[test]
fn test_solved_implicit_system_nests_in_explicit_system() {
    // Close a feedback loop u = 0.5·v + x, v = 0.5·u with Newton, then use
    // the solved pair downstream. The fixed point is u = 4x/3, v = 2x/3.
    use crate::component::Evaluate;
    use crate::errors::CoupledResult;
    use crate::scalar::Scalar;
    use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn};

    struct Half {
        offset: bool,
    }
    impl Evaluate for Half {
        fn evaluate<T: Scalar>(
            &self,
            _out_mut: &mut [ArrayViewMutD<'_, T>],
            inputs: &[ArrayViewD<'_, T>],
        ) -> CoupledResult<Vec<ArrayD<T>>> {
            let half = T::from_f64(0.5);
            let mut v = inputs[0][[0]] * half;
            if self.offset {
                v += inputs[1][[0]];
            }
            Ok(vec![ArrayD::from_elem(IxDyn(&[1]), v)])
        }
    }

    let u_comp = crate::explicit::ExplicitComponent::builder("u")
        .with_function(Half { offset: true })
        .with_inputs([declare("v", 0.0), declare("x", 0.0)])
        .with_outputs([declare("u", 0.0)])
        .with_deriv(DerivKind::ForwardAd)
        .build()
        .unwrap();
    let v_comp = crate::explicit::ExplicitComponent::builder("v")
        .with_function(Half { offset: false })
        .with_inputs([declare("u", 0.0)])
        .with_outputs([declare("v", 0.0)])
        .with_deriv(DerivKind::ForwardAd)
        .build()
        .unwrap();

    let loop_system = ImplicitSystem::builder("loop")
        .with_explicit_component(u_comp)
        .with_explicit_component(v_comp)
        .with_argin([declare("x", 0.0)])
        .build()
        .unwrap();
    let solved = SolvedComponent::new(loop_system, NewtonOptions::default());

    let outer = ExplicitSystem::builder("outer")
        .with_component(solved)
        .with_argin([declare("x", 0.0)])
        .with_argout([declare("u", 0.0), declare("v", 0.0)])
        .build()
        .unwrap();

    let y = outer.outputs(&[3.0]).unwrap();
    assert_relative_eq!(y[0], 4.0, max_relative = 1e-9);
    assert_relative_eq!(y[1], 2.0, max_relative = 1e-9);

    let jac = outer.jacobian(&[3.0]).unwrap();
    assert_relative_eq!(jac[[0, 0]], 4.0 / 3.0, max_relative = 1e-9);
    assert_relative_eq!(jac[[1, 0]], 2.0 / 3.0, max_relative = 1e-9);
}

#[test]
fn test_lifted_system_round_trip() {
    // Lifting an explicit system and solving it back reproduces the system.
    let lifted = LiftedExplicit::new(inner_system());
    let solved = SolvedComponent::new(lifted, NewtonOptions::default());
    let mut solved = solved;

    let x = [0.7, -0.4, 1.3, 0.5, -0.2];
    let direct_sys = inner_system();
    let direct = direct_sys.outputs(&x).unwrap();
    let via_newton = solved.update_outputs(&x).unwrap();
    assert_relative_eq!(direct[0], via_newton[0], max_relative = 1e-9);

    let jac_direct = direct_sys.jacobian(&x).unwrap();
    let jac_newton = solved.update_jacobian(&x).unwrap();
    assert_relative_eq!(jac_direct, *jac_newton, max_relative = 1e-8);
}
