//! Three-component chain: paraboloid → quadratic → trig.

use approx::assert_relative_eq;

use crate::component::ExplicitEval;
use crate::derivatives::DerivKind;
use crate::example_components::{paraboloid, quadratic, trig};
use crate::system::{ExplicitSystem, Mode};
use crate::variable::declare;

fn chain(mode: Option<Mode>) -> ExplicitSystem {
    let mut builder = ExplicitSystem::builder("chain")
        .with_component(paraboloid(DerivKind::ForwardAd))
        .with_component(quadratic(DerivKind::ForwardAd))
        .with_component(trig(DerivKind::ForwardAd))
        .with_argin([
            declare("x", 0.0),
            declare("y", 0.0),
            declare("a", 1.0),
            declare("b", 1.0),
            declare("c", 1.0),
        ])
        .with_argout([declare("sin_fp", 0.0), declare("cos_fq", 0.0)]);
    if let Some(mode) = mode {
        builder = builder.with_mode(mode);
    }
    builder.build().unwrap()
}

const X: [f64; 5] = [0.7, -0.4, 1.3, 0.5, -0.2];

fn reference_values(x: &[f64]) -> (f64, f64) {
    let fp = (x[0] - 3.0).powi(2) + x[0] * x[1] + (x[1] + 4.0).powi(2) - 3.0;
    let fq = x[2] * fp * fp + (x[3] + x[4]) * fp + 1.0;
    (fp, fq)
}

#[test]
fn test_forward_sweep_values() {
    let system = chain(None);
    let (fp, fq) = reference_values(&X);
    let y = system.outputs(&X).unwrap();
    assert_relative_eq!(y[0], fp.sin(), max_relative = 1e-14);
    assert_relative_eq!(y[1], fq.cos(), max_relative = 1e-14);
}

#[test]
fn test_forward_and_reverse_modes_agree() {
    let forward = chain(Some(Mode::Forward)).jacobian(&X).unwrap();
    let reverse = chain(Some(Mode::Reverse)).jacobian(&X).unwrap();
    assert_relative_eq!(forward, reverse, max_relative = 1e-12);
}

#[test]
fn test_jacobian_against_hand_chain_rule() {
    let (fp, fq) = reference_values(&X);
    let dfp_dx = 2.0 * (X[0] - 3.0) + X[1];
    let dfq_dfp = 2.0 * X[2] * fp + X[3] + X[4];

    let jac = chain(None).jacobian(&X).unwrap();
    // d(sin fp)/dx
    assert_relative_eq!(jac[[0, 0]], fp.cos() * dfp_dx, max_relative = 1e-12);
    // d(cos fq)/da = -sin(fq) · fp²
    assert_relative_eq!(jac[[1, 2]], -fq.sin() * fp * fp, max_relative = 1e-12);
    // d(cos fq)/dx threads through both inner components
    assert_relative_eq!(
        jac[[1, 0]],
        -fq.sin() * dfq_dfp * dfp_dx,
        max_relative = 1e-12
    );
}

#[test]
fn test_mode_policy_prefers_reverse_for_wide_systems() {
    // Five inputs, two outputs.
    let system = chain(None);
    assert_eq!(system.mode(), Mode::Reverse);
    let forced = chain(Some(Mode::Forward));
    assert_eq!(forced.mode(), Mode::Forward);
}

#[test]
fn test_cached_and_query_jacobians_agree() {
    let mut system = chain(None);
    let query = system.jacobian(&X).unwrap();
    let cached = system.update_jacobian(&X).unwrap();
    assert_relative_eq!(query, *cached, max_relative = 1e-14);
}

#[test]
fn test_fan_out_of_one_output_to_many_consumers() {
    // Both consumers read the same upstream output; reverse mode must sum the
    // adjoint contributions (fan-in), forward mode replicates rows.
    let jac_f = chain(Some(Mode::Forward)).jacobian(&X).unwrap();
    let (fp, fq) = reference_values(&X);
    let dfp_dy = X[0] + 2.0 * (X[1] + 4.0);
    let dfq_dfp = 2.0 * X[2] * fp + X[3] + X[4];
    assert_relative_eq!(jac_f[[0, 1]], fp.cos() * dfp_dy, max_relative = 1e-12);
    assert_relative_eq!(
        jac_f[[1, 1]],
        -fq.sin() * dfq_dfp * dfp_dy,
        max_relative = 1e-12
    );
}

#[test]
fn test_mixed_providers_inside_one_system() {
    let system = ExplicitSystem::builder("mixed")
        .with_component(paraboloid(DerivKind::CentralFd))
        .with_component(quadratic(DerivKind::ReverseAd))
        .with_component(trig(DerivKind::ComplexStep))
        .with_argin([
            declare("x", 0.0),
            declare("y", 0.0),
            declare("a", 1.0),
            declare("b", 1.0),
            declare("c", 1.0),
        ])
        .with_argout([declare("sin_fp", 0.0), declare("cos_fq", 0.0)])
        .build()
        .unwrap();
    let exact = chain(None).jacobian(&X).unwrap();
    let mixed = system.jacobian(&X).unwrap();
    assert_relative_eq!(mixed, exact, max_relative = 1e-6);
}
