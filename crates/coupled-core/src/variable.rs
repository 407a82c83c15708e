//! Named, shaped variables and the flat packing layer.
//!
//! Every evaluation entry point in this crate works on contiguous flat
//! vectors. A [`Variable`] pairs a name with a *default* value whose shape and
//! element count fix the variable's layout; a [`VarLayout`] enumerates the
//! contiguous `[offset, offset + size)` spans that an ordered tuple of
//! variables occupies inside a flat vector.
//!
//! Two variables are equal iff their names match. A variable carries no value
//! at evaluation time, only a layout descriptor; the default is used to size
//! buffers and to seed component caches.
//!
//! The packing operations come in pairs:
//!
//! - [`combine`] / [`combine_into`]: defaults → flat vector,
//! - [`separate`] / [`separate_mut`]: flat vector → per-variable shaped views.
//!
//! Layout order always equals declaration order; names are never sorted.

use ndarray::{arr0, Array1, ArrayD, ArrayViewD, ArrayViewMutD, IxDyn};
use std::hash::{Hash, Hasher};

use crate::errors::{CoupledError, CoupledResult};

/// A named value with a default that fixes its shape and element count.
///
/// Scalar variables are canonicalized to shape `[1]` so that a separated view
/// is always an indexable one-element sequence.
#[derive(Debug, Clone)]
pub struct Variable {
    name: String,
    default: ArrayD<f64>,
}

impl Variable {
    /// Declare a scalar variable. The default is stored with shape `[1]`.
    pub fn scalar(name: impl Into<String>, default: f64) -> Self {
        Self {
            name: name.into(),
            default: arr0(default).into_dyn().into_shape_with_order(IxDyn(&[1])).unwrap(),
        }
    }

    /// Declare a 1-D variable from a sequence of defaults.
    pub fn vector(name: impl Into<String>, default: impl Into<Vec<f64>>) -> Self {
        Self {
            name: name.into(),
            default: Array1::from_vec(default.into()).into_dyn(),
        }
    }

    /// Declare a variable from an arbitrary rectangular default array.
    pub fn array(name: impl Into<String>, default: ArrayD<f64>) -> Self {
        Self {
            name: name.into(),
            default,
        }
    }

    /// The variable's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The default value.
    pub fn default(&self) -> &ArrayD<f64> {
        &self.default
    }

    /// The shape of the default value.
    pub fn shape(&self) -> &[usize] {
        self.default.shape()
    }

    /// Number of flat elements (product of the shape dimensions).
    pub fn size(&self) -> usize {
        self.default.len()
    }
}

// Identity is by name only: the same name declared with different defaults
// refers to the same variable when routed between components.
impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Variable {}

impl Hash for Variable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// Declare a variable from anything convertible to a default value.
///
/// ```
/// use coupled_core::variable::declare;
///
/// let x = declare("x", 1.5);
/// let v = declare("v", vec![0.0; 4]);
/// assert_eq!(x.size(), 1);
/// assert_eq!(v.size(), 4);
/// ```
pub fn declare(name: impl Into<String>, default: impl IntoDefault) -> Variable {
    Variable {
        name: name.into(),
        default: default.into_default(),
    }
}

/// Conversion into a default value for [`declare`].
pub trait IntoDefault {
    fn into_default(self) -> ArrayD<f64>;
}

impl IntoDefault for f64 {
    fn into_default(self) -> ArrayD<f64> {
        arr0(self)
            .into_dyn()
            .into_shape_with_order(IxDyn(&[1]))
            .unwrap()
    }
}

impl IntoDefault for Vec<f64> {
    fn into_default(self) -> ArrayD<f64> {
        Array1::from_vec(self).into_dyn()
    }
}

impl IntoDefault for &[f64] {
    fn into_default(self) -> ArrayD<f64> {
        Array1::from_vec(self.to_vec()).into_dyn()
    }
}

impl IntoDefault for ArrayD<f64> {
    fn into_default(self) -> ArrayD<f64> {
        self
    }
}

impl IntoDefault for Array1<f64> {
    fn into_default(self) -> ArrayD<f64> {
        self.into_dyn()
    }
}

/// A contiguous index range inside a flat vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub offset: usize,
    pub size: usize,
}

impl Span {
    /// One past the last index of the span.
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// The layout of an ordered tuple of variables inside a flat vector.
///
/// Computed once at construction and never mutated.
#[derive(Debug, Clone)]
pub struct VarLayout {
    spans: Vec<Span>,
    shapes: Vec<Vec<usize>>,
    width: usize,
}

impl VarLayout {
    /// Compute the layout for `vars` in declaration order.
    pub fn new(vars: &[Variable]) -> Self {
        let mut spans = Vec::with_capacity(vars.len());
        let mut shapes = Vec::with_capacity(vars.len());
        let mut offset = 0;
        for var in vars {
            let size = var.size();
            spans.push(Span { offset, size });
            shapes.push(var.shape().to_vec());
            offset += size;
        }
        Self {
            spans,
            shapes,
            width: offset,
        }
    }

    /// Total flat width (sum of all variable sizes).
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of variables in the tuple.
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// The span of the `i`-th variable.
    pub fn span(&self, i: usize) -> Span {
        self.spans[i]
    }

    /// The shape of the `i`-th variable.
    pub fn shape(&self, i: usize) -> &[usize] {
        &self.shapes[i]
    }

    /// Borrow a shaped view of the `i`-th variable out of a flat slice.
    pub fn view_of<'a, T>(&self, i: usize, flat: &'a [T]) -> ArrayViewD<'a, T> {
        let span = self.spans[i];
        ArrayViewD::from_shape(IxDyn(&self.shapes[i]), &flat[span.offset..span.end()])
            .expect("layout spans are consistent with shapes")
    }

    /// Borrow a mutable shaped view of the `i`-th variable out of a flat slice.
    pub fn view_of_mut<'a, T>(&self, i: usize, flat: &'a mut [T]) -> ArrayViewMutD<'a, T> {
        let span = self.spans[i];
        ArrayViewMutD::from_shape(IxDyn(&self.shapes[i]), &mut flat[span.offset..span.end()])
            .expect("layout spans are consistent with shapes")
    }

    fn check_width(&self, actual: usize) -> CoupledResult<()> {
        if actual < self.width {
            return Err(CoupledError::SizeMismatch {
                expected: self.width,
                actual,
            });
        }
        Ok(())
    }

    /// Produce per-variable shaped views into `flat`, in declaration order.
    ///
    /// Fails with [`CoupledError::SizeMismatch`] if `flat` is shorter than the
    /// layout width. Extra trailing elements are ignored.
    pub fn separate<'a, T>(&self, flat: &'a [T]) -> CoupledResult<Vec<ArrayViewD<'a, T>>> {
        self.check_width(flat.len())?;
        Ok((0..self.len()).map(|i| self.view_of(i, flat)).collect())
    }

    /// Mutable counterpart of [`VarLayout::separate`]. Writes through a view
    /// mutate the underlying flat vector.
    pub fn separate_mut<'a, T>(
        &self,
        flat: &'a mut [T],
    ) -> CoupledResult<Vec<ArrayViewMutD<'a, T>>> {
        self.check_width(flat.len())?;
        let mut views = Vec::with_capacity(self.len());
        let mut rest = flat;
        let mut consumed = 0;
        for i in 0..self.len() {
            let span = self.spans[i];
            let (head, tail) = rest.split_at_mut(span.end() - consumed);
            let local = &mut head[span.offset - consumed..];
            views.push(
                ArrayViewMutD::from_shape(IxDyn(&self.shapes[i]), local)
                    .expect("layout spans are consistent with shapes"),
            );
            consumed = span.end();
            rest = tail;
        }
        Ok(views)
    }
}

/// Require that every name in `vars` is unique within the tuple.
pub(crate) fn check_unique(vars: &[Variable]) -> CoupledResult<()> {
    for (i, var) in vars.iter().enumerate() {
        if vars[..i].iter().any(|v| v.name() == var.name()) {
            return Err(CoupledError::DuplicateVariable {
                variable: var.name().to_string(),
            });
        }
    }
    Ok(())
}

/// Allocate a flat vector of the tuple's width and fill it with the defaults
/// of `vars`, in declaration order, honoring each default's native memory
/// order for multidimensional shapes.
pub fn combine(vars: &[Variable]) -> Array1<f64> {
    let layout = VarLayout::new(vars);
    let mut out = Array1::zeros(layout.width());
    // Freshly sized buffer; cannot fail.
    combine_into(out.as_slice_mut().unwrap(), vars).unwrap();
    out
}

/// Write the defaults of `vars` into a caller-provided buffer.
///
/// Fails with [`CoupledError::SizeMismatch`] if the buffer is shorter than the
/// total width; an oversized buffer is allowed and its tail is left untouched.
pub fn combine_into(buf: &mut [f64], vars: &[Variable]) -> CoupledResult<()> {
    let layout = VarLayout::new(vars);
    layout.check_width(buf.len())?;
    for (i, var) in vars.iter().enumerate() {
        let span = layout.span(i);
        let dst = &mut buf[span.offset..span.end()];
        for (d, s) in dst.iter_mut().zip(var.default().iter()) {
            *d = *s;
        }
    }
    Ok(())
}

/// Produce per-variable shaped views into `flat` for the tuple `vars`.
///
/// For scalar variables the view is a one-element sequence.
pub fn separate<'a, T>(vars: &[Variable], flat: &'a [T]) -> CoupledResult<Vec<ArrayViewD<'a, T>>> {
    VarLayout::new(vars).separate(flat)
}

/// Mutable counterpart of [`separate`]; writes through a view mutate `flat`.
pub fn separate_mut<'a, T>(
    vars: &[Variable],
    flat: &'a mut [T],
) -> CoupledResult<Vec<ArrayViewMutD<'a, T>>> {
    VarLayout::new(vars).separate_mut(flat)
}

/// Copy the contents of `flat` into caller-provided shaped buffers.
///
/// The buffers must match the variable sizes exactly.
pub fn separate_into<T: Copy>(
    out: &mut [ArrayD<T>],
    vars: &[Variable],
    flat: &[T],
) -> CoupledResult<()> {
    let layout = VarLayout::new(vars);
    layout.check_width(flat.len())?;
    if out.len() != vars.len() {
        return Err(CoupledError::SizeMismatch {
            expected: vars.len(),
            actual: out.len(),
        });
    }
    for (i, dst) in out.iter_mut().enumerate() {
        let span = layout.span(i);
        if dst.len() != span.size {
            return Err(CoupledError::SizeMismatch {
                expected: span.size,
                actual: dst.len(),
            });
        }
        for (d, s) in dst.iter_mut().zip(flat[span.offset..span.end()].iter()) {
            *d = *s;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn tuple() -> Vec<Variable> {
        vec![
            Variable::scalar("a", 2.5),
            Variable::vector("b", vec![1.0, 2.0, 3.0]),
            Variable::array(
                "c",
                Array::from_shape_vec(IxDyn(&[2, 2]), vec![4.0, 5.0, 6.0, 7.0]).unwrap(),
            ),
        ]
    }

    #[test]
    fn test_variable_equality_is_by_name() {
        let a1 = Variable::scalar("a", 0.0);
        let a2 = Variable::vector("a", vec![1.0, 2.0]);
        let b = Variable::scalar("b", 0.0);
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn test_layout_order_is_declaration_order() {
        let vars = tuple();
        let layout = VarLayout::new(&vars);
        assert_eq!(layout.width(), 8);
        assert_eq!(layout.span(0), Span { offset: 0, size: 1 });
        assert_eq!(layout.span(1), Span { offset: 1, size: 3 });
        assert_eq!(layout.span(2), Span { offset: 4, size: 4 });
    }

    #[test]
    fn test_combine_writes_defaults_in_order() {
        let flat = combine(&tuple());
        assert_eq!(
            flat.as_slice().unwrap(),
            &[2.5, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]
        );
    }

    #[test]
    fn test_combine_into_oversized_buffer() {
        let vars = tuple();
        let mut buf = vec![f64::NAN; 12];
        combine_into(&mut buf, &vars).unwrap();
        assert_eq!(&buf[..8], combine(&vars).as_slice().unwrap());
        // The tail is untouched.
        assert!(buf[8..].iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_combine_into_undersized_buffer_fails() {
        let vars = tuple();
        let mut buf = vec![0.0; 7];
        let err = combine_into(&mut buf, &vars).unwrap_err();
        match err {
            CoupledError::SizeMismatch { expected, actual } => {
                assert_eq!(expected, 8);
                assert_eq!(actual, 7);
            }
            other => panic!("expected SizeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_separate_preserves_shapes() {
        let vars = tuple();
        let flat = combine(&vars);
        let views = separate(&vars, flat.as_slice().unwrap()).unwrap();
        assert_eq!(views[0].shape(), &[1]);
        assert_eq!(views[1].shape(), &[3]);
        assert_eq!(views[2].shape(), &[2, 2]);
        assert_eq!(views[2][[1, 0]], 6.0);
    }

    #[test]
    fn test_separate_mut_writes_through() {
        let vars = tuple();
        let mut flat = combine(&vars);
        {
            let mut views = separate_mut(&vars, flat.as_slice_mut().unwrap()).unwrap();
            views[1][[2]] = 30.0;
            views[2][[0, 1]] = 50.0;
        }
        assert_eq!(flat[3], 30.0);
        assert_eq!(flat[5], 50.0);
    }

    #[test]
    fn test_packing_round_trip() {
        // Shapes (), (10), and (10, 10, 10, 10) with pseudo-random defaults.
        let mut seed = 42u64;
        let mut next = || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 11) as f64 / (1u64 << 53) as f64
        };
        let vars = vec![
            Variable::scalar("s", next()),
            Variable::vector("v", (0..10).map(|_| next()).collect::<Vec<_>>()),
            Variable::array(
                "t",
                Array::from_shape_vec(
                    IxDyn(&[10, 10, 10, 10]),
                    (0..10_000).map(|_| next()).collect(),
                )
                .unwrap(),
            ),
        ];
        let flat = combine(&vars);
        assert_eq!(flat.len(), 1 + 10 + 10_000);

        let views = separate(&vars, flat.as_slice().unwrap()).unwrap();
        for (var, view) in vars.iter().zip(views.iter()) {
            assert_eq!(view.shape(), var.shape());
            assert!(var.default().iter().zip(view.iter()).all(|(a, b)| a == b));
        }
    }

    #[test]
    fn test_separate_into_copies() {
        let vars = tuple();
        let flat = combine(&vars);
        let mut out = vec![
            ArrayD::zeros(IxDyn(&[1])),
            ArrayD::zeros(IxDyn(&[3])),
            ArrayD::zeros(IxDyn(&[2, 2])),
        ];
        separate_into(&mut out, &vars, flat.as_slice().unwrap()).unwrap();
        assert_eq!(out[2][[1, 1]], 7.0);
    }

    #[test]
    fn test_check_unique_rejects_duplicates() {
        let vars = vec![Variable::scalar("x", 0.0), Variable::scalar("x", 1.0)];
        assert!(matches!(
            check_unique(&vars),
            Err(CoupledError::DuplicateVariable { .. })
        ));
    }
}
