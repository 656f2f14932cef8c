//! The closed set of operators understood by the graph and the rewriters.
//!
//! Each operator declares its type signature ([`Op::infer_types`]), its
//! aliasing behavior ([`Op::destroy_map`], [`Op::view_map`]) and a reference
//! implementation ([`Op::perform`]). Equality of two `Op` values is equality
//! of the variant and its fields, so structurally identical applies compare
//! equal.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use smallvec::SmallVec;

use crate::value::{DType, Dimension, Value, ValueType};

pub mod kernels;

use kernels::OpError;

/// One entry of a [`Op::DimShuffle`] output axis order.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShuffleDim {
    /// Take input axis `i`.
    Axis(usize),
    /// Insert a new axis of size 1.
    NewAxis,
}

/// Errors arising when an apply is constructed with inputs whose types do
/// not fit the operator's signature.
#[derive(Clone, Debug, PartialEq)]
pub enum TypeError {
    /// Wrong number of inputs for the operator.
    WrongInputCount { expected: usize, actual: usize },
    /// An input does not have the rank the operator requires.
    WrongRank {
        input: usize,
        expected: usize,
        actual: usize,
    },
    /// Inputs must all have the same element type, but don't.
    MixedDTypes,
    /// The operator only accepts floating-point inputs.
    UnsupportedDType(DType),
    /// Fixed sizes of two inputs cannot be reconciled.
    IncompatibleShapes(&'static str),
    /// A dimshuffle order references a missing axis, repeats an axis, or
    /// drops an axis not statically known to have size 1.
    InvalidShuffle(&'static str),
    /// A replacement variable's type is not compatible with the variable it
    /// replaces.
    IncompatibleReplacement {
        expected: ValueType,
        actual: ValueType,
    },
}

impl Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeError::WrongInputCount { expected, actual } => {
                write!(f, "expected {} inputs but got {}", expected, actual)
            }
            TypeError::WrongRank {
                input,
                expected,
                actual,
            } => write!(
                f,
                "input {} should have rank {} but has rank {}",
                input, expected, actual
            ),
            TypeError::MixedDTypes => write!(f, "inputs have mixed element types"),
            TypeError::UnsupportedDType(dtype) => {
                write!(f, "unsupported element type {}", dtype)
            }
            TypeError::IncompatibleShapes(msg) => write!(f, "incompatible shapes: {}", msg),
            TypeError::InvalidShuffle(msg) => write!(f, "invalid dimshuffle order: {}", msg),
            TypeError::IncompatibleReplacement { expected, actual } => write!(
                f,
                "replacement of type {} is not compatible with {}",
                actual, expected
            ),
        }
    }
}

impl Error for TypeError {}

/// An operator, together with the fields that parametrize it.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Elementwise addition.
    Add,
    /// Elementwise subtraction.
    Sub,
    /// Elementwise multiplication.
    Mul,
    /// Elementwise negation.
    Neg,
    /// General dot product over rank-1/rank-2 operands.
    Dot,
    /// Matrix-matrix product restricted to rank-2 operands.
    Dot22,
    /// Axis permutation, insertion of size-1 axes and removal of size-1
    /// axes. The output is a view of the input.
    DimShuffle { order: SmallVec<[ShuffleDim; 2]> },
    /// `gemm(z, a, x, y, b) = b*z + a*(x @ y)`.
    ///
    /// The inplace variant writes into `z`'s storage.
    Gemm { inplace: bool },
    /// `gemv(y, a, A, x, b) = b*y + a*(A @ x)`.
    Gemv { inplace: bool },
    /// `ger(A, a, x, y) = A + a * outer(x, y)`.
    Ger { destructive: bool },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Add => "Add",
            Op::Sub => "Sub",
            Op::Mul => "Mul",
            Op::Neg => "Neg",
            Op::Dot => "Dot",
            Op::Dot22 => "Dot22",
            Op::DimShuffle { .. } => "DimShuffle",
            Op::Gemm { .. } => "Gemm",
            Op::Gemv { .. } => "Gemv",
            Op::Ger { .. } => "Ger",
        }
    }

    /// True if swapping the two inputs cannot change the result.
    pub fn is_commutative(&self) -> bool {
        matches!(self, Op::Add | Op::Mul)
    }

    /// `(output, input)` pair where the output is computed by overwriting
    /// the input's storage.
    pub fn destroy_map(&self) -> Option<(usize, usize)> {
        match self {
            Op::Gemm { inplace: true } | Op::Gemv { inplace: true } => Some((0, 0)),
            Op::Ger { destructive: true } => Some((0, 0)),
            _ => None,
        }
    }

    /// `(output, input)` pair where the output aliases the input's storage
    /// without modifying it.
    pub fn view_map(&self) -> Option<(usize, usize)> {
        match self {
            Op::DimShuffle { .. } => Some((0, 0)),
            _ => None,
        }
    }

    /// Number of inputs the operator takes.
    pub fn arity(&self) -> usize {
        match self {
            Op::Add | Op::Sub | Op::Mul | Op::Dot | Op::Dot22 => 2,
            Op::Neg | Op::DimShuffle { .. } => 1,
            Op::Gemm { .. } | Op::Gemv { .. } => 5,
            Op::Ger { .. } => 4,
        }
    }

    /// Compute output types from input types, or fail if the inputs do not
    /// fit the operator's signature.
    ///
    /// All operators have exactly one output.
    pub fn infer_types(&self, inputs: &[ValueType]) -> Result<Vec<ValueType>, TypeError> {
        if inputs.len() != self.arity() {
            return Err(TypeError::WrongInputCount {
                expected: self.arity(),
                actual: inputs.len(),
            });
        }
        let dtype = common_dtype(inputs)?;

        let out = match self {
            Op::Add | Op::Sub | Op::Mul => elementwise_type(dtype, &inputs[0], &inputs[1])?,
            Op::Neg => inputs[0].clone(),
            Op::Dot => {
                require_float(dtype)?;
                let (x, y) = (&inputs[0], &inputs[1]);
                match (x.rank(), y.rank()) {
                    (2, 2) => ValueType::new(dtype, &[x.shape[0], y.shape[1]]),
                    (2, 1) => ValueType::new(dtype, &[x.shape[0]]),
                    (1, 2) => ValueType::new(dtype, &[y.shape[1]]),
                    (1, 1) => ValueType::scalar(dtype),
                    _ => {
                        return Err(TypeError::IncompatibleShapes(
                            "dot operands must have rank 1 or 2",
                        ))
                    }
                }
            }
            Op::Dot22 => {
                require_float(dtype)?;
                require_rank(inputs, &[2, 2])?;
                ValueType::new(dtype, &[inputs[0].shape[0], inputs[1].shape[1]])
            }
            Op::DimShuffle { order } => dimshuffle_type(&inputs[0], order)?,
            Op::Gemm { .. } => {
                require_float(dtype)?;
                require_rank(inputs, &[2, 0, 2, 2, 0])?;
                let (z, x, y) = (&inputs[0], &inputs[2], &inputs[3]);
                ValueType::new(
                    dtype,
                    &[z.shape[0].merge(x.shape[0]), z.shape[1].merge(y.shape[1])],
                )
            }
            Op::Gemv { .. } => {
                require_float(dtype)?;
                require_rank(inputs, &[1, 0, 2, 1, 0])?;
                let (y, a_mat) = (&inputs[0], &inputs[2]);
                ValueType::new(dtype, &[y.shape[0].merge(a_mat.shape[0])])
            }
            Op::Ger { .. } => {
                require_float(dtype)?;
                require_rank(inputs, &[2, 0, 1, 1])?;
                let (a_mat, x, y) = (&inputs[0], &inputs[2], &inputs[3]);
                ValueType::new(
                    dtype,
                    &[a_mat.shape[0].merge(x.shape[0]), a_mat.shape[1].merge(y.shape[0])],
                )
            }
        };
        Ok(vec![out])
    }

    /// Evaluate the operator on concrete values.
    ///
    /// This is the reference semantics used by [`Graph::run`](crate::Graph::run);
    /// inplace variants compute the same result without actually reusing
    /// input storage.
    pub fn perform(&self, inputs: &[Value]) -> Result<Vec<Value>, OpError> {
        let out = match inputs[0].dtype() {
            DType::F32 => Value::F32(kernels::dispatch::<f32>(self, inputs)?),
            DType::F64 => Value::F64(kernels::dispatch::<f64>(self, inputs)?),
        };
        Ok(vec![out])
    }
}

impl Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::DimShuffle { order } => {
                write!(f, "DimShuffle{{")?;
                for (i, dim) in order.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    match dim {
                        ShuffleDim::Axis(axis) => write!(f, "{}", axis)?,
                        ShuffleDim::NewAxis => write!(f, "x")?,
                    }
                }
                write!(f, "}}")
            }
            Op::Gemm { inplace } | Op::Gemv { inplace } => {
                let tag = if *inplace { "inplace" } else { "no_inplace" };
                write!(f, "{}{{{}}}", self.name(), tag)
            }
            Op::Ger { destructive } => {
                let tag = if *destructive { "destructive" } else { "non-destructive" };
                write!(f, "Ger{{{}}}", tag)
            }
            _ => write!(f, "{}", self.name()),
        }
    }
}

fn common_dtype(inputs: &[ValueType]) -> Result<DType, TypeError> {
    let dtype = inputs[0].dtype;
    if inputs.iter().any(|ty| ty.dtype != dtype) {
        Err(TypeError::MixedDTypes)
    } else {
        Ok(dtype)
    }
}

fn require_float(dtype: DType) -> Result<(), TypeError> {
    if dtype.is_float() {
        Ok(())
    } else {
        Err(TypeError::UnsupportedDType(dtype))
    }
}

fn require_rank(inputs: &[ValueType], ranks: &[usize]) -> Result<(), TypeError> {
    for (i, (ty, &rank)) in inputs.iter().zip(ranks).enumerate() {
        if ty.rank() != rank {
            return Err(TypeError::WrongRank {
                input: i,
                expected: rank,
                actual: ty.rank(),
            });
        }
    }
    Ok(())
}

/// Result type of a binary elementwise op, allowing a rank-0 operand to
/// broadcast against the other operand.
fn elementwise_type(
    dtype: DType,
    a: &ValueType,
    b: &ValueType,
) -> Result<ValueType, TypeError> {
    match (a.rank(), b.rank()) {
        (0, _) => Ok(b.clone()),
        (_, 0) => Ok(a.clone()),
        (ra, rb) if ra == rb => {
            let mut shape = Vec::with_capacity(ra);
            for (&da, &db) in a.shape.iter().zip(b.shape.iter()) {
                match (da, db) {
                    (Dimension::Fixed(x), Dimension::Fixed(y)) if x != y => {
                        return Err(TypeError::IncompatibleShapes(
                            "elementwise operands have unequal fixed sizes",
                        ));
                    }
                    _ => shape.push(da.merge(db)),
                }
            }
            Ok(ValueType::new(dtype, &shape))
        }
        _ => Err(TypeError::IncompatibleShapes(
            "elementwise operands have unequal ranks",
        )),
    }
}

fn dimshuffle_type(input: &ValueType, order: &[ShuffleDim]) -> Result<ValueType, TypeError> {
    let rank = input.rank();
    let mut used = vec![false; rank];
    let mut shape = Vec::with_capacity(order.len());
    for dim in order {
        match *dim {
            ShuffleDim::Axis(axis) => {
                if axis >= rank {
                    return Err(TypeError::InvalidShuffle("axis out of range"));
                }
                if used[axis] {
                    return Err(TypeError::InvalidShuffle("axis repeated"));
                }
                used[axis] = true;
                shape.push(input.shape[axis]);
            }
            ShuffleDim::NewAxis => shape.push(Dimension::Fixed(1)),
        }
    }
    for (axis, used) in used.iter().enumerate() {
        if !used && !input.shape[axis].is_one() {
            return Err(TypeError::InvalidShuffle(
                "dropped axis is not statically known to have size 1",
            ));
        }
    }
    Ok(ValueType::new(input.dtype, &shape))
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::{Op, ShuffleDim, TypeError};
    use crate::value::{DType, Dimension, ValueType};

    #[test]
    fn test_infer_types() {
        let mat = ValueType::matrix(DType::F32);
        let vec = ValueType::vector(DType::F32);
        let scalar = ValueType::scalar(DType::F32);

        struct Case {
            op: Op,
            inputs: Vec<ValueType>,
            expected: Result<ValueType, TypeError>,
        }

        let cases = [
            Case {
                op: Op::Add,
                inputs: vec![mat.clone(), mat.clone()],
                expected: Ok(mat.clone()),
            },
            Case {
                op: Op::Mul,
                inputs: vec![scalar.clone(), mat.clone()],
                expected: Ok(mat.clone()),
            },
            Case {
                op: Op::Add,
                inputs: vec![mat.clone(), vec.clone()],
                expected: Err(TypeError::IncompatibleShapes(
                    "elementwise operands have unequal ranks",
                )),
            },
            Case {
                op: Op::Dot22,
                inputs: vec![mat.clone(), mat.clone()],
                expected: Ok(mat.clone()),
            },
            Case {
                op: Op::Dot22,
                inputs: vec![mat.clone(), vec.clone()],
                expected: Err(TypeError::WrongRank {
                    input: 1,
                    expected: 2,
                    actual: 1,
                }),
            },
            Case {
                op: Op::Dot,
                inputs: vec![vec.clone(), vec.clone()],
                expected: Ok(scalar.clone()),
            },
            Case {
                op: Op::Dot,
                inputs: vec![mat.clone(), vec.clone()],
                expected: Ok(vec.clone()),
            },
            Case {
                op: Op::Gemm { inplace: false },
                inputs: vec![
                    mat.clone(),
                    scalar.clone(),
                    mat.clone(),
                    mat.clone(),
                    scalar.clone(),
                ],
                expected: Ok(mat.clone()),
            },
            Case {
                op: Op::Gemm { inplace: false },
                inputs: vec![mat.clone(), scalar.clone(), mat.clone(), mat.clone()],
                expected: Err(TypeError::WrongInputCount {
                    expected: 5,
                    actual: 4,
                }),
            },
            Case {
                op: Op::Gemv { inplace: false },
                inputs: vec![
                    vec.clone(),
                    scalar.clone(),
                    mat.clone(),
                    vec.clone(),
                    scalar.clone(),
                ],
                expected: Ok(vec.clone()),
            },
            Case {
                op: Op::Ger { destructive: false },
                inputs: vec![mat.clone(), scalar.clone(), vec.clone(), vec.clone()],
                expected: Ok(mat.clone()),
            },
            Case {
                op: Op::Add,
                inputs: vec![mat.clone(), ValueType::matrix(DType::F64)],
                expected: Err(TypeError::MixedDTypes),
            },
        ];

        for Case {
            op,
            inputs,
            expected,
        } in cases
        {
            let result = op.infer_types(&inputs).map(|mut tys| tys.remove(0));
            assert_eq!(result, expected, "op {}", op);
        }
    }

    #[test]
    fn test_dimshuffle_types() {
        let row = ValueType::new(DType::F32, &[Dimension::Fixed(1), Dimension::Fixed(4)]);

        // Drop the leading size-1 axis.
        let drop_row = Op::DimShuffle {
            order: smallvec![ShuffleDim::Axis(1)],
        };
        assert_eq!(
            drop_row.infer_types(std::slice::from_ref(&row)),
            Ok(vec![ValueType::new(DType::F32, &[Dimension::Fixed(4)])])
        );

        // Dropping a non-unit axis is rejected.
        let drop_col = Op::DimShuffle {
            order: smallvec![ShuffleDim::Axis(0)],
        };
        assert!(matches!(
            drop_col.infer_types(std::slice::from_ref(&row)),
            Err(TypeError::InvalidShuffle(_))
        ));

        // Promote a vector to a column matrix.
        let vec_ty = ValueType::new(DType::F32, &[Dimension::Fixed(3)]);
        let to_col = Op::DimShuffle {
            order: smallvec![ShuffleDim::Axis(0), ShuffleDim::NewAxis],
        };
        assert_eq!(
            to_col.infer_types(std::slice::from_ref(&vec_ty)),
            Ok(vec![ValueType::new(
                DType::F32,
                &[Dimension::Fixed(3), Dimension::Fixed(1)]
            )])
        );
    }

    #[test]
    fn test_aliasing_declarations() {
        assert_eq!(Op::Gemm { inplace: true }.destroy_map(), Some((0, 0)));
        assert_eq!(Op::Gemm { inplace: false }.destroy_map(), None);
        assert_eq!(Op::Ger { destructive: true }.destroy_map(), Some((0, 0)));
        assert_eq!(
            Op::DimShuffle {
                order: smallvec![ShuffleDim::Axis(1), ShuffleDim::Axis(0)]
            }
            .view_map(),
            Some((0, 0))
        );
        assert_eq!(Op::Add.view_map(), None);
    }
}
