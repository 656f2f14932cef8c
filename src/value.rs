use std::fmt;

use rten_tensor::prelude::*;
use rten_tensor::Tensor;

/// Element type of a tensor variable.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum DType {
    F32,
    F64,
}

impl DType {
    /// Return true if this is a floating-point type.
    ///
    /// Only float variables participate in BLAS specialization.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F64 => write!(f, "f64"),
        }
    }
}

/// Size of one axis of a variable, as far as it is known when the graph is
/// constructed.
///
/// A `Fixed(1)` axis is statically known to be broadcastable; several
/// rewrites (GEMV/GER recognition) key off this.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Dimension {
    Fixed(usize),
    Dynamic,
}

impl Dimension {
    pub fn is_one(self) -> bool {
        matches!(self, Dimension::Fixed(1))
    }

    /// Combine two hints for the same axis, preferring fixed sizes.
    pub fn merge(self, other: Dimension) -> Dimension {
        match (self, other) {
            (Dimension::Fixed(a), Dimension::Fixed(b)) => Dimension::Fixed(a.max(b)),
            (Dimension::Fixed(a), Dimension::Dynamic) => Dimension::Fixed(a),
            (Dimension::Dynamic, Dimension::Fixed(b)) => Dimension::Fixed(b),
            (Dimension::Dynamic, Dimension::Dynamic) => Dimension::Dynamic,
        }
    }
}

/// Static type of a variable: element type plus per-axis size hints.
///
/// The rank (`shape.len()`) is authoritative; individual sizes may be
/// `Dynamic`.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueType {
    pub dtype: DType,
    pub shape: Vec<Dimension>,
}

impl ValueType {
    pub fn new(dtype: DType, shape: &[Dimension]) -> ValueType {
        ValueType {
            dtype,
            shape: shape.to_vec(),
        }
    }

    /// Type of a rank-0 (scalar) variable.
    pub fn scalar(dtype: DType) -> ValueType {
        ValueType {
            dtype,
            shape: Vec::new(),
        }
    }

    /// Type of a rank-2 variable with unknown sizes.
    pub fn matrix(dtype: DType) -> ValueType {
        ValueType {
            dtype,
            shape: vec![Dimension::Dynamic; 2],
        }
    }

    /// Type of a rank-1 variable with unknown size.
    pub fn vector(dtype: DType) -> ValueType {
        ValueType {
            dtype,
            shape: vec![Dimension::Dynamic],
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Return true if all axes are statically known to have size 1.
    ///
    /// Rank-0 variables are trivially scalar-shaped.
    pub fn is_scalar_shaped(&self) -> bool {
        self.shape.iter().all(|d| d.is_one())
    }

    /// Replacement compatibility: a variable of type `other` may stand in
    /// for a variable of type `self` if the element types and ranks match.
    pub fn compatible(&self, other: &ValueType) -> bool {
        self.dtype == other.dtype && self.rank() == other.rank()
    }

    /// Stricter equivalence used by the GEMM canonicalizer: compatible and
    /// the same pattern of statically-size-1 axes, so that swapping one for
    /// the other cannot change broadcasting behavior.
    pub fn same_class(&self, other: &ValueType) -> bool {
        self.compatible(other)
            && self
                .shape
                .iter()
                .zip(other.shape.iter())
                .all(|(a, b)| a.is_one() == b.is_one())
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.dtype)?;
        for (i, dim) in self.shape.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match dim {
                Dimension::Fixed(size) => write!(f, "{}", size)?,
                Dimension::Dynamic => write!(f, "?")?,
            }
        }
        write!(f, "]")
    }
}

/// A concrete tensor value, used for constants and during reference
/// execution of a graph.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    F32(Tensor<f32>),
    F64(Tensor<f64>),
}

impl Value {
    pub fn dtype(&self) -> DType {
        match self {
            Value::F32(_) => DType::F32,
            Value::F64(_) => DType::F64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Value::F32(t) => t.shape(),
            Value::F64(t) => t.shape(),
        }
    }

    /// The static type of this value, with all sizes fixed.
    pub fn value_type(&self) -> ValueType {
        ValueType {
            dtype: self.dtype(),
            shape: self.shape().iter().map(|&s| Dimension::Fixed(s)).collect(),
        }
    }

    /// Extract the value as an `f64` if this is a single-element tensor.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::F32(t) => t.item().copied().map(|x| x as f64),
            Value::F64(t) => t.item().copied(),
        }
    }

    /// Create a rank-0 value of the given element type.
    pub fn scalar(dtype: DType, value: f64) -> Value {
        match dtype {
            DType::F32 => Value::F32(Tensor::from(value as f32)),
            DType::F64 => Value::F64(Tensor::from(value)),
        }
    }
}

impl From<Tensor<f32>> for Value {
    fn from(t: Tensor<f32>) -> Value {
        Value::F32(t)
    }
}

impl From<Tensor<f64>> for Value {
    fn from(t: Tensor<f64>) -> Value {
        Value::F64(t)
    }
}

impl From<f32> for Value {
    fn from(x: f32) -> Value {
        Value::F32(Tensor::from(x))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Value {
        Value::F64(Tensor::from(x))
    }
}

#[cfg(test)]
mod tests {
    use rten_tensor::Tensor;

    use super::{DType, Dimension, Value, ValueType};

    #[test]
    fn test_type_compatibility() {
        let mat = ValueType::matrix(DType::F32);
        let row = ValueType::new(DType::F32, &[Dimension::Fixed(1), Dimension::Dynamic]);
        let vec = ValueType::vector(DType::F32);
        let mat_f64 = ValueType::matrix(DType::F64);

        assert!(mat.compatible(&row));
        assert!(!mat.same_class(&row));
        assert!(!mat.compatible(&vec));
        assert!(!mat.compatible(&mat_f64));
        assert!(mat.same_class(&ValueType::new(
            DType::F32,
            &[Dimension::Fixed(3), Dimension::Dynamic]
        )));
    }

    #[test]
    fn test_scalar_shaped() {
        let cases = [
            (ValueType::scalar(DType::F32), true),
            (
                ValueType::new(DType::F32, &[Dimension::Fixed(1), Dimension::Fixed(1)]),
                true,
            ),
            (ValueType::matrix(DType::F32), false),
        ];
        for (ty, expected) in cases {
            assert_eq!(ty.is_scalar_shaped(), expected, "type {}", ty);
        }
    }

    #[test]
    fn test_value_as_scalar() {
        assert_eq!(Value::from(2.5f32).as_scalar(), Some(2.5));
        assert_eq!(Value::F32(Tensor::from([1., 2.])).as_scalar(), None);
    }
}
