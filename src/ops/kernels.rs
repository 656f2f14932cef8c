//! Naive reference implementations of the operators.
//!
//! These exist so that rewrites can be checked for output identity by
//! executing a graph before and after a pass. They are written for clarity,
//! not speed.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::ops::{Add, Mul, Neg, Sub};

use rten_tensor::prelude::*;
use rten_tensor::{Scalar, Tensor};

use crate::ops::{Op, ShuffleDim};
use crate::value::Value;

/// Errors from evaluating an operator on concrete values.
#[derive(Clone, Debug, PartialEq)]
pub enum OpError {
    /// Input shapes do not satisfy the operator's runtime requirements.
    IncompatibleShapes(&'static str),
    /// An input has a different element type than the first input.
    ///
    /// Type inference rules this out for graphs built through the normal
    /// API, so hitting it indicates a corrupted graph.
    MixedDTypes,
}

impl Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::IncompatibleShapes(msg) => write!(f, "incompatible shapes: {}", msg),
            OpError::MixedDTypes => write!(f, "inputs have mixed element types"),
        }
    }
}

impl Error for OpError {}

/// Element types the reference kernels are implemented for.
pub trait Element:
    Copy
    + Default
    + PartialEq
    + Scalar
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Neg<Output = Self>
{
    fn one() -> Self;

    /// Extract the tensor from a [`Value`] if it has this element type.
    fn from_value(value: &Value) -> Option<&Tensor<Self>>;
}

impl Element for f32 {
    fn one() -> f32 {
        1.
    }

    fn from_value(value: &Value) -> Option<&Tensor<f32>> {
        match value {
            Value::F32(t) => Some(t),
            _ => None,
        }
    }
}

impl Element for f64 {
    fn one() -> f64 {
        1.
    }

    fn from_value(value: &Value) -> Option<&Tensor<f64>> {
        match value {
            Value::F64(t) => Some(t),
            _ => None,
        }
    }
}

/// Evaluate `op` on `inputs`, all of which must have element type `T`.
pub fn dispatch<T: Element>(op: &Op, inputs: &[Value]) -> Result<Tensor<T>, OpError> {
    let tensors: Vec<&Tensor<T>> = inputs
        .iter()
        .map(|v| T::from_value(v).ok_or(OpError::MixedDTypes))
        .collect::<Result<_, _>>()?;

    match op {
        Op::Add => binary(tensors[0], tensors[1], |a, b| a + b),
        Op::Sub => binary(tensors[0], tensors[1], |a, b| a - b),
        Op::Mul => binary(tensors[0], tensors[1], |a, b| a * b),
        Op::Neg => Ok(Tensor::from_data(
            tensors[0].shape(),
            tensors[0].iter().map(|&x| -x).collect::<Vec<_>>(),
        )),
        Op::Dot => dot(tensors[0], tensors[1]),
        Op::Dot22 => matmat(tensors[0], tensors[1]),
        Op::DimShuffle { order } => dimshuffle(tensors[0], order),
        Op::Gemm { .. } => gemm(
            tensors[0],
            scalar(tensors[1])?,
            tensors[2],
            tensors[3],
            scalar(tensors[4])?,
        ),
        Op::Gemv { .. } => gemv(
            tensors[0],
            scalar(tensors[1])?,
            tensors[2],
            tensors[3],
            scalar(tensors[4])?,
        ),
        Op::Ger { .. } => ger(tensors[0], scalar(tensors[1])?, tensors[2], tensors[3]),
    }
}

fn scalar<T: Element>(t: &Tensor<T>) -> Result<T, OpError> {
    t.item()
        .copied()
        .ok_or(OpError::IncompatibleShapes("scale is not a scalar"))
}

fn binary<T: Element>(
    a: &Tensor<T>,
    b: &Tensor<T>,
    f: impl Fn(T, T) -> T,
) -> Result<Tensor<T>, OpError> {
    if a.ndim() == 0 {
        let a = scalar(a)?;
        return Ok(Tensor::from_data(
            b.shape(),
            b.iter().map(|&y| f(a, y)).collect::<Vec<_>>(),
        ));
    }
    if b.ndim() == 0 {
        let b = scalar(b)?;
        return Ok(Tensor::from_data(
            a.shape(),
            a.iter().map(|&x| f(x, b)).collect::<Vec<_>>(),
        ));
    }
    if a.shape() != b.shape() {
        return Err(OpError::IncompatibleShapes(
            "elementwise operands have different shapes",
        ));
    }
    Ok(Tensor::from_data(
        a.shape(),
        a.iter()
            .zip(b.iter())
            .map(|(&x, &y)| f(x, y))
            .collect::<Vec<_>>(),
    ))
}

fn dot<T: Element>(x: &Tensor<T>, y: &Tensor<T>) -> Result<Tensor<T>, OpError> {
    match (x.ndim(), y.ndim()) {
        (2, 2) => matmat(x, y),
        (2, 1) => {
            let (m, k) = (x.shape()[0], x.shape()[1]);
            if y.shape()[0] != k {
                return Err(OpError::IncompatibleShapes("dot inner sizes differ"));
            }
            let mut out = Tensor::zeros(&[m]);
            for i in 0..m {
                let mut acc = T::default();
                for l in 0..k {
                    acc = acc + x[[i, l]] * y[[l]];
                }
                out[[i]] = acc;
            }
            Ok(out)
        }
        (1, 2) => {
            let (k, n) = (y.shape()[0], y.shape()[1]);
            if x.shape()[0] != k {
                return Err(OpError::IncompatibleShapes("dot inner sizes differ"));
            }
            let mut out = Tensor::zeros(&[n]);
            for j in 0..n {
                let mut acc = T::default();
                for l in 0..k {
                    acc = acc + x[[l]] * y[[l, j]];
                }
                out[[j]] = acc;
            }
            Ok(out)
        }
        (1, 1) => {
            if x.shape() != y.shape() {
                return Err(OpError::IncompatibleShapes("dot inner sizes differ"));
            }
            let mut acc = T::default();
            for l in 0..x.shape()[0] {
                acc = acc + x[[l]] * y[[l]];
            }
            Ok(Tensor::from(acc))
        }
        _ => Err(OpError::IncompatibleShapes("dot operands must have rank 1 or 2")),
    }
}

fn matmat<T: Element>(x: &Tensor<T>, y: &Tensor<T>) -> Result<Tensor<T>, OpError> {
    let (m, k) = (x.shape()[0], x.shape()[1]);
    let (k2, n) = (y.shape()[0], y.shape()[1]);
    if k != k2 {
        return Err(OpError::IncompatibleShapes("matmul inner sizes differ"));
    }
    let mut out = Tensor::zeros(&[m, n]);
    for i in 0..m {
        for j in 0..n {
            let mut acc = T::default();
            for l in 0..k {
                acc = acc + x[[i, l]] * y[[l, j]];
            }
            out[[i, j]] = acc;
        }
    }
    Ok(out)
}

fn dimshuffle<T: Element>(input: &Tensor<T>, order: &[ShuffleDim]) -> Result<Tensor<T>, OpError> {
    let out_shape: Vec<usize> = order
        .iter()
        .map(|dim| match *dim {
            ShuffleDim::Axis(axis) => input.shape()[axis],
            ShuffleDim::NewAxis => 1,
        })
        .collect();
    let mut out = Tensor::zeros(&out_shape);

    // Walk output positions in row-major order, mapping each back to an
    // input position. Dropped input axes have size 1 and index 0.
    let mut out_idx = vec![0; out_shape.len()];
    let mut in_idx = vec![0; input.ndim()];
    loop {
        for (pos, dim) in order.iter().enumerate() {
            if let ShuffleDim::Axis(axis) = *dim {
                in_idx[axis] = out_idx[pos];
            }
        }
        out[out_idx.as_slice()] = input[in_idx.as_slice()];

        let mut axis = out_shape.len();
        loop {
            if axis == 0 {
                return Ok(out);
            }
            axis -= 1;
            out_idx[axis] += 1;
            if out_idx[axis] < out_shape[axis] {
                break;
            }
            out_idx[axis] = 0;
        }
    }
}

fn gemm<T: Element>(
    z: &Tensor<T>,
    a: T,
    x: &Tensor<T>,
    y: &Tensor<T>,
    b: T,
) -> Result<Tensor<T>, OpError> {
    let product = matmat(x, y)?;
    let (m, n) = (product.shape()[0], product.shape()[1]);
    let (zm, zn) = (z.shape()[0], z.shape()[1]);
    if (zm != m && zm != 1) || (zn != n && zn != 1) {
        return Err(OpError::IncompatibleShapes(
            "gemm z is not broadcastable to the product shape",
        ));
    }
    let zero = T::default();
    let mut out = Tensor::zeros(&[m, n]);
    for i in 0..m {
        for j in 0..n {
            // When b is zero, z is not read at all.
            let bz = if b == zero {
                zero
            } else {
                let zi = if zm == 1 { 0 } else { i };
                let zj = if zn == 1 { 0 } else { j };
                let zv = z[[zi, zj]];
                if b == T::one() {
                    zv
                } else {
                    b * zv
                }
            };
            let ap = if a == T::one() {
                product[[i, j]]
            } else if a == -T::one() {
                -product[[i, j]]
            } else {
                a * product[[i, j]]
            };
            out[[i, j]] = bz + ap;
        }
    }
    Ok(out)
}

fn gemv<T: Element>(
    y: &Tensor<T>,
    a: T,
    mat: &Tensor<T>,
    x: &Tensor<T>,
    b: T,
) -> Result<Tensor<T>, OpError> {
    let (m, k) = (mat.shape()[0], mat.shape()[1]);
    if x.shape()[0] != k {
        return Err(OpError::IncompatibleShapes("gemv inner sizes differ"));
    }
    let ym = y.shape()[0];
    if ym != m && ym != 1 {
        return Err(OpError::IncompatibleShapes(
            "gemv y is not broadcastable to the product length",
        ));
    }
    let zero = T::default();
    let mut out = Tensor::zeros(&[m]);
    for i in 0..m {
        let mut acc = T::default();
        for l in 0..k {
            acc = acc + mat[[i, l]] * x[[l]];
        }
        let by = if b == zero {
            zero
        } else {
            b * y[[if ym == 1 { 0 } else { i }]]
        };
        out[[i]] = by + a * acc;
    }
    Ok(out)
}

fn ger<T: Element>(
    mat: &Tensor<T>,
    a: T,
    x: &Tensor<T>,
    y: &Tensor<T>,
) -> Result<Tensor<T>, OpError> {
    let (m, n) = (x.shape()[0], y.shape()[0]);
    let (am, an) = (mat.shape()[0], mat.shape()[1]);
    if (am != m && am != 1) || (an != n && an != 1) {
        return Err(OpError::IncompatibleShapes(
            "ger matrix is not broadcastable to the outer-product shape",
        ));
    }
    let mut out = Tensor::zeros(&[m, n]);
    for i in 0..m {
        for j in 0..n {
            let ai = if am == 1 { 0 } else { i };
            let aj = if an == 1 { 0 } else { j };
            out[[i, j]] = mat[[ai, aj]] + a * x[[i]] * y[[j]];
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use rten_tensor::prelude::*;
    use rten_tensor::Tensor;
    use smallvec::smallvec;

    use super::{dispatch, gemm};
    use crate::ops::{Op, ShuffleDim};
    use crate::value::Value;

    #[test]
    fn test_gemm() {
        let z = Tensor::from([[1., 2.], [3., 4.]]);
        let x = Tensor::from([[1., 0.], [0., 1.]]);
        let y = Tensor::from([[5., 6.], [7., 8.]]);
        let out = gemm(&z, 2., &x, &y, 1.).unwrap();
        assert_eq!(out, Tensor::from([[11., 14.], [17., 20.]]));
    }

    #[test]
    fn test_gemm_zero_beta_ignores_z() {
        let z = Tensor::from([[f32::NAN, f32::NAN], [f32::NAN, f32::NAN]]);
        let x = Tensor::from([[1., 2.], [3., 4.]]);
        let y = Tensor::from([[1., 0.], [0., 1.]]);
        let out = gemm(&z, 1., &x, &y, 0.).unwrap();
        assert_eq!(out, x);
    }

    #[test]
    fn test_gemm_broadcasts_z() {
        let z = Tensor::from([[10., 20.]]);
        let x = Tensor::from([[1., 0.], [0., 1.]]);
        let y = Tensor::from([[1., 2.], [3., 4.]]);
        let out = gemm(&z, 1., &x, &y, 1.).unwrap();
        assert_eq!(out, Tensor::from([[11., 22.], [13., 24.]]));
    }

    #[test]
    fn test_dot_rank_combinations() {
        let mat = Value::from(Tensor::from([[1.0f32, 2.], [3., 4.]]));
        let vec = Value::from(Tensor::from([1.0f32, 1.]));

        let mv = dispatch::<f32>(&Op::Dot, &[mat.clone(), vec.clone()]).unwrap();
        assert_eq!(mv, Tensor::from([3., 7.]));

        let vm = dispatch::<f32>(&Op::Dot, &[vec.clone(), mat.clone()]).unwrap();
        assert_eq!(vm, Tensor::from([4., 6.]));

        let vv = dispatch::<f32>(&Op::Dot, &[vec.clone(), vec]).unwrap();
        assert_eq!(vv, Tensor::from(2.));
    }

    #[test]
    fn test_dimshuffle() {
        let mat = Value::from(Tensor::from([[1.0f32, 2.], [3., 4.]]));
        let transpose = Op::DimShuffle {
            order: smallvec![ShuffleDim::Axis(1), ShuffleDim::Axis(0)],
        };
        let out = dispatch::<f32>(&transpose, std::slice::from_ref(&mat)).unwrap();
        assert_eq!(out, Tensor::from([[1., 3.], [2., 4.]]));

        let row = Value::from(Tensor::from([[5.0f32, 6.]]));
        let drop_and_lift = Op::DimShuffle {
            order: smallvec![ShuffleDim::NewAxis, ShuffleDim::Axis(1)],
        };
        let out = dispatch::<f32>(&drop_and_lift, std::slice::from_ref(&row)).unwrap();
        assert_eq!(out.shape(), &[1, 2]);
    }
}
