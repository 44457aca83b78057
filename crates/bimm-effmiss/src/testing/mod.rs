use burn::prelude::{Backend, Tensor};
use std::fmt::Debug;

pub fn assert_close_to_vec<T>(
    actual: &[T],
    expected: &[T],
    tolerance: T,
) where
    T: num_traits::float::Float + Copy + Debug,
{
    let pass = actual.len() == expected.len()
        && actual
            .iter()
            .zip(expected.iter())
            .all(|(&a, &e)| (a - e).abs() <= tolerance);
    if !pass {
        panic!("Expected (+/- {tolerance:?}):\n{expected:?}\nActual:\n{actual:?}");
    }
}

/// Panics if any element of the tensor is NaN or infinite.
pub fn assert_all_finite<B: Backend, const D: usize>(tensor: &Tensor<B, D>) {
    let values = tensor.to_data().to_vec::<f32>().unwrap();
    if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
        panic!(
            "Non-finite value {:?} at flat index {idx} of tensor {:?}",
            values[idx],
            tensor.dims()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    #[test]
    fn test_assert_close_to_vec() {
        let actual = vec![1.0, 2.0, 3.0];
        let expected = vec![1.0, 2.0, 3.0];
        assert_close_to_vec(&actual, &expected, 0.01);

        let actual = vec![1.0, 2.0, 3.1];
        let expected = vec![1.0, 2.0, 3.0];
        assert_close_to_vec(&actual, &expected, 0.2);
    }

    #[test]
    #[should_panic]
    fn test_assert_close_to_vec_bad_values() {
        assert_close_to_vec(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.5], 0.01);
    }

    #[test]
    #[should_panic]
    fn test_assert_close_to_vec_different_lengths() {
        assert_close_to_vec(&[1.0, 2.0], &[1.0, 2.0, 3.0], 0.01);
    }

    #[test]
    fn test_assert_all_finite() {
        let device = Default::default();
        let x = Tensor::<NdArray, 2>::from_data(
            TensorData::new(vec![0.0f32, -1.5, 2.0, 1e6], [2, 2]),
            &device,
        );
        assert_all_finite(&x);
    }

    #[test]
    #[should_panic(expected = "Non-finite value")]
    fn test_assert_all_finite_nan() {
        let device = Default::default();
        let x = Tensor::<NdArray, 1>::from_data(
            TensorData::new(vec![0.0f32, f32::NAN], [2]),
            &device,
        );
        assert_all_finite(&x);
    }
}
