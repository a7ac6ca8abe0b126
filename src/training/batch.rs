use burn::tensor::{backend::Backend, Tensor, TensorData};

/// One training batch: images, one-hot (or soft) labels and per-sample weights.
#[derive(Clone, Debug)]
pub struct TrainBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 2>,
    pub weights: Tensor<B, 1>,
}

impl<B: Backend> TrainBatch<B> {
    pub fn new(images: Tensor<B, 4>, labels: Tensor<B, 2>, weights: Tensor<B, 1>) -> Self {
        Self {
            images,
            labels,
            weights,
        }
    }

    /// Build a batch from flattened CHW images and class indices.
    ///
    /// Each sample's weight is the weight of its class.
    pub fn from_samples(
        images: Vec<f32>,
        labels: &[usize],
        class_weights: &[f32],
        input_size: usize,
        device: &B::Device,
    ) -> Self {
        let batch = labels.len();
        let n_classes = class_weights.len();

        let mut one_hot = vec![0.0f32; batch * n_classes];
        for (row, &label) in labels.iter().enumerate() {
            one_hot[row * n_classes + label] = 1.0;
        }
        let weights: Vec<f32> = labels.iter().map(|&label| class_weights[label]).collect();

        Self {
            images: Tensor::from_data(
                TensorData::new(images, [batch, 3, input_size, input_size]),
                device,
            ),
            labels: Tensor::from_data(TensorData::new(one_hot, [batch, n_classes]), device),
            weights: Tensor::from_data(TensorData::new(weights, [batch]), device),
        }
    }

    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_from_samples() {
        let device = Default::default();
        let images = vec![0.5f32; 2 * 3 * 4 * 4];
        let batch = TrainBatch::<TestBackend>::from_samples(images, &[1, 0], &[1.0, 3.0], 4, &device);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.images.dims(), [2, 3, 4, 4]);
        assert_eq!(
            batch.labels.into_data().to_vec::<f32>().unwrap(),
            vec![0.0, 1.0, 1.0, 0.0]
        );
        assert_eq!(batch.weights.into_data().to_vec::<f32>().unwrap(), vec![3.0, 1.0]);
    }
}
