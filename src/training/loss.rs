use burn::tensor::activation::log_softmax;
use burn::tensor::{backend::Backend, Tensor};

/// Softmax cross-entropy on unscaled logits against one-hot or soft labels,
/// scaled per sample and averaged over the batch.
pub fn weighted_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    labels: Tensor<B, 2>,
    weights: Option<Tensor<B, 1>>,
) -> Tensor<B, 1> {
    let [batch, _] = logits.dims();
    let per_sample = (labels * log_softmax(logits, 1))
        .sum_dim(1)
        .reshape([batch])
        .neg();

    match weights {
        Some(weights) => (per_sample * weights).mean(),
        None => per_sample.mean(),
    }
}
