use burn::{prelude::*, tensor::ElementConversion};

/// Top-k accuracy in percent for every `k` in `topk`.
///
/// `output` is `[batch, classes]` logits, `target` holds class indices.
/// `k` larger than the number of classes counts every row as correct.
pub fn accuracy<B: Backend>(
    output: Tensor<B, 2>,
    target: Tensor<B, 1, Int>,
    topk: &[usize],
) -> Vec<f64> {
    let [batch_size, num_classes] = output.dims();
    if batch_size == 0 {
        return vec![0.0; topk.len()];
    }

    let max_k = topk.iter().copied().max().unwrap_or(1).clamp(1, num_classes);
    let (_, pred) = output.topk_with_indices(max_k, 1);
    let correct = pred.equal(target.reshape([batch_size, 1]).repeat_dim(1, max_k));

    topk.iter()
        .map(|&k| {
            let k = k.clamp(1, max_k);
            let hits: i64 = correct
                .clone()
                .slice([0..batch_size, 0..k])
                .int()
                .sum()
                .into_scalar()
                .elem();
            hits as f64 * 100.0 / batch_size as f64
        })
        .collect()
}
