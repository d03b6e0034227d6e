use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{config::TrainError, data::IGNORE_INDEX};

/// Next-token cross entropy, summed over non-ignored positions and divided by
/// an externally supplied count.
///
/// The denominator is the caller's: the loop computes one count for a whole
/// accumulation window and passes it to every micro-batch's forward, so models
/// built on this helper satisfy the shared-normalization contract for free.
/// Logits are `[batch, seq, vocab]`, labels `[batch, seq]` with `-100` marking
/// positions excluded from the loss; internally logits drop the last position
/// and labels the first.
pub fn cross_entropy_with_normalizer(
    logits: &Tensor,
    labels: &Tensor,
    normalization_count: usize,
) -> Result<Tensor, TrainError> {
    let dims = logits.dims();
    if dims.len() != 3 {
        return Err(TrainError::compute(
            "cross entropy expects logits shaped [batch, seq, vocab]",
        ));
    }
    let (batch, seq_len, vocab_size) = (dims[0], dims[1], dims[2]);
    if vocab_size == 0 {
        return Err(TrainError::compute(
            "logits vocabulary dimension must be greater than zero",
        ));
    }
    if labels.dims() != [batch, seq_len] {
        return Err(TrainError::compute(
            "label tensor must match logits batch/sequence dimensions",
        ));
    }
    if seq_len < 2 {
        return Err(TrainError::compute(
            "next-token loss requires sequences of at least two positions",
        ));
    }
    if normalization_count == 0 {
        return Err(TrainError::compute(
            "loss normalization count is zero; the window has no target positions",
        ));
    }

    let token_count = batch * (seq_len - 1);
    let shifted_logits = logits
        .narrow(1, 0, seq_len - 1)?
        .reshape((token_count, vocab_size))?
        .to_dtype(DType::F32)?;
    let shifted_labels = labels.narrow(1, 1, seq_len - 1)?.reshape((token_count,))?;

    let valid_mask = shifted_labels.ne(IGNORE_INDEX)?;
    // Sentinel positions become index 0; the mask zeroes their contribution.
    let safe_labels = shifted_labels.mul(&valid_mask.to_dtype(DType::I64)?)?;

    let log_probs = ops::log_softmax(&shifted_logits, D::Minus1)?;
    let nll = log_probs
        .gather(&safe_labels.unsqueeze(1)?, 1)?
        .neg()?
        .squeeze(1)?;

    let masked = nll.mul(&valid_mask.to_dtype(DType::F32)?)?;
    let loss = masked
        .sum_all()?
        .affine(1.0 / normalization_count as f64, 0.0)?;
    Ok(loss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn uniform_logits(batch: usize, seq: usize, vocab: usize) -> Tensor {
        Tensor::zeros((batch, seq, vocab), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn sums_then_divides_by_supplied_count() {
        // Uniform logits over 4 classes: each live position costs ln(4).
        let logits = uniform_logits(1, 4, 4);
        let labels =
            Tensor::from_vec(vec![0i64, 1, IGNORE_INDEX, 2], (1, 4), &Device::Cpu).unwrap();

        // Two live shifted positions, but the window-level count is 8.
        let loss = cross_entropy_with_normalizer(&logits, &labels, 8).unwrap();
        let value = loss.to_vec0::<f32>().unwrap();
        let expected = 2.0 * (4f32).ln() / 8.0;
        assert!((value - expected).abs() < 1e-5);
    }

    #[test]
    fn fully_masked_positions_contribute_nothing() {
        let logits = uniform_logits(2, 3, 5);
        let labels = Tensor::from_vec(
            vec![0i64, IGNORE_INDEX, IGNORE_INDEX, 0, 3, IGNORE_INDEX],
            (2, 3),
            &Device::Cpu,
        )
        .unwrap();
        let loss = cross_entropy_with_normalizer(&logits, &labels, 1).unwrap();
        let value = loss.to_vec0::<f32>().unwrap();
        assert!((value - (5f32).ln()).abs() < 1e-5);
    }

    #[test]
    fn rejects_zero_normalizer() {
        let logits = uniform_logits(1, 3, 4);
        let labels = Tensor::from_vec(vec![0i64, 1, 2], (1, 3), &Device::Cpu).unwrap();
        assert!(cross_entropy_with_normalizer(&logits, &labels, 0).is_err());
    }
}
