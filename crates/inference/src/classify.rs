//! Turning logits into ranked class predictions.

use serde::{Deserialize, Serialize};

use candle_core::{bail, DType, Result, Tensor};

/// One ranked class for one image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub class: usize,
    pub probability: f32,
}

/// Softmax over the class axis of `(N, C)` logits, then the `k` most
/// probable classes per row, highest first. `k` is capped at `C`.
pub fn top_k(logits: &Tensor, k: usize) -> Result<Vec<Vec<Prediction>>> {
    let (_, num_classes) = logits.dims2()?;
    if k == 0 {
        bail!("top_k needs k >= 1");
    }
    let probs = candle_nn::ops::softmax(&logits.to_dtype(DType::F32)?, 1)?;
    let rows: Vec<Vec<f32>> = probs.to_vec2()?;
    let k = k.min(num_classes);

    Ok(rows
        .into_iter()
        .map(|row| {
            let mut indexed: Vec<(usize, f32)> = row.into_iter().enumerate().collect();
            indexed.sort_unstable_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
            indexed
                .into_iter()
                .take(k)
                .map(|(class, probability)| Prediction { class, probability })
                .collect()
        })
        .collect())
}

/// Index of the largest logit in each row.
pub fn argmax(logits: &Tensor) -> Result<Vec<u32>> {
    logits.argmax(1)?.to_vec1()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn ranks_classes_by_probability() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[0.0f32, 3.0, 1.0, -2.0], [5.0, 0.0, 0.0, 6.0]], &dev).unwrap();
        let preds = top_k(&logits, 2).unwrap();
        assert_eq!(preds.len(), 2);
        assert_eq!(preds[0].iter().map(|p| p.class).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(preds[1].iter().map(|p| p.class).collect::<Vec<_>>(), vec![3, 0]);
        assert!(preds[0][0].probability > preds[0][1].probability);
        assert_eq!(argmax(&logits).unwrap(), vec![1, 3]);
    }

    #[test]
    fn probabilities_sum_to_one_when_k_covers_all_classes() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[0.3f32, -1.0, 2.0]], &dev).unwrap();
        let preds = top_k(&logits, 10).unwrap();
        assert_eq!(preds[0].len(), 3);
        let sum: f32 = preds[0].iter().map(|p| p.probability).sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn rejects_zero_k_and_wrong_rank() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[0.3f32, -1.0]], &dev).unwrap();
        assert!(top_k(&logits, 0).is_err());
        let flat = Tensor::new(&[0.3f32, -1.0], &dev).unwrap();
        assert!(top_k(&flat, 1).is_err());
    }
}
