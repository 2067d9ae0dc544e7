//! Quantization boundaries: where real-valued tensors enter and leave the
//! uint8 domain.
//!
//! A boundary is stateless until calibrated. During calibration it records
//! the running min/max of every tensor passing through it; [`QuantBoundary::freeze`]
//! turns that range into affine parameters
//!
//! ```text
//! real = scale · (q − zero_point),   q ∈ [0, 255]
//! ```
//!
//! In [`ExecutionMode::Quantized`] the boundary snaps its input onto that
//! grid (quantize followed by dequantize). In [`ExecutionMode::Float`] it is
//! the identity.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use candle_core::{bail, DType, Result, Tensor};

use mbv2_common::ExecutionMode;

const QMIN: f64 = 0.0;
const QMAX: f64 = 255.0;

// ── QuantParams ─────────────────────────────────────────────────────────────

/// Affine uint8 quantization parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantParams {
    /// Parameters covering `[min, max]`. The range is widened to include 0
    /// so that zero is exactly representable.
    pub fn asymmetric(min_val: f32, max_val: f32) -> Self {
        let min_val = min_val.min(0.0);
        let max_val = max_val.max(0.0);
        let range = max_val - min_val;
        let scale = if range < 1e-10 { 1.0 } else { range / QMAX as f32 };
        let zero_point = ((QMIN as f32 - min_val / scale).round() as i32).clamp(0, QMAX as i32);
        Self { scale, zero_point }
    }

    /// Quantize then dequantize `x` on this grid:
    /// `(clamp(round(x / scale) + zero_point, 0, 255) − zero_point) · scale`.
    ///
    /// Ties in `x / scale` round away from zero (candle's `round`), so
    /// `-0.5 · scale` lands on code `zero_point − 1`.
    pub fn fake_quantize(&self, x: &Tensor) -> Result<Tensor> {
        let scale = self.scale as f64;
        let zp = self.zero_point as f64;
        let q = x
            .affine(1.0 / scale, 0.0)?
            .round()?
            .affine(1.0, zp)?
            .clamp(QMIN, QMAX)?;
        q.affine(scale, -zp * scale)
    }

    /// Real value of the largest representable code.
    pub fn max_representable(&self) -> f32 {
        (QMAX as f32 - self.zero_point as f32) * self.scale
    }
}

// ── MinMaxObserver ──────────────────────────────────────────────────────────

/// Running min/max over every observed tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinMaxObserver {
    min: f32,
    max: f32,
    batches: usize,
}

impl Default for MinMaxObserver {
    fn default() -> Self {
        Self {
            min: f32::MAX,
            max: f32::MIN,
            batches: 0,
        }
    }
}

impl MinMaxObserver {
    pub fn observe(&mut self, x: &Tensor) -> Result<()> {
        let flat = x.to_dtype(DType::F32)?.flatten_all()?;
        if flat.elem_count() == 0 {
            return Ok(());
        }
        let lo = flat.min(0)?.to_scalar::<f32>()?;
        let hi = flat.max(0)?.to_scalar::<f32>()?;
        self.min = self.min.min(lo);
        self.max = self.max.max(hi);
        self.batches += 1;
        Ok(())
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn range(&self) -> Option<(f32, f32)> {
        (self.batches > 0).then_some((self.min, self.max))
    }

    pub fn params(&self) -> Option<QuantParams> {
        self.range()
            .map(|(lo, hi)| QuantParams::asymmetric(lo, hi))
    }
}

// ── QuantBoundary ───────────────────────────────────────────────────────────

/// Which side of the quantized region a boundary sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundaryKind {
    /// Network input: real → quantized.
    Quantize,
    /// Network output: quantized → real.
    Dequantize,
}

/// Mode-dependent marker at one end of the quantized region.
pub struct QuantBoundary {
    kind: BoundaryKind,
    mode: ExecutionMode,
    /// `Some` while calibrating.
    observer: Mutex<Option<MinMaxObserver>>,
    params: Mutex<Option<QuantParams>>,
}

impl QuantBoundary {
    pub fn new(kind: BoundaryKind, mode: ExecutionMode) -> Self {
        Self {
            kind,
            mode,
            observer: Mutex::new(None),
            params: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> BoundaryKind {
        self.kind
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Reset and start recording the range of every forward input.
    pub fn start_observing(&self) {
        self.observer.lock().replace(MinMaxObserver::default());
    }

    pub fn is_observing(&self) -> bool {
        self.observer.lock().is_some()
    }

    /// Drop the observer without touching stored parameters.
    pub fn stop_observing(&self) {
        self.observer.lock().take();
    }

    /// Parameters for the range recorded so far. Observation continues.
    pub fn observed_params(&self) -> Result<QuantParams> {
        let guard = self.observer.lock();
        let Some(observer) = guard.as_ref() else {
            bail!("{:?} boundary was not observing", self.kind);
        };
        let Some(params) = observer.params() else {
            bail!("{:?} boundary saw no data during calibration", self.kind);
        };
        Ok(params)
    }

    /// Stop observing and store parameters for the recorded range.
    pub fn freeze(&self) -> Result<QuantParams> {
        let params = self.observed_params();
        self.stop_observing();
        let params = params?;
        self.params.lock().replace(params);
        Ok(params)
    }

    pub fn params(&self) -> Option<QuantParams> {
        *self.params.lock()
    }

    pub fn set_params(&self, params: Option<QuantParams>) {
        *self.params.lock() = params;
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let observing = {
            let mut guard = self.observer.lock();
            match guard.as_mut() {
                Some(observer) => {
                    observer.observe(x)?;
                    true
                }
                None => false,
            }
        };

        match self.mode {
            ExecutionMode::Float => Ok(x.clone()),
            ExecutionMode::Quantized => match self.params() {
                Some(params) => params.fake_quantize(x),
                // First calibration pass of a quantized model.
                None if observing => Ok(x.clone()),
                None => bail!(
                    "{:?} boundary used in quantized mode before calibration",
                    self.kind
                ),
            },
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn asymmetric_params_cover_range() {
        let p = QuantParams::asymmetric(-1.0, 3.0);
        assert!((p.scale - 4.0 / 255.0).abs() < 1e-7);
        // -min / scale = 63.75 → 64
        assert_eq!(p.zero_point, 64);
    }

    #[test]
    fn range_is_widened_to_include_zero() {
        let p = QuantParams::asymmetric(2.0, 4.0);
        assert_eq!(p.zero_point, 0);
        assert!((p.scale - 4.0 / 255.0).abs() < 1e-7);

        let n = QuantParams::asymmetric(-4.0, -2.0);
        assert_eq!(n.zero_point, 255);
    }

    #[test]
    fn degenerate_range_uses_unit_scale() {
        let p = QuantParams::asymmetric(0.0, 0.0);
        assert_eq!(p.scale, 1.0);
        assert_eq!(p.zero_point, 0);
    }

    #[test]
    fn fake_quantize_snaps_and_clamps() {
        let dev = Device::Cpu;
        let p = QuantParams {
            scale: 0.5,
            zero_point: 10,
        };
        let x = Tensor::new(&[0.0f32, 0.26, -5.0, -6.0, 200.0], &dev).unwrap();
        let y: Vec<f32> = p.fake_quantize(&x).unwrap().to_vec1().unwrap();
        // 0.26/0.5 = 0.52 → 1 step; -6.0 → q = -2 → clamp 0 → -5.0; 200 → clamp 255 → 122.5
        assert_eq!(y, vec![0.0, 0.5, -5.0, -5.0, 122.5]);
        assert_eq!(p.max_representable(), 122.5);
    }

    #[test]
    fn fake_quantize_rounds_before_adding_zero_point() {
        let dev = Device::Cpu;
        let p = QuantParams {
            scale: 1.0,
            zero_point: 10,
        };
        let x = Tensor::new(&[-0.5f32, 0.5, -2.5], &dev).unwrap();
        let y: Vec<f32> = p.fake_quantize(&x).unwrap().to_vec1().unwrap();
        // round(-0.5) = -1 → code 9, not round(9.5) = 10.
        assert_eq!(y, vec![-1.0, 1.0, -3.0]);
    }

    #[test]
    fn observer_tracks_range_across_batches() {
        let dev = Device::Cpu;
        let mut obs = MinMaxObserver::default();
        assert!(obs.params().is_none());
        obs.observe(&Tensor::new(&[[0.5f32, -1.0]], &dev).unwrap())
            .unwrap();
        obs.observe(&Tensor::new(&[[2.0f32, 0.0]], &dev).unwrap())
            .unwrap();
        assert_eq!(obs.batches(), 2);
        assert_eq!(obs.range(), Some((-1.0, 2.0)));
    }

    #[test]
    fn float_boundary_is_identity() {
        let dev = Device::Cpu;
        let b = QuantBoundary::new(BoundaryKind::Quantize, ExecutionMode::Float);
        let x = Tensor::new(&[0.123f32, -7.7], &dev).unwrap();
        let y: Vec<f32> = b.forward(&x).unwrap().to_vec1().unwrap();
        assert_eq!(y, vec![0.123, -7.7]);
    }

    #[test]
    fn quantized_boundary_requires_calibration() {
        let dev = Device::Cpu;
        let b = QuantBoundary::new(BoundaryKind::Quantize, ExecutionMode::Quantized);
        let x = Tensor::new(&[0.3f32, -0.2], &dev).unwrap();
        assert!(b.forward(&x).is_err());

        b.start_observing();
        assert!(b.is_observing());
        b.forward(&x).unwrap();
        let params = b.freeze().unwrap();
        assert!(!b.is_observing());
        assert_eq!(b.params(), Some(params));

        let y: Vec<f32> = b.forward(&x).unwrap().to_vec1().unwrap();
        for (a, q) in [0.3f32, -0.2].iter().zip(y.iter()) {
            assert!((a - q).abs() <= params.scale / 2.0 + 1e-6);
        }
    }

    #[test]
    fn freeze_without_data_fails() {
        let b = QuantBoundary::new(BoundaryKind::Dequantize, ExecutionMode::Float);
        assert!(b.freeze().is_err());
        b.start_observing();
        assert!(b.freeze().is_err());
        assert!(!b.is_observing());
    }

    #[test]
    fn stop_observing_keeps_stored_params() {
        let dev = Device::Cpu;
        let b = QuantBoundary::new(BoundaryKind::Quantize, ExecutionMode::Quantized);
        b.start_observing();
        b.forward(&Tensor::new(&[1.0f32, -1.0], &dev).unwrap()).unwrap();
        let observed = b.observed_params().unwrap();
        assert!(b.is_observing());
        assert!(b.params().is_none());

        b.stop_observing();
        assert!(!b.is_observing());
        assert!(b.params().is_none());
        assert!(b.observed_params().is_err());
        assert!(b.forward(&Tensor::new(&[0.5f32], &dev).unwrap()).is_err());

        b.set_params(Some(observed));
        b.start_observing();
        b.stop_observing();
        assert_eq!(b.params(), Some(observed));
    }
}
