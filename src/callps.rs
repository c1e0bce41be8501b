// # Cached PS Call-outs
//
// Colour chains call back into PostScript for things like under-colour
// removal and black generation. The interpreter cannot run during
// multi-threaded compositing, so the results of a procedure are cached
// up front: a uniformly-sampled lookup table over the declared input
// range, interpolated linearly at render time.
//
// An empty procedure is the identity function and caches nothing. The
// sample count is 256 per unit of input range so the interpolation
// error stays consistent when the range is wider than [0, 1].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{MmError, Result};
use crate::pscalc::PsCalcFunc;

/// Tolerance for inputs that have drifted just outside the declared
/// range through cumulative rounding.
pub const EPSILON: f32 = 1e-4;

/// Which kind of colour function the cache serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnType {
    HalftoneTransfer,
    BlackGen,
    UnderColorRemoval,
    TintTransform,
}

/// A callback into the full PS interpreter, used when no precompiled
/// form is available. Implementations are expected to drop to
/// use-all-but-final reserves around the interpreter call
/// (`MemoryManager::set_reserves`).
pub trait PsCallout {
    /// Evaluate the procedure on one input, producing `out.len()`
    /// values.
    fn call(&self, input: f32, out: &mut [f32]) -> Result<()>;
}

/// The source of values for a cache.
pub enum CallPsSource<'a> {
    /// A null or empty procedure: the identity function.
    Empty,
    /// A precompiled PS-calculator procedure.
    Calc(&'a PsCalcFunc),
    /// A callback through the full interpreter.
    Callout(&'a dyn PsCallout),
}

/// A sampled cache of one PS procedure over `[min, max]`.
pub struct CallPsCache {
    fn_type: FnType,
    unique_id: i32,
    n_out: usize,
    n_vals: usize,
    empty_func: bool,
    range_min: f32,
    range_max: f32,
    values: Vec<f32>,
}

fn sample_count(range: Option<(f32, f32)>) -> (f32, f32, usize) {
    match range {
        None => (0.0, 1.0, 256),
        Some((min, max)) => {
            // Wider ranges get proportionally more interpolation points,
            // keeping the error limits consistent.
            let n_vals = if max - min <= 1.0 {
                256
            } else {
                (256.0 * (max - min)) as usize
            };
            (min, max, n_vals)
        }
    }
}

/// Create a cache by sampling `source` over the range.
pub fn create_callpscache(
    fn_type: FnType,
    n_out: usize,
    unique_id: i32,
    range: Option<(f32, f32)>,
    source: CallPsSource<'_>,
) -> Result<Arc<CallPsCache>> {
    debug_assert!(n_out > 0, "cache with no outputs");
    let (range_min, range_max, n_vals) = sample_count(range);

    let empty_func = match &source {
        CallPsSource::Empty => true,
        CallPsSource::Calc(func) => func.is_empty(),
        CallPsSource::Callout(_) => false,
    };

    let mut cache = CallPsCache {
        fn_type,
        unique_id,
        n_out,
        n_vals,
        empty_func,
        range_min,
        range_max,
        values: Vec::new(),
    };

    if !empty_func {
        cache.values = vec![0.0; n_vals * n_out];
        for i in 0..n_vals {
            let input = (i as f32 / (n_vals - 1) as f32) * (range_max - range_min) + range_min;
            let out = &mut cache.values[i * n_out..(i + 1) * n_out];
            match &source {
                CallPsSource::Empty => unreachable!(),
                CallPsSource::Calc(func) => {
                    func.exec(&[input], out).map_err(|_| MmError::VmError)?
                }
                CallPsSource::Callout(callout) => callout.call(input, out)?,
            }
            if fn_type == FnType::BlackGen {
                debug_assert!(n_out == 1, "unexpected output count for black generation");
                for v in out {
                    *v = v.clamp(0.0, 1.0);
                }
            }
        }
    }
    Ok(Arc::new(cache))
}

/// Take another reference to the cache.
pub fn reserve_callpscache(cache: &Arc<CallPsCache>) -> Arc<CallPsCache> {
    Arc::clone(cache)
}

/// Drop a reference; the last drop frees the sample storage.
pub fn destroy_callpscache(cache: Arc<CallPsCache>) {
    drop(cache);
}

impl CallPsCache {
    /// The cache's unique id, for constructing chain keys.
    pub fn unique_id(&self) -> i32 {
        self.unique_id
    }

    pub fn fn_type(&self) -> FnType {
        self.fn_type
    }

    pub fn outputs(&self) -> usize {
        self.n_out
    }

    /// Does this cache hold sample storage at all?
    pub fn is_identity(&self) -> bool {
        self.empty_func
    }

    /// Look up one input, interpolating between the two surrounding
    /// samples for each output channel.
    pub fn lookup(&self, input: f32, out: &mut [f32]) {
        debug_assert!(out.len() == self.n_out, "wrong output count");

        // An empty PS procedure is an identity function.
        if self.empty_func {
            out[0] = input;
            return;
        }

        // Cumulative rounding may land the input a tiny bit outside the
        // stated range; wobble it back in.
        let mut input = input;
        if input < self.range_min && input >= self.range_min - EPSILON {
            input = self.range_min;
        }
        if input > self.range_max && input <= self.range_max + EPSILON {
            input = self.range_max;
        }

        let in01 = if input < self.range_min || input > self.range_max {
            // The whole range was sampled up front and this is well
            // outside it; far too late to call the interpreter, so
            // saturate.
            debug_assert!(false, "colour value outside pre-cached range");
            if input < self.range_min {
                0.0
            } else {
                1.0
            }
        } else {
            (input - self.range_min) / (self.range_max - self.range_min)
        };

        let pos = in01 * (self.n_vals - 1) as f32;
        let lower = pos as usize;
        let frac = pos - lower as f32;
        let index = lower * self.n_out;

        out.copy_from_slice(&self.values[index..index + self.n_out]);
        if frac != 0.0 {
            let next = &self.values[index + self.n_out..index + 2 * self.n_out];
            for (o, n) in out.iter_mut().zip(next) {
                *o += frac * (*n - *o);
            }
        }
    }
}

/// Per-process source of fresh cache ids.
pub fn next_callpscache_id() -> i32 {
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pscalc::PsToken;

    struct Linear;

    impl PsCallout for Linear {
        fn call(&self, input: f32, out: &mut [f32]) -> Result<()> {
            for (i, o) in out.iter_mut().enumerate() {
                *o = input * (i + 1) as f32;
            }
            Ok(())
        }
    }

    #[test]
    fn empty_procedure_is_identity_without_storage() {
        let cache =
            create_callpscache(FnType::UnderColorRemoval, 1, 7, None, CallPsSource::Empty).unwrap();
        assert!(cache.is_identity());
        let mut out = [0.0f32];
        cache.lookup(0.37, &mut out);
        assert_eq!(out[0], 0.37);
        assert_eq!(cache.values.len(), 0);
        assert_eq!(cache.unique_id(), 7);
    }

    #[test]
    fn compiled_empty_procedure_is_identity_too() {
        let func = PsCalcFunc::compile(&[]).unwrap();
        let cache =
            create_callpscache(FnType::TintTransform, 1, 1, None, CallPsSource::Calc(&func))
                .unwrap();
        assert!(cache.is_identity());
    }

    #[test]
    fn linear_callout_interpolates() {
        let cache =
            create_callpscache(FnType::TintTransform, 2, 1, None, CallPsSource::Callout(&Linear))
                .unwrap();
        let mut out = [0.0f32; 2];
        cache.lookup(0.5, &mut out);
        assert!((out[0] - 0.5).abs() < 1e-3);
        assert!((out[1] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn lookup_at_range_max_reads_last_sample() {
        let cache =
            create_callpscache(FnType::TintTransform, 1, 1, None, CallPsSource::Callout(&Linear))
                .unwrap();
        let mut out = [0.0f32];
        cache.lookup(1.0, &mut out);
        assert_eq!(out[0], 1.0);
        // Just outside, within tolerance: snapped to the end.
        cache.lookup(1.0 + EPSILON / 2.0, &mut out);
        assert_eq!(out[0], 1.0);
    }

    #[test]
    fn wide_range_gets_more_samples() {
        let cache = create_callpscache(
            FnType::TintTransform,
            1,
            1,
            Some((0.0, 4.0)),
            CallPsSource::Callout(&Linear),
        )
        .unwrap();
        assert_eq!(cache.n_vals, 1024);
        let mut out = [0.0f32];
        cache.lookup(3.0, &mut out);
        assert!((out[0] - 3.0).abs() < 1e-2);
    }

    #[test]
    fn black_generation_clamps_to_unit() {
        struct Overshoot;
        impl PsCallout for Overshoot {
            fn call(&self, input: f32, out: &mut [f32]) -> Result<()> {
                out[0] = input * 3.0 - 1.0;
                Ok(())
            }
        }
        let cache =
            create_callpscache(FnType::BlackGen, 1, 1, None, CallPsSource::Callout(&Overshoot))
                .unwrap();
        let mut out = [0.0f32];
        cache.lookup(0.0, &mut out);
        assert_eq!(out[0], 0.0);
        cache.lookup(1.0, &mut out);
        assert_eq!(out[0], 1.0);
    }

    #[test]
    fn calc_function_fills_cache() {
        // {1 exch sub}
        let func = PsCalcFunc::compile(&[
            PsToken::Integer(1),
            PsToken::Name("exch".to_string()),
            PsToken::Name("sub".to_string()),
        ])
        .unwrap();
        let cache =
            create_callpscache(FnType::UnderColorRemoval, 1, 3, None, CallPsSource::Calc(&func))
                .unwrap();
        let mut out = [0.0f32];
        cache.lookup(0.25, &mut out);
        assert!((out[0] - 0.75).abs() < 1e-3);
    }

    #[test]
    fn reference_counting_pairs_up() {
        let cache =
            create_callpscache(FnType::TintTransform, 1, 9, None, CallPsSource::Empty).unwrap();
        let extra = reserve_callpscache(&cache);
        assert_eq!(Arc::strong_count(&cache), 2);
        destroy_callpscache(extra);
        assert_eq!(Arc::strong_count(&cache), 1);
    }

    #[test]
    fn fresh_ids_are_distinct() {
        assert_ne!(next_callpscache_id(), next_callpscache_id());
    }
}
