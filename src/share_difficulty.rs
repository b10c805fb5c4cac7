use super::*;

/// Splits a finite positive float into an exact `numerator / denominator`.
fn exact(value: f64) -> Option<(BigUint, BigUint)> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }

    let (mantissa, exponent, _sign) = Float::integer_decode(value);
    let mantissa = BigUint::from(mantissa);

    if exponent >= 0 {
        Some((mantissa << exponent as usize, BigUint::one()))
    } else {
        Some((mantissa, BigUint::one() << exponent.unsigned_abs() as usize))
    }
}

/// Share difficulty kept as an exact fraction, `diff1 / hash` scaled by the
/// family's share multiplier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareDifficulty {
    numerator: BigUint,
    denominator: BigUint,
}

impl ShareDifficulty {
    pub fn new(diff1: &BigUint, hash: &BigUint) -> Self {
        Self {
            numerator: diff1.clone(),
            denominator: if hash.is_zero() {
                BigUint::one()
            } else {
                hash.clone()
            },
        }
    }

    pub fn scaled(self, factor: f64) -> Self {
        match exact(factor) {
            Some((numerator, denominator)) => Self {
                numerator: self.numerator * numerator,
                denominator: self.denominator * denominator,
            },
            None => self,
        }
    }

    pub fn as_f64(&self) -> f64 {
        let bits = self.numerator.bits().max(self.denominator.bits());
        let shift = bits.saturating_sub(1000) as usize;

        let numerator = (&self.numerator >> shift).to_f64().unwrap_or(f64::MAX);
        let denominator = (&self.denominator >> shift).to_f64().unwrap_or(f64::MAX);

        numerator / denominator
    }

    /// True when `self / stratum_difficulty >= 0.99`, decided without rounding.
    pub fn meets(&self, stratum_difficulty: f64) -> bool {
        let Some((numerator, denominator)) = exact(stratum_difficulty) else {
            return false;
        };

        BigUint::from(100u32) * &self.numerator * denominator
            >= BigUint::from(99u32) * &self.denominator * numerator
    }
}

impl Display for ShareDifficulty {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.as_f64())
    }
}

/// Decides which stratum difficulty a share is credited at: the current one,
/// the previous one when the miner is still working under it after a
/// retarget, or neither.
pub fn credited_difficulty(
    share_difficulty: &ShareDifficulty,
    context: &WorkerContext,
    is_block_candidate: bool,
) -> Result<f64, ShareError> {
    if is_block_candidate || share_difficulty.meets(context.difficulty) {
        return Ok(context.difficulty);
    }

    match context.previous_difficulty {
        Some(previous) if share_difficulty.meets(previous) => Ok(previous),
        _ => Err(ShareError::LowDifficulty {
            difficulty: share_difficulty.as_f64(),
        }),
    }
}

/// Converts a network target into a difficulty against `diff1`.
pub fn target_difficulty(diff1: &BigUint, target: &BigUint) -> f64 {
    ShareDifficulty::new(diff1, target).as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big(n: u64) -> BigUint {
        BigUint::from(n)
    }

    fn context(difficulty: f64, previous: Option<f64>) -> WorkerContext {
        let mut context = WorkerContext::new(
            previous.unwrap_or(difficulty),
            None,
            BouncerConfig::default(),
            Utc::now(),
        );

        if previous.is_some() {
            context.set_difficulty(difficulty);
        }

        context
    }

    #[test]
    fn exact_decomposition() {
        let (n, d) = exact(1.0).unwrap();
        assert_eq!(n, d);

        let (n, d) = exact(0.5).unwrap();
        assert_eq!(n * big(2), d);

        let (n, d) = exact(1024.0).unwrap();
        assert_eq!(n, d * big(1024));

        assert_eq!(exact(0.0), None);
        assert_eq!(exact(-1.0), None);
        assert_eq!(exact(f64::NAN), None);
    }

    #[test]
    fn ratio_boundary() {
        let share = ShareDifficulty::new(&big(99), &big(1));
        assert!(share.meets(100.0));
        assert!(!share.meets(100.1));

        let share = ShareDifficulty::new(&big(98), &big(1));
        assert!(!share.meets(100.0));
    }

    #[test]
    fn boundary_that_floats_misround() {
        let k = big(1) << 200usize;
        let share = ShareDifficulty::new(&(big(99) * &k), &(big(100) * &k + big(1)));

        assert_eq!(share.as_f64(), 0.99);
        assert!(!share.meets(1.0));

        let share = ShareDifficulty::new(&(big(99) * &k), &(big(100) * &k));
        assert!(share.meets(1.0));
    }

    #[test]
    fn scaled() {
        let share = ShareDifficulty::new(&big(512), &big(1)).scaled(1.0 / 256.0);
        assert_eq!(share.as_f64(), 2.0);
        assert!(share.meets(2.0));
        assert!(!share.meets(2.1));
    }

    #[test]
    fn zero_hash_is_maximal() {
        let share = ShareDifficulty::new(&big(1000), &big(0));
        assert_eq!(share.as_f64(), 1000.0);
    }

    #[test]
    fn retarget_grace() {
        let share = ShareDifficulty::new(&big(995), &big(1));

        assert_eq!(credited_difficulty(&share, &context(2000.0, Some(1000.0)), false), Ok(1000.0));

        assert_eq!(
            credited_difficulty(&share, &context(2000.0, None), false),
            Err(ShareError::LowDifficulty { difficulty: 995.0 })
        );

        assert_eq!(
            credited_difficulty(&share, &context(4000.0, Some(2000.0)), false),
            Err(ShareError::LowDifficulty { difficulty: 995.0 })
        );
    }

    #[test]
    fn block_candidate_always_credited() {
        let share = ShareDifficulty::new(&big(1), &big(1));
        assert_eq!(credited_difficulty(&share, &context(2000.0, None), true), Ok(2000.0));
    }

    #[test]
    fn huge_values_convert() {
        let diff1 = BigUint::from_bytes_be(&[0xff; 32]);
        assert!(target_difficulty(&diff1, &big(1)) > 1e76);
        assert_eq!(target_difficulty(&diff1, &diff1), 1.0);
    }
}
