use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, DeserializeFromStr, SerializeDisplay)]
pub struct Nbits(CompactTarget);

impl Nbits {
    pub fn to_compact(self) -> CompactTarget {
        self.0
    }

    pub fn to_target(self) -> Target {
        Target::from_compact(self.0)
    }
}

impl FromStr for Nbits {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bits = u32::from_str_radix(s, 16).context(error::IntegerSnafu { input: s })?;
        Ok(Nbits(CompactTarget::from_consensus(bits)))
    }
}

impl fmt::Display for Nbits {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0.to_consensus())
    }
}

impl From<CompactTarget> for Nbits {
    fn from(n: CompactTarget) -> Nbits {
        Nbits(n)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    #[test]
    fn parse() {
        let nbits = "1d00ffff".parse::<Nbits>().unwrap();
        assert_eq!(nbits.to_compact().to_consensus(), 0x1d00ffff);
        assert_eq!(nbits.to_string(), "1d00ffff");
        assert_eq!(nbits.to_target(), Target::MAX_ATTAINABLE_MAINNET);
    }

    #[test]
    fn garbage() {
        assert!("nope".parse::<Nbits>().is_err());
    }
}
