use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, DeserializeFromStr, SerializeDisplay)]
pub struct Version(pub block::Version);

impl Version {
    pub fn to_consensus(self) -> i32 {
        self.0.to_consensus()
    }

    /// Applies miner-rolled `bits` under `mask`, leaving the other bits of `self` untouched.
    pub fn roll(self, bits: Version, mask: Version) -> Version {
        (self & !mask) | (bits & mask)
    }

    /// True when `self` only sets bits that `mask` allows.
    pub fn fits(self, mask: Version) -> bool {
        (self & !mask).to_consensus() == 0
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n = u32::from_str_radix(s, 16).context(error::IntegerSnafu { input: s })?;
        Ok(Self(block::Version::from_consensus(n as i32)))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0.to_consensus())
    }
}

impl From<i32> for Version {
    fn from(value: i32) -> Self {
        Self(block::Version::from_consensus(value))
    }
}

impl From<u32> for Version {
    fn from(value: u32) -> Self {
        Self(block::Version::from_consensus(value as i32))
    }
}

impl BitAnd for Version {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self::from(self.to_consensus() & rhs.to_consensus())
    }
}

impl BitOr for Version {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self::from(self.to_consensus() | rhs.to_consensus())
    }
}

impl Not for Version {
    type Output = Self;

    fn not(self) -> Self {
        Self::from(!self.to_consensus())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    #[track_caller]
    fn case(version_str: &str, expected_consensus: i32) {
        let version = Version::from_str(version_str).unwrap();
        assert_eq!(version.to_string(), version_str);
        assert_eq!(version.to_consensus(), expected_consensus);
        assert_eq!(
            serde_json::to_string(&version).unwrap(),
            format!("\"{version_str}\"")
        );
    }

    #[test]
    fn parse() {
        case("20000000", 0x20000000);
        case("ffffffff", -1);
        case("00000001", 1);
        case("20000002", 0x20000002);
    }

    #[test]
    fn roll() {
        let mask = Version::from(0x1fffe000);
        let base = Version::from(0x20000000);

        assert_eq!(
            base.roll(Version::from(0x04d46000), mask),
            Version::from(0x24d46000)
        );

        assert_eq!(
            base.roll(Version::from(0x40000001), mask),
            Version::from(0x20000000)
        );
    }

    #[test]
    fn fits() {
        let mask = Version::from(0x1fffe000);
        assert!(Version::from(0x04d46000).fits(mask));
        assert!(!Version::from(0x20000000).fits(mask));
        assert!(!Version::from(0x00000001).fits(mask));
    }
}
