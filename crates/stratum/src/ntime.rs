use super::*;

/// Block timestamp as eight hex digits, the way miners echo it back in `mining.submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, DeserializeFromStr, SerializeDisplay)]
pub struct Ntime(u32);

impl FromStr for Ntime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 8 {
            return Err(Error::Length {
                expected: 4,
                actual: s.len() / 2,
            });
        }

        u32::from_str_radix(s, 16)
            .map(Self)
            .context(error::IntegerSnafu { input: s })
    }
}

impl fmt::Display for Ntime {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl From<Ntime> for u32 {
    fn from(n: Ntime) -> u32 {
        n.0
    }
}

impl From<u32> for Ntime {
    fn from(n: u32) -> Ntime {
        Ntime(n)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    #[test]
    fn parse() {
        assert_eq!("504e86b9".parse::<Ntime>().unwrap(), Ntime(0x504e86b9));
        assert_eq!(Ntime(0x504e86b9).to_string(), "504e86b9");
        assert_eq!(Ntime::from(1).to_string(), "00000001");
    }

    #[test]
    fn wrong_size() {
        assert!("504e86b".parse::<Ntime>().is_err());
        assert!("504e86b900".parse::<Ntime>().is_err());
        assert!("zzzzzzzz".parse::<Ntime>().is_err());
    }
}
