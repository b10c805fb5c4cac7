use super::*;

/// Previous block hash in the word-swapped order stratum miners expect:
/// the internal byte order with every 4-byte word reversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DeserializeFromStr, SerializeDisplay)]
pub struct PrevHash(BlockHash);

impl PrevHash {
    pub fn block_hash(self) -> BlockHash {
        self.0
    }
}

impl From<BlockHash> for PrevHash {
    fn from(hash: BlockHash) -> Self {
        Self(hash)
    }
}

fn swap_words(bytes: &mut [u8; 32]) {
    for word in bytes.chunks_exact_mut(4) {
        let n = LittleEndian::read_u32(word);
        BigEndian::write_u32(word, n);
    }
}

impl FromStr for PrevHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).context(error::HexSnafu { input: s })?;

        let mut bytes: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| Error::Length {
            expected: 32,
            actual: bytes.len(),
        })?;

        swap_words(&mut bytes);

        Ok(Self(BlockHash::from_byte_array(bytes)))
    }
}

impl fmt::Display for PrevHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut bytes = self.0.to_byte_array();
        swap_words(&mut bytes);
        write!(f, "{}", hex::encode(bytes))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    #[test]
    fn word_swapped() {
        let hash = "00000000440b921e1b77c6c0487ae5616de67f788f44ae2a5af6e2194d16b6f8"
            .parse::<BlockHash>()
            .unwrap();

        let prevhash = PrevHash::from(hash);

        assert_eq!(
            prevhash.to_string(),
            "4d16b6f85af6e2198f44ae2a6de67f78487ae5611b77c6c0440b921e00000000"
        );

        assert_eq!(
            prevhash.to_string().parse::<PrevHash>().unwrap().block_hash(),
            hash
        );
    }

    #[test]
    fn wrong_length() {
        assert!("00".parse::<PrevHash>().is_err());
    }
}
