use super::*;

/// A 32-byte hash in internal byte order. Displays as plain hex of those bytes,
/// which is how merkle branches travel in `mining.notify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, DeserializeFromStr, SerializeDisplay)]
pub struct MerkleNode([u8; 32]);

impl MerkleNode {
    pub fn from_byte_array(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn to_byte_array(self) -> [u8; 32] {
        self.0
    }

    /// Builds a node from the big-endian hex RPC daemons use for txids and hashes.
    pub fn from_rpc_hex(s: &str) -> Result<Self> {
        let mut node = s.parse::<Self>()?;
        node.0.reverse();
        Ok(node)
    }

    pub fn join(self, other: Self) -> Self {
        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(&self.0);
        concat[32..].copy_from_slice(&other.0);
        Self(sha256d::Hash::hash(&concat).to_byte_array())
    }
}

impl From<Txid> for MerkleNode {
    fn from(txid: Txid) -> Self {
        Self(txid.to_byte_array())
    }
}

impl From<MerkleNode> for TxMerkleNode {
    fn from(node: MerkleNode) -> Self {
        TxMerkleNode::from_byte_array(node.0)
    }
}

impl FromStr for MerkleNode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).context(error::HexSnafu { input: s })?;

        bytes
            .try_into()
            .map(Self)
            .map_err(|bytes: Vec<u8>| Error::Length {
                expected: 32,
                actual: bytes.len(),
            })
    }
}

impl fmt::Display for MerkleNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Merkle branch for a block whose first transaction is not yet known.
///
/// `steps` are the siblings on the path from the first leaf to the root, so
/// once the coinbase is built the root is a fold over the steps.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MerkleTree {
    steps: Vec<MerkleNode>,
}

impl MerkleTree {
    /// `hashes` are the leaves after the first one.
    pub fn new(hashes: impl IntoIterator<Item = MerkleNode>) -> Self {
        let mut level = vec![None];
        level.extend(hashes.into_iter().map(Some));

        let mut steps = Vec::new();

        while level.len() > 1 {
            if let Some(Some(sibling)) = level.get(1) {
                steps.push(*sibling);
            }

            if level.len() % 2 == 1 {
                if let Some(last) = level.last().copied() {
                    level.push(last);
                }
            }

            let mut next = vec![None];

            for pair in level[2..].chunks_exact(2) {
                if let [Some(left), Some(right)] = pair {
                    next.push(Some(left.join(*right)));
                }
            }

            level = next;
        }

        Self { steps }
    }

    pub fn steps(&self) -> &[MerkleNode] {
        &self.steps
    }

    pub fn with_first(&self, first: MerkleNode) -> MerkleNode {
        self.steps
            .iter()
            .fold(first, |acc, step| acc.join(*step))
    }
}
