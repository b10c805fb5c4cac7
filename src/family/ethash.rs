use {
    super::*,
    lru::LruCache,
    sha3::{Digest, Keccak256, Keccak512},
    std::{num::NonZeroUsize, sync::OnceLock},
};

pub(crate) const EPOCH_LENGTH: u64 = 30_000;

const CACHE_BYTES_INIT: u64 = 1 << 24;
const CACHE_BYTES_GROWTH: u64 = 1 << 17;
const DATASET_BYTES_INIT: u64 = 1 << 30;
const DATASET_BYTES_GROWTH: u64 = 1 << 23;
const HASH_BYTES: u64 = 64;
const MIX_BYTES: u64 = 128;
const HASH_WORDS: usize = 16;
const MIX_WORDS: usize = 32;
const DATASET_PARENTS: u32 = 256;
const CACHE_ROUNDS: usize = 3;
const ACCESSES: u32 = 64;
const FNV_PRIME: u32 = 0x0100_0193;

/// Epochs whose verification cache is kept around.
const CACHED_EPOCHS: usize = 3;

type Node = [u32; HASH_WORDS];

fn fnv(a: u32, b: u32) -> u32 {
    a.wrapping_mul(FNV_PRIME) ^ b
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }

    if n % 2 == 0 {
        return n == 2;
    }

    let mut i = 3;
    while i * i <= n {
        if n % i == 0 {
            return false;
        }
        i += 2;
    }

    true
}

pub(crate) fn cache_size(epoch: u64) -> u64 {
    let mut size = CACHE_BYTES_INIT + CACHE_BYTES_GROWTH * epoch - HASH_BYTES;

    while !is_prime(size / HASH_BYTES) {
        size -= 2 * HASH_BYTES;
    }

    size
}

pub(crate) fn dataset_size(epoch: u64) -> u64 {
    let mut size = DATASET_BYTES_INIT + DATASET_BYTES_GROWTH * epoch - MIX_BYTES;

    while !is_prime(size / MIX_BYTES) {
        size -= 2 * MIX_BYTES;
    }

    size
}

pub(crate) fn seed_hash(epoch: u64) -> [u8; 32] {
    let mut seed = [0u8; 32];

    for _ in 0..epoch {
        seed = Keccak256::digest(seed).into();
    }

    seed
}

fn node_from_bytes(bytes: &[u8]) -> Node {
    let mut node = [0u32; HASH_WORDS];

    for (word, chunk) in node.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = LittleEndian::read_u32(chunk);
    }

    node
}

fn node_bytes(node: &Node) -> [u8; HASH_BYTES as usize] {
    let mut bytes = [0u8; HASH_BYTES as usize];

    for (chunk, word) in bytes.chunks_exact_mut(4).zip(node) {
        LittleEndian::write_u32(chunk, *word);
    }

    bytes
}

fn keccak512(data: &[u8]) -> Node {
    node_from_bytes(&Keccak512::digest(data))
}

/// Light verification cache for one epoch.
pub(crate) struct EpochCache {
    nodes: Vec<Node>,
    full_size: u64,
}

impl Debug for EpochCache {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("EpochCache")
            .field("nodes", &self.nodes.len())
            .field("full_size", &self.full_size)
            .finish()
    }
}

impl EpochCache {
    pub(crate) fn new(epoch: u64) -> Self {
        Self::with_sizes(&seed_hash(epoch), cache_size(epoch), dataset_size(epoch))
    }

    pub(crate) fn with_sizes(seed: &[u8; 32], cache_size: u64, full_size: u64) -> Self {
        let count = (cache_size / HASH_BYTES) as usize;

        let mut nodes = Vec::with_capacity(count);
        nodes.push(keccak512(seed));

        for i in 1..count {
            let previous = node_bytes(&nodes[i - 1]);
            nodes.push(keccak512(&previous));
        }

        for _ in 0..CACHE_ROUNDS {
            for i in 0..count {
                let source = nodes[(i + count - 1) % count];
                let other = nodes[nodes[i][0] as usize % count];

                let mut mixed = [0u32; HASH_WORDS];
                for (word, (a, b)) in mixed.iter_mut().zip(source.iter().zip(other.iter())) {
                    *word = a ^ b;
                }

                nodes[i] = keccak512(&node_bytes(&mixed));
            }
        }

        Self { nodes, full_size }
    }

    fn dataset_item(&self, index: u32) -> Node {
        let count = self.nodes.len();

        let mut mix = self.nodes[index as usize % count];
        mix[0] ^= index;
        mix = keccak512(&node_bytes(&mix));

        for parent in 0..DATASET_PARENTS {
            let parent_index =
                fnv(index ^ parent, mix[parent as usize % HASH_WORDS]) as usize % count;
            let parent = &self.nodes[parent_index];

            for (word, other) in mix.iter_mut().zip(parent) {
                *word = fnv(*word, *other);
            }
        }

        keccak512(&node_bytes(&mix))
    }

    /// Returns `(mix_digest, result)` for `header` and `nonce`.
    pub(crate) fn hashimoto(&self, header: &[u8; 32], nonce: u64) -> ([u8; 32], [u8; 32]) {
        let pages = (self.full_size / MIX_BYTES) as u32;

        let mut seed_input = [0u8; 40];
        seed_input[..32].copy_from_slice(header);
        LittleEndian::write_u64(&mut seed_input[32..], nonce);

        let seed_bytes = Keccak512::digest(seed_input);
        let seed = node_from_bytes(&seed_bytes);

        let mut mix = [0u32; MIX_WORDS];
        mix[..HASH_WORDS].copy_from_slice(&seed);
        mix[HASH_WORDS..].copy_from_slice(&seed);

        for i in 0..ACCESSES {
            let page = fnv(i ^ seed[0], mix[i as usize % MIX_WORDS]) % pages;

            let first = self.dataset_item(page * 2);
            let second = self.dataset_item(page * 2 + 1);

            for (word, other) in mix.iter_mut().zip(first.iter().chain(second.iter())) {
                *word = fnv(*word, *other);
            }
        }

        let mut digest = [0u8; 32];
        for (chunk, words) in digest.chunks_exact_mut(4).zip(mix.chunks_exact(4)) {
            let compressed = fnv(fnv(fnv(words[0], words[1]), words[2]), words[3]);
            LittleEndian::write_u32(chunk, compressed);
        }

        let mut hasher = Keccak256::new();
        hasher.update(seed_bytes);
        hasher.update(digest);

        (digest, hasher.finalize().into())
    }
}

/// Ethash light verifier holding caches for recent epochs. Each epoch is
/// built once, callers racing on a miss wait for the first build.
pub(crate) struct Ethash {
    caches: Mutex<LruCache<u64, Arc<OnceLock<Arc<EpochCache>>>>>,
}

impl Debug for Ethash {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Ethash")
            .field("epochs", &self.caches.lock().len())
            .finish()
    }
}

impl Ethash {
    pub(crate) fn new() -> Self {
        Self {
            caches: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHED_EPOCHS).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub(crate) fn cache(&self, height: u64) -> Arc<EpochCache> {
        let epoch = height / EPOCH_LENGTH;

        let slot = self
            .caches
            .lock()
            .get_or_insert(epoch, || Arc::new(OnceLock::new()))
            .clone();

        slot.get_or_init(|| {
            info!("Generating ethash cache for epoch {epoch}");

            let start = Instant::now();
            let cache = Arc::new(EpochCache::new(epoch));

            info!(
                "Generated ethash cache for epoch {epoch} in {:.1}s",
                start.elapsed().as_secs_f64()
            );

            cache
        })
        .clone()
    }

    /// Builds the cache for `height` on the blocking pool.
    pub(crate) async fn warm(self: &Arc<Self>, height: u64) {
        let ethash = self.clone();

        if let Err(err) = tokio::task::spawn_blocking(move || ethash.cache(height)).await {
            error!("Failed to build ethash cache for height {height}: {err}");
        }
    }

    #[cfg(test)]
    pub(crate) fn insert(&self, epoch: u64, cache: EpochCache) {
        self.caches
            .lock()
            .put(epoch, Arc::new(OnceLock::from(Arc::new(cache))));
    }
}
