use super::*;

pub static DIFF1: LazyLock<BigUint> = LazyLock::new(|| {
    let mut bytes = [0xffu8; 32];
    bytes[0] = 0;
    BigUint::from_bytes_be(&bytes)
});

static MAX_TARGET: LazyLock<BigUint> =
    LazyLock::new(|| BigUint::from_bytes_be(&[0xffu8; 32]));

pub const EXTRANONCE_SIZE: usize = 4;
pub const INSTANCE_ID_SIZE: usize = 4;

/// Bytes reserved in the template blob: worker extranonce, instance id and one spare.
pub const RESERVE_SIZE: usize = EXTRANONCE_SIZE + INSTANCE_ID_SIZE + 1;

pub const BLOB_NONCE_OFFSET: usize = 39;

/// Previous block hash region of a template blob.
const PREV_HASH_RANGE: std::ops::Range<usize> = 7..39;

const MAX_WORKER_JOBS: usize = 4;

const ATOMIC_UNITS_PER_COIN: f64 = 1e12;

/// Blob conversion and proof-of-work hashing for one Cryptonote coin.
pub trait CryptonoteHasher: Debug + Send + Sync + 'static {
    /// Turns a block template blob into the hashing blob, `None` if malformed.
    fn convert_blob(&self, blob: &[u8]) -> Option<Vec<u8>>;

    fn hash(&self, seed_hash: &str, data: &[u8], height: u64) -> [u8; 32];

    /// Identifying block hash of a converted blob.
    fn block_hash(&self, converted: &[u8]) -> [u8; 32];
}

/// Compact target for a stratum difficulty: the top four bytes of
/// `(2^256 - 1) / floor(diff * 255) * 255`, little-endian hex.
pub fn encode_target(difficulty: f64) -> String {
    let scaled = BigUint::from((difficulty * 255.0).floor().max(1.0) as u64);
    let target = ((&*MAX_TARGET / scaled) * BigUint::from(255u32)).min(MAX_TARGET.clone());

    let digits = target.to_bytes_be();
    let mut padded = [0u8; 32];
    padded[32 - digits.len()..].copy_from_slice(&digits);

    let mut top = [padded[0], padded[1], padded[2], padded[3]];
    top.reverse();

    hex::encode(top)
}

fn is_nonce(nonce: &str) -> bool {
    nonce.len() == 8 && nonce.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CryptonoteTemplate {
    #[serde(rename = "blocktemplate_blob")]
    pub blob: String,
    pub reserved_offset: usize,
    pub height: u64,
    pub difficulty: u64,
    #[serde(default)]
    pub seed_hash: String,
    #[serde(default)]
    pub expected_reward: u64,
    #[serde(default)]
    pub prev_hash: String,
}

impl CryptonoteTemplate {
    fn previous_hash_region(&self) -> Option<&str> {
        self.blob
            .get(PREV_HASH_RANGE.start * 2..PREV_HASH_RANGE.end * 2)
    }
}

impl Template for CryptonoteTemplate {
    fn height(&self) -> u64 {
        self.height
    }

    fn is_new(&self, current: Option<&Self>) -> bool {
        match current {
            None => true,
            Some(current) => current.previous_hash_region() != self.previous_hash_region(),
        }
    }
}

/// Work handed to one worker: a pool job with the worker's extranonce
/// spliced into the blob.
#[derive(Debug, Clone)]
pub struct WorkerJob {
    pub id: String,
    pub pool_job_id: String,
    pub height: u64,
    pub extranonce: u32,
    pub difficulty: f64,
    pub seed_hash: String,
    submissions: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CryptonoteSubmission {
    pub worker_job_id: String,
    pub pool_job_id: String,
    pub nonce: String,
    pub result: String,
}

impl Submission for CryptonoteSubmission {
    fn job_id(&self) -> &str {
        &self.pool_job_id
    }
}

#[derive(Debug)]
pub struct CryptonoteJob {
    id: String,
    template: Arc<CryptonoteTemplate>,
    blob: Vec<u8>,
    extranonce: AtomicU32,
}

impl Job for CryptonoteJob {
    type Template = CryptonoteTemplate;

    fn id(&self) -> &str {
        &self.id
    }

    fn template(&self) -> &Arc<CryptonoteTemplate> {
        &self.template
    }

    fn network_difficulty(&self) -> f64 {
        self.template.difficulty as f64
    }
}

impl CryptonoteJob {
    fn blob_with_extranonce(&self, extranonce: u32) -> Vec<u8> {
        let mut blob = self.blob.clone();
        let offset = self.template.reserved_offset;
        blob[offset..offset + EXTRANONCE_SIZE].copy_from_slice(&extranonce.to_be_bytes());
        blob
    }

    fn next_extranonce(&self) -> u32 {
        let extranonce = self.extranonce.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        if extranonce == 0 {
            self.extranonce.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
        } else {
            extranonce
        }
    }
}

#[derive(Debug)]
pub struct CryptonoteContext {
    base: WorkerContext,
    jobs: VecDeque<WorkerJob>,
}

impl Deref for CryptonoteContext {
    type Target = WorkerContext;

    fn deref(&self) -> &WorkerContext {
        &self.base
    }
}

impl DerefMut for CryptonoteContext {
    fn deref_mut(&mut self) -> &mut WorkerContext {
        &mut self.base
    }
}

impl CryptonoteContext {
    fn add_job(&mut self, job: WorkerJob) {
        self.jobs.push_front(job);
        self.jobs.truncate(MAX_WORKER_JOBS);
    }

    pub fn find_job(&self, id: &str) -> Option<&WorkerJob> {
        self.jobs.iter().find(|job| job.id == id)
    }

    fn find_job_mut(&mut self, id: &str) -> Option<&mut WorkerJob> {
        self.jobs.iter_mut().find(|job| job.id == id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CryptonoteConfig {
    pub instance_id: [u8; INSTANCE_ID_SIZE],
}

impl Default for CryptonoteConfig {
    fn default() -> Self {
        Self {
            instance_id: rand::rng().random(),
        }
    }
}

#[derive(Debug)]
pub struct Cryptonote {
    config: CryptonoteConfig,
    hasher: Arc<dyn CryptonoteHasher>,
    next_worker_job: AtomicU64,
}

impl Cryptonote {
    pub fn new(config: CryptonoteConfig, hasher: Arc<dyn CryptonoteHasher>) -> Self {
        Self {
            config,
            hasher,
            next_worker_job: AtomicU64::new(1),
        }
    }

    fn invalid(message: &str) -> ShareError {
        ShareError::InvalidRequest {
            message: message.into(),
        }
    }
}

impl Family for Cryptonote {
    type Template = CryptonoteTemplate;
    type Job = CryptonoteJob;
    type Context = CryptonoteContext;
    type Submission = CryptonoteSubmission;
    type Block = String;

    const NAME: &'static str = "cryptonote";

    const DIALECT: Dialect = Dialect::Login;

    fn create_job(
        &self,
        template: Arc<CryptonoteTemplate>,
        job_id: String,
        _now: DateTime<Utc>,
    ) -> Result<CryptonoteJob> {
        let mut blob = hex::decode(&template.blob).context("invalid template blob")?;

        let instance_offset = template.reserved_offset + EXTRANONCE_SIZE;

        ensure!(
            instance_offset + INSTANCE_ID_SIZE <= blob.len() && BLOB_NONCE_OFFSET + 4 <= blob.len(),
            "template blob of {} bytes too short for reserved offset {}",
            blob.len(),
            template.reserved_offset
        );

        blob[instance_offset..instance_offset + INSTANCE_ID_SIZE]
            .copy_from_slice(&self.config.instance_id);

        Ok(CryptonoteJob {
            id: job_id,
            template,
            blob,
            extranonce: AtomicU32::new(0),
        })
    }

    fn update_stats(&self, job: &CryptonoteJob, stats: &mut BlockchainStats) {
        stats.block_height = job.template.height;
        stats.network_difficulty = job.template.difficulty as f64;
        stats.block_reward = job.template.expected_reward as f64 / ATOMIC_UNITS_PER_COIN;
    }

    fn create_context(&self, base: WorkerContext) -> CryptonoteContext {
        CryptonoteContext {
            base,
            jobs: VecDeque::new(),
        }
    }

    fn login(&self, params: &Value) -> Result<(Authorize, Option<String>), ShareError> {
        let login = params
            .get("login")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|login| !login.is_empty())
            .ok_or_else(|| Self::invalid("missing login"))?;

        let password = params.get("pass").and_then(Value::as_str).map(str::to_string);

        let agent = params
            .get("agent")
            .and_then(Value::as_str)
            .map(|agent| agent.trim().to_string());

        Ok((
            Authorize {
                username: login.to_string(),
                password,
            },
            agent,
        ))
    }

    fn validate_miner(&self, miner: &str) -> bool {
        !miner.is_empty()
            && miner
                .chars()
                .all(|c| c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l'))
    }

    fn job_result(&self, job: &CryptonoteJob, context: &mut CryptonoteContext) -> Value {
        let worker_job = WorkerJob {
            id: format!("{:x}", self.next_worker_job.fetch_add(1, Ordering::Relaxed)),
            pool_job_id: job.id.clone(),
            height: job.template.height,
            extranonce: job.next_extranonce(),
            difficulty: context.difficulty,
            seed_hash: job.template.seed_hash.clone(),
            submissions: HashSet::new(),
        };

        let blob = job.blob_with_extranonce(worker_job.extranonce);

        let blob = match self.hasher.convert_blob(&blob) {
            Some(converted) => hex::encode(converted),
            None => {
                warn!("Failed to convert blob for job {}", job.id);
                return Value::Null;
            }
        };

        let result = json!({
            "job_id": worker_job.id,
            "blob": blob,
            "target": encode_target(worker_job.difficulty),
            "height": worker_job.height,
            "seed_hash": worker_job.seed_hash,
        });

        context.add_job(worker_job);

        result
    }

    fn parse_submission(
        &self,
        context: &CryptonoteContext,
        params: &Value,
    ) -> Result<CryptonoteSubmission, ShareError> {
        let field = |name: &str| {
            params
                .get(name)
                .and_then(Value::as_str)
                .map(|value| value.trim().to_string())
                .unwrap_or_default()
        };

        let worker_job_id = field("job_id");

        let worker_job = context
            .find_job(&worker_job_id)
            .ok_or_else(|| Self::invalid("invalid jobid"))?;

        let submission = CryptonoteSubmission {
            pool_job_id: worker_job.pool_job_id.clone(),
            worker_job_id,
            nonce: field("nonce").to_lowercase(),
            result: field("result").to_lowercase(),
        };

        if submission.nonce.is_empty() || submission.result.is_empty() {
            return Err(Self::invalid("malformed nonce"));
        }

        Ok(submission)
    }

    fn process_share(
        &self,
        job: &CryptonoteJob,
        context: &mut CryptonoteContext,
        submission: &CryptonoteSubmission,
        _now: DateTime<Utc>,
    ) -> Result<(Share, Option<String>), ShareError> {
        let worker_job = context
            .find_job_mut(&submission.worker_job_id)
            .ok_or_else(|| Self::invalid("invalid jobid"))?;

        if worker_job.height != job.template.height {
            return Err(Self::invalid("block expired"));
        }

        if !worker_job.submissions.insert(submission.nonce.clone()) {
            return Err(Self::invalid("duplicate share"));
        }

        let extranonce = worker_job.extranonce;

        if !is_nonce(&submission.nonce) {
            return Err(Self::invalid("malformed nonce"));
        }

        let mut blob = job.blob_with_extranonce(extranonce);
        blob[BLOB_NONCE_OFFSET..BLOB_NONCE_OFFSET + 4]
            .copy_from_slice(&decode_hex(&submission.nonce, "nonce")?);

        let converted = self
            .hasher
            .convert_blob(&blob)
            .ok_or_else(|| Self::invalid("malformed blob"))?;

        let hash = self
            .hasher
            .hash(&job.template.seed_hash, &converted, job.template.height);

        if hex::encode(hash) != submission.result {
            return Err(Self::invalid("bad hash"));
        }

        let hash_value = BigUint::from_bytes_le(&hash);

        let share_difficulty = ShareDifficulty::new(&DIFF1, &hash_value);

        let is_block_candidate =
            *DIFF1 >= BigUint::from(job.template.difficulty) * &hash_value;

        let difficulty = credited_difficulty(&share_difficulty, context, is_block_candidate)?;

        let mut share = Share {
            block_height: job.template.height,
            network_difficulty: job.template.difficulty as f64,
            difficulty,
            ..Default::default()
        };

        if !is_block_candidate {
            return Ok((share, None));
        }

        share.is_block_candidate = true;
        share.block_hash = Some(hex::encode(self.hasher.block_hash(&converted)));
        share.block_reward = job.template.expected_reward as f64 / ATOMIC_UNITS_PER_COIN;

        Ok((share, Some(hex::encode(blob))))
    }

    fn work(
        &self,
        job: &CryptonoteJob,
        context: &mut CryptonoteContext,
        _difficulty_changed: bool,
        _clean_jobs: bool,
    ) -> Vec<Message> {
        let params = self.job_result(job, context);

        if params.is_null() {
            return Vec::new();
        }

        vec![Message::notification(Method::Job.to_string(), params)]
    }

    fn submit_result(&self) -> Value {
        json!({ "status": "OK" })
    }
}

#[derive(Debug, Deserialize)]
struct SubmitBlockResponse {
    #[serde(default)]
    status: String,
}

/// Monero-compatible daemon (`json_rpc` endpoint).
#[derive(Debug)]
pub struct CryptonoteUpstream {
    daemon: DaemonClient,
    wallet_address: String,
}

impl CryptonoteUpstream {
    pub fn new(daemon: DaemonClient, wallet_address: String) -> Self {
        Self {
            daemon,
            wallet_address,
        }
    }
}

#[async_trait]
impl Upstream<Cryptonote> for CryptonoteUpstream {
    async fn block_template(&self) -> Result<CryptonoteTemplate> {
        self.daemon
            .call(
                "getblocktemplate",
                json!({
                    "wallet_address": self.wallet_address,
                    "reserve_size": RESERVE_SIZE,
                }),
            )
            .await
    }

    async fn submit_block(&self, share: &Share, blob: &String) -> Result<SubmitResult> {
        let response = match self
            .daemon
            .call::<SubmitBlockResponse>("submitblock", json!([blob]))
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!("Block {} submission failed: {err}", share.block_height);
                return Ok(SubmitResult::rejected());
            }
        };

        if response.status != "OK" {
            warn!(
                "Block {} submission failed with status {}",
                share.block_height, response.status
            );
            return Ok(SubmitResult::rejected());
        }

        Ok(SubmitResult::accepted(share.block_hash.clone()))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, bitcoind::sha256d, pretty_assertions::assert_eq};

    /// Identity blob conversion and a truncated double SHA-256 in place of the real PoW.
    #[derive(Debug)]
    struct TestHasher;

    impl CryptonoteHasher for TestHasher {
        fn convert_blob(&self, blob: &[u8]) -> Option<Vec<u8>> {
            (blob.len() > BLOB_NONCE_OFFSET).then(|| blob.to_vec())
        }

        fn hash(&self, seed_hash: &str, data: &[u8], _height: u64) -> [u8; 32] {
            let mut input = seed_hash.as_bytes().to_vec();
            input.extend_from_slice(data);
            let mut hash = sha256d(&input);
            hash[31] = 0;
            hash
        }

        fn block_hash(&self, converted: &[u8]) -> [u8; 32] {
            let mut hash = sha256d(converted);
            hash.reverse();
            hash
        }
    }

    const RESERVED_OFFSET: usize = 60;

    fn template(difficulty: u64, prev: u8) -> CryptonoteTemplate {
        let mut blob = vec![0x11u8; 76];
        blob[PREV_HASH_RANGE].fill(prev);

        CryptonoteTemplate {
            blob: hex::encode(blob),
            reserved_offset: RESERVED_OFFSET,
            height: 3_000_000,
            difficulty,
            seed_hash: "ab".repeat(32),
            expected_reward: 600_000_000_000,
            prev_hash: String::new(),
        }
    }

    fn family() -> Cryptonote {
        Cryptonote::new(
            CryptonoteConfig {
                instance_id: [1, 2, 3, 4],
            },
            Arc::new(TestHasher),
        )
    }

    fn context(family: &Cryptonote, difficulty: f64) -> CryptonoteContext {
        family.create_context(WorkerContext::new(
            difficulty,
            None,
            BouncerConfig::default(),
            Utc::now(),
        ))
    }

    fn solve(family: &Cryptonote, job: &CryptonoteJob, worker_job: &WorkerJob, nonce: &str) -> String {
        let mut blob = job.blob_with_extranonce(worker_job.extranonce);
        blob[BLOB_NONCE_OFFSET..BLOB_NONCE_OFFSET + 4].copy_from_slice(&hex::decode(nonce).unwrap());
        hex::encode(family.hasher.hash(&job.template.seed_hash, &blob, 0))
    }

    #[test]
    fn targets() {
        assert_eq!(encode_target(1.0), "ffffffff");
        assert_eq!(encode_target(2.0), "ffffff7f");
        assert_eq!(encode_target(256.0), "ffffff00");
    }

    #[test]
    fn new_block_detection() {
        let first = template(100, 1);
        let same = CryptonoteTemplate {
            height: first.height + 1,
            ..template(100, 1)
        };

        assert!(first.is_new(None));
        assert!(!same.is_new(Some(&first)));
        assert!(template(100, 2).is_new(Some(&first)));
    }

    #[test]
    fn job_blob_carries_instance_and_extranonce() {
        let family = family();
        let job = family
            .create_job(Arc::new(template(100, 1)), "1".into(), Utc::now())
            .unwrap();
        let mut context = context(&family, 1.0);

        let result = family.job_result(&job, &mut context);

        let blob = hex::decode(result["blob"].as_str().unwrap()).unwrap();
        assert_eq!(&blob[RESERVED_OFFSET..RESERVED_OFFSET + 4], &[0, 0, 0, 1]);
        assert_eq!(&blob[RESERVED_OFFSET + 4..RESERVED_OFFSET + 8], &[1, 2, 3, 4]);

        assert_eq!(result["target"], "ffffffff");
        assert_eq!(result["height"], 3_000_000);
        assert_eq!(result["seed_hash"], "ab".repeat(32));

        let second = family.job_result(&job, &mut context);
        assert_ne!(second["job_id"], result["job_id"]);
        assert_eq!(
            &hex::decode(second["blob"].as_str().unwrap()).unwrap()[RESERVED_OFFSET..RESERVED_OFFSET + 4],
            &[0, 0, 0, 2]
        );
    }

    #[test]
    fn worker_job_list_is_bounded() {
        let family = family();
        let job = family
            .create_job(Arc::new(template(100, 1)), "1".into(), Utc::now())
            .unwrap();
        let mut context = context(&family, 1.0);

        let first = family.job_result(&job, &mut context)["job_id"]
            .as_str()
            .unwrap()
            .to_string();

        for _ in 0..MAX_WORKER_JOBS {
            family.job_result(&job, &mut context);
        }

        assert_eq!(context.jobs.len(), MAX_WORKER_JOBS);
        assert!(context.find_job(&first).is_none());

        assert_eq!(
            family
                .parse_submission(&context, &json!({"id": "c1", "job_id": first, "nonce": "00000001", "result": "00"}))
                .unwrap_err(),
            ShareError::InvalidRequest {
                message: "invalid jobid".into()
            }
        );
    }

    #[test]
    fn share_validation() {
        let family = family();
        let job = family
            .create_job(Arc::new(template(u64::MAX, 1)), "1".into(), Utc::now())
            .unwrap();
        let mut context = context(&family, 1e-9);

        let result = family.job_result(&job, &mut context);
        let worker_job = context.find_job(result["job_id"].as_str().unwrap()).unwrap().clone();

        let submit = |nonce: &str, result: &str| {
            json!({"id": "c1", "job_id": worker_job.id, "nonce": nonce, "result": result})
        };

        let submission = family
            .parse_submission(&context, &submit("0000000g", "00"))
            .unwrap();
        assert_eq!(submission.job_id(), "1");
        assert_eq!(
            family
                .process_share(&job, &mut context, &submission, Utc::now())
                .unwrap_err(),
            ShareError::InvalidRequest {
                message: "malformed nonce".into()
            }
        );

        let submission = family
            .parse_submission(&context, &submit("00000001", &"00".repeat(32)))
            .unwrap();
        assert_eq!(
            family
                .process_share(&job, &mut context, &submission, Utc::now())
                .unwrap_err(),
            ShareError::InvalidRequest {
                message: "bad hash".into()
            }
        );

        let hash = solve(&family, &job, &worker_job, "00000002");
        let submission = family
            .parse_submission(&context, &submit("00000002", &hash))
            .unwrap();
        let (share, block) = family
            .process_share(&job, &mut context, &submission, Utc::now())
            .unwrap();

        assert!(!share.is_block_candidate);
        assert_eq!(block, None);
        assert_eq!(share.difficulty, 1e-9);
        assert_eq!(share.network_difficulty, u64::MAX as f64);

        assert_eq!(
            family
                .process_share(&job, &mut context, &submission, Utc::now())
                .unwrap_err(),
            ShareError::InvalidRequest {
                message: "duplicate share".into()
            }
        );
    }

    #[test]
    fn block_candidate() {
        let family = family();
        let job = family
            .create_job(Arc::new(template(1, 1)), "1".into(), Utc::now())
            .unwrap();
        let mut context = context(&family, 1e-9);

        let result = family.job_result(&job, &mut context);
        let worker_job = context.find_job(result["job_id"].as_str().unwrap()).unwrap().clone();

        let hash = solve(&family, &job, &worker_job, "0000abcd");

        let submission = family
            .parse_submission(
                &context,
                &json!({"id": "c1", "job_id": worker_job.id, "nonce": "0000ABCD", "result": hash}),
            )
            .unwrap();

        let (share, block) = family
            .process_share(&job, &mut context, &submission, Utc::now())
            .unwrap();

        assert!(share.is_block_candidate);
        assert_eq!(share.block_reward, 0.6);
        assert_eq!(share.block_hash.as_ref().map(String::len), Some(64));

        let block = hex::decode(block.unwrap()).unwrap();
        assert_eq!(&block[BLOB_NONCE_OFFSET..BLOB_NONCE_OFFSET + 4], &[0, 0, 0xab, 0xcd]);
    }

    #[test]
    fn login_params() {
        let family = family();

        let (authorize, agent) = family
            .login(&json!({"login": " 4Addr.rig ", "pass": "x,d=5000", "agent": "xmrig/6"}))
            .unwrap();

        assert_eq!(authorize.username, "4Addr.rig");
        assert_eq!(authorize.static_difficulty(), Some(5000.0));
        assert_eq!(agent.as_deref(), Some("xmrig/6"));

        assert_eq!(
            family.login(&json!({"pass": "x"})).unwrap_err(),
            ShareError::InvalidRequest {
                message: "missing login".into()
            }
        );
    }
}
