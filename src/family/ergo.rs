use {
    super::*,
    bitcoind::DIFF1,
    blake2::{Blake2b, Digest, digest::consts::U32},
    serde_json::value::RawValue,
    tokio::sync::OnceCell,
};

type Blake2b256 = Blake2b<U32>;

/// Total nonce size, split between extranonce1 and extranonce2.
pub const NONCE_SIZE: usize = 8;

/// Shares are credited at 1/256 of their stratum difficulty.
pub const SHARE_MULTIPLIER: f64 = 256.0;

const N_BASE: u64 = 1 << 26;
const INCREASE_START: u64 = 600 * 1024;
const INCREASE_PERIOD: u64 = 50 * 1024;
const N_INCREASE_HEIGHT_MAX: u64 = 9_216_000;
const N_MAX: u64 = 2_147_387_550;

const ELEMENTS: usize = 32;

static M: LazyLock<Vec<u8>> =
    LazyLock::new(|| (0u64..1024).flat_map(u64::to_be_bytes).collect());

fn blake2b256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();

    for part in parts {
        hasher.update(part);
    }

    hasher.finalize().into()
}

/// Autolykos table size for `height`.
pub fn calc_n(height: u64) -> u64 {
    let height = height.min(N_INCREASE_HEIGHT_MAX);

    if height < INCREASE_START {
        return N_BASE;
    }

    if height >= N_INCREASE_HEIGHT_MAX {
        return N_MAX;
    }

    let iterations = (height - INCREASE_START) / INCREASE_PERIOD + 1;

    (0..iterations).fold(N_BASE, |step, _| step / 100 * 105)
}

/// Autolykos v2 proof-of-work hit for `msg` and `nonce` at `height`.
pub fn autolykos_hash(msg: &[u8], nonce: &[u8], height: u64) -> BigUint {
    let n = calc_n(height);

    let hash = blake2b256(&[msg, nonce]);

    let i = (BigEndian::read_u64(&hash[24..32]) % n) as u32;
    let h = (height as u32).to_be_bytes();

    let e = blake2b256(&[&i.to_be_bytes()[..], &h[..], M.as_slice()]);

    let seed = blake2b256(&[&e[1..], msg, nonce]);

    let mut extended = [0u8; 64];
    extended[..32].copy_from_slice(&seed);
    extended[32..].copy_from_slice(&seed);

    let f = (0..ELEMENTS)
        .map(|offset| {
            let index = (u64::from(BigEndian::read_u32(&extended[offset..offset + 4])) % n) as u32;
            let element = blake2b256(&[&index.to_be_bytes()[..], &h[..], M.as_slice()]);
            BigUint::from_bytes_be(&element[1..])
        })
        .fold(BigUint::zero(), |sum, element| sum + element);

    let mut f_bytes = [0u8; 32];
    let digits = f.to_bytes_be();
    f_bytes[32 - digits.len()..].copy_from_slice(&digits);

    BigUint::from_bytes_be(&blake2b256(&[&f_bytes[..]]))
}

/// Share target sent in `mining.notify` for a stratum difficulty.
pub fn share_target(difficulty: f64) -> BigUint {
    let scale = (65536.0 / difficulty).floor().max(0.0) as u64;

    (&*DIFF1 * BigUint::from(scale)) >> 16usize
}

fn big_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
    let raw = Box::<RawValue>::deserialize(deserializer)?;

    let digits = raw.get().trim().trim_matches('"');

    BigUint::parse_bytes(digits.as_bytes(), 10)
        .ok_or_else(|| <D::Error as serde::de::Error>::custom(format!("invalid integer `{digits}`")))
}

/// `/mining/candidate` answer.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ErgoTemplate {
    pub msg: String,
    #[serde(deserialize_with = "big_number")]
    pub b: BigUint,
    pub h: u64,
    #[serde(default)]
    pub pk: String,
    #[serde(default)]
    pub version: u32,
}

impl Template for ErgoTemplate {
    fn height(&self) -> u64 {
        self.h
    }

    fn is_new(&self, current: Option<&Self>) -> bool {
        match current {
            None => true,
            Some(current) => current.msg != self.msg || self.h > current.h,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErgoSubmission {
    pub worker: String,
    pub job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
}

impl Submission for ErgoSubmission {
    fn job_id(&self) -> &str {
        &self.job_id
    }
}

#[derive(Debug)]
pub struct ErgoJob {
    id: String,
    template: Arc<ErgoTemplate>,
    msg: Vec<u8>,
    difficulty: f64,
    submissions: DashSet<String>,
}

impl Job for ErgoJob {
    type Template = ErgoTemplate;

    fn id(&self) -> &str {
        &self.id
    }

    fn template(&self) -> &Arc<ErgoTemplate> {
        &self.template
    }

    fn network_difficulty(&self) -> f64 {
        self.difficulty
    }
}

impl ErgoJob {
    pub fn notify_params(&self, target: &BigUint, clean_jobs: bool) -> Value {
        json!([
            self.id,
            self.template.h,
            self.template.msg,
            "",
            "",
            self.template.version,
            target.to_string(),
            "",
            clean_jobs,
        ])
    }
}

#[derive(Debug)]
pub struct ErgoContext {
    base: WorkerContext,
    pub extranonce1: String,
}

impl Deref for ErgoContext {
    type Target = WorkerContext;

    fn deref(&self) -> &WorkerContext {
        &self.base
    }
}

impl DerefMut for ErgoContext {
    fn deref_mut(&mut self) -> &mut WorkerContext {
        &mut self.base
    }
}

#[derive(Debug)]
pub struct Ergo {
    extranonce: ExtraNonceProvider,
    extranonce2_size: usize,
}

impl Ergo {
    pub fn new(extranonce: ExtraNonceProvider) -> Result<Self> {
        ensure!(
            extranonce.size() < NONCE_SIZE,
            "extranonce1 of {} bytes leaves no room for extranonce2",
            extranonce.size()
        );

        Ok(Self {
            extranonce2_size: NONCE_SIZE - extranonce.size(),
            extranonce,
        })
    }
}

impl Family for Ergo {
    type Template = ErgoTemplate;
    type Job = ErgoJob;
    type Context = ErgoContext;
    type Submission = ErgoSubmission;
    type Block = String;

    const NAME: &'static str = "ergo";

    fn share_multiplier(&self) -> f64 {
        SHARE_MULTIPLIER
    }

    fn create_job(
        &self,
        template: Arc<ErgoTemplate>,
        job_id: String,
        _now: DateTime<Utc>,
    ) -> Result<ErgoJob> {
        ensure!(!template.b.is_zero(), "zero block target");

        let msg = hex::decode(&template.msg)
            .with_context(|| format!("invalid candidate message `{}`", template.msg))?;

        Ok(ErgoJob {
            id: job_id,
            difficulty: target_difficulty(&DIFF1, &template.b),
            msg,
            template,
            submissions: DashSet::new(),
        })
    }

    fn update_stats(&self, job: &ErgoJob, stats: &mut BlockchainStats) {
        stats.block_height = job.template.h;
        stats.network_difficulty = job.difficulty;
        stats.next_network_target = job.template.b.to_string();
    }

    fn create_context(&self, base: WorkerContext) -> ErgoContext {
        ErgoContext {
            base,
            extranonce1: String::new(),
        }
    }

    fn subscribe(
        &self,
        context: &mut ErgoContext,
        connection_id: &str,
        _params: &Value,
    ) -> Result<Value, ShareError> {
        context.extranonce1 = self.extranonce.next();

        Ok(json!([
            [
                [Method::SetDifficulty.to_string(), connection_id],
                [Method::Notify.to_string(), connection_id],
            ],
            context.extranonce1,
            self.extranonce2_size,
        ]))
    }

    fn parse_submission(
        &self,
        context: &ErgoContext,
        params: &Value,
    ) -> Result<ErgoSubmission, ShareError> {
        let params = string_params(params, 5)?;

        if context.extranonce1.is_empty() {
            return Err(ShareError::NotSubscribed);
        }

        if params[2].is_empty() || params[4].is_empty() {
            return Err(ShareError::other("invalid params"));
        }

        let ntime = match params[3].as_str() {
            "undefined" => String::new(),
            ntime => ntime.to_string(),
        };

        Ok(ErgoSubmission {
            worker: params[0].clone(),
            job_id: params[1].clone(),
            extranonce2: params[2].clone(),
            ntime,
            nonce: params[4].clone(),
        })
    }

    fn process_share(
        &self,
        job: &ErgoJob,
        context: &mut ErgoContext,
        submission: &ErgoSubmission,
        _now: DateTime<Utc>,
    ) -> Result<(Share, Option<String>), ShareError> {
        let nonce = &submission.nonce;

        if nonce.len() != context.extranonce1.len() + self.extranonce2_size * 2 {
            return Err(ShareError::other("incorrect size of nonce"));
        }

        if !nonce.starts_with(&context.extranonce1) {
            let got = nonce.get(..context.extranonce1.len()).unwrap_or(nonce);
            return Err(ShareError::other(format!(
                "incorrect extraNonce2 in nonce (expected {}, got {got})",
                context.extranonce1
            )));
        }

        if !register_submission(&job.submissions, format!("{}{nonce}", submission.ntime)) {
            return Err(ShareError::DuplicateShare);
        }

        let nonce_bytes = decode_hex(nonce, "nonce")?;

        let hit = autolykos_hash(&job.msg, &nonce_bytes, job.template.h);

        let share_difficulty = ShareDifficulty::new(&DIFF1, &hit);
        let is_block_candidate = hit < job.template.b;

        let difficulty = credited_difficulty(&share_difficulty, context, is_block_candidate)?;

        let share = Share {
            block_height: job.template.h,
            network_difficulty: job.difficulty,
            difficulty: difficulty / SHARE_MULTIPLIER,
            is_block_candidate,
            ..Default::default()
        };

        Ok((share, is_block_candidate.then(|| nonce.clone())))
    }

    fn work(
        &self,
        job: &ErgoJob,
        context: &mut ErgoContext,
        _difficulty_changed: bool,
        clean_jobs: bool,
    ) -> Vec<Message> {
        vec![
            set_difficulty(1.0),
            Message::notification(
                Method::Notify.to_string(),
                job.notify_params(&share_target(context.difficulty), clean_jobs),
            ),
        ]
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressValidity {
    is_valid: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeParameters {
    block_version: u32,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    parameters: NodeParameters,
}

/// Ergo node REST API.
#[derive(Debug)]
pub struct ErgoUpstream {
    daemon: DaemonClient,
    block_version: OnceCell<u32>,
}

impl ErgoUpstream {
    pub fn new(daemon: DaemonClient) -> Self {
        Self {
            daemon,
            block_version: OnceCell::new(),
        }
    }
}

#[async_trait]
impl Upstream<Ergo> for ErgoUpstream {
    async fn block_template(&self) -> Result<ErgoTemplate> {
        let version = *self
            .block_version
            .get_or_try_init(|| async {
                self.daemon
                    .get::<NodeInfo>("info")
                    .await
                    .map(|info| info.parameters.block_version)
            })
            .await?;

        let mut template = self.daemon.get::<ErgoTemplate>("mining/candidate").await?;

        template.version = version;

        Ok(template)
    }

    async fn submit_block(&self, share: &Share, nonce: &String) -> Result<SubmitResult> {
        if !self
            .daemon
            .post("mining/solution", &json!({ "n": nonce }))
            .await?
        {
            warn!("Block {} submission failed", share.block_height);
            return Ok(SubmitResult::rejected());
        }

        Ok(SubmitResult::accepted(None))
    }

    async fn validate_address(&self, address: &str) -> Result<bool> {
        let validity = self
            .daemon
            .get::<AddressValidity>(&format!("utils/address/{address}"))
            .await?;

        if let Some(error) = validity.error.filter(|_| !validity.is_valid) {
            debug!("Address {address} rejected by node: {error}");
        }

        Ok(validity.is_valid)
    }
}
