use {super::*, ethash::Ethash};

pub const STRATUM_VERSION: &str = "EthereumStratum/1.0.0";

pub const EXTRANONCE_SIZE: usize = 2;

static TWO_POW_256: LazyLock<BigUint> = LazyLock::new(|| BigUint::one() << 256usize);

/// Shares are credited in units of 2^32 hashes.
const POW_2_32: f64 = 4_294_967_296.0;

const DEFAULT_WORKER: &str = "0";

fn is_address(address: &str) -> bool {
    let Some(digits) = address.strip_prefix("0x") else {
        return false;
    };

    digits.len() == 40
        && digits.chars().all(|c| c.is_ascii_hexdigit())
        && digits.chars().any(|c| c != '0')
}

fn is_worker_name(worker: &str) -> bool {
    !worker.is_empty()
        && worker.len() <= 64
        && worker
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn strip_hex_prefix(value: &str) -> &str {
    value.strip_prefix("0x").unwrap_or(value)
}

/// `eth_getWork` answer, extended with the pending height.
#[derive(Debug, Clone, PartialEq)]
pub struct EthereumTemplate {
    pub header: String,
    pub seed: String,
    pub target: String,
    pub height: u64,
}

impl EthereumTemplate {
    pub fn from_work(work: &[String], latest_height: Option<u64>) -> Result<Self> {
        ensure!(work.len() >= 3, "eth_getWork returned {} fields", work.len());

        let height = match work.get(3) {
            Some(height) => u64::from_str_radix(strip_hex_prefix(height), 16)
                .with_context(|| format!("invalid block height `{height}`"))?,
            None => latest_height.context("pending block height unknown")? + 1,
        };

        Ok(Self {
            header: work[0].clone(),
            seed: work[1].clone(),
            target: work[2].clone(),
            height,
        })
    }
}

impl Template for EthereumTemplate {
    fn height(&self) -> u64 {
        self.height
    }

    fn is_new(&self, current: Option<&Self>) -> bool {
        match current {
            None => true,
            Some(current) => current.height < self.height || current.header != self.header,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EthereumSubmission {
    pub worker: String,
    pub job_id: String,
    pub nonce: String,
}

impl Submission for EthereumSubmission {
    fn job_id(&self) -> &str {
        &self.job_id
    }
}

/// What `eth_submitWork` takes.
#[derive(Debug, Clone, PartialEq)]
pub struct EthereumBlock {
    pub nonce: String,
    pub header: String,
    pub mix_digest: String,
}

#[derive(Debug)]
pub struct EthereumJob {
    id: String,
    template: Arc<EthereumTemplate>,
    header: [u8; 32],
    target: BigUint,
    difficulty: f64,
    nonces: DashSet<String>,
}

impl Job for EthereumJob {
    type Template = EthereumTemplate;

    fn id(&self) -> &str {
        &self.id
    }

    fn template(&self) -> &Arc<EthereumTemplate> {
        &self.template
    }

    fn network_difficulty(&self) -> f64 {
        self.difficulty
    }
}

impl EthereumJob {
    pub fn new(id: String, template: Arc<EthereumTemplate>) -> Result<Self> {
        let target = big_from_hex(&template.target)?;

        ensure!(!target.is_zero(), "zero block target");

        let header = hex::decode(strip_hex_prefix(&template.header))
            .ok()
            .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
            .with_context(|| format!("invalid header hash `{}`", template.header))?;

        Ok(Self {
            id,
            difficulty: (&*TWO_POW_256 / &target).to_f64().unwrap_or(f64::MAX),
            header,
            target,
            template,
            nonces: DashSet::new(),
        })
    }

    pub fn notify_params(&self, clean_jobs: bool) -> Value {
        json!([
            self.id,
            strip_hex_prefix(&self.template.seed),
            strip_hex_prefix(&self.template.header),
            clean_jobs,
        ])
    }
}

#[derive(Debug)]
pub struct EthereumContext {
    base: WorkerContext,
    pub extranonce1: String,
    connection_id: String,
}

impl Deref for EthereumContext {
    type Target = WorkerContext;

    fn deref(&self) -> &WorkerContext {
        &self.base
    }
}

impl DerefMut for EthereumContext {
    fn deref_mut(&mut self) -> &mut WorkerContext {
        &mut self.base
    }
}

#[derive(Debug)]
pub struct Ethereum {
    extranonce: ExtraNonceProvider,
    ethash: Arc<Ethash>,
}

impl Ethereum {
    pub fn new(extranonce: ExtraNonceProvider) -> Result<Self> {
        ensure!(
            extranonce.size() == EXTRANONCE_SIZE,
            "ethereum pools use {EXTRANONCE_SIZE} byte extranonces, got {}",
            extranonce.size()
        );

        Ok(Self {
            extranonce,
            ethash: Arc::new(Ethash::new()),
        })
    }
}

impl Family for Ethereum {
    type Template = EthereumTemplate;
    type Job = EthereumJob;
    type Context = EthereumContext;
    type Submission = EthereumSubmission;
    type Block = EthereumBlock;

    const NAME: &'static str = "ethereum";

    fn share_multiplier(&self) -> f64 {
        1.0 / POW_2_32
    }

    fn job_id(&self, sequence: u64) -> String {
        format!("{sequence:08x}")
    }

    async fn prepare(&self, template: &EthereumTemplate) {
        self.ethash.warm(template.height).await;
    }

    fn create_job(
        &self,
        template: Arc<EthereumTemplate>,
        job_id: String,
        _now: DateTime<Utc>,
    ) -> Result<EthereumJob> {
        let job = EthereumJob::new(job_id, template)?;

        self.ethash.cache(job.template.height);

        Ok(job)
    }

    fn update_stats(&self, job: &EthereumJob, stats: &mut BlockchainStats) {
        stats.block_height = job.template.height;
        stats.network_difficulty = job.difficulty;
        stats.next_network_target = job.template.target.clone();
    }

    fn create_context(&self, base: WorkerContext) -> EthereumContext {
        EthereumContext {
            base,
            extranonce1: String::new(),
            connection_id: String::new(),
        }
    }

    fn subscribe(
        &self,
        context: &mut EthereumContext,
        connection_id: &str,
        params: &Value,
    ) -> Result<Value, ShareError> {
        let invalid = || ShareError::InvalidRequest {
            message: "invalid request".into(),
        };

        let params = string_params(params, 2).map_err(|_| invalid())?;

        if params.iter().any(String::is_empty) {
            return Err(invalid());
        }

        context.extranonce1 = self.extranonce.next();
        context.connection_id = connection_id.to_string();

        Ok(json!([
            [Method::Notify.to_string(), connection_id, STRATUM_VERSION],
            context.extranonce1,
        ]))
    }

    fn validate_miner(&self, miner: &str) -> bool {
        is_address(miner)
    }

    fn split_username(&self, username: &str) -> (String, String) {
        let (miner, worker) = username.split_once('.').unwrap_or((username, ""));

        let worker = worker.trim();

        (
            miner.trim().to_lowercase(),
            if is_worker_name(worker) {
                worker.to_string()
            } else {
                DEFAULT_WORKER.to_string()
            },
        )
    }

    fn parse_submission(
        &self,
        context: &EthereumContext,
        params: &Value,
    ) -> Result<EthereumSubmission, ShareError> {
        let malformed = || ShareError::InvalidRequest {
            message: "malformed PoW result".into(),
        };

        let params = string_params(params, 3).map_err(|_| malformed())?;

        if params.len() != 3 || params.iter().any(String::is_empty) {
            return Err(malformed());
        }

        if context.extranonce1.is_empty() {
            return Err(ShareError::NotSubscribed);
        }

        Ok(EthereumSubmission {
            worker: params[0].clone(),
            job_id: params[1].clone(),
            nonce: params[2].clone(),
        })
    }

    fn process_share(
        &self,
        job: &EthereumJob,
        context: &mut EthereumContext,
        submission: &EthereumSubmission,
        _now: DateTime<Utc>,
    ) -> Result<(Share, Option<EthereumBlock>), ShareError> {
        let key = format!("{}:{}", context.connection_id, submission.nonce);

        if !register_submission(&job.nonces, key) {
            return Err(ShareError::InvalidRequest {
                message: "duplicate share".into(),
            });
        }

        let full_nonce_hex = format!("{}{}", context.extranonce1, submission.nonce);

        let full_nonce = u64::from_str_radix(&full_nonce_hex, 16)
            .ok()
            .filter(|_| full_nonce_hex.len() <= 16 && !full_nonce_hex.starts_with('+'))
            .ok_or_else(|| ShareError::InvalidRequest {
                message: format!("bad nonce {full_nonce_hex}"),
            })?;

        let (mix_digest, result) = self
            .ethash
            .cache(job.template.height)
            .hashimoto(&job.header, full_nonce);

        let result_value = BigUint::from_bytes_be(&result);

        let share_difficulty =
            ShareDifficulty::new(&TWO_POW_256, &result_value).scaled(self.share_multiplier());

        let is_block_candidate = result_value <= job.target;

        let difficulty = credited_difficulty(&share_difficulty, context, is_block_candidate)?;

        let mut share = Share {
            block_height: job.template.height,
            network_difficulty: job.difficulty,
            difficulty: difficulty * POW_2_32,
            ..Default::default()
        };

        if !is_block_candidate {
            return Ok((share, None));
        }

        share.is_block_candidate = true;

        Ok((
            share,
            Some(EthereumBlock {
                nonce: format!("0x{full_nonce_hex}"),
                header: job.template.header.clone(),
                mix_digest: format!("0x{}", hex::encode(mix_digest)),
            }),
        ))
    }

    fn work(
        &self,
        job: &EthereumJob,
        context: &mut EthereumContext,
        difficulty_changed: bool,
        clean_jobs: bool,
    ) -> Vec<Message> {
        let mut messages = Vec::new();

        if difficulty_changed {
            messages.push(set_difficulty(context.difficulty));
        }

        messages.push(Message::notification(
            Method::Notify.to_string(),
            job.notify_params(clean_jobs),
        ));

        messages
    }
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    number: String,
}

/// Node speaking the `eth_*` JSON-RPC API.
#[derive(Debug)]
pub struct EthereumUpstream {
    daemon: DaemonClient,
}

impl EthereumUpstream {
    pub fn new(daemon: DaemonClient) -> Self {
        Self { daemon }
    }
}

#[async_trait]
impl Upstream<Ethereum> for EthereumUpstream {
    async fn block_template(&self) -> Result<EthereumTemplate> {
        let work = self
            .daemon
            .call::<Vec<String>>("eth_getWork", json!([]))
            .await?;

        let latest = if work.len() < 4 {
            let block = self
                .daemon
                .call::<BlockHeader>("eth_getBlockByNumber", json!(["latest", false]))
                .await?;

            Some(
                u64::from_str_radix(strip_hex_prefix(&block.number), 16)
                    .with_context(|| format!("invalid block number `{}`", block.number))?,
            )
        } else {
            None
        };

        EthereumTemplate::from_work(&work, latest)
    }

    async fn submit_block(&self, share: &Share, block: &EthereumBlock) -> Result<SubmitResult> {
        let accepted = self
            .daemon
            .call_optional::<bool>(
                "eth_submitWork",
                json!([block.nonce, block.header, block.mix_digest]),
            )
            .await?
            .unwrap_or(false);

        if !accepted {
            warn!("Block {} submission failed", share.block_height);
            return Ok(SubmitResult::rejected());
        }

        Ok(SubmitResult::accepted(None))
    }
}
