use {
    super::*,
    bitcoin::{
        ScriptBuf, TxOut,
        consensus::{self, encode::VarInt},
        script::Builder,
    },
    bitcoind::{prefixed_address_script, sha256d},
};

pub static DIFF1: LazyLock<BigUint> = LazyLock::new(|| {
    let mut bytes = [0xffu8; 32];
    bytes[0] = 0x00;
    bytes[1] = 0x07;
    BigUint::from_bytes_be(&bytes)
});

pub const NONCE_SIZE: usize = 32;

const HEADER_SIZE: usize = 140;

/// Bytes of the header the Equihash input covers, everything before the nonce.
const SOLVER_INPUT_SIZE: usize = 108;

const OVERWINTER_FLAG: u32 = 1 << 31;

const ZATOSHIS_PER_COIN: f64 = 100_000_000.0;

const MAX_FUTURE_NTIME: i64 = 7200;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FundingStream {
    #[serde(rename = "valueZat")]
    pub value_zat: u64,
    #[serde(default)]
    pub value: f64,
    pub address: String,
}

/// `getblocksubsidy` answer.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct BlockSubsidy {
    pub miner: f64,
    #[serde(default)]
    pub founders: Option<f64>,
    #[serde(default)]
    pub community: Option<f64>,
    #[serde(default, rename = "fundingstreams")]
    pub funding_streams: Vec<FundingStream>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EquihashTransaction {
    pub data: String,
    pub hash: String,
    #[serde(default)]
    pub fee: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EquihashTemplate {
    pub version: u32,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: BlockHash,
    #[serde(default)]
    pub transactions: Vec<EquihashTransaction>,
    #[serde(rename = "coinbasevalue", default)]
    pub coinbase_value: u64,
    pub target: String,
    pub curtime: u32,
    pub bits: String,
    pub height: u64,
    #[serde(default, rename = "finalsaplingroothash")]
    pub final_sapling_root_hash: Option<String>,
    #[serde(default)]
    pub solution: Option<String>,
    #[serde(default)]
    pub subsidy: Option<BlockSubsidy>,
}

impl Template for EquihashTemplate {
    fn height(&self) -> u64 {
        self.height
    }

    fn is_new(&self, current: Option<&Self>) -> bool {
        match current {
            None => true,
            Some(current) => {
                self.previous_block_hash != current.previous_block_hash
                    || self.height > current.height
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Upgrade {
    pub activation_height: u64,
    pub tx_version: u32,
    pub version_group_id: u32,
}

/// Consensus parameters of one Equihash chain.
#[derive(Debug, Clone, PartialEq)]
pub struct EquihashParams {
    pub n: u32,
    pub k: u32,
    pub solution_size: usize,
    pub solution_preamble_size: usize,
    pub overwinter: Option<Upgrade>,
    pub sapling: Option<Upgrade>,
    pub pay_funding_stream: bool,
    pub pay_founders_reward: bool,
    pub percent_founders_reward: f64,
    pub founders_reward_addresses: Vec<String>,
    pub last_founders_reward_block_height: u64,
    pub percent_treasury_reward: f64,
    pub treasury_reward_addresses: Vec<String>,
    pub treasury_reward_start_block_height: u64,
    pub treasury_reward_address_change_interval: u64,
}

impl EquihashParams {
    /// Zcash mainnet after the funding stream upgrade.
    pub fn zcash() -> Self {
        Self {
            n: 200,
            k: 9,
            solution_size: 1344,
            solution_preamble_size: 3,
            overwinter: Some(Upgrade {
                activation_height: 347_500,
                tx_version: 3,
                version_group_id: 0x03C4_8270,
            }),
            sapling: Some(Upgrade {
                activation_height: 419_200,
                tx_version: 4,
                version_group_id: 0x892F_2085,
            }),
            pay_funding_stream: true,
            pay_founders_reward: false,
            percent_founders_reward: 20.0,
            founders_reward_addresses: Vec::new(),
            last_founders_reward_block_height: 0,
            percent_treasury_reward: 0.0,
            treasury_reward_addresses: Vec::new(),
            treasury_reward_start_block_height: 0,
            treasury_reward_address_change_interval: 0,
        }
    }

    fn upgrade(&self, height: u64) -> Option<&Upgrade> {
        self.sapling
            .as_ref()
            .filter(|sapling| sapling.activation_height > 0 && height >= sapling.activation_height)
            .or_else(|| {
                self.overwinter.as_ref().filter(|overwinter| {
                    overwinter.activation_height > 0 && height >= overwinter.activation_height
                })
            })
    }

    fn is_sapling(&self, height: u64) -> bool {
        self.sapling
            .as_ref()
            .is_some_and(|sapling| sapling.activation_height > 0 && height >= sapling.activation_height)
    }

    fn founders_address(&self, height: u64) -> Option<&str> {
        let count = self.founders_reward_addresses.len() as u64;

        if count == 0 {
            return None;
        }

        let interval = (self.last_founders_reward_block_height + count) / count;

        self.founders_reward_addresses
            .get((height / interval.max(1)) as usize)
            .map(String::as_str)
    }

    fn treasury_address(&self, height: u64) -> Option<&str> {
        let count = self.treasury_reward_addresses.len() as u64;

        if count == 0 {
            return None;
        }

        let index = (height.saturating_sub(self.treasury_reward_start_block_height)
            / self.treasury_reward_address_change_interval.max(1))
            % count;

        self.treasury_reward_addresses
            .get(index as usize)
            .map(String::as_str)
    }
}

/// Script for a transparent Zcash address: `t3`/`t2` are P2SH, the rest P2PKH.
pub fn zcash_address_script(address: &str) -> Result<ScriptBuf> {
    let data = bitcoin::base58::decode_check(address)
        .with_context(|| format!("invalid address `{address}`"))?;

    let p2sh = matches!(data.get(..2), Some([0x1c, 0xbd] | [0x1c, 0xba]));

    prefixed_address_script(address, p2sh)
}

/// Funding stream and founders outputs always pay script hashes.
fn founders_script(address: &str) -> Result<ScriptBuf> {
    prefixed_address_script(address, true)
}

fn round_zat(value: f64) -> u64 {
    value.round().max(0.0) as u64
}

struct Coinbase {
    bytes: Vec<u8>,
    reward_to_pool: u64,
}

fn build_coinbase(
    params: &EquihashParams,
    pool_script: &ScriptBuf,
    template: &EquihashTemplate,
) -> Result<Coinbase> {
    let height = template.height;
    let fees = template.transactions.iter().map(|tx| tx.fee).sum::<u64>();
    let subsidy = template.subsidy.as_ref();

    let block_reward = match subsidy {
        Some(subsidy) if params.pay_funding_stream => {
            let streams = subsidy.funding_streams.iter().map(|s| s.value).sum::<f64>();
            (subsidy.miner + streams) * ZATOSHIS_PER_COIN
        }
        Some(subsidy) if params.pay_founders_reward => {
            let founders = subsidy
                .founders
                .or(subsidy.community)
                .context("founders reward missing from block subsidy")?;
            (subsidy.miner + founders) * ZATOSHIS_PER_COIN
        }
        Some(subsidy) => subsidy.miner * ZATOSHIS_PER_COIN,
        None => template.coinbase_value as f64,
    };

    let pool = |value: u64| TxOut {
        value: Amount::from_sat(value),
        script_pubkey: pool_script.clone(),
    };

    let mut outputs = Vec::new();

    let reward_to_pool = if params.pay_funding_stream {
        let subsidy = subsidy.context("funding streams require a block subsidy")?;

        let reward = round_zat(block_reward * (1.0 - params.percent_founders_reward / 100.0)) + fees;
        outputs.push(pool(reward));

        for stream in &subsidy.funding_streams {
            outputs.push(TxOut {
                value: Amount::from_sat(stream.value_zat),
                script_pubkey: founders_script(&stream.address)?,
            });
        }

        reward
    } else if params.pay_founders_reward
        && (params.last_founders_reward_block_height >= height
            || params.treasury_reward_start_block_height > 0)
    {
        let (percent, address) = if params.treasury_reward_start_block_height > 0
            && height >= params.treasury_reward_start_block_height
        {
            (params.percent_treasury_reward, params.treasury_address(height))
        } else {
            (params.percent_founders_reward, params.founders_address(height))
        };

        let address = address.context("no founders reward address for height")?;

        let reward = round_zat(block_reward * (1.0 - percent / 100.0)) + fees;
        outputs.push(pool(reward));
        outputs.push(TxOut {
            value: Amount::from_sat(round_zat(block_reward * (percent / 100.0))),
            script_pubkey: founders_script(address)?,
        });

        reward
    } else {
        let reward = round_zat(block_reward) + fees;
        outputs.push(pool(reward));
        reward
    };

    let script_sig = Builder::new()
        .push_int(i64::try_from(height)?)
        .push_int(0)
        .into_script();

    let upgrade = params.upgrade(height);

    let mut bytes = Vec::new();

    match upgrade {
        Some(upgrade) => {
            bytes.extend_from_slice(&(upgrade.tx_version | OVERWINTER_FLAG).to_le_bytes());
            bytes.extend_from_slice(&upgrade.version_group_id.to_le_bytes());
        }
        None => bytes.extend_from_slice(&1u32.to_le_bytes()),
    }

    bytes.extend_from_slice(&consensus::serialize(&VarInt(1)));
    bytes.extend_from_slice(&[0u8; 32]);
    bytes.extend_from_slice(&u32::MAX.to_le_bytes());
    bytes.extend_from_slice(&consensus::serialize(script_sig.as_script()));
    bytes.extend_from_slice(&u32::MAX.to_le_bytes());
    bytes.extend_from_slice(&consensus::serialize(&outputs));
    bytes.extend_from_slice(&0u32.to_le_bytes());

    if upgrade.is_some() {
        bytes.extend_from_slice(&0u32.to_le_bytes());

        if params.is_sapling(height) {
            bytes.extend_from_slice(&0i64.to_le_bytes());
            bytes.extend_from_slice(&consensus::serialize(&VarInt(0)));
            bytes.extend_from_slice(&consensus::serialize(&VarInt(0)));
        }

        bytes.extend_from_slice(&consensus::serialize(&VarInt(0)));
    }

    Ok(Coinbase {
        bytes,
        reward_to_pool,
    })
}

/// Target sent with `mining.set_target` for a stratum difficulty.
pub fn encode_target(difficulty: f64) -> String {
    let scaled = BigUint::from((difficulty * 255.0).floor().max(1.0) as u64);
    let target = (&*DIFF1 / scaled) * BigUint::from(255u32);
    let max = (BigUint::one() << 256usize) - BigUint::one();

    format!("{:064x}", target.min(max))
}

#[derive(Debug, Clone, PartialEq)]
pub struct EquihashSubmission {
    pub worker: String,
    pub job_id: String,
    pub ntime: String,
    pub extranonce2: String,
    pub solution: String,
}

impl Submission for EquihashSubmission {
    fn job_id(&self) -> &str {
        &self.job_id
    }
}

#[derive(Debug)]
pub struct EquihashJob {
    id: String,
    template: Arc<EquihashTemplate>,
    params: Arc<EquihashParams>,
    coinbase: Vec<u8>,
    merkle_root: MerkleNode,
    reserved: [u8; 32],
    target: BigUint,
    difficulty: f64,
    reward_to_pool: u64,
    submissions: DashSet<String>,
}

impl Job for EquihashJob {
    type Template = EquihashTemplate;

    fn id(&self) -> &str {
        &self.id
    }

    fn template(&self) -> &Arc<EquihashTemplate> {
        &self.template
    }

    fn network_difficulty(&self) -> f64 {
        self.difficulty
    }
}

impl EquihashJob {
    pub fn notify_params(&self, clean_jobs: bool) -> Value {
        json!([
            self.id,
            hex::encode(self.template.version.to_le_bytes()),
            hex::encode(self.template.previous_block_hash.to_byte_array()),
            self.merkle_root.to_string(),
            hex::encode(self.reserved),
            hex::encode(self.template.curtime.to_le_bytes()),
            hex::encode(self.bits().to_le_bytes()),
            clean_jobs,
            self.template.solution,
        ])
    }

    fn bits(&self) -> u32 {
        u32::from_str_radix(&self.template.bits, 16).unwrap_or_default()
    }

    fn header(&self, ntime: u32, nonce: &[u8]) -> Vec<u8> {
        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.extend_from_slice(&self.template.version.to_le_bytes());
        header.extend_from_slice(&self.template.previous_block_hash.to_byte_array());
        header.extend_from_slice(&self.merkle_root.to_byte_array());
        header.extend_from_slice(&self.reserved);
        header.extend_from_slice(&ntime.to_le_bytes());
        header.extend_from_slice(&self.bits().to_le_bytes());
        header.extend_from_slice(nonce);
        header
    }

    fn serialize_block(&self, header: &[u8], solution: &[u8]) -> Result<String, ShareError> {
        let mut block = Vec::new();
        block.extend_from_slice(header);
        block.extend_from_slice(solution);
        block.extend_from_slice(&consensus::serialize(&VarInt(
            self.template.transactions.len() as u64 + 1,
        )));
        block.extend_from_slice(&self.coinbase);

        for transaction in &self.template.transactions {
            block.extend_from_slice(&decode_hex(&transaction.data, "transaction data")?);
        }

        Ok(hex::encode(block))
    }

    fn process_share(
        &self,
        context: &EquihashContext,
        submission: &EquihashSubmission,
        now: DateTime<Utc>,
    ) -> Result<(Share, Option<String>), ShareError> {
        if submission.ntime.len() != 8 {
            return Err(ShareError::other("incorrect size of ntime"));
        }

        let ntime = u32::from_le_bytes(
            decode_hex(&submission.ntime, "ntime")?
                .try_into()
                .map_err(|_| ShareError::other("incorrect size of ntime"))?,
        );

        if ntime < self.template.curtime || i64::from(ntime) > now.timestamp() + MAX_FUTURE_NTIME {
            return Err(ShareError::other("ntime out of range"));
        }

        let nonce = format!("{}{}", context.extranonce1, submission.extranonce2);

        if nonce.len() != NONCE_SIZE * 2 {
            return Err(ShareError::other("incorrect size of extraNonce2"));
        }

        if submission.solution.len()
            != (self.params.solution_size + self.params.solution_preamble_size) * 2
        {
            return Err(ShareError::other("incorrect size of solution"));
        }

        if !register_submission(&self.submissions, format!("{nonce}{}", submission.solution)) {
            return Err(ShareError::DuplicateShare);
        }

        let nonce = decode_hex(&nonce, "nonce")?;
        let solution = decode_hex(&submission.solution, "solution")?;

        let header = self.header(ntime, &nonce);

        equihash::is_valid_solution(
            self.params.n,
            self.params.k,
            &header[..SOLVER_INPUT_SIZE],
            &nonce,
            &solution[self.params.solution_preamble_size..],
        )
        .map_err(|_| ShareError::other("invalid solution"))?;

        let mut header_solution = header.clone();
        header_solution.extend_from_slice(&solution);

        let hash = sha256d(&header_solution);
        let hash_value = BigUint::from_bytes_le(&hash);

        let share_difficulty = ShareDifficulty::new(&DIFF1, &hash_value);
        let is_block_candidate = hash_value <= self.target;

        let difficulty = credited_difficulty(&share_difficulty, context, is_block_candidate)?;

        let mut share = Share {
            block_height: self.template.height,
            network_difficulty: self.difficulty,
            difficulty,
            ..Default::default()
        };

        if !is_block_candidate {
            return Ok((share, None));
        }

        let mut block_hash = hash;
        block_hash.reverse();

        share.is_block_candidate = true;
        share.block_reward = self.reward_to_pool as f64 / ZATOSHIS_PER_COIN;
        share.block_hash = Some(hex::encode(block_hash));

        let block = self.serialize_block(&header, &solution)?;

        Ok((share, Some(block)))
    }
}

#[derive(Debug)]
pub struct EquihashContext {
    base: WorkerContext,
    pub extranonce1: String,
}

impl Deref for EquihashContext {
    type Target = WorkerContext;

    fn deref(&self) -> &WorkerContext {
        &self.base
    }
}

impl DerefMut for EquihashContext {
    fn deref_mut(&mut self) -> &mut WorkerContext {
        &mut self.base
    }
}

#[derive(Debug)]
pub struct Equihash {
    params: Arc<EquihashParams>,
    pool_script: ScriptBuf,
    extranonce: ExtraNonceProvider,
}

impl Equihash {
    pub fn new(
        params: EquihashParams,
        pool_address: &str,
        extranonce: ExtraNonceProvider,
    ) -> Result<Self> {
        ensure!(
            extranonce.size() < NONCE_SIZE,
            "extranonce1 of {} bytes leaves no room for extranonce2",
            extranonce.size()
        );

        Ok(Self {
            params: Arc::new(params),
            pool_script: zcash_address_script(pool_address)
                .with_context(|| format!("invalid pool address `{pool_address}`"))?,
            extranonce,
        })
    }
}

impl Family for Equihash {
    type Template = EquihashTemplate;
    type Job = EquihashJob;
    type Context = EquihashContext;
    type Submission = EquihashSubmission;
    type Block = String;

    const NAME: &'static str = "equihash";

    fn create_job(
        &self,
        template: Arc<EquihashTemplate>,
        job_id: String,
        _now: DateTime<Utc>,
    ) -> Result<EquihashJob> {
        let target = big_from_hex(&template.target)?;

        let coinbase = build_coinbase(&self.params, &self.pool_script, &template)?;

        let hashes = template
            .transactions
            .iter()
            .map(|tx| MerkleNode::from_rpc_hex(&tx.hash))
            .collect::<Result<Vec<MerkleNode>, _>>()?;

        let merkle_root =
            MerkleTree::new(hashes).with_first(MerkleNode::from_byte_array(sha256d(&coinbase.bytes)));

        let reserved = match template
            .final_sapling_root_hash
            .as_deref()
            .filter(|root| !root.is_empty() && self.params.is_sapling(template.height))
        {
            Some(root) => MerkleNode::from_rpc_hex(root)?.to_byte_array(),
            None => [0u8; 32],
        };

        Ok(EquihashJob {
            id: job_id,
            difficulty: target_difficulty(&DIFF1, &target),
            params: self.params.clone(),
            template,
            coinbase: coinbase.bytes,
            merkle_root,
            reserved,
            target,
            reward_to_pool: coinbase.reward_to_pool,
            submissions: DashSet::new(),
        })
    }

    fn update_stats(&self, job: &EquihashJob, stats: &mut BlockchainStats) {
        stats.block_height = job.template.height;
        stats.network_difficulty = job.difficulty;
        stats.next_network_target = job.template.target.clone();
        stats.next_network_bits = job.template.bits.clone();
        stats.block_reward = job.reward_to_pool as f64 / ZATOSHIS_PER_COIN;
    }

    fn create_context(&self, base: WorkerContext) -> EquihashContext {
        EquihashContext {
            base,
            extranonce1: String::new(),
        }
    }

    fn subscribe(
        &self,
        context: &mut EquihashContext,
        connection_id: &str,
        _params: &Value,
    ) -> Result<Value, ShareError> {
        context.extranonce1 = self.extranonce.next();

        Ok(json!([connection_id, context.extranonce1]))
    }

    fn parse_submission(
        &self,
        context: &EquihashContext,
        params: &Value,
    ) -> Result<EquihashSubmission, ShareError> {
        let params = string_params(params, 5)?;

        if context.extranonce1.is_empty() {
            return Err(ShareError::NotSubscribed);
        }

        if params[0].is_empty() {
            return Err(ShareError::other("missing or invalid workername"));
        }

        if params[4].is_empty() {
            return Err(ShareError::other("missing or invalid solution"));
        }

        Ok(EquihashSubmission {
            worker: params[0].clone(),
            job_id: params[1].clone(),
            ntime: params[2].clone(),
            extranonce2: params[3].clone(),
            solution: params[4].clone(),
        })
    }

    fn process_share(
        &self,
        job: &EquihashJob,
        context: &mut EquihashContext,
        submission: &EquihashSubmission,
        now: DateTime<Utc>,
    ) -> Result<(Share, Option<String>), ShareError> {
        job.process_share(context, submission, now)
    }

    fn work(
        &self,
        job: &EquihashJob,
        context: &mut EquihashContext,
        difficulty_changed: bool,
        clean_jobs: bool,
    ) -> Vec<Message> {
        let mut messages = Vec::new();

        if difficulty_changed {
            messages.push(Message::notification(
                Method::SetTarget.to_string(),
                json!([encode_target(context.difficulty)]),
            ));
        }

        messages.push(Message::notification(
            Method::Notify.to_string(),
            job.notify_params(clean_jobs),
        ));

        messages
    }
}

#[derive(Debug, Deserialize)]
struct ValidateAddressResponse {
    isvalid: bool,
}

#[derive(Debug, Deserialize)]
struct GetBlockResponse {
    hash: String,
    #[serde(default)]
    tx: Vec<String>,
}

/// `zcashd`-compatible node.
#[derive(Debug)]
pub struct EquihashUpstream {
    daemon: DaemonClient,
}

impl EquihashUpstream {
    pub fn new(daemon: DaemonClient) -> Self {
        Self { daemon }
    }
}

#[async_trait]
impl Upstream<Equihash> for EquihashUpstream {
    async fn block_template(&self) -> Result<EquihashTemplate> {
        let mut template = self
            .daemon
            .call::<EquihashTemplate>(
                "getblocktemplate",
                json!([{"capabilities": ["coinbasetxn", "workid", "coinbase/append"]}]),
            )
            .await?;

        template.subsidy = Some(
            self.daemon
                .call("getblocksubsidy", json!([template.height]))
                .await?,
        );

        Ok(template)
    }

    async fn submit_block(&self, share: &Share, block: &String) -> Result<SubmitResult> {
        if let Some(reason) = self
            .daemon
            .call_optional::<String>("submitblock", json!([block]))
            .await?
        {
            warn!("Block submission rejected: {reason}");
            return Ok(SubmitResult::rejected());
        }

        let Some(hash) = share.block_hash.as_deref() else {
            return Ok(SubmitResult::rejected());
        };

        let block = self
            .daemon
            .call::<GetBlockResponse>("getblock", json!([hash]))
            .await?;

        if block.hash != hash {
            return Ok(SubmitResult::rejected());
        }

        Ok(SubmitResult::accepted(block.tx.into_iter().next()))
    }

    async fn validate_address(&self, address: &str) -> Result<bool> {
        if self
            .daemon
            .call::<ValidateAddressResponse>("validateaddress", json!([address]))
            .await?
            .isvalid
        {
            return Ok(true);
        }

        Ok(self
            .daemon
            .call::<ValidateAddressResponse>("z_validateaddress", json!([address]))
            .await?
            .isvalid)
    }
}
