use {
    super::*,
    bitcoin::{
        Address, PubkeyHash, ScriptBuf, ScriptHash, TxOut,
        address::NetworkUnchecked,
        block::Header,
        consensus::{self, encode::VarInt},
        script::{Builder, PushBytesBuf},
    },
};

/// Bitcoin difficulty 1 target.
pub static DIFF1: LazyLock<BigUint> = LazyLock::new(|| {
    BigUint::from_bytes_be(&[
        0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00,
    ])
});

pub const EXTRANONCE_PLACEHOLDER_LENGTH: usize = 8;

pub const VERSION_ROLLING_POOL_MASK: u32 = 0x1fffe000;

const MAX_FUTURE_NTIME: i64 = 7200;

const SATOSHIS_PER_COIN: f64 = 100_000_000.0;

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
        Nothing(()),
    }

    Ok(match OneOrMany::<T>::deserialize(deserializer)? {
        OneOrMany::One(one) => vec![one],
        OneOrMany::Many(many) => many,
        OneOrMany::Nothing(()) => Vec::new(),
    })
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Payee {
    #[serde(default)]
    pub payee: Option<String>,
    #[serde(default, alias = "value")]
    pub amount: u64,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CoinbaseAux {
    #[serde(default)]
    pub flags: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TemplateTransaction {
    pub data: String,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
}

impl TemplateTransaction {
    pub fn merkle_node(&self) -> Result<MerkleNode> {
        let id = self
            .txid
            .as_deref()
            .or(self.hash.as_deref())
            .context("template transaction without txid")?;

        Ok(MerkleNode::from_rpc_hex(id)?)
    }
}

/// `getblocktemplate` answer, including the extras altcoin daemons attach.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BitcoinTemplate {
    pub version: u32,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: BlockHash,
    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,
    #[serde(default)]
    pub coinbaseaux: CoinbaseAux,
    #[serde(rename = "coinbasevalue")]
    pub coinbase_value: u64,
    #[serde(default)]
    pub target: Option<String>,
    pub curtime: u32,
    pub bits: String,
    pub height: u64,
    #[serde(default)]
    pub default_witness_commitment: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub masternode: Vec<Payee>,
    #[serde(default, rename = "superblock", deserialize_with = "one_or_many")]
    pub superblocks: Vec<Payee>,
    #[serde(default)]
    pub payee: Option<String>,
    #[serde(default)]
    pub payee_amount: Option<u64>,
    #[serde(default, rename = "founder", deserialize_with = "one_or_many")]
    pub founders: Vec<Payee>,
    #[serde(default, rename = "coinbasedevreward")]
    pub dev_reward: Option<Payee>,
    /// Hex payload for masternode chains, or payee outputs for payload chains.
    #[serde(default)]
    pub coinbase_payload: Option<Value>,
}

impl Template for BitcoinTemplate {
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

fn payout(payee: &Payee) -> Result<Option<TxOut>> {
    match payee.payee.as_deref().filter(|address| !address.is_empty()) {
        Some(address) => Ok(Some(TxOut {
            value: Amount::from_sat(payee.amount),
            script_pubkey: address_script(address)?,
        })),
        None => Ok(None),
    }
}

impl BitcoinTemplate {
    fn payee_output(&self) -> Vec<Payee> {
        match self.payee_amount.filter(|amount| *amount > 0) {
            Some(amount) => vec![Payee {
                payee: self.payee.clone(),
                amount,
            }],
            None => Vec::new(),
        }
    }

    fn masternode_payload(&self) -> Option<&str> {
        self.coinbase_payload
            .as_ref()
            .and_then(Value::as_str)
            .filter(|payload| !payload.is_empty())
    }

    fn payload_outputs(&self) -> Result<Vec<Payee>> {
        match &self.coinbase_payload {
            Some(value @ Value::Array(_)) => Ok(serde_json::from_value(value.clone())?),
            Some(value @ Value::Object(_)) => Ok(vec![serde_json::from_value(value.clone())?]),
            _ => Ok(Vec::new()),
        }
    }
}

/// Which template extras a chain's coinbase must honor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoinFeatures {
    pub masternodes: bool,
    pub payee: bool,
    pub founder: bool,
    pub dev_reward: bool,
    pub coinbase_payload: bool,
}

#[derive(Debug, Clone)]
pub struct BitcoinConfig {
    pub pool_address: String,
    pub coinbase_string: String,
    pub tx_comment: Option<String>,
    pub coinbase_tx_version: u32,
    pub ignore_aux_flags: bool,
    pub share_multiplier: f64,
    pub features: CoinFeatures,
}

impl Default for BitcoinConfig {
    fn default() -> Self {
        Self {
            pool_address: String::new(),
            coinbase_string: "Strata".into(),
            tx_comment: None,
            coinbase_tx_version: 1,
            ignore_aux_flags: false,
            share_multiplier: 1.0,
            features: CoinFeatures::default(),
        }
    }
}

/// Script paying `address`. Falls back to a bare base58check P2PKH for
/// chains whose version bytes the bitcoin crate does not know.
pub fn address_script(address: &str) -> Result<ScriptBuf> {
    if let Ok(address) = address.parse::<Address<NetworkUnchecked>>() {
        return Ok(address.assume_checked().script_pubkey());
    }

    let data = bitcoin::base58::decode_check(address)
        .with_context(|| format!("invalid address `{address}`"))?;

    ensure!(data.len() == 21, "invalid address `{address}`");

    let hash = <[u8; 20]>::try_from(&data[1..])
        .with_context(|| format!("invalid address `{address}`"))?;

    Ok(ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(hash)))
}

/// Script for a base58check address with a multi-byte version prefix.
pub(crate) fn prefixed_address_script(address: &str, p2sh: bool) -> Result<ScriptBuf> {
    let data = bitcoin::base58::decode_check(address)
        .with_context(|| format!("invalid address `{address}`"))?;

    ensure!(data.len() >= 20, "invalid address `{address}`");

    let hash = <[u8; 20]>::try_from(&data[data.len() - 20..])
        .with_context(|| format!("invalid address `{address}`"))?;

    Ok(if p2sh {
        ScriptBuf::new_p2sh(&ScriptHash::from_byte_array(hash))
    } else {
        ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(hash))
    })
}

pub(crate) fn push_bytes(bytes: Vec<u8>) -> Result<PushBytesBuf> {
    PushBytesBuf::try_from(bytes).map_err(|err| anyhow!("push too large: {err}"))
}

fn var_str(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&consensus::serialize(&VarInt(data.len() as u64)));
    buf.extend_from_slice(data);
}

pub(crate) fn sha256d(data: &[u8]) -> [u8; 32] {
    sha256d::Hash::hash(data).to_byte_array()
}

/// The coinbase transaction of a job, split around the extranonce.
#[derive(Debug, Clone, PartialEq)]
pub struct CoinbaseParts {
    pub initial: Vec<u8>,
    pub r#final: Vec<u8>,
}

impl CoinbaseParts {
    pub fn assemble(&self, extranonce1: &[u8], extranonce2: &[u8]) -> Vec<u8> {
        let mut coinbase = Vec::with_capacity(
            self.initial.len() + extranonce1.len() + extranonce2.len() + self.r#final.len(),
        );
        coinbase.extend_from_slice(&self.initial);
        coinbase.extend_from_slice(extranonce1);
        coinbase.extend_from_slice(extranonce2);
        coinbase.extend_from_slice(&self.r#final);
        coinbase
    }
}

struct CoinbaseBuilder<'a> {
    config: &'a BitcoinConfig,
    pool_script: &'a ScriptBuf,
    template: &'a BitcoinTemplate,
    timestamp: i64,
}

impl CoinbaseBuilder<'_> {
    fn outputs(&self) -> Result<Vec<TxOut>> {
        let features = self.config.features;
        let template = self.template;

        let pool = |value: u64| TxOut {
            value: Amount::from_sat(value),
            script_pubkey: self.pool_script.clone(),
        };

        if features.coinbase_payload {
            let mut outputs = vec![pool(template.coinbase_value)];

            for payee in template.payload_outputs()? {
                if let Some(output) = payout(&payee)? {
                    outputs.push(output);
                }
            }

            return Ok(outputs);
        }

        let mut reward = i128::from(template.coinbase_value);
        let mut outputs = Vec::new();

        let mut subtract = |outputs: &mut Vec<TxOut>, payees: &[Payee]| -> Result {
            for payee in payees {
                if let Some(output) = payout(payee)? {
                    reward -= i128::from(payee.amount);
                    outputs.push(output);
                }
            }
            Ok(())
        };

        let pool_first = if features.masternodes {
            subtract(&mut outputs, &template.masternode)?;
            subtract(&mut outputs, &template.superblocks)?;

            if !features.payee {
                subtract(&mut outputs, &template.payee_output())?;
            }

            if features.founder {
                subtract(&mut outputs, &template.founders)?;
            }

            true
        } else if features.payee {
            subtract(&mut outputs, &template.payee_output())?;
            true
        } else {
            if features.founder {
                subtract(&mut outputs, &template.founders)?;
            }
            false
        };

        ensure!(
            reward >= 0,
            "template outputs exceed coinbase value {}",
            template.coinbase_value
        );

        let reward = reward as u64;

        if pool_first {
            outputs.insert(0, pool(reward));
        } else {
            outputs.push(pool(reward));

            if features.dev_reward {
                if let Some(output) = template.dev_reward.as_ref().map(payout).transpose()?.flatten() {
                    outputs.push(output);
                }
            }
        }

        Ok(outputs)
    }

    fn script_sig_initial(&self) -> Result<ScriptBuf> {
        let mut builder = Builder::new().push_int(i64::try_from(self.template.height)?);

        if !self.config.ignore_aux_flags {
            if let Some(flags) = self
                .template
                .coinbaseaux
                .flags
                .as_deref()
                .filter(|flags| !flags.is_empty())
            {
                builder = builder.push_slice(push_bytes(
                    hex::decode(flags).context("invalid coinbaseaux flags")?,
                )?);
            }
        }

        Ok(builder.push_int(self.timestamp).push_int(0).into_script())
    }

    fn build(self) -> Result<CoinbaseParts> {
        let script_initial = self.script_sig_initial()?;

        let script_final = Builder::new()
            .push_slice(push_bytes(
                self.config.coinbase_string.trim().as_bytes().to_vec(),
            )?)
            .into_script();

        let script_len =
            script_initial.len() + EXTRANONCE_PLACEHOLDER_LENGTH + script_final.len();

        let payload = if self.config.features.masternodes {
            self.template.masternode_payload()
        } else {
            None
        };

        let tx_version = if payload.is_some() {
            3 + (5 << 16)
        } else {
            self.config.coinbase_tx_version
        };

        let mut initial = Vec::new();
        initial.extend_from_slice(&tx_version.to_le_bytes());
        initial.extend_from_slice(&consensus::serialize(&VarInt(1)));
        initial.extend_from_slice(&[0u8; 32]);
        initial.extend_from_slice(&u32::MAX.to_le_bytes());
        initial.extend_from_slice(&consensus::serialize(&VarInt(script_len as u64)));
        initial.extend_from_slice(script_initial.as_bytes());

        let mut outputs = self.outputs()?;

        if let Some(commitment) = self
            .template
            .default_witness_commitment
            .as_deref()
            .filter(|commitment| !commitment.is_empty())
        {
            outputs.insert(
                0,
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: ScriptBuf::from_bytes(
                        hex::decode(commitment).context("invalid witness commitment")?,
                    ),
                },
            );
        }

        let mut r#final = Vec::new();
        r#final.extend_from_slice(script_final.as_bytes());
        r#final.extend_from_slice(&0u32.to_le_bytes());
        r#final.extend_from_slice(&consensus::serialize(&outputs));
        r#final.extend_from_slice(&0u32.to_le_bytes());

        if let Some(comment) = self.config.tx_comment.as_deref().filter(|c| !c.is_empty()) {
            var_str(&mut r#final, comment.as_bytes());
        }

        if let Some(payload) = payload {
            var_str(
                &mut r#final,
                &hex::decode(payload).context("invalid coinbase payload")?,
            );
        }

        Ok(CoinbaseParts { initial, r#final })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BitcoinSubmission {
    pub worker: String,
    pub job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
    pub version_bits: Option<String>,
}

impl Submission for BitcoinSubmission {
    fn job_id(&self) -> &str {
        &self.job_id
    }
}

#[derive(Debug)]
pub struct BitcoinJob {
    id: String,
    template: Arc<BitcoinTemplate>,
    coinbase: CoinbaseParts,
    merkle_tree: MerkleTree,
    target: BigUint,
    difficulty: f64,
    notify: Notify,
    share_multiplier: f64,
    submissions: DashSet<String>,
}

impl Job for BitcoinJob {
    type Template = BitcoinTemplate;

    fn id(&self) -> &str {
        &self.id
    }

    fn template(&self) -> &Arc<BitcoinTemplate> {
        &self.template
    }

    fn network_difficulty(&self) -> f64 {
        self.difficulty
    }
}

impl BitcoinJob {
    pub fn coinbase(&self) -> &CoinbaseParts {
        &self.coinbase
    }

    pub fn notify(&self, clean_jobs: bool) -> Notify {
        Notify {
            clean_jobs,
            ..self.notify.clone()
        }
    }

    fn header(&self, coinbase: &[u8], version: Version, ntime: u32, nonce: u32) -> Header {
        let merkle_root = self
            .merkle_tree
            .with_first(MerkleNode::from_byte_array(sha256d(coinbase)));

        Header {
            version: version.0,
            prev_blockhash: self.template.previous_block_hash,
            merkle_root: merkle_root.into(),
            time: ntime,
            bits: self.notify.nbits.to_compact(),
            nonce,
        }
    }

    fn serialize_block(&self, header: &Header, coinbase: &[u8]) -> Result<String, ShareError> {
        let mut block = consensus::serialize(header);
        block.extend_from_slice(&consensus::serialize(&VarInt(
            self.template.transactions.len() as u64 + 1,
        )));
        block.extend_from_slice(coinbase);

        for transaction in &self.template.transactions {
            block.extend_from_slice(&decode_hex(&transaction.data, "transaction data")?);
        }

        Ok(hex::encode(block))
    }

    fn process_share(
        &self,
        context: &mut BitcoinContext,
        submission: &BitcoinSubmission,
        now: DateTime<Utc>,
    ) -> Result<(Share, Option<String>), ShareError> {
        let ntime = hex_u32(&submission.ntime, "ntime")?;

        if ntime < self.template.curtime || i64::from(ntime) > now.timestamp() + MAX_FUTURE_NTIME {
            return Err(ShareError::other("ntime out of range"));
        }

        let nonce = hex_u32(&submission.nonce, "nonce")?;

        let mut version = Version::from(self.template.version);

        if let Some(mask) = context.version_rolling_mask {
            let bits = match &submission.version_bits {
                Some(bits) => u32::from_str_radix(bits, 16)
                    .map(Version::from)
                    .map_err(|_| ShareError::other("invalid version bits"))?,
                None => Version::from(0u32),
            };

            if !bits.fits(mask) {
                return Err(ShareError::other("rolling-version mask violation"));
            }

            version = version.roll(bits, mask);
        }

        if !register_submission(
            &self.submissions,
            format!(
                "{}{}{}{}",
                context.extranonce1, submission.extranonce2, submission.ntime, submission.nonce
            ),
        ) {
            return Err(ShareError::DuplicateShare);
        }

        let coinbase = self.coinbase.assemble(
            &decode_hex(&context.extranonce1, "extranonce1")?,
            &decode_hex(&submission.extranonce2, "extranonce2")?,
        );

        let header = self.header(&coinbase, version, ntime, nonce);
        let hash = header.block_hash();
        let hash_value = BigUint::from_bytes_le(hash.as_byte_array());

        let share_difficulty =
            ShareDifficulty::new(&DIFF1, &hash_value).scaled(self.share_multiplier);

        let is_block_candidate = hash_value <= self.target;

        let difficulty = credited_difficulty(&share_difficulty, context, is_block_candidate)?;

        let mut share = Share {
            block_height: self.template.height,
            block_reward: self.template.coinbase_value as f64 / SATOSHIS_PER_COIN,
            network_difficulty: self.difficulty,
            difficulty: difficulty / self.share_multiplier,
            ..Default::default()
        };

        if !is_block_candidate {
            return Ok((share, None));
        }

        share.is_block_candidate = true;
        share.block_hash = Some(hash.to_string());

        let block = self.serialize_block(&header, &coinbase)?;

        Ok((share, Some(block)))
    }
}

#[derive(Debug)]
pub struct BitcoinContext {
    base: WorkerContext,
    pub extranonce1: String,
    pub version_rolling_mask: Option<Version>,
}

impl Deref for BitcoinContext {
    type Target = WorkerContext;

    fn deref(&self) -> &WorkerContext {
        &self.base
    }
}

impl DerefMut for BitcoinContext {
    fn deref_mut(&mut self) -> &mut WorkerContext {
        &mut self.base
    }
}

#[derive(Debug)]
pub struct Bitcoin {
    config: BitcoinConfig,
    pool_script: ScriptBuf,
    extranonce: ExtraNonceProvider,
}

impl Bitcoin {
    pub fn new(config: BitcoinConfig, extranonce: ExtraNonceProvider) -> Result<Self> {
        let pool_script = address_script(&config.pool_address)
            .with_context(|| format!("invalid pool address `{}`", config.pool_address))?;

        ensure!(
            extranonce.size() < EXTRANONCE_PLACEHOLDER_LENGTH,
            "extranonce1 of {} bytes leaves no room for extranonce2",
            extranonce.size()
        );

        Ok(Self {
            config,
            pool_script,
            extranonce,
        })
    }

    fn extranonce2_size(&self) -> usize {
        EXTRANONCE_PLACEHOLDER_LENGTH - self.extranonce.size()
    }
}

impl Family for Bitcoin {
    type Template = BitcoinTemplate;
    type Job = BitcoinJob;
    type Context = BitcoinContext;
    type Submission = BitcoinSubmission;
    type Block = String;

    const NAME: &'static str = "bitcoin";

    fn share_multiplier(&self) -> f64 {
        self.config.share_multiplier
    }

    fn create_job(
        &self,
        template: Arc<BitcoinTemplate>,
        job_id: String,
        now: DateTime<Utc>,
    ) -> Result<BitcoinJob> {
        let nbits = template
            .bits
            .parse::<Nbits>()
            .with_context(|| format!("invalid bits `{}`", template.bits))?;

        let target = match template.target.as_deref().filter(|t| !t.is_empty()) {
            Some(target) => big_from_hex(target)?,
            None => BigUint::from_bytes_be(&nbits.to_target().to_be_bytes()),
        };

        let coinbase = CoinbaseBuilder {
            config: &self.config,
            pool_script: &self.pool_script,
            template: &template,
            timestamp: now.timestamp(),
        }
        .build()?;

        let merkle_tree = MerkleTree::new(
            template
                .transactions
                .iter()
                .map(TemplateTransaction::merkle_node)
                .collect::<Result<Vec<MerkleNode>>>()?,
        );

        let notify = Notify {
            job_id: job_id.clone(),
            prevhash: PrevHash::from(template.previous_block_hash),
            coinb1: hex::encode(&coinbase.initial),
            coinb2: hex::encode(&coinbase.r#final),
            merkle_branches: merkle_tree.steps().to_vec(),
            version: Version::from(template.version),
            nbits,
            ntime: Ntime::from(template.curtime),
            clean_jobs: false,
        };

        Ok(BitcoinJob {
            id: job_id,
            difficulty: target_difficulty(&DIFF1, &target),
            template,
            coinbase,
            merkle_tree,
            target,
            notify,
            share_multiplier: self.config.share_multiplier,
            submissions: DashSet::new(),
        })
    }

    fn update_stats(&self, job: &BitcoinJob, stats: &mut BlockchainStats) {
        stats.block_height = job.template.height;
        stats.network_difficulty = job.difficulty;
        stats.next_network_target = format!("{:064x}", job.target);
        stats.next_network_bits = job.template.bits.clone();
        stats.block_reward = job.template.coinbase_value as f64 / SATOSHIS_PER_COIN;
    }

    fn create_context(&self, base: WorkerContext) -> BitcoinContext {
        BitcoinContext {
            base,
            extranonce1: String::new(),
            version_rolling_mask: None,
        }
    }

    fn subscribe(
        &self,
        context: &mut BitcoinContext,
        connection_id: &str,
        _params: &Value,
    ) -> Result<Value, ShareError> {
        context.extranonce1 = self.extranonce.next();

        Ok(json!([
            [
                [Method::SetDifficulty.to_string(), connection_id],
                [Method::Notify.to_string(), connection_id]
            ],
            context.extranonce1,
            self.extranonce2_size(),
        ]))
    }

    fn configure(&self, context: &mut BitcoinContext, params: &Value) -> Option<Value> {
        let configure = Configure::from_params(params).unwrap_or_default();

        let mut result = ConfigureResult::default();

        for extension in configure.extensions {
            if extension == VERSION_ROLLING {
                let pool_mask = Version::from(VERSION_ROLLING_POOL_MASK);

                let mask = match configure.version_rolling_mask {
                    Some(requested) => requested & pool_mask,
                    None => pool_mask,
                };

                context.version_rolling_mask = Some(mask);
                result.version_rolling_mask = Some(mask);
            } else {
                result.unsupported.push(extension);
            }
        }

        serde_json::to_value(result).ok()
    }

    fn parse_submission(
        &self,
        context: &BitcoinContext,
        params: &Value,
    ) -> Result<BitcoinSubmission, ShareError> {
        let params = string_params(params, 5)?;

        if context.extranonce1.is_empty() {
            return Err(ShareError::NotSubscribed);
        }

        if params[2].len() != self.extranonce2_size() * 2 {
            return Err(ShareError::other("incorrect size of extranonce2"));
        }

        Ok(BitcoinSubmission {
            worker: params[0].clone(),
            job_id: params[1].clone(),
            extranonce2: params[2].clone(),
            ntime: params[3].clone(),
            nonce: params[4].clone(),
            version_bits: params.get(5).filter(|bits| !bits.is_empty()).cloned(),
        })
    }

    fn process_share(
        &self,
        job: &BitcoinJob,
        context: &mut BitcoinContext,
        submission: &BitcoinSubmission,
        now: DateTime<Utc>,
    ) -> Result<(Share, Option<String>), ShareError> {
        job.process_share(context, submission, now)
    }

    fn work(
        &self,
        job: &BitcoinJob,
        context: &mut BitcoinContext,
        difficulty_changed: bool,
        clean_jobs: bool,
    ) -> Vec<Message> {
        let mut messages = Vec::new();

        if difficulty_changed {
            messages.push(set_difficulty(context.difficulty));
        }

        messages.push(Message::notification(
            Method::Notify.to_string(),
            json!(job.notify(clean_jobs)),
        ));

        messages
    }
}

#[derive(Debug, Deserialize)]
struct GetBlockResponse {
    hash: String,
    #[serde(default)]
    tx: Vec<String>,
    #[serde(default)]
    confirmations: i64,
}

#[derive(Debug, Deserialize)]
struct ValidateAddressResponse {
    isvalid: bool,
}

/// `bitcoind`-compatible node.
#[derive(Debug)]
pub struct BitcoinUpstream {
    daemon: DaemonClient,
    rules: Vec<String>,
}

impl BitcoinUpstream {
    pub fn new(daemon: DaemonClient) -> Self {
        Self {
            daemon,
            rules: vec!["segwit".into()],
        }
    }
}

#[async_trait]
impl Upstream<Bitcoin> for BitcoinUpstream {
    async fn block_template(&self) -> Result<BitcoinTemplate> {
        self.daemon
            .call(
                "getblocktemplate",
                json!([{
                    "rules": self.rules,
                    "capabilities": ["coinbasetxn", "workid", "coinbase/append"],
                }]),
            )
            .await
    }

    async fn submit_block(&self, share: &Share, block: &String) -> Result<SubmitResult> {
        if let Some(reason) = self
            .daemon
            .call_optional::<String>("submitblock", json!([block]))
            .await?
        {
            warn!(
                "Block {} submission rejected: {reason}",
                share.block_hash.as_deref().unwrap_or_default()
            );
            return Ok(SubmitResult::rejected());
        }

        let Some(hash) = share.block_hash.as_deref() else {
            return Ok(SubmitResult::rejected());
        };

        let block = self
            .daemon
            .call::<GetBlockResponse>("getblock", json!([hash]))
            .await?;

        if block.hash != hash || block.confirmations == -1 {
            return Ok(SubmitResult::rejected());
        }

        Ok(SubmitResult::accepted(block.tx.into_iter().next()))
    }

    async fn validate_address(&self, address: &str) -> Result<bool> {
        Ok(self
            .daemon
            .call::<ValidateAddressResponse>("validateaddress", json!([address]))
            .await?
            .isvalid)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, bitcoin::Block, pretty_assertions::assert_eq};

    const ADDRESS: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";

    fn template(value: Value) -> BitcoinTemplate {
        let mut template = json!({
            "version": 0x2000_0000u32,
            "previousblockhash": "00000000000000000002a7c4c1e48d76c5a37902165a270156b7a8d72728a054",
            "transactions": [],
            "coinbaseaux": {"flags": ""},
            "coinbasevalue": 625_000_000u64,
            "curtime": 1_700_000_000u32,
            "bits": "207fffff",
            "height": 800_000,
        });

        if let (Some(template), Some(extra)) = (template.as_object_mut(), value.as_object()) {
            template.extend(extra.clone());
        }

        serde_json::from_value(template).unwrap()
    }

    fn family(features: CoinFeatures) -> Bitcoin {
        Bitcoin::new(
            BitcoinConfig {
                pool_address: ADDRESS.into(),
                features,
                ..Default::default()
            },
            ExtraNonceProvider::new(4, Some(1)).unwrap(),
        )
        .unwrap()
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_100, 0).unwrap()
    }

    fn job(family: &Bitcoin, template: BitcoinTemplate) -> BitcoinJob {
        family
            .create_job(Arc::new(template), "1".into(), now())
            .unwrap()
    }

    fn context(family: &Bitcoin, difficulty: f64) -> BitcoinContext {
        let mut context = family.create_context(WorkerContext::new(
            difficulty,
            None,
            BouncerConfig::default(),
            now(),
        ));
        family.subscribe(&mut context, "1", &json!([])).unwrap();
        context
    }

    fn submission(nonce: &str) -> BitcoinSubmission {
        BitcoinSubmission {
            worker: "w".into(),
            job_id: "1".into(),
            extranonce2: "00000001".into(),
            ntime: format!("{:08x}", 1_700_000_050u32),
            nonce: nonce.into(),
            version_bits: None,
        }
    }

    fn outputs(features: CoinFeatures, template: &BitcoinTemplate) -> Vec<TxOut> {
        let config = BitcoinConfig {
            features,
            ..Default::default()
        };
        let pool_script = address_script(ADDRESS).unwrap();

        CoinbaseBuilder {
            config: &config,
            pool_script: &pool_script,
            template,
            timestamp: 0,
        }
        .outputs()
        .unwrap()
    }

    #[test]
    fn coinbase_reassembles_into_transaction() {
        let family = family(CoinFeatures::default());
        let job = job(&family, template(json!({})));

        let coinbase = job.coinbase().assemble(&[0xab; 4], &[0u8; 4]);
        let tx = consensus::deserialize::<bitcoin::Transaction>(&coinbase).unwrap();

        assert!(tx.is_coinbase());
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value, Amount::from_sat(625_000_000));
        assert_eq!(tx.output[0].script_pubkey, address_script(ADDRESS).unwrap());
        assert_eq!(tx.input[0].sequence.0, 0);

        let script = tx.input[0].script_sig.as_bytes();
        assert!(script.windows(8).any(|w| w == [0xab, 0xab, 0xab, 0xab, 0, 0, 0, 0]));
        assert!(script.ends_with(b"Strata"));
    }

    #[test]
    fn witness_commitment_is_first_output() {
        let family = family(CoinFeatures::default());
        let commitment = "6a24aa21a9ede2f61c3f71d1defd3fa999dfa36953755c690689799962b48bebd836974e8cf9";

        let job = job(
            &family,
            template(json!({"default_witness_commitment": commitment})),
        );

        let tx = consensus::deserialize::<bitcoin::Transaction>(
            &job.coinbase().assemble(&[0; 4], &[0; 4]),
        )
        .unwrap();

        assert_eq!(tx.output.len(), 2);
        assert_eq!(hex::encode(tx.output[0].script_pubkey.as_bytes()), commitment);
        assert_eq!(tx.output[0].value, Amount::ZERO);
    }

    #[test]
    fn payee_output_is_subtracted() {
        let template = template(json!({
            "payee": "1BoatSLRHtKNngkdXEeobR76b53LETtpyT",
            "payee_amount": 125_000_000u64,
        }));

        let outputs = outputs(
            CoinFeatures {
                payee: true,
                ..Default::default()
            },
            &template,
        );

        assert_eq!(
            outputs.iter().map(|o| o.value.to_sat()).collect::<Vec<u64>>(),
            vec![500_000_000, 125_000_000]
        );
        assert_eq!(outputs[0].script_pubkey, address_script(ADDRESS).unwrap());
    }

    #[test]
    fn masternode_outputs() {
        let template = template(json!({
            "masternode": [
                {"payee": "1BoatSLRHtKNngkdXEeobR76b53LETtpyT", "amount": 100_000_000u64},
            ],
            "superblock": [
                {"payee": "1BoatSLRHtKNngkdXEeobR76b53LETtpyT", "amount": 25_000_000u64},
            ],
            "founder": {"payee": "1BoatSLRHtKNngkdXEeobR76b53LETtpyT", "amount": 50_000_000u64},
        }));

        let outputs = outputs(
            CoinFeatures {
                masternodes: true,
                founder: true,
                ..Default::default()
            },
            &template,
        );

        assert_eq!(
            outputs.iter().map(|o| o.value.to_sat()).collect::<Vec<u64>>(),
            vec![450_000_000, 100_000_000, 25_000_000, 50_000_000]
        );
    }

    #[test]
    fn plain_outputs_with_founder_and_dev_reward() {
        let template = template(json!({
            "founder": {"payee": "1BoatSLRHtKNngkdXEeobR76b53LETtpyT", "amount": 25_000_000u64},
            "coinbasedevreward": {"payee": "1BoatSLRHtKNngkdXEeobR76b53LETtpyT", "value": 5_000_000u64},
        }));

        let outputs = outputs(
            CoinFeatures {
                founder: true,
                dev_reward: true,
                ..Default::default()
            },
            &template,
        );

        assert_eq!(
            outputs.iter().map(|o| o.value.to_sat()).collect::<Vec<u64>>(),
            vec![25_000_000, 600_000_000, 5_000_000]
        );
    }

    #[test]
    fn coinbase_payload_outputs_get_full_value() {
        let template = template(json!({
            "coinbase_payload": [
                {"payee": "1BoatSLRHtKNngkdXEeobR76b53LETtpyT", "amount": 1_000u64},
            ],
        }));

        let outputs = outputs(
            CoinFeatures {
                coinbase_payload: true,
                ..Default::default()
            },
            &template,
        );

        assert_eq!(
            outputs.iter().map(|o| o.value.to_sat()).collect::<Vec<u64>>(),
            vec![625_000_000, 1_000]
        );
    }

    #[test]
    fn masternode_payload_changes_tx_version() {
        let family = family(CoinFeatures {
            masternodes: true,
            ..Default::default()
        });

        let job = job(&family, template(json!({"coinbase_payload": "0200aabb"})));

        assert_eq!(
            &job.coinbase().initial[..4],
            &(3u32 + (5 << 16)).to_le_bytes()
        );
        assert!(hex::encode(&job.coinbase().r#final).ends_with("040200aabb"));
    }

    #[test]
    fn outputs_exceeding_reward_are_an_error() {
        let family = family(CoinFeatures {
            payee: true,
            ..Default::default()
        });

        let template = template(json!({
            "payee": "1BoatSLRHtKNngkdXEeobR76b53LETtpyT",
            "payee_amount": 700_000_000u64,
        }));

        assert!(
            family
                .create_job(Arc::new(template), "1".into(), now())
                .is_err()
        );
    }

    #[test]
    fn notify_params() {
        let family = family(CoinFeatures::default());
        let job = job(&family, template(json!({})));

        let notify = serde_json::to_value(job.notify(true)).unwrap();

        assert_eq!(notify[0], "1");
        assert_eq!(
            notify[1],
            "2728a05456b7a8d7165a2701c5a37902c1e48d760002a7c40000000000000000"
        );
        assert_eq!(notify[4], json!([]));
        assert_eq!(notify[5], "20000000");
        assert_eq!(notify[6], "207fffff");
        assert_eq!(notify[7], "6553f100");
        assert_eq!(notify[8], true);
    }

    #[test]
    fn is_new() {
        let current = template(json!({}));

        assert!(current.is_new(None));
        assert!(!current.is_new(Some(&current)));

        let mut higher = current.clone();
        higher.height += 1;
        assert!(higher.is_new(Some(&current)));

        let other = template(json!({
            "previousblockhash": "0000000000000000000000000000000000000000000000000000000000000001",
        }));
        assert!(other.is_new(Some(&current)));
    }

    #[test]
    fn subscribe_result() {
        let family = family(CoinFeatures::default());
        let mut context = family.create_context(WorkerContext::new(
            1.0,
            None,
            BouncerConfig::default(),
            now(),
        ));

        assert_eq!(
            family.subscribe(&mut context, "a1", &json!([])).unwrap(),
            json!([
                [["mining.set_difficulty", "a1"], ["mining.notify", "a1"]],
                "10000001",
                4
            ])
        );
    }

    #[test]
    fn configure_negotiates_mask() {
        let family = family(CoinFeatures::default());
        let mut context = context(&family, 1.0);

        let result = family
            .configure(
                &mut context,
                &json!([["version-rolling", "minimum-difficulty"], {"version-rolling.mask": "ffffffff"}]),
            )
            .unwrap();

        assert_eq!(
            result,
            json!({
                "version-rolling": true,
                "version-rolling.mask": "1fffe000",
                "minimum-difficulty": false,
            })
        );
        assert_eq!(
            context.version_rolling_mask,
            Some(Version::from(VERSION_ROLLING_POOL_MASK))
        );
    }

    #[test]
    fn ntime_checks() {
        let family = family(CoinFeatures::default());
        let job = job(&family, template(json!({"target": "ff".repeat(32)})));
        let mut context = context(&family, 1.0);

        let mut early = submission("00000000");
        early.ntime = format!("{:08x}", 1_699_999_999u32);
        assert_eq!(
            job.process_share(&mut context, &early, now()).unwrap_err(),
            ShareError::other("ntime out of range")
        );

        let mut late = submission("00000000");
        late.ntime = format!("{:08x}", 1_700_007_301u32);
        assert_eq!(
            job.process_share(&mut context, &late, now()).unwrap_err(),
            ShareError::other("ntime out of range")
        );

        let mut short = submission("00000000");
        short.ntime = "abc".into();
        assert_eq!(
            job.process_share(&mut context, &short, now()).unwrap_err(),
            ShareError::other("incorrect size of ntime")
        );

        assert_eq!(
            job.process_share(&mut context, &submission("0000"), now())
                .unwrap_err(),
            ShareError::other("incorrect size of nonce")
        );
    }

    #[test]
    fn version_mask_violation() {
        let family = family(CoinFeatures::default());
        let job = job(&family, template(json!({"target": "ff".repeat(32)})));
        let mut context = context(&family, 1.0);
        context.version_rolling_mask = Some(Version::from(VERSION_ROLLING_POOL_MASK));

        let mut share = submission("00000000");
        share.version_bits = Some("00000001".into());

        assert_eq!(
            job.process_share(&mut context, &share, now()).unwrap_err(),
            ShareError::other("rolling-version mask violation")
        );

        share.version_bits = Some("00002000".into());
        assert!(job.process_share(&mut context, &share, now()).is_ok());
    }

    #[test]
    fn negotiated_mask_without_version_bits_clears_rolled_bits() {
        #[track_caller]
        fn case(mask: Option<u32>, version_bits: Option<&str>, expected: &str) {
            let family = family(CoinFeatures::default());
            let job = job(
                &family,
                template(json!({"target": "ff".repeat(32), "version": 0x2000_6000u32})),
            );
            let mut context = context(&family, 1.0);
            context.version_rolling_mask = mask.map(Version::from);

            let mut share = submission("00000000");
            share.version_bits = version_bits.map(String::from);

            let (_, block) = job.process_share(&mut context, &share, now()).unwrap();

            assert_eq!(&block.unwrap()[..8], expected);
        }

        case(None, None, "00600020");
        case(None, Some("00002000"), "00600020");
        case(Some(VERSION_ROLLING_POOL_MASK), None, "00000020");
        case(Some(VERSION_ROLLING_POOL_MASK), Some("00002000"), "00200020");
    }

    #[test]
    fn duplicate_is_case_insensitive() {
        let family = family(CoinFeatures::default());
        let job = job(&family, template(json!({"target": "ff".repeat(32)})));
        let mut context = context(&family, 1.0);

        assert!(
            job.process_share(&mut context, &submission("0000abcd"), now())
                .is_ok()
        );
        assert_eq!(
            job.process_share(&mut context, &submission("0000ABCD"), now())
                .unwrap_err(),
            ShareError::DuplicateShare
        );
    }

    #[test]
    fn low_difficulty_share() {
        let family = family(CoinFeatures::default());
        let job = job(&family, template(json!({"target": "00"})));
        let mut context = context(&family, 1e30);

        assert!(matches!(
            job.process_share(&mut context, &submission("00000000"), now()),
            Err(ShareError::LowDifficulty { .. })
        ));
    }

    #[test]
    fn block_candidate_payload() {
        let family = family(CoinFeatures::default());
        let job = job(&family, template(json!({"target": "ff".repeat(32)})));
        let mut context = context(&family, 1e30);

        let (share, block) = job
            .process_share(&mut context, &submission("00000000"), now())
            .unwrap();

        assert!(share.is_block_candidate);
        assert_eq!(share.block_height, 800_000);
        assert_eq!(share.difficulty, 1e30);
        assert_eq!(share.block_reward, 6.25);

        let block = consensus::deserialize::<Block>(&hex::decode(block.unwrap()).unwrap()).unwrap();

        assert_eq!(Some(block.block_hash().to_string()), share.block_hash);
        assert!(block.check_merkle_root());
        assert_eq!(block.txdata.len(), 1);
        assert!(block.txdata[0].is_coinbase());
    }

    #[test]
    fn extranonce2_size_is_checked() {
        let family = family(CoinFeatures::default());
        let context = context(&family, 1.0);

        assert_eq!(
            family
                .parse_submission(&context, &json!(["w", "1", "0001", "6553f100", "00000000"]))
                .unwrap_err(),
            ShareError::other("incorrect size of extranonce2")
        );

        assert_eq!(
            family
                .parse_submission(
                    &context,
                    &json!(["w", "1", "00000001", "6553f100", "00000000", "00002000"])
                )
                .unwrap()
                .version_bits,
            Some("00002000".into())
        );
    }

    #[test]
    fn base58_fallback() {
        let script = address_script("1BoatSLRHtKNngkdXEeobR76b53LETtpyT").unwrap();
        assert!(script.is_p2pkh());

        assert!(address_script("not an address").is_err());
    }
}
