use super::*;

pub use {
    bitcoind::{
        Bitcoin, BitcoinConfig, BitcoinContext, BitcoinJob, BitcoinTemplate, BitcoinUpstream,
        CoinFeatures,
    },
    cryptonote::{
        Cryptonote, CryptonoteConfig, CryptonoteContext, CryptonoteHasher, CryptonoteJob,
        CryptonoteTemplate, CryptonoteUpstream,
    },
    ergo::{Ergo, ErgoContext, ErgoJob, ErgoTemplate, ErgoUpstream},
    ethereum::{Ethereum, EthereumBlock, EthereumContext, EthereumJob, EthereumTemplate, EthereumUpstream},
    zcashd::{
        Equihash, EquihashContext, EquihashJob, EquihashParams, EquihashTemplate, EquihashUpstream,
    },
};

pub mod bitcoind;
pub mod cryptonote;
pub mod ergo;
mod ethash;
pub mod ethereum;
pub mod zcashd;

/// Upstream chain state a job is built from.
pub trait Template: Debug + Send + Sync + 'static {
    fn height(&self) -> u64;

    /// Whether this template describes a different block than `current`.
    fn is_new(&self, current: Option<&Self>) -> bool;
}

pub trait Job: Debug + Send + Sync + 'static {
    type Template: Template;

    fn id(&self) -> &str;

    fn template(&self) -> &Arc<Self::Template>;

    fn network_difficulty(&self) -> f64;
}

pub trait Submission: Debug + Send {
    fn job_id(&self) -> &str;
}

/// Pool-wide view of the chain, refreshed whenever a new block is detected.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockchainStats {
    pub block_height: u64,
    pub network_difficulty: f64,
    pub next_network_target: String,
    pub next_network_bits: String,
    pub block_reward: f64,
    pub last_network_block_time: Option<DateTime<Utc>>,
}

/// Which request vocabulary miners of a family speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Mining,
    Login,
}

impl Dialect {
    pub fn supports(self, method: Method) -> bool {
        match self {
            Self::Mining => matches!(
                method,
                Method::Subscribe
                    | Method::Authorize
                    | Method::Submit
                    | Method::ExtranonceSubscribe
                    | Method::Configure
            ),
            Self::Login => matches!(
                method,
                Method::Login | Method::GetJob | Method::LoginSubmit | Method::KeepAlive
            ),
        }
    }
}

/// Outcome of handing a block to the node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitResult {
    pub accepted: bool,
    pub confirmation: Option<String>,
}

impl SubmitResult {
    pub fn rejected() -> Self {
        Self::default()
    }

    pub fn accepted(confirmation: Option<String>) -> Self {
        Self {
            accepted: true,
            confirmation,
        }
    }
}

/// Everything that differs between blockchain lineages: how a template turns
/// into a job, how miners subscribe, how their shares are checked and what
/// work looks like on the wire.
pub trait Family: Send + Sync + Sized + 'static {
    type Template: Template;
    type Job: Job<Template = Self::Template>;
    type Context: Deref<Target = WorkerContext> + DerefMut + Send + 'static;
    type Submission: Submission;
    type Block: Debug + Send + Sync + 'static;

    const NAME: &'static str;

    const DIALECT: Dialect = Dialect::Mining;

    fn share_multiplier(&self) -> f64 {
        1.0
    }

    fn job_id(&self, sequence: u64) -> String {
        format!("{sequence:x}")
    }

    /// Runs before a fetched template is applied. Expensive per-template
    /// state belongs here, off the async workers.
    fn prepare(&self, _template: &Self::Template) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn create_job(
        &self,
        template: Arc<Self::Template>,
        job_id: String,
        now: DateTime<Utc>,
    ) -> Result<Self::Job>;

    fn update_stats(&self, job: &Self::Job, stats: &mut BlockchainStats);

    fn create_context(&self, base: WorkerContext) -> Self::Context;

    fn subscribe(
        &self,
        _context: &mut Self::Context,
        _connection_id: &str,
        _params: &Value,
    ) -> Result<Value, ShareError> {
        Err(ShareError::other("unsupported request mining.subscribe"))
    }

    /// Answers `mining.configure`. `None` means the family does not negotiate
    /// extensions.
    fn configure(&self, _context: &mut Self::Context, _params: &Value) -> Option<Value> {
        None
    }

    /// Cheap syntactic check on the miner part of a username.
    fn validate_miner(&self, miner: &str) -> bool {
        !miner.is_empty()
    }

    fn split_username(&self, username: &str) -> (String, String) {
        let (miner, worker) = username.split_once('.').unwrap_or((username, ""));
        (miner.trim().to_string(), worker.trim().to_string())
    }

    fn parse_submission(
        &self,
        context: &Self::Context,
        params: &Value,
    ) -> Result<Self::Submission, ShareError>;

    fn process_share(
        &self,
        job: &Self::Job,
        context: &mut Self::Context,
        submission: &Self::Submission,
        now: DateTime<Utc>,
    ) -> Result<(Share, Option<Self::Block>), ShareError>;

    /// Messages that put a worker on `job`.
    fn work(
        &self,
        job: &Self::Job,
        context: &mut Self::Context,
        difficulty_changed: bool,
        clean_jobs: bool,
    ) -> Vec<Message>;

    /// Pulls the credentials out of a `login` request.
    fn login(&self, _params: &Value) -> Result<(Authorize, Option<String>), ShareError> {
        Err(ShareError::other("unsupported request login"))
    }

    /// The job object a `login` or `getjob` answer carries.
    fn job_result(&self, _job: &Self::Job, _context: &mut Self::Context) -> Value {
        Value::Null
    }

    fn submit_result(&self) -> Value {
        json!(true)
    }
}

/// The node a pool mines against.
#[async_trait]
pub trait Upstream<F: Family>: Send + Sync + 'static {
    async fn block_template(&self) -> Result<F::Template>;

    async fn submit_block(&self, share: &Share, block: &F::Block) -> Result<SubmitResult>;

    async fn validate_address(&self, _address: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Parses submit parameters given positionally as strings.
pub(crate) fn string_params(params: &Value, min: usize) -> Result<Vec<String>, ShareError> {
    let values = params
        .as_array()
        .ok_or_else(|| ShareError::other("invalid params"))?;

    let strings = values
        .iter()
        .map(|value| match value {
            Value::String(s) => s.trim().to_string(),
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect::<Vec<String>>();

    if strings.len() < min {
        return Err(ShareError::other("invalid params"));
    }

    Ok(strings)
}

pub(crate) fn user_agent(params: &Value) -> Option<String> {
    params
        .as_array()
        .and_then(|params| params.first())
        .and_then(Value::as_str)
        .map(|agent| agent.trim().to_string())
}

/// Parses exactly eight hex characters.
pub(crate) fn hex_u32(value: &str, field: &str) -> Result<u32, ShareError> {
    if value.len() != 8 {
        return Err(ShareError::other(format!("incorrect size of {field}")));
    }

    u32::from_str_radix(value, 16).map_err(|_| ShareError::other(format!("invalid {field}")))
}

pub(crate) fn decode_hex(value: &str, field: &str) -> Result<Vec<u8>, ShareError> {
    hex::decode(value).map_err(|_| ShareError::other(format!("invalid {field}")))
}

/// Inserts `key` into a job's dedup set, reporting whether it was new.
pub(crate) fn register_submission(submissions: &DashSet<String>, key: String) -> bool {
    submissions.insert(key.to_lowercase())
}

/// Big-endian unsigned integer parsed from hex, with or without `0x`.
pub(crate) fn big_from_hex(value: &str) -> Result<BigUint> {
    let digits = value.trim_start_matches("0x");

    if digits.is_empty() {
        return Ok(BigUint::zero());
    }

    BigUint::parse_bytes(digits.as_bytes(), 16).with_context(|| format!("invalid hex integer `{value}`"))
}

/// Builds the notification that announces a difficulty change.
pub(crate) fn set_difficulty(difficulty: f64) -> Message {
    Message::notification(Method::SetDifficulty.to_string(), json!(SetDifficulty(difficulty)))
}
