use super::*;

/// A validated unit of work, ready for accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Share {
    pub pool_id: String,
    pub miner: String,
    pub worker: String,
    pub user_agent: String,
    pub ip_address: String,
    pub source: String,
    /// Stratum difficulty credited, divided by the family's share multiplier.
    pub difficulty: f64,
    pub network_difficulty: f64,
    pub block_height: u64,
    pub block_reward: f64,
    pub block_hash: Option<String>,
    pub is_block_candidate: bool,
    pub transaction_confirmation_data: Option<String>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShareEvent {
    Accepted(Share),
    Rejected {
        connection_id: String,
        miner: Option<String>,
        worker: Option<String>,
        error: ShareError,
    },
}
