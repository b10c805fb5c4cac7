use super::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShareStats {
    pub valid_shares: u64,
    pub invalid_shares: u64,
}

/// Session state every family shares. Family contexts wrap this and deref to it.
#[derive(Debug)]
pub struct WorkerContext {
    pub difficulty: f64,
    pub previous_difficulty: Option<f64>,
    pending_difficulty: Option<f64>,
    pub stats: ShareStats,
    pub vardiff: Option<Vardiff>,
    pub bouncer: Bouncer,
    pub last_activity: DateTime<Utc>,
    pub is_authorized: bool,
    pub is_subscribed: bool,
    pub user_agent: Option<String>,
    pub miner: Option<String>,
    pub worker: Option<String>,
}

impl WorkerContext {
    pub fn new(
        difficulty: f64,
        vardiff: Option<VardiffConfig>,
        bouncer: BouncerConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            difficulty,
            previous_difficulty: None,
            pending_difficulty: None,
            stats: ShareStats::default(),
            vardiff: vardiff.map(|config| Vardiff::new(config, difficulty)),
            bouncer: Bouncer::new(bouncer),
            last_activity: now,
            is_authorized: false,
            is_subscribed: false,
            user_agent: None,
            miner: None,
            worker: None,
        }
    }

    pub fn has_pending_difficulty(&self) -> bool {
        self.pending_difficulty.is_some()
    }

    /// Queues a difficulty to be applied with the next job sent to this worker.
    pub fn enqueue_new_difficulty(&mut self, difficulty: f64) {
        self.pending_difficulty = Some(difficulty);
    }

    pub fn apply_pending_difficulty(&mut self) -> bool {
        match self.pending_difficulty.take() {
            Some(difficulty) => {
                self.set_difficulty(difficulty);
                true
            }
            None => false,
        }
    }

    pub fn set_difficulty(&mut self, difficulty: f64) {
        self.previous_difficulty = Some(self.difficulty);
        self.difficulty = difficulty;
    }
}
