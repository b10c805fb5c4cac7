use super::*;

/// Why a request touching shares was refused. Rendered to the miner as
/// `[code, message, null]`.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ShareError {
    #[snafu(display("low difficulty share ({difficulty})"))]
    LowDifficulty { difficulty: f64 },
    #[snafu(display("duplicate share"))]
    DuplicateShare,
    #[snafu(display("job not found"))]
    JobNotFound,
    #[snafu(display("unauthorized worker"))]
    Unauthorized,
    #[snafu(display("not subscribed"))]
    NotSubscribed,
    #[snafu(display("{message}"))]
    Malformed { message: String },
    #[snafu(display("{message}"))]
    Other { message: String },
    #[snafu(display("{message}"))]
    InvalidRequest { message: String },
}

impl ShareError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    pub fn code(&self) -> StratumError {
        match self {
            Self::LowDifficulty { .. } => StratumError::LowDifficultyShare,
            Self::DuplicateShare => StratumError::DuplicateShare,
            Self::JobNotFound => StratumError::JobNotFound,
            Self::Unauthorized => StratumError::UnauthorizedWorker,
            Self::NotSubscribed => StratumError::NotSubscribed,
            Self::Malformed { .. } | Self::Other { .. } => StratumError::Other,
            Self::InvalidRequest { .. } => StratumError::MinusOne,
        }
    }

    pub fn to_json_rpc(&self) -> JsonRpcError {
        self.code().with_message(self.to_string())
    }
}
