use super::*;

pub type Result<T = (), E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("invalid hex `{input}`"))]
    Hex {
        input: String,
        source: hex::FromHexError,
    },
    #[snafu(display("invalid hex integer `{input}`"))]
    Integer {
        input: String,
        source: std::num::ParseIntError,
    },
    #[snafu(display("expected {expected} bytes, got {actual}"))]
    Length { expected: usize, actual: usize },
}

/// Error codes miners understand, sent as the first element of the error tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum StratumError {
    #[display("other")]
    Other,
    #[display("job not found")]
    JobNotFound,
    #[display("duplicate share")]
    DuplicateShare,
    #[display("low difficulty share")]
    LowDifficultyShare,
    #[display("unauthorized worker")]
    UnauthorizedWorker,
    #[display("not subscribed")]
    NotSubscribed,
    #[display("invalid request")]
    MinusOne,
}

impl StratumError {
    pub fn code(self) -> i32 {
        match self {
            Self::Other => 20,
            Self::JobNotFound => 21,
            Self::DuplicateShare => 22,
            Self::LowDifficultyShare => 23,
            Self::UnauthorizedWorker => 24,
            Self::NotSubscribed => 25,
            Self::MinusOne => -1,
        }
    }

    pub fn with_message(self, message: impl Into<String>) -> JsonRpcError {
        JsonRpcError {
            error_code: self.code(),
            message: message.into(),
            traceback: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub error_code: i32,
    pub message: String,
    pub traceback: Option<Value>,
}

impl Serialize for JsonRpcError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (&self.error_code, &self.message, &self.traceback).serialize(serializer)
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Stratum error {}: {}", self.error_code, self.message)
    }
}
