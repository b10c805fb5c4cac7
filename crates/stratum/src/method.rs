use super::*;

/// Requests a pool understands. Bitcoin-style families speak the `mining.*`
/// dialect, Cryptonote miners use the bare `login`/`getjob`/`submit` names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, DeserializeFromStr, SerializeDisplay)]
pub enum Method {
    #[display("mining.subscribe")]
    Subscribe,
    #[display("mining.authorize")]
    Authorize,
    #[display("mining.submit")]
    Submit,
    #[display("mining.extranonce.subscribe")]
    ExtranonceSubscribe,
    #[display("mining.configure")]
    Configure,
    #[display("mining.notify")]
    Notify,
    #[display("mining.set_difficulty")]
    SetDifficulty,
    #[display("mining.set_target")]
    SetTarget,
    #[display("login")]
    Login,
    #[display("getjob")]
    GetJob,
    #[display("submit")]
    LoginSubmit,
    #[display("keepalived")]
    KeepAlive,
    #[display("job")]
    Job,
}

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(display("unsupported request {method}"))]
pub struct UnknownMethod {
    pub method: String,
}

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "mining.subscribe" => Self::Subscribe,
            "mining.authorize" => Self::Authorize,
            "mining.submit" => Self::Submit,
            "mining.extranonce.subscribe" => Self::ExtranonceSubscribe,
            "mining.configure" => Self::Configure,
            "mining.notify" => Self::Notify,
            "mining.set_difficulty" => Self::SetDifficulty,
            "mining.set_target" => Self::SetTarget,
            "login" => Self::Login,
            "getjob" => Self::GetJob,
            "submit" => Self::LoginSubmit,
            "keepalived" => Self::KeepAlive,
            "job" => Self::Job,
            _ => {
                return Err(UnknownMethod {
                    method: s.to_string(),
                });
            }
        })
    }
}
