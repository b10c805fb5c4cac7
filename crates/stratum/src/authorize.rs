use super::*;

/// `mining.authorize` parameters. Miners send `[user]`, `[user, password]` or
/// `[user, null]`, and trailing extras are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorize {
    pub username: String,
    pub password: Option<String>,
}

impl Authorize {
    pub fn from_params(params: &Value) -> Option<Self> {
        let params = params.as_array()?;

        let username = params.first()?.as_str()?.trim().to_string();

        let password = params
            .get(1)
            .and_then(Value::as_str)
            .map(str::to_string);

        Some(Self { username, password })
    }

    /// Splits `miner.worker` on the first dot.
    pub fn miner_and_worker(&self) -> (&str, Option<&str>) {
        match self.username.split_once('.') {
            Some((miner, worker)) => (miner, Some(worker)),
            None => (&self.username, None),
        }
    }

    /// Static difficulty requested through the password, e.g. `x,d=512`.
    pub fn static_difficulty(&self) -> Option<f64> {
        self.password
            .as_deref()?
            .split([',', ';', ' '])
            .filter_map(|part| part.trim().strip_prefix("d="))
            .find_map(|value| value.parse::<f64>().ok())
            .filter(|diff| diff.is_finite() && *diff > 0.0)
    }
}

impl Serialize for Authorize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&self.username)?;
        seq.serialize_element(&self.password)?;
        seq.end()
    }
}
