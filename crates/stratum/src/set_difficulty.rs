use super::*;

/// `mining.set_difficulty` parameters, a single-element array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetDifficulty(pub f64);

impl Serialize for SetDifficulty {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(1))?;
        seq.serialize_element(&self.0)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for SetDifficulty {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (difficulty,) = <(f64,)>::deserialize(deserializer)?;
        Ok(SetDifficulty(difficulty))
    }
}
