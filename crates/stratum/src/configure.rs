use super::*;

pub const VERSION_ROLLING: &str = "version-rolling";

/// BIP310 `mining.configure` request: `[[extension...], {"ext.param": value...}]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Configure {
    pub extensions: Vec<String>,
    pub version_rolling_mask: Option<Version>,
    pub version_rolling_min_bit_count: Option<u32>,
}

impl Configure {
    pub fn from_params(params: &Value) -> Option<Self> {
        let params = params.as_array()?;

        let extensions = params
            .first()?
            .as_array()?
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();

        let options = params.get(1).and_then(Value::as_object);

        let version_rolling_mask = options
            .and_then(|options| options.get("version-rolling.mask"))
            .and_then(Value::as_str)
            .and_then(|mask| mask.parse().ok());

        let version_rolling_min_bit_count = options
            .and_then(|options| options.get("version-rolling.min-bit-count"))
            .and_then(Value::as_u64)
            .and_then(|count| u32::try_from(count).ok());

        Some(Self {
            extensions,
            version_rolling_mask,
            version_rolling_min_bit_count,
        })
    }
}

/// Response to `mining.configure`. Every requested extension gets an entry, and
/// version rolling additionally reports the negotiated mask.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigureResult {
    pub version_rolling_mask: Option<Version>,
    pub unsupported: Vec<String>,
}

impl Serialize for ConfigureResult {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let len = self.unsupported.len() + if self.version_rolling_mask.is_some() { 2 } else { 0 };

        let mut map = serializer.serialize_map(Some(len))?;

        if let Some(mask) = self.version_rolling_mask {
            map.serialize_entry(VERSION_ROLLING, &true)?;
            map.serialize_entry("version-rolling.mask", &mask)?;
        }

        for extension in &self.unsupported {
            map.serialize_entry(extension, &false)?;
        }

        map.end()
    }
}
