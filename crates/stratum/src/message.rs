use super::*;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Clone)]
#[serde(untagged)]
pub enum Id {
    #[display("null")]
    Null,
    Number(u64),
    String(String),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Message {
    Request {
        id: Id,
        method: String,
        params: Value,
    },
    Response {
        id: Id,
        result: Option<Value>,
        error: Option<JsonRpcError>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

impl Message {
    pub fn response(id: Id, result: Value) -> Self {
        Self::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Id, error: JsonRpcError) -> Self {
        Self::Response {
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }
}

/// Miners are sloppy about `id`: notifications arrive with `"id": null` or with no
/// `id` at all, and some requests omit `params`. A message with a `method` and a
/// non-null `id` is a request, a message with a `method` and a null or absent `id`
/// is a notification, and anything carrying `result` or `error` is a response.
impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;

        let method = value.get("method");
        let id = value.get("id");

        let is_response = method.is_none() && (value.get("result").is_some() || value.get("error").is_some());

        if is_response {
            #[derive(Deserialize)]
            struct Resp {
                id: Id,
                result: Option<Value>,
                error: Option<JsonRpcError>,
            }

            let r: Resp = serde_json::from_value(value).map_err(de::Error::custom)?;

            return Ok(Message::Response {
                id: r.id,
                result: r.result,
                error: r.error,
            });
        }

        let method = method
            .and_then(Value::as_str)
            .ok_or_else(|| de::Error::missing_field("method"))?
            .to_string();

        let params = value.get("params").cloned().unwrap_or(Value::Null);

        match id {
            None | Some(Value::Null) => Ok(Message::Notification { method, params }),
            Some(id) => Ok(Message::Request {
                id: Id::deserialize(id).map_err(de::Error::custom)?,
                method,
                params,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq, serde_json::json};

    #[track_caller]
    fn case(s: &str, expected: Message) {
        let actual = serde_json::from_str::<Message>(s).unwrap();
        assert_eq!(actual, expected, "deserialize Message from str");

        let serialized = serde_json::to_string(&actual).unwrap();
        let lhs: Value = serde_json::from_str(s).unwrap();
        let rhs: Value = serde_json::from_str(&serialized).unwrap();
        assert_eq!(lhs, rhs, "JSON semantic equality");
    }

    #[test]
    fn request() {
        case(
            r#"{"id":1,"method":"mining.subscribe","params":[]}"#,
            Message::Request {
                id: Id::Number(1),
                method: "mining.subscribe".into(),
                params: json!([]),
            },
        );

        case(
            r#"{"id":"a1","method":"login","params":{"login":"x"}}"#,
            Message::Request {
                id: Id::String("a1".into()),
                method: "login".into(),
                params: json!({"login": "x"}),
            },
        );
    }

    #[test]
    fn request_without_params() {
        assert_eq!(
            serde_json::from_str::<Message>(r#"{"id":3,"method":"mining.extranonce.subscribe"}"#)
                .unwrap(),
            Message::Request {
                id: Id::Number(3),
                method: "mining.extranonce.subscribe".into(),
                params: Value::Null,
            }
        );
    }

    #[test]
    fn notification() {
        case(
            r#"{"method":"mining.notify","params":[]}"#,
            Message::notification("mining.notify", json!([])),
        );

        assert_eq!(
            serde_json::from_str::<Message>(r#"{"method":"mining.notify","params":[],"id":null}"#)
                .unwrap(),
            Message::notification("mining.notify", json!([])),
        );
    }

    #[test]
    fn response() {
        case(
            r#"{"id":4,"result":true,"error":null}"#,
            Message::response(Id::Number(4), json!(true)),
        );
    }

    #[test]
    fn error_response() {
        case(
            r#"{"id":10,"result":null,"error":[21,"job not found",null]}"#,
            Message::error(
                Id::Number(10),
                StratumError::JobNotFound.with_message("job not found"),
            ),
        );
    }

    #[test]
    fn garbage() {
        assert!(serde_json::from_str::<Message>(r#"{"foo":1}"#).is_err());
        assert!(serde_json::from_str::<Message>(r#"{"id":1,"method":7}"#).is_err());
        assert!(serde_json::from_str::<Message>("[1,2,3]").is_err());
    }

    #[test]
    fn method() {
        assert_eq!(
            Message::notification("mining.notify", json!([])).method(),
            Some("mining.notify")
        );
        assert_eq!(Message::response(Id::Null, json!(true)).method(), None);
    }
}
