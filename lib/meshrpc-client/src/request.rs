use crate::codec::DEFAULT_CONTENT_TYPE;
use crate::error::{ClientError, Result};
use crate::rpc_codec::headers;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;

/// An outgoing call
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub service: String,
    pub endpoint: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub stream: bool,
    pub header: HashMap<String, String>,
}

impl Request {
    pub fn new(service: impl Into<String>, endpoint: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            service: service.into(),
            endpoint: endpoint.into(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            body,
            stream: false,
            header: HashMap::new(),
        }
    }

    /// Build a request whose body is `payload` serialised as JSON
    pub fn json<T: Serialize>(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        payload: &T,
    ) -> Result<Self> {
        let body = serde_json::to_vec(payload).map_err(|e| ClientError::Codec(e.to_string()))?;
        Ok(Self::new(service, endpoint, body))
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Mark as a stream request, as required by `RpcClient::stream`
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }
}

/// A decoded reply
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub header: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| ClientError::Codec(e.to_string()))
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header.get(headers::CONTENT_TYPE).map(String::as_str)
    }
}
