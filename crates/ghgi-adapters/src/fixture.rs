use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{decode_payload, EmissionsFetcher, FetchError, FetchRequest, SourcePayload};

/// Canned upstream response for one (source, reference number).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixtureResponse {
    Body(Vec<u8>),
    Status(u16),
    TransportError(String),
}

impl FixtureResponse {
    pub fn json(value: serde_json::Value) -> Self {
        Self::Body(value.to_string().into_bytes())
    }
}

/// Offline fetcher. Responses come from an in-memory table first, then from
/// `<root>/<datasource_id>/<gpc>.json`; anything else is `NoData`.
#[derive(Debug, Default)]
pub struct FixtureFetcher {
    root: Option<PathBuf>,
    responses: HashMap<(String, String), FixtureResponse>,
    calls: Mutex<Vec<String>>,
}

impl FixtureFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dir(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    pub fn with_response(
        mut self,
        datasource_id: &str,
        gpc_reference_number: &str,
        response: FixtureResponse,
    ) -> Self {
        self.responses.insert(
            (datasource_id.to_string(), gpc_reference_number.to_string()),
            response,
        );
        self
    }

    /// Data source ids in the order they were fetched.
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    async fn load(&self, request: &FetchRequest) -> Result<Vec<u8>, FetchError> {
        let gpc = request.gpc_reference_number.to_string();
        let key = (request.datasource_id.clone(), gpc.clone());
        match self.responses.get(&key) {
            Some(FixtureResponse::Body(body)) => return Ok(body.clone()),
            Some(FixtureResponse::Status(404)) => return Err(FetchError::NoData),
            Some(FixtureResponse::Status(status)) => {
                return Err(FetchError::HttpStatus {
                    status: *status,
                    url: format!("fixture://{}/{gpc}", request.datasource_id),
                })
            }
            Some(FixtureResponse::TransportError(message)) => {
                return Err(FetchError::Request(message.clone()))
            }
            None => {}
        }

        let Some(root) = &self.root else {
            return Err(FetchError::NoData);
        };
        let path = root
            .join(&request.datasource_id)
            .join(format!("{gpc}.json"));
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(FetchError::NoData),
            Err(err) => Err(FetchError::Request(format!(
                "reading fixture {}: {err}",
                path.display()
            ))),
        }
    }
}

#[async_trait]
impl EmissionsFetcher for FixtureFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<SourcePayload, FetchError> {
        self.calls.lock().await.push(request.datasource_id.clone());
        let body = self.load(request).await?;
        decode_payload(request.kind, &body)
    }
}
