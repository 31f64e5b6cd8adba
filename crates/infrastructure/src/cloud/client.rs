use std::collections::BTreeMap;
use std::io::Write;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use tracing::debug;
use url::Url;

use domain::cloud::{
    CloudApi, CloudError, DeviceReport, ProvisioningRequest, ProvisioningResponse, TargetFetch,
};
use domain::state::TargetState;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Reports above this size are gzipped.
const GZIP_THRESHOLD: usize = 1024;

/// Device-side HTTP client for the cloud control plane.
pub struct CloudClient {
    http: reqwest::Client,
    base: Url,
    api_key: RwLock<Option<String>>,
    compress_logs: bool,
}

impl CloudClient {
    pub fn new(base: Url, compress_logs: bool) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| CloudError::Transient(e.to_string()))?;
        Ok(Self {
            http,
            base,
            api_key: RwLock::new(None),
            compress_logs,
        })
    }

    pub fn set_api_key(&self, api_key: impl Into<String>) {
        *self.api_key.write().unwrap() = Some(api_key.into());
    }

    fn api_key(&self) -> Option<String> {
        self.api_key.read().unwrap().clone()
    }

    fn endpoint(&self, path: &str) -> Result<Url, CloudError> {
        self.base
            .join(path)
            .map_err(|e| CloudError::Malformed(format!("bad endpoint {path}: {e}")))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key() {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl CloudApi for CloudClient {
    async fn register(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<ProvisioningResponse, CloudError> {
        let url = self.endpoint("device/register")?;
        let response = self
            .http
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(map_transport)?;

        match response.status() {
            status if status.is_success() => response
                .json::<ProvisioningResponse>()
                .await
                .map_err(|e| CloudError::Malformed(e.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CloudError::Unauthorized),
            status => Err(status_error(status, response).await),
        }
    }

    async fn fetch_target_state(
        &self,
        uuid: &str,
        etag: Option<&str>,
    ) -> Result<TargetFetch, CloudError> {
        let url = self.endpoint(&format!("device/{uuid}/state"))?;
        let mut request = self.authorized(self.http.get(url));
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        let response = request.send().await.map_err(map_transport)?;

        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(TargetFetch::NotModified),
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get(ETAG)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let mut body: BTreeMap<String, TargetState> = response
                    .json()
                    .await
                    .map_err(|e| CloudError::Malformed(e.to_string()))?;
                let state = body
                    .remove(uuid)
                    .ok_or_else(|| {
                        CloudError::Malformed(format!("target state missing device {uuid}"))
                    })?;
                Ok(TargetFetch::Fetched { state, etag })
            }
            StatusCode::UNAUTHORIZED => Err(CloudError::Unauthorized),
            status => Err(status_error(status, response).await),
        }
    }

    async fn patch_device_state(
        &self,
        uuid: &str,
        report: &DeviceReport,
    ) -> Result<(), CloudError> {
        let url = self.endpoint("device/state")?;
        let body = serde_json::to_vec(&BTreeMap::from([(uuid.to_string(), report)]))
            .map_err(|e| CloudError::Malformed(e.to_string()))?;

        let mut request = self
            .authorized(self.http.patch(url))
            .header(CONTENT_TYPE, "application/json");
        if body.len() > GZIP_THRESHOLD {
            debug!(bytes = body.len(), "Compressing state report");
            request = request
                .header(CONTENT_ENCODING, "gzip")
                .body(gzip(&body)?);
        } else {
            request = request.body(body);
        }

        let response = request.send().await.map_err(map_transport)?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => Err(CloudError::Unauthorized),
            status => Err(status_error(status, response).await),
        }
    }

    async fn upload_logs(&self, uuid: &str, ndjson: Vec<u8>) -> Result<(), CloudError> {
        let url = self.endpoint(&format!("device/{uuid}/logs"))?;
        let api_key = self.api_key().ok_or(CloudError::Unauthorized)?;

        let mut request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .header("X-Device-API-Key", api_key);
        if self.compress_logs {
            request = request
                .header(CONTENT_ENCODING, "gzip")
                .body(gzip(&ndjson)?);
        } else {
            request = request.body(ndjson);
        }

        let response = request.send().await.map_err(map_transport)?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => Err(CloudError::Unauthorized),
            status => Err(status_error(status, response).await),
        }
    }
}

fn map_transport(error: reqwest::Error) -> CloudError {
    CloudError::Transient(error.to_string())
}

async fn status_error(status: StatusCode, response: reqwest::Response) -> CloudError {
    let message = response.text().await.unwrap_or_default();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        CloudError::Transient(format!("{status}: {message}"))
    } else {
        CloudError::Http {
            status: status.as_u16(),
            message,
        }
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, CloudError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| CloudError::Malformed(format!("gzip failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_gzip_round_trip() {
        let payload = br#"{"message":"hello"}"#.repeat(50);
        let compressed = gzip(&payload).unwrap();
        assert!(compressed.len() < payload.len());

        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, payload);
    }

    #[test]
    fn test_endpoint_joining() {
        let client = CloudClient::new(
            Url::parse("http://localhost:30567/").unwrap(),
            false,
        )
        .unwrap();
        assert_eq!(
            client.endpoint("device/dev-1/state").unwrap().as_str(),
            "http://localhost:30567/device/dev-1/state"
        );
    }

    #[test]
    fn test_api_key_swap() {
        let client =
            CloudClient::new(Url::parse("http://localhost:30567/").unwrap(), false).unwrap();
        assert!(client.api_key().is_none());
        client.set_api_key("key-1");
        assert_eq!(client.api_key().as_deref(), Some("key-1"));
    }
}
