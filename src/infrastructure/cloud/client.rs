//! Cloud Link
//!
//! Authenticated HTTP session against the vendor API.
//!
//! ```text
//! POST {base}/{version}/auth/login          credentials -> token
//! GET  {base}/{version}/devices             -> device list
//! GET  {base}/{version}/devices/{id}/status -> status record
//! POST {base}/{version}/devices/{id}/control command payload -> result
//! ```
//!
//! Login happens on first use. A 401 on any later request drops the token and
//! allows exactly one re-login and retry. Requests share one `reqwest::Client`
//! and may run concurrently; logins are serialized so a burst of 401s costs a
//! single login.

use crate::domain::command::CommandRequest;
use crate::domain::models::{DeviceStatus, SensorSample};
use crate::domain::settings::CloudSettings;
use crate::error::{ControlError, ParseError, Result};
use crate::infrastructure::cloud::contract::CloudContract;
use crate::infrastructure::transport::DeviceListing;
use reqwest::{Method, Response, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const SEND_COMMAND: &str = "send command";

/// HTTP client for one cloud account
pub struct CloudLink {
    http: reqwest::Client,
    api_root: Url,
    email: String,
    password: String,
    contract: CloudContract,
    timeout: Duration,
    token: RwLock<Option<String>>,
    login_lock: Mutex<()>,
}

impl CloudLink {
    pub fn new(settings: &CloudSettings, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ControlError::Connection(format!("HTTP client setup: {e}")))?;

        let root = format!(
            "{}/{}",
            settings.base_url.trim_end_matches('/'),
            settings.api_version.trim_matches('/')
        );
        let api_root = Url::parse(&root)
            .map_err(|e| ControlError::Connection(format!("invalid cloud URL {root}: {e}")))?;

        Ok(Self {
            http,
            api_root,
            email: settings.email.clone(),
            password: settings.password.clone(),
            contract: settings.contract.clone(),
            timeout,
            token: RwLock::new(None),
            login_lock: Mutex::new(()),
        })
    }

    /// API URL with each segment percent-encoded
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.api_root.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ControlError::Connection(format!("{} cannot take a path", self.api_root))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Authenticate now; used as the connection test
    pub async fn probe(&self) -> Result<()> {
        self.token().await.map(|_| ())
    }

    pub async fn list_devices(&self) -> Result<DeviceListing> {
        let (body, _) = self
            .request("list devices", Method::GET, &["devices"], None)
            .await?;
        let listing = self.contract.parse_listing(&body)?;
        debug!(
            "Cloud listed {} devices ({} removed)",
            listing.devices.len(),
            listing.removed.len()
        );
        Ok(listing)
    }

    pub async fn read_status(&self, device_id: &str) -> Result<DeviceStatus> {
        let path = ["devices", device_id, "status"];
        let (body, raw) = self
            .request("read status", Method::GET, &path, None)
            .await?;
        Ok(self.contract.parse_status(&body, raw)?)
    }

    /// Sensors come with the status record
    pub async fn read_sensors(&self, device_id: &str) -> Result<SensorSample> {
        Ok(self.read_status(device_id).await?.sensors.unwrap_or_default())
    }

    pub async fn send_command(&self, request: &CommandRequest) -> Result<()> {
        let path = ["devices", request.target_id(), "control"];
        let payload = self.contract.control_body(request);
        info!("Sending {} to cloud device {}", request.opcode(), request.target_id());

        let (body, _) = self
            .request(SEND_COMMAND, Method::POST, &path, Some(&payload))
            .await?;
        match self.contract.control_refusal(&body) {
            Some(reason) => Err(ControlError::Command(format!(
                "{} on {}: {reason}",
                request.opcode(),
                request.target_id()
            ))),
            None => Ok(()),
        }
    }

    /// Forget the session token
    pub async fn close(&self) {
        *self.token.write().await = None;
    }

    async fn token(&self) -> Result<String> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }

        let _login = self.login_lock.lock().await;
        // Another caller may have logged in while we waited
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }

        let token = self.login().await?;
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn invalidate(&self, stale: &str) {
        let mut token = self.token.write().await;
        if token.as_deref() == Some(stale) {
            *token = None;
        }
    }

    async fn login(&self) -> Result<String> {
        info!("Authenticating with {} as {}", self.api_root, self.email);
        let response = self
            .http
            .post(self.url(&["auth", "login"])?)
            .json(&self.contract.login_body(&self.email, &self.password))
            .send()
            .await
            .map_err(|e| self.transport_error("login", e))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ControlError::Authentication(format!(
                    "credentials for {} rejected",
                    self.email
                )))
            }
            status if !status.is_success() => return Err(status_error("login", status)),
            _ => {}
        }

        let (body, _) = self.read_json("login", response).await?;
        let token = self.contract.parse_token(&body).map_err(|e| {
            ControlError::ProtocolMismatch(format!("login response without token: {e}"))
        })?;
        info!("Authenticated with cloud");
        Ok(token)
    }

    /// Send with the current token, re-authenticating once on 401
    async fn request(
        &self,
        operation: &'static str,
        method: Method,
        path: &[&str],
        body: Option<&Value>,
    ) -> Result<(Value, Vec<u8>)> {
        let token = self.token().await?;
        let response = self.send(operation, method.clone(), path, body, &token).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return self.finish(operation, response).await;
        }

        warn!("Cloud rejected token during {}, re-authenticating", operation);
        self.invalidate(&token).await;
        let token = self.token().await?;
        let response = self.send(operation, method, path, body, &token).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            self.invalidate(&token).await;
            return Err(ControlError::Authentication(format!(
                "{operation} rejected after re-authentication"
            )));
        }
        self.finish(operation, response).await
    }

    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        path: &[&str],
        body: Option<&Value>,
        token: &str,
    ) -> Result<Response> {
        let mut builder = self
            .http
            .request(method, self.url(path)?)
            .bearer_auth(token);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder
            .send()
            .await
            .map_err(|e| self.transport_error(operation, e))
    }

    async fn finish(&self, operation: &'static str, response: Response) -> Result<(Value, Vec<u8>)> {
        let status = response.status();
        if status.is_success() {
            return self.read_json(operation, response).await;
        }

        let detail = response.text().await.unwrap_or_default();
        debug!("{} failed with {}: {}", operation, status, detail);
        if status.is_client_error() && operation == SEND_COMMAND {
            return Err(ControlError::Command(format!("server refused ({status}): {detail}")));
        }
        Err(status_error(operation, status))
    }

    async fn read_json(&self, operation: &'static str, response: Response) -> Result<(Value, Vec<u8>)> {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(operation, e))?;
        if bytes.is_empty() {
            return Ok((Value::Null, Vec::new()));
        }
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| ParseError::Json(format!("{operation}: {e}")))?;
        Ok((value, bytes.to_vec()))
    }

    fn transport_error(&self, operation: &'static str, err: reqwest::Error) -> ControlError {
        if err.is_timeout() {
            ControlError::Timeout {
                operation,
                after: self.timeout,
            }
        } else {
            ControlError::Connection(format!("{operation}: {err}"))
        }
    }
}

fn status_error(operation: &str, status: StatusCode) -> ControlError {
    if status.is_server_error() {
        ControlError::Connection(format!("{operation}: server error {status}"))
    } else {
        ControlError::ProtocolMismatch(format!("{operation}: unexpected status {status}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::command::{Opcode, Parameters};
    use crate::domain::models::PowerState;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(server: &MockServer) -> CloudSettings {
        CloudSettings {
            base_url: server.uri(),
            api_version: "v1".into(),
            email: "grower@example.com".into(),
            password: "secret".into(),
            contract: CloudContract::default(),
        }
    }

    fn link(server: &MockServer) -> CloudLink {
        CloudLink::new(&settings(server), Duration::from_secs(2)).unwrap()
    }

    async fn mount_login(server: &MockServer, token: &str, times: u64) {
        Mock::given(method("POST"))
            .and(path("/v1/auth/login"))
            .and(body_json(json!({"email": "grower@example.com", "password": "secret"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": token})))
            .up_to_n_times(times)
            .expect(times)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_lazy_login_then_list() {
        let server = MockServer::start().await;
        mount_login(&server, "t1", 1).await;
        Mock::given(method("GET"))
            .and(path("/v1/devices"))
            .and(header("authorization", "Bearer t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "devices": [{"id": "dev-1", "name": "Tent", "features": ["lighting"]}]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let link = link(&server);
        let listing = link.list_devices().await.unwrap();
        assert_eq!(listing.devices[0].id, "dev-1");
        // token is reused
        link.list_devices().await.unwrap();
    }

    #[tokio::test]
    async fn test_401_triggers_single_relogin() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "old"})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "new"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/devices/dev-1/status"))
            .and(header("authorization", "Bearer old"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/devices/dev-1/status"))
            .and(header("authorization", "Bearer new"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"power": true})))
            .mount(&server)
            .await;

        let status = link(&server).read_status("dev-1").await.unwrap();
        assert_eq!(status.power_state, PowerState::On);
        assert_eq!(status.raw, br#"{"power":true}"#.to_vec());
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_relogin() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "old"})))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "new"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer old"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer new"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"power": "off"})))
            .expect(2)
            .mount(&server)
            .await;

        let link = link(&server);
        link.probe().await.unwrap();
        let (a, b) = tokio::join!(link.read_status("dev-1"), link.read_status("dev-2"));
        assert_eq!(a.unwrap().power_state, PowerState::Off);
        assert_eq!(b.unwrap().power_state, PowerState::Off);
    }

    #[tokio::test]
    async fn test_device_id_is_escaped_in_path() {
        let server = MockServer::start().await;
        mount_login(&server, "t1", 1).await;
        Mock::given(method("GET"))
            .and(path("/v1/devices/bay%2F7%3Fx/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"power": "on"})))
            .expect(1)
            .mount(&server)
            .await;

        let status = link(&server).read_status("bay/7?x").await.unwrap();
        assert_eq!(status.power_state, PowerState::On);
    }

    #[tokio::test]
    async fn test_second_401_is_authentication_error() {
        let server = MockServer::start().await;
        mount_login(&server, "t1", 2).await;
        Mock::given(method("GET"))
            .and(path("/v1/devices"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let err = link(&server).list_devices().await.unwrap_err();
        assert!(matches!(err, ControlError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/login"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        assert!(matches!(
            link(&server).probe().await,
            Err(ControlError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_slow_server_is_timeout() {
        let server = MockServer::start().await;
        mount_login(&server, "t1", 1).await;
        Mock::given(method("GET"))
            .and(path("/v1/devices"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"devices": []}))
                    .set_delay(Duration::from_millis(800)),
            )
            .mount(&server)
            .await;

        let link = CloudLink::new(&settings(&server), Duration::from_millis(200)).unwrap();
        let err = link.list_devices().await.unwrap_err();
        assert!(matches!(err, ControlError::Timeout { operation: "list devices", .. }));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_error() {
        let settings = CloudSettings {
            base_url: "http://127.0.0.1:1".into(),
            api_version: "v1".into(),
            email: "grower@example.com".into(),
            password: "secret".into(),
            contract: CloudContract::default(),
        };
        let link = CloudLink::new(&settings, Duration::from_secs(2)).unwrap();
        assert!(matches!(
            link.probe().await,
            Err(ControlError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_server_error_and_bad_json() {
        let server = MockServer::start().await;
        mount_login(&server, "t1", 1).await;
        Mock::given(method("GET"))
            .and(path("/v1/devices"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/devices/dev-1/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let link = link(&server);
        assert!(matches!(
            link.list_devices().await,
            Err(ControlError::Connection(_))
        ));
        assert!(matches!(
            link.read_status("dev-1").await,
            Err(ControlError::Parse(ParseError::Json(_)))
        ));
    }

    #[tokio::test]
    async fn test_send_command_payload_and_refusal() {
        let server = MockServer::start().await;
        mount_login(&server, "t1", 1).await;
        Mock::given(method("POST"))
            .and(path("/v1/devices/dev-1/control"))
            .and(body_json(json!({"device_id": "dev-1", "command": "set_light", "intensity": 50})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/devices/dev-2/control"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": false, "message": "device offline"})),
            )
            .mount(&server)
            .await;

        let link = link(&server);
        let light = CommandRequest::new(
            "dev-1",
            Opcode::SetLight,
            Parameters::new().with("intensity", 50),
        )
        .unwrap();
        link.send_command(&light).await.unwrap();

        let power = CommandRequest::new("dev-2", Opcode::Power, Parameters::new().with("on", false))
            .unwrap();
        let err = link.send_command(&power).await.unwrap_err();
        assert!(matches!(err, ControlError::Command(msg) if msg.contains("device offline")));
    }
}
