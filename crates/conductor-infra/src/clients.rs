//! HTTP adapters for the agent, decision and approval services

use async_trait::async_trait;
use conductor_core::ClientSettings;
use conductor_workflow::{
    AgentClient, AgentResponse, ApprovalClient, ClientError, DecisionClient, RiskLevel,
};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Connection settings shared by the HTTP clients
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl HttpClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_settings(base_url: &str, settings: &ClientSettings) -> Self {
        Self::new(base_url)
            .with_api_key(settings.api_key.clone())
            .with_timeout(settings.request_timeout())
    }
}

/// Thin JSON-over-HTTP transport
#[derive(Debug, Clone)]
struct Transport {
    config: HttpClientConfig,
    client: Client,
}

impl Transport {
    fn new(config: HttpClientConfig) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::Rejected(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<reqwest::Response, ClientError> {
        let url = format!("{}{}", self.config.base_url, path);
        debug!(url = %url, "Sending POST request");

        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("{} returned {}: {}", path, status, body.chars().take(200).collect::<String>());
        Err(if is_transient_status(status) {
            ClientError::Transient(message)
        } else {
            ClientError::Rejected(message)
        })
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn classify_transport(err: reqwest::Error) -> ClientError {
    if err.is_builder() {
        ClientError::Rejected(err.to_string())
    } else {
        ClientError::Transient(err.to_string())
    }
}

fn decode_error(err: reqwest::Error) -> ClientError {
    ClientError::Rejected(format!("invalid response body: {}", err))
}

/// `POST {base}/agents/{name}/invoke`
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    transport: Transport,
}

impl HttpAgentClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            transport: Transport::new(config)?,
        })
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn invoke(&self, agent: &str, payload: &Value) -> Result<AgentResponse, ClientError> {
        let path = format!("/agents/{}/invoke", agent);
        let response = self.transport.post(&path, payload).await?;
        response.json::<AgentResponse>().await.map_err(decode_error)
    }
}

#[derive(Debug, Deserialize)]
struct DecideResponse {
    #[serde(alias = "response", alias = "content")]
    answer: Value,
}

/// `POST {base}/decide`. The answer is handed back raw for parsing.
#[derive(Debug, Clone)]
pub struct HttpDecisionClient {
    transport: Transport,
}

impl HttpDecisionClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            transport: Transport::new(config)?,
        })
    }
}

#[async_trait]
impl DecisionClient for HttpDecisionClient {
    async fn ask(&self, prompt: &str) -> Result<String, ClientError> {
        let response = self
            .transport
            .post("/decide", &json!({ "prompt": prompt }))
            .await?;
        let text = response.text().await.map_err(decode_error)?;

        // Either a wrapper object or the answer itself
        match serde_json::from_str::<DecideResponse>(&text) {
            Ok(DecideResponse {
                answer: Value::String(answer),
            }) => Ok(answer),
            Ok(DecideResponse { answer }) => Ok(answer.to_string()),
            Err(_) => Ok(text),
        }
    }
}

#[derive(Debug, Serialize)]
struct TicketRequest<'a> {
    run_id: &'a str,
    step_id: &'a str,
    summary: &'a str,
    risk_level: RiskLevel,
}

#[derive(Debug, Deserialize)]
struct TicketResponse {
    #[serde(alias = "ticket_id", alias = "external_ref")]
    id: String,
}

/// `POST {base}/tickets`
#[derive(Debug, Clone)]
pub struct HttpApprovalClient {
    transport: Transport,
}

impl HttpApprovalClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            transport: Transport::new(config)?,
        })
    }
}

#[async_trait]
impl ApprovalClient for HttpApprovalClient {
    async fn create_ticket(
        &self,
        run_id: &str,
        step_id: &str,
        summary: &str,
        risk_level: RiskLevel,
    ) -> Result<String, ClientError> {
        let request = TicketRequest {
            run_id,
            step_id,
            summary,
            risk_level,
        };
        let response = self.transport.post("/tickets", &request).await?;
        let ticket: TicketResponse = response.json().await.map_err(decode_error)?;
        Ok(ticket.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> HttpClientConfig {
        HttpClientConfig::new(format!("{}/", server.uri())).with_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_agent_invoke() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agents/builder/invoke"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(json!({"image": "app:1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"output": {"digest": "sha256:1"}})))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            HttpAgentClient::new(config(&server).with_api_key(Some("secret".to_string()))).unwrap();
        let response = client.invoke("builder", &json!({"image": "app:1"})).await.unwrap();

        assert_eq!(response.output["digest"], "sha256:1");
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_agent_reported_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agents/builder/invoke"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "disk full"})))
            .mount(&server)
            .await;

        let client = HttpAgentClient::new(config(&server)).unwrap();
        let response = client.invoke("builder", &json!({})).await.unwrap();
        assert_eq!(response.error.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(path("/agents/flaky/invoke"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(path("/agents/missing/invoke"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such agent"))
            .mount(&server)
            .await;

        let client = HttpAgentClient::new(config(&server)).unwrap();

        let err = client.invoke("flaky", &json!({})).await.unwrap_err();
        assert!(err.is_transient());

        let err = client.invoke("missing", &json!({})).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("no such agent"));
    }

    #[tokio::test]
    async fn test_unreachable_is_transient() {
        let client = HttpAgentClient::new(
            HttpClientConfig::new("http://127.0.0.1:9").with_timeout(Duration::from_millis(500)),
        )
        .unwrap();
        assert!(client.invoke("x", &json!({})).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_decision_answer_shapes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/decide"))
            .and(body_json(json!({"prompt": "Ship?"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"answer": "{\"decision\": \"ship\"}"})),
            )
            .mount(&server)
            .await;

        let client = HttpDecisionClient::new(config(&server)).unwrap();
        assert_eq!(client.ask("Ship?").await.unwrap(), r#"{"decision": "ship"}"#);

        let server = MockServer::start().await;
        Mock::given(path("/decide"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"decision": "hold"})))
            .mount(&server)
            .await;

        let client = HttpDecisionClient::new(config(&server)).unwrap();
        assert!(client.ask("?").await.unwrap().contains("hold"));
    }

    #[tokio::test]
    async fn test_create_ticket() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tickets"))
            .and(body_json(json!({
                "run_id": "run-1",
                "step_id": "approve",
                "summary": "Deploy app:1",
                "risk_level": "medium"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ticket_id": "OPS-42"})))
            .mount(&server)
            .await;

        let client = HttpApprovalClient::new(config(&server)).unwrap();
        let id = client
            .create_ticket("run-1", "approve", "Deploy app:1", RiskLevel::Medium)
            .await
            .unwrap();
        assert_eq!(id, "OPS-42");
    }
}
