//! Blocking HTTP transport to the inference endpoint.

use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{EncodedBody, InferenceResponse};

pub const HEALTHCHECK_PATH: &str = "/healthcheck";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Path the request is POSTed to.
    pub route: String,
    pub healthcheck_attempts: u32,
    pub healthcheck_interval: Duration,
    /// Overall timeout of a single HTTP call.
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8000,
            route: "/".to_string(),
            healthcheck_attempts: 30,
            healthcheck_interval: Duration::from_millis(1000),
            timeout: Duration::from_secs(600),
        }
    }
}

/// An undecoded answer from the endpoint.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub content_type: String,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn decode(&self) -> Result<InferenceResponse> {
        InferenceResponse::decode(&self.body, &self.content_type)
    }
}

pub struct InferenceClient {
    http: Client,
    config: ClientConfig,
}

fn transport(err: impl std::fmt::Display) -> Error {
    Error::Transport {
        status: None,
        message: err.to_string(),
    }
}

impl InferenceClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(transport)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        format!("http://{}:{}{path}", self.config.host, self.config.port)
    }

    /// Poll the health check until the endpoint answers. Any HTTP response
    /// counts as ready; only connection failures are retried.
    ///
    /// Returns the number of attempts used.
    pub fn wait_until_ready(&self) -> Result<u32> {
        let url = self.url(HEALTHCHECK_PATH);
        let attempts = self.config.healthcheck_attempts.max(1);
        for attempt in 1..=attempts {
            match self.http.get(&url).send() {
                Ok(response) => {
                    info!(
                        "Endpoint ready after {attempt} attempt(s) (HTTP {})",
                        response.status().as_u16()
                    );
                    return Ok(attempt);
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    debug!("Health check attempt {attempt}/{attempts} failed: {e}");
                    if attempt < attempts {
                        thread::sleep(self.config.healthcheck_interval);
                    }
                }
                Err(e) => return Err(transport(e)),
            }
        }
        warn!("Endpoint at {url} never became ready");
        Err(transport(format!(
            "{url} did not answer after {attempts} attempt(s)"
        )))
    }

    /// POST one encoded request and decode the multipart answer.
    pub fn infer(&self, request: &EncodedBody) -> Result<InferenceResponse> {
        self.post(request)?.decode()
    }

    /// POST one encoded request and return the successful answer as received.
    pub fn post(&self, request: &EncodedBody) -> Result<RawResponse> {
        let url = self.url(&self.config.route);
        info!("Sending {} byte request to {url}", request.body.len());
        let response = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, request.content_type.header_value())
            .body(request.body.clone())
            .send()
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::Transport {
                status: Some(status.as_u16()),
                message: body.chars().take(512).collect(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::Multipart("response has no Content-Type".to_string()))?;
        let body = response.bytes().map_err(transport)?.to_vec();
        debug!("Received {} byte response ({content_type})", body.len());

        Ok(RawResponse { content_type, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::build_response;
    use crate::protocol::manifest::ResponseManifest;
    use crate::protocol::multipart::ContentType;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;

    /// Serve `count` connections, answering each with `status`, `content_type`
    /// and `body`.
    fn serve(count: usize, status: u16, content_type: String, body: Vec<u8>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            for stream in listener.incoming().take(count) {
                let mut stream = stream.unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut content_length = 0usize;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    if line == "\r\n" || line.is_empty() {
                        break;
                    }
                    if let Some((key, value)) = line.split_once(':')
                        && key.eq_ignore_ascii_case("content-length")
                    {
                        content_length = value.trim().parse().unwrap();
                    }
                }
                let mut request_body = vec![0u8; content_length];
                reader.read_exact(&mut request_body).unwrap();

                let head = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                stream.write_all(head.as_bytes()).unwrap();
                stream.write_all(&body).unwrap();
            }
        });
        port
    }

    fn config(port: u16) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port,
            healthcheck_attempts: 2,
            healthcheck_interval: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
            ..ClientConfig::default()
        }
    }

    fn request() -> EncodedBody {
        EncodedBody {
            content_type: ContentType::new("req"),
            body: b"--req--\r\n".to_vec(),
            digest: String::new(),
        }
    }

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.port, 8000);
        assert_eq!(config.healthcheck_attempts, 30);
        assert_eq!(config.healthcheck_interval, Duration::from_secs(1));
    }

    #[test]
    fn url_joins_route() {
        let client = InferenceClient::new(config(1234)).unwrap();
        assert_eq!(client.url("/"), "http://127.0.0.1:1234/");
        assert_eq!(client.url("predict"), "http://127.0.0.1:1234/predict");
    }

    #[test]
    fn health_check_gives_up_on_closed_port() {
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = InferenceClient::new(config(port)).unwrap();
        let err = client.wait_until_ready().unwrap_err();
        assert!(matches!(err, Error::Transport { status: None, .. }));
    }

    #[test]
    fn any_http_answer_is_ready() {
        let port = serve(1, 503, "text/plain".to_string(), b"busy".to_vec());
        let client = InferenceClient::new(config(port)).unwrap();
        assert_eq!(client.wait_until_ready().unwrap(), 1);
    }

    #[test]
    fn non_success_status_is_reported() {
        let port = serve(1, 500, "text/plain".to_string(), b"boom".to_vec());
        let client = InferenceClient::new(config(port)).unwrap();
        let err = client.infer(&request()).unwrap_err();
        match err {
            Error::Transport { status, message } => {
                assert_eq!(status, Some(500));
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn successful_exchange_is_decoded() {
        let encoded =
            build_response(&ResponseManifest::default(), &[], &"0".repeat(64), None).unwrap();
        let port = serve(
            1,
            200,
            encoded.content_type.header_value(),
            encoded.body.clone(),
        );
        let client = InferenceClient::new(config(port)).unwrap();
        let response = client.infer(&request()).unwrap();
        assert!(response.manifest.parts.is_empty());
        assert_eq!(response.digest.unwrap().output, encoded.digest);
    }

    #[test]
    fn raw_answer_keeps_body_and_content_type() {
        let encoded =
            build_response(&ResponseManifest::default(), &[], &"0".repeat(64), None).unwrap();
        let header = encoded.content_type.header_value();
        let port = serve(1, 200, header.clone(), encoded.body.clone());
        let client = InferenceClient::new(config(port)).unwrap();
        let raw = client.post(&request()).unwrap();
        assert_eq!(raw.content_type, header);
        assert_eq!(raw.body, encoded.body);
        assert!(raw.decode().is_ok());
    }
}
