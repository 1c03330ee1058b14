use async_stream::stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use askpipe_core::{ChatTurn, Error, GenRequest, GenerationBackend, Result, TokenStream};

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn with_scheme(host: String) -> String {
    if host.contains("://") {
        host
    } else {
        format!("http://{host}")
    }
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: with_scheme(base_url.into()),
        }
    }

    pub fn from_env(client: reqwest::Client) -> Self {
        let base_url = env("ASKPIPE_OLLAMA_BASE_URL")
            .or_else(|| env("OLLAMA_HOST"))
            .map(with_scheme)
            .unwrap_or_else(|| "http://127.0.0.1:11434".to_string());
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint_chat(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }

    fn endpoint_tags(&self) -> String {
        format!("{}/api/tags", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct WireChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct WireChatResponse {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    message: Option<WireMessage>,
    done: Option<bool>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    model: String,
}

#[async_trait::async_trait]
impl GenerationBackend for OllamaClient {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn chat(&self, req: &GenRequest) -> Result<String> {
        let body = WireChatRequest {
            model: &req.model,
            messages: &req.messages,
            stream: false,
        };

        let mut http = self
            .client
            .post(self.endpoint_chat())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&body);
        if let Some(timeout) = req.timeout() {
            http = http.timeout(timeout);
        }

        let resp = http
            .send()
            .await
            .map_err(|e| Error::Generation(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Generation(format!("ollama chat HTTP {status}")));
        }

        let parsed: WireChatResponse =
            resp.json().await.map_err(|e| Error::Generation(e.to_string()))?;
        Ok(parsed.message.content)
    }

    async fn chat_stream(&self, req: &GenRequest) -> Result<TokenStream> {
        let body = WireChatRequest {
            model: &req.model,
            messages: &req.messages,
            stream: true,
        };

        // No total-request timeout here: it would cut healthy generations
        // mid-stream. Callers time out on inactivity if they need to.
        let resp = self
            .client
            .post(self.endpoint_chat())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Generation(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Generation(format!("ollama chat HTTP {status}")));
        }

        let mut bytes = resp.bytes_stream();
        let out = stream! {
            let mut buf = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        yield Err(Error::Generation(e.to_string()));
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                // One JSON object per line; a chunk may end mid-line.
                while let Some(pos) = buf.find('\n') {
                    let line: String = buf.drain(..=pos).collect();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<StreamChunk>(line) {
                        Ok(c) => {
                            if let Some(err) = c.error {
                                yield Err(Error::Generation(err));
                                return;
                            }
                            if let Some(msg) = c.message {
                                if !msg.content.is_empty() {
                                    trace!(token = %msg.content, "stream token");
                                    yield Ok(msg.content);
                                }
                            }
                            if c.done.unwrap_or(false) {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "skipping malformed stream line");
                        }
                    }
                }
            }
        };
        Ok(Box::pin(out))
    }

    async fn models(&self) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(self.endpoint_tags())
            .send()
            .await
            .map_err(|e| Error::Generation(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Generation(format!("ollama tags HTTP {status}")));
        }
        let parsed: TagsResponse =
            resp.json().await.map_err(|e| Error::Generation(e.to_string()))?;
        Ok(parsed.models.into_iter().map(|m| m.model).collect())
    }
}
