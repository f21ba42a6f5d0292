use std::time::Duration;

use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::InferenceError;

/// Client for an OpenAI-compatible `/v1/chat/completions` endpoint serving a vision model.
#[derive(Debug, Clone)]
pub struct VllmClient {
    base_url: String,
    model: String,
    prompt: String,
    http: Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    ImageUrl { image_url: ImageUrl<'a> },
    Text { text: &'a str },
}

#[derive(Debug, Serialize)]
struct ImageUrl<'a> {
    url: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The model's answer for one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inference {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

pub type InferenceResult = Result<Inference, InferenceError>;

impl VllmClient {
    pub fn new(
        base_url: &str,
        model: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let http = Client::builder().timeout(timeout).build()?;

        Ok(VllmClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            prompt: prompt.to_string(),
            http,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    /// Asks the model about the image at `image_url`.
    ///
    /// `custom_prompt` replaces the configured prompt when it is non-empty. The call is a
    /// single attempt bounded by the client timeout.
    pub async fn infer_image(&self, image_url: &str, custom_prompt: Option<&str>) -> InferenceResult {
        let prompt = custom_prompt
            .filter(|prompt| !prompt.is_empty())
            .unwrap_or(self.prompt.as_str());

        // Image first, then the instruction.
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: image_url },
                    },
                    ContentPart::Text { text: prompt },
                ],
            }],
        };

        debug!(image_url, "sending chat completion request to {}", self.endpoint());

        let response = self
            .http
            .post(self.endpoint())
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status != StatusCode::OK {
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let chat: ChatResponse = serde_json::from_str(&body)
            .map_err(|source| InferenceError::Decode { source, body })?;

        let choice = chat.choices.into_iter().next().ok_or(InferenceError::NoChoices)?;

        Ok(Inference {
            content: choice.message.content.unwrap_or_default(),
            usage: chat.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        matchers::{body_json, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    const IMAGE_URL: &str = "http://files.test:8080/files/1_cat.png";

    fn client_for(server: &MockServer, model: &str) -> VllmClient {
        VllmClient::new(
            &server.uri(),
            model,
            "describe the image",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn completion(content: &str) -> serde_json::Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "vision",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8 }
        })
    }

    #[tokio::test]
    async fn sends_image_before_text_and_parses_the_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({
                "model": "vision",
                "messages": [{
                    "role": "user",
                    "content": [
                        { "type": "image_url", "image_url": { "url": IMAGE_URL } },
                        { "type": "text", "text": "describe the image" }
                    ]
                }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("cat")))
            .expect(1)
            .mount(&server)
            .await;

        let inference = client_for(&server, "vision")
            .infer_image(IMAGE_URL, None)
            .await
            .unwrap();

        assert_eq!(inference.content, "cat");
        assert_eq!(
            inference.usage,
            Some(Usage {
                prompt_tokens: 5,
                completion_tokens: 3,
                total_tokens: 8
            })
        );
    }

    #[tokio::test]
    async fn custom_prompt_overrides_default_and_empty_model_is_omitted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_json(json!({
                "messages": [{
                    "role": "user",
                    "content": [
                        { "type": "image_url", "image_url": { "url": IMAGE_URL } },
                        { "type": "text", "text": "count the cats" }
                    ]
                }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("two")))
            .expect(1)
            .mount(&server)
            .await;

        let inference = client_for(&server, "")
            .infer_image(IMAGE_URL, Some("count the cats"))
            .await
            .unwrap();

        assert_eq!(inference.content, "two");
    }

    #[tokio::test]
    async fn empty_custom_prompt_falls_back_to_default() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!({
                "model": "vision",
                "messages": [{
                    "role": "user",
                    "content": [
                        { "type": "image_url", "image_url": { "url": IMAGE_URL } },
                        { "type": "text", "text": "describe the image" }
                    ]
                }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("ok")))
            .expect(1)
            .mount(&server)
            .await;

        let result = client_for(&server, "vision")
            .infer_image(IMAGE_URL, Some(""))
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn missing_usage_is_tolerated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "a dog" } }]
            })))
            .mount(&server)
            .await;

        let inference = client_for(&server, "vision")
            .infer_image(IMAGE_URL, None)
            .await
            .unwrap();

        assert_eq!(inference.content, "a dog");
        assert_eq!(inference.usage, None);
    }

    #[tokio::test]
    async fn non_200_status_is_an_error_with_the_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("model is loading"))
            .mount(&server)
            .await;

        let err = client_for(&server, "vision")
            .infer_image(IMAGE_URL, None)
            .await
            .unwrap_err();

        match err {
            InferenceError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "model is loading");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_json_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
            .mount(&server)
            .await;

        let err = client_for(&server, "vision")
            .infer_image(IMAGE_URL, None)
            .await
            .unwrap_err();

        assert!(matches!(err, InferenceError::Decode { ref body, .. } if body.contains("gateway")));
    }

    #[tokio::test]
    async fn empty_choices_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;

        let err = client_for(&server, "vision")
            .infer_image(IMAGE_URL, None)
            .await
            .unwrap_err();

        assert!(matches!(err, InferenceError::NoChoices));
    }

    #[tokio::test]
    async fn unreachable_service_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = VllmClient::new(
            &format!("http://{addr}"),
            "vision",
            "describe the image",
            Duration::from_secs(2),
        )
        .unwrap();

        let err = client.infer_image(IMAGE_URL, None).await.unwrap_err();
        assert!(matches!(err, InferenceError::Transport(_)));
    }

    #[test]
    fn trailing_slash_in_base_url_is_normalised() {
        let client = VllmClient::new(
            "http://localhost:8001/",
            "",
            "p",
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(client.endpoint(), "http://localhost:8001/v1/chat/completions");
    }
}
