//! Echo provider — the keyless fallback.
//!
//! Returns a deterministic reflection of the last user message. Used when no
//! API key is configured so the whole pipeline (buffers, archive, retrieval,
//! streaming) stays exercisable offline, and in tests that need a real
//! `Provider` without network access.

use async_trait::async_trait;
use canopy_core::error::ProviderError;
use canopy_core::message::Role;
use canopy_core::provider::*;

pub struct EchoProvider;

impl EchoProvider {
    pub fn new() -> Self {
        Self
    }

    fn reply_for(request: &ProviderRequest) -> String {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        format!("Echo: {last_user}")
    }
}

impl Default for EchoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let content = Self::reply_for(&request);
        let completion_tokens = (content.len() / 4) as u32;
        let prompt_tokens: u32 = request
            .messages
            .iter()
            .map(|m| (m.content.len() / 4) as u32)
            .sum();

        Ok(ProviderResponse {
            content,
            usage: Some(Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }),
            model: "echo".into(),
        })
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>,
        ProviderError,
    > {
        let response = self.complete(request).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            // Word-by-word deltas so streaming consumers see multiple frames.
            for word in response.content.split_inclusive(' ') {
                if tx
                    .send(Ok(StreamChunk {
                        content: Some(word.to_string()),
                        done: false,
                        usage: None,
                    }))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let _ = tx
                .send(Ok(StreamChunk {
                    content: None,
                    done: true,
                    usage: response.usage,
                }))
                .await;
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::message::ChatMessage;

    #[tokio::test]
    async fn echoes_last_user_message() {
        let provider = EchoProvider::new();
        let response = provider
            .complete(ProviderRequest::new(
                "echo",
                vec![
                    ChatMessage::user("first"),
                    ChatMessage::assistant("reply"),
                    ChatMessage::user("second"),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(response.content, "Echo: second");
        assert!(response.usage.is_some());
    }

    #[tokio::test]
    async fn streaming_reassembles_to_complete_text() {
        let provider = EchoProvider::new();
        let mut rx = provider
            .stream(ProviderRequest::new(
                "echo",
                vec![ChatMessage::user("hello there world")],
            ))
            .await
            .unwrap();

        let mut text = String::new();
        let mut saw_done = false;
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk.unwrap();
            if let Some(delta) = chunk.content {
                text.push_str(&delta);
            }
            if chunk.done {
                saw_done = true;
            }
        }
        assert_eq!(text, "Echo: hello there world");
        assert!(saw_done);
    }
}
