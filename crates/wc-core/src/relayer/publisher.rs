//! Outbound publishes to relay topics

use super::provider::JsonRpcProvider;
use super::PublishOptions;
use crate::error::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Serialize)]
pub struct PublishParams<'a> {
    pub topic: &'a str,
    pub message: &'a str,
    pub ttl: u64,
    pub tag: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub prompt: bool,
}

pub struct Publisher {
    provider: Arc<JsonRpcProvider>,
}

impl Publisher {
    pub fn new(provider: Arc<JsonRpcProvider>) -> Self {
        Self { provider }
    }

    /// Publish an encoded envelope. A live local subscription on the topic
    /// is not required. Relay rejections surface as errors.
    pub async fn publish(&self, topic: &str, message: &str, options: &PublishOptions) -> Result<()> {
        let method = format!("{}_publish", options.relay.protocol);
        let params = PublishParams {
            topic,
            message,
            ttl: options.ttl,
            tag: options.tag,
            prompt: options.prompt,
        };

        let _accepted: bool = self.provider.request(&method, params, None).await?;
        debug!(topic, tag = options.tag, ttl = options.ttl, "published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relayer::loopback::LoopbackRelay;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_prompt_only_sent_when_set() {
        let mut params = PublishParams {
            topic: "t",
            message: "m",
            ttl: 300,
            tag: 1100,
            prompt: false,
        };
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({"topic": "t", "message": "m", "ttl": 300, "tag": 1100})
        );
        params.prompt = true;
        assert_eq!(serde_json::to_value(&params).unwrap()["prompt"], json!(true));
    }

    #[tokio::test]
    async fn test_publish_through_relay() {
        let relay = LoopbackRelay::new();
        let provider = Arc::new(JsonRpcProvider::new(relay.connection(), Duration::from_secs(5)));
        provider.set_url("wss://relay.test");
        let publisher = Publisher::new(provider);

        let options = PublishOptions {
            ttl: 30,
            ..PublishOptions::default()
        };
        publisher.publish("topic", "message", &options).await.unwrap();
        assert_eq!(relay.publish_requests(), 1);
    }
}
