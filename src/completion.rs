use crate::config::Config;
use anyhow::Result;
use async_trait::async_trait;
use rig::{client::CompletionClient, completion::Prompt, providers::openai};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("Completion request failed: {0}")]
    Provider(String),
    #[error("Model returned an empty reply")]
    EmptyReply,
}

/// Sampling parameters sent with every request.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    pub stop: Vec<String>,
}

impl GenerationParams {
    pub fn for_model(model: &str) -> Self {
        Self {
            model: model.to_string(),
            temperature: 0.9,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.6,
            stop: vec![" Human:".to_string(), " AI:".to_string()],
        }
    }

    fn additional_params(&self) -> serde_json::Value {
        serde_json::json!({
            "top_p": self.top_p,
            "frequency_penalty": self.frequency_penalty,
            "presence_penalty": self.presence_penalty,
            "stop": self.stop,
        })
    }
}

#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u64) -> Result<String, CompletionError>;
}

pub struct RigCompletion<C: CompletionClient> {
    client: C,
    params: GenerationParams,
}

impl<C: CompletionClient> RigCompletion<C> {
    pub fn new(client: C, params: GenerationParams) -> Self {
        Self { client, params }
    }
}

#[async_trait]
impl<C> Completion for RigCompletion<C>
where
    C: CompletionClient + Send + Sync,
    C::CompletionModel: 'static,
{
    async fn complete(&self, prompt: &str, max_tokens: u64) -> Result<String, CompletionError> {
        let agent = self
            .client
            .agent(&self.params.model)
            .max_tokens(max_tokens)
            .temperature(self.params.temperature)
            .additional_params(self.params.additional_params())
            .build();

        let reply = agent
            .prompt(prompt)
            .await
            .map_err(|e| CompletionError::Provider(e.to_string()))?;

        if reply.trim().is_empty() {
            return Err(CompletionError::EmptyReply);
        }
        Ok(reply.to_string())
    }
}

pub fn create_completion(config: &Config) -> Result<RigCompletion<openai::CompletionsClient>> {
    let client: openai::CompletionsClient = openai::CompletionsClient::builder()
        .api_key(&config.api_key)
        .base_url(&config.api_url)
        .build()?;

    Ok(RigCompletion::new(
        client,
        GenerationParams::for_model(&config.model),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn additional_params_carry_penalties_and_stop_sequences() {
        let params = GenerationParams::for_model("test-model");
        let extra = params.additional_params();

        assert_eq!(extra["top_p"], 1.0);
        assert_eq!(extra["frequency_penalty"], 0.0);
        assert_eq!(extra["presence_penalty"], 0.6);
        assert_eq!(extra["stop"], serde_json::json!([" Human:", " AI:"]));
        assert_eq!(params.temperature, 0.9);
    }
}
