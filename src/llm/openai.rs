use async_openai::{
    Client,
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
        ChatCompletionRequestUserMessageContent, CreateChatCompletionRequest, FinishReason,
        ResponseFormat,
    },
};

use super::{GenerateRequest, GenerateResponse, Provider};
use crate::config::Config;

const GOOGLE_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

/// Chat endpoints that speak the OpenAI wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    OpenAi,
    Google,
    Ollama,
}

impl Endpoint {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "openai" => Some(Endpoint::OpenAi),
            "google" | "gemini" => Some(Endpoint::Google),
            "ollama" => Some(Endpoint::Ollama),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Endpoint::OpenAi => "openai",
            Endpoint::Google => "google",
            Endpoint::Ollama => "ollama",
        }
    }

    fn client_config(self, config: &Config) -> OpenAIConfig {
        let key = |key: &Option<String>| key.clone().unwrap_or_default();
        match self {
            Endpoint::OpenAi => OpenAIConfig::new().with_api_key(key(&config.openai_api_key)),
            Endpoint::Google => OpenAIConfig::new()
                .with_api_key(key(&config.google_api_key))
                .with_api_base(GOOGLE_API_BASE),
            Endpoint::Ollama => OpenAIConfig::new().with_api_key("ollama").with_api_base(format!(
                "{}/v1",
                config.ollama_base_url.trim_end_matches('/')
            )),
        }
    }
}

pub struct OpenAIProvider {
    client: Client<OpenAIConfig>,
    endpoint: Endpoint,
}

impl OpenAIProvider {
    /// Provider for a configured provider name; `None` when no endpoint
    /// serves that name.
    pub fn from_config(name: &str, config: &Config) -> Option<Self> {
        let endpoint = Endpoint::parse(name)?;
        Some(Self {
            client: Client::with_config(endpoint.client_config(config)),
            endpoint,
        })
    }
}

fn chat_request(req: &GenerateRequest) -> CreateChatCompletionRequest {
    let messages = vec![
        ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
            content: ChatCompletionRequestSystemMessageContent::Text(req.system.clone()),
            name: None,
        }),
        ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
            content: ChatCompletionRequestUserMessageContent::Text(req.prompt.clone()),
            name: None,
        }),
    ];

    #[allow(deprecated)]
    CreateChatCompletionRequest {
        model: req.model.clone(),
        messages,
        temperature: Some(req.temperature),
        max_completion_tokens: Some(req.max_tokens),
        response_format: req.json.then_some(ResponseFormat::JsonObject),
        ..Default::default()
    }
}

/// A JSON answer cut off at the token limit or left empty is a failed call.
fn check_answer(
    req: &GenerateRequest,
    content: &str,
    finish: Option<FinishReason>,
) -> anyhow::Result<()> {
    if !req.json {
        return Ok(());
    }
    if finish == Some(FinishReason::Length) {
        anyhow::bail!(
            "{} answer truncated at {} tokens",
            req.stage,
            req.max_tokens
        );
    }
    if content.trim().is_empty() {
        anyhow::bail!("{} answer is empty", req.stage);
    }
    Ok(())
}

#[async_trait::async_trait]
impl Provider for OpenAIProvider {
    async fn generate(&self, req: &GenerateRequest) -> anyhow::Result<GenerateResponse> {
        let response = self.client.chat().create(chat_request(req)).await?;

        let choice = response.choices.first();
        let content = choice
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        let finish = choice.and_then(|c| c.finish_reason);
        check_answer(req, &content, finish)?;

        let (input_tokens, output_tokens) = response
            .usage
            .as_ref()
            .map_or((0, 0), |usage| (usage.prompt_tokens, usage.completion_tokens));

        Ok(GenerateResponse {
            content,
            model: response.model,
            input_tokens,
            output_tokens,
            finish_reason: finish
                .map(|r| format!("{r:?}").to_lowercase())
                .unwrap_or_default(),
            provider: String::new(),
        })
    }

    fn name(&self) -> &str {
        self.endpoint.name()
    }
}
