use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use tracing::Instrument;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::{GenerateRequest, GenerateResponse, Provider};
use crate::engine::retry::RetryPolicy;
use crate::telemetry::metrics::{
    GEN_AI_ERROR_COUNT, GEN_AI_FALLBACK_COUNT, GEN_AI_OPERATION_DURATION, GEN_AI_RETRY_COUNT,
    GEN_AI_TOKEN_USAGE,
};

pub struct LlmClient {
    pub primary: Arc<dyn Provider>,
    pub fallback: Option<Arc<dyn Provider>>,
    pub primary_provider: String,
    pub fallback_provider: String,
    pub fallback_model: String,
    pub retry: RetryPolicy,
}

fn server_for(provider: &str) -> (&'static str, i64) {
    match provider {
        "openai" => ("api.openai.com", 443),
        "google" => ("generativelanguage.googleapis.com", 443),
        "ollama" => ("localhost", 11434),
        _ => ("unknown", 443),
    }
}

impl LlmClient {
    pub async fn generate_once(
        &self,
        provider: &dyn Provider,
        provider_name: &str,
        req: &GenerateRequest,
    ) -> anyhow::Result<GenerateResponse> {
        let span_display_name = format!("gen_ai.chat {}", req.model);
        let start = Instant::now();
        let (server_addr, server_port) = server_for(provider_name);

        let span = tracing::info_span!(
            "gen_ai.chat",
            otel.name = %span_display_name,
            gen_ai.operation.name = "chat",
            gen_ai.provider.name = %provider_name,
            gen_ai.request.model = %req.model,
            server.address = %server_addr,
            server.port = server_port,
            gen_ai.request.temperature = req.temperature,
            gen_ai.request.max_tokens = req.max_tokens as i64,
            gen_ai.response.model = tracing::field::Empty,
            gen_ai.usage.input_tokens = tracing::field::Empty,
            gen_ai.usage.output_tokens = tracing::field::Empty,
            gen_ai.response.finish_reasons = tracing::field::Empty,
            report.stage = %req.stage,
            otel.status_code = tracing::field::Empty,
            error.type = tracing::field::Empty,
        );

        {
            let mut user_event_attrs =
                vec![KeyValue::new("gen_ai.prompt", truncate(&req.prompt, 1000))];
            if !req.system.is_empty() {
                user_event_attrs.push(KeyValue::new(
                    "gen_ai.system_instructions",
                    truncate(&req.system, 500),
                ));
            }
            span.add_event("gen_ai.user.message", user_event_attrs);
        }

        let result = provider.generate(req).instrument(span.clone()).await;

        let duration = start.elapsed().as_secs_f64();

        match result {
            Ok(mut resp) => {
                resp.provider = provider_name.to_string();

                span.record("gen_ai.response.model", resp.model.as_str());
                span.record("gen_ai.usage.input_tokens", resp.input_tokens as i64);
                span.record("gen_ai.usage.output_tokens", resp.output_tokens as i64);
                if !resp.finish_reason.is_empty() {
                    span.record(
                        "gen_ai.response.finish_reasons",
                        resp.finish_reason.as_str(),
                    );
                }

                span.add_event(
                    "gen_ai.assistant.message",
                    vec![KeyValue::new(
                        "gen_ai.completion",
                        truncate(&resp.content, 2000),
                    )],
                );

                let op_kv = KeyValue::new("gen_ai.operation.name", "chat");
                let provider_kv = KeyValue::new("gen_ai.provider.name", provider_name.to_string());
                let model_kv = KeyValue::new("gen_ai.request.model", resp.model.clone());

                for (kind, tokens) in [("input", resp.input_tokens), ("output", resp.output_tokens)] {
                    GEN_AI_TOKEN_USAGE.record(
                        f64::from(tokens),
                        &[
                            KeyValue::new("gen_ai.token.type", kind),
                            op_kv.clone(),
                            provider_kv.clone(),
                            model_kv.clone(),
                        ],
                    );
                }
                GEN_AI_OPERATION_DURATION.record(duration, &[op_kv, provider_kv, model_kv]);

                Ok(resp)
            }
            Err(err) => {
                span.record("otel.status_code", "ERROR");
                span.record("error.type", classify_error(&err));

                GEN_AI_ERROR_COUNT.add(
                    1,
                    &[
                        KeyValue::new("gen_ai.provider.name", provider_name.to_string()),
                        KeyValue::new("gen_ai.request.model", req.model.clone()),
                    ],
                );

                Err(err)
            }
        }
    }

    pub async fn generate_with_retry(
        &self,
        provider: &dyn Provider,
        provider_name: &str,
        req: &GenerateRequest,
    ) -> anyhow::Result<GenerateResponse> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_err = None;

        for attempt in 0..max_attempts {
            match self.generate_once(provider, provider_name, req).await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = max_attempts,
                        provider = provider_name,
                        model = %req.model,
                        error = %err,
                        "LLM call failed, retrying"
                    );

                    if attempt > 0 {
                        GEN_AI_RETRY_COUNT.add(
                            1,
                            &[
                                KeyValue::new("gen_ai.provider.name", provider_name.to_string()),
                                KeyValue::new("gen_ai.request.model", req.model.clone()),
                            ],
                        );
                    }

                    last_err = Some(err);

                    if attempt < max_attempts - 1 {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("all retries exhausted")))
    }

    pub async fn generate(&self, req: &GenerateRequest) -> anyhow::Result<GenerateResponse> {
        let result = self
            .generate_with_retry(self.primary.as_ref(), &self.primary_provider, req)
            .await;

        match result {
            Ok(resp) => Ok(resp),
            Err(primary_err) => {
                if let Some(ref fallback) = self.fallback {
                    tracing::warn!(
                        primary_provider = %self.primary_provider,
                        fallback_provider = %self.fallback_provider,
                        error = %primary_err,
                        "Primary provider failed, falling back"
                    );

                    GEN_AI_FALLBACK_COUNT.add(1, &[]);

                    let fallback_req = GenerateRequest {
                        model: self.fallback_model.clone(),
                        ..req.clone()
                    };

                    self.generate_with_retry(
                        fallback.as_ref(),
                        &self.fallback_provider,
                        &fallback_req,
                    )
                    .await
                } else {
                    Err(anyhow::anyhow!(
                        "primary provider {} failed after retries: {}",
                        self.primary_provider,
                        primary_err
                    ))
                }
            }
        }
    }
}

fn classify_error(err: &anyhow::Error) -> &'static str {
    let msg = err.to_string().to_lowercase();
    if msg.contains("rate limit") || msg.contains("429") {
        "rate_limit"
    } else if msg.contains("timeout") || msg.contains("timed out") || msg.contains("deadline") {
        "timeout"
    } else if msg.contains("401")
        || msg.contains("403")
        || msg.contains("auth")
        || msg.contains("api key")
    {
        "auth_error"
    } else if msg.contains("400") || msg.contains("422") || msg.contains("invalid") {
        "invalid_request"
    } else if msg.contains("500")
        || msg.contains("502")
        || msg.contains("503")
        || msg.contains("server")
    {
        "server_error"
    } else if msg.contains("connect")
        || msg.contains("dns")
        || msg.contains("network")
        || msg.contains("reset")
    {
        "network_error"
    } else {
        "unknown_error"
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s.char_indices()
            .take_while(|&(i, c)| i + c.len_utf8() <= max)
            .map(|(_, c)| c)
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays canned answers in order; errors once the script runs out.
    pub(crate) struct ScriptedProvider {
        name: String,
        answers: Mutex<Vec<Result<String, String>>>,
        pub(crate) models: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        pub(crate) fn new(name: &str, answers: Vec<Result<&str, &str>>) -> Arc<Self> {
            let mut answers: Vec<Result<String, String>> = answers
                .into_iter()
                .map(|a| a.map(str::to_string).map_err(str::to_string))
                .collect();
            answers.reverse();
            Arc::new(Self {
                name: name.to_string(),
                answers: Mutex::new(answers),
                models: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl Provider for ScriptedProvider {
        async fn generate(&self, req: &GenerateRequest) -> anyhow::Result<GenerateResponse> {
            self.models.lock().unwrap().push(req.model.clone());
            let next = self.answers.lock().unwrap().pop();
            match next {
                Some(Ok(content)) => Ok(GenerateResponse {
                    content,
                    model: req.model.clone(),
                    input_tokens: 10,
                    output_tokens: 5,
                    finish_reason: "stop".to_string(),
                    provider: String::new(),
                }),
                Some(Err(message)) => Err(anyhow::anyhow!(message)),
                None => Err(anyhow::anyhow!("script exhausted")),
            }
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    pub(crate) fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    pub(crate) fn client(
        primary: Arc<ScriptedProvider>,
        fallback: Option<Arc<ScriptedProvider>>,
    ) -> LlmClient {
        LlmClient {
            primary,
            fallback: fallback.map(|f| f as Arc<dyn Provider>),
            primary_provider: "openai".to_string(),
            fallback_provider: "google".to_string(),
            fallback_model: "gemini-2.5-flash".to_string(),
            retry: fast_retry(),
        }
    }

    pub(crate) fn request() -> GenerateRequest {
        GenerateRequest {
            model: "gpt-4.1-mini".to_string(),
            system: "system".to_string(),
            prompt: "prompt".to_string(),
            temperature: 0.2,
            max_tokens: 512,
            stage: "test".to_string(),
            json: false,
        }
    }

    #[test]
    fn test_classify_error_categories() {
        let cases = vec![
            ("rate limit exceeded", "rate_limit"),
            ("status 429: too many requests", "rate_limit"),
            ("context deadline exceeded: timeout", "timeout"),
            ("request timed out", "timeout"),
            ("401 unauthorized", "auth_error"),
            ("403 forbidden", "auth_error"),
            ("authentication failed", "auth_error"),
            ("invalid api key", "auth_error"),
            ("400 bad request", "invalid_request"),
            ("422 unprocessable entity", "invalid_request"),
            ("invalid model name", "invalid_request"),
            ("500 internal server error", "server_error"),
            ("502 bad gateway", "server_error"),
            ("503 service unavailable", "server_error"),
            ("connection refused", "network_error"),
            ("dns resolution failed", "network_error"),
            ("connection reset by peer", "network_error"),
            ("something unexpected", "unknown_error"),
        ];

        for (msg, expected) in cases {
            let err = anyhow::anyhow!("{}", msg);
            assert_eq!(
                classify_error(&err),
                expected,
                "classify_error({msg:?}) should be {expected:?}"
            );
        }
    }

    #[test]
    fn test_truncate_short() {
        assert_eq!(truncate("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_long() {
        assert_eq!(truncate("hello world", 5), "hello");
    }

    #[test]
    fn test_truncate_multibyte_safe() {
        let result = truncate("서울숲 공원", 4);
        assert!(result.len() <= 4);
        assert_eq!(result, "서");
        assert_eq!(truncate("서울숲 공원", 7), "서울");
        assert_eq!(truncate("서울숲 공원", 2), "");
    }

    #[test]
    fn test_server_for_known_providers() {
        assert_eq!(server_for("ollama"), ("localhost", 11434));
        assert_eq!(server_for("mystery").0, "unknown");
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let primary = ScriptedProvider::new("openai", vec![Err("503 service unavailable"), Ok("done")]);
        let llm = client(primary.clone(), None);
        let resp = llm.generate(&request()).await.unwrap();
        assert_eq!(resp.content, "done");
        assert_eq!(resp.provider, "openai");
        assert_eq!(primary.models.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fallback_uses_fallback_model() {
        let primary = ScriptedProvider::new("openai", vec![]);
        let fallback = ScriptedProvider::new("google", vec![Ok("from fallback")]);
        let llm = client(primary.clone(), Some(fallback.clone()));

        let resp = llm.generate(&request()).await.unwrap();
        assert_eq!(resp.content, "from fallback");
        assert_eq!(resp.provider, "google");
        assert_eq!(primary.models.lock().unwrap().len(), 3);
        assert_eq!(*fallback.models.lock().unwrap(), vec!["gemini-2.5-flash".to_string()]);
    }

    #[tokio::test]
    async fn test_no_fallback_reports_primary_failure() {
        let llm = client(ScriptedProvider::new("openai", vec![]), None);
        let err = llm.generate(&request()).await.unwrap_err();
        assert!(err.to_string().contains("primary provider openai failed"));
    }
}
