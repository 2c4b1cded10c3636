use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_SEARCH_URL: &str = "https://html.duckduckgo.com/html/";
pub const DEFAULT_SEARCH_RESULTS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

/// Limits on the respond/call-tools loop. `None` everywhere means unbounded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LoopPolicy {
    pub max_steps: Option<u32>,
    pub max_history_messages: Option<usize>,
    pub model_timeout_secs: Option<u64>,
    pub tool_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SearchSettings {
    pub endpoint: Option<String>,
    pub max_results: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GlobalConfigDefaults {
    pub default_model: Option<String>,
    pub system_prompt: Option<String>,
    pub model_params: Option<ModelParams>,
    pub loop_policy: Option<LoopPolicy>,
    pub search: Option<SearchSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RequestOverrides {
    pub model: Option<String>,
    pub model_params: Option<ModelParams>,
    pub loop_policy: Option<LoopPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectiveSettings {
    pub model: String,
    pub system_prompt: Option<String>,
    pub model_params: ModelParams,
    pub loop_policy: LoopPolicy,
    pub search_endpoint: String,
    pub search_max_results: usize,
}

impl GlobalConfigDefaults {
    pub fn from_env() -> Self {
        let var = |k: &str| std::env::var(k).ok().filter(|v| !v.trim().is_empty());
        let loop_policy = LoopPolicy {
            max_steps: var("THREADCHAT_MAX_STEPS").and_then(|v| v.parse().ok()),
            max_history_messages: var("THREADCHAT_MAX_HISTORY").and_then(|v| parse_history_limit(&v).ok()),
            model_timeout_secs: var("THREADCHAT_MODEL_TIMEOUT").and_then(|v| v.parse().ok()),
            tool_timeout_secs: var("THREADCHAT_TOOL_TIMEOUT").and_then(|v| v.parse().ok()),
        };
        Self {
            default_model: var("THREADCHAT_MODEL"),
            system_prompt: var("THREADCHAT_SYSTEM_PROMPT"),
            model_params: None,
            loop_policy: Some(loop_policy),
            search: Some(SearchSettings { endpoint: var("THREADCHAT_SEARCH_URL"), max_results: None }),
        }
    }
}

/// A history window must keep at least one message.
pub fn parse_history_limit(s: &str) -> Result<usize, String> {
    match s.trim().parse::<usize>() {
        Ok(0) => Err("history limit must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

pub fn resolve_effective_settings(global: &GlobalConfigDefaults, request: &RequestOverrides) -> EffectiveSettings {
    let model = request
        .model
        .clone()
        .or_else(|| global.default_model.clone())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());

    let model_params = ModelParams {
        temperature: request
            .model_params
            .as_ref()
            .and_then(|p| p.temperature)
            .or_else(|| global.model_params.as_ref().and_then(|p| p.temperature)),
        max_tokens: request
            .model_params
            .as_ref()
            .and_then(|p| p.max_tokens)
            .or_else(|| global.model_params.as_ref().and_then(|p| p.max_tokens)),
        top_p: request
            .model_params
            .as_ref()
            .and_then(|p| p.top_p)
            .or_else(|| global.model_params.as_ref().and_then(|p| p.top_p)),
    };

    let loop_policy = LoopPolicy {
        max_steps: request
            .loop_policy
            .as_ref()
            .and_then(|p| p.max_steps)
            .or_else(|| global.loop_policy.as_ref().and_then(|p| p.max_steps)),
        max_history_messages: request
            .loop_policy
            .as_ref()
            .and_then(|p| p.max_history_messages)
            .or_else(|| global.loop_policy.as_ref().and_then(|p| p.max_history_messages)),
        model_timeout_secs: request
            .loop_policy
            .as_ref()
            .and_then(|p| p.model_timeout_secs)
            .or_else(|| global.loop_policy.as_ref().and_then(|p| p.model_timeout_secs)),
        tool_timeout_secs: request
            .loop_policy
            .as_ref()
            .and_then(|p| p.tool_timeout_secs)
            .or_else(|| global.loop_policy.as_ref().and_then(|p| p.tool_timeout_secs)),
    };

    let search = global.search.clone().unwrap_or_default();

    EffectiveSettings {
        model,
        system_prompt: global.system_prompt.clone(),
        model_params,
        loop_policy,
        search_endpoint: search.endpoint.unwrap_or_else(|| DEFAULT_SEARCH_URL.to_string()),
        search_max_results: search.max_results.unwrap_or(DEFAULT_SEARCH_RESULTS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_request_over_global_over_builtin() {
        let global = GlobalConfigDefaults {
            default_model: Some("global-model".into()),
            system_prompt: Some("be brief".into()),
            model_params: Some(ModelParams { temperature: Some(0.1), max_tokens: Some(1000), top_p: Some(0.9) }),
            loop_policy: Some(LoopPolicy { max_steps: Some(8), max_history_messages: Some(40), ..Default::default() }),
            search: None,
        };

        let request = RequestOverrides {
            model: Some("request-model".into()),
            model_params: Some(ModelParams { temperature: None, max_tokens: Some(2048), top_p: None }),
            loop_policy: Some(LoopPolicy { max_steps: Some(2), ..Default::default() }),
        };

        let eff = resolve_effective_settings(&global, &request);

        assert_eq!(eff.model, "request-model");
        assert_eq!(eff.system_prompt.as_deref(), Some("be brief"));
        assert_eq!(eff.model_params.temperature, Some(0.1)); // from global
        assert_eq!(eff.model_params.max_tokens, Some(2048)); // from request
        assert_eq!(eff.loop_policy.max_steps, Some(2)); // from request
        assert_eq!(eff.loop_policy.max_history_messages, Some(40)); // from global
        assert_eq!(eff.loop_policy.tool_timeout_secs, None);
        assert_eq!(eff.search_endpoint, DEFAULT_SEARCH_URL);
        assert_eq!(eff.search_max_results, DEFAULT_SEARCH_RESULTS);
    }

    #[test]
    fn empty_layers_fall_back_to_unbounded_defaults() {
        let eff = resolve_effective_settings(&GlobalConfigDefaults::default(), &RequestOverrides::default());
        assert_eq!(eff.model, DEFAULT_MODEL);
        assert_eq!(eff.loop_policy, LoopPolicy::default());
        assert_eq!(eff.model_params, ModelParams::default());
    }

    #[test]
    fn zero_history_limit_is_rejected() {
        assert_eq!(parse_history_limit("12"), Ok(12));
        assert_eq!(parse_history_limit(" 1 "), Ok(1));
        assert!(parse_history_limit("0").is_err());
        assert!(parse_history_limit("-3").is_err());
        assert!(parse_history_limit("lots").is_err());
    }
}
