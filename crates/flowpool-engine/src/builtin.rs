//! Handlers shipped with the `flowpool` binary.
//!
//! - `echo` returns its request unchanged. Used for smoke tests.
//! - `caps` finds abbreviation candidates (all-caps tokens) in a text.
//! - `delay` sleeps for the requested time, then echoes. Async.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::handler::{AsyncHandler, Handler, HandlerError, HandlerRegistry, WorkerContext};

pub fn register(registry: &mut HandlerRegistry) {
    registry
        .register_sync("echo", Echo)
        .register_sync("caps", Caps)
        .register_async("delay", Delay);
}

/// Echoes the request. A request with `"fail": true` is answered with an
/// internal error and one with `"panic": true` panics the handler.
#[derive(Debug, Clone, Copy)]
pub struct Echo;

impl Handler for Echo {
    type Request = Value;
    type Response = Value;
    type Resources = ();

    fn init_resources(&self, _context: &WorkerContext) -> anyhow::Result<()> {
        Ok(())
    }

    #[allow(clippy::panic)]
    fn handle(&self, _resources: &(), request: Value) -> Result<Value, HandlerError> {
        let flag = |name: &str| request.get(name).and_then(Value::as_bool).unwrap_or(false);
        if flag("panic") {
            panic!("echo asked to panic");
        }
        if flag("fail") {
            return Err(anyhow::anyhow!("echo asked to fail").into());
        }
        Ok(request)
    }
}

/// Scripts `caps` knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Script {
    /// Any uppercase letter.
    #[default]
    Any,
    /// ASCII letters only.
    En,
    /// Cyrillic letters only.
    Ru,
}

impl Script {
    fn accepts(self, c: char) -> bool {
        match self {
            Self::Any => true,
            Self::En => c.is_ascii_alphabetic(),
            Self::Ru => matches!(c, '\u{0400}'..='\u{04FF}'),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapsRequest {
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsResponse {
    pub candidates: Vec<String>,
}

/// Per-worker `caps` settings, read from the resource's handler settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CapsSettings {
    pub min_len: usize,
    pub max_len: usize,
}

impl Default for CapsSettings {
    fn default() -> Self {
        Self {
            min_len: 2,
            max_len: 12,
        }
    }
}

/// Abbreviation candidate detector.
#[derive(Debug, Clone, Copy)]
pub struct Caps;

impl Caps {
    fn detect(settings: &CapsSettings, text: &str, script: Script) -> Vec<String> {
        let mut candidates: Vec<String> = Vec::new();
        for token in text.split(|c: char| !c.is_alphanumeric()) {
            let len = token.chars().count();
            if len < settings.min_len || len > settings.max_len {
                continue;
            }
            let mut letters = token.chars().filter(|c| c.is_alphabetic()).peekable();
            if letters.peek().is_none() {
                continue;
            }
            if letters.all(|c| c.is_uppercase() && script.accepts(c))
                && !candidates.iter().any(|seen| seen == token)
            {
                candidates.push(token.to_string());
            }
        }
        candidates
    }
}

impl Handler for Caps {
    type Request = CapsRequest;
    type Response = CapsResponse;
    type Resources = CapsSettings;

    fn init_resources(&self, context: &WorkerContext) -> anyhow::Result<CapsSettings> {
        if context.settings.is_null() {
            return Ok(CapsSettings::default());
        }
        let settings: CapsSettings = serde_json::from_value(context.settings.clone())?;
        anyhow::ensure!(
            settings.min_len >= 1 && settings.min_len <= settings.max_len,
            "caps: invalid length bounds {}..={}",
            settings.min_len,
            settings.max_len
        );
        Ok(settings)
    }

    fn handle(
        &self,
        settings: &CapsSettings,
        request: CapsRequest,
    ) -> Result<CapsResponse, HandlerError> {
        let script = match request.language.as_deref() {
            None => Script::Any,
            Some(language) => serde_json::from_value(Value::String(language.to_lowercase()))
                .map_err(|_| HandlerError::InvalidRequest(format!("unsupported language '{language}'")))?,
        };
        Ok(CapsResponse {
            candidates: Self::detect(settings, &request.text, script),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DelayRequest {
    pub ms: u64,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

/// Sleeps `ms` milliseconds, then echoes the request.
#[derive(Debug, Clone, Copy)]
pub struct Delay;

impl AsyncHandler for Delay {
    type Request = DelayRequest;
    type Response = Value;
    type Resources = ();

    fn init_resources(&self, _context: &WorkerContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle(&self, _resources: Arc<()>, request: DelayRequest) -> Result<Value, HandlerError> {
        tokio::time::sleep(Duration::from_millis(request.ms)).await;
        let mut echoed = request.rest;
        echoed.insert("ms".to_string(), Value::from(request.ms));
        Ok(Value::Object(echoed))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(settings: Value) -> WorkerContext {
        WorkerContext {
            resource: "r".into(),
            handler: "caps".into(),
            worker_index: 0,
            async_task_limit: 1,
            settings,
        }
    }

    fn caps(text: &str, language: Option<&str>) -> Result<Vec<String>, HandlerError> {
        let settings = Caps.init_resources(&context(Value::Null)).unwrap();
        Caps.handle(
            &settings,
            CapsRequest {
                text: text.to_string(),
                language: language.map(str::to_string),
            },
        )
        .map(|r| r.candidates)
    }

    #[test]
    fn caps_finds_unique_uppercase_tokens() {
        let found = caps("The NASA and ESA teams met the NASA board. A B2B deal, I think.", None).unwrap();
        assert_eq!(found, vec!["NASA", "ESA", "B2B"]);
    }

    #[test]
    fn caps_respects_script() {
        let text = "Отчёт МВД и FBI";
        assert_eq!(caps(text, Some("ru")).unwrap(), vec!["МВД"]);
        assert_eq!(caps(text, Some("EN")).unwrap(), vec!["FBI"]);
        assert!(matches!(
            caps(text, Some("fr")),
            Err(HandlerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn caps_settings_bound_token_length() {
        let settings = Caps
            .init_resources(&context(json!({"min_len": 3, "max_len": 4})))
            .unwrap();
        let found = Caps
            .handle(
                &settings,
                CapsRequest {
                    text: "UN NATO UNESCO".into(),
                    language: None,
                },
            )
            .unwrap();
        assert_eq!(found.candidates, vec!["NATO"]);

        assert!(
            Caps.init_resources(&context(json!({"min_len": 5, "max_len": 2})))
                .is_err()
        );
    }

    #[test]
    fn echo_flags() {
        assert_eq!(Echo.handle(&(), json!({"text": "hi"})).unwrap(), json!({"text": "hi"}));
        let err = Echo.handle(&(), json!({"fail": true})).unwrap_err();
        assert!(matches!(err, HandlerError::Internal(_)));
    }

    #[tokio::test]
    async fn delay_echoes_after_sleeping() {
        let request: DelayRequest = serde_json::from_value(json!({"ms": 5, "tag": "t"})).unwrap();
        let out = Delay.handle(Arc::new(()), request).await.unwrap();
        assert_eq!(out, json!({"ms": 5, "tag": "t"}));
    }
}
