// In-process template service evaluating `{{ name }}` placeholders
use crate::application::template_service::{
    TemplateRequest, TemplateService, TemplateSink, TemplateSubscription,
};
use crate::domain::error::TemplateError;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Evaluates templates against the request variables and re-evaluates them
/// on a fixed interval, pushing only results that changed.
#[derive(Debug, Clone)]
pub struct LocalTemplateService {
    refresh: Duration,
}

impl LocalTemplateService {
    pub fn new(refresh: Duration) -> Self {
        Self {
            refresh: refresh.max(Duration::from_secs(1)),
        }
    }
}

struct LocalSubscription {
    task: JoinHandle<()>,
}

impl Drop for LocalSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl TemplateSubscription for LocalSubscription {
    async fn unsubscribe(self: Box<Self>) -> Result<(), TemplateError> {
        if self.task.is_finished() {
            return Err(TemplateError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl TemplateService for LocalTemplateService {
    async fn subscribe(
        &self,
        request: TemplateRequest,
        sink: TemplateSink,
    ) -> Result<Box<dyn TemplateSubscription>, TemplateError> {
        let first = render(&request.template, &request.variables, Utc::now(), request.strict)?;
        tracing::debug!(
            "Template subscribed for {:?}: {:?}",
            request.entity_id,
            request.template
        );
        sink.push(Ok(first.clone()));

        let refresh = self.refresh;
        let task = tokio::spawn(async move {
            let mut last = first;
            let mut ticker = tokio::time::interval(refresh);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if sink.is_closed() {
                    break;
                }
                match render(&request.template, &request.variables, Utc::now(), request.strict) {
                    Ok(result) if result == last => {}
                    Ok(result) => {
                        last = result.clone();
                        if !sink.push(Ok(result)) {
                            break;
                        }
                    }
                    Err(e) => {
                        if !sink.push(Err(e)) {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Box::new(LocalSubscription { task }))
    }
}

/// Substitute every `{{ name }}` in `template`.
///
/// Names are dotted paths into `variables`; `now` is the current time. In
/// strict mode an unknown name is an evaluation error, otherwise it renders
/// as an empty string.
pub fn render(
    template: &str,
    variables: &Value,
    now: DateTime<Utc>,
    strict: bool,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| TemplateError::Evaluation("unterminated expression".to_string()))?;
        out.push_str(&resolve(after[..close].trim(), variables, now, strict)?);
        rest = &after[close + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

fn resolve(
    name: &str,
    variables: &Value,
    now: DateTime<Utc>,
    strict: bool,
) -> Result<String, TemplateError> {
    if name == "now" {
        return Ok(now.to_rfc3339_opts(SecondsFormat::Secs, true));
    }

    match name.split('.').try_fold(variables, |value, part| value.get(part)) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Null) => Ok(String::new()),
        Some(other) => Ok(other.to_string()),
        None if strict => Err(TemplateError::Evaluation(format!("'{}' is undefined", name))),
        None => Ok(String::new()),
    }
}
