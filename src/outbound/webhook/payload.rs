use case_events::Event;
use reqwest::Url;
use reqwest::header::{HeaderName, HeaderValue};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use super::hmac_signer::{HmacSigner, format_signature_header};
use super::schemas::{RenderedRequest, WebhookPayload};
use super::subscription::Subscription;
use super::template::TemplateError;

pub const CONTENT_TYPE: &str = "Content-Type";
pub const USER_AGENT: &str = "User-Agent";
pub const EVENT_TYPE_HEADER: &str = "X-Event-Type";
pub const DELIVERY_ID_HEADER: &str = "X-Delivery-Id";
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Headers that neither custom headers nor templates may set.
const RESERVED_HEADERS: [&str; 3] = [EVENT_TYPE_HEADER, DELIVERY_ID_HEADER, SIGNATURE_HEADER];

const DELIVERY_NAMESPACE: Uuid = Uuid::from_u128(0x6c1e_4a8e_2d5b_5f0a_9c3e_7b21_d4f6_a809);

/// Stable delivery id for an (event, subscription) pair.
pub fn delivery_id_for(event_id: Uuid, subscription_id: Uuid) -> Uuid {
    let mut name = [0u8; 32];
    name[..16].copy_from_slice(event_id.as_bytes());
    name[16..].copy_from_slice(subscription_id.as_bytes());
    Uuid::new_v5(&DELIVERY_NAMESPACE, &name)
}

/// Builds the outbound request for a (subscription, event) pair.
///
/// The output depends only on its inputs: the body is serialized exactly
/// once and those same bytes are signed and sent.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    user_agent: String,
}

impl PayloadBuilder {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }

    pub fn build(
        &self,
        subscription: &Subscription,
        event: &Event,
    ) -> Result<RenderedRequest, TemplateError> {
        let delivery_id = delivery_id_for(event.id, subscription.id);

        let mut headers = BTreeMap::new();
        set_header(&mut headers, CONTENT_TYPE, "application/json");
        set_header(&mut headers, USER_AGENT, &self.user_agent);
        for (name, value) in &subscription.custom_headers {
            if !is_reserved(name) {
                set_header(&mut headers, name, value);
            }
        }

        let (url, method, body) = match &subscription.template {
            Some(template) => {
                let namespace = template_namespace(subscription, event, delivery_id, &template.config);
                let rendered = template.render(&namespace)?;
                for (name, value) in &rendered.headers {
                    if !is_reserved(name) {
                        set_header(&mut headers, name, value);
                    }
                }

                let url = rendered.url.unwrap_or_else(|| subscription.url.clone());
                check_url(&url)?;
                let method = template
                    .method
                    .clone()
                    .unwrap_or_else(|| subscription.method.clone());
                (url, method, rendered.body)
            }
            None => {
                let body = WebhookPayload::new(subscription, event)
                    .to_json()
                    .map_err(|e| TemplateError::InvalidOutput {
                        field: "body".to_string(),
                        reason: e.to_string(),
                    })?;
                (subscription.url.clone(), subscription.method.clone(), body)
            }
        };

        set_header(&mut headers, EVENT_TYPE_HEADER, event.kind());
        set_header(&mut headers, DELIVERY_ID_HEADER, &delivery_id.to_string());
        if let Some(secret) = subscription.secret.as_deref().filter(|s| !s.is_empty()) {
            let signature = HmacSigner::new(secret).sign(body.as_bytes());
            set_header(
                &mut headers,
                SIGNATURE_HEADER,
                &format_signature_header(&signature),
            );
        }

        for (name, value) in &headers {
            check_header(name, value)?;
        }

        Ok(RenderedRequest {
            url,
            method: method.to_ascii_uppercase(),
            headers,
            body,
        })
    }
}

fn is_reserved(name: &str) -> bool {
    RESERVED_HEADERS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

fn check_url(url: &str) -> Result<(), TemplateError> {
    let invalid = |reason: String| TemplateError::InvalidOutput {
        field: "url".to_string(),
        reason,
    };
    let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("unsupported scheme '{other}'"))),
    }
}

/// A header the HTTP client would refuse fails the build, not the attempt.
fn check_header(name: &str, value: &str) -> Result<(), TemplateError> {
    let invalid = |reason: &str| TemplateError::InvalidOutput {
        field: format!("header '{name}'"),
        reason: reason.to_string(),
    };
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid("invalid header name"))?;
    HeaderValue::from_str(value).map_err(|_| invalid("invalid header value"))?;
    Ok(())
}

/// Insert a header, replacing any existing one regardless of case.
fn set_header(headers: &mut BTreeMap<String, String>, name: &str, value: &str) {
    headers.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
    headers.insert(name.to_string(), value.to_string());
}

/// Variables visible to templates.
fn template_namespace(
    subscription: &Subscription,
    event: &Event,
    delivery_id: Uuid,
    config: &serde_json::Map<String, Value>,
) -> Value {
    let timestamp = event
        .timestamp
        .format(&Rfc3339)
        .unwrap_or_else(|_| event.timestamp.unix_timestamp().to_string());

    json!({
        "event": event.payload,
        "event_type": event.kind(),
        "event_id": event.id,
        "timestamp": timestamp,
        "webhook": {"id": subscription.id, "name": subscription.name},
        "delivery_id": delivery_id,
        "related": event.related,
        "config": config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::webhook::hmac_signer::verify_signature;
    use crate::outbound::webhook::template::WebhookTemplate;
    use case_events::EventType;
    use time::macros::datetime;

    fn subscription() -> Subscription {
        Subscription::new(1, "soc", "https://hooks.example.com/in")
            .subscribe_to([EventType::CASE_CREATED])
    }

    fn event() -> Event {
        Event::new(
            EventType::CASE_CREATED,
            json!({"case": {"id": 42, "title": "Phishing", "tags": ["critical"]}}),
        )
        .at(datetime!(2024-03-01 12:00:00 UTC))
        .with_case(42)
    }

    fn builder() -> PayloadBuilder {
        PayloadBuilder::new("CHawk-Webhook/test")
    }

    #[test]
    fn default_envelope_and_headers() -> Result<(), Box<dyn std::error::Error>> {
        let sub = subscription();
        let event = event();
        let request = builder().build(&sub, &event)?;

        assert_eq!(request.url, "https://hooks.example.com/in");
        assert_eq!(request.method, "POST");
        assert_eq!(request.headers[CONTENT_TYPE], "application/json");
        assert_eq!(request.headers[USER_AGENT], "CHawk-Webhook/test");
        assert_eq!(request.headers[EVENT_TYPE_HEADER], "case.created");
        assert_eq!(
            request.headers[DELIVERY_ID_HEADER],
            delivery_id_for(event.id, sub.id).to_string()
        );
        assert!(!request.headers.contains_key(SIGNATURE_HEADER));

        let body: Value = serde_json::from_str(&request.body)?;
        assert_eq!(body["event"], "case.created");
        assert_eq!(body["timestamp"], "2024-03-01T12:00:00Z");
        assert_eq!(body["webhook"]["name"], "soc");
        assert_eq!(body["data"]["case"]["id"], 42);
        Ok(())
    }

    #[test]
    fn build_is_deterministic() -> Result<(), TemplateError> {
        let sub = subscription().with_secret("k").with_header("X-Team", "blue");
        let event = event();

        assert_eq!(builder().build(&sub, &event)?, builder().build(&sub, &event)?);
        Ok(())
    }

    #[test]
    fn signature_covers_transmitted_body() -> Result<(), Box<dyn std::error::Error>> {
        let sub = subscription().with_secret("s3cret");
        let request = builder().build(&sub, &event())?;

        let header = &request.headers[SIGNATURE_HEADER];
        assert!(header.starts_with("sha256="));
        verify_signature("s3cret", request.body.as_bytes(), header)?;
        assert!(verify_signature("other", request.body.as_bytes(), header).is_err());
        Ok(())
    }

    #[test]
    fn custom_headers_cannot_override_reserved_ones() -> Result<(), TemplateError> {
        let sub = subscription()
            .with_secret("k")
            .with_header("x-event-type", "spoofed")
            .with_header("X-Signature", "sha256=00")
            .with_header("content-type", "application/vnd.custom+json")
            .with_header("Authorization", "Bearer t");
        let request = builder().build(&sub, &event())?;

        assert_eq!(request.headers[EVENT_TYPE_HEADER], "case.created");
        assert!(!request.headers.contains_key("x-event-type"));
        assert_ne!(request.headers[SIGNATURE_HEADER], "sha256=00");
        assert_eq!(request.headers["content-type"], "application/vnd.custom+json");
        assert!(!request.headers.contains_key(CONTENT_TYPE));
        assert_eq!(request.headers["Authorization"], "Bearer t");
        Ok(())
    }

    #[test]
    fn delivery_id_is_stable_per_pair() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(delivery_id_for(a, b), delivery_id_for(a, b));
        assert_ne!(delivery_id_for(a, b), delivery_id_for(b, a));
    }

    #[test]
    fn template_overrides_url_method_and_body() -> Result<(), TemplateError> {
        let mut template = WebhookTemplate::new(
            r#"{"text": "{{ event_type | upper }}: {{ event.case.title }}", "id": "{{ delivery_id }}"}"#,
        )
        .with_url("https://chat.example.com/{{ config.room }}")
        .with_header("X-Room", "{{ config.room }}")
        .with_config("room", "soc");
        template.method = Some("put".to_string());

        let sub = subscription().with_secret("k").with_template(template);
        let event = event();
        let request = builder().build(&sub, &event)?;

        assert_eq!(request.url, "https://chat.example.com/soc");
        assert_eq!(request.method, "PUT");
        assert_eq!(request.headers["X-Room"], "soc");
        assert_eq!(
            request.body,
            format!(
                r#"{{"text": "CASE.CREATED: Phishing", "id": "{}"}}"#,
                delivery_id_for(event.id, sub.id)
            )
        );
        assert!(verify_signature("k", request.body.as_bytes(), &request.headers[SIGNATURE_HEADER]).is_ok());
        Ok(())
    }

    #[test]
    fn template_failure_fails_the_build() {
        let sub = subscription().with_template(WebhookTemplate::new("{{ event.case.owner }}"));
        assert_eq!(
            builder().build(&sub, &event()),
            Err(TemplateError::UndefinedVariable("event.case.owner".to_string()))
        );
    }

    #[test]
    fn template_rendering_an_invalid_url_fails() {
        let template = WebhookTemplate::new("{}").with_url("{{ config.target }}").with_config("target", "not a url");
        let sub = subscription().with_template(template);

        assert!(matches!(
            builder().build(&sub, &event()),
            Err(TemplateError::InvalidOutput { .. })
        ));
    }

    #[test]
    fn template_rendering_a_non_http_url_fails() {
        let template = WebhookTemplate::new("{}")
            .with_url("{{ config.target }}")
            .with_config("target", "file:///etc/passwd");
        let sub = subscription().with_template(template);

        assert_eq!(
            builder().build(&sub, &event()),
            Err(TemplateError::InvalidOutput {
                field: "url".to_string(),
                reason: "unsupported scheme 'file'".to_string(),
            })
        );
    }

    #[test]
    fn malformed_headers_fail_the_build() {
        let bad_name = subscription()
            .with_template(WebhookTemplate::new("{}").with_header("Bad Name", "x"));
        assert!(matches!(
            builder().build(&bad_name, &event()),
            Err(TemplateError::InvalidOutput { field, .. }) if field == "header 'Bad Name'"
        ));

        let bad_rendered_value = subscription().with_template(
            WebhookTemplate::new("{}")
                .with_header("X-Team", "{{ config.team }}")
                .with_config("team", "a\u{1}b"),
        );
        assert!(matches!(
            builder().build(&bad_rendered_value, &event()),
            Err(TemplateError::InvalidOutput { field, .. }) if field == "header 'X-Team'"
        ));

        let bad_custom_value = subscription().with_header("X-Team", "a\u{1}b");
        assert!(matches!(
            builder().build(&bad_custom_value, &event()),
            Err(TemplateError::InvalidOutput { field, .. }) if field == "header 'X-Team'"
        ));
    }
}
