use serde_json::{Map, Value as JsonValue};

use crate::{
    errors::DispatchError,
    models::email::{Recipient, RenderedPayload, SendRequest},
};

/// Merges the recipient's `traits` object into its top-level attributes.
/// A trait only fills a key that is missing or null at the top level.
pub fn flatten_attributes(recipient: &Recipient) -> Map<String, JsonValue> {
    let mut flattened = recipient.attributes.clone();

    if let Some(JsonValue::Object(traits)) = recipient.attributes.get("traits") {
        for (key, value) in traits {
            let absent = flattened.get(key).is_none_or(JsonValue::is_null);
            if absent {
                flattened.insert(key.clone(), value.clone());
            }
        }
    }

    if let Some(email) = &recipient.email {
        let absent = flattened.get("email").is_none_or(JsonValue::is_null);
        if absent {
            flattened.insert("email".to_string(), JsonValue::String(email.clone()));
        }
    }

    flattened
        .entry("id".to_string())
        .or_insert_with(|| JsonValue::String(recipient.id.to_string()));

    flattened
}

fn scalar_text(value: Option<&JsonValue>) -> String {
    match value {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(JsonValue::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            '/' => escaped.push_str("&#x2F;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Substitutes `{{key}}` (HTML-escaped) and `{{{key}}}` (verbatim) tags.
/// Unknown keys and non-scalar values render as the empty string. An
/// unterminated tag is copied through unchanged.
pub fn render_template(template: &str, vars: &Map<String, JsonValue>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        output.push_str(&rest[..open]);
        let tag = &rest[open..];

        let (raw, inner_start, close_token) = if tag.starts_with("{{{") {
            (true, 3, "}}}")
        } else {
            (false, 2, "}}")
        };

        let Some(close) = tag[inner_start..].find(close_token) else {
            output.push_str(tag);
            return output;
        };

        let key = tag[inner_start..inner_start + close].trim();
        let value = scalar_text(vars.get(key));
        if raw {
            output.push_str(&value);
        } else {
            output.push_str(&escape_html(&value));
        }

        rest = &tag[inner_start + close + close_token.len()..];
    }

    output.push_str(rest);
    output
}

impl SendRequest {
    /// Renders the request into a provider payload. Pure: the same request
    /// always yields the same payload.
    pub fn render(&self) -> Result<RenderedPayload, DispatchError> {
        let vars = flatten_attributes(&self.recipient);

        let to = self
            .to_address
            .clone()
            .or_else(|| self.recipient.email.clone())
            .filter(|address| !address.trim().is_empty())
            .ok_or_else(|| {
                DispatchError::InvalidPayload(format!(
                    "recipient {} has no email address",
                    self.recipient.id
                ))
            })?;

        Ok(RenderedPayload {
            to,
            subject: render_template(&self.template.subject, &vars),
            html: render_template(&self.template.body_html, &vars),
            text: self
                .template
                .body_text
                .as_deref()
                .map(|text| render_template(text, &vars)),
            from: self
                .from_address
                .clone()
                .or_else(|| self.template.from_address.clone()),
        })
    }
}
