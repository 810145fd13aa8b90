//! Link tracking and open-pixel injection over rendered HTML.
//!
//! Runs after the MJML render: append configured UTM parameters, rewrite
//! anchors to the /visit redirect, drop a single tracking pixel immediately
//! before `</body>`, and decode URL entities in href/src/action attributes
//! last so query strings come out usable.

use std::sync::OnceLock;

use lol_html::{element, HtmlRewriter, Settings};
use regex::Regex;
use url::Url;

use mailtide_utils::{MailtideError, MailtideResult};

use crate::engine::contains_liquid_syntax;
use crate::urls::{opens_url, visit_url};

#[derive(Debug, Clone)]
pub struct TrackingSettings {
    /// Rewrite anchors and inject the pixel. UTM tagging applies even when
    /// disabled.
    pub enabled: bool,
    pub endpoint: String,
    pub message_id: String,
    pub workspace_id: String,
    /// Unix timestamp stamped into tracking URLs.
    pub timestamp: i64,
    pub utm: Option<UtmParams>,
}

#[derive(Debug, Clone, Default)]
pub struct UtmParams {
    pub source: Option<String>,
    pub medium: Option<String>,
    pub campaign: Option<String>,
    pub content: Option<String>,
    pub term: Option<String>,
}

impl UtmParams {
    fn pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = Vec::new();
        if let Some(v) = &self.source {
            pairs.push(("utm_source", v.as_str()));
        }
        if let Some(v) = &self.medium {
            pairs.push(("utm_medium", v.as_str()));
        }
        if let Some(v) = &self.campaign {
            pairs.push(("utm_campaign", v.as_str()));
        }
        if let Some(v) = &self.content {
            pairs.push(("utm_content", v.as_str()));
        }
        if let Some(v) = &self.term {
            pairs.push(("utm_term", v.as_str()));
        }
        pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs().is_empty()
    }
}

const SKIPPED_PROTOCOLS: &[&str] = &["mailto", "tel", "sms", "javascript", "data", "blob", "file"];

/// URLs the link-tracking policy leaves untouched.
fn should_skip(url: &str) -> bool {
    let trimmed = url.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') || contains_liquid_syntax(trimmed) {
        return true;
    }
    if let Some((scheme, rest)) = trimmed.split_once(':') {
        // "scheme:" only counts when it precedes the first slash.
        if !scheme.contains('/') && !rest.is_empty() || rest.is_empty() {
            let scheme = scheme.to_ascii_lowercase();
            if SKIPPED_PROTOCOLS.contains(&scheme.as_str()) {
                return true;
            }
        }
    }
    false
}

/// `&amp;` (and sibling numeric forms) back to `&`.
fn decode_url_entities(value: &str) -> String {
    value
        .replace("&amp;", "&")
        .replace("&#38;", "&")
        .replace("&#x26;", "&")
}

fn url_attribute_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)\b(href|src|action)="([^"]*)""#).unwrap())
}

/// Decode URL entities inside every href/src/action attribute value. Runs
/// last: the rewriter escapes `&` again in any attribute it touches.
pub fn decode_url_attributes(html: &str) -> String {
    url_attribute_regex()
        .replace_all(html, |caps: &regex::Captures<'_>| {
            format!("{}=\"{}\"", &caps[1], decode_url_entities(&caps[2]))
        })
        .into_owned()
}

fn append_utm(url: &str, utm: &UtmParams) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };

    let has_utm = parsed.query_pairs().any(|(key, _)| key.starts_with("utm_"));
    if has_utm {
        return url.to_string();
    }

    {
        let mut query = parsed.query_pairs_mut();
        for (key, value) in utm.pairs() {
            query.append_pair(key, value);
        }
    }
    parsed.to_string()
}

/// Apply the link-tracking policy to every anchor.
pub fn rewrite_links(html: &str, settings: &TrackingSettings) -> MailtideResult<String> {
    let mut output = Vec::with_capacity(html.len());

    let handlers = vec![element!("a[href]", |el| {
        let Some(raw) = el.get_attribute("href") else {
            return Ok(());
        };
        let href = decode_url_entities(&raw);

        if should_skip(&href) {
            return Ok(());
        }

        let mut target = href;
        if let Some(utm) = settings.utm.as_ref().filter(|utm| !utm.is_empty()) {
            target = append_utm(&target, utm);
        }

        if settings.enabled {
            target = visit_url(
                &settings.endpoint,
                &settings.message_id,
                &settings.workspace_id,
                settings.timestamp,
                &target,
            );
        }

        el.set_attribute("href", &target)?;
        Ok(())
    })];

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: handlers,
            ..Settings::default()
        },
        |chunk: &[u8]| output.extend_from_slice(chunk),
    );

    rewriter
        .write(html.as_bytes())
        .map_err(|e| MailtideError::internal(format!("link rewriting: {e}")))?;
    rewriter
        .end()
        .map_err(|e| MailtideError::internal(format!("link rewriting: {e}")))?;

    String::from_utf8(output)
        .map_err(|_| MailtideError::internal("link rewriting produced invalid UTF-8"))
}

/// Insert the open-tracking pixel immediately before `</body>`, or append
/// when the document has none.
pub fn inject_pixel(html: &str, settings: &TrackingSettings) -> String {
    let pixel = format!(
        "<img src=\"{}\" alt=\"\" width=\"1\" height=\"1\" style=\"display:none;max-height:0;overflow:hidden\" />",
        opens_url(
            &settings.endpoint,
            &settings.message_id,
            &settings.workspace_id,
            settings.timestamp,
        )
    );

    let lower = html.to_ascii_lowercase();
    match lower.rfind("</body>") {
        Some(idx) => {
            let mut out = String::with_capacity(html.len() + pixel.len());
            out.push_str(&html[..idx]);
            out.push_str(&pixel);
            out.push_str(&html[idx..]);
            out
        }
        None => {
            let mut out = html.to_string();
            out.push_str(&pixel);
            out
        }
    }
}

/// Full post-render pass: anchor policy, pixel, then URL-entity decoding.
pub fn apply_tracking(html: &str, settings: &TrackingSettings) -> MailtideResult<String> {
    let mut out = rewrite_links(html, settings)?;
    if settings.enabled {
        out = inject_pixel(&out, settings);
    }
    Ok(decode_url_attributes(&out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(enabled: bool) -> TrackingSettings {
        TrackingSettings {
            enabled,
            endpoint: "https://t.acme.test".to_string(),
            message_id: "m-1".to_string(),
            workspace_id: "acme".to_string(),
            timestamp: 1700000000,
            utm: None,
        }
    }

    #[test]
    fn test_anchor_rewritten_to_visit() {
        let html = r#"<html><body><a href="https://shop.test/p?id=1">Buy</a></body></html>"#;
        let out = apply_tracking(html, &settings(true)).unwrap();
        assert!(out.contains("/visit?mid=m-1&wid=acme&ts=1700000000&url="));
        assert!(out.contains("url=https%3A%2F%2Fshop.test%2Fp%3Fid%3D1"));
        assert!(!out.contains("href=\"https://shop.test/p?id=1\""));
    }

    #[test]
    fn test_skip_rules() {
        for href in [
            "#anchor",
            "mailto:a@b.test",
            "tel:+1555",
            "sms:+1555",
            "javascript:void(0)",
            "data:text/plain,hi",
            "{{ unsubscribe_url }}",
            "",
        ] {
            let html = format!("<body><a href=\"{href}\">x</a></body>");
            let out = rewrite_links(&html, &settings(true)).unwrap();
            assert!(
                !out.contains("/visit?"),
                "href {href:?} should be skipped, got {out}"
            );
        }
    }

    #[test]
    fn test_utm_appended_once() {
        let mut cfg = settings(false);
        cfg.utm = Some(UtmParams {
            source: Some("mailtide".to_string()),
            medium: Some("email".to_string()),
            campaign: Some("launch".to_string()),
            content: None,
            term: None,
        });

        let out =
            apply_tracking("<body><a href=\"https://shop.test/\">x</a></body>", &cfg).unwrap();
        assert!(out.contains("utm_source=mailtide"));
        assert!(out.contains("utm_campaign=launch"));

        // Existing utm_* parameters win.
        let out = apply_tracking(
            "<body><a href=\"https://shop.test/?utm_source=other\">x</a></body>",
            &cfg,
        )
        .unwrap();
        assert!(out.contains("utm_source=other"));
        assert!(!out.contains("utm_source=mailtide"));
    }

    #[test]
    fn test_entity_decoding_in_url_attributes() {
        let html = r#"<body><img src="https://a.test/i?x=1&amp;y=2" /><p>a &amp; b</p></body>"#;
        let out = apply_tracking(html, &settings(false)).unwrap();
        assert!(out.contains("src=\"https://a.test/i?x=1&y=2\""));
        // Text content entities survive.
        assert!(out.contains("a &amp; b"));
    }

    #[test]
    fn test_rewritten_href_has_decoded_query_separators() {
        let html = r#"<body><a href="https://shop.test/p?id=1">x</a></body>"#;
        let out = apply_tracking(html, &settings(true)).unwrap();
        assert!(out.contains("mid=m-1&wid=acme"));
        assert!(!out.contains("mid=m-1&amp;wid"));
    }

    #[test]
    fn test_pixel_before_body_close() {
        let out = apply_tracking("<html><body><p>x</p></body></html>", &settings(true)).unwrap();
        let pixel_idx = out.find("/opens?mid=m-1").unwrap();
        let body_idx = out.find("</body>").unwrap();
        assert!(pixel_idx < body_idx);
        assert_eq!(out.matches("/opens?").count(), 1);
    }

    #[test]
    fn test_pixel_appended_without_body() {
        let out = apply_tracking("<p>x</p>", &settings(true)).unwrap();
        assert!(out.contains("/opens?"));
    }

    #[test]
    fn test_disabled_tracking_keeps_links() {
        let out = apply_tracking(
            "<body><a href=\"https://shop.test/\">x</a></body>",
            &settings(false),
        )
        .unwrap();
        assert!(out.contains("href=\"https://shop.test/\""));
        assert!(!out.contains("/opens?"));
    }
}
