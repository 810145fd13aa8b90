//! MJML → HTML via the mrml renderer.

use mrml::prelude::render::RenderOptions;

use mailtide_utils::{MailtideError, MailtideResult};

/// Render normalized MJML source to delivery-ready HTML.
pub fn render_mjml(source: &str) -> MailtideResult<String> {
    let root = mrml::parse(source).map_err(|e| {
        MailtideError::template_render("", format!("MJML parse error: {e}"))
    })?;

    root.render(&RenderOptions::default())
        .map_err(|e| MailtideError::template_render("", format!("MJML render error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_minimal_document() {
        let html = render_mjml(
            "<mjml><mj-body><mj-section><mj-column><mj-text>Hello</mj-text></mj-column></mj-section></mj-body></mjml>",
        )
        .unwrap();
        assert!(html.contains("Hello"));
        assert!(html.contains("<body"));
    }

    #[test]
    fn test_parse_error_surfaces() {
        assert!(render_mjml("<mjml><mj-body>").is_err());
    }
}
