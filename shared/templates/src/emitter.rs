//! Visual tree → MJML source.
//!
//! A pre-order walk emitting start tag, attribute list, content, children
//! and end tag. Attribute keys are camelCase in the stored tree and
//! kebab-case on the wire; values are XML-escaped. URL-bearing attributes
//! and personalized content run through the Liquid engine only when
//! per-recipient data is present, so an export without data keeps every
//! `{{ … }}` verbatim.

use liquid::Object;

use mailtide_models::{Block, Channel};
use mailtide_utils::{MailtideError, MailtideResult};

use crate::engine::{contains_liquid_syntax, first_variable_name, LiquidEngine};

/// Attribute carrying the block id on export, stripped again by the parser.
pub const BLOCK_ID_ATTRIBUTE: &str = "data-block-id";

/// Attribute marking a subtree as single-channel.
pub const CHANNEL_ATTRIBUTE: &str = "channel";

pub struct EmitOptions<'a> {
    /// Liquid globals; `None` preserves raw expressions (export mode).
    pub globals: Option<&'a Object>,
    /// Emit `data-block-id` attributes so the tree can be reconstructed
    /// from the MJML output.
    pub include_block_ids: bool,
}

pub struct Emitter<'a> {
    engine: &'a LiquidEngine,
}

impl<'a> Emitter<'a> {
    pub fn new(engine: &'a LiquidEngine) -> Self {
        Self { engine }
    }

    /// Drop subtrees marked for the other channel.
    pub fn filter_channel(block: &Block, channel: Channel) -> Option<Block> {
        if let Some(marked) = block.attribute_str(CHANNEL_ATTRIBUTE) {
            let keep = match channel {
                Channel::Email => marked == "email",
                Channel::Web => marked == "web",
            };
            if !keep {
                return None;
            }
        }

        let mut filtered = block.clone();
        filtered.children = block
            .children
            .iter()
            .filter_map(|child| Self::filter_channel(child, channel))
            .collect();
        Some(filtered)
    }

    pub fn emit(&self, block: &Block, options: &EmitOptions<'_>) -> MailtideResult<String> {
        let mut out = String::new();
        self.emit_block(block, options, &mut out)?;
        Ok(out)
    }

    fn emit_block(
        &self,
        block: &Block,
        options: &EmitOptions<'_>,
        out: &mut String,
    ) -> MailtideResult<()> {
        let tag = block.kind.tag_name();

        out.push('<');
        out.push_str(tag);

        if options.include_block_ids {
            out.push_str(&format!(" {}=\"{}\"", BLOCK_ID_ATTRIBUTE, xml_escape(&block.id)));
        }

        for (key, value) in &block.attributes {
            let Some(value) = attribute_value_as_string(value) else {
                continue;
            };
            let rendered = self.render_attribute(block, key, &value, options)?;
            out.push(' ');
            out.push_str(&camel_to_kebab(key));
            out.push_str("=\"");
            out.push_str(&xml_escape(&rendered));
            out.push('"');
        }

        let content = match &block.content {
            Some(content) if block.kind.has_personalized_content() => {
                Some(self.render_content(block, content, options)?)
            }
            Some(content) => Some(content.clone()),
            None => None,
        };

        let empty = content.as_deref().map_or(true, str::is_empty) && block.children.is_empty();
        if empty && block.kind.is_void() {
            out.push_str(" />");
            return Ok(());
        }

        out.push('>');
        if let Some(content) = content {
            out.push_str(&content);
        }
        for child in &block.children {
            self.emit_block(child, options, out)?;
        }
        out.push_str("</");
        out.push_str(tag);
        out.push('>');

        Ok(())
    }

    fn render_attribute(
        &self,
        block: &Block,
        key: &str,
        value: &str,
        options: &EmitOptions<'_>,
    ) -> MailtideResult<String> {
        if !is_interpolated_attribute(key) || !contains_liquid_syntax(value) {
            return Ok(value.to_string());
        }

        let Some(globals) = options.globals else {
            // Export mode keeps raw expressions.
            return Ok(value.to_string());
        };

        let rendered = self
            .engine
            .render(value, globals)
            .map_err(|e| with_block_id(e, &block.id))?;

        // An interpolated URL rendering to empty would corrupt the MJML
        // output downstream; surface the offending variable instead.
        if is_url_attribute(key) && rendered.trim().is_empty() {
            let name = first_variable_name(value).unwrap_or_else(|| "unknown".to_string());
            return Ok(format!("[undefined: {name}]"));
        }

        Ok(rendered)
    }

    fn render_content(
        &self,
        block: &Block,
        content: &str,
        options: &EmitOptions<'_>,
    ) -> MailtideResult<String> {
        let Some(globals) = options.globals else {
            return Ok(content.to_string());
        };
        if !contains_liquid_syntax(content) {
            return Ok(content.to_string());
        }

        self.engine
            .render(content, globals)
            .map_err(|e| with_block_id(e, &block.id))
    }
}

fn with_block_id(error: MailtideError, block_id: &str) -> MailtideError {
    match error {
        MailtideError::TemplateRender { message, .. } => {
            MailtideError::template_render(block_id, message)
        }
        other => other,
    }
}

fn attribute_value_as_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// URL-bearing attributes get the undefined-variable guard.
fn is_url_attribute(key: &str) -> bool {
    let kebab = camel_to_kebab(key);
    matches!(kebab.as_str(), "href" | "src" | "action")
        || kebab.ends_with("-url")
        || kebab.ends_with("_url")
}

/// Attributes whose values run through the Liquid engine.
fn is_interpolated_attribute(key: &str) -> bool {
    is_url_attribute(key) || camel_to_kebab(key) == "alt"
}

pub fn camel_to_kebab(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    for c in input.chars() {
        if c.is_ascii_uppercase() {
            out.push('-');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

pub fn kebab_to_camel(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut upper_next = false;
    for c in input.chars() {
        if c == '-' {
            upper_next = true;
        } else if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

pub fn xml_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailtide_models::BlockKind;

    fn engine() -> LiquidEngine {
        LiquidEngine::new().unwrap()
    }

    fn no_data() -> EmitOptions<'static> {
        EmitOptions {
            globals: None,
            include_block_ids: false,
        }
    }

    fn tree() -> Block {
        Block::new("root", BlockKind::Mjml).with_children(vec![Block::new(
            "body",
            BlockKind::MjBody,
        )
        .with_children(vec![Block::new("s1", BlockKind::MjSection).with_children(vec![
            Block::new("c1", BlockKind::MjColumn).with_children(vec![
                Block::new("t1", BlockKind::MjText)
                    .with_attribute("fontSize", "14px")
                    .with_content("Hello {{ contact.first_name }}"),
                Block::new("b1", BlockKind::MjButton)
                    .with_attribute("href", "{{ cta_url }}")
                    .with_content("Go"),
                Block::new("i1", BlockKind::MjImage)
                    .with_attribute("src", "https://a.test/x.png")
                    .with_attribute("alt", "Logo"),
            ]),
        ])])])
    }

    #[test]
    fn test_emit_without_data_preserves_expressions() {
        let engine = engine();
        let mjml = Emitter::new(&engine).emit(&tree(), &no_data()).unwrap();

        assert!(mjml.contains("Hello {{ contact.first_name }}"));
        assert!(mjml.contains("href=\"{{ cta_url }}\""));
        assert!(mjml.contains("font-size=\"14px\""));
        assert!(mjml.starts_with("<mjml>"));
        assert!(mjml.ends_with("</mjml>"));
    }

    #[test]
    fn test_emit_with_data_interpolates() {
        let engine = engine();
        let data: serde_json::Map<String, serde_json::Value> = serde_json::from_value(
            serde_json::json!({"contact": {"first_name": "Ada"}, "cta_url": "https://acme.test/go"}),
        )
        .unwrap();
        let globals = crate::engine::globals_from_json(&data).unwrap();
        let options = EmitOptions {
            globals: Some(&globals),
            include_block_ids: false,
        };

        let mjml = Emitter::new(&engine).emit(&tree(), &options).unwrap();
        assert!(mjml.contains("Hello Ada"));
        assert!(mjml.contains("href=\"https://acme.test/go\""));
    }

    #[test]
    fn test_undefined_url_guard() {
        let engine = engine();
        let globals = Object::new();
        let options = EmitOptions {
            globals: Some(&globals),
            include_block_ids: false,
        };

        let mjml = Emitter::new(&engine).emit(&tree(), &options).unwrap();
        assert!(mjml.contains("href=\"[undefined: cta_url]\""));
    }

    #[test]
    fn test_void_block_self_closes() {
        let engine = engine();
        let mjml = Emitter::new(&engine).emit(&tree(), &no_data()).unwrap();
        // serde_json maps iterate in key order, so alt precedes src.
        assert!(mjml.contains("<mj-image alt=\"Logo\" src=\"https://a.test/x.png\" />"));
    }

    #[test]
    fn test_attribute_values_are_xml_escaped() {
        let engine = engine();
        let block = Block::new("i", BlockKind::MjImage)
            .with_attribute("src", "https://a.test/?a=1&b=\"2\"");
        let mjml = Emitter::new(&engine).emit(&block, &no_data()).unwrap();
        assert!(mjml.contains("src=\"https://a.test/?a=1&amp;b=&quot;2&quot;\""));
    }

    #[test]
    fn test_channel_filter_drops_other_channel() {
        let block = Block::new("root", BlockKind::Mjml).with_children(vec![
            Block::new("web-only", BlockKind::MjSection).with_attribute(CHANNEL_ATTRIBUTE, "web"),
            Block::new("both", BlockKind::MjSection),
        ]);

        let filtered = Emitter::filter_channel(&block, Channel::Email).unwrap();
        assert_eq!(filtered.children.len(), 1);
        assert_eq!(filtered.children[0].id, "both");
    }

    #[test]
    fn test_case_conversions() {
        assert_eq!(camel_to_kebab("backgroundColor"), "background-color");
        assert_eq!(kebab_to_camel("background-color"), "backgroundColor");
        assert_eq!(camel_to_kebab("href"), "href");
    }
}
