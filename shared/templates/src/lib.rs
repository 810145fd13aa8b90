//! Template compilation pipeline.
//!
//! Turns a stored visual block tree into canonical MJML source and
//! delivery-ready HTML: channel filtering, Liquid personalization, MJML
//! normalization and rendering, then link tracking and the open pixel.

pub mod emitter;
pub mod engine;
pub mod normalize;
pub mod parser;
pub mod render;
pub mod tracking;
pub mod urls;

use mailtide_models::{Block, BlockKind, Channel};
use mailtide_utils::{MailtideError, MailtideResult};

use emitter::{EmitOptions, Emitter};
use engine::LiquidEngine;
pub use tracking::{TrackingSettings, UtmParams};

pub struct CompileRequest<'a> {
    pub tree: &'a Block,
    pub channel: Channel,
    /// Per-recipient Liquid globals. Empty means "no interpolation": every
    /// `{{ … }}` / `{% … %}` in the source survives verbatim.
    pub template_data: serde_json::Map<String, serde_json::Value>,
    /// Force-disable interpolation even when data is present, for verbatim
    /// export.
    pub preserve_liquid: bool,
    /// Emit `data-block-id` attributes (export/round-trip mode).
    pub include_block_ids: bool,
    /// Link tracking; ignored for the web channel.
    pub tracking: Option<TrackingSettings>,
}

impl<'a> CompileRequest<'a> {
    pub fn export(tree: &'a Block, channel: Channel) -> Self {
        Self {
            tree,
            channel,
            template_data: serde_json::Map::new(),
            preserve_liquid: true,
            include_block_ids: true,
            tracking: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    pub mjml: String,
    pub html: String,
}

pub struct TemplateCompiler {
    engine: LiquidEngine,
}

impl TemplateCompiler {
    pub fn new() -> MailtideResult<Self> {
        Ok(Self {
            engine: LiquidEngine::new()?,
        })
    }

    /// Render a standalone Liquid string (subjects, preview text) against
    /// template data.
    pub fn render_text(
        &self,
        source: &str,
        template_data: &serde_json::Map<String, serde_json::Value>,
    ) -> MailtideResult<String> {
        if template_data.is_empty() {
            return Ok(source.to_string());
        }
        let globals = engine::globals_from_json(template_data)?;
        self.engine.render(source, &globals)
    }

    /// Run the full pipeline. Fails before rendering on an invalid tree;
    /// renderer errors surface with their location.
    pub fn compile(&self, request: &CompileRequest<'_>) -> MailtideResult<CompiledTemplate> {
        if request.tree.kind != BlockKind::Mjml {
            return Err(MailtideError::validation(
                "visual_tree",
                format!(
                    "root block must be mjml, found {}",
                    request.tree.kind.tag_name()
                ),
            ));
        }

        let filtered = Emitter::filter_channel(request.tree, request.channel)
            .ok_or_else(|| MailtideError::validation("visual_tree", "root block filtered out"))?;

        let interpolate = !request.preserve_liquid && !request.template_data.is_empty();
        let globals = if interpolate {
            Some(engine::globals_from_json(&request.template_data)?)
        } else {
            None
        };

        let emitter = Emitter::new(&self.engine);
        let mjml = emitter.emit(
            &filtered,
            &EmitOptions {
                globals: globals.as_ref(),
                include_block_ids: request.include_block_ids,
            },
        )?;

        let normalized = normalize::normalize_mjml(&mjml);
        let mut html = render::render_mjml(&normalized)?;

        if request.channel == Channel::Email {
            if let Some(tracking) = &request.tracking {
                html = tracking::apply_tracking(&html, tracking)?;
            }
        }

        Ok(CompiledTemplate {
            mjml: normalized,
            html,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailtide_models::BlockKind;

    fn tree() -> Block {
        Block::new("root", BlockKind::Mjml).with_children(vec![Block::new(
            "body",
            BlockKind::MjBody,
        )
        .with_children(vec![Block::new("s1", BlockKind::MjSection).with_children(vec![
            Block::new("c1", BlockKind::MjColumn).with_children(vec![
                Block::new("t1", BlockKind::MjText)
                    .with_content("Hi {{ contact.first_name }} &amp; welcome<br>"),
                Block::new("b1", BlockKind::MjButton)
                    .with_attribute("href", "https://shop.test/?p=1")
                    .with_content("Shop"),
            ]),
        ])])])
    }

    fn data() -> serde_json::Map<String, serde_json::Value> {
        serde_json::from_value(serde_json::json!({"contact": {"first_name": "Ada"}})).unwrap()
    }

    fn compiler() -> TemplateCompiler {
        TemplateCompiler::new().unwrap()
    }

    #[test]
    fn test_compile_with_data() {
        let tree = tree();
        let out = compiler()
            .compile(&CompileRequest {
                tree: &tree,
                channel: Channel::Email,
                template_data: data(),
                preserve_liquid: false,
                include_block_ids: false,
                tracking: None,
            })
            .unwrap();

        assert!(out.mjml.contains("Hi Ada"));
        assert!(out.mjml.contains("<br />"));
        assert!(out.html.contains("Hi Ada"));
    }

    #[test]
    fn test_compile_without_data_preserves_expressions() {
        let tree = tree();
        let out = compiler()
            .compile(&CompileRequest {
                tree: &tree,
                channel: Channel::Email,
                template_data: serde_json::Map::new(),
                preserve_liquid: false,
                include_block_ids: false,
                tracking: None,
            })
            .unwrap();

        assert!(out.mjml.contains("{{ contact.first_name }}"));
    }

    #[test]
    fn test_preserve_liquid_overrides_data() {
        let tree = tree();
        let out = compiler()
            .compile(&CompileRequest {
                tree: &tree,
                channel: Channel::Email,
                template_data: data(),
                preserve_liquid: true,
                include_block_ids: false,
                tracking: None,
            })
            .unwrap();

        assert!(out.mjml.contains("{{ contact.first_name }}"));
    }

    #[test]
    fn test_invalid_root_rejected() {
        let bad = Block::new("x", BlockKind::MjBody);
        let err = compiler()
            .compile(&CompileRequest {
                tree: &bad,
                channel: Channel::Email,
                template_data: serde_json::Map::new(),
                preserve_liquid: false,
                include_block_ids: false,
                tracking: None,
            })
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_tracking_applied_to_email_channel() {
        let tree = tree();
        let out = compiler()
            .compile(&CompileRequest {
                tree: &tree,
                channel: Channel::Email,
                template_data: data(),
                preserve_liquid: false,
                include_block_ids: false,
                tracking: Some(TrackingSettings {
                    enabled: true,
                    endpoint: "https://t.acme.test".to_string(),
                    message_id: "m-1".to_string(),
                    workspace_id: "acme".to_string(),
                    timestamp: 1700000000,
                    utm: None,
                }),
            })
            .unwrap();

        assert!(out.html.contains("/visit?mid=m-1"));
        assert!(out.html.contains("/opens?mid=m-1"));
    }
}
