//! MJML source → visual tree.
//!
//! Inverse of the emitter, used when importing an exported template back
//! into the editor. Block ids come from the `data-block-id` attribute the
//! export pass emits; kebab-case attribute names fold back to camelCase.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use mailtide_models::{Block, BlockKind};
use mailtide_utils::{MailtideError, MailtideResult};

use crate::emitter::{kebab_to_camel, BLOCK_ID_ATTRIBUTE};

struct PendingBlock {
    block: Block,
    text: String,
}

/// Parse MJML text into a block tree.
pub fn parse_mjml(source: &str) -> MailtideResult<Block> {
    let mut reader = Reader::from_str(source);
    reader.trim_text(false);

    let mut stack: Vec<PendingBlock> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) => {
                stack.push(PendingBlock {
                    block: block_from_start(&start)?,
                    text: String::new(),
                });
            }
            Ok(Event::Empty(start)) => {
                let block = block_from_start(&start)?;
                attach(&mut stack, block)?;
            }
            Ok(Event::Text(text)) => {
                if let Some(parent) = stack.last_mut() {
                    let decoded = text.unescape().map_err(|e| {
                        MailtideError::validation("mjml", format!("bad text node: {e}"))
                    })?;
                    parent.text.push_str(&decoded);
                }
            }
            Ok(Event::CData(data)) => {
                if let Some(parent) = stack.last_mut() {
                    parent
                        .text
                        .push_str(&String::from_utf8_lossy(data.as_ref()));
                }
            }
            Ok(Event::End(_)) => {
                let Some(mut done) = stack.pop() else {
                    return Err(MailtideError::validation("mjml", "unbalanced end tag"));
                };
                let trimmed = done.text.trim();
                if !trimmed.is_empty() {
                    done.block.content = Some(trimmed.to_string());
                }
                if stack.is_empty() {
                    return Ok(done.block);
                }
                attach(&mut stack, done.block)?;
            }
            Ok(Event::Eof) => {
                return Err(MailtideError::validation(
                    "mjml",
                    "document ended before the root element closed",
                ));
            }
            Ok(_) => {}
            Err(e) => {
                return Err(MailtideError::validation(
                    "mjml",
                    format!("parse error at byte {}: {e}", reader.buffer_position()),
                ));
            }
        }
        buf.clear();
    }
}

fn attach(stack: &mut [PendingBlock], block: Block) -> MailtideResult<()> {
    match stack.last_mut() {
        Some(parent) => {
            parent.block.children.push(block);
            Ok(())
        }
        None => Err(MailtideError::validation(
            "mjml",
            "element outside the root block",
        )),
    }
}

fn block_from_start(start: &BytesStart<'_>) -> MailtideResult<Block> {
    let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut block = Block::new(String::new(), BlockKind::from_tag(&tag));

    for attr in start.attributes() {
        let attr =
            attr.map_err(|e| MailtideError::validation("mjml", format!("bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| MailtideError::validation("mjml", format!("bad attribute value: {e}")))?
            .into_owned();

        if key == BLOCK_ID_ATTRIBUTE {
            block.id = value;
        } else {
            block
                .attributes
                .insert(kebab_to_camel(&key), serde_json::Value::String(value));
        }
    }

    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::{EmitOptions, Emitter};
    use crate::engine::LiquidEngine;

    fn tree() -> Block {
        Block::new("root", BlockKind::Mjml).with_children(vec![Block::new(
            "body",
            BlockKind::MjBody,
        )
        .with_children(vec![Block::new("s1", BlockKind::MjSection).with_children(vec![
            Block::new("c1", BlockKind::MjColumn).with_children(vec![
                Block::new("t1", BlockKind::MjText)
                    .with_attribute("fontSize", "14px")
                    .with_attribute("paddingTop", "0")
                    .with_content("Hello {{ contact.first_name }}"),
                Block::new("i1", BlockKind::MjImage)
                    .with_attribute("src", "https://a.test/x.png"),
            ]),
        ])])])
    }

    #[test]
    fn test_emit_parse_round_trip() {
        let engine = LiquidEngine::new().unwrap();
        let emitter = Emitter::new(&engine);
        let mjml = emitter
            .emit(
                &tree(),
                &EmitOptions {
                    globals: None,
                    include_block_ids: true,
                },
            )
            .unwrap();

        let parsed = parse_mjml(&mjml).unwrap();
        assert_eq!(parsed, tree());
    }

    #[test]
    fn test_parse_plain_mjml_without_ids() {
        let parsed = parse_mjml(
            "<mjml><mj-body><mj-section><mj-column><mj-text font-size=\"14px\">hey</mj-text></mj-column></mj-section></mj-body></mjml>",
        )
        .unwrap();

        assert_eq!(parsed.kind, BlockKind::Mjml);
        let text = &parsed.children[0].children[0].children[0].children[0];
        assert_eq!(text.kind, BlockKind::MjText);
        assert_eq!(text.attribute_str("fontSize"), Some("14px"));
        assert_eq!(text.content.as_deref(), Some("hey"));
    }

    #[test]
    fn test_unbalanced_document_rejected() {
        assert!(parse_mjml("<mjml><mj-body></mjml>").is_err());
        assert!(parse_mjml("<mjml>").is_err());
    }
}
