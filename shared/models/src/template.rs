use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Web,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Web => write!(f, "web"),
        }
    }
}

/// A versioned message template. Email templates carry a visual block tree
/// compiled to MJML/HTML; web templates carry a rich-text document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    /// Monotonically increasing, starts at 1.
    pub version: i32,
    pub channel: Channel,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailTemplate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web: Option<WebTemplate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub sender_id: String,
    pub subject: String,
    /// HTML compiled at save time, used for previews only; delivery always
    /// recompiles with per-recipient data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compiled_preview: Option<String>,
    pub visual_tree: Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebTemplate {
    /// Tiptap editor document.
    pub document: serde_json::Value,
    pub html: String,
    pub text: String,
}

/// Reference stored on broadcasts and message rows; template bodies are
/// never inlined.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateReference {
    pub id: String,
    pub version: i32,
}

impl TemplateReference {
    pub fn new(id: impl Into<String>, version: i32) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }
}

impl std::fmt::Display for TemplateReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.id, self.version)
    }
}

/// One node of the visual tree. The `type` tag discriminates the MJML-family
/// component; interior code only ever sees the {id, kind, attributes,
/// content, children} capability set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BlockKind,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockKind {
    Mjml,
    MjHead,
    MjTitle,
    MjPreview,
    MjAttributes,
    MjStyle,
    MjBody,
    MjWrapper,
    MjSection,
    MjGroup,
    MjColumn,
    MjText,
    MjButton,
    MjImage,
    MjDivider,
    MjSpacer,
    MjSocial,
    MjSocialElement,
    MjRaw,
    #[serde(untagged)]
    Other(String),
}

impl BlockKind {
    /// The MJML tag emitted for this block.
    pub fn tag_name(&self) -> &str {
        match self {
            Self::Mjml => "mjml",
            Self::MjHead => "mj-head",
            Self::MjTitle => "mj-title",
            Self::MjPreview => "mj-preview",
            Self::MjAttributes => "mj-attributes",
            Self::MjStyle => "mj-style",
            Self::MjBody => "mj-body",
            Self::MjWrapper => "mj-wrapper",
            Self::MjSection => "mj-section",
            Self::MjGroup => "mj-group",
            Self::MjColumn => "mj-column",
            Self::MjText => "mj-text",
            Self::MjButton => "mj-button",
            Self::MjImage => "mj-image",
            Self::MjDivider => "mj-divider",
            Self::MjSpacer => "mj-spacer",
            Self::MjSocial => "mj-social",
            Self::MjSocialElement => "mj-social-element",
            Self::MjRaw => "mj-raw",
            Self::Other(tag) => tag.as_str(),
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "mjml" => Self::Mjml,
            "mj-head" => Self::MjHead,
            "mj-title" => Self::MjTitle,
            "mj-preview" => Self::MjPreview,
            "mj-attributes" => Self::MjAttributes,
            "mj-style" => Self::MjStyle,
            "mj-body" => Self::MjBody,
            "mj-wrapper" => Self::MjWrapper,
            "mj-section" => Self::MjSection,
            "mj-group" => Self::MjGroup,
            "mj-column" => Self::MjColumn,
            "mj-text" => Self::MjText,
            "mj-button" => Self::MjButton,
            "mj-image" => Self::MjImage,
            "mj-divider" => Self::MjDivider,
            "mj-spacer" => Self::MjSpacer,
            "mj-social" => Self::MjSocial,
            "mj-social-element" => Self::MjSocialElement,
            "mj-raw" => Self::MjRaw,
            other => Self::Other(other.to_string()),
        }
    }

    /// Void components are emitted self-closing when they have neither
    /// content nor children.
    pub fn is_void(&self) -> bool {
        matches!(self, Self::MjImage | Self::MjDivider | Self::MjSpacer)
    }

    /// Components whose `content` runs through the personalization engine.
    pub fn has_personalized_content(&self) -> bool {
        matches!(
            self,
            Self::MjText | Self::MjButton | Self::MjTitle | Self::MjPreview | Self::MjRaw
        )
    }
}

impl Block {
    pub fn new(id: impl Into<String>, kind: BlockKind) -> Self {
        Self {
            id: id.into(),
            kind,
            attributes: serde_json::Map::new(),
            content: None,
            children: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_children(mut self, children: Vec<Block>) -> Self {
        self.children = children;
        self
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    /// Depth-first search for a block id.
    pub fn find(&self, id: &str) -> Option<&Block> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }
}

impl Template {
    pub fn reference(&self) -> TemplateReference {
        TemplateReference::new(self.id.clone(), self.version)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version < 1 {
            bail!("template version must be >= 1");
        }

        match self.channel {
            Channel::Email => {
                let Some(email) = &self.email else {
                    bail!("email-channel template requires an email payload");
                };
                if self.web.is_some() {
                    bail!("email-channel template must not carry a web payload");
                }
                if email.visual_tree.kind != BlockKind::Mjml {
                    bail!(
                        "visual tree root must be mjml, found {}",
                        email.visual_tree.kind.tag_name()
                    );
                }
            }
            Channel::Web => {
                if self.web.is_none() {
                    bail!("web-channel template requires a web payload");
                }
                if self.email.is_some() {
                    bail!("web-channel template must not carry an email payload");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_tree() -> Block {
        Block::new("root", BlockKind::Mjml).with_children(vec![Block::new(
            "body",
            BlockKind::MjBody,
        )
        .with_children(vec![Block::new("s1", BlockKind::MjSection)])])
    }

    fn email_template() -> Template {
        Template {
            id: "tpl-1".to_string(),
            name: "Welcome".to_string(),
            version: 1,
            channel: Channel::Email,
            category: "transactional".to_string(),
            email: Some(EmailTemplate {
                sender_id: "s-1".to_string(),
                subject: "Welcome!".to_string(),
                compiled_preview: None,
                visual_tree: minimal_tree(),
            }),
            web: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_block_serde_dispatches_on_type() {
        let json = r#"{
            "id": "b-1",
            "type": "mj-button",
            "attributes": {"href": "https://acme.test"},
            "content": "Click me"
        }"#;
        let block: Block = serde_json::from_str(json).unwrap();
        assert_eq!(block.kind, BlockKind::MjButton);
        assert_eq!(block.attribute_str("href"), Some("https://acme.test"));

        let round = serde_json::to_value(&block).unwrap();
        assert_eq!(round["type"], "mj-button");
    }

    #[test]
    fn test_unknown_block_kind_round_trips() {
        let block: Block =
            serde_json::from_str(r#"{"id": "x", "type": "mj-carousel"}"#).unwrap();
        assert_eq!(block.kind, BlockKind::Other("mj-carousel".to_string()));
        assert_eq!(block.kind.tag_name(), "mj-carousel");
        let round = serde_json::to_value(&block).unwrap();
        assert_eq!(round["type"], "mj-carousel");
    }

    #[test]
    fn test_template_validation() {
        let template = email_template();
        assert!(template.validate().is_ok());

        let mut bad_root = template.clone();
        bad_root.email.as_mut().unwrap().visual_tree.kind = BlockKind::MjBody;
        assert!(bad_root.validate().is_err());

        let mut both_payloads = template.clone();
        both_payloads.web = Some(WebTemplate {
            document: serde_json::json!({}),
            html: String::new(),
            text: String::new(),
        });
        assert!(both_payloads.validate().is_err());

        let mut bad_version = template;
        bad_version.version = 0;
        assert!(bad_version.validate().is_err());
    }

    #[test]
    fn test_find_block() {
        let tree = minimal_tree();
        assert!(tree.find("s1").is_some());
        assert!(tree.find("nope").is_none());
    }
}
