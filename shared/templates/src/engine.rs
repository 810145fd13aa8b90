//! Personalization engine.
//!
//! Wraps a Liquid parser with the platform's evaluation rules: invisible
//! characters are stripped inside expressions before evaluation, missing
//! variables evaluate as undefined (nil) rather than erroring, and every
//! render runs under a wall-clock and output-size budget.

use std::io;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use liquid::model::Value as LiquidValue;
use liquid::Object;
use regex::Regex;

use mailtide_utils::{MailtideError, MailtideResult};

/// Wall-clock budget for a single template render.
pub const RENDER_TIME_BUDGET: Duration = Duration::from_secs(5);
/// Output-size budget for a single template render.
pub const RENDER_SIZE_BUDGET: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BudgetExceeded {
    Time,
    Size,
}

/// Output sink that aborts the render as soon as a budget is crossed.
/// Template data is caller-supplied (contact custom fields and the like),
/// so a runaway `{% for %}` must be cut off mid-stream, not measured after
/// it finished.
struct BudgetedWriter {
    buffer: Vec<u8>,
    size_limit: usize,
    deadline: Instant,
    exceeded: Option<BudgetExceeded>,
}

impl BudgetedWriter {
    fn new(size_limit: usize, deadline: Instant) -> Self {
        Self {
            buffer: Vec::new(),
            size_limit,
            deadline,
            exceeded: None,
        }
    }
}

impl io::Write for BudgetedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if Instant::now() > self.deadline {
            self.exceeded = Some(BudgetExceeded::Time);
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "render time budget exceeded",
            ));
        }
        if self.buffer.len() + buf.len() > self.size_limit {
            self.exceeded = Some(BudgetExceeded::Size);
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "render size budget exceeded",
            ));
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct LiquidEngine {
    parser: liquid::Parser,
}

fn expression_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{[^}]*\}\}|\{%[^%]*%\}").unwrap())
}

fn root_variable_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // First identifier of each expression, skipping tag keywords.
    RE.get_or_init(|| {
        Regex::new(
            r"\{\{-?\s*([A-Za-z_][A-Za-z0-9_]*)|\{%-?\s*(?:if|unless|elsif|for\s+[A-Za-z_][A-Za-z0-9_]*\s+in|assign\s+[A-Za-z_][A-Za-z0-9_]*\s*=|case)\s+([A-Za-z_][A-Za-z0-9_]*)",
        )
        .unwrap()
    })
}

/// True when the text contains Liquid syntax.
pub fn contains_liquid_syntax(text: &str) -> bool {
    text.contains("{{") || text.contains("{%")
}

/// Strip NBSP and zero-width characters inside `{{ … }}` / `{% … %}`.
/// Rich-text editors routinely paste these into expressions, breaking
/// variable lookup.
pub fn clean_expressions(source: &str) -> String {
    expression_regex()
        .replace_all(source, |caps: &regex::Captures<'_>| {
            caps[0]
                .chars()
                .filter(|c| !matches!(c, '\u{00a0}' | '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{feff}'))
                .collect::<String>()
        })
        .into_owned()
}

/// First variable path mentioned by an expression, for error messages and
/// the undefined-URL guard.
pub fn first_variable_name(source: &str) -> Option<String> {
    static PATH_RE: OnceLock<Regex> = OnceLock::new();
    let re = PATH_RE.get_or_init(|| {
        Regex::new(r"\{\{-?\s*([A-Za-z_][A-Za-z0-9_.]*)").unwrap()
    });
    re.captures(source).map(|caps| caps[1].to_string())
}

impl LiquidEngine {
    pub fn new() -> MailtideResult<Self> {
        let parser = liquid::ParserBuilder::with_stdlib()
            .build()
            .map_err(|e| MailtideError::configuration(format!("liquid parser: {e}")))?;
        Ok(Self { parser })
    }

    /// Render a Liquid source against the supplied globals.
    ///
    /// Variables the source references but the globals lack are injected as
    /// nil, so `{{ missing }}` renders empty and `{% if missing %}` is
    /// falsy instead of aborting the whole template. The render writes into
    /// a budgeted sink and is aborted the moment the wall-clock or
    /// output-size budget is crossed.
    pub fn render(&self, source: &str, globals: &Object) -> MailtideResult<String> {
        let cleaned = clean_expressions(source);

        let template = self
            .parser
            .parse(&cleaned)
            .map_err(|e| MailtideError::template_render("", e.to_string()))?;

        let mut scope = globals.clone();
        for root in referenced_roots(&cleaned) {
            scope
                .entry(liquid::model::KString::from_string(root))
                .or_insert(LiquidValue::Nil);
        }

        let mut writer = BudgetedWriter::new(RENDER_SIZE_BUDGET, Instant::now() + RENDER_TIME_BUDGET);
        match template.render_to(&mut writer, &scope) {
            Ok(()) => String::from_utf8(writer.buffer)
                .map_err(|_| MailtideError::template_render("", "render produced invalid UTF-8")),
            Err(e) => Err(match writer.exceeded {
                Some(BudgetExceeded::Time) => MailtideError::template_render(
                    "",
                    format!("render exceeded {}s budget", RENDER_TIME_BUDGET.as_secs()),
                ),
                Some(BudgetExceeded::Size) => MailtideError::template_render(
                    "",
                    format!("render output exceeded {} bytes", RENDER_SIZE_BUDGET),
                ),
                None => MailtideError::template_render("", e.to_string()),
            }),
        }
    }
}

fn referenced_roots(source: &str) -> Vec<String> {
    let mut roots = Vec::new();
    for caps in root_variable_regex().captures_iter(source) {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().to_string());
        if let Some(name) = name {
            if !is_liquid_keyword(&name) && !roots.contains(&name) {
                roots.push(name);
            }
        }
    }
    roots
}

fn is_liquid_keyword(name: &str) -> bool {
    matches!(
        name,
        "true" | "false" | "nil" | "null" | "empty" | "blank" | "forloop" | "else" | "end"
    )
}

/// Convert a JSON object into Liquid globals.
pub fn globals_from_json(data: &serde_json::Map<String, serde_json::Value>) -> MailtideResult<Object> {
    liquid::model::to_object(&serde_json::Value::Object(data.clone()))
        .map_err(|e| MailtideError::template_render("", format!("template data: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> LiquidEngine {
        LiquidEngine::new().unwrap()
    }

    fn globals(json: serde_json::Value) -> Object {
        let serde_json::Value::Object(map) = json else {
            panic!("globals must be an object");
        };
        globals_from_json(&map).unwrap()
    }

    #[test]
    fn test_variable_expansion_with_filter() {
        let out = engine()
            .render(
                "Hello {{ contact.first_name | upcase }}!",
                &globals(serde_json::json!({"contact": {"first_name": "ada"}})),
            )
            .unwrap();
        assert_eq!(out, "Hello ADA!");
    }

    #[test]
    fn test_control_flow_subset() {
        let out = engine()
            .render(
                "{% if vip %}VIP{% endif %}{% for item in items %}[{{ item }}]{% endfor %}",
                &globals(serde_json::json!({"vip": true, "items": ["a", "b"]})),
            )
            .unwrap();
        assert_eq!(out, "VIP[a][b]");
    }

    #[test]
    fn test_missing_variable_renders_empty_not_error() {
        let out = engine()
            .render("x{{ nothing.here }}y", &Object::new())
            .unwrap();
        assert_eq!(out, "xy");

        let out = engine()
            .render("{% if absent %}yes{% endif %}no", &Object::new())
            .unwrap();
        assert_eq!(out, "no");
    }

    #[test]
    fn test_nbsp_stripped_inside_expressions_only() {
        let source = "a\u{00a0}b {{\u{00a0}name\u{200b}}}";
        let out = engine()
            .render(source, &globals(serde_json::json!({"name": "x"})))
            .unwrap();
        // The NBSP outside the expression survives.
        assert_eq!(out, "a\u{00a0}b x");
    }

    #[test]
    fn test_size_budget_cuts_runaway_render() {
        // A crafted nested loop would emit ~16 MiB; the budgeted writer
        // aborts it mid-stream instead of after the fact.
        let source =
            "{% for i in (1..2000) %}{% for j in (1..2000) %}xxxx{% endfor %}{% endfor %}";
        let err = engine().render(source, &Object::new()).unwrap_err();
        assert_eq!(err.error_code(), "TEMPLATE_RENDER_ERROR");
        assert!(err.to_string().contains("exceeded"), "got: {err}");
    }

    #[test]
    fn test_first_variable_name() {
        assert_eq!(
            first_variable_name("{{ unsubscribe_url }}").as_deref(),
            Some("unsubscribe_url")
        );
        assert_eq!(
            first_variable_name("{{ contact.email | downcase }}").as_deref(),
            Some("contact.email")
        );
        assert_eq!(first_variable_name("no syntax"), None);
    }

    #[test]
    fn test_contains_liquid_syntax() {
        assert!(contains_liquid_syntax("{{ a }}"));
        assert!(contains_liquid_syntax("{% if a %}"));
        assert!(!contains_liquid_syntax("plain text"));
    }
}
