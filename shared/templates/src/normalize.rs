//! MJML source normalization.
//!
//! MJML is parsed as XML, but block content written in a rich-text editor
//! is HTML: void tags arrive unclosed and named entities outside the XML
//! core set abound. Both are rewritten before the renderer sees them.

use std::sync::OnceLock;

use regex::Regex;

const HTML_VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

fn void_tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let tags = HTML_VOID_TAGS.join("|");
        Regex::new(&format!(r"(?i)<({tags})((?:\s[^<>]*?)?)>")).unwrap()
    })
}

/// Convert HTML void tags (`<br>`, `<img …>`) into self-closing XML form.
pub fn close_void_tags(source: &str) -> String {
    void_tag_regex()
        .replace_all(source, |caps: &regex::Captures<'_>| {
            let attrs = caps.get(2).map_or("", |m| m.as_str());
            if attrs.trim_end().ends_with('/') {
                // Already self-closing.
                caps[0].to_string()
            } else {
                format!("<{}{} />", &caps[1], attrs.trim_end())
            }
        })
        .into_owned()
}

/// Numeric replacements for named HTML entities outside the XML core set.
fn entity_codepoint(name: &str) -> Option<u32> {
    let cp = match name {
        "nbsp" => 160,
        "iexcl" => 161,
        "cent" => 162,
        "pound" => 163,
        "curren" => 164,
        "yen" => 165,
        "sect" => 167,
        "copy" => 169,
        "laquo" => 171,
        "reg" => 174,
        "deg" => 176,
        "plusmn" => 177,
        "middot" => 183,
        "raquo" => 187,
        "frac14" => 188,
        "frac12" => 189,
        "frac34" => 190,
        "iquest" => 191,
        "agrave" => 224,
        "aacute" => 225,
        "ccedil" => 231,
        "egrave" => 232,
        "eacute" => 233,
        "iacute" => 237,
        "ntilde" => 241,
        "oacute" => 243,
        "uacute" => 250,
        "uuml" => 252,
        "ouml" => 246,
        "auml" => 228,
        "szlig" => 223,
        "ndash" => 8211,
        "mdash" => 8212,
        "lsquo" => 8216,
        "rsquo" => 8217,
        "ldquo" => 8220,
        "rdquo" => 8221,
        "bull" => 8226,
        "hellip" => 8230,
        "permil" => 8240,
        "euro" => 8364,
        "trade" => 8482,
        "larr" => 8592,
        "uarr" => 8593,
        "rarr" => 8594,
        "darr" => 8595,
        _ => return None,
    };
    Some(cp)
}

fn named_entity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"&([a-zA-Z][a-zA-Z0-9]{1,30});").unwrap())
}

/// Convert named HTML entities into numeric character references, leaving
/// the XML core set (`amp`, `lt`, `gt`, `quot`, `apos`) untouched.
pub fn numeric_entities(source: &str) -> String {
    named_entity_regex()
        .replace_all(source, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            if matches!(name, "amp" | "lt" | "gt" | "quot" | "apos") {
                return caps[0].to_string();
            }
            match entity_codepoint(name) {
                Some(cp) => format!("&#{cp};"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Full normalization pass over emitted MJML.
pub fn normalize_mjml(source: &str) -> String {
    numeric_entities(&close_void_tags(source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_void_tags() {
        assert_eq!(close_void_tags("a<br>b"), "a<br />b");
        assert_eq!(
            close_void_tags("<img src=\"x.png\" alt=\"\">"),
            "<img src=\"x.png\" alt=\"\" />"
        );
        assert_eq!(close_void_tags("<BR>"), "<BR />");
    }

    #[test]
    fn test_already_closed_tags_untouched() {
        assert_eq!(close_void_tags("a<br />b"), "a<br />b");
        assert_eq!(
            close_void_tags("<img src=\"x.png\"/>"),
            "<img src=\"x.png\"/>"
        );
    }

    #[test]
    fn test_non_void_tags_untouched() {
        assert_eq!(close_void_tags("<p>text</p>"), "<p>text</p>");
        // "brand" starts with "br" but is not a void tag.
        assert_eq!(close_void_tags("<brand>x</brand>"), "<brand>x</brand>");
    }

    #[test]
    fn test_numeric_entities() {
        assert_eq!(numeric_entities("a&nbsp;b"), "a&#160;b");
        assert_eq!(numeric_entities("&copy; 2024 &mdash; Acme"), "&#169; 2024 &#8212; Acme");
    }

    #[test]
    fn test_xml_core_entities_kept() {
        assert_eq!(numeric_entities("a &amp; b &lt;c&gt;"), "a &amp; b &lt;c&gt;");
        assert_eq!(numeric_entities("&quot;x&quot;"), "&quot;x&quot;");
    }

    #[test]
    fn test_unknown_entities_left_alone() {
        assert_eq!(numeric_entities("&bogus;"), "&bogus;");
    }
}
