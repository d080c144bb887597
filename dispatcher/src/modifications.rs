//! Live DOM edits over an origin page.
//!
//! A modifications rule carries a list of `{selector, action, value}`
//! edits; the origin HTML is fetched through the proxy path and the
//! edits are applied in order as a forward transformation. Selectors
//! are the compiled subset the edit UI emits: `tag`, `#id`, `.class`,
//! and tag-qualified forms (`div.hero`, `a#cta`).

use crate::bundle::{DomEdit, EditAction};
use crate::rewrite::{TagSpan, find_ci, parse_tag};

#[derive(Debug, Default, PartialEq)]
struct Selector {
    tag: Option<String>,
    id: Option<String>,
    class: Option<String>,
}

impl Selector {
    fn parse(input: &str) -> Selector {
        let mut selector = Selector::default();
        let mut rest = input.trim();

        let tag_end = rest.find(['#', '.']).unwrap_or(rest.len());
        if tag_end > 0 {
            selector.tag = Some(rest[..tag_end].to_ascii_lowercase());
        }
        rest = &rest[tag_end..];

        while !rest.is_empty() {
            let (kind, tail) = rest.split_at(1);
            let value_end = tail.find(['#', '.']).unwrap_or(tail.len());
            let value = &tail[..value_end];
            match kind {
                "#" => selector.id = Some(value.to_string()),
                "." => selector.class = Some(value.to_string()),
                _ => {}
            }
            rest = &tail[value_end..];
        }
        selector
    }

    fn matches(&self, tag: &TagSpan) -> bool {
        if self.tag.is_none() && self.id.is_none() && self.class.is_none() {
            return false;
        }
        if let Some(name) = &self.tag
            && *name != tag.name
        {
            return false;
        }
        if let Some(id) = &self.id
            && tag.attr("id").map(|a| a.value.as_str()) != Some(id.as_str())
        {
            return false;
        }
        if let Some(class) = &self.class {
            let has = tag
                .attr("class")
                .is_some_and(|a| a.value.split_ascii_whitespace().any(|c| c == class));
            if !has {
                return false;
            }
        }
        true
    }
}

/// Elements with no closing tag; inner-content edits are no-ops on
/// them and `remove` drops just the tag.
const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

fn is_void(tag: &str) -> bool {
    VOID_TAGS.contains(&tag)
}

/// Finds the index of the matching `</name>` open angle, honoring
/// nesting of the same tag name. Returns None when unbalanced.
fn find_matching_close(html: &str, name: &str, mut from: usize) -> Option<(usize, usize)> {
    let mut depth = 0usize;
    while from < html.len() {
        let lt = html[from..].find('<').map(|p| from + p)?;
        let Some(tag) = parse_tag(html, lt) else {
            from = lt + 1;
            continue;
        };
        if tag.name == name {
            if tag.closing {
                if depth == 0 {
                    return Some((lt, tag.end));
                }
                depth -= 1;
            } else if !is_void(&tag.name) {
                depth += 1;
            }
        }
        from = tag.end;
    }
    None
}

fn escape_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn apply_edits(html: &str, edits: &[DomEdit]) -> String {
    let mut doc = html.to_string();
    for edit in edits {
        doc = apply_edit(&doc, edit);
    }
    doc
}

fn apply_edit(html: &str, edit: &DomEdit) -> String {
    let selector = Selector::parse(&edit.selector);
    let mut out = String::with_capacity(html.len());
    let bytes = html.as_bytes();
    let len = bytes.len();
    let mut i = 0;

    while i < len {
        let Some(lt) = html[i..].find('<').map(|p| i + p) else {
            out.push_str(&html[i..]);
            break;
        };
        out.push_str(&html[i..lt]);
        i = lt;

        if html[lt..].starts_with("<!--") {
            let end = html[lt..].find("-->").map_or(len, |p| lt + p + 3);
            out.push_str(&html[lt..end]);
            i = end;
            continue;
        }
        if lt + 1 < len && (bytes[lt + 1] == b'!' || bytes[lt + 1] == b'?') {
            let end = html[lt..].find('>').map_or(len, |p| lt + p + 1);
            out.push_str(&html[lt..end]);
            i = end;
            continue;
        }

        let Some(tag) = parse_tag(html, lt) else {
            out.push('<');
            i = lt + 1;
            continue;
        };

        if !tag.closing && selector.matches(&tag) {
            i = emit_edited(&mut out, html, lt, &tag, edit);
            continue;
        }

        out.push_str(&html[lt..tag.end]);
        i = tag.end;

        // Do not interpret raw-text content as markup.
        if !tag.closing && (tag.name == "script" || tag.name == "style") {
            let close = format!("</{}", tag.name);
            let content_end = find_ci(html, &close, i).unwrap_or(len);
            out.push_str(&html[i..content_end]);
            i = content_end;
        }
    }
    out
}

/// Applies the edit to one matched element; returns the resume index.
fn emit_edited(out: &mut String, html: &str, start: usize, tag: &TagSpan, edit: &DomEdit) -> usize {
    match edit.action {
        EditAction::Remove => {
            if is_void(&tag.name) {
                return tag.end;
            }
            match find_matching_close(html, &tag.name, tag.end) {
                Some((_, close_end)) => close_end,
                None => tag.end,
            }
        }
        EditAction::SetText | EditAction::SetHtml => {
            out.push_str(&html[start..tag.end]);
            if is_void(&tag.name) {
                return tag.end;
            }
            let Some((close_start, close_end)) = find_matching_close(html, &tag.name, tag.end)
            else {
                return tag.end;
            };
            if edit.action == EditAction::SetText {
                out.push_str(&escape_text(edit.value_str()));
            } else {
                out.push_str(edit.value_str());
            }
            out.push_str(&html[close_start..close_end]);
            close_end
        }
        EditAction::SetCss => {
            let merged = match tag.attr("style") {
                Some(attr) if !attr.value.trim().is_empty() => {
                    format!("{}; {}", attr.value.trim_end_matches([' ', ';']), edit.value_str())
                }
                _ => edit.value_str().to_string(),
            };
            emit_with_attr(out, html, start, tag, "style", &merged);
            tag.end
        }
        EditAction::SetAttribute => {
            let Some((name, value)) = edit.attribute() else {
                out.push_str(&html[start..tag.end]);
                return tag.end;
            };
            emit_with_attr(out, html, start, tag, name, value);
            tag.end
        }
    }
}

/// Re-emits the tag with one attribute set or replaced.
fn emit_with_attr(out: &mut String, html: &str, start: usize, tag: &TagSpan, name: &str, value: &str) {
    if let Some(attr) = tag.attr(&name.to_ascii_lowercase())
        && attr.value_end > attr.value_start
    {
        out.push_str(&html[start..attr.value_start]);
        out.push_str(value);
        out.push_str(&html[attr.value_end..tag.end]);
        return;
    }

    // Insert before the closing '>', keeping self-closing syntax intact.
    let bytes = html.as_bytes();
    let mut insert_at = tag.end - 1;
    if insert_at > start && bytes[insert_at - 1] == b'/' {
        insert_at -= 1;
    }
    out.push_str(&html[start..insert_at]);
    out.push_str(&format!(" {name}=\"{value}\""));
    out.push_str(&html[insert_at..tag.end]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn edit(value: serde_json::Value) -> DomEdit {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn set_text_replaces_and_escapes_inner_content() {
        let html = r#"<h1 class="hero">Old <b>title</b></h1>"#;
        let out = apply_edits(
            html,
            &[edit(json!({"selector": ".hero", "action": "setText", "value": "5 > 4"}))],
        );
        assert_eq!(out, r#"<h1 class="hero">5 &gt; 4</h1>"#);
    }

    #[test]
    fn set_html_inserts_raw_markup() {
        let html = r#"<div id="cta">x</div>"#;
        let out = apply_edits(
            html,
            &[edit(json!({"selector": "#cta", "action": "setHtml", "value": "<a href=\"/go\">Go</a>"}))],
        );
        assert_eq!(out, r#"<div id="cta"><a href="/go">Go</a></div>"#);
    }

    #[test]
    fn set_css_merges_into_an_existing_style() {
        let html = r#"<p style="color: red">t</p>"#;
        let out = apply_edits(
            html,
            &[edit(json!({"selector": "p", "action": "setCss", "value": "display: none"}))],
        );
        assert_eq!(out, r#"<p style="color: red; display: none">t</p>"#);
    }

    #[test]
    fn set_css_adds_a_style_when_missing() {
        let out = apply_edits(
            "<p>t</p>",
            &[edit(json!({"selector": "p", "action": "setCss", "value": "display:none"}))],
        );
        assert_eq!(out, r#"<p style="display:none">t</p>"#);
    }

    #[test]
    fn set_attribute_replaces_or_adds() {
        let html = r#"<a id="x" href="/old">l</a>"#;
        let out = apply_edits(
            html,
            &[edit(json!({"selector": "a", "action": "setAttribute",
                          "value": {"name": "href", "value": "/new"}}))],
        );
        assert_eq!(out, r#"<a id="x" href="/new">l</a>"#);

        let out = apply_edits(
            "<img src=\"/i.png\"/>",
            &[edit(json!({"selector": "img", "action": "setAttribute",
                          "value": {"name": "loading", "value": "lazy"}}))],
        );
        assert_eq!(out, "<img src=\"/i.png\" loading=\"lazy\"/>");
    }

    #[test]
    fn remove_drops_the_element_and_its_children() {
        let html = r#"<div><div class="ad"><p>buy</p></div><p>keep</p></div>"#;
        let out = apply_edits(
            html,
            &[edit(json!({"selector": ".ad", "action": "remove"}))],
        );
        assert_eq!(out, "<div><p>keep</p></div>");
    }

    #[test]
    fn remove_handles_nested_same_tag() {
        let html = "<div id=\"outer\"><div>inner</div></div><span>after</span>";
        let out = apply_edits(
            html,
            &[edit(json!({"selector": "#outer", "action": "remove"}))],
        );
        assert_eq!(out, "<span>after</span>");
    }

    #[test]
    fn edits_apply_to_every_match() {
        let html = "<li class=\"x\">a</li><li class=\"x\">b</li>";
        let out = apply_edits(
            html,
            &[edit(json!({"selector": "li.x", "action": "setText", "value": "z"}))],
        );
        assert_eq!(out, "<li class=\"x\">z</li><li class=\"x\">z</li>");
    }

    #[test]
    fn selector_parsing_supports_qualified_forms() {
        assert_eq!(
            Selector::parse("div.hero"),
            Selector {
                tag: Some("div".into()),
                id: None,
                class: Some("hero".into())
            }
        );
        assert_eq!(
            Selector::parse("#main"),
            Selector {
                tag: None,
                id: Some("main".into()),
                class: None
            }
        );
    }

    #[test]
    fn script_content_is_not_treated_as_markup() {
        let html = "<script>if (a < b) { run(\"<p>\"); }</script><p>t</p>";
        let out = apply_edits(
            html,
            &[edit(json!({"selector": "p", "action": "setText", "value": "z"}))],
        );
        assert_eq!(out, "<script>if (a < b) { run(\"<p>\"); }</script><p>z</p>");
    }
}
