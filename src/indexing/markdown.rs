use pulldown_cmark::{Event, Parser, Tag, TagEnd};

/// Metadata extracted from frontmatter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrontMatter {
    pub title: Option<String>,
    pub tags: Vec<String>,
}

/// Split YAML front matter (between `---` markers) from the body.
pub fn extract_frontmatter(content: &str) -> (Option<&str>, &str) {
    let normalized = content.strip_prefix('\u{feff}').unwrap_or(content);
    let Some(rest) = normalized
        .strip_prefix("---\n")
        .or_else(|| normalized.strip_prefix("---\r\n"))
    else {
        return (None, normalized);
    };
    for marker in ["\n---\n", "\n---\r\n"] {
        if let Some(end) = rest.find(marker) {
            return (Some(&rest[..end]), &rest[end + marker.len()..]);
        }
    }
    if let Some(front) = rest.strip_suffix("\n---") {
        return (Some(front), "");
    }
    (None, normalized)
}

/// Parse frontmatter YAML; malformed YAML yields empty metadata.
pub fn parse_frontmatter(frontmatter: &str) -> FrontMatter {
    let mut metadata = FrontMatter::default();
    let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(frontmatter) else {
        return metadata;
    };
    let Some(map) = value.as_mapping() else {
        return metadata;
    };

    if let Some(title) = map.get("title").and_then(|v| v.as_str()) {
        metadata.title = Some(title.to_string());
    }

    if let Some(tags) = map.get("tags") {
        if let Some(tag_array) = tags.as_sequence() {
            metadata.tags = tag_array
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect();
        } else if let Some(tag_str) = tags.as_str() {
            // Handle comma-separated tags
            metadata.tags = tag_str
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    metadata
}

/// Flatten a Markdown document to plain text for term extraction.
///
/// Front matter title and tags lead the output; markup is dropped while
/// text, inline code, code blocks and link targets are kept, one block
/// per line.
pub fn flatten(content: &str) -> String {
    let (frontmatter, body) = extract_frontmatter(content);
    let mut out = String::with_capacity(body.len());

    if let Some(front) = frontmatter.map(parse_frontmatter) {
        if let Some(title) = &front.title {
            out.push_str(title);
            out.push('\n');
        }
        if !front.tags.is_empty() {
            out.push_str(&front.tags.join(" "));
            out.push('\n');
        }
    }

    for event in Parser::new(body) {
        match event {
            Event::Text(text) | Event::Code(text) | Event::Html(text) | Event::InlineHtml(text) => {
                out.push_str(&text);
            }
            Event::Start(Tag::Link { dest_url, .. }) | Event::Start(Tag::Image { dest_url, .. }) => {
                out.push(' ');
                out.push_str(&dest_url);
                out.push(' ');
            }
            Event::SoftBreak | Event::HardBreak => out.push('\n'),
            Event::End(TagEnd::Paragraph)
            | Event::End(TagEnd::Heading(_))
            | Event::End(TagEnd::CodeBlock)
            | Event::End(TagEnd::Item)
            | Event::End(TagEnd::TableCell) => {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }

    out
}
