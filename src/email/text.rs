//! Text helpers: HTML to plain text and quoted-reply stripping.
//!
//! Pure string parsing. Used for pattern matching against what the sender
//! actually wrote and for echoing user text back into responses.

/// Tags that end a line when rendered.
const BREAK_TAGS: &[&str] = &["br", "/p", "/div", "/li", "/tr", "/h1", "/h2", "/h3", "/h4", "p", "div"];

/// Render HTML to plain text, keeping line structure.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut tag = String::new();
    let mut in_tag = false;

    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let name = tag
                    .trim()
                    .trim_end_matches('/')
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .to_lowercase();
                if BREAK_TAGS.contains(&name.as_str()) {
                    out.push('\n');
                }
            }
            _ if in_tag => tag.push(ch),
            _ => out.push(ch),
        }
    }

    let decoded = decode_entities(&out);

    let mut lines: Vec<String> = decoded
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect();

    // Collapse runs of blank lines and trim the ends
    lines.dedup_by(|a, b| a.is_empty() && b.is_empty());
    while lines.first().is_some_and(|l| l.is_empty()) {
        lines.remove(0);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// HTML to a single trimmed line of text.
pub fn clean(input: &str) -> String {
    html_to_text(input)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// The newest part of a reply: quoted lines and everything after an
/// attribution line are dropped.
pub fn latest(body: &str) -> String {
    let mut result = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();

        // Quoted reply lines
        if trimmed.starts_with('>') {
            continue;
        }

        // "On <date> <person> wrote:" attribution
        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }

        // "--- Original Message ---" / "-----Original Message-----"
        if trimmed.starts_with("---") && trimmed.contains("Original Message") {
            break;
        }

        result.push(line);
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }

    result.join("\n")
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
