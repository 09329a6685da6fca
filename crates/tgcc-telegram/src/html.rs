//! Markdown-ish → Telegram HTML.
//!
//! Telegram accepts a restricted HTML subset (b, i, s, u, code, pre, a,
//! blockquote, spoiler). The transformer is lossy by contract: tables
//! become list-style rows, unknown constructs are escaped into plain
//! text. Mid-stream fragments always render through the same path, so an
//! unbalanced marker never produces an unclosed tag — it falls back to
//! literal escaped text instead.

/// Escape the three characters Telegram's HTML parser cares about.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Render markdown-ish assistant output to Telegram HTML.
///
/// Code fences are extracted first and escaped verbatim; an unclosed
/// fence at the end of a partial buffer is rendered as a closed `<pre>`.
pub fn render_html(md: &str) -> String {
    let mut out = String::with_capacity(md.len() + 64);
    let mut text_lines: Vec<&str> = Vec::new();
    let mut code_lines: Vec<&str> = Vec::new();
    let mut fence_lang: Option<String> = None;

    for line in md.split('\n') {
        let trimmed = line.trim_start();
        if let Some(after) = trimmed.strip_prefix("```") {
            if fence_lang.is_some() {
                // Closing fence.
                push_code(&mut out, &code_lines, fence_lang.as_deref().unwrap_or(""));
                code_lines.clear();
                fence_lang = None;
            } else {
                flush_text(&mut out, &text_lines);
                text_lines.clear();
                fence_lang = Some(after.trim().to_string());
            }
            continue;
        }
        if fence_lang.is_some() {
            code_lines.push(line);
        } else {
            text_lines.push(line);
        }
    }

    if let Some(lang) = fence_lang {
        // Partial buffer ended inside a fence; close it.
        push_code(&mut out, &code_lines, &lang);
    } else {
        flush_text(&mut out, &text_lines);
    }

    out
}

fn push_code(out: &mut String, lines: &[&str], lang: &str) {
    let body = escape_html(&lines.join("\n"));
    if lang.is_empty() {
        out.push_str("<pre>");
        out.push_str(&body);
        out.push_str("</pre>\n");
    } else {
        out.push_str(&format!("<pre><code class=\"language-{lang}\">"));
        out.push_str(&body);
        out.push_str("</code></pre>\n");
    }
}

fn flush_text(out: &mut String, lines: &[&str]) {
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if is_table_row(line) {
            // Collect the whole table run.
            let start = i;
            while i < lines.len() && is_table_row(lines[i]) {
                i += 1;
            }
            for row in &lines[start..i] {
                if let Some(rendered) = render_table_row(row) {
                    out.push_str(&rendered);
                    out.push('\n');
                }
            }
            continue;
        }
        out.push_str(&convert_inline(line));
        out.push('\n');
        i += 1;
    }
    // One trailing newline per flushed block is enough.
    while out.ends_with("\n\n") {
        out.pop();
    }
}

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.len() > 1 && t[1..].contains('|')
}

/// Tables have no Telegram element; render each row list-style:
/// `<b>first</b> — cell — cell`. Separator rows are dropped.
fn render_table_row(line: &str) -> Option<String> {
    let cells: Vec<&str> = line
        .trim()
        .trim_matches('|')
        .split('|')
        .map(str::trim)
        .collect();
    let is_separator = cells
        .iter()
        .all(|c| !c.is_empty() && c.chars().all(|ch| ch == '-' || ch == ':'));
    if is_separator {
        return None;
    }

    let mut parts = cells.iter().filter(|c| !c.is_empty());
    let first = parts.next()?;
    let mut row = format!("<b>{}</b>", convert_inline(first));
    for cell in parts {
        row.push_str(" — ");
        row.push_str(&convert_inline(cell));
    }
    Some(row)
}

/// Convert inline markers in one line: `code`, **bold**, *italic*,
/// ~~strike~~, [label](url). Anything unbalanced renders literally.
pub fn convert_inline(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut i = 0;

    while i < chars.len() {
        // Inline code wins over every other marker.
        if chars[i] == '`' {
            if let Some(close) = find_char(&chars, i + 1, '`') {
                out.push_str("<code>");
                out.push_str(&escape_html(&collect(&chars[i + 1..close])));
                out.push_str("</code>");
                i = close + 1;
                continue;
            }
        }
        if chars[i] == '*' && i + 1 < chars.len() && chars[i + 1] == '*' {
            if let Some(close) = find_pair(&chars, i + 2, '*') {
                out.push_str("<b>");
                out.push_str(&convert_inline(&collect(&chars[i + 2..close])));
                out.push_str("</b>");
                i = close + 2;
                continue;
            }
        }
        if chars[i] == '*' {
            if let Some(close) = find_char(&chars, i + 1, '*') {
                if close > i + 1 {
                    out.push_str("<i>");
                    out.push_str(&convert_inline(&collect(&chars[i + 1..close])));
                    out.push_str("</i>");
                    i = close + 1;
                    continue;
                }
            }
        }
        if chars[i] == '~' && i + 1 < chars.len() && chars[i + 1] == '~' {
            if let Some(close) = find_pair(&chars, i + 2, '~') {
                out.push_str("<s>");
                out.push_str(&convert_inline(&collect(&chars[i + 2..close])));
                out.push_str("</s>");
                i = close + 2;
                continue;
            }
        }
        if chars[i] == '[' {
            if let Some((label_end, url_end)) = find_link(&chars, i) {
                let label = collect(&chars[i + 1..label_end]);
                let url = collect(&chars[label_end + 2..url_end]);
                out.push_str(&format!(
                    "<a href=\"{}\">{}</a>",
                    escape_html(&url),
                    convert_inline(&label)
                ));
                i = url_end + 1;
                continue;
            }
        }

        match chars[i] {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
        i += 1;
    }

    out
}

fn collect(chars: &[char]) -> String {
    chars.iter().collect()
}

fn find_char(chars: &[char], from: usize, needle: char) -> Option<usize> {
    (from..chars.len()).find(|&j| chars[j] == needle)
}

/// Next `cc` pair at or after `from`.
fn find_pair(chars: &[char], from: usize, needle: char) -> Option<usize> {
    let mut j = from;
    while j + 1 < chars.len() {
        if chars[j] == needle && chars[j + 1] == needle {
            return Some(j);
        }
        j += 1;
    }
    None
}

/// `[label](url)` starting at `open`. Returns (index of `]`, index of `)`).
fn find_link(chars: &[char], open: usize) -> Option<(usize, usize)> {
    let label_end = find_char(chars, open + 1, ']')?;
    if label_end + 1 >= chars.len() || chars[label_end + 1] != '(' {
        return None;
    }
    let url_end = find_char(chars, label_end + 2, ')')?;
    Some((label_end, url_end))
}

/// Wrap text in an expandable blockquote.
pub fn expandable_quote(escaped_body: &str) -> String {
    format!("<blockquote expandable>{escaped_body}</blockquote>")
}

/// Split `s` into chunks of at most `threshold` characters, preferring a
/// paragraph break, then a line break, then a sentence end, else a hard
/// cut. Leading whitespace of subsequent chunks is dropped; everything
/// else is preserved.
pub fn split_text(s: &str, threshold: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = s.to_string();

    while rest.len() > threshold {
        let (head, tail) = split_first(&rest, threshold);
        parts.push(head);
        rest = tail;
    }

    if !rest.is_empty() || parts.is_empty() {
        parts.push(rest);
    }
    parts
}

/// One split step: the first chunk (≤ `threshold`) and the remainder with
/// its leading whitespace dropped. A string within the threshold comes
/// back whole with an empty tail.
pub fn split_first(s: &str, threshold: usize) -> (String, String) {
    if s.len() <= threshold {
        return (s.to_string(), String::new());
    }

    let mut cut = threshold;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    let window = &s[..cut];

    let split_at = window
        .rfind("\n\n")
        .filter(|&i| i > 0)
        .or_else(|| window.rfind('\n').filter(|&i| i > 0))
        .or_else(|| window.rfind(". ").filter(|&i| i > 0).map(|i| i + 1))
        .unwrap_or(cut);

    (
        s[..split_at].to_string(),
        s[split_at..].trim_start().to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_escaped() {
        assert_eq!(render_html("a < b && c > d").trim(), "a &lt; b &amp;&amp; c &gt; d");
    }

    #[test]
    fn bold_italic_strike_convert() {
        let html = convert_inline("**bold** and *ital* and ~~gone~~");
        assert_eq!(html, "<b>bold</b> and <i>ital</i> and <s>gone</s>");
    }

    #[test]
    fn inline_code_is_escaped_not_converted() {
        let html = convert_inline("use `a<b>` here");
        assert_eq!(html, "use <code>a&lt;b&gt;</code> here");
    }

    #[test]
    fn links_convert_with_escaped_href() {
        let html = convert_inline("[docs](https://example.com/a?b=1&c=2)");
        assert_eq!(
            html,
            "<a href=\"https://example.com/a?b=1&amp;c=2\">docs</a>"
        );
    }

    #[test]
    fn unbalanced_markers_render_literally() {
        assert_eq!(convert_inline("2 * 3 = 6"), "2 * 3 = 6");
        assert_eq!(convert_inline("**dangling"), "**dangling");
        assert_eq!(convert_inline("`open"), "`open");
    }

    #[test]
    fn code_fence_renders_pre_with_language() {
        let html = render_html("before\n```rust\nlet x = 1 < 2;\n```\nafter");
        assert!(html.contains("<pre><code class=\"language-rust\">let x = 1 &lt; 2;</code></pre>"));
        assert!(html.contains("before"));
        assert!(html.contains("after"));
    }

    #[test]
    fn unclosed_fence_is_closed_in_partial_render() {
        let html = render_html("```python\nprint('hi')");
        assert!(html.contains("<pre><code class=\"language-python\">print('hi')</code></pre>"));
        assert!(!html.contains("```"));
    }

    #[test]
    fn markdown_inside_fence_stays_verbatim() {
        let html = render_html("```\n**not bold**\n```");
        assert!(html.contains("**not bold**"));
        assert!(!html.contains("<b>"));
    }

    #[test]
    fn table_renders_list_style() {
        let html = render_html("| Name | Role |\n|---|---|\n| ada | admin |\n| bob | guest |");
        assert!(html.contains("<b>Name</b> — Role"));
        assert!(html.contains("<b>ada</b> — admin"));
        assert!(html.contains("<b>bob</b> — guest"));
        assert!(!html.contains("---"));
    }

    #[test]
    fn split_returns_single_chunk_at_exact_threshold() {
        let text = "a".repeat(4000);
        let parts = split_text(&text, 4000);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0], text);
    }

    #[test]
    fn split_prefers_paragraph_break() {
        let text = format!("{}\n\n{}", "A".repeat(3000), "B".repeat(2000));
        let parts = split_text(&text, 4000);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], "A".repeat(3000));
        assert_eq!(parts[1], "B".repeat(2000));
        for part in &parts {
            assert!(part.len() <= 4000);
        }
    }

    #[test]
    fn split_falls_back_to_line_then_sentence() {
        let by_line = format!("{}\n{}", "A".repeat(3500), "B".repeat(1000));
        let parts = split_text(&by_line, 4000);
        assert_eq!(parts[0].len(), 3500);

        let by_sentence = format!("{}. {}", "A".repeat(3500), "B".repeat(1000));
        let parts = split_text(&by_sentence, 4000);
        assert_eq!(parts[0], format!("{}.", "A".repeat(3500)));
    }

    #[test]
    fn split_hard_cuts_unbreakable_text() {
        let text = "x".repeat(9000);
        let parts = split_text(&text, 4000);
        assert_eq!(parts.len(), 3);
        for part in &parts {
            assert!(part.len() <= 4000);
        }
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn split_concatenation_preserves_content() {
        let text = format!(
            "First paragraph.\n\n{}\n\nLast paragraph. With a tail",
            "middle ".repeat(700)
        );
        let parts = split_text(&text, 4000);
        let rejoined: String = parts.join(" ");
        // Modulo whitespace at the seams, nothing is lost.
        let squash = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(squash(&rejoined), squash(&text));
    }

    #[test]
    fn split_respects_char_boundaries() {
        let text = "é".repeat(3000); // 2 bytes per char
        let parts = split_text(&text, 4000);
        assert!(parts.len() >= 2);
        for part in &parts {
            assert!(part.len() <= 4000);
        }
    }
}
