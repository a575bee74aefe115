//! Chat text sanitization: length cap, control character stripping, HTML
//! escaping, and auto-linking of URLs.

const MAX_TEXT_CHARS: usize = 250;

/// Sanitize untrusted chat text for broadcast.
///
/// Control characters (including newlines and tabs) are stripped, the result
/// is capped at 250 characters, everything is HTML-escaped, and bare
/// http/https/www URLs become anchor tags.
pub fn transform_text(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_TEXT_CHARS)
        .collect();

    cleaned
        .split(' ')
        .map(|token| {
            if is_link(token) {
                anchor(token)
            } else {
                escape_html(token)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_link(token: &str) -> bool {
    let lower = token.to_ascii_lowercase();
    (lower.starts_with("http://") && token.len() > 7)
        || (lower.starts_with("https://") && token.len() > 8)
        || (lower.starts_with("www.") && token.len() > 4)
}

fn anchor(token: &str) -> String {
    let href = if token.to_ascii_lowercase().starts_with("www.") {
        format!("http://{token}")
    } else {
        token.to_string()
    };
    format!(
        "<a href=\"{}\" target=\"_blank\" rel=\"noopener\">{}</a>",
        escape_html(&href),
        escape_html(token)
    )
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_untouched() {
        assert_eq!(transform_text("hello"), "hello");
        assert_eq!(transform_text("hello there"), "hello there");
    }

    #[test]
    fn html_is_escaped() {
        assert_eq!(
            transform_text("<script>alert('hi')</script>"),
            "&lt;script&gt;alert(&#39;hi&#39;)&lt;/script&gt;"
        );
        assert_eq!(transform_text("a & b"), "a &amp; b");
    }

    #[test]
    fn control_characters_are_stripped() {
        assert_eq!(transform_text("a\r\nb\tc"), "abc");
        assert_eq!(transform_text("\u{0007}ding"), "ding");
    }

    #[test]
    fn text_is_capped_at_250_chars() {
        let long = "x".repeat(400);
        assert_eq!(transform_text(&long).chars().count(), 250);
    }

    #[test]
    fn urls_become_anchors() {
        let out = transform_text("see https://example.com ok");
        assert_eq!(
            out,
            "see <a href=\"https://example.com\" target=\"_blank\" rel=\"noopener\">https://example.com</a> ok"
        );
    }

    #[test]
    fn www_urls_get_a_protocol() {
        let out = transform_text("www.example.com");
        assert!(out.starts_with("<a href=\"http://www.example.com\""));
    }

    #[test]
    fn url_query_is_escaped_in_href() {
        let out = transform_text("https://example.com/?a=1&b=2");
        assert!(out.contains("href=\"https://example.com/?a=1&amp;b=2\""));
        assert!(!out.contains("a=1&b"));
    }

    #[test]
    fn bare_prefixes_are_not_links() {
        assert_eq!(transform_text("www."), "www.");
        assert_eq!(transform_text("http://"), "http://");
    }
}
