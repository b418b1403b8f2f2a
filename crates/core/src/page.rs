use std::fmt::Write as _;

use crate::display::DisplaySnapshot;
use crate::render::Renderer;

const MATHJAX_SCRIPT: &str =
    r#"<script async src="https://cdn.jsdelivr.net/npm/mathjax@3/es5/tex-chtml.js"></script>"#;

/// Renders a snapshot as a standalone HTML document.
///
/// Role labels stay in their MathJax form and are typeset client side.
pub fn render_page(snapshot: &DisplaySnapshot, renderer: &Renderer) -> String {
    let mut page = String::from("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    page.push_str("<title>nbchat</title>\n");
    page.push_str(MATHJAX_SCRIPT);
    page.push('\n');
    page.push_str(renderer.stylesheet());
    page.push_str("</head>\n<body>\n");

    let _ = writeln!(
        page,
        "<div class=\"status\">Status: {}</div>",
        renderer.plain_text(&snapshot.status)
    );

    page.push_str("<div class=\"thread\">\n");
    for rendered in &snapshot.items {
        let _ = write!(
            page,
            "<div class=\"item {sender}\">\n<div class=\"label\">{label}</div>\n<div class=\"content\">\n{html}</div>\n</div>\n",
            sender = rendered.item.sender(),
            label = rendered.label,
            html = rendered.html,
        );
    }
    page.push_str("</div>\n");

    if !snapshot.debug_log.is_empty() {
        page.push_str("<pre class=\"debug\">");
        page.push_str(&renderer.plain_text(&snapshot.debug_log.join("\n")));
        page.push_str("</pre>\n");
    }

    page.push_str("</body>\n</html>\n");
    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::RenderedItem;
    use crate::thread_item::ThreadItem;

    fn snapshot(status: &str, debug_log: Vec<String>) -> DisplaySnapshot {
        let renderer = Renderer::new();
        let item = ThreadItem::user("**hi**");
        DisplaySnapshot {
            items: vec![RenderedItem {
                label: item.label(),
                html: item.render_html(&renderer),
                item,
            }],
            status: status.to_string(),
            debug_log,
        }
    }

    #[test]
    fn page_contains_stylesheet_status_and_items() {
        let renderer = Renderer::new();
        let page = render_page(&snapshot("Error: <eof>", Vec::new()), &renderer);

        assert!(page.contains(".codehilite .k {"));
        assert!(page.contains("Status: Error: &lt;eof&gt;"));
        assert!(page.contains("<div class=\"item user\">"));
        assert!(page.contains(r"\(\color{green}{user:}\)"));
        assert!(page.contains("<strong>hi</strong>"));
        assert!(!page.contains("class=\"debug\""));
    }

    #[test]
    fn debug_log_is_appended_when_present() {
        let renderer = Renderer::new();
        let page = render_page(
            &snapshot("Idle", vec!["Sending message".to_string(), "Idle".to_string()]),
            &renderer,
        );
        assert!(page.contains("<pre class=\"debug\">Sending message\nIdle</pre>"));
    }
}
