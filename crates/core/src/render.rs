//! Markdown to HTML conversion for thread items.
//!
//! Fenced code blocks are emitted inside `<div class="codehilite">` so that the
//! token classes in [`CodeStylesheet`] apply to them.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::sync::OnceLock;

use pulldown_cmark::{CodeBlockKind, CowStr, Event, Options, Parser, Tag, TagEnd, html};

const FENCE: &str = "```";
const UNKNOWN_TOOL_NAME: &str = "???";

#[derive(Debug, Clone, Copy)]
enum StyleProp {
    Background,
    Border,
    Color,
    FontStyle,
    FontWeight,
}

impl StyleProp {
    const fn css_name(self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::Border => "border",
            Self::Color => "color",
            Self::FontStyle => "font-style",
            Self::FontWeight => "font-weight",
        }
    }
}

use StyleProp::{Background as Bg, Border as Br, Color as C, FontStyle as S, FontWeight as W};

type StyleRule = (&'static str, &'static [(StyleProp, &'static str)]);

// Pygments "default" palette, keyed by short token class.
const CODE_STYLE_RULES: &[StyleRule] = &[
    ("", &[(Bg, "#f8f8f8")]),
    ("bp", &[(C, "#008000")]),
    ("c", &[(C, "#408080"), (S, "italic")]),
    ("c1", &[(C, "#408080"), (S, "italic")]),
    ("ch", &[(C, "#408080"), (S, "italic")]),
    ("cm", &[(C, "#408080"), (S, "italic")]),
    ("cp", &[(C, "#BC7A00")]),
    ("cpf", &[(C, "#408080"), (S, "italic")]),
    ("cs", &[(C, "#408080"), (S, "italic")]),
    ("dl", &[(C, "#BA2121")]),
    ("err", &[(Br, "1px solid #FF0000")]),
    ("fm", &[(C, "#0000FF")]),
    ("gd", &[(C, "#A00000")]),
    ("ge", &[(S, "italic")]),
    ("gh", &[(C, "#000080"), (W, "bold")]),
    ("gi", &[(C, "#00A000")]),
    ("go", &[(C, "#888888")]),
    ("gp", &[(C, "#000080"), (W, "bold")]),
    ("gr", &[(C, "#FF0000")]),
    ("gs", &[(W, "bold")]),
    ("gt", &[(C, "#0044DD")]),
    ("gu", &[(C, "#800080"), (W, "bold")]),
    ("hll", &[(Bg, "#ffffcc")]),
    ("il", &[(C, "#666666")]),
    ("k", &[(C, "#008000"), (W, "bold")]),
    ("kc", &[(C, "#008000"), (W, "bold")]),
    ("kd", &[(C, "#008000"), (W, "bold")]),
    ("kn", &[(C, "#008000"), (W, "bold")]),
    ("kp", &[(C, "#008000")]),
    ("kr", &[(C, "#008000"), (W, "bold")]),
    ("kt", &[(C, "#B00040")]),
    ("m", &[(C, "#666666")]),
    ("mb", &[(C, "#666666")]),
    ("mf", &[(C, "#666666")]),
    ("mh", &[(C, "#666666")]),
    ("mi", &[(C, "#666666")]),
    ("mo", &[(C, "#666666")]),
    ("na", &[(C, "#7D9029")]),
    ("nb", &[(C, "#008000")]),
    ("nc", &[(C, "#0000FF"), (W, "bold")]),
    ("nd", &[(C, "#AA22FF")]),
    ("ne", &[(C, "#D2413A"), (W, "bold")]),
    ("nf", &[(C, "#0000FF")]),
    ("ni", &[(C, "#999999"), (W, "bold")]),
    ("nl", &[(C, "#A0A000")]),
    ("nn", &[(C, "#0000FF"), (W, "bold")]),
    ("no", &[(C, "#880000")]),
    ("nt", &[(C, "#008000"), (W, "bold")]),
    ("nv", &[(C, "#19177C")]),
    ("o", &[(C, "#666666")]),
    ("ow", &[(C, "#AA22FF"), (W, "bold")]),
    ("s", &[(C, "#BA2121")]),
    ("s1", &[(C, "#BA2121")]),
    ("s2", &[(C, "#BA2121")]),
    ("sa", &[(C, "#BA2121")]),
    ("sb", &[(C, "#BA2121")]),
    ("sc", &[(C, "#BA2121")]),
    ("sd", &[(C, "#BA2121"), (S, "italic")]),
    ("se", &[(C, "#BB6622"), (W, "bold")]),
    ("sh", &[(C, "#BA2121")]),
    ("si", &[(C, "#BB6688"), (W, "bold")]),
    ("sr", &[(C, "#BB6688")]),
    ("ss", &[(C, "#19177C")]),
    ("sx", &[(C, "#008000")]),
    ("vc", &[(C, "#19177C")]),
    ("vg", &[(C, "#19177C")]),
    ("vi", &[(C, "#19177C")]),
    ("vm", &[(C, "#19177C")]),
    ("w", &[(C, "#bbbbbb")]),
];

/// `<style>` block for highlighted code, built on first use.
#[derive(Debug, Default)]
pub struct CodeStylesheet {
    css: OnceLock<String>,
}

impl CodeStylesheet {
    pub const fn new() -> Self {
        Self {
            css: OnceLock::new(),
        }
    }

    pub fn css(&self) -> &str {
        self.css.get_or_init(build_code_css)
    }
}

fn build_code_css() -> String {
    let mut css = String::from("<style>\n");
    for (class, props) in CODE_STYLE_RULES {
        css.push_str(".codehilite");
        if !class.is_empty() {
            css.push_str(" .");
            css.push_str(class);
        }
        css.push_str(" { ");
        let declarations = props
            .iter()
            .map(|(prop, value)| format!("{}: {value}", prop.css_name()))
            .collect::<Vec<_>>();
        css.push_str(&declarations.join("; "));
        css.push_str(" }\n");
    }
    css.push_str("</style>\n");
    css
}

/// Converts thread item text into HTML fragments.
#[derive(Debug)]
pub struct Renderer {
    options: Options,
    stylesheet: CodeStylesheet,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub const fn new() -> Self {
        Self {
            options: Options::ENABLE_TABLES,
            stylesheet: CodeStylesheet::new(),
        }
    }

    pub fn stylesheet(&self) -> &str {
        self.stylesheet.css()
    }

    /// Renders free-form markdown, closing a dangling code fence first.
    pub fn markdown(&self, text: &str) -> String {
        let text = close_unterminated_fence(text);
        self.markdown_to_html(&text)
    }

    /// Renders a tool call payload as a labelled JSON block.
    pub fn tool_call(&self, tool_name: Option<&str>, payload: &str) -> String {
        let name = tool_name
            .filter(|name| !name.is_empty())
            .unwrap_or(UNKNOWN_TOOL_NAME);
        let text = format!("### Tool use for: `{name}`\n{FENCE}json\n{payload}\n{FENCE}\n");
        self.markdown_to_html(&text)
    }

    /// Escapes text for inclusion in HTML.
    pub fn plain_text(&self, text: &str) -> String {
        let mut html = String::with_capacity(text.len());
        html::push_html(&mut html, std::iter::once(Event::Text(text.into())));
        html
    }

    /// Renders an error report.
    pub fn error(&self, message: &str) -> String {
        format!(
            "<div class=\"error\"><strong>Error:</strong> {}</div>\n",
            self.plain_text(message)
        )
    }

    fn markdown_to_html(&self, text: &str) -> String {
        let events = Parser::new_ext(text, self.options).map(|event| match event {
            Event::Start(Tag::CodeBlock(kind)) => Event::Html(open_code_block(&kind).into()),
            Event::End(TagEnd::CodeBlock) => {
                Event::Html(CowStr::Borrowed("</code></pre></div>\n"))
            }
            other => other,
        });

        let mut output = String::with_capacity(text.len() * 3 / 2);
        html::push_html(&mut output, events);
        output
    }
}

fn open_code_block(kind: &CodeBlockKind<'_>) -> String {
    let language = match kind {
        CodeBlockKind::Fenced(info) => info
            .split_whitespace()
            .next()
            .map(|lang| {
                lang.chars()
                    .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '+'))
                    .collect::<String>()
            })
            .filter(|lang| !lang.is_empty()),
        CodeBlockKind::Indented => None,
    };

    let mut html = String::from("<div class=\"codehilite\"><pre><code");
    if let Some(language) = language {
        let _ = write!(html, " class=\"language-{language}\"");
    }
    html.push('>');
    html
}

/// Fence markers may be indented by up to three spaces; deeper lines are indented code.
fn is_fence_line(line: &str) -> bool {
    let body = line.trim_start_matches(' ');
    line.len() - body.len() <= 3 && body.starts_with(FENCE)
}

fn fence_line_count(text: &str) -> usize {
    text.lines().filter(|line| is_fence_line(line)).count()
}

/// Appends a closing fence when `text` has an odd number of fence lines.
pub fn close_unterminated_fence(text: &str) -> Cow<'_, str> {
    if fence_line_count(text) % 2 == 0 {
        return Cow::Borrowed(text);
    }

    let mut repaired = String::with_capacity(text.len() + FENCE.len() + 2);
    repaired.push_str(text);
    repaired.push('\n');
    repaired.push_str(FENCE);
    repaired.push('\n');
    Cow::Owned(repaired)
}
