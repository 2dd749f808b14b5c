use crate::task::LineInfo;
use crate::term::{self, RESET};

/// Minimum cells the title field occupies, so messages line up across rows.
const TITLE_CELLS: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Status,
    Title,
    Msg,
    Spinner,
    Eta,
    Split,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Field(Field),
    Reset,
}

/// A compiled line format. Placeholders are `{status}`, `{title}`, `{msg}`,
/// `{spinner}`, `{eta}`, `{split}` and `{/}` (attribute reset); everything
/// else is literal text.
#[derive(Debug, Clone)]
pub struct LineTemplate {
    segments: Vec<Segment>,
}

impl LineTemplate {
    pub fn compile(format: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = format;

        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}') else {
                break;
            };
            literal.push_str(&rest[..open]);
            let name = &rest[open + 1..open + close];
            let seg = match name {
                "status" => Some(Segment::Field(Field::Status)),
                "title" => Some(Segment::Field(Field::Title)),
                "msg" => Some(Segment::Field(Field::Msg)),
                "spinner" => Some(Segment::Field(Field::Spinner)),
                "eta" => Some(Segment::Field(Field::Eta)),
                "split" => Some(Segment::Field(Field::Split)),
                "/" => Some(Segment::Reset),
                _ => None,
            };
            match seg {
                Some(seg) => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(seg);
                }
                None => {
                    // Unknown placeholder: keep it verbatim.
                    literal.push_str(&rest[open..open + close + 1]);
                }
            }
            rest = &rest[open + close + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self { segments }
    }

    pub fn render(&self, info: &LineInfo) -> String {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Reset => out.push_str(RESET),
                Segment::Field(Field::Status) => out.push_str(info.status),
                Segment::Field(Field::Msg) => out.push_str(&info.msg),
                Segment::Field(Field::Eta) => out.push_str(&info.eta),
                Segment::Field(Field::Split) => out.push_str(&info.split),
                Segment::Field(Field::Spinner) => {
                    // Always one cell, so rows do not shift as it appears.
                    if info.spinner.is_empty() {
                        out.push(' ');
                    } else {
                        out.push_str(&info.spinner);
                    }
                }
                Segment::Field(Field::Title) => {
                    out.push_str(&info.title);
                    let used = term::visual_length(&info.title);
                    for _ in used..TITLE_CELLS {
                        out.push(' ');
                    }
                }
            }
        }
        out
    }
}

/// Which of the three line variants a task renders with. The variants are
/// data (leading tree glyphs), not behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemplateKind {
    #[default]
    Default,
    Parallel,
    LastParallel,
}

#[derive(Debug, Clone)]
pub struct Templates {
    default_line: LineTemplate,
    parallel: LineTemplate,
    last_parallel: LineTemplate,
}

impl Templates {
    pub fn standard() -> Self {
        Self {
            default_line: LineTemplate::compile(" {status}●{/} {spinner} {title} {msg}{split}{eta}"),
            parallel: LineTemplate::compile(" {status}├─●{/} {spinner} {title} {msg}{split}{eta}"),
            last_parallel: LineTemplate::compile(
                " {status}└─●{/} {spinner} {title} {msg}{split}{eta}",
            ),
        }
    }

    pub fn get(&self, kind: TemplateKind) -> &LineTemplate {
        match kind {
            TemplateKind::Default => &self.default_line,
            TemplateKind::Parallel => &self.parallel,
            TemplateKind::LastParallel => &self.last_parallel,
        }
    }
}

/// Renders one display line at exactly `width` cells (when `width` > 0).
///
/// Three passes: measure the fixed portion with an empty message and split,
/// trim the message to what fits (ellipsis when cut), then size the split so
/// the ETA lands flush right.
pub fn compose_line(info: &LineInfo, tpl: &LineTemplate, width: usize) -> String {
    let mut probe = info.clone();
    probe.split.clear();
    probe.msg.clear();
    let fixed = term::visual_length(&tpl.render(&probe));

    let mut msg = info.msg.clone();
    if width > 0 {
        let max_msg = width.saturating_sub(fixed);
        if term::visual_length(&msg) > max_msg {
            let keep = term::trim_to_visual_length(&msg, max_msg.saturating_sub(3));
            msg = format!("{keep}{RESET}...");
        }
    }
    probe.msg = msg;

    let rendered = term::visual_length(&tpl.render(&probe));
    let split_width = width.saturating_sub(rendered);
    probe.split = " ".repeat(split_width);
    tpl.render(&probe)
}
