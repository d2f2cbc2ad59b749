use std::hash::{Hash, Hasher};

use memchr::{memchr, memchr3, memmem};
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use serde_json::{Map, Value};

use crate::util::push_u32_hex_8;

// Control-markup filter for model text.
//
// The model interleaves two kinds of markup with the answer text:
// - reasoning blocks: `<thinking>…</thinking>`; removed from the text. Tool
//   calls written inside one are still extracted.
// - tool-call XML: `<__function=NAME>` (or `<function=NAME>`) wrapping
//   `<__parameter=KEY>VALUE</__parameter>` elements; removed from the text and
//   surfaced as extracted tool calls.
//
// Every call re-renders the whole accumulated text and returns only the part of
// the rendering past the sent cursor. Rendering is prefix-stable: appending
// input never changes bytes that were already rendered, it can only extend the
// rendering, so the cursor stays valid.

const REASONING_TAG: (&str, &str) = ("<thinking>", "</thinking>");
const FUNCTION_TAGS: [(&str, &str); 2] = [
    ("<__function=", "</__function>"),
    ("<function=", "</function>"),
];
const PARAMETER_TAGS: [(&str, &str); 2] = [
    ("<__parameter=", "</__parameter>"),
    ("<parameter=", "</parameter>"),
];
const STRAY_PARAMETER: (&str, &str) = PARAMETER_TAGS[0];
const STRAY_CLOSERS: [&str; 2] = ["</__parameter>", "</__function>"];

/// A tool call recovered from tool-call XML in the text stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// How the text starting at a `<` is treated.
enum Markup<'a> {
    /// Plain text; the `<` is kept.
    Text,
    /// Remove this many bytes.
    Remove(usize),
    /// A reasoning block. `len` is `None` while its close tag is missing,
    /// in which case everything from here on is withheld.
    Reasoning { body: &'a str, len: Option<usize> },
    /// A complete tool-call block of `len` bytes.
    Function {
        name: &'a str,
        body: &'a str,
        len: usize,
    },
    /// Undecided until more input arrives; nothing from here on is rendered.
    Withhold,
}

struct FunctionBlock<'a> {
    name: &'a str,
    body: &'a str,
}

/// Per-stream filter state.
#[derive(Debug, Default)]
pub struct MarkupFilter {
    raw: String,
    rendered: String,
    sent: usize,
    seen_ids: FxHashSet<String>,
    extracted: Vec<ExtractedToolCall>,
}

impl MarkupFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `text` and return the newly visible text, if any.
    pub fn filter(&mut self, text: &str) -> Option<String> {
        self.raw.push_str(text);

        let mut rendered = std::mem::take(&mut self.rendered);
        let mut blocks = Vec::new();
        render(&self.raw, &mut rendered, &mut blocks);
        collect_tool_calls(&blocks, &mut self.seen_ids, &mut self.extracted);
        self.rendered = rendered;

        let fresh = self.rendered.get(self.sent..)?;
        if fresh.is_empty() {
            return None;
        }
        let fresh = fresh.to_string();
        self.sent = self.rendered.len();
        Some(fresh)
    }

    /// Drain the tool calls extracted since the last call.
    pub fn take_tool_calls(&mut self) -> Vec<ExtractedToolCall> {
        std::mem::take(&mut self.extracted)
    }

    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.extracted.is_empty()
    }

    /// Bytes of input that were never rendered (withheld or markup).
    #[must_use]
    pub fn unrendered_len(&self) -> usize {
        self.raw.len().saturating_sub(self.rendered.len())
    }
}

/// Queue every block not extracted before. Identical blocks are told apart
/// by their occurrence ordinal, which is stable because rendering is.
fn collect_tool_calls(
    blocks: &[FunctionBlock<'_>],
    seen_ids: &mut FxHashSet<String>,
    extracted: &mut Vec<ExtractedToolCall>,
) {
    if blocks.is_empty() {
        return;
    }
    let mut occurrences: FxHashMap<(&str, u32), u32> = FxHashMap::default();
    for block in blocks {
        let digest = body_digest(block.body);
        let ordinal = occurrences.entry((block.name, digest)).or_insert(0);
        *ordinal += 1;

        let id = tool_call_id(block.name, digest, *ordinal);
        if seen_ids.contains(&id) {
            continue;
        }
        seen_ids.insert(id.clone());
        extracted.push(ExtractedToolCall {
            id,
            name: block.name.to_string(),
            input: Value::Object(parse_parameters(block.body)),
        });
    }
}

fn render<'a>(raw: &'a str, out: &mut String, blocks: &mut Vec<FunctionBlock<'a>>) {
    out.clear();
    let bytes = raw.as_bytes();
    let mut copied_up_to = 0;
    let mut scan_from = 0;
    while let Some(rel) = memchr(b'<', &bytes[scan_from..]) {
        let at = scan_from + rel;
        match classify(&raw[at..]) {
            Markup::Text => {
                scan_from = at + 1;
            }
            Markup::Remove(len) => {
                out.push_str(&raw[copied_up_to..at]);
                copied_up_to = at + len;
                scan_from = copied_up_to;
            }
            Markup::Reasoning { body, len } => {
                out.push_str(&raw[copied_up_to..at]);
                nested_function_blocks(body, blocks);
                let Some(len) = len else {
                    return;
                };
                copied_up_to = at + len;
                scan_from = copied_up_to;
            }
            Markup::Function { name, body, len } => {
                out.push_str(&raw[copied_up_to..at]);
                blocks.push(FunctionBlock { name, body });
                copied_up_to = at + len;
                scan_from = copied_up_to;
            }
            Markup::Withhold => {
                out.push_str(&raw[copied_up_to..at]);
                return;
            }
        }
    }
    out.push_str(&raw[copied_up_to..]);
}

fn classify(rest: &str) -> Markup<'_> {
    let (open, close) = REASONING_TAG;
    if let Some(inner) = rest.strip_prefix(open) {
        return match find(inner, close) {
            Some(pos) => Markup::Reasoning {
                body: &inner[..pos],
                len: Some(open.len() + pos + close.len()),
            },
            None => Markup::Reasoning {
                body: inner,
                len: None,
            },
        };
    }

    for (open, close) in FUNCTION_TAGS {
        if rest.starts_with(open) {
            return match named_element(rest, open, close) {
                NamedElement::Complete { name, body, len } => Markup::Function { name, body, len },
                NamedElement::Incomplete => Markup::Withhold,
                NamedElement::NotMarkup => Markup::Text,
            };
        }
    }

    let (open, close) = STRAY_PARAMETER;
    if rest.starts_with(open) {
        return match named_element(rest, open, close) {
            NamedElement::Complete { len, .. } => Markup::Remove(len),
            NamedElement::Incomplete => Markup::Withhold,
            NamedElement::NotMarkup => Markup::Text,
        };
    }

    for closer in STRAY_CLOSERS {
        if rest.starts_with(closer) {
            return Markup::Remove(closer.len());
        }
    }

    if is_partial_tag(rest) {
        Markup::Withhold
    } else {
        Markup::Text
    }
}

enum NamedElement<'a> {
    Complete {
        name: &'a str,
        body: &'a str,
        len: usize,
    },
    Incomplete,
    NotMarkup,
}

/// Parse `<OPEN NAME>BODY CLOSE` at the start of `rest`. Names end at `>` and
/// may not be empty or contain `<` or a newline.
fn named_element<'a>(rest: &'a str, open: &str, close: &str) -> NamedElement<'a> {
    let after_open = &rest[open.len()..];
    let Some(pos) = memchr3(b'>', b'<', b'\n', after_open.as_bytes()) else {
        return NamedElement::Incomplete;
    };
    if pos == 0 || after_open.as_bytes()[pos] != b'>' {
        return NamedElement::NotMarkup;
    }
    let name = &after_open[..pos];
    let body_start = open.len() + pos + 1;
    match find(&rest[body_start..], close) {
        Some(body_len) => NamedElement::Complete {
            name,
            body: &rest[body_start..body_start + body_len],
            len: body_start + body_len + close.len(),
        },
        None => NamedElement::Incomplete,
    }
}

/// Complete function blocks inside a reasoning body, in order. An unclosed
/// body only grows, so blocks found early keep their position.
fn nested_function_blocks<'a>(body: &'a str, blocks: &mut Vec<FunctionBlock<'a>>) {
    let bytes = body.as_bytes();
    let mut scan_from = 0;
    while let Some(rel) = memchr(b'<', &bytes[scan_from..]) {
        let at = scan_from + rel;
        let rest = &body[at..];
        let complete = FUNCTION_TAGS.iter().find_map(|&(open, close)| {
            if !rest.starts_with(open) {
                return None;
            }
            match named_element(rest, open, close) {
                NamedElement::Complete { name, body, len } => Some((name, body, len)),
                NamedElement::Incomplete | NamedElement::NotMarkup => None,
            }
        });
        match complete {
            Some((name, body, len)) => {
                blocks.push(FunctionBlock { name, body });
                scan_from = at + len;
            }
            None => scan_from = at + 1,
        }
    }
}

/// True when `rest` runs to the end of input and could still grow into one
/// of the recognized tags.
fn is_partial_tag(rest: &str) -> bool {
    let is_prefix_of = |tag: &str| rest.len() < tag.len() && tag.starts_with(rest);
    is_prefix_of(REASONING_TAG.0)
        || FUNCTION_TAGS.iter().any(|&(open, _)| is_prefix_of(open))
        || is_prefix_of(STRAY_PARAMETER.0)
        || STRAY_CLOSERS.iter().any(|&closer| is_prefix_of(closer))
}

#[inline]
fn find(haystack: &str, needle: &str) -> Option<usize> {
    memmem::find(haystack.as_bytes(), needle.as_bytes())
}

fn body_digest(body: &str) -> u32 {
    let mut hasher = FxHasher::default();
    body.hash(&mut hasher);
    let hash = hasher.finish();
    // Fold to 32 bits; ids only need to be stable within one stream.
    u32::try_from((hash ^ (hash >> 32)) & 0xffff_ffff).unwrap_or(0)
}

fn tool_call_id(name: &str, digest: u32, ordinal: u32) -> String {
    let mut id = String::with_capacity(name.len() + 16);
    id.push_str("xml-");
    id.push_str(name);
    id.push('-');
    push_u32_hex_8(&mut id, digest);
    if ordinal > 1 {
        id.push('-');
        id.push_str(&ordinal.to_string());
    }
    id
}

/// Collect `<__parameter=KEY>VALUE</__parameter>` (or the single-underscore
/// form) elements from a function body. Later duplicates of a key win.
fn parse_parameters(body: &str) -> Map<String, Value> {
    let mut params = Map::new();
    let bytes = body.as_bytes();
    let mut scan_from = 0;
    while let Some(rel) = memchr(b'<', &bytes[scan_from..]) {
        let at = scan_from + rel;
        let rest = &body[at..];
        let parsed = PARAMETER_TAGS.iter().find_map(|&(open, close)| {
            if !rest.starts_with(open) {
                return None;
            }
            match named_element(rest, open, close) {
                NamedElement::Complete { name, body, len } => Some((name, body, len)),
                NamedElement::Incomplete | NamedElement::NotMarkup => None,
            }
        });
        match parsed {
            Some((key, value, len)) => {
                params.insert(key.to_string(), parameter_value(value));
                scan_from = at + len;
            }
            None => scan_from = at + 1,
        }
    }
    params
}

fn parameter_value(raw: &str) -> Value {
    let trimmed = raw.trim_start();
    if trimmed.starts_with(['{', '[', '"']) {
        if let Ok(value) = serde_json::from_str(raw) {
            return value;
        }
    }
    Value::String(raw.to_string())
}
