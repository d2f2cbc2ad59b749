use std::sync::atomic::{AtomicU64, Ordering};

const HEX: &[u8; 16] = b"0123456789abcdef";
const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

pub(crate) fn next_generated_id(prefix: &str, counter: &AtomicU64) -> String {
    let id = counter.fetch_add(1, Ordering::Relaxed);
    let mut out = String::with_capacity(prefix.len() + 17);
    out.push_str(prefix);
    out.push('-');
    push_u64_hex_16(&mut out, id);
    out
}

/// Strip an optional SSE `data: ` prefix from an NDJSON line.
#[inline]
pub(crate) fn strip_sse_data_prefix(line: &str) -> &str {
    line.strip_prefix("data: ").unwrap_or(line)
}

/// Percent-encode every byte outside the RFC 3986 unreserved set, so the
/// result is safe to embed as a single path segment.
pub(crate) fn percent_encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 16);
    for &byte in value.as_bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(char::from(byte));
        } else {
            out.push('%');
            out.push(char::from(HEX_UPPER[usize::from(byte >> 4)]));
            out.push(char::from(HEX_UPPER[usize::from(byte & 0x0f)]));
        }
    }
    out
}

#[inline]
pub(crate) fn push_u32_hex_8(out: &mut String, value: u32) {
    for shift in (0..8).rev() {
        let nibble = usize::try_from((value >> (shift * 4)) & 0x0f).unwrap_or(0);
        out.push(char::from(HEX[nibble]));
    }
}

#[inline]
fn push_u64_hex_16(out: &mut String, mut value: u64) {
    let mut buf = [b'0'; 16];
    let mut idx = 16;
    while idx > 0 {
        idx -= 1;
        let nibble = usize::try_from(value & 0x0f).unwrap_or(0);
        buf[idx] = HEX[nibble];
        value >>= 4;
    }
    for byte in buf {
        out.push(char::from(byte));
    }
}

/// Truncate `text` to at most `max_bytes`, backing off to a char boundary.
pub(crate) fn truncate_on_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
