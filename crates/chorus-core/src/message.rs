//! Payload handling for relayed messages.
//!
//! The wire contract is opaque text with no envelope. Inbound payloads are
//! flattened to a single line before relay so that the writer can batch
//! several of them into one frame separated by `\n`.

use bytes::{BufMut, Bytes, BytesMut};

/// Separator between coalesced payloads in one outbound frame.
pub const SEPARATOR: u8 = b'\n';

/// Normalize an inbound payload: every newline becomes a space, then
/// leading and trailing whitespace is trimmed.
///
/// Valid UTF-8 is trimmed on Unicode whitespace. Anything else falls back to
/// ASCII whitespace at the byte level. The result never contains
/// [`SEPARATOR`].
#[must_use]
pub fn normalize(payload: &[u8]) -> Bytes {
    let trimmed = match std::str::from_utf8(payload) {
        Ok(text) => text.trim_matches(char::is_whitespace).as_bytes(),
        Err(_) => trim_ascii(payload),
    };

    if !trimmed.contains(&SEPARATOR) {
        return Bytes::copy_from_slice(trimmed);
    }

    trimmed
        .iter()
        .map(|&b| if b == SEPARATOR { b' ' } else { b })
        .collect::<Vec<u8>>()
        .into()
}

// A newline turns into a space before trimming, so it trims the same way.
fn trim_ascii(payload: &[u8]) -> &[u8] {
    let is_space = |b: &u8| b.is_ascii_whitespace() || *b == 0x0b;
    let start = payload
        .iter()
        .position(|b| !is_space(b))
        .unwrap_or(payload.len());
    let end = payload
        .iter()
        .rposition(|b| !is_space(b))
        .map_or(start, |i| i + 1);
    &payload[start..end]
}

/// Join `first` and every payload in `rest` into one frame body.
#[must_use]
pub fn coalesce<I>(first: Bytes, rest: I) -> Bytes
where
    I: IntoIterator<Item = Bytes>,
{
    let mut rest = rest.into_iter().peekable();
    if rest.peek().is_none() {
        return first;
    }

    let mut buf = BytesMut::from(&first[..]);
    for payload in rest {
        buf.put_u8(SEPARATOR);
        buf.extend_from_slice(&payload);
    }
    buf.freeze()
}
