//! Text shaping for inbound content, chat names and derived nicknames.

use sha2::{Digest, Sha256};
use unicode_segmentation::UnicodeSegmentation;

use crate::error::ActionError;

pub const MAX_MESSAGE_GRAPHEMES: usize = 2000;
pub const MAX_CHAT_NAME_LEN: usize = 12;
const SHORT_PUBKEY_LEN: usize = 4;

/// Cut `s` to at most `max` grapheme clusters, appending `...` when cut.
pub fn truncate_graphemes(s: &str, max: usize) -> String {
    match s.grapheme_indices(true).nth(max) {
        Some((byte_idx, _)) => format!("{}...", &s[..byte_idx]),
        None => s.to_string(),
    }
}

fn is_invisible_format(c: char) -> bool {
    matches!(
        c as u32,
        0x200B..=0x200F | 0x202A..=0x202E | 0x2060..=0x206F | 0xFEFF | 0xFE0E | 0xFE0F
    )
}

fn is_regional_indicator(c: char) -> bool {
    matches!(c as u32, 0x1F1E6..=0x1F1FF)
}

/// Strip control and bidi/format characters and collapse every composed
/// grapheme cluster to a single visible cell, so one cluster never renders
/// wider than what the terminal accounts for.
pub fn sanitize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for cluster in s.graphemes(true) {
        let mut kept = cluster
            .chars()
            .filter(|c| !c.is_control() && !is_invisible_format(*c));
        let Some(first) = kept.next() else {
            continue;
        };
        let composed = kept.next().is_some();
        if is_regional_indicator(first) {
            out.push('?');
        } else {
            out.push(first);
            if composed {
                out.push('?');
            }
        }
    }
    out
}

/// Lowercase, collapse whitespace/dash runs to one `-`, trim dashes and
/// reject any other punctuation. Length is counted in characters.
pub fn normalize_chat_name(name: &str) -> Result<String, ActionError> {
    let mut out = String::with_capacity(name.len());
    let mut last_was_dash = false;
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            out.push(c);
            last_was_dash = false;
        } else if c.is_whitespace() || c == '-' {
            if !last_was_dash {
                out.push('-');
                last_was_dash = true;
            }
        } else {
            return Err(ActionError::InvalidChatCharacter(c));
        }
    }
    let trimmed = out.trim_matches('-').to_string();
    if trimmed.chars().count() > MAX_CHAT_NAME_LEN {
        return Err(ActionError::ChatNameTooLong(trimmed));
    }
    Ok(trimmed)
}

const TOKI_PONA_NOUNS: [&str; 75] = [
    "ijo", "ilo", "insa", "jan", "jelo", "jo", "kala", "kalama", "kasi", "ken", "kili", "kiwen",
    "ko", "kon", "kulupu", "lape", "laso", "lawa", "len", "lili", "linja", "lipu", "loje", "luka",
    "lukin", "lupa", "ma", "mama", "mani", "meli", "mije", "moku", "moli", "monsi", "mun", "musi",
    "mute", "nanpa", "nasin", "nena", "nimi", "noka", "oko", "olin", "open", "pakala", "pali",
    "palisa", "pan", "pilin", "pipi", "poki", "pona", "selo", "sewi", "sijelo", "sike", "sitelen",
    "sona", "soweli", "suli", "suno", "supa", "suwi", "telo", "tenpo", "toki", "tomo", "unpa",
    "uta", "utala", "waso", "wawa", "weka", "wile",
];

/// Deterministic three-word nickname for a pubkey that sent no `n` tag.
pub fn derived_nick(pubkey_hex: &str) -> String {
    let digest = Sha256::digest(pubkey_hex.as_bytes());
    let word = |b: u8| TOKI_PONA_NOUNS[b as usize % TOKI_PONA_NOUNS.len()];
    format!("{}-{}-{}", word(digest[0]), word(digest[1]), word(digest[2]))
}

/// Last four hex characters of a pubkey, used in `@nick#abcd` handles.
pub fn short_pubkey(pubkey_hex: &str) -> String {
    let start = pubkey_hex.len().saturating_sub(SHORT_PUBKEY_LEN);
    pubkey_hex[start..].to_string()
}

/// Last four hex characters of an event id.
pub fn short_event_id(id_hex: &str) -> String {
    short_pubkey(id_hex)
}

pub fn user_handle(nick: &str, short_pk: &str) -> String {
    format!("@{nick}#{short_pk}")
}
