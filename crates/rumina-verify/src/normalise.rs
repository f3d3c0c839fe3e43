//! Text normalisation shared by candidates and source documents.
//!
//! Both sides of every comparison go through `normalise`, so spelling drift
//! that is purely typographic (case, Greek letters, dash variants, entity
//! escapes, line breaks) never causes a false rejection.

use regex::Regex;

/// Greek letters and typographic variants folded to ASCII.
fn fold_char(ch: char) -> Option<&'static str> {
    match ch {
        'α' => Some("alpha"), 'β' => Some("beta"),   'γ' => Some("gamma"),
        'δ' => Some("delta"), 'ε' => Some("epsilon"), 'κ' => Some("kappa"),
        'λ' => Some("lambda"), 'μ' => Some("mu"),    'π' => Some("pi"),
        'σ' => Some("sigma"), 'τ' => Some("tau"),    'ω' => Some("omega"),
        '‐' | '‑' | '‒' | '–' | '—' | '−' => Some("-"),
        '‘' | '’' | '′' => Some("'"),
        '“' | '”' | '″' => Some("\""),
        '\u{00a0}' => Some(" "),
        _ => None,
    }
}

fn entity_regex() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"&(#[xX][0-9a-fA-F]{1,6}|#[0-9]{1,7}|amp|lt|gt|quot|apos|nbsp);")
            .expect("static entity regex")
    })
}

/// Unescape the HTML/XML character references that survive in article dumps.
pub fn unescape_entities(text: &str) -> std::borrow::Cow<'_, str> {
    if !text.contains('&') {
        return std::borrow::Cow::Borrowed(text);
    }
    entity_regex().replace_all(text, |caps: &regex::Captures<'_>| {
        let body = &caps[1];
        let decoded = match body {
            "amp"  => Some('&'),
            "lt"   => Some('<'),
            "gt"   => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            _ if body.starts_with("#x") || body.starts_with("#X") => {
                u32::from_str_radix(&body[2..], 16).ok().and_then(char::from_u32)
            }
            _ => body[1..].parse::<u32>().ok().and_then(char::from_u32),
        };
        decoded.map(String::from).unwrap_or_else(|| caps[0].to_string())
    })
}

/// Lowercase, fold Greek/dash/quote variants, unescape entities, collapse whitespace.
pub fn normalise(text: &str) -> String {
    let unescaped = unescape_entities(text);
    let lowered = unescaped.to_lowercase();

    let mut folded = String::with_capacity(lowered.len());
    for ch in lowered.chars() {
        match fold_char(ch) {
            Some(s) => folded.push_str(s),
            None => folded.push(ch),
        }
    }
    collapse_whitespace(&folded)
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hyphens read as word separators: "3-nitrooxypropanol" → "3 nitrooxypropanol".
pub fn hyphens_to_spaces(normalised: &str) -> String {
    collapse_whitespace(&normalised.replace('-', " "))
}

/// Hyphens removed, word boundaries kept: "nitrooxy-propanol" → "nitrooxypropanol".
pub fn compact(normalised: &str) -> String {
    collapse_whitespace(&normalised.replace('-', ""))
}

/// Alphanumeric runs of a normalised string, in order.
pub fn words(normalised: &str) -> impl Iterator<Item = &str> {
    normalised
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
}
