//! Address normalization: encoding repair, structural parsing, cache keys.
//!
//! Input addresses come from directory-style exports in wildly inconsistent
//! shapes; embedded contact names, "Box 45"-style postal boxes, missing
//! house numbers, UTF-8 text that went through a Latin-1 round trip. Every
//! raw string passes through here exactly once before any lookup.

use crate::types::ParsedAddress;

/// UTF-8 Swedish text mis-decoded as Latin-1 leaves these fixed two-byte
/// sequences. Applied to registry fields at load and to every raw address.
const ENCODING_FIXES: &[(&str, &str)] = &[
    ("Ã¥", "å"),
    ("Ã…", "Å"),
    ("Ã¤", "ä"),
    ("Ã„", "Ä"),
    ("Ã¶", "ö"),
    ("Ã–", "Ö"),
    ("Ã©", "é"),
    ("Ã‰", "É"),
    ("Ã¨", "è"),
    ("Ã ", "à"),
];

/// Localities recognized in the Göteborg area. Substring-matched
/// case-insensitively; anything else falls back to the configured default.
const KNOWN_LOCALITIES: &[&str] = &[
    "Göteborg",
    "Mölndal",
    "Partille",
    "Angered",
    "Västra Frölunda",
    "Hisings Backa",
    "Torslanda",
];

/// Repair common mojibake sequences in Swedish text.
pub fn repair_encoding(s: &str) -> String {
    let mut out = s.to_string();
    for (wrong, right) in ENCODING_FIXES {
        if out.contains(wrong) {
            out = out.replace(wrong, right);
        }
    }
    out
}

/// Parse a raw address string into structured fields.
///
/// Always succeeds; an empty or hopeless input comes back with all fields
/// empty. `default_locality` is used when no known locality appears in the
/// string.
pub fn parse_address(raw: &str, default_locality: &str) -> ParsedAddress {
    let address = repair_encoding(raw.trim());
    if address.is_empty() {
        return ParsedAddress::default();
    }

    // Box addresses short-circuit street parsing entirely; postcode and
    // locality are still pulled from the remainder of the string.
    if let Some(box_number) = detect_box(&address) {
        return ParsedAddress {
            street: String::new(),
            number: String::new(),
            postcode: extract_postcode(&address),
            locality: extract_locality(&address, default_locality),
            is_box: true,
            box_number,
        };
    }

    // Directory exports embed a contact name between street and postcode:
    // "Storgatan 1, Anna Svensson, 411 28, Göteborg". With four or more
    // comma parts, the second is a name: drop it and rebuild.
    let parts: Vec<String> = address.split(',').map(|p| p.trim().to_string()).collect();
    let address = if parts.len() >= 4 {
        format!("{}, {}, {}", parts[0], parts[2], parts[3])
    } else {
        address
    };
    let street_part = parts.first().map(String::as_str).unwrap_or("");

    let (street, number) = split_street_number(street_part);

    ParsedAddress {
        street,
        number,
        postcode: extract_postcode(&address),
        locality: extract_locality(&address, default_locality),
        is_box: false,
        box_number: String::new(),
    }
}

/// Detect a "box"-style address: the word `box` (any case) followed by
/// digits. Returns the box number.
fn detect_box(address: &str) -> Option<String> {
    let lower = address.to_lowercase();
    let bytes = lower.as_bytes();
    let mut start = 0;
    while let Some(pos) = lower[start..].find("box") {
        let at = start + pos;
        // Word boundary on the left.
        let left_ok = at == 0 || !bytes[at - 1].is_ascii_alphanumeric();
        let mut rest = lower[at + 3..].chars().peekable();
        // Optional whitespace between keyword and digits.
        while matches!(rest.peek(), Some(c) if c.is_whitespace()) {
            rest.next();
        }
        let digits: String = rest.take_while(|c| c.is_ascii_digit()).collect();
        if left_ok && !digits.is_empty() {
            return Some(digits);
        }
        start = at + 3;
    }
    None
}

/// First `3 digits + optional space + 2 digits` run, normalized to five
/// digits (Swedish postcode shape, "412 76" or "41276").
fn extract_postcode(address: &str) -> String {
    let chars: Vec<char> = address.chars().collect();
    let n = chars.len();
    for i in 0..n {
        if !chars[i].is_ascii_digit() {
            continue;
        }
        if i + 4 < n && chars[i..i + 5].iter().all(|c| c.is_ascii_digit()) {
            return chars[i..i + 5].iter().collect();
        }
        if i + 5 < n
            && chars[i..i + 3].iter().all(|c| c.is_ascii_digit())
            && chars[i + 3] == ' '
            && chars[i + 4..i + 6].iter().all(|c| c.is_ascii_digit())
        {
            let mut pc: String = chars[i..i + 3].iter().collect();
            pc.extend(chars[i + 4..i + 6].iter());
            return pc;
        }
    }
    String::new()
}

/// Match the string against the known-locality catalog, case-insensitively.
fn extract_locality(address: &str, default_locality: &str) -> String {
    let lower = address.to_lowercase();
    for locality in KNOWN_LOCALITIES {
        if lower.contains(&locality.to_lowercase()) {
            return (*locality).to_string();
        }
    }
    default_locality.to_string()
}

/// Split a street segment into name and house number. The number is the
/// trailing token of digits with an optional letter suffix ("12", "12A",
/// "12 A"). No trailing number leaves the number empty.
fn split_street_number(street_part: &str) -> (String, String) {
    let tokens: Vec<&str> = street_part.split_whitespace().collect();
    if tokens.len() < 2 {
        return (street_part.trim().to_string(), String::new());
    }

    let last = tokens[tokens.len() - 1];
    let prev = tokens[tokens.len() - 2];

    // "Storgatan 12 A"; detached single-letter suffix.
    if tokens.len() >= 3
        && last.len() == 1
        && last.chars().all(|c| c.is_ascii_alphabetic())
        && prev.chars().all(|c| c.is_ascii_digit())
    {
        let street = tokens[..tokens.len() - 2].join(" ");
        return (street, format!("{} {}", prev, last));
    }

    if is_house_number(last) {
        let street = tokens[..tokens.len() - 1].join(" ");
        return (street, last.to_string());
    }

    (street_part.trim().to_string(), String::new())
}

/// Digits with at most one trailing letter, e.g. "12" or "12A".
fn is_house_number(token: &str) -> bool {
    let chars: Vec<char> = token.chars().collect();
    match chars.split_last() {
        Some((last, rest)) if last.is_ascii_alphabetic() => {
            !rest.is_empty() && rest.iter().all(|c| c.is_ascii_digit())
        }
        _ => !chars.is_empty() && chars.iter().all(|c| c.is_ascii_digit()),
    }
}

/// Derive the canonical cache key for an address or query string.
///
/// Lower-cased, commas and periods stripped, the standalone word "gatan"
/// abbreviated to "g", whitespace collapsed. Two semantically identical
/// addresses must map to the same key; this is the unit of caching and
/// batch deduplication.
pub fn cache_key(raw: &str) -> String {
    let repaired = repair_encoding(raw);
    let lowered = repaired.trim().to_lowercase();
    let stripped: String = lowered.chars().filter(|c| *c != ',' && *c != '.').collect();
    stripped
        .split_whitespace()
        .map(|tok| if tok == "gatan" { "g" } else { tok })
        .collect::<Vec<_>>()
        .join(" ")
}
