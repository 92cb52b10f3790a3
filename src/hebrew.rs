//! Hebrew text cleanup and measurement shared by the resolver, the
//! similarity index, and the LLM output validators.

/// Strip markup, cantillation, and short parenthesized inserts from one
/// upstream leaf string. The result is what the rest of the pipeline
/// treats as the fragment text.
pub fn clean_fragment_text(input: &str) -> String {
    let text = strip_markup(input);
    let text = strip_cantillation(&text);
    let text = strip_short_parentheticals(&text);
    text.trim().to_owned()
}

/// Remove HTML/XML tags. Unterminated tags are dropped to end of input,
/// matching how the upstream embeds footnote markers.
pub fn strip_markup(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

/// Drop the cantillation/pointing block U+0591..=U+05C7.
pub fn strip_cantillation(input: &str) -> String {
    input
        .chars()
        .filter(|ch| !('\u{0591}'..='\u{05C7}').contains(ch))
        .collect()
}

/// Remove parenthesized inserts of 1..=5 characters (editorial glosses
/// like sourcing sigla). Longer parentheticals are substantive text and
/// stay.
pub fn strip_short_parentheticals(input: &str) -> String {
    let chars = input.chars().collect::<Vec<_>>();
    let mut out = String::with_capacity(input.len());
    let mut i = 0usize;

    while i < chars.len() {
        if chars[i] == '(' {
            let close = chars[i + 1..].iter().position(|&c| c == ')');
            if let Some(rel) = close {
                let inner_len = rel;
                if (1..=5).contains(&inner_len) {
                    i += rel + 2;
                    continue;
                }
            }
        }
        out.push(chars[i]);
        i += 1;
    }

    out
}

/// Normalization applied before similarity tokenization: markup and
/// cantillation removed, quote-like marks and everything outside
/// (Hebrew letter | Latin letter | digit | space) mapped to space, runs
/// of whitespace collapsed.
pub fn normalize_for_similarity(input: &str) -> String {
    let text = strip_markup(input);
    let text = strip_cantillation(&text);

    let mut mapped = String::with_capacity(text.len());
    for ch in text.chars() {
        let keep = is_hebrew_letter(ch) || ch.is_ascii_alphanumeric();
        if keep {
            mapped.push(ch);
        } else {
            mapped.push(' ');
        }
    }

    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Similarity tokens: whitespace-split, length >= 2 characters.
pub fn similarity_tokens(normalized: &str) -> Vec<&str> {
    normalized
        .split_whitespace()
        .filter(|token| token.chars().count() >= 2)
        .collect()
}

pub fn is_hebrew_letter(ch: char) -> bool {
    ('\u{05D0}'..='\u{05EA}').contains(&ch)
}

fn is_hebrew_codepoint(ch: char) -> bool {
    ('\u{0590}'..='\u{05FF}').contains(&ch)
}

/// Share of Hebrew-block codepoints among all codepoints. Empty input
/// scores 0.
pub fn hebrew_ratio(input: &str) -> f64 {
    let mut total = 0usize;
    let mut hebrew = 0usize;
    for ch in input.chars() {
        total += 1;
        if is_hebrew_codepoint(ch) {
            hebrew += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    hebrew as f64 / total as f64
}

/// Word count for chunk budgeting: whitespace tokens that contain at
/// least one alphanumeric or Hebrew codepoint. Bare punctuation runs do
/// not count.
pub fn count_words(input: &str) -> usize {
    input.split_whitespace().filter(|t| is_word(t)).count()
}

pub fn is_word(token: &str) -> bool {
    token
        .chars()
        .any(|ch| ch.is_alphanumeric() || is_hebrew_codepoint(ch))
}
