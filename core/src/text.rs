//! Text normalization ahead of speech generation
//!
//! Applied per language before any model is touched:
//! - control characters dropped, whitespace collapsed
//! - English only: abbreviation expansion, numbers, percentages and
//!   dollar amounts spelled out
//!
//! A result with no letters or digits is treated as empty by the pipeline.

use crate::language::Language;

const ONES: [&str; 20] = [
    "zero",
    "one",
    "two",
    "three",
    "four",
    "five",
    "six",
    "seven",
    "eight",
    "nine",
    "ten",
    "eleven",
    "twelve",
    "thirteen",
    "fourteen",
    "fifteen",
    "sixteen",
    "seventeen",
    "eighteen",
    "nineteen",
];

const TENS: [&str; 10] = [
    "", "", "twenty", "thirty", "forty", "fifty", "sixty", "seventy", "eighty", "ninety",
];

const SCALES: [(u64, &str); 3] = [
    (1_000_000_000, "billion"),
    (1_000_000, "million"),
    (1_000, "thousand"),
];

const EN_ABBREVIATIONS: [(&str, &str); 10] = [
    ("Mr.", "Mister"),
    ("Mrs.", "Missus"),
    ("Ms.", "Miss"),
    ("Dr.", "Doctor"),
    ("Prof.", "Professor"),
    ("St.", "Saint"),
    ("Jr.", "Junior"),
    ("Sr.", "Senior"),
    ("vs.", "versus"),
    ("etc.", "et cetera"),
];

/// Normalize `text` for synthesis in `language`.
pub fn normalize(text: &str, language: Language) -> String {
    let cleaned = collapse_whitespace(text);
    match language {
        Language::En => normalize_english(&cleaned),
        _ => cleaned,
    }
}

/// True when the text still carries something speakable.
pub fn is_speakable(text: &str) -> bool {
    text.chars().any(|c| c.is_alphanumeric())
}

fn collapse_whitespace(text: &str) -> String {
    text.split(|c: char| c.is_whitespace() || c.is_control())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_english(text: &str) -> String {
    text.split(' ')
        .map(expand_token)
        .collect::<Vec<_>>()
        .join(" ")
}

fn expand_token(token: &str) -> String {
    for (abbr, full) in EN_ABBREVIATIONS {
        if token == abbr {
            return full.to_string();
        }
    }

    // Split leading/trailing punctuation so "$5," and "(42%)" still expand
    let start = token
        .char_indices()
        .find(|(_, c)| c.is_ascii_digit() || *c == '$')
        .map(|(i, _)| i);
    let Some(start) = start else {
        return token.to_string();
    };
    let end = token
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_ascii_digit() || *c == '%')
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(token.len());
    if end <= start {
        return token.to_string();
    }

    let (prefix, core, suffix) = (&token[..start], &token[start..end], &token[end..]);
    if prefix.chars().chain(suffix.chars()).any(|c| c.is_alphanumeric()) {
        return token.to_string();
    }
    match spell_numeric(core) {
        Some(words) => format!("{}{}{}", prefix, words, suffix),
        None => token.to_string(),
    }
}

fn spell_numeric(core: &str) -> Option<String> {
    if let Some(amount) = core.strip_prefix('$') {
        let (dollars, cents) = match amount.split_once('.') {
            Some((d, c)) => (d, Some(c)),
            None => (amount, None),
        };
        let d = parse_grouped(dollars)?;
        let mut out = format!("{} {}", spell_integer(d), if d == 1 { "dollar" } else { "dollars" });
        if let Some(c) = cents {
            let c: u64 = c.parse().ok()?;
            if c > 0 {
                out.push_str(&format!(
                    " and {} {}",
                    spell_integer(c),
                    if c == 1 { "cent" } else { "cents" }
                ));
            }
        }
        return Some(out);
    }

    if let Some(n) = core.strip_suffix('%') {
        return spell_decimal(n).map(|w| format!("{} percent", w));
    }

    spell_decimal(core)
}

fn spell_decimal(s: &str) -> Option<String> {
    match s.split_once('.') {
        Some((int, frac)) => {
            if frac.is_empty() || !frac.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let whole = parse_grouped(int)?;
            let digits = frac
                .chars()
                .map(|c| ONES[c.to_digit(10).unwrap_or(0) as usize])
                .collect::<Vec<_>>()
                .join(" ");
            Some(format!("{} point {}", spell_integer(whole), digits))
        }
        None => parse_grouped(s).map(spell_integer),
    }
}

/// Parses `1234` and `1,234`; rejects anything else.
fn parse_grouped(s: &str) -> Option<u64> {
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit() || c == ',') {
        return None;
    }
    if s.contains(',') {
        let mut groups = s.split(',');
        let head = groups.next()?;
        if head.is_empty() || head.len() > 3 || groups.clone().any(|g| g.len() != 3) {
            return None;
        }
    }
    s.replace(',', "").parse().ok()
}

fn spell_integer(n: u64) -> String {
    if n < 1000 {
        return spell_below_thousand(n);
    }
    let mut parts = Vec::new();
    let mut rest = n;
    for (scale, name) in SCALES {
        if rest >= scale {
            let chunk = rest / scale;
            parts.push(format!("{} {}", spell_integer(chunk), name));
            rest %= scale;
        }
    }
    if rest > 0 {
        parts.push(spell_below_thousand(rest));
    }
    parts.join(" ")
}

fn spell_below_thousand(n: u64) -> String {
    match n {
        0..=19 => ONES[n as usize].to_string(),
        20..=99 => {
            let tens = TENS[(n / 10) as usize];
            match n % 10 {
                0 => tens.to_string(),
                ones => format!("{}-{}", tens, ONES[ones as usize]),
            }
        }
        _ => {
            let hundreds = format!("{} hundred", ONES[(n / 100) as usize]);
            match n % 100 {
                0 => hundreds,
                rest => format!("{} {}", hundreds, spell_below_thousand(rest)),
            }
        }
    }
}
