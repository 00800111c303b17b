//! Soundex and Metaphone encodings.
//!
//! Both encoders ignore anything that is not an ASCII letter, so callers
//! should pass names through [`normalize_name`](graphloom_shared::normalize_name)
//! first to fold diacritics.

/// American Soundex code of one word, or `None` if it has no letters.
pub fn soundex(word: &str) -> Option<String> {
    let letters: Vec<char> = word
        .chars()
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let (&first, rest) = letters.split_first()?;

    let mut code = String::with_capacity(4);
    code.push(first);
    let mut last = soundex_digit(first);
    for &c in rest {
        let digit = soundex_digit(c);
        if let Some(d) = digit {
            if digit != last {
                code.push(d);
                if code.len() == 4 {
                    break;
                }
            }
        }
        // H and W do not separate letters with the same code; vowels do.
        if c != 'H' && c != 'W' {
            last = digit;
        }
    }
    while code.len() < 4 {
        code.push('0');
    }
    Some(code)
}

fn soundex_digit(c: char) -> Option<char> {
    match c {
        'B' | 'F' | 'P' | 'V' => Some('1'),
        'C' | 'G' | 'J' | 'K' | 'Q' | 'S' | 'X' | 'Z' => Some('2'),
        'D' | 'T' => Some('3'),
        'L' => Some('4'),
        'M' | 'N' => Some('5'),
        'R' => Some('6'),
        _ => None,
    }
}

fn is_vowel(c: char) -> bool {
    matches!(c, 'A' | 'E' | 'I' | 'O' | 'U')
}

/// Metaphone key of one word. Empty when the word has no letters.
pub fn metaphone(word: &str) -> String {
    let w: Vec<char> = word
        .chars()
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let mut out = String::new();
    let Some(&head) = w.first() else {
        return out;
    };
    let at = |i: usize| w.get(i).copied();

    let mut i = 0;
    // Position whose vowel is kept.
    let mut vowel_at = 0;
    match (head, at(1)) {
        ('A', Some('E')) | ('G', Some('N')) | ('K', Some('N')) | ('P', Some('N'))
        | ('W', Some('R')) => {
            i = 1;
            vowel_at = 1;
        }
        ('X', _) => {
            out.push('S');
            i = 1;
        }
        ('W', Some('H')) => {
            out.push('W');
            i = 2;
        }
        _ => {}
    }

    while i < w.len() {
        let c = w[i];
        let prev = if i > 0 { at(i - 1) } else { None };
        let next = at(i + 1);
        let after = at(i + 2);

        if prev == Some(c) && c != 'C' {
            i += 1;
            continue;
        }

        match c {
            'A' | 'E' | 'I' | 'O' | 'U' => {
                if i == vowel_at {
                    out.push(c);
                }
            }
            'B' => {
                if !(prev == Some('M') && next.is_none()) {
                    out.push('B');
                }
            }
            'C' => {
                if next == Some('I') && after == Some('A') {
                    out.push('X');
                } else if next == Some('H') {
                    out.push(if prev == Some('S') { 'K' } else { 'X' });
                    i += 1;
                } else if matches!(next, Some('I' | 'E' | 'Y')) {
                    if prev != Some('S') {
                        out.push('S');
                    }
                } else {
                    out.push('K');
                }
            }
            'D' => {
                if next == Some('G') && matches!(after, Some('E' | 'I' | 'Y')) {
                    out.push('J');
                    i += 1;
                } else {
                    out.push('T');
                }
            }
            'G' => {
                let silent_gh = next == Some('H') && after.is_some_and(|a| !is_vowel(a));
                let silent_gn = next == Some('N')
                    && (after.is_none()
                        || (after == Some('E') && at(i + 3) == Some('D') && at(i + 4).is_none()));
                if silent_gh || silent_gn {
                    // silent
                } else if matches!(next, Some('I' | 'E' | 'Y')) && prev != Some('G') {
                    out.push('J');
                } else {
                    out.push('K');
                }
            }
            'H' => {
                let after_modifier = prev.is_some_and(|p| matches!(p, 'C' | 'G' | 'P' | 'S' | 'T'));
                if !after_modifier && next.is_some_and(is_vowel) {
                    out.push('H');
                }
            }
            'K' => {
                if prev != Some('C') {
                    out.push('K');
                }
            }
            'P' => {
                if next == Some('H') {
                    out.push('F');
                    i += 1;
                } else {
                    out.push('P');
                }
            }
            'Q' => out.push('K'),
            'S' => {
                if next == Some('H') {
                    out.push('X');
                    i += 1;
                } else if next == Some('I') && matches!(after, Some('O' | 'A')) {
                    out.push('X');
                } else {
                    out.push('S');
                }
            }
            'T' => {
                if next == Some('I') && matches!(after, Some('O' | 'A')) {
                    out.push('X');
                } else if next == Some('H') {
                    out.push('0');
                    i += 1;
                } else if !(next == Some('C') && after == Some('H')) {
                    out.push('T');
                }
            }
            'V' => out.push('F'),
            'W' | 'Y' => {
                if next.is_some_and(is_vowel) {
                    out.push(c);
                }
            }
            'X' => out.push_str("KS"),
            'Z' => out.push('S'),
            other => out.push(other),
        }
        i += 1;
    }
    out
}

/// Token-wise Soundex of a normalized name ("jon smith" -> "J500 S530").
pub fn soundex_key(name: &str) -> Option<String> {
    let codes: Vec<String> = name.split_whitespace().filter_map(soundex).collect();
    (!codes.is_empty()).then(|| codes.join(" "))
}

/// Token-wise Metaphone of a normalized name.
pub fn metaphone_key(name: &str) -> Option<String> {
    let codes: Vec<String> = name
        .split_whitespace()
        .map(metaphone)
        .filter(|code| !code.is_empty())
        .collect();
    (!codes.is_empty()).then(|| codes.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soundex_reference_codes() {
        assert_eq!(soundex("Robert").as_deref(), Some("R163"));
        assert_eq!(soundex("Rupert").as_deref(), Some("R163"));
        assert_eq!(soundex("Ashcraft").as_deref(), Some("A261"));
        assert_eq!(soundex("Tymczak").as_deref(), Some("T522"));
        assert_eq!(soundex("Pfister").as_deref(), Some("P236"));
        assert_eq!(soundex("Lee").as_deref(), Some("L000"));
        assert_eq!(soundex("123"), None);
    }

    #[test]
    fn metaphone_rules() {
        assert_eq!(metaphone("smith"), "SM0");
        assert_eq!(metaphone("knight"), "NT");
        assert_eq!(metaphone("phone"), "FN");
        assert_eq!(metaphone("xavier"), "SFR");
        assert_eq!(metaphone("church"), "XRX");
        assert_eq!(metaphone("edge"), "EJ");
        assert_eq!(metaphone("aerial"), "ERL");
        assert_eq!(metaphone(""), "");
    }

    #[test]
    fn spelling_variants_share_keys() {
        assert_eq!(metaphone("john"), metaphone("jon"));
        assert_eq!(soundex("john"), soundex("jon"));
        assert_eq!(soundex_key("jon smith"), soundex_key("john smith"));
        assert_eq!(metaphone_key("jon smith"), metaphone_key("john smith"));
    }

    #[test]
    fn keys_are_token_wise() {
        assert_eq!(soundex_key("jon smith").as_deref(), Some("J500 S530"));
        assert_eq!(soundex_key("  "), None);
        assert_eq!(metaphone_key("42"), None);
    }
}
