//! Tokenizer for rule formulas

use crate::error::{CalcError, Result};
use chrono::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Duration(Duration),
    Ident(String),
    /// Text between `[` and `]`, trimmed
    Bracket(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Not,
    Eof,
}

/// Token with its byte offset in the formula
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

/// Map a duration suffix to a duration of `amount` units
fn duration_unit(unit: &str, amount: f64) -> Option<Duration> {
    let seconds = match unit.to_ascii_lowercase().as_str() {
        "s" | "sec" => 1.0,
        "m" | "min" => 60.0,
        "h" | "hr" => 3600.0,
        "d" | "day" => 86_400.0,
        "w" | "wk" => 604_800.0,
        _ => return None,
    };
    Some(Duration::milliseconds((amount * seconds * 1000.0).round() as i64))
}

pub fn tokenize(input: &str) -> Result<Vec<Spanned>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        let start = i;

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let simple = match c {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            ',' => Some(Token::Comma),
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            '^' => Some(Token::Caret),
            _ => None,
        };
        if let Some(token) = simple {
            tokens.push(Spanned { token, position: start });
            i += 1;
            continue;
        }

        let next = bytes.get(i + 1).map(|b| *b as char);
        match c {
            '<' => {
                let (token, len) = match next {
                    Some('=') => (Token::Le, 2),
                    Some('>') => (Token::Ne, 2),
                    _ => (Token::Lt, 1),
                };
                tokens.push(Spanned { token, position: start });
                i += len;
            },
            '>' => {
                let (token, len) = if next == Some('=') { (Token::Ge, 2) } else { (Token::Gt, 1) };
                tokens.push(Spanned { token, position: start });
                i += len;
            },
            '=' => {
                let len = if next == Some('=') { 2 } else { 1 };
                tokens.push(Spanned { token: Token::Eq, position: start });
                i += len;
            },
            '!' => {
                let (token, len) = if next == Some('=') { (Token::Ne, 2) } else { (Token::Not, 1) };
                tokens.push(Spanned { token, position: start });
                i += len;
            },
            '&' => {
                let len = if next == Some('&') { 2 } else { 1 };
                tokens.push(Spanned { token: Token::And, position: start });
                i += len;
            },
            '|' => {
                let len = if next == Some('|') { 2 } else { 1 };
                tokens.push(Spanned { token: Token::Or, position: start });
                i += len;
            },
            '.' if !next.is_some_and(|n| n.is_ascii_digit()) => {
                tokens.push(Spanned { token: Token::Dot, position: start });
                i += 1;
            },
            '[' => {
                let close = input[i + 1..]
                    .find(']')
                    .ok_or_else(|| CalcError::parse(start, "unterminated '['"))?;
                let inner = input[i + 1..i + 1 + close].trim();
                if inner.is_empty() {
                    return Err(CalcError::parse(start, "empty reference '[]'"));
                }
                tokens.push(Spanned {
                    token: Token::Bracket(inner.to_string()),
                    position: start,
                });
                i += close + 2;
            },
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < bytes.len() {
                    let ch = bytes[j] as char;
                    if ch == '\\' && j + 1 < bytes.len() {
                        text.push(bytes[j + 1] as char);
                        j += 2;
                        continue;
                    }
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    // keep multi-byte characters intact
                    let width = input[j..].chars().next().map_or(1, char::len_utf8);
                    text.push_str(&input[j..j + width]);
                    j += width;
                }
                if !closed {
                    return Err(CalcError::parse(start, "unterminated string"));
                }
                tokens.push(Spanned { token: Token::Str(text), position: start });
                i = j + 1;
            },
            c if c.is_ascii_digit() || c == '.' => {
                let mut j = i;
                while j < bytes.len() && (bytes[j].is_ascii_digit() || bytes[j] == b'.') {
                    j += 1;
                }
                // exponent, but not a duration suffix like `1e` (never valid anyway)
                if j < bytes.len() && (bytes[j] == b'e' || bytes[j] == b'E') {
                    let mut k = j + 1;
                    if k < bytes.len() && (bytes[k] == b'+' || bytes[k] == b'-') {
                        k += 1;
                    }
                    if k < bytes.len() && bytes[k].is_ascii_digit() {
                        while k < bytes.len() && bytes[k].is_ascii_digit() {
                            k += 1;
                        }
                        j = k;
                    }
                }
                let literal = &input[i..j];
                let amount: f64 = literal
                    .parse()
                    .map_err(|_| CalcError::parse(start, format!("invalid number '{}'", literal)))?;

                let mut k = j;
                while k < bytes.len() && bytes[k].is_ascii_alphabetic() {
                    k += 1;
                }
                if k > j {
                    let unit = &input[j..k];
                    let duration = duration_unit(unit, amount).ok_or_else(|| {
                        CalcError::parse(j, format!("unknown duration unit '{}'", unit))
                    })?;
                    tokens.push(Spanned { token: Token::Duration(duration), position: start });
                } else {
                    tokens.push(Spanned { token: Token::Number(amount), position: start });
                }
                i = k;
            },
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut j = i;
                while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
                    j += 1;
                }
                let word = &input[i..j];
                let token = match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push(Spanned { token, position: start });
                i = j;
            },
            other => {
                return Err(CalcError::parse(start, format!("unexpected character '{}'", other)));
            },
        }
    }

    tokens.push(Spanned {
        token: Token::Eof,
        position: input.len(),
    });
    Ok(tokens)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token> {
        tokenize(input).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn test_durations_and_numbers() {
        assert_eq!(
            kinds("1.5 15min 1h 2d"),
            vec![
                Token::Number(1.5),
                Token::Duration(Duration::minutes(15)),
                Token::Duration(Duration::hours(1)),
                Token::Duration(Duration::days(2)),
                Token::Eof,
            ]
        );
        assert_eq!(kinds("1e3"), vec![Token::Number(1000.0), Token::Eof]);
        assert!(tokenize("3parsecs").is_err());
    }

    #[test]
    fn test_operators_and_keywords() {
        assert_eq!(
            kinds("a >= 2 AND !b || c <> d"),
            vec![
                Token::Ident("a".into()),
                Token::Ge,
                Token::Number(2.0),
                Token::And,
                Token::Not,
                Token::Ident("b".into()),
                Token::Or,
                Token::Ident("c".into()),
                Token::Ne,
                Token::Ident("d".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_brackets_and_strings() {
        assert_eq!(
            kinds("[dtmi:com:example:Sensor;1].value == 'on'"),
            vec![
                Token::Bracket("dtmi:com:example:Sensor;1".into()),
                Token::Dot,
                Token::Ident("value".into()),
                Token::Eq,
                Token::Str("on".into()),
                Token::Eof,
            ]
        );
        assert!(tokenize("[oops").is_err());
        assert!(tokenize("'open").is_err());
    }
}
