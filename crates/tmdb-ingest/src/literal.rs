//! Recursive-descent reader for text-serialized literal structures.
//!
//! Accepts the literal subset that appears in the TMDB `genres` / `cast`
//! columns: lists, tuples, mappings, quoted strings, numbers and the
//! `True` / `False` / `None` keywords (JSON spellings are accepted too).
//! Every syntax violation is reported as a [`LiteralError`]; callers that
//! need tolerance map the error to an empty result.
//!
//! Scalar mapping keys (numbers, keywords) are kept under their textual form;
//! only container keys are rejected.

use serde_json::{Map, Number, Value as JsonValue};
use thiserror::Error;

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LiteralError {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("unexpected character {found:?} at offset {offset}")]
    Unexpected { found: char, offset: usize },
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("invalid escape sequence at offset {0}")]
    InvalidEscape(usize),
    #[error("mapping key at offset {0} is not hashable")]
    UnhashableKey(usize),
    #[error("top-level value is not a list")]
    NotAList,
    #[error("nesting too deep")]
    TooDeep,
    #[error("trailing input at offset {0}")]
    Trailing(usize),
}

/// Parse one complete literal value; surrounding whitespace is allowed.
pub fn parse_literal(text: &str) -> Result<JsonValue, LiteralError> {
    let mut reader = Reader::new(text);
    let value = reader.value(0)?;
    reader.finish(value)
}

/// Parse a literal whose top level must be a `[...]` list. Tuples and every
/// other shape are rejected with [`LiteralError::NotAList`].
pub fn parse_literal_list(text: &str) -> Result<Vec<JsonValue>, LiteralError> {
    let mut reader = Reader::new(text);
    reader.skip_ws();
    if reader.peek() != Some('[') {
        return Err(LiteralError::NotAList);
    }
    match reader.value(0)? {
        JsonValue::Array(items) => reader.finish(items),
        _ => Err(LiteralError::NotAList),
    }
}

struct Reader {
    chars: Vec<char>,
    pos: usize,
}

impl Reader {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
        }
    }

    fn offset(&self) -> usize {
        self.pos
    }

    fn finish<T>(&mut self, parsed: T) -> Result<T, LiteralError> {
        self.skip_ws();
        match self.peek() {
            None => Ok(parsed),
            Some(_) => Err(LiteralError::Trailing(self.offset())),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, wanted: char) -> Result<(), LiteralError> {
        match self.bump() {
            Some(c) if c == wanted => Ok(()),
            Some(found) => Err(LiteralError::Unexpected {
                found,
                offset: self.pos - 1,
            }),
            None => Err(LiteralError::UnexpectedEnd),
        }
    }

    fn value(&mut self, depth: usize) -> Result<JsonValue, LiteralError> {
        if depth > MAX_DEPTH {
            return Err(LiteralError::TooDeep);
        }
        self.skip_ws();
        match self.peek() {
            None => Err(LiteralError::UnexpectedEnd),
            Some('[') => self.sequence('[', ']', depth),
            Some('(') => self.sequence('(', ')', depth),
            Some('{') => self.mapping(depth),
            Some('\'') | Some('"') => self.string().map(JsonValue::String),
            Some(c) if c == '-' || c == '+' || c == '.' || c.is_ascii_digit() => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.keyword(),
            Some(found) => Err(LiteralError::Unexpected {
                found,
                offset: self.pos,
            }),
        }
    }

    fn sequence(&mut self, open: char, close: char, depth: usize) -> Result<JsonValue, LiteralError> {
        self.expect(open)?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok(JsonValue::Array(items));
            }
            items.push(self.value(depth + 1)?);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some(c) if c == close => return Ok(JsonValue::Array(items)),
                Some(found) => {
                    return Err(LiteralError::Unexpected {
                        found,
                        offset: self.pos - 1,
                    })
                }
                None => return Err(LiteralError::UnexpectedEnd),
            }
        }
    }

    fn mapping(&mut self, depth: usize) -> Result<JsonValue, LiteralError> {
        self.expect('{')?;
        let mut map = Map::new();
        loop {
            self.skip_ws();
            if self.peek() == Some('}') {
                self.pos += 1;
                return Ok(JsonValue::Object(map));
            }
            let key_offset = self.pos;
            let key = match self.value(depth + 1)? {
                JsonValue::String(key) => key,
                JsonValue::Array(_) | JsonValue::Object(_) => {
                    return Err(LiteralError::UnhashableKey(key_offset))
                }
                scalar => scalar.to_string(),
            };
            self.skip_ws();
            self.expect(':')?;
            let value = self.value(depth + 1)?;
            map.insert(key, value);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(JsonValue::Object(map)),
                Some(found) => {
                    return Err(LiteralError::Unexpected {
                        found,
                        offset: self.pos - 1,
                    })
                }
                None => return Err(LiteralError::UnexpectedEnd),
            }
        }
    }

    fn string(&mut self) -> Result<String, LiteralError> {
        let quote = self.bump().ok_or(LiteralError::UnexpectedEnd)?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(LiteralError::UnexpectedEnd),
                Some(c) if c == quote => return Ok(out),
                Some('\n') => {
                    return Err(LiteralError::Unexpected {
                        found: '\n',
                        offset: self.pos - 1,
                    })
                }
                Some('\\') => self.escape(&mut out)?,
                Some(c) => out.push(c),
            }
        }
    }

    fn escape(&mut self, out: &mut String) -> Result<(), LiteralError> {
        let start = self.pos - 1;
        let c = self.bump().ok_or(LiteralError::UnexpectedEnd)?;
        match c {
            '\n' => {}
            '\\' | '\'' | '"' => out.push(c),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            '0' => out.push('\0'),
            'x' => out.push(self.hex_char(2, start)?),
            'u' => out.push(self.hex_char(4, start)?),
            'U' => out.push(self.hex_char(8, start)?),
            other => {
                out.push('\\');
                out.push(other);
            }
        }
        Ok(())
    }

    fn hex_char(&mut self, digits: usize, start: usize) -> Result<char, LiteralError> {
        let mut code = 0u32;
        for _ in 0..digits {
            let digit = self
                .bump()
                .and_then(|c| c.to_digit(16))
                .ok_or(LiteralError::InvalidEscape(start))?;
            code = code * 16 + digit;
        }
        char::from_u32(code).ok_or(LiteralError::InvalidEscape(start))
    }

    fn number(&mut self) -> Result<JsonValue, LiteralError> {
        let start = self.pos;
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.pos += 1;
        }
        let mut prev = None;
        while let Some(c) = self.peek() {
            let exponent_sign = matches!(c, '-' | '+') && matches!(prev, Some('e') | Some('E'));
            if !(c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '_') || exponent_sign) {
                break;
            }
            prev = Some(c);
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().filter(|c| **c != '_').collect();
        let is_float = text.contains(['.', 'e', 'E']);
        if !is_float {
            if let Ok(int) = text.parse::<i64>() {
                return Ok(JsonValue::Number(int.into()));
            }
        }
        text.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .and_then(Number::from_f64)
            .map(JsonValue::Number)
            .ok_or(LiteralError::InvalidNumber(text))
    }

    fn keyword(&mut self) -> Result<JsonValue, LiteralError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        match word.as_str() {
            "True" | "true" => Ok(JsonValue::Bool(true)),
            "False" | "false" => Ok(JsonValue::Bool(false)),
            "None" | "null" => Ok(JsonValue::Null),
            _ => Err(LiteralError::Unexpected {
                found: self.chars[start],
                offset: start,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_single_quoted_mappings() {
        let value = parse_literal("[{'id': 18, 'name': 'Drama'}, {'id': 10749, 'name': 'Romance'}]").unwrap();
        assert_eq!(
            value,
            json!([{"id": 18, "name": "Drama"}, {"id": 10749, "name": "Romance"}])
        );
    }

    #[test]
    fn reads_json_style_cast_entries() {
        let text = r#"[{"cast_id": 242, "character": "Jake Sully", "gender": 2, "name": "Sam Worthington", "order": 0}]"#;
        let value = parse_literal(text).unwrap();
        assert_eq!(value[0]["name"], json!("Sam Worthington"));
        assert_eq!(value[0]["order"], json!(0));
    }

    #[test]
    fn handles_escapes_keywords_and_trailing_commas() {
        let value = parse_literal(r#"[{'name': 'O\'Brien', 'alive': True, 'x': None, 'w': -1.5e2,},]"#).unwrap();
        assert_eq!(value, json!([{"name": "O'Brien", "alive": true, "x": null, "w": -150.0}]));
    }

    #[test]
    fn list_reader_rejects_top_level_tuples() {
        assert_eq!(
            parse_literal_list("({'name': 'Drama'}, {'name': 'Comedy'})"),
            Err(LiteralError::NotAList)
        );
        assert_eq!(parse_literal_list("  {'name': 'Drama'}"), Err(LiteralError::NotAList));
        assert_eq!(
            parse_literal_list(" [({'name': 'A'},), {'name': 'B'}] ").unwrap(),
            vec![json!([{"name": "A"}]), json!({"name": "B"})]
        );
    }

    #[test]
    fn scalar_keys_are_kept_as_text() {
        assert_eq!(
            parse_literal("{1: 'x', None: 'y', 'name': 'A'}").unwrap(),
            json!({"1": "x", "null": "y", "name": "A"})
        );
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(parse_literal("[{'name': 'Drama'"), Err(LiteralError::UnexpectedEnd));
        assert!(matches!(parse_literal("[1, 2] extra"), Err(LiteralError::Trailing(_))));
        assert!(matches!(parse_literal("{[1]: 'a'}"), Err(LiteralError::UnhashableKey(_))));
        assert!(parse_literal("[os.system('x')]").is_err());
        assert!(parse_literal("").is_err());
    }

    #[test]
    fn deep_nesting_is_bounded() {
        let text = format!("{}{}", "[".repeat(200), "]".repeat(200));
        assert_eq!(parse_literal(&text), Err(LiteralError::TooDeep));
    }
}
