//! Hand-written lexer for Rill source text.
//!
//! The lexer walks the source bytes once, tracking the current line, and
//! hands the parser one [`Token`] per call. It never allocates except for
//! literal payloads. All failures are [`Error::Lexical`] values carrying the
//! line where the token *started*.

use crate::error::{Error, Result};
use crate::token::{Token, TokenKind};

/// Longest run of decimal digits accepted in a `\ddd` string escape.
const MAX_ESCAPE_DIGITS: usize = 3;

pub struct Lexer<'src> {
    src: &'src [u8],
    pos: usize,
    line: u32,
    /// Chunk name reported in errors.
    chunk: String,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str, chunk: &str) -> Self {
        Self {
            src: source.as_bytes(),
            pos: 0,
            line: 1,
            chunk: chunk.to_string(),
        }
    }

    /// Line of the most recently scanned character.
    pub fn line(&self) -> u32 {
        self.line
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn error(&self, line: u32, message: &str, near: &str) -> Error {
        Error::Lexical {
            chunk: self.chunk.clone(),
            line,
            message: message.to_string(),
            near: near.to_string(),
        }
    }

    /// Scan and return the next token. Returns `TokenKind::Eos` forever once
    /// the input is exhausted.
    pub fn next_token(&mut self) -> Result<Token> {
        self.skip_blanks()?;
        let line = self.line;
        let Some(c) = self.peek() else {
            return Ok(Token::new(TokenKind::Eos, line));
        };

        let kind = match c {
            b'0'..=b'9' => return self.read_number(line),
            b'"' | b'\'' => return self.read_string(c, line),
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => return Ok(self.read_name(line)),
            b'[' if self.peek_at(1) == Some(b'[') => {
                let text = self.read_long_bracket(line, "unfinished long string")?;
                return Ok(Token::new(TokenKind::Str(text), line));
            }
            b'=' => self.one_or_two(b'=', TokenKind::Eq, TokenKind::Assign),
            b'<' => self.one_or_two(b'=', TokenKind::Le, TokenKind::Lt),
            b'>' => self.one_or_two(b'=', TokenKind::Ge, TokenKind::Gt),
            b'~' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    TokenKind::Ne
                } else {
                    return Err(self.error(line, "unexpected symbol", "~"));
                }
            }
            b'.' => {
                if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) {
                    return self.read_number(line);
                }
                self.bump();
                if self.peek() == Some(b'.') {
                    self.bump();
                    if self.peek() == Some(b'.') {
                        self.bump();
                        TokenKind::Dots
                    } else {
                        TokenKind::Concat
                    }
                } else {
                    TokenKind::Dot
                }
            }
            b'+' => self.single(TokenKind::Plus),
            b'-' => self.single(TokenKind::Minus),
            b'*' => self.single(TokenKind::Star),
            b'/' => self.single(TokenKind::Slash),
            b'^' => self.single(TokenKind::Caret),
            b'%' => self.single(TokenKind::Percent),
            b'(' => self.single(TokenKind::LParen),
            b')' => self.single(TokenKind::RParen),
            b'{' => self.single(TokenKind::LBrace),
            b'}' => self.single(TokenKind::RBrace),
            b'[' => self.single(TokenKind::LBracket),
            b']' => self.single(TokenKind::RBracket),
            b';' => self.single(TokenKind::Semi),
            b':' => self.single(TokenKind::Colon),
            b',' => self.single(TokenKind::Comma),
            _ => {
                let near = (c as char).to_string();
                return Err(self.error(line, "unexpected symbol", &near));
            }
        };
        Ok(Token::new(kind, line))
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.bump();
        kind
    }

    fn one_or_two(&mut self, second: u8, long: TokenKind, short: TokenKind) -> TokenKind {
        self.bump();
        if self.peek() == Some(second) {
            self.bump();
            long
        } else {
            short
        }
    }

    /// Skip whitespace and comments. `--` comments run to end of line;
    /// `--[[ ... ]]` comments nest and may span lines.
    fn skip_blanks(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n') => {
                    self.bump();
                }
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    let line = self.line;
                    self.pos += 2;
                    if self.peek() == Some(b'[') && self.peek_at(1) == Some(b'[') {
                        self.read_long_bracket(line, "unfinished long comment")?;
                    } else {
                        while !matches!(self.peek(), None | Some(b'\n')) {
                            self.pos += 1;
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn read_name(&mut self, line: u32) -> Token {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_')
        {
            self.pos += 1;
        }
        // The name range is ASCII, so this cannot fail.
        let word = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        let kind = TokenKind::keyword(word).unwrap_or_else(|| TokenKind::Name(word.to_string()));
        Token::new(kind, line)
    }

    /// Decimal number with optional fraction and optional signed exponent.
    fn read_number(&mut self, line: u32) -> Result<Token> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        // A '.' is part of the number only when not beginning a '..' token.
        if self.peek() == Some(b'.') && self.peek_at(1) != Some(b'.') {
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            self.pos += 1;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            if !self.peek().is_some_and(|c| c.is_ascii_digit()) {
                return Err(self.malformed_number(line, start));
            }
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        // Trailing junk ("1e2x", "1.2.3"). A '.' starting a '..' token is the
        // concat operator, not junk.
        let junk = match self.peek() {
            Some(c) if c.is_ascii_alphanumeric() || c == b'_' => true,
            Some(b'.') => self.peek_at(1) != Some(b'.'),
            _ => false,
        };
        if junk {
            self.pos += 1;
            return Err(self.malformed_number(line, start));
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        match text.parse::<f64>() {
            Ok(n) => Ok(Token::new(TokenKind::Number(n), line)),
            Err(_) => Err(self.malformed_number(line, start)),
        }
    }

    fn malformed_number(&self, line: u32, start: usize) -> Error {
        let near = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        self.error(line, "malformed number", &near)
    }

    /// Quoted string on a single source line, with escapes.
    fn read_string(&mut self, quote: u8, line: u32) -> Result<Token> {
        self.bump();
        let mut text = String::new();
        loop {
            match self.peek() {
                None | Some(b'\n') => {
                    return Err(self.error(line, "unfinished string", &text));
                }
                Some(c) if c == quote => {
                    self.bump();
                    return Ok(Token::new(TokenKind::Str(text), line));
                }
                Some(b'\\') => {
                    self.bump();
                    match self.peek() {
                        None => return Err(self.error(line, "unfinished string", &text)),
                        Some(b'n') => {
                            self.bump();
                            text.push('\n');
                        }
                        Some(b't') => {
                            self.bump();
                            text.push('\t');
                        }
                        Some(b'r') => {
                            self.bump();
                            text.push('\r');
                        }
                        Some(b'a') => {
                            self.bump();
                            text.push('\x07');
                        }
                        Some(b'b') => {
                            self.bump();
                            text.push('\x08');
                        }
                        Some(b'f') => {
                            self.bump();
                            text.push('\x0c');
                        }
                        Some(b'v') => {
                            self.bump();
                            text.push('\x0b');
                        }
                        Some(b'\n') => {
                            self.bump();
                            text.push('\n');
                        }
                        Some(d) if d.is_ascii_digit() => {
                            let mut value: u32 = 0;
                            let mut digits = 0;
                            while digits < MAX_ESCAPE_DIGITS
                                && self.peek().is_some_and(|c| c.is_ascii_digit())
                            {
                                value = value * 10 + u32::from(self.bump().unwrap() - b'0');
                                digits += 1;
                            }
                            if value > 255 {
                                return Err(self.error(line, "escape sequence too large", &text));
                            }
                            text.push(char::from(value as u8));
                        }
                        Some(other) => {
                            self.bump();
                            text.push(char::from(other));
                        }
                    }
                }
                Some(_) => {
                    let c = self.bump().unwrap();
                    text.push(char::from(c));
                }
            }
        }
    }

    /// Read a `[[ ... ]]` bracketed run (long string or long comment).
    /// Brackets nest; an immediate leading newline is dropped.
    fn read_long_bracket(&mut self, line: u32, unfinished: &str) -> Result<String> {
        self.pos += 2;
        if self.peek() == Some(b'\n') {
            self.bump();
        }
        let mut text = String::new();
        let mut level = 0u32;
        loop {
            match self.peek() {
                None => return Err(self.error(line, unfinished, "[[")),
                Some(b'[') if self.peek_at(1) == Some(b'[') => {
                    self.pos += 2;
                    level += 1;
                    text.push_str("[[");
                }
                Some(b']') if self.peek_at(1) == Some(b']') => {
                    self.pos += 2;
                    if level == 0 {
                        return Ok(text);
                    }
                    level -= 1;
                    text.push_str("]]");
                }
                Some(_) => {
                    let c = self.bump().unwrap();
                    text.push(char::from(c));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source, "test");
        let mut out = Vec::new();
        loop {
            let tok = lexer.next_token().expect("lex failure");
            let done = tok.kind == TokenKind::Eos;
            out.push(tok.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn scans_statement_tokens() {
        assert_eq!(
            kinds("local x = 10"),
            vec![
                TokenKind::Local,
                TokenKind::Name("x".into()),
                TokenKind::Assign,
                TokenKind::Number(10.0),
                TokenKind::Eos,
            ]
        );
    }

    #[test]
    fn scans_multi_char_operators() {
        assert_eq!(
            kinds("== ~= <= >= .. ... ."),
            vec![
                TokenKind::Eq,
                TokenKind::Ne,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::Concat,
                TokenKind::Dots,
                TokenKind::Dot,
                TokenKind::Eos,
            ]
        );
    }

    #[test]
    fn concat_between_numbers() {
        assert_eq!(
            kinds("1..2"),
            vec![
                TokenKind::Number(1.0),
                TokenKind::Concat,
                TokenKind::Number(2.0),
                TokenKind::Eos,
            ]
        );
    }

    #[test]
    fn number_forms() {
        assert_eq!(
            kinds("3 3.25 .5 1e3 2.5E-1"),
            vec![
                TokenKind::Number(3.0),
                TokenKind::Number(3.25),
                TokenKind::Number(0.5),
                TokenKind::Number(1000.0),
                TokenKind::Number(0.25),
                TokenKind::Eos,
            ]
        );
    }

    #[test]
    fn malformed_number_is_lexical_error() {
        let mut lexer = Lexer::new("1e+", "test");
        let err = lexer.next_token().unwrap_err();
        assert!(matches!(err, Error::Lexical { ref message, .. } if message == "malformed number"));
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            kinds(r#""a\n\t\065\\""#),
            vec![TokenKind::Str("a\n\tA\\".into()), TokenKind::Eos]
        );
    }

    #[test]
    fn unfinished_string_reports_start_line() {
        let mut lexer = Lexer::new("\n\n\"abc", "test");
        let err = lexer.next_token().unwrap_err();
        assert_eq!(err.line(), 3);
        assert!(matches!(err, Error::Lexical { ref message, .. } if message == "unfinished string"));
    }

    #[test]
    fn long_strings_nest_and_span_lines() {
        assert_eq!(
            kinds("[[\nouter [[inner]] tail]]"),
            vec![
                TokenKind::Str("outer [[inner]] tail".into()),
                TokenKind::Eos,
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("1 -- short comment\n--[[ long\ncomment ]] 2"),
            vec![TokenKind::Number(1.0), TokenKind::Number(2.0), TokenKind::Eos]
        );
    }

    #[test]
    fn line_numbers_advance() {
        let mut lexer = Lexer::new("a\nb\n\nc", "test");
        assert_eq!(lexer.next_token().unwrap().line, 1);
        assert_eq!(lexer.next_token().unwrap().line, 2);
        assert_eq!(lexer.next_token().unwrap().line, 4);
    }

    #[test]
    fn lone_tilde_is_rejected() {
        let mut lexer = Lexer::new("a ~ b", "test");
        lexer.next_token().unwrap();
        let err = lexer.next_token().unwrap_err();
        assert!(matches!(err, Error::Lexical { ref message, .. } if message == "unexpected symbol"));
    }
}
