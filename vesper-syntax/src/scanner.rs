// vesper-syntax - Tokens and scanner for the Vesper programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Scanner (tokeniser) for Vesper source code.
//!
//! Tokens are produced one at a time; the compiler pulls them as it
//! parses, so the whole token stream is never materialised.

use crate::token::{Token, TokenKind};

/// The scanner converts source code into tokens on demand.
pub struct Scanner<'src> {
    source: &'src str,
    /// Byte offset of the first character of the token being scanned.
    start: usize,
    /// Byte offset of the next character to consume.
    current: usize,
    /// Current line number (1-indexed).
    line: u32,
}

impl<'src> Scanner<'src> {
    /// Create a new scanner for the given source code.
    pub fn new(source: &'src str) -> Self {
        Scanner {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    /// Scan and return the next token.
    ///
    /// Once the source is exhausted this returns `Eof` forever, even
    /// after an error token.
    pub fn next_token(&mut self) -> Token<'src> {
        self.skip_whitespace_and_comments();
        self.start = self.current;

        let c = match self.advance() {
            Some(c) => c,
            None => return self.make_token(TokenKind::Eof),
        };

        if is_digit(c) {
            return self.number();
        }
        if is_alpha(c) {
            return self.identifier();
        }

        match c {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b';' => self.make_token(TokenKind::Semicolon),
            b',' => self.make_token(TokenKind::Comma),
            b'.' => self.make_token(TokenKind::Dot),
            b'-' => self.make_token(TokenKind::Minus),
            b'+' => self.make_token(TokenKind::Plus),
            b'/' => self.make_token(TokenKind::Slash),
            b'*' => self.make_token(TokenKind::Star),
            b'?' => self.make_token(TokenKind::Question),
            b':' => self.make_token(TokenKind::Colon),
            b'!' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                };
                self.make_token(kind)
            }
            b'=' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                };
                self.make_token(kind)
            }
            b'<' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                };
                self.make_token(kind)
            }
            b'>' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                };
                self.make_token(kind)
            }
            b'"' => self.string(),
            _ => self.error_token("Unexpected character."),
        }
    }

    /// Get the current line number (1-indexed).
    pub fn line(&self) -> u32 {
        self.line
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn peek(&self) -> Option<u8> {
        self.source.as_bytes().get(self.current).copied()
    }

    fn peek_next(&self) -> Option<u8> {
        self.source.as_bytes().get(self.current + 1).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.current += 1;
        if c == b'\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn match_byte(&mut self, expected: u8) -> bool {
        if self.peek() != Some(expected) {
            return false;
        }
        self.current += 1;
        true
    }

    fn make_token(&self, kind: TokenKind) -> Token<'src> {
        Token {
            kind,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Error,
            lexeme: message,
            line: self.line,
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                    self.advance();
                }
                Some(b'/') if self.peek_next() == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn string(&mut self) -> Token<'src> {
        while let Some(c) = self.peek() {
            if c == b'"' {
                break;
            }
            self.advance();
        }

        if self.is_at_end() {
            // The cursor is already parked at EOF, so the token stream
            // still terminates after the error.
            return self.error_token("Unterminated string.");
        }

        self.advance(); // closing quote
        self.make_token(TokenKind::String)
    }

    fn number(&mut self) -> Token<'src> {
        while matches!(self.peek(), Some(c) if is_digit(c) || c == b'_') {
            self.advance();
        }

        if self.peek() == Some(b'.') && matches!(self.peek_next(), Some(c) if is_digit(c)) {
            self.advance(); // the dot
            while matches!(self.peek(), Some(c) if is_digit(c) || c == b'_') {
                self.advance();
            }
        }

        self.make_token(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token<'src> {
        while matches!(self.peek(), Some(c) if is_alpha(c) || is_digit(c)) {
            self.advance();
        }

        self.make_token(self.identifier_kind())
    }

    /// Resolve reserved words by first-character dispatch; everything
    /// else is an identifier.
    fn identifier_kind(&self) -> TokenKind {
        let lexeme = &self.source[self.start..self.current];
        let bytes = lexeme.as_bytes();

        match bytes[0] {
            b'a' => self.check_keyword(lexeme, "and", TokenKind::And),
            b'c' => match bytes.get(1) {
                Some(b'l') => self.check_keyword(lexeme, "class", TokenKind::Class),
                Some(b'o') => self.check_keyword(lexeme, "continue", TokenKind::Continue),
                _ => TokenKind::Identifier,
            },
            b'e' => self.check_keyword(lexeme, "else", TokenKind::Else),
            b'f' => match bytes.get(1) {
                Some(b'a') => self.check_keyword(lexeme, "false", TokenKind::False),
                Some(b'o') => self.check_keyword(lexeme, "for", TokenKind::For),
                Some(b'u') => self.check_keyword(lexeme, "fun", TokenKind::Fun),
                _ => TokenKind::Identifier,
            },
            b'i' => self.check_keyword(lexeme, "if", TokenKind::If),
            b'n' => self.check_keyword(lexeme, "nil", TokenKind::Nil),
            b'o' => self.check_keyword(lexeme, "or", TokenKind::Or),
            b'p' => self.check_keyword(lexeme, "print", TokenKind::Print),
            b'r' => self.check_keyword(lexeme, "return", TokenKind::Return),
            b's' => self.check_keyword(lexeme, "super", TokenKind::Super),
            b't' => match bytes.get(1) {
                Some(b'h') => self.check_keyword(lexeme, "this", TokenKind::This),
                Some(b'r') => self.check_keyword(lexeme, "true", TokenKind::True),
                _ => TokenKind::Identifier,
            },
            b'v' => self.check_keyword(lexeme, "var", TokenKind::Var),
            b'w' => self.check_keyword(lexeme, "while", TokenKind::While),
            _ => TokenKind::Identifier,
        }
    }

    fn check_keyword(&self, lexeme: &str, keyword: &str, kind: TokenKind) -> TokenKind {
        if lexeme == keyword {
            kind
        } else {
            TokenKind::Identifier
        }
    }
}

fn is_digit(c: u8) -> bool {
    c.is_ascii_digit()
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}
