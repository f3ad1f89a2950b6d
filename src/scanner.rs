use std::iter::Peekable;
use std::str::Chars;

use strum_macros::{Display, EnumString};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
pub enum TokenType {
    // Single-character tokens.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,

    // One or two character tokens.
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,

    // Literals.
    Identifier,
    String,
    Number,

    // Keywords.
    And,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,

    Error,
    Eof,
}

static KEYWORDS: phf::Map<&'static str, TokenType> = phf::phf_map! {
    "and" => TokenType::And,
    "class" => TokenType::Class,
    "else" => TokenType::Else,
    "false" => TokenType::False,
    "for" => TokenType::For,
    "fun" => TokenType::Fun,
    "if" => TokenType::If,
    "nil" => TokenType::Nil,
    "or" => TokenType::Or,
    "print" => TokenType::Print,
    "return" => TokenType::Return,
    "super" => TokenType::Super,
    "this" => TokenType::This,
    "true" => TokenType::True,
    "var" => TokenType::Var,
    "while" => TokenType::While,
};

#[derive(Debug, Clone)]
pub struct Token<'a> {
    pub token_type: TokenType,
    pub value: &'a str,
    pub line: u32,
}

impl<'a> Token<'a> {
    pub fn empty() -> Token<'a> {
        Token {
            token_type: TokenType::Eof,
            value: "",
            line: 0,
        }
    }
}

/// Lazy tokenizer: each `scan_token` call produces the next token, with the
/// lexeme borrowed straight out of the source text.
pub struct Scanner<'a> {
    source: &'a str,
    chars: Peekable<Chars<'a>>,
    start: usize,
    current: usize,
    line: u32,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Scanner<'a> {
        Scanner {
            source,
            chars: source.chars().peekable(),
            start: 0,
            current: 0,
            line: 1,
        }
    }

    pub fn scan_token(&mut self) -> Token<'a> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_end() {
            return self.make_token(TokenType::Eof);
        }

        let c = self.advance();

        if Self::is_alpha(c) {
            return self.make_identifier_token();
        }
        if Self::is_digit(c) {
            return self.make_number_token();
        }

        match c {
            '(' => self.make_token(TokenType::LeftParen),
            ')' => self.make_token(TokenType::RightParen),
            '{' => self.make_token(TokenType::LeftBrace),
            '}' => self.make_token(TokenType::RightBrace),
            ';' => self.make_token(TokenType::Semicolon),
            ',' => self.make_token(TokenType::Comma),
            '.' => self.make_token(TokenType::Dot),
            '-' => self.make_token(TokenType::Minus),
            '+' => self.make_token(TokenType::Plus),
            '/' => self.make_token(TokenType::Slash),
            '*' => self.make_token(TokenType::Star),
            '"' => self.make_string_token(),
            '!' => {
                if self.match_char('=') {
                    self.make_token(TokenType::BangEqual)
                } else {
                    self.make_token(TokenType::Bang)
                }
            }
            '=' => {
                if self.match_char('=') {
                    self.make_token(TokenType::EqualEqual)
                } else {
                    self.make_token(TokenType::Equal)
                }
            }
            '<' => {
                if self.match_char('=') {
                    self.make_token(TokenType::LessEqual)
                } else {
                    self.make_token(TokenType::Less)
                }
            }
            '>' => {
                if self.match_char('=') {
                    self.make_token(TokenType::GreaterEqual)
                } else {
                    self.make_token(TokenType::Greater)
                }
            }
            _ => self.error_token("Unexpected character."),
        }
    }

    fn is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    fn is_alpha(c: char) -> bool {
        c.is_ascii_alphabetic() || c == '_'
    }

    fn make_identifier_token(&mut self) -> Token<'a> {
        while let Some(&c) = self.peek() {
            if Self::is_alpha(c) || Self::is_digit(c) {
                self.advance();
            } else {
                break;
            }
        }
        let token_type = self.identifier_type();
        self.make_token(token_type)
    }

    fn identifier_type(&self) -> TokenType {
        let lexeme = &self.source[self.start..self.current];
        KEYWORDS
            .get(lexeme)
            .copied()
            .unwrap_or(TokenType::Identifier)
    }

    fn make_number_token(&mut self) -> Token<'a> {
        while let Some(&c) = self.peek() {
            if Self::is_digit(c) {
                self.advance();
            } else {
                break;
            }
        }

        // A fractional part needs a digit after the dot, otherwise the dot is
        // left for the next token.
        if self.peek() == Some(&'.') {
            if let Some(c) = self.peek_next() {
                if Self::is_digit(c) {
                    self.advance();
                    while let Some(&c) = self.peek() {
                        if Self::is_digit(c) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
            }
        }

        self.make_token(TokenType::Number)
    }

    fn make_string_token(&mut self) -> Token<'a> {
        loop {
            match self.peek() {
                Some('"') => break,
                Some('\n') => {
                    self.line += 1;
                    self.advance();
                }
                Some(_) => {
                    self.advance();
                }
                None => return self.error_token("Unterminated string."),
            }
        }

        // The closing quote.
        self.advance();
        self.make_token(TokenType::String)
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                Some(' ') | Some('\r') | Some('\t') => {
                    self.advance();
                }
                Some('\n') => {
                    self.line += 1;
                    self.advance();
                }
                Some('/') => {
                    if self.peek_next() == Some('/') {
                        while let Some(&c) = self.peek() {
                            if c == '\n' {
                                break;
                            }
                            self.advance();
                        }
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn peek(&mut self) -> Option<&char> {
        self.chars.peek()
    }

    fn peek_next(&self) -> Option<char> {
        let mut iter = self.chars.clone();
        iter.next();
        iter.next()
    }

    fn is_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn make_token(&self, token_type: TokenType) -> Token<'a> {
        Token {
            token_type,
            value: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, reason: &'static str) -> Token<'a> {
        Token {
            token_type: TokenType::Error,
            value: reason,
            line: self.line,
        }
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(&expected) {
            self.advance();
            return true;
        }
        false
    }

    fn advance(&mut self) -> char {
        match self.chars.next() {
            Some(c) => {
                self.current += c.len_utf8();
                c
            }
            None => '\0',
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(source: &str) -> Vec<Token<'_>> {
        let mut scanner = Scanner::new(source);
        let mut tokens = vec![];
        loop {
            let token = scanner.scan_token();
            let done = token.token_type == TokenType::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }

    #[test]
    fn keywords_and_identifiers() {
        let tokens = scan_all("fun funny var variable while whilex");
        let kinds: Vec<TokenType> = tokens.iter().map(|t| t.token_type).collect();
        assert_eq!(
            kinds,
            vec![
                TokenType::Fun,
                TokenType::Identifier,
                TokenType::Var,
                TokenType::Identifier,
                TokenType::While,
                TokenType::Identifier,
                TokenType::Eof,
            ]
        );
        assert_eq!(tokens[1].value, "funny");
    }

    #[test]
    fn one_and_two_character_operators() {
        let tokens = scan_all("! != = == < <= > >=");
        let kinds: Vec<TokenType> = tokens.iter().map(|t| t.token_type).collect();
        assert_eq!(
            kinds,
            vec![
                TokenType::Bang,
                TokenType::BangEqual,
                TokenType::Equal,
                TokenType::EqualEqual,
                TokenType::Less,
                TokenType::LessEqual,
                TokenType::Greater,
                TokenType::GreaterEqual,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn numbers_with_and_without_fraction() {
        let tokens = scan_all("12 3.5 4.");
        assert_eq!(tokens[0].token_type, TokenType::Number);
        assert_eq!(tokens[0].value, "12");
        assert_eq!(tokens[1].token_type, TokenType::Number);
        assert_eq!(tokens[1].value, "3.5");
        // "4." is the number 4 followed by a dot token.
        assert_eq!(tokens[2].token_type, TokenType::Number);
        assert_eq!(tokens[2].value, "4");
        assert_eq!(tokens[3].token_type, TokenType::Dot);
    }

    #[test]
    fn string_lexeme_includes_quotes() {
        let tokens = scan_all("\"hello\"");
        assert_eq!(tokens[0].token_type, TokenType::String);
        assert_eq!(tokens[0].value, "\"hello\"");
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let tokens = scan_all("\"open");
        assert_eq!(tokens[0].token_type, TokenType::Error);
        assert_eq!(tokens[0].value, "Unterminated string.");
    }

    #[test]
    fn comments_and_newlines_track_lines() {
        let tokens = scan_all("one // a comment\ntwo\nthree");
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 2);
        assert_eq!(tokens[1].value, "two");
        assert_eq!(tokens[2].line, 3);
    }

    #[test]
    fn multiline_string_advances_the_line_counter() {
        let tokens = scan_all("\"a\nb\" x");
        assert_eq!(tokens[0].token_type, TokenType::String);
        assert_eq!(tokens[1].line, 2);
    }

    #[test]
    fn unexpected_character_is_an_error() {
        let tokens = scan_all("%");
        assert_eq!(tokens[0].token_type, TokenType::Error);
    }

    #[test]
    fn underscored_identifiers() {
        let tokens = scan_all("_private name_2");
        assert_eq!(tokens[0].token_type, TokenType::Identifier);
        assert_eq!(tokens[0].value, "_private");
        assert_eq!(tokens[1].value, "name_2");
    }
}
