use std::borrow::Cow;
use std::iter::FusedIterator;

/// Scanner takes in source text and spits out tokens, one at a time.
#[derive(Debug, Clone)]
pub struct Scanner<'a> {
    // Unscanned input. The current token is `input[..scanned_input_len]`.
    input: &'a str,
    scanned_input_len: usize,
    current_line: usize,
    ended: bool,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
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

/// Token is a single token, including a ref to the raw characters that constitute it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token<'a> {
    /// What kind of token this is.
    pub typ: TokenType,
    /// The source text of the token. For `Error` tokens this is the error message instead,
    /// which is why it's a Cow.
    pub raw: Cow<'a, str>,
    /// 1-based source line the token ends on.
    pub line: usize,
}

impl<'a> Token<'a> {
    /// A token that didn't come from the source, like the placeholder the parser starts out with.
    pub fn synthetic(typ: TokenType, raw: &'static str, line: usize) -> Token<'a> {
        Token {
            typ,
            raw: Cow::Borrowed(raw),
            line,
        }
    }

    /// The literal's contents with the surrounding quotes removed. Only meaningful for `String` tokens.
    pub fn string_contents(&self) -> &str {
        let raw: &str = &self.raw;
        raw.strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
            .unwrap_or(raw)
    }
}

impl<'a> Scanner<'a> {
    /// Returns a fresh Scanner, ready to spit out tokens from the given source
    pub fn new(source: &'a str) -> Scanner<'a> {
        Scanner {
            input: source,
            current_line: 1,
            ended: false,
            scanned_input_len: 0,
        }
    }

    /// Returns the next token from the input, advancing the scanner.
    /// Errors are represented in-band as TokenType::Error.
    /// The scanner will return one Eof token, then None afterwards.
    pub fn next_token(&mut self) -> Option<Token<'a>> {
        self.skip_whitespace();
        let next_char = match self.take_next_char() {
            None if self.ended => return None,
            None => {
                self.ended = true;
                return Some(Token {
                    typ: TokenType::Eof,
                    raw: Cow::Borrowed(""),
                    line: self.current_line,
                });
            }
            Some(c) => c,
        };
        let token = match next_char {
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
            '!' => self.one_or_two('=', TokenType::BangEqual, TokenType::Bang),
            '=' => self.one_or_two('=', TokenType::EqualEqual, TokenType::Equal),
            '<' => self.one_or_two('=', TokenType::LessEqual, TokenType::Less),
            '>' => self.one_or_two('=', TokenType::GreaterEqual, TokenType::Greater),
            '"' => self.scan_string_literal(),
            '0'..='9' => self.scan_numeric_literal(),
            c if is_identifier_start(c) => self.scan_identifier_or_keyword(),
            _ => self.err_token("Unexpected character."),
        };
        self.reset_scanned_input();
        Some(token)
    }

    fn unscanned_input(&self) -> &'a str {
        &self.input[self.scanned_input_len..]
    }

    fn peek_next_char(&self) -> Option<char> {
        self.unscanned_input().chars().next()
    }

    fn peek_next_next_char(&self) -> Option<char> {
        self.unscanned_input().chars().nth(1)
    }

    fn take_next_char(&mut self) -> Option<char> {
        let next_char = self.peek_next_char()?;
        self.scanned_input_len += next_char.len_utf8();
        Some(next_char)
    }

    fn take_next_char_if_matches(&mut self, target: char) -> bool {
        if self.peek_next_char() == Some(target) {
            self.scanned_input_len += target.len_utf8();
            true
        } else {
            false
        }
    }

    fn one_or_two(&mut self, second: char, two: TokenType, one: TokenType) -> Token<'a> {
        if self.take_next_char_if_matches(second) {
            self.make_token(two)
        } else {
            self.make_token(one)
        }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek_next_char() {
                Some('\n') => {
                    self.current_line += 1;
                    self.take_next_char();
                }
                // only \n counts as a newline
                Some(c) if c.is_whitespace() => {
                    self.take_next_char();
                }
                Some('/') if self.peek_next_next_char() == Some('/') => {
                    // leave the \n for the next iteration so the line count stays right
                    while !matches!(self.peek_next_char(), Some('\n') | None) {
                        self.take_next_char();
                    }
                }
                _ => break,
            }
        }
        self.reset_scanned_input();
    }

    // Does NOT reset scanned input, the caller does that once the token is done.
    fn make_token(&self, typ: TokenType) -> Token<'a> {
        Token {
            typ,
            line: self.current_line,
            raw: Cow::Borrowed(&self.input[..self.scanned_input_len]),
        }
    }

    fn err_token(&self, message: &'static str) -> Token<'a> {
        Token {
            typ: TokenType::Error,
            raw: Cow::Borrowed(message),
            line: self.current_line,
        }
    }

    fn reset_scanned_input(&mut self) {
        self.input = self.unscanned_input();
        self.scanned_input_len = 0;
    }

    // The opening quote has been taken already. The token's raw text keeps both quotes.
    fn scan_string_literal(&mut self) -> Token<'a> {
        loop {
            match self.take_next_char() {
                Some('"') => return self.make_token(TokenType::String),
                Some('\n') => self.current_line += 1,
                Some(_) => {}
                None => return self.err_token("Unterminated string."),
            }
        }
    }

    // '1.' is not a number literal: the dot only joins the number if a digit follows it.
    fn scan_numeric_literal(&mut self) -> Token<'a> {
        self.take_digits();
        if self.peek_next_char() == Some('.')
            && matches!(self.peek_next_next_char(), Some('0'..='9'))
        {
            self.take_next_char();
            self.take_digits();
        }
        self.make_token(TokenType::Number)
    }

    fn take_digits(&mut self) {
        while let Some('0'..='9') = self.peek_next_char() {
            self.take_next_char();
        }
    }

    fn scan_identifier_or_keyword(&mut self) -> Token<'a> {
        while self.peek_next_char().map_or(false, is_identifier_char) {
            self.take_next_char();
        }
        self.make_token(keyword_or_identifier(&self.input[..self.scanned_input_len]))
    }
}

fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn keyword_or_identifier(text: &str) -> TokenType {
    match text {
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
        _ => TokenType::Identifier,
    }
}

impl<'a> Iterator for Scanner<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_token()
    }
}

impl<'a> FusedIterator for Scanner<'a> {}
