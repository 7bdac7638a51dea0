use luma_core::LuaError;

use crate::token::{Token, TokenKind};

/// Byte-slice tokenizer. Aborts on the first lexical error; the error
/// carries the chunk name and the line the offending lexeme started on.
pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    chunk: String,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str, chunk: &str) -> Lexer<'a> {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            chunk: chunk.to_string(),
        }
    }

    /// Tokenizes the whole chunk, ending with an `Eof` token.
    pub fn tokenize(mut self) -> Result<Vec<Token>, LuaError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace_and_comments()?;
            let line = self.line;
            match self.peek() {
                None => {
                    tokens.push(Token {
                        kind: TokenKind::Eof,
                        line,
                    });
                    return Ok(tokens);
                }
                Some(c) => {
                    let kind = self.scan_token(c)?;
                    tokens.push(Token { kind, line });
                }
            }
        }
    }

    fn error(&self, message: impl Into<String>) -> LuaError {
        LuaError::Syntax {
            chunk: self.chunk.clone(),
            line: self.line,
            message: message.into(),
        }
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

    fn eat(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), LuaError> {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                    self.bump();
                }
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    self.pos += 2;
                    if self.peek() == Some(b'[') {
                        if let Some(level) = self.long_bracket_level() {
                            self.read_long_string(level)?;
                            continue;
                        }
                    }
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn scan_token(&mut self, c: u8) -> Result<TokenKind, LuaError> {
        match c {
            b'0'..=b'9' => self.read_number(),
            b'"' | b'\'' => self.read_short_string(c),
            b'[' => match self.long_bracket_level() {
                Some(level) => Ok(TokenKind::Str(self.read_long_string(level)?)),
                None => self.read_symbol(),
            },
            c if c == b'_' || c.is_ascii_alphabetic() => Ok(self.read_name()),
            _ => self.read_symbol(),
        }
    }

    /// If the cursor sits on `[`, `[=`, `[==`… followed by `[`, returns the
    /// nesting level and leaves the cursor after the opening bracket pair.
    /// Otherwise the cursor is untouched.
    fn long_bracket_level(&mut self) -> Option<usize> {
        if self.peek() != Some(b'[') {
            return None;
        }
        let mut level = 0;
        while self.peek_at(1 + level) == Some(b'=') {
            level += 1;
        }
        if self.peek_at(1 + level) == Some(b'[') {
            self.pos += level + 2;
            Some(level)
        } else {
            None
        }
    }

    fn read_long_string(&mut self, level: usize) -> Result<String, LuaError> {
        // A newline immediately after the opening bracket is skipped.
        if self.peek() == Some(b'\r') {
            self.bump();
            self.eat(b'\n');
        } else if self.peek() == Some(b'\n') {
            self.bump();
        }

        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unfinished long string")),
                Some(b']') => {
                    let mut eqs = 0;
                    while self.peek_at(1 + eqs) == Some(b'=') {
                        eqs += 1;
                    }
                    if eqs == level && self.peek_at(1 + eqs) == Some(b']') {
                        self.pos += level + 2;
                        break;
                    }
                    out.push(b']');
                    self.pos += 1;
                }
                Some(_) => {
                    // bump() keeps the line counter honest inside the literal
                    if let Some(c) = self.bump() {
                        out.push(c);
                    }
                }
            }
        }
        String::from_utf8(out).map_err(|_| self.error("invalid UTF-8 in string"))
    }

    fn read_short_string(&mut self, quote: u8) -> Result<TokenKind, LuaError> {
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None | Some(b'\n') => return Err(self.error("unfinished string")),
                Some(c) if c == quote => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    self.pos += 1;
                    self.read_escape(&mut out)?;
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
        String::from_utf8(out)
            .map(TokenKind::Str)
            .map_err(|_| self.error("invalid UTF-8 in string"))
    }

    fn read_escape(&mut self, out: &mut Vec<u8>) -> Result<(), LuaError> {
        let c = self.bump().ok_or_else(|| self.error("unfinished string"))?;
        match c {
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'\\' => out.push(b'\\'),
            b'"' => out.push(b'"'),
            b'\'' => out.push(b'\''),
            b'\n' => out.push(b'\n'),
            b'x' => {
                let hi = self.hex_digit()?;
                let lo = self.hex_digit()?;
                out.push((hi << 4) | lo);
            }
            b'z' => {
                while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
                    self.bump();
                }
            }
            b'0'..=b'9' => {
                let mut n = (c - b'0') as u32;
                for _ in 0..2 {
                    match self.peek() {
                        Some(d @ b'0'..=b'9') => {
                            n = n * 10 + (d - b'0') as u32;
                            self.pos += 1;
                        }
                        _ => break,
                    }
                }
                if n > 255 {
                    return Err(self.error("decimal escape too large"));
                }
                out.push(n as u8);
            }
            _ => return Err(self.error("invalid escape sequence")),
        }
        Ok(())
    }

    fn hex_digit(&mut self) -> Result<u8, LuaError> {
        match self.bump() {
            Some(c @ b'0'..=b'9') => Ok(c - b'0'),
            Some(c @ b'a'..=b'f') => Ok(c - b'a' + 10),
            Some(c @ b'A'..=b'F') => Ok(c - b'A' + 10),
            _ => Err(self.error("hexadecimal digit expected")),
        }
    }

    fn read_name(&mut self) -> TokenKind {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c == b'_' || c.is_ascii_alphanumeric()) {
            self.pos += 1;
        }
        // identifier bytes are ASCII by construction
        let word = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
        TokenKind::keyword(word).unwrap_or_else(|| TokenKind::Name(word.to_string()))
    }

    fn read_number(&mut self) -> Result<TokenKind, LuaError> {
        let start = self.pos;

        if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x' | b'X')) {
            self.pos += 2;
            let digits = self.pos;
            while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit()) {
                self.pos += 1;
            }
            if self.pos == digits {
                return Err(self.error("malformed number"));
            }
            let text = std::str::from_utf8(&self.src[digits..self.pos])
                .map_err(|_| self.error("malformed number"))?;
            let n = i64::from_str_radix(text, 16).map_err(|_| self.error("malformed number"))?;
            return Ok(TokenKind::Int(n));
        }

        let mut is_float = false;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') && self.peek_at(1) != Some(b'.') {
            is_float = true;
            self.pos += 1;
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            is_float = true;
            self.pos += 1;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            let digits = self.pos;
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
            if self.pos == digits {
                return Err(self.error("malformed number"));
            }
        }
        if matches!(self.peek(), Some(c) if c == b'_' || c.is_ascii_alphabetic()) {
            return Err(self.error("malformed number"));
        }

        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.error("malformed number"))?;
        if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| self.error("malformed number"))
        } else {
            match text.parse::<i64>() {
                Ok(n) => Ok(TokenKind::Int(n)),
                // integer literals past i64::MAX fall back to float
                Err(_) => text
                    .parse::<f64>()
                    .map(TokenKind::Float)
                    .map_err(|_| self.error("malformed number")),
            }
        }
    }

    fn read_symbol(&mut self) -> Result<TokenKind, LuaError> {
        let c = self.bump().ok_or_else(|| self.error("unexpected end of input"))?;
        let kind = match c {
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => TokenKind::Star,
            b'/' => {
                if self.eat(b'/') {
                    TokenKind::DoubleSlash
                } else {
                    TokenKind::Slash
                }
            }
            b'%' => TokenKind::Percent,
            b'^' => TokenKind::Caret,
            b'#' => TokenKind::Hash,
            b'=' => {
                if self.eat(b'=') {
                    TokenKind::Eq
                } else {
                    TokenKind::Assign
                }
            }
            b'~' => {
                if self.eat(b'=') {
                    TokenKind::Ne
                } else {
                    return Err(self.error("unexpected symbol near '~'"));
                }
            }
            b'<' => {
                if self.eat(b'=') {
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            b'>' => {
                if self.eat(b'=') {
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b';' => TokenKind::Semi,
            b':' => {
                if self.eat(b':') {
                    TokenKind::DoubleColon
                } else {
                    TokenKind::Colon
                }
            }
            b',' => TokenKind::Comma,
            b'.' => {
                if self.eat(b'.') {
                    if self.eat(b'.') {
                        TokenKind::Ellipsis
                    } else {
                        TokenKind::Concat
                    }
                } else {
                    TokenKind::Dot
                }
            }
            other => {
                return Err(self.error(format!(
                    "unexpected symbol near '{}'",
                    (other as char).escape_default()
                )))
            }
        };
        Ok(kind)
    }
}
