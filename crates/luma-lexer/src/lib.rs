//! Tokenizer: turns source text into a line-annotated token stream.

mod lexer;
mod token;

pub use lexer::Lexer;
pub use token::{Token, TokenKind};
