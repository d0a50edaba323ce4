use thiserror::Error;

use crate::tokenizer::Token;

/// Errors raised while compiling a schema or parsing a binary stream.
///
/// Compile-time variants carry the offending token or script offset,
/// runtime variants the bytecode offset and, where known, the dotted
/// path of the field being read.
#[derive(Debug, Error)]
pub enum Error {
    #[error("tokenization error at offset {offset}: {message}")]
    Tokenization { offset: usize, message: String },

    #[error("compilation error: {message}")]
    Compilation {
        message: String,
        token: Option<Token>,
    },

    #[error("expression error: {message}")]
    Expression { message: String },

    #[error("parsing error at bytecode offset {offset}: {message}")]
    Parsing {
        message: String,
        offset: usize,
        path: Option<String>,
    },

    #[error("unexpected end of stream: {message}")]
    EndOfStream { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    pub(crate) fn compilation(message: impl Into<String>, token: Option<&Token>) -> Self {
        Error::Compilation {
            message: message.into(),
            token: token.cloned(),
        }
    }

    pub(crate) fn expression(message: impl Into<String>) -> Self {
        Error::Expression {
            message: message.into(),
        }
    }

    pub(crate) fn parsing(message: impl Into<String>, offset: usize, path: Option<&str>) -> Self {
        Error::Parsing {
            message: message.into(),
            offset,
            path: path.map(str::to_string),
        }
    }

    pub(crate) fn eos(message: impl Into<String>) -> Self {
        Error::EndOfStream {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
