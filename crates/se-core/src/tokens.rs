// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Whitespace token stream used by the line-oriented scientific formats.

use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};

/// Sequential reader over the whitespace-separated tokens of a text file.
pub struct TokenReader {
    path: PathBuf,
    tokens: Vec<String>,
    cursor: usize,
}

impl TokenReader {
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| CoreError::io(path, e))?;
        Ok(Self::from_text(path, &text))
    }

    pub fn from_text(path: impl Into<PathBuf>, text: &str) -> Self {
        Self {
            path: path.into(),
            tokens: text.split_ascii_whitespace().map(str::to_owned).collect(),
            cursor: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cursor >= self.tokens.len()
    }

    /// Next raw token, or a parse error naming the file.
    pub fn next_str(&mut self) -> CoreResult<&str> {
        let tok = self
            .tokens
            .get(self.cursor)
            .ok_or_else(|| CoreError::parse(&self.path, "unexpected end of file"))?;
        self.cursor += 1;
        Ok(tok)
    }

    /// Peeks at the next token without consuming it.
    pub fn peek(&self) -> Option<&str> {
        self.tokens.get(self.cursor).map(String::as_str)
    }

    pub fn next_f64(&mut self) -> CoreResult<f64> {
        let path = self.path.clone();
        let tok = self.next_str()?;
        tok.parse::<f64>()
            .map_err(|_| CoreError::parse(path, format!("expected a float, found '{tok}'")))
    }

    pub fn next_usize(&mut self) -> CoreResult<usize> {
        let path = self.path.clone();
        let tok = self.next_str()?;
        tok.parse::<usize>()
            .map_err(|_| CoreError::parse(path, format!("expected an integer, found '{tok}'")))
    }

    pub fn next_u32(&mut self) -> CoreResult<u32> {
        let path = self.path.clone();
        let tok = self.next_str()?;
        tok.parse::<u32>()
            .map_err(|_| CoreError::parse(path, format!("expected an index, found '{tok}'")))
    }

    /// Consumes a literal token, failing if the stream holds something else.
    pub fn expect(&mut self, literal: &str) -> CoreResult<()> {
        let path = self.path.clone();
        let tok = self.next_str()?;
        if tok == literal {
            Ok(())
        } else {
            Err(CoreError::parse(
                path,
                format!("expected '{literal}', found '{tok}'"),
            ))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_mixed_tokens_in_order() {
        let mut tr = TokenReader::from_text("mem", "alpha 3 2.5\n -7.0");
        assert_eq!(tr.next_str().unwrap(), "alpha");
        assert_eq!(tr.next_usize().unwrap(), 3);
        assert_eq!(tr.next_f64().unwrap(), 2.5);
        assert_eq!(tr.next_f64().unwrap(), -7.0);
        assert!(tr.is_empty());
    }

    #[test]
    fn surfaces_the_offending_token() {
        let mut tr = TokenReader::from_text("mem", "xyz");
        let err = tr.next_f64().unwrap_err();
        assert!(err.to_string().contains("xyz"));
    }
}
