//! Error types for the text assembler

use std::fmt;

/// Result type for assembler operations
pub type AsmResult<T> = Result<T, AsmError>;

/// Error produced while assembling a program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmError {
    pub kind: AsmErrorKind,
    pub message: String,
    /// 1-based source line
    pub line: Option<usize>,
    /// Text of the offending statement
    pub source_line: Option<String>,
}

/// The kind of assembler error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsmErrorKind {
    /// Malformed statement or operand
    Syntax,
    /// Mnemonic the assembler does not know
    UnsupportedInstruction,
    /// Operand combination the instruction does not accept
    InvalidOperand,
    /// Labels or branch targets that cannot be encoded
    Encoding,
}

impl AsmError {
    /// Create a new syntax error
    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(AsmErrorKind::Syntax, message)
    }

    /// Create an unknown instruction error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(AsmErrorKind::UnsupportedInstruction, message)
    }

    /// Create an invalid operand error
    pub fn operand(message: impl Into<String>) -> Self {
        Self::new(AsmErrorKind::InvalidOperand, message)
    }

    /// Create an encoding error
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::new(AsmErrorKind::Encoding, message)
    }

    fn new(kind: AsmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
            source_line: None,
        }
    }

    /// Attach the location of the statement that failed
    ///
    /// A location that is already set is kept.
    pub fn at(mut self, line: usize, source_line: &str) -> Self {
        if self.line.is_none() {
            self.line = Some(line);
            self.source_line = Some(source_line.trim().to_string());
        }
        self
    }
}

impl From<iced_x86::IcedError> for AsmError {
    fn from(e: iced_x86::IcedError) -> Self {
        Self::encoding(e.to_string())
    }
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind_str = match self.kind {
            AsmErrorKind::Syntax => "Syntax error",
            AsmErrorKind::UnsupportedInstruction => "Unsupported instruction",
            AsmErrorKind::InvalidOperand => "Invalid operand",
            AsmErrorKind::Encoding => "Encoding error",
        };

        match (self.line, &self.source_line) {
            (Some(line), Some(source)) => {
                write!(f, "{} at line {} (`{}`): {}", kind_str, line, source, self.message)
            }
            (Some(line), None) => write!(f, "{} at line {}: {}", kind_str, line, self.message),
            _ => write!(f, "{}: {}", kind_str, self.message),
        }
    }
}

impl std::error::Error for AsmError {}
