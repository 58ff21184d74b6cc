//! Intel-syntax statement parser
//!
//! Statements are separated by newlines or `;`. Each statement may start with
//! any number of `name:` labels, followed by an instruction or a `db` line.
//! Register names are not known here; identifiers are resolved by the encoder.
//! Everything except the statement text kept for error messages is lowercased.

use super::error::{AsmError, AsmResult};

/// Size keyword in front of a memory operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySize {
    Byte,
    Word,
    Dword,
    Qword,
    Xmmword,
}

/// One `+`/`-` separated part of a memory operand
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryTerm {
    /// Register or label
    Ident(String),
    /// `reg*scale`
    Scaled(String, u32),
    Displacement(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Register or label
    Ident(String),
    Immediate(i64),
    Memory {
        size: Option<MemorySize>,
        terms: Vec<MemoryTerm>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Label(String),
    Instruction {
        mnemonic: String,
        operands: Vec<Operand>,
        /// Branch written as `jmp short target`
        short: bool,
        /// Written with a `lock` prefix
        lock: bool,
    },
    Data(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// 1-based source line
    pub line: usize,
    /// Statement text as written
    pub text: String,
    pub kind: StatementKind,
}

/// Split a program into statements
pub fn parse_program(source: &str) -> AsmResult<Vec<Statement>> {
    let mut statements = Vec::new();

    for (index, line) in source.lines().enumerate() {
        let line_no = index + 1;
        for text in line.split(';') {
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            parse_statement(text, line_no, &mut statements).map_err(|e| e.at(line_no, text))?;
        }
    }

    Ok(statements)
}

fn parse_statement(text: &str, line: usize, out: &mut Vec<Statement>) -> AsmResult<()> {
    let mut rest = text;

    while let Some((name, after)) = split_label(rest) {
        out.push(Statement {
            line,
            text: text.to_string(),
            kind: StatementKind::Label(name.to_lowercase()),
        });
        rest = after.trim_start();
    }

    if rest.is_empty() {
        return Ok(());
    }

    let (mut mnemonic, mut operand_text) = split_mnemonic(rest);
    let lock = mnemonic.eq_ignore_ascii_case("lock");
    if lock {
        (mnemonic, operand_text) = split_mnemonic(operand_text);
        if mnemonic.is_empty() {
            return Err(AsmError::syntax("`lock` without an instruction"));
        }
    }
    let mnemonic = mnemonic.to_lowercase();

    let kind = if mnemonic == "db" && !lock {
        StatementKind::Data(parse_data(operand_text)?)
    } else {
        let mut short = false;
        let mut operands = Vec::new();
        for part in split_operands(operand_text)? {
            let (operand, is_short) = parse_operand(part)?;
            short |= is_short;
            operands.push(operand);
        }
        StatementKind::Instruction {
            mnemonic,
            operands,
            short,
            lock,
        }
    };

    out.push(Statement {
        line,
        text: text.to_string(),
        kind,
    });
    Ok(())
}

/// First word of a statement and the text after it
fn split_mnemonic(text: &str) -> (&str, &str) {
    match text.find(char::is_whitespace) {
        Some(pos) => (&text[..pos], text[pos..].trim()),
        None => (text, ""),
    }
}

/// `name: rest` at the start of a statement
fn split_label(text: &str) -> Option<(&str, &str)> {
    let colon = text.find(':')?;
    let name = &text[..colon];
    is_identifier(name).then(|| (name, &text[colon + 1..]))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '.' || c == '@' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '@' || c == '$')
}

/// Split on commas outside of brackets
fn split_operands(text: &str) -> AsmResult<Vec<&str>> {
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth < 0 {
                    return Err(AsmError::syntax("unbalanced brackets"));
                }
            }
            ',' if depth == 0 => {
                parts.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(AsmError::syntax("unbalanced brackets"));
    }
    parts.push(text[start..].trim());

    if parts.iter().any(|p| p.is_empty()) {
        return Err(AsmError::syntax("empty operand"));
    }
    Ok(parts)
}

/// Parse one operand; the flag is set for a `short` prefix
fn parse_operand(text: &str) -> AsmResult<(Operand, bool)> {
    let lower = text.to_lowercase();
    let mut rest = lower.as_str();

    let mut short = false;
    if let Some(after) = strip_keyword(rest, "short") {
        short = true;
        rest = after;
    } else if let Some(after) = strip_keyword(rest, "near") {
        rest = after;
    }

    let mut size = None;
    for (keyword, s) in [
        ("byte", MemorySize::Byte),
        ("word", MemorySize::Word),
        ("dword", MemorySize::Dword),
        ("qword", MemorySize::Qword),
        ("xmmword", MemorySize::Xmmword),
    ] {
        if let Some(after) = strip_keyword(rest, keyword) {
            size = Some(s);
            rest = strip_keyword(after, "ptr").unwrap_or(after);
            break;
        }
    }

    if let Some(inner) = rest.strip_prefix('[') {
        let inner = inner
            .strip_suffix(']')
            .ok_or_else(|| AsmError::syntax(format!("expected `]` in `{}`", text)))?;
        let terms = parse_memory_terms(inner)?;
        return Ok((Operand::Memory { size, terms }, short));
    }

    if size.is_some() {
        return Err(AsmError::syntax(format!(
            "size keyword without memory operand in `{}`",
            text
        )));
    }

    if let Some(value) = parse_number(rest) {
        return Ok((Operand::Immediate(value), short));
    }

    if is_identifier(rest) {
        return Ok((Operand::Ident(rest.to_string()), short));
    }

    Err(AsmError::syntax(format!("cannot parse operand `{}`", text)))
}

fn strip_keyword<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let after = text.strip_prefix(keyword)?;
    match after.chars().next() {
        Some(c) if c.is_whitespace() || c == '[' => Some(after.trim_start()),
        _ => None,
    }
}

fn parse_memory_terms(inner: &str) -> AsmResult<Vec<MemoryTerm>> {
    let mut terms = Vec::new();
    let mut negative = false;
    let mut current = String::new();

    let mut push_term = |text: &str, negative: bool| -> AsmResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AsmError::syntax("empty term in memory operand"));
        }

        if let Some((left, right)) = text.split_once('*') {
            if negative {
                return Err(AsmError::syntax("scaled index cannot be subtracted"));
            }
            let (left, right) = (left.trim(), right.trim());
            let (reg, scale) = match (parse_number(right), parse_number(left)) {
                (Some(scale), _) => (left, scale),
                (None, Some(scale)) => (right, scale),
                _ => return Err(AsmError::syntax(format!("bad scaled index `{}`", text))),
            };
            if !matches!(scale, 1 | 2 | 4 | 8) || !is_identifier(reg) {
                return Err(AsmError::syntax(format!("bad scaled index `{}`", text)));
            }
            terms.push(MemoryTerm::Scaled(reg.to_string(), scale as u32));
        } else if let Some(value) = parse_number(text) {
            terms.push(MemoryTerm::Displacement(if negative {
                value.wrapping_neg()
            } else {
                value
            }));
        } else if is_identifier(text) {
            if negative {
                return Err(AsmError::syntax(format!("cannot subtract `{}`", text)));
            }
            terms.push(MemoryTerm::Ident(text.to_string()));
        } else {
            return Err(AsmError::syntax(format!("bad memory term `{}`", text)));
        }
        Ok(())
    };

    // Set once a sign has been applied to the term being read
    let mut signed = false;
    for c in inner.chars() {
        match c {
            '+' | '-' if !current.trim().is_empty() => {
                push_term(&current, negative)?;
                current.clear();
                negative = c == '-';
                signed = false;
            }
            // Unary sign, as in `[-8 + rax]` or `[rbx + -8]`
            '+' | '-' if !signed => {
                current.clear();
                negative ^= c == '-';
                signed = true;
            }
            '+' | '-' => return Err(AsmError::syntax("empty term in memory operand")),
            _ => current.push(c),
        }
    }
    push_term(&current, negative)?;

    Ok(terms)
}

/// Decimal, `0x` hex, or `h`-suffixed hex, with optional sign
pub(crate) fn parse_number(text: &str) -> Option<i64> {
    let text = text.trim();
    let (negative, digits) = match text.as_bytes().first()? {
        b'-' => (true, text[1..].trim_start()),
        b'+' => (false, text[1..].trim_start()),
        _ => (false, text),
    };

    let lower = digits.to_lowercase();
    let value = if let Some(hex) = lower.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()?
    } else if let Some(hex) = lower.strip_suffix('h') {
        if !hex.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        u64::from_str_radix(hex, 16).ok()?
    } else if lower.starts_with(|c: char| c.is_ascii_digit()) {
        lower.parse::<u64>().ok()?
    } else {
        return None;
    };

    let value = value as i64;
    Some(if negative { value.wrapping_neg() } else { value })
}

fn parse_data(text: &str) -> AsmResult<Vec<u8>> {
    split_operands(text)?
        .into_iter()
        .map(|item| {
            let value = parse_number(item)
                .ok_or_else(|| AsmError::syntax(format!("bad byte `{}`", item)))?;
            if (-128..=255).contains(&value) {
                Ok(value as u8)
            } else {
                Err(AsmError::operand(format!("byte out of range: {}", item)))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::AsmErrorKind;

    fn instruction(statement: &Statement) -> (&str, &[Operand], bool) {
        match &statement.kind {
            StatementKind::Instruction {
                mnemonic,
                operands,
                short,
                ..
            } => (mnemonic.as_str(), operands.as_slice(), *short),
            other => panic!("expected instruction, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number("0x1F"), Some(0x1F));
        assert_eq!(parse_number("0FFh"), Some(0xFF));
        assert_eq!(parse_number("-8"), Some(-8));
        assert_eq!(parse_number("0xFFFFFFFFFFFFFFFF"), Some(-1));
        assert_eq!(parse_number("FFh"), None);
        assert_eq!(parse_number("rax"), None);
    }

    #[test]
    fn test_parse_simple_instruction() {
        let statements = parse_program("mov eax, 1").unwrap();
        assert_eq!(statements.len(), 1);

        let (mnemonic, operands, short) = instruction(&statements[0]);
        assert_eq!(mnemonic, "mov");
        assert_eq!(
            operands,
            &[Operand::Ident("eax".into()), Operand::Immediate(1)]
        );
        assert!(!short);
    }

    #[test]
    fn test_parse_statement_separators() {
        let statements = parse_program("push rbx; mov rbx, rcx\n\n  pop rbx ;ret").unwrap();
        let mnemonics: Vec<&str> = statements.iter().map(|s| instruction(s).0).collect();
        assert_eq!(mnemonics, vec!["push", "mov", "pop", "ret"]);
        assert_eq!(statements[2].line, 3);
    }

    #[test]
    fn test_parse_labels() {
        let statements = parse_program("top: dec ecx\njnz short top\nend:").unwrap();
        assert_eq!(statements[0].kind, StatementKind::Label("top".into()));
        assert_eq!(instruction(&statements[1]).0, "dec");

        let (_, operands, short) = instruction(&statements[2]);
        assert!(short);
        assert_eq!(operands, &[Operand::Ident("top".into())]);
        assert_eq!(statements[3].kind, StatementKind::Label("end".into()));
    }

    #[test]
    fn test_parse_memory_operand() {
        let statements = parse_program("mov qword ptr [rax + rcx*8 - 0x10], rdx").unwrap();
        let (_, operands, _) = instruction(&statements[0]);
        assert_eq!(
            operands[0],
            Operand::Memory {
                size: Some(MemorySize::Qword),
                terms: vec![
                    MemoryTerm::Ident("rax".into()),
                    MemoryTerm::Scaled("rcx".into(), 8),
                    MemoryTerm::Displacement(-0x10),
                ],
            }
        );
    }

    #[test]
    fn test_parse_memory_without_ptr_keyword() {
        let statements = parse_program("movss xmm0, dword [4*rbx+rsi]").unwrap();
        let (_, operands, _) = instruction(&statements[0]);
        assert_eq!(
            operands[1],
            Operand::Memory {
                size: Some(MemorySize::Dword),
                terms: vec![
                    MemoryTerm::Scaled("rbx".into(), 4),
                    MemoryTerm::Ident("rsi".into()),
                ],
            }
        );
    }

    #[test]
    fn test_parse_signed_displacement_after_plus() {
        let statements = parse_program("mov eax, dword ptr [rbx + -8]\nlea rcx, [rsi - -4]").unwrap();
        let (_, first, _) = instruction(&statements[0]);
        assert_eq!(
            first[1],
            Operand::Memory {
                size: Some(MemorySize::Dword),
                terms: vec![MemoryTerm::Ident("rbx".into()), MemoryTerm::Displacement(-8)],
            }
        );
        let (_, second, _) = instruction(&statements[1]);
        assert_eq!(
            second[1],
            Operand::Memory {
                size: None,
                terms: vec![MemoryTerm::Ident("rsi".into()), MemoryTerm::Displacement(4)],
            }
        );
        assert!(parse_program("mov eax, [rbx + - -8]").is_err());
        assert!(parse_program("mov eax, [rbx + -rcx]").is_err());
    }

    #[test]
    fn test_parse_lock_prefix() {
        let statements = parse_program("lock inc dword ptr [rax]\nLOCK xadd [rcx], eax\ninc eax").unwrap();
        let locks: Vec<bool> = statements
            .iter()
            .map(|s| matches!(s.kind, StatementKind::Instruction { lock: true, .. }))
            .collect();
        assert_eq!(locks, vec![true, true, false]);
        assert_eq!(instruction(&statements[1]).0, "xadd");
        assert_eq!(parse_program("lock").unwrap_err().kind, AsmErrorKind::Syntax);
    }

    #[test]
    fn test_parse_data() {
        let statements = parse_program("db 0x90, 0CCh, -1").unwrap();
        assert_eq!(statements[0].kind, StatementKind::Data(vec![0x90, 0xCC, 0xFF]));
    }

    #[test]
    fn test_parse_errors_carry_line() {
        let err = parse_program("nop\nmov eax, [rbx").unwrap_err();
        assert_eq!(err.kind, AsmErrorKind::Syntax);
        assert_eq!(err.line, Some(2));
        assert_eq!(err.source_line.as_deref(), Some("mov eax, [rbx"));
    }

    #[test]
    fn test_parse_rejects_bad_operand() {
        assert!(parse_program("mov eax, $$").is_err());
        assert!(parse_program("mov eax,, 1").is_err());
        assert!(parse_program("lea rax, [rbx*3]").is_err());
        assert!(parse_program("db 256").is_err());
    }
}
