//! Parses the Breakpad text symbol format into a [`Module`].
//!
//! The format is line oriented. A record either matches one of the known
//! directive prefixes (`MODULE`, `FILE`, `FUNC`, `PUBLIC`, `STACK`) or is
//! a source line record belonging to the most recent `FUNC`. Structurally
//! malformed records fail the whole load; records the index containers
//! decline (overlapping ranges, duplicate addresses) are dropped with a
//! log line, because real-world symbol dumps are known to contain them.

use std::io::BufRead;

use log::{debug, warn};
use thiserror::Error;

use crate::module::{Function, Line, Module, PublicSymbol, StackFrameInfo, StackInfoType};
use crate::range_map::RangeMap;

/// A fatal error encountered while parsing a text symbol file.
///
/// Any of these discards the partially built module.
#[derive(Debug, Error)]
pub enum ParseError {
    /// A `FILE` record had a bad token count or an unparseable id.
    #[error("malformed FILE record on line {0}")]
    BadFileRecord(u64),
    /// A `FUNC` record had a bad token count or unparseable numbers.
    #[error("malformed FUNC record on line {0}")]
    BadFuncRecord(u64),
    /// A `PUBLIC` record had a bad token count or unparseable numbers.
    #[error("malformed PUBLIC record on line {0}")]
    BadPublicRecord(u64),
    /// A `STACK` record was not `STACK WIN` with a known frame type, or
    /// its fields did not parse.
    #[error("malformed or unsupported STACK record on line {0}")]
    BadStackRecord(u64),
    /// A source line record had a bad token count, unparseable numbers,
    /// or a non-positive line number.
    #[error("malformed source line record on line {0}")]
    BadLineRecord(u64),
    /// A source line record appeared before any `FUNC` record.
    #[error("source line record without a preceding FUNC on line {0}")]
    OrphanLineRecord(u64),
    /// The underlying reader failed.
    #[error("failed to read symbol data: {0}")]
    Io(#[from] std::io::Error),
}

/// Streams `reader` line by line into a freshly built [`Module`].
pub(crate) fn parse_symbol_file<R: BufRead>(
    name: String,
    mut reader: R,
) -> Result<Module, ParseError> {
    let mut module = Module::new(name);
    let mut current_function: Option<Function> = None;

    // FUNC records of heavily templated code produce very long lines;
    // start big and let read_line grow the buffer past that.
    let mut buffer = String::with_capacity(8192);
    let mut line_number = 0u64;

    loop {
        buffer.clear();
        if reader.read_line(&mut buffer)? == 0 {
            break;
        }
        line_number += 1;
        let line = buffer.trim_end_matches(['\r', '\n']);

        if let Some(rest) = line.strip_prefix("FILE ") {
            parse_file(&mut module, rest).ok_or(ParseError::BadFileRecord(line_number))?;
        } else if let Some(rest) = line.strip_prefix("STACK ") {
            parse_stack_info(&mut module, rest).ok_or(ParseError::BadStackRecord(line_number))?;
        } else if let Some(rest) = line.strip_prefix("FUNC ") {
            commit_function(&mut module, current_function.take());
            current_function =
                Some(parse_function(rest).ok_or(ParseError::BadFuncRecord(line_number))?);
        } else if let Some(rest) = line.strip_prefix("PUBLIC ") {
            // Public symbols carry no line records, so any open function
            // ends here.
            commit_function(&mut module, current_function.take());
            parse_public_symbol(&mut module, rest)
                .ok_or(ParseError::BadPublicRecord(line_number))?;
        } else if line.starts_with("MODULE ") {
            // MODULE <guid> <age> <filename> only aids symbol file
            // placement; the resolver is handed its module name by the
            // caller.
        } else {
            let function = current_function
                .as_mut()
                .ok_or(ParseError::OrphanLineRecord(line_number))?;
            let record = parse_line(line).ok_or(ParseError::BadLineRecord(line_number))?;
            let (address, size) = (record.address, record.size);
            if !function.lines.store_range(address, size, record) {
                debug!("line {line_number}: dropping overlapping source line record at {address:#x}");
            }
        }
    }

    commit_function(&mut module, current_function.take());
    Ok(module)
}

/// Moves a finished function into the module's function index.
///
/// The index declines empty and overlapping ranges; such functions are
/// dropped together with all line records attached to them.
fn commit_function(module: &mut Module, function: Option<Function>) {
    if let Some(function) = function {
        let (address, size) = (function.address, function.size);
        if !module.functions.store_range(address, size, function) {
            warn!("dropping FUNC record at {address:#x} with empty or overlapping range");
        }
    }
}

// FILE <id> <filename>
fn parse_file(module: &mut Module, rest: &str) -> Option<()> {
    let tokens = tokenize(rest, 2)?;
    let id: u32 = tokens[0].parse().ok()?;
    let filename = tokens[1];
    module
        .files
        .entry(id)
        .or_insert_with(|| filename.to_string());
    Some(())
}

// FUNC <address> <size> <stack_param_size> <name>
fn parse_function(rest: &str) -> Option<Function> {
    let tokens = tokenize(rest, 4)?;
    Some(Function {
        address: parse_hex(tokens[0])?,
        size: parse_hex(tokens[1])?,
        parameter_size: parse_hex(tokens[2])? as u32,
        name: tokens[3].to_string(),
        lines: RangeMap::new(),
    })
}

// PUBLIC <address> <stack_param_size> <name>
fn parse_public_symbol(module: &mut Module, rest: &str) -> Option<()> {
    let tokens = tokenize(rest, 3)?;
    let address = parse_hex(tokens[0])?;
    let parameter_size = parse_hex(tokens[1])? as u32;
    let name = tokens[2];

    // PDB dumps of some system libraries contain public symbols at
    // address zero. They can never match a lookup and would collide with
    // one another, so they are accepted but not indexed.
    if address == 0 {
        return Some(());
    }

    let symbol = PublicSymbol {
        name: name.to_string(),
        address,
        parameter_size,
    };
    if !module.public_symbols.store(address, symbol) {
        debug!("dropping duplicate PUBLIC record at {address:#x}");
    }
    Some(())
}

// STACK WIN <type> <rva> <code_size> <prolog_size> <epilog_size>
// <parameter_size> <saved_register_size> <local_size> <max_stack_size>
// <has_program_string> <program_string-or-allocates_base_pointer>
fn parse_stack_info(module: &mut Module, rest: &str) -> Option<()> {
    let tokens = tokenize(rest, 12)?;

    // Only MSVC-style frame info is understood.
    if tokens[0] != "WIN" {
        return None;
    }
    let info_type = StackInfoType::from_index(parse_hex(tokens[1])?)?;

    let rva = parse_hex(tokens[2])?;
    let code_size = parse_hex(tokens[3])?;
    let prolog_size = parse_hex(tokens[4])? as u32;
    let epilog_size = parse_hex(tokens[5])? as u32;
    let parameter_size = parse_hex(tokens[6])? as u32;
    let saved_register_size = parse_hex(tokens[7])? as u32;
    let local_size = parse_hex(tokens[8])? as u32;
    let max_stack_size = parse_hex(tokens[9])? as u32;
    let has_program_string = parse_hex(tokens[10])? != 0;

    let (program_string, allocates_base_pointer) = if has_program_string {
        (tokens[11].to_string(), false)
    } else {
        (String::new(), parse_hex(tokens[11])? != 0)
    };

    let info = StackFrameInfo {
        valid: StackFrameInfo::VALID_ALL,
        prolog_size,
        epilog_size,
        parameter_size,
        saved_register_size,
        local_size,
        max_stack_size,
        allocates_base_pointer,
        program_string,
    };

    // MSVC infrequently emits frame data rows whose prologs make sibling
    // ranges appear to conflict. Dropping the offender keeps the rest of
    // the file usable.
    if !module.stack_info[info_type as usize].store_range(rva, code_size, info) {
        debug!("dropping STACK WIN record at {rva:#x} violating containment");
    }
    Some(())
}

// <address> <size> <line_number> <source_file_id>
fn parse_line(line: &str) -> Option<Line> {
    let tokens = tokenize(line, 4)?;
    let address = parse_hex(tokens[0])?;
    let size = parse_hex(tokens[1])?;
    let number: i64 = tokens[2].parse().ok()?;
    if number <= 0 || number > i64::from(u32::MAX) {
        return None;
    }
    let source_file_id: u32 = tokens[3].parse().ok()?;
    Some(Line {
        address,
        size,
        source_file_id,
        line: number as u32,
    })
}

/// Splits `line` into exactly `max_tokens` space-separated tokens.
///
/// Runs of spaces separate the leading tokens. The final token is the
/// rest of the line after the single separating space, taken verbatim,
/// so function names and program strings keep any spaces of their own.
/// Returns `None` when fewer tokens are present.
fn tokenize(line: &str, max_tokens: usize) -> Option<Vec<&str>> {
    let mut tokens = Vec::with_capacity(max_tokens);
    let mut rest = line;
    while tokens.len() + 1 < max_tokens {
        rest = rest.trim_start_matches(' ');
        if rest.is_empty() {
            break;
        }
        match rest.split_once(' ') {
            Some((token, tail)) => {
                tokens.push(token);
                rest = tail;
            }
            None => {
                tokens.push(rest);
                rest = "";
            }
        }
    }

    if tokens.len() + 1 == max_tokens && !rest.is_empty() {
        tokens.push(rest);
    }
    (tokens.len() == max_tokens).then_some(tokens)
}

/// Parses a base-16 field, tolerating a leading `0x` as C's `strtoull`
/// does.
fn parse_hex(token: &str) -> Option<u64> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u64::from_str_radix(digits, 16).ok()
}
