//! The in-memory symbol index for one code module.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::address_map::AddressMap;
use crate::contained_range_map::ContainedRangeMap;
use crate::parser::{self, ParseError};
use crate::range_map::RangeMap;

/// The number of [`StackInfoType`] variants, and therefore the number of
/// stack info trees a [`Module`] carries.
pub const STACK_INFO_COUNT: usize = 5;

/// The kind of a `STACK WIN` record.
///
/// These mirror the frame type enumeration of the MSVC debug interface.
/// All five kinds are parsed, indexed and serialized, but only
/// [`FrameData`](StackInfoType::FrameData) and [`Fpo`](StackInfoType::Fpo)
/// are consulted when resolving an address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackInfoType {
    /// Frame pointer omission records with fixed numeric fields.
    Fpo = 0,
    /// Trap frames. Indexed for completeness, never consulted.
    Trap = 1,
    /// Task switch frames. Indexed for completeness, never consulted.
    Tss = 2,
    /// Standard frames.
    Standard = 3,
    /// Frame data records carrying an unwinder program string.
    FrameData = 4,
}

impl StackInfoType {
    /// Maps the numeric `type` field of a `STACK WIN` record to its kind.
    pub fn from_index(value: u64) -> Option<StackInfoType> {
        match value {
            0 => Some(StackInfoType::Fpo),
            1 => Some(StackInfoType::Trap),
            2 => Some(StackInfoType::Tss),
            3 => Some(StackInfoType::Standard),
            4 => Some(StackInfoType::FrameData),
            _ => None,
        }
    }
}

/// How to recover the stack frame at an address range.
///
/// The numeric fields are only meaningful for the bits set in `valid`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StackFrameInfo {
    /// Which of the other fields carry data, as a combination of the
    /// `VALID_*` constants.
    pub valid: u32,
    /// Size of the function prolog in bytes.
    pub prolog_size: u32,
    /// Size of the function epilog in bytes.
    pub epilog_size: u32,
    /// Bytes of parameters passed on the stack.
    pub parameter_size: u32,
    /// Bytes of callee-saved registers.
    pub saved_register_size: u32,
    /// Bytes of local variables.
    pub local_size: u32,
    /// Maximum stack consumption of the range.
    pub max_stack_size: u32,
    /// Whether the range allocates a base pointer register.
    pub allocates_base_pointer: bool,
    /// The unwinder program string of frame data records; empty
    /// otherwise.
    pub program_string: String,
}

impl StackFrameInfo {
    /// No field is valid.
    pub const VALID_NONE: u32 = 0;
    /// Only `parameter_size` is valid.
    pub const VALID_PARAMETER_SIZE: u32 = 1;
    /// Every field is valid.
    pub const VALID_ALL: u32 = !0;
}

/// A machine instruction range attributed to one source line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Line {
    /// Module-relative start address.
    pub address: u64,
    /// Size of the range in bytes.
    pub size: u64,
    /// Id of the source file in the module's file table.
    pub source_file_id: u32,
    /// The 1-based source line number.
    pub line: u32,
}

/// A function with its nested source line ranges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    /// The demangled function name.
    pub name: String,
    /// Module-relative start address.
    pub address: u64,
    /// Size of the function's code in bytes.
    pub size: u64,
    /// Bytes of parameters passed on the stack.
    pub parameter_size: u32,
    /// The function's line records, keyed by their address ranges.
    pub lines: RangeMap<u64, Line>,
}

/// A named code address without size or line information.
///
/// Used as a coarse fallback when no function covers an address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicSymbol {
    /// The symbol name.
    pub name: String,
    /// Module-relative address.
    pub address: u64,
    /// Bytes of parameters passed on the stack, when known.
    pub parameter_size: u32,
}

/// The complete symbol index built from one text symbol file.
///
/// A module is immutable once built. Equality is structural over the
/// indexed data; the module name is the resolver's identity for it and
/// takes no part in comparison or serialization.
#[derive(Clone, Debug)]
pub struct Module {
    pub(crate) name: String,
    pub(crate) files: BTreeMap<u32, String>,
    pub(crate) functions: RangeMap<u64, Function>,
    pub(crate) public_symbols: AddressMap<u64, PublicSymbol>,
    pub(crate) stack_info: [ContainedRangeMap<u64, StackFrameInfo>; STACK_INFO_COUNT],
}

impl Module {
    /// Creates an empty module with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            files: BTreeMap::new(),
            functions: RangeMap::new(),
            public_symbols: AddressMap::new(),
            stack_info: std::array::from_fn(|_| ContainedRangeMap::new()),
        }
    }

    /// Builds a module by parsing the text symbol file at `path`.
    pub fn load_map(name: impl Into<String>, path: &Path) -> Result<Module, ParseError> {
        let file = File::open(path)?;
        parser::parse_symbol_file(name.into(), BufReader::new(file))
    }

    /// Builds a module by parsing text symbol data from a reader.
    pub fn parse<R: BufRead>(name: impl Into<String>, reader: R) -> Result<Module, ParseError> {
        parser::parse_symbol_file(name.into(), reader)
    }

    /// The module name this index was loaded under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The filename recorded for a source file id, if any.
    pub fn source_file_name(&self, file_id: u32) -> Option<&str> {
        self.files.get(&file_id).map(String::as_str)
    }
}

impl PartialEq for Module {
    // The name is identity, not data; two modules loaded under different
    // names from the same symbol file compare equal.
    fn eq(&self, other: &Module) -> bool {
        self.files == other.files
            && self.functions == other.functions
            && self.public_symbols == other.public_symbols
            && self.stack_info == other.stack_info
    }
}

impl Eq for Module {}
