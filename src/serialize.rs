//! The binary module cache format.
//!
//! Encodes a [`Module`] so that decoding reconstructs the exact composed
//! index, empty subtrees included, without revalidating anything through
//! the container store policies. All integers are little-endian. Strings
//! are length-prefixed with their original bytes padded by one to four
//! trailing NULs up to a multiple of four; an empty string is a bare zero
//! length. Owned entries inside the containers are preceded by a `u32`
//! presence marker, which is `0` only for the absent entry of a
//! containment tree's root sentinel.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::address_map::AddressMap;
use crate::contained_range_map::ContainedRangeMap;
use crate::module::{Function, Line, Module, PublicSymbol, StackFrameInfo};
use crate::range_map::RangeMap;

/// The version written into every cache entry. Bump on any layout
/// change; readers treat anything else as a miss.
pub const FORMAT_VERSION: u32 = 1;

/// An error decoding a serialized module.
#[derive(Debug, Error)]
pub enum FormatError {
    /// The entry was produced by a different format version.
    #[error("unknown module cache format version {0}")]
    UnknownVersion(u32),
    /// An entry presence marker held something other than 0 or 1, or an
    /// entry that must be present was marked absent.
    #[error("invalid entry presence marker {0}")]
    BadMarker(u32),
    /// Serialized string data was not valid UTF-8.
    #[error("string data is not valid UTF-8")]
    BadString,
    /// Well-formed module data was followed by extra bytes.
    #[error("trailing bytes after module data")]
    TrailingData,
    /// The underlying stream failed or ended early.
    #[error("failed to read module data: {0}")]
    Io(#[from] io::Error),
}

/// Writes `module` to `writer` in the cache format.
pub fn serialize<W: Write>(module: &Module, writer: &mut W) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(FORMAT_VERSION)?;
    write_files(writer, &module.files)?;
    write_range_map(writer, &module.functions, write_function)?;
    write_public_symbols(writer, &module.public_symbols)?;
    for tree in &module.stack_info {
        write_stack_node(writer, tree)?;
    }
    Ok(())
}

/// Reads a module in the cache format, attaching `name` to it.
///
/// The stream must end exactly where the module data does.
pub fn deserialize<R: Read>(reader: &mut R, name: impl Into<String>) -> Result<Module, FormatError> {
    let version = reader.read_u32::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(FormatError::UnknownVersion(version));
    }

    let mut module = Module::new(name);
    module.files = read_files(reader)?;
    module.functions = read_range_map(reader, read_function)?;
    module.public_symbols = read_public_symbols(reader)?;
    for tree in module.stack_info.iter_mut() {
        *tree = read_stack_node(reader)?;
    }

    let mut probe = [0u8; 1];
    if reader.read(&mut probe)? != 0 {
        return Err(FormatError::TrailingData);
    }
    Ok(module)
}

fn write_string<W: Write>(writer: &mut W, value: &str) -> io::Result<()> {
    if value.is_empty() {
        return writer.write_u32::<LittleEndian>(0);
    }
    let padding = 4 - value.len() % 4;
    writer.write_u32::<LittleEndian>((value.len() + padding) as u32)?;
    writer.write_all(value.as_bytes())?;
    writer.write_all(&[0u8; 4][..padding])
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, FormatError> {
    let padded_len = reader.read_u32::<LittleEndian>()?;
    if padded_len == 0 {
        return Ok(String::new());
    }
    let mut bytes = vec![0u8; padded_len as usize];
    reader.read_exact(&mut bytes)?;
    // The padding guarantees at least one NUL; everything before the
    // first one is the string.
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    bytes.truncate(len);
    String::from_utf8(bytes).map_err(|_| FormatError::BadString)
}

fn write_marker<W: Write>(writer: &mut W, present: bool) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(present.into())
}

fn read_required_marker<R: Read>(reader: &mut R) -> Result<(), FormatError> {
    match reader.read_u32::<LittleEndian>()? {
        1 => Ok(()),
        other => Err(FormatError::BadMarker(other)),
    }
}

fn write_files<W: Write>(writer: &mut W, files: &BTreeMap<u32, String>) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(files.len() as u32)?;
    for (&id, name) in files {
        writer.write_u32::<LittleEndian>(id)?;
        write_string(writer, name)?;
    }
    Ok(())
}

fn read_files<R: Read>(reader: &mut R) -> Result<BTreeMap<u32, String>, FormatError> {
    let count = reader.read_u32::<LittleEndian>()?;
    let mut files = BTreeMap::new();
    for _ in 0..count {
        let id = reader.read_u32::<LittleEndian>()?;
        files.insert(id, read_string(reader)?);
    }
    Ok(files)
}

fn write_range_map<W: Write, E>(
    writer: &mut W,
    map: &RangeMap<u64, E>,
    mut write_entry: impl FnMut(&mut W, &E) -> io::Result<()>,
) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(map.len() as u32)?;
    for (high, base, entry) in map.iter() {
        writer.write_u64::<LittleEndian>(high)?;
        writer.write_u64::<LittleEndian>(base)?;
        write_marker(writer, true)?;
        write_entry(writer, entry)?;
    }
    Ok(())
}

fn read_range_map<R: Read, E>(
    reader: &mut R,
    mut read_entry: impl FnMut(&mut R) -> Result<E, FormatError>,
) -> Result<RangeMap<u64, E>, FormatError> {
    let count = reader.read_u32::<LittleEndian>()?;
    let mut map = RangeMap::new();
    for _ in 0..count {
        let high = reader.read_u64::<LittleEndian>()?;
        let base = reader.read_u64::<LittleEndian>()?;
        read_required_marker(reader)?;
        let entry = read_entry(reader)?;
        map.insert_raw(high, base, entry);
    }
    Ok(map)
}

fn write_function<W: Write>(writer: &mut W, function: &Function) -> io::Result<()> {
    write_string(writer, &function.name)?;
    writer.write_u64::<LittleEndian>(function.address)?;
    writer.write_u64::<LittleEndian>(function.size)?;
    writer.write_u32::<LittleEndian>(function.parameter_size)?;
    write_range_map(writer, &function.lines, write_line)
}

fn read_function<R: Read>(reader: &mut R) -> Result<Function, FormatError> {
    let name = read_string(reader)?;
    let address = reader.read_u64::<LittleEndian>()?;
    let size = reader.read_u64::<LittleEndian>()?;
    let parameter_size = reader.read_u32::<LittleEndian>()?;
    let lines = read_range_map(reader, read_line)?;
    Ok(Function {
        name,
        address,
        size,
        parameter_size,
        lines,
    })
}

fn write_line<W: Write>(writer: &mut W, line: &Line) -> io::Result<()> {
    writer.write_u64::<LittleEndian>(line.address)?;
    writer.write_u64::<LittleEndian>(line.size)?;
    writer.write_u32::<LittleEndian>(line.source_file_id)?;
    writer.write_u32::<LittleEndian>(line.line)
}

fn read_line<R: Read>(reader: &mut R) -> Result<Line, FormatError> {
    Ok(Line {
        address: reader.read_u64::<LittleEndian>()?,
        size: reader.read_u64::<LittleEndian>()?,
        source_file_id: reader.read_u32::<LittleEndian>()?,
        line: reader.read_u32::<LittleEndian>()?,
    })
}

fn write_public_symbols<W: Write>(
    writer: &mut W,
    symbols: &AddressMap<u64, PublicSymbol>,
) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(symbols.len() as u32)?;
    for (address, symbol) in symbols.iter() {
        writer.write_u64::<LittleEndian>(address)?;
        write_marker(writer, true)?;
        write_string(writer, &symbol.name)?;
        writer.write_u64::<LittleEndian>(symbol.address)?;
        writer.write_u32::<LittleEndian>(symbol.parameter_size)?;
    }
    Ok(())
}

fn read_public_symbols<R: Read>(
    reader: &mut R,
) -> Result<AddressMap<u64, PublicSymbol>, FormatError> {
    let count = reader.read_u32::<LittleEndian>()?;
    let mut symbols = AddressMap::new();
    for _ in 0..count {
        let key = reader.read_u64::<LittleEndian>()?;
        read_required_marker(reader)?;
        let name = read_string(reader)?;
        let address = reader.read_u64::<LittleEndian>()?;
        let parameter_size = reader.read_u32::<LittleEndian>()?;
        symbols.insert_raw(
            key,
            PublicSymbol {
                name,
                address,
                parameter_size,
            },
        );
    }
    Ok(symbols)
}

fn write_stack_node<W: Write>(
    writer: &mut W,
    node: &ContainedRangeMap<u64, StackFrameInfo>,
) -> io::Result<()> {
    writer.write_u64::<LittleEndian>(node.base)?;
    match &node.entry {
        Some(info) => {
            write_marker(writer, true)?;
            write_frame_info(writer, info)?;
        }
        None => write_marker(writer, false)?,
    }
    match &node.children {
        Some(children) => {
            write_marker(writer, true)?;
            writer.write_u32::<LittleEndian>(children.len() as u32)?;
            for (&high, child) in children {
                writer.write_u64::<LittleEndian>(high)?;
                write_marker(writer, true)?;
                write_stack_node(writer, child)?;
            }
        }
        None => write_marker(writer, false)?,
    }
    Ok(())
}

fn read_stack_node<R: Read>(
    reader: &mut R,
) -> Result<ContainedRangeMap<u64, StackFrameInfo>, FormatError> {
    let base = reader.read_u64::<LittleEndian>()?;
    let entry = match reader.read_u32::<LittleEndian>()? {
        0 => None,
        1 => Some(read_frame_info(reader)?),
        other => return Err(FormatError::BadMarker(other)),
    };
    let children = match reader.read_u32::<LittleEndian>()? {
        0 => None,
        1 => {
            let count = reader.read_u32::<LittleEndian>()?;
            let mut children = BTreeMap::new();
            for _ in 0..count {
                let high = reader.read_u64::<LittleEndian>()?;
                read_required_marker(reader)?;
                children.insert(high, read_stack_node(reader)?);
            }
            Some(children)
        }
        other => return Err(FormatError::BadMarker(other)),
    };
    Ok(ContainedRangeMap {
        base,
        entry,
        children,
    })
}

fn write_frame_info<W: Write>(writer: &mut W, info: &StackFrameInfo) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(info.valid)?;
    writer.write_u32::<LittleEndian>(info.prolog_size)?;
    writer.write_u32::<LittleEndian>(info.epilog_size)?;
    writer.write_u32::<LittleEndian>(info.parameter_size)?;
    writer.write_u32::<LittleEndian>(info.saved_register_size)?;
    writer.write_u32::<LittleEndian>(info.local_size)?;
    writer.write_u32::<LittleEndian>(info.max_stack_size)?;
    writer.write_u32::<LittleEndian>(info.allocates_base_pointer.into())?;
    write_string(writer, &info.program_string)
}

fn read_frame_info<R: Read>(reader: &mut R) -> Result<StackFrameInfo, FormatError> {
    Ok(StackFrameInfo {
        valid: reader.read_u32::<LittleEndian>()?,
        prolog_size: reader.read_u32::<LittleEndian>()?,
        epilog_size: reader.read_u32::<LittleEndian>()?,
        parameter_size: reader.read_u32::<LittleEndian>()?,
        saved_register_size: reader.read_u32::<LittleEndian>()?,
        local_size: reader.read_u32::<LittleEndian>()?,
        max_stack_size: reader.read_u32::<LittleEndian>()?,
        allocates_base_pointer: reader.read_u32::<LittleEndian>()? != 0,
        program_string: read_string(reader)?,
    })
}
