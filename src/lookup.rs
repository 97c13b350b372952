//! Resolves instruction addresses against a loaded module.

use crate::module::{Module, StackFrameInfo, StackInfoType};

/// The code module a stack frame's instruction belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeModule {
    /// The file name the module's symbols were loaded under, used to pick
    /// the module inside a resolver.
    pub code_file: String,
    /// The address the module was loaded at.
    pub base_address: u64,
}

/// One frame of a captured stack, to be annotated with symbol data.
///
/// Lookups only ever add information: a field is written when the
/// corresponding datum resolves and left untouched otherwise.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StackFrame {
    /// The absolute instruction address of this frame.
    pub instruction: u64,
    /// The module containing the instruction, when known.
    pub module: Option<CodeModule>,
    /// The resolved function or public symbol name.
    pub function_name: Option<String>,
    /// The absolute start address of the resolved function or symbol.
    pub function_base: Option<u64>,
    /// The name of the source file containing the instruction.
    pub source_file_name: Option<String>,
    /// The 1-based source line number of the instruction.
    pub source_line: Option<u32>,
    /// The absolute start address of the resolved source line's range.
    pub source_line_base: Option<u64>,
}

impl StackFrame {
    /// Creates a frame for `instruction` within `module`.
    pub fn new(instruction: u64, module: CodeModule) -> Self {
        StackFrame {
            instruction,
            module: Some(module),
            ..StackFrame::default()
        }
    }
}

impl Module {
    /// Annotates `frame` with the symbol data indexed for its
    /// instruction address and returns the frame layout record covering
    /// it, if any.
    ///
    /// Frame data records take precedence over FPO records. A function
    /// containing the address beats any public symbol; a public symbol is
    /// only trusted when it does not sit below the end of the nearest
    /// preceding function, since that would mean the address belongs to
    /// no known symbol at all. When only a FUNC or PUBLIC record matches,
    /// a frame record carrying just that record's parameter size is
    /// synthesized.
    pub fn lookup_address(&self, frame: &mut StackFrame) -> Option<StackFrameInfo> {
        let base_address = frame.module.as_ref()?.base_address;
        let address = frame.instruction.wrapping_sub(base_address);

        // Gather frame info up front; it is returned even when no name
        // resolves.
        let frame_info = self.stack_info[StackInfoType::FrameData as usize]
            .retrieve_range(address)
            .or_else(|| self.stack_info[StackInfoType::Fpo as usize].retrieve_range(address))
            .cloned();

        let nearest = self.functions.retrieve_nearest_range(address);

        let parameter_size;
        if let Some((function, function_base, _)) =
            nearest.filter(|&(_, base, size)| address >= base && address - base < size)
        {
            parameter_size = function.parameter_size;
            frame.function_name = Some(function.name.clone());
            frame.function_base = Some(base_address.wrapping_add(function_base));

            if let Some((line, line_base, _)) = function.lines.retrieve_range(address) {
                if let Some(file_name) = self.files.get(&line.source_file_id) {
                    frame.source_file_name = Some(file_name.clone());
                }
                frame.source_line = Some(line.line);
                frame.source_line_base = Some(base_address.wrapping_add(line_base));
            }
        } else if let Some((symbol, symbol_address)) =
            self.public_symbols.retrieve(address).filter(|&(_, at)| {
                match nearest {
                    // A public symbol below the end of the nearest
                    // function would also be below the address of every
                    // function after it; it cannot describe `address`.
                    Some((_, base, size)) => at > base.wrapping_add(size),
                    None => true,
                }
            })
        {
            parameter_size = symbol.parameter_size;
            frame.function_name = Some(symbol.name.clone());
            frame.function_base = Some(base_address.wrapping_add(symbol_address));
        } else {
            return frame_info;
        }

        Some(frame_info.unwrap_or_else(|| StackFrameInfo {
            valid: StackFrameInfo::VALID_PARAMETER_SIZE,
            parameter_size,
            ..StackFrameInfo::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x40_0000;

    fn module(input: &str) -> Module {
        Module::parse("test", input.as_bytes()).unwrap()
    }

    fn frame(instruction: u64) -> StackFrame {
        StackFrame::new(
            BASE + instruction,
            CodeModule {
                code_file: "test".into(),
                base_address: BASE,
            },
        )
    }

    #[test]
    fn function_inside_range_wins_over_public() {
        let module = module("FUNC 1000 100 8 f\nPUBLIC 1050 4 g\n");
        let mut frame = frame(0x1040);
        let info = module.lookup_address(&mut frame).unwrap();

        assert_eq!(frame.function_name.as_deref(), Some("f"));
        assert_eq!(frame.function_base, Some(BASE + 0x1000));
        assert_eq!(info.parameter_size, 8);
    }

    #[test]
    fn public_below_function_end_resolves_nothing() {
        let module = module("FUNC 1000 100 8 f\nPUBLIC 1050 4 g\n");
        let mut frame = frame(0x1200);
        assert_eq!(module.lookup_address(&mut frame), None);
        assert_eq!(frame.function_name, None);
        assert_eq!(frame.function_base, None);
    }

    #[test]
    fn public_above_function_end_is_accepted() {
        let module = module("FUNC 1000 100 8 f\nPUBLIC 1101 4 g\n");
        let mut frame = frame(0x1200);
        let info = module.lookup_address(&mut frame).unwrap();

        assert_eq!(frame.function_name.as_deref(), Some("g"));
        assert_eq!(frame.function_base, Some(BASE + 0x1101));
        assert_eq!(info.valid, StackFrameInfo::VALID_PARAMETER_SIZE);
        assert_eq!(info.parameter_size, 4);
    }

    #[test]
    fn public_exactly_at_function_end_is_rejected() {
        let module = module("FUNC 1000 100 8 f\nPUBLIC 1100 4 g\n");
        let mut frame = frame(0x1200);
        assert_eq!(module.lookup_address(&mut frame), None);
        assert_eq!(frame.function_name, None);
    }

    #[test]
    fn frame_data_preferred_over_fpo() {
        let module = module(
            "STACK WIN 0 3000 100 1 1 11 0 0 0 0 0\n\
             STACK WIN 4 3000 100 2 2 22 0 0 0 1 $T0 .raSearch =\n",
        );
        let mut frame = frame(0x3010);
        let info = module.lookup_address(&mut frame).unwrap();

        assert_eq!(info.parameter_size, 0x22);
        assert_eq!(info.program_string, "$T0 .raSearch =");
        // Nothing named covers the address; the frame stays bare.
        assert_eq!(frame.function_name, None);
    }

    #[test]
    fn lookup_is_idempotent() {
        let module = module("FILE 0 a.c\nFUNC 1000 20 8 f\n1000 10 7 0\n");
        let mut first = frame(0x1005);
        let info_a = module.lookup_address(&mut first);
        let mut second = first.clone();
        let info_b = module.lookup_address(&mut second);

        assert_eq!(first, second);
        assert_eq!(info_a, info_b);
    }

    #[test]
    fn missing_file_id_leaves_source_file_unset() {
        let module = module("FUNC 1000 20 8 f\n1000 10 7 9\n");
        let mut frame = frame(0x1005);
        module.lookup_address(&mut frame).unwrap();

        assert_eq!(frame.source_file_name, None);
        assert_eq!(frame.source_line, Some(7));
        assert_eq!(frame.source_line_base, Some(BASE + 0x1000));
    }

    #[test]
    fn frame_without_module_is_untouched() {
        let module = module("FUNC 1000 20 8 f\n");
        let mut frame = StackFrame {
            instruction: BASE + 0x1005,
            ..StackFrame::default()
        };
        assert_eq!(module.lookup_address(&mut frame), None);
        assert_eq!(frame.function_name, None);
    }
}
