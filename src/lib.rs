//! Symbol resolution for post-mortem stack traces.
//!
//! Feed a [`Resolver`] the Breakpad text symbol file of a code module and
//! it builds an index answering, for any instruction address inside that
//! module: which function is this, which source line, and how is the
//! stack frame at this address laid out. The index round-trips through a
//! compact binary format, so with a [`DiskModuleCache`] attached a symbol
//! file only has to be parsed once per machine.
//!
//! ```no_run
//! use std::path::Path;
//!
//! use breakpad_resolver::{CodeModule, DiskModuleCache, Resolver, StackFrame};
//!
//! let mut resolver = Resolver::with_cache(DiskModuleCache::new("/var/cache/symbols"));
//! resolver.load_module("app", Path::new("/symbols/app.pdb/1234ABCD/app.sym"));
//!
//! let mut frame = StackFrame::new(
//!     0x40_1005,
//!     CodeModule {
//!         code_file: "app".into(),
//!         base_address: 0x40_0000,
//!     },
//! );
//! let frame_info = resolver.fill_source_line_info(&mut frame);
//! println!("{:?}:{:?} {:?}", frame.function_name, frame.source_line, frame_info);
//! ```
//!
//! The interval containers backing the index ([`RangeMap`],
//! [`AddressMap`], [`ContainedRangeMap`]) are exposed for reuse; they
//! implement the exact containment and overlap policies the symbol format
//! requires.

#![warn(missing_docs)]

mod address_map;
mod cache;
mod contained_range_map;
mod lookup;
mod module;
mod parser;
mod range_map;
mod resolver;
mod serialize;

pub use address_map::AddressMap;
pub use cache::{DiskModuleCache, ModuleCache, NoCache};
pub use contained_range_map::ContainedRangeMap;
pub use lookup::{CodeModule, StackFrame};
pub use module::{
    Function, Line, Module, PublicSymbol, StackFrameInfo, StackInfoType, STACK_INFO_COUNT,
};
pub use parser::ParseError;
pub use range_map::{Address, RangeMap};
pub use resolver::Resolver;
pub use serialize::{deserialize, serialize, FormatError, FORMAT_VERSION};
