use std::fs;
use std::path::{Path, PathBuf};

use breakpad_resolver::{
    deserialize, serialize, CodeModule, DiskModuleCache, Module, Resolver, StackFrame,
    StackFrameInfo, FORMAT_VERSION,
};

const BASE: u64 = 0x40_0000;

/// Lays a symbol file out in the symbol server convention
/// `<root>/<module>.pdb/<id>/<module>.sym`.
fn write_symbol_file(root: &Path, module: &str, content: &str) -> PathBuf {
    let dir = root.join(format!("{module}.pdb")).join("1234ABCD");
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{module}.sym"));
    fs::write(&path, content).unwrap();
    path
}

fn frame(module: &str, relative: u64) -> StackFrame {
    StackFrame::new(
        BASE + relative,
        CodeModule {
            code_file: module.into(),
            base_address: BASE,
        },
    )
}

#[test]
fn resolves_function_and_source_line() {
    let symbols = tempfile::tempdir().unwrap();
    let path = write_symbol_file(
        symbols.path(),
        "app",
        "FILE 0 a.c\n\
         FUNC 1000 20 8 f\n\
         1000 10 7 0\n",
    );

    let mut resolver = Resolver::new();
    assert!(resolver.load_module("app", &path));
    assert!(resolver.has_module("app"));

    let mut frame = frame("app", 0x1005);
    let frame_info = resolver.fill_source_line_info(&mut frame).unwrap();

    assert_eq!(frame.function_name.as_deref(), Some("f"));
    assert_eq!(frame.function_base, Some(0x40_1000));
    assert_eq!(frame.source_file_name.as_deref(), Some("a.c"));
    assert_eq!(frame.source_line, Some(7));
    assert_eq!(frame.source_line_base, Some(0x40_1000));
    assert_eq!(frame_info.valid, StackFrameInfo::VALID_PARAMETER_SIZE);
    assert_eq!(frame_info.parameter_size, 8);
}

#[test]
fn falls_back_to_public_symbols() {
    let symbols = tempfile::tempdir().unwrap();
    let path = write_symbol_file(symbols.path(), "app", "PUBLIC 2000 4 g\n");

    let mut resolver = Resolver::new();
    assert!(resolver.load_module("app", &path));

    let mut frame = frame("app", 0x2010);
    let frame_info = resolver.fill_source_line_info(&mut frame).unwrap();

    assert_eq!(frame.function_name.as_deref(), Some("g"));
    assert_eq!(frame.function_base, Some(0x40_2000));
    assert_eq!(frame.source_file_name, None);
    assert_eq!(frame.source_line, None);
    assert_eq!(frame_info.valid, StackFrameInfo::VALID_PARAMETER_SIZE);
    assert_eq!(frame_info.parameter_size, 4);
}

#[test]
fn function_beats_public_symbol_inside_its_range() {
    let symbols = tempfile::tempdir().unwrap();
    let path = write_symbol_file(
        symbols.path(),
        "app",
        "FUNC 1000 100 8 f\nPUBLIC 1050 4 g\n",
    );

    let mut resolver = Resolver::new();
    assert!(resolver.load_module("app", &path));

    let mut frame = frame("app", 0x1040);
    resolver.fill_source_line_info(&mut frame).unwrap();
    assert_eq!(frame.function_name.as_deref(), Some("f"));
}

#[test]
fn public_symbol_below_function_end_matches_nothing() {
    let symbols = tempfile::tempdir().unwrap();
    let path = write_symbol_file(
        symbols.path(),
        "app",
        "FUNC 1000 100 8 f\nPUBLIC 1050 4 g\n",
    );

    let mut resolver = Resolver::new();
    assert!(resolver.load_module("app", &path));

    let mut frame = frame("app", 0x1200);
    assert_eq!(resolver.fill_source_line_info(&mut frame), None);
    assert_eq!(frame.function_name, None);
    assert_eq!(frame.function_base, None);
}

#[test]
fn frame_data_records_beat_fpo_records() {
    let symbols = tempfile::tempdir().unwrap();
    let path = write_symbol_file(
        symbols.path(),
        "app",
        "STACK WIN 0 3000 100 1 1 11 1 1 1 0 0\n\
         STACK WIN 4 3000 100 2 2 22 2 2 2 1 $T0 .raSearch =\n",
    );

    let mut resolver = Resolver::new();
    assert!(resolver.load_module("app", &path));

    let mut frame = frame("app", 0x3010);
    let frame_info = resolver.fill_source_line_info(&mut frame).unwrap();
    assert_eq!(frame_info.prolog_size, 2);
    assert_eq!(frame_info.parameter_size, 0x22);
    assert_eq!(frame_info.program_string, "$T0 .raSearch =");
}

const ROUND_TRIP_INPUT: &str = "MODULE windows x86 DEADBEEF0 app.pdb\n\
    FILE 0 a.c\n\
    FILE 1 b.c\n\
    FUNC 1000 20 8 f\n\
    1000 10 7 0\n\
    1010 10 8 1\n\
    PUBLIC 2000 4 g\n\
    STACK WIN 4 1000 20 4 2 8 4 10 20 1 $T0 .raSearch = $eip $T0 ^ =\n\
    STACK WIN 4 1004 8 0 0 0 0 0 0 1 $T0 $T1 =\n\
    STACK WIN 0 2000 10 4 2 8 4 10 20 0 1\n";

#[test]
fn loaded_module_round_trips_through_the_format() {
    let symbols = tempfile::tempdir().unwrap();
    let path = write_symbol_file(symbols.path(), "app", ROUND_TRIP_INPUT);

    let module = Module::load_map("app", &path).unwrap();

    let mut bytes = Vec::new();
    serialize(&module, &mut bytes).unwrap();
    let reloaded = deserialize(&mut bytes.as_slice(), "app").unwrap();
    assert_eq!(reloaded, module);
}

#[test]
fn second_load_is_served_from_the_cache() {
    let symbols = tempfile::tempdir().unwrap();
    let cache_root = tempfile::tempdir().unwrap();
    let path = write_symbol_file(symbols.path(), "app", ROUND_TRIP_INPUT);

    let mut resolver = Resolver::with_cache(DiskModuleCache::new(cache_root.path()));
    assert!(resolver.load_module("app", &path));

    let entry = cache_root.path().join("app.pdb/1234ABCD/app.symcache");
    assert!(entry.is_file());

    // Remove the text file: a fresh resolver can only succeed via the
    // cache, and must resolve identically.
    fs::remove_file(&path).unwrap();
    let mut cached = Resolver::with_cache(DiskModuleCache::new(cache_root.path()));
    assert!(cached.load_module("app", &path));

    let mut frame = frame("app", 0x1015);
    cached.fill_source_line_info(&mut frame).unwrap();
    assert_eq!(frame.function_name.as_deref(), Some("f"));
    assert_eq!(frame.source_file_name.as_deref(), Some("b.c"));
    assert_eq!(frame.source_line, Some(8));
}

#[test]
fn stale_cache_versions_are_reparsed_and_overwritten() {
    let symbols = tempfile::tempdir().unwrap();
    let cache_root = tempfile::tempdir().unwrap();
    let path = write_symbol_file(symbols.path(), "app", ROUND_TRIP_INPUT);

    let entry = cache_root.path().join("app.pdb/1234ABCD/app.symcache");
    fs::create_dir_all(entry.parent().unwrap()).unwrap();
    fs::write(&entry, (FORMAT_VERSION + 1).to_le_bytes()).unwrap();

    let mut resolver = Resolver::with_cache(DiskModuleCache::new(cache_root.path()));
    assert!(resolver.load_module("app", &path));

    let mut frame = frame("app", 0x1005);
    resolver.fill_source_line_info(&mut frame).unwrap();
    assert_eq!(frame.function_name.as_deref(), Some("f"));

    // The bad entry was replaced by a current one.
    let bytes = fs::read(&entry).unwrap();
    assert_eq!(&bytes[..4], FORMAT_VERSION.to_le_bytes());
}

#[test]
fn parse_failure_loads_nothing_and_caches_nothing() {
    let symbols = tempfile::tempdir().unwrap();
    let cache_root = tempfile::tempdir().unwrap();
    // An orphan source line record is fatal.
    let path = write_symbol_file(symbols.path(), "app", "1000 10 7 0\n");

    let mut resolver = Resolver::with_cache(DiskModuleCache::new(cache_root.path()));
    assert!(!resolver.load_module("app", &path));
    assert!(!resolver.has_module("app"));

    let entry = cache_root.path().join("app.pdb/1234ABCD/app.symcache");
    assert!(!entry.exists());
}

#[test]
fn duplicate_module_names_are_rejected() {
    let symbols = tempfile::tempdir().unwrap();
    let path = write_symbol_file(symbols.path(), "app", "PUBLIC 2000 4 g\n");

    let mut resolver = Resolver::new();
    assert!(resolver.load_module("app", &path));
    assert!(!resolver.load_module("app", &path));
}

#[test]
fn missing_symbol_file_fails_the_load() {
    let mut resolver = Resolver::new();
    assert!(!resolver.load_module("app", Path::new("/nonexistent/app.pdb/1234/app.sym")));
    assert!(!resolver.has_module("app"));
}

#[test]
fn lookups_ignore_frames_from_unknown_modules() {
    let symbols = tempfile::tempdir().unwrap();
    let path = write_symbol_file(symbols.path(), "app", "PUBLIC 2000 4 g\n");

    let mut resolver = Resolver::new();
    assert!(resolver.load_module("app", &path));

    let mut frame = frame("other", 0x2010);
    assert_eq!(resolver.fill_source_line_info(&mut frame), None);
    assert_eq!(frame.function_name, None);

    let mut bare = StackFrame::default();
    assert_eq!(resolver.fill_source_line_info(&mut bare), None);
}
