//! Caching of serialized modules.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use log::debug;
use tempfile::NamedTempFile;

/// A store for serialized module data, keyed by symbol file path.
///
/// A write is performed in two steps: data written to the stream handed
/// out by [`begin_set_module_data`](ModuleCache::begin_set_module_data)
/// stays invisible to readers until
/// [`end_set_module_data`](ModuleCache::end_set_module_data) commits it.
/// A stream dropped without commit must leave no trace.
pub trait ModuleCache {
    /// The stream type for reading cached data.
    type Read: io::Read;
    /// The stream type handed out for pending writes.
    type Write: io::Write;

    /// Opens the cached data for `symbol_file`, or `None` on a miss.
    fn get_module_data(&self, symbol_file: &Path) -> Option<Self::Read>;

    /// Starts writing the cache entry for `symbol_file`.
    fn begin_set_module_data(&self, symbol_file: &Path) -> Option<Self::Write>;

    /// Commits a pending write, making it visible to readers atomically.
    fn end_set_module_data(&self, symbol_file: &Path, stream: Self::Write) -> bool;
}

/// A cache that stores nothing and never hits.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCache;

impl ModuleCache for NoCache {
    type Read = io::Empty;
    type Write = io::Sink;

    fn get_module_data(&self, _symbol_file: &Path) -> Option<io::Empty> {
        None
    }

    fn begin_set_module_data(&self, _symbol_file: &Path) -> Option<io::Sink> {
        None
    }

    fn end_set_module_data(&self, _symbol_file: &Path, _stream: io::Sink) -> bool {
        false
    }
}

/// A module cache in a directory tree on disk.
///
/// Symbol files are expected to be laid out in the symbol server
/// convention `…/<debug_file>/<identifier>/<debug_file>.sym`. The last
/// three path components are mirrored under the cache root with the
/// `.sym` suffix rewritten to `.symcache`; paths with fewer components
/// have no cache entry (misses on read, no-ops on write).
///
/// Writes go to a uniquely named temporary file next to the final path
/// and are renamed over it on commit, so readers only ever observe
/// complete entries and an aborted write cleans up after itself.
#[derive(Clone, Debug)]
pub struct DiskModuleCache {
    cache_directory: PathBuf,
}

impl DiskModuleCache {
    /// Creates a cache rooted at `cache_directory`.
    pub fn new(cache_directory: impl Into<PathBuf>) -> Self {
        DiskModuleCache {
            cache_directory: cache_directory.into(),
        }
    }

    /// Maps a symbol file path to its cache entry path.
    fn cache_entry_path(&self, symbol_file: &Path) -> Option<PathBuf> {
        let file_name = symbol_file.file_name()?;
        let identifier = symbol_file.parent()?.file_name()?;
        let debug_file = symbol_file.parent()?.parent()?.file_name()?;

        let mut path = self.cache_directory.join(debug_file);
        path.push(identifier);
        path.push(file_name);
        if path.extension() == Some(OsStr::new("sym")) {
            path.set_extension("symcache");
        }
        Some(path)
    }
}

impl ModuleCache for DiskModuleCache {
    type Read = BufReader<File>;
    type Write = BufWriter<NamedTempFile>;

    fn get_module_data(&self, symbol_file: &Path) -> Option<BufReader<File>> {
        let path = self.cache_entry_path(symbol_file)?;
        let file = File::open(&path).ok()?;
        debug!("loading cached module data from {}", path.display());
        Some(BufReader::new(file))
    }

    fn begin_set_module_data(&self, symbol_file: &Path) -> Option<BufWriter<NamedTempFile>> {
        let path = self.cache_entry_path(symbol_file)?;
        let directory = path.parent()?;
        create_directories(directory).ok()?;
        let temp = NamedTempFile::new_in(directory).ok()?;
        Some(BufWriter::new(temp))
    }

    fn end_set_module_data(&self, symbol_file: &Path, stream: BufWriter<NamedTempFile>) -> bool {
        let path = match self.cache_entry_path(symbol_file) {
            Some(path) => path,
            None => return false,
        };
        let temp = match stream.into_inner() {
            Ok(temp) => temp,
            Err(_) => return false,
        };
        temp.persist(&path).is_ok()
    }
}

fn create_directories(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn maps_symbol_server_layout() {
        let cache = DiskModuleCache::new("/cache");
        let path = cache
            .cache_entry_path(Path::new(
                "/symbols/kernel32.pdb/BCE8785C57B44245A669896B6A19B9542/kernel32.sym",
            ))
            .unwrap();
        assert_eq!(
            path,
            Path::new("/cache/kernel32.pdb/BCE8785C57B44245A669896B6A19B9542/kernel32.symcache")
        );
    }

    #[test]
    fn short_paths_have_no_entry() {
        let cache = DiskModuleCache::new("/cache");
        assert_eq!(cache.cache_entry_path(Path::new("kernel32.sym")), None);
        assert_eq!(cache.cache_entry_path(Path::new("id/kernel32.sym")), None);
        assert!(!cache.end_set_module_data(
            Path::new("kernel32.sym"),
            BufWriter::new(NamedTempFile::new().unwrap())
        ));
    }

    #[test]
    fn only_a_sym_extension_is_rewritten() {
        let cache = DiskModuleCache::new("/cache");
        let path = cache
            .cache_entry_path(Path::new("/symbols/app.pdb/1234/app.txt"))
            .unwrap();
        assert_eq!(path, Path::new("/cache/app.pdb/1234/app.txt"));
    }

    #[test]
    fn writes_become_visible_only_on_commit() {
        let root = tempfile::tempdir().unwrap();
        let cache = DiskModuleCache::new(root.path());
        let symbol_file = Path::new("/symbols/app.pdb/1234/app.sym");

        assert!(cache.get_module_data(symbol_file).is_none());

        let mut stream = cache.begin_set_module_data(symbol_file).unwrap();
        stream.write_all(b"payload").unwrap();
        // Not committed yet.
        assert!(cache.get_module_data(symbol_file).is_none());

        assert!(cache.end_set_module_data(symbol_file, stream));
        let mut contents = Vec::new();
        cache
            .get_module_data(symbol_file)
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        assert_eq!(contents, b"payload");
    }

    #[test]
    fn dropped_stream_leaves_nothing_behind() {
        let root = tempfile::tempdir().unwrap();
        let cache = DiskModuleCache::new(root.path());
        let symbol_file = Path::new("/symbols/app.pdb/1234/app.sym");

        let mut stream = cache.begin_set_module_data(symbol_file).unwrap();
        stream.write_all(b"partial").unwrap();
        drop(stream);

        assert!(cache.get_module_data(symbol_file).is_none());
        let entry_dir = root.path().join("app.pdb/1234");
        assert_eq!(fs::read_dir(entry_dir).unwrap().count(), 0);
    }
}
