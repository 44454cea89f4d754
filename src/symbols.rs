//! Symbol side-channel files written next to each trace.
//!
//! The runtime appends to these while the app runs, so the last line may be
//! half-written. A line without a trailing newline ends parsing; blank lines
//! are skipped. Re-declaring a key with identical content is tolerated (the
//! runtime re-emits entries after some restarts); re-declaring it with
//! different content is an error.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum SymbolError {
    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{line}: {reason}", path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("{}:{line}: {key} redeclared with different content", path.display())]
    Conflict {
        path: PathBuf,
        line: usize,
        key: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRecord {
    /// As written by the runtime, e.g. `Landroid/os/Handler;`
    pub class: String,
    pub method: String,
    pub signature: String,
    pub source: String,
}

impl MethodRecord {
    /// Class in slash form without the descriptor wrapping: `android/os/Handler`.
    pub fn normalized_class(&self) -> String {
        normalize_class(&self.class)
    }
}

impl fmt::Display for MethodRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class, self.method, self.signature)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRecord {
    pub class: String,
    pub name: String,
    pub ty: String,
    /// Further columns, verbatim
    pub extra: Vec<String>,
}

/// Strip `L...;` descriptor syntax and use `/` separators.
pub fn normalize_class(class: &str) -> String {
    let class = class.trim();
    let class = match class.strip_suffix(';') {
        Some(inner) => inner.strip_prefix('L').unwrap_or(inner),
        None => class,
    };
    class.replace('.', "/")
}

#[derive(Debug, Clone, Default)]
pub struct ThreadTable {
    names: HashMap<u32, String>,
}

impl ThreadTable {
    pub fn name(&self, tid: u32) -> Option<&str> {
        self.names.get(&tid).map(String::as_str)
    }

    /// Threads carrying `name`. Usually one, but the runtime reuses names.
    pub fn tids_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = u32> + 'a {
        self.names
            .iter()
            .filter(move |(_, n)| n.as_str() == name)
            .map(|(tid, _)| *tid)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self, SymbolError> {
        let mut names = HashMap::new();
        for (line_no, line) in complete_lines(content) {
            let (tid, name) = line
                .split_once('\t')
                .ok_or_else(|| malformed(path, line_no, "expected `tid<TAB>name`"))?;
            let tid: u32 = tid
                .trim()
                .parse()
                .map_err(|_| malformed(path, line_no, format!("bad thread id `{tid}`")))?;
            insert_unique(&mut names, tid, name.to_string(), path, line_no, || {
                format!("thread {tid}")
            })?;
        }
        Ok(Self { names })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MethodTable {
    methods: HashMap<u32, MethodRecord>,
}

impl MethodTable {
    pub fn get(&self, ptr: u32) -> Option<&MethodRecord> {
        self.methods.get(&ptr)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &MethodRecord)> {
        self.methods.iter().map(|(ptr, record)| (*ptr, record))
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self, SymbolError> {
        let mut methods = HashMap::new();
        for (line_no, line) in complete_lines(content) {
            let tokens: Vec<&str> = line.split('\t').collect();
            let [ptr, class, method, signature, source] = tokens[..] else {
                return Err(malformed(
                    path,
                    line_no,
                    format!("expected 5 columns, found {}", tokens.len()),
                ));
            };
            let ptr = parse_hex(ptr).ok_or_else(|| {
                malformed(path, line_no, format!("bad method pointer `{ptr}`"))
            })?;
            let record = MethodRecord {
                class: class.to_string(),
                method: method.to_string(),
                signature: signature.to_string(),
                source: source.to_string(),
            };
            insert_unique(&mut methods, ptr, record, path, line_no, || {
                format!("method {ptr:#010x}")
            })?;
        }
        Ok(Self { methods })
    }
}

#[derive(Debug, Clone, Default)]
pub struct FieldTable {
    fields: HashMap<(u32, u16), FieldRecord>,
}

impl FieldTable {
    pub fn get(&self, ptr: u32, detail: u16) -> Option<&FieldRecord> {
        self.fields.get(&(ptr, detail))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self, SymbolError> {
        let mut fields = HashMap::new();
        for (line_no, line) in complete_lines(content) {
            let mut tokens = line.split('\t');
            let (Some(ptr), Some(detail), Some(class), Some(name), Some(ty)) = (
                tokens.next(),
                tokens.next(),
                tokens.next(),
                tokens.next(),
                tokens.next(),
            ) else {
                return Err(malformed(path, line_no, "expected at least 5 columns"));
            };
            let ptr = parse_hex(ptr)
                .ok_or_else(|| malformed(path, line_no, format!("bad field pointer `{ptr}`")))?;
            let detail: u16 = detail
                .trim()
                .parse()
                .map_err(|_| malformed(path, line_no, format!("bad detail index `{detail}`")))?;
            let record = FieldRecord {
                class: class.to_string(),
                name: name.to_string(),
                ty: ty.to_string(),
                extra: tokens.map(str::to_string).collect(),
            };
            insert_unique(&mut fields, (ptr, detail), record, path, line_no, || {
                format!("field {ptr:#010x}/{detail}")
            })?;
        }
        Ok(Self { fields })
    }
}

/// All three tables for one session.
#[derive(Debug, Clone, Default)]
pub struct Symbols {
    pub threads: ThreadTable,
    pub methods: MethodTable,
    pub fields: FieldTable,
}

impl Symbols {
    /// Load `<base>info_t.log`, `<base>info_m.log` and `<base>info_f.log` from `dir`.
    pub fn load(dir: &Path, base: &str) -> Result<Self, SymbolError> {
        let threads = dir.join(format!("{base}info_t.log"));
        let methods = dir.join(format!("{base}info_m.log"));
        let fields = dir.join(format!("{base}info_f.log"));
        Self::load_files(&threads, &methods, &fields)
    }

    pub fn load_files(threads: &Path, methods: &Path, fields: &Path) -> Result<Self, SymbolError> {
        let symbols = Self {
            threads: ThreadTable::parse(threads, &read(threads)?)?,
            methods: MethodTable::parse(methods, &read(methods)?)?,
            fields: FieldTable::parse(fields, &read(fields)?)?,
        };
        log::debug!(
            "Loaded {} threads, {} methods, {} fields",
            symbols.threads.len(),
            symbols.methods.len(),
            symbols.fields.len()
        );
        Ok(symbols)
    }
}

fn read(path: &Path) -> Result<String, SymbolError> {
    let bytes = std::fs::read(path).map_err(|source| SymbolError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Newline-terminated, non-blank lines with 1-based line numbers.
fn complete_lines(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content
        .split_inclusive('\n')
        .take_while(|line| line.ends_with('\n'))
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim_end_matches(['\n', '\r'])))
        .filter(|(_, line)| !line.trim().is_empty())
}

fn parse_hex(s: &str) -> Option<u32> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(s, 16).ok()
}

fn malformed(path: &Path, line: usize, reason: impl Into<String>) -> SymbolError {
    SymbolError::Malformed {
        path: path.to_path_buf(),
        line,
        reason: reason.into(),
    }
}

fn insert_unique<K, V>(
    map: &mut HashMap<K, V>,
    key: K,
    value: V,
    path: &Path,
    line: usize,
    describe: impl FnOnce() -> String,
) -> Result<(), SymbolError>
where
    K: std::hash::Hash + Eq,
    V: PartialEq,
{
    match map.entry(key) {
        Entry::Vacant(slot) => {
            slot.insert(value);
            Ok(())
        }
        Entry::Occupied(existing) if *existing.get() == value => Ok(()),
        Entry::Occupied(_) => Err(SymbolError::Conflict {
            path: path.to_path_buf(),
            line,
            key: describe(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn path() -> &'static Path {
        Path::new("mt_0_info_m.log")
    }

    #[test]
    fn test_threads() {
        let table = ThreadTable::parse(path(), "1\tmain\n12\tRenderThread\n\n13\tBinder:1_2\n").unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.name(12), Some("RenderThread"));
        assert_eq!(table.tids_named("main").collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_incomplete_last_line_is_ignored() {
        let table = ThreadTable::parse(path(), "1\tmain\n2\tHeapTa").unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.name(2), None);
    }

    #[test]
    fn test_thread_conflict() {
        let err = ThreadTable::parse(path(), "1\tmain\n1\tother\n").unwrap_err();
        assert!(matches!(err, SymbolError::Conflict { line: 2, .. }), "{err}");
        // Exact duplicates are fine
        assert!(ThreadTable::parse(path(), "1\tmain\n1\tmain\n").is_ok());
    }

    #[test]
    fn test_methods() {
        let content = "7f001000\tLandroid/os/Handler;\tdispatchMessage\t(Landroid/os/Message;)V\tHandler.java\n\
                       0x7f001008\tLcom/example/Main;\tonCreate\t(Landroid/os/Bundle;)V\t\n";
        let table = MethodTable::parse(path(), content).unwrap();
        let handler = table.get(0x7f00_1000).unwrap();
        assert_eq!(handler.method, "dispatchMessage");
        assert_eq!(handler.normalized_class(), "android/os/Handler");
        assert_eq!(table.get(0x7f00_1008).unwrap().source, "");
        assert_eq!(
            handler.to_string(),
            "Landroid/os/Handler;.dispatchMessage(Landroid/os/Message;)V"
        );
    }

    #[rstest]
    #[case::too_few("7f001000\tLFoo;\tbar\t()V\n")]
    #[case::too_many("7f001000\tLFoo;\tbar\t()V\tFoo.java\textra\n")]
    #[case::bad_pointer("zz\tLFoo;\tbar\t()V\tFoo.java\n")]
    fn test_malformed_methods(#[case] content: &str) {
        let err = MethodTable::parse(path(), content).unwrap_err();
        assert!(matches!(err, SymbolError::Malformed { line: 1, .. }), "{err}");
    }

    #[test]
    fn test_method_conflict() {
        let content = "10\tLFoo;\tbar\t()V\tFoo.java\n10\tLFoo;\tbaz\t()V\tFoo.java\n";
        assert!(matches!(
            MethodTable::parse(path(), content),
            Err(SymbolError::Conflict { .. })
        ));
    }

    #[test]
    fn test_fields_keep_extra_columns() {
        let content = "7f002000\t0\tLcom/example/Main;\tcount\tI\tstatic\tfinal\n7f002000\t1\tLcom/example/Main;\tname\tLjava/lang/String;\n";
        let table = FieldTable::parse(path(), content).unwrap();
        let count = table.get(0x7f00_2000, 0).unwrap();
        assert_eq!(count.name, "count");
        assert_eq!(count.extra, vec!["static", "final"]);
        assert_eq!(table.get(0x7f00_2000, 1).unwrap().ty, "Ljava/lang/String;");
        assert!(table.get(0x7f00_2000, 2).is_none());
    }

    #[rstest]
    #[case("Landroid/os/Handler;", "android/os/Handler")]
    #[case("android.os.Handler", "android/os/Handler")]
    #[case("android/os/Handler", "android/os/Handler")]
    #[case("Lcom.example.Foo;", "com/example/Foo")]
    #[case("Looper", "Looper")]
    fn test_normalize_class(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_class(input), expected);
    }

    #[test]
    fn test_load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Symbols::load(dir.path(), "mt_0_").unwrap_err();
        assert!(matches!(err, SymbolError::Io { .. }));
        assert!(err.to_string().contains("mt_0_info_t.log"), "{err}");
    }
}
