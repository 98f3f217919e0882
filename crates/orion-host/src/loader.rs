//! Module Loader
//!
//! Turns bytes, a file path or a URL into a validated [`CompiledModule`].
//! Compilation is a pure function of the input bytes; the optional
//! [`ModuleCache`] only saves recompiling identical input.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;
use wasmtime::{Engine, ExternType, Module};

use crate::error::LoadError;
use crate::types::Signature;

const WASM_MAGIC: &[u8; 4] = b"\0asm";
const CORE_VERSION: [u8; 4] = [1, 0, 0, 0];

/// Where module bytes come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
    Url(Url),
}

impl ModuleSource {
    /// Interpret a locator string: `http(s)://` is fetched, `file://` and
    /// anything else is read from disk.
    pub fn parse(locator: &str) -> Self {
        match Url::parse(locator) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => ModuleSource::Url(url),
            Ok(url) if url.scheme() == "file" => match url.to_file_path() {
                Ok(path) => ModuleSource::Path(path),
                Err(()) => ModuleSource::Path(PathBuf::from(url.path())),
            },
            _ => ModuleSource::Path(PathBuf::from(locator)),
        }
    }

    fn default_name(&self) -> Option<String> {
        match self {
            ModuleSource::Bytes(_) => None,
            ModuleSource::Path(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned()),
            ModuleSource::Url(url) => url
                .path_segments()
                .and_then(|mut s| s.next_back())
                .filter(|s| !s.is_empty())
                .map(|s| s.trim_end_matches(".wasm").to_string()),
        }
    }
}

impl From<Vec<u8>> for ModuleSource {
    fn from(bytes: Vec<u8>) -> Self {
        ModuleSource::Bytes(bytes)
    }
}

impl From<&[u8]> for ModuleSource {
    fn from(bytes: &[u8]) -> Self {
        ModuleSource::Bytes(bytes.to_vec())
    }
}

impl From<PathBuf> for ModuleSource {
    fn from(path: PathBuf) -> Self {
        ModuleSource::Path(path)
    }
}

impl From<&Path> for ModuleSource {
    fn from(path: &Path) -> Self {
        ModuleSource::Path(path.to_path_buf())
    }
}

impl From<Url> for ModuleSource {
    fn from(url: Url) -> Self {
        ModuleSource::Url(url)
    }
}

impl fmt::Display for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleSource::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            ModuleSource::Path(p) => write!(f, "{}", p.display()),
            ModuleSource::Url(u) => write!(f, "{}", u),
        }
    }
}

/// Kind of an import or export, with the signature for functions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExternKind {
    Func(Signature),
    Memory,
    Table,
    Global,
    Other,
}

impl From<&ExternType> for ExternKind {
    fn from(ty: &ExternType) -> Self {
        match ty {
            ExternType::Func(f) => ExternKind::Func(Signature::of(f)),
            ExternType::Memory(_) => ExternKind::Memory,
            ExternType::Table(_) => ExternKind::Table,
            ExternType::Global(_) => ExternKind::Global,
            _ => ExternKind::Other,
        }
    }
}

impl fmt::Display for ExternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternKind::Func(sig) => write!(f, "{}", sig),
            ExternKind::Memory => write!(f, "memory"),
            ExternKind::Table => write!(f, "table"),
            ExternKind::Global => write!(f, "global"),
            ExternKind::Other => write!(f, "other"),
        }
    }
}

/// An import the module declares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportDescriptor {
    pub module: String,
    pub name: String,
    pub kind: ExternKind,
}

/// An export the module provides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportDescriptor {
    pub name: String,
    pub kind: ExternKind,
}

/// Validated module with metadata. Immutable once built.
pub struct CompiledModule {
    /// Module name/ID
    pub name: String,
    /// Module size in bytes
    pub size_bytes: usize,
    /// SHA-256 of the source bytes, hex encoded
    pub source_hash: String,
    /// Compilation time
    pub compile_time_ms: u64,
    module: Module,
    imports: Vec<ImportDescriptor>,
    exports: Vec<ExportDescriptor>,
}

impl CompiledModule {
    fn new(name: String, module: Module, source_hash: String, size_bytes: usize, compile_time_ms: u64) -> Self {
        let imports = module
            .imports()
            .map(|i| ImportDescriptor {
                module: i.module().to_string(),
                name: i.name().to_string(),
                kind: ExternKind::from(&i.ty()),
            })
            .collect();
        let exports = module
            .exports()
            .map(|e| ExportDescriptor {
                name: e.name().to_string(),
                kind: ExternKind::from(&e.ty()),
            })
            .collect();

        Self {
            name,
            size_bytes,
            source_hash,
            compile_time_ms,
            module,
            imports,
            exports,
        }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn imports(&self) -> &[ImportDescriptor] {
        &self.imports
    }

    pub fn exports(&self) -> &[ExportDescriptor] {
        &self.exports
    }

    pub fn export(&self, name: &str) -> Option<&ExportDescriptor> {
        self.exports.iter().find(|e| e.name == name)
    }

    pub fn has_export(&self, name: &str) -> bool {
        self.export(name).is_some()
    }
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("name", &self.name)
            .field("size_bytes", &self.size_bytes)
            .field("source_hash", &self.source_hash)
            .field("imports", &self.imports.len())
            .field("exports", &self.exports.len())
            .finish()
    }
}

/// Hex SHA-256 of `bytes`.
pub fn source_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Reject input that cannot be a core module before handing it to the compiler.
/// Text input is let through so wasmtime can parse it as WAT.
fn check_header(bytes: &[u8]) -> Result<(), LoadError> {
    if bytes.is_empty() {
        return Err(LoadError::Malformed("empty module".to_string()));
    }

    let looks_binary = bytes.starts_with(WASM_MAGIC)
        || (bytes.len() < WASM_MAGIC.len() && WASM_MAGIC.starts_with(bytes));
    if looks_binary {
        if bytes.len() < 8 {
            return Err(LoadError::Malformed(format!(
                "truncated header: {} of 8 bytes",
                bytes.len()
            )));
        }
        let version = [bytes[4], bytes[5], bytes[6], bytes[7]];
        if version == CORE_VERSION {
            return Ok(());
        }
        if version[2..] == [1, 0] {
            return Err(LoadError::Malformed(
                "component model binaries are not supported".to_string(),
            ));
        }
        return Err(LoadError::Malformed(format!(
            "unsupported binary version {:?}",
            version
        )));
    }

    match std::str::from_utf8(bytes) {
        Ok(text) if text.trim_start().starts_with('(') || text.trim_start().starts_with(";;") => {
            Ok(())
        }
        _ => Err(LoadError::Malformed(
            "missing \\0asm magic header".to_string(),
        )),
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct CacheInner {
    modules: HashMap<String, Arc<CompiledModule>>,
    /// Insertion order for eviction
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
}

/// Compiled modules keyed by source hash, oldest evicted first
pub struct ModuleCache {
    inner: RwLock<CacheInner>,
    max_entries: usize,
}

impl ModuleCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            max_entries,
        }
    }

    pub async fn get(&self, hash: &str) -> Option<Arc<CompiledModule>> {
        let mut inner = self.inner.write().await;
        match inner.modules.get(hash).cloned() {
            Some(module) => {
                inner.hits += 1;
                Some(module)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub async fn insert(&self, module: Arc<CompiledModule>) {
        if self.max_entries == 0 {
            return;
        }
        let hash = module.source_hash.clone();
        let mut inner = self.inner.write().await;
        if inner.modules.contains_key(&hash) {
            return;
        }
        while inner.modules.len() >= self.max_entries {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.modules.remove(&oldest);
            debug!("Evicted cached module {}", oldest);
        }
        inner.order.push_back(hash.clone());
        inner.modules.insert(hash, module);
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.modules.clear();
        inner.order.clear();
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.read().await;
        CacheStats {
            entries: inner.modules.len(),
            total_size_bytes: inner.modules.values().map(|m| m.size_bytes).sum(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

impl Default for ModuleCache {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Loads and compiles modules against one engine
pub struct ModuleLoader {
    engine: Engine,
    cache: ModuleCache,
    http: reqwest::Client,
}

impl ModuleLoader {
    pub fn new(engine: &Engine, max_cached_modules: usize) -> Self {
        Self {
            engine: engine.clone(),
            cache: ModuleCache::new(max_cached_modules),
            http: reqwest::Client::new(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Validate and compile `bytes`. No caching, no I/O.
    pub fn compile(&self, name: &str, bytes: &[u8]) -> Result<CompiledModule, LoadError> {
        check_header(bytes)?;

        let start = Instant::now();
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| LoadError::Malformed(format!("{:#}", e)))?;
        let compile_time_ms = start.elapsed().as_millis() as u64;

        info!(
            "Compiled module {} in {}ms ({} bytes)",
            name,
            compile_time_ms,
            bytes.len()
        );

        Ok(CompiledModule::new(
            name.to_string(),
            module,
            source_hash(bytes),
            bytes.len(),
            compile_time_ms,
        ))
    }

    /// Obtain the bytes for `source`, then compile them (or reuse a cached
    /// module with the same hash).
    pub async fn load(&self, source: impl Into<ModuleSource>) -> Result<Arc<CompiledModule>, LoadError> {
        let source = source.into();
        let name = source.default_name();
        let bytes = self.fetch(&source).await?;
        let hash = source_hash(&bytes);

        if let Some(cached) = self.cache.get(&hash).await {
            debug!("Using cached module for {}", source);
            return Ok(cached);
        }

        let name = name.unwrap_or_else(|| format!("module-{}", &hash[..12]));
        let compiled = Arc::new(self.compile(&name, &bytes)?);
        self.cache.insert(compiled.clone()).await;
        Ok(compiled)
    }

    /// Read the raw bytes behind `source`.
    pub async fn fetch(&self, source: &ModuleSource) -> Result<Vec<u8>, LoadError> {
        match source {
            ModuleSource::Bytes(bytes) => Ok(bytes.clone()),
            ModuleSource::Path(path) => tokio::fs::read(path).await.map_err(|e| {
                LoadError::Unavailable(format!("failed to read {}: {}", path.display(), e))
            }),
            ModuleSource::Url(url) => {
                debug!("Fetching module from {}", url);
                let response = self
                    .http
                    .get(url.clone())
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| LoadError::Unavailable(format!("failed to fetch {}: {}", url, e)))?;
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| LoadError::Unavailable(format!("failed to read body of {}: {}", url, e)))?;
                Ok(bytes.to_vec())
            }
        }
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
        info!("Module cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader() -> ModuleLoader {
        ModuleLoader::new(&Engine::default(), 10)
    }

    #[test]
    fn test_check_header() {
        assert!(check_header(b"\0asm\x01\0\0\0").is_ok());
        assert!(check_header(b"(module)").is_ok());
        assert!(matches!(check_header(b""), Err(LoadError::Malformed(_))));
        assert!(matches!(check_header(b"\0as"), Err(LoadError::Malformed(_))));
        assert!(matches!(check_header(b"\0asm\x01"), Err(LoadError::Malformed(_))));
        assert!(matches!(check_header(b"\x7fELF\x02\x01\x01\0"), Err(LoadError::Malformed(_))));
        assert!(matches!(check_header(b"\0asm\x02\0\0\0"), Err(LoadError::Malformed(_))));

        let err = check_header(b"\0asm\x0d\0\x01\0").unwrap_err();
        assert!(err.to_string().contains("component model"));
    }

    #[test]
    fn test_module_source_parse() {
        assert!(matches!(
            ModuleSource::parse("https://example.com/app.wasm"),
            ModuleSource::Url(_)
        ));
        assert_eq!(
            ModuleSource::parse("build/app.wasm"),
            ModuleSource::Path(PathBuf::from("build/app.wasm"))
        );
        assert_eq!(
            ModuleSource::parse("file:///tmp/app.wasm"),
            ModuleSource::Path(PathBuf::from("/tmp/app.wasm"))
        );
    }

    #[test]
    fn test_default_name() {
        assert_eq!(
            ModuleSource::parse("https://example.com/dist/orion-client.wasm").default_name(),
            Some("orion-client".to_string())
        );
        assert_eq!(
            ModuleSource::parse("out/hello.wasm").default_name(),
            Some("hello".to_string())
        );
        assert_eq!(ModuleSource::Bytes(vec![]).default_name(), None);
    }

    #[test]
    fn test_compile_wat_collects_metadata() {
        let wat = r#"
            (module
                (import "wasi_snapshot_preview1" "proc_exit" (func (param i32)))
                (memory (export "memory") 1)
                (func (export "answer") (result i32)
                    i32.const 42
                )
            )
        "#;

        let compiled = loader().compile("test", wat.as_bytes()).unwrap();
        assert_eq!(compiled.name, "test");
        assert_eq!(compiled.imports().len(), 1);
        assert_eq!(compiled.imports()[0].name, "proc_exit");
        assert!(compiled.has_export("answer"));
        assert_eq!(compiled.export("memory").unwrap().kind, ExternKind::Memory);
        assert_eq!(compiled.source_hash.len(), 64);
    }

    #[test]
    fn test_compile_invalid_body_is_malformed() {
        // Valid header, truncated section.
        let bytes = b"\0asm\x01\0\0\0\x01\x05";
        assert!(matches!(
            loader().compile("bad", bytes),
            Err(LoadError::Malformed(_))
        ));
        assert!(matches!(
            loader().compile("bad", b"(module (func (export \"f\") i32.add))"),
            Err(LoadError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_load_uses_cache() {
        let loader = loader();
        let a = loader.load(b"(module)".to_vec()).await.unwrap();
        let b = loader.load(b"(module)".to_vec()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let stats = loader.cache_stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_unavailable() {
        let err = loader()
            .load(PathBuf::from("/nonexistent/orion/app.wasm"))
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_module_cache_eviction() {
        let loader = ModuleLoader::new(&Engine::default(), 1);
        let a = loader.load(b"(module)".to_vec()).await.unwrap();
        let _b = loader.load(b"(module (memory 1))".to_vec()).await.unwrap();
        assert_eq!(loader.cache_stats().await.entries, 1);

        let a2 = loader.load(b"(module)".to_vec()).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &a2));
    }

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            entries: 10,
            total_size_bytes: 1000,
            hits: 80,
            misses: 20,
        };
        assert_eq!(stats.hit_rate(), 0.8);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
