use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::runtime::native::{NativeModule, NativeModuleLoader, StaticNativeLoader};
use crate::runtime::runtime_error::{RuntimeError, RuntimeErrorKind};
use crate::runtime::value::Module;

/// Where `use` looks for source modules.
#[derive(Debug, Clone)]
pub struct ModuleLoaderConfig {
    /// Searched after the importing file's directory.
    pub search_paths: Vec<PathBuf>,
    /// Source file extension, without the dot.
    pub extension: String,
    /// Environment variable holding extra search paths.
    pub path_env: String,
}

impl Default for ModuleLoaderConfig {
    fn default() -> Self {
        ModuleLoaderConfig {
            search_paths: Vec::new(),
            extension: "ft".to_string(),
            path_env: "FT_PATH".to_string(),
        }
    }
}

impl ModuleLoaderConfig {
    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_path_env(mut self, var: impl Into<String>) -> Self {
        self.path_env = var.into();
        self
    }
}

/// Module resolution and bookkeeping for one VM.
///
/// Executing a module is the VM's job; the loader finds files, remembers
/// finished modules and tracks the chain of modules being loaded.
pub struct ModuleLoader {
    config: ModuleLoaderConfig,
    cache: HashMap<PathBuf, Rc<Module>>,
    loading: Vec<PathBuf>,
    natives: Box<dyn NativeModuleLoader>,
}

impl ModuleLoader {
    pub fn new(config: ModuleLoaderConfig) -> Self {
        ModuleLoader {
            config,
            cache: HashMap::new(),
            loading: Vec::new(),
            natives: Box::new(StaticNativeLoader::with_stdlib()),
        }
    }

    pub fn config(&self) -> &ModuleLoaderConfig {
        &self.config
    }

    pub fn set_natives(&mut self, natives: Box<dyn NativeModuleLoader>) {
        self.natives = natives;
    }

    /// `a.b.c` as a relative file path `a/b/c.<ext>`.
    pub fn relative_path(&self, path: &str) -> PathBuf {
        let mut file: PathBuf = path.split('.').collect();
        file.set_extension(&self.config.extension);
        file
    }

    /// Directories searched, in order, for a module imported from `importer`.
    pub fn search_dirs(&self, importer: Option<&Path>) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        match importer.and_then(Path::parent) {
            Some(dir) => dirs.push(dir.to_path_buf()),
            None => dirs.push(PathBuf::from(".")),
        }
        dirs.extend(self.config.search_paths.iter().cloned());
        if let Some(paths) = env::var_os(&self.config.path_env) {
            dirs.extend(env::split_paths(&paths));
        }
        dirs
    }

    /// First existing source file for `path`, canonicalized.
    pub fn resolve(&self, path: &str, importer: Option<&Path>) -> Option<PathBuf> {
        let relative = self.relative_path(path);
        for dir in self.search_dirs(importer) {
            let candidate = dir.join(&relative);
            trace!(candidate = %candidate.display(), "probing module path");
            if candidate.is_file() {
                return Some(candidate.canonicalize().unwrap_or(candidate));
            }
        }
        None
    }

    /// File of the module currently being loaded, if any.
    pub fn current(&self) -> Option<&Path> {
        self.loading.last().map(PathBuf::as_path)
    }

    pub fn cached(&self, file: &Path) -> Option<Rc<Module>> {
        self.cache.get(file).cloned()
    }

    pub fn is_loading(&self, file: &Path) -> bool {
        self.loading.iter().any(|f| f == file)
    }

    /// Chain of files being loaded followed by `file`, for cycle reports.
    pub fn chain_to(&self, origin: Option<&Path>, file: &Path) -> String {
        let mut names: Vec<String> = origin.into_iter().map(display_name).collect();
        names.extend(self.loading.iter().map(|f| display_name(f)));
        names.push(display_name(file));
        names.join(" -> ")
    }

    pub fn begin(&mut self, file: PathBuf) {
        debug!(file = %file.display(), depth = self.loading.len(), "loading module");
        self.loading.push(file);
    }

    pub fn end(&mut self) {
        self.loading.pop();
    }

    pub fn finish(&mut self, file: PathBuf, module: Rc<Module>) {
        self.cache.insert(file, module);
    }

    pub fn load_native(&self, path: &str) -> Result<Option<NativeModule>, RuntimeError> {
        self.natives.load(path)
    }

    pub fn not_found(&self, path: &str) -> RuntimeError {
        RuntimeErrorKind::ModuleNotFound(path.to_string()).into()
    }
}

fn display_name(file: &Path) -> String {
    file.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string())
}
