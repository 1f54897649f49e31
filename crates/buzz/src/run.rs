//! The embedding surface: compile and execute Buzz source.
//!
//! A [`Runner`] owns everything that outlives one execution: the heap, the
//! identifier interner, the type registry, the globals table, the
//! compile-time module cache, and the runtime export cache. Compilation is
//! strictly linear per module — lex, parse/check, lower — and a module
//! compiles once per process regardless of how many files import it.

use std::{
    fs,
    path::{Path, PathBuf},
};

use ahash::AHashMap;

use crate::{
    ast::{Expr, ExprKind},
    bytecode::{CompileMode, compile_module},
    error::{BuzzError, CompileReport, Span},
    heap::{Heap, HeapId, HeapStats},
    intern::{Interns, NameId},
    io::PrintWriter,
    native::{CORE_NATIVES, NativeDef},
    parser::{self, GlobalSym, SymbolKind},
    typedef::{FunctionKind, FunctionType, ObjectId, TypeDesc, TypeRegistry},
    value::{Obj, ObjNative, Value},
    vm::Vm,
};

/// File extension tried when an import spec has none.
const MODULE_EXTENSION: &str = "buzz";

/// Environment variable holding a colon-separated import search prefix.
const PATH_ENV: &str = "BUZZ_PATH";

/// A compiled module in the per-process cache.
#[derive(Debug, Clone)]
pub(crate) struct ModuleUnit {
    pub closure: HeapId,
    pub exports: Vec<GlobalSym>,
}

/// Compile-time state shared across every module of a process: interners,
/// the type registry, the heap (chunks and constants live there), global
/// slot allocation, declaration side tables, and the module cache.
pub(crate) struct Shared {
    pub interns: Interns,
    pub registry: TypeRegistry,
    pub heap: Heap,
    /// Native prelude symbols injected into every module namespace.
    pub prelude: Vec<GlobalSym>,
    /// Default-value fragments of methods, by declaring object.
    pub method_defaults: AHashMap<(ObjectId, NameId), Vec<Option<Expr>>>,
    /// Default-value fragments of object fields, by declaring object.
    pub field_defaults: AHashMap<(ObjectId, NameId), Expr>,
    next_global: u32,
    modules: AHashMap<PathBuf, ModuleUnit>,
    /// Modules currently compiling, for circular-import detection.
    module_stack: Vec<PathBuf>,
    /// Export symbols of modules currently compiling, innermost last.
    export_stack: Vec<Vec<GlobalSym>>,
    /// `-L` directories, in order.
    pub search_paths: Vec<PathBuf>,
}

impl Shared {
    fn new() -> Self {
        Self {
            interns: Interns::new(),
            registry: TypeRegistry::new(),
            heap: Heap::new(),
            prelude: Vec::new(),
            method_defaults: AHashMap::new(),
            field_defaults: AHashMap::new(),
            next_global: 0,
            modules: AHashMap::new(),
            module_stack: Vec::new(),
            export_stack: Vec::new(),
            search_paths: Vec::new(),
        }
    }

    /// Allocates one global slot in the runner-wide table.
    pub(crate) fn alloc_global(&mut self) -> u32 {
        let slot = self.next_global;
        self.next_global += 1;
        slot
    }

    /// Allocates `count` consecutive global slots, returning the base.
    pub(crate) fn alloc_globals(&mut self, count: u32) -> u32 {
        let base = self.next_global;
        self.next_global += count;
        base
    }

    /// Records an exported symbol of the module currently compiling.
    pub(crate) fn record_export(&mut self, sym: GlobalSym) {
        if let Some(exports) = self.export_stack.last_mut() {
            exports.push(sym);
        }
    }

    /// Compiles (or fetches) the module named by an import spec.
    ///
    /// Returns the module closure and its export symbols; the importer maps
    /// those onto freshly allocated global slots.
    pub(crate) fn import_module(
        &mut self,
        spec: &str,
        importer_dir: Option<&Path>,
    ) -> Result<(HeapId, Vec<GlobalSym>), String> {
        let path = self
            .resolve_module(spec, importer_dir)
            .ok_or_else(|| format!("module `{spec}` not found"))?;
        if let Some(unit) = self.modules.get(&path) {
            return Ok((unit.closure, unit.exports.clone()));
        }
        if self.module_stack.contains(&path) {
            return Err(format!("circular import of `{}`", path.display()));
        }
        tracing::debug!(module = %path.display(), "compiling imported module");
        let source = fs::read_to_string(&path)
            .map_err(|err| format!("can't read module `{}`: {err}", path.display()))?;

        self.module_stack.push(path.clone());
        self.export_stack.push(Vec::new());
        let (module, errors) =
            parser::parse_module(&source, Some(&path), FunctionKind::Script, self);
        let exports = self.export_stack.pop().expect("export stack balanced");
        self.module_stack.pop();

        if !errors.is_empty() {
            let rendered = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(format!("errors in `{}`: {rendered}", path.display()));
        }
        let Some(module) = module else {
            return Err(format!("module `{}` failed to parse", path.display()));
        };
        let closure = compile_module(
            &mut self.heap,
            &self.interns,
            &self.registry,
            &module,
            &CompileMode::Script,
        );
        self.modules.insert(
            path,
            ModuleUnit {
                closure,
                exports: exports.clone(),
            },
        );
        Ok((closure, exports))
    }

    /// Closures of every cached module; the VM keeps these alive across
    /// collections so a later compilation can still reference them.
    pub(crate) fn module_closures(&self) -> Vec<HeapId> {
        self.modules.values().map(|unit| unit.closure).collect()
    }

    /// Resolution order: absolute path, relative to the importing file,
    /// each `-L` directory, each `BUZZ_PATH` entry, the built-in library
    /// directory. First existing file wins.
    fn resolve_module(&self, spec: &str, importer_dir: Option<&Path>) -> Option<PathBuf> {
        let spec_path = Path::new(spec);
        if spec_path.is_absolute() {
            return existing_module(spec_path.to_path_buf());
        }
        let mut bases: Vec<PathBuf> = Vec::new();
        if let Some(dir) = importer_dir {
            bases.push(dir.to_path_buf());
        }
        bases.extend(self.search_paths.iter().cloned());
        if let Ok(env_path) = std::env::var(PATH_ENV) {
            bases.extend(env_path.split(':').filter(|p| !p.is_empty()).map(PathBuf::from));
        }
        bases.push(PathBuf::from("lib"));
        for base in bases {
            if let Some(found) = existing_module(base.join(spec_path)) {
                tracing::debug!(spec, path = %found.display(), "resolved import");
                return Some(found);
            }
        }
        None
    }
}

fn existing_module(candidate: PathBuf) -> Option<PathBuf> {
    if candidate.is_file() {
        return candidate.canonicalize().ok();
    }
    let with_extension = candidate.with_extension(MODULE_EXTENSION);
    if with_extension.is_file() {
        return with_extension.canonicalize().ok();
    }
    None
}

/// Compiles and runs Buzz programs against one persistent session.
pub struct Runner {
    shared: Shared,
    globals: Vec<Value>,
    module_exports: AHashMap<HeapId, Vec<Value>>,
    cycle_limit: Option<u64>,
    script_args: Vec<String>,
    print_slot: u32,
}

impl Runner {
    #[must_use]
    pub fn new() -> Self {
        let mut shared = Shared::new();
        let mut globals = Vec::new();
        let mut print_slot = 0;
        for def in CORE_NATIVES {
            let (sym, value) = install_native(&mut shared, def);
            if def.name == "print" {
                print_slot = sym.slot;
            }
            debug_assert_eq!(sym.slot as usize, globals.len());
            globals.push(value);
            shared.prelude.push(sym);
        }
        Self {
            shared,
            globals,
            module_exports: AHashMap::new(),
            cycle_limit: None,
            script_args: Vec::new(),
            print_slot,
        }
    }

    /// Adds a library search directory (the CLI's `-L`).
    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.shared.search_paths.push(path.into());
    }

    /// Sets the arguments passed to `main`.
    pub fn set_args(&mut self, args: Vec<String>) {
        self.script_args = args;
    }

    /// Caps executed instructions; exceeding the cap is a runtime error.
    pub fn set_cycle_limit(&mut self, limit: u64) {
        self.cycle_limit = Some(limit);
    }

    /// Heap statistics, for embedders and tests.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.shared.heap.stats()
    }

    /// Compiles and runs a script; `path` anchors relative imports.
    pub fn run_source(
        &mut self,
        source: &str,
        path: Option<&Path>,
        writer: &mut impl PrintWriter,
    ) -> Result<(), BuzzError> {
        let mode = CompileMode::Entry {
            args: self.script_args.clone(),
        };
        let closure = self.compile_entry(source, path, &mode)?;
        self.execute(closure, writer)
    }

    /// Compiles without running.
    pub fn check_source(&mut self, source: &str, path: Option<&Path>) -> Result<(), BuzzError> {
        let mode = CompileMode::Entry { args: Vec::new() };
        self.compile_entry(source, path, &mode).map(|_| ())
    }

    /// Compiles in test mode and runs every `test` block.
    pub fn run_tests(
        &mut self,
        source: &str,
        path: Option<&Path>,
        writer: &mut impl PrintWriter,
    ) -> Result<(), BuzzError> {
        let mode = CompileMode::TestEntry {
            print_slot: self.print_slot,
        };
        let closure = self.compile_entry(source, path, &mode)?;
        self.execute(closure, writer)
    }

    /// Reads and runs a script file.
    pub fn run_file(
        &mut self,
        path: &Path,
        writer: &mut impl PrintWriter,
    ) -> Result<(), BuzzError> {
        let source = fs::read_to_string(path).map_err(|err| {
            BuzzError::Compile(CompileReport {
                errors: vec![crate::error::CompileError::new(
                    crate::error::CompileErrorKind::CompileError,
                    format!("can't read `{}`: {err}", path.display()),
                    Span::default(),
                )],
            })
        })?;
        self.run_source(&source, Some(path), writer)
    }

    fn compile_entry(
        &mut self,
        source: &str,
        path: Option<&Path>,
        mode: &CompileMode,
    ) -> Result<HeapId, BuzzError> {
        tracing::debug!(?path, "compiling entry module");
        self.shared.export_stack.push(Vec::new());
        let (module, errors) =
            parser::parse_module(source, path, FunctionKind::ScriptEntryPoint, &mut self.shared);
        self.shared.export_stack.pop();
        if !errors.is_empty() {
            return Err(BuzzError::Compile(CompileReport { errors }));
        }
        let Some(module) = module else {
            return Err(BuzzError::Compile(CompileReport::default()));
        };
        Ok(compile_module(
            &mut self.shared.heap,
            &self.shared.interns,
            &self.shared.registry,
            &module,
            mode,
        ))
    }

    fn execute(
        &mut self,
        closure: HeapId,
        writer: &mut impl PrintWriter,
    ) -> Result<(), BuzzError> {
        let persistent_roots = self.shared.module_closures();
        let mut vm = Vm::new(
            &mut self.shared.heap,
            &self.shared.interns,
            &self.shared.registry,
            &mut self.globals,
            &mut self.module_exports,
            writer,
            &persistent_roots,
            self.cycle_limit,
        );
        vm.run(closure).map(|_| ()).map_err(BuzzError::Runtime)
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocates a native on the heap and builds its prelude symbol: value,
/// function type, and default fragments.
fn install_native(shared: &mut Shared, def: &NativeDef) -> (GlobalSym, Value) {
    let prim = shared.registry.prim();
    let name = shared.interns.intern(def.name);
    let id = shared.heap.alloc(Obj::Native(ObjNative {
        name,
        arity: def.arity,
        function: def.function,
    }));
    let string_default = Expr {
        kind: ExprKind::StringLiteral("".into()),
        ty: prim.string,
        span: Span::default(),
    };
    let (params, defaults, ret): (Vec<(&str, _)>, Vec<Option<Expr>>, _) = match def.name {
        "print" => (vec![("value", prim.string)], vec![None], prim.void),
        "assert" => (
            vec![("condition", prim.boolean), ("message", prim.string)],
            vec![None, Some(string_default)],
            prim.void,
        ),
        "toString" => (vec![("value", prim.integer)], vec![None], prim.string),
        "parseInt" => (
            vec![("value", prim.string)],
            vec![None],
            shared.registry.with_optional(prim.integer, true),
        ),
        other => unreachable!("unknown core native `{other}`"),
    };
    let params: Vec<(NameId, _)> = params
        .into_iter()
        .map(|(param, ty)| (shared.interns.intern(param), ty))
        .collect();
    let has_default: Vec<bool> = defaults.iter().map(Option::is_some).collect();
    let ty = shared.registry.intern(
        TypeDesc::Function(FunctionType {
            name: Some(name),
            params,
            defaults: has_default,
            ret,
            kind: FunctionKind::Extern,
        }),
        false,
    );
    let slot = shared.alloc_global();
    (
        GlobalSym {
            name,
            ty,
            slot,
            constant: true,
            kind: SymbolKind::Function { defaults },
        },
        Value::Obj(id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::CollectStringPrint;

    #[test]
    fn empty_script_runs_cleanly_with_no_output() {
        let mut runner = Runner::new();
        let mut out = CollectStringPrint::new();
        runner.run_source("", None, &mut out).expect("empty script runs");
        assert_eq!(out.output(), "");
    }

    #[test]
    fn relative_imports_resolve_and_cache_once() {
        let dir = std::env::temp_dir().join(format!("buzz-import-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("create temp dir");
        let module = dir.join("counter.buzz");
        fs::write(
            &module,
            "export fun bump(int value) > int { return value + 1; }\n",
        )
        .expect("write module");
        let entry = dir.join("main.buzz");
        let source = "import \"counter\";\nprint(\"{bump(41)}\");\nimport \"counter\";\n";
        fs::write(&entry, source).expect("write entry");

        let mut runner = Runner::new();
        let mut out = CollectStringPrint::new();
        runner
            .run_source(source, Some(&entry), &mut out)
            .expect("script with import runs");
        assert_eq!(out.output(), "42\n");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn cycle_limit_stops_runaway_loops() {
        let mut runner = Runner::new();
        runner.set_cycle_limit(10_000);
        let mut out = CollectStringPrint::new();
        let err = runner
            .run_source("while (true) { }", None, &mut out)
            .expect_err("infinite loop hits the cycle limit");
        let BuzzError::Runtime(err) = err else {
            panic!("expected a runtime error, got {err}");
        };
        assert_eq!(err.kind, crate::error::RuntimeErrorKind::CycleLimit);
    }
}
