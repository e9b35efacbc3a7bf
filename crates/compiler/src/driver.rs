//! Top-level driver
//!
//! Compiling a buffer is transactional over the compile-time environment
//! and the VM's global frame:
//!
//! 1. snapshot the top level,
//! 2. parse against it (the parser may add declarations),
//! 3. run the pass pipeline into an executable program,
//! 4. run the program,
//! 5. on success commit; on any error restore the snapshot and truncate
//!    the runtime globals back.
//!
//! Construction loads the embedded standard prelude (the `Exception` type
//! and the standard exception codes) and, unless suppressed, the standard
//! type aliases. A failure in either aborts construction.

use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use jab_runtime::exception::exception_msg;
use jab_runtime::program::Program;
use jab_runtime::value::Value;
use jab_runtime::Vm;
use tracing::debug;

use crate::ast::{AstCtx, DeclKind, Node, NodeKind};
use crate::env::{CEnv, Decl};
use crate::error::CompileError;
use crate::parser::{parse, AlienLit, StartSymbol};
use crate::passes;

/// Suppress loading of the standard type aliases.
pub const FLAG_NOSTDTYPES: u32 = 1 << 0;

const STD_JAB: &str = include_str!("../stdlib/std.jab");
const STD_TYPES_JAB: &str = include_str!("../stdlib/std-types.jab");

/// A driver-level failure: the compile failed, or the program raised an
/// exception that nothing handled.
#[derive(Debug)]
pub enum JabError {
    Compile(CompileError),
    Exception(Value),
}

impl fmt::Display for JabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JabError::Compile(e) => write!(f, "{}", e),
            JabError::Exception(_) => write!(f, "unhandled exception"),
        }
    }
}

impl std::error::Error for JabError {}

impl From<CompileError> for JabError {
    fn from(e: CompileError) -> Self {
        JabError::Compile(e)
    }
}

pub type AlienHandler = Box<dyn Fn(&str) -> Option<AlienLit>>;

pub struct Compiler {
    ctx: Rc<AstCtx>,
    env: CEnv,
    pub error_on_warning: bool,
    pub quiet_p: bool,
    /// Capture the final tree of each compile as formatted text.
    pub debug_p: bool,
    /// Recognise `$<...>` alien tokens.
    pub lexical_cuckolding_p: bool,
    alien_fn: Option<AlienHandler>,
    load_path: Vec<String>,
    data_dir: PathBuf,
    last_ast: Option<String>,
}

impl Compiler {
    /// Build a compiler over `vm`, loading the standard prelude. Pass
    /// [`FLAG_NOSTDTYPES`] to skip the standard type aliases.
    pub fn new(vm: &mut Vm, flags: u32) -> Result<Self, JabError> {
        let mut c = Compiler {
            ctx: AstCtx::new(),
            env: CEnv::new(),
            error_on_warning: false,
            quiet_p: false,
            debug_p: false,
            lexical_cuckolding_p: false,
            alien_fn: None,
            load_path: vec!["%DATADIR%".to_string()],
            data_dir: PathBuf::from("/usr/share/jab"),
            last_ast: None,
        };
        c.execute_buffer(vm, STD_JAB, StartSymbol::Program)?;
        if flags & FLAG_NOSTDTYPES == 0 {
            c.execute_buffer(vm, STD_TYPES_JAB, StartSymbol::Program)?;
        }
        Ok(c)
    }

    pub fn set_alien_handler(&mut self, f: AlienHandler) {
        self.alien_fn = Some(f);
    }

    pub fn set_load_path(&mut self, path: &str) {
        self.load_path = split_load_path(path);
    }

    pub fn set_data_dir(&mut self, dir: PathBuf) {
        self.data_dir = dir;
    }

    /// Formatted tree of the last compile, when `debug_p` is set.
    pub fn last_ast(&self) -> Option<&str> {
        self.last_ast.as_deref()
    }

    /// Whether a top-level name is currently declared.
    pub fn declared(&self, name: &str) -> bool {
        self.env.lookup(name).is_some()
    }

    // -- compile and execute -----------------------------------------------

    /// Compile and run a buffer; the environment commits only if both
    /// steps succeed.
    pub fn execute_buffer(
        &mut self,
        vm: &mut Vm,
        src: &str,
        start: StartSymbol,
    ) -> Result<Value, JabError> {
        let snap = self.env.snapshot();
        let globals_before = vm.global_count();
        let program = match self.compile_with(vm, src, start) {
            Ok(p) => p,
            Err(e) => {
                self.env.restore(snap);
                return Err(e.into());
            }
        };
        match vm.run(&program) {
            Ok(v) => Ok(v),
            Err(exc) => {
                self.env.restore(snap);
                vm.truncate_globals(globals_before);
                Err(JabError::Exception(exc))
            }
        }
    }

    pub fn execute_expression(&mut self, vm: &mut Vm, src: &str) -> Result<Value, JabError> {
        self.execute_buffer(vm, src, StartSymbol::Expression)
    }

    pub fn execute_statement(&mut self, vm: &mut Vm, src: &str) -> Result<Value, JabError> {
        self.execute_buffer(vm, src, StartSymbol::Statement)
    }

    pub fn execute_program(&mut self, vm: &mut Vm, src: &str) -> Result<Value, JabError> {
        self.execute_buffer(vm, src, StartSymbol::Program)
    }

    /// Compile and run a source file.
    pub fn execute_file(&mut self, vm: &mut Vm, path: &Path) -> Result<Value, JabError> {
        let src = std::fs::read_to_string(path).map_err(CompileError::from)?;
        self.execute_program(vm, &src)
    }

    /// Compile an expression without running it. The environment still
    /// commits on success.
    pub fn compile_expression(
        &mut self,
        vm: &mut Vm,
        src: &str,
    ) -> Result<Rc<Program>, CompileError> {
        self.compile_only(vm, src, StartSymbol::Expression)
    }

    pub fn compile_statement(
        &mut self,
        vm: &mut Vm,
        src: &str,
    ) -> Result<Rc<Program>, CompileError> {
        self.compile_only(vm, src, StartSymbol::Statement)
    }

    fn compile_only(
        &mut self,
        vm: &mut Vm,
        src: &str,
        start: StartSymbol,
    ) -> Result<Rc<Program>, CompileError> {
        let snap = self.env.snapshot();
        match self.compile_with(vm, src, start) {
            Ok(p) => Ok(p),
            Err(e) => {
                self.env.restore(snap);
                Err(e)
            }
        }
    }

    fn compile_with(
        &mut self,
        vm: &mut Vm,
        src: &str,
        start: StartSymbol,
    ) -> Result<Rc<Program>, CompileError> {
        // The default alien handler resolves the delimited text as an IO
        // space handler, splicing in its id.
        let default_alien;
        let alien: Option<&dyn Fn(&str) -> Option<AlienLit>> = if self.lexical_cuckolding_p {
            match &self.alien_fn {
                Some(f) => Some(f.as_ref()),
                None => {
                    let ios = vm.ios_ref();
                    default_alien = move |text: &str| {
                        ios.search(text).map(|id| AlienLit::Int {
                            value: id as i64,
                            size: 32,
                            signed: true,
                        })
                    };
                    let r: &dyn Fn(&str) -> Option<AlienLit> = &default_alien;
                    Some(r)
                }
            }
        } else {
            None
        };

        let mut ast = parse(
            src,
            &self.ctx,
            &mut self.env,
            start,
            self.lexical_cuckolding_p,
            alien,
        )?;
        let ntop = count_top_decls(&ast);
        let p = passes::run(&mut ast, &mut self.env, &self.ctx, vm, start, ntop)?;
        if self.debug_p {
            self.last_ast = Some(format!("{:#?}", ast));
        }
        Ok(p)
    }

    // -- defvar ------------------------------------------------------------

    /// Declare a top-level variable holding `val`. The type is inferred
    /// from the value; no code runs.
    pub fn defvar(&mut self, vm: &mut Vm, name: &str, val: Value) -> Result<(), CompileError> {
        let ty = self.type_node_of_value(vm, val).ok_or_else(|| {
            CompileError::ty(
                Default::default(),
                format!("cannot infer a declarable type for '{}'", name),
            )
        })?;
        self.env.register(Decl {
            name: name.to_string(),
            kind: DeclKind::Var,
            ty: Some(ty),
        });
        vm.register_global(val);
        Ok(())
    }

    fn type_node_of_value(&self, vm: &Vm, v: Value) -> Option<Node> {
        use jab_runtime::value::{Object, TypeVal};
        let loc = Default::default();
        match v {
            Value::Int { size, .. } | Value::Long { size, .. } => Some(Node::new(
                &self.ctx,
                NodeKind::TypeIntegral {
                    size: size as u32,
                    signed: true,
                },
                loc,
            )),
            Value::UInt { size, .. } | Value::ULong { size, .. } => Some(Node::new(
                &self.ctx,
                NodeKind::TypeIntegral {
                    size: size as u32,
                    signed: false,
                },
                loc,
            )),
            Value::Ref(r) => match vm.heap().get(r) {
                Object::Str(_) => Some(Node::new(&self.ctx, NodeKind::TypeString, loc)),
                Object::Off(o) => {
                    let base = self.type_node_of_value(vm, o.magnitude)?;
                    Some(Node::new(
                        &self.ctx,
                        NodeKind::TypeOffset {
                            base: Box::new(base),
                            unit: o.unit,
                        },
                        loc,
                    ))
                }
                Object::Sct(s) => {
                    // Nominal types only: the struct's type name must be
                    // declared.
                    let name = s.stype.as_ref().and_then(|tr| match vm.heap().get(tr) {
                        Object::Typ(TypeVal::Struct(st)) => st
                            .name
                            .as_ref()
                            .and_then(|nr| vm.heap().get(nr).as_str())
                            .map(|s| s.to_string()),
                        _ => None,
                    })?;
                    match self.env.lookup(&name) {
                        Some((back, over, d)) if d.kind == DeclKind::Type => Some(Node::new(
                            &self.ctx,
                            NodeKind::TypeNamed { name, back, over },
                            loc,
                        )),
                        _ => None,
                    }
                }
                _ => None,
            },
            Value::Null => None,
        }
    }

    // -- modules -----------------------------------------------------------

    /// Load a module by name, searching the load path. `literal` marks
    /// the argument as a complete filename.
    pub fn load(&mut self, vm: &mut Vm, module: &str, literal: bool) -> Result<Value, JabError> {
        let path = resolve_module(module, &self.load_path, &self.data_dir, literal)
            .ok_or_else(|| {
                JabError::Compile(CompileError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("module '{}' not found in the load path", module),
                )))
            })?;
        debug!(module, path = %path.display(), "loading module");
        let src = std::fs::read_to_string(&path).map_err(CompileError::from)?;
        self.execute_program(vm, &src)
    }
}

/// Describe an unhandled exception for the user, preferring its message.
pub fn describe_exception(vm: &mut Vm, exc: Value) -> String {
    if let Some(msg) = exception_msg(vm.heap(), exc) {
        return format!("unhandled exception: {}", msg);
    }
    match vm.format_value(exc) {
        Ok(s) => format!("unhandled exception: {}", s),
        Err(_) => "unhandled exception".to_string(),
    }
}

/// Top-level declarations of a parse, which the parser has already
/// registered. Enum desugaring nests declaration groups in inner
/// program nodes, so the count recurses through those.
fn count_top_decls(ast: &Node) -> usize {
    match &ast.kind {
        NodeKind::Program(stmts) => stmts.iter().map(count_top_decls).sum(),
        NodeKind::Decl { .. } => 1,
        _ => 0,
    }
}

/// Split a load path on `:`, keeping Windows drive-letter prefixes
/// (`X:/...`) intact.
pub fn split_load_path(s: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in s.split(':') {
        if cfg!(windows) {
            if let Some(last) = out.last_mut() {
                // A single letter before the ':' was a drive, not a
                // separator.
                if last.len() == 1
                    && last.chars().next().map(|c| c.is_ascii_alphabetic()) == Some(true)
                    && (part.starts_with('/') || part.starts_with('\\'))
                {
                    last.push(':');
                    last.push_str(part);
                    continue;
                }
            }
        }
        if !part.is_empty() {
            out.push(part.to_string());
        }
    }
    out
}

/// Resolve a module name to a file, expanding `%DATADIR%`.
pub fn resolve_module(
    name: &str,
    load_path: &[String],
    data_dir: &Path,
    literal: bool,
) -> Option<PathBuf> {
    let file_name = if literal || name.ends_with(".jab") {
        name.to_string()
    } else {
        format!("{}.jab", name)
    };
    let p = Path::new(&file_name);
    if p.is_absolute() {
        return if p.exists() { Some(p.to_path_buf()) } else { None };
    }
    for dir in load_path {
        let dir = if dir.contains("%DATADIR%") {
            PathBuf::from(dir.replace("%DATADIR%", &data_dir.to_string_lossy()))
        } else {
            PathBuf::from(dir)
        };
        let candidate = dir.join(&file_name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_load_path() {
        assert_eq!(split_load_path("a:b:c"), vec!["a", "b", "c"]);
        assert_eq!(split_load_path("%DATADIR%"), vec!["%DATADIR%"]);
    }

    #[test]
    fn test_resolve_module_searches_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mod.jab"), "var loaded = 1;").unwrap();

        let lp = vec![dir.path().to_string_lossy().to_string()];
        let found = resolve_module("mod", &lp, Path::new("/nowhere"), false).unwrap();
        assert!(found.ends_with("mod.jab"));
        assert!(resolve_module("missing", &lp, Path::new("/nowhere"), false).is_none());
    }

    #[test]
    fn test_resolve_module_datadir_expansion() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sys.jab"), "").unwrap();
        let lp = vec!["%DATADIR%".to_string()];
        let found = resolve_module("sys", &lp, dir.path(), false);
        assert!(found.is_some());
    }
}
