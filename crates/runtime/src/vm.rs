//! The virtual machine
//!
//! A single-threaded stack machine over [`Value`] cells. Per instance it
//! owns the heap, the IO-space table, the main/return/exception stacks,
//! the current environment and the registry of live programs.
//!
//! The dispatch loop is re-entrant: instructions that need to run a
//! closure (constraint checkers, custom mappers, `_print` methods) enter
//! a nested execution whose return stack base fences it off. An exception
//! whose handler lives outside the fence unwinds the nested executions
//! one by one until the owning loop resumes at the handler.
//!
//! Execution is cooperative. At each instruction boundary the loop checks
//! the SIGINT flag (raised as the signal exception) and the heap's
//! allocation budget (triggering a collection with the VM's roots).

use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use jab_core::bits::{Endian, Nenc};
use jab_core::heap::{Heap, RootHandle};
use jab_core::ios::IosTable;
use tracing::debug;

use crate::env;
use crate::exception::{
    exception_code, make_exception, standard_name, EC_CONV, EC_DIV_BY_ZERO, EC_INVAL,
    EC_NO_RETURN, EC_OUT_OF_BOUNDS, EC_SIGNAL,
};
use crate::program::{AsmError, Insn, Program, ProgramBuilder};
use crate::value::{
    equal, make_integral, make_integral_type, make_offset, make_string, visit_value, ClosureVal,
    Object, TypeVal, Value,
};

/// Output mode of the printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OMode {
    Flat,
    Tree,
}

/// Runtime knobs, settable at any time.
#[derive(Debug, Clone)]
pub struct Knobs {
    pub endian: Endian,
    pub nenc: Nenc,
    pub pretty_print: bool,
    pub omode: OMode,
    /// Printer base: 2, 8, 10 or 16.
    pub obase: u32,
    /// Print mapping offsets.
    pub omaps: bool,
    pub oindent: u32,
    /// Maximum nesting depth printed; 0 means unlimited.
    pub odepth: u32,
    /// Maximum array elements printed; 0 means unlimited.
    pub oacutoff: u32,
    pub autoremap: bool,
}

impl Default for Knobs {
    fn default() -> Self {
        Knobs {
            endian: Endian::Little,
            nenc: Nenc::TwosComplement,
            pretty_print: false,
            omode: OMode::Flat,
            obase: 10,
            omaps: false,
            oindent: 2,
            odepth: 0,
            oacutoff: 0,
            autoremap: true,
        }
    }
}

/// Control transfer out of an instruction or a nested execution.
pub(crate) enum Ctl {
    /// An exception to dispatch at the current level.
    Ex(Value),
    /// A handler in an outer execution frame has been installed in
    /// `pending_resume`; unwind nested executions until it is reached.
    Unwind,
    /// No handler anywhere; execution terminates.
    Exit(Value),
}

impl Ctl {
    /// The exception carried, for surfacing at an API boundary.
    pub(crate) fn into_exception(self) -> Value {
        match self {
            Ctl::Ex(e) | Ctl::Exit(e) => e,
            Ctl::Unwind => Value::Null,
        }
    }
}

/// Return-stack entry: a call frame, or a plain value parked there by
/// `tor`.
enum RFrame {
    Call {
        program: Rc<Program>,
        pc: usize,
        env: Value,
    },
    Val(Value),
}

struct Handler {
    program: Rc<Program>,
    target: u32,
    /// Expected exception code, -1 for catch-all.
    code: i32,
    env: Value,
    sdepth: usize,
    rdepth: usize,
}

pub struct Vm {
    pub(crate) heap: Heap<Object>,
    pub(crate) ios: IosTable,
    pub(crate) stack: Vec<Value>,
    rstack: Vec<RFrame>,
    estack: Vec<Handler>,
    pub(crate) env: Value,
    /// Every program assembled through this VM; their literal tables are
    /// GC roots for as long as the program is alive.
    programs: Vec<Weak<Program>>,
    /// Cached integral types: signed 1..=64 then unsigned 1..=64.
    itypes: Vec<Value>,
    string_type: Value,
    void_type: Value,
    any_type: Value,
    exception_type: Value,
    pub knobs: Knobs,
    profile: Option<HashMap<&'static str, u64>>,
    interrupt: Arc<AtomicBool>,
    pending_resume: Option<(Rc<Program>, u32)>,
    pub(crate) out: String,
    result: Value,
    exit_exception: Value,
}

impl Vm {
    pub fn new() -> Self {
        let mut heap: Heap<Object> = Heap::new();
        let mut itypes = Vec::with_capacity(128);
        for size in 1..=64u32 {
            itypes.push(make_integral_type(&mut heap, size, true));
        }
        for size in 1..=64u32 {
            itypes.push(make_integral_type(&mut heap, size, false));
        }
        let string_type = Value::Ref(heap.alloc(Object::Typ(TypeVal::StringT)));
        let void_type = Value::Ref(heap.alloc(Object::Typ(TypeVal::Void)));
        let any_type = Value::Ref(heap.alloc(Object::Typ(TypeVal::Any)));
        let exception_type = crate::exception::build_exception_type(&mut heap);
        let env = env::make_env(&mut heap, Value::Null);
        Vm {
            heap,
            ios: IosTable::new(),
            stack: Vec::new(),
            rstack: Vec::new(),
            estack: Vec::new(),
            env,
            programs: Vec::new(),
            itypes,
            string_type,
            void_type,
            any_type,
            exception_type,
            knobs: Knobs::default(),
            profile: None,
            interrupt: Arc::new(AtomicBool::new(false)),
            pending_resume: None,
            out: String::new(),
            result: Value::Null,
            exit_exception: Value::Null,
        }
    }

    // -- accessors ---------------------------------------------------------

    pub fn heap(&self) -> &Heap<Object> {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap<Object> {
        &mut self.heap
    }

    pub fn ios(&mut self) -> &mut IosTable {
        &mut self.ios
    }

    pub fn ios_ref(&self) -> &IosTable {
        &self.ios
    }

    pub fn alloc(&mut self, o: Object) -> Value {
        Value::Ref(self.heap.alloc(o))
    }

    /// Cached integral type of the given width and signedness.
    pub fn itype(&self, size: u32, signed: bool) -> Value {
        let idx = (size as usize - 1) + if signed { 0 } else { 64 };
        self.itypes[idx]
    }

    pub fn string_type(&self) -> Value {
        self.string_type
    }

    pub fn void_type(&self) -> Value {
        self.void_type
    }

    pub fn any_type(&self) -> Value {
        self.any_type
    }

    pub fn exception_type(&self) -> Value {
        self.exception_type
    }

    /// Last execution result.
    pub fn result(&self) -> Value {
        self.result
    }

    /// Exception that terminated the last run, or `Null`.
    pub fn exit_exception(&self) -> Value {
        self.exit_exception
    }

    /// Drain the accumulated printed output.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.out)
    }

    /// Request cancellation as if SIGINT had been delivered.
    pub fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    // -- programs ----------------------------------------------------------

    /// Finalise a builder into an executable program registered with this
    /// VM. All programs the VM runs must be assembled through here so
    /// their literal tables are traced during collection.
    pub fn make_program(&mut self, b: ProgramBuilder) -> Result<Rc<Program>, AsmError> {
        let p = Rc::new(b.make_executable(&mut self.heap)?);
        self.programs.push(Rc::downgrade(&p));
        Ok(p)
    }

    // -- globals -----------------------------------------------------------

    /// Append a value to the top-level environment frame, returning its
    /// `over` index.
    pub fn register_global(&mut self, v: Value) -> usize {
        let top = env::toplevel(&self.heap, self.env);
        env::register(&mut self.heap, top, v).unwrap_or(0)
    }

    pub fn global_count(&self) -> usize {
        let top = env::toplevel(&self.heap, self.env);
        env::frame_len(&self.heap, top)
    }

    /// Roll the top-level frame back to `len` values.
    pub fn truncate_globals(&mut self, len: usize) {
        let top = env::toplevel(&self.heap, self.env);
        env::truncate(&mut self.heap, top, len);
    }

    pub fn lookup_global(&self, over: usize) -> Option<Value> {
        let top = env::toplevel(&self.heap, self.env);
        env::lookup(&self.heap, top, 0, over)
    }

    /// Pin a value against collection; for callers holding values across
    /// runs. Unboxed values need no pinning and yield `None`.
    pub fn pin(&mut self, v: Value) -> Option<RootHandle> {
        v.as_ref().map(|r| self.heap.register_global_root(r))
    }

    pub fn unpin(&mut self, h: RootHandle) {
        self.heap.deregister_global_root(h);
    }

    // -- profiling ---------------------------------------------------------

    pub fn set_profiling(&mut self, on: bool) {
        if on {
            self.profile.get_or_insert_with(HashMap::new);
        } else {
            self.profile = None;
        }
    }

    pub fn reset_profile(&mut self) {
        if let Some(p) = &mut self.profile {
            p.clear();
        }
    }

    pub fn profile_counts(&self) -> Option<&HashMap<&'static str, u64>> {
        self.profile.as_ref()
    }

    /// Append the per-instruction counters to the output, most executed
    /// first.
    pub fn print_profile(&mut self) {
        if let Some(p) = &self.profile {
            let mut entries: Vec<(&str, u64)> = p.iter().map(|(k, v)| (*k, *v)).collect();
            entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
            for (name, count) in entries {
                self.out.push_str(&format!("{:>12}  {}\n", count, name));
            }
        }
    }

    // -- exceptions --------------------------------------------------------

    /// Build a standard exception value.
    pub fn exception(&mut self, code: i32, msg: &str) -> Value {
        make_exception(
            &mut self.heap,
            self.exception_type,
            code,
            standard_name(code),
            1,
            msg,
        )
    }

    pub(crate) fn ex(&mut self, code: i32, msg: &str) -> Ctl {
        let v = self.exception(code, msg);
        Ctl::Ex(v)
    }

    // -- type reflection ---------------------------------------------------

    /// Type of a value, as a type value. Types, closures and internal
    /// values have no type and yield `Null`.
    pub fn type_of(&mut self, v: Value) -> Value {
        match v {
            Value::Int { size, .. } => self.itype(size as u32, true),
            Value::Long { size, .. } => self.itype(size as u32, true),
            Value::UInt { size, .. } => self.itype(size as u32, false),
            Value::ULong { size, .. } => self.itype(size as u32, false),
            Value::Null => Value::Null,
            Value::Ref(r) => match self.heap.get(r) {
                Object::Str(_) => self.string_type,
                Object::Arr(a) => a.atype,
                Object::Sct(s) => s.stype,
                Object::Off(o) => {
                    let (mag, unit) = (o.magnitude, o.unit);
                    let base = self.itype(
                        mag.int_size().unwrap_or(64),
                        mag.is_signed(),
                    );
                    self.alloc(Object::Typ(TypeVal::Offset { base, unit }))
                }
                _ => Value::Null,
            },
        }
    }

    // -- garbage collection ------------------------------------------------

    /// Collect with the VM's roots. `cur` is the program counter's current
    /// program, whose literal table must survive even if unregistered.
    fn gc(&mut self, cur: &Rc<Program>) {
        self.programs.retain(|w| w.strong_count() > 0);
        let Vm {
            heap,
            stack,
            rstack,
            estack,
            env,
            programs,
            itypes,
            string_type,
            void_type,
            any_type,
            exception_type,
            pending_resume,
            result,
            exit_exception,
            ..
        } = self;
        heap.collect(|f| {
            for v in stack.iter_mut() {
                visit_value(v, f);
            }
            for fr in rstack.iter_mut() {
                match fr {
                    RFrame::Call { program, env, .. } => {
                        visit_value(env, f);
                        program.trace_params(f);
                    }
                    RFrame::Val(v) => visit_value(v, f),
                }
            }
            for h in estack.iter_mut() {
                visit_value(&mut h.env, f);
                h.program.trace_params(f);
            }
            visit_value(env, f);
            visit_value(result, f);
            visit_value(exit_exception, f);
            for t in itypes.iter_mut() {
                visit_value(t, f);
            }
            visit_value(string_type, f);
            visit_value(void_type, f);
            visit_value(any_type, f);
            visit_value(exception_type, f);
            if let Some((p, _)) = pending_resume {
                p.trace_params(f);
            }
            cur.trace_params(f);
            for w in programs.iter() {
                if let Some(p) = w.upgrade() {
                    p.trace_params(f);
                }
            }
        });
        debug!(live = self.heap.stats().live, "vm collection");
    }

    // -- signals -----------------------------------------------------------

    #[cfg(unix)]
    fn install_sigint(&self) -> Option<signal_hook::SigId> {
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&self.interrupt)).ok()
    }

    #[cfg(unix)]
    fn uninstall_sigint(&self, id: Option<signal_hook::SigId>) {
        if let Some(id) = id {
            signal_hook::low_level::unregister(id);
        }
    }

    #[cfg(not(unix))]
    fn install_sigint(&self) -> Option<()> {
        None
    }

    #[cfg(not(unix))]
    fn uninstall_sigint(&self, _id: Option<()>) {}

    // -- execution ---------------------------------------------------------

    /// Run a program to completion. On an unhandled exception the error
    /// value is the exception; it is also left in the exit-exception
    /// slot.
    pub fn run(&mut self, program: &Rc<Program>) -> Result<Value, Value> {
        self.exit_exception = Value::Null;
        let sig = self.install_sigint();
        let r = self.exec(program.clone(), 0, 0);
        self.uninstall_sigint(sig);
        match r {
            Ok(v) => {
                self.result = v;
                Ok(v)
            }
            Err(Ctl::Exit(e)) => Err(e),
            // Unreachable: base 0 owns every handler.
            Err(_) => Err(self.exit_exception),
        }
    }

    /// Run a closure with the given arguments and return its result.
    /// Used by instructions that invoke constraint checkers, bounders,
    /// custom mappers and `_print` methods.
    pub(crate) fn call_closure(&mut self, cls: Value, args: &[Value]) -> Result<Value, Ctl> {
        let (program, entry, cenv) = self.closure_parts(cls)?;
        let saved_env = self.env;
        for a in args {
            self.stack.push(*a);
        }
        self.env = cenv;
        let base = self.rstack.len();
        let r = self.exec(program, entry as usize, base)?;
        self.env = saved_env;
        Ok(r)
    }

    fn closure_parts(&mut self, cls: Value) -> Result<(Rc<Program>, u32, Value), Ctl> {
        match cls.as_ref().map(|r| self.heap.get(r)) {
            Some(Object::Cls(c)) => Ok((c.program.clone(), c.entry, c.env)),
            _ => Err(self.ex(EC_INVAL, "call of a non-closure value")),
        }
    }

    /// The dispatch loop. `base` fences this execution's return stack;
    /// a `return` at the fence yields the value on top of the stack.
    fn exec(&mut self, mut cur: Rc<Program>, mut pc: usize, base: usize) -> Result<Value, Ctl> {
        loop {
            if self.heap.should_collect() {
                self.gc(&cur);
            }

            let res: Result<(), Ctl> = if self.interrupt.swap(false, Ordering::Relaxed) {
                let exc = self.exception(EC_SIGNAL, "interrupted");
                Err(Ctl::Ex(exc))
            } else if cur.fetch(pc).is_none() {
                // Fell off the end: a top-level program is done, a
                // function body missed its return.
                if self.rstack.len() == base {
                    return Ok(self.stack.pop().unwrap_or(Value::Null));
                }
                let exc = self.exception(EC_NO_RETURN, "control fell off a function");
                Err(Ctl::Ex(exc))
            } else {
                let insn = cur.fetch(pc).expect("fetch checked above");
                pc += 1;
                if let Some(p) = &mut self.profile {
                    *p.entry(insn.name()).or_insert(0) += 1;
                }
                match insn {
                    Insn::Push(i) => {
                        let v = cur.literal(&self.heap, i);
                        self.stack.push(v);
                        Ok(())
                    }
                    Insn::Ba(t) => {
                        pc = t as usize;
                        Ok(())
                    }
                    Insn::Bzi(t) => self.pop().map(|v| {
                        if v.as_i64() == Some(0) {
                            pc = t as usize;
                        }
                    }),
                    Insn::Bnzi(t) => self.pop().map(|v| {
                        if v.as_i64() != Some(0) {
                            pc = t as usize;
                        }
                    }),
                    Insn::Call => self.pop().and_then(|cls| {
                        let (program, entry, cenv) = self.closure_parts(cls)?;
                        self.rstack.push(RFrame::Call {
                            program: std::mem::replace(&mut cur, program),
                            pc,
                            env: self.env,
                        });
                        pc = entry as usize;
                        self.env = cenv;
                        Ok(())
                    }),
                    Insn::Return => {
                        if self.rstack.len() == base {
                            return Ok(self.stack.pop().unwrap_or(Value::Null));
                        }
                        match self.rstack.pop().expect("return stack fenced by base") {
                            RFrame::Call { program, pc: rpc, env } => {
                                cur = program;
                                pc = rpc;
                                self.env = env;
                                Ok(())
                            }
                            RFrame::Val(_) => {
                                Err(self.ex(EC_INVAL, "return over a parked value"))
                            }
                        }
                    }
                    Insn::Raise => self.pop().and_then(|exc| Err(Ctl::Ex(exc))),
                    Insn::Pushe { target, code } => {
                        self.estack.push(Handler {
                            program: cur.clone(),
                            target,
                            code,
                            env: self.env,
                            sdepth: self.stack.len(),
                            rdepth: self.rstack.len(),
                        });
                        Ok(())
                    }
                    Insn::Pope => {
                        self.estack.pop();
                        Ok(())
                    }
                    Insn::MkCls { entry } => {
                        let cls = self.alloc(Object::Cls(ClosureVal {
                            program: cur.clone(),
                            entry,
                            env: Value::Null,
                        }));
                        self.stack.push(cls);
                        Ok(())
                    }
                    other => self.step(other),
                }
            };

            if let Err(ctl) = res {
                match ctl {
                    Ctl::Ex(exc) => match self.do_raise(exc, base) {
                        Ok((p, t)) => {
                            cur = p;
                            pc = t;
                        }
                        Err(c) => return Err(c),
                    },
                    Ctl::Unwind => {
                        if self.rstack.len() >= base {
                            match self.pending_resume.take() {
                                Some((p, t)) => {
                                    cur = p;
                                    pc = t as usize;
                                }
                                None => return Err(Ctl::Exit(self.exit_exception)),
                            }
                        } else {
                            return Err(Ctl::Unwind);
                        }
                    }
                    Ctl::Exit(e) => return Err(Ctl::Exit(e)),
                }
            }
        }
    }

    /// Dispatch an exception: pop handlers until one matches, restore its
    /// stacks and environment, and resume there. When the handler belongs
    /// to an outer execution the resume point is parked and `Unwind`
    /// propagates.
    fn do_raise(&mut self, exc: Value, base: usize) -> Result<(Rc<Program>, usize), Ctl> {
        let code = exception_code(&self.heap, exc);
        while let Some(h) = self.estack.pop() {
            // A handler whose frame has already returned is stale.
            if h.rdepth > self.rstack.len() {
                continue;
            }
            if h.code == -1 || h.code == code {
                self.stack.truncate(h.sdepth);
                self.rstack.truncate(h.rdepth);
                self.env = h.env;
                self.stack.push(exc);
                if h.rdepth >= base {
                    return Ok((h.program, h.target as usize));
                }
                self.pending_resume = Some((h.program, h.target));
                return Err(Ctl::Unwind);
            }
        }
        self.exit_exception = exc;
        Err(Ctl::Exit(exc))
    }

    // -- stack helpers -----------------------------------------------------

    pub(crate) fn pop(&mut self) -> Result<Value, Ctl> {
        match self.stack.pop() {
            Some(v) => Ok(v),
            None => Err(self.ex(EC_INVAL, "stack underflow")),
        }
    }

    fn peek(&mut self) -> Result<Value, Ctl> {
        match self.stack.last() {
            Some(v) => Ok(*v),
            None => Err(self.ex(EC_INVAL, "stack underflow")),
        }
    }

    fn pop_u64(&mut self, what: &str) -> Result<u64, Ctl> {
        let v = self.pop()?;
        match v.as_u64() {
            Some(n) => Ok(n),
            None => Err(self.ex(EC_INVAL, what)),
        }
    }

    pub(crate) fn pop_str(&mut self) -> Result<String, Ctl> {
        let v = self.pop()?;
        match v.as_ref().map(|r| self.heap.get(r)) {
            Some(Object::Str(s)) => Ok(s.clone()),
            _ => Err(self.ex(EC_INVAL, "expected a string")),
        }
    }

    /// Bit quantity from an offset value or a bare `ULong` of bits.
    pub(crate) fn bits_of(&mut self, v: Value) -> Result<u64, Ctl> {
        if let Some(r) = v.as_ref() {
            if let Object::Off(o) = self.heap.get(r) {
                let b = o.in_bits();
                if b < 0 {
                    return Err(self.ex(EC_INVAL, "negative offset"));
                }
                return Ok(b as u64);
            }
        }
        match v.as_u64() {
            Some(n) => Ok(n),
            None => Err(self.ex(EC_INVAL, "expected an offset")),
        }
    }

    fn pop_offset_parts(&mut self, what: &str) -> Result<(Value, u64), Ctl> {
        let v = self.pop()?;
        match v.as_ref().map(|r| self.heap.get(r)) {
            Some(Object::Off(o)) => Ok((o.magnitude, o.unit)),
            _ => Err(self.ex(EC_INVAL, what)),
        }
    }

    // -- the long tail of instructions -------------------------------------

    fn step(&mut self, insn: Insn) -> Result<(), Ctl> {
        match insn {
            // Stack shuffling.
            Insn::Drop => {
                self.pop()?;
            }
            Insn::Swap => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(b);
                self.stack.push(a);
            }
            Insn::Nip => {
                let b = self.pop()?;
                self.pop()?;
                self.stack.push(b);
            }
            Insn::Dup => {
                let a = self.peek()?;
                self.stack.push(a);
            }
            Insn::Over => {
                let b = self.pop()?;
                let a = self.peek()?;
                self.stack.push(b);
                self.stack.push(a);
            }
            Insn::Rot => {
                let c = self.pop()?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(b);
                self.stack.push(c);
                self.stack.push(a);
            }
            Insn::Nrot => {
                let c = self.pop()?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(c);
                self.stack.push(a);
                self.stack.push(b);
            }
            Insn::Tuck => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(b);
                self.stack.push(a);
                self.stack.push(b);
            }
            Insn::Quake => {
                let c = self.pop()?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(b);
                self.stack.push(a);
                self.stack.push(c);
            }
            Insn::Revn(n) => {
                let n = n as usize;
                let len = self.stack.len();
                if n > len {
                    return Err(self.ex(EC_INVAL, "revn past the stack bottom"));
                }
                self.stack[len - n..].reverse();
            }

            // Return stack as value parking space.
            Insn::Tor => {
                let v = self.pop()?;
                self.rstack.push(RFrame::Val(v));
            }
            Insn::Fromr => match self.rstack.pop() {
                Some(RFrame::Val(v)) => self.stack.push(v),
                Some(f) => {
                    self.rstack.push(f);
                    return Err(self.ex(EC_INVAL, "fromr over a call frame"));
                }
                None => return Err(self.ex(EC_INVAL, "return stack underflow")),
            },
            Insn::Atr => match self.rstack.last() {
                Some(RFrame::Val(v)) => {
                    let v = *v;
                    self.stack.push(v);
                }
                _ => return Err(self.ex(EC_INVAL, "atr over a call frame")),
            },

            // Arithmetic.
            Insn::Add => self.arith(insn, ArithKind::Wrap)?,
            Insn::Sub => self.arith(insn, ArithKind::Wrap)?,
            Insn::Mul => self.arith(insn, ArithKind::Wrap)?,
            Insn::Div => self.arith(insn, ArithKind::Wrap)?,
            Insn::CDiv => self.arith(insn, ArithKind::Wrap)?,
            Insn::Mod => self.arith(insn, ArithKind::Wrap)?,
            Insn::Pow => self.arith(insn, ArithKind::Wrap)?,
            Insn::AddOv => self.arith(insn, ArithKind::Checked)?,
            Insn::SubOv => self.arith(insn, ArithKind::Checked)?,
            Insn::MulOv => self.arith(insn, ArithKind::Checked)?,
            Insn::PowOv => self.arith(insn, ArithKind::Checked)?,
            Insn::BAnd | Insn::BOr | Insn::BXor | Insn::Shl | Insn::Shr => self.bitop(insn)?,
            Insn::Neg => {
                let a = self.pop_int("negate a non-integral value")?;
                let (size, signed) = (a.int_size().unwrap_or(32), a.is_signed());
                let wide = -(self.int_value(a));
                self.push_wrapped(wide, size, signed);
            }
            Insn::BNot => {
                let a = self.pop_int("complement a non-integral value")?;
                let (size, signed) = (a.int_size().unwrap_or(32), a.is_signed());
                let raw = !a.raw_bits().unwrap_or(0);
                self.push_int(raw, size, signed);
            }

            // Comparisons.
            Insn::EqI | Insn::NeI | Insn::LtI | Insn::LeI | Insn::GtI | Insn::GeI => {
                let b = self.pop_int("compare a non-integral value")?;
                let a = self.pop_int("compare a non-integral value")?;
                let (x, y) = (self.int_value(a), self.int_value(b));
                let r = match insn {
                    Insn::EqI => x == y,
                    Insn::NeI => x != y,
                    Insn::LtI => x < y,
                    Insn::LeI => x <= y,
                    Insn::GtI => x > y,
                    _ => x >= y,
                };
                self.stack.push(Value::int32(r as i32));
            }
            Insn::EqS | Insn::NeS | Insn::LtS | Insn::LeS | Insn::GtS | Insn::GeS => {
                let b = self.pop_str()?;
                let a = self.pop_str()?;
                let r = match insn {
                    Insn::EqS => a == b,
                    Insn::NeS => a != b,
                    Insn::LtS => a < b,
                    Insn::LeS => a <= b,
                    Insn::GtS => a > b,
                    _ => a >= b,
                };
                self.stack.push(Value::int32(r as i32));
            }
            Insn::Eqa => {
                let b = self.pop()?;
                let a = self.pop()?;
                let r = equal(&self.heap, a, b);
                self.stack.push(Value::int32(r as i32));
            }

            // Strings.
            Insn::Sconc => {
                let b = self.pop_str()?;
                let mut a = self.pop_str()?;
                a.push_str(&b);
                let s = make_string(&mut self.heap, a);
                self.stack.push(s);
            }
            Insn::Strref => {
                let i = self.pop_u64("string index must be integral")?;
                let s = self.pop_str()?;
                match s.as_bytes().get(i as usize) {
                    Some(b) => self.stack.push(Value::UInt { v: *b as u32, size: 8 }),
                    None => return Err(self.ex(EC_OUT_OF_BOUNDS, "string index out of bounds")),
                }
            }

            Insn::IConv { size, signed } => {
                let v = self.pop_int("convert a non-integral value")?;
                let bits = if v.is_signed() {
                    v.as_i64().unwrap_or(0) as u64
                } else {
                    v.raw_bits().unwrap_or(0)
                };
                self.push_int(bits, size as u32, signed);
            }
            Insn::Vtos => {
                let v = self.pop()?;
                let s = self.fmt_val(v, 0)?;
                let s = make_string(&mut self.heap, s);
                self.stack.push(s);
            }
            Insn::Bconc => {
                let b = self.pop_int("bit-concatenate a non-integral value")?;
                let a = self.pop_int("bit-concatenate a non-integral value")?;
                let (sa, sb) = (a.int_size().unwrap_or(0), b.int_size().unwrap_or(0));
                if sa + sb > 64 {
                    return Err(self.ex(EC_CONV, "bit-concatenation wider than 64 bits"));
                }
                let bits =
                    (a.raw_bits().unwrap_or(0) << sb) | b.raw_bits().unwrap_or(0);
                self.push_int(bits, sa + sb, false);
            }

            // Offsets.
            Insn::Mko => {
                let unit = self.pop_u64("offset unit must be integral")?;
                let mag = self.pop()?;
                match make_offset(&mut self.heap, mag, unit) {
                    Some(o) => self.stack.push(o),
                    None => self.stack.push(Value::Null),
                }
            }
            Insn::Ogetm => {
                let v = self.peek()?;
                match v.as_ref().map(|r| self.heap.get(r)) {
                    Some(Object::Off(o)) => {
                        let m = o.magnitude;
                        self.stack.push(m);
                    }
                    _ => return Err(self.ex(EC_INVAL, "magnitude of a non-offset")),
                }
            }
            Insn::Ogetu => {
                let v = self.peek()?;
                match v.as_ref().map(|r| self.heap.get(r)) {
                    Some(Object::Off(o)) => {
                        let u = o.unit;
                        self.stack.push(Value::ulong(u));
                    }
                    _ => return Err(self.ex(EC_INVAL, "unit of a non-offset")),
                }
            }
            Insn::AddO | Insn::SubO => {
                let (mb, ub) = self.pop_offset_parts("offset arithmetic on a non-offset")?;
                let (ma, ua) = self.pop_offset_parts("offset arithmetic on a non-offset")?;
                let ta = self.mag_i128(ma) * ua as i128;
                let tb = self.mag_i128(mb) * ub as i128;
                let sum = if matches!(insn, Insn::AddO) { ta + tb } else { ta - tb };
                let signed = ma.is_signed() && mb.is_signed();
                let mag = make_integral(sum as u64, 64, signed).unwrap_or(Value::Null);
                let o = make_offset(&mut self.heap, mag, 1).unwrap_or(Value::Null);
                self.stack.push(o);
            }
            Insn::MulO => {
                let n = self.pop_int("offset scaling needs an integral factor")?;
                let (m, u) = self.pop_offset_parts("offset arithmetic on a non-offset")?;
                let (size, signed) = (m.int_size().unwrap_or(64), m.is_signed());
                let wide = self.int_value(m) * self.int_value(n);
                let mag = make_integral(wide as u64, size, signed).unwrap_or(Value::Null);
                let o = make_offset(&mut self.heap, mag, u).unwrap_or(Value::Null);
                self.stack.push(o);
            }
            Insn::DivO | Insn::CDivO | Insn::ModO => {
                let (mb, ub) = self.pop_offset_parts("offset arithmetic on a non-offset")?;
                let (ma, ua) = self.pop_offset_parts("offset arithmetic on a non-offset")?;
                let ta = self.mag_i128(ma) * ua as i128;
                let tb = self.mag_i128(mb) * ub as i128;
                if tb == 0 {
                    return Err(self.ex(EC_DIV_BY_ZERO, "offset division by zero"));
                }
                let signed = ma.is_signed() || mb.is_signed();
                match insn {
                    Insn::ModO => {
                        let m = ta % tb;
                        let mag = make_integral(m as u64, 64, signed).unwrap_or(Value::Null);
                        let o = make_offset(&mut self.heap, mag, 1).unwrap_or(Value::Null);
                        self.stack.push(o);
                    }
                    _ => {
                        let mut q = ta / tb;
                        if matches!(insn, Insn::CDivO) {
                            let r = ta % tb;
                            if r != 0 && (r < 0) == (tb < 0) {
                                q += 1;
                            }
                        }
                        let v = make_integral(q as u64, 64, signed).unwrap_or(Value::Null);
                        self.stack.push(v);
                    }
                }
            }

            // Environment.
            Insn::PushEnv => {
                self.env = env::push_frame(&mut self.heap, self.env);
            }
            Insn::PopEnv => match env::pop_frame(&self.heap, self.env) {
                Some(up) => self.env = up,
                None => return Err(self.ex(EC_INVAL, "pop of the top-level frame")),
            },
            Insn::Pushvar { back, over } => {
                match env::lookup(&self.heap, self.env, back as usize, over as usize) {
                    Some(v) => self.stack.push(v),
                    None => return Err(self.ex(EC_INVAL, "unbound variable")),
                }
            }
            Insn::Popvar { back, over } => {
                let v = self.pop()?;
                if !env::set(&mut self.heap, self.env, back as usize, over as usize, v) {
                    return Err(self.ex(EC_INVAL, "unbound variable"));
                }
            }
            Insn::Regvar => {
                let v = self.pop()?;
                env::register(&mut self.heap, self.env, v);
            }

            Insn::Pec => {
                let cls = self.pop()?;
                let e = self.env;
                match cls.as_ref() {
                    Some(r) => match self.heap.get_mut(r) {
                        Object::Cls(c) => {
                            c.env = e;
                            self.stack.push(cls);
                        }
                        _ => return Err(self.ex(EC_INVAL, "pec on a non-closure")),
                    },
                    None => return Err(self.ex(EC_INVAL, "pec on a non-closure")),
                }
            }

            // Arrays, structs, types, mapping and IO live in their own
            // impl blocks.
            other => self.step_data(other)?,
        }
        Ok(())
    }

    // -- arithmetic helpers ------------------------------------------------

    fn pop_int(&mut self, what: &str) -> Result<Value, Ctl> {
        let v = self.pop()?;
        if v.is_integral() {
            Ok(v)
        } else {
            Err(self.ex(EC_INVAL, what))
        }
    }

    /// Numeric value honouring the operand's signedness.
    fn int_value(&self, v: Value) -> i128 {
        if v.is_signed() {
            v.as_i64().unwrap_or(0) as i128
        } else {
            v.raw_bits().unwrap_or(0) as i128
        }
    }

    fn mag_i128(&self, v: Value) -> i128 {
        self.int_value(v)
    }

    fn push_int(&mut self, bits: u64, size: u32, signed: bool) {
        self.stack
            .push(make_integral(bits, size, signed).unwrap_or(Value::Null));
    }

    fn push_wrapped(&mut self, wide: i128, size: u32, signed: bool) {
        self.push_int(wide as u64, size, signed);
    }

    fn range_check(&mut self, wide: i128, size: u32, signed: bool) -> Result<(), Ctl> {
        let ok = if signed {
            let min = -(1i128 << (size - 1));
            let max = (1i128 << (size - 1)) - 1;
            wide >= min && wide <= max
        } else {
            wide >= 0 && wide < (1i128 << size)
        };
        if ok {
            Ok(())
        } else {
            Err(self.ex(crate::exception::EC_OVERFLOW, "integer overflow"))
        }
    }

    fn arith(&mut self, insn: Insn, kind: ArithKind) -> Result<(), Ctl> {
        let b = self.pop_int("arithmetic on a non-integral value")?;
        let a = self.pop_int("arithmetic on a non-integral value")?;
        let (size, signed) = (a.int_size().unwrap_or(32), a.is_signed());
        let (x, y) = (self.int_value(a), self.int_value(b));
        let wide = match insn {
            Insn::Add | Insn::AddOv => x + y,
            Insn::Sub | Insn::SubOv => x - y,
            Insn::Mul | Insn::MulOv => x * y,
            Insn::Div => {
                if y == 0 {
                    return Err(self.ex(EC_DIV_BY_ZERO, "division by zero"));
                }
                x / y
            }
            Insn::CDiv => {
                if y == 0 {
                    return Err(self.ex(EC_DIV_BY_ZERO, "division by zero"));
                }
                let q = x / y;
                let r = x % y;
                if r != 0 && (r < 0) == (y < 0) {
                    q + 1
                } else {
                    q
                }
            }
            Insn::Mod => {
                if y == 0 {
                    return Err(self.ex(EC_DIV_BY_ZERO, "division by zero"));
                }
                x % y
            }
            Insn::Pow | Insn::PowOv => {
                if y < 0 {
                    return Err(self.ex(EC_INVAL, "negative exponent"));
                }
                return self.pow(x, y as u32, size, signed, kind);
            }
            _ => unreachable!("non-arithmetic instruction routed to arith"),
        };
        if matches!(kind, ArithKind::Checked) {
            self.range_check(wide, size, signed)?;
        }
        self.push_wrapped(wide, size, signed);
        Ok(())
    }

    fn pow(
        &mut self,
        base: i128,
        exp: u32,
        size: u32,
        signed: bool,
        kind: ArithKind,
    ) -> Result<(), Ctl> {
        match kind {
            ArithKind::Checked => match base.checked_pow(exp) {
                Some(wide) => {
                    self.range_check(wide, size, signed)?;
                    self.push_wrapped(wide, size, signed);
                    Ok(())
                }
                None => Err(self.ex(crate::exception::EC_OVERFLOW, "integer overflow")),
            },
            ArithKind::Wrap => {
                // Square-and-multiply over the raw width.
                let mask = crate::value::size_mask(size);
                let mut acc: u64 = 1;
                let mut b = (base as u64) & mask;
                let mut e = exp;
                while e > 0 {
                    if e & 1 == 1 {
                        acc = acc.wrapping_mul(b) & mask;
                    }
                    b = b.wrapping_mul(b) & mask;
                    e >>= 1;
                }
                self.push_int(acc, size, signed);
                Ok(())
            }
        }
    }

    fn bitop(&mut self, insn: Insn) -> Result<(), Ctl> {
        let b = self.pop_int("bit operation on a non-integral value")?;
        let a = self.pop_int("bit operation on a non-integral value")?;
        let (size, signed) = (a.int_size().unwrap_or(32), a.is_signed());
        let (ra, rb) = (a.raw_bits().unwrap_or(0), b.raw_bits().unwrap_or(0));
        let bits = match insn {
            Insn::BAnd => ra & rb,
            Insn::BOr => ra | rb,
            Insn::BXor => ra ^ rb,
            Insn::Shl => {
                if rb >= size as u64 {
                    0
                } else {
                    ra << rb
                }
            }
            _ => {
                // Arithmetic shift for signed operands.
                if rb >= size as u64 {
                    if signed && a.as_i64().unwrap_or(0) < 0 {
                        u64::MAX
                    } else {
                        0
                    }
                } else if signed {
                    (a.as_i64().unwrap_or(0) >> rb) as u64
                } else {
                    ra >> rb
                }
            }
        };
        self.push_int(bits, size, signed);
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum ArithKind {
    Wrap,
    Checked,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, unix))]
mod tests {
    #[test]
    fn test_sigint_constant_matches_libc() {
        // The flag-based handler must trap the same signal the platform
        // delivers on ^C.
        assert_eq!(signal_hook::consts::SIGINT, libc::SIGINT);
    }
}
