//! Programs and the assembler API
//!
//! A [`Routine`] is an appendable buffer of instructions plus a label
//! table. A [`ProgramBuilder`] wraps a routine with the literal table:
//! boxed values handed to `push` are deduplicated into a side table (an
//! internal-array object on the heap) and the instruction carries the
//! unsigned index, since instruction operands are machine words only.
//!
//! Instructions can be appended in two ways: directly as [`Insn`] values
//! (the code generator), or by name with explicit parameters (the textual
//! assembler in [`crate::asm`]). The by-name path validates the mnemonic
//! and its parameter kinds and reports assembly-edit errors.
//!
//! `make_executable` is one-way: it consumes the builder, resolves label
//! operands to program counters, and yields an immutable [`Program`] that
//! can no longer be appended to.

use std::cell::Cell;
use std::fmt;

use jab_core::heap::{GcRef, Heap};

use crate::value::{Object, Value};

/// A branch target, meaningful only within one routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(pub u32);

/// One VM instruction. Stack effects are written `( before -- after )`
/// with the stack top rightmost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Insn {
    // Stack manipulation.
    /// `( -- V )` push literal table entry.
    Push(u32),
    Drop,
    /// `( A B -- B A )`
    Swap,
    /// `( A B -- B )`
    Nip,
    Dup,
    /// `( A B -- A B A )`
    Over,
    /// `( A B C -- B C A )`
    Rot,
    /// `( A B C -- C A B )`
    Nrot,
    /// `( A B -- B A B )`
    Tuck,
    /// `( A B C -- A C B )` swap under the top.
    Quake,
    /// `( A1 .. An -- An .. A1 )`
    Revn(u32),

    // Return stack.
    Tor,
    Fromr,
    Atr,

    // Integral arithmetic, wrapping to the operand width.
    Add,
    Sub,
    Mul,
    Div,
    CDiv,
    Mod,
    Pow,
    Neg,
    // Overflow-checked variants, raising the overflow exception.
    AddOv,
    SubOv,
    MulOv,
    PowOv,
    BNot,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,

    // Integral comparison, result `int<32>` 0/1.
    EqI,
    NeI,
    LtI,
    LeI,
    GtI,
    GeI,
    // String comparison.
    EqS,
    NeS,
    LtS,
    LeS,
    GtS,
    GeS,
    /// `( A B -- I )` structural equality on any two values.
    Eqa,

    // Strings.
    /// `( A B -- AB )`
    Sconc,
    /// `( S I -- C )` byte at index as `uint<8>`.
    Strref,

    /// `( V -- V' )` integral conversion, wrapping.
    IConv { size: u8, signed: bool },
    /// `( V -- S )` render through the printer.
    Vtos,
    /// `( A B -- C )` bit-concatenation; result unsigned, widths add.
    Bconc,

    // Offsets.
    /// `( MAG UNIT -- OFF )`
    Mko,
    /// `( OFF -- OFF MAG )`
    Ogetm,
    /// `( OFF -- OFF UNIT )`
    Ogetu,
    AddO,
    SubO,
    /// `( OFF I -- OFF )`
    MulO,
    /// `( O1 O2 -- I )` quotient of two offsets.
    DivO,
    /// `( O1 O2 -- OFF )`
    ModO,
    CDivO,

    // Control.
    Ba(u32),
    /// `( I -- )` branch when the int<32> on top is zero.
    Bzi(u32),
    Bnzi(u32),
    /// `( ARG.. CLS -- RET )` call a closure.
    Call,
    Return,

    // Exceptions.
    /// `( EXC -- )`
    Raise,
    /// Install a handler; `code` -1 catches everything.
    Pushe { target: u32, code: i32 },
    Pope,

    // Environment.
    PushEnv,
    PopEnv,
    Pushvar { back: u16, over: u16 },
    Popvar { back: u16, over: u16 },
    /// `( V -- )` append to the current frame.
    Regvar,

    // Closures.
    /// `( -- CLS )` entry in the current program, environment unset.
    MkCls { entry: u32 },
    /// `( CLS -- CLS )` patch the closure's environment to the current one.
    Pec,

    // Arrays.
    /// `( TYP N -- ARR )` new array of type TYP with N elements reserved.
    Mka,
    /// `( ARR I V -- ARR )` insert, filling any gap up to I with V.
    Ains,
    /// `( ARR I -- V )`
    Aref,
    /// `( ARR I -- OFF )` element bit offset.
    Arefo,
    /// `( ARR I V -- ARR )` set an existing element.
    Aset,
    /// `( ARR LO HI -- ARR' )` elements LO..HI.
    Atrim,
    /// `( A B -- C )` concatenation, result unmapped.
    Aconc,
    /// `( ARR V -- ARR )` fill every element.
    Afill,
    /// `( ARR N -- ARR )` conversion check: element count must equal N.
    ArrConvSel,
    /// `( ARR OFF -- ARR )` conversion check: bit size must equal OFF.
    ArrConvSiz,

    // Structs.
    /// `( TYP [NAME OFF V]n [NAME CLS]m -- SCT )`
    Mksct { nfields: u32, nmethods: u32 },
    /// `( SCT NAME -- V )`
    Sref,
    /// `( SCT NAME -- OFF )`
    Srefo,
    /// `( SCT NAME V -- SCT )` raw field store.
    Sset,
    /// `( SCT NAME V -- SCT )` checked store: constraint failure restores
    /// the old value and re-raises.
    SsetC,
    /// `( SCT NAME -- CLS )` method lookup.
    Smeth,
    /// `( SCT -- SCT )` run the field constraint checkers.
    Sck,

    // Types.
    /// `( V -- TYP )`
    Typof,
    /// `( V TYP -- I )`
    Isa,
    /// `( SIZE SIGNED -- TYP )` integral type.
    Mkit,
    /// `( ETYP BOUND BOUNDER -- TYP )` array type.
    Mkat,
    /// `( BASE UNIT -- TYP )` offset type.
    Mkot,
    /// `( NAME [NAME TYP LABEL CHECK INIT OPTCOND ENDIAN]n [NAME CLS]m -- TYP )`
    /// struct type with `n` fields and `m` methods.
    Mkst {
        nfields: u32,
        nmethods: u32,
        pinned: bool,
        union_: bool,
    },
    /// `( TYP -- V )` default-construct a value of a type.
    Cons,

    // Mapping.
    /// `( TYP IOS OFF -- V )` map TYP in space IOS at bit offset OFF.
    Map { strict: bool },
    /// `( V -- V )` re-read a mapped value from its space.
    Remap,
    /// `( V -- V )` write a mapped value back to its space.
    WriteV,
    /// `( V -- V )` clear the mapped flag, recursively.
    UnmapV,
    /// `( V IOS OFF -- )` write a value at bit offset OFF of space IOS.
    Poke,
    // Mapping-info accessors, `( V -- V X )` getters / `( V X -- V )` setters.
    Mm,
    Mgeto,
    Mseto,
    Mgetios,
    Msetios,
    Mgetm,
    Msetm,
    Mgetw,
    Msetw,
    Mgets,
    Msets,
    Mgetsel,
    Msetsel,
    Mgetsiz,
    Msetsiz,

    // IO spaces.
    /// `( HANDLER FLAGS -- ID )`
    Open,
    /// `( ID -- )`
    CloseIos,
    /// `( -- ID )`
    IosCur,
    /// `( ID -- )`
    IosSetCur,
    /// `( HANDLER -- ID/NULL )`
    IosSearch,
    /// `( ID -- STR )`
    IosHandler,
    /// `( ID -- OFF )` size of the space as an offset in bytes.
    IosSize,

    // Printing.
    /// `( V -- )` print through the configured printer.
    Print,
    /// `( S -- )` print a raw string.
    Prints,

    /// `( V -- V N )` element count.
    Sel,
    /// `( V -- V OFF )` bit size as an offset.
    Siz,
    Nop,
}

impl Insn {
    /// Mnemonic, as accepted by the textual assembler and reported by the
    /// profiler.
    pub fn name(&self) -> &'static str {
        match self {
            Insn::Push(_) => "push",
            Insn::Drop => "drop",
            Insn::Swap => "swap",
            Insn::Nip => "nip",
            Insn::Dup => "dup",
            Insn::Over => "over",
            Insn::Rot => "rot",
            Insn::Nrot => "nrot",
            Insn::Tuck => "tuck",
            Insn::Quake => "quake",
            Insn::Revn(_) => "revn",
            Insn::Tor => "tor",
            Insn::Fromr => "fromr",
            Insn::Atr => "atr",
            Insn::Add => "add",
            Insn::Sub => "sub",
            Insn::Mul => "mul",
            Insn::Div => "div",
            Insn::CDiv => "cdiv",
            Insn::Mod => "mod",
            Insn::Pow => "pow",
            Insn::Neg => "neg",
            Insn::AddOv => "addov",
            Insn::SubOv => "subov",
            Insn::MulOv => "mulov",
            Insn::PowOv => "powov",
            Insn::BNot => "bnot",
            Insn::BAnd => "band",
            Insn::BOr => "bor",
            Insn::BXor => "bxor",
            Insn::Shl => "shl",
            Insn::Shr => "shr",
            Insn::EqI => "eqi",
            Insn::NeI => "nei",
            Insn::LtI => "lti",
            Insn::LeI => "lei",
            Insn::GtI => "gti",
            Insn::GeI => "gei",
            Insn::EqS => "eqs",
            Insn::NeS => "nes",
            Insn::LtS => "lts",
            Insn::LeS => "les",
            Insn::GtS => "gts",
            Insn::GeS => "ges",
            Insn::Eqa => "eqa",
            Insn::Sconc => "sconc",
            Insn::Strref => "strref",
            Insn::IConv { .. } => "iconv",
            Insn::Vtos => "vtos",
            Insn::Bconc => "bconc",
            Insn::Mko => "mko",
            Insn::Ogetm => "ogetm",
            Insn::Ogetu => "ogetu",
            Insn::AddO => "addo",
            Insn::SubO => "subo",
            Insn::MulO => "mulo",
            Insn::DivO => "divo",
            Insn::ModO => "modo",
            Insn::CDivO => "cdivo",
            Insn::Ba(_) => "ba",
            Insn::Bzi(_) => "bzi",
            Insn::Bnzi(_) => "bnzi",
            Insn::Call => "call",
            Insn::Return => "return",
            Insn::Raise => "raise",
            Insn::Pushe { .. } => "pushe",
            Insn::Pope => "pope",
            Insn::PushEnv => "pushenv",
            Insn::PopEnv => "popenv",
            Insn::Pushvar { .. } => "pushvar",
            Insn::Popvar { .. } => "popvar",
            Insn::Regvar => "regvar",
            Insn::MkCls { .. } => "mkcls",
            Insn::Pec => "pec",
            Insn::Mka => "mka",
            Insn::Ains => "ains",
            Insn::Aref => "aref",
            Insn::Arefo => "arefo",
            Insn::Aset => "aset",
            Insn::Atrim => "atrim",
            Insn::Aconc => "aconc",
            Insn::Afill => "afill",
            Insn::ArrConvSel => "aconvsel",
            Insn::ArrConvSiz => "aconvsiz",
            Insn::Mksct { .. } => "mksct",
            Insn::Sref => "sref",
            Insn::Srefo => "srefo",
            Insn::Sset => "sset",
            Insn::SsetC => "ssetc",
            Insn::Smeth => "smeth",
            Insn::Sck => "sck",
            Insn::Typof => "typof",
            Insn::Isa => "isa",
            Insn::Mkit => "mkit",
            Insn::Mkat => "mkat",
            Insn::Mkot => "mkot",
            Insn::Mkst { .. } => "mkst",
            Insn::Cons => "cons",
            Insn::Map { .. } => "map",
            Insn::Remap => "remap",
            Insn::WriteV => "write",
            Insn::UnmapV => "unmap",
            Insn::Poke => "poke",
            Insn::Mm => "mm",
            Insn::Mgeto => "mgeto",
            Insn::Mseto => "mseto",
            Insn::Mgetios => "mgetios",
            Insn::Msetios => "msetios",
            Insn::Mgetm => "mgetm",
            Insn::Msetm => "msetm",
            Insn::Mgetw => "mgetw",
            Insn::Msetw => "msetw",
            Insn::Mgets => "mgets",
            Insn::Msets => "msets",
            Insn::Mgetsel => "mgetsel",
            Insn::Msetsel => "msetsel",
            Insn::Mgetsiz => "mgetsiz",
            Insn::Msetsiz => "msetsiz",
            Insn::Open => "open",
            Insn::CloseIos => "close",
            Insn::IosCur => "ioscur",
            Insn::IosSetCur => "iossetcur",
            Insn::IosSearch => "iossearch",
            Insn::IosHandler => "ioshandler",
            Insn::IosSize => "iossize",
            Insn::Print => "print",
            Insn::Prints => "prints",
            Insn::Sel => "sel",
            Insn::Siz => "siz",
            Insn::Nop => "nop",
        }
    }
}

// ---------------------------------------------------------------------------
// Assembly errors

#[derive(Debug)]
pub enum AsmError {
    /// Unknown mnemonic.
    BadInstruction(String),
    /// More parameters than the instruction accepts.
    TooManyParams(String),
    /// A parameter of the wrong kind (value/unsigned/label/register).
    BadParamKind(String),
    /// Instruction appended without all of its parameters.
    IncompleteInsn(String),
    LabelRedefined(u32),
    UndefinedLabel(u32),
    /// Append attempted after `make_executable`.
    Finalized,
    /// Textual assembly syntax error.
    Parse { line: usize, msg: String },
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsmError::BadInstruction(n) => write!(f, "invalid instruction '{}'", n),
            AsmError::TooManyParams(n) => write!(f, "too many parameters for '{}'", n),
            AsmError::BadParamKind(n) => write!(f, "invalid parameter kind for '{}'", n),
            AsmError::IncompleteInsn(n) => write!(f, "last instruction '{}' is incomplete", n),
            AsmError::LabelRedefined(l) => write!(f, "label L{} defined twice", l),
            AsmError::UndefinedLabel(l) => write!(f, "label L{} is never defined", l),
            AsmError::Finalized => write!(f, "routine is already executable"),
            AsmError::Parse { line, msg } => write!(f, "assembly parse error, line {}: {}", line, msg),
        }
    }
}

impl std::error::Error for AsmError {}

// ---------------------------------------------------------------------------
// Routine

/// Appendable instruction buffer with labels. Branch operands hold label
/// ids until finalisation resolves them to program counters.
#[derive(Debug, Default)]
pub struct Routine {
    code: Vec<Insn>,
    labels: Vec<Option<u32>>,
}

impl Routine {
    pub fn new() -> Self {
        Routine::default()
    }

    pub fn fresh_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    pub fn define_label(&mut self, l: Label) -> Result<(), AsmError> {
        let slot = &mut self.labels[l.0 as usize];
        if slot.is_some() {
            return Err(AsmError::LabelRedefined(l.0));
        }
        *slot = Some(self.code.len() as u32);
        Ok(())
    }

    pub fn append(&mut self, i: Insn) {
        self.code.push(i);
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Rewrite label operands to program counters.
    fn resolve(&mut self) -> Result<(), AsmError> {
        let resolve_one = |labels: &[Option<u32>], id: u32| -> Result<u32, AsmError> {
            labels
                .get(id as usize)
                .copied()
                .flatten()
                .ok_or(AsmError::UndefinedLabel(id))
        };
        let labels = std::mem::take(&mut self.labels);
        for insn in &mut self.code {
            match insn {
                Insn::Ba(t) | Insn::Bzi(t) | Insn::Bnzi(t) => *t = resolve_one(&labels, *t)?,
                Insn::Pushe { target, .. } => *target = resolve_one(&labels, *target)?,
                Insn::MkCls { entry } => *entry = resolve_one(&labels, *entry)?,
                _ => {}
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Program

/// An executable routine plus its literal table.
///
/// The literal table is an internal-array object on the VM heap; the VM
/// keeps every live program's table reachable through its program
/// registry, and rewrites the reference here when a collection moves the
/// array.
#[derive(Debug)]
pub struct Program {
    code: Vec<Insn>,
    params: Cell<GcRef>,
}

impl Program {
    pub fn fetch(&self, pc: usize) -> Option<Insn> {
        self.code.get(pc).copied()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Literal table reference. Only the VM's root tracing may rewrite it.
    pub fn params(&self) -> GcRef {
        self.params.get()
    }

    pub(crate) fn trace_params(&self, f: &mut dyn FnMut(&mut GcRef)) {
        let mut r = self.params.get();
        f(&mut r);
        self.params.set(r);
    }

    /// Literal at index `idx`.
    pub fn literal(&self, heap: &Heap<Object>, idx: u32) -> Value {
        match heap.get(self.params()) {
            Object::IArr(vs) => vs[idx as usize],
            _ => Value::Null,
        }
    }

    /// Disassembly listing, one instruction per line.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for (pc, insn) in self.code.iter().enumerate() {
            out.push_str(&format!("{:4}: {:?}\n", pc, insn));
        }
        out
    }
}

/// Parameter accepted by the by-name append API.
#[derive(Debug, Clone, Copy)]
pub enum AsmParam {
    /// A literal value, routed through the literal table.
    Val(Value),
    Uns(u64),
    Lbl(Label),
    /// Register reference `%cN`. Parsed for compatibility; no instruction
    /// of this VM takes one.
    Reg { class: char, id: u32 },
}

struct Pending {
    name: String,
    params: Vec<AsmParam>,
}

/// Append-only program under construction.
pub struct ProgramBuilder {
    routine: Routine,
    params: Vec<Value>,
    pending: Option<Pending>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        ProgramBuilder {
            routine: Routine::new(),
            params: Vec::new(),
            pending: None,
        }
    }

    pub fn fresh_label(&mut self) -> Label {
        self.routine.fresh_label()
    }

    pub fn append_label(&mut self, l: Label) -> Result<(), AsmError> {
        self.flush_pending()?;
        self.routine.define_label(l)
    }

    /// Append a fully-formed instruction (code generator path).
    pub fn emit(&mut self, i: Insn) -> Result<(), AsmError> {
        self.flush_pending()?;
        self.routine.append(i);
        Ok(())
    }

    /// Append a `push` of a literal value, deduplicating it into the
    /// literal table.
    pub fn push_val(&mut self, v: Value) -> Result<(), AsmError> {
        self.flush_pending()?;
        let idx = self.intern(v);
        self.routine.append(Insn::Push(idx));
        Ok(())
    }

    /// Current program counter; the next appended instruction lands here.
    pub fn pc(&self) -> usize {
        self.routine.len()
    }

    fn intern(&mut self, v: Value) -> u32 {
        match self.params.iter().position(|p| *p == v) {
            Some(i) => i as u32,
            None => {
                self.params.push(v);
                self.params.len() as u32 - 1
            }
        }
    }

    /// Start an instruction by name (textual assembler path).
    pub fn append_instruction(&mut self, name: &str) -> Result<(), AsmError> {
        self.flush_pending()?;
        if arity(name).is_none() {
            return Err(AsmError::BadInstruction(name.to_string()));
        }
        self.pending = Some(Pending {
            name: name.to_string(),
            params: Vec::new(),
        });
        Ok(())
    }

    pub fn append_val_parameter(&mut self, v: Value) -> Result<(), AsmError> {
        self.append_param(AsmParam::Val(v))
    }

    pub fn append_unsigned_parameter(&mut self, n: u64) -> Result<(), AsmError> {
        self.append_param(AsmParam::Uns(n))
    }

    pub fn append_label_parameter(&mut self, l: Label) -> Result<(), AsmError> {
        self.append_param(AsmParam::Lbl(l))
    }

    pub fn append_register_parameter(&mut self, class: char, id: u32) -> Result<(), AsmError> {
        self.append_param(AsmParam::Reg { class, id })
    }

    fn append_param(&mut self, p: AsmParam) -> Result<(), AsmError> {
        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| AsmError::BadParamKind("<no instruction>".to_string()))?;
        let limit = arity(&pending.name).unwrap_or(0);
        if pending.params.len() >= limit {
            return Err(AsmError::TooManyParams(pending.name.clone()));
        }
        pending.params.push(p);
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<(), AsmError> {
        if let Some(mut pending) = self.pending.take() {
            let limit = arity(&pending.name).ok_or_else(|| {
                AsmError::BadInstruction(pending.name.clone())
            })?;
            if pending.params.len() < limit {
                return Err(AsmError::IncompleteInsn(pending.name.clone()));
            }
            // Literal values become table indices before construction.
            for p in &mut pending.params {
                if let AsmParam::Val(v) = *p {
                    *p = AsmParam::Uns(self.intern(v) as u64);
                }
            }
            let insn = construct(&pending.name, &pending.params)?;
            self.routine.append(insn);
        }
        Ok(())
    }

    /// One-way transition to an executable [`Program`]. Labels are
    /// resolved; the literal table moves onto the heap.
    pub fn make_executable(mut self, heap: &mut Heap<Object>) -> Result<Program, AsmError> {
        self.flush_pending()?;
        self.routine.resolve()?;
        let params = heap.alloc(Object::IArr(self.params));
        Ok(Program {
            code: self.routine.code,
            params: Cell::new(params),
        })
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of parameters the named instruction takes, or `None` for an
/// unknown mnemonic.
pub fn arity(name: &str) -> Option<usize> {
    Some(match name {
        "push" | "revn" | "ba" | "bzi" | "bnzi" | "pushe" | "mkcls" | "map" => 1,
        "pushvar" | "popvar" | "mksct" | "iconv" => 2,
        "mkst" => 4,
        _ if SIMPLE.contains(&name) => 0,
        _ => return None,
    })
}

/// Zero-operand mnemonics.
const SIMPLE: &[&str] = &[
    "drop", "swap", "nip", "dup", "over", "rot", "nrot", "tuck", "quake", "tor", "fromr", "atr",
    "add", "sub", "mul", "div", "cdiv", "mod", "pow", "neg", "addov", "subov", "mulov", "powov",
    "bnot", "band", "bor", "bxor", "shl", "shr", "eqi", "nei", "lti", "lei", "gti", "gei", "eqs",
    "nes", "lts", "les", "gts", "ges", "eqa", "sconc", "strref", "vtos", "bconc", "mko", "ogetm",
    "ogetu", "addo", "subo", "mulo", "divo", "modo", "cdivo", "call", "return", "raise", "pope",
    "pushenv", "popenv", "regvar", "pec", "mka", "ains", "aref", "arefo", "aset", "atrim", "aconc",
    "afill", "aconvsel", "aconvsiz", "sref", "srefo", "sset", "ssetc", "smeth", "sck", "typof",
    "isa", "mkit", "mkat", "mkot", "cons", "remap", "write", "unmap", "poke", "mm", "mgeto", "mseto",
    "mgetios", "msetios", "mgetm", "msetm", "mgetw", "msetw", "mgets", "msets", "mgetsel",
    "msetsel", "mgetsiz", "msetsiz", "open", "close", "ioscur", "iossetcur", "iossearch",
    "ioshandler", "iossize", "print", "prints", "sel", "siz", "nop",
];

fn uns(name: &str, p: &AsmParam) -> Result<u64, AsmError> {
    match p {
        AsmParam::Uns(n) => Ok(*n),
        _ => Err(AsmError::BadParamKind(name.to_string())),
    }
}

fn lbl(name: &str, p: &AsmParam) -> Result<u32, AsmError> {
    match p {
        AsmParam::Lbl(l) => Ok(l.0),
        _ => Err(AsmError::BadParamKind(name.to_string())),
    }
}

/// Build an instruction from a mnemonic and parameters. Literal values
/// must already have been interned to unsigned table indices.
fn construct(name: &str, params: &[AsmParam]) -> Result<Insn, AsmError> {
    let insn = match name {
        "push" => Insn::Push(uns(name, &params[0])? as u32),
        "revn" => Insn::Revn(uns(name, &params[0])? as u32),
        "ba" => Insn::Ba(lbl(name, &params[0])?),
        "bzi" => Insn::Bzi(lbl(name, &params[0])?),
        "bnzi" => Insn::Bnzi(lbl(name, &params[0])?),
        // The textual form installs catch-all handlers; codes come from
        // the code generator.
        "pushe" => Insn::Pushe {
            target: lbl(name, &params[0])?,
            code: -1,
        },
        "mkcls" => Insn::MkCls {
            entry: lbl(name, &params[0])?,
        },
        "map" => Insn::Map {
            strict: uns(name, &params[0])? != 0,
        },
        "iconv" => Insn::IConv {
            size: uns(name, &params[0])? as u8,
            signed: uns(name, &params[1])? != 0,
        },
        "pushvar" => Insn::Pushvar {
            back: uns(name, &params[0])? as u16,
            over: uns(name, &params[1])? as u16,
        },
        "popvar" => Insn::Popvar {
            back: uns(name, &params[0])? as u16,
            over: uns(name, &params[1])? as u16,
        },
        "mksct" => Insn::Mksct {
            nfields: uns(name, &params[0])? as u32,
            nmethods: uns(name, &params[1])? as u32,
        },
        "mkst" => Insn::Mkst {
            nfields: uns(name, &params[0])? as u32,
            nmethods: uns(name, &params[1])? as u32,
            pinned: uns(name, &params[2])? != 0,
            union_: uns(name, &params[3])? != 0,
        },
        simple if SIMPLE.contains(&simple) => {
            if !params.is_empty() {
                return Err(AsmError::TooManyParams(name.to_string()));
            }
            simple_insn(simple).ok_or_else(|| AsmError::BadInstruction(name.to_string()))?
        }
        other => return Err(AsmError::BadInstruction(other.to_string())),
    };
    Ok(insn)
}

fn simple_insn(name: &str) -> Option<Insn> {
    Some(match name {
        "drop" => Insn::Drop,
        "swap" => Insn::Swap,
        "nip" => Insn::Nip,
        "dup" => Insn::Dup,
        "over" => Insn::Over,
        "rot" => Insn::Rot,
        "nrot" => Insn::Nrot,
        "tuck" => Insn::Tuck,
        "quake" => Insn::Quake,
        "tor" => Insn::Tor,
        "fromr" => Insn::Fromr,
        "atr" => Insn::Atr,
        "add" => Insn::Add,
        "sub" => Insn::Sub,
        "mul" => Insn::Mul,
        "div" => Insn::Div,
        "cdiv" => Insn::CDiv,
        "mod" => Insn::Mod,
        "pow" => Insn::Pow,
        "neg" => Insn::Neg,
        "addov" => Insn::AddOv,
        "subov" => Insn::SubOv,
        "mulov" => Insn::MulOv,
        "powov" => Insn::PowOv,
        "bnot" => Insn::BNot,
        "band" => Insn::BAnd,
        "bor" => Insn::BOr,
        "bxor" => Insn::BXor,
        "shl" => Insn::Shl,
        "shr" => Insn::Shr,
        "eqi" => Insn::EqI,
        "nei" => Insn::NeI,
        "lti" => Insn::LtI,
        "lei" => Insn::LeI,
        "gti" => Insn::GtI,
        "gei" => Insn::GeI,
        "eqs" => Insn::EqS,
        "nes" => Insn::NeS,
        "lts" => Insn::LtS,
        "les" => Insn::LeS,
        "gts" => Insn::GtS,
        "ges" => Insn::GeS,
        "eqa" => Insn::Eqa,
        "sconc" => Insn::Sconc,
        "strref" => Insn::Strref,
        "vtos" => Insn::Vtos,
        "bconc" => Insn::Bconc,
        "mko" => Insn::Mko,
        "ogetm" => Insn::Ogetm,
        "ogetu" => Insn::Ogetu,
        "addo" => Insn::AddO,
        "subo" => Insn::SubO,
        "mulo" => Insn::MulO,
        "divo" => Insn::DivO,
        "modo" => Insn::ModO,
        "cdivo" => Insn::CDivO,
        "call" => Insn::Call,
        "return" => Insn::Return,
        "raise" => Insn::Raise,
        "pope" => Insn::Pope,
        "pushenv" => Insn::PushEnv,
        "popenv" => Insn::PopEnv,
        "regvar" => Insn::Regvar,
        "pec" => Insn::Pec,
        "mka" => Insn::Mka,
        "ains" => Insn::Ains,
        "aref" => Insn::Aref,
        "arefo" => Insn::Arefo,
        "aset" => Insn::Aset,
        "atrim" => Insn::Atrim,
        "aconc" => Insn::Aconc,
        "afill" => Insn::Afill,
        "aconvsel" => Insn::ArrConvSel,
        "aconvsiz" => Insn::ArrConvSiz,
        "sref" => Insn::Sref,
        "srefo" => Insn::Srefo,
        "sset" => Insn::Sset,
        "ssetc" => Insn::SsetC,
        "smeth" => Insn::Smeth,
        "sck" => Insn::Sck,
        "typof" => Insn::Typof,
        "isa" => Insn::Isa,
        "mkit" => Insn::Mkit,
        "mkat" => Insn::Mkat,
        "mkot" => Insn::Mkot,
        "cons" => Insn::Cons,
        "remap" => Insn::Remap,
        "write" => Insn::WriteV,
        "unmap" => Insn::UnmapV,
        "poke" => Insn::Poke,
        "mm" => Insn::Mm,
        "mgeto" => Insn::Mgeto,
        "mseto" => Insn::Mseto,
        "mgetios" => Insn::Mgetios,
        "msetios" => Insn::Msetios,
        "mgetm" => Insn::Mgetm,
        "msetm" => Insn::Msetm,
        "mgetw" => Insn::Mgetw,
        "msetw" => Insn::Msetw,
        "mgets" => Insn::Mgets,
        "msets" => Insn::Msets,
        "mgetsel" => Insn::Mgetsel,
        "msetsel" => Insn::Msetsel,
        "mgetsiz" => Insn::Mgetsiz,
        "msetsiz" => Insn::Msetsiz,
        "open" => Insn::Open,
        "close" => Insn::CloseIos,
        "ioscur" => Insn::IosCur,
        "iossetcur" => Insn::IosSetCur,
        "iossearch" => Insn::IosSearch,
        "ioshandler" => Insn::IosHandler,
        "iossize" => Insn::IosSize,
        "print" => Insn::Print,
        "prints" => Insn::Prints,
        "sel" => Insn::Sel,
        "siz" => Insn::Siz,
        "nop" => Insn::Nop,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_emit_and_finalize() {
        let mut heap: Heap<Object> = Heap::new();
        let mut b = ProgramBuilder::new();
        b.push_val(Value::int32(1)).unwrap();
        b.push_val(Value::int32(2)).unwrap();
        b.emit(Insn::Add).unwrap();
        b.emit(Insn::Return).unwrap();
        let p = b.make_executable(&mut heap).unwrap();
        assert_eq!(p.len(), 4);
        assert_eq!(p.fetch(2), Some(Insn::Add));
        assert_eq!(p.literal(&heap, 0), Value::int32(1));
    }

    #[test]
    fn test_push_dedupes_literals() {
        let mut heap: Heap<Object> = Heap::new();
        let mut b = ProgramBuilder::new();
        b.push_val(Value::int32(7)).unwrap();
        b.push_val(Value::int32(7)).unwrap();
        b.push_val(Value::int32(8)).unwrap();
        b.emit(Insn::Return).unwrap();
        let p = b.make_executable(&mut heap).unwrap();
        assert_eq!(p.fetch(0), Some(Insn::Push(0)));
        assert_eq!(p.fetch(1), Some(Insn::Push(0)));
        assert_eq!(p.fetch(2), Some(Insn::Push(1)));
    }

    #[test]
    fn test_label_resolution() {
        let mut heap: Heap<Object> = Heap::new();
        let mut b = ProgramBuilder::new();
        let l = b.fresh_label();
        b.emit(Insn::Ba(l.0)).unwrap();
        b.emit(Insn::Nop).unwrap();
        b.append_label(l).unwrap();
        b.emit(Insn::Return).unwrap();
        let p = b.make_executable(&mut heap).unwrap();
        assert_eq!(p.fetch(0), Some(Insn::Ba(2)));
    }

    #[test]
    fn test_label_defined_twice() {
        let mut b = ProgramBuilder::new();
        let l = b.fresh_label();
        b.append_label(l).unwrap();
        assert!(matches!(
            b.append_label(l),
            Err(AsmError::LabelRedefined(_))
        ));
    }

    #[test]
    fn test_undefined_label_rejected() {
        let mut heap: Heap<Object> = Heap::new();
        let mut b = ProgramBuilder::new();
        let l = b.fresh_label();
        b.emit(Insn::Ba(l.0)).unwrap();
        assert!(matches!(
            b.make_executable(&mut heap),
            Err(AsmError::UndefinedLabel(_))
        ));
    }

    #[test]
    fn test_by_name_api() {
        let mut heap: Heap<Object> = Heap::new();
        let mut b = ProgramBuilder::new();
        b.append_instruction("push").unwrap();
        b.append_val_parameter(Value::int32(42)).unwrap();
        b.append_instruction("add").unwrap();
        b.append_instruction("return").unwrap();
        let p = b.make_executable(&mut heap).unwrap();
        assert_eq!(p.fetch(0), Some(Insn::Push(0)));
        assert_eq!(p.fetch(1), Some(Insn::Add));
        assert_eq!(p.fetch(2), Some(Insn::Return));
    }

    #[test]
    fn test_bad_instruction_name() {
        let mut b = ProgramBuilder::new();
        assert!(matches!(
            b.append_instruction("frobnicate"),
            Err(AsmError::BadInstruction(_))
        ));
    }

    #[test]
    fn test_too_many_parameters() {
        let mut b = ProgramBuilder::new();
        b.append_instruction("revn").unwrap();
        b.append_unsigned_parameter(2).unwrap();
        assert!(matches!(
            b.append_unsigned_parameter(3),
            Err(AsmError::TooManyParams(_))
        ));
    }

    #[test]
    fn test_incomplete_instruction() {
        let mut heap: Heap<Object> = Heap::new();
        let mut b = ProgramBuilder::new();
        b.append_instruction("pushvar").unwrap();
        b.append_unsigned_parameter(0).unwrap();
        assert!(matches!(
            b.make_executable(&mut heap),
            Err(AsmError::IncompleteInsn(_))
        ));
    }

    #[test]
    fn test_register_parameter_rejected() {
        let mut b = ProgramBuilder::new();
        b.append_instruction("revn").unwrap();
        b.append_register_parameter('c', 0).unwrap();
        // The kind mismatch surfaces when the instruction completes.
        let mut heap: Heap<Object> = Heap::new();
        assert!(matches!(
            b.make_executable(&mut heap),
            Err(AsmError::BadParamKind(_))
        ));
    }
}
