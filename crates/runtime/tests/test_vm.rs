//! End-to-end tests of the VM: assembled programs, exceptions, closures,
//! collection under execution, cancellation, and mapped structs.

use std::rc::Rc;

use jab_core::ios::{IOS_READ, IOS_WRITE};
use jab_runtime::exception::{exception_code, EC_DIV_BY_ZERO, EC_OVERFLOW, EC_SIGNAL};
use jab_runtime::program::{Insn, Program, ProgramBuilder};
use jab_runtime::value::{
    self, make_string, Object, StructType, StructTypeField, TypeVal, Value,
};
use jab_runtime::Vm;
use serial_test::serial;

fn run(vm: &mut Vm, build: impl FnOnce(&mut Vm, &mut ProgramBuilder)) -> Result<Value, Value> {
    let p = program(vm, build);
    vm.run(&p)
}

fn program(vm: &mut Vm, build: impl FnOnce(&mut Vm, &mut ProgramBuilder)) -> Rc<Program> {
    let mut b = ProgramBuilder::new();
    build(vm, &mut b);
    vm.make_program(b).expect("program must assemble")
}

#[test]
fn test_integer_arithmetic() {
    // 2 + 3 * 4
    let mut vm = Vm::new();
    let r = run(&mut vm, |_, b| {
        b.push_val(Value::int32(3)).unwrap();
        b.push_val(Value::int32(4)).unwrap();
        b.emit(Insn::Mul).unwrap();
        b.push_val(Value::int32(2)).unwrap();
        b.emit(Insn::Add).unwrap();
        b.emit(Insn::Return).unwrap();
    })
    .unwrap();
    assert_eq!(r, Value::int32(14));
}

#[test]
fn test_wrapping_vs_checked_overflow() {
    let mut vm = Vm::new();
    // Plain add wraps at the declared width.
    let r = run(&mut vm, |_, b| {
        b.push_val(Value::Int { v: 127, size: 8 }).unwrap();
        b.push_val(Value::Int { v: 1, size: 8 }).unwrap();
        b.emit(Insn::Add).unwrap();
        b.emit(Insn::Return).unwrap();
    })
    .unwrap();
    assert_eq!(r, Value::Int { v: -128, size: 8 });

    // The checked variant raises.
    let e = run(&mut vm, |_, b| {
        b.push_val(Value::Int { v: 127, size: 8 }).unwrap();
        b.push_val(Value::Int { v: 1, size: 8 }).unwrap();
        b.emit(Insn::AddOv).unwrap();
        b.emit(Insn::Return).unwrap();
    })
    .unwrap_err();
    assert_eq!(exception_code(vm.heap(), e), EC_OVERFLOW);
}

#[test]
fn test_division_by_zero() {
    let mut vm = Vm::new();
    let e = run(&mut vm, |_, b| {
        b.push_val(Value::int32(1)).unwrap();
        b.push_val(Value::int32(0)).unwrap();
        b.emit(Insn::Div).unwrap();
        b.emit(Insn::Return).unwrap();
    })
    .unwrap_err();
    assert_eq!(exception_code(vm.heap(), e), EC_DIV_BY_ZERO);
    assert_eq!(exception_code(vm.heap(), vm.exit_exception()), EC_DIV_BY_ZERO);
}

#[test]
fn test_handler_catches_and_restores() {
    let mut vm = Vm::new();
    let r = run(&mut vm, |_, b| {
        let handler = b.fresh_label();
        let done = b.fresh_label();
        b.emit(Insn::Pushe {
            target: handler.0,
            code: -1,
        })
        .unwrap();
        b.push_val(Value::int32(1)).unwrap();
        b.push_val(Value::int32(0)).unwrap();
        b.emit(Insn::Div).unwrap();
        b.emit(Insn::Pope).unwrap();
        b.push_val(Value::int32(99)).unwrap();
        b.emit(Insn::Ba(done.0)).unwrap();
        b.append_label(handler).unwrap();
        // The exception value is on the stack here.
        b.emit(Insn::Drop).unwrap();
        b.push_val(Value::int32(42)).unwrap();
        b.append_label(done).unwrap();
        b.emit(Insn::Return).unwrap();
    })
    .unwrap();
    assert_eq!(r, Value::int32(42));
}

#[test]
fn test_handler_code_matching() {
    let mut vm = Vm::new();
    let exc = vm.exception(42, "");
    let h = vm.pin(exc);

    // Handler expecting code 42 catches it.
    let r = run(&mut vm, |_, b| {
        let handler = b.fresh_label();
        b.emit(Insn::Pushe {
            target: handler.0,
            code: 42,
        })
        .unwrap();
        b.push_val(exc).unwrap();
        b.emit(Insn::Raise).unwrap();
        b.append_label(handler).unwrap();
        b.emit(Insn::Drop).unwrap();
        b.push_val(Value::int32(1)).unwrap();
        b.emit(Insn::Return).unwrap();
    })
    .unwrap();
    assert_eq!(r, Value::int32(1));

    // Handler expecting a different code does not.
    let e = run(&mut vm, |_, b| {
        let handler = b.fresh_label();
        b.emit(Insn::Pushe {
            target: handler.0,
            code: 7,
        })
        .unwrap();
        b.push_val(exc).unwrap();
        b.emit(Insn::Raise).unwrap();
        b.append_label(handler).unwrap();
        b.emit(Insn::Return).unwrap();
    })
    .unwrap_err();
    assert_eq!(exception_code(vm.heap(), e), 42);

    if let Some(h) = h {
        vm.unpin(h);
    }
}

#[test]
fn test_closure_call() {
    // fun (x) = x + 1, called with 5.
    let mut vm = Vm::new();
    let r = run(&mut vm, |_, b| {
        let body = b.fresh_label();
        let after = b.fresh_label();
        b.emit(Insn::Ba(after.0)).unwrap();
        b.append_label(body).unwrap();
        b.emit(Insn::PushEnv).unwrap();
        b.emit(Insn::Regvar).unwrap();
        b.emit(Insn::Pushvar { back: 0, over: 0 }).unwrap();
        b.push_val(Value::int32(1)).unwrap();
        b.emit(Insn::Add).unwrap();
        b.emit(Insn::Return).unwrap();
        b.append_label(after).unwrap();
        b.push_val(Value::int32(5)).unwrap();
        b.emit(Insn::MkCls { entry: body.0 }).unwrap();
        b.emit(Insn::Pec).unwrap();
        b.emit(Insn::Call).unwrap();
        b.emit(Insn::Return).unwrap();
    })
    .unwrap();
    assert_eq!(r, Value::int32(6));
}

#[test]
#[serial]
fn test_signal_cancellation() {
    let mut vm = Vm::new();
    let p = program(&mut vm, |_, b| {
        let l = b.fresh_label();
        b.append_label(l).unwrap();
        b.emit(Insn::Ba(l.0)).unwrap();
    });
    // The flag is checked at the next instruction boundary, so a pending
    // interrupt terminates the otherwise infinite loop.
    vm.request_interrupt();
    let e = vm.run(&p).unwrap_err();
    assert_eq!(exception_code(vm.heap(), e), EC_SIGNAL);
}

#[test]
fn test_collection_during_run() {
    let mut vm = Vm::new();
    let a = make_string(vm.heap_mut(), "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    let before = vm.heap().stats().collections;
    let r = run(&mut vm, |_, b| {
        // Loop building garbage strings until well past the allocation
        // budget.
        let loop_ = b.fresh_label();
        let end = b.fresh_label();
        b.emit(Insn::PushEnv).unwrap();
        b.push_val(Value::int32(200_000)).unwrap();
        b.emit(Insn::Regvar).unwrap();
        b.append_label(loop_).unwrap();
        b.emit(Insn::Pushvar { back: 0, over: 0 }).unwrap();
        b.emit(Insn::Bzi(end.0)).unwrap();
        b.push_val(a).unwrap();
        b.push_val(a).unwrap();
        b.emit(Insn::Sconc).unwrap();
        b.emit(Insn::Drop).unwrap();
        b.emit(Insn::Pushvar { back: 0, over: 0 }).unwrap();
        b.push_val(Value::int32(1)).unwrap();
        b.emit(Insn::Sub).unwrap();
        b.emit(Insn::Popvar { back: 0, over: 0 }).unwrap();
        b.emit(Insn::Ba(loop_.0)).unwrap();
        b.append_label(end).unwrap();
        b.emit(Insn::PopEnv).unwrap();
        b.push_val(Value::int32(7)).unwrap();
        b.emit(Insn::Return).unwrap();
    })
    .unwrap();
    assert_eq!(r, Value::int32(7));
    assert!(
        vm.heap().stats().collections > before,
        "the loop must have triggered at least one collection"
    );
}

#[test]
fn test_map_struct_and_reloc_roundtrip() {
    let mut vm = Vm::new();
    let id = vm
        .ios()
        .open("mem://t", IOS_READ | IOS_WRITE, true)
        .unwrap();
    vm.ios().pwrite(id, &[0x01, 0x02], 0).unwrap();

    // struct { uint<8> a; uint<8> b; }
    let u8t = vm.itype(8, false);
    let na = make_string(vm.heap_mut(), "a");
    let nb = make_string(vm.heap_mut(), "b");
    let field = |name: Value| StructTypeField {
        name,
        ftype: u8t,
        label: Value::Null,
        check: Value::Null,
        init: Value::Null,
        optcond: Value::Null,
        endian: None,
    };
    let stype = vm.alloc(Object::Typ(TypeVal::Struct(StructType {
        name: Value::Null,
        fields: vec![field(na), field(nb)],
        methods: Vec::new(),
        pinned: false,
        union_: false,
        mapper: Value::Null,
        writer: Value::Null,
        constructor: Value::Null,
    })));

    let sct = run(&mut vm, |_, b| {
        b.push_val(stype).unwrap();
        b.push_val(Value::Null).unwrap(); // current IO space
        b.push_val(Value::ulong(0)).unwrap(); // bit offset
        b.emit(Insn::Map { strict: true }).unwrap();
        b.emit(Insn::Return).unwrap();
    })
    .unwrap();

    let r = sct.as_ref().unwrap();
    let field_vals = |vm: &Vm| -> Vec<Value> {
        match vm.heap().get(r) {
            Object::Sct(s) => s.fields.iter().map(|f| f.val).collect(),
            _ => panic!("mapping must build a struct"),
        }
    };
    assert_eq!(
        field_vals(&vm),
        vec![
            Value::UInt { v: 1, size: 8 },
            Value::UInt { v: 2, size: 8 }
        ]
    );

    // Relocate to bit offset 16 and back; the mapping info must be
    // restored bit for bit and the fields untouched.
    value::reloc(vm.heap_mut(), sct, Value::Int { v: id, size: 32 }, 16);
    if let Object::Sct(s) = vm.heap().get(r) {
        assert_eq!(s.map.offset, Value::ulong(16));
        assert_eq!(s.fields[0].off, Value::ulong(16));
    }
    value::ureloc(vm.heap_mut(), sct);
    if let Object::Sct(s) = vm.heap().get(r) {
        assert!(s.map.mapped);
        assert_eq!(s.map.offset, Value::ulong(0));
        assert_eq!(s.fields[0].off, Value::ulong(0));
        assert_eq!(s.fields[1].off, Value::ulong(8));
    }
    assert_eq!(
        field_vals(&vm),
        vec![
            Value::UInt { v: 1, size: 8 },
            Value::UInt { v: 2, size: 8 }
        ]
    );
}

#[test]
fn test_write_back() {
    let mut vm = Vm::new();
    let id = vm
        .ios()
        .open("mem://w", IOS_READ | IOS_WRITE, true)
        .unwrap();
    vm.ios().pwrite(id, &[0xaa, 0xbb, 0xcc], 0).unwrap();

    // Map a uint<8>[3], change an element, write it back.
    let u8t = vm.itype(8, false);
    let atype = vm.alloc(Object::Typ(TypeVal::Array {
        bound: Value::ulong(3),
        elem: u8t,
    }));
    let r = run(&mut vm, |_, b| {
        b.push_val(atype).unwrap();
        b.push_val(Value::Null).unwrap();
        b.push_val(Value::ulong(0)).unwrap();
        b.emit(Insn::Map { strict: true }).unwrap();
        // arr[1] = 0x7f
        b.push_val(Value::ulong(1)).unwrap();
        b.push_val(Value::UInt { v: 0x7f, size: 8 }).unwrap();
        b.emit(Insn::Aset).unwrap();
        b.emit(Insn::WriteV).unwrap();
        b.emit(Insn::Return).unwrap();
    });
    r.unwrap();

    let mut buf = [0u8; 3];
    vm.ios().pread(id, &mut buf, 0).unwrap();
    assert_eq!(buf, [0xaa, 0x7f, 0xcc]);
}

#[test]
fn test_profiling_counters() {
    let mut vm = Vm::new();
    vm.set_profiling(true);
    run(&mut vm, |_, b| {
        b.push_val(Value::int32(1)).unwrap();
        b.push_val(Value::int32(2)).unwrap();
        b.emit(Insn::Add).unwrap();
        b.emit(Insn::Return).unwrap();
    })
    .unwrap();
    let counts = vm.profile_counts().unwrap();
    assert_eq!(counts.get("add"), Some(&1));
    assert_eq!(counts.get("push"), Some(&2));

    vm.print_profile();
    assert!(vm.take_output().contains("add"));

    vm.reset_profile();
    assert!(vm.profile_counts().unwrap().is_empty());
}

#[test]
fn test_two_sequential_vms() {
    for _ in 0..2 {
        let mut vm = Vm::new();
        let r = run(&mut vm, |_, b| {
            b.push_val(Value::int32(11)).unwrap();
            b.emit(Insn::Return).unwrap();
        })
        .unwrap();
        assert_eq!(r, Value::int32(11));
    }
}

#[test]
fn test_map_from_file_space() {
    use std::io::Write as _;

    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(&[0x10, 0x20]).unwrap();
    f.flush().unwrap();

    let mut vm = Vm::new();
    let handler = format!("file://{}", f.path().display());
    vm.ios().open(&handler, IOS_READ, true).unwrap();

    let u8t = vm.itype(8, false);
    let atype = vm.alloc(Object::Typ(TypeVal::Array {
        bound: Value::ulong(2),
        elem: u8t,
    }));
    let arr = run(&mut vm, |_, b| {
        b.push_val(atype).unwrap();
        b.push_val(Value::Null).unwrap();
        b.push_val(Value::ulong(0)).unwrap();
        b.emit(Insn::Map { strict: true }).unwrap();
        b.emit(Insn::Return).unwrap();
    })
    .unwrap();
    if let Object::Arr(a) = vm.heap().get(arr.as_ref().unwrap()) {
        assert_eq!(a.elems.len(), 2);
        assert_eq!(a.elems[0].val, Value::UInt { v: 0x10, size: 8 });
        assert_eq!(a.elems[1].val, Value::UInt { v: 0x20, size: 8 });
    } else {
        panic!("mapping must build an array");
    }
}

#[test]
fn test_globals_roundtrip() {
    let mut vm = Vm::new();
    let n = vm.global_count();
    vm.register_global(Value::int32(5));
    assert_eq!(vm.global_count(), n + 1);
    assert_eq!(vm.lookup_global(n), Some(Value::int32(5)));
    vm.truncate_globals(n);
    assert_eq!(vm.global_count(), n);
}
