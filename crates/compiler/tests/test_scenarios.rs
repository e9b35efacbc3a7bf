//! End-to-end driver tests: compile and run Jab source on a fresh VM,
//! checking values, exceptions, mapping and environment transactionality.

use jab_core::ios::{IOS_READ, IOS_WRITE};
use jab_runtime::exception::{exception_code, EC_CONSTRAINT, EC_SIGNAL};
use jab_runtime::value::{self, equal, make_integral, size_of, Object, Value};
use jab_runtime::Vm;
use jabc::{AlienLit, Compiler, JabError, FLAG_NOSTDTYPES};
use serial_test::serial;

fn fresh() -> (Vm, Compiler) {
    let mut vm = Vm::new();
    let compiler = Compiler::new(&mut vm, 0).expect("prelude must load");
    (vm, compiler)
}

fn exc_code(vm: &Vm, e: JabError) -> i32 {
    match e {
        JabError::Exception(exc) => exception_code(vm.heap(), exc),
        JabError::Compile(e) => panic!("expected a runtime exception, got: {}", e),
    }
}

#[test]
fn test_scenario_integer_arithmetic() {
    let (mut vm, mut c) = fresh();
    let v = c.execute_statement(&mut vm, "2 + 3 * 4;").unwrap();
    assert!(equal(vm.heap(), v, make_integral(14, 32, true).unwrap()));
}

#[test]
fn test_scenario_offset_arithmetic() {
    let (mut vm, mut c) = fresh();
    let v = c.execute_statement(&mut vm, "8#B + 4#b;").unwrap();
    let r = v.as_ref().expect("offset result");
    match vm.heap().get(r) {
        Object::Off(o) => {
            assert_eq!(o.in_bits(), 68);
            assert_eq!(o.unit, 1);
        }
        other => panic!("expected an offset, got {:?}", other),
    }
    // Offsets measure as their magnitude: 64 bits after promotion.
    assert_eq!(size_of(vm.heap(), v), 64);
}

#[test]
fn test_scenario_array_construction() {
    let (mut vm, mut c) = fresh();
    let v = c
        .execute_statement(&mut vm, "int<8>[3] { 1, 2, 3 };")
        .unwrap();
    assert_eq!(value::elemsof(vm.heap(), v), 3);
    assert_eq!(size_of(vm.heap(), v), 24);

    let first = c.execute_expression(&mut vm, "int<8>[3] { 1, 2, 3 }[0]");
    assert!(equal(
        vm.heap(),
        first.unwrap(),
        make_integral(1, 8, true).unwrap()
    ));
}

#[test]
fn test_scenario_struct_mapping_roundtrip() {
    let (mut vm, mut c) = fresh();
    let id = vm
        .ios()
        .open("mem://t", IOS_READ | IOS_WRITE, true)
        .unwrap();
    vm.ios().pwrite(id, &[0x01, 0x02], 0).unwrap();

    c.execute_program(
        &mut vm,
        "type Hdr = struct { uint<8> a; uint<8> b; }; var h = Hdr @ 0#B;",
    )
    .unwrap();

    let a = c.execute_expression(&mut vm, "h.a").unwrap();
    let b = c.execute_expression(&mut vm, "h.b").unwrap();
    assert!(equal(vm.heap(), a, make_integral(1, 8, false).unwrap()));
    assert!(equal(vm.heap(), b, make_integral(2, 8, false).unwrap()));

    // Relocate to bit offset 16 and back: fields unchanged, mapping
    // info restored exactly.
    let h = c.execute_expression(&mut vm, "h").unwrap();
    let hr = h.as_ref().unwrap();
    value::reloc(vm.heap_mut(), h, Value::Int { v: id, size: 32 }, 16);
    if let Object::Sct(s) = vm.heap().get(hr) {
        assert!(s.map.mapped);
        assert_eq!(s.map.offset, Value::ulong(16));
    }
    value::ureloc(vm.heap_mut(), h);
    if let Object::Sct(s) = vm.heap().get(hr) {
        assert!(s.map.mapped);
        assert_eq!(s.map.offset, Value::ulong(0));
        assert_eq!(s.fields[0].off, Value::ulong(0));
        assert_eq!(s.fields[1].off, Value::ulong(8));
    }
    let a = c.execute_expression(&mut vm, "h.a").unwrap();
    assert!(equal(vm.heap(), a, make_integral(1, 8, false).unwrap()));
}

#[test]
fn test_scenario_exception_propagation() {
    let (mut vm, mut c) = fresh();
    c.execute_program(&mut vm, "var r = 9;").unwrap();
    c.execute_statement(
        &mut vm,
        "try raise Exception { code = 42, name = \"x\", exit_status = 1, \
         location = \"\", msg = \"\" }; \
         catch if e.code == 42 { r = 0; } else { r = 1; }",
    )
    .unwrap();
    let r = c.execute_expression(&mut vm, "r").unwrap();
    assert!(equal(vm.heap(), r, make_integral(0, 32, true).unwrap()));

    // A non-matching code takes the else branch.
    c.execute_statement(
        &mut vm,
        "try raise Exception { code = 41, name = \"x\", exit_status = 1, \
         location = \"\", msg = \"\" }; \
         catch if e.code == 42 { r = 0; } else { r = 1; }",
    )
    .unwrap();
    let r = c.execute_expression(&mut vm, "r").unwrap();
    assert!(equal(vm.heap(), r, make_integral(1, 32, true).unwrap()));
}

#[test]
fn test_scenario_bconc_assignment() {
    let (mut vm, mut c) = fresh();
    c.execute_program(&mut vm, "var a = 0UB; var b = 0UB;").unwrap();
    c.execute_statement(&mut vm, "a:::b = 0x1234UH;").unwrap();
    let a = c.execute_expression(&mut vm, "a").unwrap();
    let b = c.execute_expression(&mut vm, "b").unwrap();
    assert!(equal(vm.heap(), a, make_integral(0x12, 8, false).unwrap()));
    assert!(equal(vm.heap(), b, make_integral(0x34, 8, false).unwrap()));
}

#[test]
fn test_environment_rollback_on_error() {
    let (mut vm, mut c) = fresh();
    c.execute_program(&mut vm, "var keep = 7;").unwrap();

    // The failed compile must not leak its declarations.
    assert!(c
        .execute_program(&mut vm, "var leak = 1; no_such_name;")
        .is_err());
    assert!(!c.declared("leak"));
    assert!(c.declared("keep"));
    let keep = c.execute_expression(&mut vm, "keep").unwrap();
    assert!(equal(vm.heap(), keep, make_integral(7, 32, true).unwrap()));

    // A runtime failure rolls back too, including the globals.
    assert!(c
        .execute_program(&mut vm, "var gone = 1; var boom = 1 / 0;")
        .is_err());
    assert!(!c.declared("gone"));
    let keep = c.execute_expression(&mut vm, "keep").unwrap();
    assert!(equal(vm.heap(), keep, make_integral(7, 32, true).unwrap()));
}

#[test]
fn test_functions_and_recursion() {
    let (mut vm, mut c) = fresh();
    c.execute_program(
        &mut vm,
        "fun fact = (int<32> n) int<32>: { if (n <= 1) return 1; return n * fact(n - 1); }",
    )
    .unwrap();
    let v = c.execute_expression(&mut vm, "fact(5)").unwrap();
    assert!(equal(vm.heap(), v, make_integral(120, 32, true).unwrap()));
}

#[test]
fn test_lambdas_capture_their_environment() {
    let (mut vm, mut c) = fresh();
    c.execute_program(
        &mut vm,
        "var base = 100; var add = lambda (int<32> x) int<32>: { return base + x; };",
    )
    .unwrap();
    let v = c.execute_expression(&mut vm, "add(23)").unwrap();
    assert!(equal(vm.heap(), v, make_integral(123, 32, true).unwrap()));
}

#[test]
fn test_loops_and_control() {
    let (mut vm, mut c) = fresh();
    c.execute_program(
        &mut vm,
        "var s = 0; var i = 0; \
         while (1) { i = i + 1; if (i > 10) break; if (i % 2) continue; s = s + i; }",
    )
    .unwrap();
    // 2 + 4 + 6 + 8 + 10
    let s = c.execute_expression(&mut vm, "s").unwrap();
    assert!(equal(vm.heap(), s, make_integral(30, 32, true).unwrap()));

    c.execute_program(&mut vm, "var t = 0; for (x in [1, 2, 3]) t = t + x;")
        .unwrap();
    let t = c.execute_expression(&mut vm, "t").unwrap();
    assert!(equal(vm.heap(), t, make_integral(6, 32, true).unwrap()));
}

#[test]
fn test_struct_constraints() {
    let (mut vm, mut c) = fresh();
    let id = vm
        .ios()
        .open("mem://cst", IOS_READ | IOS_WRITE, true)
        .unwrap();
    vm.ios().pwrite(id, &[200], 0).unwrap();

    c.execute_program(&mut vm, "type Small = struct { uint<8> v : v < 10; };")
        .unwrap();

    // Mapping a violating byte raises the constraint exception.
    let e = c
        .execute_expression(&mut vm, "Small @ 0#B")
        .unwrap_err();
    assert_eq!(exc_code(&vm, e), EC_CONSTRAINT);

    // A checked field store fails and restores the old value.
    c.execute_program(&mut vm, "var sm = Small { v = 3 };").unwrap();
    let e = c
        .execute_statement(&mut vm, "sm.v = 200UB;")
        .unwrap_err();
    assert_eq!(exc_code(&vm, e), EC_CONSTRAINT);
    let v = c.execute_expression(&mut vm, "sm.v").unwrap();
    assert!(equal(vm.heap(), v, make_integral(3, 8, false).unwrap()));
}

#[test]
fn test_union_struct_mapping() {
    let (mut vm, mut c) = fresh();
    let id = vm
        .ios()
        .open("mem://u", IOS_READ | IOS_WRITE, true)
        .unwrap();
    vm.ios().pwrite(id, &[0x30], 0).unwrap();

    c.execute_program(
        &mut vm,
        "type Tag = union { uint<8> small : small < 0x10; uint<8> big; }; \
         var u = Tag @ 0#B;",
    )
    .unwrap();
    // 0x30 fails the first alternative; the second is the present field.
    let v = c.execute_expression(&mut vm, "u.big").unwrap();
    assert!(equal(vm.heap(), v, make_integral(0x30, 8, false).unwrap()));
    let e = c.execute_expression(&mut vm, "u.small").unwrap_err();
    assert!(matches!(e, JabError::Exception(_)));
}

#[test]
fn test_write_back_through_assignment() {
    let (mut vm, mut c) = fresh();
    let id = vm
        .ios()
        .open("mem://wb", IOS_READ | IOS_WRITE, true)
        .unwrap();
    vm.ios().pwrite(id, &[0xaa, 0xbb], 0).unwrap();

    // Poking a mapped location writes to the space.
    c.execute_statement(&mut vm, "uint<8> @ 1#B = 0x7f;").unwrap();
    let mut buf = [0u8; 2];
    vm.ios().pread(id, &mut buf, 0).unwrap();
    assert_eq!(buf, [0xaa, 0x7f]);
}

#[test]
fn test_casts_and_isa() {
    let (mut vm, mut c) = fresh();
    let v = c
        .execute_expression(&mut vm, "0x1234UH as uint<8>")
        .unwrap();
    assert!(equal(vm.heap(), v, make_integral(0x34, 8, false).unwrap()));

    let v = c.execute_expression(&mut vm, "(-1) as uint<8>").unwrap();
    assert!(equal(vm.heap(), v, make_integral(0xff, 8, false).unwrap()));

    let v = c.execute_expression(&mut vm, "1 isa int<32>").unwrap();
    assert!(equal(vm.heap(), v, make_integral(1, 32, true).unwrap()));
    let v = c.execute_expression(&mut vm, "1 isa uint<8>").unwrap();
    assert!(equal(vm.heap(), v, make_integral(0, 32, true).unwrap()));

    // Offset unit conversion: 2 bytes are 16 bits.
    let v = c
        .execute_expression(&mut vm, "(2#B as offset<int<32>,b>) == 16#b")
        .unwrap();
    assert!(equal(vm.heap(), v, make_integral(1, 32, true).unwrap()));
}

#[test]
fn test_strings_and_printing() {
    let (mut vm, mut c) = fresh();
    let v = c
        .execute_expression(&mut vm, "\"foo\" + \"bar\" == \"foobar\"")
        .unwrap();
    assert!(equal(vm.heap(), v, make_integral(1, 32, true).unwrap()));

    c.execute_program(&mut vm, "print \"n = \"; print 42; printf \"%v-%s\\n\", 7, \"x\";")
        .unwrap();
    assert_eq!(vm.take_output(), "n = 427-x\n");

    let v = c
        .execute_expression(&mut vm, "format(\"v=%v\", 3UB)")
        .unwrap();
    let s = v.as_ref().and_then(|r| vm.heap().get(r).as_str().map(String::from));
    assert_eq!(s.as_deref(), Some("v=3UB"));
}

#[test]
fn test_pretty_print_method() {
    let (mut vm, mut c) = fresh();
    vm.knobs.pretty_print = true;
    c.execute_program(
        &mut vm,
        "type Pt = struct { int<32> x; int<32> y; \
         method _print = void: { printf \"#<%v,%v>\", x, y; } }; \
         var p = Pt { x = 1, y = 2 };",
    )
    .unwrap();
    c.execute_program(&mut vm, "print p;").unwrap();
    assert_eq!(vm.take_output(), "#<1,2>");
}

#[test]
fn test_asm_statement() {
    let (mut vm, mut c) = fresh();
    // Inline assembly splices into the routine being generated; the
    // template expands ';' to newlines.
    c.execute_program(&mut vm, "asm (\"push int<32>40;push int<32>2;add;print\");")
        .unwrap();
    assert_eq!(vm.take_output(), "42");
}

#[test]
fn test_alien_tokens() {
    let (mut vm, mut c) = fresh();
    c.lexical_cuckolding_p = true;
    c.set_alien_handler(Box::new(|text| {
        (text == "answer").then_some(AlienLit::Int {
            value: 42,
            size: 32,
            signed: true,
        })
    }));
    let v = c.execute_expression(&mut vm, "$<answer> + 1").unwrap();
    assert!(equal(vm.heap(), v, make_integral(43, 32, true).unwrap()));

    c.lexical_cuckolding_p = false;
    assert!(c.execute_expression(&mut vm, "$<answer>").is_err());
}

#[test]
fn test_enums() {
    let (mut vm, mut c) = fresh();
    c.execute_program(&mut vm, "type Color = enum { RED, GREEN = 5, BLUE };")
        .unwrap();
    let v = c.execute_expression(&mut vm, "BLUE").unwrap();
    assert!(equal(vm.heap(), v, make_integral(6, 32, true).unwrap()));
    let v = c.execute_expression(&mut vm, "RED isa Color").unwrap();
    assert!(equal(vm.heap(), v, make_integral(1, 32, true).unwrap()));
}

#[test]
fn test_defvar() {
    let (mut vm, mut c) = fresh();
    c.defvar(&mut vm, "answer", Value::int32(42)).unwrap();
    let v = c.execute_expression(&mut vm, "answer + 1").unwrap();
    assert!(equal(vm.heap(), v, make_integral(43, 32, true).unwrap()));
}

#[test]
fn test_nostdtypes_flag() {
    let mut vm = Vm::new();
    let mut c = Compiler::new(&mut vm, FLAG_NOSTDTYPES).expect("prelude must load");
    // Exception comes from std proper and stays available...
    assert!(c.declared("Exception"));
    // ...the aliases do not.
    assert!(c.execute_expression(&mut vm, "1 as byte").is_err());
}

#[test]
#[serial]
fn test_signal_cancels_program() {
    let (mut vm, mut c) = fresh();
    let p = c.compile_statement(&mut vm, "while (1) { }").unwrap();
    vm.request_interrupt();
    let exc = vm.run(&p).unwrap_err();
    assert_eq!(exception_code(vm.heap(), exc), EC_SIGNAL);
}

#[test]
fn test_compile_only_commits_declarations() {
    let (mut vm, mut c) = fresh();
    let _p = c.compile_statement(&mut vm, "var z = 5;").unwrap();
    assert!(c.declared("z"));
}

#[test]
fn test_two_sequential_runtimes() {
    for _ in 0..2 {
        let (mut vm, mut c) = fresh();
        let v = c.execute_expression(&mut vm, "1 + 1").unwrap();
        assert!(equal(vm.heap(), v, make_integral(2, 32, true).unwrap()));
    }
}

#[test]
fn test_prelude_helpers() {
    let (mut vm, mut c) = fresh();
    let e = c
        .execute_statement(&mut vm, "error(\"boom\");")
        .unwrap_err();
    match e {
        JabError::Exception(exc) => {
            assert_eq!(
                jab_runtime::exception::exception_msg(vm.heap(), exc).as_deref(),
                Some("boom")
            );
        }
        other => panic!("expected an exception, got {:?}", other),
    }
}
