// File: tests/interpreter_tests.rs
//
// End-to-end language tests driven through the public VM interface.
// Results are observed through top-level globals, which the VM exposes
// for exactly this purpose (and for the REPL).

use aria::errors::InterpretResult;
use aria::value::Value;
use aria::vm::Vm;

fn run(source: &str) -> Vm {
    let mut vm = Vm::new();
    let result = vm.interpret(source);
    assert_eq!(result, InterpretResult::Success, "program failed: {}", source);
    vm
}

fn number(vm: &Vm, name: &str) -> f64 {
    match vm.get_global(name) {
        Some(Value::Number(n)) => n,
        other => panic!("global '{}' is not a number: {:?}", name, other),
    }
}

fn string(vm: &Vm, name: &str) -> String {
    match vm.get_global(name) {
        Some(Value::Obj(r)) => vm.heap.string(r).to_string(),
        other => panic!("global '{}' is not a string: {:?}", name, other),
    }
}

#[test]
fn arithmetic_expression() {
    let vm = run("var r = 1 + 2 * 3;");
    assert_eq!(number(&vm, "r"), 7.0);
}

#[test]
fn counting_for_loop() {
    let vm = run("var a = 0; for (var i = 0; i < 5; i = i + 1) a = a + i;");
    assert_eq!(number(&vm, "a"), 10.0);
}

#[test]
fn closure_counter() {
    let vm = run(
        "fun make() {
             var x = 0;
             fun inc() { x = x + 1; return x; }
             return inc;
         }
         var c = make();
         var first = c();
         var second = c();
         var third = c();",
    );
    assert_eq!(number(&vm, "first"), 1.0);
    assert_eq!(number(&vm, "second"), 2.0);
    assert_eq!(number(&vm, "third"), 3.0);
}

#[test]
fn inheritance_with_super_init() {
    let vm = run(
        "class A { init(n) { this.n = n; } }
         class B : A { init(n) { super.init(n + 1); } }
         var r = B(10).n;",
    );
    assert_eq!(number(&vm, "r"), 11.0);
}

#[test]
fn map_iteration_sums_values() {
    let vm = run(
        "var m = {\"a\": 1, \"b\": 2};
         var s = 0;
         for (var kv in m) s = s + kv[1];",
    );
    assert_eq!(number(&vm, "s"), 3.0);
}

#[test]
fn try_catch_binds_thrown_value() {
    let vm = run("var r = nil; try { throw \"boom\"; } catch (e) { r = e; }");
    assert_eq!(string(&vm, "r"), "boom");
}

#[test]
fn nested_functions_and_recursion() {
    let vm = run(
        "fun fib(n) {
             if (n < 2) return n;
             return fib(n - 2) + fib(n - 1);
         }
         var r = fib(15);",
    );
    assert_eq!(number(&vm, "r"), 610.0);
}

#[test]
fn methods_and_fields_interact() {
    let vm = run(
        "class Point {
             init(x, y) { this.x = x; this.y = y; }
             manhattan() { return this.x + this.y; }
             shift(dx, dy) { this.x += dx; this.y += dy; }
         }
         var p = Point(3, 4);
         p.shift(1, 1);
         var r = p.manhattan();",
    );
    assert_eq!(number(&vm, "r"), 9.0);
}

#[test]
fn stress_collection_does_not_change_behaviour() {
    let source = "
        fun worker(n) {
            var parts = [];
            for (var i = 0; i < n; i = i + 1) {
                parts.append({\"idx\": i, \"text\": \"v\" + str(i)});
            }
            return parts;
        }
        var rows = worker(25);
        var count = rows.size();
        var sample = rows[10][\"text\"];
    ";
    let mut plain = Vm::new();
    assert_eq!(plain.interpret(source), InterpretResult::Success);

    let mut stressed = Vm::new();
    stressed.heap.set_stress(true);
    assert_eq!(stressed.interpret(source), InterpretResult::Success);

    for vm in [&plain, &stressed] {
        assert_eq!(number(vm, "count"), 25.0);
        assert_eq!(string(vm, "sample"), "v10");
    }
}

#[test]
fn imported_module_runs_once_and_is_cached() {
    let dir = std::env::temp_dir().join("aria_integration_import");
    let _ = std::fs::create_dir_all(&dir);
    std::fs::write(
        dir.join("mathlib.aria"),
        "var calls = 0;\ncalls = calls + 1;\nfun double(x) { return x * 2; }\n",
    )
    .unwrap();
    let main = dir.join("main.aria");
    std::fs::write(
        &main,
        "import mathlib;\nimport mathlib as ml;\nvar a = mathlib.double(21);\nvar b = ml.calls;\n",
    )
    .unwrap();

    let mut vm = Vm::new();
    let source = std::fs::read_to_string(&main).unwrap();
    let result = vm.interpret_file(main.to_str().unwrap(), &source);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(number(&vm, "a"), 42.0);
    assert_eq!(number(&vm, "b"), 1.0);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn string_literals_intern_to_one_object() {
    let vm = run("var same = \"hello\" == \"hel\" + \"lo\";");
    assert_eq!(vm.get_global("same"), Some(Value::Bool(true)));
}

#[test]
fn list_builtins_compose() {
    let vm = run(
        "var l = [];
         for (var i = 0; i < 5; i = i + 1) l.append(i * i);
         l.remove(0);
         var r = l.at(0) + l.at(3);",
    );
    assert_eq!(number(&vm, "r"), 17.0);
}
