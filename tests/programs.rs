use pretty_assertions::assert_eq;
use rslox::{InterpretError, Vm, VmConfig};

fn run_with(vm: &mut Vm, source: &str) -> Result<String, InterpretError> {
    let mut out = Vec::new();
    vm.interpret(source, &mut out)?;
    Ok(String::from_utf8(out).expect("output is utf-8"))
}

// Run under both the default collector and the one that collects on every allocation; both must print the same.
fn run(source: &str) -> String {
    let normal = run_with(&mut Vm::new(), source).unwrap_or_else(|e| panic!("{}", e));
    let stressed =
        run_with(&mut Vm::with_config(VmConfig::stress_gc()), source).unwrap_or_else(|e| panic!("{}", e));
    assert_eq!(normal, stressed);
    normal
}

#[test]
fn counter() {
    let source = r#"
        fun makeCounter() {
            var i = 0;
            fun count() {
                i = i + 1;
                print i;
            }
            return count;
        }
        var c = makeCounter();
        c();
        c();
    "#;
    assert_eq!(run(source), "1\n2\n");
}

#[test]
fn counters_are_independent() {
    let source = r#"
        fun makeCounter() {
            var i = 0;
            fun count() { i = i + 1; return i; }
            return count;
        }
        var a = makeCounter();
        var b = makeCounter();
        a(); a();
        print a();
        print b();
    "#;
    assert_eq!(run(source), "3\n1\n");
}

#[test]
fn closures_from_one_call_share_state() {
    let source = r#"
        var get;
        var set;
        fun make() {
            var shared = "initial";
            fun g() { return shared; }
            fun s(v) { shared = v; }
            get = g;
            set = s;
        }
        make();
        print get();
        set("updated");
        print get();
    "#;
    assert_eq!(run(source), "initial\nupdated\n");
}

#[test]
fn upvalue_keeps_last_value_after_return() {
    let source = r#"
        fun outer() {
            var x = "before";
            fun inner() { print x; }
            x = "after";
            return inner;
        }
        outer()();
    "#;
    assert_eq!(run(source), "after\n");
}

#[test]
fn loop_variables_close_per_block() {
    let source = r#"
        var first;
        var second;
        {
            var a = 1;
            fun f() { print a; }
            first = f;
        }
        {
            var a = 2;
            fun f() { print a; }
            second = f;
        }
        first();
        second();
    "#;
    assert_eq!(run(source), "1\n2\n");
}

#[test]
fn super_calls_go_to_the_immediate_superclass() {
    let source = r#"
        class A {
            method() { print "A method"; }
        }
        class B < A {
            method() { print "B method"; }
            test() { super.method(); }
        }
        class C < B {}
        C().test();
    "#;
    assert_eq!(run(source), "A method\n");
}

#[test]
fn overriding_and_super_through_a_further_override() {
    let source = r#"
        class A { name() { return "A"; } }
        class B < A {
            name() { return "B"; }
            parent() { return super.name(); }
            parentLater() { var m = super.name; return m(); }
        }
        class C < B { name() { return "C"; } }
        var c = C();
        print c.name();
        print c.parent();
        print c.parentLater();
        print B().name();
    "#;
    assert_eq!(run(source), "C\nA\nA\nB\n");
}

#[test]
fn fields_shadow_methods() {
    let source = r#"
        class Box {
            value() { return "method"; }
        }
        var b = Box();
        print b.value();
        fun replacement() { return "field"; }
        b.value = replacement;
        print b.value();
        b.value = 3;
        print b.value;
    "#;
    assert_eq!(run(source), "method\nfield\n3\n");
}

#[test]
fn initializers_and_bound_methods() {
    let source = r#"
        class Point {
            init(x, y) {
                this.x = x;
                this.y = y;
            }
            sum() { return this.x + this.y; }
        }
        var p = Point(1, 2);
        var s = p.sum;
        p.x = 10;
        print s();
        print p;
        print Point;
        print s;
        print p.init(3, 4) == p;
        print p.x;
    "#;
    assert_eq!(
        run(source),
        "12\nPoint instance\n<class Point>\n<fn sum>\ntrue\n3\n"
    );
}

#[test]
fn control_flow() {
    let source = r#"
        var total = 0;
        for (var i = 0; i < 10; i = i + 1) {
            if (i == 3) total = total + 100;
            else total = total + i;
        }
        print total;
        var n = 0;
        while (n < 5) n = n + 2;
        print n;
        print false or nil;
        print 1 and 2;
    "#;
    assert_eq!(run(source), "142\n6\nnil\n2\n");
}

#[test]
fn string_building_under_collection_pressure() {
    let source = r#"
        var s = "";
        for (var i = 0; i < 50; i = i + 1) {
            s = s + "ab";
        }
        var again = "";
        for (var i = 0; i < 50; i = i + 1) {
            again = again + "ab";
        }
        print s == again;
    "#;
    assert_eq!(run(source), "true\n");
}

#[test]
fn captured_upvalue_survives_unrelated_allocations() {
    let source = r#"
        fun make() {
            var kept = "kept " + "alive";
            fun read() { return kept; }
            return read;
        }
        var read = make();
        for (var i = 0; i < 200; i = i + 1) {
            var garbage = "garbage " + "string";
        }
        print read();
    "#;
    assert_eq!(run(source), "kept alive\n");
}

#[test]
fn collection_frees_exactly_the_unreachable() {
    let mut vm = Vm::new();
    run_with(&mut vm, "var keep = nil;").unwrap();
    vm.collect_garbage();
    let baseline = vm.heap().object_count();

    run_with(
        &mut vm,
        r#"
        class Node { init(next) { this.next = next; } }
        var list = nil;
        for (var i = 0; i < 20; i = i + 1) list = Node(list);
        keep = Node(nil);
        list = nil;
        "#,
    )
    .unwrap();
    vm.collect_garbage();
    // The list itself is gone. What's left is reachable from the globals `Node`, `list` and `keep`.
    let survivors = [
        "\"Node\"",
        "class Node",
        "init closure",
        "init function",
        "\"next\"",
        "instance in keep",
        "\"list\"",
    ];
    assert_eq!(vm.heap().object_count(), baseline + survivors.len());
}

#[test]
fn too_many_constants_is_a_compile_error() {
    let source: String = (0..257).map(|i| format!("print {};\n", i)).collect();
    let mut vm = Vm::new();
    match run_with(&mut vm, &source) {
        Err(InterpretError::Compile(e)) => {
            assert_eq!(e.messages(), vec!["Too many constants in one chunk."]);
        }
        other => panic!("expected a compile error, got {:?}", other),
    }
}

#[test]
fn too_many_parameters_is_a_compile_error() {
    let params: Vec<String> = (0..257).map(|i| format!("a{}", i)).collect();
    let source = format!("fun f({}) {{}}", params.join(", "));
    let mut vm = Vm::new();
    match run_with(&mut vm, &source) {
        Err(InterpretError::Compile(e)) => {
            assert_eq!(e.messages(), vec!["Can't have more than 255 parameters."]);
        }
        other => panic!("expected a compile error, got {:?}", other),
    }
}

#[test]
fn nothing_runs_when_compilation_fails() {
    let mut vm = Vm::new();
    let mut out = Vec::new();
    let err = vm
        .interpret("print \"first\";\nprint ;\nprint 1 +;", &mut out)
        .unwrap_err();
    assert!(out.is_empty());
    assert_eq!(
        err.to_string(),
        "[line 2] Error at ';': Expect expression.\n[line 3] Error at ';': Expect expression."
    );
}

#[test]
fn runtime_error_trace() {
    let source = "fun a() { b(); }\nfun b() { c(); }\nfun c() {\n  c(\"too\", \"many\");\n}\n\na();";
    let mut vm = Vm::new();
    let err = run_with(&mut vm, source).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Expected 0 arguments but got 2.\n\
         [line 4] in c()\n\
         [line 2] in b()\n\
         [line 1] in a()\n\
         [line 7] in script"
    );
}
