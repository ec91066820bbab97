use std::rc::Rc;

use drift::runtime::builtins::SharedBuffer;
use drift::runtime::{Frame, FrameRef, RuntimeError, RuntimeErrorKind, Value, Vm, VmConfig};

fn run(source: &str) -> FrameRef {
    match drift::run(source) {
        Ok(frame) => frame,
        Err(e) => panic!("program failed: {}\n{}", e, source),
    }
}

fn run_err(source: &str) -> RuntimeError {
    run_err_with(Vm::new(), source)
}

fn run_err_with(mut vm: Vm, source: &str) -> RuntimeError {
    let code = drift::compile(source).unwrap();
    match vm.run(code) {
        Ok(_) => panic!("program succeeded:\n{}", source),
        Err(e) => e,
    }
}

fn output(source: &str) -> String {
    let buf = SharedBuffer::new();
    let mut vm = Vm::new();
    vm.set_output(Box::new(buf.clone()));
    vm.run(drift::compile(source).unwrap()).unwrap();
    buf.contents()
}

fn int(frame: &FrameRef, name: &str) -> i64 {
    match frame.borrow().get(name) {
        Some(Value::Int(n)) => n,
        other => panic!("{} is not an int: {:?}", name, other),
    }
}

fn string(frame: &FrameRef, name: &str) -> String {
    match frame.borrow().get(name) {
        Some(Value::Str(s)) => s,
        other => panic!("{} is not a string: {:?}", name, other),
    }
}

#[test]
fn test_precedence() {
    let frame = run("x int = 1 + 2 * 3\ny int = (1 + 2) * 3");
    assert_eq!(int(&frame, "x"), 7);
    assert_eq!(int(&frame, "y"), 9);
}

#[test]
fn test_assignment() {
    let frame = run("x int = 5; x = x + 1;");
    assert_eq!(int(&frame, "x"), 6);
}

#[test]
fn test_type_mismatch_leaves_binding_untouched() {
    let code = drift::compile("x int = 5\nx = \"six\"\ny int = 1").unwrap();
    let frame = Frame::program(Rc::new(code));
    let err = Vm::new().run_in(&frame).unwrap_err();

    assert!(matches!(err.kind, RuntimeErrorKind::TypeMismatch { .. }));
    assert_eq!(err.line, Some(2));
    assert!(matches!(frame.borrow().get("x"), Some(Value::Int(5))));
    assert!(frame.borrow().get("y").is_none());
}

#[test]
fn test_store_rejects_before_binding() {
    let code = drift::compile("s int = \"a\"").unwrap();
    let frame = Frame::program(Rc::new(code));
    let err = Vm::new().run_in(&frame).unwrap_err();
    assert_eq!(err.to_string(), "vm 1: expect type <int>, but found string \"a\"");
    assert!(frame.borrow().get("s").is_none());
}

#[test]
fn test_int_widens_to_float() {
    let frame = run("f float = 2\nf += 1");
    assert!(matches!(frame.borrow().get("f"), Some(Value::Float(v)) if v == 3.0));
}

#[test]
fn test_for_loop_with_guards() {
    let source = "\
total int = 0
count int = 0
for i int = 0; i < 10; i += 1
    out i == 7
    go i % 2 == 0
    total += i
    count += 1
";
    let frame = run(source);
    assert_eq!(count_of(&frame), 3);
    assert_eq!(int(&frame, "total"), 1 + 3 + 5);
}

fn count_of(frame: &FrameRef) -> i64 {
    int(frame, "count")
}

#[test]
fn test_aop_loops() {
    let frame = run("i int = 0\naop i < 5\n    i += 1\nn int = 0\naop ->\n    n += 1\n    out n == 3");
    assert_eq!(int(&frame, "i"), 5);
    assert_eq!(int(&frame, "n"), 3);
}

#[test]
fn test_if_chain() {
    let source = "\
def (n int) sign -> string
    if n < 0
        ret \"neg\"
    ef n == 0
        ret \"zero\"
    nf
        ret \"pos\"
a string = sign(-5)
b string = sign(0)
c string = sign(9)
";
    let frame = run(source);
    assert_eq!(string(&frame, "a"), "neg");
    assert_eq!(string(&frame, "b"), "zero");
    assert_eq!(string(&frame, "c"), "pos");
}

#[test]
fn test_recursion() {
    let source = "\
def (n int) fib -> int
    if n < 2
        ret n
    ret fib(n - 1) + fib(n - 2)
r int = fib(15)
";
    assert_eq!(int(&run(source), "r"), 610);
}

#[test]
fn test_call_depth_limit() {
    let source = "def (n int) down -> int\n    ret down(n + 1)\ndown(0)";
    let vm = Vm::with_config(VmConfig::default().with_max_call_depth(50));
    let err = run_err_with(vm, source);
    assert_eq!(err.kind, RuntimeErrorKind::StackOverflow(50));
    assert!(err.call_stack.iter().all(|c| c == "in 'down'"));
}

#[test]
fn test_default_call_depth_is_a_runtime_error() {
    let source = "def (n int) down -> int\n    ret down(n + 1)\ndown(0)";
    let err = run_err(source);
    assert_eq!(err.kind, RuntimeErrorKind::StackOverflow(1000));
    assert!(err.call_stack.len() >= 999);
}

#[test]
fn test_step_limit() {
    let vm = Vm::with_config(VmConfig::default().with_max_steps(500));
    let err = run_err_with(vm, "n int = 0\naop ->\n    n += 1");
    assert!(matches!(err.kind, RuntimeErrorKind::LimitExceeded(_)));
}

#[test]
fn test_stack_size_limit() {
    let vm = Vm::with_config(VmConfig::default().with_max_stack_size(2));
    let err = run_err_with(vm, "x int = 1 + (2 + (3 + 4))");
    assert!(matches!(err.kind, RuntimeErrorKind::LimitExceeded(ref m) if m.contains("stack size")));
}

#[test]
fn test_arity_and_variadics() {
    let source = "\
def (first int, rest ...int) total -> int
    sum int = first
    for i int = 0; i < len(rest); i += 1
        sum += rest[i]
    ret sum
a int = total(1, 2, 3, 4)
b int = total(5)
";
    let frame = run(source);
    assert_eq!(int(&frame, "a"), 10);
    assert_eq!(int(&frame, "b"), 5);

    let err = run_err("def (a int, b int) add -> int\n    ret a + b\nadd(1)");
    assert_eq!(
        err.kind,
        RuntimeErrorKind::ArityMismatch {
            name: "add".to_string(),
            expected: "2".to_string(),
            found: 1,
        }
    );
    let err = run_err("def (rest ...int) f\n    ret\nf(\"x\")");
    assert!(matches!(err.kind, RuntimeErrorKind::TypeMismatch { .. }));
}

#[test]
fn test_missing_return_value() {
    let err = run_err("def () f -> int\n    ret\nf()");
    assert!(err.to_string().contains("function 'f' missing return value"));
}

#[test]
fn test_function_types() {
    let source = "\
def (a int, b int) add -> int
    ret a + b
def (f |int, int| -> int, x int) apply -> int
    ret f(x, x)
r int = apply(add, 5)
";
    assert_eq!(int(&run(source), "r"), 10);

    let err = run_err(
        "def (a int) inc -> int\n    ret a + 1\ndef (f |int, int| -> int) use_it\n    ret\nuse_it(inc)",
    );
    assert!(matches!(err.kind, RuntimeErrorKind::TypeMismatch { .. }));
}

#[test]
fn test_generic_function_binds_on_first_use() {
    let source = "\
def <T> (a T, b T) first -> T
    ret a
x int = first(1, 2)
s string = first(\"a\", \"b\")
";
    let frame = run(source);
    assert_eq!(int(&frame, "x"), 1);
    assert_eq!(string(&frame, "s"), "a");

    let err = run_err("def <T> (a T, b T) first -> T\n    ret a\nfirst(1, \"a\")");
    assert_eq!(
        err.kind,
        RuntimeErrorKind::GenericMismatch {
            name: "T".to_string(),
            expected: "<int>".to_string(),
            found: "string \"a\"".to_string(),
        }
    );
}

#[test]
fn test_generic_constraint() {
    let ok = run("def <N: int | float> (a N) twice -> N\n    ret a * 2\nx int = twice(4)");
    assert_eq!(int(&ok, "x"), 8);

    let err = run_err("def <N: int | float> (a N) twice -> N\n    ret a * 2\ntwice(\"s\")");
    assert!(matches!(err.kind, RuntimeErrorKind::GenericMismatch { .. }));
}

const POINT: &str = "\
def Point def
    x int = 0
    y int = 0
    def () sum -> int
        ret x + y
    def (dx int) shift
        x += dx
";

#[test]
fn test_classes() {
    let source = format!(
        "{}p Point = new Point{{x: 3, y: 4}}\ns int = p.sum()\np.shift(10)\nt int = p.sum()\np.y = 1\nu int = p.y\n",
        POINT
    );
    let frame = run(&source);
    assert_eq!(int(&frame, "s"), 7);
    assert_eq!(int(&frame, "t"), 17);
    assert_eq!(int(&frame, "u"), 1);
}

#[test]
fn test_instances_do_not_share_fields() {
    let source = format!(
        "{}a Point = new Point{{}}\nb Point = new Point{{x: 1}}\na.shift(5)\nax int = a.x\nbx int = b.x\n",
        POINT
    );
    let frame = run(&source);
    assert_eq!(int(&frame, "ax"), 5);
    assert_eq!(int(&frame, "bx"), 1);
}

#[test]
fn test_class_member_errors() {
    let err = run_err(&format!("{}p Point = new Point{{z: 1}}", POINT));
    assert!(matches!(err.kind, RuntimeErrorKind::UnknownMember { .. }));

    let err = run_err(&format!("{}p Point = new Point{{}}\np.y = \"no\"", POINT));
    assert!(matches!(err.kind, RuntimeErrorKind::TypeMismatch { .. }));

    let err = run_err(&format!("{}n int = Point.x", POINT));
    assert_eq!(err.kind, RuntimeErrorKind::Uninitialized("class Point".to_string()));
}

#[test]
fn test_generic_class() {
    let source = "\
def <T> Box def
    v T = nil
    def (x T) put
        v = x
b Box = new Box{v: 1}
b.put(5)
got int = b.v
";
    assert_eq!(int(&run(source), "got"), 5);

    let err = run_err(
        "def <T> Box def\n    v T = nil\n    def (x T) put\n        v = x\nb Box = new Box{v: 1}\nb.put(\"s\")",
    );
    assert!(matches!(err.kind, RuntimeErrorKind::GenericMismatch { .. }));
}

const SHAPE: &str = "\
def Shape
    \\\\ area -> float
    \\float\\ grow
";

#[test]
fn test_interface_satisfied() {
    let source = format!(
        "{}def Square def
    side float = 0.0
    def () area -> float
        ret side * side
    def (by float) grow
        side += by
s Shape = new Square{{side: 2}}
s.grow(1.0)
a float = s.area()
",
        SHAPE
    );
    let frame = run(&source);
    assert!(matches!(frame.borrow().get("a"), Some(Value::Float(v)) if v == 9.0));
}

#[test]
fn test_interface_violation() {
    let source = format!(
        "{}def Circle def
    r float = 1.0
    def () area -> float
        ret r * r * 3.0
s Shape = new Circle{{}}
",
        SHAPE
    );
    let err = run_err(&source);
    assert_eq!(
        err.kind,
        RuntimeErrorKind::InterfaceViolation {
            interface: "Shape".to_string(),
            class: "Circle".to_string(),
            reason: "missing method 'grow'".to_string(),
        }
    );
}

#[test]
fn test_interface_signature_must_match() {
    let source = format!(
        "{}def Odd def
    def () area -> int
        ret 1
    def (by float) grow
        ret
s Shape = new Odd{{}}
",
        SHAPE
    );
    let err = run_err(&source);
    assert!(matches!(err.kind, RuntimeErrorKind::InterfaceViolation { .. }));
    assert!(err.to_string().contains("method 'area' returns <int>, expected <float>"));
}

#[test]
fn test_unbound_interface() {
    let err = run_err(&format!("{}s Shape = nil\ns.area()", SHAPE));
    assert_eq!(err.kind, RuntimeErrorKind::Uninitialized("interface Shape".to_string()));
}

#[test]
fn test_enums() {
    let source = "def Color\n    Red Green\n    Blue\nc Color = Color.Blue\nr int = Color.Red";
    let frame = run(source);
    assert_eq!(int(&frame, "c"), 2);
    assert_eq!(int(&frame, "r"), 0);

    let err = run_err("def Color\n    Red\nc Color = 4");
    assert!(matches!(err.kind, RuntimeErrorKind::TypeMismatch { .. }));
    let err = run_err("def Color\n    Red\nc int = Color.Purple");
    assert!(matches!(err.kind, RuntimeErrorKind::UnknownMember { .. }));
}

#[test]
fn test_arrays() {
    let frame = run("def a [int] = [1, 2]\na[2] = 3\na[0] += 10\nn int = len(a)\nfirst int = a[0]");
    assert_eq!(int(&frame, "n"), 3);
    assert_eq!(int(&frame, "first"), 11);

    let err = run_err("def a [int] = [1]\na[5] = 1");
    assert_eq!(err.kind, RuntimeErrorKind::IndexOutOfBounds { index: 5, len: 1 });
    let err = run_err("def a [int] = [1]\na[0] = \"x\"");
    assert!(matches!(err.kind, RuntimeErrorKind::TypeMismatch { .. }));
    let err = run_err("def a [int] = [1, \"x\"]");
    assert!(matches!(err.kind, RuntimeErrorKind::TypeMismatch { .. }));
}

#[test]
fn test_widening_leaves_the_source_alone() {
    let frame = run("def a [int] = [1]\ndef b [float] = a\nt string = typeof(a[0])\nu string = typeof(b[0])\na[1] = 2");
    assert_eq!(string(&frame, "t"), "int");
    assert_eq!(string(&frame, "u"), "float");
    let err = run_err("def a [int] = [1]\ndef b [float] = a\na[0] = 1.5");
    assert!(matches!(err.kind, RuntimeErrorKind::TypeMismatch { .. }));

    let frame = run("def a [int] = [1]\ndef b [int] = a\nb[0] = 5\nx int = a[0]");
    assert_eq!(int(&frame, "x"), 5);
}

#[test]
fn test_self_containing_array() {
    assert_eq!(output("def a [any] = []\na[0] = a\nprint(a)\nprint(len(a))"), "[[...]]\n1\n");
}

#[test]
fn test_tuples() {
    let frame = run("def t (int) = (4, 5)\na int = t.0\nb int = t[1]\nn int = len(t)");
    assert_eq!(int(&frame, "a"), 4);
    assert_eq!(int(&frame, "b"), 5);
    assert_eq!(int(&frame, "n"), 2);

    let err = run_err("def t (int) = (4, 5)\nt[0] = 1");
    assert!(matches!(err.kind, RuntimeErrorKind::UnsupportedOperand(_)));
}

#[test]
fn test_maps() {
    let frame = run("m {string : int} = {\"a\": 1}\nm[\"b\"] = 2\nm[\"a\"] += 5\na int = m[\"a\"]\nn int = len(m)");
    assert_eq!(int(&frame, "a"), 6);
    assert_eq!(int(&frame, "n"), 2);

    let err = run_err("m {string : int} = {\"a\": 1}\nx int = m[\"zz\"]");
    assert!(matches!(err.kind, RuntimeErrorKind::KeyNotFound(_)));
    let err = run_err("m {string : int} = {\"a\": 1}\nm[\"b\"] = true");
    assert!(matches!(err.kind, RuntimeErrorKind::TypeMismatch { .. }));
}

#[test]
fn test_strings() {
    let frame = run("s string = \"ab\" + \"cd\"\nc char = s[2]\nn int = len(s)\nk string = typeof(c)");
    assert_eq!(string(&frame, "s"), "abcd");
    assert!(matches!(frame.borrow().get("c"), Some(Value::Char('c'))));
    assert_eq!(int(&frame, "n"), 4);
    assert_eq!(string(&frame, "k"), "char");
}

#[test]
fn test_print_output() {
    let out = output("print(1, 2.5, \"hi\", 'c', true, nil)\nprint([1, 2], (1,), {\"a\": 1})\nprint()");
    assert_eq!(out, "1\t2.5\thi\tc\ttrue\tnil\n[1, 2]\t(1,)\t{a: 1}\n\n");
}

#[test]
fn test_print_values_of_definitions() {
    let out = output(&format!("{}p Point = new Point{{}}\nprint(Point, p, print)", POINT));
    assert_eq!(out, "<class Point>\t<Point object>\t<builtin print>\n");
}

#[test]
fn test_runtime_faults() {
    assert_eq!(run_err("x float = 1 / 0").kind, RuntimeErrorKind::DivisionByZero);
    assert_eq!(
        run_err("x int = y").kind,
        RuntimeErrorKind::UndefinedName("y".to_string())
    );
    assert!(matches!(
        run_err("x int = 1 + \"a\"").kind,
        RuntimeErrorKind::UnsupportedOperand(_)
    ));
    assert!(matches!(run_err("x int = 3\nx()").kind, RuntimeErrorKind::UnsupportedOperand(_)));
}

#[test]
fn test_error_reports_line_and_calls() {
    let source = "\
def (n int) inner -> int
    ret n / 0
def (n int) outer -> float
    ret inner(n)
outer(1)
";
    let err = run_err(source);
    assert_eq!(err.line, Some(2));
    assert_eq!(err.call_stack, vec!["in 'inner'".to_string(), "in 'outer'".to_string()]);
}

#[test]
fn test_functions_see_program_globals() {
    let source = "\
limit int = 3
def () bump
    limit += 1
bump()
bump()
";
    assert_eq!(int(&run(source), "limit"), 5);
}
