use bluebook_interpreter::debug::disassembler::disassemble;
use bluebook_interpreter::demos::{self, DEMOS};
use bluebook_interpreter::universe::{Universe, UniverseConfig};
use rstest::rstest;

fn bootstrap() -> (Universe, bluebook_interpreter::interpreter::Interpreter) {
    Universe::bootstrap(UniverseConfig::default()).expect("could not bootstrap a test universe")
}

#[rstest]
#[case("fib", 20, "6765")]
#[case("fib", 1, "1")]
#[case("factorial", 10, "3628800")]
#[case("factorial", 30, "265252859812191058636308480000000")]
#[case("sum", 100, "5050")]
#[case("sum", 0, "0")]
#[case("squares", 10, "385")]
#[case("churn", 1000, "1000")]
#[case("escape", 25, "6")]
#[case("escape", 0, "nil")]
fn demo_results(#[case] name: &str, #[case] argument: i64, #[case] expected: &str) {
    let (mut universe, mut interpreter) = bootstrap();
    let result = demos::run(&mut universe, &mut interpreter, name, argument).unwrap();
    assert_eq!(universe.describe(result), expected);
    assert!(interpreter.active_context().is_null());
}

#[test]
fn unknown_demo_is_an_error() {
    let (mut universe, mut interpreter) = bootstrap();
    assert!(demos::run(&mut universe, &mut interpreter, "nonsense", 1).is_err());
}

#[test]
fn demo_names_are_unique() {
    for (index, demo) in DEMOS.iter().enumerate() {
        assert!(DEMOS[index + 1..].iter().all(|other| other.name != demo.name), "{}", demo.name);
        assert!(std::ptr::eq(demos::find(demo.name).unwrap(), demo));
    }
}

#[test]
fn fib_disassembles() {
    let (mut universe, mut interpreter) = bootstrap();
    demos::install_all(&mut universe, &mut interpreter).unwrap();
    let selector = universe.symbol("fib").unwrap();
    let method = universe.lookup_method(universe.core.integer_class, selector).unwrap();

    let listing = disassemble(&universe, method);
    let lines: Vec<&str> = listing.lines().collect();
    assert!(lines[0].starts_with("; 0 args, 0 temps, stack depth"), "{listing}");
    assert!(lines[1].trim_start().starts_with("0 "), "{listing}");
    assert!(lines[1].contains("PUSH_SELF"), "{listing}");
    assert!(listing.contains("SEND_SPECIAL") && listing.contains("#<"), "{listing}");
    assert!(listing.contains("LONG_JUMP_IF_FALSE"), "{listing}");
    assert!(listing.contains("(to "), "{listing}");
    assert!(listing.lines().any(|line| line.contains("SEND ") && line.contains("#fib 0")), "{listing}");
    assert!(listing.lines().all(|line| line == line.trim_end()));
}

#[test]
fn block_bodies_are_indented() {
    let (mut universe, mut interpreter) = bootstrap();
    demos::install_all(&mut universe, &mut interpreter).unwrap();
    let selector = universe.symbol("sumOfSquares").unwrap();
    let method = universe.lookup_method(universe.core.integer_class, selector).unwrap();

    let listing = disassemble(&universe, method);
    assert!(listing.contains("CREATE_BLOCK"), "{listing}");
    let indented: Vec<&str> = listing.lines().filter(|line| line.contains("  |")).collect();
    assert!(indented.iter().any(|line| line.contains("BLOCK_RETURN")), "{listing}");
    assert!(!indented.iter().any(|line| line.contains("RETURN_TOP")), "{listing}");
    assert!(listing.contains("#to:do: 2"), "{listing}");
}

#[test]
fn primitive_and_trivial_methods_are_summarised() {
    let (universe, _interpreter) = bootstrap();
    let core = &universe.core;

    let plus = universe.symbol("+").unwrap();
    let method = universe.lookup_method(core.small_integer_class, plus).unwrap();
    let listing = disassemble(&universe, method);
    assert!(listing.lines().next().unwrap().contains("primitive 1"), "{listing}");
    assert!(listing.contains("SUPER_SEND"), "{listing}");

    let yourself = universe.symbol("yourself").unwrap();
    let method = universe.lookup_method(core.object_class, yourself).unwrap();
    assert!(disassemble(&universe, method).contains("answers self"));

    let not = universe.symbol("not").unwrap();
    let method = universe.lookup_method(core.true_class, not).unwrap();
    assert!(disassemble(&universe, method).contains("answers false"));
}
