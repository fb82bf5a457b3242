//! Programs assembled with [`MethodBuilder`], installed as methods of **Integer** and run on
//! an integer receiver.

use anyhow::{anyhow, bail, Error};
use bluebook_value::Oop;

use crate::builder::MethodBuilder;
use crate::interpreter::Interpreter;
use crate::universe::Universe;

pub struct Demo {
    /// What the command line calls it.
    pub name: &'static str,
    /// The unary selector it is installed under.
    pub selector: &'static str,
    pub summary: &'static str,
    build: fn() -> MethodBuilder,
}

pub static DEMOS: &[Demo] = &[
    Demo {
        name: "fib",
        selector: "fib",
        summary: "doubly recursive Fibonacci numbers",
        build: fib,
    },
    Demo {
        name: "factorial",
        selector: "factorial",
        summary: "recursive factorial, overflowing into large integers",
        build: factorial,
    },
    Demo {
        name: "sum",
        selector: "sumTo",
        summary: "sum of 1 to n with an inlined loop",
        build: sum_to,
    },
    Demo {
        name: "squares",
        selector: "sumOfSquares",
        summary: "sum of the first n squares, through to:do: and a block",
        build: sum_of_squares,
    },
    Demo {
        name: "churn",
        selector: "churn",
        summary: "allocates n arrays, answers the last index stored",
        build: churn,
    },
    Demo {
        name: "escape",
        selector: "firstSquareAbove",
        summary: "smallest k whose square exceeds n, returned from inside a block",
        build: first_square_above,
    },
];

pub fn find(name: &str) -> Option<&'static Demo> {
    DEMOS.iter().find(|demo| demo.name == name)
}

impl Demo {
    pub fn method(&self) -> MethodBuilder {
        (self.build)()
    }
}

/// Installs every demo in **Integer**. Demos may call each other.
pub fn install_all(universe: &mut Universe, interpreter: &mut Interpreter) -> Result<(), Error> {
    let integer = universe.core.integer_class;
    for demo in DEMOS {
        universe.push_remappable(integer);
        let installed = demo.method().install(universe, interpreter, integer, demo.selector);
        universe.pop_remappable();
        installed?;
    }
    Ok(())
}

/// Installs the demos and sends the named one to `argument`.
pub fn run(universe: &mut Universe, interpreter: &mut Interpreter, name: &str, argument: i64) -> Result<Oop, Error> {
    let demo = find(name).ok_or_else(|| anyhow!("no demo program named {name}"))?;
    let Some(receiver) = Oop::try_from_small_integer(argument) else {
        bail!("{argument} is not a small integer");
    };
    install_all(universe, interpreter)?;
    interpreter.send_message(universe, receiver, demo.selector, &[])
}

/// `self < 2 ifTrue: [^self]. ^(self - 1) fib + (self - 2) fib`
fn fib() -> MethodBuilder {
    let mut b = MethodBuilder::new(0);
    let recurse = b.new_label();
    b.push_self().push_integer(2).send("<", 1).jump_if_false(recurse).return_self();
    b.bind(recurse);
    b.push_self().push_integer(1).send("-", 1).send("fib", 0);
    b.push_self().push_integer(2).send("-", 1).send("fib", 0);
    b.send("+", 1).return_top();
    b
}

/// `self <= 1 ifTrue: [^1]. ^self * (self - 1) factorial`
fn factorial() -> MethodBuilder {
    let mut b = MethodBuilder::new(0);
    let recurse = b.new_label();
    b.push_self().push_integer(1).send("<=", 1).jump_if_false(recurse);
    b.push_integer(1).return_top();
    b.bind(recurse);
    b.push_self().push_self().push_integer(1).send("-", 1).send("factorial", 0);
    b.send("*", 1).return_top();
    b
}

/// `| sum i | sum := 0. i := 1. [i <= self] whileTrue: [sum := sum + i. i := i + 1]. ^sum`
fn sum_to() -> MethodBuilder {
    let (sum, i) = (0, 1);
    let mut b = MethodBuilder::new(0);
    b.temporaries(2);
    b.push_integer(0).pop_into_temp(sum).push_integer(1).pop_into_temp(i);
    b.while_true(
        |b| {
            b.push_temp(i).push_self().send("<=", 1);
        },
        |b| {
            b.push_temp(sum).push_temp(i).send("+", 1).pop_into_temp(sum);
            b.push_temp(i).push_integer(1).send("+", 1).pop_into_temp(i);
        },
    );
    b.push_temp(sum).return_top();
    b
}

/// `| total | total := 0. 1 to: self do: [:k | total := total + (k * k)]. ^total`
fn sum_of_squares() -> MethodBuilder {
    let (total, k) = (0, 1);
    let mut b = MethodBuilder::new(0);
    b.temporaries(2);
    b.push_integer(0).pop_into_temp(total);
    b.push_integer(1).push_self().block(1, |b| {
        b.pop_into_temp(k);
        b.push_temp(total).push_temp(k).push_temp(k).send("*", 1).send("+", 1);
        b.dup().pop_into_temp(total).block_return();
    });
    b.send("to:do:", 2).pop();
    b.push_temp(total).return_top();
    b
}

/// `| last | 1 to: self do: [:k | last := Array new: 10. last at: 1 put: k]. ^last at: 1`
fn churn() -> MethodBuilder {
    let (last, k) = (0, 1);
    let mut b = MethodBuilder::new(0);
    b.temporaries(2);
    b.push_integer(1).push_self().block(1, |b| {
        b.pop_into_temp(k);
        b.push_global("Array").push_integer(10).send("new:", 1).pop_into_temp(last);
        b.push_temp(last).push_integer(1).push_temp(k).send("at:put:", 2).block_return();
    });
    b.send("to:do:", 2).pop();
    b.push_temp(last).push_integer(1).send("at:", 1).return_top();
    b
}

/// `1 to: self do: [:k | k * k > self ifTrue: [^k]]. ^nil`
fn first_square_above() -> MethodBuilder {
    let k = 0;
    let mut b = MethodBuilder::new(0);
    b.temporaries(1);
    b.push_integer(1).push_self().block(1, |b| {
        let keep_going = b.new_label();
        b.pop_into_temp(k);
        b.push_temp(k).push_temp(k).send("*", 1).push_self().send(">", 1).jump_if_false(keep_going);
        b.push_temp(k).return_top();
        b.bind(keep_going);
        b.push_nil().block_return();
    });
    b.send("to:do:", 2).pop().return_nil();
    b
}
