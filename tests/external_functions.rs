//! External-function records: invocation order, boundary replay, and
//! release of user data.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use approx::assert_relative_eq;
use common::{leaf, Mul, Offset, Scale, Var};
use numbat::{LinearTape, ReuseTape};

/// Ten statements, a callback, ten more statements: the callback fires
/// exactly once, and both halves of the chain contribute to the input
/// adjoint.
#[test]
fn callback_fires_once_between_statement_halves() {
    let mut tape = LinearTape::<f64>::new();
    tape.set_active();

    let mut x = Var::passive(0.5);
    tape.register_input(&mut x.index);

    // t_{k+1} = t_k²/2 + 1/4, a contraction around its fixed point
    let mut t = x;
    for _ in 0..10 {
        let mut next = Var::passive(0.0);
        tape.store(
            &mut next.value,
            &mut next.index,
            &Offset(Scale(0.5, Mul(leaf(t), leaf(t))), 0.25),
        );
        t = next;
    }

    let count = Rc::new(RefCell::new(0));
    let count_in_cb = Rc::clone(&count);
    tape.push_external_function_handle(move |_| {
        *count_in_cb.borrow_mut() += 1;
    });

    for _ in 0..10 {
        let mut next = Var::passive(0.0);
        tape.store(
            &mut next.value,
            &mut next.index,
            &Offset(Scale(0.5, Mul(leaf(t), leaf(t))), 0.25),
        );
        t = next;
    }

    let mut val = 0.5;
    let mut deriv = 1.0;
    for _ in 0..20 {
        deriv *= val;
        val = 0.5 * val * val + 0.25;
    }

    tape.set_gradient(t.index, 1.0);
    tape.evaluate();
    assert_eq!(*count.borrow(), 1);
    assert_relative_eq!(tape.get_gradient(x.index), deriv, max_relative = 1e-10);
}

/// At callback time, statements recorded after the registration point have
/// already been propagated and earlier ones have not.
#[test]
fn callback_sees_replayed_upper_segment() {
    let mut tape = LinearTape::<f64>::new();
    tape.set_active();

    let mut x = Var::passive(2.0);
    tape.register_input(&mut x.index);

    // a = x·x, registered boundary, b = a·a
    let mut a = Var::passive(0.0);
    tape.store(&mut a.value, &mut a.index, &Mul(leaf(x), leaf(x)));

    let a_index = a.index;
    let x_index = x.index;
    let seen = Rc::new(RefCell::new((0.0, 0.0)));
    let seen_in_cb = Rc::clone(&seen);
    tape.push_external_function_handle(move |adjoints| {
        *seen_in_cb.borrow_mut() = (adjoints.get(a_index), adjoints.get(x_index));
    });

    let mut b = Var::passive(0.0);
    tape.store(&mut b.value, &mut b.index, &Mul(leaf(a), leaf(a)));

    tape.set_gradient(b.index, 1.0);
    tape.evaluate();

    let (a_adj_at_cb, x_adj_at_cb) = *seen.borrow();
    assert_relative_eq!(a_adj_at_cb, 2.0 * a.value); // db/da, already applied
    assert_relative_eq!(x_adj_at_cb, 0.0); // a = x·x not yet replayed
    assert_relative_eq!(tape.get_gradient(x.index), 4.0 * a.value * x.value);
}

/// Callbacks run in descending registration order.
#[test]
fn callbacks_run_in_descending_order() {
    let mut tape = LinearTape::<f64>::new();
    tape.set_active();

    let mut x = Var::passive(1.0);
    tape.register_input(&mut x.index);

    let order = Rc::new(RefCell::new(Vec::new()));
    for tag in 0..3 {
        let order_in_cb = Rc::clone(&order);
        tape.push_external_function_handle(move |_| {
            order_in_cb.borrow_mut().push(tag);
        });
        let mut t = Var::passive(0.0);
        tape.store(&mut t.value, &mut t.index, &Mul(leaf(x), leaf(x)));
    }

    tape.evaluate();
    assert_eq!(*order.borrow(), vec![2, 1, 0]);
}

/// Partial evaluation invokes only the callbacks inside the range.
#[test]
fn partial_evaluation_respects_range() {
    let mut tape = LinearTape::<f64>::new();
    tape.set_active();

    let mut x = Var::passive(1.0);
    tape.register_input(&mut x.index);

    let fired = Rc::new(RefCell::new(Vec::new()));

    let fired_early = Rc::clone(&fired);
    tape.push_external_function_handle(move |_| fired_early.borrow_mut().push("early"));

    let p = tape.position();
    let fired_late = Rc::clone(&fired);
    tape.push_external_function_handle(move |_| fired_late.borrow_mut().push("late"));
    let head = tape.position();

    tape.evaluate_between(&head, &p);
    assert_eq!(*fired.borrow(), vec!["late"]);
}

/// Typed state handed to the tape is passed back on every invocation.
#[test]
fn typed_callback_receives_its_data() {
    fn bump(counter: &mut Rc<RefCell<u32>>, _adjoints: &numbat::AdjointVector<f64>) {
        *counter.borrow_mut() += 1;
    }

    let count = Rc::new(RefCell::new(0));
    let mut tape = ReuseTape::<f64>::new();
    tape.set_active();
    tape.push_external_function(bump, Rc::clone(&count));

    tape.evaluate();
    tape.evaluate();
    assert_eq!(*count.borrow(), 2);
}

struct DropProbe {
    drops: Rc<RefCell<u32>>,
}

impl Drop for DropProbe {
    fn drop(&mut self) {
        *self.drops.borrow_mut() += 1;
    }
}

/// Rewinding over a record releases its data exactly once.
#[test]
fn rewind_releases_callback_data_once() {
    let drops = Rc::new(RefCell::new(0));
    let mut tape = LinearTape::<f64>::new();
    tape.set_active();

    let p = tape.position();
    let probe = DropProbe { drops: Rc::clone(&drops) };
    tape.push_external_function_handle(move |_| {
        let _ = &probe;
    });

    tape.reset_to(&p);
    assert_eq!(*drops.borrow(), 1);

    tape.reset();
    assert_eq!(*drops.borrow(), 1);
}

/// Dropping the tape releases data of records never rewound.
#[test]
fn tape_drop_releases_callback_data() {
    let drops = Rc::new(RefCell::new(0));
    {
        let mut tape = LinearTape::<f64>::new();
        tape.set_active();
        let probe = DropProbe { drops: Rc::clone(&drops) };
        tape.push_external_function_handle(move |_| {
            let _ = &probe;
        });
    }
    assert_eq!(*drops.borrow(), 1);
}

/// A record that survives evaluation is not released by it.
#[test]
fn evaluation_does_not_release_records() {
    let drops = Rc::new(RefCell::new(0));
    let mut tape = ReuseTape::<f64>::new();
    tape.set_active();

    let probe = DropProbe { drops: Rc::clone(&drops) };
    tape.push_external_function_handle(move |_| {
        let _ = &probe;
    });

    tape.evaluate();
    assert_eq!(*drops.borrow(), 0);
    tape.reset();
    assert_eq!(*drops.borrow(), 1);
}

/// Callback boundaries hold across external-function chunk boundaries.
#[test]
fn many_callbacks_across_chunks() {
    let mut tape = LinearTape::<f64>::with_chunk_sizes(8, 8, 2);
    tape.set_active();

    let mut x = Var::passive(1.1);
    tape.register_input(&mut x.index);

    let order = Rc::new(RefCell::new(Vec::new()));
    let mut t = x;
    for tag in 0..7 {
        let mut next = Var::passive(0.0);
        tape.store(&mut next.value, &mut next.index, &Mul(leaf(t), leaf(t)));
        t = next;
        let order_in_cb = Rc::clone(&order);
        tape.push_external_function_handle(move |_| order_in_cb.borrow_mut().push(tag));
    }

    tape.set_gradient(t.index, 1.0);
    tape.evaluate();
    assert_eq!(*order.borrow(), vec![6, 5, 4, 3, 2, 1, 0]);

    let p = 2f64.powi(7);
    assert_relative_eq!(
        tape.get_gradient(x.index),
        p * 1.1f64.powf(p - 1.0),
        max_relative = 1e-10
    );
}

/// Callback chunks resized mid-recording still replay in registration
/// order across the boundaries the new size creates.
#[test]
fn ext_chunk_size_change_keeps_order() {
    let mut tape = LinearTape::<f64>::with_chunk_sizes(16, 16, 2);
    tape.set_active();

    let mut x = Var::passive(1.5);
    tape.register_input(&mut x.index);

    let order = Rc::new(RefCell::new(Vec::new()));
    let push_tagged = |tape: &mut LinearTape<f64>, tag: i32| {
        let order_in_cb = Rc::clone(&order);
        tape.push_external_function_handle(move |_| order_in_cb.borrow_mut().push(tag));
    };

    push_tagged(&mut tape, 0);
    push_tagged(&mut tape, 1);
    tape.set_external_function_chunk_size(1);
    for tag in 2..5 {
        let mut t = Var::passive(0.0);
        tape.store(&mut t.value, &mut t.index, &Mul(leaf(x), leaf(x)));
        push_tagged(&mut tape, tag);
    }

    tape.evaluate();
    assert_eq!(*order.borrow(), vec![4, 3, 2, 1, 0]);
}
