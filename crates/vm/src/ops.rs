//! Value operation helpers used by the dispatch loop: arithmetic over
//! numbers and vectors, ordering, concatenation, and the length operator's
//! value-level pieces.

use crate::error::{VmError, VmResult};
use crate::heap::Heap;
use crate::value::Value;

/// Binary arithmetic operator selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

fn arith_error(op: &str, a: &Value, b: &Value) -> VmError {
    let offender = if a.as_number().is_none() && !matches!(a, Value::Vector(_)) {
        a
    } else {
        b
    };
    VmError::runtime(format!(
        "attempt to perform arithmetic ({op}) on a {} value",
        offender.type_name()
    ))
}

/// Floored modulo, matching the script language's `%`.
fn floor_mod(a: f64, b: f64) -> f64 {
    a - (a / b).floor() * b
}

/// Applies a binary arithmetic operator. Numbers combine with numbers;
/// vectors combine componentwise with vectors, and scale by numbers for
/// multiplication and division.
pub fn arith(op: ArithOp, a: Value, b: Value) -> VmResult<Value> {
    match (op, a, b) {
        (ArithOp::Add, Value::Number(x), Value::Number(y)) => Ok(Value::Number(x + y)),
        (ArithOp::Sub, Value::Number(x), Value::Number(y)) => Ok(Value::Number(x - y)),
        (ArithOp::Mul, Value::Number(x), Value::Number(y)) => Ok(Value::Number(x * y)),
        (ArithOp::Div, Value::Number(x), Value::Number(y)) => Ok(Value::Number(x / y)),
        (ArithOp::Mod, Value::Number(x), Value::Number(y)) => Ok(Value::Number(floor_mod(x, y))),

        (ArithOp::Add, Value::Vector(x), Value::Vector(y)) => {
            Ok(Value::Vector([x[0] + y[0], x[1] + y[1], x[2] + y[2], x[3] + y[3]]))
        }
        (ArithOp::Sub, Value::Vector(x), Value::Vector(y)) => {
            Ok(Value::Vector([x[0] - y[0], x[1] - y[1], x[2] - y[2], x[3] - y[3]]))
        }
        (ArithOp::Mul, Value::Vector(x), Value::Number(s)) => {
            let s = s as f32;
            Ok(Value::Vector([x[0] * s, x[1] * s, x[2] * s, x[3] * s]))
        }
        (ArithOp::Mul, Value::Number(s), Value::Vector(x)) => {
            let s = s as f32;
            Ok(Value::Vector([s * x[0], s * x[1], s * x[2], s * x[3]]))
        }
        (ArithOp::Div, Value::Vector(x), Value::Number(s)) => {
            let s = s as f32;
            Ok(Value::Vector([x[0] / s, x[1] / s, x[2] / s, x[3] / s]))
        }
        (ArithOp::Mul, Value::Vector(x), Value::Vector(y)) => {
            Ok(Value::Vector([x[0] * y[0], x[1] * y[1], x[2] * y[2], x[3] * y[3]]))
        }

        (op, a, b) => Err(arith_error(
            match op {
                ArithOp::Add => "add",
                ArithOp::Sub => "sub",
                ArithOp::Mul => "mul",
                ArithOp::Div => "div",
                ArithOp::Mod => "mod",
            },
            &a,
            &b,
        )),
    }
}

/// Unary minus.
pub fn negate(a: Value) -> VmResult<Value> {
    match a {
        Value::Number(x) => Ok(Value::Number(-x)),
        Value::Vector(x) => Ok(Value::Vector([-x[0], -x[1], -x[2], -x[3]])),
        other => Err(VmError::runtime(format!(
            "attempt to perform arithmetic (unm) on a {} value",
            other.type_name()
        ))),
    }
}

/// Ordering comparison. Numbers order numerically, strings byte-wise.
pub fn less_than(heap: &Heap, a: Value, b: Value, or_equal: bool) -> VmResult<bool> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok(if or_equal { x <= y } else { x < y }),
        (Value::String(x), Value::String(y)) => {
            let x = heap.string_bytes(x);
            let y = heap.string_bytes(y);
            Ok(if or_equal { x <= y } else { x < y })
        }
        (a, b) => Err(VmError::runtime(format!(
            "attempt to compare {} with {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

/// Renders a number the way concatenation does.
pub fn number_to_display(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Concatenation: strings and numbers coerce; everything else errors.
pub fn concat(heap: &mut Heap, a: Value, b: Value) -> VmResult<Value> {
    let mut bytes = Vec::new();
    for v in [a, b] {
        match v {
            Value::String(s) => bytes.extend_from_slice(heap.string_bytes(s)),
            Value::Number(n) => bytes.extend_from_slice(number_to_display(n).as_bytes()),
            other => {
                return Err(VmError::runtime(format!(
                    "attempt to concatenate a {} value",
                    other.type_name()
                )))
            }
        }
    }
    Ok(Value::String(heap.intern(&bytes)?))
}

/// The length operator over strings, tables, and buffers.
pub fn length(heap: &Heap, v: Value) -> VmResult<Value> {
    match v {
        Value::String(s) => Ok(Value::Number(heap.string_bytes(s).len() as f64)),
        Value::Table(t) => Ok(Value::Number(heap.table(t).length() as f64)),
        Value::Buffer(b) => Ok(Value::Number(heap.buffer(b).len() as f64)),
        other => Err(VmError::runtime(format!(
            "attempt to get length of a {} value",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;

    #[test]
    fn test_number_arith() {
        assert_eq!(
            arith(ArithOp::Add, Value::Number(2.0), Value::Number(3.0)).unwrap(),
            Value::Number(5.0)
        );
        assert_eq!(
            arith(ArithOp::Mod, Value::Number(-1.0), Value::Number(3.0)).unwrap(),
            Value::Number(2.0)
        );
    }

    #[test]
    fn test_vector_arith() {
        let v = Value::Vector([1.0, 2.0, 3.0, 0.0]);
        let w = Value::Vector([4.0, 5.0, 6.0, 0.0]);
        assert_eq!(
            arith(ArithOp::Add, v, w).unwrap(),
            Value::Vector([5.0, 7.0, 9.0, 0.0])
        );
        assert_eq!(
            arith(ArithOp::Mul, v, Value::Number(2.0)).unwrap(),
            Value::Vector([2.0, 4.0, 6.0, 0.0])
        );
    }

    #[test]
    fn test_arith_type_errors_name_offender() {
        let err = arith(ArithOp::Add, Value::Number(1.0), Value::Boolean(true)).unwrap_err();
        assert!(err.to_string().contains("boolean"));
    }

    #[test]
    fn test_string_compare_and_concat() {
        let config = VmConfig::default();
        let mut heap = Heap::new(&config);
        let a = Value::String(heap.intern(b"abc").unwrap());
        let b = Value::String(heap.intern(b"abd").unwrap());
        assert!(less_than(&heap, a, b, false).unwrap());
        assert!(less_than(&heap, a, a, true).unwrap());

        let joined = concat(&mut heap, a, Value::Number(7.0)).unwrap();
        match joined {
            Value::String(s) => assert_eq!(heap.string_bytes(s), b"abc7"),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn test_number_display() {
        assert_eq!(number_to_display(3.0), "3");
        assert_eq!(number_to_display(3.5), "3.5");
    }
}
