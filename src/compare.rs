//! Abstract comparison algorithms: == (11.9.3), === (11.9.6) and the
//! relational comparison (11.8.5).

use crate::context::Context;
use crate::conversion::PreferredType;
use crate::value::{OpResult, Value};

impl Context {
    /// The Abstract Equality Comparison (ES5 11.9.3).
    pub fn abstract_equality(&mut self, x: Value, y: Value) -> OpResult<bool> {
        match (x, y) {
            // 1. Same types.
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => Ok(true),
            (Value::Number(a), Value::Number(b)) => Ok(a == b),
            (Value::Str(a), Value::Str(b)) => Ok(self.strings.eq(a, b)),
            (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
            (Value::Object(a), Value::Object(b)) => Ok(a == b),

            // 2. - 3. null and undefined are mutually equal.
            (Value::Undefined, Value::Null) | (Value::Null, Value::Undefined) => Ok(true),

            // 4. - 5. Number vs string: compare numerically.
            (Value::Number(a), Value::Str(s)) => {
                let b = crate::strings::string_to_number(self.strings.text(s));
                Ok(a == b)
            }
            (Value::Str(s), Value::Number(b)) => {
                let a = crate::strings::string_to_number(self.strings.text(s));
                Ok(a == b)
            }

            // 6. - 7. Booleans coerce to numbers and retry.
            (Value::Bool(a), other) => self.abstract_equality(Value::Number(a as u8 as f64), other),
            (other, Value::Bool(b)) => self.abstract_equality(other, Value::Number(b as u8 as f64)),

            // 8. - 9. Object vs number-or-string: ToPrimitive and retry.
            (Value::Object(_), Value::Number(_)) | (Value::Object(_), Value::Str(_)) => {
                let prim = self.to_primitive(x, PreferredType::None)?;
                let result = self.abstract_equality(prim, y);
                self.free_value(prim);
                result
            }
            (Value::Number(_), Value::Object(_)) | (Value::Str(_), Value::Object(_)) => {
                let prim = self.to_primitive(y, PreferredType::None)?;
                let result = self.abstract_equality(x, prim);
                self.free_value(prim);
                result
            }

            // 10.
            _ => Ok(false),
        }
    }

    /// The Strict Equality Comparison (ES5 11.9.6).
    pub fn strict_equality(&self, x: Value, y: Value) -> bool {
        match (x, y) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => self.strings.eq(a, b),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }

    /// The Abstract Relational Comparison (ES5 11.8.5). `Some(true)` means
    /// x < y, `None` is the undefined outcome (a NaN operand).
    pub fn abstract_relational(
        &mut self,
        x: Value,
        y: Value,
        left_first: bool,
    ) -> OpResult<Option<bool>> {
        // 1. - 2. ToPrimitive in evaluation order.
        let (px, py) = if left_first {
            let px = self.to_primitive(x, PreferredType::Number)?;
            let py = match self.to_primitive(y, PreferredType::Number) {
                Ok(py) => py,
                Err(abrupt) => {
                    self.free_value(px);
                    return Err(abrupt);
                }
            };
            (px, py)
        } else {
            let py = self.to_primitive(y, PreferredType::Number)?;
            let px = match self.to_primitive(x, PreferredType::Number) {
                Ok(px) => px,
                Err(abrupt) => {
                    self.free_value(py);
                    return Err(abrupt);
                }
            };
            (px, py)
        };

        // 3. Both strings: code unit comparison. 4. Otherwise numeric.
        let result = match (px, py) {
            (Value::Str(a), Value::Str(b)) => Ok(Some(self.strings.lt(a, b))),
            _ => {
                let a = self.to_number(px)?;
                let b = self.to_number(py)?;
                if a.is_nan() || b.is_nan() {
                    Ok(None)
                } else {
                    Ok(Some(a < b))
                }
            }
        };
        self.free_value(px);
        self.free_value(py);
        result
    }
}
