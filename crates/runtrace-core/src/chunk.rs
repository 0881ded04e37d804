//! Chunk aggregation contract.
//!
//! Output types that can be streamed implement [`Combine`]: folding every
//! chunk of a run, in emission order, must produce the run's final output.

use serde_json::{Number, Value};

use crate::errors::CombineError;

/// Addition-like operation over partial outputs.
pub trait Combine: Clone {
    /// Appends `chunk` to `self`. On error `self` must be left unchanged.
    fn combine(&mut self, chunk: Self) -> Result<(), CombineError>;
}

impl Combine for String {
    fn combine(&mut self, chunk: Self) -> Result<(), CombineError> {
        self.push_str(&chunk);
        Ok(())
    }
}

impl<T: Clone> Combine for Vec<T> {
    fn combine(&mut self, chunk: Self) -> Result<(), CombineError> {
        self.extend(chunk);
        Ok(())
    }
}

impl Combine for i64 {
    fn combine(&mut self, chunk: Self) -> Result<(), CombineError> {
        let sum = self
            .checked_add(chunk)
            .ok_or_else(|| CombineError::new(self.to_string(), chunk.to_string()))?;
        *self = sum;
        Ok(())
    }
}

impl Combine for f64 {
    fn combine(&mut self, chunk: Self) -> Result<(), CombineError> {
        *self += chunk;
        Ok(())
    }
}

/// JSON chunks: strings concatenate, arrays extend, objects merge key-wise
/// (combining values present on both sides), numbers add. `null` is the
/// identity on either side.
///
/// The whole chunk is checked against the accumulated value before anything
/// is merged, so a rejected chunk leaves no partial merge behind.
impl Combine for Value {
    fn combine(&mut self, chunk: Self) -> Result<(), CombineError> {
        check_combinable(self, &chunk)?;
        merge_checked(self, chunk);
        Ok(())
    }
}

fn check_combinable(acc: &Value, chunk: &Value) -> Result<(), CombineError> {
    match (acc, chunk) {
        (_, Value::Null) | (Value::Null, _) => Ok(()),
        (Value::String(_), Value::String(_)) | (Value::Array(_), Value::Array(_)) => Ok(()),
        (Value::Object(acc), Value::Object(next)) => {
            next.iter().try_for_each(|(key, value)| match acc.get(key) {
                Some(existing) => check_combinable(existing, value),
                None => Ok(()),
            })
        }
        (Value::Number(a), Value::Number(b)) => add_numbers(a, b).map(drop),
        (acc, chunk) => Err(CombineError::new(
            json_type_name(acc),
            json_type_name(chunk),
        )),
    }
}

// Only called after `check_combinable` accepted the pair.
fn merge_checked(acc: &mut Value, chunk: Value) {
    if chunk.is_null() {
        return;
    }
    if acc.is_null() {
        *acc = chunk;
        return;
    }
    match (acc, chunk) {
        (Value::String(acc), Value::String(next)) => acc.push_str(&next),
        (Value::Array(acc), Value::Array(next)) => acc.extend(next),
        (Value::Object(acc), Value::Object(next)) => {
            for (key, value) in next {
                match acc.get_mut(&key) {
                    Some(existing) => merge_checked(existing, value),
                    None => {
                        acc.insert(key, value);
                    }
                }
            }
        }
        (Value::Number(acc), Value::Number(next)) => {
            if let Ok(sum) = add_numbers(acc, &next) {
                *acc = sum;
            }
        }
        _ => {}
    }
}

fn add_numbers(left: &Number, right: &Number) -> Result<Number, CombineError> {
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64())
        && let Some(sum) = a.checked_add(b)
    {
        return Ok(Number::from(sum));
    }
    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Err(CombineError::new(left.to_string(), right.to_string()));
    };
    Number::from_f64(a + b).ok_or_else(|| CombineError::new(left.to_string(), right.to_string()))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Running fold of a run's chunks.
#[derive(Clone, Debug)]
pub struct ChunkAccumulator<O> {
    value: Option<O>,
    count: u64,
}

impl<O> Default for ChunkAccumulator<O> {
    fn default() -> Self {
        Self {
            value: None,
            count: 0,
        }
    }
}

impl<O: Combine> ChunkAccumulator<O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one chunk into the accumulated value.
    ///
    /// On error the accumulated value is left as it was before the call.
    pub fn push(&mut self, chunk: O) -> Result<(), CombineError> {
        match &mut self.value {
            Some(acc) => acc.combine(chunk)?,
            None => self.value = Some(chunk),
        }
        self.count += 1;
        Ok(())
    }

    /// Number of chunks folded so far.
    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn value(&self) -> Option<&O> {
        self.value.as_ref()
    }

    pub fn take(&mut self) -> Option<O> {
        self.value.take()
    }
}
