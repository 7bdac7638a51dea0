use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::LuaError;
use crate::value::{TableRef, Value};

/// Hashable form of a table key. Integral floats collapse onto the integer
/// key (`t[2.0]` is `t[2]`); reference values hash and compare by identity.
#[derive(Debug, Clone)]
pub enum TableKey {
    Int(i64),
    Str(String),
    Bool(bool),
    /// Bits of a finite, non-integral float.
    Float(u64),
    /// Table, function or userdata key, kept whole for iteration.
    Obj(Value),
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TableKey::Int(a), TableKey::Int(b)) => a == b,
            (TableKey::Str(a), TableKey::Str(b)) => a == b,
            (TableKey::Bool(a), TableKey::Bool(b)) => a == b,
            (TableKey::Float(a), TableKey::Float(b)) => a == b,
            (TableKey::Obj(a), TableKey::Obj(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for TableKey {}

impl Hash for TableKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            TableKey::Int(n) => {
                0u8.hash(state);
                n.hash(state);
            }
            TableKey::Str(s) => {
                1u8.hash(state);
                s.hash(state);
            }
            TableKey::Bool(b) => {
                2u8.hash(state);
                b.hash(state);
            }
            TableKey::Float(bits) => {
                3u8.hash(state);
                bits.hash(state);
            }
            TableKey::Obj(v) => {
                4u8.hash(state);
                let addr = match v {
                    Value::Table(t) => Arc::as_ptr(t) as usize,
                    Value::Closure(c) => Arc::as_ptr(c) as usize,
                    Value::Userdata(u) => Arc::as_ptr(u) as usize,
                    Value::Native(f) => *f as usize,
                    _ => 0,
                };
                addr.hash(state);
            }
        }
    }
}

impl TableKey {
    /// Converts a script value into a key. `Ok(None)` means the value can
    /// never be a key (`nil` or NaN); the caller decides whether that is a
    /// miss or an error.
    fn from_value(v: &Value) -> Option<TableKey> {
        match v {
            Value::Nil => None,
            Value::Boolean(b) => Some(TableKey::Bool(*b)),
            Value::Integer(n) => Some(TableKey::Int(*n)),
            Value::Float(f) => {
                if f.is_nan() {
                    None
                } else if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Some(TableKey::Int(*f as i64))
                } else {
                    Some(TableKey::Float(f.to_bits()))
                }
            }
            Value::Str(s) => Some(TableKey::Str(s.clone())),
            other => Some(TableKey::Obj(other.clone())),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            TableKey::Int(n) => Value::Integer(*n),
            TableKey::Str(s) => Value::Str(s.clone()),
            TableKey::Bool(b) => Value::Boolean(*b),
            TableKey::Float(bits) => Value::Float(f64::from_bits(*bits)),
            TableKey::Obj(v) => v.clone(),
        }
    }
}

/// A mapping from values to values with a dense integer prefix stored as an
/// array, plus an optional metatable. Storing `nil` removes the key.
#[derive(Debug, Default)]
pub struct Table {
    array: Vec<Value>,
    hash: HashMap<TableKey, Value>,
    pub metatable: Option<TableRef>,
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    /// Raw read: no metatable consultation.
    pub fn get(&self, key: &Value) -> Value {
        match TableKey::from_value(key) {
            Some(TableKey::Int(i)) if i >= 1 && (i as usize) <= self.array.len() => {
                self.array[i as usize - 1].clone()
            }
            Some(k) => self.hash.get(&k).cloned().unwrap_or(Value::Nil),
            None => Value::Nil,
        }
    }

    /// Raw write. Errors on `nil` or NaN keys.
    pub fn set(&mut self, key: Value, value: Value) -> Result<(), LuaError> {
        let k = match TableKey::from_value(&key) {
            Some(k) => k,
            None => {
                let what = if key.is_nil() { "nil" } else { "NaN" };
                return Err(LuaError::runtime(format!("table index is {what}")));
            }
        };

        if let TableKey::Int(i) = k {
            let len = self.array.len();
            if i >= 1 && (i as usize) <= len {
                let idx = i as usize - 1;
                if value.is_nil() && idx == len - 1 {
                    self.array.pop();
                    while matches!(self.array.last(), Some(Value::Nil)) {
                        self.array.pop();
                    }
                } else {
                    self.array[idx] = value;
                }
                return Ok(());
            }
            if i as usize == len + 1 && !value.is_nil() {
                self.array.push(value);
                self.migrate_from_hash();
                return Ok(());
            }
        }

        if value.is_nil() {
            self.hash.remove(&k);
        } else {
            self.hash.insert(k, value);
        }
        Ok(())
    }

    /// Pulls keys `len+1, len+2, …` out of the hash part after an append, so
    /// a sequence built out of order still lands in the array part.
    fn migrate_from_hash(&mut self) {
        loop {
            let next = TableKey::Int(self.array.len() as i64 + 1);
            match self.hash.remove(&next) {
                Some(v) => self.array.push(v),
                None => break,
            }
        }
    }

    /// Appends to the sequence part.
    pub fn push(&mut self, value: Value) {
        self.array.push(value);
        self.migrate_from_hash();
    }

    /// Border of the sequence part, the `#` operator's raw answer.
    pub fn len(&self) -> i64 {
        self.array.len() as i64
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.hash.is_empty()
    }

    /// Iteration step for `next`: the entry after `prev` in traversal order
    /// (array part first, then hash part). `prev = nil` starts traversal.
    pub fn next_entry(&self, prev: &Value) -> Result<Option<(Value, Value)>, LuaError> {
        let start_hash = |skip_to: Option<&TableKey>| -> Option<(Value, Value)> {
            let mut it = self.hash.iter();
            if let Some(target) = skip_to {
                for (k, _) in it.by_ref() {
                    if k == target {
                        break;
                    }
                }
            }
            it.next().map(|(k, v)| (k.to_value(), v.clone()))
        };

        if prev.is_nil() {
            for (i, v) in self.array.iter().enumerate() {
                if !v.is_nil() {
                    return Ok(Some((Value::Integer(i as i64 + 1), v.clone())));
                }
            }
            return Ok(start_hash(None));
        }

        let key = TableKey::from_value(prev)
            .ok_or_else(|| LuaError::runtime("invalid key to 'next'"))?;

        if let TableKey::Int(i) = key {
            if i >= 1 && (i as usize) <= self.array.len() {
                for (j, v) in self.array.iter().enumerate().skip(i as usize) {
                    if !v.is_nil() {
                        return Ok(Some((Value::Integer(j as i64 + 1), v.clone())));
                    }
                }
                return Ok(start_hash(None));
            }
        }

        if !self.hash.contains_key(&key) {
            return Err(LuaError::runtime("invalid key to 'next'"));
        }
        Ok(start_hash(Some(&key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(n: i64) -> Value {
        Value::Integer(n)
    }

    #[test]
    fn array_part_basics() {
        let mut t = Table::new();
        t.set(int(1), Value::string("a")).unwrap();
        t.set(int(2), Value::string("b")).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(&int(1)), Value::string("a"));
        assert_eq!(t.get(&int(3)), Value::Nil);
    }

    #[test]
    fn out_of_order_appends_migrate() {
        let mut t = Table::new();
        t.set(int(3), int(30)).unwrap();
        t.set(int(2), int(20)).unwrap();
        assert_eq!(t.len(), 0);
        t.set(int(1), int(10)).unwrap();
        assert_eq!(t.len(), 3);
        assert_eq!(t.get(&int(3)), int(30));
    }

    #[test]
    fn nil_set_deletes() {
        let mut t = Table::new();
        t.set(Value::string("k"), int(1)).unwrap();
        t.set(Value::string("k"), Value::Nil).unwrap();
        assert_eq!(t.get(&Value::string("k")), Value::Nil);
        assert!(t.is_empty());
    }

    #[test]
    fn trailing_nil_shrinks_border() {
        let mut t = Table::new();
        t.set(int(1), int(1)).unwrap();
        t.set(int(2), int(2)).unwrap();
        t.set(int(2), Value::Nil).unwrap();
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn integral_float_keys_collapse() {
        let mut t = Table::new();
        t.set(Value::Float(2.0), Value::string("x")).unwrap();
        assert_eq!(t.get(&int(2)), Value::string("x"));
    }

    #[test]
    fn nil_key_rejected() {
        let mut t = Table::new();
        assert!(t.set(Value::Nil, int(1)).is_err());
        assert!(t.set(Value::Float(f64::NAN), int(1)).is_err());
    }

    #[test]
    fn next_walks_every_entry() {
        let mut t = Table::new();
        t.set(int(1), int(10)).unwrap();
        t.set(int(2), int(20)).unwrap();
        t.set(Value::string("k"), int(30)).unwrap();

        let mut seen = 0;
        let mut key = Value::Nil;
        while let Some((k, _)) = t.next_entry(&key).unwrap() {
            seen += 1;
            key = k;
        }
        assert_eq!(seen, 3);
    }
}
