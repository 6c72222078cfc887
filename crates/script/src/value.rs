//! The dynamically-typed value all script state is made of.

use crate::scriptable::ObjectId;

/// A script-land value. Assignment copies; arrays copy deeply.
///
/// `Object` holds a weak handle: the identifier of a game object which may
/// or may not still be alive. Resolution (and therefore "gone" detection)
/// happens at the point of use, never here.
#[derive(Debug, Clone, Default)]
pub enum Value {
	#[default]
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	String(String),
	Object(ObjectId),
	Array(Vec<Value>),
}

/// Numeric view used by the arithmetic and comparison coercions.
#[derive(Debug, Clone, Copy)]
enum Number {
	Int(i64),
	Float(f64),
}

impl Number {
	#[must_use]
	fn as_f64(self) -> f64 {
		match self {
			Self::Int(i) => i as f64,
			Self::Float(f) => f,
		}
	}
}

impl Value {
	#[must_use]
	pub fn type_name(&self) -> &'static str {
		match self {
			Self::Null => "null",
			Self::Bool(_) => "bool",
			Self::Int(_) => "int",
			Self::Float(_) => "float",
			Self::String(_) => "string",
			Self::Object(_) => "object",
			Self::Array(_) => "array",
		}
	}

	/// `null`, `0`, `0.0`, and `""` are false; everything else is true.
	#[must_use]
	pub fn truthy(&self) -> bool {
		match self {
			Self::Null => false,
			Self::Bool(b) => *b,
			Self::Int(i) => *i != 0,
			Self::Float(f) => *f != 0.0,
			Self::String(s) => !s.is_empty(),
			Self::Object(_) => true,
			Self::Array(_) => true,
		}
	}

	#[must_use]
	pub fn is_null(&self) -> bool {
		matches!(self, Self::Null)
	}

	#[must_use]
	pub fn as_object(&self) -> Option<ObjectId> {
		match self {
			Self::Object(id) => Some(*id),
			_ => None,
		}
	}

	#[must_use]
	fn as_number(&self) -> Number {
		match self {
			Self::Null => Number::Int(0),
			Self::Bool(b) => Number::Int(i64::from(*b)),
			Self::Int(i) => Number::Int(*i),
			Self::Float(f) => Number::Float(*f),
			Self::String(s) => {
				let t = s.trim();

				if let Ok(i) = t.parse::<i64>() {
					Number::Int(i)
				} else if let Ok(f) = t.parse::<f64>() {
					Number::Float(f)
				} else {
					Number::Int(0)
				}
			}
			// Object identity has no numeric interpretation; it coerces
			// like a non-numeric string.
			Self::Object(_) => Number::Int(0),
			Self::Array(a) => Number::Int(a.len() as i64),
		}
	}

	#[must_use]
	pub fn as_int(&self) -> i64 {
		match self.as_number() {
			Number::Int(i) => i,
			Number::Float(f) => f as i64,
		}
	}

	#[must_use]
	pub fn as_float(&self) -> f64 {
		self.as_number().as_f64()
	}

	/// The string form used by concatenation and by `ToString`-flavored
	/// host methods.
	#[must_use]
	pub fn to_display(&self) -> String {
		match self {
			Self::Null => "null".to_string(),
			Self::Bool(b) => if *b { "yes" } else { "no" }.to_string(),
			Self::Int(i) => i.to_string(),
			Self::Float(f) => f.to_string(),
			Self::String(s) => s.clone(),
			Self::Object(id) => format!("[object #{}]", id.get()),
			Self::Array(a) => {
				let parts: Vec<_> = a.iter().map(Self::to_display).collect();
				parts.join(",")
			}
		}
	}

	/// `+`: concatenation if either side is a string, numeric otherwise.
	#[must_use]
	pub fn add(&self, rhs: &Self) -> Self {
		if matches!(self, Self::String(_)) || matches!(rhs, Self::String(_)) {
			let mut s = self.to_display();
			s.push_str(&rhs.to_display());
			return Self::String(s);
		}

		match (self.as_number(), rhs.as_number()) {
			(Number::Int(a), Number::Int(b)) => Self::Int(a.wrapping_add(b)),
			(a, b) => Self::Float(a.as_f64() + b.as_f64()),
		}
	}

	#[must_use]
	pub fn sub(&self, rhs: &Self) -> Self {
		match (self.as_number(), rhs.as_number()) {
			(Number::Int(a), Number::Int(b)) => Self::Int(a.wrapping_sub(b)),
			(a, b) => Self::Float(a.as_f64() - b.as_f64()),
		}
	}

	#[must_use]
	pub fn mul(&self, rhs: &Self) -> Self {
		match (self.as_number(), rhs.as_number()) {
			(Number::Int(a), Number::Int(b)) => Self::Int(a.wrapping_mul(b)),
			(a, b) => Self::Float(a.as_f64() * b.as_f64()),
		}
	}

	/// Division by zero folds to 0 with a logged warning rather than
	/// terminating the script.
	#[must_use]
	pub fn div(&self, rhs: &Self) -> Self {
		match (self.as_number(), rhs.as_number()) {
			(Number::Int(a), Number::Int(b)) => {
				if b == 0 {
					log::warn!("Script divided {a} by zero; folding to 0.");
					Self::Int(0)
				} else {
					Self::Int(a.wrapping_div(b))
				}
			}
			(a, b) => {
				let b = b.as_f64();

				if b == 0.0 {
					log::warn!("Script divided {} by zero; folding to 0.", a.as_f64());
					Self::Float(0.0)
				} else {
					Self::Float(a.as_f64() / b)
				}
			}
		}
	}

	/// `%` is integer-only; a zero divisor folds to 0 with a warning.
	#[must_use]
	pub fn rem(&self, rhs: &Self) -> Self {
		let a = self.as_int();
		let b = rhs.as_int();

		if b == 0 {
			log::warn!("Script took {a} modulo zero; folding to 0.");
			Self::Int(0)
		} else {
			Self::Int(a.wrapping_rem(b))
		}
	}

	#[must_use]
	pub fn neg(&self) -> Self {
		match self.as_number() {
			Number::Int(i) => Self::Int(i.wrapping_neg()),
			Number::Float(f) => Self::Float(-f),
		}
	}

	/// Coercing equality. Two object references compare by identity; a
	/// string pair compares lexically; everything else compares
	/// numerically, with `null` equal only to `null`.
	///
	/// Callers that can resolve object liveness should map gone references
	/// to `Null` *before* comparing, so that a dead handle equals `null`.
	#[must_use]
	pub fn loose_eq(&self, rhs: &Self) -> bool {
		match (self, rhs) {
			(Self::Object(a), Self::Object(b)) => a == b,
			(Self::Object(_), _) | (_, Self::Object(_)) => false,
			(Self::Null, Self::Null) => true,
			(Self::Null, _) | (_, Self::Null) => false,
			(Self::String(a), Self::String(b)) => a == b,
			(Self::Array(a), Self::Array(b)) => {
				a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
			}
			_ => {
				let (a, b) = (self.as_number(), rhs.as_number());

				match (a, b) {
					(Number::Int(x), Number::Int(y)) => x == y,
					_ => a.as_f64() == b.as_f64(),
				}
			}
		}
	}

	/// Identity equality; defined only when both operands are object
	/// references. Everything else is strictly unequal.
	#[must_use]
	pub fn strict_eq(&self, rhs: &Self) -> bool {
		matches!((self, rhs), (Self::Object(a), Self::Object(b)) if a == b)
	}

	/// Coercing order for `<`, `<=`, `>`, `>=`.
	/// `null` sorts below everything except another `null`.
	#[must_use]
	pub fn loose_cmp(&self, rhs: &Self) -> std::cmp::Ordering {
		use std::cmp::Ordering;

		match (self, rhs) {
			(Self::Null, Self::Null) => Ordering::Equal,
			(Self::Null, _) => Ordering::Less,
			(_, Self::Null) => Ordering::Greater,
			(Self::String(a), Self::String(b)) => a.cmp(b),
			_ => {
				let a = self.as_float();
				let b = rhs.as_float();
				a.partial_cmp(&b).unwrap_or(Ordering::Equal)
			}
		}
	}

	/// Reads `array[index]`. Out-of-range and non-array reads yield `null`.
	#[must_use]
	pub fn index(&self, index: &Self) -> Self {
		match self {
			Self::Array(items) => {
				let i = index.as_int();

				if i < 0 {
					return Self::Null;
				}

				items.get(i as usize).cloned().unwrap_or(Self::Null)
			}
			_ => Self::Null,
		}
	}

	/// Writes `array[index] = value`, growing the array with `null`s as
	/// needed. Returns `false` if the receiver is not an array or the
	/// index is negative.
	pub fn set_index(&mut self, index: &Self, value: Self) -> bool {
		let Self::Array(items) = self else {
			return false;
		};

		let i = index.as_int();

		if i < 0 {
			return false;
		}

		let i = i as usize;

		if i >= items.len() {
			items.resize(i + 1, Self::Null);
		}

		items[i] = value;
		true
	}
}

impl From<bool> for Value {
	fn from(value: bool) -> Self {
		Self::Bool(value)
	}
}

impl From<i64> for Value {
	fn from(value: i64) -> Self {
		Self::Int(value)
	}
}

impl From<f64> for Value {
	fn from(value: f64) -> Self {
		Self::Float(value)
	}
}

impl From<&str> for Value {
	fn from(value: &str) -> Self {
		Self::String(value.to_string())
	}
}

impl From<String> for Value {
	fn from(value: String) -> Self {
		Self::String(value)
	}
}

impl From<ObjectId> for Value {
	fn from(value: ObjectId) -> Self {
		Self::Object(value)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn arithmetic_coercion() {
		assert!(matches!(Value::Int(2).add(&Value::Int(3)), Value::Int(5)));

		let v = Value::Int(2).add(&Value::Float(0.5));
		assert!(matches!(v, Value::Float(f) if f == 2.5));

		let v = Value::from("width=").add(&Value::Int(640));
		assert!(matches!(v, Value::String(s) if s == "width=640"));

		let v = Value::Int(10).add(&Value::from("px"));
		assert!(matches!(v, Value::String(s) if s == "10px"));

		assert!(matches!(Value::Int(7).rem(&Value::Int(3)), Value::Int(1)));
	}

	#[test]
	fn division_by_zero_folds() {
		assert!(matches!(Value::Int(9).div(&Value::Int(0)), Value::Int(0)));
		assert!(matches!(Value::Int(9).rem(&Value::Int(0)), Value::Int(0)));

		let v = Value::Float(9.0).div(&Value::Float(0.0));
		assert!(matches!(v, Value::Float(f) if f == 0.0));
	}

	#[test]
	fn equality() {
		assert!(Value::Int(1).loose_eq(&Value::Float(1.0)));
		assert!(Value::Bool(true).loose_eq(&Value::Int(1)));
		assert!(Value::Null.loose_eq(&Value::Null));
		assert!(!Value::Null.loose_eq(&Value::Int(0)));
		assert!(Value::from("abc").loose_eq(&Value::from("abc")));

		let a = Value::Object(ObjectId::new(7));
		let b = Value::Object(ObjectId::new(7));
		let c = Value::Object(ObjectId::new(8));
		assert!(a.strict_eq(&b));
		assert!(!a.strict_eq(&c));
		assert!(!a.strict_eq(&Value::Int(7)));
		assert!(a.loose_eq(&b));
		assert!(!a.loose_eq(&c));
	}

	#[test]
	fn ordering() {
		use std::cmp::Ordering;

		assert_eq!(Value::Null.loose_cmp(&Value::Int(-5)), Ordering::Less);
		assert_eq!(Value::Null.loose_cmp(&Value::Null), Ordering::Equal);
		assert_eq!(Value::Int(2).loose_cmp(&Value::Float(1.5)), Ordering::Greater);
		assert_eq!(
			Value::from("apple").loose_cmp(&Value::from("banana")),
			Ordering::Less
		);
	}

	#[test]
	fn truthiness() {
		assert!(!Value::Null.truthy());
		assert!(!Value::Int(0).truthy());
		assert!(!Value::Float(0.0).truthy());
		assert!(!Value::from("").truthy());
		assert!(Value::from("0").truthy());
		assert!(Value::from(" ").truthy());
		assert!(Value::Array(vec![]).truthy());
	}

	#[test]
	fn array_indexing() {
		let mut arr = Value::Array(vec![Value::Int(1)]);
		assert!(arr.set_index(&Value::Int(3), Value::from("x")));

		let Value::Array(items) = &arr else {
			unreachable!()
		};

		assert_eq!(items.len(), 4);
		assert!(items[1].is_null());
		assert!(arr.index(&Value::Int(3)).loose_eq(&Value::from("x")));
		assert!(arr.index(&Value::Int(99)).is_null());
		assert!(arr.index(&Value::Int(-1)).is_null());
	}
}
