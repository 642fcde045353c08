//! JSON merge patch (RFC 7396) application.

use serde_json::{Map, Value};

/// Apply `patch` to `target` in place.
///
/// Objects merge member by member, `null` members are removed, and any
/// non-object patch replaces the target.
pub fn apply(target: &mut Value, patch: &Value) {
  let Value::Object(patch_members) = patch else {
    *target = patch.clone();
    return;
  };

  if !target.is_object() {
    *target = Value::Object(Map::new());
  }

  if let Value::Object(members) = target {
    for (name, value) in patch_members {
      if value.is_null() {
        members.remove(name);
      } else {
        apply(members.entry(name.clone()).or_insert(Value::Null), value);
      }
    }
  }
}

/// Apply `patch` to a copy of `target`.
pub fn applied(target: &Value, patch: &Value) -> Value {
  let mut out = target.clone();
  apply(&mut out, patch);
  out
}
