//! Rendering of decoded regions into serialized test-input artifacts.

use serde_json::{json, Value};

use crate::abs::ConcreteVal;
use crate::solver::model::{ConcreteKey, DecodedRegion, EvalError};

/// All known entries of a decoded region as a JSON array, for embedding in
/// generated test cases and reports.
pub fn render_region_entries(region: &DecodedRegion) -> Result<Value, EvalError> {
    let mut entries = region.snapshot_known_entries()?;
    entries.sort_by_key(|(key, _)| match key {
        ConcreteKey::Ref(addr) => (*addr, None),
        ConcreteKey::Indexed { addr, index } => (*addr, Some(value_to_json(index).to_string())),
    });
    Ok(Value::Array(
        entries
            .into_iter()
            .map(|(key, value)| {
                json!({
                    "key": key_to_json(&key),
                    "value": value_to_json(&value),
                })
            })
            .collect(),
    ))
}

fn key_to_json(key: &ConcreteKey) -> Value {
    match key {
        ConcreteKey::Ref(addr) => json!({ "object": format!("0x{:x}", addr) }),
        ConcreteKey::Indexed { addr, index } => json!({
            "object": format!("0x{:x}", addr),
            "index": value_to_json(index),
        }),
    }
}

fn value_to_json(value: &ConcreteVal) -> Value {
    match value {
        ConcreteVal::Bool(b) => json!(b),
        ConcreteVal::BitVec { bits, .. } => json!(bits),
        ConcreteVal::Addr(addr) => json!(format!("0x{:x}", addr)),
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::abs::{RegionId, Sort};
    use crate::config::EngineConfig;
    use crate::expr::ExprContext;
    use crate::mem::{Key, MemoryState};
    use crate::solver::model::{decode_region, Model};

    #[test]
    fn renders_decoded_entries() {
        let s = MemoryState::new(Rc::new(ExprContext::new()), EngineConfig::default());
        let id = RegionId::map_length(1);
        let addr = s.ctx().fresh_address();
        let key = Key::Ref(s.ctx().mk_concrete_ref(addr));
        let s = s
            .write(&id, &key, s.ctx().mk_size(5), s.ctx().mk_true())
            .unwrap();

        let decoded = decode_region(&s, &id, Rc::new(Model::new())).unwrap();
        let rendered = render_region_entries(&decoded).unwrap();

        let rows = rendered.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["key"]["object"], format!("0x{:x}", addr));
        assert_eq!(rows[0]["value"], 5);
    }
}
