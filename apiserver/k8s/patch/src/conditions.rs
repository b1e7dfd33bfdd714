use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

const LAST_TRANSITION_TIME: &str = "lastTransitionTime";

/// Maintains `lastTransitionTime` on the condition list at `path` after a patch.
///
/// A condition keeps its previous transition time as long as its `status` is unchanged, whatever
/// time the patch supplied. A condition whose `status` changed transitions at `now`. A new
/// condition keeps the time it was given, or transitions at `now` if it has none.
pub(crate) fn reconcile(original: &Value, patched: &mut Value, path: &str, now: DateTime<Utc>) {
    let pointer = to_pointer(path);
    let conditions = match patched.pointer_mut(&pointer) {
        Some(Value::Array(conditions)) => conditions,
        _ => return,
    };
    let previous = original
        .pointer(&pointer)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let now = Value::String(now.to_rfc3339_opts(SecondsFormat::Secs, true));

    for condition in conditions.iter_mut().filter_map(Value::as_object_mut) {
        let prior = condition.get("type").and_then(|type_| {
            previous
                .iter()
                .find(|prev| prev.get("type") == Some(type_))
        });

        let time = match prior {
            Some(prior) if prior.get("status") == condition.get("status") => {
                match prior.get(LAST_TRANSITION_TIME) {
                    Some(time) if !time.is_null() => time.clone(),
                    _ => continue,
                }
            }
            Some(_) => now.clone(),
            None => match condition.get(LAST_TRANSITION_TIME) {
                Some(time) if !time.is_null() => continue,
                _ => now.clone(),
            },
        };
        condition.insert(LAST_TRANSITION_TIME.to_string(), time);
    }
}

fn to_pointer(path: &str) -> String {
    path.split('.').fold(String::new(), |mut pointer, segment| {
        pointer.push('/');
        pointer.push_str(segment);
        pointer
    })
}
